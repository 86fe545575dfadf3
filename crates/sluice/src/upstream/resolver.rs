use async_trait::async_trait;
use url::Url;

use crate::error::Result;

/// External collaborator that knows where an episode's manifest lives.
///
/// Manifest URLs handed out by scrapers are usually signed and short-lived. When the origin starts
/// answering 403/404/410 the downloader asks for a fresh one through [`refresh`](Self::refresh).
#[async_trait]
pub trait StreamResolver: Send + Sync {
    async fn resolve(&self, episode: &str) -> Result<Url>;

    async fn refresh(&self, episode: &str, expired: &Url) -> Result<Url>;
}
