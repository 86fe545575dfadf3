//! Outbound fetching.
//!
//! Everything that talks to an origin goes through the [`Upstream`] trait so the relay and the
//! downloader can be driven against in-process fakes in tests.

mod http;
mod resolver;

pub use http::{HttpUpstream, browser_headers};
pub use resolver::StreamResolver;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use url::Url;

use crate::classify::{MediaKind, classify_content_type};
use crate::error::Result;

/// Byte-level progress callback: `(downloaded, total)`.
pub type ByteProgress<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    /// Raw `Range` header value forwarded from the client
    pub range: Option<String>,
}

impl FetchRequest {
    pub fn new(url: Url) -> Self {
        Self { url, range: None }
    }

    pub fn with_range(mut self, range: Option<String>) -> Self {
        self.range = range;
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub payload: Bytes,
    /// Classification of the requested URL, never the upstream `Content-Type`
    pub kind: MediaKind,
    /// 200 or 206
    pub status: StatusCode,
    /// Upstream `Content-Range` on partial responses
    pub content_range: Option<String>,
}

impl FetchedObject {
    pub fn new(url: &Url, payload: Bytes) -> Self {
        Self {
            payload,
            kind: classify_content_type(url.as_str()),
            status: StatusCode::OK,
            content_range: None,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.status == StatusCode::PARTIAL_CONTENT
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Fetch one object. Non-2xx answers are errors.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchedObject>;

    /// Fetch while reporting body progress. The default reports once on completion.
    async fn fetch_with_progress(
        &self,
        request: FetchRequest,
        progress: ByteProgress<'_>,
    ) -> Result<FetchedObject> {
        let object = self.fetch(request).await?;
        let len = object.payload.len() as u64;
        progress(len, Some(len));
        Ok(object)
    }
}
