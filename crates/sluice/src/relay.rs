//! The relay core behind `GET /stream`.
//!
//! [`Relay::handle`] takes the raw `url` query value and optional `Range` header and produces a
//! complete response description. The HTTP layer only has to copy it onto the wire.

use std::sync::Arc;

use bytes::Bytes;
use reqwest::StatusCode;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheStats, CachedObject, Coalescer, ObjectCache};
use crate::classify::{MediaKind, is_manifest_url};
use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::manifest::{looks_like_playlist, parse_target, preferred_candidate, rewrite_manifest};
use crate::range::serve_range;
use crate::upstream::{FetchRequest, HttpUpstream, Upstream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Bypass => "BYPASS",
        }
    }
}

/// Everything needed to answer one relay request.
#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Bytes,
    pub content_range: Option<String>,
    pub content_length: u64,
    pub cache: CacheStatus,
}

pub struct Relay {
    upstream: Arc<dyn Upstream>,
    coalescer: Coalescer,
    config: RelayConfig,
}

impl Relay {
    pub fn new(upstream: Arc<dyn Upstream>, config: RelayConfig) -> Self {
        let cache = ObjectCache::new(&config.cache);
        Self {
            upstream,
            coalescer: Coalescer::new(cache),
            config,
        }
    }

    /// Relay over a real HTTP client built from `config.upstream`.
    pub fn with_http(config: RelayConfig) -> Result<Self> {
        let upstream = HttpUpstream::new(config.upstream.clone())?;
        Ok(Self::new(Arc::new(upstream), config))
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn upstream(&self) -> Arc<dyn Upstream> {
        self.upstream.clone()
    }

    pub fn cache(&self) -> &ObjectCache {
        self.coalescer.cache()
    }

    pub fn stats(&self) -> CacheStats {
        self.coalescer.stats()
    }

    /// Start the background sweeper. Does nothing when caching is disabled.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.cache.enabled {
            return None;
        }
        Some(self.cache().spawn_sweeper(self.config.cache.sweep_interval, cancel))
    }

    pub async fn handle(&self, raw_url: &str, range: Option<&str>) -> Result<RelayResponse> {
        let target = parse_target(raw_url)?;

        if is_manifest_url(target.as_str()) {
            self.serve_manifest(&target).await
        } else {
            self.serve_object(&target, range).await
        }
    }

    async fn serve_manifest(&self, target: &Url) -> Result<RelayResponse> {
        let (object, cache) = if self.config.cache.enabled {
            self.cached_or_coalesced(target.as_str(), || self.load_manifest(target))
                .await?
        } else {
            (self.load_manifest(target).await?, CacheStatus::Bypass)
        };

        Ok(RelayResponse {
            status: StatusCode::OK,
            content_type: MediaKind::Playlist.content_type(),
            content_length: object.payload.len() as u64,
            body: object.payload,
            content_range: None,
            cache,
        })
    }

    async fn serve_object(&self, target: &Url, range: Option<&str>) -> Result<RelayResponse> {
        if !self.config.cache.enabled {
            // Let the origin answer the range itself.
            let fetched = self
                .upstream
                .fetch(FetchRequest::new(target.clone()).with_range(range.map(str::to_string)))
                .await?;
            return Ok(RelayResponse {
                status: fetched.status,
                content_type: fetched.kind.content_type(),
                content_length: fetched.payload.len() as u64,
                content_range: fetched.content_range,
                body: fetched.payload,
                cache: CacheStatus::Bypass,
            });
        }

        let (object, cache) = self
            .cached_or_coalesced(target.as_str(), || self.load_object(target))
            .await?;
        let sliced = serve_range(&object.payload, range);

        Ok(RelayResponse {
            status: sliced.status,
            content_type: object.content_type(),
            body: sliced.body,
            content_range: sliced.content_range,
            content_length: sliced.content_length,
            cache,
        })
    }

    async fn cached_or_coalesced<F, Fut>(
        &self,
        key: &str,
        produce: F,
    ) -> Result<(CachedObject, CacheStatus)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedObject>>,
    {
        if let Some(hit) = self.cache().get(key) {
            debug!(key, "Cache hit");
            return Ok((hit, CacheStatus::Hit));
        }
        let object = self.coalescer.with_coalescing(key, produce).await?;
        Ok((object, CacheStatus::Miss))
    }

    async fn load_object(&self, target: &Url) -> Result<CachedObject> {
        let fetched = self.upstream.fetch(FetchRequest::new(target.clone())).await?;
        Ok(CachedObject::new(fetched.payload, fetched.kind))
    }

    async fn load_manifest(&self, target: &Url) -> Result<CachedObject> {
        let (text, base) = match self.probe_preferred(target).await {
            Some(found) => found,
            None => {
                let fetched = self.upstream.fetch(FetchRequest::new(target.clone())).await?;
                (decode_playlist(target, &fetched.payload)?, target.clone())
            }
        };

        let doc = rewrite_manifest(&text, &base, &self.config.manifest.public_base)?;
        Ok(CachedObject::new(Bytes::from(doc.render()), MediaKind::Playlist))
    }

    /// Fetch the preferred sibling of a decoy manifest. `None` means "use the original".
    async fn probe_preferred(&self, target: &Url) -> Option<(String, Url)> {
        let candidate = preferred_candidate(target, &self.config.manifest)?;

        match self.upstream.fetch(FetchRequest::new(candidate.clone())).await {
            Ok(fetched) if looks_like_playlist(&fetched.payload) => {
                match decode_playlist(&candidate, &fetched.payload) {
                    Ok(text) => {
                        info!(
                            decoy = %target,
                            preferred = %candidate,
                            "Serving preferred manifest"
                        );
                        Some((text, candidate))
                    }
                    Err(_) => None,
                }
            }
            Ok(_) => {
                debug!(url = %candidate, "Preferred manifest probe returned a non-playlist");
                None
            }
            Err(e) => {
                debug!(url = %candidate, error = %e, "Preferred manifest probe failed");
                None
            }
        }
    }
}

fn decode_playlist(url: &Url, payload: &[u8]) -> Result<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|e| Error::playlist(format!("{url} is not valid UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::upstream::FetchedObject;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Serves canned bodies and records every request.
    #[derive(Default)]
    struct FakeOrigin {
        bodies: HashMap<String, &'static [u8]>,
        requests: Mutex<Vec<(String, Option<String>)>>,
        delay: Option<Duration>,
    }

    impl FakeOrigin {
        fn with(mut self, url: &str, body: &'static [u8]) -> Self {
            self.bodies.insert(url.to_string(), body);
            self
        }

        fn hits(&self, url: &str) -> usize {
            self.requests.lock().iter().filter(|(u, _)| u == url).count()
        }
    }

    #[async_trait]
    impl Upstream for FakeOrigin {
        async fn fetch(&self, request: FetchRequest) -> Result<FetchedObject> {
            self.requests
                .lock()
                .push((request.url.to_string(), request.range.clone()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.bodies.get(request.url.as_str()) {
                Some(body) => {
                    let mut object = FetchedObject::new(&request.url, Bytes::from_static(body));
                    if request.range.is_some() {
                        object.status = StatusCode::PARTIAL_CONTENT;
                        object.content_range = Some("bytes 0-1/10".to_string());
                        object.payload = object.payload.slice(0..2);
                    }
                    Ok(object)
                }
                None => Err(Error::rejected(request.url.as_str(), StatusCode::NOT_FOUND)),
            }
        }
    }

    const MEDIA: &[u8] =
        b"#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4,\nseg-1-v1-a1.jpg\n#EXT-X-ENDLIST\n";
    const MASTER: &[u8] = b"#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\n720/index.m3u8\n";

    fn relay(origin: FakeOrigin, config: RelayConfig) -> (Relay, Arc<FakeOrigin>) {
        let origin = Arc::new(origin);
        (Relay::new(origin.clone(), config), origin)
    }

    fn encoded(url: &str) -> String {
        urlencoding::encode(url).into_owned()
    }

    #[tokio::test]
    async fn manifests_are_rewritten_and_cached() {
        let (relay, origin) = relay(
            FakeOrigin::default().with("https://cdn.example/ep/720p.m3u8", MEDIA),
            RelayConfig::default(),
        );

        let first = relay
            .handle("https://cdn.example/ep/720p.m3u8", None)
            .await
            .unwrap();
        assert_eq!(first.status, StatusCode::OK);
        assert_eq!(first.content_type, "application/vnd.apple.mpegurl");
        assert_eq!(first.cache, CacheStatus::Miss);
        let text = String::from_utf8(first.body.to_vec()).unwrap();
        assert!(text.contains(&format!(
            "/stream?url={}",
            encoded("https://cdn.example/ep/seg-1-v1-a1.jpg")
        )));

        let second = relay
            .handle("https://cdn.example/ep/720p.m3u8", None)
            .await
            .unwrap();
        assert_eq!(second.cache, CacheStatus::Hit);
        assert_eq!(second.body, first.body);
        assert_eq!(origin.hits("https://cdn.example/ep/720p.m3u8"), 1);
    }

    #[tokio::test]
    async fn decoy_manifest_prefers_master_sibling() {
        let (relay, origin) = relay(
            FakeOrigin::default()
                .with("https://cdn.example/ep/index.m3u8", MEDIA)
                .with("https://cdn.example/ep/master.m3u8", MASTER),
            RelayConfig::default(),
        );

        let resp = relay
            .handle("https://cdn.example/ep/index.m3u8", None)
            .await
            .unwrap();
        let text = String::from_utf8(resp.body.to_vec()).unwrap();
        assert!(text.contains("#EXT-X-STREAM-INF"));
        assert!(text.contains(&encoded("https://cdn.example/ep/720/index.m3u8")));
        assert_eq!(origin.hits("https://cdn.example/ep/index.m3u8"), 0);
    }

    #[tokio::test]
    async fn failed_probe_falls_back_to_the_requested_manifest() {
        let (relay, origin) = relay(
            FakeOrigin::default()
                .with("https://cdn.example/ep/index.m3u8", MEDIA)
                .with("https://cdn.example/ep/master.m3u8", b"<html>nope</html>"),
            RelayConfig::default(),
        );

        let resp = relay
            .handle("https://cdn.example/ep/index.m3u8", None)
            .await
            .unwrap();
        let text = String::from_utf8(resp.body.to_vec()).unwrap();
        assert!(text.contains(&encoded("https://cdn.example/ep/seg-1-v1-a1.jpg")));
        assert_eq!(origin.hits("https://cdn.example/ep/master.m3u8"), 1);
        assert_eq!(origin.hits("https://cdn.example/ep/index.m3u8"), 1);
    }

    #[tokio::test]
    async fn disguised_segments_are_served_as_transport_stream_with_ranges() {
        let (relay, _) = relay(
            FakeOrigin::default().with("https://cdn.example/ep/seg-1-v1-a1.jpg", b"0123456789"),
            RelayConfig::default(),
        );

        let resp = relay
            .handle("https://cdn.example/ep/seg-1-v1-a1.jpg", Some("bytes=2-4"))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.content_type, "video/mp2t");
        assert_eq!(resp.body, Bytes::from_static(b"234"));
        assert_eq!(resp.content_range.as_deref(), Some("bytes 2-4/10"));

        // Served from cache with the same range semantics
        let cached = relay
            .handle("https://cdn.example/ep/seg-1-v1-a1.jpg", Some("bytes=2-4"))
            .await
            .unwrap();
        assert_eq!(cached.cache, CacheStatus::Hit);
        assert_eq!(cached.body, resp.body);
        assert_eq!(cached.content_range, resp.content_range);
    }

    #[tokio::test]
    async fn concurrent_segment_requests_hit_origin_once() {
        let origin = FakeOrigin {
            delay: Some(Duration::from_millis(50)),
            ..FakeOrigin::default().with("https://cdn.example/ep/seg-2.ts", b"payload")
        };
        let (relay, origin) = relay(origin, RelayConfig::default());
        let relay = Arc::new(relay);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let relay = relay.clone();
                tokio::spawn(
                    async move { relay.handle("https://cdn.example/ep/seg-2.ts", None).await },
                )
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().body, Bytes::from_static(b"payload"));
        }
        assert_eq!(origin.hits("https://cdn.example/ep/seg-2.ts"), 1);
        assert_eq!(relay.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn abandoned_request_does_not_fail_its_waiters() {
        let origin = FakeOrigin {
            delay: Some(Duration::from_millis(300)),
            ..FakeOrigin::default().with("https://cdn.example/ep/seg-4.ts", b"payload")
        };
        let (relay, origin) = relay(origin, RelayConfig::default());
        let relay = Arc::new(relay);

        let spawn_request = |relay: Arc<Relay>| {
            tokio::spawn(
                async move { relay.handle("https://cdn.example/ep/seg-4.ts", None).await },
            )
        };
        // A player that seeks away mid-fetch
        let first = spawn_request(relay.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = spawn_request(relay.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        first.abort();

        let resp = second.await.unwrap().unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, Bytes::from_static(b"payload"));
        assert_eq!(origin.hits("https://cdn.example/ep/seg-4.ts"), 2);
        assert_eq!(relay.stats().in_flight, 0);
        assert_eq!(relay.cache().len(), 1);
    }

    #[tokio::test]
    async fn disabled_cache_forwards_range_upstream() {
        let config = RelayConfig {
            cache: CacheConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let (relay, origin) = relay(
            FakeOrigin::default().with("https://cdn.example/ep/seg-3.ts", b"0123456789"),
            config,
        );

        let resp = relay
            .handle("https://cdn.example/ep/seg-3.ts", Some("bytes=0-1"))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.cache, CacheStatus::Bypass);
        assert_eq!(origin.requests.lock()[0].1.as_deref(), Some("bytes=0-1"));
        assert!(relay.cache().is_empty());
        assert!(relay.spawn_sweeper(CancellationToken::new()).is_none());
    }

    #[tokio::test]
    async fn errors_carry_their_status() {
        let (relay, _) = relay(FakeOrigin::default(), RelayConfig::default());

        let err = relay.handle("", None).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = relay
            .handle("https://cdn.example/missing.ts", None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(relay.cache().is_empty());
    }
}
