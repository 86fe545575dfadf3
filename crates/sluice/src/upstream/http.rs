use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Response};
use tracing::{debug, trace};
use url::Url;

use super::{ByteProgress, FetchRequest, FetchedObject, Upstream};
use crate::config::UpstreamConfig;
use crate::error::{Error, Result};

/// Headers that make an outbound request look like it came from a player on the origin's own page.
pub fn browser_headers(url: &Url, referer_override: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let origin = url.origin().ascii_serialization();

    let referer = match referer_override {
        Some(referer) => referer.to_string(),
        None => format!("{origin}/"),
    };
    if let Ok(value) = HeaderValue::from_str(&referer) {
        headers.insert(header::REFERER, value);
    }

    let origin = match referer_override.and_then(|r| Url::parse(r).ok()) {
        Some(referer) => referer.origin().ascii_serialization(),
        None => origin,
    };
    if let Ok(value) = HeaderValue::from_str(&origin) {
        headers.insert(header::ORIGIN, value);
    }

    headers
}

/// [`Upstream`] backed by a pooled reqwest client.
#[derive(Clone)]
pub struct HttpUpstream {
    client: Client,
    config: UpstreamConfig,
}

impl HttpUpstream {
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .user_agent(config.user_agent.clone())
            .default_headers(config.headers.clone())
            .build()
            .map_err(|e| Error::Io {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    fn map_transport_error(&self, url: &Url, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::UpstreamTimeout {
                url: url.to_string(),
                timeout_secs: self.config.timeout.as_secs(),
            }
        } else {
            Error::unavailable(url.as_str(), err.to_string())
        }
    }

    async fn send(&self, request: &FetchRequest) -> Result<Response> {
        let mut builder = self
            .client
            .get(request.url.clone())
            .headers(browser_headers(
                &request.url,
                self.config.referer_override.as_deref(),
            ));
        if let Some(range) = &request.range {
            builder = builder.header(header::RANGE, range);
        }

        trace!(url = %request.url, range = ?request.range, "Fetching upstream object");

        let response = builder
            .send()
            .await
            .map_err(|e| self.map_transport_error(&request.url, e))?;

        let status = response.status();
        if !status.is_success() {
            debug!(url = %request.url, %status, "Upstream rejected request");
            return Err(Error::rejected(request.url.as_str(), status));
        }

        Ok(response)
    }

    fn finish(request: &FetchRequest, response: &Response, payload: Bytes) -> FetchedObject {
        let content_range = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        FetchedObject {
            status: response.status(),
            content_range,
            ..FetchedObject::new(&request.url, payload)
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchedObject> {
        let response = self.send(&request).await?;
        let template = Self::finish(&request, &response, Bytes::new());

        let payload = response
            .bytes()
            .await
            .map_err(|e| self.map_transport_error(&request.url, e))?;

        debug!(
            url = %request.url,
            bytes = payload.len(),
            kind = ?template.kind,
            "Fetched upstream object"
        );

        Ok(FetchedObject { payload, ..template })
    }

    async fn fetch_with_progress(
        &self,
        request: FetchRequest,
        progress: ByteProgress<'_>,
    ) -> Result<FetchedObject> {
        let response = self.send(&request).await?;
        let total = response.content_length();
        let template = Self::finish(&request, &response, Bytes::new());

        let mut buffer = BytesMut::with_capacity(total.unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.map_transport_error(&request.url, e))?;
            downloaded += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);
            progress(downloaded, total);
        }

        Ok(FetchedObject {
            payload: buffer.freeze(),
            ..template
        })
    }
}
