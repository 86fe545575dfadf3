//! `GET /stream?url=<absolute upstream url>`
//!
//! Manifests come back rewritten so every reference routes through this endpoint again. Everything
//! else is served from the relay cache with `Range` support.

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;

use sluice_engine::RelayResponse;

use crate::api::error::ApiResult;
use crate::api::server::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamProxyQuery {
    #[serde(default)]
    pub url: String,
}

pub fn router() -> Router<AppState> {
    // Mounted under `/stream` by the main router.
    Router::new().route("/", get(stream_proxy_get).options(stream_proxy_options))
}

fn cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Range"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Content-Length, Content-Range, Accept-Ranges"),
    );
}

async fn stream_proxy_options() -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    cors_headers(&mut headers);
    (StatusCode::NO_CONTENT, headers)
}

pub async fn stream_proxy_get(
    State(state): State<AppState>,
    Query(query): Query<StreamProxyQuery>,
    headers_in: HeaderMap,
) -> ApiResult<Response> {
    let range = headers_in
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());

    let relayed = state.relay.handle(&query.url, range).await?;
    Ok(into_response(relayed))
}

fn into_response(relayed: RelayResponse) -> Response {
    let mut headers = HeaderMap::new();
    cors_headers(&mut headers);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(relayed.content_type),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(relayed.content_length));
    if let Some(content_range) = relayed
        .content_range
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        headers.insert(header::CONTENT_RANGE, content_range);
    }
    headers.insert(
        "x-cache",
        HeaderValue::from_static(relayed.cache.as_str()),
    );

    (relayed.status, headers, relayed.body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sluice_engine::CacheStatus;

    #[test]
    fn partial_responses_carry_range_headers() {
        let response = into_response(RelayResponse {
            status: StatusCode::PARTIAL_CONTENT,
            content_type: "video/mp2t",
            body: Bytes::from_static(b"abc"),
            content_range: Some("bytes 0-2/10".into()),
            content_length: 3,
            cache: CacheStatus::Hit,
        });

        let headers = response.headers();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(headers[header::CONTENT_TYPE], "video/mp2t");
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 0-2/10");
        assert_eq!(headers[header::CONTENT_LENGTH], "3");
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers["x-cache"], "HIT");
    }
}
