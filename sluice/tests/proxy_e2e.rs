//! Drives the relay router end to end against an in-process origin.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use axum::response::Response;
use tower::ServiceExt;

use sluice::api::{ApiServer, ApiServerConfig, AppState};
use sluice_engine::{CacheConfig, Relay, RelayConfig, UpstreamConfig};

use common::{EncryptedStream, encode, spawn_origin, stream_request};

fn app(config: RelayConfig) -> Router {
    let relay = Relay::with_http(config).unwrap();
    ApiServer::new(ApiServerConfig::default(), AppState::new(Arc::new(relay))).build_router()
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn media_playlist_is_rewritten_through_the_relay() {
    let (origin, base) = spawn_origin().await;
    let stream = EncryptedStream::new("/show/ep1", 3);
    stream.install(&origin);

    let response = app(RelayConfig::default())
        .oneshot(stream_request(&format!("{base}{}", stream.playlist_path()), None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/vnd.apple.mpegurl"
    );
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");

    let text = body_text(response).await;
    let key_url = format!("{base}{}", stream.key_path());
    assert!(text.contains(&format!("URI=\"/stream?url={}\"", encode(&key_url))));
    for index in 0..3 {
        let segment = format!("{base}{}", stream.segment_path(index));
        assert!(text.contains(&format!("/stream?url={}", encode(&segment))));
    }
    for line in text.lines().filter(|l| !l.is_empty() && !l.starts_with('#')) {
        assert!(line.starts_with("/stream?url="), "unrewritten line {line}");
    }
    assert!(text.ends_with("#EXT-X-ENDLIST\n"));
}

#[tokio::test]
async fn decoy_index_is_swapped_for_master() {
    let (origin, base) = spawn_origin().await;
    origin.put(
        "/show/ep1/index.m3u8",
        "#EXTM3U\n#EXTINF:4,\nseg-0.ts\n#EXT-X-ENDLIST\n",
    );
    origin.put(
        "/show/ep1/master.m3u8",
        "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=1280x720\n720p.m3u8\n",
    );

    let response = app(RelayConfig::default())
        .oneshot(stream_request(&format!("{base}/show/ep1/index.m3u8"), None))
        .await
        .unwrap();

    let text = body_text(response).await;
    assert!(text.contains("#EXT-X-STREAM-INF"));
    assert!(text.contains(&encode(&format!("{base}/show/ep1/720p.m3u8"))));
    assert_eq!(origin.hits("/show/ep1/index.m3u8"), 0);
}

#[tokio::test]
async fn disguised_segment_is_served_as_transport_stream_with_ranges() {
    let (origin, base) = spawn_origin().await;
    let stream = EncryptedStream::new("/show/ep1", 1);
    stream.install(&origin);
    let segment = format!("{base}{}", stream.segment_path(0));
    let app = app(RelayConfig::default());

    let response = app
        .clone()
        .oneshot(stream_request(&segment, Some("bytes=0-9")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp2t");
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-9/192");
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "10");
    assert_eq!(response.headers()["x-cache"], "MISS");

    let response = app.oneshot(stream_request(&segment, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp2t");
    assert_eq!(response.headers()["x-cache"], "HIT");
    assert_eq!(to_bytes(response.into_body(), usize::MAX).await.unwrap().len(), 192);

    assert_eq!(origin.hits(&stream.segment_path(0)), 1);
    assert_eq!(origin.referers(), vec![format!("{base}/")]);
}

#[tokio::test]
async fn concurrent_requests_share_one_upstream_fetch() {
    let (origin, base) = spawn_origin().await;
    origin.put("/live/seg-7.ts", vec![0x47u8; 1024]);
    origin.delay("/live/seg-7.ts", Duration::from_millis(200));
    let app = app(RelayConfig::default());
    let target = format!("{base}/live/seg-7.ts");

    let requests = (0..10).map(|_| app.clone().oneshot(stream_request(&target, None)));
    let responses = futures::future::join_all(requests).await;

    for response in responses {
        assert_eq!(response.unwrap().status(), StatusCode::OK);
    }
    assert_eq!(origin.hits("/live/seg-7.ts"), 1);
}

#[tokio::test]
async fn disabled_cache_passes_ranges_through() {
    let (origin, base) = spawn_origin().await;
    origin.put("/live/seg-1.ts", vec![0x47u8; 100]);
    let config = RelayConfig {
        cache: CacheConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let app = app(config);
    let target = format!("{base}/live/seg-1.ts");

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(stream_request(&target, Some("bytes=10-19")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 10-19/100");
        assert_eq!(response.headers()["x-cache"], "BYPASS");
    }
    assert_eq!(origin.hits("/live/seg-1.ts"), 2);
}

#[tokio::test]
async fn bad_targets_are_rejected_with_400() {
    let app = app(RelayConfig::default());

    let missing = Request::builder()
        .uri("/stream")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(missing).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(json["code"], "BAD_REQUEST");

    let response = app
        .oneshot(stream_request("file:///etc/passwd", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upstream_failures_map_to_gateway_errors() {
    let (origin, base) = spawn_origin().await;
    origin.put("/slow/seg-1.ts", vec![0x47u8; 10]);
    origin.delay("/slow/seg-1.ts", Duration::from_secs(3));
    let app = app(RelayConfig {
        upstream: UpstreamConfig {
            timeout: Duration::from_millis(300),
            ..Default::default()
        },
        ..Default::default()
    });

    let response = app
        .clone()
        .oneshot(stream_request(&format!("{base}/gone/seg-1.ts"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");

    let response = app
        .oneshot(stream_request(&format!("{base}/slow/seg-1.ts"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn failed_fetches_are_not_cached() {
    let (origin, base) = spawn_origin().await;
    let app = app(RelayConfig::default());
    let target = format!("{base}/late/seg-1.ts");

    let response = app.clone().oneshot(stream_request(&target, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    origin.put("/late/seg-1.ts", vec![0x47u8; 10]);
    let response = app.oneshot(stream_request(&target, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(origin.hits("/late/seg-1.ts"), 2);
}

#[tokio::test]
async fn preflight_allows_range() {
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/stream")
        .body(Body::empty())
        .unwrap();
    let response = app(RelayConfig::default()).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS]
            .to_str()
            .unwrap()
            .contains("Range")
    );
}

#[tokio::test]
async fn health_reports_cache_contents() {
    let (origin, base) = spawn_origin().await;
    origin.put("/live/seg-3.ts", vec![0x47u8; 64]);
    let app = app(RelayConfig::default());
    app.clone()
        .oneshot(stream_request(&format!("{base}/live/seg-3.ts"), None))
        .await
        .unwrap();

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["cache_enabled"], true);
    assert_eq!(json["cache"]["segments"], 1);
    assert_eq!(json["cache"]["bytes"], 64);
    assert_eq!(json["cache"]["in_flight"], 0);
}
