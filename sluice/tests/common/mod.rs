//! In-process origin server and encrypted stream fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use aes::Aes128;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use parking_lot::Mutex;
use tokio::net::TcpListener;

use sluice_engine::crypto::sequence_iv;
use sluice_engine::serve_range;

pub const KEY: [u8; 16] = *b"0123456789abcdef";

/// A fake CDN: static files by path, with optional failures and delays.
#[derive(Default)]
pub struct Origin {
    files: Mutex<HashMap<String, Bytes>>,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    hits: Mutex<HashMap<String, usize>>,
    referers: Mutex<Vec<String>>,
}

impl Origin {
    pub fn put(&self, path: &str, body: impl Into<Bytes>) {
        self.files.lock().insert(path.to_string(), body.into());
    }

    /// Answer `path` with 500 every time.
    pub fn fail(&self, path: &str) {
        self.failing.lock().insert(path.to_string());
    }

    pub fn delay(&self, path: &str, delay: Duration) {
        self.delays.lock().insert(path.to_string(), delay);
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().get(path).copied().unwrap_or(0)
    }

    pub fn referers(&self) -> Vec<String> {
        self.referers.lock().clone()
    }
}

async fn serve(State(origin): State<Arc<Origin>>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path().to_string();
    *origin.hits.lock().entry(path.clone()).or_default() += 1;
    if let Some(referer) = headers.get(header::REFERER).and_then(|v| v.to_str().ok()) {
        origin.referers.lock().push(referer.to_string());
    }

    let delay = origin.delays.lock().get(&path).copied();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    if origin.failing.lock().contains(&path) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let body = origin.files.lock().get(&path).cloned();
    let Some(body) = body else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let sliced = serve_range(&body, range);
    let mut response = Response::new(Body::from(sliced.body));
    *response.status_mut() = sliced.status;
    if let Some(content_range) = sliced.content_range {
        response
            .headers_mut()
            .insert(header::CONTENT_RANGE, content_range.parse().unwrap());
    }
    response
}

/// Start the origin on an ephemeral port. Returns it with its base URL.
pub async fn spawn_origin() -> (Arc<Origin>, String) {
    let origin = Arc::new(Origin::default());
    let app = Router::new()
        .fallback(serve)
        .with_state(origin.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (origin, format!("http://{addr}"))
}

/// Percent-encode a URL the way rewritten manifests and `/stream` queries carry it.
pub fn encode(url: &str) -> String {
    url::form_urlencoded::byte_serialize(url.as_bytes()).collect()
}

pub fn stream_request(target: &str, range: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(format!("/stream?url={}", encode(target)));
    if let Some(range) = range {
        builder = builder.header(header::RANGE, range);
    }
    builder.body(Body::empty()).unwrap()
}

pub fn encrypt(plain: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    let mut buf = vec![0u8; plain.len() + 16];
    cbc::Encryptor::<Aes128>::new(key.into(), iv.into())
        .encrypt_padded_b2b_mut::<Pkcs7>(plain, &mut buf)
        .unwrap()
        .to_vec()
}

/// Plain transport stream packet for segment `index`: sync byte, then a recognisable filler.
pub fn ts_packet(index: usize) -> Vec<u8> {
    let mut packet = vec![index as u8 + 1; 188];
    packet[0] = 0x47;
    packet
}

/// An AES-128 encrypted media playlist served from `dir` on the origin.
pub struct EncryptedStream {
    pub dir: String,
    pub plaintexts: Vec<Vec<u8>>,
    /// Declare the key tag in the playlist
    pub with_key_tag: bool,
}

impl EncryptedStream {
    pub fn new(dir: &str, count: usize) -> Self {
        Self {
            dir: dir.to_string(),
            plaintexts: (0..count).map(ts_packet).collect(),
            with_key_tag: true,
        }
    }

    pub fn playlist_path(&self) -> String {
        format!("{}/720p.m3u8", self.dir)
    }

    pub fn key_path(&self) -> String {
        format!("{}/key.bin", self.dir)
    }

    pub fn segment_path(&self, index: usize) -> String {
        format!("{}/seg-{index}-v1-a1.jpg", self.dir)
    }

    pub fn playlist(&self) -> String {
        let mut text = String::from(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n",
        );
        if self.with_key_tag {
            text.push_str("#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n");
        }
        for index in 0..self.plaintexts.len() {
            text.push_str(&format!("#EXTINF:4.000,\nseg-{index}-v1-a1.jpg\n"));
        }
        text.push_str("#EXT-X-ENDLIST\n");
        text
    }

    /// Encrypt every segment with the 1-based sequence IV and publish everything on `origin`.
    pub fn install(&self, origin: &Origin) {
        origin.put(&self.playlist_path(), self.playlist());
        origin.put(&self.key_path(), Bytes::copy_from_slice(&KEY));
        for (index, plain) in self.plaintexts.iter().enumerate() {
            let iv = sequence_iv(index as u64 + 1);
            origin.put(&self.segment_path(index), encrypt(plain, &KEY, &iv));
        }
    }

    pub fn joined(&self, indices: impl IntoIterator<Item = usize>) -> Vec<u8> {
        indices
            .into_iter()
            .flat_map(|i| self.plaintexts[i].clone())
            .collect()
    }
}
