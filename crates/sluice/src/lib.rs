//! # Sluice engine
//!
//! Core of the sluice HLS relay. It has two halves that share one upstream client and one
//! classifier:
//!
//! - the relay: [`Relay`] rewrites manifests so every reference routes back through the proxy,
//!   then serves objects from a TTL cache with request coalescing and byte ranges.
//! - the downloader: [`Downloader`] walks an AES-128 encrypted stream, decrypts each segment
//!   with IV probing and remuxes the result into a single file.
//!
//! The HTTP surface lives in the `sluice` binary crate.

pub mod cache;
pub mod classify;
pub mod config;
pub mod crypto;
pub mod download;
pub mod error;
pub mod manifest;
pub mod range;
pub mod relay;
pub mod remux;
pub mod retry;
pub mod upstream;

pub use cache::{CacheStats, CachedObject, Coalescer, ObjectCache};
pub use classify::{MediaKind, classify_content_type, is_manifest_url};
pub use config::{
    CacheConfig, DownloadConfig, ManifestConfig, RelayConfig, RemuxConfig, UpstreamConfig,
};
pub use download::{DownloadReport, DownloadState, Downloader, ProgressCallback, SegmentStatus};
pub use error::{Error, Result};
pub use manifest::{ManifestDocument, ManifestKind, rewrite_manifest};
pub use range::{ByteRange, parse_range, serve_range};
pub use relay::{CacheStatus, Relay, RelayResponse};
pub use remux::{
    FfmpegRemuxer, Remuxer, TsConcatRemuxer, discard_partial_output, select_remuxer,
};
pub use upstream::{FetchRequest, FetchedObject, HttpUpstream, StreamResolver, Upstream};
