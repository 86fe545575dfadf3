//! HLS manifest parsing and rewriting.
//!
//! The relay serves every playlist through [`rewrite_manifest`], which resolves each reference
//! against the playlist URL and replaces it with a `/stream?url=` link so players never talk to the
//! origin directly. The downloader reuses the same parse and reads the original URLs instead.

mod parse;
mod proxy_url;
mod rewrite;

use url::Url;

use crate::config::ManifestConfig;

pub use parse::parse_iv;
pub use proxy_url::{STREAM_PATH, parse_target, proxy_url, resolve_reference};
pub use rewrite::rewrite_manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Master,
    Media,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantRef {
    pub original_url: Url,
    pub rewritten_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRef {
    /// 0-based position in the playlist
    pub sequence_index: usize,
    pub original_url: Url,
    pub rewritten_url: String,
}

/// First `#EXT-X-KEY` of a media playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRef {
    /// Upper-cased `METHOD` attribute
    pub method: String,
    /// Absolute key URL, absent for `METHOD=NONE`
    pub uri: Option<Url>,
    /// Explicit `IV` attribute
    pub iv: Option<[u8; 16]>,
}

impl KeyRef {
    pub fn is_aes128(&self) -> bool {
        self.method == "AES-128"
    }

    pub fn is_none(&self) -> bool {
        self.method == "NONE"
    }
}

#[derive(Debug, Clone)]
pub struct ManifestDocument {
    pub kind: ManifestKind,
    pub variants: Vec<VariantRef>,
    pub segments: Vec<SegmentRef>,
    pub key: Option<KeyRef>,
    pub media_sequence: Option<u64>,
    /// Rewritten lines in their original order
    pub lines: Vec<String>,
    pub trailing_newline: bool,
}

impl ManifestDocument {
    pub fn is_master(&self) -> bool {
        self.kind == ManifestKind::Master
    }

    /// Rewritten playlist text.
    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.trailing_newline {
            out.push('\n');
        }
        out
    }
}

/// Sibling URL to probe before fetching `url`, when `url` names the decoy manifest.
///
/// The query string is carried over since origins sign both files the same way.
pub fn preferred_candidate(url: &Url, config: &ManifestConfig) -> Option<Url> {
    if !config.probe_preferred || config.decoy_name.is_empty() {
        return None;
    }

    let file_name = url.path_segments()?.next_back()?;
    if file_name != config.decoy_name {
        return None;
    }

    let mut candidate = url.join(&config.preferred_name).ok()?;
    candidate.set_query(url.query());
    Some(candidate)
}

/// Whether a probe response body is a usable playlist.
pub fn looks_like_playlist(body: &[u8]) -> bool {
    let body = body.strip_prefix(b"\xef\xbb\xbf").unwrap_or(body);
    body.trim_ascii_start().starts_with(b"#EXTM3U")
}
