//! Content-type classification for upstream objects.
//!
//! Some origins serve MPEG-TS segments under image (or other innocuous) extensions so that naive
//! scrapers skip them. The proxy must not trust the extension: a segment-like file name with a
//! disguise extension is served as `video/mp2t`. Everything that decides the served
//! `Content-Type` goes through [`classify_content_type`].

use serde::Serialize;
use url::Url;

/// What an upstream object is, as far as the proxy is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Playlist,
    TransportStream,
    Mp4Segment,
    Aac,
    Key,
    Subtitle,
    Jpeg,
    Png,
    Webp,
    Gif,
    Other,
}

impl MediaKind {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Playlist => "application/vnd.apple.mpegurl",
            Self::TransportStream => "video/mp2t",
            Self::Mp4Segment => "video/mp4",
            Self::Aac => "audio/aac",
            Self::Key => "application/octet-stream",
            Self::Subtitle => "text/vtt",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
            Self::Gif => "image/gif",
            Self::Other => "application/octet-stream",
        }
    }

    pub fn is_image(self) -> bool {
        matches!(self, Self::Jpeg | Self::Png | Self::Webp | Self::Gif)
    }

    pub fn is_playlist(self) -> bool {
        self == Self::Playlist
    }
}

/// Extensions the upstream uses to hide media segments.
pub const DISGUISE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "gif", "html", "js", "css", "txt",
];

/// Last path component of `url`, ignoring query string and fragment.
fn file_name(url: &str) -> String {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    path.rsplit('/').next().unwrap_or_default().to_string()
}

/// Split a file name into `(stem, lowercase extension)`.
fn split_extension(name: &str) -> (&str, Option<String>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext.to_ascii_lowercase())),
        _ => (name, None),
    }
}

/// Lowercase extension of the file `url` points at.
pub fn extension_of(url: &str) -> Option<String> {
    let name = file_name(url);
    split_extension(&name).1
}

/// Whether `url` names an HLS playlist.
pub fn is_manifest_url(url: &str) -> bool {
    matches!(extension_of(url).as_deref(), Some("m3u8" | "m3u"))
}

/// Whether a file stem looks like one item of a numbered segment series.
///
/// Segment series are always numbered, artwork and other static assets usually are not.
pub fn is_segment_like(stem: &str) -> bool {
    stem.bytes().any(|b| b.is_ascii_digit())
}

/// Decide how the object behind `url` is served.
pub fn classify_content_type(url: &str) -> MediaKind {
    let name = file_name(url);
    let (stem, ext) = split_extension(&name);
    let Some(ext) = ext else {
        return MediaKind::Other;
    };

    if DISGUISE_EXTENSIONS.contains(&ext.as_str()) && is_segment_like(stem) {
        return MediaKind::TransportStream;
    }

    match ext.as_str() {
        "m3u8" | "m3u" => MediaKind::Playlist,
        "ts" | "m2ts" | "mts" => MediaKind::TransportStream,
        "m4s" | "mp4" | "m4v" | "cmfv" => MediaKind::Mp4Segment,
        "aac" | "m4a" => MediaKind::Aac,
        "key" | "bin" => MediaKind::Key,
        "vtt" | "webvtt" => MediaKind::Subtitle,
        "jpg" | "jpeg" => MediaKind::Jpeg,
        "png" => MediaKind::Png,
        "webp" => MediaKind::Webp,
        "gif" => MediaKind::Gif,
        _ => MediaKind::Other,
    }
}
