//! Offline download of an encrypted HLS stream into a single file.

mod pacer;
mod progress;
mod session;

pub use pacer::Pacer;
pub use progress::{ProgressCallback, ProgressReporter};
pub use session::Downloader;

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

/// Download session states. `Failed` is reachable from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Init,
    FetchManifest,
    MasterDetected,
    FetchMediaManifest,
    FetchKey,
    DecryptSegments,
    Remux,
    Finalize,
    Failed,
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Decrypted,
    /// Decrypted, but the output failed the sync-byte check
    SoftFailure,
    Failed,
}

/// Outcome for one segment. Decrypted payloads live in the session working directory.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentResult {
    pub index: usize,
    pub status: SegmentStatus,
    pub path: Option<PathBuf>,
    pub size: u64,
    pub detail: Option<String>,
}

impl SegmentResult {
    pub fn failed(index: usize, detail: impl Into<String>) -> Self {
        Self {
            index,
            status: SegmentStatus::Failed,
            path: None,
            size: 0,
            detail: Some(detail.into()),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.status != SegmentStatus::Failed && self.path.is_some()
    }
}

/// Summary of a finished download.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub output_path: PathBuf,
    pub success_count: usize,
    pub failure_count: usize,
    pub soft_failures: usize,
    pub total: usize,
    /// Successful share of segments, in `0.0..=1.0`
    pub success_ratio: f64,
    /// Success ratio fell below the configured quality threshold
    pub possibly_incomplete: bool,
    pub remuxer: &'static str,
    pub segments: Vec<SegmentResult>,
}
