use std::sync::Arc;

/// `(segment_index, segment_progress_percent, total_segments)`
pub type ProgressCallback = Arc<dyn Fn(usize, f32, usize) + Send + Sync>;

/// Reports per-segment progress to an optional callback.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    callback: Option<ProgressCallback>,
    total: usize,
}

impl ProgressReporter {
    pub fn new(callback: Option<ProgressCallback>, total: usize) -> Self {
        Self { callback, total }
    }

    pub fn report(&self, index: usize, percent: f32) {
        if let Some(callback) = &self.callback {
            callback(index, percent.clamp(0.0, 100.0), self.total);
        }
    }

    /// Byte progress of one segment, ignored while the length is unknown.
    pub fn report_bytes(&self, index: usize, downloaded: u64, total: Option<u64>) {
        if let Some(total) = total.filter(|t| *t > 0) {
            self.report(index, (downloaded as f64 / total as f64 * 100.0) as f32);
        }
    }

    pub fn finish(&self, index: usize) {
        self.report(index, 100.0);
    }
}
