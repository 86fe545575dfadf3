use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use sluice_engine::{
    DownloadReport, Downloader, HttpUpstream, ProgressCallback, UpstreamConfig, select_remuxer,
};

use crate::cli::DownloadArgs;

const SEGMENTS_TEMPLATE: &str =
    "{spinner:.blue} [{bar:40.cyan/blue}] {pos}/{len} segments ({eta}) {msg}";
const CURRENT_TEMPLATE: &str = "  segment {msg:>5} {bar:30} {pos:>3}%";

/// Two bars: segments done out of the total, and the current segment's byte progress.
struct DownloadProgress {
    _multi: MultiProgress,
    segments: ProgressBar,
    current: ProgressBar,
}

impl DownloadProgress {
    fn new() -> anyhow::Result<Self> {
        let multi = MultiProgress::new();
        let segments = multi.add(ProgressBar::new(0));
        segments.set_style(
            ProgressStyle::with_template(SEGMENTS_TEMPLATE)?.progress_chars("█▓░"),
        );
        segments.enable_steady_tick(Duration::from_millis(120));

        let current = multi.add(ProgressBar::new(100));
        current.set_style(ProgressStyle::with_template(CURRENT_TEMPLATE)?);

        Ok(Self {
            _multi: multi,
            segments,
            current,
        })
    }

    fn callback(&self) -> ProgressCallback {
        let segments = self.segments.clone();
        let current = self.current.clone();
        // Byte progress and segment completion can both report 100%.
        let completed = Mutex::new(HashSet::new());
        Arc::new(move |index: usize, percent: f32, total: usize| {
            segments.set_length(total as u64);
            current.set_message(index.to_string());
            current.set_position(percent as u64);
            if percent >= 100.0 && completed.lock().insert(index) {
                segments.inc(1);
            }
        })
    }

    fn finish(&self, message: &'static str) {
        self.current.finish_and_clear();
        self.segments.finish_with_message(message);
    }
}

pub async fn run(args: DownloadArgs, upstream: UpstreamConfig) -> anyhow::Result<()> {
    let url = Url::parse(&args.url).with_context(|| format!("Invalid manifest URL: {}", args.url))?;

    let upstream = HttpUpstream::new(upstream).context("Failed to build upstream client")?;
    let remuxer = select_remuxer(&args.remux_config()).await;
    let downloader = Downloader::new(Arc::new(upstream), remuxer, args.download_config());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Cancelling download, in-flight segments will finish first");
            on_signal.cancel();
        }
    });

    let progress = DownloadProgress::new()?;
    let result = downloader
        .download(&url, &args.name, Some(progress.callback()), cancel)
        .await;

    match result {
        Ok(report) => {
            progress.finish("done");
            print_report(&report);
            Ok(())
        }
        Err(e) => {
            progress.finish("failed");
            Err(e).context("Download failed")
        }
    }
}

fn print_report(report: &DownloadReport) {
    info!(
        output = %report.output_path.display(),
        succeeded = report.success_count,
        failed = report.failure_count,
        soft_failures = report.soft_failures,
        total = report.total,
        remuxer = report.remuxer,
        "Download finished"
    );
    if report.possibly_incomplete {
        warn!(
            ratio = report.success_ratio,
            "Output may be incomplete, too many segments failed"
        );
    }
    println!("{}", report.output_path.display());
}
