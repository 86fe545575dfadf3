use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures::stream::{self, StreamExt};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::pacer::Pacer;
use super::progress::{ProgressCallback, ProgressReporter};
use super::{DownloadReport, DownloadState, SegmentResult, SegmentStatus};
use crate::config::DownloadConfig;
use crate::crypto::{EncryptionKey, KeyFetcher, SegmentDecryptor, require_aes_key};
use crate::error::{Error, Result};
use crate::manifest::{ManifestDocument, SegmentRef, rewrite_manifest};
use crate::remux::{Remuxer, discard_partial_output};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::upstream::{FetchRequest, StreamResolver, Upstream};

/// Mutable state of one download, dropped when the download returns.
struct DownloadSession {
    manifest_url: Url,
    key: Option<EncryptionKey>,
    segments: Vec<SegmentRef>,
    results: Vec<SegmentResult>,
    success_count: usize,
    failure_count: usize,
    state: DownloadState,
}

impl DownloadSession {
    fn new(manifest_url: Url) -> Self {
        Self {
            manifest_url,
            key: None,
            segments: Vec::new(),
            results: Vec::new(),
            success_count: 0,
            failure_count: 0,
            state: DownloadState::Init,
        }
    }

    fn advance(&mut self, next: DownloadState) {
        debug!(from = %self.state, to = %next, url = %self.manifest_url, "Download state change");
        self.state = next;
    }

    fn fail(&mut self, err: &Error) {
        error!(
            state = %self.state,
            url = %self.manifest_url,
            key_acquired = self.key.is_some(),
            segments = self.segments.len(),
            error = %err,
            "Download failed"
        );
        self.state = DownloadState::Failed;
    }
}

/// Everything a segment worker needs, shared across the bounded stream.
struct SegmentContext<'a> {
    decryptor: &'a SegmentDecryptor,
    work_dir: &'a Path,
    pacer: &'a Pacer,
    reporter: &'a ProgressReporter,
    policy: &'a RetryPolicy,
    cancel: &'a CancellationToken,
}

/// Turns an encrypted HLS stream into one local file.
pub struct Downloader {
    upstream: Arc<dyn Upstream>,
    remuxer: Arc<dyn Remuxer>,
    config: DownloadConfig,
}

impl Downloader {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        remuxer: Arc<dyn Remuxer>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            upstream,
            remuxer,
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Download the stream behind `manifest_url` into `output_name` inside the output directory.
    pub async fn download(
        &self,
        manifest_url: &Url,
        output_name: &str,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Result<DownloadReport> {
        self.run(manifest_url.clone(), None, output_name, progress, cancel)
            .await
    }

    /// Like [`download`](Self::download), resolving the manifest through `resolver` and asking it
    /// for a fresh URL once when the origin reports the first one as gone.
    pub async fn download_episode(
        &self,
        resolver: &dyn StreamResolver,
        episode: &str,
        output_name: &str,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Result<DownloadReport> {
        let manifest_url = resolver.resolve(episode).await?;
        self.run(
            manifest_url,
            Some((resolver, episode)),
            output_name,
            progress,
            cancel,
        )
        .await
    }

    async fn run(
        &self,
        manifest_url: Url,
        resolver: Option<(&dyn StreamResolver, &str)>,
        output_name: &str,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Result<DownloadReport> {
        let mut session = DownloadSession::new(manifest_url);
        let result = self
            .drive(&mut session, resolver, output_name, progress, &cancel)
            .await;
        if let Err(err) = &result {
            session.fail(err);
        }
        result
    }

    async fn drive(
        &self,
        session: &mut DownloadSession,
        resolver: Option<(&dyn StreamResolver, &str)>,
        output_name: &str,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport> {
        session.advance(DownloadState::FetchManifest);
        let mut doc = self.fetch_manifest(session, resolver, cancel).await?;
        let mut media_url = session.manifest_url.clone();

        if doc.is_master() {
            session.advance(DownloadState::MasterDetected);
            let variant = doc
                .variants
                .first()
                .map(|v| v.original_url.clone())
                .ok_or_else(|| Error::playlist("master playlist lists no variants"))?;
            info!(variant = %variant, "Following first variant");

            session.advance(DownloadState::FetchMediaManifest);
            doc = self.fetch_playlist(&variant, cancel).await?;
            if doc.is_master() {
                return Err(Error::playlist(format!(
                    "{variant} is another master playlist"
                )));
            }
            media_url = variant;
        }

        if doc.segments.is_empty() {
            return Err(Error::playlist(format!("{media_url} lists no segments")));
        }

        session.advance(DownloadState::FetchKey);
        let (key_url, key_ref) = require_aes_key(doc.key.as_ref(), &media_url)?;
        let key = KeyFetcher::new(
            self.upstream.as_ref(),
            self.config.max_key_retries,
            cancel.clone(),
        )
        .fetch_key(key_ref, key_url)
        .await?;
        session.key = Some(key.clone());
        session.segments = doc.segments.clone();

        // Removed on drop, which covers every early return below.
        let work_dir = self.create_work_dir()?;

        session.advance(DownloadState::DecryptSegments);
        let decryptor = SegmentDecryptor::new(key.bytes, key.explicit_iv, doc.media_sequence)
            .with_offload(self.config.offload_decryption);
        let results = self
            .decrypt_segments(
                &session.segments,
                &decryptor,
                work_dir.path(),
                progress,
                cancel,
            )
            .await;

        if cancel.is_cancelled() {
            info!(url = %media_url, "Download cancelled");
            return Err(Error::Cancelled);
        }

        let total = results.len();
        let success_count = results.iter().filter(|r| r.is_usable()).count();
        let soft_failures = results
            .iter()
            .filter(|r| r.status == SegmentStatus::SoftFailure)
            .count();
        session.success_count = success_count;
        session.failure_count = total - success_count;
        session.results = results;

        if success_count == 0 {
            return Err(Error::NoSegmentsDecrypted { total });
        }

        let success_ratio = success_count as f64 / total as f64;
        let possibly_incomplete = success_ratio < self.config.quality_threshold;
        if possibly_incomplete {
            warn!(
                success = success_count,
                total,
                ratio = success_ratio,
                "Output may be incomplete"
            );
        }

        session.advance(DownloadState::Remux);
        let inputs: Vec<PathBuf> = session
            .results
            .iter()
            .filter(|r| r.is_usable())
            .filter_map(|r| r.path.clone())
            .collect();
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        let stem = self.config.output_dir.join(sanitize_file_name(output_name));
        let output_path = match self.remuxer.remux(&inputs, work_dir.path(), &stem).await {
            Ok(path) => path,
            Err(e) => {
                discard_partial_output(&self.remuxer.output_path(&stem)).await;
                return Err(e);
            }
        };

        session.advance(DownloadState::Finalize);
        if let Err(e) = work_dir.close() {
            warn!(error = %e, "Failed to remove working directory");
        }

        info!(
            output = %output_path.display(),
            success = session.success_count,
            failed = session.failure_count,
            soft_failures,
            "Download finished"
        );

        Ok(DownloadReport {
            output_path,
            success_count: session.success_count,
            failure_count: session.failure_count,
            soft_failures,
            total,
            success_ratio,
            possibly_incomplete,
            remuxer: self.remuxer.name(),
            segments: std::mem::take(&mut session.results),
        })
    }

    async fn fetch_manifest(
        &self,
        session: &mut DownloadSession,
        resolver: Option<(&dyn StreamResolver, &str)>,
        cancel: &CancellationToken,
    ) -> Result<ManifestDocument> {
        match self.fetch_playlist(&session.manifest_url, cancel).await {
            Err(err) if err.is_expired_source() => {
                let Some((resolver, episode)) = resolver else {
                    return Err(err);
                };
                warn!(
                    url = %session.manifest_url,
                    error = %err,
                    "Manifest URL expired, re-resolving"
                );
                let fresh = resolver.refresh(episode, &session.manifest_url).await?;
                session.manifest_url = fresh;
                self.fetch_playlist(&session.manifest_url, cancel).await
            }
            other => other,
        }
    }

    async fn fetch_playlist(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<ManifestDocument> {
        let policy = RetryPolicy::linear(
            self.config.max_segment_retries,
            self.config.segment_retry_delay,
        );
        let object = retry_with_backoff(&policy, cancel, |_| {
            let upstream = self.upstream.clone();
            let request = FetchRequest::new(url.clone());
            async move { RetryAction::from(upstream.fetch(request).await) }
        })
        .await?;

        let text = String::from_utf8(object.payload.to_vec())
            .map_err(|e| Error::playlist(format!("{url} is not valid UTF-8: {e}")))?;
        rewrite_manifest(&text, url, "")
    }

    fn create_work_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("sluice-");
        let dir = match &self.config.work_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        debug!(path = %dir.path().display(), "Created working directory");
        Ok(dir)
    }

    async fn decrypt_segments(
        &self,
        segments: &[SegmentRef],
        decryptor: &SegmentDecryptor,
        work_dir: &Path,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Vec<SegmentResult> {
        let pacer = Pacer::new(self.config.segment_spacing);
        let reporter = ProgressReporter::new(progress, segments.len());
        let policy = RetryPolicy::linear(
            self.config.max_segment_retries,
            self.config.segment_retry_delay,
        );
        let ctx = SegmentContext {
            decryptor,
            work_dir,
            pacer: &pacer,
            reporter: &reporter,
            policy: &policy,
            cancel,
        };

        // `buffered` keeps results in playlist order whatever order they complete in.
        stream::iter(segments)
            .map(|segment| self.process_segment(segment, &ctx))
            .buffered(self.config.concurrency)
            .collect()
            .await
    }

    async fn process_segment(
        &self,
        segment: &SegmentRef,
        ctx: &SegmentContext<'_>,
    ) -> SegmentResult {
        let index = segment.sequence_index;

        ctx.pacer.ready().await;
        if ctx.cancel.is_cancelled() {
            return SegmentResult::failed(index, "cancelled before fetch");
        }

        let attempts = AtomicU32::new(0);
        let fetched = retry_with_backoff(ctx.policy, ctx.cancel, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            let upstream = self.upstream.clone();
            let request = FetchRequest::new(segment.original_url.clone());
            let reporter = ctx.reporter.clone();
            async move {
                let on_bytes = |downloaded: u64, total: Option<u64>| {
                    reporter.report_bytes(index, downloaded, total)
                };
                RetryAction::from(upstream.fetch_with_progress(request, &on_bytes).await)
            }
        })
        .await;

        let payload = match fetched {
            Ok(object) => object.payload,
            Err(e) => {
                let err = Error::SegmentFetchHardFailure {
                    index,
                    attempts: attempts.load(Ordering::Relaxed),
                    reason: e.to_string(),
                };
                warn!(
                    segment = index,
                    url = %segment.original_url,
                    error = %err,
                    "Segment fetch failed"
                );
                return SegmentResult::failed(index, err.to_string());
            }
        };

        let outcome = match ctx.decryptor.decrypt(index, payload).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(segment = index, error = %e, "Segment decryption failed");
                return SegmentResult::failed(index, e.to_string());
            }
        };

        let status = if outcome.verified {
            SegmentStatus::Decrypted
        } else {
            let err = Error::SegmentDecryptSoftFailure {
                index,
                leading: outcome.leading_byte().unwrap_or_default(),
            };
            warn!(segment = index, strategy = %outcome.strategy, "{err}");
            SegmentStatus::SoftFailure
        };

        let path = ctx.work_dir.join(format!("{index:05}.ts"));
        if let Err(e) = tokio::fs::write(&path, &outcome.bytes).await {
            warn!(segment = index, error = %e, "Failed to write decrypted segment");
            return SegmentResult::failed(index, format!("failed to write decrypted segment: {e}"));
        }

        ctx.reporter.finish(index);
        debug!(segment = index, bytes = outcome.bytes.len(), ?status, "Segment ready");

        SegmentResult {
            index,
            status,
            path: Some(path),
            size: outcome.bytes.len() as u64,
            detail: outcome.detail(),
        }
    }
}

/// Make `name` safe to use as a file name on every platform.
fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').trim();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned.to_string()
    }
}
