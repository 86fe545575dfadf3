//! Joining decrypted segments into one playable file.
//!
//! [`FfmpegRemuxer`] stream-copies into MP4 and falls back to a re-encode when ffmpeg rejects the
//! copy. [`TsConcatRemuxer`] simply concatenates the transport stream, which is always valid
//! MPEG-TS and needs no external tools.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::RemuxConfig;
use crate::error::{Error, Result};

#[async_trait]
pub trait Remuxer: Send + Sync {
    fn name(&self) -> &'static str;

    /// File extension of the output, without the dot.
    fn extension(&self) -> &'static str;

    /// Where [`remux`](Self::remux) writes for `output_stem`.
    fn output_path(&self, output_stem: &Path) -> PathBuf {
        with_extension_appended(output_stem, self.extension())
    }

    /// Join `segments` (in order) into [`output_path`](Self::output_path).
    ///
    /// On failure the output may be left half-written; callers remove it.
    async fn remux(&self, segments: &[PathBuf], work_dir: &Path, output_stem: &Path)
    -> Result<PathBuf>;
}

/// Remove whatever a failed remux left at `output`.
pub async fn discard_partial_output(output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => debug!(path = %output.display(), "Removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %output.display(), error = %e, "Failed to remove partial output"),
    }
}

fn with_extension_appended(stem: &Path, extension: &str) -> PathBuf {
    let mut name: OsString = stem.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

fn make_absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemuxMode {
    /// Stream copy with ADTS to ASC conversion
    Copy,
    /// libx264 + AAC
    Reencode,
}

pub struct FfmpegRemuxer {
    ffmpeg_path: String,
}

impl FfmpegRemuxer {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// Whether the configured binary runs at all.
    pub async fn probe(&self) -> bool {
        Command::new(&self.ffmpeg_path)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn build_args(list: &Path, output: &Path, mode: RemuxMode) -> Vec<String> {
        let mut args: Vec<String> = ["-y", "-hide_banner", "-nostats", "-loglevel", "error"]
            .into_iter()
            .map(String::from)
            .collect();

        args.extend(["-f", "concat", "-safe", "0", "-i"].map(String::from));
        args.push(list.to_string_lossy().into_owned());

        match mode {
            RemuxMode::Copy => {
                args.extend(["-c", "copy", "-bsf:a", "aac_adtstoasc"].map(String::from));
            }
            RemuxMode::Reencode => {
                args.extend(
                    [
                        "-c:v", "libx264", "-preset", "veryfast", "-crf", "23", "-c:a", "aac",
                        "-b:a", "128k",
                    ]
                    .map(String::from),
                );
            }
        }

        args.extend(["-movflags", "+faststart"].map(String::from));
        args.push(output.to_string_lossy().into_owned());
        args
    }

    /// ffmpeg concat demuxer list. Single quotes are escaped the way the demuxer expects.
    fn concat_list(segments: &[PathBuf]) -> String {
        segments
            .iter()
            .map(|path| {
                let path = make_absolute(path).to_string_lossy().replace('\'', r"'\''");
                format!("file '{path}'\n")
            })
            .collect()
    }

    async fn run(&self, args: &[String]) -> Result<()> {
        debug!("FFmpeg args: {:?}", args);

        let output = Command::new(&self.ffmpeg_path)
            .args(args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::remux(format!("failed to spawn {}: {e}", self.ffmpeg_path)))?;

        if output.status.success() {
            return Ok(());
        }

        // Find the last error line
        let stderr = String::from_utf8_lossy(&output.stderr);
        let error_msg = stderr
            .lines()
            .rfind(|line| !line.trim().is_empty())
            .unwrap_or("Unknown ffmpeg error");

        Err(Error::remux(format!(
            "ffmpeg failed with exit code {}: {}",
            output.status.code().unwrap_or(-1),
            error_msg
        )))
    }
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn extension(&self) -> &'static str {
        "mp4"
    }

    async fn remux(
        &self,
        segments: &[PathBuf],
        work_dir: &Path,
        output_stem: &Path,
    ) -> Result<PathBuf> {
        if segments.is_empty() {
            return Err(Error::remux("no segments to remux"));
        }

        let list = work_dir.join("concat.txt");
        tokio::fs::write(&list, Self::concat_list(segments)).await?;
        let output = self.output_path(output_stem);

        match self
            .run(&Self::build_args(&list, &output, RemuxMode::Copy))
            .await
        {
            Ok(()) => {
                info!(
                    output = %output.display(),
                    segments = segments.len(),
                    "Remuxed with stream copy"
                );
                return Ok(output);
            }
            Err(e) => warn!(error = %e, "Stream copy rejected, re-encoding"),
        }

        self.run(&Self::build_args(&list, &output, RemuxMode::Reencode))
            .await?;
        info!(output = %output.display(), segments = segments.len(), "Remuxed with re-encode");
        Ok(output)
    }
}

/// Concatenates MPEG-TS segments byte for byte.
#[derive(Debug, Default)]
pub struct TsConcatRemuxer;

#[async_trait]
impl Remuxer for TsConcatRemuxer {
    fn name(&self) -> &'static str {
        "ts-concat"
    }

    fn extension(&self) -> &'static str {
        "ts"
    }

    async fn remux(
        &self,
        segments: &[PathBuf],
        _work_dir: &Path,
        output_stem: &Path,
    ) -> Result<PathBuf> {
        if segments.is_empty() {
            return Err(Error::remux("no segments to remux"));
        }

        let output = self.output_path(output_stem);
        let mut file = File::create(&output).await.map_err(|e| {
            Error::remux(format!("failed to create {}: {e}", output.display()))
        })?;

        for segment in segments {
            let mut input = File::open(segment).await?;
            tokio::io::copy(&mut input, &mut file).await?;
        }
        file.flush().await?;

        info!(
            output = %output.display(),
            segments = segments.len(),
            "Concatenated transport stream"
        );
        Ok(output)
    }
}

/// Pick ffmpeg when it is usable, the TS concatenator otherwise.
pub async fn select_remuxer(config: &RemuxConfig) -> Arc<dyn Remuxer> {
    if config.force_ts_concat {
        return Arc::new(TsConcatRemuxer);
    }

    let ffmpeg = FfmpegRemuxer::new(config.ffmpeg_path.clone());
    if ffmpeg.probe().await {
        Arc::new(ffmpeg)
    } else {
        warn!(
            ffmpeg = %config.ffmpeg_path,
            "ffmpeg not available, output will be a concatenated .ts file"
        );
        Arc::new(TsConcatRemuxer)
    }
}
