//! Command line definition. Every flag can also come from a `SLUICE_*` environment variable or a
//! `.env` file.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use sluice_engine::{
    CacheConfig, DownloadConfig, ManifestConfig, RelayConfig, RemuxConfig, UpstreamConfig,
};

use crate::api::ApiServerConfig;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "HLS relay proxy and encrypted-stream downloader",
    long_about = None
)]
pub struct Cli {
    /// Log filter directive, e.g. `sluice_engine=debug`. Overrides RUST_LOG.
    #[arg(long, global = true, env = "SLUICE_LOG")]
    pub log: Option<String>,

    /// Also write daily rolling log files into this directory
    #[arg(long, global = true, env = "SLUICE_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(flatten)]
    pub upstream: UpstreamArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay HTTP server
    Serve(ServeArgs),
    /// Download an encrypted HLS stream into a single file
    Download(DownloadArgs),
}

#[derive(Args, Debug, Clone)]
pub struct UpstreamArgs {
    /// Timeout for a single upstream request, in seconds
    #[arg(long, global = true, env = "SLUICE_UPSTREAM_TIMEOUT", default_value_t = 30)]
    pub upstream_timeout: u64,

    /// Referer sent to every origin instead of the target's own origin
    #[arg(long, global = true, env = "SLUICE_REFERER")]
    pub referer: Option<String>,

    /// User agent sent upstream
    #[arg(long, global = true, env = "SLUICE_USER_AGENT")]
    pub user_agent: Option<String>,
}

impl UpstreamArgs {
    pub fn to_config(&self) -> UpstreamConfig {
        let mut config = UpstreamConfig {
            timeout: Duration::from_secs(self.upstream_timeout.max(1)),
            referer_override: self.referer.clone(),
            ..Default::default()
        };
        if let Some(user_agent) = &self.user_agent {
            config.user_agent = user_agent.clone();
        }
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long, env = "SLUICE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "SLUICE_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Prefix for rewritten manifest URLs, e.g. `https://relay.example`. Empty keeps them relative.
    #[arg(long, env = "SLUICE_PUBLIC_BASE", default_value = "")]
    pub public_base: String,

    /// Forward every request upstream without caching
    #[arg(long, env = "SLUICE_NO_CACHE")]
    pub no_cache: bool,

    /// Lifetime of cached segments, in seconds
    #[arg(long, env = "SLUICE_CACHE_SEGMENT_TTL", default_value_t = 600)]
    pub segment_ttl: u64,

    /// Lifetime of cached playlists, in seconds
    #[arg(long, env = "SLUICE_CACHE_PLAYLIST_TTL", default_value_t = 20)]
    pub playlist_ttl: u64,

    /// Cache sweep interval, in seconds
    #[arg(long, env = "SLUICE_CACHE_SWEEP_INTERVAL", default_value_t = 30)]
    pub sweep_interval: u64,

    /// Do not probe for `master.m3u8` when `index.m3u8` is requested
    #[arg(long, env = "SLUICE_NO_PREFERRED_PROBE")]
    pub no_preferred_probe: bool,

    /// Disable the permissive CORS layer
    #[arg(long, env = "SLUICE_NO_CORS")]
    pub no_cors: bool,
}

impl ServeArgs {
    pub fn server_config(&self) -> ApiServerConfig {
        ApiServerConfig {
            bind_address: self.host.clone(),
            port: self.port,
            enable_cors: !self.no_cors,
        }
    }

    pub fn relay_config(&self, upstream: UpstreamConfig) -> RelayConfig {
        RelayConfig {
            upstream,
            cache: CacheConfig {
                enabled: !self.no_cache,
                segment_ttl: Duration::from_secs(self.segment_ttl),
                playlist_ttl: Duration::from_secs(self.playlist_ttl),
                sweep_interval: Duration::from_secs(self.sweep_interval.max(1)),
            },
            manifest: ManifestConfig {
                public_base: self.public_base.clone(),
                probe_preferred: !self.no_preferred_probe,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    /// Manifest URL (master or media playlist)
    pub url: String,

    /// Output file name without extension
    pub name: String,

    /// Directory the final file is written to
    #[arg(short, long, env = "SLUICE_OUTPUT_DIR", default_value = ".")]
    pub output_dir: PathBuf,

    /// Segments fetched at the same time (1-4)
    #[arg(short, long, env = "SLUICE_CONCURRENCY", default_value_t = 1)]
    pub concurrency: usize,

    /// Minimum spacing between segment fetches, in milliseconds
    #[arg(long, env = "SLUICE_SEGMENT_SPACING_MS", default_value_t = 250)]
    pub spacing_ms: u64,

    /// Retries per segment after the first attempt
    #[arg(long, env = "SLUICE_SEGMENT_RETRIES", default_value_t = 3)]
    pub retries: u32,

    /// Success ratio below which the output is flagged as possibly incomplete
    #[arg(long, env = "SLUICE_QUALITY_THRESHOLD", default_value_t = 0.8)]
    pub quality_threshold: f64,

    /// Path to the ffmpeg binary
    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    pub ffmpeg: String,

    /// Skip ffmpeg and write a concatenated .ts file
    #[arg(long)]
    pub ts: bool,
}

impl DownloadArgs {
    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            output_dir: self.output_dir.clone(),
            concurrency: self.concurrency,
            segment_spacing: Duration::from_millis(self.spacing_ms),
            max_segment_retries: self.retries,
            quality_threshold: self.quality_threshold,
            ..Default::default()
        }
        .normalized()
    }

    pub fn remux_config(&self) -> RemuxConfig {
        RemuxConfig {
            ffmpeg_path: self.ffmpeg.clone(),
            force_ts_concat: self.ts,
        }
    }
}
