use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Outbound request settings shared by the proxy and the downloader.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Hard timeout for a single upstream request
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// User agent string
    pub user_agent: String,

    /// Referer sent to every origin. When unset the target's own origin is used.
    pub referer_override: Option<String>,

    /// Headers added to every request before the spoofed ones
    pub headers: HeaderMap,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            referer_override: None,
            headers: UpstreamConfig::get_default_headers(),
            pool_max_idle_per_host: 20,
        }
    }
}

impl UpstreamConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("*/*"),
        );

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        default_headers
    }
}

/// Object cache lifetimes.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Disable to forward every request (and its Range header) straight upstream
    pub enabled: bool,
    /// Lifetime of cached media segments
    pub segment_ttl: Duration,
    /// Lifetime of cached (rewritten) playlists
    pub playlist_ttl: Duration,
    /// How often the background sweeper runs
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            segment_ttl: Duration::from_secs(10 * 60),
            playlist_ttl: Duration::from_secs(20),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Manifest rewriting and preferred-variant probing.
#[derive(Debug, Clone)]
pub struct ManifestConfig {
    /// Prefix placed before `/stream?url=` in rewritten manifests. Empty keeps them same-origin.
    pub public_base: String,
    /// Probe for the preferred sibling when a decoy manifest is requested
    pub probe_preferred: bool,
    /// File name the upstream serves as a decoy
    pub decoy_name: String,
    /// File name of the real master playlist next to the decoy
    pub preferred_name: String,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            public_base: String::new(),
            probe_preferred: true,
            decoy_name: "index.m3u8".to_owned(),
            preferred_name: "master.m3u8".to_owned(),
        }
    }
}

/// Download session tuning.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Directory the final file is written to
    pub output_dir: PathBuf,
    /// Parent of the per-session working directory (system temp dir when unset)
    pub work_root: Option<PathBuf>,
    /// Segments fetched at the same time (1 keeps the session strictly sequential)
    pub concurrency: usize,
    /// Minimum spacing between the start of two segment fetches
    pub segment_spacing: Duration,
    /// Retries per segment after the first attempt
    pub max_segment_retries: u32,
    /// Linear backoff step between segment retries
    pub segment_retry_delay: Duration,
    /// Retries for the key fetch after the first attempt
    pub max_key_retries: u32,
    /// Below this success ratio the output is flagged as possibly incomplete
    pub quality_threshold: f64,
    /// Run AES decryption on the blocking thread pool
    pub offload_decryption: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            work_root: None,
            concurrency: 1,
            segment_spacing: Duration::from_millis(250),
            max_segment_retries: 3,
            segment_retry_delay: Duration::from_secs(1),
            max_key_retries: 2,
            quality_threshold: 0.8,
            offload_decryption: true,
        }
    }
}

/// Remuxer selection.
#[derive(Debug, Clone)]
pub struct RemuxConfig {
    /// Path to ffmpeg binary
    pub ffmpeg_path: String,
    /// Skip the ffmpeg probe and always byte-concatenate transport streams
    pub force_ts_concat: bool,
}

impl Default for RemuxConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            force_ts_concat: false,
        }
    }
}

// --- Top-Level Configuration ---
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    pub manifest: ManifestConfig,
    pub download: DownloadConfig,
    pub remux: RemuxConfig,
}

impl DownloadConfig {
    /// Clamp user supplied values into the supported envelope.
    pub fn normalized(mut self) -> Self {
        self.concurrency = self.concurrency.clamp(1, 4);
        self.quality_threshold = self.quality_threshold.clamp(0.0, 1.0);
        self
    }
}
