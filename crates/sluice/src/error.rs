use reqwest::StatusCode;

/// Engine-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("bad request: {reason}")]
    BadRequest { reason: String },

    #[error("upstream timed out after {timeout_secs}s fetching {url}")]
    UpstreamTimeout { url: String, timeout_secs: u64 },

    #[error("upstream rejected {url} with HTTP {status}")]
    UpstreamRejected { url: String, status: StatusCode },

    #[error("upstream unavailable for {url}: {reason}")]
    UpstreamUnavailable { url: String, reason: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("manifest {url} declares no decryption key")]
    DecryptionKeyMissing { url: String },

    #[error("unsupported encryption method `{method}`")]
    UnsupportedEncryption { method: String },

    #[error("failed to obtain decryption key from {url}: {reason}")]
    KeyFetch { url: String, reason: String },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("segment {index} decrypted with unexpected leading byte 0x{leading:02x}")]
    SegmentDecryptSoftFailure { index: usize, leading: u8 },

    #[error("segment {index} failed after {attempts} attempts: {reason}")]
    SegmentFetchHardFailure {
        index: usize,
        attempts: u32,
        reason: String,
    },

    #[error("no segment of {total} could be decrypted")]
    NoSegmentsDecrypted { total: usize },

    #[error("remux failed: {reason}")]
    RemuxFailure { reason: String },

    #[error("I/O error: {reason}")]
    Io { reason: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest {
            reason: reason.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    pub fn remux(reason: impl Into<String>) -> Self {
        Self::RemuxFailure {
            reason: reason.into(),
        }
    }

    pub fn rejected(url: impl Into<String>, status: StatusCode) -> Self {
        Self::UpstreamRejected {
            url: url.into(),
            status,
        }
    }

    pub fn unavailable(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Whether repeating the same request can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UpstreamTimeout { .. } | Self::UpstreamUnavailable { .. } => true,
            Self::UpstreamRejected { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Io { .. } => true,
            Self::BadRequest { .. }
            | Self::Playlist { .. }
            | Self::DecryptionKeyMissing { .. }
            | Self::UnsupportedEncryption { .. }
            | Self::KeyFetch { .. }
            | Self::Decryption { .. }
            | Self::SegmentDecryptSoftFailure { .. }
            | Self::SegmentFetchHardFailure { .. }
            | Self::NoSegmentsDecrypted { .. }
            | Self::RemuxFailure { .. }
            | Self::Cancelled => false,
        }
    }

    /// Whether the upstream answered in a way that suggests the URL itself has expired.
    pub fn is_expired_source(&self) -> bool {
        matches!(
            self,
            Self::UpstreamRejected { status, .. }
                if *status == StatusCode::FORBIDDEN
                    || *status == StatusCode::NOT_FOUND
                    || *status == StatusCode::GONE
        )
    }

    /// HTTP status the proxy answers with when this error reaches a client.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamRejected { .. }
            | Self::UpstreamUnavailable { .. }
            | Self::Playlist { .. }
            | Self::KeyFetch { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}
