use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};
use crate::manifest::KeyRef;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::upstream::{FetchRequest, Upstream};

/// AES-128 key material for one download session.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    pub bytes: [u8; 16],
    pub explicit_iv: Option<[u8; 16]>,
}

// Key bytes never end up in logs.
impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"<redacted>")
            .field("explicit_iv", &self.explicit_iv.map(hex::encode))
            .finish()
    }
}

/// Check that a media playlist declares a usable AES-128 key and return its URL.
pub fn require_aes_key<'a>(
    key: Option<&'a KeyRef>,
    manifest_url: &Url,
) -> Result<(&'a Url, &'a KeyRef)> {
    let missing = || Error::DecryptionKeyMissing {
        url: manifest_url.to_string(),
    };

    let key = key.ok_or_else(missing)?;
    if key.is_none() {
        return Err(missing());
    }
    if !key.is_aes128() {
        return Err(Error::UnsupportedEncryption {
            method: key.method.clone(),
        });
    }
    let uri = key.uri.as_ref().ok_or_else(missing)?;
    Ok((uri, key))
}

/// Fetches key bytes once per session, retrying transient failures.
pub struct KeyFetcher<'a> {
    upstream: &'a dyn Upstream,
    policy: RetryPolicy,
    token: CancellationToken,
}

impl<'a> KeyFetcher<'a> {
    pub fn new(upstream: &'a dyn Upstream, max_retries: u32, token: CancellationToken) -> Self {
        Self {
            upstream,
            policy: RetryPolicy::exponential(
                max_retries,
                Duration::from_millis(500),
                Duration::from_secs(5),
            ),
            token,
        }
    }

    pub async fn fetch_key(&self, key: &KeyRef, key_url: &Url) -> Result<EncryptionKey> {
        debug!(url = %key_url, "Fetching decryption key");

        let fetched = retry_with_backoff(&self.policy, &self.token, |_| {
            let upstream = self.upstream;
            let request = FetchRequest::new(key_url.clone());
            async move { RetryAction::from(upstream.fetch(request).await) }
        })
        .await
        .map_err(|e| match e {
            Error::Cancelled => Error::Cancelled,
            other => Error::KeyFetch {
                url: key_url.to_string(),
                reason: other.to_string(),
            },
        })?;

        let bytes: [u8; 16] = fetched.payload.as_ref().try_into().map_err(|_| Error::KeyFetch {
            url: key_url.to_string(),
            reason: format!("expected 16 key bytes, got {}", fetched.payload.len()),
        })?;

        info!(url = %key_url, explicit_iv = key.iv.is_some(), "Decryption key acquired");

        Ok(EncryptionKey {
            bytes,
            explicit_iv: key.iv,
        })
    }
}
