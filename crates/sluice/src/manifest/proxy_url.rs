use url::Url;

use crate::error::{Error, Result};

/// Path of the relay endpoint every rewritten URL points at.
pub const STREAM_PATH: &str = "/stream";

/// Build the relay URL for an absolute upstream URL.
pub fn proxy_url(public_base: &str, absolute: &str) -> String {
    format!(
        "{}{}?url={}",
        public_base.trim_end_matches('/'),
        STREAM_PATH,
        urlencoding::encode(absolute)
    )
}

/// Resolve a manifest reference against the manifest's own URL.
pub fn resolve_reference(base: &Url, reference: &str) -> Result<Url> {
    base.join(reference.trim())
        .map_err(|e| Error::playlist(format!("cannot resolve `{reference}` against {base}: {e}")))
}

/// Validate a client supplied upstream URL.
pub fn parse_target(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::bad_request("missing `url` query parameter"));
    }
    let url = Url::parse(raw).map_err(|e| Error::bad_request(format!("invalid url `{raw}`: {e}")))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        scheme => Err(Error::bad_request(format!(
            "unsupported url scheme `{scheme}`"
        ))),
    }
}
