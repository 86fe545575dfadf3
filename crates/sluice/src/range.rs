//! Byte-range serving from a complete in-memory payload.
//!
//! Only single ranges are honoured. Anything the parser does not accept (malformed, unsatisfiable,
//! multi-range) degrades to the full object with status 200, which every player handles.

use bytes::Bytes;
use reqwest::StatusCode;

/// Inclusive byte range within a payload of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered, never zero.
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Parse a `Range` header against a payload of `total` bytes.
///
/// Supports `bytes=start-end`, `bytes=start-` and `bytes=-suffix`. The end is clamped to the last
/// byte. Returns `None` whenever the full object should be served instead.
pub fn parse_range(header: &str, total: u64) -> Option<ByteRange> {
    if total == 0 {
        return None;
    }

    let range_set = header.trim().strip_prefix("bytes=")?.trim();
    if range_set.contains(',') {
        return None;
    }

    let (start, end) = range_set.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());
    let last = total - 1;

    if start.is_empty() {
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        return Some(ByteRange {
            start: total.saturating_sub(suffix),
            end: last,
        });
    }

    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        last
    } else {
        end.parse::<u64>().ok()?.min(last)
    };

    if start > end || start > last {
        return None;
    }

    Some(ByteRange { start, end })
}

/// What to send back for one request.
#[derive(Debug, Clone)]
pub struct RangeResponse {
    pub status: StatusCode,
    pub body: Bytes,
    /// `Content-Range` value, set on 206
    pub content_range: Option<String>,
    pub content_length: u64,
}

/// Slice `payload` for an optional `Range` header.
pub fn serve_range(payload: &Bytes, range_header: Option<&str>) -> RangeResponse {
    let total = payload.len() as u64;

    match range_header.and_then(|header| parse_range(header, total)) {
        Some(range) => RangeResponse {
            status: StatusCode::PARTIAL_CONTENT,
            body: payload.slice(range.start as usize..=range.end as usize),
            content_range: Some(range.content_range(total)),
            content_length: range.length(),
        },
        None => RangeResponse {
            status: StatusCode::OK,
            body: payload.clone(),
            content_range: None,
            content_length: total,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("bytes=0-99", 1000, Some((0, 99)))]
    #[case("bytes=500-", 1000, Some((500, 999)))]
    #[case("bytes=900-5000", 1000, Some((900, 999)))]
    #[case("bytes=-100", 1000, Some((900, 999)))]
    #[case("bytes=-5000", 1000, Some((0, 999)))]
    #[case("bytes=999-999", 1000, Some((999, 999)))]
    #[case("bytes=1000-", 1000, None)]
    #[case("bytes=50-10", 1000, None)]
    #[case("bytes=0-1,5-9", 1000, None)]
    #[case("bytes=-0", 1000, None)]
    #[case("items=0-10", 1000, None)]
    #[case("bytes=abc-", 1000, None)]
    #[case("bytes=0-", 0, None)]
    fn range_parsing(
        #[case] header: &str,
        #[case] total: u64,
        #[case] expected: Option<(u64, u64)>,
    ) {
        let parsed = parse_range(header, total).map(|r| (r.start, r.end));
        assert_eq!(parsed, expected);
    }

    #[test]
    fn partial_response_slices_payload() {
        let payload = Bytes::from_static(b"0123456789");
        let resp = serve_range(&payload, Some("bytes=2-5"));
        assert_eq!(resp.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.body, Bytes::from_static(b"2345"));
        assert_eq!(resp.content_range.as_deref(), Some("bytes 2-5/10"));
        assert_eq!(resp.content_length, 4);
    }

    #[test]
    fn unsatisfiable_range_serves_everything() {
        let payload = Bytes::from_static(b"0123456789");
        let resp = serve_range(&payload, Some("bytes=20-30"));
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, payload);
        assert!(resp.content_range.is_none());
        assert_eq!(resp.content_length, 10);

        let resp = serve_range(&payload, None);
        assert_eq!(resp.status, StatusCode::OK);
    }
}
