//! Tag and attribute-list parsing for the handful of tags the relay cares about.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

/// Tags whose quoted `URI` attribute points at another upstream object.
pub(crate) const URI_TAGS: &[&str] = &[
    "#EXT-X-KEY:",
    "#EXT-X-MAP:",
    "#EXT-X-MEDIA:",
    "#EXT-X-I-FRAME-STREAM-INF:",
    "#EXT-X-SESSION-KEY:",
];

pub(crate) const STREAM_INF: &str = "#EXT-X-STREAM-INF";
pub(crate) const KEY_TAG: &str = "#EXT-X-KEY:";
pub(crate) const MEDIA_SEQUENCE_TAG: &str = "#EXT-X-MEDIA-SEQUENCE:";

static URI_ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"URI="([^"]*)""#).unwrap());

/// Split an attribute list (`KEY=VALUE,KEY="a,b"`) into pairs. Quotes are stripped from values.
pub(crate) fn parse_attributes(list: &str) -> Vec<(String, String)> {
    let mut attributes = Vec::new();
    let mut rest = list.trim();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else {
            break;
        };
        let name = rest[..eq].trim().to_ascii_uppercase();
        let after = &rest[eq + 1..];

        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };

        attributes.push((name, value.trim().to_string()));
        rest = remaining.trim_start_matches(',').trim_start();
    }

    attributes
}

pub(crate) fn attribute<'a>(attributes: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// Parse an `IV=0x...` attribute into a 16-byte block.
pub fn parse_iv(value: &str) -> Result<[u8; 16]> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let bytes = hex::decode(digits)
        .map_err(|e| Error::playlist(format!("invalid IV `{value}`: {e}")))?;

    if bytes.len() > 16 {
        return Err(Error::playlist(format!(
            "IV `{value}` is longer than 16 bytes"
        )));
    }

    // Shorter hex strings are left-padded, matching how the tag value is an integer.
    let mut iv = [0u8; 16];
    iv[16 - bytes.len()..].copy_from_slice(&bytes);
    Ok(iv)
}

pub(crate) fn parse_media_sequence(line: &str) -> Option<u64> {
    line.strip_prefix(MEDIA_SEQUENCE_TAG)?.trim().parse().ok()
}

pub(crate) fn uri_tag(line: &str) -> Option<&'static str> {
    URI_TAGS.iter().copied().find(|tag| line.starts_with(tag))
}

/// Value of the quoted `URI` attribute on a tag line.
pub(crate) fn uri_attribute(line: &str) -> Option<&str> {
    URI_ATTRIBUTE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Replace the quoted `URI` attribute on a tag line.
pub(crate) fn replace_uri_attribute(line: &str, uri: &str) -> String {
    URI_ATTRIBUTE
        .replace(line, |_: &regex::Captures<'_>| format!(r#"URI="{uri}""#))
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_values_may_contain_commas() {
        let attrs = parse_attributes(
            r#"METHOD=AES-128,URI="https://k.example/key?a=1,b=2",IV=0x0000000000000000000000000000000A"#,
        );
        assert_eq!(attribute(&attrs, "METHOD"), Some("AES-128"));
        assert_eq!(
            attribute(&attrs, "URI"),
            Some("https://k.example/key?a=1,b=2")
        );
        assert_eq!(
            attribute(&attrs, "IV"),
            Some("0x0000000000000000000000000000000A")
        );
    }

    #[test]
    fn iv_parsing() {
        let iv = parse_iv("0x0000000000000000000000000000000A").unwrap();
        assert_eq!(iv[15], 0x0a);
        assert!(iv[..15].iter().all(|b| *b == 0));

        let short = parse_iv("0x1").unwrap();
        assert_eq!(short[15], 0x01);

        assert!(parse_iv("0xZZ").is_err());
        assert!(parse_iv(&format!("0x{}", "00".repeat(17))).is_err());
    }

    #[test]
    fn uri_attribute_replacement_keeps_other_attributes() {
        let line = r#"#EXT-X-MAP:URI="init.mp4",BYTERANGE="720@0""#;
        assert_eq!(uri_attribute(line), Some("init.mp4"));
        assert_eq!(
            replace_uri_attribute(line, "/stream?url=x"),
            r#"#EXT-X-MAP:URI="/stream?url=x",BYTERANGE="720@0""#
        );
    }

    #[test]
    fn media_sequence() {
        assert_eq!(parse_media_sequence("#EXT-X-MEDIA-SEQUENCE:42"), Some(42));
        assert_eq!(parse_media_sequence("#EXT-X-MEDIA-SEQUENCE:x"), None);
        assert_eq!(parse_media_sequence("#EXTINF:4.0,"), None);
    }
}
