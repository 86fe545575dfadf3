use tracing::{debug, warn};
use url::Url;

use super::parse::{self, KEY_TAG, STREAM_INF, attribute, parse_attributes, parse_media_sequence};
use super::proxy_url::{proxy_url, resolve_reference};
use super::{KeyRef, ManifestDocument, ManifestKind, SegmentRef, VariantRef};
use crate::error::{Error, Result};

/// Parse `text` fetched from `base` and rewrite every upstream reference through the relay.
///
/// Rewriting is pure: the returned document carries both the original absolute URLs (used by the
/// downloader) and the rewritten lines (served to players).
pub fn rewrite_manifest(text: &str, base: &Url, public_base: &str) -> Result<ManifestDocument> {
    let body = text.strip_prefix('\u{feff}').unwrap_or(text);
    if !body.trim_start().starts_with("#EXTM3U") {
        return Err(Error::playlist(format!(
            "{base} is not an HLS playlist (missing #EXTM3U)"
        )));
    }

    let trailing_newline = body.ends_with('\n');
    let trimmed = body.strip_suffix('\n').unwrap_or(body);

    let kind = if trimmed
        .lines()
        .any(|line| line.trim_start().starts_with(STREAM_INF))
    {
        ManifestKind::Master
    } else {
        ManifestKind::Media
    };

    let mut doc = ManifestDocument {
        kind,
        variants: Vec::new(),
        segments: Vec::new(),
        key: None,
        media_sequence: None,
        lines: Vec::new(),
        trailing_newline,
    };

    for raw in trimmed.split('\n') {
        let (line, cr) = match raw.strip_suffix('\r') {
            Some(line) => (line, "\r"),
            None => (raw, ""),
        };
        let content = line.trim();

        let rewritten = if content.is_empty() {
            None
        } else if content.starts_with('#') {
            rewrite_tag(content, base, public_base, &mut doc)?
        } else {
            let absolute = resolve_reference(base, content)?;
            let relayed = proxy_url(public_base, absolute.as_str());
            match kind {
                ManifestKind::Master => doc.variants.push(VariantRef {
                    original_url: absolute,
                    rewritten_url: relayed.clone(),
                }),
                ManifestKind::Media => doc.segments.push(SegmentRef {
                    sequence_index: doc.segments.len(),
                    original_url: absolute,
                    rewritten_url: relayed.clone(),
                }),
            }
            Some(relayed)
        };

        doc.lines.push(match rewritten {
            Some(new_line) => format!("{new_line}{cr}"),
            None => raw.to_string(),
        });
    }

    debug!(
        url = %base,
        kind = ?doc.kind,
        variants = doc.variants.len(),
        segments = doc.segments.len(),
        "Rewrote manifest"
    );

    Ok(doc)
}

/// Rewrite a tag line when it references another object. `None` keeps the line verbatim.
fn rewrite_tag(
    line: &str,
    base: &Url,
    public_base: &str,
    doc: &mut ManifestDocument,
) -> Result<Option<String>> {
    if let Some(sequence) = parse_media_sequence(line) {
        doc.media_sequence = Some(sequence);
        return Ok(None);
    }

    if line.starts_with(KEY_TAG) && doc.key.is_none() {
        doc.key = Some(parse_key(line, base)?);
    }

    if parse::uri_tag(line).is_none() {
        return Ok(None);
    }
    let Some(reference) = parse::uri_attribute(line) else {
        return Ok(None);
    };

    let absolute = resolve_reference(base, reference)?;
    // Non-HTTP key systems (skd://, data:) are left for the player.
    if !matches!(absolute.scheme(), "http" | "https") {
        return Ok(None);
    }

    Ok(Some(parse::replace_uri_attribute(
        line,
        &proxy_url(public_base, absolute.as_str()),
    )))
}

fn parse_key(line: &str, base: &Url) -> Result<KeyRef> {
    let attributes = parse_attributes(&line[KEY_TAG.len()..]);
    let method = attribute(&attributes, "METHOD")
        .unwrap_or("NONE")
        .to_ascii_uppercase();
    let uri = attribute(&attributes, "URI")
        .map(|uri| resolve_reference(base, uri))
        .transpose()?;
    // The relay never needs the IV, and the decryptor can still try sequence-derived ones.
    let iv = attribute(&attributes, "IV").and_then(|value| match parse::parse_iv(value) {
        Ok(iv) => Some(iv),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed key IV");
            None
        }
    });

    Ok(KeyRef { method, uri, iv })
}
