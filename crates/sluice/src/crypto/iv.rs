use std::fmt;

/// How an IV candidate was derived for a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IvStrategy {
    /// `IV=` attribute of the key tag
    Explicit,
    /// `index + 1`
    OneBasedSequence,
    /// `index`
    ZeroBasedIndex,
    /// `EXT-X-MEDIA-SEQUENCE + index`
    MediaSequence,
}

impl fmt::Display for IvStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Explicit => "explicit",
            Self::OneBasedSequence => "one-based sequence",
            Self::ZeroBasedIndex => "zero-based index",
            Self::MediaSequence => "media sequence",
        };
        f.write_str(name)
    }
}

/// Big-endian sequence number in a zeroed 16-byte block.
pub fn sequence_iv(sequence: u64) -> [u8; 16] {
    u128::from(sequence).to_be_bytes()
}

/// IV candidates for the segment at `index`, in the order they are tried.
///
/// The first entry is the primary strategy whose output is kept when no candidate passes the
/// structural check. Candidates producing an IV already in the list are skipped.
pub fn iv_candidates(
    index: usize,
    explicit: Option<[u8; 16]>,
    media_sequence: Option<u64>,
) -> Vec<(IvStrategy, [u8; 16])> {
    let index = index as u64;
    let mut candidates: Vec<(IvStrategy, [u8; 16])> = Vec::with_capacity(4);

    let mut push = |strategy: IvStrategy, iv: [u8; 16]| {
        if !candidates.iter().any(|(_, existing)| *existing == iv) {
            candidates.push((strategy, iv));
        }
    };

    if let Some(iv) = explicit {
        push(IvStrategy::Explicit, iv);
    }
    push(IvStrategy::OneBasedSequence, sequence_iv(index + 1));
    push(IvStrategy::ZeroBasedIndex, sequence_iv(index));
    if let Some(sequence) = media_sequence {
        push(
            IvStrategy::MediaSequence,
            sequence_iv(sequence.saturating_add(index)),
        );
    }

    candidates
}
