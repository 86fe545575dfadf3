// Segment decryption: AES-128-CBC with IV strategy probing.

use aes::Aes128;
use bytes::Bytes;
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use tracing::{debug, trace};

use super::iv::{IvStrategy, iv_candidates};
use crate::error::{Error, Result};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// MPEG-TS packets start with this byte.
pub const TS_SYNC_BYTE: u8 = 0x47;

const BLOCK: usize = 16;

/// Result of decrypting one segment.
#[derive(Debug, Clone)]
pub struct DecryptOutcome {
    pub bytes: Bytes,
    pub strategy: IvStrategy,
    /// Whether the plaintext starts with the TS sync byte
    pub verified: bool,
    /// PKCS#7 padding could not be removed and the raw blocks were kept
    pub padding_kept: bool,
}

impl DecryptOutcome {
    pub fn leading_byte(&self) -> Option<u8> {
        self.bytes.first().copied()
    }

    /// Human readable notes for the segment report.
    pub fn detail(&self) -> Option<String> {
        let mut notes = Vec::new();
        if !self.verified {
            let leading = self
                .leading_byte()
                .map(|b| format!("0x{b:02x}"))
                .unwrap_or_else(|| "none".to_string());
            notes.push(format!(
                "no IV strategy produced a sync byte, kept {} output (leading byte {leading})",
                self.strategy
            ));
        }
        if self.padding_kept {
            notes.push("invalid PKCS#7 padding, raw blocks kept".to_string());
        }
        (!notes.is_empty()).then(|| notes.join("; "))
    }
}

/// Decrypts the segments of one download session.
#[derive(Debug, Clone)]
pub struct SegmentDecryptor {
    key: [u8; 16],
    explicit_iv: Option<[u8; 16]>,
    media_sequence: Option<u64>,
    offload: bool,
}

impl SegmentDecryptor {
    pub fn new(key: [u8; 16], explicit_iv: Option<[u8; 16]>, media_sequence: Option<u64>) -> Self {
        Self {
            key,
            explicit_iv,
            media_sequence,
            offload: true,
        }
    }

    /// Run decryption inline instead of on the blocking pool.
    pub fn with_offload(mut self, offload: bool) -> Self {
        self.offload = offload;
        self
    }

    pub async fn decrypt(&self, index: usize, data: Bytes) -> Result<DecryptOutcome> {
        if !self.offload {
            return self.decrypt_sync(index, &data);
        }

        let this = self.clone();
        tokio::task::spawn_blocking(move || this.decrypt_sync(index, &data))
            .await
            .map_err(|e| Error::decryption(format!("Decryption offload task failed: {e}")))?
    }

    pub fn decrypt_sync(&self, index: usize, data: &[u8]) -> Result<DecryptOutcome> {
        if data.len() < BLOCK {
            return Err(Error::decryption(format!(
                "segment {index} is {} bytes, shorter than one AES block",
                data.len()
            )));
        }

        let candidates = iv_candidates(index, self.explicit_iv, self.media_sequence);
        let (primary_strategy, primary_iv) = candidates[0];

        // CBC: the IV only affects the first block, so probing it is enough. Sequence-derived IVs
        // differ only in their trailing bytes and agree on the leading byte.
        let first_block = &data[..BLOCK];
        let chosen = candidates
            .iter()
            .find(|(strategy, iv)| {
                let leading = first_plain_byte(&self.key, iv, first_block);
                trace!(segment = index, %strategy, leading, "Probed IV candidate");
                leading == TS_SYNC_BYTE
            })
            .copied();

        let (strategy, iv, verified) = match chosen {
            Some((strategy, iv)) => (strategy, iv, true),
            None => (primary_strategy, primary_iv, false),
        };

        let (bytes, padding_kept) = decrypt_cbc(data, &self.key, &iv)?;

        if verified && strategy != primary_strategy {
            debug!(segment = index, %strategy, "Segment decrypted with fallback IV");
        }

        Ok(DecryptOutcome {
            bytes,
            strategy,
            verified,
            padding_kept,
        })
    }
}

fn first_plain_byte(key: &[u8; 16], iv: &[u8; 16], first_block: &[u8]) -> u8 {
    let mut block = [0u8; BLOCK];
    block.copy_from_slice(first_block);
    let cipher = Aes128CbcDec::new(key.into(), iv.into());
    match cipher.decrypt_padded_mut::<NoPadding>(&mut block) {
        Ok(plain) => plain.first().copied().unwrap_or_default(),
        Err(_) => 0,
    }
}

/// Decrypt `data`, stripping PKCS#7 padding when it is valid.
///
/// Returns the plaintext and whether the padding had to be kept.
pub fn decrypt_cbc(data: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Result<(Bytes, bool)> {
    let mut buffer = data.to_vec();
    let cipher = Aes128CbcDec::new(key.into(), iv.into());
    let unpadded = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map(|plain| plain.len());
    if let Ok(len) = unpadded {
        buffer.truncate(len);
        return Ok((Bytes::from(buffer), false));
    }

    // Unpadding failed (or the tail is not block aligned): decrypt whole blocks as-is.
    let aligned = data.len() - data.len() % BLOCK;
    if aligned == 0 {
        return Err(Error::decryption("ciphertext shorter than one block"));
    }
    let mut buffer = data[..aligned].to_vec();
    let cipher = Aes128CbcDec::new(key.into(), iv.into());
    let len = cipher
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|e| Error::decryption(format!("Decryption failed: {e}")))?
        .len();
    buffer.truncate(len);
    Ok((Bytes::from(buffer), true))
}
