//! AES-128 key handling and segment decryption.

mod decryptor;
mod iv;
mod key;

pub use decryptor::{DecryptOutcome, SegmentDecryptor, TS_SYNC_BYTE, decrypt_cbc};
pub use iv::{IvStrategy, iv_candidates, sequence_iv};
pub use key::{EncryptionKey, KeyFetcher, require_aes_key};
