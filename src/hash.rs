use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::RtpError;

/// Full digest width used throughout the resource transfer protocol.
pub const HASH_SIZE: usize = 32;

/// 4-byte nonce mixed into part-hash derivation to break collisions across sessions.
pub const RANDOM_HASH_SIZE: usize = 4;

/// 4-byte prefix of a part digest used to address parts without revealing order.
pub const MAPHASH_LEN: usize = 4;

/// A full-width resource digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn new_from_slice(data: &[u8]) -> Result<Self, RtpError> {
        Ok(Self(copy_hash(data)?))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_hex_string(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex_string())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex_string())
    }
}

/// Computes the full digest of `data`.
pub fn digest(data: &[u8]) -> [u8; HASH_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut buf = [0u8; HASH_SIZE];
    buf.copy_from_slice(&out);
    buf
}

/// Computes `digest(a ++ b)` without an intermediate allocation.
pub fn digest_concat(a: &[u8], b: &[u8]) -> [u8; HASH_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    let out = hasher.finalize();
    let mut buf = [0u8; HASH_SIZE];
    buf.copy_from_slice(&out);
    buf
}

/// `digest(part ++ random_hash)[:MAPHASH_LEN]` - the content address of a part.
pub fn map_hash(part: &[u8], random_hash: &[u8; RANDOM_HASH_SIZE]) -> [u8; MAPHASH_LEN] {
    let full = digest_concat(part, random_hash);
    let mut out = [0u8; MAPHASH_LEN];
    out.copy_from_slice(&full[..MAPHASH_LEN]);
    out
}

pub fn copy_hash(data: &[u8]) -> Result<[u8; HASH_SIZE], RtpError> {
    if data.len() != HASH_SIZE {
        return Err(RtpError::AdvertisementMalformed {
            reason: "hash field has wrong width",
        });
    }
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(data);
    Ok(out)
}

pub fn copy_fixed<const N: usize>(data: &[u8]) -> Result<[u8; N], RtpError> {
    if data.len() != N {
        return Err(RtpError::AdvertisementMalformed {
            reason: "fixed-width field has wrong length",
        });
    }
    let mut out = [0u8; N];
    out.copy_from_slice(data);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let h = Hash::new([7u8; HASH_SIZE]);
        let hex = h.to_hex_string();
        let decoded = hex::decode(&hex).unwrap();
        assert_eq!(decoded, h.as_slice());
    }

    #[test]
    fn map_hash_is_deterministic() {
        let random_hash = [1, 2, 3, 4];
        let a = map_hash(b"hello", &random_hash);
        let b = map_hash(b"hello", &random_hash);
        assert_eq!(a, b);
    }

    #[test]
    fn map_hash_changes_with_random_hash() {
        let a = map_hash(b"hello", &[1, 2, 3, 4]);
        let b = map_hash(b"hello", &[5, 6, 7, 8]);
        assert_ne!(a, b);
    }

    #[test]
    fn copy_hash_rejects_wrong_width() {
        assert!(copy_hash(&[0u8; 10]).is_err());
    }
}
