//! Wire codec for the advertisement, hashmap-update, request, and proof
//! frames (C2). Each function is a pure transform between an in-memory
//! struct and bit-exact wire bytes; none of them touch link or resource
//! state.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::config::{HASHMAP_IS_EXHAUSTED, HASHMAP_IS_NOT_EXHAUSTED, MAPHASH_LEN};
use crate::error::RtpError;
use crate::hash::{copy_fixed, copy_hash, Hash, HASH_SIZE, RANDOM_HASH_SIZE};

/// The initial frame announcing a resource and its first hashmap segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAdvertisement {
    pub transfer_size: u64,
    pub uncompressed_size: u64,
    pub total_parts: u32,
    pub hash: Hash,
    pub random_hash: [u8; RANDOM_HASH_SIZE],
    pub flags: u8,
    pub hashmap: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResourceAdvertisementFrame {
    #[serde(rename = "t")]
    transfer_size: u64,
    #[serde(rename = "d")]
    uncompressed_size: u64,
    #[serde(rename = "n")]
    total_parts: u32,
    #[serde(rename = "h", with = "serde_bytes")]
    hash: Vec<u8>,
    #[serde(rename = "r", with = "serde_bytes")]
    random_hash: Vec<u8>,
    #[serde(rename = "f")]
    flags: u8,
    #[serde(rename = "m", with = "serde_bytes")]
    hashmap: Vec<u8>,
}

impl ResourceAdvertisement {
    pub fn pack(&self) -> Result<Vec<u8>, RtpError> {
        let frame = ResourceAdvertisementFrame {
            transfer_size: self.transfer_size,
            uncompressed_size: self.uncompressed_size,
            total_parts: self.total_parts,
            hash: self.hash.as_slice().to_vec(),
            random_hash: self.random_hash.to_vec(),
            flags: self.flags,
            hashmap: self.hashmap.clone(),
        };
        rmp_serde::to_vec_named(&frame)
            .map_err(|_| RtpError::AdvertisementMalformed { reason: "failed to encode advertisement" })
    }

    pub fn unpack(data: &[u8]) -> Result<Self, RtpError> {
        let frame: ResourceAdvertisementFrame = rmp_serde::from_slice(data)
            .map_err(|_| RtpError::AdvertisementMalformed { reason: "failed to decode advertisement" })?;
        let hash = Hash::new(copy_hash(&frame.hash)?);
        let random_hash = copy_fixed::<RANDOM_HASH_SIZE>(&frame.random_hash)?;
        Ok(Self {
            transfer_size: frame.transfer_size,
            uncompressed_size: frame.uncompressed_size,
            total_parts: frame.total_parts,
            hash,
            random_hash,
            flags: frame.flags,
            hashmap: frame.hashmap,
        })
    }

    pub fn encrypted(&self) -> bool {
        (self.flags & crate::config::FLAG_ENCRYPTED) != 0
    }

    pub fn compressed(&self) -> bool {
        (self.flags & crate::config::FLAG_COMPRESSED) != 0
    }
}

/// A part request. `HASHMAP_IS_EXHAUSTED` means the sender should reply with
/// a [`ResourceHashUpdate`] for the segment following `last_map_hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub hashmap_exhausted: bool,
    pub last_map_hash: Option<[u8; MAPHASH_LEN]>,
    pub resource_hash: Hash,
    pub requested_hashes: Vec<[u8; MAPHASH_LEN]>,
}

impl ResourceRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + MAPHASH_LEN + HASH_SIZE + self.requested_hashes.len() * MAPHASH_LEN,
        );
        if self.hashmap_exhausted {
            out.push(HASHMAP_IS_EXHAUSTED);
            let anchor = self.last_map_hash.unwrap_or([0u8; MAPHASH_LEN]);
            out.extend_from_slice(&anchor);
        } else {
            out.push(HASHMAP_IS_NOT_EXHAUSTED);
        }
        out.extend_from_slice(self.resource_hash.as_slice());
        for hash in &self.requested_hashes {
            out.extend_from_slice(hash);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, RtpError> {
        if data.is_empty() {
            return Err(RtpError::RequestMalformed { reason: "empty request frame" });
        }
        let hashmap_exhausted = data[0] == HASHMAP_IS_EXHAUSTED;
        let mut offset = 1;

        let last_map_hash = if hashmap_exhausted {
            if data.len() < offset + MAPHASH_LEN {
                return Err(RtpError::RequestMalformed { reason: "missing anchor map hash" });
            }
            let mut anchor = [0u8; MAPHASH_LEN];
            anchor.copy_from_slice(&data[offset..offset + MAPHASH_LEN]);
            offset += MAPHASH_LEN;
            Some(anchor)
        } else {
            None
        };

        if data.len() < offset + HASH_SIZE {
            return Err(RtpError::RequestMalformed { reason: "missing resource hash" });
        }
        let resource_hash = Hash::new(copy_hash(&data[offset..offset + HASH_SIZE])?);
        offset += HASH_SIZE;

        let remaining = &data[offset..];
        if remaining.len() % MAPHASH_LEN != 0 {
            return Err(RtpError::RequestMalformed { reason: "trailing bytes after map hashes" });
        }
        let requested_hashes = remaining
            .chunks(MAPHASH_LEN)
            .map(|chunk| {
                let mut entry = [0u8; MAPHASH_LEN];
                entry.copy_from_slice(chunk);
                entry
            })
            .collect();

        Ok(Self { hashmap_exhausted, last_map_hash, resource_hash, requested_hashes })
    }
}

/// A hashmap segment delivered on demand once the initial advertisement's
/// segment has been exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHashUpdate {
    pub resource_hash: Hash,
    pub segment: u32,
    pub hashmap: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResourceHashUpdateFrame(u32, #[serde(with = "serde_bytes")] ByteBuf);

impl ResourceHashUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, RtpError> {
        let mut out = Vec::with_capacity(HASH_SIZE + self.hashmap.len() + 8);
        out.extend_from_slice(self.resource_hash.as_slice());
        let frame = ResourceHashUpdateFrame(self.segment, ByteBuf::from(self.hashmap.clone()));
        let payload = rmp_serde::to_vec(&frame)
            .map_err(|_| RtpError::HashmapUpdateMalformed { reason: "failed to encode hashmap update" })?;
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, RtpError> {
        if data.len() < HASH_SIZE {
            return Err(RtpError::HashmapUpdateMalformed { reason: "frame shorter than a resource hash" });
        }
        let resource_hash = Hash::new(copy_hash(&data[..HASH_SIZE])?);
        let frame: ResourceHashUpdateFrame = rmp_serde::from_slice(&data[HASH_SIZE..])
            .map_err(|_| RtpError::HashmapUpdateMalformed { reason: "failed to decode segment payload" })?;
        Ok(Self { resource_hash, segment: frame.0, hashmap: frame.1.into_vec() })
    }
}

/// The cryptographic receipt: `resource_hash ++ digest(assembled_data ++ hash)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceProof {
    pub resource_hash: Hash,
    pub proof: Hash,
}

impl ResourceProof {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HASH_SIZE * 2);
        out.extend_from_slice(self.resource_hash.as_slice());
        out.extend_from_slice(self.proof.as_slice());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, RtpError> {
        if data.len() != HASH_SIZE * 2 {
            return Err(RtpError::ProofMalformed { reason: "proof frame has wrong width" });
        }
        let resource_hash = Hash::new(copy_hash(&data[..HASH_SIZE])?);
        let proof = Hash::new(copy_hash(&data[HASH_SIZE..])?);
        Ok(Self { resource_hash, proof })
    }
}

/// Splits a full hashmap into `HASHMAP_MAX_LEN`-sized segments of raw bytes,
/// as delivered by the advertisement (segment 0) and subsequent hashmap
/// updates (segment 1, 2, ...).
pub fn slice_hashmap_segment(hashmap: &[[u8; MAPHASH_LEN]], segment: usize) -> Vec<u8> {
    let start = segment * crate::config::HASHMAP_MAX_LEN;
    if start >= hashmap.len() {
        return Vec::new();
    }
    let end = (start + crate::config::HASHMAP_MAX_LEN).min(hashmap.len());
    hashmap[start..end].iter().flat_map(|h| h.iter().copied()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertisement_round_trips() {
        let adv = ResourceAdvertisement {
            transfer_size: 1200,
            uncompressed_size: 1000,
            total_parts: 3,
            hash: Hash::new([1u8; HASH_SIZE]),
            random_hash: [2, 3, 4, 5],
            flags: crate::config::FLAG_COMPRESSED,
            hashmap: vec![0u8; 12],
        };
        let packed = adv.pack().unwrap();
        let unpacked = ResourceAdvertisement::unpack(&packed).unwrap();
        assert_eq!(adv, unpacked);
        assert!(unpacked.compressed());
        assert!(!unpacked.encrypted());
    }

    #[test]
    fn request_round_trips_without_anchor() {
        let req = ResourceRequest {
            hashmap_exhausted: false,
            last_map_hash: None,
            resource_hash: Hash::new([9u8; HASH_SIZE]),
            requested_hashes: vec![[1, 2, 3, 4], [5, 6, 7, 8]],
        };
        let encoded = req.encode();
        let decoded = ResourceRequest::decode(&encoded).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn request_round_trips_with_anchor() {
        let req = ResourceRequest {
            hashmap_exhausted: true,
            last_map_hash: Some([9, 9, 9, 9]),
            resource_hash: Hash::new([3u8; HASH_SIZE]),
            requested_hashes: vec![],
        };
        let encoded = req.encode();
        let decoded = ResourceRequest::decode(&encoded).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn request_decode_rejects_trailing_bytes() {
        let mut bytes = vec![HASHMAP_IS_NOT_EXHAUSTED];
        bytes.extend_from_slice(&[0u8; HASH_SIZE]);
        bytes.push(1);
        bytes.push(2);
        assert!(ResourceRequest::decode(&bytes).is_err());
    }

    #[test]
    fn hash_update_round_trips() {
        let update = ResourceHashUpdate {
            resource_hash: Hash::new([4u8; HASH_SIZE]),
            segment: 2,
            hashmap: vec![1, 2, 3, 4, 5, 6, 7, 8],
        };
        let encoded = update.encode().unwrap();
        let decoded = ResourceHashUpdate::decode(&encoded).unwrap();
        assert_eq!(update, decoded);
    }

    #[test]
    fn proof_round_trips() {
        let proof = ResourceProof {
            resource_hash: Hash::new([5u8; HASH_SIZE]),
            proof: Hash::new([6u8; HASH_SIZE]),
        };
        let encoded = proof.encode();
        let decoded = ResourceProof::decode(&encoded).unwrap();
        assert_eq!(proof, decoded);
    }

    #[test]
    fn slice_hashmap_segment_splits_on_boundary() {
        let hashmap: Vec<[u8; MAPHASH_LEN]> = (0..200u32).map(|i| i.to_be_bytes()).collect();
        let seg0 = slice_hashmap_segment(&hashmap, 0);
        let seg1 = slice_hashmap_segment(&hashmap, 1);
        let seg2 = slice_hashmap_segment(&hashmap, 2);
        assert_eq!(seg0.len(), crate::config::HASHMAP_MAX_LEN * MAPHASH_LEN);
        assert_eq!(seg1.len(), crate::config::HASHMAP_MAX_LEN * MAPHASH_LEN);
        assert_eq!(seg2.len(), (200 - 2 * crate::config::HASHMAP_MAX_LEN) * MAPHASH_LEN);
    }
}
