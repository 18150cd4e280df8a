//! Chunking and hashmap construction (C1).
//!
//! Splits a prepared (compressed/encrypted) payload into SDU-sized parts,
//! assigns each a collision-free map hash, and computes the resource digest
//! and the proof value the receiver must eventually return.

use std::io::{Read, Write};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use rand_core::{OsRng, RngCore};

use crate::config::{ChunkerConfig, MAPHASH_LEN, RANDOM_HASH_SIZE};
use crate::error::RtpError;
use crate::hash::{digest_concat, map_hash, Hash};

/// The immutable output of chunking a resource, ready to advertise.
#[derive(Debug, Clone)]
pub struct ChunkedResource {
    pub hash: Hash,
    pub expected_proof: Hash,
    pub random_hash: [u8; RANDOM_HASH_SIZE],
    pub parts: Vec<Vec<u8>>,
    pub hashmap: Vec<[u8; MAPHASH_LEN]>,
    pub flags: u8,
}

/// Compresses `data` and keeps the compressed form only if it is strictly
/// smaller than the input. Returns `(payload, compressed)`.
pub fn compress_if_smaller(data: &[u8], auto_compress: bool) -> (Vec<u8>, bool) {
    if !auto_compress || data.is_empty() {
        return (data.to_vec(), false);
    }
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    if encoder.write_all(data).is_err() {
        return (data.to_vec(), false);
    }
    match encoder.finish() {
        Ok(compressed) if compressed.len() < data.len() => (compressed, true),
        _ => (data.to_vec(), false),
    }
}

/// Reverses [`compress_if_smaller`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, RtpError> {
    let mut decoder = BzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|_| RtpError::ChunkingFailed { reason: "payload did not decompress" })?;
    Ok(out)
}

fn split_into_parts(data: &[u8], sdu: usize) -> Vec<Vec<u8>> {
    if data.is_empty() {
        return Vec::new();
    }
    data.chunks(sdu).map(|chunk| chunk.to_vec()).collect()
}

/// Builds the part list and a collision-free hashmap for `payload` (the
/// post-compression, post-encryption bytes actually placed on the wire),
/// re-rolling `random_hash` up to `config.collision_reroll_limit` times if a
/// map-hash collision is found.
///
/// `uncompressed_data` is the original input, used to compute the resource
/// hash and the expected proof per the protocol (both are always taken over
/// the uncompressed, unencrypted bytes).
pub fn chunk_resource(
    uncompressed_data: &[u8],
    payload: &[u8],
    sdu: usize,
    flags: u8,
    config: &ChunkerConfig,
) -> Result<ChunkedResource, RtpError> {
    if sdu == 0 {
        return Err(RtpError::ChunkingFailed { reason: "sdu must be non-zero" });
    }

    let parts = split_into_parts(payload, sdu);

    let mut attempt = 0u8;
    loop {
        let mut random_hash = [0u8; RANDOM_HASH_SIZE];
        OsRng.fill_bytes(&mut random_hash);

        let mut hashmap = Vec::with_capacity(parts.len());
        let mut seen = std::collections::HashSet::with_capacity(parts.len());
        let mut collided = false;
        for part in &parts {
            let mh = map_hash(part, &random_hash);
            if !seen.insert(mh) {
                collided = true;
                break;
            }
            hashmap.push(mh);
        }

        if !collided {
            let resource_hash = Hash::new(digest_concat(uncompressed_data, &random_hash));
            let expected_proof = Hash::new(digest_concat(uncompressed_data, resource_hash.as_slice()));
            return Ok(ChunkedResource {
                hash: resource_hash,
                expected_proof,
                random_hash,
                parts,
                hashmap,
                flags,
            });
        }

        attempt += 1;
        if attempt >= config.collision_reroll_limit {
            return Err(RtpError::ChunkingFailed {
                reason: "map-hash collision persisted past the re-roll limit",
            });
        }
        log::warn!("chunker: map-hash collision, re-rolling random_hash (attempt {attempt})");
    }
}

/// Convenience wrapper matching the protocol's definition of the resource
/// digest in isolation, used by the receiver to verify an assembled payload.
pub fn verify_assembled(uncompressed_data: &[u8], random_hash: &[u8; RANDOM_HASH_SIZE], expected_hash: &Hash) -> bool {
    digest_concat(uncompressed_data, random_hash) == *expected_hash.as_bytes()
}

/// `digest(assembled_data ++ hash)` - the proof value a receiver returns.
pub fn compute_proof(uncompressed_data: &[u8], resource_hash: &Hash) -> Hash {
    Hash::new(digest_concat(uncompressed_data, resource_hash.as_slice()))
}
