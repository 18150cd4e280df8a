use tokio::time::{Duration, Instant};

use crate::advertisement::{ResourceAdvertisement, ResourceHashUpdate, ResourceProof, ResourceRequest};
use crate::chunker::{compute_proof, decompress, verify_assembled};
use crate::config::{HASHMAP_MAX_LEN, MAPHASH_LEN, WINDOW, WINDOW_MAX, WINDOW_MIN};
use crate::error::RtpError;
use crate::hash::{map_hash, Hash, RANDOM_HASH_SIZE};
use crate::link::Link;
use crate::packet::{Packet, PacketContext, PacketType};

use super::{ResourceProgress, ResourceStatus};

/// Outcome of feeding one inbound part into a receiver.
pub enum PartOutcome {
    /// The part's map hash matched no known, unfilled slot.
    NoMatch,
    /// Stored, but the resource is not yet fully received.
    Stored,
    /// The resource just finished assembling and validated; `data` is the
    /// recovered plaintext and `proof` is ready to transmit.
    Complete { data: Vec<u8>, proof: ResourceProof },
    /// The resource finished assembling but failed hash verification.
    Corrupt,
}

/// The accepting side of a resource transfer.
#[derive(Debug, Clone)]
pub struct ResourceReceiver {
    pub resource_hash: Hash,
    random_hash: [u8; RANDOM_HASH_SIZE],
    flags: u8,
    parts: Vec<Option<Vec<u8>>>,
    hashmap: Vec<Option<[u8; MAPHASH_LEN]>>,
    hashmap_height: usize,
    received_count: usize,
    received_bytes: u64,
    total_bytes: u64,
    /// Number of parts requested in the most recent window that have not yet
    /// arrived. Distinct from "known but not yet requested" - a resource
    /// with more parts than fit in one window still has plenty of the
    /// latter without anything outstanding.
    outstanding_parts: usize,
    waiting_for_hmu: bool,
    window: usize,
    pub status: ResourceStatus,
    pub last_activity: Instant,
    pub req_sent: Option<Instant>,
    pub req_resp: Option<Instant>,
    pub rtt: Option<Duration>,
    pub retries_left: u8,
}

impl ResourceReceiver {
    /// Accepts an advertisement, allocating slots and installing its
    /// hashmap segment (always segment 0).
    pub fn accept(adv: &ResourceAdvertisement) -> Self {
        let total_parts = adv.total_parts as usize;
        let now = Instant::now();
        let mut receiver = Self {
            resource_hash: adv.hash,
            random_hash: adv.random_hash,
            flags: adv.flags,
            parts: vec![None; total_parts],
            hashmap: vec![None; total_parts],
            hashmap_height: 0,
            received_count: 0,
            received_bytes: 0,
            total_bytes: adv.uncompressed_size,
            outstanding_parts: 0,
            waiting_for_hmu: false,
            window: WINDOW,
            status: ResourceStatus::Transferring,
            last_activity: now,
            req_sent: None,
            req_resp: None,
            rtt: None,
            retries_left: crate::config::MAX_RETRIES,
        };
        receiver.apply_hashmap_segment(0, &adv.hashmap);
        if total_parts == 0 {
            receiver.status = ResourceStatus::Assembling;
        }
        receiver
    }

    fn apply_hashmap_segment(&mut self, segment: usize, bytes: &[u8]) {
        let count = bytes.len() / MAPHASH_LEN;
        for i in 0..count {
            let start = i * MAPHASH_LEN;
            let mut entry = [0u8; MAPHASH_LEN];
            entry.copy_from_slice(&bytes[start..start + MAPHASH_LEN]);
            let idx = segment * HASHMAP_MAX_LEN + i;
            if idx < self.hashmap.len() && self.hashmap[idx].is_none() {
                self.hashmap[idx] = Some(entry);
                self.hashmap_height += 1;
            }
        }
    }

    /// Installs a hashmap segment delivered out-of-band, clearing the
    /// "waiting for hashmap update" flag and allowing `build_request` to
    /// make progress again.
    pub fn handle_hash_update(&mut self, update: &ResourceHashUpdate) {
        if update.resource_hash != self.resource_hash {
            return;
        }
        self.apply_hashmap_segment(update.segment as usize, &update.hashmap);
        self.waiting_for_hmu = false;
    }

    /// Builds the next window-bounded request. When the known hashmap runs
    /// out before the window is filled, sets the exhaustion flag and anchors
    /// on the last known map hash so the sender replies with the next
    /// segment instead of more parts.
    pub fn build_request(&self) -> ResourceRequest {
        let mut requested = Vec::new();
        let mut last_known = None;
        let mut hashmap_exhausted = false;

        for (idx, entry) in self.hashmap.iter().enumerate() {
            match entry {
                Some(hash) => {
                    last_known = Some(*hash);
                    if self.parts[idx].is_none() {
                        requested.push(*hash);
                        if requested.len() >= self.window {
                            break;
                        }
                    }
                }
                None => {
                    hashmap_exhausted = true;
                    break;
                }
            }
        }

        ResourceRequest {
            hashmap_exhausted,
            last_map_hash: if hashmap_exhausted { last_known } else { None },
            resource_hash: self.resource_hash,
            requested_hashes: requested,
        }
    }

    /// Records that `request` was just (re)sent, arming `outstanding_parts`
    /// to the number of parts it actually asked for.
    pub fn mark_request(&mut self, now: Instant, request: &ResourceRequest) {
        self.req_sent = Some(now);
        self.waiting_for_hmu = request.hashmap_exhausted;
        self.outstanding_parts = request.requested_hashes.len();
    }

    pub fn is_waiting_for_hmu(&self) -> bool {
        self.waiting_for_hmu
    }

    /// Feeds one inbound data part. Decryption happens through the link;
    /// decompression and hash verification are local and synchronous.
    pub async fn handle_part(&mut self, part: &[u8], link: &dyn Link) -> Result<PartOutcome, RtpError> {
        let mh = map_hash(part, &self.random_hash);
        let Some(index) = self.hashmap.iter().position(|entry| entry.as_ref() == Some(&mh)) else {
            return Ok(PartOutcome::NoMatch);
        };

        let now = Instant::now();
        if self.parts[index].is_none() {
            self.parts[index] = Some(part.to_vec());
            self.received_count += 1;
            self.received_bytes = self.received_bytes.saturating_add(part.len() as u64);
            self.last_activity = now;
            self.retries_left = crate::config::MAX_RETRIES;
            self.outstanding_parts = self.outstanding_parts.saturating_sub(1);
            if self.rtt.is_none() {
                if let Some(req_sent) = self.req_sent {
                    self.rtt = Some(now.saturating_duration_since(req_sent));
                }
            }
        }

        if self.outstanding_parts == 0 && self.received_count < self.parts.len() {
            self.window = (self.window + 1).min(WINDOW_MAX).max(WINDOW_MIN);
        }

        if self.received_count != self.parts.len() || self.parts.is_empty() {
            return Ok(PartOutcome::Stored);
        }

        self.status = ResourceStatus::Assembling;
        self.assemble(link).await
    }

    /// Number of parts requested in the current window that have not yet
    /// arrived. The manager calls [`Self::build_request`] again once this
    /// reaches zero and the resource is not yet fully received.
    pub fn outstanding_remaining(&self) -> usize {
        self.outstanding_parts
    }

    /// Drives assembly directly for a resource with no parts to request
    /// (`accept` already moved such a resource straight to `Assembling`).
    pub async fn assemble_now(&mut self, link: &dyn Link) -> Result<PartOutcome, RtpError> {
        self.assemble(link).await
    }

    async fn assemble(&mut self, link: &dyn Link) -> Result<PartOutcome, RtpError> {
        let mut stream = Vec::with_capacity(self.received_bytes as usize);
        for part in &self.parts {
            match part {
                Some(bytes) => stream.extend_from_slice(bytes),
                None => return Ok(PartOutcome::Stored),
            }
        }

        let decrypted = if self.encrypted() {
            link.decrypt(&stream).await?
        } else {
            stream
        };

        let assembled = if self.compressed() {
            decompress(&decrypted)?
        } else {
            decrypted
        };

        if verify_assembled(&assembled, &self.random_hash, &self.resource_hash) {
            self.status = ResourceStatus::Complete;
            let proof = ResourceProof {
                resource_hash: self.resource_hash,
                proof: compute_proof(&assembled, &self.resource_hash),
            };
            Ok(PartOutcome::Complete { data: assembled, proof })
        } else {
            self.status = ResourceStatus::Corrupt;
            Ok(PartOutcome::Corrupt)
        }
    }

    fn encrypted(&self) -> bool {
        (self.flags & crate::config::FLAG_ENCRYPTED) != 0
    }

    fn compressed(&self) -> bool {
        (self.flags & crate::config::FLAG_COMPRESSED) != 0
    }

    pub fn progress(&self) -> ResourceProgress {
        ResourceProgress {
            received_bytes: self.received_bytes,
            total_bytes: self.total_bytes,
            received_parts: self.received_count,
            total_parts: self.parts.len(),
        }
    }

    pub fn cancel(&mut self) {
        if !self.status.is_terminal() {
            self.status = ResourceStatus::Failed;
        }
    }

    /// Raw bytes to send as an initiator-cancel / proof-building helper in
    /// tests; not used by the FSM itself.
    pub fn request_packet(&self, request: &ResourceRequest) -> Packet {
        Packet::new(PacketContext::ResourceRequest, PacketType::Data, request.encode())
    }
}
