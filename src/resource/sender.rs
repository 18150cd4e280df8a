use std::collections::HashSet;

use tokio::time::{Duration, Instant};

use crate::advertisement::{
    slice_hashmap_segment, ResourceAdvertisement, ResourceHashUpdate, ResourceProof, ResourceRequest,
};
use crate::chunker::chunk_resource;
use crate::config::{ChunkerConfig, HASHMAP_MAX_LEN, MAPHASH_LEN};
use crate::error::RtpError;
use crate::hash::{Hash, RANDOM_HASH_SIZE};
use crate::link::Link;
use crate::packet::{Packet, PacketContext, PacketType};

use super::ResourceStatus;

/// The originating side of a resource transfer. Owns the prepared parts and
/// serves requests against them until a matching proof is validated.
#[derive(Debug, Clone)]
pub struct ResourceSender {
    pub resource_hash: Hash,
    random_hash: [u8; RANDOM_HASH_SIZE],
    parts: Vec<Vec<u8>>,
    map_hashes: Vec<[u8; MAPHASH_LEN]>,
    expected_proof: Hash,
    transfer_size: u64,
    uncompressed_size: u64,
    flags: u8,
    sent_indices: HashSet<usize>,
    pub status: ResourceStatus,
    pub adv_sent: Option<Instant>,
    pub last_activity: Instant,
    pub last_part_sent: Option<Instant>,
    pub rtt: Option<Duration>,
    pub retries_left: u8,
}

impl ResourceSender {
    /// Prepares a resource from raw bytes: compresses (if it helps),
    /// encrypts through the link (if the link wants it), splits into parts,
    /// and builds a collision-free hashmap. Status starts at `None`; the
    /// caller (the resource manager) drives the `None -> Queued ->
    /// Advertised` admission sequence.
    pub async fn new(
        uncompressed_data: &[u8],
        link: &dyn Link,
        sdu: usize,
        chunker_config: &ChunkerConfig,
    ) -> Result<Self, RtpError> {
        let (mut payload, compressed) =
            crate::chunker::compress_if_smaller(uncompressed_data, chunker_config.auto_compress);

        let mut flags = 0u8;
        if compressed {
            flags |= crate::config::FLAG_COMPRESSED;
        }
        if !link.encryption_disabled() {
            payload = link.encrypt(&payload).await?;
            flags |= crate::config::FLAG_ENCRYPTED;
        }

        let chunked = chunk_resource(uncompressed_data, &payload, sdu, flags, chunker_config)?;

        let transfer_size = chunked.parts.iter().map(|p| p.len() as u64).sum();
        let now = Instant::now();

        Ok(Self {
            resource_hash: chunked.hash,
            random_hash: chunked.random_hash,
            parts: chunked.parts,
            map_hashes: chunked.hashmap,
            expected_proof: chunked.expected_proof,
            transfer_size,
            uncompressed_size: uncompressed_data.len() as u64,
            flags: chunked.flags,
            sent_indices: HashSet::new(),
            status: ResourceStatus::None,
            adv_sent: None,
            last_activity: now,
            last_part_sent: None,
            rtt: None,
            retries_left: crate::config::MAX_RETRIES,
        })
    }

    pub fn total_parts(&self) -> usize {
        self.parts.len()
    }

    /// A receiver-shaped view of how much of this resource has been served,
    /// for [`crate::link::ResourceObserver::progress`] callbacks.
    pub fn progress(&self) -> super::ResourceProgress {
        let sent_bytes = self.sent_indices.iter().map(|&i| self.parts[i].len() as u64).sum();
        super::ResourceProgress {
            received_bytes: sent_bytes,
            total_bytes: self.uncompressed_size,
            received_parts: self.sent_indices.len(),
            total_parts: self.parts.len(),
        }
    }

    /// The hash of the proof packet the peer must eventually deliver. Known
    /// in advance because the proof payload is fully determined by
    /// `(resource_hash, expected_proof)`; used by the watchdog to ask the
    /// transport for a previously-witnessed copy when the proof is overdue.
    pub fn expected_proof_packet_hash(&self) -> Hash {
        let proof = ResourceProof { resource_hash: self.resource_hash, proof: self.expected_proof };
        Hash::new(crate::hash::digest(&proof.encode()))
    }

    /// Builds the advertisement carrying hashmap `segment` (0 for the first).
    pub fn advertisement(&self, segment: usize) -> ResourceAdvertisement {
        ResourceAdvertisement {
            transfer_size: self.transfer_size,
            uncompressed_size: self.uncompressed_size,
            total_parts: self.parts.len() as u32,
            hash: self.resource_hash,
            random_hash: self.random_hash,
            flags: self.flags,
            hashmap: slice_hashmap_segment(&self.map_hashes, segment),
        }
    }

    /// Marks the advertisement as sent and transitions `Queued -> Advertised`.
    pub fn mark_advertised(&mut self, now: Instant) {
        self.status = ResourceStatus::Advertised;
        self.adv_sent = Some(now);
        self.last_activity = now;
    }

    pub fn mark_queued(&mut self) {
        self.status = ResourceStatus::Queued;
    }

    /// Re-arms the advertisement retry and returns the packet to resend,
    /// decrementing `retries_left`. `None` once retries are exhausted.
    pub fn resend_advertisement(&mut self, now: Instant) -> Option<ResourceAdvertisement> {
        if self.retries_left == 0 {
            return None;
        }
        self.retries_left -= 1;
        self.adv_sent = Some(now);
        Some(self.advertisement(0))
    }

    /// Services an inbound request, returning the packets to transmit.
    pub fn handle_request(
        &mut self,
        request: &ResourceRequest,
        now: Instant,
    ) -> Result<Vec<Packet>, RtpError> {
        if request.resource_hash != self.resource_hash {
            return Ok(Vec::new());
        }

        if self.rtt.is_none() {
            if let Some(adv_sent) = self.adv_sent {
                self.rtt = Some(now.saturating_duration_since(adv_sent));
            }
        }

        let mut packets = Vec::with_capacity(request.requested_hashes.len() + 1);
        for map_hash in &request.requested_hashes {
            let Some(index) = self.map_hashes.iter().position(|entry| entry == map_hash) else {
                continue;
            };
            if self.sent_indices.insert(index) {
                log::debug!("resource {}: sending part {index}", self.resource_hash);
            } else {
                log::debug!("resource {}: resending part {index}", self.resource_hash);
            }
            packets.push(Packet::new(
                PacketContext::Resource,
                PacketType::Data,
                self.parts[index].clone(),
            ));
            self.last_part_sent = Some(now);
        }

        if request.hashmap_exhausted {
            if let Some(anchor) = request.last_map_hash {
                let Some(anchor_index) = self.map_hashes.iter().position(|entry| *entry == anchor)
                else {
                    self.status = ResourceStatus::Failed;
                    return Err(RtpError::SequencingError { segment: 0, anchor_index: 0 });
                };
                // The anchor must be the last map hash of its segment, or the
                // receiver and sender disagree about where segments end.
                if anchor_index % HASHMAP_MAX_LEN != HASHMAP_MAX_LEN - 1 {
                    self.status = ResourceStatus::Failed;
                    return Err(RtpError::SequencingError {
                        segment: (anchor_index / HASHMAP_MAX_LEN) as u32,
                        anchor_index,
                    });
                }
                let next_segment = anchor_index / HASHMAP_MAX_LEN + 1;
                if next_segment * HASHMAP_MAX_LEN < self.map_hashes.len() {
                    let update = ResourceHashUpdate {
                        resource_hash: self.resource_hash,
                        segment: next_segment as u32,
                        hashmap: slice_hashmap_segment(&self.map_hashes, next_segment),
                    };
                    let payload = update.encode()?;
                    packets.push(Packet::new(PacketContext::ResourceHashUpdate, PacketType::Data, payload));
                }
            }
        }

        if matches!(self.status, ResourceStatus::Advertised | ResourceStatus::Transferring) {
            self.status = ResourceStatus::Transferring;
        }
        self.last_activity = now;
        self.retries_left = crate::config::MAX_RETRIES;

        if self.sent_indices.len() == self.parts.len() && !self.parts.is_empty() {
            self.status = ResourceStatus::AwaitingProof;
            self.last_part_sent = Some(now);
        } else if self.parts.is_empty() {
            // Zero-part resource: nothing to serve, go straight to awaiting proof.
            self.status = ResourceStatus::AwaitingProof;
            self.last_part_sent = Some(now);
        }

        Ok(packets)
    }

    /// Validates an inbound proof. Transitions to `Complete` on match.
    pub fn handle_proof(&mut self, proof: &ResourceProof) -> bool {
        if proof.resource_hash != self.resource_hash {
            return false;
        }
        if proof.proof.as_bytes() == self.expected_proof.as_bytes() {
            self.status = ResourceStatus::Complete;
            true
        } else {
            false
        }
    }

    /// Aborts the transfer locally, short-circuiting any further service.
    pub fn cancel(&mut self) {
        if !self.status.is_terminal() {
            self.status = ResourceStatus::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::tests_support::RecordingLink;

    #[tokio::test]
    async fn new_builds_advertisement_matching_data_size() {
        let link = RecordingLink::new(false);
        let data = vec![7u8; 1000];
        let sender = ResourceSender::new(&data, &link, 464, &ChunkerConfig::default()).await.unwrap();
        let adv = sender.advertisement(0);
        assert_eq!(adv.uncompressed_size, 1000);
        assert_eq!(adv.total_parts as usize, sender.total_parts());
    }

    #[tokio::test]
    async fn handle_request_transitions_to_awaiting_proof_when_all_parts_sent() {
        let link = RecordingLink::new(false);
        let data = vec![1u8; 10];
        let mut sender = ResourceSender::new(&data, &link, 4, &ChunkerConfig::default()).await.unwrap();
        sender.mark_queued();
        sender.mark_advertised(Instant::now());

        let map_hashes: Vec<_> = sender.map_hashes.clone();
        let request = ResourceRequest {
            hashmap_exhausted: false,
            last_map_hash: None,
            resource_hash: sender.resource_hash,
            requested_hashes: map_hashes,
        };
        let packets = sender.handle_request(&request, Instant::now()).unwrap();
        assert_eq!(packets.len(), sender.total_parts());
        assert_eq!(sender.status, ResourceStatus::AwaitingProof);
    }

    #[tokio::test]
    async fn handle_proof_requires_matching_resource_hash() {
        let link = RecordingLink::new(false);
        let data = vec![2u8; 10];
        let mut sender = ResourceSender::new(&data, &link, 4, &ChunkerConfig::default()).await.unwrap();
        let wrong = ResourceProof { resource_hash: Hash::new([0u8; 32]), proof: Hash::new([0u8; 32]) };
        assert!(!sender.handle_proof(&wrong));
        assert_ne!(sender.status, ResourceStatus::Complete);
    }
}
