use async_trait::async_trait;
use tokio::time::Duration;

use crate::error::RtpError;
use crate::hash::Hash;
use crate::packet::Packet;

/// Coarse link lifecycle state, mirrored from the status values a resource
/// needs to reason about (whether it is still worth sending an ICL on cancel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Pending,
    Handshake,
    Active,
    Stale,
    Closed,
}

/// The narrow contract a resource transfer needs from its carrying link.
/// A concrete implementation owns the actual handshake, packet framing, and
/// physical-interface plumbing; none of that is this crate's concern.
#[async_trait]
pub trait Link: Send + Sync {
    /// Whether encryption is unavailable/disabled on this link.
    fn encryption_disabled(&self) -> bool;

    /// Encrypts `plaintext` with the link's current symmetric context.
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, RtpError>;

    /// Decrypts `ciphertext` with the link's current symmetric context.
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, RtpError>;

    /// Whether the link currently admits a new outgoing resource.
    fn ready_for_new_resource(&self) -> bool;

    /// Registers a resource this link is now sending.
    fn register_outgoing_resource(&self, resource_hash: Hash);

    /// Registers a resource this link is now receiving.
    fn register_incoming_resource(&self, resource_hash: Hash);

    /// Unregisters an outgoing resource that has been cancelled.
    fn cancel_outgoing_resource(&self, resource_hash: Hash);

    /// Unregisters an incoming resource that has been cancelled.
    fn cancel_incoming_resource(&self, resource_hash: Hash);

    /// Called exactly once when a resource reaches a terminal status.
    fn resource_concluded(&self, resource_hash: Hash);

    /// Transmits a framed packet belonging to a resource transfer.
    async fn send(&self, packet: Packet) -> Result<(), RtpError>;

    /// Measured round-trip time, if known.
    fn rtt(&self) -> Option<Duration>;

    /// Base timeout used before any RTT measurement is available.
    fn default_timeout(&self) -> Duration;

    /// Multiplier applied to RTT to derive a retry deadline.
    fn timeout_factor(&self) -> f64;

    /// Current link status.
    fn status(&self) -> LinkStatus;
}

/// Observer capability supplied at resource construction; a no-op
/// implementation is appropriate when the embedder does not care to watch
/// progress.
#[async_trait]
pub trait ResourceObserver: Send + Sync {
    /// Invoked once the resource begins actively transferring.
    fn started(&self, resource_hash: Hash) {
        let _ = resource_hash;
    }

    /// Invoked on every accepted progress event (part stored, request served).
    fn progress(&self, resource_hash: Hash, received_bytes: u64, total_bytes: u64) {
        let _ = (resource_hash, received_bytes, total_bytes);
    }

    /// Invoked exactly once when the resource reaches a terminal status.
    fn concluded(&self, resource_hash: Hash, outcome: Result<(), RtpError>) {
        let _ = (resource_hash, outcome);
    }
}

/// A no-op observer for callers that don't need progress callbacks.
pub struct NullObserver;

impl ResourceObserver for NullObserver {}


/// The routing-layer capability used to opportunistically fetch a
/// previously-witnessed packet by hash when an expected proof never arrives.
/// Fire-and-forget: the lookup result, if any, is expected to arrive through
/// the normal inbound packet path rather than as a direct return value.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn cache_request(&self, packet_hash: Hash);
}
