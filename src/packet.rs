/// The subset of packet contexts relevant to resource transfer. A full link
/// carries many other contexts (keep-alives, link identification, channel
/// data, ...); this crate only needs to tag its own frames distinctly enough
/// for a `Link` implementation to route them back to the resource layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketContext {
    Resource,
    ResourceAdvertisement,
    ResourceRequest,
    ResourceHashUpdate,
    ResourceProof,
    ResourceInitiatorCancel,
    ResourceReceiverCancel,
}

/// Whether a packet carries resource data or a cryptographic proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data,
    Proof,
}

/// A minimal outbound frame: a context tag and an opaque payload. A concrete
/// `Link` is responsible for framing, addressing, and delivering this to the
/// remote peer; this crate never inspects link-layer headers.
#[derive(Debug, Clone)]
pub struct Packet {
    pub context: PacketContext,
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(context: PacketContext, packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self { context, packet_type, payload }
    }
}
