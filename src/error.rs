use thiserror::Error;

/// The error taxonomy of the resource transfer protocol.
///
/// Every fallible operation in this crate returns one of these variants rather
/// than a stringly-typed error; each carries the context a log line or a test
/// assertion needs without a separate reason string.
#[derive(Debug, Error)]
pub enum RtpError {
    #[error("chunking failed: {reason}")]
    ChunkingFailed { reason: &'static str },

    #[error("advertisement malformed: {reason}")]
    AdvertisementMalformed { reason: &'static str },

    #[error("hashmap update malformed: {reason}")]
    HashmapUpdateMalformed { reason: &'static str },

    #[error("request frame malformed: {reason}")]
    RequestMalformed { reason: &'static str },

    #[error("proof frame malformed: {reason}")]
    ProofMalformed { reason: &'static str },

    #[error("sequencing error: anchor at index {anchor_index} does not start segment {segment}")]
    SequencingError { segment: u32, anchor_index: usize },

    #[error("integrity failure: assembled digest did not match advertised hash")]
    IntegrityFailure,

    #[error("resource timed out in state {state}")]
    Timeout { state: &'static str },

    #[error("remote cancelled the resource")]
    RemoteCancel,

    #[error("resource cancelled locally")]
    Cancelled,

    #[error("link rejected the resource")]
    LinkRejected,

    #[error("link encryption failed")]
    CryptoFailure,

    #[error("unknown resource hash {0}")]
    UnknownResource(String),
}
