//! Resource Transfer Protocol: chunked, optionally compressed and encrypted
//! transfer of an arbitrary-size payload over a single established
//! cryptographic link that can otherwise only carry small, fixed-MTU packets.
//!
//! The crate is organized after the four cooperating components of the
//! protocol:
//!
//! - [`chunker`] - compression, encryption, splitting, and hashmap
//!   construction (C1).
//! - [`advertisement`] - the wire codec for advertisement, request,
//!   hashmap-update, and proof frames (C2).
//! - [`resource`] - the sender and receiver state machines, and the
//!   [`resource::ResourceManager`] that ties them to a [`link::Link`] (C3).
//! - [`watchdog`] - the timing/retry scheduler that supervises every
//!   in-flight resource (C4).
//!
//! [`link::Link`] and [`link::Transport`] are the only two external
//! collaborators this crate depends on; everything else (physical
//! interfaces, routing, CLI tooling, key agreement) lives outside its scope.

pub mod advertisement;
pub mod chunker;
pub mod config;
pub mod error;
pub mod hash;
pub mod link;
pub mod packet;
pub mod resource;
pub mod watchdog;

pub use error::RtpError;
pub use hash::Hash;
pub use resource::{ResourceManager, ResourceProgress, ResourceStatus};
