use tokio::time::Duration;

/// Minimum outstanding-request window a receiver will fall back to.
pub const WINDOW_MIN: usize = 1;
/// Initial outstanding-request window.
pub const WINDOW: usize = 4;
/// Maximum outstanding-request window a receiver may grow to.
pub const WINDOW_MAX: usize = 7;

/// Width, in bytes, of a map hash.
pub const MAPHASH_LEN: usize = 4;
/// Width, in bytes, of the per-resource random salt.
pub const RANDOM_HASH_SIZE: usize = 4;

/// Maximum number of map hashes carried in one advertisement or hashmap-update segment.
pub const HASHMAP_MAX_LEN: usize = 84;

/// Flag byte values for a request frame's exhaustion marker.
pub const HASHMAP_IS_NOT_EXHAUSTED: u8 = 0x00;
pub const HASHMAP_IS_EXHAUSTED: u8 = 0xFF;

/// Advertisement / part flag bits.
pub const FLAG_ENCRYPTED: u8 = 0x01;
pub const FLAG_COMPRESSED: u8 = 0x02;

/// Maximum number of times the watchdog retries a given state before cancelling.
pub const MAX_RETRIES: u8 = 5;

/// Extra grace period granted to a sender awaiting a proof or a transferring receiver.
pub const SENDER_GRACE_TIME: Duration = Duration::from_secs(10);

/// Default service-data-unit budget for a part: link MTU minus the maximum
/// packet-header overhead a concrete `Link`/`Packet` framing might add.
pub const DEFAULT_SDU: usize = 464;

/// Bound on the number of times the chunker may re-roll `random_hash` after a
/// map-hash collision before surfacing `ChunkingFailed`.
pub const COLLISION_REROLL_LIMIT: u8 = 8;

/// Tunables for the chunker (C1). Overridable by the embedding application,
/// e.g. in tests or on unusually constrained links.
#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    pub auto_compress: bool,
    pub collision_reroll_limit: u8,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            auto_compress: true,
            collision_reroll_limit: COLLISION_REROLL_LIMIT,
        }
    }
}

/// Tunables for the watchdog / retry loop (C4).
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    pub window: usize,
    pub window_max: usize,
    pub window_min: usize,
    pub max_retries: u8,
    pub sender_grace_time: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            window: WINDOW,
            window_max: WINDOW_MAX,
            window_min: WINDOW_MIN,
            max_retries: MAX_RETRIES,
            sender_grace_time: SENDER_GRACE_TIME,
        }
    }
}
