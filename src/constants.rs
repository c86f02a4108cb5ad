//! Cache constants and tuning parameters.
//!
//! Values follow the defaults used by mainstream BitTorrent implementations;
//! the block size in particular is fixed by the peer wire protocol.

// ============================================================================
// Block and piece sizes
// ============================================================================

/// Standard block size (16KB). Storage handles may override this for
/// torrents with unusual piece geometry.
pub const DEFAULT_BLOCK_SIZE: usize = 16384;

/// v1 piece hash length (SHA-1).
pub const PIECE_HASH_LEN: usize = 20;

/// v2 block hash length (SHA-256).
pub const BLOCK_HASH_LEN: usize = 32;

// ============================================================================
// Flush tuning
// ============================================================================

/// Default ceiling on dirty blocks kept in the cache. Callers of
/// `flush_to_disk` normally derive their own target from the session's
/// memory budget; this is the fallback.
pub const DEFAULT_FLUSH_TARGET: usize = 2048;
