//! Engine-facing job types and identifiers.
//!
//! Jobs are how the surrounding engine talks to the cache: write jobs carry
//! inbound block payloads, hash jobs carry the destination for a finished
//! piece hash, and clear jobs are opaque tokens handed back when a piece has
//! been cleared. The [`StorageHandle`] trait is the slice of torrent metadata
//! the cache needs to size and hash pieces.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::constants::DEFAULT_BLOCK_SIZE;

/// Identifies one torrent's storage within the engine.
pub type StorageId = u32;

/// Index of a piece within a storage.
pub type PieceIndex = u32;

/// A v1 (SHA-1) piece hash.
pub type PieceHash = [u8; 20];

/// A v2 (SHA-256) block hash.
pub type BlockHash = [u8; 32];

/// Uniquely identifies a piece across all storages.
///
/// Ordering is lexicographic on `(storage, piece)`, so all pieces of one
/// storage form a contiguous range in any location-ordered view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceLocation {
    pub storage: StorageId,
    pub piece: PieceIndex,
}

impl PieceLocation {
    pub fn new(storage: StorageId, piece: PieceIndex) -> Self {
        Self { storage, piece }
    }
}

/// The slice of torrent metadata the cache consumes, supplied by the engine
/// on each write job.
pub trait StorageHandle: Send + Sync {
    /// Size in bytes of the given piece (the last piece may be short).
    fn piece_size(&self, piece: PieceIndex) -> usize;

    /// Block size used to slice pieces. Pieces smaller than one block still
    /// count as one block.
    fn block_size(&self) -> usize {
        DEFAULT_BLOCK_SIZE
    }

    /// Whether this torrent needs the v1 (SHA-1) piece hash.
    fn v1(&self) -> bool;

    /// Whether this torrent needs v2 (SHA-256) per-block hashes.
    fn v2(&self) -> bool;
}

/// An inbound block write. The job owns the payload until the block is
/// flushed, at which point the buffer moves into the cache.
pub struct WriteJob {
    pub storage: Arc<dyn StorageHandle>,
    pub piece: PieceIndex,
    pub block_index: usize,
    pub buf: Bytes,
}

impl fmt::Debug for WriteJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteJob")
            .field("piece", &self.piece)
            .field("block_index", &self.block_index)
            .field("len", &self.buf.len())
            .finish_non_exhaustive()
    }
}

/// A request for a finished piece hash.
///
/// `piece_hash` is overwritten with the final v1 digest on completion. If the
/// engine wants v2 block hashes back it pre-sizes `block_hashes`; the cache
/// fills the first `min(blocks_in_piece, block_hashes.len())` entries.
#[derive(Debug, Default)]
pub struct HashJob {
    pub piece_hash: PieceHash,
    pub block_hashes: Vec<BlockHash>,
}

impl HashJob {
    pub fn new() -> Self {
        Self::default()
    }

    /// A hash job that also requests `count` v2 block hashes.
    pub fn with_block_hashes(count: usize) -> Self {
        Self {
            piece_hash: PieceHash::default(),
            block_hashes: vec![BlockHash::default(); count],
        }
    }
}

/// Opaque engine token for a clear-piece request, returned when the clear
/// has been carried out (possibly deferred past a flush in progress).
#[derive(Debug)]
pub struct ClearJob {
    pub location: PieceLocation,
}

/// Outcome of [`try_hash_piece`](crate::cache::DiskCache::try_hash_piece).
#[derive(Debug)]
pub enum TryHash {
    /// The hash was available; the job comes back filled in and should be
    /// posted to the engine's completion queue.
    Completed(HashJob),
    /// A hashing thread is working on the piece and can finish without disk
    /// reads; the job was parked on the piece and will be delivered by
    /// [`kick_hasher`](crate::cache::DiskCache::kick_hasher).
    Queued,
    /// The cache cannot produce the hash; the engine should read the piece
    /// back from disk and hash it there.
    Post(HashJob),
}
