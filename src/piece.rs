//! Per-piece cache entries and the helpers that derive their flush state.

use sha1::{Digest, Sha1};

use crate::block::BlockEntry;
use crate::job::{ClearJob, HashJob, PieceLocation};

/// One piece's worth of cached blocks plus the incremental v1 hasher state,
/// cursors and pinning flags.
pub(crate) struct PieceEntry {
    pub(crate) location: PieceLocation,

    pub(crate) blocks: Box<[BlockEntry]>,

    /// Incremental SHA-1 over the piece, fed contiguously from block 0.
    pub(crate) ph: Sha1,

    /// Every block has either a pending write or is already on disk; the
    /// piece is complete in RAM and prioritized for flushing.
    pub(crate) ready_to_flush: bool,

    /// A thread is currently feeding `ph` / computing block hashes.
    pub(crate) hashing: bool,

    /// A thread is currently writing this piece's blocks to disk. Only one
    /// thread at a time may flush a piece.
    pub(crate) flushing: bool,

    /// The final v1 digest has been delivered to the engine.
    pub(crate) piece_hash_returned: bool,

    pub(crate) v1_hashes: bool,
    pub(crate) v2_hashes: bool,

    /// Count of contiguous leading blocks fed into `ph` (and, for v2,
    /// whose block hash has been computed).
    pub(crate) hasher_cursor: usize,

    /// Count of contiguous leading blocks flushed to disk.
    pub(crate) flushed_cursor: usize,

    /// A piece-hash request parked here until hashing finishes.
    pub(crate) hash_job: Option<HashJob>,

    /// A clear request deferred because the piece was pinned at the time.
    pub(crate) clear_piece: Option<ClearJob>,
}

impl PieceEntry {
    pub(crate) fn new(location: PieceLocation, blocks_in_piece: usize, v1: bool, v2: bool) -> Self {
        let mut blocks = Vec::with_capacity(blocks_in_piece);
        blocks.resize_with(blocks_in_piece, BlockEntry::default);
        Self {
            location,
            blocks: blocks.into_boxed_slice(),
            ph: Sha1::new(),
            ready_to_flush: false,
            hashing: false,
            flushing: false,
            piece_hash_returned: false,
            v1_hashes: v1,
            v2_hashes: v2,
            hasher_cursor: 0,
            flushed_cursor: 0,
            hash_job: None,
            clear_piece: None,
        }
    }

    pub(crate) fn blocks_in_piece(&self) -> usize {
        self.blocks.len()
    }

    /// Number of blocks that have been hashed but not yet flushed. Writing
    /// these now can never force a read-back to finish hashing.
    ///
    /// A forced flush can push `flushed_cursor` past `hasher_cursor`, so the
    /// difference saturates at zero.
    pub(crate) fn cheap_to_flush(&self) -> usize {
        self.hasher_cursor.saturating_sub(self.flushed_cursor)
    }
}

/// True when every block carries a pending write or is already on disk.
pub(crate) fn compute_ready_to_flush(blocks: &[BlockEntry]) -> bool {
    blocks.iter().all(|b| b.is_dirty() || b.flushed_to_disk())
}

/// Length of the flushed prefix.
pub(crate) fn compute_flushed_cursor(blocks: &[BlockEntry]) -> usize {
    blocks
        .iter()
        .take_while(|b| b.flushed_to_disk())
        .count()
}

/// Number of blocks still carrying a pending write job.
pub(crate) fn count_pending(blocks: &[BlockEntry]) -> usize {
    blocks.iter().filter(|b| b.is_dirty()).count()
}

/// True when every block in the slice has bytes available.
pub(crate) fn have_buffers(blocks: &[BlockEntry]) -> bool {
    blocks.iter().all(|b| b.has_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockState;
    use bytes::Bytes;

    fn entry_with_states(states: Vec<BlockState>) -> PieceEntry {
        let loc = PieceLocation::new(0, 0);
        let mut e = PieceEntry::new(loc, states.len(), true, false);
        for (blk, state) in e.blocks.iter_mut().zip(states) {
            blk.state = state;
        }
        e
    }

    #[test]
    fn test_ready_to_flush_needs_every_block_covered() {
        let buf = || Bytes::from_static(b"x");
        let e = entry_with_states(vec![
            BlockState::Flushed(buf()),
            BlockState::Released,
            BlockState::Empty,
        ]);
        assert!(!compute_ready_to_flush(&e.blocks));

        let e = entry_with_states(vec![BlockState::Flushed(buf()), BlockState::Released]);
        assert!(compute_ready_to_flush(&e.blocks));
    }

    #[test]
    fn test_flushed_cursor_stops_at_first_hole() {
        let buf = || Bytes::from_static(b"x");
        let e = entry_with_states(vec![
            BlockState::Released,
            BlockState::Flushed(buf()),
            BlockState::Empty,
            BlockState::Released,
        ]);
        assert_eq!(compute_flushed_cursor(&e.blocks), 2);
    }

    #[test]
    fn test_cheap_to_flush_saturates() {
        let loc = PieceLocation::new(1, 2);
        let mut e = PieceEntry::new(loc, 4, true, false);
        e.hasher_cursor = 3;
        e.flushed_cursor = 1;
        assert_eq!(e.cheap_to_flush(), 2);

        // forced flushes can overtake the hasher
        e.flushed_cursor = 4;
        assert_eq!(e.cheap_to_flush(), 0);
    }
}
