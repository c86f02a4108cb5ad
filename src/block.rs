//! Per-block cache cells.

use bytes::Bytes;

use crate::job::{BlockHash, WriteJob};

/// Ownership state of one block's bytes.
///
/// A block holds either a pending write job or an owned buffer, never both.
/// The buffer moves from the job into the cache when the block is flushed,
/// and is released once the hashing pipeline no longer needs it.
#[derive(Default)]
pub(crate) enum BlockState {
    /// No data has arrived for this block.
    #[default]
    Empty,
    /// A write job is pending; the job owns the payload. The block is dirty.
    Pending(WriteJob),
    /// The block was written to disk; the cache keeps the buffer alive until
    /// the hashers have consumed it.
    Flushed(Bytes),
    /// The block was written to disk and its buffer has been released.
    Released,
}

impl BlockState {
    pub(crate) fn is_dirty(&self) -> bool {
        matches!(self, BlockState::Pending(_))
    }

    pub(crate) fn flushed_to_disk(&self) -> bool {
        matches!(self, BlockState::Flushed(_) | BlockState::Released)
    }
}

/// One block of a cached piece: its ownership state plus, for v2 torrents,
/// the block's SHA-256 once computed.
#[derive(Default)]
pub(crate) struct BlockEntry {
    pub(crate) state: BlockState,
    pub(crate) block_hash: Option<BlockHash>,
}

impl BlockEntry {
    /// The block's byte view, preferring the owned buffer over the pending
    /// job's payload. `None` once released or before any data arrived.
    pub(crate) fn bytes(&self) -> Option<&Bytes> {
        match &self.state {
            BlockState::Flushed(buf) => Some(buf),
            BlockState::Pending(job) => Some(&job.buf),
            _ => None,
        }
    }

    pub(crate) fn has_bytes(&self) -> bool {
        self.bytes().is_some()
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.state.is_dirty()
    }

    pub(crate) fn flushed_to_disk(&self) -> bool {
        self.state.flushed_to_disk()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::StorageHandle;
    use std::sync::Arc;

    struct FakeStorage;

    impl StorageHandle for FakeStorage {
        fn piece_size(&self, _piece: u32) -> usize {
            16384
        }
        fn v1(&self) -> bool {
            true
        }
        fn v2(&self) -> bool {
            false
        }
    }

    fn write_job(payload: &[u8]) -> WriteJob {
        WriteJob {
            storage: Arc::new(FakeStorage),
            piece: 0,
            block_index: 0,
            buf: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_empty_block_has_no_bytes() {
        let blk = BlockEntry::default();
        assert!(blk.bytes().is_none());
        assert!(!blk.is_dirty());
        assert!(!blk.flushed_to_disk());
    }

    #[test]
    fn test_pending_block_exposes_job_payload() {
        let blk = BlockEntry {
            state: BlockState::Pending(write_job(b"abc")),
            block_hash: None,
        };
        assert_eq!(blk.bytes().unwrap().as_ref(), b"abc");
        assert!(blk.is_dirty());
        assert!(!blk.flushed_to_disk());
    }

    #[test]
    fn test_flushed_block_exposes_owned_buffer() {
        let blk = BlockEntry {
            state: BlockState::Flushed(Bytes::from_static(b"xyz")),
            block_hash: None,
        };
        assert_eq!(blk.bytes().unwrap().as_ref(), b"xyz");
        assert!(!blk.is_dirty());
        assert!(blk.flushed_to_disk());
    }

    #[test]
    fn test_released_block_keeps_flushed_flag() {
        let blk = BlockEntry {
            state: BlockState::Released,
            block_hash: None,
        };
        assert!(blk.bytes().is_none());
        assert!(blk.flushed_to_disk());
    }
}
