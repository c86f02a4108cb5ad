//! The block cache façade.
//!
//! [`DiskCache`] buffers inbound piece blocks, drives the incremental v1
//! piece hash (and v2 block hashes) as contiguous data becomes available,
//! and flushes dirty blocks to disk through a caller-supplied writer.
//!
//! All state lives behind one mutex. Long-running work — hashing a run of
//! blocks, writing a slice to disk — happens with the mutex released while
//! the piece is pinned by its `hashing`/`flushing` flag: a pinned piece is
//! never erased and never hashed or flushed by two threads at once. Two
//! different pieces can be hashed or flushed in parallel.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use rcache::{DiskCache, HashJob, PieceLocation, StorageHandle, TryHash, WriteJob};
//!
//! struct SmallTorrent;
//!
//! impl StorageHandle for SmallTorrent {
//!     fn piece_size(&self, _piece: u32) -> usize {
//!         16384
//!     }
//!     fn v1(&self) -> bool {
//!         true
//!     }
//!     fn v2(&self) -> bool {
//!         false
//!     }
//! }
//!
//! let cache = DiskCache::new();
//! let loc = PieceLocation::new(0, 0);
//! let storage: Arc<dyn StorageHandle> = Arc::new(SmallTorrent);
//!
//! cache.insert(
//!     loc,
//!     0,
//!     WriteJob {
//!         storage,
//!         piece: 0,
//!         block_index: 0,
//!         buf: Bytes::from(vec![0u8; 16384]),
//!     },
//! );
//!
//! let mut completed = Vec::new();
//! cache.kick_hasher(loc, &mut completed);
//! assert!(matches!(
//!     cache.try_hash_piece(loc, HashJob::new()),
//!     TryHash::Completed(_)
//! ));
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tracing::{debug, trace};

use crate::bitfield::Bitfield;
use crate::block::BlockState;
use crate::error::CacheError;
use crate::job::{BlockHash, ClearJob, HashJob, PieceLocation, StorageId, TryHash, WriteJob};
use crate::piece::{compute_flushed_cursor, compute_ready_to_flush, count_pending, have_buffers, PieceEntry};
use crate::store::PieceStore;

/// One block handed to a flush writer.
///
/// `data` is `Some` for blocks carrying a pending write job (the bytes to
/// persist). Blocks already on disk or not yet received appear as `None` so
/// the writer sees the full geometry of the slice.
#[derive(Debug, Clone)]
pub struct FlushBlock {
    pub location: PieceLocation,
    /// Index of the block within its piece.
    pub block_index: usize,
    pub data: Option<Bytes>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FlushPass {
    /// Finished pieces, flushed whole regardless of the target.
    Ready,
    /// Hashed-but-unflushed runs; flushing these never forces a read-back.
    Cheap,
    /// Any remaining dirty blocks, read-back risk accepted.
    Forced,
    /// Per-storage purge; erases each piece it drains.
    Storage,
}

enum FlushStep {
    Flushed { attempted: usize, written: usize },
    Skipped,
    TargetReached,
}

struct CacheState {
    store: PieceStore,
    /// Dirty blocks (pending write jobs) across all pieces.
    dirty_blocks: usize,
    /// Blocks claimed by flushes currently in flight, used to avoid
    /// overshooting when several disk threads flush concurrently.
    flushing_blocks: usize,
}

/// A block-level disk cache for BitTorrent piece data.
///
/// Blocks arrive out of order via [`insert`](DiskCache::insert); hasher
/// threads drain them through [`kick_hasher`](DiskCache::kick_hasher); disk
/// threads persist them through [`flush_to_disk`](DiskCache::flush_to_disk).
pub struct DiskCache {
    inner: Mutex<CacheState>,
}

impl DiskCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheState {
                store: PieceStore::new(),
                dirty_blocks: 0,
                flushing_blocks: 0,
            }),
        }
    }

    /// Peeks at a cached block. Invokes `f` with the block's bytes while the
    /// cache mutex is held and returns true, or returns false if the piece
    /// or the block's bytes are not cached. `f` must not call back into the
    /// cache.
    pub fn get(&self, loc: PieceLocation, block_index: usize, f: impl FnOnce(&[u8])) -> bool {
        let state = self.inner.lock();
        state.check_invariant();
        let Some(entry) = state.store.get(&loc) else {
            return false;
        };
        match entry.blocks.get(block_index).and_then(|b| b.bytes()) {
            Some(buf) => {
                f(buf);
                true
            }
            None => false,
        }
    }

    /// Peeks at two consecutive blocks, for assembling reads that cross a
    /// block boundary. If either view is present, invokes `f` with both
    /// (absent ones as `None`) and returns its result; otherwise returns 0.
    /// Asking at the last block of a piece yields `None` for the neighbor.
    /// `f` must not call back into the cache.
    pub fn get2(
        &self,
        loc: PieceLocation,
        block_index: usize,
        f: impl FnOnce(Option<&[u8]>, Option<&[u8]>) -> usize,
    ) -> usize {
        let state = self.inner.lock();
        state.check_invariant();
        let Some(entry) = state.store.get(&loc) else {
            return 0;
        };
        let buf1 = entry.blocks.get(block_index).and_then(|b| b.bytes());
        let buf2 = entry.blocks.get(block_index + 1).and_then(|b| b.bytes());
        if buf1.is_none() && buf2.is_none() {
            return 0;
        }
        f(buf1.map(|b| b.as_ref()), buf2.map(|b| b.as_ref()))
    }

    /// Produces the v2 hash of one block. Uses the cached hash when the
    /// hashing pipeline is already past the block, hashes the cached bytes
    /// inline when present, and otherwise releases the mutex and falls back
    /// to `f` (typically a read-from-disk-and-hash path). The fallback is
    /// also taken while another thread holds the piece's hashing pin.
    pub fn hash2(
        &self,
        loc: PieceLocation,
        block_index: usize,
        f: impl FnOnce() -> BlockHash,
    ) -> BlockHash {
        let state = self.inner.lock();
        state.check_invariant();
        if let Some(entry) = state.store.get(&loc) {
            if entry.hashing {
                drop(state);
                return f();
            }
            if let Some(blk) = entry.blocks.get(block_index) {
                if entry.hasher_cursor > block_index {
                    if let Some(hash) = blk.block_hash {
                        return hash;
                    }
                }
                if let Some(buf) = blk.bytes() {
                    let mut h = Sha256::new();
                    h.update(buf.as_ref());
                    return h.finalize().into();
                }
            }
        }
        drop(state);
        f()
    }

    /// Hands the piece's incremental hasher to `f` for a hasher thread to
    /// advance. The callback receives the hasher, the current hasher cursor
    /// and snapshots of every block's bytes and v2 hash, and runs without
    /// the cache mutex while the piece's hashing pin is held. Returns false
    /// if the piece is not cached.
    pub fn hash_piece(
        &self,
        loc: PieceLocation,
        f: impl FnOnce(&mut Sha1, usize, &[Option<Bytes>], &mut [BlockHash]),
    ) -> bool {
        let mut state = self.inner.lock();
        state.check_invariant();
        let Some(snapshot) = state.store.modify(&loc, |e| {
            debug_assert!(!e.hashing);
            let blocks: Vec<Option<Bytes>> = e.blocks.iter().map(|b| b.bytes().cloned()).collect();
            let v2_hashes: Vec<BlockHash> = e
                .blocks
                .iter()
                .map(|b| b.block_hash.unwrap_or_default())
                .collect();
            e.hashing = true;
            let ph = std::mem::replace(&mut e.ph, Sha1::new());
            (ph, e.hasher_cursor, blocks, v2_hashes)
        }) else {
            return false;
        };
        drop(state);

        let (mut ph, cursor, blocks, mut v2_hashes) = snapshot;
        f(&mut ph, cursor, &blocks, &mut v2_hashes);

        let mut state = self.inner.lock();
        state.store.modify(&loc, |e| {
            e.ph = ph;
            e.hashing = false;
        });
        true
    }

    /// Ingests a write job for one block. Creates the piece entry on first
    /// use, sizing it from the job's storage handle. Returns true when the
    /// hasher and/or flusher should be kicked: the job was for block 0, or
    /// it made the piece ready to flush.
    ///
    /// The target block must be empty and above both cursors; violating
    /// that is a caller bug.
    pub fn insert(&self, loc: PieceLocation, block_index: usize, job: WriteJob) -> bool {
        let mut state = self.inner.lock();
        state.check_invariant();

        if !state.store.contains(&loc) {
            let storage = &job.storage;
            let blocks_in_piece = storage.piece_size(loc.piece).div_ceil(storage.block_size());
            let entry = PieceEntry::new(loc, blocks_in_piece, storage.v1(), storage.v2());
            state.store.insert(entry);
        }

        state.dirty_blocks += 1;
        let ready = state
            .store
            .modify(&loc, |e| {
                let blk = &mut e.blocks[block_index];
                debug_assert!(matches!(blk.state, BlockState::Empty));
                debug_assert!(block_index >= e.flushed_cursor);
                debug_assert!(block_index >= e.hasher_cursor);
                blk.state = BlockState::Pending(job);
                e.ready_to_flush = compute_ready_to_flush(&e.blocks);
                e.ready_to_flush
            })
            .unwrap_or(false);

        block_index == 0 || ready
    }

    /// Requests the final piece hash.
    ///
    /// Completes immediately when the hashing pipeline has consumed every
    /// block; parks the job on the piece when a hashing thread will be able
    /// to finish without disk reads; otherwise hands the job back for the
    /// engine to hash from disk.
    pub fn try_hash_piece(&self, loc: PieceLocation, mut job: HashJob) -> TryHash {
        let mut state = self.inner.lock();
        state.check_invariant();

        enum Plan {
            Complete,
            Queue,
            Post,
        }

        let plan = match state.store.get(&loc) {
            None => return TryHash::Post(job),
            Some(entry) => {
                // the engine asks for each piece hash once
                debug_assert!(!entry.piece_hash_returned);
                if !entry.hashing && entry.hasher_cursor == entry.blocks_in_piece() {
                    Plan::Complete
                } else if entry.hashing
                    && entry.hasher_cursor < entry.blocks_in_piece()
                    && have_buffers(&entry.blocks[entry.hasher_cursor..])
                {
                    debug_assert!(entry.hash_job.is_none());
                    Plan::Queue
                } else {
                    Plan::Post
                }
            }
        };

        match plan {
            Plan::Complete => {
                state.store.modify(&loc, |e| {
                    e.piece_hash_returned = true;
                    job.piece_hash = e.ph.clone().finalize().into();
                    if !job.block_hashes.is_empty() {
                        let count = e.blocks_in_piece().min(job.block_hashes.len());
                        for (i, out) in job.block_hashes[..count].iter_mut().enumerate() {
                            *out = e.blocks[i].block_hash.unwrap_or_default();
                        }
                    }
                });
                TryHash::Completed(job)
            }
            Plan::Queue => {
                state.store.modify(&loc, |e| e.hash_job = Some(job));
                TryHash::Queued
            }
            Plan::Post => TryHash::Post(job),
        }
    }

    /// Hasher-thread entry point. Feeds every contiguous run of cached
    /// blocks into the piece's hashers, releasing consumed buffers, until
    /// the next block has not arrived. A hash job parked on the piece is
    /// completed and pushed to `completed_jobs` once the last block has
    /// been hashed.
    pub fn kick_hasher(&self, loc: PieceLocation, completed_jobs: &mut Vec<HashJob>) {
        let mut state = self.inner.lock();
        state.check_invariant();
        match state.store.get(&loc) {
            None => return,
            // some other thread beat us to it
            Some(entry) if entry.hashing => return,
            Some(_) => {}
        }

        loop {
            let Some((mut ph, cursor, run, need_v1, need_v2)) = state.store.modify(&loc, |e| {
                let mut run: Vec<Bytes> = Vec::new();
                let mut end = e.hasher_cursor;
                while end < e.blocks_in_piece() {
                    match e.blocks[end].bytes() {
                        Some(buf) => {
                            run.push(buf.clone());
                            end += 1;
                        }
                        None => break,
                    }
                }
                e.hashing = true;
                (
                    std::mem::replace(&mut e.ph, Sha1::new()),
                    e.hasher_cursor,
                    run,
                    e.v1_hashes,
                    e.v2_hashes,
                )
            }) else {
                return;
            };
            drop(state);

            let mut run_hashes: Vec<BlockHash> = Vec::with_capacity(run.len());
            for buf in &run {
                if need_v1 {
                    ph.update(buf.as_ref());
                }
                if need_v2 {
                    let mut h = Sha256::new();
                    h.update(buf.as_ref());
                    run_hashes.push(h.finalize().into());
                }
            }

            state = self.inner.lock();
            let run_len = run.len();
            let keep_going = state
                .store
                .modify(&loc, |e| {
                    debug_assert_eq!(e.hasher_cursor, cursor);
                    for (i, blk) in e.blocks[cursor..cursor + run_len].iter_mut().enumerate() {
                        if need_v2 {
                            blk.block_hash = Some(run_hashes[i]);
                        }
                        // the bytes have reached the hashers and, if flushed,
                        // the disk; the owned buffer is no longer needed
                        if matches!(blk.state, BlockState::Flushed(_)) {
                            blk.state = BlockState::Released;
                        }
                    }
                    e.ph = ph;
                    e.hasher_cursor = cursor + run_len;
                    e.hashing = false;
                    e.hasher_cursor < e.blocks_in_piece() && e.blocks[e.hasher_cursor].has_bytes()
                })
                .unwrap_or(false);

            if !keep_going {
                break;
            }
        }

        // a hash job may be parked on this piece; deliver it now
        let finished = state
            .store
            .modify(&loc, |e| {
                let mut job = e.hash_job.take()?;
                e.ready_to_flush = compute_ready_to_flush(&e.blocks);
                debug_assert_eq!(e.hasher_cursor, e.blocks_in_piece());
                job.piece_hash = e.ph.clone().finalize().into();
                if !job.block_hashes.is_empty() {
                    debug_assert!(e.v2_hashes);
                    let count = e.blocks_in_piece().min(job.block_hashes.len());
                    for (i, out) in job.block_hashes[..count].iter_mut().enumerate() {
                        *out = e.blocks[i].block_hash.unwrap_or_default();
                    }
                }
                Some(job)
            })
            .flatten();

        if let Some(job) = finished {
            trace!("delivering piece hash for {:?} from the hasher", loc);
            completed_jobs.push(job);
        }
    }

    /// Clears a piece, typically after a failed hash check. Pending write
    /// jobs are drained into `aborted`, buffers are released and the
    /// cursors and hasher reset. Returns the clear job when the clear was
    /// carried out (post the completion); returns `None` when the piece was
    /// pinned and the job was parked to run when the pin comes off.
    pub fn try_clear_piece(
        &self,
        loc: PieceLocation,
        job: ClearJob,
        aborted: &mut Vec<WriteJob>,
    ) -> Option<ClearJob> {
        let mut state = self.inner.lock();
        state.check_invariant();

        let (flushing, hashing) = match state.store.get(&loc) {
            None => return Some(job),
            Some(entry) => (entry.flushing, entry.hashing),
        };

        if flushing {
            // postpone the clear until the flushing thread is done with it
            trace!("clear of {:?} deferred until flush completes", loc);
            state.store.modify(&loc, |e| e.clear_piece = Some(job));
            return None;
        }

        // pieces are cleared after failing the hash check; hashing should be
        // long over by then
        debug_assert!(!hashing);
        if hashing {
            state.store.modify(&loc, |e| e.clear_piece = Some(job));
            return None;
        }

        let mut drained = Vec::new();
        let dropped = state
            .store
            .modify(&loc, |e| clear_piece_impl(e, &mut drained))
            .unwrap_or(0);
        debug_assert!(state.dirty_blocks >= dropped);
        state.dirty_blocks -= dropped;
        aborted.append(&mut drained);
        Some(job)
    }

    /// Disk-thread flush driver. Flushes until at most `target_blocks`
    /// dirty blocks remain, in three passes: finished pieces first (flushed
    /// whole, regardless of the target), then hashed-but-unflushed runs
    /// (largest first — these never force a read-back), then a forced pass
    /// over everything else in location order.
    ///
    /// The writer receives a bitfield to mark durably-written blocks in,
    /// the slice of blocks, and the number of leading slice blocks already
    /// hashed. Returning fewer written blocks than the slice's dirty count
    /// is the backpressure signal: the driver returns immediately. A writer
    /// error aborts the driver; blocks it may have written stay dirty and
    /// are simply flushed again later.
    ///
    /// `clear_piece_sink` receives `(aborted_jobs, clear_job)` whenever a
    /// flush completion triggers a deferred clear.
    pub fn flush_to_disk<W, C>(
        &self,
        mut writer: W,
        target_blocks: usize,
        mut clear_piece_sink: C,
    ) -> Result<(), CacheError>
    where
        W: FnMut(&mut Bitfield, &[FlushBlock], usize) -> Result<usize, CacheError>,
        C: FnMut(Vec<WriteJob>, ClearJob),
    {
        // finished pieces first: a fully downloaded piece has no reason to
        // hold RAM, so the flush target does not apply to this pass
        let ready = {
            let state = self.inner.lock();
            state.check_invariant();
            debug!(
                "flush round: {} dirty blocks, {} in flight, target {}",
                state.dirty_blocks, state.flushing_blocks, target_blocks
            );
            state.store.ready_pieces()
        };
        for loc in ready {
            if let FlushStep::Flushed { attempted, written } =
                self.run_flush(loc, FlushPass::Ready, None, &mut writer, &mut clear_piece_sink)?
            {
                if written < attempted {
                    return Ok(());
                }
            }
        }

        // partial flushes that will never need read-back, largest run first
        let cheap = { self.inner.lock().store.cheapest_pieces() };
        for loc in cheap {
            match self.run_flush(
                loc,
                FlushPass::Cheap,
                Some(target_blocks),
                &mut writer,
                &mut clear_piece_sink,
            )? {
                FlushStep::TargetReached => return Ok(()),
                FlushStep::Flushed { attempted, written } if written < attempted => return Ok(()),
                _ => {}
            }
        }

        // force-flush whatever still carries write jobs; these blocks may
        // have to be read back later to finish hashing, which is the price
        // of honoring the ceiling
        let all = { self.inner.lock().store.locations() };
        for loc in all {
            match self.run_flush(
                loc,
                FlushPass::Forced,
                Some(target_blocks),
                &mut writer,
                &mut clear_piece_sink,
            )? {
                FlushStep::TargetReached => return Ok(()),
                FlushStep::Flushed { attempted, written } if written < attempted => return Ok(()),
                _ => {}
            }
        }

        Ok(())
    }

    /// Purges one storage: flushes every cached piece under it and erases
    /// the entries, whether or not their hash was ever returned. Pieces
    /// being flushed by another thread are skipped, not erased; their dirty
    /// blocks stay accounted for until that flush completes.
    pub fn flush_storage<W, C>(
        &self,
        mut writer: W,
        storage: StorageId,
        mut clear_piece_sink: C,
    ) -> Result<(), CacheError>
    where
        W: FnMut(&mut Bitfield, &[FlushBlock], usize) -> Result<usize, CacheError>,
        C: FnMut(Vec<WriteJob>, ClearJob),
    {
        let pieces = {
            let state = self.inner.lock();
            state.check_invariant();
            state.store.storage_pieces(storage)
        };
        debug!("purging storage {}: {} cached pieces", storage, pieces.len());
        for loc in pieces {
            self.run_flush(
                loc,
                FlushPass::Storage,
                None,
                &mut writer,
                &mut clear_piece_sink,
            )?;
        }
        Ok(())
    }

    /// Number of dirty blocks in the cache.
    pub fn size(&self) -> usize {
        let state = self.inner.lock();
        state.check_invariant();
        state.dirty_blocks
    }

    /// Number of blocks currently claimed by in-flight flushes.
    pub fn num_flushing(&self) -> usize {
        let state = self.inner.lock();
        state.check_invariant();
        state.flushing_blocks
    }

    /// Number of cached piece entries.
    pub fn num_pieces(&self) -> usize {
        let state = self.inner.lock();
        state.check_invariant();
        state.store.len()
    }

    pub fn contains_piece(&self, loc: PieceLocation) -> bool {
        let state = self.inner.lock();
        state.check_invariant();
        state.store.contains(&loc)
    }

    /// One flush transaction: validate and pin the piece, snapshot the
    /// slice, run the writer without the mutex, then apply the bitfield,
    /// move flushed buffers out of their jobs, refresh the cursors and run
    /// any deferred clear. Erases the piece when the pass calls for it.
    fn run_flush<W, C>(
        &self,
        loc: PieceLocation,
        pass: FlushPass,
        target_blocks: Option<usize>,
        writer: &mut W,
        clear_piece_sink: &mut C,
    ) -> Result<FlushStep, CacheError>
    where
        W: FnMut(&mut Bitfield, &[FlushBlock], usize) -> Result<usize, CacheError>,
        C: FnMut(Vec<WriteJob>, ClearJob),
    {
        let mut state = self.inner.lock();

        if let Some(target) = target_blocks {
            // other threads may already have enough flushing in flight
            if state.dirty_blocks.saturating_sub(state.flushing_blocks) <= target {
                return Ok(FlushStep::TargetReached);
            }
        }

        enum Plan {
            Skip,
            Erase,
            Flush {
                start: usize,
                slice_len: usize,
                num_blocks: usize,
            },
        }

        let plan = match state.store.get(&loc) {
            None => Plan::Skip,
            Some(entry) if entry.flushing => Plan::Skip,
            Some(entry) => match pass {
                FlushPass::Ready => {
                    if entry.ready_to_flush {
                        Plan::Flush {
                            start: 0,
                            slice_len: entry.blocks_in_piece(),
                            num_blocks: entry.blocks_in_piece(),
                        }
                    } else {
                        Plan::Skip
                    }
                }
                FlushPass::Cheap => {
                    let num = entry.cheap_to_flush();
                    if num == 0 {
                        Plan::Skip
                    } else {
                        Plan::Flush {
                            start: entry.flushed_cursor,
                            slice_len: num,
                            num_blocks: num,
                        }
                    }
                }
                FlushPass::Forced | FlushPass::Storage => {
                    let num = count_pending(&entry.blocks);
                    if num > 0 {
                        Plan::Flush {
                            start: 0,
                            slice_len: entry.blocks_in_piece(),
                            num_blocks: num,
                        }
                    } else if pass == FlushPass::Storage && !entry.hashing {
                        // nothing left to write; the purge still drops it
                        Plan::Erase
                    } else {
                        Plan::Skip
                    }
                }
            },
        };

        let (start, slice_len, num_blocks) = match plan {
            Plan::Skip => return Ok(FlushStep::Skipped),
            Plan::Erase => {
                debug_assert!(state
                    .store
                    .get(&loc)
                    .map(|e| e.clear_piece.is_none())
                    .unwrap_or(true));
                state.store.remove(&loc);
                return Ok(FlushStep::Skipped);
            }
            Plan::Flush {
                start,
                slice_len,
                num_blocks,
            } => (start, slice_len, num_blocks),
        };

        // snapshot the slice and pin the piece; the pin keeps the entry
        // alive and other flushers away while the mutex is released
        let Some(entry) = state.store.get(&loc) else {
            return Ok(FlushStep::Skipped);
        };
        let hash_cursor = entry.hasher_cursor.saturating_sub(start).min(slice_len);
        let slice: Vec<FlushBlock> = entry.blocks[start..start + slice_len]
            .iter()
            .enumerate()
            .map(|(i, blk)| FlushBlock {
                location: loc,
                block_index: start + i,
                data: match &blk.state {
                    BlockState::Pending(job) => Some(job.buf.clone()),
                    _ => None,
                },
            })
            .collect();

        state.store.modify(&loc, |e| {
            debug_assert!(!e.flushing);
            e.flushing = true;
        });
        state.flushing_blocks += num_blocks;
        drop(state);

        let mut flushed = Bitfield::new(slice_len);
        let result = writer(&mut flushed, &slice, hash_cursor);

        // the pin and the in-flight accounting come off on every exit path,
        // including a writer abort
        let mut state = self.inner.lock();
        state.store.modify(&loc, |e| {
            debug_assert!(e.flushing);
            e.flushing = false;
        });
        debug_assert!(state.flushing_blocks >= num_blocks);
        state.flushing_blocks -= num_blocks;

        let written = result?;

        let flushed_count = flushed.count();
        debug_assert_eq!(flushed_count, written.min(slice_len));

        state.store.modify(&loc, |e| {
            for i in 0..slice_len {
                if !flushed.has(i) {
                    continue;
                }
                let blk = &mut e.blocks[start + i];
                match std::mem::take(&mut blk.state) {
                    BlockState::Pending(job) => {
                        // ownership of the payload moves from the job into
                        // the block; blocks the hasher is already past can
                        // drop it right away
                        blk.state = if i < hash_cursor {
                            BlockState::Released
                        } else {
                            BlockState::Flushed(job.buf)
                        };
                    }
                    other => {
                        debug_assert!(false, "flushed bit set on a block with no pending write");
                        blk.state = other;
                    }
                }
            }
            e.flushed_cursor = compute_flushed_cursor(&e.blocks);
            if pass == FlushPass::Ready {
                e.ready_to_flush = compute_ready_to_flush(&e.blocks);
            }
        });
        debug_assert!(state.dirty_blocks >= flushed_count);
        state.dirty_blocks -= flushed_count;

        // a clear may have been parked on the piece while we were flushing
        let parked = state
            .store
            .get(&loc)
            .map(|e| e.clear_piece.is_some())
            .unwrap_or(false);
        if parked {
            let mut drained = Vec::new();
            let mut dropped = 0;
            let clear_job = state
                .store
                .modify(&loc, |e| {
                    let job = e.clear_piece.take();
                    dropped = clear_piece_impl(e, &mut drained);
                    job
                })
                .flatten();
            debug_assert!(state.dirty_blocks >= dropped);
            state.dirty_blocks -= dropped;
            if let Some(job) = clear_job {
                clear_piece_sink(drained, job);
            }
        }

        match pass {
            FlushPass::Ready => {
                let erase = state
                    .store
                    .get(&loc)
                    .map(|e| e.piece_hash_returned && !e.hashing)
                    .unwrap_or(false);
                if erase {
                    state.store.remove(&loc);
                }
            }
            FlushPass::Storage => {
                let erase = state.store.get(&loc).map(|e| !e.hashing).unwrap_or(false);
                if erase {
                    state.store.remove(&loc);
                }
            }
            _ => {}
        }

        Ok(FlushStep::Flushed {
            attempted: num_blocks,
            written,
        })
    }
}

impl Default for DiskCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains pending writes into `aborted`, releases owned buffers and resets
/// the piece to an unhashed, unflushed state. The entry stays in the store
/// and is repopulated as new blocks arrive. Returns the number of write
/// jobs dropped so the caller can adjust the dirty-block counter. Must run
/// with the piece unpinned.
fn clear_piece_impl(e: &mut PieceEntry, aborted: &mut Vec<WriteJob>) -> usize {
    debug_assert!(!e.flushing);
    debug_assert!(!e.hashing);
    let mut dropped = 0;
    for blk in e.blocks.iter_mut() {
        match std::mem::take(&mut blk.state) {
            BlockState::Pending(job) => {
                aborted.push(job);
                dropped += 1;
            }
            BlockState::Flushed(_) => blk.state = BlockState::Released,
            other => blk.state = other,
        }
    }
    e.ready_to_flush = false;
    e.piece_hash_returned = false;
    e.hasher_cursor = 0;
    e.flushed_cursor = 0;
    e.ph = Sha1::new();
    dropped
}

impl CacheState {
    #[cfg(debug_assertions)]
    fn check_invariant(&self) {
        self.store.check_consistency();
        let mut dirty = 0;
        let mut flushing_bound = 0;
        for entry in self.store.iter() {
            assert!(entry.flushed_cursor <= entry.blocks_in_piece());
            assert!(entry.hasher_cursor <= entry.blocks_in_piece());
            if entry.flushing {
                flushing_bound += entry.blocks_in_piece();
            }
            for (idx, blk) in entry.blocks.iter().enumerate() {
                if blk.is_dirty() {
                    dirty += 1;
                }
                if idx < entry.flushed_cursor {
                    assert!(blk.flushed_to_disk());
                    assert!(!blk.is_dirty());
                }
                if entry.ready_to_flush {
                    assert!(blk.is_dirty() || blk.flushed_to_disk());
                }
            }
        }
        assert_eq!(dirty, self.dirty_blocks);
        // while flushes are in flight we only know the upper bound
        assert!(self.flushing_blocks <= flushing_bound);
    }

    #[cfg(not(debug_assertions))]
    fn check_invariant(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{PieceHash, StorageHandle};
    use std::sync::Arc;

    struct TestStorage {
        piece_size: usize,
        v2: bool,
    }

    impl StorageHandle for TestStorage {
        fn piece_size(&self, _piece: u32) -> usize {
            self.piece_size
        }
        fn v1(&self) -> bool {
            true
        }
        fn v2(&self) -> bool {
            self.v2
        }
    }

    const BLOCK: usize = crate::constants::DEFAULT_BLOCK_SIZE;

    fn storage(piece_size: usize) -> Arc<dyn StorageHandle> {
        Arc::new(TestStorage {
            piece_size,
            v2: false,
        })
    }

    fn job(storage: &Arc<dyn StorageHandle>, loc: PieceLocation, block: usize, fill: u8) -> WriteJob {
        let len = storage
            .piece_size(loc.piece)
            .saturating_sub(block * BLOCK)
            .min(BLOCK);
        WriteJob {
            storage: Arc::clone(storage),
            piece: loc.piece,
            block_index: block,
            buf: Bytes::from(vec![fill; len]),
        }
    }

    fn write_all(
        flushed: &mut Bitfield,
        blocks: &[FlushBlock],
        _hash_cursor: usize,
    ) -> Result<usize, CacheError> {
        let mut count = 0;
        for (i, blk) in blocks.iter().enumerate() {
            if blk.data.is_some() {
                flushed.set(i);
                count += 1;
            }
        }
        Ok(count)
    }

    #[test]
    fn test_insert_then_get_round_trips() {
        let cache = DiskCache::new();
        let st = storage(BLOCK * 4);
        let loc = PieceLocation::new(0, 0);

        cache.insert(loc, 1, job(&st, loc, 1, 0xAB));

        let mut seen = Vec::new();
        assert!(cache.get(loc, 1, |bytes| seen.extend_from_slice(bytes)));
        assert_eq!(seen, vec![0xAB; BLOCK]);
        assert_eq!(cache.size(), 1);

        assert!(!cache.get(loc, 0, |_| panic!("block 0 has no bytes")));
        assert!(!cache.get(PieceLocation::new(9, 9), 0, |_| {}));
    }

    #[test]
    fn test_insert_signals_hasher_kick() {
        let cache = DiskCache::new();
        let st = storage(BLOCK * 3);
        let loc = PieceLocation::new(0, 0);

        // block 0 always signals
        assert!(cache.insert(loc, 0, job(&st, loc, 0, 1)));
        // a middle block does not
        assert!(!cache.insert(loc, 2, job(&st, loc, 2, 3)));
        // the block completing the piece does
        assert!(cache.insert(loc, 1, job(&st, loc, 1, 2)));
    }

    #[test]
    fn test_get2_spans_a_block_boundary() {
        let cache = DiskCache::new();
        let st = storage(BLOCK * 2);
        let loc = PieceLocation::new(0, 0);

        cache.insert(loc, 0, job(&st, loc, 0, 1));

        let n = cache.get2(loc, 0, |a, b| {
            assert!(a.is_some());
            assert!(b.is_none());
            a.map(|x| x.len()).unwrap_or(0)
        });
        assert_eq!(n, BLOCK);

        // last block of the piece: the neighbor is clamped out
        cache.insert(loc, 1, job(&st, loc, 1, 2));
        let n = cache.get2(loc, 1, |a, b| {
            assert!(a.is_some());
            assert!(b.is_none());
            1
        });
        assert_eq!(n, 1);

        assert_eq!(cache.get2(PieceLocation::new(5, 5), 0, |_, _| 7), 0);
    }

    #[test]
    fn test_hash2_prefers_cache_over_fallback() {
        let cache = DiskCache::new();
        let st: Arc<dyn StorageHandle> = Arc::new(TestStorage {
            piece_size: BLOCK * 2,
            v2: true,
        });
        let loc = PieceLocation::new(0, 0);

        let payload = vec![0x5A; BLOCK];
        cache.insert(
            loc,
            0,
            WriteJob {
                storage: Arc::clone(&st),
                piece: 0,
                block_index: 0,
                buf: Bytes::from(payload.clone()),
            },
        );

        let expected: BlockHash = {
            let mut h = Sha256::new();
            h.update(&payload);
            h.finalize().into()
        };

        // bytes are cached: hashed inline, no fallback
        let got = cache.hash2(loc, 0, || panic!("fallback must not run"));
        assert_eq!(got, expected);

        // absent piece: fallback runs
        let sentinel = [7u8; 32];
        let got = cache.hash2(PieceLocation::new(3, 3), 0, || sentinel);
        assert_eq!(got, sentinel);
    }

    #[test]
    fn test_single_block_piece_full_lifecycle() {
        let cache = DiskCache::new();
        let st = storage(BLOCK);
        let loc = PieceLocation::new(0, 0);

        let payload = vec![0xCD; BLOCK];
        cache.insert(
            loc,
            0,
            WriteJob {
                storage: Arc::clone(&st),
                piece: 0,
                block_index: 0,
                buf: Bytes::from(payload.clone()),
            },
        );

        let mut completed = Vec::new();
        cache.kick_hasher(loc, &mut completed);

        let expected: PieceHash = {
            let mut h = Sha1::new();
            h.update(&payload);
            h.finalize().into()
        };
        let job = match cache.try_hash_piece(loc, HashJob::new()) {
            TryHash::Completed(job) => job,
            other => panic!("expected completion, got {:?}", other),
        };
        assert_eq!(job.piece_hash, expected);

        cache
            .flush_to_disk(write_all, 0, |_, _| panic!("no clears expected"))
            .unwrap();
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.num_pieces(), 0);
    }

    #[test]
    fn test_short_last_block_keeps_exact_length() {
        let cache = DiskCache::new();
        let st = storage(BLOCK + 1000);
        let loc = PieceLocation::new(0, 0);

        cache.insert(loc, 0, job(&st, loc, 0, 1));
        cache.insert(loc, 1, job(&st, loc, 1, 2));

        let mut len = 0;
        assert!(cache.get(loc, 1, |bytes| len = bytes.len()));
        assert_eq!(len, 1000);
    }

    #[test]
    fn test_small_piece_counts_one_block() {
        let cache = DiskCache::new();
        let st = storage(1000);
        let loc = PieceLocation::new(0, 0);

        cache.insert(
            loc,
            0,
            WriteJob {
                storage: Arc::clone(&st),
                piece: 0,
                block_index: 0,
                buf: Bytes::from(vec![9u8; 1000]),
            },
        );

        // one short block makes the piece complete
        let mut completed = Vec::new();
        cache.kick_hasher(loc, &mut completed);
        assert!(matches!(
            cache.try_hash_piece(loc, HashJob::new()),
            TryHash::Completed(_)
        ));
    }

    #[test]
    fn test_try_hash_piece_absent_posts_back() {
        let cache = DiskCache::new();
        let job = HashJob::new();
        assert!(matches!(
            cache.try_hash_piece(PieceLocation::new(1, 1), job),
            TryHash::Post(_)
        ));
    }
}
