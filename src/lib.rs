//! rcache - A block-level disk cache for BitTorrent engines
//!
//! This library sits between a piece I/O layer and persistent storage. It
//! buffers inbound block data (arriving from peers, possibly out of order),
//! drives the incremental v1 (SHA-1) piece hash and optional v2 (SHA-256)
//! block hashes, and flushes buffered blocks to disk in an order chosen to
//! minimize future read-backs.
//!
//! # Modules
//!
//! - [`cache`] - The [`DiskCache`] façade: ingest, hashing and flush drivers
//! - [`job`] - Engine-facing job types and the [`StorageHandle`] contract
//! - [`bitfield`] - Flushed-block bitmap handed to flush writers
//! - [`error`] - Error type for writer aborts
//! - [`constants`] - Block size and tuning constants

pub mod bitfield;
pub mod cache;
pub mod constants;
pub mod error;
pub mod job;

mod block;
mod piece;
mod store;

pub use bitfield::Bitfield;
pub use cache::{DiskCache, FlushBlock};
pub use error::CacheError;
pub use job::{
    BlockHash, ClearJob, HashJob, PieceHash, PieceIndex, PieceLocation, StorageHandle, StorageId,
    TryHash, WriteJob,
};
