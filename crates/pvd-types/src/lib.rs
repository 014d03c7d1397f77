//! Core type definitions for the provision-drive metadata engine.
//!
//! Everything here is pure data: LBA/chunk newtypes, chunk-range arithmetic,
//! the bit-packed paged metadata entry, the fixed-layout non-paged record,
//! and the engine's configuration tunables. No I/O happens in this crate.

pub mod chunk;
pub mod config;
pub mod nonpaged;
pub mod paged;
pub mod units;

pub use chunk::{ChunkGeometry, ChunkRange};
pub use config::PvdConfig;
pub use nonpaged::{
    CheckpointField, DriveLocation, DriveType, NonPagedField, NonPagedRecord, NpFlags,
    SwapPendingReason, NP_RECORD_SIZE,
};
pub use paged::{
    PagedEntry, PagedFlags, PoolEntry, PAGED_ENTRY_SIZE, PAGED_SLAB_BYTES, POOL_ENTRY_SIZE,
    SLAB_ENTRY_COUNT,
};
pub use units::{BlockCount, ChunkCount, ChunkIndex, Lba};
