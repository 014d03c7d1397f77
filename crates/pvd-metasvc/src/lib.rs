//! The external metadata-service seam.
//!
//! Everything above this crate treats the stripe-locked paged region and the
//! non-paged record as services consumed through the [`MetadataService`]
//! trait. [`MemoryMetadataService`] is the fully in-memory implementation
//! used by tests, with per-operation fault injection and a crash/recovery
//! model for persistence assertions.

pub mod locks;
pub mod memory;
pub mod service;
pub mod slab;

pub use locks::{NpLock, NpLockGuard, StripeLockGuard, StripeLockTable};
pub use memory::{FaultOp, MemoryMetadataService, OpCounters};
pub use service::{
    MetadataService, PagedSpan, PagedUpdateCallback, SlabVerdict, UpdateMode, UpdateOutcome,
};
pub use slab::{EntryCursor, SlabBuffer, SlabList};
