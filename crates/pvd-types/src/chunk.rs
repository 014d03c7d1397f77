//! Chunk-range arithmetic over the exported drive address space.
//!
//! Two rounding contracts exist and both are load-bearing:
//!
//! - [`ChunkGeometry::chunk_range`] ("with edges") rounds outward so partial
//!   chunks at either end are covered. Used when every touched chunk must be
//!   visited, e.g. consuming metadata for a host write.
//! - [`ChunkGeometry::chunk_range_without_edges`] rounds inward and covers
//!   only fully-owned interior chunks. Used when partially covered chunks
//!   must not be touched, e.g. the system-drive zero area above a default
//!   offset.
//!
//! The alignment-checked entry point [`ChunkGeometry::exact_chunk_range`]
//! never rounds: a misaligned call there is a caller bug and fails fast.

use pvd_error::{InvalidRequestQualifier, PvdError, Result};

use crate::units::{BlockCount, ChunkCount, ChunkIndex, Lba};

/// A contiguous run of chunk indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// First chunk covered.
    pub start: ChunkIndex,
    /// Number of chunks covered.
    pub count: ChunkCount,
}

impl ChunkRange {
    /// One-past-the-last chunk index.
    #[must_use]
    pub const fn end_exclusive(&self) -> ChunkIndex {
        ChunkIndex(self.start.0 + self.count.0 as u64)
    }

    /// Iterate the covered chunk indexes.
    pub fn indexes(&self) -> impl Iterator<Item = ChunkIndex> + use<> {
        (self.start.0..self.end_exclusive().0).map(ChunkIndex)
    }

    /// Whether `index` falls inside this range.
    #[must_use]
    pub const fn contains(&self, index: ChunkIndex) -> bool {
        index.0 >= self.start.0 && index.0 < self.start.0 + self.count.0 as u64
    }
}

/// Fixed geometry of a drive's paged metadata region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGeometry {
    chunk_size: u64,
    exported_capacity: Lba,
}

impl ChunkGeometry {
    /// Build a geometry from the chunk size (in blocks) and the exported
    /// capacity. Both are fixed for the life of the object.
    pub fn new(chunk_size: u64, exported_capacity: Lba) -> Result<Self> {
        if chunk_size == 0 {
            return Err(PvdError::OutOfRange {
                what: "chunk size".to_owned(),
                value: "0".to_owned(),
            });
        }
        if exported_capacity.is_invalid() || exported_capacity.get() == 0 {
            return Err(PvdError::invalid(InvalidRequestQualifier::InvalidLbaRange));
        }
        Ok(Self {
            chunk_size,
            exported_capacity,
        })
    }

    /// Chunk size in blocks.
    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Exported capacity in blocks.
    #[must_use]
    pub const fn exported_capacity(&self) -> Lba {
        self.exported_capacity
    }

    /// Total chunk count backing the exported capacity (rounded up).
    #[must_use]
    pub const fn total_chunks(&self) -> u64 {
        self.exported_capacity.get().div_ceil(self.chunk_size)
    }

    /// First LBA of `index`.
    #[must_use]
    pub const fn chunk_start_lba(&self, index: ChunkIndex) -> Lba {
        Lba(index.0 * self.chunk_size)
    }

    /// Whether an LBA range starts and ends on chunk boundaries.
    #[must_use]
    pub const fn is_aligned(&self, lba: Lba, blocks: BlockCount) -> bool {
        lba.get() % self.chunk_size == 0 && blocks.get() % self.chunk_size == 0
    }

    /// Compute the chunk range covering `[lba, lba + blocks)`, rounding
    /// outward so partial chunks at both ends are included.
    pub fn chunk_range(&self, lba: Lba, blocks: BlockCount) -> Result<ChunkRange> {
        if lba.is_invalid() || blocks.is_zero() {
            return Err(PvdError::invalid(InvalidRequestQualifier::InvalidLbaRange));
        }
        let start_chunk = lba.get() / self.chunk_size;
        let end_lba = lba.get() + blocks.get();
        let end_chunk = end_lba.div_ceil(self.chunk_size);
        Ok(ChunkRange {
            start: ChunkIndex(start_chunk),
            count: ChunkCount((end_chunk - start_chunk) as u32),
        })
    }

    /// Compute the chunk range wholly contained in `[lba, lba + blocks)`,
    /// rounding inward. Returns `None` when no full chunk is covered.
    pub fn chunk_range_without_edges(
        &self,
        lba: Lba,
        blocks: BlockCount,
    ) -> Result<Option<ChunkRange>> {
        if lba.is_invalid() {
            return Err(PvdError::invalid(InvalidRequestQualifier::InvalidLbaRange));
        }
        if blocks.get() < self.chunk_size {
            return Ok(None);
        }
        let start_chunk = lba.get().div_ceil(self.chunk_size);
        let end_lba = lba.get() + blocks.get();
        let end_chunk = end_lba / self.chunk_size;
        if end_chunk <= start_chunk {
            return Ok(None);
        }
        Ok(Some(ChunkRange {
            start: ChunkIndex(start_chunk),
            count: ChunkCount((end_chunk - start_chunk) as u32),
        }))
    }

    /// Alignment-checked range computation for write paths that must never
    /// silently round. Distinguishes misalignment from capacity overrun.
    pub fn exact_chunk_range(&self, lba: Lba, blocks: BlockCount) -> Result<ChunkRange> {
        if lba.is_invalid() || blocks.is_zero() {
            return Err(PvdError::invalid(InvalidRequestQualifier::InvalidLbaRange));
        }
        if !self.is_aligned(lba, blocks) {
            return Err(PvdError::invalid(
                InvalidRequestQualifier::UnalignedZeroRequest,
            ));
        }
        if lba.get() + blocks.get() > self.exported_capacity.get() {
            return Err(PvdError::invalid(InvalidRequestQualifier::CapacityExceeded));
        }
        self.chunk_range(lba, blocks)
    }

    /// Byte offset of a chunk's entry within the paged region.
    #[must_use]
    pub const fn metadata_offset(index: ChunkIndex, entry_size: usize) -> u64 {
        index.0 * entry_size as u64
    }
}
