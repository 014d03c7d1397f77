//! Address and count newtypes.
//!
//! An [`Lba`] equal to [`Lba::INVALID`] is the sentinel used throughout the
//! engine: for checkpoints it means "operation complete, nothing left to do".

use serde::{Deserialize, Serialize};

/// Logical block address on the exported drive address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lba(pub u64);

impl Lba {
    /// Sentinel: no valid address / background operation complete.
    pub const INVALID: Self = Self(u64::MAX);

    /// Address zero.
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this LBA is the invalid sentinel.
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        self.0 == u64::MAX
    }

    /// Saturating add of a block count; saturates to [`Lba::INVALID`].
    #[must_use]
    pub const fn saturating_add(self, blocks: BlockCount) -> Self {
        Self(self.0.saturating_add(blocks.0))
    }
}

impl std::fmt::Display for Lba {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_invalid() {
            write!(f, "INVALID")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Number of blocks in a request or region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockCount(pub u64);

impl BlockCount {
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// Index of a chunk within the paged metadata region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkIndex(pub u64);

impl ChunkIndex {
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Number of consecutive chunks covered by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkCount(pub u32);

impl ChunkCount {
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}
