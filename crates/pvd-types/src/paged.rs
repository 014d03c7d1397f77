//! Bit-packed paged metadata entries.
//!
//! One [`PagedEntry`] per chunk, two bytes on disk, two mirrored copies of
//! the whole region. The paged region is addressed in 4096-byte record-block
//! slabs of 2048 entries each.
//!
//! Bit positions are an implementation choice of this engine (no external
//! format compatibility is required); they are fixed here and covered by the
//! encoding tests below so they cannot drift silently.

use bitflags::bitflags;

/// Size of one chunk's paged entry on disk, in bytes.
pub const PAGED_ENTRY_SIZE: usize = 2;

/// Size of one record-block slab, in bytes.
pub const PAGED_SLAB_BYTES: usize = 4096;

/// Entries per record-block slab.
pub const SLAB_ENTRY_COUNT: usize = PAGED_SLAB_BYTES / PAGED_ENTRY_SIZE;

/// Size of one pool-variant entry on disk, in bytes.
pub const POOL_ENTRY_SIZE: usize = 1;

bitflags! {
    /// Per-chunk state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagedFlags: u16 {
        /// The entry has been painted with a known state. Entries with this
        /// bit clear must not be trusted by any consumer until reinitialized.
        const VALID = 0x0001;
        /// The chunk has never been formatted/zeroed; background zeroing
        /// must visit it.
        const NEED_ZERO = 0x0002;
        /// An explicit user-zero request is outstanding for this chunk.
        const USER_ZERO = 0x0004;
        /// The chunk is allocated to a consumer and must not be silently
        /// zeroed.
        const CONSUMED_USER_DATA = 0x0008;
    }
}

/// One chunk's paged metadata entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagedEntry(pub PagedFlags);

impl PagedEntry {
    /// The default-paint image: valid, needs zeroing, unconsumed.
    pub const DEFAULT_PAINT: Self = Self(PagedFlags::VALID.union(PagedFlags::NEED_ZERO));

    /// An entirely clear entry (uninitialized drive content decodes to this
    /// only if the media happened to hold zeros; `VALID` is what makes an
    /// entry trustworthy).
    pub const EMPTY: Self = Self(PagedFlags::empty());

    /// Decode from the on-disk little-endian representation. Unknown bits
    /// are preserved.
    #[must_use]
    pub fn from_bytes(bytes: [u8; PAGED_ENTRY_SIZE]) -> Self {
        Self(PagedFlags::from_bits_retain(u16::from_le_bytes(bytes)))
    }

    /// Encode to the on-disk little-endian representation.
    #[must_use]
    pub fn to_bytes(self) -> [u8; PAGED_ENTRY_SIZE] {
        self.0.bits().to_le_bytes()
    }

    /// Whether this entry has been painted with a known state.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0.contains(PagedFlags::VALID)
    }

    /// Whether every bit of `mask` is already set.
    #[must_use]
    pub const fn satisfies_set(self, mask: PagedFlags) -> bool {
        self.0.contains(mask)
    }

    /// Whether every bit of `mask` is already clear.
    #[must_use]
    pub fn satisfies_clear(self, mask: PagedFlags) -> bool {
        self.0.intersection(mask).is_empty()
    }

    /// Return the entry with `mask` bits set.
    #[must_use]
    pub const fn with_set(self, mask: PagedFlags) -> Self {
        Self(self.0.union(mask))
    }

    /// Return the entry with `mask` bits cleared.
    #[must_use]
    pub const fn with_cleared(self, mask: PagedFlags) -> Self {
        Self(self.0.difference(mask))
    }
}

/// Find the first entry that has not been painted with a known state.
///
/// Used to decide whether a media-level read is required before a cached
/// region can be trusted.
#[must_use]
pub fn first_invalid_entry(entries: &[PagedEntry]) -> Option<usize> {
    entries.iter().position(|entry| !entry.is_valid())
}

/// Pool-variant per-chunk entry: a provision drive backing an external
/// storage pool carries no consumed/zero semantics, just one reserved byte
/// per chunk with an all-zero default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolEntry(pub u8);

impl PoolEntry {
    /// The pool default-paint image.
    pub const DEFAULT_PAINT: Self = Self(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paint_bits() {
        let entry = PagedEntry::DEFAULT_PAINT;
        assert!(entry.is_valid());
        assert!(entry.satisfies_set(PagedFlags::NEED_ZERO));
        assert!(entry.satisfies_clear(PagedFlags::CONSUMED_USER_DATA));
        assert!(entry.satisfies_clear(PagedFlags::USER_ZERO));
    }

    #[test]
    fn test_on_disk_encoding_is_stable() {
        // Bit positions are part of the persisted format of this engine.
        assert_eq!(PagedEntry(PagedFlags::VALID).to_bytes(), [0x01, 0x00]);
        assert_eq!(PagedEntry(PagedFlags::NEED_ZERO).to_bytes(), [0x02, 0x00]);
        assert_eq!(PagedEntry(PagedFlags::USER_ZERO).to_bytes(), [0x04, 0x00]);
        assert_eq!(
            PagedEntry(PagedFlags::CONSUMED_USER_DATA).to_bytes(),
            [0x08, 0x00]
        );
        assert_eq!(PagedEntry::DEFAULT_PAINT.to_bytes(), [0x03, 0x00]);
    }

    #[test]
    fn test_unknown_bits_survive_round_trip() {
        let raw = [0xFF, 0xF0];
        let entry = PagedEntry::from_bytes(raw);
        assert_eq!(entry.to_bytes(), raw);
    }

    #[test]
    fn test_set_and_clear_masks() {
        let entry = PagedEntry::DEFAULT_PAINT.with_set(PagedFlags::CONSUMED_USER_DATA);
        assert!(entry.satisfies_set(PagedFlags::CONSUMED_USER_DATA));

        let cleared = entry.with_cleared(PagedFlags::NEED_ZERO | PagedFlags::USER_ZERO);
        assert!(cleared.satisfies_clear(PagedFlags::NEED_ZERO));
        assert!(cleared.is_valid());
        assert!(cleared.satisfies_set(PagedFlags::CONSUMED_USER_DATA));
    }

    #[test]
    fn test_first_invalid_entry_scan() {
        let painted = PagedEntry::DEFAULT_PAINT;
        let blank = PagedEntry::EMPTY;
        assert_eq!(first_invalid_entry(&[painted, painted]), None);
        assert_eq!(first_invalid_entry(&[painted, blank, painted]), Some(1));
        assert_eq!(first_invalid_entry(&[]), None);
    }

    #[test]
    fn test_slab_arithmetic() {
        assert_eq!(SLAB_ENTRY_COUNT, 2048);
        assert_eq!(SLAB_ENTRY_COUNT * PAGED_ENTRY_SIZE, PAGED_SLAB_BYTES);
    }
}
