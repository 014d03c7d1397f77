//! Paged metadata cache.
//!
//! A small fixed-slot cache of per-chunk need-zero state so the I/O path
//! can gate zero-on-demand reads without a paged read per request. Slots
//! are evicted least-recently-used; any paged mutation that touches a
//! cached range invalidates the slot. While the cache is being flushed,
//! checkpoint peer synchronization is deferred (see the increment policy in
//! `pvd-nonpaged`).

use parking_lot::Mutex;
use pvd_nonpaged::FlushGate;
use pvd_types::chunk::ChunkRange;
use pvd_types::units::ChunkIndex;

/// Chunks covered by one cache slot.
pub const CACHE_SLOT_CHUNKS: usize = 128;

/// Slot count.
pub const CACHE_MAX_SLOTS: usize = 4;

#[derive(Debug, Clone)]
struct CacheSlot {
    start_chunk: u64,
    last_io: u64,
    /// One bit per chunk; set = chunk still needs zeroing.
    bits: [u8; CACHE_SLOT_CHUNKS / 8],
}

impl CacheSlot {
    fn covers(&self, chunk: u64) -> bool {
        chunk >= self.start_chunk && chunk < self.start_chunk + CACHE_SLOT_CHUNKS as u64
    }

    fn needs_zero(&self, chunk: u64) -> bool {
        let bit = (chunk - self.start_chunk) as usize;
        self.bits[bit / 8] & (1 << (bit % 8)) != 0
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    slots: Vec<CacheSlot>,
    io_counter: u64,
    hits: u64,
    misses: u64,
    flushing: bool,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// The per-object paged metadata cache.
#[derive(Debug, Default)]
pub struct PagedMetadataCache {
    inner: Mutex<CacheInner>,
}

impl PagedMetadataCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up one chunk's need-zero state. `None` on miss.
    pub fn lookup(&self, chunk: ChunkIndex) -> Option<bool> {
        let mut inner = self.inner.lock();
        inner.io_counter += 1;
        let io = inner.io_counter;
        let found = inner
            .slots
            .iter_mut()
            .find(|slot| slot.covers(chunk.get()))
            .map(|slot| {
                slot.last_io = io;
                slot.needs_zero(chunk.get())
            });
        match found {
            Some(needs_zero) => {
                inner.hits += 1;
                Some(needs_zero)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Install a slot covering `[start_chunk, start_chunk + len)` from the
    /// freshly read need-zero states, evicting the least recently used slot
    /// when full. `states` beyond one slot's coverage are ignored.
    pub fn populate(&self, start_chunk: ChunkIndex, states: &[bool]) {
        let mut bits = [0_u8; CACHE_SLOT_CHUNKS / 8];
        for (index, needs_zero) in states.iter().take(CACHE_SLOT_CHUNKS).enumerate() {
            if *needs_zero {
                bits[index / 8] |= 1 << (index % 8);
            }
        }
        let mut inner = self.inner.lock();
        inner.io_counter += 1;
        let slot = CacheSlot {
            start_chunk: start_chunk.get(),
            last_io: inner.io_counter,
            bits,
        };
        // Replace an existing slot for the same start, else evict LRU.
        if let Some(existing) = inner
            .slots
            .iter_mut()
            .find(|existing| existing.start_chunk == slot.start_chunk)
        {
            *existing = slot;
        } else if inner.slots.len() < CACHE_MAX_SLOTS {
            inner.slots.push(slot);
        } else if let Some(victim) = inner
            .slots
            .iter_mut()
            .min_by_key(|existing| existing.last_io)
        {
            *victim = slot;
        }
    }

    /// Drop any slot overlapping `range` (called on every paged mutation).
    pub fn invalidate_range(&self, range: ChunkRange) {
        let mut inner = self.inner.lock();
        inner.slots.retain(|slot| {
            let slot_end = slot.start_chunk + CACHE_SLOT_CHUNKS as u64;
            slot_end <= range.start.get() || slot.start_chunk >= range.end_exclusive().get()
        });
    }

    /// Counters snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
        }
    }

    /// Mark a flush in progress; cleared when the guard drops.
    pub fn begin_flush(&self) -> FlushGuard<'_> {
        self.inner.lock().flushing = true;
        FlushGuard { cache: self }
    }
}

impl FlushGate for PagedMetadataCache {
    fn is_mid_flush(&self) -> bool {
        self.inner.lock().flushing
    }
}

/// Clears the flushing mark on drop.
pub struct FlushGuard<'a> {
    cache: &'a PagedMetadataCache,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.cache.inner.lock().flushing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvd_types::units::ChunkCount;

    fn range(start: u64, count: u32) -> ChunkRange {
        ChunkRange {
            start: ChunkIndex(start),
            count: ChunkCount(count),
        }
    }

    #[test]
    fn test_miss_then_populate_then_hit() {
        let cache = PagedMetadataCache::new();
        assert_eq!(cache.lookup(ChunkIndex(5)), None);

        let mut states = vec![false; CACHE_SLOT_CHUNKS];
        states[5] = true;
        cache.populate(ChunkIndex(0), &states);

        assert_eq!(cache.lookup(ChunkIndex(5)), Some(true));
        assert_eq!(cache.lookup(ChunkIndex(6)), Some(false));
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = PagedMetadataCache::new();
        for slot in 0..CACHE_MAX_SLOTS as u64 {
            cache.populate(
                ChunkIndex(slot * CACHE_SLOT_CHUNKS as u64),
                &[false; CACHE_SLOT_CHUNKS],
            );
        }
        // Touch slot 0 so slot 1 becomes the LRU victim.
        cache.lookup(ChunkIndex(0));
        cache.populate(
            ChunkIndex(10_000),
            &[true; CACHE_SLOT_CHUNKS],
        );
        assert_eq!(cache.lookup(ChunkIndex(0)), Some(false), "slot 0 kept");
        assert_eq!(
            cache.lookup(ChunkIndex(CACHE_SLOT_CHUNKS as u64)),
            None,
            "slot 1 evicted"
        );
        assert_eq!(cache.lookup(ChunkIndex(10_000)), Some(true));
    }

    #[test]
    fn test_invalidate_range_drops_overlapping_slot() {
        let cache = PagedMetadataCache::new();
        cache.populate(ChunkIndex(0), &[true; CACHE_SLOT_CHUNKS]);
        cache.populate(ChunkIndex(256), &[true; CACHE_SLOT_CHUNKS]);

        cache.invalidate_range(range(100, 10));
        assert_eq!(cache.lookup(ChunkIndex(0)), None, "overlapping slot dropped");
        assert_eq!(cache.lookup(ChunkIndex(256)), Some(true), "disjoint slot kept");
    }

    #[test]
    fn test_flush_gate() {
        let cache = PagedMetadataCache::new();
        assert!(!cache.is_mid_flush());
        {
            let _flush = cache.begin_flush();
            assert!(cache.is_mid_flush());
        }
        assert!(!cache.is_mid_flush());
    }
}
