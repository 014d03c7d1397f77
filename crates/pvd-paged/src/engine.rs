//! Chunk-entry updates over the stripe-locked paged region.

use pvd_error::{PvdError, Result};
use pvd_metasvc::{
    MetadataService, PagedSpan, SlabVerdict, UpdateMode, UpdateOutcome,
};
use pvd_types::chunk::{ChunkGeometry, ChunkRange};
use pvd_types::paged::{
    PagedEntry, PagedFlags, PoolEntry, PAGED_ENTRY_SIZE, PAGED_SLAB_BYTES, POOL_ENTRY_SIZE,
};
use pvd_types::units::ChunkIndex;
use tracing::debug;

/// The paged metadata engine for one drive object.
///
/// Borrows the metadata service; the owning object decides lifetimes.
pub struct PagedEngine<'a, S: MetadataService> {
    service: &'a S,
    geometry: ChunkGeometry,
}

impl<'a, S: MetadataService> PagedEngine<'a, S> {
    /// Build an engine over `service` with the object's fixed geometry.
    pub fn new(service: &'a S, geometry: ChunkGeometry) -> Self {
        Self { service, geometry }
    }

    /// The object's chunk geometry.
    #[must_use]
    pub const fn geometry(&self) -> &ChunkGeometry {
        &self.geometry
    }

    /// Byte span of a chunk range within the paged region.
    #[must_use]
    pub fn span_for(range: ChunkRange) -> PagedSpan {
        PagedSpan::new(
            ChunkGeometry::metadata_offset(range.start, PAGED_ENTRY_SIZE),
            range.count.get() as usize * PAGED_ENTRY_SIZE,
        )
    }

    fn full_range(&self) -> ChunkRange {
        ChunkRange {
            start: ChunkIndex(0),
            count: pvd_types::units::ChunkCount(self.geometry.total_chunks() as u32),
        }
    }

    fn check_range(&self, range: ChunkRange) -> Result<()> {
        if range.end_exclusive().get() > self.geometry.total_chunks() {
            return Err(PvdError::OutOfRange {
                what: "chunk range".to_owned(),
                value: format!("{}..{}", range.start.get(), range.end_exclusive().get()),
            });
        }
        Ok(())
    }

    /// Paint every entry across the full paged capacity with the default
    /// image (valid, needs zeroing, unconsumed). Both mirror copies receive
    /// the identical repeat-painted record. Idempotent.
    pub fn default_paint(&self) -> Result<()> {
        let range = self.full_range();
        let span = Self::span_for(range);
        debug!(
            target: "pvd::paged",
            chunks = range.count.get(),
            "default-painting paged region"
        );
        self.service.paged_write(
            span,
            &PagedEntry::DEFAULT_PAINT.to_bytes(),
            range.count.get() as usize,
        )
    }

    /// Pool-variant paint: one all-zero byte per chunk, no consumed/zero
    /// semantics.
    pub fn pool_default_paint(&self) -> Result<()> {
        let chunks = self.geometry.total_chunks() as usize;
        let span = PagedSpan::new(0, chunks * POOL_ENTRY_SIZE);
        debug!(target: "pvd::paged", chunks, "default-painting pool paged region");
        self.service
            .paged_write(span, &[PoolEntry::DEFAULT_PAINT.0], chunks)
    }

    /// Set `mask` bits on every entry in range. Returns
    /// [`UpdateOutcome::NoWriteNeeded`] when every entry already satisfies
    /// the mask.
    pub fn set_bits(&self, range: ChunkRange, mask: PagedFlags) -> Result<UpdateOutcome> {
        self.check_range(range)?;
        let span = Self::span_for(range);
        let _stripe = self.service.stripe_lock(span);
        self.service.paged_update(
            span,
            PAGED_ENTRY_SIZE,
            UpdateMode::ReadModifyWrite,
            &mut |cursor: &mut pvd_metasvc::EntryCursor<'_>| {
                let mut verdict = SlabVerdict::Clean;
                while let Some(bytes) = cursor.next_entry() {
                    let entry = PagedEntry::from_bytes([bytes[0], bytes[1]]);
                    if !entry.satisfies_set(mask) {
                        bytes.copy_from_slice(&entry.with_set(mask).to_bytes());
                        verdict = SlabVerdict::Dirty;
                    }
                }
                Ok(verdict)
            },
        )
    }

    /// Clear `mask` bits on every entry in range, with the same read-only
    /// fast path as [`PagedEngine::set_bits`].
    pub fn clear_bits(&self, range: ChunkRange, mask: PagedFlags) -> Result<UpdateOutcome> {
        self.check_range(range)?;
        let span = Self::span_for(range);
        let _stripe = self.service.stripe_lock(span);
        self.service.paged_update(
            span,
            PAGED_ENTRY_SIZE,
            UpdateMode::ReadModifyWrite,
            &mut |cursor: &mut pvd_metasvc::EntryCursor<'_>| {
                let mut verdict = SlabVerdict::Clean;
                while let Some(bytes) = cursor.next_entry() {
                    let entry = PagedEntry::from_bytes([bytes[0], bytes[1]]);
                    if !entry.satisfies_clear(mask) {
                        bytes.copy_from_slice(&entry.with_cleared(mask).to_bytes());
                        verdict = SlabVerdict::Dirty;
                    }
                }
                Ok(verdict)
            },
        )
    }

    /// Unconditionally overwrite every entry in range with `exact`.
    pub fn write_record(
        &self,
        range: ChunkRange,
        exact: PagedEntry,
        mode: UpdateMode,
    ) -> Result<()> {
        self.check_range(range)?;
        let span = Self::span_for(range);
        let _stripe = self.service.stripe_lock(span);
        let bytes = exact.to_bytes();
        self.service
            .paged_update(
                span,
                PAGED_ENTRY_SIZE,
                mode,
                &mut |cursor: &mut pvd_metasvc::EntryCursor<'_>| {
                    while let Some(slot) = cursor.next_entry() {
                        slot.copy_from_slice(&bytes);
                    }
                    Ok(SlabVerdict::Dirty)
                },
            )
            .map(|_| ())
    }

    /// Write-verify retry tier: rewrite the range with `exact`, forcing the
    /// valid and consumed bits into the record since the on-media entries
    /// can no longer be trusted.
    pub fn write_verify(&self, range: ChunkRange, exact: PagedEntry) -> Result<()> {
        let forced = exact.with_set(PagedFlags::VALID | PagedFlags::CONSUMED_USER_DATA);
        debug!(
            target: "pvd::paged",
            start = range.start.get(),
            count = range.count.get(),
            "re-issuing paged update as write-verify"
        );
        self.write_record(range, forced, UpdateMode::WriteVerify)
    }

    /// Find the first entry in range that has not been painted with a known
    /// state. Returns its absolute chunk index.
    pub fn first_invalid_chunk(&self, range: ChunkRange) -> Result<Option<ChunkIndex>> {
        self.scan(range, |entry| !entry.is_valid())
    }

    /// Find the first chunk at or after `from` still marked for zeroing
    /// (explicit user request or never formatted).
    pub fn next_need_zero_chunk(&self, from: ChunkIndex) -> Result<Option<ChunkIndex>> {
        let total = self.geometry.total_chunks();
        if from.get() >= total {
            return Ok(None);
        }
        let range = ChunkRange {
            start: from,
            count: pvd_types::units::ChunkCount((total - from.get()) as u32),
        };
        self.scan(range, |entry| {
            entry.satisfies_set(PagedFlags::NEED_ZERO)
                || entry.satisfies_set(PagedFlags::USER_ZERO)
        })
    }

    /// Whether one chunk is marked for zeroing.
    pub fn is_chunk_marked_for_zero(&self, index: ChunkIndex) -> Result<bool> {
        let range = ChunkRange {
            start: index,
            count: pvd_types::units::ChunkCount(1),
        };
        Ok(self
            .scan(range, |entry| {
                entry.satisfies_set(PagedFlags::NEED_ZERO)
                    || entry.satisfies_set(PagedFlags::USER_ZERO)
            })?
            .is_some())
    }

    /// Per-chunk need-zero states for a range, in chunk order. Used to
    /// populate the paged metadata cache in one read.
    pub fn need_zero_map(&self, range: ChunkRange) -> Result<Vec<bool>> {
        self.check_range(range)?;
        let mut map = Vec::with_capacity(range.count.get() as usize);
        self.for_each_entry(range, |_, entry| {
            map.push(
                entry.satisfies_set(PagedFlags::NEED_ZERO)
                    || entry.satisfies_set(PagedFlags::USER_ZERO),
            );
            false
        })?;
        Ok(map)
    }

    /// Count the chunks in range still marked for zeroing.
    pub fn count_need_zero_chunks(&self, range: ChunkRange) -> Result<u64> {
        self.check_range(range)?;
        let mut count = 0_u64;
        self.for_each_entry(range, |_, entry| {
            if entry.satisfies_set(PagedFlags::NEED_ZERO)
                || entry.satisfies_set(PagedFlags::USER_ZERO)
            {
                count += 1;
            }
            false
        })?;
        Ok(count)
    }

    /// Scan for the first entry matching `predicate`, slab by slab.
    fn scan(
        &self,
        range: ChunkRange,
        predicate: impl Fn(PagedEntry) -> bool,
    ) -> Result<Option<ChunkIndex>> {
        self.check_range(range)?;
        let mut found = None;
        self.for_each_entry(range, |index, entry| {
            if predicate(entry) {
                found = Some(index);
                true
            } else {
                false
            }
        })?;
        Ok(found)
    }

    /// Drive `visit` over every entry in range, reading one record-block
    /// slab's worth of entries at a time. `visit` returns `true` to stop.
    fn for_each_entry(
        &self,
        range: ChunkRange,
        mut visit: impl FnMut(ChunkIndex, PagedEntry) -> bool,
    ) -> Result<()> {
        let entries_per_step = PAGED_SLAB_BYTES / PAGED_ENTRY_SIZE;
        let mut next = range.start.get();
        let end = range.end_exclusive().get();
        while next < end {
            let step = (end - next).min(entries_per_step as u64);
            let span = PagedSpan::new(
                next * PAGED_ENTRY_SIZE as u64,
                step as usize * PAGED_ENTRY_SIZE,
            );
            let _stripe = self.service.stripe_lock(span);
            let mut buffer = self.service.paged_read(span)?;
            let mut cursor = buffer.cursor(PAGED_ENTRY_SIZE);
            let mut index = next;
            while let Some(bytes) = cursor.next_entry() {
                let entry = PagedEntry::from_bytes([bytes[0], bytes[1]]);
                if visit(ChunkIndex(index), entry) {
                    return Ok(());
                }
                index += 1;
            }
            next += step;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvd_metasvc::{FaultOp, MemoryMetadataService};
    use pvd_error::MetadataStatus;
    use pvd_types::units::{BlockCount, ChunkCount, Lba};

    const CAPACITY: u64 = 1_000_000;
    const CHUNK: u64 = 2048;

    fn setup() -> (MemoryMetadataService, ChunkGeometry) {
        let geometry = ChunkGeometry::new(CHUNK, Lba(CAPACITY)).unwrap();
        let service =
            MemoryMetadataService::new(geometry.total_chunks() * PAGED_ENTRY_SIZE as u64);
        (service, geometry)
    }

    fn range(start: u64, count: u32) -> ChunkRange {
        ChunkRange {
            start: ChunkIndex(start),
            count: ChunkCount(count),
        }
    }

    #[test]
    fn test_default_paint_paints_every_entry() {
        let (service, geometry) = setup();
        let engine = PagedEngine::new(&service, geometry);
        engine.default_paint().unwrap();

        let image = service.mirror_image(0);
        let expected = PagedEntry::DEFAULT_PAINT.to_bytes();
        for chunk in 0..geometry.total_chunks() as usize {
            assert_eq!(
                &image[chunk * 2..chunk * 2 + 2],
                &expected,
                "chunk {chunk} not default-painted"
            );
        }
        assert_eq!(image, service.mirror_image(1));
    }

    #[test]
    fn test_default_paint_is_idempotent() {
        let (service, geometry) = setup();
        let engine = PagedEngine::new(&service, geometry);
        engine.default_paint().unwrap();
        let first = (service.mirror_image(0), service.mirror_image(1));
        engine.default_paint().unwrap();
        let second = (service.mirror_image(0), service.mirror_image(1));
        assert_eq!(first, second);
    }

    #[test]
    fn test_set_bits_then_fast_path() {
        let (service, geometry) = setup();
        let engine = PagedEngine::new(&service, geometry);
        engine.default_paint().unwrap();

        let outcome = engine
            .set_bits(range(2, 1), PagedFlags::CONSUMED_USER_DATA)
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Written);

        // Second application changes nothing and performs no write.
        let writes_before = service.counters().paged_update_writes;
        let outcome = engine
            .set_bits(range(2, 1), PagedFlags::CONSUMED_USER_DATA)
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::NoWriteNeeded);
        assert_eq!(service.counters().paged_update_writes, writes_before);
    }

    #[test]
    fn test_set_bits_leaves_neighbors_unchanged() {
        let (service, geometry) = setup();
        let engine = PagedEngine::new(&service, geometry);
        engine.default_paint().unwrap();

        // capacity=1,000,000 / chunk=2,048: lba 4096 len 2048 is chunk 2.
        let target = geometry
            .exact_chunk_range(Lba(4096), BlockCount(2048))
            .unwrap();
        assert_eq!(target, range(2, 1));
        engine
            .set_bits(target, PagedFlags::CONSUMED_USER_DATA)
            .unwrap();

        let image = service.mirror_image(0);
        let consumed = PagedEntry::DEFAULT_PAINT
            .with_set(PagedFlags::CONSUMED_USER_DATA)
            .to_bytes();
        let untouched = PagedEntry::DEFAULT_PAINT.to_bytes();
        assert_eq!(&image[4..6], &consumed);
        assert_eq!(&image[2..4], &untouched);
        assert_eq!(&image[6..8], &untouched);
    }

    #[test]
    fn test_clear_bits_after_zeroing() {
        let (service, geometry) = setup();
        let engine = PagedEngine::new(&service, geometry);
        engine.default_paint().unwrap();

        let outcome = engine
            .clear_bits(range(0, 4), PagedFlags::NEED_ZERO | PagedFlags::USER_ZERO)
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Written);

        let image = service.mirror_image(0);
        let zeroed = PagedEntry::DEFAULT_PAINT
            .with_cleared(PagedFlags::NEED_ZERO)
            .to_bytes();
        assert_eq!(&image[0..2], &zeroed);

        // Clearing again is the fast path.
        let outcome = engine
            .clear_bits(range(0, 4), PagedFlags::NEED_ZERO | PagedFlags::USER_ZERO)
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::NoWriteNeeded);
    }

    #[test]
    fn test_write_verify_forces_valid_and_consumed() {
        let (service, geometry) = setup();
        let engine = PagedEngine::new(&service, geometry);
        engine.default_paint().unwrap();

        engine
            .write_verify(range(5, 2), PagedEntry::EMPTY)
            .unwrap();

        let image = service.mirror_image(0);
        let forced = PagedEntry::EMPTY
            .with_set(PagedFlags::VALID | PagedFlags::CONSUMED_USER_DATA)
            .to_bytes();
        assert_eq!(&image[10..12], &forced);
        assert_eq!(&image[12..14], &forced);
        assert_eq!(service.counters().write_verify_updates, 1);
    }

    #[test]
    fn test_validity_scan_detects_unpainted_entries() {
        let (service, geometry) = setup();
        let engine = PagedEngine::new(&service, geometry);
        // No paint: everything reads as invalid (all-zero media).
        let full = range(0, geometry.total_chunks() as u32);
        assert_eq!(
            engine.first_invalid_chunk(full).unwrap(),
            Some(ChunkIndex(0))
        );

        engine.default_paint().unwrap();
        assert_eq!(engine.first_invalid_chunk(full).unwrap(), None);

        // Corrupt one entry back to unpainted.
        engine
            .write_record(range(7, 1), PagedEntry::EMPTY, UpdateMode::ReadModifyWrite)
            .unwrap();
        assert_eq!(
            engine.first_invalid_chunk(full).unwrap(),
            Some(ChunkIndex(7))
        );
    }

    #[test]
    fn test_need_zero_scans() {
        let (service, geometry) = setup();
        let engine = PagedEngine::new(&service, geometry);
        engine.default_paint().unwrap();

        // Zero the first three chunks.
        engine
            .clear_bits(range(0, 3), PagedFlags::NEED_ZERO | PagedFlags::USER_ZERO)
            .unwrap();

        assert_eq!(
            engine.next_need_zero_chunk(ChunkIndex(0)).unwrap(),
            Some(ChunkIndex(3))
        );
        assert!(!engine.is_chunk_marked_for_zero(ChunkIndex(1)).unwrap());
        assert!(engine.is_chunk_marked_for_zero(ChunkIndex(3)).unwrap());
        assert_eq!(engine.count_need_zero_chunks(range(0, 8)).unwrap(), 5);
    }

    #[test]
    fn test_scan_past_capacity_is_rejected() {
        let (service, geometry) = setup();
        let engine = PagedEngine::new(&service, geometry);
        let total = geometry.total_chunks();
        let err = engine
            .set_bits(range(total - 1, 2), PagedFlags::CONSUMED_USER_DATA)
            .unwrap_err();
        assert!(matches!(err, PvdError::OutOfRange { .. }));
    }

    #[test]
    fn test_update_surfaces_service_fault() {
        let (service, geometry) = setup();
        let engine = PagedEngine::new(&service, geometry);
        engine.default_paint().unwrap();
        service.inject_fault(FaultOp::PagedUpdate, MetadataStatus::IoUncorrectable);
        let err = engine
            .set_bits(range(0, 1), PagedFlags::CONSUMED_USER_DATA)
            .unwrap_err();
        assert!(matches!(
            err,
            PvdError::IoFailed {
                status: MetadataStatus::IoUncorrectable,
                ..
            }
        ));
        // The stripe lock was released on the error path.
        assert_eq!(service.counters().paged_update_writes, 0);
        engine
            .set_bits(range(0, 1), PagedFlags::CONSUMED_USER_DATA)
            .unwrap();
    }

    #[test]
    fn test_pool_default_paint() {
        let geometry = ChunkGeometry::new(CHUNK, Lba(CAPACITY)).unwrap();
        let service =
            MemoryMetadataService::new(geometry.total_chunks() * POOL_ENTRY_SIZE as u64);
        let engine = PagedEngine::new(&service, geometry);
        engine.pool_default_paint().unwrap();
        assert!(service.mirror_image(0).iter().all(|byte| *byte == 0));
        assert_eq!(service.counters().paged_writes, 1);
    }
}
