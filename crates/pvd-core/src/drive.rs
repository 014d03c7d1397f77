//! The provision-drive object.
//!
//! Owns the metadata seams for one virtualized drive and exposes the
//! control surface the object dispatcher calls. Construction wires the
//! non-paged manager, paged engine, metadata cache, key table, and sniff
//! report together; the individual engines stay independently testable.

use std::sync::Arc;

use parking_lot::Mutex;
use pvd_error::Result;
use pvd_metasvc::MetadataService;
use pvd_nonpaged::{Clock, IncrementOutcome, NonPagedManager, PeerNotifier};
use pvd_paged::PagedEngine;
use pvd_types::chunk::{ChunkGeometry, ChunkRange};
use pvd_types::config::PvdConfig;
use pvd_types::nonpaged::{
    CheckpointField, DriveLocation, NonPagedRecord, NpFlags, SwapPendingReason,
};
use pvd_types::paged::PagedFlags;
use pvd_types::units::{BlockCount, ChunkCount, ChunkIndex, Lba};
use tracing::{debug, info};

use crate::cache::{CACHE_SLOT_CHUNKS, PagedMetadataCache};
use crate::consume::{ConsumeOp, ConsumeOutcome, PagedUpdateRequest, SweepControl};
use crate::events::{EventLog, PvdEvent};
use crate::keys::{ClientKeyInfo, ValidationAreaIo, ValidationAreaManager};
use crate::report::SniffVerifyReport;
use crate::zero::{ZeroPipeline, ZeroTarget};

/// What the drive backs: a RAID group (full consumed/zero semantics) or an
/// external storage pool (simplified pool paged entries).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigType {
    RaidGroup,
    ExternalPool,
}

/// Result of one background-zero monitor cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundZeroProgress {
    /// One chunk was zeroed and the checkpoint advanced.
    Advanced {
        /// The chunk visited this cycle.
        chunk: ChunkIndex,
        /// The checkpoint after the advance.
        checkpoint: Lba,
    },
    /// Nothing left to zero; the checkpoint is `INVALID`.
    Complete,
}

/// One provision-drive object.
pub struct ProvisionDrive<S, C, P>
where
    S: MetadataService,
    C: Clock,
    P: PeerNotifier,
{
    service: Arc<S>,
    config: PvdConfig,
    config_type: ConfigType,
    geometry: ChunkGeometry,
    nonpaged: NonPagedManager<S, C, P>,
    cache: PagedMetadataCache,
    clients: Mutex<Vec<ClientKeyInfo>>,
    report: Mutex<SniffVerifyReport>,
    validation_io: Arc<dyn ValidationAreaIo + Send + Sync>,
    events: Arc<dyn EventLog + Send + Sync>,
}

/// Arms the verify-invalidate sweep through the non-paged manager.
struct SweepArmer<'a, S, C, P>
where
    S: MetadataService,
    C: Clock,
    P: PeerNotifier,
{
    nonpaged: &'a NonPagedManager<S, C, P>,
}

impl<S, C, P> SweepControl for SweepArmer<'_, S, C, P>
where
    S: MetadataService,
    C: Clock,
    P: PeerNotifier,
{
    fn arm_verify_invalidate(&self) -> Result<()> {
        self.nonpaged.with_np_txn(|txn| {
            if txn.checkpoint(CheckpointField::VerifyInvalidate)?.is_invalid() {
                txn.set_checkpoint(CheckpointField::VerifyInvalidate, Lba::ZERO, true)?;
            }
            Ok(())
        })
    }
}

impl<S, C, P> ProvisionDrive<S, C, P>
where
    S: MetadataService,
    C: Clock,
    P: PeerNotifier,
{
    /// Wire up a drive object over its metadata service. No metadata is
    /// touched until [`ProvisionDrive::specialize`] or
    /// [`ProvisionDrive::load`].
    pub fn new(
        service: Arc<S>,
        clock: C,
        peer: P,
        config: PvdConfig,
        exported_capacity: Lba,
        config_type: ConfigType,
        validation_io: Arc<dyn ValidationAreaIo + Send + Sync>,
        events: Arc<dyn EventLog + Send + Sync>,
    ) -> Result<Self> {
        let geometry = ChunkGeometry::new(config.chunk_size, exported_capacity)?;
        let nonpaged = NonPagedManager::new(
            Arc::clone(&service),
            clock,
            peer,
            exported_capacity,
            config.peer_sync_interval,
        );
        Ok(Self {
            service,
            config,
            config_type,
            geometry,
            nonpaged,
            cache: PagedMetadataCache::new(),
            clients: Mutex::new(vec![ClientKeyInfo::default(); config.client_slots]),
            report: Mutex::new(SniffVerifyReport::default()),
            validation_io,
            events,
        })
    }

    /// The object's chunk geometry.
    #[must_use]
    pub const fn geometry(&self) -> &ChunkGeometry {
        &self.geometry
    }

    /// The paged engine over this object's region.
    #[must_use]
    pub fn paged(&self) -> PagedEngine<'_, S> {
        PagedEngine::new(self.service.as_ref(), self.geometry)
    }

    /// The non-paged checkpoint manager.
    #[must_use]
    pub const fn nonpaged(&self) -> &NonPagedManager<S, C, P> {
        &self.nonpaged
    }

    /// The validation-area manager view.
    #[must_use]
    pub fn validation(&self) -> ValidationAreaManager<'_, S, C, P> {
        ValidationAreaManager::new(
            &self.nonpaged,
            self.validation_io.as_ref(),
            self.events.as_ref(),
            &self.clients,
            self.config,
        )
    }

    /// First-time initialization: write the default non-paged record, paint
    /// the paged region, then declare the paged metadata valid.
    pub fn specialize(&self, location: DriveLocation, is_system_drive: bool) -> Result<()> {
        let record = NonPagedRecord {
            zero_checkpoint: self.config.default_zero_checkpoint(is_system_drive),
            drive_location: location,
            ..NonPagedRecord::default()
        };
        self.nonpaged.initialize(record)?;
        self.paint_paged()?;
        self.nonpaged.np_flag_set(NpFlags::PAGED_VALID)?;
        info!(
            target: "pvd::drive",
            capacity = self.geometry.exported_capacity().get(),
            "provision drive specialized"
        );
        Ok(())
    }

    /// Full reinitialization after the metadata service signals
    /// element-needs-reinit (e.g. an encryption-key push invalidated the
    /// paged region). Health flags and the drive location survive;
    /// checkpoints and the validation bitmap reset.
    pub fn reinitialize(&self) -> Result<()> {
        let previous = self.nonpaged.record().unwrap_or_default();
        let record = NonPagedRecord {
            drive_location: previous.drive_location,
            end_of_life_state: previous.end_of_life_state,
            drive_fault_state: previous.drive_fault_state,
            ..NonPagedRecord::default()
        };
        self.nonpaged.initialize(record)?;
        self.paint_paged()?;
        self.nonpaged.np_flag_set(NpFlags::PAGED_VALID)?;
        self.cache
            .invalidate_range(self.full_chunk_range());
        debug!(target: "pvd::drive", "provision drive reinitialized");
        Ok(())
    }

    /// Reload the non-paged snapshot from the service (power-up path).
    pub fn load(&self) -> Result<()> {
        self.nonpaged.load()
    }

    fn paint_paged(&self) -> Result<()> {
        match self.config_type {
            ConfigType::RaidGroup => self.paged().default_paint(),
            ConfigType::ExternalPool => self.paged().pool_default_paint(),
        }
    }

    fn full_chunk_range(&self) -> ChunkRange {
        ChunkRange {
            start: ChunkIndex(0),
            count: ChunkCount(self.geometry.total_chunks() as u32),
        }
    }

    /// Whether the drive in the slot differs from the persisted location
    /// (the physical drive was reseated).
    pub fn is_reseated(&self, observed: &DriveLocation) -> Result<bool> {
        Ok(!self.nonpaged.record()?.drive_location.matches(observed))
    }

    // --- consumed / zero state machines -----------------------------------

    /// Mark a chunk-aligned range consumed by a RAID-group client.
    /// Idempotent: a second call takes the read-only fast path.
    pub fn mark_consumed(&self, lba: Lba, blocks: BlockCount) -> Result<ConsumeOutcome> {
        self.run_consume(ConsumeOp::MarkConsumed, lba, blocks)
    }

    /// Clear the zero bits for a chunk-aligned range after background
    /// zeroing finished it.
    pub fn unmark_zero(&self, lba: Lba, blocks: BlockCount) -> Result<ConsumeOutcome> {
        self.run_consume(ConsumeOp::UnmarkZero, lba, blocks)
    }

    fn run_consume(&self, op: ConsumeOp, lba: Lba, blocks: BlockCount) -> Result<ConsumeOutcome> {
        let engine = self.paged();
        let armer = SweepArmer {
            nonpaged: &self.nonpaged,
        };
        let outcome = PagedUpdateRequest::new(&engine, &armer, op, lba, blocks).run()?;
        if let Ok(range) = self.geometry.exact_chunk_range(lba, blocks) {
            self.cache.invalidate_range(range);
        }
        Ok(outcome)
    }

    // --- checkpoint surface ----------------------------------------------

    /// Read a background checkpoint.
    pub fn checkpoint(&self, field: CheckpointField) -> Result<Lba> {
        self.nonpaged.checkpoint(field)
    }

    /// Set a background checkpoint (clamped to capacity).
    pub fn set_checkpoint(&self, field: CheckpointField, value: Lba, persist: bool) -> Result<Lba> {
        self.nonpaged.set_checkpoint(field, value, persist)
    }

    /// Advance the background-zero checkpoint, applying the peer-sync
    /// throttle and emitting deduplicated progress events.
    pub fn advance_zero_checkpoint(&self, base: Lba, delta: u64) -> Result<IncrementOutcome> {
        let outcome = self
            .nonpaged
            .increment(CheckpointField::Zero, base, delta, &self.cache)?;
        let value = match outcome {
            IncrementOutcome::PeerSynced(value) | IncrementOutcome::LocalOnly(value) => value,
            IncrementOutcome::StaleBase => return Ok(outcome),
        };
        if let Some(percent) = self.nonpaged.note_zero_progress(value) {
            info!(target: "pvd::drive", percent, "background zeroing progress");
            self.events.log(PvdEvent::ZeroProgress { percent });
        }
        Ok(outcome)
    }

    // --- background zeroing ----------------------------------------------

    /// Build a zero pipeline over `[lba, lba + blocks)` against `target`.
    pub fn zero_pipeline<'a, T: ZeroTarget>(
        &self,
        target: &'a T,
        lba: Lba,
        blocks: BlockCount,
    ) -> Result<ZeroPipeline<'a, T>> {
        ZeroPipeline::new(target, self.config.chunk_size, lba, blocks)
    }

    /// One background-zero monitor cycle: find the next chunk still marked
    /// for zeroing at or after the checkpoint, zero-fill it, clear its zero
    /// bits, and advance the checkpoint. Returns `Complete` (checkpoint
    /// forced `INVALID`) once no marked chunk remains.
    pub fn background_zero_cycle<T: ZeroTarget>(
        &self,
        target: &T,
    ) -> Result<BackgroundZeroProgress> {
        let checkpoint = self.nonpaged.checkpoint(CheckpointField::Zero)?;
        if checkpoint.is_invalid() {
            return Ok(BackgroundZeroProgress::Complete);
        }
        let engine = self.paged();
        let chunk_size = self.config.chunk_size;
        let from = ChunkIndex(checkpoint.get() / chunk_size);
        let Some(chunk) = engine.next_need_zero_chunk(from)? else {
            self.set_checkpoint(CheckpointField::Zero, Lba::INVALID, true)?;
            info!(target: "pvd::drive", "background zeroing complete");
            return Ok(BackgroundZeroProgress::Complete);
        };

        let start = self.geometry.chunk_start_lba(chunk);
        let capacity = self.geometry.exported_capacity().get();
        let blocks = chunk_size.min(capacity - start.get());
        self.zero_pipeline(target, start, BlockCount(blocks))?.run()?;

        let range = ChunkRange {
            start: chunk,
            count: ChunkCount(1),
        };
        engine.clear_bits(range, PagedFlags::NEED_ZERO | PagedFlags::USER_ZERO)?;
        self.cache.invalidate_range(range);

        let new_checkpoint = (start.get() + blocks).min(capacity);
        let outcome =
            self.advance_zero_checkpoint(checkpoint, new_checkpoint - checkpoint.get())?;
        let checkpoint = match outcome {
            IncrementOutcome::PeerSynced(value) | IncrementOutcome::LocalOnly(value) => value,
            IncrementOutcome::StaleBase => self.nonpaged.checkpoint(CheckpointField::Zero)?,
        };
        Ok(BackgroundZeroProgress::Advanced { chunk, checkpoint })
    }

    // --- zero-on-demand read gating --------------------------------------

    /// Whether a read of `[lba, lba + blocks)` must be serviced by
    /// on-demand zero fill: zero-on-demand is enabled and some covered
    /// chunk is still marked for zeroing. Served from the paged metadata
    /// cache when possible.
    pub fn read_requires_on_demand_zero(&self, lba: Lba, blocks: BlockCount) -> Result<bool> {
        if !self.nonpaged.record()?.zero_on_demand {
            return Ok(false);
        }
        let range = self.geometry.chunk_range(lba, blocks)?;
        let engine = self.paged();
        for chunk in range.indexes() {
            let needs_zero = match self.cache.lookup(chunk) {
                Some(state) => state,
                None => {
                    // Populate a whole slot-aligned window around the miss.
                    let base = chunk.get() - chunk.get() % CACHE_SLOT_CHUNKS as u64;
                    let count = (self.geometry.total_chunks() - base)
                        .min(CACHE_SLOT_CHUNKS as u64) as u32;
                    let window = ChunkRange {
                        start: ChunkIndex(base),
                        count: ChunkCount(count),
                    };
                    let map = engine.need_zero_map(window)?;
                    self.cache.populate(ChunkIndex(base), &map);
                    map[(chunk.get() - base) as usize]
                }
            };
            if needs_zero {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // --- scalar health / flag surface ------------------------------------

    /// Whether un-zeroed reads must be zero-filled on demand.
    pub fn zero_on_demand(&self) -> Result<bool> {
        Ok(self.nonpaged.record()?.zero_on_demand)
    }

    /// Toggle zero-on-demand.
    pub fn set_zero_on_demand(&self, enabled: bool) -> Result<()> {
        self.nonpaged.set_zero_on_demand(enabled)
    }

    /// Persisted end-of-life flag.
    pub fn end_of_life_state(&self) -> Result<bool> {
        Ok(self.nonpaged.record()?.end_of_life_state)
    }

    /// Set the persisted end-of-life flag.
    pub fn set_end_of_life_state(&self, state: bool) -> Result<()> {
        self.nonpaged.set_end_of_life_state(state)
    }

    /// Persisted drive-fault flag.
    pub fn drive_fault_state(&self) -> Result<bool> {
        Ok(self.nonpaged.record()?.drive_fault_state)
    }

    /// Set the persisted drive-fault flag.
    pub fn set_drive_fault_state(&self, state: bool) -> Result<()> {
        self.nonpaged.set_drive_fault_state(state)
    }

    /// Set an NP condition flag.
    pub fn np_flag_set(&self, flags: NpFlags) -> Result<NpFlags> {
        self.nonpaged.np_flag_set(flags)
    }

    /// Clear an NP condition flag.
    pub fn np_flag_clear(&self, flags: NpFlags) -> Result<NpFlags> {
        self.nonpaged.np_flag_clear(flags)
    }

    /// Whether every bit of `flags` is set.
    pub fn np_flag_is_set(&self, flags: NpFlags) -> Result<bool> {
        self.nonpaged.np_flag_is_set(flags)
    }

    /// Whether any bit of `mask` is set.
    pub fn np_flag_is_any_set(&self, mask: NpFlags) -> Result<bool> {
        self.nonpaged.np_flag_is_any_set(mask)
    }

    /// Earmark the drive for spare replacement.
    pub fn set_swap_pending(&self, reason: SwapPendingReason) -> Result<NpFlags> {
        self.nonpaged.set_swap_pending(reason)
    }

    /// Clear the spare-replacement mark.
    pub fn clear_swap_pending(&self) -> Result<NpFlags> {
        self.nonpaged.clear_swap_pending()
    }

    // --- sniff verify ----------------------------------------------------

    /// Account a media error found by the sniff sweep and persist its
    /// location for resume.
    pub fn record_sniff_error(&self, lba: Lba, recoverable: bool) -> Result<()> {
        self.report.lock().record_error(lba.get(), recoverable);
        self.nonpaged.set_media_error_lba(lba)
    }

    /// Account a completed sniff pass: bump the persisted pass count and
    /// wrap the checkpoint back to the start.
    pub fn complete_sniff_pass(&self) -> Result<u32> {
        self.report.lock().complete_pass();
        let passes = self.nonpaged.increment_sniff_pass_count()?;
        self.nonpaged
            .set_checkpoint(CheckpointField::SniffVerify, Lba::ZERO, true)?;
        Ok(passes)
    }

    /// Snapshot of the sniff report.
    #[must_use]
    pub fn sniff_report(&self) -> SniffVerifyReport {
        self.report.lock().clone()
    }

    /// Operator-requested report reset.
    pub fn reset_sniff_report(&self) {
        self.report.lock().reset();
    }

    // --- validation-area surface -----------------------------------------

    /// The per-client validation bitmap.
    pub fn validation_bitmap(&self) -> Result<u64> {
        self.nonpaged.validate_area_bitmap()
    }

    /// The paged metadata cache (hit/miss stats, flush control).
    #[must_use]
    pub const fn metadata_cache(&self) -> &PagedMetadataCache {
        &self.cache
    }
}
