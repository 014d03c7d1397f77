//! The non-paged record manager.
//!
//! All mutation happens inside an NP-lock transaction ([`NpTxn`]) so the
//! lock is released on every exit path, success or error. Checkpoint
//! increments apply the peer-sync throttle: a full force-set is replicated
//! to the peer at most once per configured interval, everything in between
//! advances the local snapshot only.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pvd_error::{PvdError, Result};
use pvd_metasvc::MetadataService;
use pvd_types::nonpaged::{
    CheckpointField, DriveLocation, NonPagedRecord, NpFlags, SwapPendingReason,
};
use pvd_types::units::Lba;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::peer::PeerNotifier;

/// Reports whether the paged metadata cache is mid-flush; a flush in
/// progress defers peer synchronization to the next increment.
pub trait FlushGate {
    fn is_mid_flush(&self) -> bool;
}

/// Gate for objects with no paged cache enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFlushGate;

impl FlushGate for NoFlushGate {
    fn is_mid_flush(&self) -> bool {
        false
    }
}

/// How an increment was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    /// Force-set, persisted, replicated to the peer, notification emitted.
    PeerSynced(Lba),
    /// Advanced in the local snapshot only.
    LocalOnly(Lba),
    /// The caller's base no longer matches the snapshot; the increment was
    /// dropped so a restarted sweep re-reads the authoritative value.
    StaleBase,
}

struct ManagerState {
    snapshot: Option<NonPagedRecord>,
    last_peer_sync: Option<Duration>,
    last_zero_percent: Option<u32>,
}

/// Manager for one object's non-paged record.
pub struct NonPagedManager<S, C, P> {
    service: Arc<S>,
    clock: C,
    peer: P,
    capacity: Lba,
    peer_sync_interval: Duration,
    state: Mutex<ManagerState>,
}

/// An NP-lock-scoped transaction over the snapshot and the persisted
/// record. Dropping it releases the NP lock.
pub struct NpTxn<'a, S: MetadataService> {
    service: &'a S,
    capacity: Lba,
    snapshot: &'a mut Option<NonPagedRecord>,
}

impl<S: MetadataService> NpTxn<'_, S> {
    /// The current snapshot.
    pub fn record(&self) -> Result<&NonPagedRecord> {
        self.snapshot.as_ref().ok_or(PvdError::NotInitialized)
    }

    /// Replace the snapshot with `record` and persist it whole.
    pub fn initialize(&mut self, record: NonPagedRecord) -> Result<()> {
        self.service.nonpaged_write(0, &record.encode(), true)?;
        *self.snapshot = Some(record);
        Ok(())
    }

    fn write_field(
        &self,
        record: &NonPagedRecord,
        field: pvd_types::nonpaged::NonPagedField,
        persist: bool,
    ) -> Result<()> {
        let (offset, bytes) = record.encode_field(field);
        self.service.nonpaged_write(offset, &bytes, persist)
    }

    /// Set a checkpoint, clamping values beyond the exported capacity to
    /// `INVALID`. The snapshot takes the new value only after the service
    /// write succeeds, so memory never runs ahead of media.
    pub fn set_checkpoint(
        &mut self,
        field: CheckpointField,
        value: Lba,
        persist: bool,
    ) -> Result<Lba> {
        let capacity = self.capacity;
        let clamped = if !value.is_invalid() && value.get() > capacity.get() {
            warn!(
                target: "pvd::nonpaged",
                ?field,
                value = value.get(),
                capacity = capacity.get(),
                "checkpoint beyond capacity forced to INVALID"
            );
            Lba::INVALID
        } else {
            value
        };
        let mut updated = *self.record()?;
        updated.set_checkpoint(field, clamped);
        self.write_field(&updated, field.record_field(), persist)?;
        *self.snapshot = Some(updated);
        Ok(clamped)
    }

    /// Read a checkpoint.
    pub fn checkpoint(&self, field: CheckpointField) -> Result<Lba> {
        Ok(self.record()?.checkpoint(field))
    }

    /// Set NP flags, preserving the needs-zero / valid mutual exclusion.
    /// Always persisted.
    pub fn flag_set(&mut self, flags: NpFlags) -> Result<NpFlags> {
        let mut updated = *self.record()?;
        updated.flags.insert(flags);
        if flags.contains(NpFlags::PAGED_VALID) {
            updated.flags.remove(NpFlags::PAGED_NEEDS_ZERO);
        }
        if flags.contains(NpFlags::PAGED_NEEDS_ZERO) {
            updated.flags.remove(NpFlags::PAGED_VALID);
        }
        self.write_field(&updated, pvd_types::nonpaged::NonPagedField::Flags, true)?;
        *self.snapshot = Some(updated);
        Ok(updated.flags)
    }

    /// Clear NP flags. Always persisted.
    pub fn flag_clear(&mut self, flags: NpFlags) -> Result<NpFlags> {
        let mut updated = *self.record()?;
        updated.flags.remove(flags);
        self.write_field(&updated, pvd_types::nonpaged::NonPagedField::Flags, true)?;
        *self.snapshot = Some(updated);
        Ok(updated.flags)
    }

    /// Apply `mutate` to the validation bitmap and persist it. The snapshot
    /// is committed only after the persist succeeds; a failed write leaves
    /// the in-memory bitmap matching media.
    pub fn update_validate_bitmap(&mut self, mutate: impl FnOnce(u64) -> u64) -> Result<u64> {
        let mut updated = *self.record()?;
        updated.validate_area_bitmap = mutate(updated.validate_area_bitmap);
        self.write_field(
            &updated,
            pvd_types::nonpaged::NonPagedField::ValidateAreaBitmap,
            true,
        )?;
        *self.snapshot = Some(updated);
        Ok(updated.validate_area_bitmap)
    }

    /// Apply `mutate` to the whole record and persist the given field
    /// window.
    pub fn update_scalar(
        &mut self,
        field: pvd_types::nonpaged::NonPagedField,
        persist: bool,
        mutate: impl FnOnce(&mut NonPagedRecord),
    ) -> Result<()> {
        let mut updated = *self.record()?;
        mutate(&mut updated);
        self.write_field(&updated, field, persist)?;
        *self.snapshot = Some(updated);
        Ok(())
    }
}

impl<S, C, P> NonPagedManager<S, C, P>
where
    S: MetadataService,
    C: Clock,
    P: PeerNotifier,
{
    /// Build a manager. `capacity` bounds every checkpoint;
    /// `peer_sync_interval` is the throttle window.
    pub fn new(
        service: Arc<S>,
        clock: C,
        peer: P,
        capacity: Lba,
        peer_sync_interval: Duration,
    ) -> Self {
        Self {
            service,
            clock,
            peer,
            capacity,
            peer_sync_interval,
            state: Mutex::new(ManagerState {
                snapshot: None,
                last_peer_sync: None,
                last_zero_percent: None,
            }),
        }
    }

    /// Whether the snapshot has been established.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.lock().snapshot.is_some()
    }

    /// Run `body` inside an NP-lock transaction. The lock is held for the
    /// whole closure and released when it returns, on success and on error
    /// alike.
    pub fn with_np_txn<T>(&self, body: impl FnOnce(&mut NpTxn<'_, S>) -> Result<T>) -> Result<T> {
        let _np = self.service.np_lock();
        let mut state = self.state.lock();
        let mut txn = NpTxn {
            service: self.service.as_ref(),
            capacity: self.capacity,
            snapshot: &mut state.snapshot,
        };
        body(&mut txn)
    }

    /// Establish the snapshot with `record` and persist it whole. Used at
    /// first specialization and at element-needs-reinit.
    pub fn initialize(&self, record: NonPagedRecord) -> Result<()> {
        self.with_np_txn(|txn| txn.initialize(record))
    }

    /// Reload the snapshot from the service's working record.
    pub fn load(&self) -> Result<()> {
        let _np = self.service.np_lock();
        let bytes = self.service.nonpaged_read()?;
        let mut buf = [0_u8; pvd_types::nonpaged::NP_RECORD_SIZE];
        buf.copy_from_slice(&bytes);
        self.state.lock().snapshot = Some(NonPagedRecord::decode(&buf));
        Ok(())
    }

    /// Copy of the current snapshot.
    pub fn record(&self) -> Result<NonPagedRecord> {
        self.state
            .lock()
            .snapshot
            .ok_or(PvdError::NotInitialized)
    }

    /// Direct read of a checkpoint; no I/O.
    pub fn checkpoint(&self, field: CheckpointField) -> Result<Lba> {
        Ok(self.record()?.checkpoint(field))
    }

    /// Set a checkpoint with clamping; `persist` selects write-through.
    pub fn set_checkpoint(&self, field: CheckpointField, value: Lba, persist: bool) -> Result<Lba> {
        self.with_np_txn(|txn| txn.set_checkpoint(field, value, persist))
    }

    /// Advance a checkpoint by `delta` from `base`.
    ///
    /// When more than the configured interval has passed since the last
    /// peer-synchronized update and the paged cache is not mid-flush, the
    /// new value is force-set, persisted, replicated to the peer, and a
    /// checkpoint-change notification is emitted. Otherwise the snapshot is
    /// advanced locally only.
    pub fn increment(
        &self,
        field: CheckpointField,
        base: Lba,
        delta: u64,
        gate: &dyn FlushGate,
    ) -> Result<IncrementOutcome> {
        let _np = self.service.np_lock();
        let mut state = self.state.lock();
        let state = &mut *state;
        let current = state
            .snapshot
            .as_ref()
            .ok_or(PvdError::NotInitialized)?
            .checkpoint(field);
        if current != base {
            debug!(
                target: "pvd::nonpaged",
                ?field,
                base = base.get(),
                current = current.get(),
                "stale increment base dropped"
            );
            return Ok(IncrementOutcome::StaleBase);
        }

        let proposed = base.saturating_add(pvd_types::units::BlockCount(delta));
        let now = self.clock.now();
        let due = state
            .last_peer_sync
            .is_none_or(|last| now.saturating_sub(last) >= self.peer_sync_interval);

        let mut txn = NpTxn {
            service: self.service.as_ref(),
            capacity: self.capacity,
            snapshot: &mut state.snapshot,
        };
        if due && !gate.is_mid_flush() {
            let value = txn.set_checkpoint(field, proposed, true)?;
            state.last_peer_sync = Some(now);
            self.peer.replicate_checkpoint(field, value);
            self.peer.checkpoint_changed(field, value);
            debug!(
                target: "pvd::nonpaged",
                ?field,
                value = value.get(),
                "checkpoint peer-synchronized"
            );
            Ok(IncrementOutcome::PeerSynced(value))
        } else {
            let value = txn.set_checkpoint(field, proposed, false)?;
            Ok(IncrementOutcome::LocalOnly(value))
        }
    }

    /// Set NP flags (persisted, lock-scoped).
    pub fn np_flag_set(&self, flags: NpFlags) -> Result<NpFlags> {
        self.with_np_txn(|txn| txn.flag_set(flags))
    }

    /// Clear NP flags (persisted, lock-scoped).
    pub fn np_flag_clear(&self, flags: NpFlags) -> Result<NpFlags> {
        self.with_np_txn(|txn| txn.flag_clear(flags))
    }

    /// Whether every bit of `flags` is set.
    pub fn np_flag_is_set(&self, flags: NpFlags) -> Result<bool> {
        Ok(self.record()?.flags.contains(flags))
    }

    /// Whether any bit of `mask` is set.
    pub fn np_flag_is_any_set(&self, mask: NpFlags) -> Result<bool> {
        Ok(self.record()?.flags.intersects(mask))
    }

    /// Mark the drive swap-pending for `reason`.
    pub fn set_swap_pending(&self, reason: SwapPendingReason) -> Result<NpFlags> {
        self.np_flag_set(reason.flag())
    }

    /// Clear any swap-pending mark.
    pub fn clear_swap_pending(&self) -> Result<NpFlags> {
        self.np_flag_clear(NpFlags::SWAP_PENDING_MASK)
    }

    /// Set the zero-on-demand gate.
    pub fn set_zero_on_demand(&self, enabled: bool) -> Result<()> {
        self.with_np_txn(|txn| {
            txn.update_scalar(
                pvd_types::nonpaged::NonPagedField::HealthState,
                true,
                |record| record.zero_on_demand = enabled,
            )
        })
    }

    /// Set the persisted end-of-life flag.
    pub fn set_end_of_life_state(&self, state: bool) -> Result<()> {
        self.with_np_txn(|txn| {
            txn.update_scalar(
                pvd_types::nonpaged::NonPagedField::HealthState,
                true,
                |record| record.end_of_life_state = state,
            )
        })
    }

    /// Set the persisted drive-fault flag.
    pub fn set_drive_fault_state(&self, state: bool) -> Result<()> {
        self.with_np_txn(|txn| {
            txn.update_scalar(
                pvd_types::nonpaged::NonPagedField::HealthState,
                true,
                |record| record.drive_fault_state = state,
            )
        })
    }

    /// Record the last media error location for sniff resume.
    pub fn set_media_error_lba(&self, lba: Lba) -> Result<()> {
        self.with_np_txn(|txn| {
            txn.update_scalar(
                pvd_types::nonpaged::NonPagedField::MediaErrorLba,
                true,
                |record| record.media_error_lba = lba,
            )
        })
    }

    /// Bump the sniff-verify pass count.
    pub fn increment_sniff_pass_count(&self) -> Result<u32> {
        let mut updated = 0;
        self.with_np_txn(|txn| {
            txn.update_scalar(
                pvd_types::nonpaged::NonPagedField::SniffPassCount,
                true,
                |record| {
                    record.sniff_pass_count = record.sniff_pass_count.wrapping_add(1);
                    updated = record.sniff_pass_count;
                },
            )
        })?;
        Ok(updated)
    }

    /// Record the time the drive was last seen removed.
    pub fn set_remove_timestamp(&self, timestamp_ms: u64) -> Result<()> {
        self.with_np_txn(|txn| {
            txn.update_scalar(
                pvd_types::nonpaged::NonPagedField::RemoveTimestamp,
                true,
                |record| record.remove_timestamp = timestamp_ms,
            )
        })
    }

    /// Persist the physical drive location.
    pub fn set_drive_location(&self, location: DriveLocation) -> Result<()> {
        self.with_np_txn(|txn| {
            txn.update_scalar(
                pvd_types::nonpaged::NonPagedField::DriveLocation,
                true,
                |record| record.drive_location = location,
            )
        })
    }

    /// The validation-area bitmap.
    pub fn validate_area_bitmap(&self) -> Result<u64> {
        Ok(self.record()?.validate_area_bitmap)
    }

    /// Integer zero-sweep percentage for `checkpoint`, deduplicated: returns
    /// `Some` only when the percent changed since the last call.
    pub fn note_zero_progress(&self, checkpoint: Lba) -> Option<u32> {
        let percent = if checkpoint.is_invalid() {
            100
        } else {
            ((checkpoint.get().min(self.capacity.get()) * 100) / self.capacity.get()) as u32
        };
        let mut state = self.state.lock();
        if state.last_zero_percent == Some(percent) {
            return None;
        }
        state.last_zero_percent = Some(percent);
        Some(percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;
    use crate::peer::{NullPeer, RecordingPeer};
    use pvd_metasvc::{FaultOp, MemoryMetadataService};
    use pvd_error::MetadataStatus;
    use proptest::prelude::*;

    const CAPACITY: u64 = 1_000_000;
    const INTERVAL: Duration = Duration::from_millis(3000);

    type TestManager<'a> = NonPagedManager<MemoryMetadataService, &'a SimClock, &'a RecordingPeer>;

    fn setup<'a>(clock: &'a SimClock, peer: &'a RecordingPeer) -> TestManager<'a> {
        let service = Arc::new(MemoryMetadataService::new(4096));
        let manager =
            NonPagedManager::new(service, clock, peer, Lba(CAPACITY), INTERVAL);
        manager.initialize(NonPagedRecord::default()).unwrap();
        manager
    }

    #[test]
    fn test_get_before_initialize_fails() {
        let service = Arc::new(MemoryMetadataService::new(4096));
        let manager = NonPagedManager::new(
            service,
            SimClock::new(),
            NullPeer,
            Lba(CAPACITY),
            INTERVAL,
        );
        assert!(matches!(
            manager.checkpoint(CheckpointField::Zero),
            Err(PvdError::NotInitialized)
        ));
    }

    #[test]
    fn test_set_checkpoint_clamps_to_invalid() {
        let clock = SimClock::new();
        let peer = RecordingPeer::new();
        let manager = setup(&clock, &peer);
        let value = manager
            .set_checkpoint(CheckpointField::VerifyInvalidate, Lba(CAPACITY + 1), true)
            .unwrap();
        assert_eq!(value, Lba::INVALID);
        assert_eq!(
            manager.checkpoint(CheckpointField::VerifyInvalidate).unwrap(),
            Lba::INVALID
        );
    }

    #[test]
    fn test_set_checkpoint_at_capacity_is_kept() {
        let clock = SimClock::new();
        let peer = RecordingPeer::new();
        let manager = setup(&clock, &peer);
        let value = manager
            .set_checkpoint(CheckpointField::Zero, Lba(CAPACITY), true)
            .unwrap();
        assert_eq!(value, Lba(CAPACITY));
    }

    #[test]
    fn test_increment_throttle_policy() {
        let clock = SimClock::new();
        let peer = RecordingPeer::new();
        let manager = setup(&clock, &peer);
        manager
            .set_checkpoint(CheckpointField::Zero, Lba(500_000), true)
            .unwrap();

        // First increment after start: no prior sync, goes to the peer.
        let outcome = manager
            .increment(CheckpointField::Zero, Lba(500_000), 2048, &NoFlushGate)
            .unwrap();
        assert_eq!(outcome, IncrementOutcome::PeerSynced(Lba(502_048)));
        assert_eq!(peer.replication_count(), 1);

        // 0 ms later: local only, no peer traffic.
        let outcome = manager
            .increment(CheckpointField::Zero, Lba(502_048), 2048, &NoFlushGate)
            .unwrap();
        assert_eq!(outcome, IncrementOutcome::LocalOnly(Lba(504_096)));
        assert_eq!(peer.replication_count(), 1);

        // 3100 ms later: force-set and replicated.
        clock.advance(Duration::from_millis(3100));
        let outcome = manager
            .increment(CheckpointField::Zero, Lba(504_096), 2048, &NoFlushGate)
            .unwrap();
        assert_eq!(outcome, IncrementOutcome::PeerSynced(Lba(506_144)));
        assert_eq!(peer.replication_count(), 2);
        assert_eq!(
            peer.replicated.lock().last().copied(),
            Some((CheckpointField::Zero, Lba(506_144)))
        );
        assert_eq!(peer.notified.lock().len(), 2);
    }

    #[test]
    fn test_increment_deferred_while_cache_flushing() {
        struct Flushing;
        impl FlushGate for Flushing {
            fn is_mid_flush(&self) -> bool {
                true
            }
        }

        let clock = SimClock::new();
        let peer = RecordingPeer::new();
        let manager = setup(&clock, &peer);
        clock.advance(Duration::from_millis(10_000));
        let outcome = manager
            .increment(CheckpointField::Zero, Lba(0), 2048, &Flushing)
            .unwrap();
        assert_eq!(outcome, IncrementOutcome::LocalOnly(Lba(2048)));
        assert_eq!(peer.replication_count(), 0);
    }

    #[test]
    fn test_increment_stale_base_dropped() {
        let clock = SimClock::new();
        let peer = RecordingPeer::new();
        let manager = setup(&clock, &peer);
        manager
            .set_checkpoint(CheckpointField::Zero, Lba(4096), true)
            .unwrap();
        let outcome = manager
            .increment(CheckpointField::Zero, Lba(0), 2048, &NoFlushGate)
            .unwrap();
        assert_eq!(outcome, IncrementOutcome::StaleBase);
        assert_eq!(manager.checkpoint(CheckpointField::Zero).unwrap(), Lba(4096));
    }

    #[test]
    fn test_local_increment_lost_on_crash_peer_sync_survives() {
        let clock = SimClock::new();
        let peer = RecordingPeer::new();
        let service = Arc::new(MemoryMetadataService::new(4096));
        let manager = NonPagedManager::new(
            Arc::clone(&service),
            &clock,
            &peer,
            Lba(CAPACITY),
            INTERVAL,
        );
        manager.initialize(NonPagedRecord::default()).unwrap();

        // Synced: persisted.
        manager
            .increment(CheckpointField::Zero, Lba(0), 2048, &NoFlushGate)
            .unwrap();
        // Local: working copy only.
        manager
            .increment(CheckpointField::Zero, Lba(2048), 2048, &NoFlushGate)
            .unwrap();

        service.crash();
        manager.load().unwrap();
        assert_eq!(
            manager.checkpoint(CheckpointField::Zero).unwrap(),
            Lba(2048),
            "peer-synced value survives, local-only delta is lost"
        );
    }

    #[test]
    fn test_np_flag_mutual_exclusion() {
        let clock = SimClock::new();
        let peer = RecordingPeer::new();
        let manager = setup(&clock, &peer);

        // Default record carries PAGED_NEEDS_ZERO.
        assert!(manager.np_flag_is_set(NpFlags::PAGED_NEEDS_ZERO).unwrap());

        let flags = manager.np_flag_set(NpFlags::PAGED_VALID).unwrap();
        assert!(flags.contains(NpFlags::PAGED_VALID));
        assert!(!flags.contains(NpFlags::PAGED_NEEDS_ZERO));

        let flags = manager.np_flag_set(NpFlags::PAGED_NEEDS_ZERO).unwrap();
        assert!(!flags.contains(NpFlags::PAGED_VALID));
    }

    #[test]
    fn test_np_flags_persisted() {
        let clock = SimClock::new();
        let peer = RecordingPeer::new();
        let service = Arc::new(MemoryMetadataService::new(4096));
        let manager = NonPagedManager::new(
            Arc::clone(&service),
            &clock,
            &peer,
            Lba(CAPACITY),
            INTERVAL,
        );
        manager.initialize(NonPagedRecord::default()).unwrap();
        manager.np_flag_set(NpFlags::EAS_STARTED).unwrap();

        service.crash();
        manager.load().unwrap();
        assert!(manager.np_flag_is_set(NpFlags::EAS_STARTED).unwrap());
    }

    #[test]
    fn test_swap_pending_set_and_clear() {
        let clock = SimClock::new();
        let peer = RecordingPeer::new();
        let manager = setup(&clock, &peer);
        manager
            .set_swap_pending(SwapPendingReason::ProactiveCopy)
            .unwrap();
        assert!(manager
            .np_flag_is_any_set(NpFlags::SWAP_PENDING_MASK)
            .unwrap());
        manager.clear_swap_pending().unwrap();
        assert!(!manager
            .np_flag_is_any_set(NpFlags::SWAP_PENDING_MASK)
            .unwrap());
    }

    #[test]
    fn test_scalar_setters_round_trip() {
        let clock = SimClock::new();
        let peer = RecordingPeer::new();
        let manager = setup(&clock, &peer);
        manager.set_zero_on_demand(false).unwrap();
        manager.set_end_of_life_state(true).unwrap();
        manager.set_media_error_lba(Lba(777)).unwrap();
        let pass = manager.increment_sniff_pass_count().unwrap();

        let record = manager.record().unwrap();
        assert!(!record.zero_on_demand);
        assert!(record.end_of_life_state);
        assert_eq!(record.media_error_lba, Lba(777));
        assert_eq!(record.sniff_pass_count, 1);
        assert_eq!(pass, 1);
    }

    #[test]
    fn test_service_fault_releases_np_lock() {
        let clock = SimClock::new();
        let peer = RecordingPeer::new();
        let service = Arc::new(MemoryMetadataService::new(4096));
        let manager = NonPagedManager::new(
            Arc::clone(&service),
            &clock,
            &peer,
            Lba(CAPACITY),
            INTERVAL,
        );
        manager.initialize(NonPagedRecord::default()).unwrap();

        service.inject_fault(FaultOp::NonPagedWrite, MetadataStatus::IoUncorrectable);
        assert!(manager
            .set_checkpoint(CheckpointField::Zero, Lba(100), true)
            .is_err());
        // The NP lock was released on the error path; the next call works.
        manager
            .set_checkpoint(CheckpointField::Zero, Lba(2048), true)
            .unwrap();
    }

    #[test]
    fn test_failed_persist_leaves_snapshot_on_media_value() {
        let clock = SimClock::new();
        let peer = RecordingPeer::new();
        let service = Arc::new(MemoryMetadataService::new(4096));
        let manager = NonPagedManager::new(
            Arc::clone(&service),
            &clock,
            &peer,
            Lba(CAPACITY),
            INTERVAL,
        );
        manager.initialize(NonPagedRecord::default()).unwrap();
        manager
            .set_checkpoint(CheckpointField::Zero, Lba(2048), true)
            .unwrap();

        service.inject_fault(FaultOp::NonPagedWrite, MetadataStatus::IoUncorrectable);
        assert!(manager
            .set_checkpoint(CheckpointField::Zero, Lba(4096), true)
            .is_err());
        // The snapshot never ran ahead of media.
        assert_eq!(manager.checkpoint(CheckpointField::Zero).unwrap(), Lba(2048));

        service.inject_fault(FaultOp::NonPagedWrite, MetadataStatus::IoUncorrectable);
        assert!(manager.np_flag_set(NpFlags::EAS_STARTED).unwrap_err().to_string().contains("IoUncorrectable"));
        assert!(!manager.np_flag_is_set(NpFlags::EAS_STARTED).unwrap());
    }

    #[test]
    fn test_zero_progress_notification_dedup() {
        let clock = SimClock::new();
        let peer = RecordingPeer::new();
        let manager = setup(&clock, &peer);
        assert_eq!(manager.note_zero_progress(Lba(10_000)), Some(1));
        assert_eq!(manager.note_zero_progress(Lba(15_000)), None);
        assert_eq!(manager.note_zero_progress(Lba(20_000)), Some(2));
        assert_eq!(manager.note_zero_progress(Lba::INVALID), Some(100));
    }

    proptest! {
        /// Any sequence of sets and increments leaves the checkpoint
        /// `<= capacity` or exactly `INVALID`.
        #[test]
        fn prop_checkpoint_bound_invariant(
            ops in proptest::collection::vec((0_u8..2, 0_u64..2_000_000), 1..40)
        ) {
            let clock = SimClock::new();
            let peer = RecordingPeer::new();
            let manager = setup(&clock, &peer);
            for (kind, value) in ops {
                if kind == 0 {
                    let _ = manager
                        .set_checkpoint(CheckpointField::Zero, Lba(value), false)
                        .unwrap();
                } else {
                    let base = manager.checkpoint(CheckpointField::Zero).unwrap();
                    if !base.is_invalid() {
                        let _ = manager
                            .increment(CheckpointField::Zero, base, value, &NoFlushGate)
                            .unwrap();
                    }
                }
                let checkpoint = manager.checkpoint(CheckpointField::Zero).unwrap();
                prop_assert!(
                    checkpoint.is_invalid() || checkpoint.get() <= CAPACITY,
                    "checkpoint {checkpoint} escaped the capacity bound"
                );
                clock.advance(Duration::from_millis(value % 4000));
            }
        }
    }
}
