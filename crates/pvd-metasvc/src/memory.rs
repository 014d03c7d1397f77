//! Fully in-memory metadata service for tests.
//!
//! Mirrors the contract of a production metadata service closely enough for
//! engine-level testing: two mirror copies of the paged region, a working +
//! persisted pair of non-paged images (so a crash can be simulated by
//! dropping the working copy), per-operation fault injection, and operation
//! counters that let tests assert the read-only fast path.

use std::collections::VecDeque;

use parking_lot::Mutex;
use pvd_error::{MetadataStatus, PvdError, Result};
use pvd_types::nonpaged::NP_RECORD_SIZE;
use pvd_types::paged::PAGED_SLAB_BYTES;

use tracing::debug;

use crate::locks::{NpLock, NpLockGuard, StripeLockGuard, StripeLockTable};
use crate::service::{
    MetadataService, PagedSpan, PagedUpdateCallback, SlabVerdict, UpdateMode, UpdateOutcome,
};
use crate::slab::{SlabBuffer, SlabList};

/// Which operation a fault is armed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    PagedRead,
    PagedWrite,
    PagedUpdate,
    /// Faults only paged updates submitted in write-verify mode, so the
    /// retry tier can be failed independently of the first attempt.
    PagedUpdateWriteVerify,
    NonPagedWrite,
}

/// Operation counters exposed to tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounters {
    /// Paged updates that wrote at least one slab.
    pub paged_update_writes: u64,
    /// Paged updates satisfied by the read-only fast path.
    pub paged_update_clean: u64,
    /// Paged updates submitted in write-verify mode.
    pub write_verify_updates: u64,
    /// Repeat-paint writes.
    pub paged_writes: u64,
    /// Non-paged writes that reached the persisted image.
    pub nonpaged_persist_writes: u64,
    /// Non-paged writes to the working image only.
    pub nonpaged_local_writes: u64,
}

#[derive(Debug)]
struct Inner {
    /// Two mirrored copies of the paged region.
    paged: [Vec<u8>; 2],
    /// Working non-paged image.
    nonpaged: [u8; NP_RECORD_SIZE],
    /// Persisted non-paged image; survives [`MemoryMetadataService::crash`].
    nonpaged_persisted: [u8; NP_RECORD_SIZE],
    faults: Vec<(FaultOp, VecDeque<MetadataStatus>)>,
    counters: OpCounters,
}

impl Inner {
    fn take_fault(&mut self, op: FaultOp) -> Option<MetadataStatus> {
        let status = self
            .faults
            .iter_mut()
            .find(|(armed, _)| *armed == op)
            .and_then(|(_, queue)| queue.pop_front());
        if let Some(status) = status {
            debug!(target: "pvd::metasvc", ?op, ?status, "armed fault fired");
        }
        status
    }
}

/// In-memory [`MetadataService`] implementation.
#[derive(Debug)]
pub struct MemoryMetadataService {
    inner: Mutex<Inner>,
    np_lock: NpLock,
    stripe_locks: StripeLockTable,
    paged_len: u64,
}

impl MemoryMetadataService {
    /// Create a service backing a paged region of `paged_len` bytes per
    /// mirror. Media starts uninitialized (all zero).
    #[must_use]
    pub fn new(paged_len: u64) -> Self {
        let len = paged_len as usize;
        Self {
            inner: Mutex::new(Inner {
                paged: [vec![0_u8; len], vec![0_u8; len]],
                nonpaged: [0_u8; NP_RECORD_SIZE],
                nonpaged_persisted: [0_u8; NP_RECORD_SIZE],
                faults: Vec::new(),
                counters: OpCounters::default(),
            }),
            np_lock: NpLock::new(),
            stripe_locks: StripeLockTable::new(),
            paged_len,
        }
    }

    /// Arm a fault: the next matching operation fails with `status`.
    pub fn inject_fault(&self, op: FaultOp, status: MetadataStatus) {
        let mut inner = self.inner.lock();
        if let Some((_, queue)) = inner.faults.iter_mut().find(|(armed, _)| *armed == op) {
            queue.push_back(status);
        } else {
            inner.faults.push((op, VecDeque::from([status])));
        }
    }

    /// Simulate a crash: the working non-paged image reverts to the
    /// persisted one. Paged data is treated as durable at write time.
    pub fn crash(&self) {
        let mut inner = self.inner.lock();
        inner.nonpaged = inner.nonpaged_persisted;
    }

    /// Snapshot the operation counters.
    #[must_use]
    pub fn counters(&self) -> OpCounters {
        self.inner.lock().counters
    }

    /// Copy of one paged mirror (test helper).
    #[must_use]
    pub fn mirror_image(&self, copy: usize) -> Vec<u8> {
        self.inner.lock().paged[copy].clone()
    }

    /// Copy of the persisted non-paged image (test helper).
    #[must_use]
    pub fn nonpaged_persisted_image(&self) -> [u8; NP_RECORD_SIZE] {
        self.inner.lock().nonpaged_persisted
    }

    fn check_span(&self, span: PagedSpan) -> Result<()> {
        if span.end() > self.paged_len {
            return Err(PvdError::OutOfRange {
                what: "paged span".to_owned(),
                value: format!("{}..{}", span.offset, span.end()),
            });
        }
        Ok(())
    }

    /// Cut `span` into absolute record-block slabs from mirror copy 0.
    fn read_slabs(inner: &Inner, span: PagedSpan) -> (SlabList, usize) {
        let start = span.offset as usize;
        let end = start + span.len;
        let first_slab = start / PAGED_SLAB_BYTES;
        let last_slab = (end.max(start + 1) - 1) / PAGED_SLAB_BYTES;
        let mut slabs = SlabList::with_capacity(last_slab - first_slab + 1);
        for slab_index in first_slab..=last_slab {
            let slab_start = slab_index * PAGED_SLAB_BYTES;
            let slab_end = (slab_start + PAGED_SLAB_BYTES).min(inner.paged[0].len());
            slabs.push(inner.paged[0][slab_start..slab_end].to_vec());
        }
        (slabs, start % PAGED_SLAB_BYTES)
    }
}

impl MetadataService for MemoryMetadataService {
    fn paged_read(&self, span: PagedSpan) -> Result<SlabBuffer> {
        self.check_span(span)?;
        let mut inner = self.inner.lock();
        if let Some(status) = inner.take_fault(FaultOp::PagedRead) {
            return Err(PvdError::retryable(status));
        }
        let (slabs, lead) = Self::read_slabs(&inner, span);
        drop(inner);
        SlabBuffer::new(slabs, lead, span.len)
    }

    fn paged_write(&self, span: PagedSpan, record: &[u8], repeat_count: usize) -> Result<()> {
        self.check_span(span)?;
        if record.is_empty() || record.len() * repeat_count != span.len {
            return Err(PvdError::invalid(
                pvd_error::InvalidRequestQualifier::BadRecordSize,
            ));
        }
        let mut inner = self.inner.lock();
        if let Some(status) = inner.take_fault(FaultOp::PagedWrite) {
            return Err(PvdError::retryable(status));
        }
        let start = span.offset as usize;
        for copy in 0..2 {
            for repeat in 0..repeat_count {
                let at = start + repeat * record.len();
                inner.paged[copy][at..at + record.len()].copy_from_slice(record);
            }
        }
        inner.counters.paged_writes += 1;
        Ok(())
    }

    fn paged_update(
        &self,
        span: PagedSpan,
        entry_size: usize,
        mode: UpdateMode,
        callback: &mut dyn PagedUpdateCallback,
    ) -> Result<UpdateOutcome> {
        self.check_span(span)?;
        if entry_size == 0 || span.len % entry_size != 0 {
            return Err(PvdError::invalid(
                pvd_error::InvalidRequestQualifier::BadRecordSize,
            ));
        }
        let mut inner = self.inner.lock();
        if let Some(status) = inner.take_fault(FaultOp::PagedUpdate) {
            return Err(PvdError::retryable(status));
        }
        if mode == UpdateMode::WriteVerify {
            inner.counters.write_verify_updates += 1;
            if let Some(status) = inner.take_fault(FaultOp::PagedUpdateWriteVerify) {
                return Err(PvdError::retryable(status));
            }
        }

        let (slabs, lead) = Self::read_slabs(&inner, span);
        let slab_count = slabs.len();

        // One callback per record-block slab, each over its in-span window.
        let mut any_dirty = false;
        let mut updated: Vec<Vec<u8>> = Vec::with_capacity(slab_count);
        let mut remaining = span.len;
        let mut window_lead = lead;
        for slab in slabs {
            let slab_len = slab.len();
            let window = remaining.min(slab_len - window_lead);
            let mut buffer = SlabBuffer::new(smallvec::smallvec![slab], window_lead, window)?;
            let mut cursor = buffer.cursor(entry_size);
            let verdict = callback.update_slab(&mut cursor)?;
            if verdict == SlabVerdict::Dirty {
                any_dirty = true;
            }
            updated.push(buffer.into_single_slab());
            remaining -= window;
            window_lead = 0;
        }

        if !any_dirty {
            inner.counters.paged_update_clean += 1;
            return Ok(UpdateOutcome::NoWriteNeeded);
        }

        // Write the touched slabs back to both mirrors.
        let start = span.offset as usize;
        let first_slab = start / PAGED_SLAB_BYTES;
        for (index, slab) in updated.iter().enumerate() {
            let slab_start = (first_slab + index) * PAGED_SLAB_BYTES;
            for copy in 0..2 {
                inner.paged[copy][slab_start..slab_start + slab.len()].copy_from_slice(slab);
            }
        }
        inner.counters.paged_update_writes += 1;
        Ok(UpdateOutcome::Written)
    }

    fn nonpaged_read(&self) -> Result<Vec<u8>> {
        Ok(self.inner.lock().nonpaged.to_vec())
    }

    fn nonpaged_write(&self, offset: usize, bytes: &[u8], persist: bool) -> Result<()> {
        if offset + bytes.len() > NP_RECORD_SIZE {
            return Err(PvdError::OutOfRange {
                what: "non-paged write".to_owned(),
                value: format!("{}..{}", offset, offset + bytes.len()),
            });
        }
        let mut inner = self.inner.lock();
        if let Some(status) = inner.take_fault(FaultOp::NonPagedWrite) {
            return Err(PvdError::retryable(status));
        }
        inner.nonpaged[offset..offset + bytes.len()].copy_from_slice(bytes);
        if persist {
            let image = inner.nonpaged;
            inner.nonpaged_persisted = image;
            inner.counters.nonpaged_persist_writes += 1;
        } else {
            inner.counters.nonpaged_local_writes += 1;
        }
        Ok(())
    }

    fn np_lock(&self) -> NpLockGuard<'_> {
        self.np_lock.acquire()
    }

    fn stripe_lock(&self, span: PagedSpan) -> StripeLockGuard<'_> {
        self.stripe_locks.acquire(span)
    }

    fn paged_region_len(&self) -> u64 {
        self.paged_len
    }
}
