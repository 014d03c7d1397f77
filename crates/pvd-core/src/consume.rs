//! Mark-consumed / unmark-zero state machine.
//!
//! One logical request walks `Validating → UpdatingPaged → (Done |
//! RetryWriteVerify → UpdatingPagedVerified) → Done`. Each suspension point
//! is an explicit [`PagedUpdateRequest::step`]; [`PagedUpdateRequest::run`]
//! drives the machine to completion for callers that do not interleave.
//!
//! An `IoUncorrectable` status from the paged update does not fail the
//! caller: the same logical update is re-issued as a write-verify rewrite
//! (forcing the valid and consumed bits), and the verify-invalidate sweep is
//! armed on the owning object so other regions hit by the same fault get
//! swept later.

use pvd_error::{MetadataStatus, PvdError, Result};
use pvd_metasvc::{MetadataService, UpdateOutcome};
use pvd_paged::PagedEngine;
use pvd_types::chunk::ChunkRange;
use pvd_types::paged::{PagedEntry, PagedFlags};
use pvd_types::units::{BlockCount, Lba};
use tracing::{debug, warn};

/// Which logical update this request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOp {
    /// Set the consumed-user-data bit across the range.
    MarkConsumed,
    /// Clear the need-zero and user-zero bits across the range (background
    /// zeroing finished these chunks).
    UnmarkZero,
}

impl ConsumeOp {
    /// Bits set by the normal update path.
    #[must_use]
    pub const fn set_mask(self) -> PagedFlags {
        match self {
            Self::MarkConsumed => PagedFlags::CONSUMED_USER_DATA,
            Self::UnmarkZero => PagedFlags::empty(),
        }
    }

    /// Bits cleared by the normal update path.
    #[must_use]
    pub const fn clear_mask(self) -> PagedFlags {
        match self {
            Self::MarkConsumed => PagedFlags::empty(),
            Self::UnmarkZero => PagedFlags::NEED_ZERO.union(PagedFlags::USER_ZERO),
        }
    }

    /// Base image for the write-verify rewrite. The engine forces the valid
    /// and consumed bits on top.
    #[must_use]
    pub const fn rewrite_entry(self) -> PagedEntry {
        PagedEntry(self.set_mask())
    }
}

/// Arms background conditions on the owning object.
pub trait SweepControl {
    /// Schedule the metadata verify-invalidate sweep.
    fn arm_verify_invalidate(&self) -> Result<()>;
}

/// Terminal result of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOutcome {
    /// Whether the paged region was written or the read-only fast path hit.
    pub update: UpdateOutcome,
    /// Whether the write-verify retry tier ran.
    pub write_verify_used: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Validating,
    UpdatingPaged,
    RetryWriteVerify,
    Done(ConsumeOutcome),
}

/// Result of a single [`PagedUpdateRequest::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepProgress {
    /// More steps remain.
    Pending,
    /// The request finished.
    Complete(ConsumeOutcome),
}

/// One in-flight mark-consumed or unmark-zero request.
pub struct PagedUpdateRequest<'a, S: MetadataService> {
    engine: &'a PagedEngine<'a, S>,
    sweeps: &'a dyn SweepControl,
    op: ConsumeOp,
    lba: Lba,
    blocks: BlockCount,
    range: Option<ChunkRange>,
    state: State,
}

impl<'a, S: MetadataService> PagedUpdateRequest<'a, S> {
    /// Build a request; nothing is validated or submitted until stepped.
    pub fn new(
        engine: &'a PagedEngine<'a, S>,
        sweeps: &'a dyn SweepControl,
        op: ConsumeOp,
        lba: Lba,
        blocks: BlockCount,
    ) -> Self {
        Self {
            engine,
            sweeps,
            op,
            lba,
            blocks,
            range: None,
            state: State::Validating,
        }
    }

    /// The validated chunk range, once past validation.
    #[must_use]
    pub const fn range(&self) -> Option<ChunkRange> {
        self.range
    }

    /// Advance the machine by one transition.
    pub fn step(&mut self) -> Result<StepProgress> {
        match self.state {
            State::Validating => {
                // Contract violations are the caller's bug: fail fast with
                // the distinguishing qualifier, never retry.
                let range = self
                    .engine
                    .geometry()
                    .exact_chunk_range(self.lba, self.blocks)?;
                self.range = Some(range);
                self.state = State::UpdatingPaged;
                Ok(StepProgress::Pending)
            }
            State::UpdatingPaged => {
                let range = self.range.ok_or_else(|| {
                    PvdError::internal("paged update entered without a validated range")
                })?;
                let result = match self.op {
                    ConsumeOp::MarkConsumed => self.engine.set_bits(range, self.op.set_mask()),
                    ConsumeOp::UnmarkZero => self.engine.clear_bits(range, self.op.clear_mask()),
                };
                match result {
                    Ok(update) => {
                        let outcome = ConsumeOutcome {
                            update,
                            write_verify_used: false,
                        };
                        self.state = State::Done(outcome);
                        Ok(StepProgress::Complete(outcome))
                    }
                    Err(PvdError::IoFailed {
                        status: MetadataStatus::IoUncorrectable,
                        ..
                    }) => {
                        warn!(
                            target: "pvd::consume",
                            op = ?self.op,
                            start = range.start.get(),
                            count = range.count.get(),
                            "uncorrectable paged update; escalating to write-verify"
                        );
                        // Other regions may be hit by the same fault; sweep
                        // them later regardless of how the retry goes.
                        self.sweeps.arm_verify_invalidate()?;
                        self.state = State::RetryWriteVerify;
                        Ok(StepProgress::Pending)
                    }
                    Err(PvdError::IoFailed { status, .. }) => {
                        // Transient: the caller's retry policy applies.
                        Err(PvdError::retryable(status))
                    }
                    Err(other) => Err(other),
                }
            }
            State::RetryWriteVerify => {
                let range = self.range.ok_or_else(|| {
                    PvdError::internal("write-verify entered without a validated range")
                })?;
                match self.engine.write_verify(range, self.op.rewrite_entry()) {
                    Ok(()) => {
                        let outcome = ConsumeOutcome {
                            update: UpdateOutcome::Written,
                            write_verify_used: true,
                        };
                        debug!(
                            target: "pvd::consume",
                            op = ?self.op,
                            "write-verify retry recovered the update"
                        );
                        self.state = State::Done(outcome);
                        Ok(StepProgress::Complete(outcome))
                    }
                    Err(PvdError::IoFailed { status, .. }) => Err(PvdError::fatal(status)),
                    Err(other) => Err(other),
                }
            }
            State::Done(outcome) => Ok(StepProgress::Complete(outcome)),
        }
    }

    /// Drive the machine to completion.
    pub fn run(mut self) -> Result<ConsumeOutcome> {
        loop {
            if let StepProgress::Complete(outcome) = self.step()? {
                return Ok(outcome);
            }
        }
    }
}
