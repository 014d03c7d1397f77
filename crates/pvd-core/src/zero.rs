//! Zero / write-same pipeline.
//!
//! Physically zero-fills a drive region in chunk-bounded steps before the
//! paged metadata for that region can be trusted. The loop is a resumable
//! state machine: each [`ZeroPipeline::step`] submits at most one
//! chunk-bounded write and the completion re-enters the same submission
//! path. No two steps of one pipeline overlap; independent pipelines do not
//! interact.

use parking_lot::Mutex;
use pvd_error::{InvalidRequestQualifier, PvdError, Result};
use pvd_types::units::{BlockCount, Lba};
use tracing::{debug, trace};

/// How a step was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroMethod {
    /// Hardware write-same primitive.
    WriteSame,
    /// Fallback write from the preallocated zero buffer.
    BufferWrite,
}

/// The physical write surface for zero fills.
pub trait ZeroTarget {
    /// Whether the target supports the hardware write-same primitive.
    fn supports_write_same(&self) -> bool;

    /// Zero `blocks` at `lba` with write-same.
    fn write_same_zero(&self, lba: Lba, blocks: BlockCount) -> Result<()>;

    /// Zero `blocks` at `lba` from a preallocated zero-filled buffer.
    fn write_zero_buffer(&self, lba: Lba, blocks: BlockCount) -> Result<()>;
}

/// Result of one pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroStep {
    /// One chunk-bounded write completed; more blocks remain.
    Submitted {
        /// Start of the written step.
        lba: Lba,
        /// Blocks written in the step.
        blocks: BlockCount,
        /// Primitive used.
        method: ZeroMethod,
    },
    /// The whole region is zeroed.
    Complete,
}

/// One in-flight zero-fill sequence.
pub struct ZeroPipeline<'a, T: ZeroTarget> {
    target: &'a T,
    chunk_size: u64,
    next_lba: Lba,
    remaining: u64,
}

impl<'a, T: ZeroTarget> ZeroPipeline<'a, T> {
    /// Build a pipeline over `[start, start + blocks)`.
    pub fn new(target: &'a T, chunk_size: u64, start: Lba, blocks: BlockCount) -> Result<Self> {
        if start.is_invalid() || blocks.is_zero() {
            return Err(PvdError::invalid(InvalidRequestQualifier::InvalidLbaRange));
        }
        if chunk_size == 0 {
            return Err(PvdError::OutOfRange {
                what: "chunk size".to_owned(),
                value: "0".to_owned(),
            });
        }
        Ok(Self {
            target,
            chunk_size,
            next_lba: start,
            remaining: blocks.get(),
        })
    }

    /// Blocks not yet written.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Submit the next chunk-bounded write. The first step is clamped to
    /// the chunk boundary; the final step may be shorter than a chunk.
    pub fn step(&mut self) -> Result<ZeroStep> {
        if self.remaining == 0 {
            return Ok(ZeroStep::Complete);
        }
        let lba = self.next_lba;
        let to_boundary = self.chunk_size - (lba.get() % self.chunk_size);
        let step_blocks = self.remaining.min(to_boundary);

        let method = if self.target.supports_write_same() {
            self.target.write_same_zero(lba, BlockCount(step_blocks))?;
            ZeroMethod::WriteSame
        } else {
            self.target.write_zero_buffer(lba, BlockCount(step_blocks))?;
            ZeroMethod::BufferWrite
        };
        trace!(
            target: "pvd::zero",
            lba = lba.get(),
            blocks = step_blocks,
            ?method,
            "zero step written"
        );

        self.next_lba = Lba(lba.get() + step_blocks);
        self.remaining -= step_blocks;
        Ok(ZeroStep::Submitted {
            lba,
            blocks: BlockCount(step_blocks),
            method,
        })
    }

    /// Run the whole sequence; the first failure aborts it and propagates.
    pub fn run(mut self) -> Result<u64> {
        let mut steps = 0_u64;
        loop {
            match self.step()? {
                ZeroStep::Submitted { .. } => steps += 1,
                ZeroStep::Complete => {
                    debug!(target: "pvd::zero", steps, "zero pipeline complete");
                    return Ok(steps);
                }
            }
        }
    }
}

/// Recording in-memory target for tests.
#[derive(Debug)]
pub struct MemoryZeroTarget {
    write_same: bool,
    writes: Mutex<Vec<(Lba, BlockCount, ZeroMethod)>>,
    fail_at_step: Mutex<Option<usize>>,
}

impl MemoryZeroTarget {
    /// A target that does (or does not) support write-same.
    #[must_use]
    pub fn new(write_same: bool) -> Self {
        Self {
            write_same,
            writes: Mutex::new(Vec::new()),
            fail_at_step: Mutex::new(None),
        }
    }

    /// Fail the `n`th write (0-based).
    pub fn fail_at(&self, step: usize) {
        *self.fail_at_step.lock() = Some(step);
    }

    /// Writes seen so far.
    #[must_use]
    pub fn writes(&self) -> Vec<(Lba, BlockCount, ZeroMethod)> {
        self.writes.lock().clone()
    }

    fn record(&self, lba: Lba, blocks: BlockCount, method: ZeroMethod) -> Result<()> {
        let mut writes = self.writes.lock();
        if *self.fail_at_step.lock() == Some(writes.len()) {
            return Err(PvdError::retryable(pvd_error::MetadataStatus::IoUncorrectable));
        }
        writes.push((lba, blocks, method));
        Ok(())
    }
}

impl ZeroTarget for MemoryZeroTarget {
    fn supports_write_same(&self) -> bool {
        self.write_same
    }

    fn write_same_zero(&self, lba: Lba, blocks: BlockCount) -> Result<()> {
        self.record(lba, blocks, ZeroMethod::WriteSame)
    }

    fn write_zero_buffer(&self, lba: Lba, blocks: BlockCount) -> Result<()> {
        self.record(lba, blocks, ZeroMethod::BufferWrite)
    }
}
