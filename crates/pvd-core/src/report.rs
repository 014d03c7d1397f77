//! Sniff-verify report.
//!
//! Per-drive error accounting collected while the sniff-verify sweep walks
//! the media. Held in memory for the life of the object; the pass count
//! itself is persisted through the non-paged record.

use serde::Serialize;

/// Accumulated sniff-verify results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SniffVerifyReport {
    /// Completed full passes over the exported capacity.
    pub passes_completed: u32,
    /// Media errors the drive recovered after retry.
    pub recoverable_errors: u32,
    /// Media errors the drive could not recover.
    pub unrecoverable_errors: u32,
    /// Location of the most recent error, for sniff resume.
    pub last_error_lba: Option<u64>,
}

impl SniffVerifyReport {
    /// Account one media error found by the sweep.
    pub fn record_error(&mut self, lba: u64, recoverable: bool) {
        if recoverable {
            self.recoverable_errors += 1;
        } else {
            self.unrecoverable_errors += 1;
        }
        self.last_error_lba = Some(lba);
    }

    /// Account a completed pass.
    pub fn complete_pass(&mut self) {
        self.passes_completed += 1;
    }

    /// Total errors across both classes.
    #[must_use]
    pub const fn total_errors(&self) -> u32 {
        self.recoverable_errors + self.unrecoverable_errors
    }

    /// Clear all counters (operator-requested report reset).
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
