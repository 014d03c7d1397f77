//! Operator-visible event surface.
//!
//! Structured events for JSON export, alongside the `tracing` statements at
//! the emission sites. Observers must not block or perform I/O.

use parking_lot::Mutex;
use pvd_error::MetadataStatus;
use serde::Serialize;

/// Structured operator-visible events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PvdEvent {
    /// Key validation read back wrong data for a client.
    KeysIncorrect {
        /// Client edge index.
        client: usize,
        /// Sectors whose checksum did not match.
        mismatched_sectors: u32,
        /// Sectors checked.
        checked_sectors: u32,
    },
    /// A key-lifecycle failure drove the client into the locked-error
    /// state.
    KeyError {
        /// Client edge index.
        client: usize,
        /// Service status that triggered the transition.
        status: MetadataStatus,
    },
    /// A client's validation area was initialized and its bitmap bit
    /// persisted.
    ValidationAreaInitialized {
        /// Client edge index.
        client: usize,
        /// Which key slot (0 or 1) now backs the area.
        key_slot: u8,
    },
    /// Background zeroing progressed to a new integer percentage.
    ZeroProgress {
        /// Percent complete.
        percent: u32,
    },
}

/// Event sink.
pub trait EventLog {
    /// Record one event.
    fn log(&self, event: PvdEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventLog;

impl EventLog for NullEventLog {
    fn log(&self, _event: PvdEvent) {}
}

/// Keeps every event for assertions.
#[derive(Debug, Default)]
pub struct RecordingEventLog {
    events: Mutex<Vec<PvdEvent>>,
}

impl RecordingEventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events seen so far.
    #[must_use]
    pub fn events(&self) -> Vec<PvdEvent> {
        self.events.lock().clone()
    }
}

impl EventLog for RecordingEventLog {
    fn log(&self, event: PvdEvent) {
        self.events.lock().push(event);
    }
}
