//! Non-paged checkpoint manager.
//!
//! Owns the in-memory snapshot of the persisted non-paged record and the
//! policy around it: checkpoint clamping, the peer-sync throttle that keeps
//! per-chunk progress updates off the inter-node channel, and NP-lock-scoped
//! flag mutation.

pub mod clock;
pub mod manager;
pub mod peer;

pub use clock::{Clock, SimClock, SystemClock};
pub use manager::{FlushGate, IncrementOutcome, NoFlushGate, NonPagedManager, NpTxn};
pub use peer::{NullPeer, PeerNotifier, RecordingPeer};
