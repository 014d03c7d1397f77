//! Peer replication and upstream notification seam.

use parking_lot::Mutex;
use pvd_types::nonpaged::CheckpointField;
use pvd_types::units::Lba;

/// Consumes peer-synchronized checkpoint updates and upstream
/// checkpoint-change notifications.
pub trait PeerNotifier {
    /// Replicate a force-set checkpoint to the peer node. Always a full set,
    /// never a delta: the peer's view may be stale by more than one delta.
    fn replicate_checkpoint(&self, field: CheckpointField, value: Lba);

    /// Emit the upstream checkpoint-change notification.
    fn checkpoint_changed(&self, field: CheckpointField, value: Lba);
}

/// No peer configured (single-node bring-up).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPeer;

impl PeerNotifier for NullPeer {
    fn replicate_checkpoint(&self, _field: CheckpointField, _value: Lba) {}
    fn checkpoint_changed(&self, _field: CheckpointField, _value: Lba) {}
}

/// Records every call for assertions.
#[derive(Debug, Default)]
pub struct RecordingPeer {
    /// Replicated `(field, value)` pairs in order.
    pub replicated: Mutex<Vec<(CheckpointField, Lba)>>,
    /// Notified `(field, value)` pairs in order.
    pub notified: Mutex<Vec<(CheckpointField, Lba)>>,
}

impl RecordingPeer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of replications seen.
    #[must_use]
    pub fn replication_count(&self) -> usize {
        self.replicated.lock().len()
    }
}

impl PeerNotifier for RecordingPeer {
    fn replicate_checkpoint(&self, field: CheckpointField, value: Lba) {
        self.replicated.lock().push((field, value));
    }

    fn checkpoint_changed(&self, field: CheckpointField, value: Lba) {
        self.notified.lock().push((field, value));
    }
}

impl<P: PeerNotifier> PeerNotifier for &P {
    fn replicate_checkpoint(&self, field: CheckpointField, value: Lba) {
        (*self).replicate_checkpoint(field, value);
    }

    fn checkpoint_changed(&self, field: CheckpointField, value: Lba) {
        (*self).checkpoint_changed(field, value);
    }
}

impl<P: PeerNotifier> PeerNotifier for std::sync::Arc<P> {
    fn replicate_checkpoint(&self, field: CheckpointField, value: Lba) {
        self.as_ref().replicate_checkpoint(field, value);
    }

    fn checkpoint_changed(&self, field: CheckpointField, value: Lba) {
        self.as_ref().checkpoint_changed(field, value);
    }
}
