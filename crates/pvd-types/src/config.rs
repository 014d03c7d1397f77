//! Engine configuration tunables.
//!
//! The representative values here (3000 ms peer-sync interval, 64-block
//! validation areas) are operational defaults, not protocol requirements;
//! deployments override them through [`PvdConfig`].

use std::time::Duration;

use crate::units::Lba;

/// Default chunk size in blocks (2MB-equivalent at 1KB blocks).
pub const DEFAULT_CHUNK_SIZE: u64 = 2048;

/// Default minimum interval between peer-synchronized checkpoint updates.
pub const DEFAULT_PEER_SYNC_INTERVAL: Duration = Duration::from_millis(3000);

/// Default number of blocks in each client's key-validation area.
pub const DEFAULT_VALIDATION_AREA_BLOCKS: u32 = 64;

/// Default number of mismatching sectors that fails key validation.
pub const DEFAULT_VALIDATION_MISMATCH_THRESHOLD: u32 = 1;

/// Default number of client edges a drive can serve.
pub const DEFAULT_CLIENT_SLOTS: usize = 4;

/// Tunable configuration for one provision-drive object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PvdConfig {
    /// Chunk size in blocks.
    pub chunk_size: u64,
    /// Minimum interval between peer-synchronized checkpoint updates.
    pub peer_sync_interval: Duration,
    /// Blocks per client key-validation area.
    pub validation_area_blocks: u32,
    /// Mismatching-sector count at which key validation fails.
    pub validation_mismatch_threshold: u32,
    /// Number of client edges (bounded by the 2-bits-per-client bitmap).
    pub client_slots: usize,
    /// Background zeroing on system drives starts above this offset so the
    /// private system area is never background-zeroed.
    pub system_drive_zero_offset: Lba,
}

impl Default for PvdConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            peer_sync_interval: DEFAULT_PEER_SYNC_INTERVAL,
            validation_area_blocks: DEFAULT_VALIDATION_AREA_BLOCKS,
            validation_mismatch_threshold: DEFAULT_VALIDATION_MISMATCH_THRESHOLD,
            client_slots: DEFAULT_CLIENT_SLOTS,
            system_drive_zero_offset: Lba::ZERO,
        }
    }
}

impl PvdConfig {
    /// Where background zeroing starts for a fresh drive.
    #[must_use]
    pub const fn default_zero_checkpoint(&self, is_system_drive: bool) -> Lba {
        if is_system_drive {
            self.system_drive_zero_offset
        } else {
            Lba::ZERO
        }
    }

    /// Maximum client slots representable in the 2-bits-per-client bitmap.
    pub const MAX_CLIENT_SLOTS: usize = 32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PvdConfig::default();
        assert_eq!(config.chunk_size, 2048);
        assert_eq!(config.peer_sync_interval, Duration::from_millis(3000));
        assert_eq!(config.validation_area_blocks, 64);
        assert!(config.client_slots <= PvdConfig::MAX_CLIENT_SLOTS);
    }

    #[test]
    fn test_system_drive_zero_offset() {
        let config = PvdConfig {
            system_drive_zero_offset: Lba(0x10000),
            ..PvdConfig::default()
        };
        assert_eq!(config.default_zero_checkpoint(true), Lba(0x10000));
        assert_eq!(config.default_zero_checkpoint(false), Lba::ZERO);
    }
}
