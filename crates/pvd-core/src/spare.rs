//! Process-wide spare configuration cell.
//!
//! The spare-trigger timer is the one piece of cross-object global mutable
//! state in this subsystem: a single mutex-guarded cell with explicit init
//! and teardown tied to process lifecycle.

use parking_lot::Mutex;
use pvd_error::{PvdError, Result};

/// Spare-replacement configuration shared by every drive object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpareConfig {
    /// Seconds a drive may stay broken before a spare swap is triggered.
    pub trigger_timer_secs: u64,
}

static SPARE_CONFIG: Mutex<Option<SpareConfig>> = Mutex::new(None);

/// Install the process-wide spare configuration.
pub fn init(config: SpareConfig) {
    *SPARE_CONFIG.lock() = Some(config);
}

/// Tear the configuration down at process exit.
pub fn teardown() {
    *SPARE_CONFIG.lock() = None;
}

/// Read the current configuration.
pub fn get() -> Result<SpareConfig> {
    (*SPARE_CONFIG.lock()).ok_or_else(|| PvdError::internal("spare configuration not initialized"))
}

/// Update the trigger timer.
pub fn set_trigger_timer(secs: u64) -> Result<()> {
    let mut cell = SPARE_CONFIG.lock();
    match cell.as_mut() {
        Some(config) => {
            config.trigger_timer_secs = secs;
            Ok(())
        }
        None => Err(PvdError::internal("spare configuration not initialized")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The cell is process-global, so one test exercises the whole cycle to
    // avoid cross-test interference.
    #[test]
    fn test_init_set_get_teardown_cycle() {
        init(SpareConfig {
            trigger_timer_secs: 300,
        });
        assert_eq!(get().unwrap().trigger_timer_secs, 300);

        set_trigger_timer(600).unwrap();
        assert_eq!(get().unwrap().trigger_timer_secs, 600);

        teardown();
        assert!(get().is_err());
        assert!(set_trigger_timer(1).is_err());
    }
}
