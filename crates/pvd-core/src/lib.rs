//! The provision-drive object.
//!
//! Ties the paged engine, the non-paged checkpoint manager, and the
//! per-client encryption validation areas together behind the control
//! surface the object dispatcher calls: mark-consumed / unmark-zero,
//! checkpoint get/set/advance, zero pipelines, NP flags, and key
//! validation.

pub mod cache;
pub mod consume;
pub mod drive;
pub mod events;
pub mod keys;
pub mod report;
pub mod spare;
pub mod zero;

pub use cache::{CacheStats, FlushGuard, PagedMetadataCache};
pub use consume::{ConsumeOp, ConsumeOutcome, PagedUpdateRequest, StepProgress, SweepControl};
pub use drive::{BackgroundZeroProgress, ConfigType, ProvisionDrive};
pub use events::{EventLog, NullEventLog, PvdEvent, RecordingEventLog};
pub use keys::{
    ClientEncryptionState, ClientKeyInfo, InitOutcome, KeyHandle, MemoryValidationArea, PathState,
    ValidationAreaIo, ValidationAreaManager, ValidationOutcome,
};
pub use report::SniffVerifyReport;
pub use spare::SpareConfig;
pub use zero::{MemoryZeroTarget, ZeroMethod, ZeroPipeline, ZeroStep, ZeroTarget};
