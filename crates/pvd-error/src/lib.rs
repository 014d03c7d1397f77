//! Error taxonomy for the provision-drive metadata engine.
//!
//! Four classes of failure flow through this crate:
//!
//! 1. Caller-contract violations ([`PvdError::InvalidRequest`]) — misaligned
//!    or out-of-capacity ranges, bad record sizes. Failed immediately with a
//!    distinguishing [`InvalidRequestQualifier`], never retried.
//! 2. Transient metadata/I/O errors ([`PvdError::IoFailed`] with
//!    `retry_possible: true`) — left to the caller's retry policy.
//! 3. Uncorrectable metadata errors — handled inside the paged-update retry
//!    tier and only surfaced (as `IoFailed` with `retry_possible: false`)
//!    when the write-verify retry also fails.
//! 4. Key-lifecycle errors — carried as [`MetadataStatus`] qualifiers so the
//!    validation-area manager can drive the client into a named locked state
//!    instead of retrying.

use serde::Serialize;
use thiserror::Error;

/// Result alias used across all `pvd-*` crates.
pub type Result<T> = std::result::Result<T, PvdError>;

/// Completion status of a metadata-service operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetadataStatus {
    /// Operation completed.
    Ok,
    /// The key handle presented to the service was not recognized. Indicates
    /// a software defect rather than an environmental condition.
    BadKeyHandle,
    /// Encryption is not enabled for the target region.
    EncryptionNotEnabled,
    /// The wrapped key could not be unwrapped; a fresh key push is required.
    KeyWrapError,
    /// The underlying media returned an uncorrectable error.
    IoUncorrectable,
}

impl MetadataStatus {
    /// Whether this status names a key-lifecycle failure that cannot be
    /// cleared by retrying.
    #[must_use]
    pub const fn is_key_error(self) -> bool {
        matches!(
            self,
            Self::BadKeyHandle | Self::EncryptionNotEnabled | Self::KeyWrapError
        )
    }
}

/// Distinguishes caller-contract violations from one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InvalidRequestQualifier {
    /// A zero/consume request was not chunk-aligned.
    UnalignedZeroRequest,
    /// The request range extends past the exported capacity.
    CapacityExceeded,
    /// The LBA range itself is malformed (invalid start or zero length).
    InvalidLbaRange,
    /// A record buffer had the wrong size for the entry type.
    BadRecordSize,
}

/// Unified error type for the provision-drive metadata engine.
#[derive(Debug, Error)]
pub enum PvdError {
    /// The caller violated an interface contract. Never retried.
    #[error("invalid request: {qualifier:?}")]
    InvalidRequest {
        /// Which contract was violated.
        qualifier: InvalidRequestQualifier,
    },

    /// A metadata or backing-store operation failed.
    #[error("metadata I/O failed with {status:?} (retry_possible={retry_possible})")]
    IoFailed {
        /// Status reported by the metadata service.
        status: MetadataStatus,
        /// Whether the caller's retry policy may reasonably re-submit.
        retry_possible: bool,
    },

    /// The non-paged snapshot has not been initialized for this object.
    #[error("non-paged metadata not initialized")]
    NotInitialized,

    /// A value fell outside its legal range.
    #[error("{what} out of range: {value}")]
    OutOfRange {
        /// Which quantity was out of range.
        what: String,
        /// The offending value, stringified.
        value: String,
    },

    /// Invariant violation inside the engine itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PvdError {
    /// Construct an [`PvdError::Internal`] from any displayable message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Shorthand for a contract violation.
    #[must_use]
    pub const fn invalid(qualifier: InvalidRequestQualifier) -> Self {
        Self::InvalidRequest { qualifier }
    }

    /// Shorthand for a transient failure the caller may retry.
    #[must_use]
    pub const fn retryable(status: MetadataStatus) -> Self {
        Self::IoFailed {
            status,
            retry_possible: true,
        }
    }

    /// Shorthand for a failure that survived the local retry tier.
    #[must_use]
    pub const fn fatal(status: MetadataStatus) -> Self {
        Self::IoFailed {
            status,
            retry_possible: false,
        }
    }
}
