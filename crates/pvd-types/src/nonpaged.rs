//! The non-paged metadata record: one fixed-size, whole-object persisted
//! record of scalar state (checkpoints, health flags, validation bitmap).
//!
//! The record has a fixed 128-byte little-endian layout so that sub-field
//! writes can address a stable `(offset, length)` window. [`NonPagedField`]
//! names each window; the encoding tests pin the layout.

use bitflags::bitflags;
use serde::Serialize;

use crate::units::Lba;

/// On-disk size of the non-paged record, in bytes.
pub const NP_RECORD_SIZE: usize = 128;

bitflags! {
    /// Persisted NP condition flags.
    ///
    /// `PAGED_NEEDS_ZERO` and `PAGED_VALID` are mutually exclusive; the
    /// checkpoint manager enforces that they are never both set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NpFlags: u64 {
        /// The paged metadata region itself has not been default-painted.
        const PAGED_NEEDS_ZERO = 0x0001;
        /// The paged metadata region is painted and trustworthy.
        const PAGED_VALID = 0x0002;
        /// Drive earmarked for spare replacement: proactive copy.
        const SWAP_PENDING_PROACTIVE = 0x0004;
        /// Drive earmarked for spare replacement: user-initiated copy.
        const SWAP_PENDING_USER = 0x0008;
        /// Encryption-area scrub has started.
        const EAS_STARTED = 0x0010;
        /// Encryption-area scrub is complete.
        const EAS_COMPLETE = 0x0020;
        /// Consumed area needs scrubbing.
        const SCRUB_NEEDED = 0x0040;
        /// Scrub intent has been persisted.
        const SCRUB_INTENT = 0x0080;
        /// Scrub finished.
        const SCRUB_ENDED = 0x0100;
    }
}

impl NpFlags {
    /// Both swap-pending reasons.
    pub const SWAP_PENDING_MASK: Self =
        Self::SWAP_PENDING_PROACTIVE.union(Self::SWAP_PENDING_USER);
}

/// Why a drive is earmarked for spare replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwapPendingReason {
    /// Health heuristics requested a proactive copy.
    ProactiveCopy,
    /// An operator requested the copy.
    UserCopy,
}

impl SwapPendingReason {
    /// The NP flag bit representing this reason.
    #[must_use]
    pub const fn flag(self) -> NpFlags {
        match self {
            Self::ProactiveCopy => NpFlags::SWAP_PENDING_PROACTIVE,
            Self::UserCopy => NpFlags::SWAP_PENDING_USER,
        }
    }
}

/// Physical drive technology, persisted to detect reseating into a slot
/// expecting different media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[repr(u32)]
pub enum DriveType {
    /// Unknown or not yet negotiated.
    #[default]
    Invalid = 0,
    /// SAS rotating media.
    Sas = 1,
    /// Nearline (high capacity, low RPM) SAS.
    NearlineSas = 2,
    /// SAS solid state.
    SasFlash = 3,
    /// SATA rotating media.
    Sata = 4,
}

impl DriveType {
    fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Sas,
            2 => Self::NearlineSas,
            3 => Self::SasFlash,
            4 => Self::Sata,
            _ => Self::Invalid,
        }
    }
}

/// Physical location of the backing drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DriveLocation {
    /// Back-end port number.
    pub port: u32,
    /// Enclosure number on the port.
    pub enclosure: u32,
    /// Slot within the enclosure.
    pub slot: u32,
    /// Drive technology.
    pub drive_type: DriveType,
}

impl DriveLocation {
    /// Whether `other` describes the same physical drive position and type.
    /// A mismatch after power-up means the drive was reseated.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self == other
    }
}

/// Named sub-field windows of the on-disk record, for partial writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonPagedField {
    ZeroCheckpoint,
    SniffVerifyCheckpoint,
    SniffPassCount,
    VerifyInvalidateCheckpoint,
    MediaErrorLba,
    DriveLocation,
    HealthState,
    RemoveTimestamp,
    Flags,
    ValidateAreaBitmap,
}

impl NonPagedField {
    /// Byte window of this field within the encoded record.
    #[must_use]
    pub const fn window(self) -> (usize, usize) {
        match self {
            Self::ZeroCheckpoint => (0, 8),
            Self::SniffVerifyCheckpoint => (8, 8),
            Self::SniffPassCount => (16, 4),
            Self::VerifyInvalidateCheckpoint => (24, 8),
            Self::MediaErrorLba => (32, 8),
            Self::DriveLocation => (40, 16),
            Self::HealthState => (56, 4),
            Self::RemoveTimestamp => (64, 8),
            Self::Flags => (72, 8),
            Self::ValidateAreaBitmap => (80, 8),
        }
    }
}

/// Checkpoint fields advanced by background sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckpointField {
    /// Background-zeroing progress.
    Zero,
    /// Sniff-verify progress.
    SniffVerify,
    /// Metadata verify-invalidate progress.
    VerifyInvalidate,
}

impl CheckpointField {
    /// The record window persisted for this checkpoint.
    #[must_use]
    pub const fn record_field(self) -> NonPagedField {
        match self {
            Self::Zero => NonPagedField::ZeroCheckpoint,
            Self::SniffVerify => NonPagedField::SniffVerifyCheckpoint,
            Self::VerifyInvalidate => NonPagedField::VerifyInvalidateCheckpoint,
        }
    }
}

/// The whole-object persisted scalar state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonPagedRecord {
    /// Background-zeroing progress; `INVALID` = complete.
    pub zero_checkpoint: Lba,
    /// Sniff-verify progress.
    pub sniff_verify_checkpoint: Lba,
    /// Completed sniff-verify passes.
    pub sniff_pass_count: u32,
    /// Metadata verify-invalidate progress; `INVALID` = not needed.
    pub verify_invalidate_checkpoint: Lba,
    /// Last known media error location, for sniff resume.
    pub media_error_lba: Lba,
    /// Physical drive position, for reseat detection.
    pub drive_location: DriveLocation,
    /// Persisted end-of-life health flag.
    pub end_of_life_state: bool,
    /// Persisted drive-fault health flag.
    pub drive_fault_state: bool,
    /// Whether un-zeroed reads must be serviced by on-demand zero fill.
    pub zero_on_demand: bool,
    /// System time (ms) the drive was last seen removed.
    pub remove_timestamp: u64,
    /// NP condition flags.
    pub flags: NpFlags,
    /// Per-client, per-key-slot validation bitmap (2 bits per client).
    pub validate_area_bitmap: u64,
}

impl Default for NonPagedRecord {
    fn default() -> Self {
        Self {
            zero_checkpoint: Lba::ZERO,
            sniff_verify_checkpoint: Lba::ZERO,
            sniff_pass_count: 0,
            verify_invalidate_checkpoint: Lba::INVALID,
            media_error_lba: Lba::INVALID,
            drive_location: DriveLocation::default(),
            end_of_life_state: false,
            drive_fault_state: false,
            zero_on_demand: true,
            remove_timestamp: 0,
            flags: NpFlags::PAGED_NEEDS_ZERO,
            validate_area_bitmap: 0,
        }
    }
}

impl NonPagedRecord {
    /// Read a checkpoint field.
    #[must_use]
    pub const fn checkpoint(&self, field: CheckpointField) -> Lba {
        match field {
            CheckpointField::Zero => self.zero_checkpoint,
            CheckpointField::SniffVerify => self.sniff_verify_checkpoint,
            CheckpointField::VerifyInvalidate => self.verify_invalidate_checkpoint,
        }
    }

    /// Write a checkpoint field.
    pub fn set_checkpoint(&mut self, field: CheckpointField, value: Lba) {
        match field {
            CheckpointField::Zero => self.zero_checkpoint = value,
            CheckpointField::SniffVerify => self.sniff_verify_checkpoint = value,
            CheckpointField::VerifyInvalidate => self.verify_invalidate_checkpoint = value,
        }
    }

    /// Encode to the fixed on-disk layout.
    #[must_use]
    pub fn encode(&self) -> [u8; NP_RECORD_SIZE] {
        let mut buf = [0_u8; NP_RECORD_SIZE];
        buf[0..8].copy_from_slice(&self.zero_checkpoint.get().to_le_bytes());
        buf[8..16].copy_from_slice(&self.sniff_verify_checkpoint.get().to_le_bytes());
        buf[16..20].copy_from_slice(&self.sniff_pass_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.verify_invalidate_checkpoint.get().to_le_bytes());
        buf[32..40].copy_from_slice(&self.media_error_lba.get().to_le_bytes());
        buf[40..44].copy_from_slice(&self.drive_location.port.to_le_bytes());
        buf[44..48].copy_from_slice(&self.drive_location.enclosure.to_le_bytes());
        buf[48..52].copy_from_slice(&self.drive_location.slot.to_le_bytes());
        buf[52..56].copy_from_slice(&(self.drive_location.drive_type as u32).to_le_bytes());
        buf[56] = u8::from(self.end_of_life_state);
        buf[57] = u8::from(self.drive_fault_state);
        buf[58] = u8::from(self.zero_on_demand);
        buf[64..72].copy_from_slice(&self.remove_timestamp.to_le_bytes());
        buf[72..80].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[80..88].copy_from_slice(&self.validate_area_bitmap.to_le_bytes());
        buf
    }

    /// Decode from the fixed on-disk layout. Unknown flag bits are retained.
    #[must_use]
    pub fn decode(buf: &[u8; NP_RECORD_SIZE]) -> Self {
        let u64_at = |offset: usize| {
            let mut bytes = [0_u8; 8];
            bytes.copy_from_slice(&buf[offset..offset + 8]);
            u64::from_le_bytes(bytes)
        };
        let u32_at = |offset: usize| {
            let mut bytes = [0_u8; 4];
            bytes.copy_from_slice(&buf[offset..offset + 4]);
            u32::from_le_bytes(bytes)
        };
        Self {
            zero_checkpoint: Lba(u64_at(0)),
            sniff_verify_checkpoint: Lba(u64_at(8)),
            sniff_pass_count: u32_at(16),
            verify_invalidate_checkpoint: Lba(u64_at(24)),
            media_error_lba: Lba(u64_at(32)),
            drive_location: DriveLocation {
                port: u32_at(40),
                enclosure: u32_at(44),
                slot: u32_at(48),
                drive_type: DriveType::from_code(u32_at(52)),
            },
            end_of_life_state: buf[56] != 0,
            drive_fault_state: buf[57] != 0,
            zero_on_demand: buf[58] != 0,
            remove_timestamp: u64_at(64),
            flags: NpFlags::from_bits_retain(u64_at(72)),
            validate_area_bitmap: u64_at(80),
        }
    }

    /// Encode just one field's window: `(offset, bytes)`.
    #[must_use]
    pub fn encode_field(&self, field: NonPagedField) -> (usize, Vec<u8>) {
        let (offset, len) = field.window();
        let full = self.encode();
        (offset, full[offset..offset + len].to_vec())
    }
}
