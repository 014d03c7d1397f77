//! Per-client encryption-key validation areas.
//!
//! Each client edge of a system drive has a reserved validation region.
//! During key rotation two keys may be live at once; the
//! `validate_area_bitmap` in the non-paged record tracks, per client, which
//! key slot (bit 0 = original, bit 1 = rotated) currently backs the region
//! contents. Correctness rests on one rule: edge readiness is never granted,
//! and an area is never trusted, before the corresponding bitmap bit is
//! durably persisted.

use parking_lot::Mutex;
use pvd_error::{MetadataStatus, PvdError, Result};
use pvd_metasvc::MetadataService;
use pvd_nonpaged::{Clock, NonPagedManager, PeerNotifier};
use pvd_types::config::PvdConfig;
use tracing::{debug, error, warn};

use crate::events::{EventLog, PvdEvent};

/// Opaque handle to a registered encryption key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyHandle(pub u64);

/// Client encryption health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientEncryptionState {
    /// Keys look correct (or have not been checked yet).
    #[default]
    Normal,
    /// Validation read back wrong data: the locked keys are incorrect.
    LockedKeysIncorrect,
    /// A key-lifecycle error (bad handle, wrap error, encryption disabled)
    /// blocks validation until operator/key-push intervention.
    LockedKeyError,
}

/// Block-transport edge path state for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathState {
    /// I/O must not flow.
    #[default]
    NotReady,
    /// The edge may carry I/O.
    Ready,
}

/// Per-client key slots and edge state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientKeyInfo {
    /// Original key.
    pub key0: Option<KeyHandle>,
    /// Second key, present only mid-rekey.
    pub key1: Option<KeyHandle>,
    /// Encryption health.
    pub state: ClientEncryptionState,
    /// Edge readiness.
    pub path_state: PathState,
}

impl ClientKeyInfo {
    /// The key that writes the validation area: the second key while
    /// rekeying, else the only key. Returns `(handle, slot)`.
    #[must_use]
    pub const fn write_key(&self) -> Option<(KeyHandle, u8)> {
        match (self.key0, self.key1) {
            (_, Some(key)) => Some((key, 1)),
            (Some(key), None) => Some((key, 0)),
            (None, None) => None,
        }
    }

    /// The key that reads the validation area; same selection rule.
    #[must_use]
    pub const fn read_key(&self) -> Option<(KeyHandle, u8)> {
        self.write_key()
    }
}

/// Payload bytes per validation sector.
pub const VALIDATION_PAYLOAD_BYTES: usize = 512;

/// On-media bytes per validation sector: payload plus crc32c trailer.
pub const VALIDATION_SECTOR_BYTES: usize = VALIDATION_PAYLOAD_BYTES + 4;

/// Raw block access to a client's reserved validation region, performed
/// with a specific key.
pub trait ValidationAreaIo {
    /// Overwrite the client's region with `data` using `key`.
    fn write_blocks(&self, client: usize, key: KeyHandle, data: &[u8]) -> Result<()>;

    /// Read `len` bytes of the client's region using `key`.
    fn read_blocks(&self, client: usize, key: KeyHandle, len: usize) -> Result<Vec<u8>>;
}

/// Outcome of [`ValidationAreaManager::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// The area decoded correctly; the edge is ready.
    Valid,
    /// Too many sectors mismatched; the client is locked.
    KeysIncorrect {
        /// Sectors whose checksum did not match.
        mismatched: u32,
    },
    /// No key registered for this client.
    NoKeys,
}

/// Outcome of [`ValidationAreaManager::init_area`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// The area was written and the bitmap bit persisted.
    Initialized {
        /// Which key slot now backs the area.
        key_slot: u8,
    },
    /// The peer initialized it first; nothing to do.
    AlreadyValid,
    /// No key registered for this client.
    NoKeys,
}

/// The validation-area manager for one drive object.
///
/// Borrows the non-paged manager (for NP-lock-scoped bitmap updates), the
/// raw area I/O, and the event sink; the owning object wires these up.
pub struct ValidationAreaManager<'a, S, C, P>
where
    S: MetadataService,
    C: Clock,
    P: PeerNotifier,
{
    nonpaged: &'a NonPagedManager<S, C, P>,
    io: &'a dyn ValidationAreaIo,
    events: &'a dyn EventLog,
    clients: &'a Mutex<Vec<ClientKeyInfo>>,
    config: PvdConfig,
}

/// Deterministic validation pattern for one client: seeded payload per
/// sector with a crc32c trailer.
#[must_use]
pub fn validation_pattern(client: usize, blocks: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(blocks as usize * VALIDATION_SECTOR_BYTES);
    for sector in 0..blocks {
        let mut payload = [0_u8; VALIDATION_PAYLOAD_BYTES];
        for (index, byte) in payload.iter_mut().enumerate() {
            *byte = ((client as u32)
                .wrapping_mul(31)
                .wrapping_add(sector.wrapping_mul(7))
                .wrapping_add(index as u32)
                & 0xFF) as u8;
        }
        data.extend_from_slice(&payload);
        data.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
    }
    data
}

/// Count sectors whose payload checksum does not match the trailer.
#[must_use]
pub fn count_mismatched_sectors(data: &[u8]) -> u32 {
    data.chunks_exact(VALIDATION_SECTOR_BYTES)
        .filter(|sector| {
            let payload = &sector[..VALIDATION_PAYLOAD_BYTES];
            let mut trailer = [0_u8; 4];
            trailer.copy_from_slice(&sector[VALIDATION_PAYLOAD_BYTES..]);
            crc32c::crc32c(payload) != u32::from_le_bytes(trailer)
        })
        .count() as u32
}

const fn bitmap_bit(client: usize, slot: u8) -> u64 {
    1_u64 << (client * 2 + slot as usize)
}

impl<'a, S, C, P> ValidationAreaManager<'a, S, C, P>
where
    S: MetadataService,
    C: Clock,
    P: PeerNotifier,
{
    /// Wire up a manager.
    pub fn new(
        nonpaged: &'a NonPagedManager<S, C, P>,
        io: &'a dyn ValidationAreaIo,
        events: &'a dyn EventLog,
        clients: &'a Mutex<Vec<ClientKeyInfo>>,
        config: PvdConfig,
    ) -> Self {
        Self {
            nonpaged,
            io,
            events,
            clients,
            config,
        }
    }

    fn check_client(&self, client: usize) -> Result<()> {
        if client >= self.config.client_slots {
            return Err(PvdError::OutOfRange {
                what: "client index".to_owned(),
                value: client.to_string(),
            });
        }
        Ok(())
    }

    fn client_info(&self, client: usize) -> Result<ClientKeyInfo> {
        self.check_client(client)?;
        Ok(self.clients.lock()[client])
    }

    fn update_client(&self, client: usize, apply: impl FnOnce(&mut ClientKeyInfo)) {
        apply(&mut self.clients.lock()[client]);
    }

    /// Whether the client's validation area must be (re)initialized: true
    /// unless the bit for the currently applicable key is already set. A
    /// client mid-rekey with a valid second key but no slot-1 bit still
    /// needs reinitialization.
    pub fn needs_init(&self, client: usize) -> Result<bool> {
        let info = self.client_info(client)?;
        let Some((_, slot)) = info.write_key() else {
            return Ok(false);
        };
        let bitmap = self.nonpaged.validate_area_bitmap()?;
        Ok(bitmap & bitmap_bit(client, slot) == 0)
    }

    /// Initialize the client's validation area: under the NP lock, re-check
    /// the bitmap (the peer may have raced), write the deterministic
    /// pattern with the write key, persist the bitmap bit, and only then
    /// mark the edge ready.
    pub fn init_area(&self, client: usize) -> Result<InitOutcome> {
        let info = self.client_info(client)?;
        let Some((key, slot)) = info.write_key() else {
            return Ok(InitOutcome::NoKeys);
        };

        let blocks = self.config.validation_area_blocks;
        let result = self.nonpaged.with_np_txn(|txn| {
            // Re-check under the lock.
            if txn.record()?.validate_area_bitmap & bitmap_bit(client, slot) != 0 {
                return Ok(InitOutcome::AlreadyValid);
            }
            let pattern = validation_pattern(client, blocks);
            self.io.write_blocks(client, key, &pattern)?;
            txn.update_validate_bitmap(|bitmap| bitmap | bitmap_bit(client, slot))?;
            Ok(InitOutcome::Initialized { key_slot: slot })
        });

        match result {
            Ok(InitOutcome::Initialized { key_slot }) => {
                // Readiness strictly after the durable bitmap update.
                self.update_client(client, |info| info.path_state = PathState::Ready);
                self.events
                    .log(PvdEvent::ValidationAreaInitialized { client, key_slot });
                debug!(
                    target: "pvd::keys",
                    client,
                    key_slot,
                    "validation area initialized, edge ready"
                );
                Ok(InitOutcome::Initialized { key_slot })
            }
            Ok(other) => Ok(other),
            Err(err) => {
                self.note_key_failure(client, &err);
                Err(err)
            }
        }
    }

    /// Validate the client's area with the read key: checksum all
    /// configured blocks and compare against the stored trailers.
    pub fn validate(&self, client: usize) -> Result<ValidationOutcome> {
        let info = self.client_info(client)?;
        let Some((key, _)) = info.read_key() else {
            return Ok(ValidationOutcome::NoKeys);
        };

        let blocks = self.config.validation_area_blocks;
        let data = match self
            .io
            .read_blocks(client, key, blocks as usize * VALIDATION_SECTOR_BYTES)
        {
            Ok(data) => data,
            Err(err) => {
                self.note_key_failure(client, &err);
                return Err(err);
            }
        };

        let mismatched = count_mismatched_sectors(&data);
        if mismatched >= self.config.validation_mismatch_threshold {
            self.update_client(client, |info| {
                info.state = ClientEncryptionState::LockedKeysIncorrect;
            });
            self.events.log(PvdEvent::KeysIncorrect {
                client,
                mismatched_sectors: mismatched,
                checked_sectors: blocks,
            });
            error!(
                target: "pvd::keys",
                client,
                mismatched,
                checked = blocks,
                "key validation failed: locked keys incorrect"
            );
            return Ok(ValidationOutcome::KeysIncorrect { mismatched });
        }

        self.update_client(client, |info| {
            info.state = ClientEncryptionState::Normal;
            info.path_state = PathState::Ready;
        });
        Ok(ValidationOutcome::Valid)
    }

    /// Reconciliation pass run once encryption/rekey mode changes: for each
    /// client whose slot-1 bit is set, flip the bitmap to the slot-0
    /// representation and collapse the key pair. Clients with no bit set
    /// have not been initialized and are left untouched.
    pub fn update_all(&self) -> Result<()> {
        let slots = self.config.client_slots;
        self.nonpaged.with_np_txn(|txn| {
            txn.update_validate_bitmap(|mut bitmap| {
                for client in 0..slots {
                    let second = bitmap_bit(client, 1);
                    if bitmap & second != 0 {
                        bitmap &= !second;
                        bitmap |= bitmap_bit(client, 0);
                    }
                }
                bitmap
            })?;
            Ok(())
        })?;
        let mut clients = self.clients.lock();
        for info in clients.iter_mut() {
            if let Some(key) = info.key1.take() {
                info.key0 = Some(key);
            }
        }
        Ok(())
    }

    /// Register the client's key pair (second key only while rekeying).
    pub fn register_keys(
        &self,
        client: usize,
        key0: Option<KeyHandle>,
        key1: Option<KeyHandle>,
    ) -> Result<()> {
        self.check_client(client)?;
        self.update_client(client, |info| {
            info.key0 = key0;
            info.key1 = key1;
            info.state = ClientEncryptionState::Normal;
        });
        Ok(())
    }

    /// Drop the client's keys; the edge goes not-ready until the next key
    /// push and validation.
    pub fn unregister_keys(&self, client: usize) -> Result<()> {
        self.check_client(client)?;
        self.update_client(client, |info| {
            info.key0 = None;
            info.key1 = None;
            info.path_state = PathState::NotReady;
        });
        Ok(())
    }

    /// Current edge path state.
    pub fn path_state(&self, client: usize) -> Result<PathState> {
        Ok(self.client_info(client)?.path_state)
    }

    /// Current encryption health.
    pub fn client_state(&self, client: usize) -> Result<ClientEncryptionState> {
        Ok(self.client_info(client)?.state)
    }

    /// Map a key-lifecycle failure onto the client's locked state. Wrap
    /// errors additionally unregister the keys so a fresh push is required
    /// before any retry can succeed.
    fn note_key_failure(&self, client: usize, err: &PvdError) {
        let PvdError::IoFailed { status, .. } = err else {
            return;
        };
        if !status.is_key_error() {
            return;
        }
        match status {
            MetadataStatus::BadKeyHandle => {
                // A handle the service does not know is a software defect.
                error!(
                    target: "pvd::keys",
                    client,
                    "bad key handle presented to metadata service"
                );
            }
            MetadataStatus::KeyWrapError => {
                warn!(
                    target: "pvd::keys",
                    client,
                    "key wrap error; unregistering keys pending a new push"
                );
                let _ = self.unregister_keys(client);
            }
            MetadataStatus::EncryptionNotEnabled => {
                warn!(target: "pvd::keys", client, "encryption not enabled for client");
            }
            MetadataStatus::Ok | MetadataStatus::IoUncorrectable => unreachable!(),
        }
        self.update_client(client, |info| {
            info.state = ClientEncryptionState::LockedKeyError;
        });
        self.events.log(PvdEvent::KeyError {
            client,
            status: *status,
        });
    }
}

/// In-memory validation region for tests: remembers the key each client's
/// area was written with; reads with a different key return garbled bytes,
/// modeling a wrong-key decrypt.
#[derive(Debug, Default)]
pub struct MemoryValidationArea {
    areas: Mutex<Vec<Option<(KeyHandle, Vec<u8>)>>>,
    fail_write: Mutex<Option<MetadataStatus>>,
    fail_read: Mutex<Option<MetadataStatus>>,
    corrupt_sectors: Mutex<u32>,
}

impl MemoryValidationArea {
    #[must_use]
    pub fn new(clients: usize) -> Self {
        Self {
            areas: Mutex::new(vec![None; clients]),
            fail_write: Mutex::new(None),
            fail_read: Mutex::new(None),
            corrupt_sectors: Mutex::new(0),
        }
    }

    /// Fail the next write with `status`.
    pub fn fail_next_write(&self, status: MetadataStatus) {
        *self.fail_write.lock() = Some(status);
    }

    /// Fail the next read with `status`.
    pub fn fail_next_read(&self, status: MetadataStatus) {
        *self.fail_read.lock() = Some(status);
    }

    /// Corrupt the trailing checksum of the first `sectors` sectors on the
    /// next read.
    pub fn corrupt_sectors(&self, sectors: u32) {
        *self.corrupt_sectors.lock() = sectors;
    }
}

impl ValidationAreaIo for MemoryValidationArea {
    fn write_blocks(&self, client: usize, key: KeyHandle, data: &[u8]) -> Result<()> {
        if let Some(status) = self.fail_write.lock().take() {
            return Err(PvdError::retryable(status));
        }
        self.areas.lock()[client] = Some((key, data.to_vec()));
        Ok(())
    }

    fn read_blocks(&self, client: usize, key: KeyHandle, len: usize) -> Result<Vec<u8>> {
        if let Some(status) = self.fail_read.lock().take() {
            return Err(PvdError::retryable(status));
        }
        let areas = self.areas.lock();
        let Some((written_key, data)) = areas[client].as_ref() else {
            return Ok(vec![0_u8; len]);
        };
        let mut out = data.clone();
        out.resize(len, 0);
        if *written_key != key {
            // Wrong key: the decrypt produces garbage.
            for byte in &mut out {
                *byte ^= 0x5A;
            }
        }
        drop(areas);
        let corrupt = std::mem::take(&mut *self.corrupt_sectors.lock());
        for sector in 0..corrupt as usize {
            let at = sector * VALIDATION_SECTOR_BYTES + VALIDATION_PAYLOAD_BYTES;
            if at + 4 <= out.len() {
                out[at] ^= 0xFF;
            }
        }
        Ok(out)
    }
}
