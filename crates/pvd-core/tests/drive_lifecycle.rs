//! Whole-drive lifecycle: specialization, background zeroing to completion
//! under the peer-sync throttle, the validation-area readiness gate across
//! a simulated crash, and full reinitialization.

use std::sync::Arc;
use std::time::Duration;

use pvd_core::{
    BackgroundZeroProgress, ConfigType, KeyHandle, MemoryValidationArea, MemoryZeroTarget,
    PathState, ProvisionDrive, PvdEvent, RecordingEventLog, ValidationOutcome,
};
use pvd_error::MetadataStatus;
use pvd_metasvc::{FaultOp, MemoryMetadataService};
use pvd_nonpaged::{RecordingPeer, SimClock};
use pvd_types::chunk::ChunkGeometry;
use pvd_types::nonpaged::{CheckpointField, DriveLocation};
use pvd_types::paged::{PagedEntry, PAGED_ENTRY_SIZE};
use pvd_types::units::{BlockCount, Lba};
use pvd_types::PvdConfig;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct Fixture {
    service: Arc<MemoryMetadataService>,
    events: Arc<RecordingEventLog>,
    clock: SimClock,
    peer: RecordingPeer,
    config: PvdConfig,
    capacity: u64,
}

impl Fixture {
    fn new(capacity: u64) -> Self {
        init_tracing();
        let config = PvdConfig::default();
        let geometry = ChunkGeometry::new(config.chunk_size, Lba(capacity)).unwrap();
        Self {
            service: Arc::new(MemoryMetadataService::new(
                geometry.total_chunks() * PAGED_ENTRY_SIZE as u64,
            )),
            events: Arc::new(RecordingEventLog::new()),
            clock: SimClock::new(),
            peer: RecordingPeer::new(),
            config,
            capacity,
        }
    }

    fn drive(&self) -> ProvisionDrive<MemoryMetadataService, &SimClock, &RecordingPeer> {
        ProvisionDrive::new(
            Arc::clone(&self.service),
            &self.clock,
            &self.peer,
            self.config,
            Lba(self.capacity),
            ConfigType::RaidGroup,
            Arc::new(MemoryValidationArea::new(self.config.client_slots)),
            Arc::clone(&self.events) as Arc<dyn pvd_core::EventLog + Send + Sync>,
        )
        .unwrap()
    }
}

#[test]
fn background_zero_sweeps_the_drive_under_the_throttle() {
    // Eight full chunks plus a short tail.
    let config = PvdConfig::default();
    let capacity = 8 * config.chunk_size + 512;
    let fixture = Fixture::new(capacity);
    let drive = fixture.drive();
    drive.specialize(DriveLocation::default(), false).unwrap();

    let target = MemoryZeroTarget::new(true);
    let mut cycles = 0;
    loop {
        match drive.background_zero_cycle(&target).unwrap() {
            BackgroundZeroProgress::Advanced { .. } => {
                cycles += 1;
                // Every third chunk crosses the throttle window.
                if cycles % 3 == 0 {
                    fixture.clock.advance(Duration::from_millis(3100));
                }
            }
            BackgroundZeroProgress::Complete => break,
        }
    }
    assert_eq!(cycles, 9);
    assert_eq!(
        drive.checkpoint(CheckpointField::Zero).unwrap(),
        Lba::INVALID
    );

    // Every block of the exported capacity was written exactly once.
    let total: u64 = target
        .writes()
        .iter()
        .map(|(_, blocks, _)| blocks.get())
        .sum();
    assert_eq!(total, capacity);

    // The throttle let only a subset of advances reach the peer.
    let replications = fixture.peer.replication_count();
    assert!(replications >= 1, "at least the first advance syncs");
    assert!(
        replications < cycles,
        "throttle must suppress per-chunk peer traffic ({replications} of {cycles})"
    );

    // Progress events are deduplicated and strictly increasing.
    let percents: Vec<u32> = fixture
        .events
        .events()
        .iter()
        .filter_map(|event| match event {
            PvdEvent::ZeroProgress { percent } => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(!percents.is_empty());
    assert!(percents.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn edge_stays_gated_until_the_bitmap_bit_is_durable() {
    let fixture = Fixture::new(1_000_000);
    let drive = fixture.drive();
    drive.specialize(DriveLocation::default(), false).unwrap();

    let validation = drive.validation();
    validation.register_keys(0, Some(KeyHandle(41)), None).unwrap();
    assert!(validation.needs_init(0).unwrap());

    // Crash window: the area write lands but the bitmap persist faults.
    fixture
        .service
        .inject_fault(FaultOp::NonPagedWrite, MetadataStatus::IoUncorrectable);
    assert!(validation.init_area(0).is_err());
    assert_eq!(validation.path_state(0).unwrap(), PathState::NotReady);

    fixture.service.crash();
    drive.load().unwrap();
    let validation = drive.validation();
    assert!(
        validation.needs_init(0).unwrap(),
        "no durable bit, the area is not trusted on recovery"
    );
    assert_eq!(validation.path_state(0).unwrap(), PathState::NotReady);

    // A clean retry initializes, persists, and only then opens the edge.
    validation.register_keys(0, Some(KeyHandle(41)), None).unwrap();
    validation.init_area(0).unwrap();
    assert_eq!(validation.path_state(0).unwrap(), PathState::Ready);
    assert_eq!(validation.validate(0).unwrap(), ValidationOutcome::Valid);
    assert_ne!(drive.validation_bitmap().unwrap() & 0b11, 0);
}

#[test]
fn reinitialize_rebuilds_paged_state_but_keeps_health() {
    let fixture = Fixture::new(1_000_000);
    let drive = fixture.drive();
    drive.specialize(DriveLocation::default(), false).unwrap();

    drive.mark_consumed(Lba(4096), BlockCount(2048)).unwrap();
    drive.set_drive_fault_state(true).unwrap();
    drive
        .set_checkpoint(CheckpointField::Zero, Lba(700_000), true)
        .unwrap();

    drive.reinitialize().unwrap();

    // The paged region is back to the default paint everywhere.
    let image = fixture.service.mirror_image(0);
    let expected = PagedEntry::DEFAULT_PAINT.to_bytes();
    assert_eq!(&image[4..6], &expected, "consumed mark repainted away");

    assert!(drive.drive_fault_state().unwrap(), "health survives reinit");
    assert_eq!(drive.checkpoint(CheckpointField::Zero).unwrap(), Lba::ZERO);
    assert_eq!(drive.validation_bitmap().unwrap(), 0);
}
