use std::io::Write;
use std::os::fd::RawFd;
use std::sync::Arc;

use vdp_blk::protocol::{
    RequestHeader, VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_OK, VIRTIO_BLK_S_UNSUPP, VIRTIO_BLK_T_FLUSH,
    VIRTIO_BLK_T_GET_ID, VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT, VIRTIO_BLK_T_SCSI_CMD,
};
use vdp_blk::{
    BackendError, BlockBackend, BlockOp, BusError, Dataplane, DataplaneConfig, DataplaneError,
    DataplaneState, FileBackend, FileBackendOptions, OpBlocker, StandaloneBus, VirtioBus,
};
use vdp_ioq::{CompletionPolicy, IoOpcode, IoQueueError, SimAio};
use vdp_mem::{GuestMemory, GuestRam};
use vdp_vring::{GuestBuf, GuestDriver, QueueLayout, UsedElem};

const RING: u64 = 0x1000;
const SCRATCH: u64 = 0x10_000;
const MEM_SIZE: u64 = 0x100_000;
const IMAGE_LEN: usize = 64 * 1024;

type Mem = Arc<GuestRam>;

struct Harness {
    mem: Mem,
    guest: GuestDriver<Mem>,
    bus: StandaloneBus,
    sim: SimAio,
    backend: Arc<FileBackend>,
    dp: Dataplane<Mem>,
    next: u64,
    image: tempfile::NamedTempFile,
}

#[derive(Debug, Clone, Copy)]
struct Req {
    head: u16,
    status: u64,
}

fn pattern(offset: usize) -> u8 {
    (offset % 251) as u8
}

fn image() -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0..IMAGE_LEN).map(pattern).collect();
    f.write_all(&data).unwrap();
    f
}

impl Harness {
    fn new(config: DataplaneConfig) -> Self {
        Self::with_options(config, FileBackendOptions::default())
    }

    fn with_options(config: DataplaneConfig, options: FileBackendOptions) -> Self {
        let image = image();
        let backend = Arc::new(FileBackend::open(image.path(), options).unwrap());
        let mem: Mem = Arc::new(GuestRam::new(MEM_SIZE).unwrap());
        let layout = QueueLayout::contiguous(RING, 16);
        let guest = GuestDriver::new(mem.clone(), layout).unwrap();
        let bus = StandaloneBus::new(0, [layout.queue_state()]);
        let sim = SimAio::new(CompletionPolicy::Immediate);
        let dyn_backend: Arc<dyn BlockBackend> = backend.clone();
        let dp = Dataplane::create(config, dyn_backend, Arc::new(sim.clone()), mem.clone())
            .unwrap();
        Self {
            mem,
            guest,
            bus,
            sim,
            backend,
            dp,
            next: SCRATCH,
            image,
        }
    }

    fn start(&mut self) {
        self.dp.start(&mut self.bus).unwrap();
    }

    fn alloc(&mut self, len: u64) -> u64 {
        let addr = (self.next + 511) & !511;
        self.next = addr + len;
        addr
    }

    fn queue(&mut self, type_: u32, sector: u64, data: &[GuestBuf]) -> Req {
        let hdr = self.alloc(16);
        let raw = RequestHeader {
            type_,
            ioprio: 0,
            sector,
        }
        .to_bytes();
        self.mem.write_from(hdr, &raw).unwrap();
        let status = self.alloc(1);
        self.mem.write_u8(status, 0xff).unwrap();

        let mut chain = vec![GuestBuf::readable(hdr, 16)];
        chain.extend_from_slice(data);
        chain.push(GuestBuf::writable(status, 1));
        let head = self.guest.add_chain(&chain).unwrap().unwrap();
        Req { head, status }
    }

    fn kick(&mut self) {
        self.guest.publish().unwrap();
        self.bus.kick(0).unwrap();
    }

    fn settle(&mut self) {
        while self.dp.run_once(false).unwrap() > 0 {}
    }

    fn status(&self, req: Req) -> u8 {
        self.mem.read_u8(req.status).unwrap()
    }

    fn used(&mut self) -> Vec<UsedElem> {
        self.guest.drain_used().unwrap()
    }

    fn file(&self) -> Vec<u8> {
        std::fs::read(self.image.path()).unwrap()
    }
}

#[test]
fn read_fills_guest_buffer_from_file() {
    let mut h = Harness::new(DataplaneConfig::default());
    h.start();
    let buf = h.alloc(1024);
    let req = h.queue(VIRTIO_BLK_T_IN, 2, &[GuestBuf::writable(buf, 1024)]);
    h.kick();
    h.settle();

    assert_eq!(h.status(req), VIRTIO_BLK_S_OK);
    assert_eq!(
        h.used(),
        vec![UsedElem {
            id: u32::from(req.head),
            len: 1025
        }]
    );
    let mut got = vec![0u8; 1024];
    h.mem.read_into(buf, &mut got).unwrap();
    let want: Vec<u8> = (1024..2048).map(pattern).collect();
    assert_eq!(got, want);

    let stats = h.dp.stats();
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.aio_completions, 1);
    assert_eq!(stats.early_completions, 0);
    assert!(h.bus.take_interrupts(0) >= 1);
}

#[test]
fn write_gathers_segments_into_file() {
    let mut h = Harness::new(DataplaneConfig::default());
    h.start();
    let a = h.alloc(512);
    let b = h.alloc(512);
    h.mem.write_from(a, &[0xaa; 512]).unwrap();
    h.mem.write_from(b, &[0xbb; 512]).unwrap();
    let req = h.queue(
        VIRTIO_BLK_T_OUT,
        4,
        &[GuestBuf::readable(a, 512), GuestBuf::readable(b, 512)],
    );
    h.kick();
    h.settle();

    assert_eq!(h.status(req), VIRTIO_BLK_S_OK);
    let file = h.file();
    assert!(file[2048..2560].iter().all(|&x| x == 0xaa));
    assert!(file[2560..3072].iter().all(|&x| x == 0xbb));
    assert_eq!(file[3072], pattern(3072));

    let ops = h.sim.submitted();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].opcode, IoOpcode::Writev);
    assert_eq!(ops[0].offset, 2048);
    assert_eq!(ops[0].iov.len(), 2);
}

#[test]
fn early_completions_do_not_touch_the_io_queue() {
    let mut h = Harness::new(DataplaneConfig::default().serial("vdp-serial"));
    h.start();
    let id = h.alloc(32);
    let get_id = h.queue(VIRTIO_BLK_T_GET_ID, 0, &[GuestBuf::writable(id, 32)]);
    let flush = h.queue(VIRTIO_BLK_T_FLUSH, 0, &[]);
    let scsi = h.queue(VIRTIO_BLK_T_SCSI_CMD, 0, &[]);
    h.kick();
    h.settle();

    assert_eq!(h.status(get_id), VIRTIO_BLK_S_OK);
    assert_eq!(h.status(flush), VIRTIO_BLK_S_OK);
    assert_eq!(h.status(scsi), VIRTIO_BLK_S_UNSUPP);

    let mut got = [0u8; 20];
    h.mem.read_into(id, &mut got).unwrap();
    assert_eq!(&got[..11], b"vdp-serial\0");

    let used = h.used();
    assert_eq!(used.len(), 3);
    assert_eq!(used[0].len, 21);
    assert_eq!(used[1].len, 1);
    assert_eq!(used[2].len, 1);

    assert!(h.sim.submitted().is_empty());
    let stats = h.dp.stats();
    assert_eq!(stats.early_completions, 3);
    assert_eq!(stats.unsupported, 1);
}

#[test]
fn get_id_is_truncated_to_the_guest_buffer() {
    let mut h = Harness::new(DataplaneConfig::default().serial("0123456789abcdefghijXYZ"));
    h.start();
    let id = h.alloc(8);
    let req = h.queue(VIRTIO_BLK_T_GET_ID, 0, &[GuestBuf::writable(id, 8)]);
    h.kick();
    h.settle();

    assert_eq!(h.status(req), VIRTIO_BLK_S_OK);
    assert_eq!(h.used()[0].len, 9);
    let mut got = [0u8; 8];
    h.mem.read_into(id, &mut got).unwrap();
    assert_eq!(&got, b"01234567");
}

#[test]
fn out_of_range_and_empty_requests_complete_early() {
    let mut h = Harness::new(DataplaneConfig::default());
    h.start();
    let buf = h.alloc(1024);
    let past_end = h.queue(
        VIRTIO_BLK_T_IN,
        (IMAGE_LEN / 512 - 1) as u64,
        &[GuestBuf::writable(buf, 1024)],
    );
    let overflow = h.queue(VIRTIO_BLK_T_IN, u64::MAX / 2, &[GuestBuf::writable(buf, 512)]);
    let empty = h.queue(VIRTIO_BLK_T_OUT, 0, &[]);
    h.kick();
    h.settle();

    assert_eq!(h.status(past_end), VIRTIO_BLK_S_IOERR);
    assert_eq!(h.status(overflow), VIRTIO_BLK_S_IOERR);
    assert_eq!(h.status(empty), VIRTIO_BLK_S_OK);
    assert!(h.sim.submitted().is_empty());
    assert_eq!(h.dp.stats().io_errors, 2);
    assert!(!h.dp.is_broken());
}

#[test]
fn writes_to_a_read_only_backend_fail() {
    let mut h = Harness::with_options(
        DataplaneConfig::default(),
        FileBackendOptions {
            read_only: true,
            ..Default::default()
        },
    );
    h.start();
    let buf = h.alloc(512);
    let req = h.queue(VIRTIO_BLK_T_OUT, 0, &[GuestBuf::readable(buf, 512)]);
    h.kick();
    h.settle();
    assert_eq!(h.status(req), VIRTIO_BLK_S_IOERR);
    assert_eq!(h.file()[0], pattern(0));
}

#[test]
fn backend_errors_become_ioerr_status() {
    let mut h = Harness::new(DataplaneConfig::default());
    h.start();
    h.sim.inject_io_error(libc::EIO);
    let buf = h.alloc(512);
    let failed = h.queue(VIRTIO_BLK_T_IN, 0, &[GuestBuf::writable(buf, 512)]);
    let fine = h.queue(VIRTIO_BLK_T_IN, 1, &[GuestBuf::writable(buf, 512)]);
    h.kick();
    h.settle();

    assert_eq!(h.status(failed), VIRTIO_BLK_S_IOERR);
    assert_eq!(h.status(fine), VIRTIO_BLK_S_OK);
    let used = h.used();
    assert_eq!(used.len(), 2);
    let failed_elem = used.iter().find(|u| u.id == u32::from(failed.head)).unwrap();
    assert_eq!(failed_elem.len, 1);
    assert_eq!(h.dp.stats().io_errors, 1);
}

#[test]
fn refused_submissions_complete_with_ioerr() {
    let mut h = Harness::new(DataplaneConfig::default());
    h.start();
    h.sim.limit_submission(Some(1));
    let a = h.alloc(512);
    let b = h.alloc(512);
    let first = h.queue(VIRTIO_BLK_T_IN, 0, &[GuestBuf::writable(a, 512)]);
    let second = h.queue(VIRTIO_BLK_T_IN, 1, &[GuestBuf::writable(b, 512)]);
    h.kick();
    h.settle();

    assert_eq!(h.status(first), VIRTIO_BLK_S_OK);
    assert_eq!(h.status(second), VIRTIO_BLK_S_IOERR);
    assert_eq!(h.used().len(), 2);
    assert_eq!(h.dp.in_flight(), 0);
}

#[test]
fn missing_status_byte_breaks_the_ring() {
    let mut h = Harness::new(DataplaneConfig::default());
    h.start();
    let hdr = h.alloc(16);
    let raw = RequestHeader {
        type_: VIRTIO_BLK_T_IN,
        ioprio: 0,
        sector: 0,
    }
    .to_bytes();
    h.mem.write_from(hdr, &raw).unwrap();
    h.guest
        .add_chain(&[GuestBuf::readable(hdr, 16)])
        .unwrap()
        .unwrap();
    h.kick();
    h.settle();

    assert!(h.dp.is_broken());
    assert!(h.used().is_empty());

    // Later chains are ignored.
    let buf = h.alloc(512);
    h.queue(VIRTIO_BLK_T_IN, 0, &[GuestBuf::writable(buf, 512)]);
    h.kick();
    h.settle();
    assert!(h.used().is_empty());
}

#[test]
fn short_header_breaks_the_ring() {
    let mut h = Harness::new(DataplaneConfig::default());
    h.start();
    let hdr = h.alloc(8);
    let status = h.alloc(1);
    h.guest
        .add_chain(&[GuestBuf::readable(hdr, 8), GuestBuf::writable(status, 1)])
        .unwrap()
        .unwrap();
    h.kick();
    h.settle();
    assert!(h.dp.is_broken());
}

#[test]
fn work_queued_before_start_is_processed() {
    let mut h = Harness::new(DataplaneConfig::default());
    let buf = h.alloc(512);
    let req = h.queue(VIRTIO_BLK_T_IN, 0, &[GuestBuf::writable(buf, 512)]);
    h.guest.publish().unwrap();
    h.bus.kick(0).unwrap();
    assert_eq!(h.bus.kicks_to_transport(0), 1);

    h.start();
    h.settle();
    assert_eq!(h.status(req), VIRTIO_BLK_S_OK);
}

#[test]
fn stop_hands_ring_progress_back_to_the_bus() {
    let mut h = Harness::new(DataplaneConfig::default());
    h.start();
    let buf = h.alloc(512);
    for sector in 0..3 {
        h.queue(VIRTIO_BLK_T_IN, sector, &[GuestBuf::writable(buf, 512)]);
    }
    h.kick();
    h.settle();
    assert_eq!(h.used().len(), 3);

    h.dp.stop(&mut h.bus).unwrap();
    assert_eq!(h.dp.state(), DataplaneState::Stopped);
    assert!(!h.bus.host_notifier_enabled(0));
    assert!(!h.bus.guest_notifier_enabled(0));
    let qstate = h.bus.queue_state(0).unwrap();
    assert_eq!(qstate.last_avail_idx, 3);
    assert_eq!(qstate.last_used_idx, 3);
    assert!(!qstate.signalled_used_valid);

    // Stopping twice is harmless, and a restart resumes where the first run left off.
    h.dp.stop(&mut h.bus).unwrap();
    let req = h.queue(VIRTIO_BLK_T_IN, 5, &[GuestBuf::writable(buf, 512)]);
    h.kick();
    h.start();
    h.settle();
    assert_eq!(h.status(req), VIRTIO_BLK_S_OK);
    let used = h.used();
    assert_eq!(used.len(), 1);
    assert_eq!(used[0].id, u32::from(req.head));
    assert_eq!(h.dp.stats().requests, 4);
}

#[test]
fn start_is_idempotent() {
    let mut h = Harness::new(DataplaneConfig::default());
    h.start();
    h.start();
    assert_eq!(h.sim.contexts_opened(), 1);
    assert_eq!(h.dp.state(), DataplaneState::Started);
}

#[test]
fn failed_start_releases_everything() {
    let mut h = Harness::new(DataplaneConfig::default());
    h.bus.deny_host_notifier(true);
    let err = h.dp.start(&mut h.bus).unwrap_err();
    assert!(matches!(
        err,
        DataplaneError::HostNotifier(BusError::Unavailable { kind: "host", .. })
    ));
    assert_eq!(h.dp.state(), DataplaneState::Stopped);
    assert!(!h.bus.guest_notifier_enabled(0));

    h.bus.deny_host_notifier(false);
    h.sim.fail_next_open(libc::EAGAIN);
    let err = h.dp.start(&mut h.bus).unwrap_err();
    assert!(matches!(err, DataplaneError::IoQueue(IoQueueError::Context(_))));
    assert!(!h.bus.host_notifier_enabled(0));
    assert!(!h.bus.guest_notifier_enabled(0));

    h.start();
    assert_eq!(h.dp.state(), DataplaneState::Started);
}

#[test]
fn guest_notifier_failure_is_reported() {
    let mut h = Harness::new(DataplaneConfig::default());
    h.bus.deny_guest_notifier(true);
    assert!(matches!(
        h.dp.start(&mut h.bus),
        Err(DataplaneError::GuestNotifier(_))
    ));
    assert!(!h.bus.host_notifier_enabled(0));
}

#[test]
fn unknown_queue_is_refused() {
    let mut h = Harness::new(DataplaneConfig::default().queue_index(3));
    assert!(matches!(
        h.dp.start(&mut h.bus),
        Err(DataplaneError::NoSuchQueue(3))
    ));
}

#[test]
fn dataplane_blocks_conflicting_backend_operations() {
    let h = Harness::new(DataplaneConfig::default());
    assert!(h.backend.in_use());
    assert!(matches!(
        h.backend.check_op(BlockOp::Snapshot),
        Err(BackendError::Blocked { .. })
    ));
    assert!(h.backend.resize(128 * 1024).is_err());

    let Harness {
        dp,
        mut bus,
        backend,
        ..
    } = h;
    dp.destroy(&mut bus).unwrap();
    assert!(!backend.in_use());
    backend.resize(128 * 1024).unwrap();
}

#[test]
fn create_refuses_busy_or_incompatible_backends() {
    let img = image();
    let backend = Arc::new(FileBackend::open(img.path(), FileBackendOptions::default()).unwrap());
    let mem: Mem = Arc::new(GuestRam::new(MEM_SIZE).unwrap());
    let sim = Arc::new(SimAio::default());
    assert!(matches!(
        create(DataplaneConfig::default().scsi(true), backend.clone(), &sim, &mem),
        Err(DataplaneError::Incompatible(_))
    ));
    assert!(matches!(
        create(DataplaneConfig::default().config_wce(true), backend.clone(), &sim, &mem),
        Err(DataplaneError::Incompatible(_))
    ));
    assert!(!backend.in_use());

    let first = create(DataplaneConfig::default(), backend.clone(), &sim, &mem).unwrap();
    assert!(matches!(
        create(DataplaneConfig::default(), backend.clone(), &sim, &mem),
        Err(DataplaneError::InUse(_))
    ));
    drop(first);
    assert!(!backend.in_use());

    assert!(matches!(
        create(DataplaneConfig::default(), Arc::new(NoAio), &sim, &mem),
        Err(DataplaneError::UnsupportedBackend)
    ));
}

fn create(
    config: DataplaneConfig,
    backend: Arc<dyn BlockBackend>,
    sim: &Arc<SimAio>,
    mem: &Mem,
) -> Result<Dataplane<Mem>, DataplaneError> {
    Dataplane::create(config, backend, sim.clone(), mem.clone())
}

/// A backend that can only be reached through the device model.
struct NoAio;

impl BlockBackend for NoAio {
    fn aio_fd(&self) -> Option<RawFd> {
        None
    }
    fn capacity_bytes(&self) -> u64 {
        0
    }
    fn buffer_alignment(&self) -> usize {
        1
    }
    fn read_only(&self) -> bool {
        false
    }
    fn serial(&self) -> Option<&str> {
        None
    }
    fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }
    fn in_use(&self) -> bool {
        false
    }
    fn block_operations(&self, _reason: &str) -> Result<OpBlocker, BackendError> {
        unreachable!("never claimed")
    }
    fn unblock_operations(&self, _blocker: OpBlocker) {}
}
