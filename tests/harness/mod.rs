#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;

use tempfile::NamedTempFile;
use vdp_blk::protocol::RequestHeader;
use vdp_blk::{
    BlockBackend, Dataplane, DataplaneConfig, FileBackend, FileBackendOptions, StandaloneBus,
};
use vdp_ioq::{AioProvider, CompletionPolicy, NativeAio, SimAio};
use vdp_mem::{GuestMemory, GuestRam};
use vdp_vring::{GuestBuf, GuestDriver, QueueLayout, RingFeatures, UsedElem};

pub type Mem = Arc<GuestRam>;

pub const RING: u64 = 0x1000;
pub const SCRATCH: u64 = 0x2_0000;
pub const MEM_SIZE: u64 = 0x20_0000;
pub const IMAGE_LEN: usize = 256 * 1024;

/// Deterministic image contents.
pub fn pattern(offset: usize) -> u8 {
    (offset.wrapping_mul(13) % 253) as u8
}

pub struct Setup {
    pub queue_size: u16,
    pub features: RingFeatures,
    pub config: DataplaneConfig,
    pub backend: FileBackendOptions,
    pub policy: CompletionPolicy,
    /// Use kernel AIO instead of the simulation; `Rig::sim` then stays idle.
    pub native: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            queue_size: 16,
            features: RingFeatures::empty(),
            config: DataplaneConfig::default(),
            backend: FileBackendOptions::default(),
            policy: CompletionPolicy::Immediate,
            native: false,
        }
    }
}

/// One request as the simulated guest laid it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Req {
    pub head: u16,
    pub status: u64,
}

/// A guest, a transport and a started dataplane sharing one guest memory.
pub struct Rig {
    pub mem: Mem,
    pub guest: GuestDriver<Mem>,
    pub bus: StandaloneBus,
    pub sim: SimAio,
    pub backend: Arc<FileBackend>,
    pub dp: Dataplane<Mem>,
    pub image: NamedTempFile,
    next: u64,
}

impl Rig {
    pub fn new(setup: Setup) -> Self {
        let mut image = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..IMAGE_LEN).map(pattern).collect();
        image.write_all(&data).unwrap();

        let backend = Arc::new(FileBackend::open(image.path(), setup.backend).unwrap());
        let mem: Mem = Arc::new(GuestRam::new(MEM_SIZE).unwrap());
        let layout = QueueLayout::contiguous(RING, setup.queue_size);
        let guest = GuestDriver::new(mem.clone(), layout).unwrap();
        let mut bus = StandaloneBus::new(setup.features.bits(), [layout.queue_state()]);
        let sim = SimAio::new(setup.policy);

        let dyn_backend: Arc<dyn BlockBackend> = backend.clone();
        let aio: Arc<dyn AioProvider> = if setup.native {
            Arc::new(NativeAio)
        } else {
            Arc::new(sim.clone())
        };
        let mut dp = Dataplane::create(setup.config, dyn_backend, aio, mem.clone()).unwrap();
        dp.start(&mut bus).unwrap();

        Self {
            mem,
            guest,
            bus,
            sim,
            backend,
            dp,
            image,
            next: SCRATCH,
        }
    }

    /// Reserves guest memory aligned to 512 bytes.
    pub fn alloc(&mut self, len: u64) -> u64 {
        let addr = (self.next + 511) & !511;
        self.next = addr + len.max(1);
        addr
    }

    /// Lays out header and status around `data` and queues the chain without publishing it.
    pub fn queue(&mut self, type_: u32, sector: u64, data: &[GuestBuf]) -> Req {
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
        let head = self
            .guest
            .add_chain(&chain)
            .unwrap()
            .expect("ring has room for the chain");
        Req { head, status }
    }

    /// Publishes queued chains and rings the doorbell.
    pub fn kick(&mut self) {
        self.guest.publish().unwrap();
        self.bus.kick(0).unwrap();
    }

    /// Runs the event loop until nothing is ready.
    pub fn settle(&mut self) {
        while self.dp.run_once(false).unwrap() > 0 {}
    }

    pub fn status(&self, req: Req) -> u8 {
        self.mem.read_u8(req.status).unwrap()
    }

    pub fn used(&mut self) -> Vec<UsedElem> {
        self.guest.drain_used().unwrap()
    }

    pub fn read_guest(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.mem.read_into(addr, &mut buf).unwrap();
        buf
    }

    pub fn file(&self) -> Vec<u8> {
        std::fs::read(self.image.path()).unwrap()
    }

    /// Host address backing guest `paddr`.
    pub fn host_addr(&self, paddr: u64) -> usize {
        self.mem.host_address(paddr).unwrap().ptr.as_ptr() as usize
    }
}
