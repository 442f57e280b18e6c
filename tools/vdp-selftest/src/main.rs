use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, ensure, Context};
use clap::{Parser, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use vdp_blk::protocol::{RequestHeader, VIRTIO_BLK_S_OK, VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT};
use vdp_blk::{
    BlockBackend, Dataplane, DataplaneConfig, DataplaneStats, FileBackend, FileBackendOptions,
    StandaloneBus,
};
use vdp_ioq::{AioProvider, CompletionPolicy, LinuxAio, NativeAio, SimAio};
use vdp_mem::{GuestMemory, GuestRam};
use vdp_vring::{GuestBuf, GuestDriver, QueueLayout, RingFeatures};

const RING_BASE: u64 = 0x1000;
const BUFFERS_BASE: u64 = 0x10_0000;
const PAGE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AioKind {
    /// Linux kernel AIO (io_submit/io_getevents).
    Native,
    /// In-process simulation performing synchronous preadv/pwritev.
    Sim,
}

#[derive(Parser, Debug)]
#[command(
    name = "vdp-selftest",
    about = "Drive a virtio-blk dataplane with a simulated guest: write a pattern, read it back, verify."
)]
struct Args {
    /// Backing image; created (or grown) to fit the workload
    image: PathBuf,

    /// Number of write requests (and as many verifying reads)
    #[arg(long, default_value_t = 64)]
    requests: u32,

    /// Bytes per request (multiple of 512)
    #[arg(long, value_name = "BYTES", default_value_t = 4096)]
    request_size: u32,

    /// Offset guest data buffers by this many bytes from a page boundary
    #[arg(long, value_name = "BYTES", default_value_t = 0)]
    misalign: u64,

    /// Virtqueue size (power of two)
    #[arg(long, default_value_t = 128)]
    queue_size: u16,

    /// I/O queue capacity (defaults to the queue size)
    #[arg(long)]
    max_requests: Option<usize>,

    #[arg(long, value_enum, default_value_t = AioKind::Native)]
    aio: AioKind,

    /// Open the image with O_DIRECT
    #[arg(long, action = clap::ArgAction::SetTrue)]
    direct: bool,

    /// Buffer alignment the backend requires (defaults to 512 with --direct, else 1)
    #[arg(long, value_name = "BYTES")]
    alignment: Option<usize>,

    /// Negotiate VIRTIO_RING_F_EVENT_IDX
    #[arg(long, action = clap::ArgAction::SetTrue)]
    event_idx: bool,
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let stats = run(&args)?;
    println!(
        "verified {} requests ({} bytes)",
        args.requests,
        u64::from(args.requests) * u64::from(args.request_size)
    );
    println!(
        "stats: requests={} aio_completions={} early_completions={} io_errors={} \
         bounce_allocs={} bounce_frees={} notifications={} submissions={} exhausted={}",
        stats.requests,
        stats.aio_completions,
        stats.early_completions,
        stats.io_errors,
        stats.bounce_allocs,
        stats.bounce_frees,
        stats.notifications,
        stats.submissions,
        stats.exhausted,
    );
    Ok(())
}

fn validate(args: &Args) -> anyhow::Result<()> {
    ensure!(args.requests > 0, "--requests must be non-zero");
    ensure!(
        args.request_size > 0 && args.request_size % 512 == 0,
        "--request-size must be a non-zero multiple of 512, got {}",
        args.request_size
    );
    ensure!(
        args.queue_size.is_power_of_two() && args.queue_size >= 4,
        "--queue-size must be a power of two of at least 4, got {}",
        args.queue_size
    );
    ensure!(args.misalign < PAGE, "--misalign must be below {PAGE}");
    Ok(())
}

fn run(args: &Args) -> anyhow::Result<DataplaneStats> {
    validate(args)?;

    let disk_len = u64::from(args.requests) * u64::from(args.request_size);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&args.image)
        .with_context(|| format!("open {}", args.image.display()))?;
    if file.metadata()?.len() < disk_len {
        file.set_len(disk_len)
            .with_context(|| format!("grow {} to {disk_len} bytes", args.image.display()))?;
    }
    drop(file);

    let backend = FileBackend::open(
        &args.image,
        FileBackendOptions {
            direct: args.direct,
            alignment: args.alignment,
            serial: Some("vdp-selftest".to_string()),
            ..Default::default()
        },
    )
    .with_context(|| format!("open backend {}", args.image.display()))?;
    let backend: Arc<dyn BlockBackend> = Arc::new(backend);

    let aio: Arc<dyn AioProvider> = match args.aio {
        AioKind::Native => {
            if !LinuxAio::is_supported() {
                bail!("kernel AIO is unavailable on this host (try --aio sim)");
            }
            Arc::new(NativeAio)
        }
        AioKind::Sim => Arc::new(SimAio::new(CompletionPolicy::Immediate)),
    };

    // Every chain is header + data + status.
    let wave = usize::from(args.queue_size / 3).min(args.requests as usize);
    let stride = (u64::from(args.request_size) + args.misalign + 2 * PAGE).next_multiple_of(PAGE);
    let mem_size = BUFFERS_BASE + stride * wave as u64;
    let mem = Arc::new(GuestRam::new(mem_size).context("allocate guest memory")?);

    let layout = QueueLayout::contiguous(RING_BASE, args.queue_size);
    let mut features = RingFeatures::NOTIFY_ON_EMPTY;
    if args.event_idx {
        features |= RingFeatures::EVENT_IDX;
    }
    let mut bus = StandaloneBus::new(features.bits(), [layout.queue_state()]);
    let mut guest = Guest {
        driver: GuestDriver::new(mem.clone(), layout).context("lay out virtqueue")?,
        mem: mem.clone(),
        stride,
        misalign: args.misalign,
        request_size: args.request_size,
    };

    let config = DataplaneConfig {
        max_requests: args.max_requests,
        ..Default::default()
    };
    let mut dp = Dataplane::create(config, backend, aio, mem.clone())
        .context("create dataplane")?;
    dp.start(&mut bus).context("start dataplane")?;

    for (phase, type_) in [("write", VIRTIO_BLK_T_OUT), ("read", VIRTIO_BLK_T_IN)] {
        let mut next = 0u32;
        while next < args.requests {
            let count = (args.requests - next).min(wave as u32);
            guest.run_wave(&mut dp, &mut bus, type_, next, count)?;
            next += count;
        }
        info!(phase, requests = args.requests, "phase complete");
    }

    dp.stop(&mut bus).context("stop dataplane")?;
    let stats = dp.stats();
    dp.destroy(&mut bus).context("destroy dataplane")?;
    Ok(stats)
}

/// Byte `offset` of request `index`'s payload.
fn pattern(index: u32, offset: usize) -> u8 {
    (index as usize)
        .wrapping_mul(31)
        .wrapping_add(offset)
        .wrapping_mul(7) as u8
}

struct Guest {
    driver: GuestDriver<Arc<GuestRam>>,
    mem: Arc<GuestRam>,
    stride: u64,
    misalign: u64,
    request_size: u32,
}

struct Slot {
    header: u64,
    data: u64,
    status: u64,
}

impl Guest {
    fn slot(&self, n: usize) -> Slot {
        let base = BUFFERS_BASE + self.stride * n as u64;
        Slot {
            header: base,
            status: base + 64,
            data: base + PAGE + self.misalign,
        }
    }

    fn run_wave(
        &mut self,
        dp: &mut Dataplane<Arc<GuestRam>>,
        bus: &mut StandaloneBus,
        type_: u32,
        first: u32,
        count: u32,
    ) -> anyhow::Result<()> {
        let len = self.request_size as usize;
        let sectors_per_request = u64::from(self.request_size / 512);
        let mut heads = Vec::with_capacity(count as usize);

        for n in 0..count as usize {
            let index = first + n as u32;
            let slot = self.slot(n);
            let hdr = RequestHeader {
                type_,
                ioprio: 0,
                sector: u64::from(index) * sectors_per_request,
            };
            self.mem.write_from(slot.header, &hdr.to_bytes())?;
            self.mem.write_u8(slot.status, 0xff)?;

            let data = if type_ == VIRTIO_BLK_T_OUT {
                let payload: Vec<u8> = (0..len).map(|i| pattern(index, i)).collect();
                self.mem.write_from(slot.data, &payload)?;
                GuestBuf::readable(slot.data, self.request_size)
            } else {
                self.mem.write_from(slot.data, &vec![0u8; len])?;
                GuestBuf::writable(slot.data, self.request_size)
            };
            let head = self
                .driver
                .add_chain(&[
                    GuestBuf::readable(slot.header, 16),
                    data,
                    GuestBuf::writable(slot.status, 1),
                ])?
                .context("virtqueue has no free descriptors")?;
            heads.push(head);
        }
        self.driver.publish()?;
        bus.kick(0)?;

        let mut done = 0;
        while done < heads.len() {
            dp.run_once(true)?;
            ensure!(!dp.is_broken(), "virtqueue broke during the {type_} wave");
            done += self.driver.drain_used()?.len();
        }
        debug!(type_, first, count, "wave complete");

        for n in 0..count as usize {
            let index = first + n as u32;
            let slot = self.slot(n);
            let status = self.mem.read_u8(slot.status)?;
            ensure!(
                status == VIRTIO_BLK_S_OK,
                "request {index} (type {type_}) completed with status {status}"
            );
            if type_ == VIRTIO_BLK_T_IN {
                let mut got = vec![0u8; len];
                self.mem.read_into(slot.data, &mut got)?;
                if let Some(at) = (0..len).find(|&i| got[i] != pattern(index, i)) {
                    bail!(
                        "request {index}: byte {at} read back as {:#04x}, expected {:#04x}",
                        got[at],
                        pattern(index, at)
                    );
                }
            }
        }
        Ok(())
    }
}
