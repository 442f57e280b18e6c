use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use tracing::{debug, error, trace, warn};
use vdp_ioq::{AioProvider, IoQueue};
use vdp_mem::GuestMemory;
use vdp_vring::{Pop, Vring};
use vmm_sys_util::eventfd::EventFd;

use crate::backend::{BlockBackend, OpBlocker};
use crate::bus::{BusError, VirtioBus};
use crate::config::DataplaneConfig;
use crate::error::DataplaneError;
use crate::event_loop::{EventLoop, Token};
use crate::protocol::{device_id, VIRTIO_BLK_ID_BYTES};
use crate::request::{complete_request, BlockRequest, Dispatch, Dispatcher, Outcome};

pub type Result<T> = std::result::Result<T, DataplaneError>;

/// Guest doorbell (host notifier) readiness.
pub const DOORBELL: Token = Token(0);
/// I/O queue completion readiness.
pub const COMPLETION: Token = Token(1);

const BLOCKER_REASON: &str = "virtio-blk dataplane";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataplaneState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Counters kept over the lifetime of a dataplane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataplaneStats {
    /// Chains decoded as requests.
    pub requests: u64,
    /// Requests answered without going through the I/O queue.
    pub early_completions: u64,
    pub aio_completions: u64,
    pub io_errors: u64,
    pub unsupported: u64,
    pub bounce_allocs: u64,
    pub bounce_frees: u64,
    /// Interrupts raised through the guest notifier.
    pub notifications: u64,
    /// Non-empty batches handed to the kernel.
    pub submissions: u64,
    /// Doorbell passes cut short for lack of request slots.
    pub exhausted: u64,
}

struct Running<M> {
    vring: Vring<M>,
    ioq: IoQueue<BlockRequest>,
    host_notifier: EventFd,
    guest_notifier: EventFd,
    doorbell_registered: bool,
}

impl<M: GuestMemory> Running<M> {
    fn notify_guest(&mut self, stats: &mut DataplaneStats) {
        if !self.vring.should_notify() {
            return;
        }
        match self.guest_notifier.write(1) {
            Ok(()) => stats.notifications += 1,
            Err(err) => warn!(error = %err, "failed to signal guest notifier"),
        }
    }
}

/// Serves one virtio-blk virtqueue from a dedicated event loop, bypassing the device model's
/// own request path.
///
/// Lifecycle is `create -> start -> stop -> destroy`; `start` and `stop` may be repeated and are
/// no-ops when the dataplane is already in (or moving to) the requested state. While started, the
/// dataplane owns the virtqueue: ring indices are taken from the bus on `start` and handed back
/// on `stop`.
///
/// The caller drives the loop with [`Dataplane::run_once`], typically from a thread of its own.
pub struct Dataplane<M: GuestMemory + Clone> {
    config: DataplaneConfig,
    backend: Arc<dyn BlockBackend>,
    aio: Arc<dyn AioProvider>,
    mem: M,
    fd: RawFd,
    device_id: [u8; VIRTIO_BLK_ID_BYTES],
    event_loop: EventLoop,
    ready: Vec<Token>,
    blocker: Option<OpBlocker>,
    state: DataplaneState,
    running: Option<Running<M>>,
    stats: DataplaneStats,
}

impl<M: GuestMemory + Clone> Dataplane<M> {
    /// Checks that `backend` can be served by a dataplane and claims it.
    ///
    /// Nothing is started; the virtqueue stays with the bus until [`Dataplane::start`].
    pub fn create(
        config: DataplaneConfig,
        backend: Arc<dyn BlockBackend>,
        aio: Arc<dyn AioProvider>,
        mem: M,
    ) -> Result<Self> {
        config.validate()?;
        let fd = backend.aio_fd().ok_or(DataplaneError::UnsupportedBackend)?;
        let event_loop = EventLoop::new().map_err(DataplaneError::EventLoop)?;
        let blocker = backend.block_operations(BLOCKER_REASON)?;

        let serial = config
            .serial
            .as_deref()
            .or_else(|| backend.serial())
            .unwrap_or_default();
        let device_id = device_id(serial);
        debug!(queue = config.queue_index, fd, "created dataplane");

        Ok(Self {
            config,
            backend,
            aio,
            mem,
            fd,
            device_id,
            event_loop,
            ready: Vec::new(),
            blocker: Some(blocker),
            state: DataplaneState::Stopped,
            running: None,
            stats: DataplaneStats::default(),
        })
    }

    pub fn config(&self) -> &DataplaneConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn BlockBackend> {
        &self.backend
    }

    pub fn state(&self) -> DataplaneState {
        self.state
    }

    pub fn stats(&self) -> DataplaneStats {
        self.stats
    }

    /// Requests handed to the I/O queue and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.running.as_ref().map_or(0, |r| r.ioq.in_flight())
    }

    /// True if the virtqueue hit a protocol violation; it stays dead until the next `start`.
    pub fn is_broken(&self) -> bool {
        self.running.as_ref().is_some_and(|r| r.vring.is_broken())
    }

    /// Takes over the virtqueue and begins serving it.
    ///
    /// On error everything acquired so far is released and the dataplane stays stopped.
    pub fn start(&mut self, bus: &mut dyn VirtioBus) -> Result<()> {
        if self.state != DataplaneState::Stopped {
            return Ok(());
        }
        self.state = DataplaneState::Starting;

        match self.try_start(bus) {
            Ok(running) => {
                debug!(
                    queue = self.config.queue_index,
                    size = running.vring.size(),
                    capacity = running.ioq.capacity(),
                    "dataplane started"
                );
                self.running = Some(running);
                self.state = DataplaneState::Started;
                // The guest may have queued work before we were listening.
                self.handle_notify();
                Ok(())
            }
            Err(err) => {
                self.state = DataplaneState::Stopped;
                Err(err)
            }
        }
    }

    fn try_start(&mut self, bus: &mut dyn VirtioBus) -> Result<Running<M>> {
        let queue = self.config.queue_index;
        let qstate = bus
            .queue_state(queue)
            .ok_or(DataplaneError::NoSuchQueue(queue))?;
        let vring = Vring::set_up(
            self.mem.clone(),
            &qstate,
            bus.negotiated_features(),
            self.config.max_segments,
        )?;

        let guest_notifier = match bus.set_guest_notifier(queue, true) {
            Ok(Some(fd)) => fd,
            Ok(None) => {
                let _ = bus.set_guest_notifier(queue, false);
                return Err(DataplaneError::GuestNotifier(BusError::Unavailable {
                    kind: "guest",
                    queue,
                }));
            }
            Err(err) => return Err(DataplaneError::GuestNotifier(err)),
        };
        let host_notifier = match bus.set_host_notifier(queue, true) {
            Ok(Some(fd)) => fd,
            Ok(None) => {
                release_notifiers(bus, queue);
                return Err(DataplaneError::HostNotifier(BusError::Unavailable {
                    kind: "host",
                    queue,
                }));
            }
            Err(err) => {
                release_notifiers(bus, queue);
                return Err(DataplaneError::HostNotifier(err));
            }
        };

        let capacity = self
            .config
            .max_requests
            .unwrap_or_else(|| usize::from(vring.size()));
        let ioq = match IoQueue::initialize(self.fd, capacity, &*self.aio) {
            Ok(ioq) => ioq,
            Err(err) => {
                release_notifiers(bus, queue);
                return Err(err.into());
            }
        };

        let registered = self
            .event_loop
            .register(host_notifier.as_raw_fd(), DOORBELL)
            .and_then(|()| {
                self.event_loop
                    .register(ioq.notifier().as_raw_fd(), COMPLETION)
                    .inspect_err(|_| {
                        let _ = self.event_loop.unregister(host_notifier.as_raw_fd());
                    })
            });
        if let Err(err) = registered {
            release_notifiers(bus, queue);
            return Err(DataplaneError::EventLoop(err));
        }

        Ok(Running {
            vring,
            ioq,
            host_notifier,
            guest_notifier,
            doorbell_registered: true,
        })
    }

    /// Stops accepting guest kicks, waits for every in-flight request to complete, and hands
    /// the virtqueue back to the bus.
    ///
    /// There is no cancellation: a request the backend never completes blocks this forever.
    pub fn stop(&mut self, bus: &mut dyn VirtioBus) -> Result<()> {
        if self.state != DataplaneState::Started {
            return Ok(());
        }
        self.state = DataplaneState::Stopping;
        let queue = self.config.queue_index;

        self.unregister_doorbell();
        self.drain();

        if let Some(running) = self.running.take() {
            let _ = self.event_loop.unregister(running.ioq.notifier().as_raw_fd());
            let mut qstate = bus.queue_state(queue).unwrap_or_default();
            running.vring.teardown(&mut qstate);
            bus.set_queue_state(queue, qstate);
        }
        release_notifiers(bus, queue);

        self.state = DataplaneState::Stopped;
        debug!(queue, "dataplane stopped");
        Ok(())
    }

    /// Stops the dataplane if needed and releases the backend.
    pub fn destroy(mut self, bus: &mut dyn VirtioBus) -> Result<()> {
        self.stop(bus)?;
        if let Some(blocker) = self.blocker.take() {
            self.backend.unblock_operations(blocker);
        }
        Ok(())
    }

    fn unregister_doorbell(&mut self) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if running.doorbell_registered {
            let _ = self.event_loop.unregister(running.host_notifier.as_raw_fd());
            running.doorbell_registered = false;
        }
    }

    fn drain(&mut self) {
        let mut ready = std::mem::take(&mut self.ready);
        while self.in_flight() > 0 {
            ready.clear();
            match self.event_loop.poll_once(true, &mut ready) {
                Ok(_) => {
                    if ready.contains(&COMPLETION) {
                        self.handle_io();
                    }
                }
                Err(err) => {
                    warn!(error = %err, "event loop wait failed while draining; polling directly");
                    self.handle_io();
                }
            }
        }
        self.ready = ready;
    }

    /// Waits for (or, with `blocking == false`, checks for) ready sources and handles them.
    ///
    /// Returns the number of sources handled.
    pub fn run_once(&mut self, blocking: bool) -> Result<usize> {
        if self.state != DataplaneState::Started {
            return Ok(0);
        }
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        let polled = self.event_loop.poll_once(blocking, &mut ready);
        let n = ready.len();
        for &token in &ready {
            match token {
                DOORBELL => {
                    if let Some(running) = self.running.as_ref() {
                        // EAGAIN only means another pass already consumed the kick.
                        let _ = running.host_notifier.read();
                    }
                    self.handle_notify();
                }
                COMPLETION => self.handle_io(),
                other => trace!(token = other.0, "ignoring unknown token"),
            }
        }
        self.ready = ready;
        polled.map_err(DataplaneError::EventLoop)?;
        Ok(n)
    }

    /// Drains the available ring into the I/O queue.
    fn handle_notify(&mut self) {
        let Self {
            mem,
            backend,
            device_id,
            running,
            stats,
            ..
        } = self;
        let Some(run) = running.as_mut() else {
            return;
        };
        if run.vring.is_broken() {
            return;
        }

        let mut pushed = false;
        'outer: loop {
            run.vring.disable_notification();
            loop {
                let elem = match run.vring.pop(run.ioq.free_count()) {
                    Ok(Pop::Element(elem)) => elem,
                    Ok(Pop::Empty) => break,
                    Ok(Pop::Exhausted) => {
                        // Completions free slots and re-run this pass; leave kicks disabled.
                        stats.exhausted += 1;
                        trace!("out of request slots");
                        break 'outer;
                    }
                    Err(_) => break 'outer,
                };
                let head = elem.head;
                let mut dispatcher = Dispatcher {
                    mem: &*mem,
                    backend: &**backend,
                    ioq: &mut run.ioq,
                    stats: &mut *stats,
                    device_id: &*device_id,
                };
                match dispatcher.process(elem) {
                    Ok(Dispatch::Queued) => {}
                    Ok(Dispatch::Early(req, outcome)) => {
                        stats.early_completions += 1;
                        complete_request(&mut run.vring, stats, req, outcome);
                        pushed = true;
                    }
                    Err(err) => {
                        error!(head, error = %err, "malformed request; virtqueue broken");
                        run.vring.set_broken();
                        break 'outer;
                    }
                }
            }
            if !run.vring.enable_notification() {
                break;
            }
        }

        match run.ioq.submit_batch() {
            Ok(0) => {}
            Ok(n) => {
                stats.submissions += 1;
                trace!(n, "submitted batch");
            }
            // Refused operations complete with an error on the next completion pass.
            Err(err) => warn!(error = %err, "aio submission failed"),
        }

        if pushed {
            run.notify_guest(stats);
        }
    }

    /// Completes finished I/O and resumes ring draining if it stalled for lack of slots.
    fn handle_io(&mut self) {
        let Some(run) = self.running.as_mut() else {
            return;
        };
        let stats = &mut self.stats;
        run.ioq.clear_notifier();

        let mut completed = 0u64;
        let polled = run.ioq.poll_completions(|_, result, req| {
            complete_request(&mut run.vring, stats, req, Outcome::from_aio(result));
            completed += 1;
        });
        if let Err(err) = polled {
            warn!(error = %err, "failed to harvest aio completions");
        }
        stats.aio_completions += completed;
        if completed > 0 {
            run.notify_guest(stats);
        }

        let resume = self.state == DataplaneState::Started && run.vring.more_avail();
        if resume {
            self.handle_notify();
        }
    }
}

fn release_notifiers(bus: &mut dyn VirtioBus, queue: u16) {
    if let Err(err) = bus.set_host_notifier(queue, false) {
        warn!(queue, error = %err, "failed to restore host notifier");
    }
    if let Err(err) = bus.set_guest_notifier(queue, false) {
        warn!(queue, error = %err, "failed to restore guest notifier");
    }
}

impl<M: GuestMemory + Clone> Drop for Dataplane<M> {
    fn drop(&mut self) {
        if self.running.is_some() {
            // The kernel may still be writing into guest memory and bounce buffers.
            self.state = DataplaneState::Stopping;
            self.unregister_doorbell();
            self.drain();
        }
        if let Some(blocker) = self.blocker.take() {
            self.backend.unblock_operations(blocker);
        }
    }
}

impl<M: GuestMemory + Clone> std::fmt::Debug for Dataplane<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataplane")
            .field("queue", &self.config.queue_index)
            .field("state", &self.state)
            .field("in_flight", &self.in_flight())
            .field("stats", &self.stats)
            .finish()
    }
}
