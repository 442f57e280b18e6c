use std::io;
use std::os::fd::RawFd;

use tracing::{trace, warn};
use vmm_sys_util::eventfd::EventFd;

use crate::aio::{AioContext, AioProvider, IoControlBlock, IoEvent, IoOpcode, IoVec};
use crate::error::{IoQueueError, Result};

/// Handle of one request slot of an [`IoQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Acquired but not yet part of a submitted batch.
    Reserved,
    Queued,
    InFlight,
}

#[derive(Debug)]
struct Slot<T> {
    state: SlotState,
    opcode: IoOpcode,
    offset: u64,
    iov: Vec<IoVec>,
    payload: Option<T>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: SlotState::Free,
            opcode: IoOpcode::Readv,
            offset: 0,
            iov: Vec::new(),
            payload: None,
        }
    }
}

/// Batched asynchronous reads and writes against one file descriptor.
///
/// The queue owns a fixed arena of request slots sized at initialization. Slots move
/// `free -> queued -> in flight -> free`; completions may arrive in any order and release their
/// slot individually. Each slot carries a caller payload of type `T` (the request record) that is
/// handed back when the operation completes.
///
/// All kernel completions signal [`IoQueue::notifier`], so an event loop can wait on that eventfd
/// and call [`IoQueue::poll_completions`] when it fires.
pub struct IoQueue<T> {
    ctx: Box<dyn AioContext>,
    fd: RawFd,
    notifier: EventFd,
    slots: Vec<Slot<T>>,
    free: Vec<SlotId>,
    batch: Vec<SlotId>,
    /// Operations the kernel refused; completed with their errno on the next poll.
    rejected: Vec<(SlotId, i64)>,
    events: Vec<IoEvent>,
}

impl<T> IoQueue<T> {
    /// Opens an AIO context for `fd` through `provider` with room for `max_requests` operations.
    pub fn initialize(fd: RawFd, max_requests: usize, provider: &dyn AioProvider) -> Result<Self> {
        if max_requests == 0 {
            return Err(IoQueueError::InvalidCapacity(max_requests));
        }
        let notifier = EventFd::new(libc::EFD_NONBLOCK).map_err(IoQueueError::Notifier)?;
        let ctx = provider
            .open(max_requests)
            .map_err(IoQueueError::Context)?;
        Ok(Self::with_context(fd, max_requests, ctx, notifier))
    }

    /// Builds a queue around an already opened context.
    pub fn with_context(
        fd: RawFd,
        max_requests: usize,
        ctx: Box<dyn AioContext>,
        notifier: EventFd,
    ) -> Self {
        Self {
            ctx,
            fd,
            notifier,
            slots: (0..max_requests).map(|_| Slot::new()).collect(),
            // Hand out low slot numbers first.
            free: (0..max_requests).rev().map(SlotId).collect(),
            batch: Vec::with_capacity(max_requests),
            rejected: Vec::new(),
            events: vec![IoEvent::default(); max_requests],
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Eventfd signalled whenever completions are ready to be polled.
    pub fn notifier(&self) -> &EventFd {
        &self.notifier
    }

    /// Resets the notifier before harvesting.
    pub fn clear_notifier(&self) {
        // EAGAIN just means nothing was signalled.
        let _ = self.notifier.read();
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Slots currently acquired, queued or in flight.
    pub fn in_flight(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Operations queued since the last [`IoQueue::submit_batch`].
    pub fn batch_len(&self) -> usize {
        self.batch.len()
    }

    /// Takes a slot off the free list.
    ///
    /// # Panics
    ///
    /// If every slot is outstanding. The queue is sized so callers can never have more requests
    /// outstanding than slots; running out is a bookkeeping bug in the caller.
    pub fn acquire_slot(&mut self) -> SlotId {
        let Some(id) = self.free.pop() else {
            panic!("IoQueue::acquire_slot called with no free slots");
        };
        let slot = &mut self.slots[id.0];
        debug_assert_eq!(slot.state, SlotState::Free);
        slot.state = SlotState::Reserved;
        id
    }

    /// Returns an outstanding slot to the free list, dropping any payload still attached.
    ///
    /// # Panics
    ///
    /// If `id` is not currently outstanding.
    pub fn release_slot(&mut self, id: SlotId) {
        let slot = &mut self.slots[id.0];
        assert_ne!(
            slot.state,
            SlotState::Free,
            "IoQueue::release_slot: slot {} is not outstanding",
            id.0
        );
        slot.state = SlotState::Free;
        slot.iov.clear();
        slot.payload = None;
        self.free.push(id);
    }

    /// Queues a vectored read or write at byte `offset` and attaches `payload` to it.
    ///
    /// Nothing is issued until [`IoQueue::submit_batch`]. The memory named by `iov` must stay
    /// valid until the operation's completion has been delivered.
    pub fn enqueue_rdwr(
        &mut self,
        opcode: IoOpcode,
        iov: &[IoVec],
        offset: u64,
        payload: T,
    ) -> SlotId {
        let id = self.acquire_slot();
        let slot = &mut self.slots[id.0];
        slot.state = SlotState::Queued;
        slot.opcode = opcode;
        slot.offset = offset;
        slot.iov.extend_from_slice(iov);
        slot.payload = Some(payload);
        self.batch.push(id);
        trace!(slot = id.0, ?opcode, offset, segs = iov.len(), "queued aio");
        id
    }

    /// Issues every queued operation in one call.
    ///
    /// Operations the kernel does not accept are completed with a negative errno on the next
    /// [`IoQueue::poll_completions`]; the notifier is signalled so that poll happens. Returns the
    /// number of operations accepted, or the submission error if none were.
    pub fn submit_batch(&mut self) -> Result<usize> {
        if self.batch.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.batch);

        let resfd = Some(self.notifier_fd());
        let iocbs: Vec<IoControlBlock<'_>> = batch
            .iter()
            .map(|id| {
                let slot = &self.slots[id.0];
                IoControlBlock {
                    opcode: slot.opcode,
                    fd: self.fd,
                    iov: &slot.iov,
                    offset: slot.offset,
                    user_data: id.0 as u64,
                    resfd,
                }
            })
            .collect();

        let outcome = self.ctx.submit(&iocbs);
        drop(iocbs);

        let (accepted, failure) = match outcome {
            Ok(n) => (n.min(batch.len()), None),
            Err(err) => (0, Some(err)),
        };
        for id in &batch[..accepted] {
            self.slots[id.0].state = SlotState::InFlight;
        }
        if accepted < batch.len() {
            let errno = failure
                .as_ref()
                .and_then(io::Error::raw_os_error)
                .unwrap_or(libc::EAGAIN);
            warn!(
                accepted,
                rejected = batch.len() - accepted,
                errno,
                "aio submission incomplete"
            );
            for &id in &batch[accepted..] {
                self.slots[id.0].state = SlotState::InFlight;
                self.rejected.push((id, -i64::from(errno)));
            }
            let _ = self.notifier.write(1);
        }

        // Reuse the allocation for the next batch.
        self.batch = batch;
        self.batch.clear();

        match failure {
            Some(err) => Err(IoQueueError::Submit(err)),
            None => Ok(accepted),
        }
    }

    fn notifier_fd(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.notifier.as_raw_fd()
    }

    /// Harvests every completed operation without blocking.
    ///
    /// `complete(slot, result, payload)` runs once per completion with the byte count or negative
    /// errno; the slot is released right after. Returns the number harvested.
    pub fn poll_completions<F>(&mut self, mut complete: F) -> Result<usize>
    where
        F: FnMut(SlotId, i64, T),
    {
        let mut n = 0;
        for (id, result) in std::mem::take(&mut self.rejected) {
            self.finish(id, result, &mut complete);
            n += 1;
        }

        if self.in_flight() == 0 {
            return Ok(n);
        }

        let mut events = std::mem::take(&mut self.events);
        let got = loop {
            match self.ctx.get_events(0, &mut events) {
                Ok(got) => break got,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.events = events;
                    return Err(IoQueueError::GetEvents(err));
                }
            }
        };

        for ev in &events[..got] {
            let idx = ev.user_data as usize;
            if self
                .slots
                .get(idx)
                .map_or(true, |s| s.state != SlotState::InFlight)
            {
                warn!(user_data = ev.user_data, "completion for a slot not in flight");
                continue;
            }
            self.finish(SlotId(idx), ev.result, &mut complete);
            n += 1;
        }
        self.events = events;
        Ok(n)
    }

    fn finish<F>(&mut self, id: SlotId, result: i64, complete: &mut F)
    where
        F: FnMut(SlotId, i64, T),
    {
        let payload = self.slots[id.0].payload.take();
        trace!(slot = id.0, result, "aio complete");
        if let Some(payload) = payload {
            complete(id, result, payload);
        }
        self.release_slot(id);
    }
}

impl<T> std::fmt::Debug for IoQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoQueue")
            .field("fd", &self.fd)
            .field("capacity", &self.slots.len())
            .field("free", &self.free.len())
            .field("batch", &self.batch.len())
            .finish()
    }
}
