//! Deterministic stand-in for a kernel AIO context.
//!
//! [`SimAio`] performs each operation synchronously with `preadv`/`pwritev` at submit time but
//! controls when the completion becomes visible, which lets tests pin down completion ordering,
//! partial submission and error paths without depending on kernel timing.

use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::aio::{AioContext, AioProvider, IoControlBlock, IoEvent, IoOpcode, IoVec};

/// When completed operations become visible to `get_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionPolicy {
    /// As soon as they are submitted.
    #[default]
    Immediate,
    /// At most one per `get_events` call; the completion eventfd is signalled again while more
    /// are pending.
    OnePerPoll,
    /// Only after [`SimAio::complete_next`] or [`SimAio::complete_all`].
    Manual,
}

/// An operation as it was handed to the simulated kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedOp {
    pub opcode: IoOpcode,
    pub fd: RawFd,
    pub offset: u64,
    /// `(base address, length)` of every iovec element.
    pub iov: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, Copy)]
struct Done {
    event: IoEvent,
    resfd: Option<RawFd>,
}

#[derive(Debug, Default)]
struct State {
    policy: CompletionPolicy,
    held: VecDeque<Done>,
    ready: VecDeque<Done>,
    log: Vec<SubmittedOp>,
    open_error: Option<i32>,
    submit_error: Option<i32>,
    accept_limit: Option<usize>,
    io_errors: VecDeque<i32>,
    contexts_opened: usize,
}

/// Shared handle to a simulated AIO engine; clones observe and control the same state.
#[derive(Debug, Clone, Default)]
pub struct SimAio {
    state: Arc<Mutex<State>>,
}

fn signal(fd: RawFd) {
    let one: u64 = 1;
    // SAFETY: writes 8 bytes from a live local to an eventfd owned by the caller of `submit`.
    // A failed write (eventfd closed or counter saturated) only delays the wakeup.
    unsafe {
        libc::write(fd, (&one as *const u64).cast(), std::mem::size_of::<u64>());
    }
}

fn perform(op: &IoControlBlock<'_>) -> i64 {
    let iovcnt = match libc::c_int::try_from(op.iov.len()) {
        Ok(n) => n,
        Err(_) => return -i64::from(libc::EINVAL),
    };
    let offset = op.offset as libc::off_t;
    let iov = IoVec::as_libc(op.iov);
    // SAFETY: the queue that built `op` keeps every iovec buffer alive until the operation's
    // completion is harvested, and `iov`/`iovcnt` describe the slice borrowed by `op`.
    let ret = unsafe {
        match op.opcode {
            IoOpcode::Readv => libc::preadv(op.fd, iov, iovcnt, offset),
            IoOpcode::Writev => libc::pwritev(op.fd, iov, iovcnt, offset),
        }
    };
    if ret < 0 {
        -i64::from(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    } else {
        ret as i64
    }
}

impl SimAio {
    pub fn new(policy: CompletionPolicy) -> Self {
        let sim = Self::default();
        sim.lock().policy = policy;
        sim
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge the others sharing this engine.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_policy(&self, policy: CompletionPolicy) {
        self.lock().policy = policy;
    }

    /// Makes the next [`AioProvider::open`] fail with `errno`.
    pub fn fail_next_open(&self, errno: i32) {
        self.lock().open_error = Some(errno);
    }

    /// Makes the next `submit` call fail as a whole with `errno`.
    pub fn fail_next_submit(&self, errno: i32) {
        self.lock().submit_error = Some(errno);
    }

    /// Accept at most `n` operations per `submit` call from now on.
    pub fn limit_submission(&self, n: Option<usize>) {
        self.lock().accept_limit = n;
    }

    /// Completes the next submitted operation with `-errno` instead of performing it.
    pub fn inject_io_error(&self, errno: i32) {
        self.lock().io_errors.push_back(errno);
    }

    /// Releases the oldest held completion. Returns false if none was held.
    pub fn complete_next(&self) -> bool {
        let mut state = self.lock();
        let Some(done) = state.held.pop_front() else {
            return false;
        };
        state.ready.push_back(done);
        drop(state);
        if let Some(fd) = done.resfd {
            signal(fd);
        }
        true
    }

    /// Releases every held completion. Returns how many were released.
    pub fn complete_all(&self) -> usize {
        let mut n = 0;
        while self.complete_next() {
            n += 1;
        }
        n
    }

    /// Operations submitted but not yet harvested.
    pub fn pending(&self) -> usize {
        let state = self.lock();
        state.held.len() + state.ready.len()
    }

    pub fn held(&self) -> usize {
        self.lock().held.len()
    }

    /// Every operation accepted so far, in submission order.
    pub fn submitted(&self) -> Vec<SubmittedOp> {
        self.lock().log.clone()
    }

    pub fn contexts_opened(&self) -> usize {
        self.lock().contexts_opened
    }
}

impl AioContext for SimAio {
    fn submit(&mut self, iocbs: &[IoControlBlock<'_>]) -> io::Result<usize> {
        let mut state = self.lock();
        if let Some(errno) = state.submit_error.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let accepted = state.accept_limit.map_or(iocbs.len(), |n| n.min(iocbs.len()));
        if accepted == 0 && !iocbs.is_empty() {
            return Err(io::Error::from_raw_os_error(libc::EAGAIN));
        }

        let mut wake = Vec::new();
        for op in &iocbs[..accepted] {
            state.log.push(SubmittedOp {
                opcode: op.opcode,
                fd: op.fd,
                offset: op.offset,
                iov: op.iov.iter().map(|v| (v.base as usize, v.len)).collect(),
            });
            let result = match state.io_errors.pop_front() {
                Some(errno) => -i64::from(errno),
                None => perform(op),
            };
            let done = Done {
                event: IoEvent {
                    user_data: op.user_data,
                    result,
                },
                resfd: op.resfd,
            };
            if state.policy == CompletionPolicy::Manual {
                state.held.push_back(done);
            } else {
                state.ready.push_back(done);
                wake.extend(op.resfd);
            }
        }
        drop(state);

        wake.dedup();
        for fd in wake {
            signal(fd);
        }
        Ok(accepted)
    }

    fn get_events(&mut self, min: usize, out: &mut [IoEvent]) -> io::Result<usize> {
        let mut state = self.lock();
        if min > state.ready.len() {
            // Nothing can make progress while we hold the lock; report what a non-blocking
            // harvest would.
            return Err(io::Error::from_raw_os_error(libc::EAGAIN));
        }
        let max = match state.policy {
            CompletionPolicy::OnePerPoll => out.len().min(1),
            _ => out.len(),
        };

        let mut n = 0;
        while n < max {
            let Some(done) = state.ready.pop_front() else {
                break;
            };
            out[n] = done.event;
            n += 1;
        }

        let rewake = state.ready.front().and_then(|d| d.resfd);
        drop(state);
        if let Some(fd) = rewake {
            signal(fd);
        }
        Ok(n)
    }
}

impl AioProvider for SimAio {
    fn open(&self, _max_requests: usize) -> io::Result<Box<dyn AioContext>> {
        let mut state = self.lock();
        if let Some(errno) = state.open_error.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        state.contexts_opened += 1;
        Ok(Box::new(self.clone()))
    }
}
