use std::io;
use std::os::fd::RawFd;

use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};

/// Identifies a registered event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

/// A minimal single-threaded readiness loop over epoll.
///
/// Sources are level-triggered eventfds; the owner clears them when it handles the token.
pub struct EventLoop {
    epoll: Epoll,
    events: Vec<EpollEvent>,
}

const MAX_EVENTS: usize = 8;

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            epoll: Epoll::new()?,
            events: vec![EpollEvent::default(); MAX_EVENTS],
        })
    }

    pub fn register(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.epoll.ctl(
            ControlOperation::Add,
            fd,
            EpollEvent::new(EventSet::IN, token.0),
        )
    }

    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        self.epoll
            .ctl(ControlOperation::Delete, fd, EpollEvent::default())
    }

    /// Waits for ready sources, or only checks if `blocking` is false, and appends their tokens
    /// to `ready`. Returns the number appended; an interrupted wait reports zero.
    pub fn poll_once(&mut self, blocking: bool, ready: &mut Vec<Token>) -> io::Result<usize> {
        let timeout = if blocking { -1 } else { 0 };
        let n = match self.epoll.wait(timeout, &mut self.events) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err),
        };
        ready.extend(self.events[..n].iter().map(|ev| Token(ev.data())));
        Ok(n)
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop").finish_non_exhaustive()
    }
}
