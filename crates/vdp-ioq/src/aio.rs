use std::io;
use std::os::fd::RawFd;

/// One element of a vectored I/O request, layout-compatible with `struct iovec`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    pub base: *mut u8,
    pub len: usize,
}

const _: () = assert!(std::mem::size_of::<IoVec>() == std::mem::size_of::<libc::iovec>());
const _: () = assert!(std::mem::align_of::<IoVec>() == std::mem::align_of::<libc::iovec>());

// SAFETY: an `IoVec` is a plain address/length pair handed to the kernel. Whoever builds one is
// responsible for keeping the memory it names alive until the operation completes; moving the
// descriptor itself between threads has no bearing on that.
unsafe impl Send for IoVec {}

impl IoVec {
    pub fn as_libc(iov: &[IoVec]) -> *const libc::iovec {
        iov.as_ptr().cast()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOpcode {
    Readv,
    Writev,
}

/// A vectored read or write as handed to an [`AioContext`].
#[derive(Debug, Clone, Copy)]
pub struct IoControlBlock<'a> {
    pub opcode: IoOpcode,
    pub fd: RawFd,
    pub iov: &'a [IoVec],
    pub offset: u64,
    pub user_data: u64,
    /// Eventfd signalled when the operation completes.
    pub resfd: Option<RawFd>,
}

/// A harvested completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoEvent {
    pub user_data: u64,
    /// Bytes transferred, or a negative errno.
    pub result: i64,
}

/// A kernel asynchronous I/O context, or something that behaves like one.
pub trait AioContext: Send {
    /// Queues `iocbs` with the kernel.
    ///
    /// Returns how many leading entries were accepted; the rest were not started.
    fn submit(&mut self, iocbs: &[IoControlBlock<'_>]) -> io::Result<usize>;

    /// Harvests at least `min` and at most `out.len()` completions.
    fn get_events(&mut self, min: usize, out: &mut [IoEvent]) -> io::Result<usize>;
}

impl<C: AioContext + ?Sized> AioContext for Box<C> {
    fn submit(&mut self, iocbs: &[IoControlBlock<'_>]) -> io::Result<usize> {
        (**self).submit(iocbs)
    }

    fn get_events(&mut self, min: usize, out: &mut [IoEvent]) -> io::Result<usize> {
        (**self).get_events(min, out)
    }
}

/// Opens AIO contexts.
pub trait AioProvider: Send + Sync {
    /// Opens a context able to hold `max_requests` operations in flight.
    fn open(&self, max_requests: usize) -> io::Result<Box<dyn AioContext>>;
}
