use std::io;

use vmm_sys_util::aio;

use crate::aio::{AioContext, AioProvider, IoControlBlock, IoEvent, IoOpcode, IoVec};

/// Linux native AIO (`io_setup`/`io_submit`/`io_getevents`).
///
/// Only `O_DIRECT` file descriptors get truly asynchronous behaviour from the kernel; buffered
/// descriptors work but `io_submit` may block while the I/O is performed.
pub struct LinuxAio {
    ctx: aio::IoContext,
    events: Vec<aio::IoEvent>,
}

impl LinuxAio {
    pub fn new(max_requests: usize) -> io::Result<Self> {
        let nr = u32::try_from(max_requests)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let ctx = aio::IoContext::new(nr)?;
        Ok(Self {
            ctx,
            events: vec![aio::IoEvent::default(); max_requests],
        })
    }

    /// True if the running kernel supports native AIO.
    pub fn is_supported() -> bool {
        aio::IoContext::new(1).is_ok()
    }
}

fn raw_iocb(iocb: &IoControlBlock<'_>) -> aio::IoControlBlock {
    let opcode = match iocb.opcode {
        IoOpcode::Readv => aio::IOCB_CMD_PREADV,
        IoOpcode::Writev => aio::IOCB_CMD_PWRITEV,
    };
    let (flags, resfd) = match iocb.resfd {
        Some(fd) => (aio::IOCB_FLAG_RESFD, fd as u32),
        None => (0, 0),
    };
    aio::IoControlBlock {
        aio_data: iocb.user_data,
        aio_lio_opcode: opcode as u16,
        aio_fildes: iocb.fd as u32,
        aio_buf: IoVec::as_libc(iocb.iov) as u64,
        aio_nbytes: iocb.iov.len() as u64,
        aio_offset: iocb.offset as i64,
        aio_flags: flags,
        aio_resfd: resfd,
        ..Default::default()
    }
}

impl AioContext for LinuxAio {
    fn submit(&mut self, iocbs: &[IoControlBlock<'_>]) -> io::Result<usize> {
        let mut raw: Vec<aio::IoControlBlock> = iocbs.iter().map(raw_iocb).collect();
        let refs: Vec<&mut aio::IoControlBlock> = raw.iter_mut().collect();
        self.ctx.submit(&refs)
    }

    fn get_events(&mut self, min: usize, out: &mut [IoEvent]) -> io::Result<usize> {
        let want = out.len().min(self.events.len());
        let n = self
            .ctx
            .get_events(min as libc::c_long, &mut self.events[..want], None)?;
        for (dst, ev) in out.iter_mut().zip(&self.events[..n]) {
            *dst = IoEvent {
                user_data: ev.data,
                result: ev.res,
            };
        }
        Ok(n)
    }
}

/// [`AioProvider`] for [`LinuxAio`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeAio;

impl AioProvider for NativeAio {
    fn open(&self, max_requests: usize) -> io::Result<Box<dyn AioContext>> {
        Ok(Box::new(LinuxAio::new(max_requests)?))
    }
}
