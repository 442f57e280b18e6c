//! Turning popped chains into block operations, and answering them.

use tracing::{trace, warn};
use vdp_ioq::{IoOpcode, IoQueue, IoVec};
use vdp_mem::GuestMemory;
use vdp_vring::{SgList, Vring, VringElement};

use crate::backend::BlockBackend;
use crate::bounce::{iov_is_aligned, Bounce};
use crate::dataplane::DataplaneStats;
use crate::error::RequestError;
use crate::protocol::{
    BlkStatus, RequestHeader, RequestType, REQUEST_HEADER_SIZE, STATUS_SIZE,
    VIRTIO_BLK_ID_BYTES, VIRTIO_BLK_SECTOR_SIZE,
};

/// A request between decode and completion.
///
/// Owned by the I/O queue slot while the operation is in flight; any bounce buffer lives here so
/// it outlives the kernel's use of it.
#[derive(Debug)]
pub struct BlockRequest {
    head: u16,
    status: SgList,
    bounce: Option<Bounce>,
}

impl BlockRequest {
    pub fn head(&self) -> u16 {
        self.head
    }
}

/// How a request was answered, shaped by the kind of request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A read or write that transferred this many bytes.
    ReadWrite(u32),
    Flush,
    /// Bytes of the device id written into the guest buffer.
    GetId(u32),
    Unsupported,
    IoErr,
}

impl Outcome {
    /// Maps an AIO result (byte count or negative errno).
    pub fn from_aio(result: i64) -> Self {
        if result < 0 {
            Self::IoErr
        } else {
            Self::ReadWrite(u32::try_from(result).unwrap_or(u32::MAX))
        }
    }

    pub fn status(self) -> BlkStatus {
        match self {
            Self::ReadWrite(_) | Self::Flush | Self::GetId(_) => BlkStatus::Ok,
            Self::Unsupported => BlkStatus::Unsupp,
            Self::IoErr => BlkStatus::IoErr,
        }
    }

    /// Bytes written into the chain's data buffers, excluding the status byte.
    pub fn data_len(self) -> u32 {
        match self {
            Self::ReadWrite(n) | Self::GetId(n) => n,
            Self::Flush | Self::Unsupported | Self::IoErr => 0,
        }
    }
}

/// What became of a decoded request.
#[derive(Debug)]
pub enum Dispatch {
    /// Handed to the I/O queue; completes from [`IoQueue::poll_completions`].
    Queued,
    /// Answered synchronously; the caller completes it right away.
    Early(BlockRequest, Outcome),
}

/// Everything decoding a request needs, borrowed from the dataplane for one pass.
pub struct Dispatcher<'a, M: ?Sized> {
    pub mem: &'a M,
    pub backend: &'a dyn BlockBackend,
    pub ioq: &'a mut IoQueue<BlockRequest>,
    pub stats: &'a mut DataplaneStats,
    pub device_id: &'a [u8; VIRTIO_BLK_ID_BYTES],
}

impl<M: GuestMemory + ?Sized> Dispatcher<'_, M> {
    /// Decodes `elem` and starts the operation it describes.
    ///
    /// Errors mean the chain could not be framed as a request at all; nothing was queued.
    pub fn process(&mut self, elem: VringElement) -> Result<Dispatch, RequestError> {
        let VringElement {
            head,
            mut out_sg,
            mut in_sg,
        } = elem;

        let mut raw = [0u8; REQUEST_HEADER_SIZE];
        let got = out_sg.copy_to_buf(self.mem, 0, &mut raw)?;
        if got < REQUEST_HEADER_SIZE {
            return Err(RequestError::OutHeaderTooShort {
                len: out_sg.total_len(),
                needed: REQUEST_HEADER_SIZE,
            });
        }
        out_sg.discard_front(REQUEST_HEADER_SIZE as u64);
        let hdr = RequestHeader::from_bytes(&raw);

        let status = in_sg
            .split_back(STATUS_SIZE as u64)
            .ok_or(RequestError::InHeaderTooShort)?;

        let req = BlockRequest {
            head,
            status,
            bounce: None,
        };
        self.stats.requests += 1;
        trace!(head, type_ = hdr.type_, sector = hdr.sector, "request");

        let outcome = match hdr.request_type() {
            RequestType::In => return self.submit_rw(req, IoOpcode::Readv, &in_sg, hdr.sector),
            RequestType::Out => {
                if self.backend.read_only() {
                    Outcome::IoErr
                } else {
                    return self.submit_rw(req, IoOpcode::Writev, &out_sg, hdr.sector);
                }
            }
            // Kernel AIO has no usable fsync, so this blocks the loop.
            RequestType::Flush => match self.backend.flush() {
                Ok(()) => Outcome::Flush,
                Err(err) => {
                    warn!(error = %err, "flush failed");
                    Outcome::IoErr
                }
            },
            RequestType::GetId => {
                let n = (in_sg.total_len() as usize).min(VIRTIO_BLK_ID_BYTES);
                match in_sg.copy_from_buf(self.mem, 0, &self.device_id[..n]) {
                    Ok(written) => Outcome::GetId(written as u32),
                    Err(err) => {
                        warn!(error = %err, "failed to write device id");
                        Outcome::IoErr
                    }
                }
            }
            RequestType::Unsupported(type_) => {
                trace!(head, type_, "unsupported request type");
                Outcome::Unsupported
            }
        };
        Ok(Dispatch::Early(req, outcome))
    }

    fn submit_rw(
        &mut self,
        mut req: BlockRequest,
        opcode: IoOpcode,
        data: &SgList,
        sector: u64,
    ) -> Result<Dispatch, RequestError> {
        let len = data.total_len();
        if len == 0 {
            return Ok(Dispatch::Early(req, Outcome::ReadWrite(0)));
        }
        let in_range = sector
            .checked_mul(VIRTIO_BLK_SECTOR_SIZE)
            .and_then(|offset| offset.checked_add(len).map(|end| (offset, end)))
            .filter(|&(_, end)| end <= self.backend.capacity_bytes());
        let Some((offset, _)) = in_range else {
            warn!(
                head = req.head,
                sector,
                len,
                capacity = self.backend.capacity_bytes(),
                "request beyond end of device"
            );
            return Ok(Dispatch::Early(req, Outcome::IoErr));
        };

        let mut ranges = Vec::with_capacity(data.len());
        if let Err(err) = data.translate(self.mem, &mut ranges) {
            warn!(head = req.head, error = %err, "request buffer outside guest memory");
            return Ok(Dispatch::Early(req, Outcome::IoErr));
        }
        let mut iov: Vec<IoVec> = ranges
            .iter()
            .map(|r| IoVec {
                base: r.ptr.as_ptr(),
                len: r.len,
            })
            .collect();

        let align = self.backend.buffer_alignment();
        if !iov_is_aligned(&iov, align) {
            let is_write = opcode == IoOpcode::Writev;
            let mut bounce = match Bounce::new(self.mem, data, align, is_write) {
                Ok(Some(bounce)) => bounce,
                Ok(None) => {
                    warn!(head = req.head, len, "bounce buffer allocation failed");
                    return Ok(Dispatch::Early(req, Outcome::IoErr));
                }
                Err(err) => {
                    warn!(head = req.head, error = %err, "failed to fill bounce buffer");
                    return Ok(Dispatch::Early(req, Outcome::IoErr));
                }
            };
            self.stats.bounce_allocs += 1;
            iov.clear();
            iov.push(bounce.iovec());
            req.bounce = Some(bounce);
        }

        self.ioq.enqueue_rdwr(opcode, &iov, offset, req);
        Ok(Dispatch::Queued)
    }
}

/// Writes the status byte, finishes any bounce buffer and returns the chain to the guest.
pub fn complete_request<M: GuestMemory>(
    vring: &mut Vring<M>,
    stats: &mut DataplaneStats,
    req: BlockRequest,
    mut outcome: Outcome,
) {
    let BlockRequest {
        head,
        status,
        bounce,
    } = req;
    let mem = vring.memory();

    if let Some(bounce) = bounce {
        let transferred = match outcome {
            Outcome::ReadWrite(n) => n as usize,
            _ => 0,
        };
        if let Err(err) = bounce.finish(mem, transferred) {
            warn!(head, error = %err, "failed to copy bounce buffer back to the guest");
            outcome = Outcome::IoErr;
        }
        stats.bounce_frees += 1;
    }

    if let Err(err) = status.copy_from_buf(mem, 0, &[outcome.status() as u8]) {
        warn!(head, error = %err, "failed to write request status");
    }

    match outcome.status() {
        BlkStatus::Ok => {}
        BlkStatus::IoErr => stats.io_errors += 1,
        BlkStatus::Unsupp => stats.unsupported += 1,
    }
    trace!(head, ?outcome, "request complete");
    vring.push(head, outcome.data_len().saturating_add(STATUS_SIZE as u32));
}
