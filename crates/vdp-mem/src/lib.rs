//! Guest physical memory as seen from the host side of a virtio device.
//!
//! Guest RAM is shared with a running guest, so every access here copies through raw host
//! pointers instead of handing out `&[u8]`/`&mut [u8]` borrows: the guest may modify any byte at
//! any time and a Rust reference into that memory would assert exclusivity it does not have.
//! For the same reason all writers take `&self`.
//!
//! The crate provides:
//!
//! - [`GuestMemory`]: byte-addressed access plus host-address translation, used by the ring
//!   code (copies) and the I/O path (zero-copy iovecs handed to the kernel)
//! - [`GuestRam`]: anonymous-mmap backed RAM made of one or more regions; accesses that straddle
//!   adjacent regions are split transparently

mod ram;

pub use ram::GuestRam;

use std::io;
use std::ptr::NonNull;

use thiserror::Error;

pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;

/// Errors returned by [`GuestMemory`] backends.
#[derive(Debug, Error)]
pub enum GuestMemoryError {
    /// Some byte of `paddr..paddr + len` is not backed by any region.
    #[error("guest memory access out of range: paddr=0x{paddr:x} len={len}")]
    OutOfRange { paddr: u64, len: usize },

    #[error("guest memory region at 0x{base:x} has zero length")]
    EmptyRegion { base: u64 },

    #[error("guest memory region at 0x{base:x} overlaps another region")]
    Overlap { base: u64 },

    #[error("guest memory region size {size} does not fit in usize")]
    SizeTooLarge { size: u64 },

    #[error("failed to map guest memory: {0}")]
    Map(#[source] io::Error),
}

/// A contiguous run of host memory backing guest-physical addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRange {
    pub ptr: NonNull<u8>,
    pub len: usize,
}

/// Guest *physical* memory.
///
/// Implementations must be safe to share across threads: the dataplane reads rings and payloads
/// from its own event-loop thread while vCPU threads (or a simulated guest) write the same bytes.
pub trait GuestMemory: Send + Sync {
    /// End of the highest mapped guest-physical address.
    fn size(&self) -> u64;

    /// Reads bytes from guest physical memory into `dst`.
    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()>;

    /// Writes bytes from `src` into guest physical memory.
    fn write_from(&self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()>;

    /// Host mapping for `paddr`, extending to the end of the contiguous host region that contains
    /// it. `None` if `paddr` is unmapped.
    fn host_address(&self, paddr: u64) -> Option<HostRange>;

    /// Appends the host ranges backing `paddr..paddr + len` to `out`.
    ///
    /// On error `out` may contain a prefix of the translation.
    fn translate(&self, paddr: u64, len: usize, out: &mut Vec<HostRange>) -> GuestMemoryResult<()> {
        let mut cur = paddr;
        let mut remaining = len;
        while remaining > 0 {
            let range = self
                .host_address(cur)
                .ok_or(GuestMemoryError::OutOfRange { paddr, len })?;
            let take = range.len.min(remaining);
            out.push(HostRange {
                ptr: range.ptr,
                len: take,
            });
            remaining -= take;
            cur = cur
                .checked_add(take as u64)
                .ok_or(GuestMemoryError::OutOfRange { paddr, len })?;
        }
        Ok(())
    }

    /// Fails unless every byte of `paddr..paddr + len` is mapped.
    fn check_range(&self, paddr: u64, len: usize) -> GuestMemoryResult<()> {
        let mut cur = paddr;
        let mut remaining = len;
        while remaining > 0 {
            let range = self
                .host_address(cur)
                .ok_or(GuestMemoryError::OutOfRange { paddr, len })?;
            let take = range.len.min(remaining);
            remaining -= take;
            cur = cur
                .checked_add(take as u64)
                .ok_or(GuestMemoryError::OutOfRange { paddr, len })?;
        }
        Ok(())
    }

    fn read_u8(&self, paddr: u64) -> GuestMemoryResult<u8> {
        let mut buf = [0u8; 1];
        self.read_into(paddr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&self, paddr: u64) -> GuestMemoryResult<u16> {
        let mut buf = [0u8; 2];
        self.read_into(paddr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&self, paddr: u64) -> GuestMemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(paddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&self, paddr: u64) -> GuestMemoryResult<u64> {
        let mut buf = [0u8; 8];
        self.read_into(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u8(&self, paddr: u64, value: u8) -> GuestMemoryResult<()> {
        self.write_from(paddr, &[value])
    }

    fn write_u16_le(&self, paddr: u64, value: u16) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }

    fn write_u32_le(&self, paddr: u64, value: u32) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }

    fn write_u64_le(&self, paddr: u64, value: u64) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_le_bytes())
    }
}

impl<M: GuestMemory + ?Sized> GuestMemory for std::sync::Arc<M> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        (**self).read_into(paddr, dst)
    }

    fn write_from(&self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        (**self).write_from(paddr, src)
    }

    fn host_address(&self, paddr: u64) -> Option<HostRange> {
        (**self).host_address(paddr)
    }
}
