//! Bounce buffers for guest vectors the backend cannot take directly.
//!
//! `O_DIRECT` backends require every iovec base and length to be a multiple of the backend's
//! buffer alignment. Guest buffers frequently are not, in which case the request is redirected
//! through one host buffer with the right alignment.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use vdp_ioq::IoVec;
use vdp_mem::{GuestMemory, GuestMemoryResult};
use vdp_vring::SgList;

/// Zero-initialized heap buffer with a caller-chosen alignment.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: `AlignedBuf` uniquely owns its allocation.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    /// Returns `None` if `len` is zero, `align` is not a power of two, or allocation fails.
    pub fn new(len: usize, align: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let layout = Layout::from_size_align(len, align).ok()?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation is `len` initialized bytes owned by `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }

    pub fn iovec(&mut self) -> IoVec {
        IoVec {
            base: self.ptr.as_ptr(),
            len: self.len(),
        }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: `ptr` was returned by `alloc_zeroed` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("ptr", &self.ptr)
            .field("len", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

/// True if every element of `iov` starts and ends on an `align` boundary.
pub fn iov_is_aligned(iov: &[IoVec], align: usize) -> bool {
    align <= 1
        || iov
            .iter()
            .all(|v| (v.base as usize) % align == 0 && v.len % align == 0)
}

/// A host buffer standing in for a guest vector for the lifetime of one request.
#[derive(Debug)]
pub struct Bounce {
    buf: AlignedBuf,
    /// Guest vector to fill from `buf` when a read completes.
    read_back: Option<SgList>,
}

impl Bounce {
    /// Allocates a buffer covering all of `sg`.
    ///
    /// For a write the guest data is copied in now, so the asynchronous operation never touches
    /// guest memory. For a read the vector is remembered for [`Bounce::finish`]. Returns
    /// `Ok(None)` if the buffer cannot be allocated.
    pub fn new<M: GuestMemory + ?Sized>(
        mem: &M,
        sg: &SgList,
        align: usize,
        is_write: bool,
    ) -> GuestMemoryResult<Option<Self>> {
        let Ok(len) = usize::try_from(sg.total_len()) else {
            return Ok(None);
        };
        let Some(mut buf) = AlignedBuf::new(len, align.max(1)) else {
            return Ok(None);
        };
        let read_back = if is_write {
            sg.copy_to_buf(mem, 0, buf.as_mut_slice())?;
            None
        } else {
            Some(sg.clone())
        };
        Ok(Some(Self { buf, read_back }))
    }

    pub fn iovec(&mut self) -> IoVec {
        self.buf.iovec()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_read(&self) -> bool {
        self.read_back.is_some()
    }

    /// Copies the first `transferred` bytes back into the guest vector for reads, then frees the
    /// buffer.
    pub fn finish<M: GuestMemory + ?Sized>(
        self,
        mem: &M,
        transferred: usize,
    ) -> GuestMemoryResult<()> {
        if let Some(sg) = &self.read_back {
            let n = transferred.min(self.buf.len());
            sg.copy_from_buf(mem, 0, &self.buf.as_slice()[..n])?;
        }
        Ok(())
    }
}
