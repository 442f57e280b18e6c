use vdp_mem::{GuestMemory, GuestMemoryResult, HostRange};

/// One guest-physical buffer taken from a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub len: u32,
}

/// Scatter/gather list of guest-physical segments.
///
/// Byte offsets passed to the copy helpers are relative to the start of the list, as if the
/// segments were concatenated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgList {
    segs: Vec<Segment>,
}

impl SgList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, seg: Segment) {
        self.segs.push(seg);
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segs
    }

    pub fn len(&self) -> usize {
        self.segs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    pub fn total_len(&self) -> u64 {
        self.segs.iter().map(|s| u64::from(s.len)).sum()
    }

    /// Copies bytes from the guest buffers, starting `offset` bytes into the list, into `buf`.
    ///
    /// Returns the number of bytes copied, which is short if the list ends first.
    pub fn copy_to_buf<M: GuestMemory + ?Sized>(
        &self,
        mem: &M,
        offset: u64,
        buf: &mut [u8],
    ) -> GuestMemoryResult<usize> {
        let mut done = 0usize;
        self.walk(offset, buf.len(), |paddr, at, take| {
            mem.read_into(paddr, &mut buf[at..at + take])?;
            done += take;
            Ok(())
        })?;
        Ok(done)
    }

    /// Copies `buf` into the guest buffers, starting `offset` bytes into the list.
    pub fn copy_from_buf<M: GuestMemory + ?Sized>(
        &self,
        mem: &M,
        offset: u64,
        buf: &[u8],
    ) -> GuestMemoryResult<usize> {
        let mut done = 0usize;
        self.walk(offset, buf.len(), |paddr, at, take| {
            mem.write_from(paddr, &buf[at..at + take])?;
            done += take;
            Ok(())
        })?;
        Ok(done)
    }

    fn walk<F>(&self, mut offset: u64, len: usize, mut f: F) -> GuestMemoryResult<()>
    where
        F: FnMut(u64, usize, usize) -> GuestMemoryResult<()>,
    {
        let mut at = 0usize;
        for seg in &self.segs {
            if at == len {
                break;
            }
            let seg_len = u64::from(seg.len);
            if offset >= seg_len {
                offset -= seg_len;
                continue;
            }
            let avail = (seg_len - offset) as usize;
            let take = avail.min(len - at);
            f(seg.addr + offset, at, take)?;
            at += take;
            offset = 0;
        }
        Ok(())
    }

    /// Drops `n` bytes from the front of the list. Returns how many bytes were dropped.
    pub fn discard_front(&mut self, n: u64) -> u64 {
        let mut left = n;
        let mut drop_whole = 0;
        for seg in &mut self.segs {
            if left == 0 {
                break;
            }
            let seg_len = u64::from(seg.len);
            if left >= seg_len {
                left -= seg_len;
                drop_whole += 1;
            } else {
                seg.addr += left;
                seg.len -= left as u32;
                left = 0;
            }
        }
        self.segs.drain(..drop_whole);
        n - left
    }

    /// Detaches the last `n` bytes into a new list.
    ///
    /// Returns `None`, leaving `self` unchanged, if the list holds fewer than `n` bytes.
    pub fn split_back(&mut self, n: u64) -> Option<SgList> {
        if self.total_len() < n {
            return None;
        }
        let mut tail = Vec::new();
        let mut left = n;
        while left > 0 {
            let seg = self.segs.last_mut()?;
            let seg_len = u64::from(seg.len);
            if seg_len <= left {
                left -= seg_len;
                tail.push(*seg);
                self.segs.pop();
            } else {
                seg.len -= left as u32;
                tail.push(Segment {
                    addr: seg.addr + u64::from(seg.len),
                    len: left as u32,
                });
                left = 0;
            }
        }
        tail.reverse();
        Some(SgList { segs: tail })
    }

    /// Appends the host ranges backing every segment to `out`.
    pub fn translate<M: GuestMemory + ?Sized>(
        &self,
        mem: &M,
        out: &mut Vec<HostRange>,
    ) -> GuestMemoryResult<()> {
        for seg in &self.segs {
            mem.translate(seg.addr, seg.len as usize, out)?;
        }
        Ok(())
    }
}

impl FromIterator<Segment> for SgList {
    fn from_iter<I: IntoIterator<Item = Segment>>(iter: I) -> Self {
        Self {
            segs: iter.into_iter().collect(),
        }
    }
}
