//! Guest side of a split virtqueue.
//!
//! [`GuestDriver`] plays the role of the guest's virtio driver: it allocates descriptors, publishes
//! chains on the available ring and reaps the used ring. It is deliberately permissive (raw
//! descriptor and ring writes are exposed) so malformed and hostile chains can be produced.

use std::sync::atomic::{fence, Ordering};

use vdp_mem::{GuestMemory, GuestMemoryResult};

use crate::ring::{
    Descriptor, QueueState, VIRTQ_DESC_F_INDIRECT, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE,
    VIRTQ_DESC_SIZE, VIRTQ_USED_ELEM_SIZE, VRING_AVAIL_F_NO_INTERRUPT,
};

/// Guest-physical placement of the three ring sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    pub size: u16,
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
}

impl QueueLayout {
    /// Packs the descriptor table, available ring and used ring back to back starting at `base`
    /// (which must be 16-byte aligned).
    pub fn contiguous(base: u64, size: u16) -> Self {
        let n = u64::from(size);
        let desc = base;
        let avail = desc + n * VIRTQ_DESC_SIZE;
        let avail_end = avail + 6 + 2 * n;
        let used = (avail_end + 3) & !3;
        Self {
            size,
            desc,
            avail,
            used,
        }
    }

    /// First address past the used ring.
    pub fn end(&self) -> u64 {
        self.used + 6 + VIRTQ_USED_ELEM_SIZE * u64::from(self.size)
    }

    /// Canonical state of a freshly enabled queue at this location.
    pub fn queue_state(&self) -> QueueState {
        QueueState {
            size: self.size,
            ready: true,
            desc_addr: self.desc,
            avail_addr: self.avail,
            used_addr: self.used,
            ..QueueState::default()
        }
    }

    fn used_event(&self) -> u64 {
        self.avail + 4 + 2 * u64::from(self.size)
    }

    fn avail_event(&self) -> u64 {
        self.used + 4 + VIRTQ_USED_ELEM_SIZE * u64::from(self.size)
    }
}

/// One buffer of a chain built by [`GuestDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestBuf {
    pub addr: u64,
    pub len: u32,
    /// Device-writable.
    pub write: bool,
}

impl GuestBuf {
    pub fn readable(addr: u64, len: u32) -> Self {
        Self {
            addr,
            len,
            write: false,
        }
    }

    pub fn writable(addr: u64, len: u32) -> Self {
        Self {
            addr,
            len,
            write: true,
        }
    }

    fn flags(&self) -> u16 {
        if self.write {
            VIRTQ_DESC_F_WRITE
        } else {
            0
        }
    }
}

/// `struct virtq_used_elem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedElem {
    pub id: u32,
    pub len: u32,
}

/// Simulated guest driver for one virtqueue.
pub struct GuestDriver<M> {
    mem: M,
    layout: QueueLayout,
    free: Vec<u16>,
    chains: Vec<Vec<u16>>,
    avail_idx: u16,
    last_used_idx: u16,
}

impl<M: GuestMemory> GuestDriver<M> {
    /// Zeroes the ring memory described by `layout` and takes ownership of all descriptors.
    pub fn new(mem: M, layout: QueueLayout) -> GuestMemoryResult<Self> {
        let len = (layout.end() - layout.desc) as usize;
        mem.write_from(layout.desc, &vec![0u8; len])?;
        Ok(Self {
            mem,
            layout,
            free: (0..layout.size).rev().collect(),
            chains: vec![Vec::new(); usize::from(layout.size)],
            avail_idx: 0,
            last_used_idx: 0,
        })
    }

    pub fn memory(&self) -> &M {
        &self.mem
    }

    pub fn layout(&self) -> QueueLayout {
        self.layout
    }

    pub fn free_descriptors(&self) -> usize {
        self.free.len()
    }

    /// Shadow `avail->idx`, including entries not yet published.
    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    /// Writes `bufs` as a descriptor chain and queues its head on the available ring.
    ///
    /// The chain is not visible to the device until [`GuestDriver::publish`]. Returns `None` if
    /// there are not enough free descriptors.
    pub fn add_chain(&mut self, bufs: &[GuestBuf]) -> GuestMemoryResult<Option<u16>> {
        if bufs.is_empty() || bufs.len() > self.free.len() {
            return Ok(None);
        }
        let split = self.free.len() - bufs.len();
        let mut ids = self.free.split_off(split);
        ids.reverse();

        for (i, buf) in bufs.iter().enumerate() {
            let (flags, next) = match ids.get(i + 1) {
                Some(&next) => (buf.flags() | VIRTQ_DESC_F_NEXT, next),
                None => (buf.flags(), 0),
            };
            self.write_desc(
                ids[i],
                Descriptor {
                    addr: buf.addr,
                    len: buf.len,
                    flags,
                    next,
                },
            )?;
        }

        let head = ids[0];
        self.chains[usize::from(head)] = ids;
        self.push_avail(head)?;
        Ok(Some(head))
    }

    /// Like [`GuestDriver::add_chain`], but places the chain in an indirect table at `table` and
    /// points a single ring descriptor at it.
    pub fn add_indirect_chain(
        &mut self,
        table: u64,
        bufs: &[GuestBuf],
    ) -> GuestMemoryResult<Option<u16>> {
        let Some(head) = self.free.pop() else {
            return Ok(None);
        };
        for (i, buf) in bufs.iter().enumerate() {
            let last = i + 1 == bufs.len();
            let desc = Descriptor {
                addr: buf.addr,
                len: buf.len,
                flags: buf.flags() | if last { 0 } else { VIRTQ_DESC_F_NEXT },
                next: if last { 0 } else { (i + 1) as u16 },
            };
            self.mem
                .write_from(table + i as u64 * VIRTQ_DESC_SIZE, &desc.to_bytes())?;
        }
        self.write_desc(
            head,
            Descriptor {
                addr: table,
                len: (bufs.len() as u64 * VIRTQ_DESC_SIZE) as u32,
                flags: VIRTQ_DESC_F_INDIRECT,
                next: 0,
            },
        )?;
        self.chains[usize::from(head)] = vec![head];
        self.push_avail(head)?;
        Ok(Some(head))
    }

    /// Writes a raw descriptor table entry.
    pub fn write_desc(&self, index: u16, desc: Descriptor) -> GuestMemoryResult<()> {
        self.mem.write_from(
            self.layout.desc + u64::from(index) * VIRTQ_DESC_SIZE,
            &desc.to_bytes(),
        )
    }

    /// Queues `head` on the available ring without any bookkeeping of its descriptors.
    pub fn push_avail(&mut self, head: u16) -> GuestMemoryResult<()> {
        let slot = u64::from(self.avail_idx & (self.layout.size - 1));
        self.mem
            .write_u16_le(self.layout.avail + 4 + 2 * slot, head)?;
        self.avail_idx = self.avail_idx.wrapping_add(1);
        Ok(())
    }

    /// Makes every queued chain visible to the device.
    pub fn publish(&mut self) -> GuestMemoryResult<()> {
        fence(Ordering::Release);
        self.mem.write_u16_le(self.layout.avail + 2, self.avail_idx)
    }

    /// Overwrites `avail->idx` directly.
    pub fn set_published_avail_idx(&mut self, idx: u16) -> GuestMemoryResult<()> {
        self.avail_idx = idx;
        self.publish()
    }

    /// Reaps one used element, returning its descriptors to the free pool.
    pub fn pop_used(&mut self) -> GuestMemoryResult<Option<UsedElem>> {
        let used_idx = self.used_idx()?;
        if used_idx == self.last_used_idx {
            return Ok(None);
        }
        fence(Ordering::Acquire);

        let slot = u64::from(self.last_used_idx & (self.layout.size - 1));
        let entry = self.layout.used + 4 + VIRTQ_USED_ELEM_SIZE * slot;
        let elem = UsedElem {
            id: self.mem.read_u32_le(entry)?,
            len: self.mem.read_u32_le(entry + 4)?,
        };
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        if let Some(ids) = self.chains.get_mut(elem.id as usize) {
            self.free.extend(ids.drain(..).rev());
        }
        Ok(Some(elem))
    }

    /// Reaps every used element currently published.
    pub fn drain_used(&mut self) -> GuestMemoryResult<Vec<UsedElem>> {
        let mut out = Vec::new();
        while let Some(elem) = self.pop_used()? {
            out.push(elem);
        }
        Ok(out)
    }

    pub fn used_idx(&self) -> GuestMemoryResult<u16> {
        self.mem.read_u16_le(self.layout.used + 2)
    }

    pub fn used_flags(&self) -> GuestMemoryResult<u16> {
        self.mem.read_u16_le(self.layout.used)
    }

    /// `avail_event` as published by the device.
    pub fn avail_event(&self) -> GuestMemoryResult<u16> {
        self.mem.read_u16_le(self.layout.avail_event())
    }

    /// Publishes `used_event`: the device should interrupt once it pushes past `idx`.
    pub fn set_used_event(&self, idx: u16) -> GuestMemoryResult<()> {
        self.mem.write_u16_le(self.layout.used_event(), idx)
    }

    /// Sets or clears `VRING_AVAIL_F_NO_INTERRUPT`.
    pub fn set_no_interrupt(&self, on: bool) -> GuestMemoryResult<()> {
        let flags = if on { VRING_AVAIL_F_NO_INTERRUPT } else { 0 };
        self.mem.write_u16_le(self.layout.avail, flags)
    }
}
