use std::sync::atomic::{fence, Ordering};

use bitflags::bitflags;
use tracing::{error, trace};
use vdp_mem::GuestMemory;

use crate::error::{Result, VringError};
use crate::sg::{Segment, SgList};

pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

pub const VRING_USED_F_NO_NOTIFY: u16 = 1;
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 1;

pub const VIRTQ_DESC_SIZE: u64 = 16;
pub const VIRTQ_USED_ELEM_SIZE: u64 = 8;

pub const MAX_QUEUE_SIZE: u16 = 32768;

/// Largest indirect table accepted, in descriptors.
pub const MAX_INDIRECT_DESCRIPTORS: u32 = 65536;

bitflags! {
    /// Transport feature bits that change ring behaviour.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RingFeatures: u64 {
        const NOTIFY_ON_EMPTY = 1 << 24;
        const INDIRECT_DESC = 1 << 28;
        const EVENT_IDX = 1 << 29;
    }
}

/// `struct virtq_desc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl Descriptor {
    pub fn from_bytes(raw: &[u8; 16]) -> Self {
        Self {
            addr: u64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ]),
            len: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            flags: u16::from_le_bytes([raw[12], raw[13]]),
            next: u16::from_le_bytes([raw[14], raw[15]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut raw = [0u8; 16];
        raw[0..8].copy_from_slice(&self.addr.to_le_bytes());
        raw[8..12].copy_from_slice(&self.len.to_le_bytes());
        raw[12..14].copy_from_slice(&self.flags.to_le_bytes());
        raw[14..16].copy_from_slice(&self.next.to_le_bytes());
        raw
    }

    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    pub fn is_indirect(&self) -> bool {
        self.flags & VIRTQ_DESC_F_INDIRECT != 0
    }
}

/// The transport's canonical view of one virtqueue.
///
/// The device-bus layer owns this; the dataplane borrows the ring described here between `start`
/// and `stop` and writes its progress back on teardown so ordinary device emulation can carry on
/// where the dataplane left off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueState {
    pub size: u16,
    pub ready: bool,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
    pub last_avail_idx: u16,
    pub last_used_idx: u16,
    pub signalled_used: u16,
    pub signalled_used_valid: bool,
}

/// `vring_need_event`: true if `event` lies in the half-open window `(old, new]`.
pub fn need_event(event: u16, new: u16, old: u16) -> bool {
    new.wrapping_sub(event).wrapping_sub(1) < new.wrapping_sub(old)
}

/// One popped descriptor chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VringElement {
    pub head: u16,
    /// Device-readable segments, in chain order.
    pub out_sg: SgList,
    /// Device-writable segments, in chain order.
    pub in_sg: SgList,
}

/// Result of [`Vring::pop`].
#[derive(Debug, PartialEq, Eq)]
pub enum Pop {
    Element(VringElement),
    /// Every published chain has been consumed.
    Empty,
    /// Chains are pending but the caller has no room for another request; nothing was consumed.
    Exhausted,
}

/// Host side of a split virtqueue living in guest memory.
///
/// The ring is shared with a guest that may update it at any time, so every field is accessed
/// through copies, and index publication is ordered with explicit fences:
///
/// - `pop` reads `avail->idx` before the ring entry and descriptors it covers (acquire)
/// - `push` writes the used element before the `used->idx` that exposes it (release)
/// - `should_notify` and `enable_notification` order our index/flag stores against the guest's
///   loads with a full fence
///
/// Once a protocol violation is detected the ring is marked broken and stays that way until it is
/// torn down and set up again.
pub struct Vring<M> {
    mem: M,
    size: u16,
    desc: u64,
    avail: u64,
    used: u64,
    features: RingFeatures,
    max_segments: usize,
    last_avail_idx: u16,
    last_used_idx: u16,
    signalled_used: u16,
    signalled_used_valid: bool,
    broken: bool,
}

impl<M: GuestMemory> Vring<M> {
    /// Maps the queue described by `state`.
    ///
    /// Ring progress resumes from the indices stored in `state`; a freshly reset queue starts at
    /// zero.
    pub fn set_up(mem: M, state: &QueueState, features: u64, max_segments: usize) -> Result<Self> {
        if !state.ready {
            return Err(VringError::NotReady);
        }
        let size = state.size;
        if size == 0 || size > MAX_QUEUE_SIZE || !size.is_power_of_two() {
            return Err(VringError::InvalidSize(size));
        }

        let n = u64::from(size);
        let sections = [
            ("descriptor table", state.desc_addr, 16, n * VIRTQ_DESC_SIZE),
            ("available ring", state.avail_addr, 2, 6 + 2 * n),
            ("used ring", state.used_addr, 4, 6 + VIRTQ_USED_ELEM_SIZE * n),
        ];
        for (section, addr, align, len) in sections {
            if addr % align != 0 {
                return Err(VringError::Misaligned {
                    section,
                    addr,
                    align,
                });
            }
            mem.check_range(addr, len as usize)
                .map_err(|source| VringError::Unmapped { section, source })?;
        }

        Ok(Self {
            mem,
            size,
            desc: state.desc_addr,
            avail: state.avail_addr,
            used: state.used_addr,
            features: RingFeatures::from_bits_truncate(features),
            max_segments: max_segments.max(1),
            last_avail_idx: state.last_avail_idx,
            last_used_idx: state.last_used_idx,
            signalled_used: state.signalled_used,
            signalled_used_valid: state.signalled_used_valid,
            broken: false,
        })
    }

    /// Writes ring progress back into the canonical queue state and releases the mapping.
    pub fn teardown(self, state: &mut QueueState) {
        state.last_avail_idx = self.last_avail_idx;
        state.last_used_idx = self.last_used_idx;
        // Whoever processes the queue next has not signalled anything yet.
        state.signalled_used_valid = false;
    }

    pub fn memory(&self) -> &M {
        &self.mem
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn features(&self) -> RingFeatures {
        self.features
    }

    pub fn last_avail_idx(&self) -> u16 {
        self.last_avail_idx
    }

    pub fn last_used_idx(&self) -> u16 {
        self.last_used_idx
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Stops all further processing of this ring.
    pub fn set_broken(&mut self) {
        self.broken = true;
    }

    fn avail_idx(&self) -> Result<u16> {
        Ok(self.mem.read_u16_le(self.avail + 2)?)
    }

    fn avail_flags(&self) -> Result<u16> {
        Ok(self.mem.read_u16_le(self.avail)?)
    }

    fn used_event_addr(&self) -> u64 {
        self.avail + 4 + 2 * u64::from(self.size)
    }

    fn avail_event_addr(&self) -> u64 {
        self.used + 4 + VIRTQ_USED_ELEM_SIZE * u64::from(self.size)
    }

    fn ring_slot(&self, idx: u16) -> u64 {
        u64::from(idx & (self.size - 1))
    }

    /// True if the guest has published chains this side has not popped yet.
    pub fn more_avail(&self) -> bool {
        !self.broken
            && self
                .avail_idx()
                .is_ok_and(|idx| idx != self.last_avail_idx)
    }

    /// Takes the next descriptor chain off the available ring.
    ///
    /// `free_slots` is the number of further requests the caller can accept; when it is zero and
    /// chains are pending the ring is left untouched and [`Pop::Exhausted`] is returned. Any
    /// error marks the ring broken.
    pub fn pop(&mut self, free_slots: usize) -> Result<Pop> {
        if self.broken {
            return Err(VringError::Broken);
        }
        match self.try_pop(free_slots) {
            Ok(pop) => Ok(pop),
            Err(err) => {
                self.broken = true;
                error!(error = %err, last_avail_idx = self.last_avail_idx, "virtqueue broken");
                Err(err)
            }
        }
    }

    fn try_pop(&mut self, free_slots: usize) -> Result<Pop> {
        let avail_idx = self.avail_idx()?;
        let pending = avail_idx.wrapping_sub(self.last_avail_idx);
        if pending > self.size {
            return Err(VringError::IndexJump {
                last: self.last_avail_idx,
                avail: avail_idx,
                size: self.size,
            });
        }
        if pending == 0 {
            return Ok(Pop::Empty);
        }
        if free_slots == 0 {
            return Ok(Pop::Exhausted);
        }

        // Ring entries must not be read before the index that published them.
        fence(Ordering::Acquire);

        let slot = self.ring_slot(self.last_avail_idx);
        let head = self.mem.read_u16_le(self.avail + 4 + 2 * slot)?;
        if head >= self.size {
            return Err(VringError::HeadOutOfRange {
                head,
                size: self.size,
            });
        }

        let mut elem = VringElement {
            head,
            ..VringElement::default()
        };
        self.walk_chain(head, &mut elem)?;

        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        if self.features.contains(RingFeatures::EVENT_IDX) {
            self.mem
                .write_u16_le(self.avail_event_addr(), self.last_avail_idx)?;
        }

        trace!(
            head,
            out_segs = elem.out_sg.len(),
            in_segs = elem.in_sg.len(),
            "popped chain"
        );
        Ok(Pop::Element(elem))
    }

    fn read_desc(&self, table: u64, index: u16) -> Result<Descriptor> {
        let mut raw = [0u8; 16];
        self.mem
            .read_into(table + u64::from(index) * VIRTQ_DESC_SIZE, &mut raw)?;
        Ok(Descriptor::from_bytes(&raw))
    }

    fn walk_chain(&self, head: u16, elem: &mut VringElement) -> Result<()> {
        let mut index = head;
        let mut visited = 0u32;
        loop {
            visited += 1;
            if visited > u32::from(self.size) {
                return Err(VringError::LoopDetected);
            }

            let desc = self.read_desc(self.desc, index)?;
            if desc.is_indirect() {
                self.walk_indirect(&desc, elem)?;
            } else {
                self.add_segment(&desc, elem)?;
            }

            if !desc.has_next() {
                return Ok(());
            }
            index = desc.next;
            if index >= self.size {
                return Err(VringError::DescOutOfRange {
                    index,
                    size: u32::from(self.size),
                });
            }
        }
    }

    fn walk_indirect(&self, indirect: &Descriptor, elem: &mut VringElement) -> Result<()> {
        if !self.features.contains(RingFeatures::INDIRECT_DESC) {
            return Err(VringError::IndirectNotNegotiated);
        }
        if indirect.has_next() {
            return Err(VringError::IndirectWithNext);
        }
        if indirect.len == 0 || u64::from(indirect.len) % VIRTQ_DESC_SIZE != 0 {
            return Err(VringError::IndirectLength(indirect.len));
        }
        let count = indirect.len / VIRTQ_DESC_SIZE as u32;
        if count > MAX_INDIRECT_DESCRIPTORS {
            return Err(VringError::IndirectTooLarge(count));
        }
        self.mem
            .check_range(indirect.addr, indirect.len as usize)
            .map_err(|_| VringError::BadAddress {
                addr: indirect.addr,
                len: indirect.len,
            })?;

        let mut index = 0u16;
        let mut visited = 0u32;
        loop {
            visited += 1;
            if visited > count {
                return Err(VringError::LoopDetected);
            }

            let desc = self.read_desc(indirect.addr, index)?;
            if desc.is_indirect() {
                return Err(VringError::NestedIndirect);
            }
            self.add_segment(&desc, elem)?;

            if !desc.has_next() {
                return Ok(());
            }
            index = desc.next;
            if u32::from(index) >= count {
                return Err(VringError::DescOutOfRange { index, size: count });
            }
        }
    }

    fn add_segment(&self, desc: &Descriptor, elem: &mut VringElement) -> Result<()> {
        if elem.out_sg.len() + elem.in_sg.len() >= self.max_segments {
            return Err(VringError::ChainTooLong {
                max: self.max_segments,
            });
        }
        self.mem
            .check_range(desc.addr, desc.len as usize)
            .map_err(|_| VringError::BadAddress {
                addr: desc.addr,
                len: desc.len,
            })?;

        let seg = Segment {
            addr: desc.addr,
            len: desc.len,
        };
        if desc.is_write_only() {
            elem.in_sg.push(seg);
        } else if !elem.in_sg.is_empty() {
            return Err(VringError::OutAfterIn);
        } else {
            elem.out_sg.push(seg);
        }
        Ok(())
    }

    /// Returns a chain to the guest through the used ring.
    ///
    /// `len` is the number of bytes written into the chain's device-writable segments. Does
    /// nothing on a broken ring.
    pub fn push(&mut self, head: u16, len: u32) {
        if self.broken {
            return;
        }

        let slot = self.ring_slot(self.last_used_idx);
        let entry = self.used + 4 + VIRTQ_USED_ELEM_SIZE * slot;
        let mut raw = [0u8; 8];
        raw[0..4].copy_from_slice(&u32::from(head).to_le_bytes());
        raw[4..8].copy_from_slice(&len.to_le_bytes());
        if let Err(err) = self.mem.write_from(entry, &raw) {
            self.broken = true;
            error!(error = %err, head, "failed to write used element; virtqueue broken");
            return;
        }

        // The guest must see the element before the index that exposes it.
        fence(Ordering::Release);

        let new = self.last_used_idx.wrapping_add(1);
        if let Err(err) = self.mem.write_u16_le(self.used + 2, new) {
            self.broken = true;
            error!(error = %err, "failed to publish used index; virtqueue broken");
            return;
        }
        self.last_used_idx = new;

        // The index has wrapped past the last signalled position, so the next check cannot
        // compare against it.
        if (new.wrapping_sub(self.signalled_used) as i16) < 1 {
            self.signalled_used_valid = false;
        }
        trace!(head, len, used_idx = new, "pushed used element");
    }

    /// Decides whether the guest needs an interrupt for the elements pushed since the last call
    /// that returned true.
    pub fn should_notify(&mut self) -> bool {
        // Our used-ring stores must be visible before we sample the guest's suppression state.
        fence(Ordering::SeqCst);

        if self.features.contains(RingFeatures::NOTIFY_ON_EMPTY) {
            match self.avail_idx() {
                Ok(idx) if idx == self.last_avail_idx => return true,
                Ok(_) => {}
                Err(_) => return true,
            }
        }

        if !self.features.contains(RingFeatures::EVENT_IDX) {
            return self
                .avail_flags()
                .map_or(true, |flags| flags & VRING_AVAIL_F_NO_INTERRUPT == 0);
        }

        let old = self.signalled_used;
        let valid = self.signalled_used_valid;
        let new = self.last_used_idx;
        self.signalled_used = new;
        self.signalled_used_valid = true;
        if !valid {
            return true;
        }

        match self.mem.read_u16_le(self.used_event_addr()) {
            Ok(event) => need_event(event, new, old),
            Err(_) => true,
        }
    }

    /// Asks the guest not to kick us while we are already draining the ring.
    pub fn disable_notification(&mut self) {
        if self.features.contains(RingFeatures::EVENT_IDX) {
            // `pop` keeps `avail_event` trailing `last_avail_idx`, which already suppresses kicks
            // for chains we are about to see.
            return;
        }
        self.update_used_flags(|flags| flags | VRING_USED_F_NO_NOTIFY);
    }

    /// Re-arms guest kicks.
    ///
    /// Returns true if chains became available that this side has not popped, in which case the
    /// guest may not kick for them and the caller must keep draining.
    pub fn enable_notification(&mut self) -> bool {
        if self.features.contains(RingFeatures::EVENT_IDX) {
            if let Ok(idx) = self.avail_idx() {
                if let Err(err) = self.mem.write_u16_le(self.avail_event_addr(), idx) {
                    self.broken = true;
                    error!(error = %err, "failed to publish avail event; virtqueue broken");
                }
            }
        } else {
            self.update_used_flags(|flags| flags & !VRING_USED_F_NO_NOTIFY);
        }

        // Publish the re-arm before re-reading the index the guest may have bumped meanwhile.
        fence(Ordering::SeqCst);
        self.more_avail()
    }

    fn update_used_flags(&mut self, f: impl FnOnce(u16) -> u16) {
        let res = self
            .mem
            .read_u16_le(self.used)
            .and_then(|flags| self.mem.write_u16_le(self.used, f(flags)));
        if let Err(err) = res {
            self.broken = true;
            error!(error = %err, "failed to update used flags; virtqueue broken");
        }
    }
}

impl<M> std::fmt::Debug for Vring<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vring")
            .field("size", &self.size)
            .field("features", &self.features)
            .field("last_avail_idx", &self.last_avail_idx)
            .field("last_used_idx", &self.last_used_idx)
            .field("broken", &self.broken)
            .finish()
    }
}
