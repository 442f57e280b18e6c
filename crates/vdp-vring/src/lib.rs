//! Split virtqueue ("vring") processing for a host-side virtio dataplane.
//!
//! The ring lives in guest memory and is shared, unlocked, with the guest's driver. This crate
//! provides:
//!
//! - [`Vring`]: the device side. Pops descriptor chains into scatter/gather lists, pushes
//!   completions onto the used ring and implements the notification suppression protocol
//!   (legacy flags and `EVENT_IDX`)
//! - [`SgList`]: guest-physical scatter/gather lists with byte-offset copy helpers
//! - [`QueueState`]: the canonical queue configuration/progress handed between the transport and
//!   the dataplane
//! - [`GuestDriver`]: the driver side, used to simulate a guest
//!
//! Malformed chains (loops, out-of-range indices, misused indirect tables, oversized chains) are
//! never partially processed: the ring is marked broken and stops producing work.

pub mod driver;
mod error;
mod ring;
mod sg;

pub use driver::{GuestBuf, GuestDriver, QueueLayout, UsedElem};
pub use error::{Result, VringError};
pub use ring::{
    need_event, Descriptor, Pop, QueueState, RingFeatures, Vring, VringElement,
    MAX_INDIRECT_DESCRIPTORS, MAX_QUEUE_SIZE, VIRTQ_DESC_F_INDIRECT, VIRTQ_DESC_F_NEXT,
    VIRTQ_DESC_F_WRITE, VIRTQ_DESC_SIZE, VIRTQ_USED_ELEM_SIZE, VRING_AVAIL_F_NO_INTERRUPT,
    VRING_USED_F_NO_NOTIFY,
};
pub use sg::{Segment, SgList};

#[cfg(test)]
mod proptests;
