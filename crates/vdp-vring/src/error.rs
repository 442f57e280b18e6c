use thiserror::Error;
use vdp_mem::GuestMemoryError;

pub type Result<T> = std::result::Result<T, VringError>;

/// Errors from mapping or walking a split virtqueue.
///
/// Setup variants are returned by [`crate::Vring::set_up`] and leave nothing mapped. Every other
/// variant is a ring-protocol violation: the ring that produced it is marked broken and all
/// later `pop` calls fail with [`VringError::Broken`].
#[derive(Debug, Error)]
pub enum VringError {
    #[error("virtqueue is not ready")]
    NotReady,

    #[error("invalid virtqueue size {0} (must be a power of two in 1..=32768)")]
    InvalidSize(u16),

    #[error("virtqueue {section} at 0x{addr:x} is not {align}-byte aligned")]
    Misaligned {
        section: &'static str,
        addr: u64,
        align: u64,
    },

    #[error("virtqueue {section} is not backed by guest memory")]
    Unmapped {
        section: &'static str,
        #[source]
        source: GuestMemoryError,
    },

    #[error("guest moved avail index from {last} to {avail} (ring size {size})")]
    IndexJump { last: u16, avail: u16, size: u16 },

    #[error("chain head {head} out of range (ring size {size})")]
    HeadOutOfRange { head: u16, size: u16 },

    #[error("descriptor index {index} out of range (table size {size})")]
    DescOutOfRange { index: u16, size: u32 },

    #[error("descriptor chain loops")]
    LoopDetected,

    #[error("descriptor chain exceeds {max} segments")]
    ChainTooLong { max: usize },

    #[error("device-readable descriptor after device-writable descriptor")]
    OutAfterIn,

    #[error("indirect table length {0} is not a multiple of the descriptor size")]
    IndirectLength(u32),

    #[error("indirect table of {0} descriptors is too large")]
    IndirectTooLarge(u32),

    #[error("indirect descriptor inside an indirect table")]
    NestedIndirect,

    #[error("indirect descriptor also has the NEXT flag")]
    IndirectWithNext,

    #[error("indirect descriptor used without negotiating VIRTIO_RING_F_INDIRECT_DESC")]
    IndirectNotNegotiated,

    #[error("descriptor buffer 0x{addr:x}+{len} is not guest memory")]
    BadAddress { addr: u64, len: u32 },

    #[error("guest memory access failed: {0}")]
    Memory(#[from] GuestMemoryError),

    #[error("virtqueue is broken")]
    Broken,
}
