//! virtio-blk dataplane.
//!
//! A [`Dataplane`] serves one virtqueue of a virtio-blk device outside the device model: guest
//! kicks arrive on an eventfd, descriptor chains are decoded straight out of guest memory, reads
//! and writes go to the backing file through Linux AIO, and completions are pushed to the used
//! ring and signalled through another eventfd.
//!
//! The pieces outside this crate's control are traits:
//!
//! - [`BlockBackend`]: the storage, its AIO-capable descriptor, and the operation blockers that
//!   keep other subsystems off it while the dataplane owns it.
//! - [`VirtioBus`]: the transport, which owns the canonical queue state and wires notifiers.
//! - [`vdp_ioq::AioProvider`]: the kernel AIO context (or a simulation of it).
//!
//! Guest buffers that do not meet the backend's alignment requirement are redirected through a
//! [`bounce`] buffer.

pub mod bounce;
pub mod protocol;

mod backend;
mod bus;
mod config;
mod dataplane;
mod error;
mod event_loop;
mod request;

pub use backend::{
    BackendError, BlockBackend, BlockOp, FileBackend, FileBackendOptions, OpBlocker,
    DIRECT_IO_ALIGNMENT,
};
pub use bus::{BusError, StandaloneBus, VirtioBus};
pub use config::{DataplaneConfig, DEFAULT_MAX_SEGMENTS};
pub use dataplane::{Dataplane, DataplaneState, DataplaneStats, Result, COMPLETION, DOORBELL};
pub use error::{DataplaneError, RequestError};
pub use event_loop::{EventLoop, Token};
pub use request::{complete_request, BlockRequest, Dispatch, Dispatcher, Outcome};
