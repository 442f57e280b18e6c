use std::io;

use thiserror::Error;
use vdp_ioq::IoQueueError;
use vdp_mem::GuestMemoryError;
use vdp_vring::VringError;

use crate::backend::BackendError;
use crate::bus::BusError;

/// Framing problems in a single request.
///
/// These cannot be answered with a status byte (there is nowhere trustworthy to put one), so the
/// caller treats them as a ring violation.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request header needs {needed} device-readable bytes, chain has {len}")]
    OutHeaderTooShort { len: u64, needed: usize },

    #[error("request has no device-writable status byte")]
    InHeaderTooShort,

    #[error(transparent)]
    Memory(#[from] GuestMemoryError),
}

#[derive(Debug, Error)]
pub enum DataplaneError {
    #[error("dataplane is incompatible with the device configuration: {0}")]
    Incompatible(&'static str),

    #[error("backend is already in use: {0}")]
    InUse(String),

    #[error("backend has no file descriptor usable for native AIO")]
    UnsupportedBackend,

    #[error("invalid dataplane configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("device has no virtqueue {0}")]
    NoSuchQueue(u16),

    #[error(transparent)]
    Vring(#[from] VringError),

    #[error("failed to set up guest notifier: {0}")]
    GuestNotifier(#[source] BusError),

    #[error("failed to set up host notifier: {0}")]
    HostNotifier(#[source] BusError),

    #[error(transparent)]
    IoQueue(#[from] IoQueueError),

    #[error("event loop error: {0}")]
    EventLoop(#[source] io::Error),

    #[error(transparent)]
    Backend(BackendError),
}

impl From<BackendError> for DataplaneError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::InUse(owner) => Self::InUse(owner),
            other => Self::Backend(other),
        }
    }
}
