use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IoQueueError>;

#[derive(Debug, Error)]
pub enum IoQueueError {
    #[error("invalid IoQueue capacity {0}")]
    InvalidCapacity(usize),

    #[error("failed to create AIO context: {0}")]
    Context(#[source] io::Error),

    #[error("failed to create completion notifier: {0}")]
    Notifier(#[source] io::Error),

    #[error("AIO submission failed: {0}")]
    Submit(#[source] io::Error),

    #[error("failed to harvest AIO completions: {0}")]
    GetEvents(#[source] io::Error),
}
