//! Batched asynchronous block I/O on top of Linux AIO.
//!
//! [`IoQueue`] gathers vectored reads and writes while a ring is being drained, issues them to
//! the kernel in a single submission and later harvests completions in whatever order the kernel
//! produces them. Request slots come from a fixed arena with an index free list, so the hot path
//! never allocates and outstanding requests can never exceed the configured capacity.
//!
//! The kernel facility sits behind [`AioContext`]/[`AioProvider`]:
//!
//! - [`LinuxAio`]/[`NativeAio`]: `io_submit`/`io_getevents` through `vmm-sys-util`
//! - [`SimAio`]: a deterministic engine for tests and dry runs

mod aio;
mod error;
mod native;
mod queue;
pub mod sim;

pub use aio::{AioContext, AioProvider, IoControlBlock, IoEvent, IoOpcode, IoVec};
pub use error::{IoQueueError, Result};
pub use native::{LinuxAio, NativeAio};
pub use queue::{IoQueue, SlotId};
pub use sim::{CompletionPolicy, SimAio, SubmittedOp};

#[cfg(test)]
mod proptests;
