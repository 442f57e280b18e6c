use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

/// Buffer alignment required by `O_DIRECT` on the common 512-byte logical block devices.
pub const DIRECT_IO_ALIGNMENT: usize = 512;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("backend is in use by {0}")]
    InUse(String),

    #[error("{op} blocked: backend is in use by {reason}")]
    Blocked { op: BlockOp, reason: String },

    #[error("backend is read-only")]
    ReadOnly,

    #[error("buffer alignment {0} is not a power of two")]
    InvalidAlignment(usize),
}

/// Backend operations that conflict with a dataplane owning the file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Resize,
    Snapshot,
}

impl std::fmt::Display for BlockOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resize => f.write_str("resize"),
            Self::Snapshot => f.write_str("snapshot"),
        }
    }
}

/// Marker registered with [`BlockBackend::block_operations`]; hand it back to unblock.
#[derive(Debug, PartialEq, Eq)]
pub struct OpBlocker {
    reason: String,
}

impl OpBlocker {
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// The storage behind a dataplane device.
///
/// The dataplane submits reads and writes directly against [`BlockBackend::aio_fd`]; everything
/// else (capacity, flush, serial, blocking conflicting operations) goes through this trait.
pub trait BlockBackend: Send + Sync {
    /// Descriptor usable for kernel AIO, or `None` if the backend cannot be driven that way
    /// (e.g. an image format that needs translation).
    fn aio_fd(&self) -> Option<RawFd>;

    fn capacity_bytes(&self) -> u64;

    /// Required alignment of buffer addresses and lengths, in bytes.
    fn buffer_alignment(&self) -> usize;

    fn read_only(&self) -> bool;

    fn serial(&self) -> Option<&str>;

    /// Synchronously flushes written data to stable storage.
    fn flush(&self) -> io::Result<()>;

    /// True if another subsystem currently owns the backend.
    fn in_use(&self) -> bool;

    /// Registers `reason` as the owner of the backend; conflicting operations are refused until
    /// the returned blocker is handed back.
    fn block_operations(&self, reason: &str) -> Result<OpBlocker, BackendError>;

    fn unblock_operations(&self, blocker: OpBlocker);
}

#[derive(Debug, Clone, Default)]
pub struct FileBackendOptions {
    /// Open with `O_DIRECT`.
    pub direct: bool,
    pub read_only: bool,
    pub serial: Option<String>,
    /// Overrides the buffer alignment derived from `direct`.
    pub alignment: Option<usize>,
}

/// A raw image file.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
    path: PathBuf,
    capacity: AtomicU64,
    alignment: usize,
    read_only: bool,
    serial: Option<String>,
    blocker: Mutex<Option<String>>,
}

impl FileBackend {
    pub fn open(path: impl AsRef<Path>, options: FileBackendOptions) -> Result<Self, BackendError> {
        if let Some(align) = options.alignment.filter(|a| !a.is_power_of_two()) {
            return Err(BackendError::InvalidAlignment(align));
        }
        let path = path.as_ref().to_path_buf();
        let mut open = OpenOptions::new();
        open.read(true).write(!options.read_only);
        if options.direct {
            open.custom_flags(libc::O_DIRECT);
        }
        let file = open.open(&path).map_err(|source| BackendError::Open {
            path: path.clone(),
            source,
        })?;
        let capacity = file.metadata()?.len();

        let alignment = options
            .alignment
            .unwrap_or(if options.direct { DIRECT_IO_ALIGNMENT } else { 1 });
        debug!(
            path = %path.display(),
            capacity,
            alignment,
            direct = options.direct,
            "opened file backend"
        );
        Ok(Self {
            file,
            path,
            capacity: AtomicU64::new(capacity),
            alignment,
            read_only: options.read_only,
            serial: options.serial,
            blocker: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn blocker(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.blocker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fails if `op` conflicts with a registered blocker.
    pub fn check_op(&self, op: BlockOp) -> Result<(), BackendError> {
        match self.blocker().as_ref() {
            Some(reason) => Err(BackendError::Blocked {
                op,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Changes the size of the image.
    pub fn resize(&self, new_len: u64) -> Result<(), BackendError> {
        self.check_op(BlockOp::Resize)?;
        if self.read_only {
            return Err(BackendError::ReadOnly);
        }
        self.file.set_len(new_len)?;
        self.capacity.store(new_len, Ordering::Release);
        Ok(())
    }
}

impl BlockBackend for FileBackend {
    fn aio_fd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }

    fn capacity_bytes(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    fn buffer_alignment(&self) -> usize {
        self.alignment
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn in_use(&self) -> bool {
        self.blocker().is_some()
    }

    fn block_operations(&self, reason: &str) -> Result<OpBlocker, BackendError> {
        let mut blocker = self.blocker();
        if let Some(owner) = blocker.as_ref() {
            return Err(BackendError::InUse(owner.clone()));
        }
        *blocker = Some(reason.to_string());
        Ok(OpBlocker {
            reason: reason.to_string(),
        })
    }

    fn unblock_operations(&self, blocker: OpBlocker) {
        let mut current = self.blocker();
        if current.as_deref() == Some(blocker.reason.as_str()) {
            *current = None;
        }
    }
}
