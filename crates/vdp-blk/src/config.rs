use crate::error::DataplaneError;

/// Default bound on descriptors per chain.
pub const DEFAULT_MAX_SEGMENTS: usize = 1024;

/// Settings for one dataplane device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataplaneConfig {
    pub queue_index: u16,
    /// Request slots in the I/O queue. Defaults to the virtqueue size, which is enough for every
    /// chain the guest can publish at once.
    pub max_requests: Option<usize>,
    /// Longest descriptor chain accepted before the ring is considered broken.
    pub max_segments: usize,
    /// SCSI passthrough was enabled on the device.
    pub scsi: bool,
    /// Guest-configurable write cache was enabled on the device.
    pub config_wce: bool,
    /// GET_ID serial; falls back to the backend's.
    pub serial: Option<String>,
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            queue_index: 0,
            max_requests: None,
            max_segments: DEFAULT_MAX_SEGMENTS,
            scsi: false,
            config_wce: false,
            serial: None,
        }
    }
}

impl DataplaneConfig {
    pub fn queue_index(mut self, queue: u16) -> Self {
        self.queue_index = queue;
        self
    }

    pub fn max_requests(mut self, n: usize) -> Self {
        self.max_requests = Some(n);
        self
    }

    pub fn max_segments(mut self, n: usize) -> Self {
        self.max_segments = n;
        self
    }

    pub fn scsi(mut self, on: bool) -> Self {
        self.scsi = on;
        self
    }

    pub fn config_wce(mut self, on: bool) -> Self {
        self.config_wce = on;
        self
    }

    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn validate(&self) -> Result<(), DataplaneError> {
        if self.max_requests == Some(0) {
            return Err(DataplaneError::InvalidConfig("max_requests must be non-zero"));
        }
        if self.max_segments == 0 {
            return Err(DataplaneError::InvalidConfig("max_segments must be non-zero"));
        }
        // Device properties the dataplane cannot honour.
        if self.scsi {
            return Err(DataplaneError::Incompatible(
                "device is configured with scsi=on, set scsi=off",
            ));
        }
        if self.config_wce {
            return Err(DataplaneError::Incompatible(
                "device is configured with config-wce=on, set config-wce=off",
            ));
        }
        Ok(())
    }
}
