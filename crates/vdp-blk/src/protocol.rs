//! virtio-blk request framing.

pub const VIRTIO_BLK_SECTOR_SHIFT: u32 = 9;
pub const VIRTIO_BLK_SECTOR_SIZE: u64 = 1 << VIRTIO_BLK_SECTOR_SHIFT;

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_SCSI_CMD: u32 = 2;
pub const VIRTIO_BLK_T_SCSI_CMD_OUT: u32 = 3;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
pub const VIRTIO_BLK_T_FLUSH_OUT: u32 = 5;
pub const VIRTIO_BLK_T_GET_ID: u32 = 8;
/// Legacy ordering hint; ignored.
pub const VIRTIO_BLK_T_BARRIER: u32 = 0x8000_0000;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

pub const VIRTIO_BLK_ID_BYTES: usize = 20;

/// `struct virtio_blk_outhdr`.
pub const REQUEST_HEADER_SIZE: usize = 16;
/// `struct virtio_blk_inhdr`.
pub const STATUS_SIZE: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub type_: u32,
    pub ioprio: u32,
    pub sector: u64,
}

impl RequestHeader {
    pub fn from_bytes(raw: &[u8; REQUEST_HEADER_SIZE]) -> Self {
        Self {
            type_: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            ioprio: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            sector: u64::from_le_bytes([
                raw[8], raw[9], raw[10], raw[11], raw[12], raw[13], raw[14], raw[15],
            ]),
        }
    }

    pub fn to_bytes(&self) -> [u8; REQUEST_HEADER_SIZE] {
        let mut raw = [0u8; REQUEST_HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.type_.to_le_bytes());
        raw[4..8].copy_from_slice(&self.ioprio.to_le_bytes());
        raw[8..16].copy_from_slice(&self.sector.to_le_bytes());
        raw
    }

    pub fn request_type(&self) -> RequestType {
        RequestType::decode(self.type_)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    In,
    Out,
    Flush,
    GetId,
    /// SCSI passthrough and anything unknown; carries the raw type.
    Unsupported(u32),
}

impl RequestType {
    pub fn decode(raw: u32) -> Self {
        match raw & !VIRTIO_BLK_T_BARRIER {
            VIRTIO_BLK_T_IN => Self::In,
            VIRTIO_BLK_T_OUT => Self::Out,
            VIRTIO_BLK_T_FLUSH | VIRTIO_BLK_T_FLUSH_OUT => Self::Flush,
            VIRTIO_BLK_T_GET_ID => Self::GetId,
            _ => Self::Unsupported(raw),
        }
    }
}

/// Status byte written into the last device-writable byte of every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlkStatus {
    Ok = VIRTIO_BLK_S_OK,
    IoErr = VIRTIO_BLK_S_IOERR,
    Unsupp = VIRTIO_BLK_S_UNSUPP,
}

/// Pads or truncates `serial` to the fixed GET_ID size. A serial of exactly 20 bytes is not NUL
/// terminated.
pub fn device_id(serial: &str) -> [u8; VIRTIO_BLK_ID_BYTES] {
    let mut id = [0u8; VIRTIO_BLK_ID_BYTES];
    let n = serial.len().min(VIRTIO_BLK_ID_BYTES);
    id[..n].copy_from_slice(&serial.as_bytes()[..n]);
    id
}
