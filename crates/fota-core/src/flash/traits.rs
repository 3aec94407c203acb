//! Block-storage driver abstraction.
//!
//! Defines the `FlashStorage` trait over the target partition device,
//! allowing different implementations (memory-backed, file-backed, a real
//! flash driver binding).

use thiserror::Error;

/// Erase granularity of the storage layer.
pub const SECTOR_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("operation failed: {0}")]
    OpFailed(String),

    #[error("access of {len} bytes at offset {offset} exceeds capacity {capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("sector {sector} written before erase")]
    NotErased { sector: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract partition storage interface.
///
/// Offsets are partition-relative: the handle given to a session *is* the
/// target partition. Timeouts and bad-sector handling live below this trait
/// and surface as [`FlashError`] values.
pub trait FlashStorage: Send {
    /// Total writable bytes of the partition.
    fn capacity(&self) -> u64;

    /// Erase granularity in bytes.
    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }

    /// Erase one sector, by index.
    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError>;

    /// Program bytes at `offset`. The covered sectors must have been erased.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), FlashError>;

    /// Read back previously written bytes.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), FlashError>;
}
