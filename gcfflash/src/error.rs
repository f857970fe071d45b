//! Error types for gcfflash.

use std::io;
use thiserror::Error;

/// Result type for gcfflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for gcfflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// GCF file shorter than the 14-byte header.
    #[error("Invalid GCF: file too small ({0} bytes)")]
    GcfTooSmall(usize),

    /// GCF magic mismatch or missing firmware version in the file name.
    #[error("Invalid GCF: {0}")]
    GcfBadHeader(String),

    /// GCF payload size field disagrees with the actual file size.
    #[error("Invalid GCF: header says {header} payload bytes, file has {actual}")]
    GcfSizeMismatch {
        /// Payload size from the header.
        header: u32,
        /// Payload bytes actually present.
        actual: usize,
    },

    /// Command-line or job validation error.
    #[error("Invalid job: {0}")]
    Job(String),

    /// Device reset mechanism not available on this platform.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Serial device not found or could not be opened.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
}

impl Error {
    /// Numeric code kept compatible with the classic flasher for the GCF
    /// parse errors (-1 too small, -2 bad header, -3 size mismatch).
    pub fn code(&self) -> i32 {
        match self {
            Error::GcfTooSmall(_) => -1,
            Error::GcfBadHeader(_) => -2,
            Error::GcfSizeMismatch { .. } => -3,
            _ => -4,
        }
    }
}
