//! Error Types for Tributary record framing
//!
//! ## Error Categories
//!
//! ### I/O Errors
//! - `Io`: the underlying reader or writer failed
//!
//! ### Data Integrity Errors
//! - `IncompleteRecord`: a frame runs past the end of the readable bytes (torn write)
//! - `CrcMismatch`: the frame checksum does not match its contents
//! - `CorruptedRecord`: the frame is structurally invalid (bad lengths, trailing bytes)
//!
//! ### Encoding Errors
//! - `FieldTooLarge`: a record field cannot be represented in the frame layout
//!
//! Every integrity error carries the byte position of the frame that failed,
//! which is exactly the point a recovery pass truncates to.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Incomplete record at position {position}: need {needed} bytes, {available} available")]
    IncompleteRecord {
        position: u64,
        needed: u64,
        available: u64,
    },

    #[error("CRC mismatch at position {position}: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        position: u64,
        stored: u32,
        computed: u32,
    },

    #[error("Corrupted record at position {position}: {reason}")]
    CorruptedRecord { position: u64, reason: String },

    #[error("Record field too large: {0}")]
    FieldTooLarge(String),
}

impl Error {
    /// True for errors caused by the bytes being read rather than by the
    /// reader itself.
    pub fn is_data_error(&self) -> bool {
        !matches!(self, Error::Io(_) | Error::FieldTooLarge(_))
    }

    /// Byte position of the offending frame, if the error is tied to one.
    pub fn position(&self) -> Option<u64> {
        match self {
            Error::IncompleteRecord { position, .. }
            | Error::CrcMismatch { position, .. }
            | Error::CorruptedRecord { position, .. } => Some(*position),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
