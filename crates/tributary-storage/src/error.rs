//! Storage Error Types
//!
//! ## Error Categories
//!
//! ### Integrity Errors
//! - `CorruptedSegment`, `CorruptedIndex`, `CorruptedTimeIndex`: on-disk data failed validation
//! - `IncompleteRecord`: a torn write at the tail of a data file
//! - `IndexSizeMismatch`: an index disagrees with the data it points into
//!
//! ### Contention
//! - `MigrationInProgress`: a read waited too long for a segment that is
//!   being archived or restored
//!
//! ### Lookup Errors
//! - `OffsetOutOfRange`: below the log start offset or at/above the high-water mark
//! - `SegmentNotFound`, `SnapshotNotFound`
//!
//! ### Remote Errors
//! - `RemoteStoreUnavailable`: retries exhausted
//! - `RemoteObjectMissing`: an archived object is gone (never retried)
//! - `RemoteVerificationFailed`: an upload could not be confirmed
//!
//! ## Retrying
//!
//! `Error::is_retryable` tells callers which failures are transient. Remote
//! operations inside this crate already retry with exponential backoff, so a
//! `RemoteStoreUnavailable` reaching a caller means the budget was spent.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record codec error: {0}")]
    Codec(#[source] tributary_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Corrupted segment: {0}")]
    CorruptedSegment(String),

    #[error("Corrupted offset index: {0}")]
    CorruptedIndex(String),

    #[error("Corrupted time index: {0}")]
    CorruptedTimeIndex(String),

    #[error("Incomplete record at position {position}")]
    IncompleteRecord { position: u64 },

    #[error("Index size mismatch: {0}")]
    IndexSizeMismatch(String),

    #[error("Offset {offset} out of range [{start}, {end})")]
    OffsetOutOfRange { offset: i64, start: i64, end: i64 },

    #[error("Segment {base_offset} is full")]
    SegmentFull { base_offset: i64 },

    #[error("Segment not found: {0}")]
    SegmentNotFound(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Snapshot {id} incomplete: {reason}")]
    SnapshotIncomplete { id: String, reason: String },

    #[error("Snapshot too soon: last snapshot {elapsed_ms}ms ago, minimum interval {min_interval_ms}ms")]
    SnapshotTooSoon { elapsed_ms: u64, min_interval_ms: u64 },

    #[error("Remote store unavailable after {attempts} attempt(s): {reason}")]
    RemoteStoreUnavailable { attempts: u32, reason: String },

    #[error("Remote object missing: {0}")]
    RemoteObjectMissing(String),

    #[error("Remote verification failed for {key}: expected {expected} bytes, found {actual:?}")]
    RemoteVerificationFailed {
        key: String,
        expected: u64,
        actual: Option<u64>,
    },

    #[error("Migration in progress for segment {0}")]
    MigrationInProgress(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<tributary_core::Error> for Error {
    fn from(e: tributary_core::Error) -> Self {
        match e {
            tributary_core::Error::IncompleteRecord { position, .. } => {
                Error::IncompleteRecord { position }
            }
            other => Error::Codec(other),
        }
    }
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RemoteStoreUnavailable { .. } | Error::MigrationInProgress(_) => true,
            Error::ObjectStore(e) => !matches!(
                e,
                object_store::Error::NotFound { .. }
                    | object_store::Error::NotSupported { .. }
                    | object_store::Error::NotImplemented
            ),
            _ => false,
        }
    }

    /// Whether the error describes damaged on-disk data.
    pub fn is_corruption(&self) -> bool {
        match self {
            Error::Codec(e) => e.is_data_error(),
            Error::CorruptedSegment(_)
            | Error::CorruptedIndex(_)
            | Error::CorruptedTimeIndex(_)
            | Error::IncompleteRecord { .. }
            | Error::IndexSizeMismatch(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::RemoteStoreUnavailable {
            attempts: 3,
            reason: "timeout".to_string()
        }
        .is_retryable());
        assert!(Error::MigrationInProgress("p0/00000000000000000000.log".to_string()).is_retryable());
        assert!(!Error::RemoteObjectMissing("k".to_string()).is_retryable());
        assert!(!Error::OffsetOutOfRange {
            offset: 5,
            start: 0,
            end: 3
        }
        .is_retryable());

        let not_found = object_store::Error::NotFound {
            path: "k".to_string(),
            source: "gone".into(),
        };
        assert!(!Error::ObjectStore(not_found).is_retryable());

        let generic = object_store::Error::Generic {
            store: "s3",
            source: "connection reset".into(),
        };
        assert!(Error::ObjectStore(generic).is_retryable());
    }

    #[test]
    fn test_corruption_classification() {
        let codec = tributary_core::Error::CrcMismatch {
            position: 0,
            stored: 1,
            computed: 2,
        };
        assert!(Error::Codec(codec).is_corruption());
        assert!(Error::IndexSizeMismatch("x".to_string()).is_corruption());
        assert!(!Error::SnapshotNotFound("s".to_string()).is_corruption());
    }

    #[test]
    fn test_torn_frame_maps_to_incomplete_record() {
        let torn = tributary_core::Error::IncompleteRecord {
            position: 900,
            needed: 100,
            available: 7,
        };
        let err = Error::from(torn);
        assert!(matches!(err, Error::IncompleteRecord { position: 900 }));
        assert!(err.is_corruption());
        assert!(!err.is_retryable());

        let crc = tributary_core::Error::CrcMismatch {
            position: 0,
            stored: 1,
            computed: 2,
        };
        assert!(matches!(Error::from(crc), Error::Codec(_)));
    }
}
