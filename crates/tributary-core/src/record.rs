//! Record Data Structure
//!
//! A record is the unit of data stored in a partition log:
//! - **offset**: position in the partition, assigned by the log on append
//! - **timestamp**: producer or append time, milliseconds since epoch
//! - **key**: optional; a null key and an empty key are different things
//! - **value**: the payload
//! - **headers**: ordered name/value pairs
//!
//! ## Example
//! ```ignore
//! let record = Record::new(Some(Bytes::from("user-42")), Bytes::from("clicked"))
//!     .with_timestamp(1_700_000_000_000)
//!     .with_header("trace-id", Bytes::from("abc"));
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::FRAME_OVERHEAD;

/// A single header attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: Bytes,
}

impl Header {
    pub fn new(key: impl Into<String>, value: Bytes) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// A single record in a partition log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Offset of this record in the partition. Overwritten on append.
    pub offset: i64,

    /// Timestamp in milliseconds since epoch
    pub timestamp: i64,

    /// Optional key
    pub key: Option<Bytes>,

    /// Value (payload)
    pub value: Bytes,

    /// Ordered headers
    pub headers: Vec<Header>,
}

impl Record {
    /// Creates a record stamped with the current wall-clock time.
    pub fn new(key: Option<Bytes>, value: Bytes) -> Self {
        Self {
            offset: 0,
            timestamp: now_ms(),
            key,
            value,
            headers: Vec::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: Bytes) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }

    /// Exact number of bytes this record occupies in a segment data file,
    /// including the length prefix.
    pub fn encoded_size(&self) -> usize {
        FRAME_OVERHEAD
            + self.key.as_ref().map(|k| k.len()).unwrap_or(0)
            + self.value.len()
            + self
                .headers
                .iter()
                .map(|h| 2 + h.key.len() + 4 + h.value.len())
                .sum::<usize>()
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_size_without_key() {
        let record = Record::new(None, Bytes::from(vec![0u8; 64]));
        assert_eq!(record.encoded_size(), 100);
    }

    #[test]
    fn test_encoded_size_with_key_and_headers() {
        let record = Record::new(Some(Bytes::from("key")), Bytes::from("value"))
            .with_header("h", Bytes::from("vv"));
        // 36 + 3 + 5 + (2 + 1 + 4 + 2)
        assert_eq!(record.encoded_size(), 53);
    }

    #[test]
    fn test_builder_sets_fields() {
        let record = Record::new(None, Bytes::from("v")).with_timestamp(42);
        assert_eq!(record.timestamp, 42);
        assert_eq!(record.offset, 0);
        assert!(record.headers.is_empty());
    }
}
