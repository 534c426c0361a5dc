//! Sparse offset and time indexes.
//!
//! Both index files are flat arrays of fixed-size big-endian entries:
//!
//! ```text
//! .index      [relative_offset i32][position i32]           8 bytes/entry
//! .timeindex  [max_timestamp i64][relative_offset i32]     12 bytes/entry
//! ```
//!
//! An index point is the first record of a segment, or any record whose
//! byte position is at least `index_interval_bytes` past the previous index
//! point. Every index point gets an offset entry. A time entry is written at
//! an index point only when the largest timestamp seen so far has grown
//! since the last time entry, so both files are strictly increasing and
//! fully determined by the data file.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

pub const OFFSET_ENTRY_SIZE: usize = 8;
pub const TIME_ENTRY_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetIndexEntry {
    pub relative_offset: i32,
    pub position: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeIndexEntry {
    /// Largest record timestamp seen up to and including `relative_offset`.
    pub timestamp: i64,
    pub relative_offset: i32,
}

impl OffsetIndexEntry {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_i32(self.relative_offset);
        buf.put_i32(self.position);
    }
}

impl TimeIndexEntry {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_i64(self.timestamp);
        buf.put_i32(self.relative_offset);
    }
}

pub fn encode_offset_index(entries: &[OffsetIndexEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.len() * OFFSET_ENTRY_SIZE);
    for entry in entries {
        entry.encode(&mut buf);
    }
    buf
}

pub fn encode_time_index(entries: &[TimeIndexEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.len() * TIME_ENTRY_SIZE);
    for entry in entries {
        entry.encode(&mut buf);
    }
    buf
}

/// Parses an offset index file, rejecting partial entries and
/// non-increasing keys.
pub fn decode_offset_index(mut data: &[u8]) -> Result<Vec<OffsetIndexEntry>> {
    if data.len() % OFFSET_ENTRY_SIZE != 0 {
        return Err(Error::CorruptedIndex(format!(
            "length {} is not a multiple of {}",
            data.len(),
            OFFSET_ENTRY_SIZE
        )));
    }
    let mut entries: Vec<OffsetIndexEntry> = Vec::with_capacity(data.len() / OFFSET_ENTRY_SIZE);
    while data.has_remaining() {
        let entry = OffsetIndexEntry {
            relative_offset: data.get_i32(),
            position: data.get_i32(),
        };
        if entry.relative_offset < 0 || entry.position < 0 {
            return Err(Error::CorruptedIndex(format!("negative entry {:?}", entry)));
        }
        if let Some(prev) = entries.last() {
            if entry.relative_offset <= prev.relative_offset || entry.position <= prev.position {
                return Err(Error::CorruptedIndex(format!(
                    "entry {:?} does not increase after {:?}",
                    entry, prev
                )));
            }
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Parses a time index file, rejecting partial entries and
/// non-increasing keys.
pub fn decode_time_index(mut data: &[u8]) -> Result<Vec<TimeIndexEntry>> {
    if data.len() % TIME_ENTRY_SIZE != 0 {
        return Err(Error::CorruptedTimeIndex(format!(
            "length {} is not a multiple of {}",
            data.len(),
            TIME_ENTRY_SIZE
        )));
    }
    let mut entries: Vec<TimeIndexEntry> = Vec::with_capacity(data.len() / TIME_ENTRY_SIZE);
    while data.has_remaining() {
        let entry = TimeIndexEntry {
            timestamp: data.get_i64(),
            relative_offset: data.get_i32(),
        };
        if entry.relative_offset < 0 {
            return Err(Error::CorruptedTimeIndex(format!("negative entry {:?}", entry)));
        }
        if let Some(prev) = entries.last() {
            if entry.timestamp <= prev.timestamp || entry.relative_offset <= prev.relative_offset {
                return Err(Error::CorruptedTimeIndex(format!(
                    "entry {:?} does not increase after {:?}",
                    entry, prev
                )));
            }
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Last entry whose relative offset is `<= relative_offset`.
pub fn lookup_offset(entries: &[OffsetIndexEntry], relative_offset: i32) -> Option<OffsetIndexEntry> {
    let idx = entries.partition_point(|e| e.relative_offset <= relative_offset);
    idx.checked_sub(1).map(|i| entries[i])
}

/// Last entry whose timestamp is strictly below `timestamp`.
///
/// Scanning forward from this entry's record reaches the first record with
/// a timestamp `>= timestamp` without skipping any candidate.
pub fn lookup_time(entries: &[TimeIndexEntry], timestamp: i64) -> Option<TimeIndexEntry> {
    let idx = entries.partition_point(|e| e.timestamp < timestamp);
    idx.checked_sub(1).map(|i| entries[i])
}

/// Applies the sparse indexing rule one record at a time.
///
/// Used by both the append path and the index rebuild path, which is what
/// makes a rebuilt index byte-identical to one produced by appends.
#[derive(Debug, Clone)]
pub struct IndexBuilder {
    interval_bytes: u64,
    last_indexed_position: Option<u64>,
    max_timestamp: Option<i64>,
    last_time_entry: Option<i64>,
}

impl IndexBuilder {
    pub fn new(interval_bytes: u64) -> Self {
        Self {
            interval_bytes,
            last_indexed_position: None,
            max_timestamp: None,
            last_time_entry: None,
        }
    }

    /// Rebuilds builder state for a segment that already has `offset_index`
    /// and `time_index` on disk and whose records reach `max_timestamp`.
    pub fn resume(
        interval_bytes: u64,
        offset_index: &[OffsetIndexEntry],
        time_index: &[TimeIndexEntry],
        max_timestamp: Option<i64>,
    ) -> Self {
        Self {
            interval_bytes,
            last_indexed_position: offset_index.last().map(|e| e.position as u64),
            max_timestamp,
            last_time_entry: time_index.last().map(|e| e.timestamp),
        }
    }

    /// Feeds the next record and returns the entries it produces.
    pub fn observe(
        &mut self,
        relative_offset: i32,
        position: u64,
        timestamp: i64,
    ) -> (Option<OffsetIndexEntry>, Option<TimeIndexEntry>) {
        let max_timestamp = match self.max_timestamp {
            Some(current) => current.max(timestamp),
            None => timestamp,
        };
        self.max_timestamp = Some(max_timestamp);

        let is_index_point = match self.last_indexed_position {
            None => true,
            Some(last) => position.saturating_sub(last) >= self.interval_bytes,
        };
        if !is_index_point {
            return (None, None);
        }
        self.last_indexed_position = Some(position);

        let offset_entry = OffsetIndexEntry {
            relative_offset,
            position: position as i32,
        };
        let time_entry = match self.last_time_entry {
            Some(last) if max_timestamp <= last => None,
            _ => {
                self.last_time_entry = Some(max_timestamp);
                Some(TimeIndexEntry {
                    timestamp: max_timestamp,
                    relative_offset,
                })
            }
        };
        (Some(offset_entry), time_entry)
    }

    pub fn max_timestamp(&self) -> Option<i64> {
        self.max_timestamp
    }

    pub fn interval_bytes(&self) -> u64 {
        self.interval_bytes
    }
}
