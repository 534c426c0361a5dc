//! Crash Recovery
//!
//! Recovery brings every segment in a partition directory back to a state
//! where data and indexes agree, then opens a `Log` over what survived.
//!
//! ## Per-segment steps
//!
//! 1. **validate_data**: scan frames from position 0, stop at the first
//!    incomplete, checksum-failing, malformed or out-of-sequence record and
//!    truncate the data file to the end of the last valid record
//! 2. **rebuild_index** / **rebuild_time_index**: regenerate both sparse
//!    indexes from the data and atomically replace the files
//! 3. **verify_consistency**: recompute the expected indexes and compare
//!    them with what is on disk
//!
//! Running recovery twice yields identical files: the second pass finds
//! nothing to truncate and rebuilds byte-identical indexes.
//!
//! ## Failure model
//!
//! Recovery never refuses to start a log because of damaged data. Each
//! segment result carries the errors it hit; segments that cannot be
//! opened afterwards are left out of the log, reported as corrupted and
//! their files renamed to `*.corrupted` so a later roll can reuse the base
//! offset.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::log::Log;
use crate::segment::index::{
    decode_offset_index, decode_time_index, encode_offset_index, encode_time_index,
};
use crate::segment::{
    list_base_offsets, scan_data_file, with_suffix, write_atomic, Segment, SegmentFiles,
};

const CORRUPTED_SUFFIX: &str = ".corrupted";

/// Outcome of recovering one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryResult {
    pub base_offset: i64,
    pub valid_records: i64,
    /// Byte position in the data file where invalid data started.
    pub corruption_offset: Option<u64>,
    pub truncated: bool,
    pub truncated_bytes: u64,
    pub index_rebuilt: bool,
    pub time_index_rebuilt: bool,
    pub consistent: bool,
    pub errors: Vec<String>,
}

/// Outcome of `validate_data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataValidation {
    pub valid_records: i64,
    pub valid_bytes: u64,
    pub corruption_offset: Option<u64>,
    pub truncated_bytes: u64,
}

/// Entry counts compared by `verify_consistency`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub data_records: i64,
    pub index_entries: usize,
    pub time_index_entries: usize,
}

/// Recovery operations for a single segment's files.
pub struct SegmentRecovery {
    files: SegmentFiles,
    index_interval_bytes: u64,
}

impl SegmentRecovery {
    pub fn new(dir: &Path, base_offset: i64, config: &LogConfig) -> Self {
        Self {
            files: SegmentFiles::new(dir, base_offset),
            index_interval_bytes: config.index_interval_bytes,
        }
    }

    pub fn files(&self) -> &SegmentFiles {
        &self.files
    }

    /// Scans the data file and truncates it at the first invalid byte.
    pub fn validate_data(&self) -> Result<DataValidation> {
        let scan = scan_data_file(&self.files, self.index_interval_bytes)?;
        let truncated_bytes = scan.file_len - scan.valid_bytes;

        if let Some(corruption) = &scan.corruption {
            warn!(
                path = ?self.files.data,
                position = corruption.position,
                truncated_bytes,
                reason = %corruption.reason,
                "Truncating segment at invalid record"
            );
            let file = OpenOptions::new().write(true).open(&self.files.data)?;
            file.set_len(scan.valid_bytes)?;
            file.sync_all()?;
        }

        Ok(DataValidation {
            valid_records: scan.records,
            valid_bytes: scan.valid_bytes,
            corruption_offset: scan.corruption.map(|c| c.position),
            truncated_bytes,
        })
    }

    /// Regenerates the offset index from the data file.
    pub fn rebuild_index(&self) -> Result<usize> {
        let scan = self.clean_scan()?;
        write_atomic(&self.files.index, &encode_offset_index(&scan.offset_index))?;
        debug!(path = ?self.files.index, entries = scan.offset_index.len(), "Offset index rebuilt");
        Ok(scan.offset_index.len())
    }

    /// Regenerates the time index from the data file.
    pub fn rebuild_time_index(&self) -> Result<usize> {
        let scan = self.clean_scan()?;
        write_atomic(&self.files.time_index, &encode_time_index(&scan.time_index))?;
        debug!(path = ?self.files.time_index, entries = scan.time_index.len(), "Time index rebuilt");
        Ok(scan.time_index.len())
    }

    /// Checks that both index files match what the data implies.
    pub fn verify_consistency(&self) -> Result<ConsistencyReport> {
        let scan = self.clean_scan()?;
        let index = decode_offset_index(&read_or_empty(&self.files.index)?)?;
        let time_index = decode_time_index(&read_or_empty(&self.files.time_index)?)?;

        if index.len() != scan.offset_index.len() {
            return Err(Error::IndexSizeMismatch(format!(
                "{:?} has {} entries, data implies {}",
                self.files.index,
                index.len(),
                scan.offset_index.len()
            )));
        }
        if index != scan.offset_index {
            return Err(Error::CorruptedIndex(format!(
                "{:?} entries disagree with data",
                self.files.index
            )));
        }
        if time_index.len() != scan.time_index.len() {
            return Err(Error::IndexSizeMismatch(format!(
                "{:?} has {} entries, data implies {}",
                self.files.time_index,
                time_index.len(),
                scan.time_index.len()
            )));
        }
        if time_index != scan.time_index {
            return Err(Error::CorruptedTimeIndex(format!(
                "{:?} entries disagree with data",
                self.files.time_index
            )));
        }

        Ok(ConsistencyReport {
            data_records: scan.records,
            index_entries: index.len(),
            time_index_entries: time_index.len(),
        })
    }

    /// Runs every step and records the outcome. Never fails.
    pub fn recover(&self) -> RecoveryResult {
        let mut result = RecoveryResult {
            base_offset: self.files.base_offset,
            ..Default::default()
        };

        match self.validate_data() {
            Ok(validation) => {
                result.valid_records = validation.valid_records;
                result.corruption_offset = validation.corruption_offset;
                result.truncated = validation.truncated_bytes > 0;
                result.truncated_bytes = validation.truncated_bytes;
            }
            Err(e) => {
                result.errors.push(format!("validate data: {}", e));
                return result;
            }
        }

        match self.rebuild_index() {
            Ok(_) => result.index_rebuilt = true,
            Err(e) => result.errors.push(format!("rebuild index: {}", e)),
        }
        match self.rebuild_time_index() {
            Ok(_) => result.time_index_rebuilt = true,
            Err(e) => result.errors.push(format!("rebuild time index: {}", e)),
        }
        match self.verify_consistency() {
            Ok(_) => result.consistent = true,
            Err(e) => result.errors.push(format!("verify consistency: {}", e)),
        }

        result
    }

    fn clean_scan(&self) -> Result<crate::segment::ScanSummary> {
        let scan = scan_data_file(&self.files, self.index_interval_bytes)?;
        if let Some(corruption) = &scan.corruption {
            if corruption.incomplete {
                return Err(Error::IncompleteRecord {
                    position: corruption.position,
                });
            }
            return Err(Error::CorruptedSegment(format!(
                "{:?} at position {}: {}",
                self.files.data, corruption.position, corruption.reason
            )));
        }
        Ok(scan)
    }
}

/// Moves a segment's files aside so its base offset is free again.
fn quarantine(files: &SegmentFiles) -> Result<()> {
    for path in files.all() {
        match fs::rename(path, with_suffix(path, CORRUPTED_SUFFIX)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
    }
    warn!(base_offset = files.base_offset, path = ?files.data, "Segment quarantined");
    Ok(())
}

fn read_or_empty(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Aggregate outcome of recovering a partition directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogRecoveryResult {
    pub segments: Vec<RecoveryResult>,
    pub total_valid_records: i64,
    pub total_truncated_bytes: u64,
    /// Base offsets of segments whose data was truncated.
    pub truncated_segments: Vec<i64>,
    /// Truncated segments that were not the last one. Offsets inside the
    /// lost range are unreadable.
    pub non_final_truncations: Vec<i64>,
    /// Segments that could not be made consistent or opened.
    pub corrupted_segments: Vec<i64>,
}

impl LogRecoveryResult {
    /// No segment needed truncation or failed.
    pub fn is_clean(&self) -> bool {
        self.truncated_segments.is_empty() && self.corrupted_segments.is_empty()
    }
}

/// Recovers every segment in `dir` and opens a log over the survivors.
///
/// Damaged data is truncated or excluded, never fatal. Only failures to
/// list or create the directory, or to move excluded segments aside, are
/// returned as errors.
pub fn recover_from_directory(
    dir: impl AsRef<Path>,
    config: LogConfig,
) -> Result<(Log, LogRecoveryResult)> {
    let dir = dir.as_ref();
    config.validate()?;
    fs::create_dir_all(dir)?;

    let base_offsets = list_base_offsets(dir)?;
    let mut result = LogRecoveryResult::default();
    let mut segments = Vec::with_capacity(base_offsets.len());
    let last_base = base_offsets.last().copied();

    info!(dir = ?dir, segments = base_offsets.len(), "Recovering log");

    for base_offset in base_offsets.iter().copied() {
        let recovery = SegmentRecovery::new(dir, base_offset, &config);
        let segment_result = recovery.recover();

        result.total_valid_records += segment_result.valid_records;
        result.total_truncated_bytes += segment_result.truncated_bytes;
        if segment_result.truncated {
            result.truncated_segments.push(base_offset);
            if Some(base_offset) != last_base {
                warn!(
                    base_offset,
                    truncated_bytes = segment_result.truncated_bytes,
                    "Non-final segment truncated, later offsets in this segment are lost"
                );
                result.non_final_truncations.push(base_offset);
            }
        }

        let opened = if segment_result.consistent {
            match Segment::open(dir, base_offset, &config) {
                Ok(segment) => Some(segment),
                Err(e) => {
                    warn!(base_offset, error = %e, "Recovered segment failed to open");
                    None
                }
            }
        } else {
            warn!(base_offset, errors = ?segment_result.errors, "Segment left inconsistent by recovery");
            None
        };

        match opened {
            Some(segment) => segments.push(segment),
            None => {
                quarantine(recovery.files())?;
                result.corrupted_segments.push(base_offset);
            }
        }
        result.segments.push(segment_result);
    }

    if segments.is_empty() {
        // Start past the last excluded base offset.
        let base = last_base.map(|b| b + 1).unwrap_or(0);
        if last_base.is_some() {
            warn!(dir = ?dir, base_offset = base, "No usable segments, starting a fresh segment");
        }
        segments.push(Segment::create(dir, base, &config)?);
    }

    info!(
        dir = ?dir,
        segments = segments.len(),
        valid_records = result.total_valid_records,
        truncated_bytes = result.total_truncated_bytes,
        corrupted = result.corrupted_segments.len(),
        "Log recovery complete"
    );

    let log = Log::from_segments(dir, config, segments)?;
    Ok((log, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::Write;
    use tempfile::TempDir;
    use tributary_core::Record;

    fn config() -> LogConfig {
        LogConfig {
            max_segment_bytes: 1 << 20,
            ..Default::default()
        }
    }

    fn write_segment(dir: &Path, base_offset: i64, count: i64) -> SegmentFiles {
        let mut segment = Segment::create(dir, base_offset, &config()).unwrap();
        for i in 0..count {
            let mut record =
                Record::new(None, Bytes::from(vec![1u8; 64])).with_timestamp(1_000 + i);
            segment.append(&mut record).unwrap();
        }
        segment.seal().unwrap();
        segment.files().clone()
    }

    #[test]
    fn test_validate_truncates_partial_tail() {
        let dir = TempDir::new().unwrap();
        let files = write_segment(dir.path(), 0, 10);
        let mut file = OpenOptions::new().append(true).open(&files.data).unwrap();
        file.write_all(&[0, 0, 0, 90, 1, 2, 3]).unwrap();

        let recovery = SegmentRecovery::new(dir.path(), 0, &config());
        let validation = recovery.validate_data().unwrap();
        assert_eq!(validation.valid_records, 10);
        assert_eq!(validation.valid_bytes, 1000);
        assert_eq!(validation.corruption_offset, Some(1000));
        assert_eq!(validation.truncated_bytes, 7);
        assert_eq!(fs::metadata(&files.data).unwrap().len(), 1000);
    }

    #[test]
    fn test_rebuild_matches_append_path() {
        let dir = TempDir::new().unwrap();
        let files = write_segment(dir.path(), 0, 300);
        let original_index = fs::read(&files.index).unwrap();
        let original_time_index = fs::read(&files.time_index).unwrap();

        fs::remove_file(&files.index).unwrap();
        fs::write(&files.time_index, b"garbage").unwrap();

        let recovery = SegmentRecovery::new(dir.path(), 0, &config());
        recovery.rebuild_index().unwrap();
        recovery.rebuild_time_index().unwrap();

        assert_eq!(fs::read(&files.index).unwrap(), original_index);
        assert_eq!(fs::read(&files.time_index).unwrap(), original_time_index);
    }

    #[test]
    fn test_verify_reports_size_mismatch() {
        let dir = TempDir::new().unwrap();
        let files = write_segment(dir.path(), 0, 300);
        let index = fs::read(&files.index).unwrap();
        fs::write(&files.index, &index[..index.len() - 8]).unwrap();

        let recovery = SegmentRecovery::new(dir.path(), 0, &config());
        assert!(matches!(
            recovery.verify_consistency(),
            Err(Error::IndexSizeMismatch(_))
        ));
    }

    #[test]
    fn test_recover_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let files = write_segment(dir.path(), 0, 50);
        let mut file = OpenOptions::new().append(true).open(&files.data).unwrap();
        file.write_all(&[0xFF; 13]).unwrap();

        let recovery = SegmentRecovery::new(dir.path(), 0, &config());
        let first = recovery.recover();
        assert!(first.truncated);
        assert!(first.consistent);
        assert_eq!(first.valid_records, 50);

        let snapshot = |f: &SegmentFiles| {
            (
                fs::read(&f.data).unwrap(),
                fs::read(&f.index).unwrap(),
                fs::read(&f.time_index).unwrap(),
            )
        };
        let after_first = snapshot(&files);

        let second = recovery.recover();
        assert!(!second.truncated);
        assert!(second.consistent);
        assert_eq!(second.valid_records, 50);
        assert_eq!(snapshot(&files), after_first);
    }

    #[test]
    fn test_verify_reports_torn_tail_as_incomplete_record() {
        let dir = TempDir::new().unwrap();
        let files = write_segment(dir.path(), 0, 10);
        let mut file = OpenOptions::new().append(true).open(&files.data).unwrap();
        file.write_all(&[0, 0, 0, 90, 1, 2, 3]).unwrap();

        let recovery = SegmentRecovery::new(dir.path(), 0, &config());
        let err = recovery.verify_consistency().unwrap_err();
        assert!(matches!(err, Error::IncompleteRecord { position: 1000 }));
        assert!(err.is_corruption());

        recovery.validate_data().unwrap();
        assert!(recovery.verify_consistency().is_ok());
    }

    #[tokio::test]
    async fn test_unopenable_segment_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let files = write_segment(dir.path(), 0, 5);
        fs::remove_file(&files.index).unwrap();
        fs::create_dir(&files.index).unwrap();

        let (log, result) = recover_from_directory(dir.path(), config()).unwrap();
        assert_eq!(result.corrupted_segments, vec![0]);
        assert!(!files.data.exists());
        assert!(with_suffix(&files.data, CORRUPTED_SUFFIX).exists());
        assert!(with_suffix(&files.index, CORRUPTED_SUFFIX).is_dir());

        // The fresh segment starts past the quarantined one.
        assert_eq!(log.high_water_mark().await.unwrap(), 1);
        assert_eq!(log.append(Record::new(None, Bytes::from("next"))).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_directory_yields_empty_log() {
        let dir = TempDir::new().unwrap();
        let (log, result) = recover_from_directory(dir.path(), config()).unwrap();
        assert!(result.is_clean());
        assert!(result.segments.is_empty());
        assert_eq!(log.num_segments().await, 1);
        assert!(SegmentFiles::new(dir.path(), 0).data.exists());
    }
}
