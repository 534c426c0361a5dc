//! Log Segments
//!
//! A segment is a contiguous run of offsets `[base_offset, next_offset)`
//! persisted as three files named by the zero-padded base offset:
//!
//! ```text
//! 00000000000000000500.log        framed records, back to back
//! 00000000000000000500.index      sparse offset -> byte position
//! 00000000000000000500.timeindex  sparse max timestamp -> offset
//! ```
//!
//! Only the active (last) segment of a log holds write handles. A sealed
//! segment is immutable; every read opens its own file handle, so readers
//! never share a cursor with each other or with the writer.
//!
//! ## Opening
//!
//! `Segment::open` trusts the index files and only scans the data after the
//! last index point to find the next offset. It fails on anything that does
//! not line up; `recovery::SegmentRecovery` is the path that repairs files.

pub mod index;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use tributary_core::{encode_record, FrameReader, Record};

use crate::config::LogConfig;
use crate::error::{Error, Result};
use index::{
    decode_offset_index, decode_time_index, lookup_offset, lookup_time, IndexBuilder,
    OffsetIndexEntry, TimeIndexEntry, OFFSET_ENTRY_SIZE, TIME_ENTRY_SIZE,
};

pub const LOG_SUFFIX: &str = "log";
pub const INDEX_SUFFIX: &str = "index";
pub const TIME_INDEX_SUFFIX: &str = "timeindex";

/// `<base_offset zero-padded to 20 digits>.<suffix>`
pub fn segment_file_name(base_offset: i64, suffix: &str) -> String {
    format!("{:020}.{}", base_offset, suffix)
}

/// Extracts the base offset from a `.log` file name.
pub fn parse_base_offset(file_name: &str) -> Option<i64> {
    let stem = file_name.strip_suffix(".log")?;
    if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Base offsets of every segment data file in `dir`, ascending.
pub fn list_base_offsets(dir: &Path) -> Result<Vec<i64>> {
    let mut offsets = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(base) = entry.file_name().to_str().and_then(parse_base_offset) {
            offsets.push(base);
        }
    }
    offsets.sort_unstable();
    Ok(offsets)
}

/// Paths of the three files that make up one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFiles {
    pub base_offset: i64,
    pub data: PathBuf,
    pub index: PathBuf,
    pub time_index: PathBuf,
}

impl SegmentFiles {
    pub fn new(dir: &Path, base_offset: i64) -> Self {
        Self {
            base_offset,
            data: dir.join(segment_file_name(base_offset, LOG_SUFFIX)),
            index: dir.join(segment_file_name(base_offset, INDEX_SUFFIX)),
            time_index: dir.join(segment_file_name(base_offset, TIME_INDEX_SUFFIX)),
        }
    }

    /// Derives the sibling paths from a `.log` path.
    pub fn from_data_path(data: &Path) -> Option<Self> {
        let base_offset = data.file_name()?.to_str().and_then(parse_base_offset)?;
        let dir = data.parent()?;
        Some(Self::new(dir, base_offset))
    }

    /// Index files first, data file last.
    pub fn all(&self) -> [&Path; 3] {
        [&self.index, &self.time_index, &self.data]
    }

    /// Removes all three files. Missing files are not an error.
    pub fn remove(&self) -> Result<()> {
        for path in self.all() {
            remove_if_exists(path)?;
        }
        Ok(())
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// `path` with `suffix` appended to its file name.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Replaces `path` with `data` via a synced temp file and a rename.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = with_suffix(path, ".tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Where and why a data scan stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corruption {
    pub position: u64,
    pub reason: String,
    /// The last frame runs past the end of the file.
    pub incomplete: bool,
}

/// Result of scanning a data file from the start.
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub records: i64,
    /// Bytes up to the end of the last valid record.
    pub valid_bytes: u64,
    pub file_len: u64,
    pub offset_index: Vec<OffsetIndexEntry>,
    pub time_index: Vec<TimeIndexEntry>,
    pub max_timestamp: Option<i64>,
    /// Set when the scan stopped before the end of the file.
    pub corruption: Option<Corruption>,
}

/// Scans `files.data` from position 0, validating every frame and
/// computing the indexes the data implies.
///
/// Structural problems stop the scan and are reported in the summary;
/// only I/O failures are returned as errors.
pub fn scan_data_file(files: &SegmentFiles, index_interval_bytes: u64) -> Result<ScanSummary> {
    let file = File::open(&files.data)?;
    let file_len = file.metadata()?.len();
    let mut reader = FrameReader::new(BufReader::new(file), 0, file_len);
    let mut builder = IndexBuilder::new(index_interval_bytes);

    let mut summary = ScanSummary {
        records: 0,
        valid_bytes: 0,
        file_len,
        offset_index: Vec::new(),
        time_index: Vec::new(),
        max_timestamp: None,
        corruption: None,
    };

    loop {
        let frame = match reader.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) if e.is_data_error() => {
                summary.corruption = Some(Corruption {
                    position: reader.position(),
                    reason: e.to_string(),
                    incomplete: matches!(e, tributary_core::Error::IncompleteRecord { .. }),
                });
                break;
            }
            Err(e) => return Err(e.into()),
        };

        let expected = files.base_offset + summary.records;
        let relative = i32::try_from(summary.records).ok();
        match relative {
            Some(relative) if frame.record.offset == expected => {
                let (offset_entry, time_entry) =
                    builder.observe(relative, frame.position, frame.record.timestamp);
                summary.offset_index.extend(offset_entry);
                summary.time_index.extend(time_entry);
            }
            _ => {
                summary.corruption = Some(Corruption {
                    position: frame.position,
                    reason: format!(
                        "record offset {} where {} was expected",
                        frame.record.offset, expected
                    ),
                    incomplete: false,
                });
                break;
            }
        }

        summary.records += 1;
        summary.valid_bytes = frame.position + frame.size;
    }

    summary.max_timestamp = builder.max_timestamp();
    Ok(summary)
}

struct SegmentWriter {
    data: File,
    index: File,
    time_index: File,
}

impl SegmentWriter {
    fn open(files: &SegmentFiles) -> Result<Self> {
        let append = |path: &Path| OpenOptions::new().create(true).append(true).open(path);
        Ok(Self {
            data: append(&files.data)?,
            index: append(&files.index)?,
            time_index: append(&files.time_index)?,
        })
    }

    fn sync(&self) -> Result<()> {
        self.data.sync_data()?;
        self.index.sync_data()?;
        self.time_index.sync_data()?;
        Ok(())
    }

    fn write_frame(
        &mut self,
        frame: &[u8],
        offset_entry: Option<OffsetIndexEntry>,
        time_entry: Option<TimeIndexEntry>,
        sync: bool,
    ) -> Result<()> {
        self.data.write_all(frame)?;
        if let Some(entry) = offset_entry {
            let mut buf = Vec::with_capacity(OFFSET_ENTRY_SIZE);
            entry.encode(&mut buf);
            self.index.write_all(&buf)?;
        }
        if let Some(entry) = time_entry {
            let mut buf = Vec::with_capacity(TIME_ENTRY_SIZE);
            entry.encode(&mut buf);
            self.time_index.write_all(&buf)?;
        }
        if sync {
            self.sync()?;
        }
        Ok(())
    }
}

/// A single segment of a partition log.
pub struct Segment {
    files: SegmentFiles,
    base_offset: i64,
    next_offset: i64,
    size: u64,
    max_bytes: u64,
    flush_on_append: bool,
    offset_index: Vec<OffsetIndexEntry>,
    time_index: Vec<TimeIndexEntry>,
    builder: IndexBuilder,
    writer: Option<SegmentWriter>,
    /// Set when a failed append could not be rolled back. Appends are
    /// refused until the segment is reopened through recovery.
    fenced: bool,
}

impl Segment {
    /// Creates a new, empty segment. Fails if a data file already exists.
    pub fn create(dir: &Path, base_offset: i64, config: &LogConfig) -> Result<Self> {
        let files = SegmentFiles::new(dir, base_offset);
        OpenOptions::new().write(true).create_new(true).open(&files.data)?;
        File::create(&files.index)?;
        File::create(&files.time_index)?;

        debug!(base_offset, path = ?files.data, "Segment created");

        let writer = SegmentWriter::open(&files)?;
        Ok(Self {
            files,
            base_offset,
            next_offset: base_offset,
            size: 0,
            max_bytes: config.max_segment_bytes,
            flush_on_append: config.flush_on_append,
            offset_index: Vec::new(),
            time_index: Vec::new(),
            builder: IndexBuilder::new(config.index_interval_bytes),
            writer: Some(writer),
            fenced: false,
        })
    }

    /// Opens an existing segment without write handles.
    pub fn open(dir: &Path, base_offset: i64, config: &LogConfig) -> Result<Self> {
        let files = SegmentFiles::new(dir, base_offset);
        let size = fs::metadata(&files.data)?.len();

        let offset_index = match fs::read(&files.index) {
            Ok(data) => decode_offset_index(&data)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound && size == 0 => Vec::new(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::CorruptedIndex(format!("{:?} is missing", files.index)))
            }
            Err(e) => return Err(e.into()),
        };
        let time_index = match fs::read(&files.time_index) {
            Ok(data) => decode_time_index(&data)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound && size == 0 => Vec::new(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::CorruptedTimeIndex(format!(
                    "{:?} is missing",
                    files.time_index
                )))
            }
            Err(e) => return Err(e.into()),
        };

        if size > 0 && offset_index.first().map(|e| (e.relative_offset, e.position)) != Some((0, 0)) {
            return Err(Error::CorruptedIndex(format!(
                "{:?} does not start at the first record",
                files.index
            )));
        }
        if let Some(last) = offset_index.last() {
            if last.position as u64 >= size {
                return Err(Error::CorruptedIndex(format!(
                    "entry {:?} points past end of data ({} bytes)",
                    last, size
                )));
            }
        }

        // Scan only the records after the last index point.
        let start = offset_index.last().copied().unwrap_or(OffsetIndexEntry {
            relative_offset: 0,
            position: 0,
        });
        let mut file = File::open(&files.data)?;
        file.seek(SeekFrom::Start(start.position as u64))?;
        let mut reader = FrameReader::new(BufReader::new(file), start.position as u64, size);

        let mut next_offset = base_offset + start.relative_offset as i64;
        let mut max_timestamp = time_index.last().map(|e| e.timestamp);
        while let Some(frame) = reader.next_frame()? {
            if frame.record.offset != next_offset {
                return Err(Error::CorruptedSegment(format!(
                    "{:?}: record at position {} has offset {}, expected {}",
                    files.data, frame.position, frame.record.offset, next_offset
                )));
            }
            max_timestamp = Some(max_timestamp.map_or(frame.record.timestamp, |m| {
                m.max(frame.record.timestamp)
            }));
            next_offset += 1;
        }

        let builder = IndexBuilder::resume(
            config.index_interval_bytes,
            &offset_index,
            &time_index,
            max_timestamp,
        );

        debug!(base_offset, next_offset, size, "Segment opened");

        Ok(Self {
            files,
            base_offset,
            next_offset,
            size,
            max_bytes: config.max_segment_bytes,
            flush_on_append: config.flush_on_append,
            offset_index,
            time_index,
            builder,
            writer: None,
            fenced: false,
        })
    }

    /// Appends `record`, assigning it the next offset.
    ///
    /// A failed append leaves no trace: data and index files are cut back
    /// to their previous lengths and the offset is handed out again.
    pub fn append(&mut self, record: &mut Record) -> Result<i64> {
        if self.fenced {
            return Err(Error::CorruptedSegment(format!(
                "{:?} is fenced after a failed append",
                self.files.data
            )));
        }
        if self.is_full() {
            return Err(Error::SegmentFull {
                base_offset: self.base_offset,
            });
        }
        let relative = i32::try_from(self.next_offset - self.base_offset).map_err(|_| {
            Error::SegmentFull {
                base_offset: self.base_offset,
            }
        })?;

        record.offset = self.next_offset;
        let mut buf = Vec::with_capacity(record.encoded_size());
        let len = encode_record(record, &mut buf)? as u64;
        if self.size + len > i32::MAX as u64 {
            return Err(Error::SegmentFull {
                base_offset: self.base_offset,
            });
        }

        if self.writer.is_none() {
            self.writer = Some(SegmentWriter::open(&self.files)?);
        }
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => return Err(Error::SegmentNotFound(format!("{:?}", self.files.data))),
        };

        let position = self.size;
        let builder = self.builder.clone();
        let (offset_entry, time_entry) = self.builder.observe(relative, position, record.timestamp);
        if let Err(e) = writer.write_frame(&buf, offset_entry, time_entry, self.flush_on_append) {
            self.builder = builder;
            self.roll_back_to(position);
            return Err(e);
        }
        self.offset_index.extend(offset_entry);
        self.time_index.extend(time_entry);

        self.size += len;
        self.next_offset += 1;
        Ok(record.offset)
    }

    /// Reads the record at `offset`.
    pub fn read(&self, offset: i64) -> Result<Record> {
        self.read_range(offset, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| self.missing(offset))
    }

    /// Reads records starting at `offset` until adding the next record
    /// would exceed `max_bytes`. At least one record is always returned.
    pub fn read_range(&self, offset: i64, max_bytes: usize) -> Result<Vec<Record>> {
        if offset < self.base_offset || offset >= self.next_offset {
            return Err(Error::OffsetOutOfRange {
                offset,
                start: self.base_offset,
                end: self.next_offset,
            });
        }
        let relative = (offset - self.base_offset) as i32;
        let start = lookup_offset(&self.offset_index, relative)
            .map(|e| e.position as u64)
            .unwrap_or(0);

        let mut reader = self.reader_at(start)?;
        let mut records = Vec::new();
        let mut total = 0usize;
        while let Some(frame) = reader.next_frame()? {
            if frame.record.offset < offset {
                continue;
            }
            let size = frame.size as usize;
            if !records.is_empty() && total + size > max_bytes {
                break;
            }
            total += size;
            records.push(frame.record);
            if total >= max_bytes {
                break;
            }
        }

        if records.is_empty() {
            return Err(self.missing(offset));
        }
        Ok(records)
    }

    /// First offset whose record timestamp is `>= timestamp`.
    pub fn find_offset_by_timestamp(&self, timestamp: i64) -> Result<Option<i64>> {
        if self.max_timestamp().map_or(true, |max| max < timestamp) {
            return Ok(None);
        }
        let start = lookup_time(&self.time_index, timestamp)
            .and_then(|e| lookup_offset(&self.offset_index, e.relative_offset))
            .map(|e| e.position as u64)
            .unwrap_or(0);

        let mut reader = self.reader_at(start)?;
        while let Some(frame) = reader.next_frame()? {
            if frame.record.timestamp >= timestamp {
                return Ok(Some(frame.record.offset));
            }
        }
        Ok(None)
    }

    /// Drops every record at or after `offset`.
    pub fn truncate_to(&mut self, offset: i64) -> Result<()> {
        if offset >= self.next_offset {
            return Ok(());
        }
        if offset < self.base_offset {
            return Err(Error::OffsetOutOfRange {
                offset,
                start: self.base_offset,
                end: self.next_offset,
            });
        }

        let relative = (offset - self.base_offset) as i32;
        let position = if offset == self.base_offset {
            0
        } else {
            let start = lookup_offset(&self.offset_index, relative)
                .map(|e| e.position as u64)
                .unwrap_or(0);
            let mut reader = self.reader_at(start)?;
            let mut found = None;
            while let Some(frame) = reader.next_frame()? {
                if frame.record.offset == offset {
                    found = Some(frame.position);
                    break;
                }
            }
            found.ok_or_else(|| self.missing(offset))?
        };

        self.writer = None;
        let kept_offsets = self
            .offset_index
            .iter()
            .take_while(|e| e.relative_offset < relative)
            .count();
        let kept_times = self
            .time_index
            .iter()
            .take_while(|e| e.relative_offset < relative)
            .count();

        truncate_file(&self.files.data, position)?;
        truncate_file(&self.files.index, (kept_offsets * OFFSET_ENTRY_SIZE) as u64)?;
        truncate_file(&self.files.time_index, (kept_times * TIME_ENTRY_SIZE) as u64)?;

        let dir = self
            .files
            .data
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let config = LogConfig {
            max_segment_bytes: self.max_bytes,
            index_interval_bytes: self.builder_interval(),
            flush_on_append: self.flush_on_append,
        };
        *self = Segment::open(&dir, self.base_offset, &config)?;

        debug!(base_offset = self.base_offset, offset, position, "Segment truncated");
        Ok(())
    }

    /// Syncs data and index files to disk.
    pub fn flush(&self) -> Result<()> {
        if let Some(writer) = &self.writer {
            writer.sync()?;
        }
        Ok(())
    }

    /// Flushes and releases the write handles.
    pub fn seal(&mut self) -> Result<()> {
        self.flush()?;
        self.writer = None;
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.size >= self.max_bytes
    }

    pub fn is_sealed(&self) -> bool {
        self.writer.is_none()
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    pub fn record_count(&self) -> i64 {
        self.next_offset - self.base_offset
    }

    /// Size of the data file in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn index_size(&self) -> u64 {
        (self.offset_index.len() * OFFSET_ENTRY_SIZE) as u64
    }

    pub fn time_index_size(&self) -> u64 {
        (self.time_index.len() * TIME_ENTRY_SIZE) as u64
    }

    pub fn max_timestamp(&self) -> Option<i64> {
        self.builder.max_timestamp()
    }

    pub fn offset_index(&self) -> &[OffsetIndexEntry] {
        &self.offset_index
    }

    pub fn time_index(&self) -> &[TimeIndexEntry] {
        &self.time_index
    }

    pub fn files(&self) -> &SegmentFiles {
        &self.files
    }

    /// Cuts all three files back to the state before a failed append.
    fn roll_back_to(&mut self, position: u64) {
        self.writer = None;
        let result = truncate_file(&self.files.data, position)
            .and_then(|_| truncate_file(&self.files.index, self.index_size()))
            .and_then(|_| truncate_file(&self.files.time_index, self.time_index_size()));
        match result {
            Ok(()) => debug!(base_offset = self.base_offset, position, "Failed append rolled back"),
            Err(e) => {
                warn!(
                    base_offset = self.base_offset,
                    position,
                    error = %e,
                    "Failed to roll back append, fencing segment"
                );
                self.fenced = true;
            }
        }
    }

    fn builder_interval(&self) -> u64 {
        self.builder.interval_bytes()
    }

    fn reader_at(&self, position: u64) -> Result<FrameReader<BufReader<File>>> {
        let mut file = File::open(&self.files.data)?;
        file.seek(SeekFrom::Start(position))?;
        Ok(FrameReader::new(BufReader::new(file), position, self.size))
    }

    fn missing(&self, offset: i64) -> Error {
        Error::CorruptedSegment(format!(
            "offset {} not found in {:?} despite being in range",
            offset, self.files.data
        ))
    }
}

fn truncate_file(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}
