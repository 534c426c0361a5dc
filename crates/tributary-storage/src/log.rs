//! Partition Log
//!
//! A `Log` is the ordered list of segments for one partition directory.
//! The last segment is active and receives appends; when it reaches
//! `max_segment_bytes` it is sealed and a new segment starts at the next
//! offset.
//!
//! ## Concurrency
//!
//! ```text
//! Log
//! └── RwLock<Vec<Arc<SegmentHandle>>>   write: append, roll, truncate, retention
//!     └── SegmentHandle
//!         └── std RwLock<Option<Segment>> read: lookups, write: append/load
//! ```
//!
//! Readers hold the list lock only long enough to clone the handle they
//! need, so reads of sealed segments proceed in parallel with appends.
//! Segment file I/O runs on the blocking thread pool; the async API never
//! touches the filesystem from a runtime worker.
//!
//! ## Tiering
//!
//! With a `TieredStorageManager` attached, sealed segments may be archived
//! to a remote store. Every read first pins its segment local through the
//! manager (restoring it when needed) and holds the pin until the read is
//! done, so an archive can never delete files under a reader. Segments
//! that are only present remotely appear in the list as unloaded handles
//! and are opened on first use.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock as StdRwLock};

use serde::Serialize;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info};
use tributary_core::Record;

use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::segment::{list_base_offsets, Segment, SegmentFiles};
use crate::tier_manager::TierManager;
use crate::tiered::TieredStorageManager;

/// One entry in the log's segment list.
pub(crate) struct SegmentHandle {
    pub(crate) base_offset: i64,
    pub(crate) files: SegmentFiles,
    segment: StdRwLock<Option<Segment>>,
}

impl SegmentHandle {
    fn loaded(segment: Segment) -> Self {
        Self {
            base_offset: segment.base_offset(),
            files: segment.files().clone(),
            segment: StdRwLock::new(Some(segment)),
        }
    }

    fn unloaded(dir: &Path, base_offset: i64) -> Self {
        Self {
            base_offset,
            files: SegmentFiles::new(dir, base_offset),
            segment: StdRwLock::new(None),
        }
    }

    /// Runs `f` against the segment, opening it from disk if needed.
    pub(crate) fn with_segment<T>(
        &self,
        config: &LogConfig,
        f: impl FnOnce(&Segment) -> Result<T>,
    ) -> Result<T> {
        {
            let guard = self.segment.read().unwrap_or_else(|e| e.into_inner());
            if let Some(segment) = guard.as_ref() {
                return f(segment);
            }
        }
        let mut guard = self.segment.write().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            let dir = self.files.data.parent().unwrap_or(Path::new("."));
            *guard = Some(Segment::open(dir, self.base_offset, config)?);
        }
        match guard.as_ref() {
            Some(segment) => f(segment),
            None => Err(Error::SegmentNotFound(format!("{:?}", self.files.data))),
        }
    }

    pub(crate) fn with_segment_mut<T>(&self, f: impl FnOnce(&mut Segment) -> Result<T>) -> Result<T> {
        let mut guard = self.segment.write().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(segment) => f(segment),
            None => Err(Error::SegmentNotFound(format!("{:?}", self.files.data))),
        }
    }

    /// Reads a value from the in-memory segment without touching disk.
    pub(crate) fn peek<T>(&self, f: impl FnOnce(&Segment) -> T) -> Option<T> {
        let guard = self.segment.read().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(f)
    }

    /// Drops the in-memory segment and deletes its local files.
    pub(crate) fn remove_local(&self) -> Result<()> {
        let mut guard = self.segment.write().unwrap_or_else(|e| e.into_inner());
        *guard = None;
        self.files.remove()
    }
}

/// Tiered storage wired into a log.
pub(crate) struct Tiering {
    pub(crate) storage: Arc<TieredStorageManager>,
    pub(crate) tier_manager: Option<Arc<TierManager>>,
}

impl Tiering {
    pub(crate) fn key(&self, files: &SegmentFiles) -> Result<String> {
        self.storage.segment_key(&files.data)
    }
}

/// Summary of one segment, as reported by `Log::segments`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentInfo {
    pub base_offset: i64,
    pub next_offset: i64,
    pub size_bytes: u64,
    pub active: bool,
    pub archived: bool,
}

/// A segment pinned local for the duration of a snapshot copy.
pub(crate) struct PinnedSegment {
    pub(crate) files: SegmentFiles,
    pub(crate) data_len: u64,
    pub(crate) index_len: u64,
    pub(crate) time_index_len: u64,
    pub(crate) _pin: Option<OwnedRwLockReadGuard<()>>,
}

/// Point-in-time view of a log for snapshotting.
pub(crate) struct SnapshotView {
    pub(crate) log_start_offset: i64,
    pub(crate) high_water_mark: i64,
    pub(crate) segments: Vec<PinnedSegment>,
}

/// An append-only partition log made of segments.
pub struct Log {
    pub(crate) dir: PathBuf,
    pub(crate) config: LogConfig,
    pub(crate) segments: RwLock<Vec<Arc<SegmentHandle>>>,
    pub(crate) tiering: Option<Tiering>,
}

impl Log {
    /// Opens the log in `dir`, creating the directory and a first segment
    /// if needed. Fails on any inconsistency; use
    /// `recovery::recover_from_directory` after an unclean shutdown.
    pub fn open(dir: impl AsRef<Path>, config: LogConfig) -> Result<Self> {
        let dir = dir.as_ref();
        config.validate()?;
        fs::create_dir_all(dir)?;

        let mut segments = Vec::new();
        for base_offset in list_base_offsets(dir)? {
            segments.push(Segment::open(dir, base_offset, &config)?);
        }
        if segments.is_empty() {
            segments.push(Segment::create(dir, 0, &config)?);
        }

        info!(dir = ?dir, segments = segments.len(), "Log opened");
        Self::from_segments(dir, config, segments)
    }

    pub(crate) fn from_segments(dir: &Path, config: LogConfig, segments: Vec<Segment>) -> Result<Self> {
        if segments.is_empty() {
            return Err(Error::SegmentNotFound(format!("no segments in {:?}", dir)));
        }
        let handles = segments
            .into_iter()
            .map(|s| Arc::new(SegmentHandle::loaded(s)))
            .collect();
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            segments: RwLock::new(handles),
            tiering: None,
        })
    }

    /// Connects the log to tiered storage.
    ///
    /// Sealed local segments are registered with `storage`. Segments that
    /// exist only in the remote store (archived before a restart) are added
    /// to the segment list as unloaded entries.
    pub async fn attach_tiering(
        &mut self,
        storage: Arc<TieredStorageManager>,
        tier_manager: Option<Arc<TierManager>>,
    ) -> Result<()> {
        let segments = self.segments.get_mut();
        let active_base = segments.last().map(|h| h.base_offset).unwrap_or(0);

        for handle in segments.iter().take(segments.len().saturating_sub(1)) {
            storage.track_segment(&handle.files.data)?;
        }

        let mut discovered = 0;
        for archived in storage.archived_segments(&self.dir).await? {
            if archived.base_offset >= active_base
                || segments.iter().any(|h| h.base_offset == archived.base_offset)
            {
                continue;
            }
            let files = SegmentFiles::new(&self.dir, archived.base_offset);
            storage.track_archived(&files.data, archived.size_bytes, archived.last_modified_ms)?;
            segments.push(Arc::new(SegmentHandle::unloaded(&self.dir, archived.base_offset)));
            discovered += 1;
        }
        segments.sort_by_key(|h| h.base_offset);

        info!(dir = ?self.dir, discovered, "Tiered storage attached");
        self.tiering = Some(Tiering {
            storage,
            tier_manager,
        });
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Appends a record and returns its offset.
    pub async fn append(&self, record: Record) -> Result<i64> {
        let mut segments = self.segments.write().await;
        self.append_locked(&mut segments, record).await
    }

    /// Appends records in order under a single lock and returns their
    /// offsets. On error, records before the failing one stay appended.
    pub async fn append_batch(&self, records: Vec<Record>) -> Result<Vec<i64>> {
        let mut segments = self.segments.write().await;
        let mut offsets = Vec::with_capacity(records.len());
        for record in records {
            offsets.push(self.append_locked(&mut segments, record).await?);
        }
        Ok(offsets)
    }

    async fn append_locked(&self, segments: &mut Vec<Arc<SegmentHandle>>, mut record: Record) -> Result<i64> {
        self.roll_if_full(segments).await?;
        let active = Arc::clone(active(segments)?);
        run_blocking(move || active.with_segment_mut(|s| s.append(&mut record))).await
    }

    async fn roll_if_full(&self, segments: &mut Vec<Arc<SegmentHandle>>) -> Result<()> {
        let current = Arc::clone(active(segments)?);
        if current.peek(|s| s.is_full()) == Some(false) {
            return Ok(());
        }

        let (dir, config, sealing) = (self.dir.clone(), self.config.clone(), Arc::clone(&current));
        let created = run_blocking(move || {
            let (full, next_offset) = sealing.with_segment(&config, |s| Ok((s.is_full(), s.next_offset())))?;
            if !full {
                return Ok(None);
            }
            sealing.with_segment_mut(|s| s.seal())?;
            Segment::create(&dir, next_offset, &config).map(Some)
        })
        .await?;
        let Some(segment) = created else {
            return Ok(());
        };
        let next_offset = segment.base_offset();
        info!(
            dir = ?self.dir,
            sealed_base = current.base_offset,
            new_base = next_offset,
            "Rolled segment"
        );

        if let Some(tiering) = &self.tiering {
            tiering.storage.track_segment(&current.files.data)?;
        }
        segments.push(Arc::new(SegmentHandle::loaded(segment)));
        Ok(())
    }

    /// Reads the record at `offset`.
    pub async fn read(&self, offset: i64) -> Result<Record> {
        let handle = self.locate(offset).await?;
        let _pin = self.pin(&handle).await?;
        let record = self.on_segment(&handle, move |s| s.read(offset)).await?;
        self.record_access(&handle, record.encoded_size() as u64);
        Ok(record)
    }

    /// Reads records from `offset` up to roughly `max_bytes`, stopping at the
    /// end of the segment that contains `offset`. Returns an empty list when
    /// `offset` equals the high-water mark.
    pub async fn read_range(&self, offset: i64, max_bytes: usize) -> Result<Vec<Record>> {
        if offset == self.high_water_mark().await? {
            return Ok(Vec::new());
        }
        let handle = self.locate(offset).await?;
        let _pin = self.pin(&handle).await?;
        let records = self
            .on_segment(&handle, move |s| s.read_range(offset, max_bytes))
            .await?;
        let bytes = records.iter().map(|r| r.encoded_size() as u64).sum();
        self.record_access(&handle, bytes);
        Ok(records)
    }

    /// First offset whose timestamp is `>= timestamp`, if any.
    pub async fn find_offset_by_timestamp(&self, timestamp: i64) -> Result<Option<i64>> {
        let handles = self.segments.read().await.clone();
        for handle in handles {
            // Loaded segments can be ruled out from memory.
            if let Some(max) = handle.peek(|s| s.max_timestamp()) {
                if max.map_or(true, |m| m < timestamp) {
                    continue;
                }
            }
            let _pin = self.pin(&handle).await?;
            if let Some(offset) = self
                .on_segment(&handle, move |s| s.find_offset_by_timestamp(timestamp))
                .await?
            {
                return Ok(Some(offset));
            }
        }
        Ok(None)
    }

    /// Discards every record at or after `offset`.
    pub async fn truncate_to(&self, offset: i64) -> Result<()> {
        let mut segments = self.segments.write().await;
        let hwm = high_water_mark(&segments)?;
        let start = log_start(&segments)?;
        if offset >= hwm {
            return Ok(());
        }
        if offset < start {
            return Err(Error::OffsetOutOfRange {
                offset,
                start,
                end: hwm,
            });
        }

        let idx = segments.partition_point(|h| h.base_offset <= offset) - 1;
        for handle in segments.drain(idx + 1..).collect::<Vec<_>>() {
            self.forget_tiered(&handle).await?;
            let base_offset = handle.base_offset;
            run_blocking(move || handle.remove_local()).await?;
            debug!(base_offset, "Deleted segment past truncation point");
        }

        let target = Arc::clone(&segments[idx]);
        if let Some(tiering) = &self.tiering {
            // The target becomes active again and must be local and untracked.
            let pin = tiering.storage.acquire_local(&tiering.key(&target.files)?).await?;
            drop(pin);
            self.forget_tiered(&target).await?;
        }
        let config = self.config.clone();
        run_blocking(move || {
            target.with_segment(&config, |_| Ok(()))?;
            target.with_segment_mut(|s| s.truncate_to(offset))
        })
        .await?;

        info!(dir = ?self.dir, offset, "Log truncated");
        Ok(())
    }

    /// Removes a segment from tiered storage tracking, deleting remote copies.
    pub(crate) async fn forget_tiered(&self, handle: &SegmentHandle) -> Result<()> {
        if let Some(tiering) = &self.tiering {
            let key = tiering.key(&handle.files)?;
            tiering.storage.remove_segment(&key).await?;
            if let Some(tier_manager) = &tiering.tier_manager {
                tier_manager.forget(&key);
            }
        }
        Ok(())
    }

    /// Syncs the active segment to disk.
    pub async fn flush(&self) -> Result<()> {
        let segments = self.segments.read().await;
        self.on_segment(active(&segments)?, |s| s.flush()).await
    }

    /// Flushes and releases the active segment's write handles.
    pub async fn close(&self) -> Result<()> {
        let segments = self.segments.write().await;
        let active = Arc::clone(active(&segments)?);
        run_blocking(move || active.with_segment_mut(|s| s.seal())).await?;
        info!(dir = ?self.dir, "Log closed");
        Ok(())
    }

    /// Offset the next append will receive.
    pub async fn high_water_mark(&self) -> Result<i64> {
        high_water_mark(&*self.segments.read().await)
    }

    /// Lowest offset still stored.
    pub async fn log_start_offset(&self) -> Result<i64> {
        log_start(&*self.segments.read().await)
    }

    pub async fn num_segments(&self) -> usize {
        self.segments.read().await.len()
    }

    /// Total bytes of segment data, local or archived.
    pub async fn size(&self) -> u64 {
        self.segments().await.iter().map(|s| s.size_bytes).sum()
    }

    pub async fn segments(&self) -> Vec<SegmentInfo> {
        let handles = self.segments.read().await;
        let count = handles.len();
        handles
            .iter()
            .enumerate()
            .map(|(i, handle)| {
                let next_base = handles.get(i + 1).map(|h| h.base_offset);
                let loaded = handle.peek(|s| (s.next_offset(), s.size()));
                let tracked = self.tiering.as_ref().and_then(|t| {
                    let key = t.key(&handle.files).ok()?;
                    t.storage.segment_metadata(&key)
                });
                let archived = tracked.as_ref().map(|m| m.archived).unwrap_or(false);
                let (next_offset, size_bytes) = match loaded {
                    Some(values) => values,
                    None => (
                        next_base.unwrap_or(handle.base_offset),
                        tracked.map(|m| m.size_bytes).unwrap_or(0),
                    ),
                };
                SegmentInfo {
                    base_offset: handle.base_offset,
                    next_offset,
                    size_bytes,
                    active: i + 1 == count,
                    archived,
                }
            })
            .collect()
    }

    async fn locate(&self, offset: i64) -> Result<Arc<SegmentHandle>> {
        let segments = self.segments.read().await;
        let start = log_start(&segments)?;
        let end = high_water_mark(&segments)?;
        if offset < start || offset >= end {
            return Err(Error::OffsetOutOfRange { offset, start, end });
        }
        let idx = segments.partition_point(|h| h.base_offset <= offset) - 1;
        Ok(Arc::clone(&segments[idx]))
    }

    /// Runs `f` against the segment on the blocking pool.
    async fn on_segment<T, F>(&self, handle: &Arc<SegmentHandle>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Segment) -> Result<T> + Send + 'static,
    {
        let handle = Arc::clone(handle);
        let config = self.config.clone();
        run_blocking(move || handle.with_segment(&config, f)).await
    }

    /// Keeps the segment's files local until the returned guard drops.
    pub(crate) async fn pin(&self, handle: &SegmentHandle) -> Result<Option<OwnedRwLockReadGuard<()>>> {
        match &self.tiering {
            Some(tiering) => tiering.storage.acquire_local(&tiering.key(&handle.files)?).await,
            None => Ok(None),
        }
    }

    fn record_access(&self, handle: &SegmentHandle, bytes: u64) {
        let Some(tiering) = &self.tiering else {
            return;
        };
        let Ok(key) = tiering.key(&handle.files) else {
            return;
        };
        tiering.storage.touch(&key);
        if let Some(tier_manager) = &tiering.tier_manager {
            tier_manager.record_access(&key, bytes);
        }
    }

    /// Flushes the active segment and pins every segment local, capturing
    /// the byte lengths that make up a consistent snapshot.
    pub(crate) async fn snapshot_view(&self) -> Result<SnapshotView> {
        let (handles, active_lens, log_start_offset, high_water_mark) = {
            let segments = self.segments.write().await;
            let active_lens = self
                .on_segment(active(&segments)?, |s| {
                    s.flush()?;
                    Ok((s.size(), s.index_size(), s.time_index_size()))
                })
                .await?;
            (
                segments.clone(),
                active_lens,
                log_start(&segments)?,
                high_water_mark(&segments)?,
            )
        };

        let last = handles.len() - 1;
        let mut pinned = Vec::with_capacity(handles.len());
        for (i, handle) in handles.iter().enumerate() {
            let pin = self.pin(handle).await?;
            let (data_len, index_len, time_index_len) = if i == last {
                active_lens
            } else {
                self.on_segment(handle, |s| Ok((s.size(), s.index_size(), s.time_index_size())))
                    .await?
            };
            pinned.push(PinnedSegment {
                files: handle.files.clone(),
                data_len,
                index_len,
                time_index_len,
                _pin: pin,
            });
        }

        Ok(SnapshotView {
            log_start_offset,
            high_water_mark,
            segments: pinned,
        })
    }
}

/// Runs blocking file I/O off the async worker threads.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

pub(crate) fn active(segments: &[Arc<SegmentHandle>]) -> Result<&Arc<SegmentHandle>> {
    segments
        .last()
        .ok_or_else(|| Error::SegmentNotFound("log has no active segment".to_string()))
}

fn high_water_mark(segments: &[Arc<SegmentHandle>]) -> Result<i64> {
    let active = active(segments)?;
    Ok(active.peek(|s| s.next_offset()).unwrap_or(active.base_offset))
}

fn log_start(segments: &[Arc<SegmentHandle>]) -> Result<i64> {
    segments
        .first()
        .map(|h| h.base_offset)
        .ok_or_else(|| Error::SegmentNotFound("log has no segments".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn config(max_segment_bytes: u64) -> LogConfig {
        LogConfig {
            max_segment_bytes,
            ..Default::default()
        }
    }

    fn record(i: i64) -> Record {
        Record::new(None, Bytes::from(vec![(i % 251) as u8; 64])).with_timestamp(50_000 + i)
    }

    #[tokio::test]
    async fn test_append_assigns_contiguous_offsets() {
        let dir = TempDir::new().unwrap();
        let log = Log::open(dir.path(), config(1 << 20)).unwrap();

        for i in 0..10 {
            assert_eq!(log.append(record(i)).await.unwrap(), i);
        }
        assert_eq!(log.high_water_mark().await.unwrap(), 10);
        assert_eq!(log.log_start_offset().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_segment_io_runs_off_the_runtime_thread() {
        let runtime_thread = std::thread::current().id();
        let io_thread = run_blocking(|| Ok(std::thread::current().id())).await.unwrap();
        assert_ne!(io_thread, runtime_thread);

        // Concurrent appends on a single-threaded runtime stay contiguous.
        let dir = TempDir::new().unwrap();
        let log = Arc::new(Log::open(dir.path(), config(2_000)).unwrap());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    for i in 0..25 {
                        log.append(record(w * 25 + i)).await.unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        assert_eq!(log.high_water_mark().await.unwrap(), 100);
        assert_eq!(log.num_segments().await, 5);
        let offsets: Vec<i64> = log
            .read_range(0, 1 << 20)
            .await
            .unwrap()
            .iter()
            .map(|r| r.offset)
            .collect();
        assert_eq!(offsets, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_roll_on_full_segment() {
        let dir = TempDir::new().unwrap();
        let log = Log::open(dir.path(), config(50_000)).unwrap();

        for i in 0..1000 {
            log.append(record(i)).await.unwrap();
        }

        let segments = log.segments().await;
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].base_offset, 0);
        assert_eq!(segments[0].next_offset, 500);
        assert_eq!(segments[1].base_offset, 500);
        assert!(segments[1].active);
        assert_eq!(log.size().await, 100_000);
    }

    #[tokio::test]
    async fn test_read_across_segments() {
        let dir = TempDir::new().unwrap();
        let log = Log::open(dir.path(), config(5_000)).unwrap();
        for i in 0..200 {
            log.append(record(i)).await.unwrap();
        }

        for offset in [0, 49, 50, 123, 199] {
            let read = log.read(offset).await.unwrap();
            assert_eq!(read.offset, offset);
            assert_eq!(read.timestamp, 50_000 + offset);
        }
    }

    #[tokio::test]
    async fn test_read_out_of_range() {
        let dir = TempDir::new().unwrap();
        let log = Log::open(dir.path(), config(1 << 20)).unwrap();
        log.append(record(0)).await.unwrap();

        assert!(matches!(
            log.read(1).await,
            Err(Error::OffsetOutOfRange { offset: 1, start: 0, end: 1 })
        ));
        assert!(matches!(log.read(-1).await, Err(Error::OffsetOutOfRange { .. })));
        assert!(log.read_range(1, 1024).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_range_stops_at_segment_end() {
        let dir = TempDir::new().unwrap();
        let log = Log::open(dir.path(), config(1_000)).unwrap();
        for i in 0..25 {
            log.append(record(i)).await.unwrap();
        }

        let records = log.read_range(5, 1 << 20).await.unwrap();
        let offsets: Vec<i64> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, (5..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_append_batch() {
        let dir = TempDir::new().unwrap();
        let log = Log::open(dir.path(), config(1_000)).unwrap();

        let offsets = log.append_batch((0..25).map(record).collect()).await.unwrap();
        assert_eq!(offsets, (0..25).collect::<Vec<_>>());
        assert_eq!(log.num_segments().await, 3);
    }

    #[tokio::test]
    async fn test_reopen_preserves_records() {
        let dir = TempDir::new().unwrap();
        {
            let log = Log::open(dir.path(), config(2_000)).unwrap();
            for i in 0..55 {
                log.append(record(i)).await.unwrap();
            }
            log.close().await.unwrap();
        }

        let log = Log::open(dir.path(), config(2_000)).unwrap();
        assert_eq!(log.high_water_mark().await.unwrap(), 55);
        assert_eq!(log.num_segments().await, 3);
        assert_eq!(log.read(42).await.unwrap().timestamp, 50_042);
        assert_eq!(log.append(record(55)).await.unwrap(), 55);
    }

    #[tokio::test]
    async fn test_find_offset_by_timestamp() {
        let dir = TempDir::new().unwrap();
        let log = Log::open(dir.path(), config(2_000)).unwrap();
        for i in 0..100 {
            log.append(record(i)).await.unwrap();
        }

        assert_eq!(log.find_offset_by_timestamp(0).await.unwrap(), Some(0));
        assert_eq!(log.find_offset_by_timestamp(50_077).await.unwrap(), Some(77));
        assert_eq!(log.find_offset_by_timestamp(60_000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncate_to_drops_later_segments() {
        let dir = TempDir::new().unwrap();
        let log = Log::open(dir.path(), config(1_000)).unwrap();
        for i in 0..35 {
            log.append(record(i)).await.unwrap();
        }
        assert_eq!(log.num_segments().await, 4);

        log.truncate_to(13).await.unwrap();
        assert_eq!(log.high_water_mark().await.unwrap(), 13);
        assert_eq!(log.num_segments().await, 2);
        assert!(!SegmentFiles::new(dir.path(), 20).data.exists());

        assert_eq!(log.append(record(99)).await.unwrap(), 13);
        assert_eq!(log.read(13).await.unwrap().timestamp, 50_099);
    }
}
