//! Log Snapshots
//!
//! A snapshot is a point-in-time copy of every segment file of a log,
//! stored under `<log_dir>/.snapshots/<id>/` and described by an entry in
//! `<log_dir>/.snapshots/snapshots.json`.
//!
//! ## Consistency
//!
//! Creating a snapshot takes the log's write lock just long enough to flush
//! the active segment and record its byte lengths; only those prefixes are
//! copied, so appends that race the copy are simply not included. Sealed
//! segments are pinned local for the whole copy so tiered storage cannot
//! archive them halfway through.
//!
//! Snapshots are all-or-nothing: files are copied into `<id>.tmp/` and the
//! directory is renamed into place only after every file is complete.
//! Leftover `.tmp` directories from a crash are removed on open.
//!
//! ## Usage
//!
//! ```ignore
//! let snapshots = SnapshotManager::open(log.dir(), SnapshotPolicy::default())?;
//! let snapshot = snapshots.create_snapshot(&log).await?;
//!
//! // Later, on another node or after data loss:
//! let (log, recovery) = snapshots
//!     .open_restored(&snapshot.id, "/data/orders-0", LogConfig::default())
//!     .await?;
//! ```

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{duration_ms, LogConfig};
use crate::error::{Error, Result};
use crate::log::Log;
use crate::now_ms;
use crate::recovery::{recover_from_directory, LogRecoveryResult};
use crate::segment::{list_base_offsets, write_atomic, with_suffix, SegmentFiles};

pub const SNAPSHOT_DIR: &str = ".snapshots";
const INDEX_FILE: &str = "snapshots.json";
const TMP_SUFFIX: &str = ".tmp";

/// Metadata of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    /// Creation time, milliseconds since epoch.
    pub timestamp: i64,
    /// Log start offset at capture time.
    pub base_offset: i64,
    pub high_water_mark: i64,
    pub num_segments: usize,
    /// Bytes copied, data and indexes.
    pub total_size: u64,
    pub segment_offsets: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    /// Snapshots kept by cleanup, newest first (default: 5).
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,

    /// Snapshots older than this are removed by cleanup (default: 24 hours).
    #[serde(default = "default_retention_time", with = "duration_ms")]
    pub retention_time: Duration,

    /// Minimum time between two snapshots (default: 1 hour).
    #[serde(default = "default_min_interval", with = "duration_ms")]
    pub min_interval: Duration,
}

fn default_max_snapshots() -> usize {
    5
}

fn default_retention_time() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_min_interval() -> Duration {
    Duration::from_secs(3600)
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            max_snapshots: default_max_snapshots(),
            retention_time: default_retention_time(),
            min_interval: default_min_interval(),
        }
    }
}

/// One file to copy: `len` bytes from `src` to `dst`.
struct CopyJob {
    src: PathBuf,
    dst: PathBuf,
    len: u64,
}

/// Creates, restores and prunes snapshots of one log directory.
pub struct SnapshotManager {
    log_dir: PathBuf,
    snapshot_dir: PathBuf,
    policy: SnapshotPolicy,
    snapshots: Mutex<Vec<Snapshot>>,
}

impl SnapshotManager {
    /// Opens the snapshot store of `log_dir`, creating it if needed.
    pub fn open(log_dir: impl AsRef<Path>, policy: SnapshotPolicy) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        let snapshot_dir = log_dir.join(SNAPSHOT_DIR);
        fs::create_dir_all(&snapshot_dir)?;

        for entry in fs::read_dir(&snapshot_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if entry.file_type()?.is_dir() && name.to_string_lossy().ends_with(TMP_SUFFIX) {
                warn!(path = ?entry.path(), "Removing incomplete snapshot");
                fs::remove_dir_all(entry.path())?;
            }
        }

        let index_path = snapshot_dir.join(INDEX_FILE);
        let mut snapshots: Vec<Snapshot> = match fs::read(&index_path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        snapshots.retain(|s| {
            let present = snapshot_dir.join(&s.id).is_dir();
            if !present {
                warn!(id = %s.id, "Snapshot directory missing, dropping from index");
            }
            present
        });

        debug!(dir = ?snapshot_dir, snapshots = snapshots.len(), "Snapshot store opened");
        Ok(Self {
            log_dir,
            snapshot_dir,
            policy,
            snapshots: Mutex::new(snapshots),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn policy(&self) -> &SnapshotPolicy {
        &self.policy
    }

    /// Captures a consistent copy of `log`.
    pub async fn create_snapshot(&self, log: &Log) -> Result<Snapshot> {
        let mut snapshots = self.snapshots.lock().await;
        let now = now_ms();
        if let Some(last) = snapshots.iter().map(|s| s.timestamp).max() {
            let elapsed_ms = (now - last).max(0) as u64;
            let min_interval_ms = self.policy.min_interval.as_millis() as u64;
            if elapsed_ms < min_interval_ms {
                return Err(Error::SnapshotTooSoon {
                    elapsed_ms,
                    min_interval_ms,
                });
            }
        }

        let view = log.snapshot_view().await?;
        let id = self.next_id();
        let tmp_dir = self.snapshot_dir.join(format!("{}{}", id, TMP_SUFFIX));
        let final_dir = self.snapshot_dir.join(&id);

        let mut jobs = Vec::with_capacity(view.segments.len() * 3);
        for segment in &view.segments {
            let target = SegmentFiles::new(&tmp_dir, segment.files.base_offset);
            jobs.push(CopyJob {
                src: segment.files.data.clone(),
                dst: target.data,
                len: segment.data_len,
            });
            jobs.push(CopyJob {
                src: segment.files.index.clone(),
                dst: target.index,
                len: segment.index_len,
            });
            jobs.push(CopyJob {
                src: segment.files.time_index.clone(),
                dst: target.time_index,
                len: segment.time_index_len,
            });
        }

        let copy_dir = tmp_dir.clone();
        let copied = tokio::task::spawn_blocking(move || copy_files(&copy_dir, &jobs))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .map_err(Error::from)
            .and_then(|r| r);
        let total_size = match copied {
            Ok(total) => total,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&tmp_dir) {
                    warn!(path = ?tmp_dir, error = %cleanup, "Failed to remove incomplete snapshot");
                }
                return Err(Error::SnapshotIncomplete {
                    id,
                    reason: e.to_string(),
                });
            }
        };
        fs::rename(&tmp_dir, &final_dir)?;

        let snapshot = Snapshot {
            id: id.clone(),
            timestamp: now,
            base_offset: view.log_start_offset,
            high_water_mark: view.high_water_mark,
            num_segments: view.segments.len(),
            total_size,
            segment_offsets: view.segments.iter().map(|s| s.files.base_offset).collect(),
        };
        drop(view);

        snapshots.push(snapshot.clone());
        if let Err(e) = self.save(&snapshots) {
            snapshots.pop();
            if let Err(cleanup) = fs::remove_dir_all(&final_dir) {
                warn!(path = ?final_dir, error = %cleanup, "Failed to remove unindexed snapshot");
            }
            return Err(e);
        }

        info!(
            id = %snapshot.id,
            segments = snapshot.num_segments,
            high_water_mark = snapshot.high_water_mark,
            size = snapshot.total_size,
            "Snapshot created"
        );
        Ok(snapshot)
    }

    /// Copies the snapshot's segment files into `target_dir`, replacing
    /// any segment files already there.
    pub async fn restore_snapshot(&self, id: &str, target_dir: impl AsRef<Path>) -> Result<Snapshot> {
        let snapshot = self
            .get_snapshot(id)
            .await
            .ok_or_else(|| Error::SnapshotNotFound(id.to_string()))?;
        let source = self.snapshot_dir.join(id);
        let target = target_dir.as_ref().to_path_buf();

        let offsets = snapshot.segment_offsets.clone();
        let restore_id = id.to_string();
        tokio::task::spawn_blocking(move || restore_files(&restore_id, &source, &target, &offsets))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        info!(id = %id, dir = ?target_dir.as_ref(), "Snapshot restored");
        Ok(snapshot)
    }

    /// Restores a snapshot into `target_dir` and opens it through recovery.
    pub async fn open_restored(
        &self,
        id: &str,
        target_dir: impl AsRef<Path>,
        config: LogConfig,
    ) -> Result<(Log, LogRecoveryResult)> {
        self.restore_snapshot(id, target_dir.as_ref()).await?;
        recover_from_directory(target_dir, config)
    }

    /// All snapshots, newest first.
    pub async fn list_snapshots(&self) -> Vec<Snapshot> {
        let mut all = self.snapshots.lock().await.clone();
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        all
    }

    pub async fn get_snapshot(&self, id: &str) -> Option<Snapshot> {
        self.snapshots.lock().await.iter().find(|s| s.id == id).cloned()
    }

    pub async fn delete_snapshot(&self, id: &str) -> Result<()> {
        let mut snapshots = self.snapshots.lock().await;
        let position = snapshots
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| Error::SnapshotNotFound(id.to_string()))?;
        self.remove_locked(&mut snapshots, position)?;
        info!(id = %id, "Snapshot deleted");
        Ok(())
    }

    /// Keeps the newest `max_snapshots` snapshots younger than
    /// `retention_time` and deletes the rest. Returns how many were removed.
    pub async fn cleanup_snapshots(&self, policy: &SnapshotPolicy) -> Result<usize> {
        let mut snapshots = self.snapshots.lock().await;
        snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));

        let now = now_ms();
        let retention_ms = policy.retention_time.as_millis() as i64;
        let expired: Vec<String> = snapshots
            .iter()
            .enumerate()
            .filter(|(i, s)| *i >= policy.max_snapshots || now - s.timestamp > retention_ms)
            .map(|(_, s)| s.id.clone())
            .collect();

        for id in &expired {
            if let Some(position) = snapshots.iter().position(|s| &s.id == id) {
                self.remove_locked(&mut snapshots, position)?;
                debug!(id = %id, "Snapshot expired");
            }
        }
        if !expired.is_empty() {
            info!(deleted = expired.len(), remaining = snapshots.len(), "Snapshot cleanup complete");
        }
        Ok(expired.len())
    }

    /// Bytes used by all snapshot files.
    pub fn size(&self) -> Result<u64> {
        dir_size(&self.snapshot_dir)
    }

    fn remove_locked(&self, snapshots: &mut Vec<Snapshot>, position: usize) -> Result<()> {
        let snapshot = snapshots.remove(position);
        match fs::remove_dir_all(self.snapshot_dir.join(&snapshot.id)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                snapshots.insert(position, snapshot);
                return Err(e.into());
            }
            _ => {}
        }
        self.save(snapshots)
    }

    fn save(&self, snapshots: &[Snapshot]) -> Result<()> {
        let data = serde_json::to_vec_pretty(snapshots)?;
        write_atomic(&self.snapshot_dir.join(INDEX_FILE), &data)?;
        Ok(())
    }

    fn next_id(&self) -> String {
        let mut nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        loop {
            let id = format!("snapshot-{}", nanos);
            let taken = self.snapshot_dir.join(&id).exists()
                || self.snapshot_dir.join(format!("{}{}", id, TMP_SUFFIX)).exists();
            if !taken {
                return id;
            }
            nanos += 1;
        }
    }
}

fn copy_files(dir: &Path, jobs: &[CopyJob]) -> Result<u64> {
    fs::create_dir_all(dir)?;
    let mut total = 0;
    for job in jobs {
        total += copy_prefix(&job.src, &job.dst, job.len)?;
    }
    Ok(total)
}

/// Copies exactly the first `len` bytes of `src` into a new file `dst`.
fn copy_prefix(src: &Path, dst: &Path, len: u64) -> Result<u64> {
    let mut reader = io::Read::take(File::open(src)?, len);
    let mut writer = File::create(dst)?;
    let copied = io::copy(&mut reader, &mut writer)?;
    if copied != len {
        return Err(Error::CorruptedSegment(format!(
            "{:?} shrank during copy: expected {} bytes, got {}",
            src, len, copied
        )));
    }
    writer.sync_all()?;
    Ok(copied)
}

fn restore_files(id: &str, source: &Path, target: &Path, offsets: &[i64]) -> Result<()> {
    let incomplete = |reason: String| Error::SnapshotIncomplete {
        id: id.to_string(),
        reason,
    };

    let sources: Vec<SegmentFiles> = offsets.iter().map(|b| SegmentFiles::new(source, *b)).collect();
    for files in &sources {
        for path in files.all() {
            if !path.is_file() {
                return Err(incomplete(format!("{:?} is missing", path)));
            }
        }
    }

    fs::create_dir_all(target)?;
    let keep: HashSet<i64> = offsets.iter().copied().collect();
    for base in list_base_offsets(target)? {
        if !keep.contains(&base) {
            SegmentFiles::new(target, base).remove()?;
        }
    }

    for files in &sources {
        let dest = SegmentFiles::new(target, files.base_offset);
        for (src, dst) in files.all().into_iter().zip(dest.all()) {
            let staged = with_suffix(dst, ".restore");
            fs::copy(src, &staged)?;
            File::open(&staged)?.sync_all()?;
            fs::rename(&staged, dst)?;
        }
    }
    Ok(())
}

fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        total += if meta.is_dir() {
            dir_size(&entry.path())?
        } else {
            meta.len()
        };
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;
    use tributary_core::Record;

    fn quick_policy() -> SnapshotPolicy {
        SnapshotPolicy {
            min_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    async fn log_with(dir: &Path, count: i64) -> Log {
        let log = Log::open(
            dir,
            LogConfig {
                max_segment_bytes: 1_000,
                ..Default::default()
            },
        )
        .unwrap();
        for i in 0..count {
            log.append(Record::new(None, Bytes::from(vec![i as u8; 64])).with_timestamp(i))
                .await
                .unwrap();
        }
        log
    }

    #[tokio::test]
    async fn test_create_snapshot_captures_all_segments() {
        let dir = TempDir::new().unwrap();
        let log = log_with(dir.path(), 25).await;
        let manager = SnapshotManager::open(dir.path(), quick_policy()).unwrap();

        let snapshot = manager.create_snapshot(&log).await.unwrap();
        assert!(snapshot.id.starts_with("snapshot-"));
        assert_eq!(snapshot.high_water_mark, 25);
        assert_eq!(snapshot.base_offset, 0);
        assert_eq!(snapshot.segment_offsets, vec![0, 10, 20]);
        assert_eq!(snapshot.num_segments, 3);
        // 2500 bytes of data plus one offset and one time entry per segment.
        assert_eq!(snapshot.total_size, 2_500 + 3 * (8 + 12));

        let stored = SegmentFiles::new(&dir.path().join(SNAPSHOT_DIR).join(&snapshot.id), 20);
        assert_eq!(fs::metadata(&stored.data).unwrap().len(), 500);
        assert!(manager.size().unwrap() >= snapshot.total_size);
    }

    #[tokio::test]
    async fn test_appends_after_capture_are_excluded() {
        let dir = TempDir::new().unwrap();
        let log = log_with(dir.path(), 5).await;
        let manager = SnapshotManager::open(dir.path(), quick_policy()).unwrap();

        let snapshot = manager.create_snapshot(&log).await.unwrap();
        log.append(Record::new(None, Bytes::from("late"))).await.unwrap();

        let target = TempDir::new().unwrap();
        let (restored, result) = manager
            .open_restored(&snapshot.id, target.path(), log.config().clone())
            .await
            .unwrap();
        assert!(result.is_clean());
        assert_eq!(restored.high_water_mark().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_min_interval_enforced() {
        let dir = TempDir::new().unwrap();
        let log = log_with(dir.path(), 3).await;
        let manager = SnapshotManager::open(dir.path(), SnapshotPolicy::default()).unwrap();

        manager.create_snapshot(&log).await.unwrap();
        let err = manager.create_snapshot(&log).await.unwrap_err();
        assert!(matches!(err, Error::SnapshotTooSoon { .. }));
        assert_eq!(manager.list_snapshots().await.len(), 1);
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let log = log_with(dir.path(), 3).await;
        let id = {
            let manager = SnapshotManager::open(dir.path(), quick_policy()).unwrap();
            manager.create_snapshot(&log).await.unwrap().id
        };
        // A crashed creation leaves a temp directory behind.
        fs::create_dir_all(dir.path().join(SNAPSHOT_DIR).join("snapshot-1.tmp")).unwrap();

        let manager = SnapshotManager::open(dir.path(), quick_policy()).unwrap();
        assert!(manager.get_snapshot(&id).await.is_some());
        assert!(!dir.path().join(SNAPSHOT_DIR).join("snapshot-1.tmp").exists());
    }

    #[tokio::test]
    async fn test_delete_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let log = log_with(dir.path(), 3).await;
        let manager = SnapshotManager::open(dir.path(), quick_policy()).unwrap();

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(manager.create_snapshot(&log).await.unwrap().id);
        }

        manager.delete_snapshot(&ids[0]).await.unwrap();
        assert!(!dir.path().join(SNAPSHOT_DIR).join(&ids[0]).exists());
        assert!(matches!(
            manager.delete_snapshot(&ids[0]).await,
            Err(Error::SnapshotNotFound(_))
        ));

        let policy = SnapshotPolicy {
            max_snapshots: 2,
            ..quick_policy()
        };
        assert_eq!(manager.cleanup_snapshots(&policy).await.unwrap(), 1);
        let remaining: Vec<String> = manager.list_snapshots().await.into_iter().map(|s| s.id).collect();
        assert_eq!(remaining, vec![ids[3].clone(), ids[2].clone()]);

        let expire_all = SnapshotPolicy {
            retention_time: Duration::ZERO,
            ..quick_policy()
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.cleanup_snapshots(&expire_all).await.unwrap(), 2);
        assert!(manager.list_snapshots().await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_unknown_snapshot() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::open(dir.path(), quick_policy()).unwrap();
        assert!(matches!(
            manager.restore_snapshot("snapshot-0", dir.path()).await,
            Err(Error::SnapshotNotFound(_))
        ));
    }
}
