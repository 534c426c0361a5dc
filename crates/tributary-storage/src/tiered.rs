//! Tiered Storage for Tributary
//!
//! Moves sealed segments between local disk and a remote object store.
//! Every tracked segment is in exactly one physical place: local (hot or
//! warm) or archived (cold).
//!
//! ## Policy Buckets
//!
//! | Bucket | Where  | Rule                                   |
//! |--------|--------|----------------------------------------|
//! | Hot    | local  | younger than `warm_age_threshold`      |
//! | Warm   | local  | older than `warm_age_threshold`        |
//! | Cold   | remote | archived, or older than `cold_age_threshold` |
//!
//! Age is measured from the data file's last modification time.
//!
//! ## Migration Safety
//!
//! Each tracked segment owns a migration lock. Readers hold it shared for
//! the duration of a read (`acquire_local`); archive and restore hold it
//! exclusively. The point at which a migration becomes visible contains no
//! `.await`, so cancelling an archive or restore at any await point leaves
//! the segment either fully local or fully archived. Staged `*.restore`
//! files are removed when a restore is cancelled or its future dropped.
//!
//! A reader that waits longer than `migration_wait` for the lock gets
//! `MigrationInProgress` and may retry after a short backoff.
//!
//! ```text
//! archive:  upload index, timeindex, log ─► verify sizes ─► delete log, index, timeindex
//! restore:  download to *.restore ─► fsync ─► rename index, timeindex, log
//! ```
//!
//! Remote operations retry transient failures with exponential backoff
//! (`retry_backoff * 2^attempt`). A missing remote object is never retried.

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::duration_ms;
use crate::error::{Error, Result};
use crate::now_ms;
use crate::remote::RemoteStore;
use crate::segment::{
    parse_base_offset, remove_if_exists, with_suffix, SegmentFiles, INDEX_SUFFIX, LOG_SUFFIX,
    TIME_INDEX_SUFFIX,
};

/// Storage tier classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    /// Recent or frequently read, kept local.
    Hot,
    /// Aging, still local.
    Warm,
    /// Archived to the remote store.
    Cold,
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageTier::Hot => write!(f, "hot"),
            StorageTier::Warm => write!(f, "warm"),
            StorageTier::Cold => write!(f, "cold"),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredStorageConfig {
    /// Root directory that all tracked segment paths live under.
    pub data_dir: PathBuf,

    /// Key prefix for archived objects (default: "tiered").
    #[serde(default = "default_remote_prefix")]
    pub remote_prefix: String,

    /// Age after which a local segment becomes warm; zero disables the
    /// warm bucket (default: 1 day).
    #[serde(default = "default_warm_age_threshold", with = "duration_ms")]
    pub warm_age_threshold: Duration,

    /// Age after which a local segment is archived (default: 7 days).
    #[serde(default = "default_cold_age_threshold", with = "duration_ms")]
    pub cold_age_threshold: Duration,

    /// Period of the background archiver (default: 5 minutes).
    #[serde(default = "default_archive_interval", with = "duration_ms")]
    pub archive_interval: Duration,

    /// Whether `start_archiver` launches the background task (default: true).
    #[serde(default = "default_true")]
    pub auto_archive: bool,

    /// Attempts per remote operation, including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the first retry; doubles per attempt (default: 100ms).
    #[serde(default = "default_retry_backoff", with = "duration_ms")]
    pub retry_backoff: Duration,

    /// How long a read waits for an in-flight archive or restore
    /// (default: 30 seconds).
    #[serde(default = "default_migration_wait", with = "duration_ms")]
    pub migration_wait: Duration,
}

fn default_remote_prefix() -> String {
    "tiered".to_string()
}

fn default_warm_age_threshold() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_cold_age_threshold() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_archive_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_migration_wait() -> Duration {
    Duration::from_secs(30)
}

impl TieredStorageConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            remote_prefix: default_remote_prefix(),
            warm_age_threshold: default_warm_age_threshold(),
            cold_age_threshold: default_cold_age_threshold(),
            archive_interval: default_archive_interval(),
            auto_archive: true,
            max_attempts: default_max_attempts(),
            retry_backoff: default_retry_backoff(),
            migration_wait: default_migration_wait(),
        }
    }
}

const RESTORE_SUFFIX: &str = ".restore";

/// Downloaded files waiting to be renamed into place. Whatever is still
/// staged when this drops is deleted.
#[derive(Default)]
struct StagedRestore {
    files: Vec<(PathBuf, PathBuf)>,
}

impl StagedRestore {
    fn push(&mut self, tmp: PathBuf, target: PathBuf) {
        self.files.push((tmp, target));
    }

    /// Renames every staged file into place, in staging order.
    fn commit(mut self) -> Result<()> {
        while let Some((tmp, target)) = self.files.first() {
            fs::rename(tmp, target)?;
            self.files.remove(0);
        }
        Ok(())
    }
}

impl Drop for StagedRestore {
    fn drop(&mut self) {
        for (tmp, _) in &self.files {
            if let Err(e) = remove_if_exists(tmp) {
                warn!(path = ?tmp, error = %e, "Failed to remove staged restore file");
            }
        }
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// Tracking state of one sealed segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentMetadata {
    /// Data file path relative to `data_dir`, `/`-separated.
    pub key: String,
    pub local_path: PathBuf,
    pub base_offset: i64,
    /// Size of the data file.
    pub size_bytes: u64,
    pub last_modified_ms: i64,
    pub last_access_ms: i64,
    pub archived: bool,
    /// Remote key of the archived data file.
    pub remote_key: Option<String>,
}

struct TrackedSegment {
    meta: Mutex<SegmentMetadata>,
    migration: Arc<RwLock<()>>,
}

impl TrackedSegment {
    fn new(meta: SegmentMetadata) -> Self {
        Self {
            meta: Mutex::new(meta),
            migration: Arc::new(RwLock::new(())),
        }
    }

    fn meta(&self) -> std::sync::MutexGuard<'_, SegmentMetadata> {
        self.meta.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> SegmentMetadata {
        self.meta().clone()
    }

    fn is_archived(&self) -> bool {
        self.meta().archived
    }
}

/// A segment found in the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedSegment {
    pub base_offset: i64,
    pub size_bytes: u64,
    pub last_modified_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TieredStorageStats {
    pub total_segments: usize,
    pub hot_segments: usize,
    pub warm_segments: usize,
    pub cold_segments: usize,
    pub archived_segments: usize,
    pub local_bytes: u64,
    pub archived_bytes: u64,
    pub total_bytes: u64,
    pub archive_operations: u64,
    pub restore_operations: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveRunReport {
    pub candidates: usize,
    pub archived: usize,
    pub failed: usize,
}

// ============================================================================
// Manager
// ============================================================================

/// Archives and restores sealed segments.
pub struct TieredStorageManager {
    config: TieredStorageConfig,
    remote: Arc<dyn RemoteStore>,
    segments: DashMap<String, Arc<TrackedSegment>>,
    archive_count: AtomicU64,
    restore_count: AtomicU64,
    cancel: CancellationToken,
    archiver: Mutex<Option<JoinHandle<()>>>,
}

impl TieredStorageManager {
    pub fn new(config: TieredStorageConfig, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            config,
            remote,
            segments: DashMap::new(),
            archive_count: AtomicU64::new(0),
            restore_count: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            archiver: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TieredStorageConfig {
        &self.config
    }

    /// Token cancelled by `shutdown`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Tracking key for a path under `data_dir`.
    pub fn segment_key(&self, path: &Path) -> Result<String> {
        let relative = path.strip_prefix(&self.config.data_dir).map_err(|_| {
            Error::InvalidConfig(format!(
                "{:?} is not under tiered data dir {:?}",
                path, self.config.data_dir
            ))
        })?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Ok(parts.join("/"))
    }

    fn remote_path(&self, relative: &str) -> String {
        let prefix = self.config.remote_prefix.trim_matches('/');
        match (prefix.is_empty(), relative.is_empty()) {
            (true, _) => relative.to_string(),
            (false, true) => prefix.to_string(),
            (false, false) => format!("{}/{}", prefix, relative),
        }
    }

    /// Remote key of one of the segment's files.
    fn remote_key(&self, key: &str, suffix: &str) -> String {
        let stem = key.strip_suffix(".log").unwrap_or(key);
        self.remote_path(&format!("{}.{}", stem, suffix))
    }

    fn tracked(&self, key: &str) -> Result<Arc<TrackedSegment>> {
        self.segments
            .get(key)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| Error::SegmentNotFound(key.to_string()))
    }

    fn files_for(meta: &SegmentMetadata) -> Result<SegmentFiles> {
        SegmentFiles::from_data_path(&meta.local_path)
            .ok_or_else(|| Error::SegmentNotFound(format!("{:?}", meta.local_path)))
    }

    /// Starts tracking a sealed local segment, or refreshes its size and
    /// modification time if already tracked and local.
    pub fn track_segment(&self, data_path: &Path) -> Result<String> {
        let key = self.segment_key(data_path)?;
        let base_offset = SegmentFiles::from_data_path(data_path)
            .map(|f| f.base_offset)
            .ok_or_else(|| Error::SegmentNotFound(format!("{:?} is not a segment", data_path)))?;
        let stat = fs::metadata(data_path)?;
        let last_modified_ms = stat
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or_else(now_ms);

        match self.segments.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let mut meta = entry.get().meta();
                if !meta.archived {
                    meta.size_bytes = stat.len();
                    meta.last_modified_ms = last_modified_ms;
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(TrackedSegment::new(SegmentMetadata {
                    key: key.clone(),
                    local_path: data_path.to_path_buf(),
                    base_offset,
                    size_bytes: stat.len(),
                    last_modified_ms,
                    last_access_ms: now_ms(),
                    archived: false,
                    remote_key: None,
                })));
                debug!(key = %key, base_offset, size = stat.len(), "Tracking segment");
            }
        }
        Ok(key)
    }

    /// Tracks a segment that exists only in the remote store.
    pub fn track_archived(&self, data_path: &Path, size_bytes: u64, last_modified_ms: i64) -> Result<String> {
        let key = self.segment_key(data_path)?;
        let base_offset = SegmentFiles::from_data_path(data_path)
            .map(|f| f.base_offset)
            .ok_or_else(|| Error::SegmentNotFound(format!("{:?} is not a segment", data_path)))?;
        let remote_key = self.remote_key(&key, LOG_SUFFIX);
        self.segments.entry(key.clone()).or_insert_with(|| {
            Arc::new(TrackedSegment::new(SegmentMetadata {
                key: key.clone(),
                local_path: data_path.to_path_buf(),
                base_offset,
                size_bytes,
                last_modified_ms,
                last_access_ms: last_modified_ms,
                archived: true,
                remote_key: Some(remote_key),
            }))
        });
        Ok(key)
    }

    /// Walks `data_dir` and tracks every sealed segment found. The segment
    /// with the highest base offset in each directory is active and skipped.
    /// Returns the number of newly tracked segments.
    pub fn discover_segments(&self) -> Result<usize> {
        let before = self.segments.len();
        let mut dirs = vec![self.config.data_dir.clone()];
        while let Some(dir) = dirs.pop() {
            let mut data_files = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if entry.file_type()?.is_dir() {
                    if !name.starts_with('.') {
                        dirs.push(entry.path());
                    }
                } else if let Some(base) = parse_base_offset(&name) {
                    data_files.push((base, entry.path()));
                }
            }
            data_files.sort_by_key(|(base, _)| *base);
            data_files.pop();
            for (_, path) in data_files {
                self.track_segment(&path)?;
            }
        }
        let added = self.segments.len() - before;
        info!(data_dir = ?self.config.data_dir, added, "Segment discovery complete");
        Ok(added)
    }

    /// Segments of `partition_dir` present in the remote store.
    pub async fn archived_segments(&self, partition_dir: &Path) -> Result<Vec<ArchivedSegment>> {
        let prefix = self.remote_path(&self.segment_key(partition_dir)?);
        let objects = self
            .with_retry("list", &prefix, &self.cancel, || self.remote.list(&prefix))
            .await?;

        let mut archived: Vec<ArchivedSegment> = objects
            .into_iter()
            .filter_map(|object| {
                let name = object.key.rsplit('/').next()?;
                // Only direct children of the partition prefix.
                if object.key.len() != prefix.len() + 1 + name.len() {
                    return None;
                }
                Some(ArchivedSegment {
                    base_offset: parse_base_offset(name)?,
                    size_bytes: object.size,
                    last_modified_ms: object.last_modified_ms,
                })
            })
            .collect();
        archived.sort_by_key(|a| a.base_offset);
        Ok(archived)
    }

    /// Holds the segment local until the returned guard is dropped,
    /// restoring it first if it is archived. Untracked segments are always
    /// local and yield `None`.
    pub async fn acquire_local(&self, key: &str) -> Result<Option<OwnedRwLockReadGuard<()>>> {
        loop {
            let Some(tracked) = self.segments.get(key).map(|e| Arc::clone(e.value())) else {
                return Ok(None);
            };
            let lock = Arc::clone(&tracked.migration).read_owned();
            let Ok(guard) = tokio::time::timeout(self.config.migration_wait, lock).await else {
                debug!(key = %key, "Gave up waiting for segment migration");
                return Err(Error::MigrationInProgress(key.to_string()));
            };
            if !tracked.is_archived() {
                tracked.meta().last_access_ms = now_ms();
                return Ok(Some(guard));
            }
            drop(guard);
            debug!(key = %key, "Read of archived segment, restoring");
            self.restore_segment(key, &self.cancel).await?;
        }
    }

    /// Uploads the segment to the remote store, verifies it, and deletes
    /// the local files. Idempotent for already archived segments.
    pub async fn archive_segment(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        let tracked = self.tracked(key)?;
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled(format!("archive {}", key))),
            guard = tracked.migration.write() => guard,
        };

        let meta = tracked.snapshot();
        if meta.archived {
            return Ok(());
        }
        let files = Self::files_for(&meta)?;

        let uploads = [
            (&files.index, INDEX_SUFFIX),
            (&files.time_index, TIME_INDEX_SUFFIX),
            (&files.data, LOG_SUFFIX),
        ];
        for (local, suffix) in uploads {
            let data = Bytes::from(tokio::fs::read(local).await?);
            let expected = data.len() as u64;
            let remote_key = self.remote_key(key, suffix);

            self.with_retry("put", &remote_key, cancel, || {
                self.remote.put(&remote_key, data.clone())
            })
            .await?;
            let actual = self
                .with_retry("head", &remote_key, cancel, || self.remote.head(&remote_key))
                .await?;
            if actual != Some(expected) {
                return Err(Error::RemoteVerificationFailed {
                    key: remote_key,
                    expected,
                    actual,
                });
            }
        }

        // Commit point: no awaits from here on.
        let size_bytes = fs::metadata(&files.data)?.len();
        remove_if_exists(&files.data)?;
        remove_if_exists(&files.index)?;
        remove_if_exists(&files.time_index)?;
        {
            let mut meta = tracked.meta();
            meta.archived = true;
            meta.size_bytes = size_bytes;
            meta.remote_key = Some(self.remote_key(key, LOG_SUFFIX));
        }
        self.archive_count.fetch_add(1, Ordering::Relaxed);

        info!(key = %key, size = size_bytes, "Segment archived");
        Ok(())
    }

    /// Downloads an archived segment back to its local path. Idempotent for
    /// local segments. Remote copies are kept.
    pub async fn restore_segment(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        let tracked = self.tracked(key)?;
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled(format!("restore {}", key))),
            guard = tracked.migration.write() => guard,
        };

        let meta = tracked.snapshot();
        if !meta.archived {
            return Ok(());
        }
        let files = Self::files_for(&meta)?;

        let mut staged = StagedRestore::default();
        self.download_segment(key, &meta, &files, cancel, &mut staged).await?;

        // Commit point: no awaits from here on. Data file goes last.
        staged.commit()?;
        {
            let mut meta = tracked.meta();
            meta.archived = false;
            meta.last_access_ms = now_ms();
        }
        self.restore_count.fetch_add(1, Ordering::Relaxed);

        info!(key = %key, size = meta.size_bytes, "Segment restored");
        Ok(())
    }

    async fn download_segment(
        &self,
        key: &str,
        meta: &SegmentMetadata,
        files: &SegmentFiles,
        cancel: &CancellationToken,
        staged: &mut StagedRestore,
    ) -> Result<()> {
        if let Some(parent) = files.data.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let downloads = [
            (&files.index, INDEX_SUFFIX),
            (&files.time_index, TIME_INDEX_SUFFIX),
            (&files.data, LOG_SUFFIX),
        ];
        for (local, suffix) in downloads {
            let remote_key = self.remote_key(key, suffix);
            let data = self
                .with_retry("get", &remote_key, cancel, || self.remote.get(&remote_key))
                .await?;
            if suffix == LOG_SUFFIX && data.len() as u64 != meta.size_bytes {
                return Err(Error::RemoteVerificationFailed {
                    key: remote_key,
                    expected: meta.size_bytes,
                    actual: Some(data.len() as u64),
                });
            }

            let tmp = with_suffix(local, RESTORE_SUFFIX);
            staged.push(tmp.clone(), local.clone());
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    /// Stops tracking a segment and deletes its remote copies. Local files
    /// are left alone.
    pub async fn remove_segment(&self, key: &str) -> Result<()> {
        let Ok(tracked) = self.tracked(key) else {
            return Ok(());
        };
        let _guard = tracked.migration.write().await;
        for suffix in [LOG_SUFFIX, INDEX_SUFFIX, TIME_INDEX_SUFFIX] {
            let remote_key = self.remote_key(key, suffix);
            self.with_retry("delete", &remote_key, &self.cancel, || {
                self.remote.delete(&remote_key)
            })
            .await?;
        }
        self.segments.remove(key);
        debug!(key = %key, "Segment untracked");
        Ok(())
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    async fn with_retry<T, F, Fut>(
        &self,
        op: &str,
        key: &str,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled(format!("{} {}", op, key))),
                result = f() => result,
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt + 1 >= attempts => {
                    error!(op, key = %key, attempts, error = %e, "Remote operation failed after all retries");
                    return Err(Error::RemoteStoreUnavailable {
                        attempts,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt);
                    warn!(
                        op,
                        key = %key,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Remote operation failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled(format!("{} {}", op, key))),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Policy bucket for `meta` at time `now_ms`.
    pub fn classify(&self, meta: &SegmentMetadata, now_ms: i64) -> StorageTier {
        if meta.archived {
            return StorageTier::Cold;
        }
        let age = Duration::from_millis(now_ms.saturating_sub(meta.last_modified_ms).max(0) as u64);
        if age > self.config.cold_age_threshold {
            StorageTier::Cold
        } else if !self.config.warm_age_threshold.is_zero() && age > self.config.warm_age_threshold {
            StorageTier::Warm
        } else {
            StorageTier::Hot
        }
    }

    pub fn segment_policy(&self, key: &str) -> Option<StorageTier> {
        let meta = self.segment_metadata(key)?;
        Some(self.classify(&meta, now_ms()))
    }

    pub fn is_archived(&self, key: &str) -> bool {
        self.segments
            .get(key)
            .map(|e| e.value().is_archived())
            .unwrap_or(false)
    }

    pub fn segment_metadata(&self, key: &str) -> Option<SegmentMetadata> {
        self.segments.get(key).map(|e| e.value().snapshot())
    }

    pub fn tracked_segments(&self) -> Vec<SegmentMetadata> {
        let mut all: Vec<SegmentMetadata> =
            self.segments.iter().map(|e| e.value().snapshot()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Records a read of a tracked segment.
    pub fn touch(&self, key: &str) {
        if let Some(tracked) = self.segments.get(key) {
            tracked.meta().last_access_ms = now_ms();
        }
    }

    /// Archives every local segment older than `cold_age_threshold`.
    pub async fn run_archive_policy(&self) -> Result<ArchiveRunReport> {
        let now = now_ms();
        let candidates: Vec<String> = self
            .tracked_segments()
            .into_iter()
            .filter(|m| !m.archived && self.classify(m, now) == StorageTier::Cold)
            .map(|m| m.key)
            .collect();

        let mut report = ArchiveRunReport {
            candidates: candidates.len(),
            ..Default::default()
        };
        for key in candidates {
            match self.archive_segment(&key, &self.cancel).await {
                Ok(()) => report.archived += 1,
                Err(Error::Cancelled(reason)) => return Err(Error::Cancelled(reason)),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to archive segment");
                    report.failed += 1;
                }
            }
        }

        if report.candidates > 0 {
            info!(
                candidates = report.candidates,
                archived = report.archived,
                failed = report.failed,
                "Archive policy run complete"
            );
        }
        Ok(report)
    }

    /// Launches the periodic archiver unless `auto_archive` is off.
    pub fn start_archiver(self: &Arc<Self>) {
        if !self.config.auto_archive {
            info!("Automatic archiving disabled");
            return;
        }
        let mut slot = self.archiver.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }

        let manager = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = self.config.archive_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.run_archive_policy().await {
                            warn!(error = %e, "Archive policy run failed");
                        }
                    }
                }
            }
            debug!("Archiver stopped");
        }));
        info!(interval_ms = period.as_millis() as u64, "Archiver started");
    }

    /// Cancels in-flight migrations and stops the archiver.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self
            .archiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Archiver task ended abnormally");
            }
        }
    }

    pub fn get_stats(&self) -> TieredStorageStats {
        let now = now_ms();
        let mut stats = TieredStorageStats {
            archive_operations: self.archive_count.load(Ordering::Relaxed),
            restore_operations: self.restore_count.load(Ordering::Relaxed),
            ..Default::default()
        };
        for meta in self.tracked_segments() {
            stats.total_segments += 1;
            stats.total_bytes += meta.size_bytes;
            if meta.archived {
                stats.archived_segments += 1;
                stats.archived_bytes += meta.size_bytes;
            } else {
                stats.local_bytes += meta.size_bytes;
            }
            match self.classify(&meta, now) {
                StorageTier::Hot => stats.hot_segments += 1,
                StorageTier::Warm => stats.warm_segments += 1,
                StorageTier::Cold => stats.cold_segments += 1,
            }
        }
        stats
    }

    /// Total bytes of tracked segment data, local or archived.
    pub fn size(&self) -> u64 {
        self.segments.iter().map(|e| e.value().meta().size_bytes).sum()
    }
}
