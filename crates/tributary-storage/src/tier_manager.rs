//! Access-Driven Tier Management
//!
//! `TierManager` watches how often each segment is read and combines that
//! with segment age to pick a tier. The decision itself is a pure function,
//! `determine_tier`; applying it means archiving (demote to cold) or
//! restoring (promote from cold) through the `TieredStorageManager`.
//! Moves between hot and warm are bookkeeping only, since both are local.
//!
//! ## Decision Rule
//!
//! ```text
//! no reads recorded:   age < warm_min_age → hot, age < cold_min_age → warm, else cold
//! with reads:          read_hz ≥ hot_min_access_hz or reads ≥ hot_min_access_count → hot
//!                      age < warm_min_age → hot
//!                      age ≥ cold_min_age → cold
//!                      otherwise → warm
//! ```
//!
//! `read_hz` is reads per hour since the first recorded read, with the
//! elapsed time floored at one hour so a burst of early reads does not
//! produce an inflated rate.
//!
//! ## Cost Model
//!
//! Local bytes are priced at the hot rate, archived bytes at the cold rate.
//! Defaults follow S3 list prices: 0.023 and 0.004 USD per GB-month, 0.01
//! USD per GB retrieved.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::duration_ms;
use crate::error::{Error, Result};
use crate::now_ms;
use crate::tiered::{StorageTier, TieredStorageManager};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const MS_PER_HOUR: f64 = 3_600_000.0;

// ============================================================================
// Configuration
// ============================================================================

/// Thresholds for tier decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Reads per hour at or above which a segment is hot (default: 10).
    #[serde(default = "default_hot_min_access_hz")]
    pub hot_min_access_hz: f64,

    /// Total reads at or above which a segment is hot (default: 100).
    #[serde(default = "default_hot_min_access_count")]
    pub hot_min_access_count: u64,

    /// Segments younger than this are hot (default: 1 day).
    #[serde(default = "default_warm_min_age", with = "duration_ms")]
    pub warm_min_age: Duration,

    /// Upper bound of the warm band, informational (default: 7 days).
    #[serde(default = "default_cold_min_age", with = "duration_ms")]
    pub warm_max_age: Duration,

    /// Segments at least this old become cold unless read often (default: 7 days).
    #[serde(default = "default_cold_min_age", with = "duration_ms")]
    pub cold_min_age: Duration,
}

fn default_hot_min_access_hz() -> f64 {
    10.0
}

fn default_hot_min_access_count() -> u64 {
    100
}

fn default_warm_min_age() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_cold_min_age() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            hot_min_access_hz: default_hot_min_access_hz(),
            hot_min_access_count: default_hot_min_access_count(),
            warm_min_age: default_warm_min_age(),
            warm_max_age: default_cold_min_age(),
            cold_min_age: default_cold_min_age(),
        }
    }
}

/// USD prices used by `get_cost_analysis`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRates {
    pub hot_per_gb_month: f64,
    pub cold_per_gb_month: f64,
    pub retrieval_per_gb: f64,
}

impl Default for CostRates {
    fn default() -> Self {
        Self {
            hot_per_gb_month: 0.023,
            cold_per_gb_month: 0.004,
            retrieval_per_gb: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierManagerConfig {
    #[serde(default)]
    pub policy: TierPolicy,

    /// Period of the background evaluation loop (default: 10 minutes).
    #[serde(default = "default_check_interval", with = "duration_ms")]
    pub check_interval: Duration,

    #[serde(default)]
    pub cost_rates: CostRates,
}

fn default_check_interval() -> Duration {
    Duration::from_secs(600)
}

impl Default for TierManagerConfig {
    fn default() -> Self {
        Self {
            policy: TierPolicy::default(),
            check_interval: default_check_interval(),
            cost_rates: CostRates::default(),
        }
    }
}

// ============================================================================
// Access tracking
// ============================================================================

/// Read statistics for one segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessPattern {
    pub segment_path: String,
    pub access_count: u64,
    pub first_access_ms: i64,
    pub last_access_ms: i64,
    pub read_bytes: u64,
    /// Reads per hour since the first read.
    pub average_read_hz: f64,
}

impl AccessPattern {
    fn new(segment_path: &str, now_ms: i64) -> Self {
        Self {
            segment_path: segment_path.to_string(),
            access_count: 0,
            first_access_ms: now_ms,
            last_access_ms: now_ms,
            read_bytes: 0,
            average_read_hz: 0.0,
        }
    }

    fn record(&mut self, bytes: u64, now_ms: i64) {
        self.access_count += 1;
        self.read_bytes += bytes;
        self.last_access_ms = self.last_access_ms.max(now_ms);
        let hours = ((now_ms - self.first_access_ms).max(0) as f64 / MS_PER_HOUR).max(1.0);
        self.average_read_hz = self.access_count as f64 / hours;
    }
}

/// Picks a tier from read statistics and age.
pub fn determine_tier(pattern: Option<&AccessPattern>, age: Duration, policy: &TierPolicy) -> StorageTier {
    let Some(pattern) = pattern else {
        return if age < policy.warm_min_age {
            StorageTier::Hot
        } else if age < policy.cold_min_age {
            StorageTier::Warm
        } else {
            StorageTier::Cold
        };
    };

    if pattern.average_read_hz >= policy.hot_min_access_hz
        || pattern.access_count >= policy.hot_min_access_count
    {
        return StorageTier::Hot;
    }
    if age < policy.warm_min_age {
        StorageTier::Hot
    } else if age >= policy.cold_min_age {
        StorageTier::Cold
    } else {
        StorageTier::Warm
    }
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierEvaluation {
    pub evaluated: usize,
    pub promoted: usize,
    pub demoted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub hot_segments: usize,
    pub warm_segments: usize,
    pub cold_segments: usize,
    pub tracked_patterns: usize,
    pub total_accesses: u64,
    pub promotions: u64,
    pub demotions: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostAnalysis {
    pub hot_storage_gb: f64,
    pub cold_storage_gb: f64,
    pub hot_cost_monthly: f64,
    pub cold_cost_monthly: f64,
    pub total_cost_monthly: f64,
    /// What the same bytes would cost with nothing archived.
    pub all_hot_cost_monthly: f64,
    pub savings_monthly: f64,
    pub savings_percent: f64,
    /// Retrieval cost of restoring one average archived segment.
    pub retrieval_cost_per_restore: f64,
}

// ============================================================================
// Manager
// ============================================================================

pub struct TierManager {
    config: TierManagerConfig,
    storage: Arc<TieredStorageManager>,
    access_patterns: DashMap<String, AccessPattern>,
    promotions: AtomicU64,
    demotions: AtomicU64,
    cancel: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl TierManager {
    pub fn new(config: TierManagerConfig, storage: Arc<TieredStorageManager>) -> Self {
        Self {
            config,
            storage,
            access_patterns: DashMap::new(),
            promotions: AtomicU64::new(0),
            demotions: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            monitor: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.config.policy
    }

    /// Counts a read of `segment_path`. Safe to call from any number of
    /// readers at once.
    pub fn record_access(&self, segment_path: &str, bytes: u64) {
        self.record_access_at(segment_path, bytes, now_ms());
    }

    /// `record_access` with an explicit clock.
    pub fn record_access_at(&self, segment_path: &str, bytes: u64, now_ms: i64) {
        self.access_patterns
            .entry(segment_path.to_string())
            .or_insert_with(|| AccessPattern::new(segment_path, now_ms))
            .record(bytes, now_ms);
    }

    pub fn get_access_stats(&self, segment_path: &str) -> Option<AccessPattern> {
        self.access_patterns.get(segment_path).map(|p| p.value().clone())
    }

    /// Drops the statistics of a segment that no longer exists.
    pub fn forget(&self, segment_path: &str) {
        self.access_patterns.remove(segment_path);
    }

    /// Tier for `segment_path` given its age.
    pub fn determine_tier(&self, segment_path: &str, age: Duration) -> StorageTier {
        let pattern = self.get_access_stats(segment_path);
        determine_tier(pattern.as_ref(), age, &self.config.policy)
    }

    /// Moves a segment to a hotter tier, restoring it if it was cold.
    pub async fn promote_segment(
        &self,
        segment_path: &str,
        from: StorageTier,
        to: StorageTier,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if from == StorageTier::Cold && to != StorageTier::Cold {
            self.storage.restore_segment(segment_path, cancel).await?;
        }
        self.promotions.fetch_add(1, Ordering::Relaxed);
        info!(segment = %segment_path, %from, %to, "Segment promoted");
        Ok(())
    }

    /// Moves a segment to a colder tier, archiving it if it becomes cold.
    pub async fn demote_segment(
        &self,
        segment_path: &str,
        from: StorageTier,
        to: StorageTier,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if to == StorageTier::Cold && from != StorageTier::Cold {
            self.storage.archive_segment(segment_path, cancel).await?;
        }
        self.demotions.fetch_add(1, Ordering::Relaxed);
        info!(segment = %segment_path, %from, %to, "Segment demoted");
        Ok(())
    }

    /// Evaluates every tracked segment and applies the cold/local moves
    /// the policy calls for.
    pub async fn evaluate_and_apply_tiers(&self, cancel: &CancellationToken) -> Result<TierEvaluation> {
        let now = now_ms();
        let mut report = TierEvaluation::default();

        for meta in self.storage.tracked_segments() {
            report.evaluated += 1;
            let age = Duration::from_millis(now.saturating_sub(meta.last_modified_ms).max(0) as u64);
            let desired = self.determine_tier(&meta.key, age);

            let result = match (meta.archived, desired) {
                (false, StorageTier::Cold) => {
                    let current = self.storage.classify(&meta, now).min_local();
                    self.demote_segment(&meta.key, current, desired, cancel)
                        .await
                        .map(|_| report.demoted += 1)
                }
                (true, StorageTier::Hot | StorageTier::Warm) => self
                    .promote_segment(&meta.key, StorageTier::Cold, desired, cancel)
                    .await
                    .map(|_| report.promoted += 1),
                _ => Ok(()),
            };

            match result {
                Ok(()) => {}
                Err(Error::Cancelled(reason)) => return Err(Error::Cancelled(reason)),
                Err(e) => {
                    warn!(segment = %meta.key, error = %e, "Tier change failed");
                    report.failed += 1;
                }
            }
        }

        debug!(
            evaluated = report.evaluated,
            promoted = report.promoted,
            demoted = report.demoted,
            failed = report.failed,
            "Tier evaluation complete"
        );
        Ok(report)
    }

    /// Launches the periodic evaluation loop.
    pub fn start_monitor(self: &Arc<Self>) {
        let mut slot = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }

        let manager = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = self.config.check_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.evaluate_and_apply_tiers(&cancel).await {
                            warn!(error = %e, "Tier evaluation failed");
                        }
                    }
                }
            }
            debug!("Tier monitor stopped");
        }));
        info!(interval_ms = period.as_millis() as u64, "Tier monitor started");
    }

    /// Stops the monitor and cancels any move it has in flight.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Tier monitor ended abnormally");
            }
        }
    }

    pub fn get_stats(&self) -> TierStats {
        let now = now_ms();
        let mut stats = TierStats {
            tracked_patterns: self.access_patterns.len(),
            total_accesses: self.access_patterns.iter().map(|p| p.access_count).sum(),
            promotions: self.promotions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            ..Default::default()
        };
        for meta in self.storage.tracked_segments() {
            let tier = if meta.archived {
                StorageTier::Cold
            } else {
                let age = Duration::from_millis(now.saturating_sub(meta.last_modified_ms).max(0) as u64);
                self.determine_tier(&meta.key, age)
            };
            match tier {
                StorageTier::Hot => stats.hot_segments += 1,
                StorageTier::Warm => stats.warm_segments += 1,
                StorageTier::Cold => stats.cold_segments += 1,
            }
        }
        stats
    }

    pub fn get_cost_analysis(&self) -> CostAnalysis {
        let rates = &self.config.cost_rates;
        let stats = self.storage.get_stats();

        let hot_gb = stats.local_bytes as f64 / BYTES_PER_GB;
        let cold_gb = stats.archived_bytes as f64 / BYTES_PER_GB;
        let hot_cost = hot_gb * rates.hot_per_gb_month;
        let cold_cost = cold_gb * rates.cold_per_gb_month;
        let total = hot_cost + cold_cost;
        let all_hot = (hot_gb + cold_gb) * rates.hot_per_gb_month;
        let savings = all_hot - total;
        let average_archived_gb = if stats.archived_segments > 0 {
            cold_gb / stats.archived_segments as f64
        } else {
            0.0
        };

        CostAnalysis {
            hot_storage_gb: hot_gb,
            cold_storage_gb: cold_gb,
            hot_cost_monthly: hot_cost,
            cold_cost_monthly: cold_cost,
            total_cost_monthly: total,
            all_hot_cost_monthly: all_hot,
            savings_monthly: savings,
            savings_percent: if all_hot > 0.0 { savings / all_hot * 100.0 } else { 0.0 },
            retrieval_cost_per_restore: average_archived_gb * rates.retrieval_per_gb,
        }
    }
}

impl StorageTier {
    /// Cold is not a local tier; a local segment the policy bucket already
    /// calls cold is reported as warm when it is demoted.
    fn min_local(self) -> StorageTier {
        match self {
            StorageTier::Cold => StorageTier::Warm,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::remote::ObjectStoreRemote;
    use crate::segment::Segment;
    use crate::tiered::TieredStorageConfig;
    use bytes::Bytes;
    use std::path::Path;
    use std::time::SystemTime;
    use tempfile::TempDir;
    use tributary_core::Record;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn pattern(count: u64, hz: f64) -> AccessPattern {
        AccessPattern {
            segment_path: "p/00000000000000000000.log".to_string(),
            access_count: count,
            first_access_ms: 0,
            last_access_ms: 0,
            read_bytes: 0,
            average_read_hz: hz,
        }
    }

    #[test]
    fn test_determine_tier_without_reads() {
        let policy = TierPolicy::default();
        assert_eq!(determine_tier(None, Duration::from_secs(60), &policy), StorageTier::Hot);
        assert_eq!(determine_tier(None, 3 * DAY, &policy), StorageTier::Warm);
        assert_eq!(determine_tier(None, 7 * DAY, &policy), StorageTier::Cold);
    }

    #[test]
    fn test_determine_tier_with_reads() {
        let policy = TierPolicy::default();
        // Frequent reads keep old segments hot.
        assert_eq!(determine_tier(Some(&pattern(5, 12.0)), 30 * DAY, &policy), StorageTier::Hot);
        assert_eq!(determine_tier(Some(&pattern(100, 0.1)), 30 * DAY, &policy), StorageTier::Hot);
        // Rare reads fall back to age.
        assert_eq!(determine_tier(Some(&pattern(3, 0.1)), Duration::from_secs(10), &policy), StorageTier::Hot);
        assert_eq!(determine_tier(Some(&pattern(3, 0.1)), 3 * DAY, &policy), StorageTier::Warm);
        assert_eq!(determine_tier(Some(&pattern(3, 0.1)), 8 * DAY, &policy), StorageTier::Cold);
    }

    #[test]
    fn test_record_access_rate_floor() {
        let storage = Arc::new(TieredStorageManager::new(
            TieredStorageConfig::new("/tmp/unused"),
            Arc::new(ObjectStoreRemote::in_memory()),
        ));
        let manager = TierManager::new(TierManagerConfig::default(), storage);
        let key = "orders-0/00000000000000000000.log";

        for i in 0..5 {
            manager.record_access_at(key, 100, 1_000 + i);
        }
        let stats = manager.get_access_stats(key).unwrap();
        assert_eq!(stats.access_count, 5);
        assert_eq!(stats.read_bytes, 500);
        // Five reads within a minute are five per hour, not thousands.
        assert_eq!(stats.average_read_hz, 5.0);

        // Two hours later: six reads over two hours.
        manager.record_access_at(key, 100, 1_000 + 2 * 3_600_000);
        let stats = manager.get_access_stats(key).unwrap();
        assert_eq!(stats.access_count, 6);
        assert_eq!(stats.average_read_hz, 3.0);
    }

    #[tokio::test]
    async fn test_concurrent_record_access_loses_nothing() {
        let storage = Arc::new(TieredStorageManager::new(
            TieredStorageConfig::new("/tmp/unused"),
            Arc::new(ObjectStoreRemote::in_memory()),
        ));
        let manager = Arc::new(TierManager::new(TierManagerConfig::default(), storage));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                for _ in 0..250 {
                    manager.record_access("hot/00000000000000000000.log", 10);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stats = manager.get_access_stats("hot/00000000000000000000.log").unwrap();
        assert_eq!(stats.access_count, 2000);
        assert_eq!(stats.read_bytes, 20_000);
    }

    fn aged_segment(data_dir: &Path, base_offset: i64, age: Duration) -> std::path::PathBuf {
        let dir = data_dir.join("orders-0");
        std::fs::create_dir_all(&dir).unwrap();
        let mut segment = Segment::create(&dir, base_offset, &LogConfig::default()).unwrap();
        for i in 0..10 {
            let mut record = Record::new(None, Bytes::from(vec![1u8; 64])).with_timestamp(i);
            segment.append(&mut record).unwrap();
        }
        segment.seal().unwrap();
        let path = segment.files().data.clone();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - age)
            .unwrap();
        path
    }

    #[tokio::test]
    async fn test_evaluate_demotes_and_promotes() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(TieredStorageManager::new(
            TieredStorageConfig {
                retry_backoff: Duration::from_millis(1),
                ..TieredStorageConfig::new(dir.path())
            },
            Arc::new(ObjectStoreRemote::in_memory()),
        ));
        let manager = TierManager::new(TierManagerConfig::default(), Arc::clone(&storage));

        let cold = storage.track_segment(&aged_segment(dir.path(), 0, 10 * DAY)).unwrap();
        let busy = storage.track_segment(&aged_segment(dir.path(), 10, 10 * DAY)).unwrap();
        let young = storage.track_segment(&aged_segment(dir.path(), 20, Duration::from_secs(60))).unwrap();
        for _ in 0..150 {
            manager.record_access(&busy, 100);
        }

        let cancel = CancellationToken::new();
        let report = manager.evaluate_and_apply_tiers(&cancel).await.unwrap();
        assert_eq!(report.evaluated, 3);
        assert_eq!(report.demoted, 1);
        assert_eq!(report.promoted, 0);
        assert!(storage.is_archived(&cold));
        assert!(!storage.is_archived(&busy));
        assert!(!storage.is_archived(&young));

        // The archived segment becomes popular and is brought back.
        for _ in 0..150 {
            manager.record_access(&cold, 100);
        }
        let report = manager.evaluate_and_apply_tiers(&cancel).await.unwrap();
        assert_eq!(report.promoted, 1);
        assert!(!storage.is_archived(&cold));

        let stats = manager.get_stats();
        assert_eq!(stats.promotions, 1);
        assert_eq!(stats.demotions, 1);
        assert_eq!(stats.hot_segments, 3);
    }

    #[tokio::test]
    async fn test_cost_analysis() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(TieredStorageManager::new(
            TieredStorageConfig::new(dir.path()),
            Arc::new(ObjectStoreRemote::in_memory()),
        ));
        let manager = TierManager::new(TierManagerConfig::default(), Arc::clone(&storage));

        let a = storage.track_segment(&aged_segment(dir.path(), 0, 10 * DAY)).unwrap();
        storage.track_segment(&aged_segment(dir.path(), 10, DAY)).unwrap();
        storage.archive_segment(&a, &CancellationToken::new()).await.unwrap();

        let analysis = manager.get_cost_analysis();
        let gb = 1_000.0 / BYTES_PER_GB;
        assert!((analysis.hot_storage_gb - gb).abs() < 1e-15);
        assert!((analysis.cold_storage_gb - gb).abs() < 1e-15);
        assert!((analysis.total_cost_monthly - gb * (0.023 + 0.004)).abs() < 1e-15);
        assert!(analysis.savings_monthly > 0.0);
        assert!((analysis.savings_percent - (0.019 / 0.046 * 100.0)).abs() < 1e-9);
        assert!((analysis.retrieval_cost_per_restore - gb * 0.01).abs() < 1e-15);
    }
}
