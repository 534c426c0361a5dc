//! Retention
//!
//! Deletes whole segments from the front of a log once they fall outside
//! the retention policy. Deletion walks segments oldest first and stops at
//! the first segment that must be kept, so the log start offset only ever
//! moves forward and no holes appear. The active segment is never deleted.
//!
//! A segment is expired by time when its newest record is older than
//! `retention_ms`; by size while the log's total bytes exceed
//! `retention_bytes`. Either limit can be disabled with `-1`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::log::{run_blocking, Log, SegmentHandle};
use crate::now_ms;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Maximum total log size in bytes, -1 for unlimited (default: -1)
    #[serde(default = "default_retention_bytes")]
    pub retention_bytes: i64,

    /// Maximum record age in milliseconds, -1 for unlimited (default: 7 days)
    #[serde(default = "default_retention_ms")]
    pub retention_ms: i64,
}

fn default_retention_bytes() -> i64 {
    -1
}

fn default_retention_ms() -> i64 {
    Duration::from_secs(7 * 24 * 3600).as_millis() as i64
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_bytes: default_retention_bytes(),
            retention_ms: default_retention_ms(),
        }
    }
}

impl Log {
    /// Removes expired segments and returns how many were deleted.
    pub async fn delete_segments_if_needed(&self, policy: &RetentionPolicy) -> Result<usize> {
        let mut segments = self.segments.write().await;
        let now = now_ms();

        let sizes: Vec<u64> = segments.iter().map(|h| self.segment_size(h)).collect();
        let mut remaining: u64 = sizes.iter().sum();
        let mut expired = 0;

        for (handle, size) in segments.iter().zip(&sizes).take(segments.len().saturating_sub(1)) {
            let over_size = policy.retention_bytes >= 0 && remaining > policy.retention_bytes as u64;
            let over_age = policy.retention_ms >= 0
                && self
                    .segment_newest_ms(handle)
                    .is_some_and(|newest| now - newest > policy.retention_ms);
            if !over_size && !over_age {
                break;
            }
            remaining -= size;
            expired += 1;
        }

        for handle in segments.drain(..expired).collect::<Vec<_>>() {
            self.forget_tiered(&handle).await?;
            let base_offset = handle.base_offset;
            run_blocking(move || handle.remove_local()).await?;
            info!(dir = ?self.dir, base_offset, "Deleted segment past retention");
        }
        Ok(expired)
    }

    fn segment_size(&self, handle: &Arc<SegmentHandle>) -> u64 {
        if let Some(size) = handle.peek(|s| s.size()) {
            return size;
        }
        self.tracked_metadata(handle).map(|m| m.size_bytes).unwrap_or(0)
    }

    /// Timestamp of the newest record, falling back to the archived file's
    /// modification time for segments not loaded in memory.
    fn segment_newest_ms(&self, handle: &Arc<SegmentHandle>) -> Option<i64> {
        match handle.peek(|s| s.max_timestamp()) {
            Some(newest) => newest,
            None => self.tracked_metadata(handle).map(|m| m.last_modified_ms),
        }
    }

    fn tracked_metadata(&self, handle: &SegmentHandle) -> Option<crate::tiered::SegmentMetadata> {
        let tiering = self.tiering.as_ref()?;
        let key = tiering.key(&handle.files).ok()?;
        tiering.storage.segment_metadata(&key)
    }
}
