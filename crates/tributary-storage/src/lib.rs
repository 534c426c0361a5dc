//! Tributary Storage Engine
//!
//! This crate implements the on-disk log of Tributary - an append-only,
//! offset-addressed record log split into segments, with crash recovery,
//! point-in-time snapshots and tiered archival to object storage.
//!
//! ## What is a Log?
//!
//! A log is one directory of segment files. Each segment owns a contiguous
//! range of offsets and three files:
//!
//! 1. **`<base>.log`**: length-prefixed, CRC-checked record frames
//! 2. **`<base>.index`**: sparse map from relative offset to byte position
//! 3. **`<base>.timeindex`**: sparse map from timestamp to relative offset
//!
//! Only the newest segment (the active segment) accepts appends. When it
//! reaches `max_segment_bytes` it is sealed and a new one starts at the
//! next offset.
//!
//! ## Architecture Overview
//!
//! ```text
//!   append / read
//!        │
//!        ▼
//! ┌─────────────────┐      open after crash      ┌──────────────────┐
//! │      Log        │ ◄───────────────────────── │  LogRecovery     │
//! │ - segments      │                            │  SegmentRecovery │
//! │ - retention     │                            └──────────────────┘
//! └───┬─────────┬───┘
//!     │         │ sealed segments
//!     │         ▼
//!     │  ┌──────────────────────┐  access stats  ┌───────────────┐
//!     │  │ TieredStorageManager │ ◄───────────── │  TierManager  │
//!     │  │ - archive / restore  │                │  hot/warm/cold│
//!     │  └──────────┬───────────┘                └───────────────┘
//!     │             │ whole segment files
//!     │             ▼
//!     │      ┌─────────────┐
//!     │      │ S3 / MinIO  │
//!     │      └─────────────┘
//!     ▼
//! ┌─────────────────┐
//! │ SnapshotManager │  consistent copies in <log>/.snapshots/
//! └─────────────────┘
//! ```
//!
//! ## Main Components
//!
//! ### Segment
//! One segment's files. Appends write the frame, then any index entries the
//! sparse index policy calls for. Reads binary-search the offset index and
//! scan forward at most one index interval.
//!
//! ### SegmentRecovery / recover_from_directory
//! Validates every frame, truncates torn or corrupted tails at the last
//! good record, and rebuilds indexes that do not match the data. A log that
//! went down mid-write reopens with every fully written record intact.
//!
//! ### SnapshotManager
//! Copies the flushed prefix of every segment into a snapshot directory and
//! restores it into a fresh log directory.
//!
//! ### TieredStorageManager / TierManager
//! Moves sealed segments to object storage and back. Reads of an archived
//! segment restore it transparently; a per-segment migration lock keeps
//! readers and migrations from seeing half-moved files.
//!
//! ## Usage Example
//!
//! ```ignore
//! use tributary_storage::{recover_from_directory, LogConfig};
//! use tributary_core::Record;
//! use bytes::Bytes;
//!
//! let (log, recovery) = recover_from_directory("/data/orders-0", LogConfig::default())?;
//! if !recovery.is_clean() {
//!     tracing::warn!(truncated = recovery.total_truncated_bytes, "Log recovered with data loss");
//! }
//!
//! let offset = log.append(Record::new(Some(Bytes::from("user-1")), Bytes::from("hello"))).await?;
//! let record = log.read(offset).await?;
//! ```
//!
//! ## Design Decisions
//!
//! ### Why Sparse Indexes?
//! - **Small**: one entry per `index_interval_bytes` of data, so indexes stay in memory
//! - **Rebuildable**: the same builder runs on append and on recovery, so a
//!   rebuilt index is byte-identical to the one it replaces
//!
//! ### Why Whole-Segment Archival?
//! - **Simple state**: a segment is either local or archived, never split
//! - **Sealed only**: the active segment never leaves local disk

pub mod config;
pub mod error;
pub mod log;
pub mod recovery;
pub mod remote;
pub mod retention;
pub mod segment;
pub mod snapshot;
pub mod tier_manager;
pub mod tiered;

pub use config::LogConfig;
pub use error::{Error, Result};
pub use log::{Log, SegmentInfo};
pub use recovery::{recover_from_directory, LogRecoveryResult, RecoveryResult, SegmentRecovery};
pub use remote::{ObjectStoreRemote, RemoteStore, RemoteStoreConfig};
pub use retention::RetentionPolicy;
pub use segment::{Segment, SegmentFiles};
pub use snapshot::{Snapshot, SnapshotManager, SnapshotPolicy};
pub use tier_manager::{AccessPattern, CostAnalysis, TierManager, TierManagerConfig, TierPolicy, TierStats};
pub use tiered::{StorageTier, TieredStorageConfig, TieredStorageManager, TieredStorageStats};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
