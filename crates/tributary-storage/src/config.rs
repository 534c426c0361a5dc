//! Log Configuration
//!
//! ## LogConfig
//!
//! Controls how a partition log lays out its segments:
//!
//! - **max_segment_bytes**: roll to a new segment once the active one reaches this size (default: 1GiB)
//! - **index_interval_bytes**: minimum data bytes between sparse index entries (default: 4KiB)
//! - **flush_on_append**: fsync data and index files after every append (default: false)
//!
//! Index entries store byte positions as 32-bit signed integers, so a segment
//! can never grow past `i32::MAX` bytes. `validate()` enforces this.
//!
//! ## Usage
//!
//! ```ignore
//! use tributary_storage::LogConfig;
//!
//! let config = LogConfig {
//!     max_segment_bytes: 64 * 1024 * 1024,
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Size at which the active segment is rolled (default: 1GiB)
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: u64,

    /// Data bytes between sparse index entries (default: 4096)
    #[serde(default = "default_index_interval_bytes")]
    pub index_interval_bytes: u64,

    /// Sync data and index files after every append (default: false)
    #[serde(default)]
    pub flush_on_append: bool,
}

fn default_max_segment_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_index_interval_bytes() -> u64 {
    4096
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: default_max_segment_bytes(),
            index_interval_bytes: default_index_interval_bytes(),
            flush_on_append: false,
        }
    }
}

impl LogConfig {
    /// Checks the settings against the on-disk format limits.
    pub fn validate(&self) -> Result<()> {
        if self.max_segment_bytes == 0 {
            return Err(Error::InvalidConfig(
                "max_segment_bytes must be positive".to_string(),
            ));
        }
        if self.max_segment_bytes > i32::MAX as u64 {
            return Err(Error::InvalidConfig(format!(
                "max_segment_bytes {} exceeds index position limit {}",
                self.max_segment_bytes,
                i32::MAX
            )));
        }
        if self.index_interval_bytes == 0 {
            return Err(Error::InvalidConfig(
                "index_interval_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serializes `Duration` fields as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = LogConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.index_interval_bytes, 4096);
    }

    #[test]
    fn test_segment_size_limited_to_i32() {
        let config = LogConfig {
            max_segment_bytes: i32::MAX as u64 + 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: LogConfig = serde_json::from_str(r#"{"max_segment_bytes": 1024}"#).unwrap();
        assert_eq!(config.max_segment_bytes, 1024);
        assert_eq!(config.index_interval_bytes, 4096);
        assert!(!config.flush_on_append);
    }
}
