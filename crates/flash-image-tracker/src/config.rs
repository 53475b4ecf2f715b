//! Tracker limits

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of devices tracked at once.
pub const DEFAULT_MAX_ENTRIES: usize = 20;

/// Default time an untouched record stays valid.
pub const DEFAULT_EXPIRE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Capacity and expiry limits for [`crate::DeviceImageTracker`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Maximum number of device records; the least recently accessed one is
    /// evicted when a new device would exceed it.
    pub max_entries: usize,

    /// Records not accessed for this long are dropped.
    pub expire_after: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            expire_after: DEFAULT_EXPIRE_AFTER,
        }
    }
}

impl TrackerConfig {
    /// Set the maximum number of records. Zero is treated as one.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    /// Set the idle expiry window.
    pub fn with_expire_after(mut self, expire_after: Duration) -> Self {
        self.expire_after = expire_after;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TrackerConfig::default();
        assert_eq!(config.max_entries, 20);
        assert_eq!(config.expire_after, Duration::from_secs(86_400));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        assert_eq!(TrackerConfig::default().with_max_entries(0).max_entries, 1);
    }
}
