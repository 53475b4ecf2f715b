//! Invocation-scoped metrics.
//!
//! [`InvocationMetrics`] keeps every value in memory so the harness can attach
//! them to the invocation report. Counters and group values are also
//! forwarded to the [`metrics`] facade for whatever recorder is installed.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Named invocation metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKey {
    /// Incremental update attempts
    IncrementalFlashingAttemptCount,
    /// Milliseconds spent waiting for the preparation stage
    IncrementalFlashingWaitParallelSetup,
    /// Updates that crossed build flavors
    IncrementalAcrossReleaseCount,
    /// Device build differed from the tracked baseline
    DeviceImageCacheMismatch,
    /// `branch:build:flavor` of the baseline used
    DeviceImageCacheOrigin,
    /// Reasons an incremental update fell back
    IncrementalFallbackReason,
    /// Failed incremental updates
    IncrementalFlashingUpdateFailure,
    /// Failed patch push fan-outs
    IncrementalFlashingPushFailure,
    /// Failed `flashall` of static partitions
    IncrementalFlashingFlashFailure,
    /// Failed teardown steps
    IncrementalFlashingTeardownFailure,
    /// Device landed in recovery after flashing
    IncrementalRecoveryFallback,
    /// Boot-complete waits that timed out
    IncrementalFlashingBootTimeout,
}

impl MetricKey {
    /// Metric name as exported.
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKey::IncrementalFlashingAttemptCount => "incremental_flashing_attempt_count",
            MetricKey::IncrementalFlashingWaitParallelSetup => {
                "incremental_flashing_wait_parallel_setup"
            }
            MetricKey::IncrementalAcrossReleaseCount => "incremental_across_release_count",
            MetricKey::DeviceImageCacheMismatch => "device_image_cache_mismatch",
            MetricKey::DeviceImageCacheOrigin => "device_image_cache_origin",
            MetricKey::IncrementalFallbackReason => "incremental_fallback_reason",
            MetricKey::IncrementalFlashingUpdateFailure => "incremental_flashing_update_failure",
            MetricKey::IncrementalFlashingPushFailure => "incremental_flashing_push_failure",
            MetricKey::IncrementalFlashingFlashFailure => "incremental_flashing_flash_failure",
            MetricKey::IncrementalFlashingTeardownFailure => {
                "incremental_flashing_teardown_failure"
            }
            MetricKey::IncrementalRecoveryFallback => "incremental_recovery_fallback",
            MetricKey::IncrementalFlashingBootTimeout => "incremental_flashing_boot_timeout",
        }
    }
}

/// Metrics recorded per named item, such as one value per partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupMetricKey {
    /// Patch size per patch file
    IncrementalFlashingPatchesSize,
    /// Target image size per dynamic partition
    IncrementalFlashingTargetSize,
}

impl GroupMetricKey {
    /// Metric name as exported.
    pub fn as_str(self) -> &'static str {
        match self {
            GroupMetricKey::IncrementalFlashingPatchesSize => "incremental_flashing_patches_size",
            GroupMetricKey::IncrementalFlashingTargetSize => "incremental_flashing_target_size",
        }
    }
}

/// A recorded metric value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricValue {
    /// Summed counter
    Count(u64),
    /// Comma-joined appended strings
    Text(String),
}

/// In-memory metric store for one invocation.
#[derive(Debug, Default)]
pub struct InvocationMetrics {
    values: Mutex<HashMap<MetricKey, MetricValue>>,
    groups: Mutex<HashMap<(GroupMetricKey, String), u64>>,
}

impl InvocationMetrics {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` to a counter.
    pub fn add_count(&self, key: MetricKey, amount: u64) {
        ::metrics::counter!(key.as_str()).increment(amount);
        let mut values = self.values.lock();
        let next = match values.get(&key) {
            Some(MetricValue::Count(n)) => n.saturating_add(amount),
            _ => amount,
        };
        values.insert(key, MetricValue::Count(next));
    }

    /// Append a string value; repeated values are comma-joined.
    pub fn add_text(&self, key: MetricKey, value: impl Into<String>) {
        let value = value.into();
        let mut values = self.values.lock();
        match values.get_mut(&key) {
            Some(MetricValue::Text(existing)) => {
                existing.push(',');
                existing.push_str(&value);
            }
            _ => {
                values.insert(key, MetricValue::Text(value));
            }
        }
    }

    /// Record `value` for `name` within a group, replacing any earlier value.
    pub fn add_group(&self, key: GroupMetricKey, name: impl Into<String>, value: u64) {
        let name = name.into();
        ::metrics::gauge!(key.as_str(), "name" => name.clone()).set(value as f64);
        self.groups.lock().insert((key, name), value);
    }

    /// Current counter value, zero if never incremented.
    pub fn count(&self, key: MetricKey) -> u64 {
        match self.values.lock().get(&key) {
            Some(MetricValue::Count(n)) => *n,
            _ => 0,
        }
    }

    /// Current text value.
    pub fn text(&self, key: MetricKey) -> Option<String> {
        match self.values.lock().get(&key) {
            Some(MetricValue::Text(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// Value recorded for `name` in a group.
    pub fn group(&self, key: GroupMetricKey, name: &str) -> Option<u64> {
        self.groups.lock().get(&(key, name.to_string())).copied()
    }

    /// Every value in a group, sorted by name.
    pub fn group_entries(&self, key: GroupMetricKey) -> Vec<(String, u64)> {
        let mut entries: Vec<_> = self
            .groups
            .lock()
            .iter()
            .filter(|((k, _), _)| *k == key)
            .map(|((_, name), value)| (name.clone(), *value))
            .collect();
        entries.sort();
        entries
    }

    /// Copy of every non-group value.
    pub fn snapshot(&self) -> HashMap<MetricKey, MetricValue> {
        self.values.lock().clone()
    }
}
