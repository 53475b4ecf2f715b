//! Least-recently-used, expiring map of device serial to baseline image.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::TrackerConfig;
use crate::record::{CachedImageRecord, TrackedImage};

#[derive(Debug)]
struct Slot {
    record: CachedImageRecord,
    last_access: Instant,
    /// Access order; unlike `last_access` it never ties.
    recency: u64,
}

#[derive(Debug, Default)]
struct Entries {
    slots: HashMap<String, Slot>,
    clock: u64,
}

impl Entries {
    fn tick(&mut self) -> u64 {
        self.clock = self.clock.wrapping_add(1);
        self.clock
    }
}

/// Per-device baseline image tracker.
///
/// Records are keyed by serial, so concurrent sessions on different devices
/// only contend on the short map lock.
#[derive(Debug)]
pub struct DeviceImageTracker {
    config: TrackerConfig,
    entries: Mutex<Entries>,
}

impl Default for DeviceImageTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl DeviceImageTracker {
    /// Create an empty tracker.
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Active limits.
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Record the image now on `serial`, replacing any previous record.
    pub fn track_updated_device_image(&self, serial: &str, image: TrackedImage) {
        let record = CachedImageRecord::from_tracked(serial, image);
        let now = Instant::now();
        let mut entries = self.entries.lock();

        self.purge_expired(&mut entries.slots, now);
        if !entries.slots.contains_key(serial) {
            while entries.slots.len() >= self.config.max_entries.max(1) {
                if !Self::evict_oldest(&mut entries.slots) {
                    break;
                }
            }
        }

        info!(
            serial = %serial,
            origin = %record.origin(),
            "Tracking device image"
        );
        let recency = entries.tick();
        entries.slots.insert(
            serial.to_string(),
            Slot {
                record,
                last_access: now,
                recency,
            },
        );
    }

    /// Look up the baseline for `serial`, refreshing its access time.
    ///
    /// Returns `None` if the device was never tracked, was evicted, expired
    /// or was invalidated.
    pub fn baseline_device_image(&self, serial: &str) -> Option<CachedImageRecord> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired = entries
            .slots
            .get(serial)
            .is_some_and(|slot| self.is_expired(slot, now));
        if expired {
            debug!(serial = %serial, "Tracked device image expired");
            entries.slots.remove(serial);
            return None;
        }

        let recency = entries.tick();
        entries.slots.get_mut(serial).map(|slot| {
            slot.last_access = now;
            slot.recency = recency;
            slot.record.clone()
        })
    }

    /// Forget the baseline for `serial`.
    pub fn invalidate_tracking(&self, serial: &str) {
        if self.entries.lock().slots.remove(serial).is_some() {
            info!(serial = %serial, "Invalidated device image tracking");
        }
    }

    /// Forget every baseline. Call on shutdown of the owning process.
    pub fn invalidate_all(&self) {
        let mut entries = self.entries.lock();
        let count = entries.slots.len();
        entries.slots.clear();
        debug!(count, "Invalidated all device image tracking");
    }

    /// Number of records, including ones that expired but were not yet purged.
    pub fn len(&self) -> usize {
        self.entries.lock().slots.len()
    }

    /// Whether no device is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().slots.is_empty()
    }

    /// Whether `serial` has a live record. Does not refresh its access time.
    pub fn contains(&self, serial: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .slots
            .get(serial)
            .is_some_and(|slot| !self.is_expired(slot, now))
    }

    fn is_expired(&self, slot: &Slot, now: Instant) -> bool {
        now.saturating_duration_since(slot.last_access) > self.config.expire_after
    }

    fn purge_expired(&self, entries: &mut HashMap<String, Slot>, now: Instant) {
        entries.retain(|serial, slot| {
            let keep = !self.is_expired(slot, now);
            if !keep {
                debug!(serial = %serial, "Dropping expired device image record");
            }
            keep
        });
    }

    fn evict_oldest(entries: &mut HashMap<String, Slot>) -> bool {
        let oldest = entries
            .iter()
            .min_by_key(|(_, slot)| slot.recency)
            .map(|(serial, _)| serial.clone());

        match oldest {
            Some(serial) => {
                debug!(serial = %serial, "Evicting least recently used device image record");
                entries.remove(&serial);
                true
            }
            None => false,
        }
    }
}
