//! Convenience re-exports

pub use crate::config::TrackerConfig;
pub use crate::record::{CachedImageRecord, TrackedImage};
pub use crate::tracker::DeviceImageTracker;
