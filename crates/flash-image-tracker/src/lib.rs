//! Tracking of the image last flashed onto each device.
//!
//! After a successful full flash the orchestration layer records which build
//! ended up on a device. A later incremental update uses that record as its
//! baseline: if the device still runs the tracked build, only the differences
//! need to be applied.
//!
//! The tracker is an explicitly constructed service. Share it with
//! `Arc<DeviceImageTracker>` and call [`DeviceImageTracker::invalidate_all`]
//! when the owning process shuts down.
//!
//! - [`config`]: capacity and expiry limits
//! - [`record`]: tracked image records
//! - [`tracker`]: the tracker itself
//!
//! # Example
//!
//! ```
//! use flash_image_tracker::prelude::*;
//! use std::path::PathBuf;
//!
//! let tracker = DeviceImageTracker::new(TrackerConfig::default());
//! tracker.track_updated_device_image(
//!     "serial-1",
//!     TrackedImage::new(PathBuf::from("/cache/img.zip"), "8000000", "main", "userdebug"),
//! );
//! let baseline = tracker.baseline_device_image("serial-1");
//! assert_eq!(baseline.map(|r| r.build_id), Some("8000000".to_string()));
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod prelude;
pub mod record;
pub mod tracker;

pub use config::TrackerConfig;
pub use record::{CachedImageRecord, TrackedImage};
pub use tracker::DeviceImageTracker;
