//! Snapshot-based incremental updates of Android device images.
//!
//! A full flash rewrites every partition. When a device still runs a build
//! that was tracked after an earlier flash, this crate instead computes
//! block-level patches between that baseline and the target build, pushes
//! them to the device and lets `snapshotctl` apply (or map) them. Static
//! partitions are still flashed over fastboot.
//!
//! The flow is split in two phases:
//!
//! 1. [`IncrementalFlashManager::initialize`] checks eligibility and starts
//!    extraction and block comparison in the background.
//! 2. [`IncrementalSession::update_device`] waits for that preparation and
//!    updates the device. The session is then either committed with
//!    [`IncrementalSession::clean_after_setup`] or reverted with
//!    [`IncrementalSession::teardown_device`].
//!
//! Any error means the caller should fall back to a full flash.
//!
//! - [`build`]: target build description
//! - [`config`]: feature configuration
//! - [`device`]: the device abstraction the flow drives
//! - [`diff`]: the block-compare tool
//! - [`eligibility`]: checks deciding whether an update may be incremental
//! - [`error`]: error types
//! - [`flashing`]: fastboot flashing helpers
//! - [`manager`]: session factory and image tracking
//! - [`metrics`](crate::metrics): invocation metrics
//! - [`preparation`]: background extraction and diffing
//! - [`session`]: one update attempt
//!
//! # Example
//!
//! ```no_run
//! use flash_incremental::prelude::*;
//! use flash_image_tracker::DeviceImageTracker;
//! use std::sync::Arc;
//!
//! async fn update(device: &dyn FlashDevice, build: &DeviceBuildInfo) -> FlashResult<bool> {
//!     let manager = IncrementalFlashManager::new(
//!         Arc::new(DeviceImageTracker::default()),
//!         Arc::new(InvocationMetrics::new()),
//!         IncrementalConfig::default(),
//!     )
//!     .map_err(|e| TargetSetupError::new(e.to_string(), ErrorIdentifier::IncrementalFlashingError))?;
//!
//!     let Some(mut session) = manager.initialize(device, build).await? else {
//!         return Ok(false);
//!     };
//!     session
//!         .update_device(device, build.bootloader.as_deref(), build.baseband.as_deref())
//!         .await?;
//!     session.clean_after_setup().await;
//!     manager.track_flashed_image(device.serial(), build);
//!     Ok(true)
//! }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod build;
pub mod config;
pub mod device;
pub mod diff;
pub mod eligibility;
pub mod error;
pub mod flashing;
pub mod manager;
pub mod metrics;
pub mod preparation;
pub mod prelude;
pub mod session;

mod files;

pub use build::DeviceBuildInfo;
pub use config::{IncrementalConfig, IncrementalConfigBuilder, SnapshotMode};
pub use device::{
    CommandResult, CommandStatus, DeviceResult, DeviceState, FlashDevice, RecoveryMode,
    SnapuserdWaitPhase,
};
pub use diff::DiffTool;
pub use eligibility::{Eligibility, IneligibleReason};
pub use error::{
    ConfigError, DeviceNotAvailableError, ErrorIdentifier, FlashError, FlashResult,
    TargetSetupError,
};
pub use manager::IncrementalFlashManager;
pub use crate::metrics::{GroupMetricKey, InvocationMetrics, MetricKey, MetricValue};
pub use preparation::{PreparationHandle, PreparationOutcome, PreparationStage, PreparedImages};
pub use session::{IncrementalSession, SessionState, UpdateReport};
