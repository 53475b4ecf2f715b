//! Convenience re-exports for driving incremental updates

pub use crate::build::DeviceBuildInfo;
pub use crate::config::{IncrementalConfig, SnapshotMode};
pub use crate::device::{
    CommandResult, DeviceResult, DeviceState, FlashDevice, RecoveryMode, SnapuserdWaitPhase,
};
pub use crate::error::{
    DeviceNotAvailableError, ErrorIdentifier, FlashError, FlashResult, TargetSetupError,
};
pub use crate::manager::IncrementalFlashManager;
pub use crate::metrics::{InvocationMetrics, MetricKey};
pub use crate::session::{IncrementalSession, SessionState, UpdateReport};
