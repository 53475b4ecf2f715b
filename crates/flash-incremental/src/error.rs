//! Error types for incremental flashing
//!
//! Failures fall into two families. [`TargetSetupError`] aborts the current
//! attempt with a machine-readable [`ErrorIdentifier`]. [`DeviceNotAvailableError`]
//! means the device itself was lost and is always propagated unwrapped, so
//! retry layers can re-provision the device instead of retrying the update.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closed set of failure categories used for triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorIdentifier {
    /// Generic failure of the incremental update flow
    IncrementalFlashingError = 1,
    /// The block comparison tool failed for a partition
    BlockCompareError = 2,
    /// A temp directory or file could not be created or populated
    FailToCreateFile = 3,
    /// The device answered in an unexpected way (e.g. rebooted into recovery)
    DeviceUnexpectedResponse = 4,
}

impl ErrorIdentifier {
    /// Stable upper-case name.
    pub fn name(self) -> &'static str {
        match self {
            ErrorIdentifier::IncrementalFlashingError => "INCREMENTAL_FLASHING_ERROR",
            ErrorIdentifier::BlockCompareError => "BLOCK_COMPARE_ERROR",
            ErrorIdentifier::FailToCreateFile => "FAIL_TO_CREATE_FILE",
            ErrorIdentifier::DeviceUnexpectedResponse => "DEVICE_UNEXPECTED_RESPONSE",
        }
    }

    /// Numeric code.
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for ErrorIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fatal setup failure that aborts the current update attempt.
#[derive(Error, Debug)]
#[error("{message} [{identifier}]")]
pub struct TargetSetupError {
    message: String,
    identifier: ErrorIdentifier,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl TargetSetupError {
    /// Create a setup error.
    pub fn new(message: impl Into<String>, identifier: ErrorIdentifier) -> Self {
        Self {
            message: message.into(),
            identifier,
            source: None,
        }
    }

    /// Attach the underlying cause.
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Convert an internal `anyhow` failure, keeping its context chain in the message.
    pub fn from_anyhow(err: anyhow::Error, identifier: ErrorIdentifier) -> Self {
        Self::new(format!("{err:#}"), identifier)
    }

    /// Human-readable message without the identifier suffix.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Failure category.
    pub fn identifier(&self) -> ErrorIdentifier {
        self.identifier
    }
}

/// The device disappeared or stopped responding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Device {serial} not available: {message}")]
pub struct DeviceNotAvailableError {
    /// Serial of the lost device
    pub serial: String,
    /// What was being attempted
    pub message: String,
}

impl DeviceNotAvailableError {
    /// Create a device-lost error.
    pub fn new(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            message: message.into(),
        }
    }
}

/// Any failure surfaced by the update flow.
#[derive(Error, Debug)]
pub enum FlashError {
    /// Setup failed; the caller should fall back or fail the attempt
    #[error("Setup failed: {0}")]
    Setup(#[from] TargetSetupError),

    /// The device was lost
    #[error(transparent)]
    DeviceNotAvailable(#[from] DeviceNotAvailableError),
}

impl FlashError {
    /// Failure category, `None` for device-lost errors.
    pub fn identifier(&self) -> Option<ErrorIdentifier> {
        match self {
            FlashError::Setup(e) => Some(e.identifier()),
            FlashError::DeviceNotAvailable(_) => None,
        }
    }

    /// Whether the device itself was lost.
    pub fn is_device_unavailable(&self) -> bool {
        matches!(self, FlashError::DeviceNotAvailable(_))
    }
}

/// Invalid configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A parallelism knob was zero
    #[error("Parallelism must be at least 1: {0}")]
    ZeroParallelism(&'static str),

    /// The on-device staging directory is empty or relative
    #[error("Invalid staging directory: '{0}'")]
    InvalidStagingDir(String),

    /// The patch size cap is zero
    #[error("Maximum patch size must be non-zero")]
    ZeroPatchLimit,
}

/// Result alias for the update flow.
pub type FlashResult<T> = std::result::Result<T, FlashError>;
