//! Tracked image records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Description of an image that was just flashed onto a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackedImage {
    /// Device image archive or extracted directory
    pub device_image: PathBuf,
    /// Bootloader image flashed alongside, if any
    pub bootloader: Option<PathBuf>,
    /// Baseband image flashed alongside, if any
    pub baseband: Option<PathBuf>,
    /// Build id of the flashed image
    pub build_id: String,
    /// Branch the build came from
    pub branch: String,
    /// Build flavor, for example `husky-userdebug`
    pub flavor: String,
}

impl TrackedImage {
    /// Create a record without bootloader or baseband images.
    pub fn new(
        device_image: PathBuf,
        build_id: impl Into<String>,
        branch: impl Into<String>,
        flavor: impl Into<String>,
    ) -> Self {
        Self {
            device_image,
            bootloader: None,
            baseband: None,
            build_id: build_id.into(),
            branch: branch.into(),
            flavor: flavor.into(),
        }
    }

    /// Attach the bootloader image.
    pub fn with_bootloader(mut self, bootloader: PathBuf) -> Self {
        self.bootloader = Some(bootloader);
        self
    }

    /// Attach the baseband image.
    pub fn with_baseband(mut self, baseband: PathBuf) -> Self {
        self.baseband = Some(baseband);
        self
    }
}

/// Baseline image recorded for one device serial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedImageRecord {
    /// Device serial the record belongs to
    pub serial: String,
    /// Device image archive or extracted directory
    pub device_image: PathBuf,
    /// Bootloader image, if one was tracked
    pub bootloader: Option<PathBuf>,
    /// Baseband image, if one was tracked
    pub baseband: Option<PathBuf>,
    /// Build id
    pub build_id: String,
    /// Branch
    pub branch: String,
    /// Build flavor
    pub flavor: String,
    /// When the record was created
    pub tracked_at: DateTime<Utc>,
}

impl CachedImageRecord {
    pub(crate) fn from_tracked(serial: &str, image: TrackedImage) -> Self {
        Self {
            serial: serial.to_string(),
            device_image: image.device_image,
            bootloader: image.bootloader,
            baseband: image.baseband,
            build_id: image.build_id,
            branch: image.branch,
            flavor: image.flavor,
            tracked_at: Utc::now(),
        }
    }

    /// `branch:build_id:flavor`, the identity used in logs and metrics.
    pub fn origin(&self) -> String {
        format!("{}:{}:{}", self.branch, self.build_id, self.flavor)
    }

    /// Every file referenced by the record.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.device_image.as_path())
            .chain(self.bootloader.as_deref())
            .chain(self.baseband.as_deref())
    }

    /// Whether every referenced file is still present on disk.
    ///
    /// The tracker never owns these files; they can disappear underneath it.
    pub fn files_exist(&self) -> bool {
        self.files().all(Path::exists)
    }
}
