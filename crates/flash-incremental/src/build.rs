//! Build artifacts handed to the update flow.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// `build.prop` key holding the security patch level.
pub const SECURITY_PATCH_PROPERTY: &str = "ro.build.version.security_patch";

/// The build about to be put on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBuildInfo {
    /// Build id
    pub build_id: String,
    /// Branch the build came from
    pub branch: String,
    /// Build flavor
    pub flavor: String,
    /// Device image: a zip archive or an extracted directory
    pub device_image: PathBuf,
    /// Bootloader image
    pub bootloader: Option<PathBuf>,
    /// Baseband (radio) image
    pub baseband: Option<PathBuf>,
    /// `build.prop` of the target build
    pub build_prop: Option<PathBuf>,
}

impl DeviceBuildInfo {
    /// Describe a build with only a device image.
    pub fn new(
        build_id: impl Into<String>,
        branch: impl Into<String>,
        flavor: impl Into<String>,
        device_image: impl Into<PathBuf>,
    ) -> Self {
        Self {
            build_id: build_id.into(),
            branch: branch.into(),
            flavor: flavor.into(),
            device_image: device_image.into(),
            bootloader: None,
            baseband: None,
            build_prop: None,
        }
    }

    /// Attach a bootloader image.
    #[must_use]
    pub fn with_bootloader(mut self, path: impl Into<PathBuf>) -> Self {
        self.bootloader = Some(path.into());
        self
    }

    /// Attach a baseband image.
    #[must_use]
    pub fn with_baseband(mut self, path: impl Into<PathBuf>) -> Self {
        self.baseband = Some(path.into());
        self
    }

    /// Attach the target `build.prop`.
    #[must_use]
    pub fn with_build_prop(mut self, path: impl Into<PathBuf>) -> Self {
        self.build_prop = Some(path.into());
        self
    }

    /// Security patch level declared by the target build, if any.
    pub fn security_patch_level(&self) -> Option<String> {
        match &self.build_prop {
            Some(path) => read_security_patch(path),
            None => {
                debug!("No target build.prop found for comparison");
                None
            }
        }
    }
}

/// Read [`SECURITY_PATCH_PROPERTY`] from a `build.prop` file.
///
/// Unreadable files are logged and treated as declaring no patch level.
pub fn read_security_patch(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_property(&contents, SECURITY_PATCH_PROPERTY),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read build.prop");
            None
        }
    }
}

/// Find `key=value` in properties text.
pub fn parse_property(contents: &str, key: &str) -> Option<String> {
    contents
        .lines()
        .filter_map(|line| line.trim().split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.trim().to_string())
}
