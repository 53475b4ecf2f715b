//! Entry point tying the image tracker, eligibility checks and sessions together.

use flash_image_tracker::{CachedImageRecord, DeviceImageTracker, TrackedImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{info, instrument, warn};

use crate::build::DeviceBuildInfo;
use crate::config::{IncrementalConfig, VERITY_HASH_DIR};
use crate::device::{DeviceResult, FlashDevice, shell_logged};
use crate::diff::DiffTool;
use crate::eligibility::{DUMP_VERITY_HASH, Eligibility, check_eligibility};
use crate::error::{ConfigError, ErrorIdentifier, FlashResult, TargetSetupError};
use crate::files;
use crate::metrics::InvocationMetrics;
use crate::preparation::PreparationStage;
use crate::session::{BaselineFiles, IncrementalSession};

/// Starts incremental update sessions and records what ends up on devices.
///
/// One manager is shared by every device of a host. The tracker is usually
/// shared with other managers as well.
#[derive(Debug)]
pub struct IncrementalFlashManager {
    tracker: Arc<DeviceImageTracker>,
    metrics: Arc<InvocationMetrics>,
    config: IncrementalConfig,
}

impl IncrementalFlashManager {
    /// Create a manager.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn new(
        tracker: Arc<DeviceImageTracker>,
        metrics: Arc<InvocationMetrics>,
        config: IncrementalConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            tracker,
            metrics,
            config,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &IncrementalConfig {
        &self.config
    }

    /// Shared image tracker.
    pub fn tracker(&self) -> &Arc<DeviceImageTracker> {
        &self.tracker
    }

    /// Metrics of the current invocation.
    pub fn metrics(&self) -> &Arc<InvocationMetrics> {
        &self.metrics
    }

    /// Check eligibility and start background preparation.
    ///
    /// Returns `Ok(None)` when the device must be fully flashed instead; the
    /// reason is logged. On success the baseline files are already hard-linked
    /// into session storage, so the tracked originals may be evicted.
    ///
    /// # Errors
    ///
    /// Returns a device-lost error from the eligibility probes, or a setup
    /// error if the baseline cannot be linked or the diff tool resolved.
    #[instrument(skip(self, device, build), fields(serial = device.serial(), build = %build.build_id))]
    pub async fn initialize(
        &self,
        device: &dyn FlashDevice,
        build: &DeviceBuildInfo,
    ) -> FlashResult<Option<IncrementalSession>> {
        let serial = device.serial();
        let baseline = self.tracker.baseline_device_image(serial);
        let eligibility =
            check_eligibility(device, build, baseline, &self.config, &self.metrics).await?;
        let Eligibility::Eligible {
            baseline,
            cross_release,
        } = eligibility
        else {
            return Ok(None);
        };

        let work_root = self.config.work_root.as_deref();
        let verity_hashes = if self.config.use_merkle_tree {
            pull_verity_hashes(device, work_root).await?
        } else {
            None
        };
        let (image_dir, image) = link_baseline_image(&baseline, work_root)?;
        let baseline_files = link_baseline_firmware(&baseline, work_root)?;
        let diff_tool = DiffTool::resolve(self.config.diff_tool.as_deref(), work_root)?;

        let preparation = PreparationStage {
            source_image: image,
            source_guard: Some(image_dir),
            target_image: build.device_image.clone(),
            diff_tool,
            parallelism: self.config.diff_parallelism,
            diff_timeout: self.config.diff_timeout,
            work_root: self.config.work_root.clone(),
            verity_hashes,
        }
        .spawn();
        info!(baseline = %baseline.origin(), cross_release, "Incremental preparation started");

        Ok(Some(IncrementalSession::new(
            serial,
            self.config.clone(),
            Arc::clone(&self.metrics),
            baseline,
            cross_release,
            baseline_files,
            preparation,
        )))
    }

    /// Record that `build` was flashed onto device `serial`.
    pub fn track_flashed_image(&self, serial: &str, build: &DeviceBuildInfo) {
        let mut image = TrackedImage::new(
            build.device_image.clone(),
            build.build_id.clone(),
            build.branch.clone(),
            build.flavor.clone(),
        );
        if let Some(bootloader) = &build.bootloader {
            image = image.with_bootloader(bootloader.clone());
        }
        if let Some(baseband) = &build.baseband {
            image = image.with_baseband(baseband.clone());
        }
        self.tracker.track_updated_device_image(serial, image);
    }

    /// Forget the baseline of `serial`, for example after a failed flash.
    pub fn invalidate(&self, serial: &str) {
        self.tracker.invalidate_tracking(serial);
    }
}

/// Dump the device's hash trees and pull them to the host.
///
/// Any failure short of losing the device leaves the update to diff against
/// the baseline image instead.
async fn pull_verity_hashes(
    device: &dyn FlashDevice,
    work_root: Option<&Path>,
) -> DeviceResult<Option<TempDir>> {
    shell_logged(device, &format!("mkdir -p {VERITY_HASH_DIR}")).await?;
    let dump = shell_logged(device, &format!("snapshotctl {DUMP_VERITY_HASH} {VERITY_HASH_DIR}")).await?;
    if !dump.is_success() {
        warn!(stderr = %dump.stderr.trim_end(), "Failed to dump verity hashes");
        return Ok(None);
    }
    let dir = match files::create_temp_dir("device-merkle-tree", work_root) {
        Ok(dir) => dir,
        Err(e) => {
            warn!(error = %e, "Failed to create hash tree directory");
            return Ok(None);
        }
    };
    if !device.pull_dir(VERITY_HASH_DIR, dir.path()).await? {
        warn!("Failed to pull merkle tree");
        return Ok(None);
    }
    Ok(Some(dir))
}

fn link_error(err: anyhow::Error) -> TargetSetupError {
    TargetSetupError::from_anyhow(err, ErrorIdentifier::FailToCreateFile)
}

fn link_baseline_image(
    baseline: &CachedImageRecord,
    work_root: Option<&Path>,
) -> Result<(TempDir, PathBuf), TargetSetupError> {
    let dir = files::create_temp_dir("baseline_image", work_root).map_err(link_error)?;
    let dest = dir.path().join(files::file_name(&baseline.device_image));
    let linked = if baseline.device_image.is_dir() {
        files::recursive_hardlink(&baseline.device_image, &dest)
    } else {
        files::hardlink_file(&baseline.device_image, &dest)
    };
    linked.map_err(link_error)?;
    Ok((dir, dest))
}

fn link_baseline_firmware(
    baseline: &CachedImageRecord,
    work_root: Option<&Path>,
) -> Result<BaselineFiles, TargetSetupError> {
    let dir = files::create_temp_dir("baseline_firmware", work_root).map_err(link_error)?;
    let link = |src: Option<&PathBuf>, name: &str| -> Result<Option<PathBuf>, TargetSetupError> {
        let Some(src) = src else {
            return Ok(None);
        };
        let dest = dir.path().join(name);
        files::hardlink_file(src, &dest).map_err(link_error)?;
        Ok(Some(dest))
    };
    let bootloader = link(baseline.bootloader.as_ref(), "bootloader.img")?;
    let baseband = link(baseline.baseband.as_ref(), "radio.img")?;
    Ok(BaselineFiles {
        dir,
        bootloader,
        baseband,
    })
}
