//! One incremental update attempt on one device.
//!
//! ```text
//!   Prepared --update_device ok--> Updated --clean_after_setup--> Committed
//!       |                             |
//!       +--update_device err--> Failed +--teardown_device--> Reverted
//! ```
//!
//! Every directory the session owns is a [`TempDir`]. Whatever path the
//! session leaves by, including an early return or a dropped session, its
//! temp storage is removed. An unfinished preparation task cleans up after
//! itself when it completes.

use flash_image_tracker::CachedImageRecord;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{IncrementalConfig, SnapshotMode};
use crate::device::{
    FlashDevice, RecoveryModeGuard, SnapuserdWaitPhase, fastboot_logged, shell_logged,
};
use crate::error::{
    DeviceNotAvailableError, ErrorIdentifier, FlashError, FlashResult, TargetSetupError,
};
use crate::files;
use crate::flashing::{
    flash_static_partitions, revert_bootloader_and_baseband,
    update_bootloader_and_baseband_if_needed, update_bootloader_from_userspace,
};
use crate::metrics::{GroupMetricKey, InvocationMetrics, MetricKey};
use crate::preparation::{PreparationHandle, PreparationOutcome, PreparedImages, is_dynamic_partition};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Preparation started, device untouched
    Prepared,
    /// The device runs the target build
    Updated,
    /// `update_device` failed
    Failed,
    /// Session storage released, new image kept
    Committed,
    /// Device reverted and session storage released
    Reverted,
}

impl SessionState {
    /// Whether the session has released its storage.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Committed | SessionState::Reverted)
    }
}

/// Summary of a successful update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    /// `flashall` of the static partitions succeeded
    pub static_partitions_flashed: bool,
    /// Bytes of patch data pushed
    pub total_patch_bytes: u64,
    /// Patch files or directories pushed
    pub patch_count: usize,
    /// Wall time of `update_device`
    pub elapsed: Duration,
}

#[derive(Error, Debug)]
enum PushError {
    #[error("Failed to push {0}")]
    Rejected(String),
    #[error(transparent)]
    DeviceLost(#[from] DeviceNotAvailableError),
}

/// Baseline bootloader and baseband copies kept for reverting.
#[derive(Debug)]
pub(crate) struct BaselineFiles {
    pub(crate) dir: TempDir,
    pub(crate) bootloader: Option<PathBuf>,
    pub(crate) baseband: Option<PathBuf>,
}

/// An in-flight incremental update.
#[derive(Debug)]
pub struct IncrementalSession {
    serial: String,
    config: IncrementalConfig,
    metrics: Arc<InvocationMetrics>,
    baseline: CachedImageRecord,
    cross_release: bool,
    baseline_files: Option<BaselineFiles>,
    preparation: Option<PreparationHandle>,
    source_dir: Option<TempDir>,
    target_dir: Option<TempDir>,
    bootloader_needs_revert: bool,
    baseband_needs_revert: bool,
    update_completed: bool,
    state: SessionState,
}

impl IncrementalSession {
    pub(crate) fn new(
        serial: &str,
        config: IncrementalConfig,
        metrics: Arc<InvocationMetrics>,
        baseline: CachedImageRecord,
        cross_release: bool,
        baseline_files: BaselineFiles,
        preparation: PreparationHandle,
    ) -> Self {
        Self {
            serial: serial.to_string(),
            config,
            metrics,
            baseline,
            cross_release,
            baseline_files: Some(baseline_files),
            preparation: Some(preparation),
            source_dir: None,
            target_dir: None,
            bootloader_needs_revert: false,
            baseband_needs_revert: false,
            update_completed: false,
            state: SessionState::Prepared,
        }
    }

    /// Serial of the device being updated.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Baseline the update diffs against.
    pub fn baseline(&self) -> &CachedImageRecord {
        &self.baseline
    }

    /// Whether the update crosses build flavors.
    pub fn is_cross_release(&self) -> bool {
        self.cross_release
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether `update_device` completed successfully.
    pub fn update_completed(&self) -> bool {
        self.update_completed
    }

    /// Whether background preparation has finished (or was already consumed).
    pub fn preparation_finished(&self) -> bool {
        self.preparation
            .as_ref()
            .is_none_or(PreparationHandle::is_finished)
    }

    /// Extracted target image, retained after a successful update.
    pub fn extracted_target_directory(&self) -> Option<&Path> {
        self.target_dir.as_ref().map(TempDir::path)
    }

    /// Request that the original bootloader be restored.
    pub fn notify_bootloader_needs_revert(&mut self) {
        self.bootloader_needs_revert = true;
    }

    /// Request that the original baseband be restored.
    pub fn notify_baseband_needs_revert(&mut self) {
        self.baseband_needs_revert = true;
    }

    /// Apply the target build to the device.
    ///
    /// `bootloader` and `baseband` are the target build's images; they are
    /// flashed in apply-update mode when a revert was requested or the
    /// target's `android-info.txt` requires a different version.
    ///
    /// # Errors
    ///
    /// Returns [`FlashError::Setup`] for any failure of the update itself and
    /// [`FlashError::DeviceNotAvailable`] when the device is lost. On error
    /// all prepared directories are deleted.
    pub async fn update_device(
        &mut self,
        device: &dyn FlashDevice,
        bootloader: Option<&Path>,
        baseband: Option<&Path>,
    ) -> FlashResult<UpdateReport> {
        if self.state != SessionState::Prepared {
            return Err(TargetSetupError::new(
                format!("Cannot update from state {:?}", self.state),
                ErrorIdentifier::IncrementalFlashingError,
            )
            .into());
        }
        let started = Instant::now();

        let result = self
            .run_update(device, bootloader, baseband, started)
            .await;
        match &result {
            Ok(report) => {
                info!(
                    serial = %self.serial,
                    patches = report.patch_count,
                    bytes = report.total_patch_bytes,
                    elapsed = ?report.elapsed,
                    "Incremental update completed"
                );
            }
            Err(e) => {
                warn!(serial = %self.serial, error = %e, "Incremental update failed");
                self.state = SessionState::Failed;
            }
        }
        result
    }

    async fn run_update(
        &mut self,
        device: &dyn FlashDevice,
        bootloader: Option<&Path>,
        baseband: Option<&Path>,
        started: Instant,
    ) -> FlashResult<UpdateReport> {
        if device.state().await?.is_bootloader_or_fastbootd() {
            device.reboot_until_online().await?;
        }
        if !device.enable_root().await? {
            return Err(TargetSetupError::new(
                "Failed to obtain root, this is required for incremental update.",
                ErrorIdentifier::IncrementalFlashingError,
            )
            .into());
        }

        let mut bootloader_written = false;
        if self.config.update_bootloader_from_userspace {
            if let Some(pack) = bootloader {
                update_bootloader_from_userspace(device, pack, self.config.work_root.as_deref())
                    .await?;
                bootloader_written = true;
            }
        }

        let result = self
            .apply_update(device, bootloader, baseband, bootloader_written, started)
            .await;
        if result.is_err() {
            self.metrics
                .add_count(MetricKey::IncrementalFlashingUpdateFailure, 1);
        }
        result
    }

    async fn apply_update(
        &mut self,
        device: &dyn FlashDevice,
        bootloader: Option<&Path>,
        baseband: Option<&Path>,
        bootloader_written: bool,
        started: Instant,
    ) -> FlashResult<UpdateReport> {
        self.metrics
            .add_count(MetricKey::IncrementalFlashingAttemptCount, 1);

        let images = self.join_preparation().await?;

        if !device
            .wait_for_boot_complete(device.available_timeout())
            .await?
        {
            self.metrics
                .add_count(MetricKey::IncrementalFlashingBootTimeout, 1);
            return Err(self.fallback("Failed to boot within timeout."));
        }
        if !self.config.settle_delay.is_zero() {
            debug!(delay = ?self.config.settle_delay, "Waiting for update_engine to settle");
            tokio::time::sleep(self.config.settle_delay).await;
        }

        self.record_target_sizes(images.target.path());
        let (total_patch_bytes, patch_count) = self.record_patch_sizes(images.work.path())?;
        if total_patch_bytes > self.config.max_patch_bytes {
            self.metrics
                .add_text(MetricKey::IncrementalFallbackReason, "Patches too large.");
            return Err(TargetSetupError::new(
                format!(
                    "Total patch size is {total_patch_bytes} bytes. Too large to use the feature. falling back"
                ),
                ErrorIdentifier::IncrementalFlashingError,
            )
            .into());
        }

        let staging = self.config.staging_path();
        shell_logged(device, &format!("mkdir -p {staging}")).await?;
        shell_logged(device, &format!("rm -rf {staging}*.patch")).await?;
        clear_snapshots(device).await?;

        self.push_patches(device, images.work.path(), &staging)
            .await?;
        shell_logged(device, &format!("ls -l {staging}")).await?;

        let subcommand = self.config.snapshot_mode.subcommand();
        let mut snapshot_command = format!("snapshotctl {subcommand} {staging}");
        if self.wipes_after_apply() {
            snapshot_command.push_str(" -w");
        }
        let snapshot = shell_logged(device, &snapshot_command).await?;
        if !snapshot.is_success() {
            self.metrics.add_text(
                MetricKey::IncrementalFallbackReason,
                format!("Failed {subcommand}"),
            );
            clear_snapshots(device).await?;
            return Err(TargetSetupError::new(
                format!(
                    "Failed to {subcommand}.\nstdout:{}\nstderr:{}",
                    snapshot.stdout, snapshot.stderr
                ),
                ErrorIdentifier::IncrementalFlashingError,
            )
            .into());
        }
        device.reboot_into_bootloader().await?;

        if self.config.snapshot_mode == SnapshotMode::ApplyUpdate {
            if self.wipes_after_apply() {
                fastboot_logged(device, &["snapshot-update", "cancel"]).await?;
                fastboot_logged(device, &["-w"]).await?;
            }
            let bootloader = if bootloader_written { None } else { bootloader };
            update_bootloader_and_baseband_if_needed(
                device,
                images.target.path(),
                bootloader,
                baseband,
                (self.bootloader_needs_revert, self.baseband_needs_revert),
            )
            .await?;
            self.bootloader_needs_revert = false;
            self.baseband_needs_revert = false;
        }

        let static_partitions_flashed = flash_static_partitions(
            device,
            images.target.path(),
            self.config.post_flash_timeout,
            &self.metrics,
        )
        .await?;
        if !static_partitions_flashed {
            self.metrics
                .add_count(MetricKey::IncrementalFlashingFlashFailure, 1);
            self.metrics.add_text(
                MetricKey::IncrementalFallbackReason,
                "Failed to flash static partitions",
            );
            warn!(serial = %self.serial, "Flashing static partitions failed");
        }

        if !device.enable_root().await? {
            warn!(serial = %self.serial, "Failed to re-enable root after update");
        }
        match self.config.snapshot_mode {
            SnapshotMode::ApplyUpdate => {
                device.notify_snapuserd(self.config.wait_phase).await?;
                device
                    .wait_for_snapuserd(SnapuserdWaitPhase::BlockAfterUpdate)
                    .await?;
            }
            SnapshotMode::MapSnapshots => {
                shell_logged(device, "ps -ef | grep snapuserd").await?;
            }
        }

        let PreparedImages { source, target, .. } = images;
        self.source_dir = Some(source);
        self.target_dir = Some(target);
        self.update_completed = true;
        self.state = SessionState::Updated;

        Ok(UpdateReport {
            static_partitions_flashed,
            total_patch_bytes,
            patch_count,
            elapsed: started.elapsed(),
        })
    }

    fn wipes_after_apply(&self) -> bool {
        self.config.wipe_after_apply && self.config.snapshot_mode == SnapshotMode::ApplyUpdate
    }

    async fn join_preparation(&mut self) -> FlashResult<PreparedImages> {
        let Some(handle) = self.preparation.take() else {
            return Err(TargetSetupError::new(
                "Preparation result was already consumed",
                ErrorIdentifier::IncrementalFlashingError,
            )
            .into());
        };
        let wait = Instant::now();
        let outcome = handle.join().await;
        let waited = u64::try_from(wait.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.metrics
            .add_count(MetricKey::IncrementalFlashingWaitParallelSetup, waited);

        match outcome {
            PreparationOutcome::Ready(images) => Ok(images),
            PreparationOutcome::Failed(e) => {
                self.metrics
                    .add_text(MetricKey::IncrementalFallbackReason, e.message());
                Err(e.into())
            }
        }
    }

    fn fallback(&self, reason: &str) -> FlashError {
        self.metrics
            .add_text(MetricKey::IncrementalFallbackReason, reason);
        TargetSetupError::new(reason, ErrorIdentifier::IncrementalFlashingError).into()
    }

    fn record_target_sizes(&self, target: &Path) {
        let Ok(entries) = files::list_dir(target) else {
            warn!(dir = %target.display(), "Something went wrong listing target");
            return;
        };
        for path in entries {
            let name = files::file_name(&path);
            if is_dynamic_partition(&name) {
                self.metrics.add_group(
                    GroupMetricKey::IncrementalFlashingTargetSize,
                    name,
                    files::disk_usage(&path),
                );
            }
        }
    }

    fn record_patch_sizes(&self, work: &Path) -> FlashResult<(u64, usize)> {
        let entries = files::list_dir(work)
            .map_err(|e| TargetSetupError::from_anyhow(e, ErrorIdentifier::IncrementalFlashingError))?;
        let mut total = 0u64;
        for path in &entries {
            let size = files::disk_usage(path);
            total = total.saturating_add(size);
            self.metrics.add_group(
                GroupMetricKey::IncrementalFlashingPatchesSize,
                files::file_name(path),
                size,
            );
        }
        Ok((total, entries.len()))
    }

    async fn push_patches(
        &self,
        device: &dyn FlashDevice,
        work: &Path,
        staging: &str,
    ) -> FlashResult<()> {
        let entries = files::list_dir(work)
            .map_err(|e| TargetSetupError::from_anyhow(e, ErrorIdentifier::IncrementalFlashingError))?;

        let _recovery = RecoveryModeGuard::suspend(device);
        self.push_all(device, entries, staging).await
    }

    async fn push_all(
        &self,
        device: &dyn FlashDevice,
        entries: Vec<PathBuf>,
        staging: &str,
    ) -> FlashResult<()> {
        let pushes = stream::iter(entries)
            .map(|path| async move { push_one(device, &path, staging).await })
            .buffer_unordered(self.config.push_parallelism.max(1))
            .collect::<Vec<_>>();

        let results = match self.config.push_timeout {
            Some(limit) => match tokio::time::timeout(limit, pushes).await {
                Ok(results) => results,
                Err(_) => {
                    self.metrics
                        .add_count(MetricKey::IncrementalFlashingPushFailure, 1);
                    return Err(self.fallback("Timed out pushing patches."));
                }
            },
            None => pushes.await,
        };

        let errors: Vec<PushError> = results.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            return Ok(());
        }
        self.metrics
            .add_count(MetricKey::IncrementalFlashingPushFailure, 1);
        for err in &errors {
            self.metrics
                .add_text(MetricKey::IncrementalFallbackReason, err.to_string());
        }
        if let Some(lost) = errors.iter().find_map(|e| match e {
            PushError::DeviceLost(lost) => Some(lost.clone()),
            PushError::Rejected(_) => None,
        }) {
            return Err(lost.into());
        }
        let mut setup = TargetSetupError::new(
            "Failed to push patches.",
            ErrorIdentifier::IncrementalFlashingError,
        );
        if let Some(first) = errors.into_iter().next() {
            setup = setup.with_source(first);
        }
        Err(setup.into())
    }

    /// Release the session's storage and keep the new image on the device.
    ///
    /// Waits for an unfinished preparation task first. Calling this more than
    /// once, or after [`IncrementalSession::teardown_device`], is a no-op.
    pub async fn clean_after_setup(&mut self) {
        self.release_resources().await;
        if !self.state.is_terminal() {
            self.state = SessionState::Committed;
        }
    }

    /// Return the device to its baseline and release the session's storage.
    ///
    /// Only a map-snapshots session that reached [`SessionState::Updated`]
    /// touches the device: the original bootloader and baseband are flashed
    /// back if a revert was requested or `force_revert` is set, snapshots are
    /// reverted and the baseline static partitions are re-flashed. Storage is
    /// released on every path.
    ///
    /// # Errors
    ///
    /// Only device loss is reported; other revert failures are logged and
    /// counted.
    pub async fn teardown_device(
        &mut self,
        device: &dyn FlashDevice,
        force_revert: bool,
    ) -> Result<(), DeviceNotAvailableError> {
        let revert_needed = self.state == SessionState::Updated
            && self.config.snapshot_mode == SnapshotMode::MapSnapshots;
        let result = if revert_needed {
            self.revert_device(device, force_revert).await
        } else {
            debug!(serial = %self.serial, state = ?self.state, "Teardown leaves device as is");
            Ok(())
        };

        self.release_resources().await;
        if !self.state.is_terminal() {
            self.state = SessionState::Reverted;
        }
        result
    }

    async fn revert_device(
        &self,
        device: &dyn FlashDevice,
        force_revert: bool,
    ) -> Result<(), DeviceNotAvailableError> {
        let (bootloader, baseband) = self
            .baseline_files
            .as_ref()
            .map(|f| (f.bootloader.as_deref(), f.baseband.as_deref()))
            .unwrap_or((None, None));
        revert_bootloader_and_baseband(
            device,
            bootloader,
            baseband,
            (
                self.bootloader_needs_revert || force_revert,
                self.baseband_needs_revert || force_revert,
            ),
        )
        .await?;

        if device.state().await?.is_bootloader_or_fastbootd() {
            device.reboot_until_online().await?;
        }
        if !device.enable_root().await? {
            warn!(serial = %self.serial, "Failed to enable root for teardown");
        }

        let revert = shell_logged(device, "snapshotctl revert-snapshots").await?;
        if !revert.is_success() {
            self.metrics
                .add_count(MetricKey::IncrementalFlashingTeardownFailure, 1);
            warn!(
                serial = %self.serial,
                stdout = %revert.stdout.trim_end(),
                stderr = %revert.stderr.trim_end(),
                "Failed to revert snapshots"
            );
        }

        if let Some(source) = &self.source_dir {
            device.reboot_into_bootloader().await?;
            let flashed = flash_static_partitions(
                device,
                source.path(),
                self.config.post_flash_timeout,
                &self.metrics,
            )
            .await;
            match flashed {
                Ok(true) => {}
                Ok(false) => {
                    self.metrics
                        .add_count(MetricKey::IncrementalFlashingTeardownFailure, 1);
                    warn!(serial = %self.serial, "Failed to re-flash baseline static partitions");
                }
                Err(FlashError::DeviceNotAvailable(lost)) => return Err(lost),
                Err(FlashError::Setup(e)) => {
                    self.metrics
                        .add_count(MetricKey::IncrementalFlashingTeardownFailure, 1);
                    warn!(serial = %self.serial, error = %e, "Baseline re-flash failed");
                }
            }
        }
        Ok(())
    }

    async fn release_resources(&mut self) {
        if let Some(handle) = self.preparation.take() {
            if let PreparationOutcome::Ready(images) = handle.join().await {
                let PreparedImages {
                    source,
                    target,
                    work,
                    ..
                } = images;
                for dir in [source, target, work] {
                    close_dir(dir);
                }
            }
        }
        for dir in [self.source_dir.take(), self.target_dir.take()]
            .into_iter()
            .flatten()
        {
            close_dir(dir);
        }
        if let Some(files) = self.baseline_files.take() {
            close_dir(files.dir);
        }
    }
}

async fn push_one(device: &dyn FlashDevice, path: &Path, staging: &str) -> Result<(), PushError> {
    let name = files::file_name(path);
    let remote = format!("{staging}{name}");
    let pushed = if path.is_dir() {
        device.push_dir(path, staging).await?
    } else {
        device.push_file(path, &remote).await?
    };
    debug!(local = %path.display(), remote = %remote, pushed, "Push status");
    if pushed {
        Ok(())
    } else {
        Err(PushError::Rejected(name))
    }
}

async fn clear_snapshots(device: &dyn FlashDevice) -> Result<(), DeviceNotAvailableError> {
    shell_logged(device, "snapshotctl unmap-snapshots").await?;
    shell_logged(device, "snapshotctl delete-snapshots").await?;
    Ok(())
}

fn close_dir(dir: TempDir) {
    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        warn!(dir = %path.display(), error = %e, "Failed to delete session directory");
    }
}
