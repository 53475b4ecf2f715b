//! Deciding whether a device can be updated incrementally.
//!
//! Checks run in a fixed order and the first failing one decides. An
//! ineligible result is not an error: the caller falls back to a full flash.

use flash_image_tracker::CachedImageRecord;
use std::fmt;
use tracing::debug;

use crate::build::{DeviceBuildInfo, SECURITY_PATCH_PROPERTY};
use crate::config::{IncrementalConfig, SnapshotMode};
use crate::device::{DeviceResult, FlashDevice, shell_logged};
use crate::metrics::{InvocationMetrics, MetricKey};

/// Path `which snapshotctl` must report.
pub const SNAPSHOTCTL_PATH: &str = "/system/bin/snapshotctl";

/// `snapshotctl` subcommand that dumps the device's hash trees.
pub const DUMP_VERITY_HASH: &str = "dump-verity-hash";

/// Why a device cannot be updated incrementally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IneligibleReason {
    /// Isolated setups need the resettable apply-update mode
    IsolationRequiresApplyMode,
    /// No baseline is tracked for the device
    NoBaseline,
    /// The tracked baseline files are gone from disk
    BaselineFilesMissing,
    /// The device no longer runs the tracked build
    BuildIdMismatch {
        /// Tracked build id
        tracked: String,
        /// Build id reported by the device
        device: String,
    },
    /// The baseline came from a release branch
    ReleaseBranch(String),
    /// Baseline and target branches differ
    BranchMismatch {
        /// Tracked branch
        tracked: String,
        /// Target branch
        target: String,
    },
    /// Baseline and target flavors differ and cross-release is off
    FlavorMismatch {
        /// Tracked flavor
        tracked: String,
        /// Target flavor
        target: String,
    },
    /// `snapshotctl` is missing or lacks a needed subcommand
    SnapshotUnsupported,
    /// Target security patch level differs from the device's
    SecurityPatchMismatch {
        /// Level declared by the target build
        target: String,
        /// Level reported by the device
        device: Option<String>,
    },
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IneligibleReason::IsolationRequiresApplyMode => {
                write!(f, "isolated setup requires apply-update mode")
            }
            IneligibleReason::NoBaseline => write!(f, "no baseline image tracked"),
            IneligibleReason::BaselineFilesMissing => {
                write!(f, "tracked baseline image files are missing")
            }
            IneligibleReason::BuildIdMismatch { tracked, device } => write!(
                f,
                "on-device build (id = {device}) does not match the cache (id = {tracked})"
            ),
            IneligibleReason::ReleaseBranch(branch) => {
                write!(f, "baseline comes from release branch {branch}")
            }
            IneligibleReason::BranchMismatch { tracked, target } => {
                write!(f, "target branch {target} differs from baseline branch {tracked}")
            }
            IneligibleReason::FlavorMismatch { tracked, target } => {
                write!(f, "target flavor {target} differs from baseline flavor {tracked}")
            }
            IneligibleReason::SnapshotUnsupported => {
                write!(f, "device snapshot tooling is unsupported")
            }
            IneligibleReason::SecurityPatchMismatch { target, device } => write!(
                f,
                "target security patch {target} differs from device {}",
                device.as_deref().unwrap_or("<unset>")
            ),
        }
    }
}

/// Result of the eligibility checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    /// The update may proceed from `baseline`
    Eligible {
        /// Tracked baseline to diff against
        baseline: CachedImageRecord,
        /// The update crosses build flavors
        cross_release: bool,
    },
    /// The caller must fall back to a full flash
    Ineligible(IneligibleReason),
}

impl Eligibility {
    /// Whether the update may proceed.
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible { .. })
    }
}

/// Run the eligibility checks against `device` and the target `build`.
///
/// # Errors
///
/// Only device loss is an error; every failed check yields
/// [`Eligibility::Ineligible`].
pub async fn check_eligibility(
    device: &dyn FlashDevice,
    build: &DeviceBuildInfo,
    baseline: Option<CachedImageRecord>,
    config: &IncrementalConfig,
    metrics: &InvocationMetrics,
) -> DeviceResult<Eligibility> {
    let outcome = evaluate(device, build, baseline, config, metrics).await?;
    match &outcome {
        Eligibility::Eligible {
            baseline,
            cross_release,
        } => {
            if *cross_release {
                metrics.add_count(MetricKey::IncrementalAcrossReleaseCount, 1);
            }
            metrics.add_text(MetricKey::DeviceImageCacheOrigin, baseline.origin());
            debug!(
                serial = device.serial(),
                origin = %baseline.origin(),
                cross_release,
                "Device is eligible for incremental update"
            );
        }
        Eligibility::Ineligible(reason) => {
            debug!(serial = device.serial(), %reason, "Device is not eligible for incremental update");
        }
    }
    Ok(outcome)
}

async fn evaluate(
    device: &dyn FlashDevice,
    build: &DeviceBuildInfo,
    baseline: Option<CachedImageRecord>,
    config: &IncrementalConfig,
    metrics: &InvocationMetrics,
) -> DeviceResult<Eligibility> {
    use IneligibleReason as R;
    let ineligible = |reason| Ok(Eligibility::Ineligible(reason));

    if config.isolated_setup && config.snapshot_mode != SnapshotMode::ApplyUpdate {
        return ineligible(R::IsolationRequiresApplyMode);
    }

    let Some(baseline) = baseline else {
        return ineligible(R::NoBaseline);
    };
    if !baseline.files_exist() {
        return ineligible(R::BaselineFilesMissing);
    }

    let device_build = device.build_id().await?;
    if baseline.build_id != device_build {
        metrics.add_count(MetricKey::DeviceImageCacheMismatch, 1);
        return ineligible(R::BuildIdMismatch {
            tracked: baseline.build_id.clone(),
            device: device_build,
        });
    }

    if baseline.branch.contains("release") {
        return ineligible(R::ReleaseBranch(baseline.branch.clone()));
    }

    if baseline.branch != build.branch {
        let transitions = &config.allowed_branch_transitions;
        if transitions.contains(&baseline.branch) && transitions.contains(&build.branch) {
            debug!(from = %baseline.branch, to = %build.branch, "Allowing branch transition");
        } else {
            return ineligible(R::BranchMismatch {
                tracked: baseline.branch.clone(),
                target: build.branch.clone(),
            });
        }
    }

    let mut cross_release = false;
    if baseline.flavor != build.flavor {
        if !config.allow_cross_release {
            return ineligible(R::FlavorMismatch {
                tracked: baseline.flavor.clone(),
                target: build.flavor.clone(),
            });
        }
        debug!(from = %baseline.flavor, to = %build.flavor, "Allowing cross-release update");
        cross_release = true;
    }

    if !snapshotctl_supports(device, config.snapshot_mode, config.use_merkle_tree).await? {
        return ineligible(R::SnapshotUnsupported);
    }

    if let Some(target_spl) = build.security_patch_level() {
        let device_spl = device.property(SECURITY_PATCH_PROPERTY).await?;
        if device_spl.as_deref() != Some(target_spl.as_str()) {
            return ineligible(R::SecurityPatchMismatch {
                target: target_spl,
                device: device_spl,
            });
        }
    }

    Ok(Eligibility::Eligible {
        baseline,
        cross_release,
    })
}

/// Whether the device's `snapshotctl` supports `mode`.
///
/// # Errors
///
/// Returns [`crate::DeviceNotAvailableError`] if the device is lost.
pub async fn is_snapshot_supported(
    device: &dyn FlashDevice,
    mode: SnapshotMode,
) -> DeviceResult<bool> {
    snapshotctl_supports(device, mode, false).await
}

async fn snapshotctl_supports(
    device: &dyn FlashDevice,
    mode: SnapshotMode,
    verity_dump: bool,
) -> DeviceResult<bool> {
    let which = shell_logged(device, "which snapshotctl").await?;
    if !which.stdout.contains(SNAPSHOTCTL_PATH) {
        return Ok(false);
    }
    let help = shell_logged(device, "snapshotctl").await?;
    if verity_dump && !help.output_contains(DUMP_VERITY_HASH) {
        return Ok(false);
    }
    Ok(help.output_contains(mode.subcommand()))
}

/// Whether the device is currently running on snapshots.
///
/// # Errors
///
/// Returns [`crate::DeviceNotAvailableError`] if the device is lost.
pub async fn is_snapshot_in_use(device: &dyn FlashDevice) -> DeviceResult<bool> {
    let dump = shell_logged(device, "snapshotctl dump").await?;
    Ok(!dump.stdout.contains("Using snapuserd: 0"))
}
