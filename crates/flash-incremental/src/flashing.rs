//! Fastboot-side steps: static partitions, bootloader and baseband.

use flash_pack_header::FastbootPack;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::device::{
    DeviceResult, DeviceState, FlashDevice, RecoveryModeGuard, fastboot_logged, shell_logged,
};
use crate::error::{ErrorIdentifier, FlashResult, TargetSetupError};
use crate::files;
use crate::metrics::{InvocationMetrics, MetricKey};

/// Requirements file shipped inside device images.
pub const ANDROID_INFO: &str = "android-info.txt";

/// On-device directory bootloader partitions are staged in.
pub const BOOTLOADER_STAGING_DIR: &str = "/data/bootloader/";

/// `require key=value` lines from `android-info.txt`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashingRequirements {
    requirements: HashMap<String, Vec<String>>,
}

impl FlashingRequirements {
    /// Parse the text of an `android-info.txt`.
    pub fn parse(contents: &str) -> Self {
        let requirements = contents
            .lines()
            .filter_map(|line| line.trim().strip_prefix("require "))
            .filter_map(|req| req.split_once('='))
            .map(|(key, values)| {
                let values = values
                    .split('|')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect();
                (key.trim().to_string(), values)
            })
            .collect();
        Self { requirements }
    }

    /// Load `android-info.txt` from an extracted image; missing means no requirements.
    pub fn load(image_dir: &Path) -> Self {
        match std::fs::read_to_string(image_dir.join(ANDROID_INFO)) {
            Ok(contents) => Self::parse(&contents),
            Err(e) => {
                debug!(dir = %image_dir.display(), error = %e, "No android-info.txt");
                Self::default()
            }
        }
    }

    /// Accepted versions for `version-<image>`.
    pub fn required_versions(&self, image: &str) -> &[String] {
        self.requirements
            .get(&format!("version-{image}"))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether `current` fails a declared version requirement for `image`.
    pub fn needs_flash(&self, image: &str, current: Option<&str>) -> bool {
        let required = self.required_versions(image);
        !required.is_empty() && !current.is_some_and(|c| required.iter().any(|r| r == c))
    }
}

/// Ask the bootloader for the version of `image`.
///
/// # Errors
///
/// Returns [`crate::DeviceNotAvailableError`] if the device is lost.
pub async fn fetch_image_version(
    device: &dyn FlashDevice,
    image: &str,
) -> DeviceResult<Option<String>> {
    let var = format!("version-{image}");
    let result = fastboot_logged(device, &["getvar", &var]).await?;
    let prefix = format!("{var}:");
    Ok(result
        .stdout
        .lines()
        .chain(result.stderr.lines())
        .find_map(|line| line.trim().strip_prefix(prefix.as_str()))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty()))
}

async fn flash_image(device: &dyn FlashDevice, partition: &str, image: &Path) -> DeviceResult<()> {
    let path = image.display().to_string();
    let result = fastboot_logged(device, &["flash", partition, &path]).await?;
    if !result.is_success() {
        warn!(partition, stderr = %result.stderr.trim_end(), "Flashing failed");
    }
    Ok(())
}

/// Flash bootloader and baseband on an applied update when forced or when
/// the target image requires a different version.
///
/// # Errors
///
/// Returns [`crate::DeviceNotAvailableError`] if the device is lost.
pub async fn update_bootloader_and_baseband_if_needed(
    device: &dyn FlashDevice,
    target_dir: &Path,
    bootloader: Option<&Path>,
    baseband: Option<&Path>,
    force: (bool, bool),
) -> DeviceResult<()> {
    let requirements = FlashingRequirements::load(target_dir);
    let images = [
        ("bootloader", "bootloader", bootloader, force.0),
        ("baseband", "radio", baseband, force.1),
    ];
    for (image, partition, file, forced) in images {
        let Some(file) = file else {
            warn!(image, "No {image} file to flash");
            continue;
        };
        let current = fetch_image_version(device, image).await?;
        if forced || requirements.needs_flash(image, current.as_deref()) {
            info!(image, current = ?current, required = ?requirements.required_versions(image), "Flashing {image}");
            flash_image(device, partition, file).await?;
            device.reboot_into_bootloader().await?;
        } else {
            info!(image, current = ?current, "{image} already at required version, skipping");
        }
    }
    Ok(())
}

/// Flash back the original bootloader and baseband when a revert was requested.
///
/// # Errors
///
/// Returns [`crate::DeviceNotAvailableError`] if the device is lost.
pub async fn revert_bootloader_and_baseband(
    device: &dyn FlashDevice,
    bootloader: Option<&Path>,
    baseband: Option<&Path>,
    revert: (bool, bool),
) -> DeviceResult<()> {
    let images = [
        ("bootloader", "bootloader", bootloader, revert.0),
        ("baseband", "radio", baseband, revert.1),
    ];
    for (image, partition, file, needed) in images {
        if !needed {
            continue;
        }
        match file {
            Some(file) => {
                device.reboot_into_bootloader().await?;
                flash_image(device, partition, file).await?;
            }
            None => warn!(image, "No {image} file to revert to"),
        }
    }
    Ok(())
}

/// Flash every non-dynamic partition from `image_dir` with `fastboot flashall`.
///
/// Returns `false` if `flashall` itself failed. While the device comes back
/// automatic recovery is suspended; a device that lands in recovery is wiped
/// and reported as an unexpected response.
///
/// # Errors
///
/// Returns a setup error when the device ends in recovery, or a device-lost
/// error.
pub async fn flash_static_partitions(
    device: &dyn FlashDevice,
    image_dir: &Path,
    post_flash_timeout: Duration,
    metrics: &InvocationMetrics,
) -> FlashResult<bool> {
    let env = HashMap::from([(
        "ANDROID_PRODUCT_OUT".to_string(),
        image_dir.display().to_string(),
    )]);
    let result = device
        .execute_long_fastboot(
            &env,
            &[
                "flashall",
                "--exclude-dynamic-partitions",
                "--disable-super-optimization",
            ],
        )
        .await?;
    debug!(
        status = ?result.status,
        stdout = %result.stdout.trim_end(),
        stderr = %result.stderr.trim_end(),
        "flashall finished"
    );
    if !result.is_success() {
        return Ok(false);
    }

    let _recovery = RecoveryModeGuard::suspend(device);
    await_post_flash(device, post_flash_timeout, metrics)
        .await
        .map(|()| true)
}

async fn await_post_flash(
    device: &dyn FlashDevice,
    timeout: Duration,
    metrics: &InvocationMetrics,
) -> FlashResult<()> {
    if device.wait_for_device_available(timeout).await? {
        return Ok(());
    }
    if device.state().await? == DeviceState::Recovery {
        metrics.add_count(MetricKey::IncrementalRecoveryFallback, 1);
        device.reboot_into_bootloader().await?;
        fastboot_logged(device, &["-w"]).await?;
        return Err(TargetSetupError::new(
            "Device went to recovery unexpectedly",
            ErrorIdentifier::DeviceUnexpectedResponse,
        )
        .into());
    }
    warn!(serial = device.serial(), "Device not available after flashall");
    Ok(())
}

/// Write the target bootloader into the inactive slot from userspace.
///
/// The pack is unpacked on the host, the partitions listed in
/// `ro.product.ab_ota_partitions` are pushed to [`BOOTLOADER_STAGING_DIR`] and
/// written with `dd` to the other slot's block devices.
///
/// # Errors
///
/// Returns a setup error when a property is missing, the slot suffix is
/// unexpected, the pack cannot be unpacked, or a push or write fails.
pub async fn update_bootloader_from_userspace(
    device: &dyn FlashDevice,
    bootloader_pack: &Path,
    work_root: Option<&Path>,
) -> FlashResult<()> {
    let setup_error = |msg: String| TargetSetupError::new(msg, ErrorIdentifier::IncrementalFlashingError);

    let ab_partitions = device
        .property("ro.product.ab_ota_partitions")
        .await?
        .ok_or_else(|| setup_error("Couldn't query ab_ota_partitions".to_string()))?;
    let suffix = device
        .property("ro.boot.slot_suffix")
        .await?
        .ok_or_else(|| setup_error("Couldn't query ro.boot.slot_suffix".to_string()))?;
    let inactive = match suffix.as_str() {
        "_a" => "_b",
        "_b" => "_a",
        other => return Err(setup_error(format!("unexpected ro.boot.slot_suffix: {other}")).into()),
    };

    let wanted: BTreeSet<String> = ab_partitions
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    debug!(partitions = ?wanted, "Bootloader partitions to be considered");

    let staging = files::create_temp_dir("bootloader", work_root)
        .map_err(|e| TargetSetupError::from_anyhow(e, ErrorIdentifier::IncrementalFlashingError))?;
    let unpacked = unpack_bootloader(bootloader_pack, staging.path(), wanted).await?;
    debug!(partitions = ?unpacked, "Bootloader partitions to be updated");

    shell_logged(device, &format!("mkdir -p {BOOTLOADER_STAGING_DIR}")).await?;
    for image in &unpacked {
        let remote = format!("{BOOTLOADER_STAGING_DIR}{}", files::file_name(image));
        if !device.push_file(image, &remote).await? {
            return Err(setup_error("Failed to push bootloader partition.".to_string()).into());
        }
    }
    for image in &unpacked {
        let name = files::file_name(image);
        let base = name.strip_suffix(".img").unwrap_or(&name);
        let command = format!(
            "dd if={BOOTLOADER_STAGING_DIR}{name} of=/dev/block/by-name/{base}{inactive}"
        );
        let result = shell_logged(device, &command).await?;
        if !result.is_success() {
            return Err(setup_error(format!(
                "Failed to write bootloader partition: {}",
                result.stderr
            ))
            .into());
        }
    }
    info!(slot = inactive, count = unpacked.len(), "Bootloader updated from userspace");
    Ok(())
}

async fn unpack_bootloader(
    pack: &Path,
    out_dir: &Path,
    wanted: BTreeSet<String>,
) -> Result<Vec<PathBuf>, TargetSetupError> {
    let pack = pack.to_path_buf();
    let out_dir = out_dir.to_path_buf();
    let unpacked = tokio::task::spawn_blocking(move || {
        let accept: &dyn Fn(&str) -> bool = &|name| wanted.contains(name);
        FastbootPack::open(&pack)?.unpack(&out_dir, Some(accept))
    })
    .await
    .map_err(|e| {
        TargetSetupError::new(
            format!("Bootloader unpack did not complete: {e}"),
            ErrorIdentifier::IncrementalFlashingError,
        )
    })?;
    unpacked.map_err(|e| {
        TargetSetupError::new(e.to_string(), ErrorIdentifier::IncrementalFlashingError)
            .with_source(e)
    })
}
