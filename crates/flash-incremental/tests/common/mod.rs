//! Scriptable fake device and image fixtures shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use flash_image_tracker::{DeviceImageTracker, TrackedImage};
use flash_incremental::prelude::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub const SERIAL: &str = "FAKE0001";
pub const BASELINE_BUILD: &str = "1000";
pub const TARGET_BUILD: &str = "1001";
pub const BRANCH: &str = "git_main";
pub const FLAVOR: &str = "husky-userdebug";

#[derive(Debug)]
struct Inner {
    state: DeviceState,
    build_id: String,
    properties: HashMap<String, String>,
    exact: HashMap<String, CommandResult>,
    prefixed: Vec<(String, CommandResult)>,
    fastboot: Vec<(String, CommandResult)>,
    versions: HashMap<String, String>,
    events: Vec<String>,
    pushed: Vec<(PathBuf, String, RecoveryMode)>,
    reject_push: Option<String>,
    lose_on_push: bool,
    stall_push: bool,
    verity_hashes: Option<Vec<(String, Vec<u8>)>>,
    root: bool,
    boot_completes: bool,
    available_after_flash: bool,
    flashall_succeeds: bool,
    recovery: RecoveryMode,
}

/// In-memory [`FlashDevice`] that records every interaction.
#[derive(Debug)]
pub struct FakeDevice {
    serial: String,
    inner: Mutex<Inner>,
}

impl FakeDevice {
    pub fn new() -> Self {
        let mut exact = HashMap::new();
        exact.insert(
            "which snapshotctl".to_string(),
            CommandResult::success("/system/bin/snapshotctl\n"),
        );
        exact.insert(
            "snapshotctl".to_string(),
            CommandResult::success(
                "snapshotctl: Control snapshots.\n  dump\n  map-snapshots <directory>\n  \
                 apply-update <directory>\n  unmap-snapshots\n  delete-snapshots\n  revert-snapshots\n",
            ),
        );
        Self {
            serial: SERIAL.to_string(),
            inner: Mutex::new(Inner {
                state: DeviceState::Online,
                build_id: BASELINE_BUILD.to_string(),
                properties: HashMap::new(),
                exact,
                prefixed: Vec::new(),
                fastboot: Vec::new(),
                versions: HashMap::new(),
                events: Vec::new(),
                pushed: Vec::new(),
                reject_push: None,
                lose_on_push: false,
                stall_push: false,
                verity_hashes: None,
                root: true,
                boot_completes: true,
                available_after_flash: true,
                flashall_succeeds: true,
                recovery: RecoveryMode::Available,
            }),
        }
    }

    pub fn set_state(&self, state: DeviceState) {
        self.inner.lock().state = state;
    }

    pub fn set_build_id(&self, build_id: &str) {
        self.inner.lock().build_id = build_id.to_string();
    }

    pub fn set_property(&self, name: &str, value: &str) {
        self.inner
            .lock()
            .properties
            .insert(name.to_string(), value.to_string());
    }

    /// Reply to exactly `command`.
    pub fn respond_exact(&self, command: &str, result: CommandResult) {
        self.inner.lock().exact.insert(command.to_string(), result);
    }

    /// Reply to every command starting with `prefix`; later calls win.
    pub fn respond(&self, prefix: &str, result: CommandResult) {
        self.inner.lock().prefixed.push((prefix.to_string(), result));
    }

    /// Reply to fastboot commands whose joined args start with `prefix`.
    pub fn respond_fastboot(&self, prefix: &str, result: CommandResult) {
        self.inner.lock().fastboot.push((prefix.to_string(), result));
    }

    pub fn set_image_version(&self, image: &str, version: &str) {
        self.inner
            .lock()
            .versions
            .insert(image.to_string(), version.to_string());
    }

    pub fn reject_push_of(&self, name: &str) {
        self.inner.lock().reject_push = Some(name.to_string());
    }

    pub fn lose_on_push(&self) {
        self.inner.lock().lose_on_push = true;
    }

    /// File pushes never complete once recorded.
    pub fn stall_pushes(&self) {
        self.inner.lock().stall_push = true;
    }

    /// Files a pull of the verity hash directory produces; pulls fail without.
    pub fn provide_verity_hashes(&self, files: &[(&str, &[u8])]) {
        self.inner.lock().verity_hashes = Some(
            files
                .iter()
                .map(|(name, data)| ((*name).to_string(), data.to_vec()))
                .collect(),
        );
    }

    pub fn set_root(&self, root: bool) {
        self.inner.lock().root = root;
    }

    pub fn set_boot_completes(&self, completes: bool) {
        self.inner.lock().boot_completes = completes;
    }

    /// After `flashall` the device stays in recovery.
    pub fn land_in_recovery_after_flash(&self) {
        self.inner.lock().available_after_flash = false;
    }

    pub fn fail_flashall(&self) {
        self.inner.lock().flashall_succeeds = false;
    }

    pub fn events(&self) -> Vec<String> {
        self.inner.lock().events.clone()
    }

    pub fn shell_commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("shell:").map(str::to_string))
            .collect()
    }

    pub fn fastboot_commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("fastboot:").map(str::to_string))
            .collect()
    }

    pub fn ran_shell(&self, command: &str) -> bool {
        self.shell_commands().iter().any(|c| c == command)
    }

    /// Position of the first event starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.events().iter().position(|e| e.starts_with(prefix))
    }

    pub fn pushed(&self) -> Vec<(PathBuf, String, RecoveryMode)> {
        self.inner.lock().pushed.clone()
    }

    pub fn current_recovery_mode(&self) -> RecoveryMode {
        self.inner.lock().recovery
    }

    fn record(&self, event: String) {
        self.inner.lock().events.push(event);
    }

    fn lost(&self, message: &str) -> DeviceNotAvailableError {
        DeviceNotAvailableError::new(self.serial.clone(), message)
    }
}

#[async_trait]
impl FlashDevice for FakeDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn available_timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn state(&self) -> DeviceResult<DeviceState> {
        Ok(self.inner.lock().state)
    }

    async fn build_id(&self) -> DeviceResult<String> {
        Ok(self.inner.lock().build_id.clone())
    }

    async fn property(&self, name: &str) -> DeviceResult<Option<String>> {
        Ok(self.inner.lock().properties.get(name).cloned())
    }

    async fn reboot_until_online(&self) -> DeviceResult<()> {
        self.record("reboot:online".to_string());
        self.inner.lock().state = DeviceState::Online;
        Ok(())
    }

    async fn reboot_into_bootloader(&self) -> DeviceResult<()> {
        self.record("reboot:bootloader".to_string());
        self.inner.lock().state = DeviceState::Bootloader;
        Ok(())
    }

    async fn enable_root(&self) -> DeviceResult<bool> {
        self.record("root".to_string());
        Ok(self.inner.lock().root)
    }

    async fn execute_shell_with_timeout(
        &self,
        command: &str,
        _timeout: Duration,
    ) -> DeviceResult<CommandResult> {
        self.record(format!("shell:{command}"));
        let inner = self.inner.lock();
        if let Some(result) = inner.exact.get(command) {
            return Ok(result.clone());
        }
        let prefixed = inner
            .prefixed
            .iter()
            .rev()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, result)| result.clone());
        Ok(prefixed.unwrap_or_else(|| CommandResult::success("")))
    }

    async fn execute_fastboot(&self, args: &[&str]) -> DeviceResult<CommandResult> {
        let joined = args.join(" ");
        self.record(format!("fastboot:{joined}"));
        let inner = self.inner.lock();
        if let Some((_, result)) = inner
            .fastboot
            .iter()
            .rev()
            .find(|(prefix, _)| joined.starts_with(prefix.as_str()))
        {
            return Ok(result.clone());
        }
        if let ["getvar", var] = args {
            if let Some(image) = var.strip_prefix("version-") {
                let version = inner.versions.get(image).cloned().unwrap_or_default();
                return Ok(CommandResult::failed(format!("{var}: {version}\nFinished.\n")));
            }
        }
        Ok(CommandResult::success(""))
    }

    async fn execute_long_fastboot(
        &self,
        env: &HashMap<String, String>,
        args: &[&str],
    ) -> DeviceResult<CommandResult> {
        let product_out = env.get("ANDROID_PRODUCT_OUT").cloned().unwrap_or_default();
        self.record(format!("fastboot:{} @{product_out}", args.join(" ")));
        let mut inner = self.inner.lock();
        if !inner.flashall_succeeds {
            return Ok(CommandResult::failed("flashall failed"));
        }
        inner.state = if inner.available_after_flash {
            DeviceState::Online
        } else {
            DeviceState::Recovery
        };
        Ok(CommandResult::success("Finished. Total time: 12.000s\n"))
    }

    async fn push_file(&self, local: &Path, remote: &str) -> DeviceResult<bool> {
        self.record(format!("push:{remote}"));
        let (accepted, stall) = {
            let mut inner = self.inner.lock();
            if inner.lose_on_push {
                drop(inner);
                return Err(self.lost("adb connection reset during push"));
            }
            if !local.exists() {
                return Ok(false);
            }
            let recovery = inner.recovery;
            inner
                .pushed
                .push((local.to_path_buf(), remote.to_string(), recovery));
            let accepted = inner
                .reject_push
                .as_deref()
                .is_none_or(|name| !remote.contains(name));
            (accepted, inner.stall_push)
        };
        if stall {
            std::future::pending::<()>().await;
        }
        Ok(accepted)
    }

    async fn push_dir(&self, local: &Path, remote: &str) -> DeviceResult<bool> {
        self.record(format!("push-dir:{remote}"));
        let mut inner = self.inner.lock();
        let recovery = inner.recovery;
        inner
            .pushed
            .push((local.to_path_buf(), remote.to_string(), recovery));
        Ok(true)
    }

    async fn pull_dir(&self, remote: &str, local: &Path) -> DeviceResult<bool> {
        self.record(format!("pull-dir:{remote}"));
        let Some(files) = self.inner.lock().verity_hashes.clone() else {
            return Ok(false);
        };
        for (name, data) in files {
            if fs::write(local.join(name), data).is_err() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn wait_for_boot_complete(&self, _timeout: Duration) -> DeviceResult<bool> {
        Ok(self.inner.lock().boot_completes)
    }

    async fn wait_for_device_available(&self, _timeout: Duration) -> DeviceResult<bool> {
        Ok(self.inner.lock().state == DeviceState::Online)
    }

    fn recovery_mode(&self) -> RecoveryMode {
        self.inner.lock().recovery
    }

    fn set_recovery_mode(&self, mode: RecoveryMode) {
        self.inner.lock().recovery = mode;
    }

    async fn notify_snapuserd(&self, phase: SnapuserdWaitPhase) -> DeviceResult<()> {
        self.record(format!("snapuserd:notify:{phase:?}"));
        Ok(())
    }

    async fn wait_for_snapuserd(&self, phase: SnapuserdWaitPhase) -> DeviceResult<()> {
        self.record(format!("snapuserd:wait:{phase:?}"));
        Ok(())
    }
}

/// Write a zip archive with stored entries.
pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) -> std::io::Result<()> {
    let mut writer = zip::ZipWriter::new(File::create(path)?);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for (name, data) in entries {
        writer.start_file(*name, options)?;
        writer.write_all(data)?;
    }
    writer.finish()?;
    Ok(())
}

/// Write an executable shell script.
#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, format!("#!/bin/sh\n{body}"))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

/// Stand-in for `create_snapshot`: writes `<partition>.patch` into the cwd.
pub const PATCH_SCRIPT: &str = r#"for arg in "$@"; do
  case "$arg" in
    --target=*) target="${arg#--target=}" ;;
  esac
done
name=$(basename "$target" .img)
printf 'patch-%s' "$name" > "$name.patch"
"#;

pub const FAILING_SCRIPT: &str = "echo partial\necho 'bad image' >&2\nexit 1\n";

/// Everything a session test needs on the host side.
pub struct Fixture {
    pub root: TempDir,
    pub work_root: PathBuf,
    pub baseline_image: PathBuf,
    pub baseline_bootloader: PathBuf,
    pub target_image: PathBuf,
    pub target_bootloader: PathBuf,
    pub target_baseband: PathBuf,
    pub diff_tool: PathBuf,
}

impl Fixture {
    #[cfg(unix)]
    pub fn new() -> std::io::Result<Self> {
        Self::with_script(PATCH_SCRIPT)
    }

    #[cfg(unix)]
    pub fn with_script(script: &str) -> std::io::Result<Self> {
        let root = tempfile::tempdir()?;
        let work_root = root.path().join("work");
        fs::create_dir_all(&work_root)?;

        let baseline_image = root.path().join("baseline-img.zip");
        write_zip(
            &baseline_image,
            &[
                ("system.img", b"system-1000"),
                ("vendor.img", b"vendor-1000"),
                ("boot.img", b"boot-1000"),
                ("android-info.txt", b"require board=husky\n"),
            ],
        )?;
        let target_image = root.path().join("target-img.zip");
        write_zip(
            &target_image,
            &[
                ("system.img", b"system-1001"),
                ("vendor.img", b"vendor-1001"),
                ("product.img", b"product-1001"),
                ("boot.img", b"boot-1001"),
                (
                    "android-info.txt",
                    b"require board=husky\nrequire version-bootloader=bl-2\nrequire version-baseband=bb-2\n",
                ),
            ],
        )?;

        let baseline_bootloader = root.path().join("baseline-bootloader.img");
        fs::write(&baseline_bootloader, b"bootloader-1")?;
        let target_bootloader = root.path().join("target-bootloader.img");
        fs::write(&target_bootloader, b"bootloader-2")?;
        let target_baseband = root.path().join("target-radio.img");
        fs::write(&target_baseband, b"radio-2")?;

        let diff_tool = root.path().join("create_snapshot");
        write_script(&diff_tool, script)?;

        Ok(Self {
            root,
            work_root,
            baseline_image,
            baseline_bootloader,
            target_image,
            target_bootloader,
            target_baseband,
            diff_tool,
        })
    }

    pub fn config(&self) -> flash_incremental::IncrementalConfigBuilder {
        IncrementalConfig::builder()
            .settle_delay(Duration::ZERO)
            .diff_tool(&self.diff_tool)
            .work_root(&self.work_root)
            .post_flash_timeout(Duration::from_secs(1))
    }

    pub fn target_build(&self) -> DeviceBuildInfo {
        DeviceBuildInfo::new(TARGET_BUILD, BRANCH, FLAVOR, &self.target_image)
            .with_bootloader(&self.target_bootloader)
            .with_baseband(&self.target_baseband)
    }

    pub fn baseline(&self) -> TrackedImage {
        TrackedImage::new(self.baseline_image.clone(), BASELINE_BUILD, BRANCH, FLAVOR)
            .with_bootloader(self.baseline_bootloader.clone())
    }

    /// A manager whose tracker already holds the baseline for [`SERIAL`].
    pub fn manager(
        &self,
        config: IncrementalConfig,
    ) -> Result<IncrementalFlashManager, flash_incremental::ConfigError> {
        let tracker = Arc::new(DeviceImageTracker::default());
        tracker.track_updated_device_image(SERIAL, self.baseline());
        IncrementalFlashManager::new(tracker, Arc::new(InvocationMetrics::new()), config)
    }

    /// Session directories under the work root whose name starts with `prefix`.
    pub fn work_dirs(&self, prefix: &str) -> std::io::Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.work_root)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(prefix) {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    /// Whether every session directory under the work root is gone.
    pub fn work_root_is_empty(&self) -> std::io::Result<bool> {
        Ok(fs::read_dir(&self.work_root)?.next().is_none())
    }
}
