//! Device control surface consumed by the update flow.
//!
//! Implementations wrap whatever actually drives the device (adb, fastboot,
//! a lab service). Every call that can lose the device returns
//! [`DeviceNotAvailableError`]; ordinary command failures are reported through
//! [`CommandResult`] instead.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::DeviceNotAvailableError;

/// Result of a device call that may lose the device.
pub type DeviceResult<T> = std::result::Result<T, DeviceNotAvailableError>;

/// Outcome category of a shell or fastboot command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    /// Exited zero
    Success,
    /// Exited non-zero
    Failed,
    /// Killed after its timeout
    TimedOut,
    /// Could not be run at all
    Exception,
}

/// Captured output of a shell or fastboot command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Outcome category
    pub status: CommandStatus,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Exit code when the process exited normally
    pub exit_code: Option<i32>,
}

impl CommandResult {
    /// Successful command with the given stdout.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Success,
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    /// Failed command with the given stderr.
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Failed,
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(1),
        }
    }

    /// Whether the command succeeded.
    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }

    /// Whether `needle` appears on stdout or stderr.
    pub fn output_contains(&self, needle: &str) -> bool {
        self.stdout.contains(needle) || self.stderr.contains(needle)
    }
}

/// Connection state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Booted and reachable over adb
    Online,
    /// In the bootloader (fastboot)
    Bootloader,
    /// In userspace fastboot
    Fastbootd,
    /// In recovery
    Recovery,
    /// Not visible
    NotAvailable,
}

impl DeviceState {
    /// Whether fastboot commands can be sent.
    pub fn is_bootloader_or_fastbootd(self) -> bool {
        matches!(self, DeviceState::Bootloader | DeviceState::Fastbootd)
    }
}

/// How the harness reacts when the device goes missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryMode {
    /// No automatic recovery
    None,
    /// Recover until adb is online
    Online,
    /// Recover until the device is fully available
    Available,
}

/// Phases the device's snapshot daemon can be told to block in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapuserdWaitPhase {
    /// Wait right after the update is applied
    BlockAfterUpdate,
    /// Wait before the test starts
    BlockBeforeTest,
    /// Wait before the device is released
    BlockBeforeReleasing,
}

/// Device operations the update flow needs.
#[async_trait]
pub trait FlashDevice: Send + Sync {
    /// Device serial number.
    fn serial(&self) -> &str;

    /// Timeout used when waiting for the device to become available.
    fn available_timeout(&self) -> Duration;

    /// Default timeout for shell commands.
    fn command_timeout(&self) -> Duration {
        Duration::from_secs(2 * 60)
    }

    /// Current connection state.
    async fn state(&self) -> DeviceResult<DeviceState>;

    /// Build id currently running on the device.
    async fn build_id(&self) -> DeviceResult<String>;

    /// Read a system property, `None` if unset.
    async fn property(&self, name: &str) -> DeviceResult<Option<String>>;

    /// Reboot and wait for adb.
    async fn reboot_until_online(&self) -> DeviceResult<()>;

    /// Reboot into the bootloader.
    async fn reboot_into_bootloader(&self) -> DeviceResult<()>;

    /// Restart adbd as root. Returns whether root was obtained.
    async fn enable_root(&self) -> DeviceResult<bool>;

    /// Run a shell command with an explicit timeout.
    async fn execute_shell_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> DeviceResult<CommandResult>;

    /// Run a shell command with [`FlashDevice::command_timeout`].
    async fn execute_shell(&self, command: &str) -> DeviceResult<CommandResult> {
        self.execute_shell_with_timeout(command, self.command_timeout())
            .await
    }

    /// Run a short fastboot command.
    async fn execute_fastboot(&self, args: &[&str]) -> DeviceResult<CommandResult>;

    /// Run a long fastboot command with extra environment variables.
    async fn execute_long_fastboot(
        &self,
        env: &HashMap<String, String>,
        args: &[&str],
    ) -> DeviceResult<CommandResult>;

    /// Push a single file. Returns whether the push succeeded.
    async fn push_file(&self, local: &Path, remote: &str) -> DeviceResult<bool>;

    /// Push a directory's contents. Returns whether the push succeeded.
    async fn push_dir(&self, local: &Path, remote: &str) -> DeviceResult<bool>;

    /// Pull a device directory's contents into `local`. Returns whether the
    /// pull succeeded.
    async fn pull_dir(&self, remote: &str, local: &Path) -> DeviceResult<bool>;

    /// Wait for `sys.boot_completed`. Returns `false` on timeout.
    async fn wait_for_boot_complete(&self, timeout: Duration) -> DeviceResult<bool>;

    /// Wait until the device is fully available. Returns `false` on timeout.
    async fn wait_for_device_available(&self, timeout: Duration) -> DeviceResult<bool>;

    /// Current recovery mode.
    fn recovery_mode(&self) -> RecoveryMode;

    /// Change the recovery mode.
    fn set_recovery_mode(&self, mode: RecoveryMode);

    /// Tell the snapshot daemon which phase to block in.
    async fn notify_snapuserd(&self, phase: SnapuserdWaitPhase) -> DeviceResult<()>;

    /// Block until the snapshot daemon reaches `phase`.
    async fn wait_for_snapuserd(&self, phase: SnapuserdWaitPhase) -> DeviceResult<()>;
}

/// Turns off device recovery until dropped, then restores the previous mode.
///
/// Restoring on drop also covers a caller that cancels the surrounding future.
#[must_use = "recovery is restored as soon as the guard is dropped"]
pub(crate) struct RecoveryModeGuard<'a> {
    device: &'a dyn FlashDevice,
    previous: RecoveryMode,
}

impl<'a> RecoveryModeGuard<'a> {
    pub(crate) fn suspend(device: &'a dyn FlashDevice) -> Self {
        let previous = device.recovery_mode();
        device.set_recovery_mode(RecoveryMode::None);
        Self { device, previous }
    }
}

impl Drop for RecoveryModeGuard<'_> {
    fn drop(&mut self) {
        self.device.set_recovery_mode(self.previous);
    }
}

/// Run a shell command and log its output at debug level.
pub(crate) async fn shell_logged(
    device: &dyn FlashDevice,
    command: &str,
) -> DeviceResult<CommandResult> {
    let result = device.execute_shell(command).await?;
    tracing::debug!(
        serial = device.serial(),
        command,
        status = ?result.status,
        stdout = %result.stdout.trim_end(),
        stderr = %result.stderr.trim_end(),
        "Shell command finished"
    );
    Ok(result)
}

/// Run a fastboot command and log its output at debug level.
pub(crate) async fn fastboot_logged(
    device: &dyn FlashDevice,
    args: &[&str],
) -> DeviceResult<CommandResult> {
    let result = device.execute_fastboot(args).await?;
    tracing::debug!(
        serial = device.serial(),
        args = ?args,
        status = ?result.status,
        stdout = %result.stdout.trim_end(),
        stderr = %result.stderr.trim_end(),
        "Fastboot command finished"
    );
    Ok(result)
}
