//! Configuration for incremental updates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::device::SnapuserdWaitPhase;
use crate::error::ConfigError;

/// Default on-device directory patches are pushed to.
pub const DEFAULT_STAGING_DIR: &str = "/data/ndb/";

/// Patches above this total would spill from `super` into `/data`.
pub const DEFAULT_MAX_PATCH_BYTES: u64 = 2_300_000_000;

/// On-device directory `snapshotctl dump-verity-hash` writes into.
pub const VERITY_HASH_DIR: &str = "/data/verity-hash/";

/// How the device consumes the pushed patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SnapshotMode {
    /// `snapshotctl apply-update`: the update is merged and committed forward
    #[default]
    ApplyUpdate,
    /// `snapshotctl map-snapshots`: patches are mapped and reverted at teardown
    MapSnapshots,
}

impl SnapshotMode {
    /// `snapshotctl` subcommand for this mode.
    pub fn subcommand(self) -> &'static str {
        match self {
            SnapshotMode::ApplyUpdate => "apply-update",
            SnapshotMode::MapSnapshots => "map-snapshots",
        }
    }
}

/// Knobs for eligibility and update execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalConfig {
    /// Apply or map the snapshot on the device.
    pub snapshot_mode: SnapshotMode,
    /// The test requests isolation, which needs a resettable update.
    pub isolated_setup: bool,
    /// Permit updating across build flavors.
    pub allow_cross_release: bool,
    /// Branches that may be updated between each other.
    pub allowed_branch_transitions: BTreeSet<String>,
    /// Phase the snapshot daemon is told to wait for after an applied update.
    pub wait_phase: SnapuserdWaitPhase,
    /// Pause after boot-complete before touching snapshots.
    pub settle_delay: Duration,
    /// Concurrent block-compare subprocesses.
    pub diff_parallelism: usize,
    /// Per-partition block-compare timeout, `None` for unbounded.
    pub diff_timeout: Option<Duration>,
    /// Concurrent patch pushes.
    pub push_parallelism: usize,
    /// Overall cap on the push fan-out, `None` for no cap.
    pub push_timeout: Option<Duration>,
    /// Patch totals above this fall back to a full flash.
    pub max_patch_bytes: u64,
    /// On-device patch staging directory.
    pub staging_dir: String,
    /// Host directory for session temp storage, system temp dir if unset.
    pub work_root: Option<PathBuf>,
    /// Block-compare tool: a binary or a zip containing `create_snapshot`.
    pub diff_tool: Option<PathBuf>,
    /// Write the new bootloader to the inactive slot from userspace.
    pub update_bootloader_from_userspace: bool,
    /// How long to wait for the device after `flashall`.
    pub post_flash_timeout: Duration,
    /// Diff against the device's own verity hash trees where available.
    #[serde(default)]
    pub use_merkle_tree: bool,
    /// Pass `-w` to `apply-update` and wipe userdata from the bootloader.
    #[serde(default)]
    pub wipe_after_apply: bool,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            snapshot_mode: SnapshotMode::ApplyUpdate,
            isolated_setup: false,
            allow_cross_release: false,
            allowed_branch_transitions: BTreeSet::new(),
            wait_phase: SnapuserdWaitPhase::BlockBeforeReleasing,
            settle_delay: Duration::from_secs(5),
            diff_parallelism: 6,
            diff_timeout: Some(Duration::from_secs(20 * 60)),
            push_parallelism: 6,
            push_timeout: None,
            max_patch_bytes: DEFAULT_MAX_PATCH_BYTES,
            staging_dir: DEFAULT_STAGING_DIR.to_string(),
            work_root: None,
            diff_tool: None,
            update_bootloader_from_userspace: false,
            post_flash_timeout: Duration::from_secs(5 * 60),
            use_merkle_tree: false,
            wipe_after_apply: false,
        }
    }
}

impl IncrementalConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for zero parallelism, a zero patch cap or a
    /// staging directory that is not absolute.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.diff_parallelism == 0 {
            return Err(ConfigError::ZeroParallelism("diff_parallelism"));
        }
        if self.push_parallelism == 0 {
            return Err(ConfigError::ZeroParallelism("push_parallelism"));
        }
        if self.max_patch_bytes == 0 {
            return Err(ConfigError::ZeroPatchLimit);
        }
        if !self.staging_dir.starts_with('/') || self.staging_dir.trim_end_matches('/').is_empty()
        {
            return Err(ConfigError::InvalidStagingDir(self.staging_dir.clone()));
        }
        Ok(())
    }

    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> IncrementalConfigBuilder {
        IncrementalConfigBuilder::default()
    }

    /// Staging directory with exactly one trailing slash.
    pub fn staging_path(&self) -> String {
        format!("{}/", self.staging_dir.trim_end_matches('/'))
    }
}

/// Builder for [`IncrementalConfig`].
#[derive(Debug, Default)]
pub struct IncrementalConfigBuilder {
    config: IncrementalConfig,
}

impl IncrementalConfigBuilder {
    /// Set the snapshot mode.
    #[must_use]
    pub fn snapshot_mode(mut self, mode: SnapshotMode) -> Self {
        self.config.snapshot_mode = mode;
        self
    }

    /// Mark the test setup as isolated.
    #[must_use]
    pub fn isolated_setup(mut self, isolated: bool) -> Self {
        self.config.isolated_setup = isolated;
        self
    }

    /// Allow cross-flavor updates.
    #[must_use]
    pub fn allow_cross_release(mut self, allow: bool) -> Self {
        self.config.allow_cross_release = allow;
        self
    }

    /// Add a branch to the allowed-transition set.
    #[must_use]
    pub fn allow_branch_transition(mut self, branch: impl Into<String>) -> Self {
        self.config.allowed_branch_transitions.insert(branch.into());
        self
    }

    /// Set the snapshot daemon wait phase.
    #[must_use]
    pub fn wait_phase(mut self, phase: SnapuserdWaitPhase) -> Self {
        self.config.wait_phase = phase;
        self
    }

    /// Set the post-boot settle delay.
    #[must_use]
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.config.settle_delay = delay;
        self
    }

    /// Set block-compare parallelism.
    #[must_use]
    pub fn diff_parallelism(mut self, n: usize) -> Self {
        self.config.diff_parallelism = n;
        self
    }

    /// Set the per-partition block-compare timeout.
    #[must_use]
    pub fn diff_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.diff_timeout = timeout;
        self
    }

    /// Set push parallelism.
    #[must_use]
    pub fn push_parallelism(mut self, n: usize) -> Self {
        self.config.push_parallelism = n;
        self
    }

    /// Cap the whole push fan-out.
    #[must_use]
    pub fn push_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.push_timeout = timeout;
        self
    }

    /// Set the patch size cap.
    #[must_use]
    pub fn max_patch_bytes(mut self, bytes: u64) -> Self {
        self.config.max_patch_bytes = bytes;
        self
    }

    /// Set the on-device staging directory.
    #[must_use]
    pub fn staging_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.staging_dir = dir.into();
        self
    }

    /// Set the host work root for temp directories.
    #[must_use]
    pub fn work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.work_root = Some(root.into());
        self
    }

    /// Set the block-compare tool.
    #[must_use]
    pub fn diff_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.config.diff_tool = Some(tool.into());
        self
    }

    /// Enable writing the bootloader from userspace.
    #[must_use]
    pub fn update_bootloader_from_userspace(mut self, enable: bool) -> Self {
        self.config.update_bootloader_from_userspace = enable;
        self
    }

    /// Set how long to wait for the device after `flashall`.
    #[must_use]
    pub fn post_flash_timeout(mut self, timeout: Duration) -> Self {
        self.config.post_flash_timeout = timeout;
        self
    }

    /// Source block compares from the device's dumped hash trees.
    #[must_use]
    pub fn use_merkle_tree(mut self, enable: bool) -> Self {
        self.config.use_merkle_tree = enable;
        self
    }

    /// Wipe userdata as part of an applied update.
    #[must_use]
    pub fn wipe_after_apply(mut self, enable: bool) -> Self {
        self.config.wipe_after_apply = enable;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration is invalid.
    pub fn build(self) -> Result<IncrementalConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
