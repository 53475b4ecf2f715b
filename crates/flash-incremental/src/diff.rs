//! Block-compare tool resolution and invocation.
//!
//! The tool is invoked as `<tool> --source=<img> --target=<img>` from the
//! patch work directory and is expected to leave one patch file there per
//! partition. When the source is a dumped hash tree (`<partition>.pb`) the
//! tool also gets `--merkel_tree`.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ErrorIdentifier, TargetSetupError};
use crate::files;

/// Flag telling the tool its source is a hash tree, spelled as the tool expects.
pub const MERKLE_TREE_FLAG: &str = "--merkel_tree";

/// Name of the block-compare binary.
pub const CREATE_SNAPSHOT: &str = "create_snapshot";

/// A resolved block-compare tool.
#[derive(Debug)]
pub enum DiffTool {
    /// An explicit binary on disk
    Binary(PathBuf),
    /// A binary extracted from a zip; the directory lives as long as the tool
    Extracted {
        /// Extraction directory
        dir: TempDir,
        /// Binary inside `dir`
        binary: PathBuf,
    },
    /// `create_snapshot` looked up on `PATH`
    OnPath,
}

impl DiffTool {
    /// Resolve the configured tool.
    ///
    /// A `.zip` is extracted and searched for `create_snapshot`, which is made
    /// executable. With no configured tool, or one that does not exist, the
    /// binary is expected on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns a [`TargetSetupError`] with [`ErrorIdentifier::FailToCreateFile`]
    /// if the zip cannot be extracted or does not contain the binary.
    pub fn resolve(configured: Option<&Path>, work_root: Option<&Path>) -> Result<Self, TargetSetupError> {
        let Some(path) = configured else {
            return Ok(DiffTool::OnPath);
        };
        if !path.exists() {
            warn!(tool = %path.display(), "Configured block-compare tool is missing, using PATH");
            return Ok(DiffTool::OnPath);
        }
        if files::is_valid_zip(path) {
            return Self::extract(path, work_root)
                .map_err(|e| TargetSetupError::from_anyhow(e, ErrorIdentifier::FailToCreateFile));
        }
        make_executable(path)
            .map_err(|e| TargetSetupError::from_anyhow(e, ErrorIdentifier::FailToCreateFile))?;
        Ok(DiffTool::Binary(path.to_path_buf()))
    }

    fn extract(archive: &Path, work_root: Option<&Path>) -> Result<Self> {
        let dir = files::create_temp_dir(CREATE_SNAPSHOT, work_root)?;
        files::extract_zip(archive, dir.path())?;
        let binary = files::find_file(dir.path(), CREATE_SNAPSHOT)
            .with_context(|| format!("{} does not contain {CREATE_SNAPSHOT}", archive.display()))?;
        make_executable(&binary)?;
        debug!(binary = %binary.display(), "Extracted block-compare tool");
        Ok(DiffTool::Extracted { dir, binary })
    }

    /// Program to execute.
    pub fn program(&self) -> &Path {
        match self {
            DiffTool::Binary(path) => path,
            DiffTool::Extracted { binary, .. } => binary,
            DiffTool::OnPath => Path::new(CREATE_SNAPSHOT),
        }
    }

    /// Compare `source` against `target`, writing the patch into `work_dir`.
    ///
    /// With `merkle_tree` set, `source` is a hash tree dumped from the device
    /// rather than a partition image.
    ///
    /// # Errors
    ///
    /// Fails if the tool cannot be spawned, exceeds `timeout`, or exits
    /// non-zero; the error carries the captured stdout and stderr.
    pub async fn block_compare(
        &self,
        source: &Path,
        target: &Path,
        merkle_tree: bool,
        work_dir: &Path,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut command = Command::new(self.program());
        command
            .arg(format!("--source={}", source.display()))
            .arg(format!("--target={}", target.display()));
        if merkle_tree {
            command.arg(MERKLE_TREE_FLAG);
        }
        command
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let run = command.output();
        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.with_context(|| {
                format!(
                    "Block compare of {} timed out after {limit:?}",
                    files::file_name(target)
                )
            })?,
            None => run.await,
        }
        .with_context(|| format!("Failed to run {}", self.program().display()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            partition = %files::file_name(target),
            status = %output.status,
            stdout = %stdout.trim_end(),
            stderr = %stderr.trim_end(),
            "Block compare finished"
        );
        if !output.status.success() {
            bail!("{stdout}\n{stderr}");
        }
        Ok(())
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .permissions();
    perms.set_mode(perms.mode() | 0o770);
    std::fs::set_permissions(path, perms)
        .with_context(|| format!("Failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
