//! Background preparation of the source, target and patch directories.
//!
//! Preparation starts as soon as a session is created and overlaps with the
//! device reboot and boot-complete wait. It runs in two phases:
//!
//! 1. The baseline and target images are materialized concurrently, each on
//!    its own blocking worker. Both are awaited even if one fails.
//! 2. Once both are present, every dynamic partition found in both is
//!    block-compared, with a bounded number of compare processes in flight.
//!    A hash tree pulled from the device (`<partition>.pb`) takes the place
//!    of the baseline image for that partition.
//!
//! Failures are captured in [`PreparationOutcome::Failed`] rather than
//! propagated out of the task. Every directory is a [`TempDir`], so partial
//! results are deleted whenever the outcome is dropped.

use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::diff::DiffTool;
use crate::error::{ErrorIdentifier, TargetSetupError};
use crate::files;

/// Partition images eligible for block diffing.
pub const DYNAMIC_PARTITIONS: [&str; 6] = [
    "product.img",
    "system.img",
    "system_dlkm.img",
    "system_ext.img",
    "vendor.img",
    "vendor_dlkm.img",
];

/// Whether `file_name` is a dynamic partition image.
pub fn is_dynamic_partition(file_name: &str) -> bool {
    DYNAMIC_PARTITIONS.contains(&file_name)
}

/// Directories produced by a successful preparation.
#[derive(Debug)]
pub struct PreparedImages {
    /// Extracted baseline image
    pub source: TempDir,
    /// Extracted target image
    pub target: TempDir,
    /// Patch files written by the block-compare tool
    pub work: TempDir,
    /// Partitions that were compared
    pub compared: Vec<String>,
}

/// Terminal state of a preparation task.
#[derive(Debug)]
pub enum PreparationOutcome {
    /// All directories are ready
    Ready(PreparedImages),
    /// Preparation failed; nothing is left on disk
    Failed(TargetSetupError),
}

/// Inputs to a preparation task.
#[derive(Debug)]
pub struct PreparationStage {
    /// Baseline image (zip or directory). Dropped once extracted.
    pub source_image: PathBuf,
    /// Keeps the baseline copy alive until extraction finishes
    pub source_guard: Option<TempDir>,
    /// Target image (zip or directory)
    pub target_image: PathBuf,
    /// Block-compare tool
    pub diff_tool: DiffTool,
    /// Concurrent compare processes
    pub parallelism: usize,
    /// Per-partition compare timeout
    pub diff_timeout: Option<Duration>,
    /// Parent for temp directories
    pub work_root: Option<PathBuf>,
    /// Hash trees dumped from the device, removed once compares finish
    pub verity_hashes: Option<TempDir>,
}

impl PreparationStage {
    /// Start preparation on the runtime and return immediately.
    pub fn spawn(self) -> PreparationHandle {
        let started = Instant::now();
        let task = tokio::spawn(self.run());
        PreparationHandle { task, started }
    }

    async fn run(self) -> PreparationOutcome {
        match self.prepare().await {
            Ok(images) => PreparationOutcome::Ready(images),
            Err(e) => {
                error!(error = %e, "Incremental preparation failed");
                PreparationOutcome::Failed(e)
            }
        }
    }

    async fn prepare(self) -> Result<PreparedImages, TargetSetupError> {
        let root = self.work_root.as_deref();
        let create = |prefix: &str| {
            files::create_temp_dir(prefix, root)
                .map_err(|e| TargetSetupError::from_anyhow(e, ErrorIdentifier::FailToCreateFile))
        };
        let source = create("incremental_source")?;
        let target = create("incremental_target")?;

        let unzip_started = Instant::now();
        let source_task = materialize(self.source_image.clone(), source.path().to_path_buf());
        let target_task = materialize(self.target_image.clone(), target.path().to_path_buf());
        let (source_result, target_result) = tokio::join!(source_task, target_task);
        drop(self.source_guard);
        source_result?;
        target_result?;
        debug!(elapsed = ?unzip_started.elapsed(), "Device images materialized");

        let work = create("block_compare_workdir")?;
        let jobs = compare_jobs(
            source.path(),
            target.path(),
            self.verity_hashes.as_ref().map(TempDir::path),
        );
        let compared: Vec<String> = jobs.iter().map(|job| job.partition.clone()).collect();

        let tool = &self.diff_tool;
        let work_dir = work.path();
        let timeout = self.diff_timeout;
        let results: Vec<anyhow::Result<()>> = stream::iter(jobs)
            .map(|job| async move {
                info!(partition = %job.partition, merkle_tree = job.merkle_tree, "Block comparing partition");
                tool.block_compare(&job.source, &job.target, job.merkle_tree, work_dir, timeout)
                    .await
            })
            .buffer_unordered(self.parallelism.max(1))
            .collect()
            .await;
        drop(self.verity_hashes);

        if let Some(err) = results.into_iter().find_map(Result::err) {
            return Err(TargetSetupError::from_anyhow(
                err,
                ErrorIdentifier::BlockCompareError,
            ));
        }

        Ok(PreparedImages {
            source,
            target,
            work,
            compared,
        })
    }
}

async fn materialize(image: PathBuf, dest: PathBuf) -> Result<(), TargetSetupError> {
    let label = files::file_name(&image);
    tokio::task::spawn_blocking(move || files::materialize_image(&image, &dest))
        .await
        .map_err(|e| {
            TargetSetupError::new(
                format!("Extraction of {label} did not complete: {e}"),
                ErrorIdentifier::FailToCreateFile,
            )
        })?
        .map_err(|e| TargetSetupError::from_anyhow(e, ErrorIdentifier::FailToCreateFile))
}

#[derive(Debug)]
struct CompareJob {
    partition: String,
    source: PathBuf,
    target: PathBuf,
    merkle_tree: bool,
}

/// Dynamic partitions with both a source and a target, in a stable order.
///
/// A `<partition>.pb` hash tree in `verity_hashes` is preferred over the
/// baseline image.
fn compare_jobs(source: &Path, target: &Path, verity_hashes: Option<&Path>) -> Vec<CompareJob> {
    DYNAMIC_PARTITIONS
        .iter()
        .filter_map(|name| {
            let tgt = target.join(name);
            let hash_tree = verity_hashes
                .map(|dir| dir.join(Path::new(name).with_extension("pb")))
                .filter(|tree| tree.exists());
            let src = source.join(name);
            let (src, merkle_tree) = match hash_tree {
                Some(tree) => (tree, true),
                None => (src, false),
            };
            if src.exists() && tgt.exists() {
                Some(CompareJob {
                    partition: (*name).to_string(),
                    source: src,
                    target: tgt,
                    merkle_tree,
                })
            } else {
                if src.exists() || tgt.exists() {
                    debug!(partition = *name, "Skipping partition without both source and target");
                }
                None
            }
        })
        .collect()
}

/// Handle to a running preparation task.
#[derive(Debug)]
pub struct PreparationHandle {
    task: JoinHandle<PreparationOutcome>,
    started: Instant,
}

impl PreparationHandle {
    /// Whether the task has completed.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Time since the task was started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wait for the task and take its outcome.
    pub async fn join(self) -> PreparationOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => PreparationOutcome::Failed(TargetSetupError::new(
                format!("Preparation task did not complete: {e}"),
                ErrorIdentifier::FailToCreateFile,
            )),
        }
    }
}
