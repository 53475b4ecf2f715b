//! Host-side file plumbing: temp dirs, hard links and archive extraction.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

/// Create a temp directory under `root`, or the system temp dir.
pub(crate) fn create_temp_dir(prefix: &str, root: Option<&Path>) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix);
    match root {
        Some(root) => {
            fs::create_dir_all(root)
                .with_context(|| format!("Failed to create work root {}", root.display()))?;
            builder.tempdir_in(root)
        }
        None => builder.tempdir(),
    }
    .with_context(|| format!("Failed to create temp directory '{prefix}'"))
}

/// Hard-link `src` to `dst`, copying when linking is not possible.
pub(crate) fn hardlink_file(src: &Path, dst: &Path) -> Result<()> {
    if let Err(e) = fs::hard_link(src, dst) {
        debug!(src = %src.display(), error = %e, "Hard link failed, copying instead");
        fs::copy(src, dst).with_context(|| {
            format!("Failed to copy {} to {}", src.display(), dst.display())
        })?;
    }
    Ok(())
}

/// Mirror the tree under `src` into `dst` using hard links.
pub(crate) fn recursive_hardlink(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("{} is outside {}", entry.path().display(), src.display()))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else {
            hardlink_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Extract a zip archive into `dest`.
pub(crate) fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file =
        File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("{} is not a valid zip archive", archive.display()))?;
    zip.extract(dest)
        .with_context(|| format!("Failed to extract {}", archive.display()))?;
    debug!(archive = %archive.display(), dest = %dest.display(), "Extracted archive");
    Ok(())
}

/// Populate `dest` from an image that is either a directory or a zip.
pub(crate) fn materialize_image(image: &Path, dest: &Path) -> Result<()> {
    if image.is_dir() {
        recursive_hardlink(image, dest)
    } else {
        extract_zip(image, dest)
    }
}

/// Whether `path` names a readable zip archive.
pub(crate) fn is_valid_zip(path: &Path) -> bool {
    let is_zip_name = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
    is_zip_name
        && File::open(path)
            .map(BufReader::new)
            .map(zip::ZipArchive::new)
            .is_ok_and(|archive| archive.is_ok())
}

/// Immediate children of `dir`, sorted by name.
pub(crate) fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("Failed to list {}", dir.display()))?;
    entries.sort();
    Ok(entries)
}

/// Total size of a file or directory tree in bytes.
pub(crate) fn disk_usage(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Find the first file called `name` below `root`.
pub(crate) fn find_file(root: &Path, name: &str) -> Option<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .find(|e| e.file_type().is_file() && e.file_name() == name)
        .map(walkdir::DirEntry::into_path)
}

/// File name as a `String`, empty if it has none.
pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
