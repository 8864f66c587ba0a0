//! Scratch directories for individual runs.

use anyhow::Context;
use simrun_core::{Reporter, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Substring every scratch directory carries in its name. Removal refuses
/// any path without it.
pub const TEMP_DIR_MARKER: &str = "tmp-simulator-";

/// A scratch directory owned by a single run.
///
/// The package is copied to `<root>/<package-dir-name>`, which is where the
/// engine runs. Nothing is removed on drop; call [`WorkingDirectory::remove`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingDirectory {
    root: PathBuf,
    path: PathBuf,
}

impl WorkingDirectory {
    /// Allocate a new scratch directory and copy `package_path` into it.
    pub fn create(package_path: &Path) -> Result<Self> {
        Self::create_in(package_path, &std::env::temp_dir())
    }

    fn create_in(package_path: &Path, temp_root: &Path) -> Result<Self> {
        let package_path = std::path::absolute(package_path)
            .with_context(|| format!("resolving package path {:?}", package_path))?;
        let dir_name = package_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "package".into());

        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}{}-", TEMP_DIR_MARKER, user_name()))
            .tempdir_in(temp_root)
            .context("creating working directory")?;

        // The scratch root is removed on drop until the copy succeeded.
        copy_tree(&package_path, &scratch.path().join(&dir_name))?;
        let root = scratch.keep();
        let path = root.join(dir_name);

        info!(
            working_dir = %path.display(),
            package = %package_path.display(),
            "Created working directory"
        );

        Ok(Self { root, path })
    }

    /// Directory the engine runs in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Top-level scratch directory, the one that gets removed.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn remove(self, reporter: &dyn Reporter) {
        delete_working_directory(reporter, Some(&self.root));
    }
}

/// Remove a scratch directory tree.
///
/// `None` is a no-op. A path that does not contain [`TEMP_DIR_MARKER`] is
/// reported and left alone.
pub fn delete_working_directory(reporter: &dyn Reporter, dir: Option<&Path>) {
    let Some(dir) = dir else {
        return;
    };

    if !dir.to_string_lossy().contains(TEMP_DIR_MARKER) {
        reporter.write_error(&format!(
            "Failed to delete '{}' as it does not seem to be a valid directory name.",
            dir.display()
        ));
        return;
    }

    if !dir.exists() {
        return;
    }

    match fs::remove_dir_all(dir) {
        Ok(()) => debug!(path = %dir.display(), "Deleted working directory"),
        Err(e) => reporter.write_error(&format!("Failed to delete '{}': {}", dir.display(), e)),
    }
}

fn copy_tree(from: &Path, to: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(to).with_context(|| format!("creating dir {:?}", to))?;
    for entry in fs::read_dir(from).with_context(|| format!("reading dir {:?}", from))? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        let kind = entry.file_type()?;
        if kind.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if kind.is_file() {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copying {:?}", entry.path()))?;
        }
    }
    Ok(())
}

fn user_name() -> String {
    let raw = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_string());
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        "user".to_string()
    } else {
        cleaned
    }
}
