//! Harvest the files a run produced in its working directory.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use simrun_core::Reporter;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Longest wait in [`mark_run_start`] for the filesystem clock to tick.
const CLOCK_TICK_LIMIT: Duration = Duration::from_secs(3);

/// Take the filesystem time that separates files present before a run from
/// files the run writes.
///
/// File times come from the filesystem's own clock, which can lag the system
/// clock by a few milliseconds. A short-lived marker file in `dir` is touched
/// until that clock moves past its first timestamp: files written earlier are
/// no newer than the returned time, files written afterwards are strictly
/// newer.
pub async fn mark_run_start(dir: &Path) -> Result<DateTime<Utc>> {
    let mut marker = tempfile::Builder::new()
        .prefix(".simrun-start-")
        .tempfile_in(dir)
        .with_context(|| format!("creating start marker in {:?}", dir))?;

    let first = touch(&mut marker)?;
    let deadline = tokio::time::Instant::now() + CLOCK_TICK_LIMIT;
    while touch(&mut marker)? <= first {
        if tokio::time::Instant::now() >= deadline {
            warn!(dir = %dir.display(), "Filesystem clock did not advance");
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    Ok(DateTime::<Utc>::from(first))
}

fn touch(marker: &mut NamedTempFile) -> Result<SystemTime> {
    marker.write_all(b".").context("writing start marker")?;
    marker
        .as_file()
        .metadata()
        .and_then(|m| m.modified())
        .context("reading start marker time")
}

/// Copy every file under `working_dir` modified strictly after `since` to
/// the same relative path under `output_dir`.
///
/// `since` should come from [`mark_run_start`]. Files that cannot be read or
/// copied are reported and skipped. Returns the destinations that were
/// written. Nothing is copied when both directories are the same, and an
/// output directory inside `working_dir` is not walked.
pub fn copy_result_files(
    reporter: &dyn Reporter,
    working_dir: &Path,
    output_dir: &Path,
    since: DateTime<Utc>,
) -> Vec<PathBuf> {
    if same_directory(working_dir, output_dir) {
        debug!(dir = %working_dir.display(), "Output directory is the working directory");
        return Vec::new();
    }

    let skip = fs::canonicalize(output_dir).ok();
    let mut files = Vec::new();
    collect_files(reporter, working_dir, skip.as_deref(), &mut files);

    let mut copied = Vec::new();
    for file in files {
        match modified_after(&file, since) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                reporter.write_error(&format!("Failed to inspect '{}': {:#}", file.display(), e));
                continue;
            }
        }

        let Ok(relative) = file.strip_prefix(working_dir) else {
            continue;
        };
        let destination = output_dir.join(relative);

        match copy_file(&file, &destination) {
            Ok(()) => {
                debug!(from = %file.display(), to = %destination.display(), "Copied result file");
                copied.push(destination);
            }
            Err(e) => reporter.write_error(&format!(
                "Failed to copy '{}' to '{}': {:#}",
                file.display(),
                destination.display(),
                e
            )),
        }
    }

    copied
}

fn same_directory(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn collect_files(reporter: &dyn Reporter, dir: &Path, skip: Option<&Path>, files: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            reporter.write_error(&format!("Failed to read directory '{}': {}", dir.display(), e));
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(kind) if kind.is_dir() => {
                if skip.is_some_and(|skip| fs::canonicalize(&path).is_ok_and(|p| p == skip)) {
                    continue;
                }
                collect_files(reporter, &path, skip, files)
            }
            Ok(kind) if kind.is_file() => files.push(path),
            _ => {}
        }
    }
}

fn modified_after(path: &Path, since: DateTime<Utc>) -> Result<bool> {
    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("reading modification time of {:?}", path))?;
    Ok(DateTime::<Utc>::from(modified) > since)
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating dir {:?}", parent))?;
    }
    fs::copy(from, to).with_context(|| format!("copying {:?}", from))?;
    Ok(())
}
