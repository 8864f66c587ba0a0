use simrun_core::{Reporter, Result, SimrunError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Remove each file that exists; failures are reported and the batch
/// continues.
pub fn delete_files<P: AsRef<Path>>(reporter: &dyn Reporter, files: &[P]) {
    for file in files {
        let file = file.as_ref();
        if !file.exists() {
            continue;
        }
        match fs::remove_file(file) {
            Ok(()) => debug!(path = %file.display(), "Deleted file"),
            Err(e) => reporter.write_error(&format!("Failed to delete '{}' : {}", file.display(), e)),
        }
    }
}

/// Create the output directory if needed and make sure it is writable.
///
/// `"."` is accepted as is.
pub fn ensure_output_directory(dir: &Path) -> Result<PathBuf> {
    if dir == Path::new(".") {
        return Ok(dir.to_path_buf());
    }
    if dir.as_os_str().is_empty() {
        return Err(SimrunError::InvalidConfiguration(
            "Specified directory is not valid. Set to '.' for current directory.".to_string(),
        ));
    }

    fs::create_dir_all(dir).map_err(|e| {
        SimrunError::InvalidConfiguration(format!(
            "Failed to create directory '{}': {}",
            dir.display(),
            e
        ))
    })?;

    // Probe with a real file; permission bits alone don't account for ACLs
    // or read-only mounts.
    tempfile::tempfile_in(dir).map_err(|_| {
        SimrunError::InvalidConfiguration(format!("Write permission to '{}' denied.", dir.display()))
    })?;

    Ok(dir.to_path_buf())
}

/// The package path must be an existing directory.
pub fn validate_package_path(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(SimrunError::InvalidConfiguration(format!(
            "Argument package_path={} does not exist.",
            path.display()
        )));
    }
    if !path.is_dir() {
        return Err(SimrunError::InvalidConfiguration(format!(
            "Argument package_path={} must be a directory containing a Modelica package.",
            path.display()
        )));
    }
    Ok(())
}
