use simrun_core::{Result, SimrunError};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Locate the executable named by `program`.
///
/// The returned path is absolute, so it still names the same file once the
/// child has changed into `working_dir`.
///
/// - Absolute paths and paths with a directory component are checked as-is,
///   relative ones against `working_dir`.
/// - Bare names are looked up on `PATH` first and then in `working_dir`.
///
/// On Windows the lookup appends the executable extensions from `PATHEXT`.
pub fn resolve_executable(program: &str, working_dir: &Path) -> Result<PathBuf> {
    resolve_with_path(program, working_dir, std::env::var_os("PATH"))
}

/// Same as [`resolve_executable`] with an explicit search path.
pub fn resolve_with_path(
    program: &str,
    working_dir: &Path,
    search_path: Option<OsString>,
) -> Result<PathBuf> {
    if program.is_empty() {
        return Err(SimrunError::ExecutableNotFound(program.to_string()));
    }

    let candidate = Path::new(program);

    let found = if has_directory_component(candidate) {
        which::which_in(candidate, search_path, working_dir).ok()
    } else {
        which::which_in(candidate, search_path, working_dir)
            .or_else(|_| which::which_in(Path::new(".").join(candidate), None::<OsString>, working_dir))
            .ok()
    };

    match found {
        Some(path) => {
            let path = std::path::absolute(&path).map_err(SimrunError::IoError)?;
            debug!(program, resolved = %path.display(), "Resolved executable");
            Ok(path)
        }
        None => Err(SimrunError::ExecutableNotFound(program.to_string())),
    }
}

fn has_directory_component(path: &Path) -> bool {
    path.is_absolute() || path.components().count() > 1
}
