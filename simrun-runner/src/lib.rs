//! Process supervision and run orchestration for external simulation engines.
//!
//! - [`supervisor`] launches one process per request, enforces the timeout
//!   and routes the captured streams to a [`simrun_core::Reporter`].
//! - [`simulator`] wraps a run in a scratch copy of the package and copies
//!   the produced files back to the output directory.

pub mod executable;
pub mod files;
pub mod process;
pub mod progress;
pub mod relocate;
pub mod simulator;
pub mod supervisor;
pub mod workdir;

pub use executable::resolve_executable;
pub use files::{delete_files, ensure_output_directory, validate_package_path};
pub use progress::{render_progress_bar, ConsoleProgress, ProgressSink};
pub use relocate::{copy_result_files, mark_run_start};
pub use simulator::{Simulator, SimulatorBuilder};
pub use supervisor::{classify_streams, Supervisor};
pub use workdir::{delete_working_directory, WorkingDirectory, TEMP_DIR_MARKER};
