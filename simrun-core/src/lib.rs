pub mod error;
pub mod models;
pub mod reporter;
pub mod settings;

pub use error::{Result, SimrunError};
pub use models::{RunOutcome, RunRequest, StopSignal};
pub use reporter::{EntryKind, FileReporter, LogEntry, MemoryReporter, Reporter};
pub use settings::{Backend, ParameterValue, Parameters, SimulatorSettings};
