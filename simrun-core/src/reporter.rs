//! Human-readable run log.
//!
//! The supervisor and the file helpers never fail a run for problems a person
//! can fix afterwards; they write them here instead.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tracing::{error, info, warn};

/// Append-only sink for run messages.
pub trait Reporter: Send + Sync {
    fn write_output(&self, text: &str);
    fn write_error(&self, text: &str);
}

/// Severity of a logged entry
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Output,
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogEntry {
    pub kind: EntryKind,
    pub text: String,
}

/// Reporter that keeps every entry in memory.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().clone()
    }

    pub fn outputs(&self) -> Vec<String> {
        self.texts(EntryKind::Output)
    }

    pub fn errors(&self) -> Vec<String> {
        self.texts(EntryKind::Error)
    }

    fn texts(&self, kind: EntryKind) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.text.clone())
            .collect()
    }

    fn push(&self, kind: EntryKind, text: &str) {
        self.lock().push(LogEntry {
            kind,
            text: text.to_string(),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LogEntry>> {
        // A panic while holding the lock leaves the vector intact.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Reporter for MemoryReporter {
    fn write_output(&self, text: &str) {
        self.push(EntryKind::Output, text);
    }

    fn write_error(&self, text: &str) {
        self.push(EntryKind::Error, text);
    }
}

/// Reporter that appends to a log file and mirrors every entry to `tracing`.
pub struct FileReporter {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileReporter {
    /// Default log file name inside an output directory
    pub const FILE_NAME: &'static str = "simrun.log";

    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Open `simrun.log` inside `dir`.
    pub fn in_directory<P: AsRef<Path>>(dir: P) -> crate::Result<Self> {
        Self::open(dir.as_ref().join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, prefix: &str, text: &str) {
        let mut file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writeln!(file, "{}{}", prefix, text) {
            warn!(path = %self.path.display(), error = %e, "Failed to write run log");
        }
    }
}

impl Reporter for FileReporter {
    fn write_output(&self, text: &str) {
        info!(target: "simrun::run_log", "{}", text);
        self.append("", text);
    }

    fn write_error(&self, text: &str) {
        error!(target: "simrun::run_log", "{}", text);
        self.append("*** Error: ", text);
    }
}
