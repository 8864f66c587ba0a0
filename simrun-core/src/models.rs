use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Result, SimrunError};

/// One invocation of an external executable.
///
/// A request is immutable once built; the builder methods consume `self`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Option<Duration>,
    env: Option<BTreeMap<String, String>>,
}

impl RunRequest {
    pub fn new<S: Into<String>, P: AsRef<Path>>(program: S, working_dir: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.as_ref().to_path_buf(),
            timeout: None,
            env: None,
        }
    }

    /// Build a request from an argument vector whose first element is the
    /// executable.
    pub fn from_command<P: AsRef<Path>>(command: &[String], working_dir: P) -> Result<Self> {
        let (program, args) = command.split_first().ok_or_else(|| {
            SimrunError::InvalidConfiguration("command must not be empty".to_string())
        })?;
        Ok(Self::new(program.clone(), working_dir).args(args.iter().cloned()))
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Timeout in seconds; zero, negative or non-finite values disable it.
    pub fn timeout_secs(mut self, secs: f64) -> Self {
        self.timeout = if secs.is_finite() && secs > 0.0 {
            Some(Duration::from_secs_f64(secs))
        } else {
            None
        };
        self
    }

    /// Replace the inherited environment with exactly these variables.
    pub fn env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn environment(&self) -> Option<&BTreeMap<String, String>> {
        self.env.as_ref()
    }
}

/// Signals the supervisor sends to stop a run that exceeded its timeout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopSignal {
    /// Graceful request (SIGTERM on Unix).
    Terminate,
    /// Forceful kill.
    Kill,
}

/// Result of a supervised run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub program: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub forcibly_terminated: bool,
    pub signals: Vec<StopSignal>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunOutcome {
    /// True when the process ran to completion and exited with status 0.
    pub fn succeeded(&self) -> bool {
        !self.forcibly_terminated && self.exit_code == Some(0)
    }
}
