use chrono::{DateTime, Utc};
use simrun_core::{Reporter, Result, RunOutcome, RunRequest, StopSignal};
use std::io;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::executable::resolve_executable;
use crate::process::{build_command, send_stop_signal, spawn_reader, DrainEnd, StreamReader};
use crate::progress::ProgressSink;

const STDOUT_HEADER: &str = "*** Standard output stream from simulation:\n";
const STDERR_HEADER: &str = "*** Standard error stream from simulation:\n";

/// Runs one external process per call and supervises it until it exits or
/// its timeout forces it to stop.
#[derive(Clone)]
pub struct Supervisor {
    reporter: Arc<dyn Reporter>,
    progress: Option<Arc<dyn ProgressSink>>,
    poll_interval: Duration,
    drain_timeout: Duration,
}

/// How far the stop sequence has gone. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escalation {
    None,
    Terminated,
    Killed,
}

struct SupervisorState {
    started_at: DateTime<Utc>,
    started: Instant,
    escalation: Escalation,
    signals: Vec<StopSignal>,
    progress_finished: bool,
}

impl SupervisorState {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
            escalation: Escalation::None,
            signals: Vec::new(),
            progress_finished: false,
        }
    }

    /// Signal to send on a timeout breach.
    ///
    /// With progress reporting the first breach asks the process to
    /// terminate; any later breach, or every breach without progress
    /// reporting, kills it. A kill is sent once.
    fn next_signal(&self, progress_enabled: bool) -> Option<StopSignal> {
        match self.escalation {
            Escalation::Killed => None,
            Escalation::None if progress_enabled => Some(StopSignal::Terminate),
            _ => Some(StopSignal::Kill),
        }
    }

    fn record(&mut self, signal: StopSignal) {
        self.escalation = match signal {
            StopSignal::Terminate => Escalation::Terminated,
            StopSignal::Kill => Escalation::Killed,
        };
        self.signals.push(signal);
    }

    fn forcibly_terminated(&self) -> bool {
        self.escalation != Escalation::None
    }
}

impl Supervisor {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
    /// How long output is still read after the process exited.
    pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self {
            reporter,
            progress: None,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            drain_timeout: Self::DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Enable progress reporting.
    ///
    /// This also changes the stop sequence: a run that exceeds its timeout
    /// is first asked to terminate before it is killed.
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bound the wait for end of output once the process has exited. A
    /// grandchild that inherited the pipes would otherwise hold the call.
    pub fn with_drain_timeout(mut self, limit: Duration) -> Self {
        self.drain_timeout = limit;
        self
    }

    pub fn progress_enabled(&self) -> bool {
        self.progress.is_some()
    }

    pub fn reporter(&self) -> &Arc<dyn Reporter> {
        &self.reporter
    }

    /// Run `request` to completion.
    ///
    /// Returns `Err(ExecutableNotFound)` without spawning anything when the
    /// program cannot be resolved. Failures to spawn or wait for the process
    /// are written to the reporter and yield `Ok(None)`.
    pub async fn supervise(&self, request: &RunRequest) -> Result<Option<RunOutcome>> {
        let program = resolve_executable(request.program(), request.working_dir())?;
        let run_id = Uuid::new_v4();

        info!(
            run_id = %run_id,
            program = %program.display(),
            working_dir = %request.working_dir().display(),
            timeout = ?request.timeout(),
            "Starting simulation process"
        );

        let mut cmd = build_command(&program, request);
        let mut state = SupervisorState::new();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to spawn simulation process");
                self.reporter.write_error(&format!(
                    "Execution of '{}' failed: {}",
                    command_line(request),
                    e
                ));
                return Ok(None);
            }
        };

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let status = match request.timeout() {
            None => child.wait().await,
            Some(limit) => {
                self.wait_with_timeout(&mut child, limit, request.working_dir(), &mut state)
                    .await
            }
        };

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                stdout.abort();
                stderr.abort();
                error!(run_id = %run_id, error = %e, "Failed to wait for simulation process");
                self.reporter.write_error(&format!(
                    "Execution of '{}' failed: {}",
                    command_line(request),
                    e
                ));
                return Ok(None);
            }
        };

        let outcome = if state.forcibly_terminated() {
            // Output of a stopped process may be truncated; don't report it.
            stdout.abort();
            stderr.abort();
            let limit = request.timeout().map(|t| t.as_secs_f64()).unwrap_or_default();
            self.reporter.write_error(&format!(
                "Killed process as it computed longer than {} seconds.",
                limit
            ));
            self.build_outcome(run_id, request, &state, String::new(), String::new(), None)
        } else {
            self.finish_progress(&mut state);
            let (out, err) = tokio::join!(
                self.collect(run_id, stdout, "stdout"),
                self.collect(run_id, stderr, "stderr")
            );
            let exit_code = status.code();
            classify_streams(self.reporter.as_ref(), &out, &err, exit_code);
            self.build_outcome(run_id, request, &state, out, err, exit_code)
        };

        info!(
            run_id = %run_id,
            exit_code = ?outcome.exit_code,
            forcibly_terminated = outcome.forcibly_terminated,
            duration_ms = outcome.duration_ms,
            "Simulation process finished"
        );

        Ok(Some(outcome))
    }

    /// Race process exit against a fixed tick, escalating once the timeout
    /// has passed.
    async fn wait_with_timeout(
        &self,
        child: &mut Child,
        limit: Duration,
        working_dir: &Path,
        state: &mut SupervisorState,
    ) -> io::Result<ExitStatus> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                status = child.wait() => return status,
                _ = ticker.tick() => {
                    self.on_tick(child, limit, working_dir, state);
                }
            }
        }
    }

    fn on_tick(
        &self,
        child: &mut Child,
        limit: Duration,
        working_dir: &Path,
        state: &mut SupervisorState,
    ) {
        let elapsed = state.started.elapsed();

        if elapsed <= limit {
            if let Some(progress) = &self.progress {
                let fraction = elapsed.as_secs_f64() / limit.as_secs_f64();
                progress.report(fraction.min(1.0));
            }
            return;
        }

        let Some(signal) = state.next_signal(self.progress_enabled()) else {
            return;
        };

        match signal {
            StopSignal::Terminate => {
                self.finish_progress(state);
                self.reporter.write_error(&format!(
                    "Terminating simulation in {}.",
                    working_dir.display()
                ));
            }
            StopSignal::Kill => {
                self.reporter.write_error(&format!(
                    "Killing simulation in {}.",
                    working_dir.display()
                ));
            }
        }

        warn!(
            signal = ?signal,
            elapsed_ms = elapsed.as_millis() as u64,
            timeout_ms = limit.as_millis() as u64,
            "Simulation exceeded its timeout"
        );

        if let Err(e) = send_stop_signal(child, signal) {
            warn!(signal = ?signal, error = %e, "Failed to signal simulation process");
        }
        state.record(signal);
    }

    fn finish_progress(&self, state: &mut SupervisorState) {
        if state.progress_finished {
            return;
        }
        if let Some(progress) = &self.progress {
            progress.finish();
            state.progress_finished = true;
        }
    }

    async fn collect(&self, run_id: Uuid, reader: StreamReader, stream: &str) -> String {
        let (bytes, end) = reader.drain(self.drain_timeout).await;
        match end {
            DrainEnd::Eof => {}
            DrainEnd::TimedOut => warn!(
                run_id = %run_id,
                stream,
                "Output still open after the process exited; keeping what was read"
            ),
            DrainEnd::Failed(e) => warn!(run_id = %run_id, stream, error = %e, "Failed to read simulation output"),
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn build_outcome(
        &self,
        run_id: Uuid,
        request: &RunRequest,
        state: &SupervisorState,
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
    ) -> RunOutcome {
        RunOutcome {
            run_id,
            program: request.program().to_string(),
            stdout,
            stderr,
            exit_code,
            forcibly_terminated: state.forcibly_terminated(),
            signals: state.signals.clone(),
            started_at: state.started_at,
            duration_ms: state.started.elapsed().as_millis() as u64,
        }
    }
}

/// Route captured streams to the reporter.
///
/// Standard error is only an error when the process failed: some engines
/// print warnings there (for example about optional solvers that are not
/// installed) and still exit with status 0.
pub fn classify_streams(reporter: &dyn Reporter, stdout: &str, stderr: &str, exit_code: Option<i32>) {
    if !stdout.is_empty() {
        reporter.write_output(&format!("{}{}", STDOUT_HEADER, stdout));
    }

    if !stderr.is_empty() {
        let text = format!("{}{}", STDERR_HEADER, stderr);
        if exit_code == Some(0) {
            reporter.write_output(&text);
        } else {
            reporter.write_error(&text);
        }
    }
}

fn command_line(request: &RunRequest) -> String {
    std::iter::once(request.program())
        .chain(request.arguments().iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}
