// Low-level child process helpers used by the supervisor.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use simrun_core::{RunRequest, StopSignal};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Build the command for a request, spawning `program` instead of the
/// unresolved name from the request.
pub fn build_command(program: &std::path::Path, request: &RunRequest) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(request.arguments())
        .current_dir(request.working_dir())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(env) = request.environment() {
        cmd.env_clear().envs(env);
    }

    cmd
}

/// How reading a child stream ended.
#[derive(Debug)]
pub enum DrainEnd {
    Eof,
    /// The stream was still open when the drain limit passed, typically
    /// because a grandchild inherited the pipe.
    TimedOut,
    Failed(io::Error),
}

/// A child stream read on its own task into a shared buffer.
pub struct StreamReader {
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<io::Result<()>>,
}

impl StreamReader {
    /// Stop reading; the bytes read so far are dropped with the reader.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Wait up to `limit` for end of stream and return everything read.
    pub async fn drain(self, limit: Duration) -> (Vec<u8>, DrainEnd) {
        let mut handle = self.handle;
        let end = match tokio::time::timeout(limit, &mut handle).await {
            Ok(Ok(Ok(()))) => DrainEnd::Eof,
            Ok(Ok(Err(e))) => DrainEnd::Failed(e),
            Ok(Err(e)) => DrainEnd::Failed(io::Error::other(e)),
            Err(_) => {
                handle.abort();
                DrainEnd::TimedOut
            }
        };
        let bytes = std::mem::take(&mut *self.buffer.lock().await);
        (bytes, end)
    }
}

/// Start reading a child stream.
///
/// Both pipes are drained concurrently from the moment of spawn, so a child
/// that fills one pipe while the other is unread cannot stall.
pub fn spawn_reader<R>(stream: Option<R>) -> StreamReader
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let sink = buffer.clone();
    let handle = tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return Ok(());
        };
        let mut chunk = [0u8; 8192];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            sink.lock().await.extend_from_slice(&chunk[..n]);
        }
    });
    StreamReader { buffer, handle }
}

/// Send `signal` to the child without waiting for it to exit.
pub fn send_stop_signal(child: &mut Child, signal: StopSignal) -> io::Result<()> {
    match signal {
        StopSignal::Terminate => terminate(child),
        StopSignal::Kill => child.start_kill(),
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from),
        // Already reaped.
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}
