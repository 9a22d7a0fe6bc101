//! Process supervisor for external tools
//!
//! Spawns a child process, consumes its output in one of two modes and
//! terminates it on timeout or cancellation:
//! - multiplexed: stdout and stderr collected into separate buffers through a
//!   readiness loop that never blocks on a single pipe
//! - streaming: stdout and stderr merged into one line sequence handed to a
//!   callback as lines arrive

use crate::registry::JobRegistry;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upper bound on a single wait inside the multiplexed read loop
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long a child gets to exit after the graceful stop signal
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Error type for process supervision
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The executable could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// IO error while supervising a running child
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Command line of an external tool
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Arguments as lossy strings, mostly for logging and tests
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Signalling handle to a running child, shared with the job registry
///
/// Holds only the pid so the registry can ask the process to stop while the
/// supervisor keeps ownership of the `Child` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: Option<u32>,
}

impl ProcessHandle {
    pub fn from_child(child: &Child) -> Self {
        Self { pid: child.id() }
    }

    #[cfg(test)]
    pub(crate) fn from_pid_for_tests(pid: u32) -> Self {
        Self { pid: Some(pid) }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send the graceful stop signal.
    ///
    /// Failures (process already gone) are ignored. On platforms without
    /// signals this does nothing; the owning supervisor kills the child when
    /// it observes the cancellation token.
    pub fn signal_terminate(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
}

/// Terminate a child: graceful signal, bounded wait, then force kill.
///
/// Errors from signalling a process that already exited are swallowed.
pub async fn terminate(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    #[cfg(unix)]
    ProcessHandle::from_child(child).signal_terminate();
    #[cfg(not(unix))]
    let _ = child.start_kill();

    if tokio::time::timeout(TERMINATE_GRACE, child.wait())
        .await
        .is_err()
    {
        let _ = child.kill().await;
    }
}

/// How a multiplexed collection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOutcome {
    /// Process exited and both pipes reached end-of-stream
    Exited(Option<i32>),
    /// Wall-clock budget elapsed; the process was terminated
    TimedOut,
    /// Cancellation observed; the process was terminated
    Cancelled,
}

/// Output captured in multiplexed mode
#[derive(Debug, Clone)]
pub struct CollectedOutput {
    pub outcome: CollectOutcome,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CollectedOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Pipe a streamed line was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// How a streaming run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Exit code, `None` when killed by a signal
    Exited(Option<i32>),
    Cancelled,
}

/// Read one chunk from an optional pipe; a closed pipe never becomes ready.
async fn read_chunk<R>(stream: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match stream {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Forward every line of a pipe into the merged line channel
fn forward_lines<R>(stream: R, source: OutputStream, tx: mpsc::Sender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if tx.send((source, line)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Publishes the running child in the registry and clears it on drop
struct ChildGuard<'a> {
    attachment: Option<&'a Attachment>,
}

impl<'a> ChildGuard<'a> {
    fn attach(attachment: Option<&'a Attachment>, child: &Child) -> Self {
        if let Some(a) = attachment {
            a.registry
                .set_process(&a.job_id, ProcessHandle::from_child(child));
        }
        Self { attachment }
    }
}

impl Drop for ChildGuard<'_> {
    fn drop(&mut self) {
        if let Some(a) = self.attachment {
            a.registry.clear_process(&a.job_id);
        }
    }
}

#[derive(Debug, Clone)]
struct Attachment {
    registry: Arc<JobRegistry>,
    job_id: String,
}

/// Runs external tools on behalf of one job
#[derive(Debug, Clone)]
pub struct Supervisor {
    cancel: CancellationToken,
    attachment: Option<Attachment>,
}

impl Supervisor {
    /// Supervisor that observes `cancel` but is not tied to a registry entry
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            attachment: None,
        }
    }

    /// Supervisor that publishes each child as the job's active process
    pub fn for_job(registry: Arc<JobRegistry>, job_id: &str, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            attachment: Some(Attachment {
                registry,
                job_id: job_id.to_string(),
            }),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn spawn(&self, spec: &ProcessSpec) -> Result<Child, ProcessError> {
        debug!(program = %spec.program_name(), args = ?spec.args_lossy(), "spawning process");
        spec.command().spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program_name(),
            source,
        })
    }

    /// Run a process collecting stdout and stderr separately.
    ///
    /// Both pipes are drained concurrently so a child filling one pipe can
    /// never block while the other is being read. Each loop iteration waits
    /// at most [`POLL_INTERVAL`]. Returns when the child has exited and both
    /// pipes are closed, when `timeout` elapses, or when cancellation is
    /// observed, whichever comes first.
    pub async fn collect(
        &self,
        spec: &ProcessSpec,
        timeout: Option<Duration>,
    ) -> Result<CollectedOutput, ProcessError> {
        let mut child = self.spawn(spec)?;
        let _guard = ChildGuard::attach(self.attachment.as_ref(), &child);

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut stdout_chunk = [0u8; 4096];
        let mut stderr_chunk = [0u8; 4096];
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut exit_code: Option<Option<i32>> = None;

        let outcome = loop {
            if self.cancel.is_cancelled() {
                terminate(&mut child).await;
                break CollectOutcome::Cancelled;
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                terminate(&mut child).await;
                break CollectOutcome::TimedOut;
            }

            if let Some(code) = exit_code {
                if stdout.is_none() && stderr.is_none() {
                    break CollectOutcome::Exited(code);
                }
            }

            tokio::select! {
                read = read_chunk(&mut stdout, &mut stdout_chunk) => match read {
                    Ok(0) | Err(_) => stdout = None,
                    Ok(n) => stdout_buf.extend_from_slice(&stdout_chunk[..n]),
                },
                read = read_chunk(&mut stderr, &mut stderr_chunk) => match read {
                    Ok(0) | Err(_) => stderr = None,
                    Ok(n) => stderr_buf.extend_from_slice(&stderr_chunk[..n]),
                },
                status = child.wait(), if exit_code.is_none() => {
                    exit_code = Some(status?.code());
                }
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        };

        Ok(CollectedOutput {
            outcome,
            stdout: stdout_buf,
            stderr: stderr_buf,
        })
    }

    /// Run a process feeding its merged stdout/stderr lines to `on_line`.
    ///
    /// Empty lines are skipped. Cancellation is checked for every line and
    /// while waiting for the next one; once observed the child is terminated
    /// and no further lines are delivered.
    ///
    /// Each pipe is read by its own task, so lines keep their order within a
    /// stream but not across the two. Callers that care where a line came
    /// from get its [`OutputStream`].
    pub async fn stream_lines<F>(
        &self,
        spec: &ProcessSpec,
        mut on_line: F,
    ) -> Result<StreamOutcome, ProcessError>
    where
        F: FnMut(OutputStream, &str),
    {
        let mut child = self.spawn(spec)?;
        let _guard = ChildGuard::attach(self.attachment.as_ref(), &child);

        let (tx, mut rx) = mpsc::channel::<(OutputStream, String)>(256);
        if let Some(out) = child.stdout.take() {
            forward_lines(out, OutputStream::Stdout, tx.clone());
        }
        if let Some(err) = child.stderr.take() {
            forward_lines(err, OutputStream::Stderr, tx.clone());
        }
        drop(tx);

        loop {
            let next = tokio::select! {
                line = rx.recv() => line,
                _ = self.cancel.cancelled() => None,
            };

            if self.cancel.is_cancelled() {
                terminate(&mut child).await;
                return Ok(StreamOutcome::Cancelled);
            }

            match next {
                Some((_, line)) if line.trim().is_empty() => continue,
                Some((source, line)) => on_line(source, &line),
                None => break,
            }
        }

        let status = child.wait().await?;
        Ok(StreamOutcome::Exited(status.code()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_collect_separates_streams() {
        let supervisor = Supervisor::new(CancellationToken::new());
        let output = supervisor
            .collect(&sh("echo out; echo err 1>&2; exit 3"), None)
            .await
            .expect("sh should run");

        assert_eq!(output.outcome, CollectOutcome::Exited(Some(3)));
        assert_eq!(output.stdout_lossy(), "out\n");
        assert_eq!(output.stderr_lossy(), "err\n");
    }

    #[tokio::test]
    async fn test_collect_drains_large_output_on_both_pipes() {
        // Larger than a pipe buffer on both streams at once
        let script = "i=0; while [ $i -lt 2000 ]; do \
                      echo 'stdout line padding padding padding padding'; \
                      echo 'stderr line padding padding padding padding' 1>&2; \
                      i=$((i+1)); done";
        let supervisor = Supervisor::new(CancellationToken::new());
        let output = supervisor
            .collect(&sh(script), Some(Duration::from_secs(30)))
            .await
            .expect("sh should run");

        assert_eq!(output.outcome, CollectOutcome::Exited(Some(0)));
        assert_eq!(output.stdout_lossy().lines().count(), 2000);
        assert_eq!(output.stderr_lossy().lines().count(), 2000);
    }

    #[tokio::test]
    async fn test_collect_times_out_hanging_process() {
        let supervisor = Supervisor::new(CancellationToken::new());
        let started = std::time::Instant::now();
        let output = supervisor
            .collect(&sh("echo partial; exec sleep 30"), Some(Duration::from_millis(500)))
            .await
            .expect("sh should run");

        assert_eq!(output.outcome, CollectOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_collect_observes_cancellation() {
        let token = CancellationToken::new();
        let supervisor = Supervisor::new(token.clone());
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                token.cancel();
            })
        };

        let output = supervisor
            .collect(&sh("exec sleep 30"), None)
            .await
            .expect("sh should run");
        canceller.await.expect("canceller task");

        assert_eq!(output.outcome, CollectOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_stream_lines_merges_streams_and_skips_blanks() {
        let supervisor = Supervisor::new(CancellationToken::new());
        let mut lines = Vec::new();
        let outcome = supervisor
            .stream_lines(&sh("echo one; echo; echo two 1>&2; exit 0"), |source, line| {
                lines.push((line.to_string(), source))
            })
            .await
            .expect("sh should run");

        assert_eq!(outcome, StreamOutcome::Exited(Some(0)));
        lines.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            lines,
            vec![
                ("one".to_string(), OutputStream::Stdout),
                ("two".to_string(), OutputStream::Stderr),
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_lines_cancelled_mid_stream() {
        let token = CancellationToken::new();
        let supervisor = Supervisor::new(token.clone());
        let mut seen = 0;
        let outcome = supervisor
            .stream_lines(&sh("echo first; exec sleep 30"), |_, _| {
                seen += 1;
                token.cancel();
            })
            .await
            .expect("sh should run");

        assert_eq!(outcome, StreamOutcome::Cancelled);
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_program() {
        let supervisor = Supervisor::new(CancellationToken::new());
        let err = supervisor
            .collect(&ProcessSpec::new("/nonexistent/fetchd-tool"), None)
            .await
            .expect_err("missing binary must fail");

        assert!(err.to_string().contains("/nonexistent/fetchd-tool"));
    }

    #[tokio::test]
    async fn test_supervisor_publishes_child_in_registry() {
        let registry = Arc::new(JobRegistry::new());
        let token = registry.register("job-1");
        let supervisor = Supervisor::for_job(registry.clone(), "job-1", token);

        let seen_pid = {
            let registry = registry.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                registry.process("job-1").and_then(|h| h.pid())
            })
        };

        supervisor
            .collect(&sh("sleep 1"), None)
            .await
            .expect("sh should run");

        assert!(seen_pid.await.expect("probe task").is_some());
        assert!(registry.process("job-1").is_none());
    }
}
