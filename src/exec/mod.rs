//! Process Executor.
//!
//! Runs one iteration of an artifact as an isolated process group, with a
//! monitor thread sampling its resource usage while the calling thread waits
//! for exit, timeout or cancellation.

pub mod monitor;

use std::{
  ffi::OsStr,
  io::{self, Read},
  process::{Child, ExitStatus, Stdio},
  thread,
  time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, trace};
use wait_timeout::ChildExt as WaitExt;

use crate::{
  build::BuildArtifact,
  cancel::CancellationToken,
  ext::{signal_all, signal_group, ChildExt, CommandExt, ExitStatusExt, CANCEL_POLL},
  task::{duration_ms, Language},
};

/// How long to wait for the output pipes to close once the tree is gone.
const PIPE_DRAIN: Duration = Duration::from_secs(1);

/// Bytes of stderr kept for the error detail of a failed run.
const STDERR_TAIL: usize = 2048;

/// Classification of one execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
  Success,
  NonZeroExit,
  /// Wall-clock timeout elapsed before the process exited.
  Timeout,
  /// The process could not be started.
  ProcessError,
  /// Not run because an earlier iteration found the artifact unusable.
  Skipped,
  /// Interrupted by session cancellation.
  Cancelled,
}

impl Outcome {
  pub fn is_success(self) -> bool {
    self == Outcome::Success
  }

  /// Whether the outcome counts toward the success-rate denominator.
  pub fn is_attempt(self) -> bool {
    self != Outcome::Cancelled
  }
}

/// One iteration's evidence. Immutable once produced.
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionRecord {
  pub task: String,
  pub language: Language,
  pub iteration: usize,
  #[serde(rename = "duration_ms", with = "duration_ms")]
  pub duration: Duration,
  pub peak_memory_bytes: Option<u64>,
  pub cpu_percent: Option<f64>,
  pub outcome: Outcome,
  pub exit_code: Option<i32>,
  pub stdout_len: u64,
  pub error: Option<String>,
}

impl ExecutionRecord {
  fn new(artifact: &BuildArtifact, outcome: Outcome) -> Self {
    Self {
      task: artifact.task.clone(),
      language: artifact.language.clone(),
      iteration: 0,
      duration: Duration::ZERO,
      peak_memory_bytes: None,
      cpu_percent: None,
      outcome,
      exit_code: None,
      stdout_len: 0,
      error: None,
    }
  }

  /// A placeholder for an iteration that never ran.
  pub fn skipped(artifact: &BuildArtifact, iteration: usize, reason: impl Into<String>) -> Self {
    Self {
      iteration,
      error: Some(reason.into()),
      ..Self::new(artifact, Outcome::Skipped)
    }
  }

  pub fn with_iteration(self, iteration: usize) -> Self {
    Self { iteration, ..self }
  }

  pub fn duration_ms(&self) -> f64 {
    self.duration.as_secs_f64() * 1000.0
  }

  pub fn memory_mb(&self) -> Option<f64> {
    self.peak_memory_bytes.map(|bytes| bytes as f64 / (1024.0 * 1024.0))
  }
}

#[derive(Clone, Debug)]
pub struct ExecutorOptions {
  /// Time between SIGTERM and SIGKILL when stopping a process group.
  pub grace: Duration,
  pub sample_interval: Duration,
}

impl Default for ExecutorOptions {
  fn default() -> Self {
    Self {
      grace: Duration::from_millis(500),
      sample_interval: Duration::from_millis(100),
    }
  }
}

enum Verdict {
  Exited(ExitStatus),
  TimedOut,
  Cancelled,
  WaitFailed(io::Error),
}

#[derive(Clone, Debug, Default)]
pub struct Executor {
  options: ExecutorOptions,
  cancel: CancellationToken,
}

impl Executor {
  pub fn new(options: ExecutorOptions, cancel: CancellationToken) -> Self {
    Self { options, cancel }
  }

  pub fn cancel_token(&self) -> &CancellationToken {
    &self.cancel
  }

  /// Runs `artifact` once with `args` under a wall-clock `timeout`. Always
  /// returns a populated record; failures are classified, never propagated.
  pub fn execute<S: AsRef<OsStr>>(&self, artifact: &BuildArtifact, args: &[S], timeout: Duration) -> ExecutionRecord {
    if self.cancel.is_cancelled() {
      return ExecutionRecord {
        error: Some("cancelled before start".to_string()),
        ..ExecutionRecord::new(artifact, Outcome::Cancelled)
      };
    }

    let process_error = |reason: String| ExecutionRecord {
      error: Some(reason),
      ..ExecutionRecord::new(artifact, Outcome::ProcessError)
    };

    let Some(mut command) = artifact.command() else {
      return process_error(artifact.failure_reason().unwrap_or_else(|| "artifact has no path".to_string()));
    };

    // Each iteration gets its own working and temp directory.
    let scratch = match TempDir::with_prefix("langbench-run-") {
      Ok(scratch) => scratch,
      Err(err) => return process_error(format!("create scratch directory: {err}")),
    };

    command
      .args(args)
      .current_dir(scratch.path())
      .env("TMPDIR", scratch.path())
      .isolated()
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());

    let start = Instant::now();
    let mut child = match command.spawn() {
      Ok(child) => child,
      Err(err) => {
        return ExecutionRecord {
          duration: start.elapsed(),
          ..process_error(format!("spawn: {err}"))
        }
      }
    };
    let pid = child.id();
    trace!(task = %artifact.task, language = %artifact.language, pid, "spawned");

    let stdout = read_in_background(child.stdout.take(), |mut out| io::copy(&mut out, &mut io::sink()).unwrap_or(0));
    let stderr = read_in_background(child.stderr.take(), |mut err| tail(&mut err, STDERR_TAIL));
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let interval = self.options.sample_interval;

    let (verdict, duration, usage) = thread::scope(|scope| {
      let monitor = scope.spawn(move || monitor::watch(pid, interval, stop_rx));

      let verdict = self.wait(&mut child, start, timeout);
      let duration = start.elapsed();

      drop(stop_tx);
      let usage = monitor.join().unwrap_or_default();

      (verdict, duration, usage)
    });
    self.reap(&mut child, &verdict, &usage.tree);

    // A descendant that escaped the kill can hold the pipes open forever.
    let stdout_len = stdout.recv_timeout(PIPE_DRAIN).unwrap_or_else(|_| {
      debug!(pid, "stdout still open after reaping");
      0
    });
    let stderr = stderr.recv_timeout(PIPE_DRAIN).unwrap_or_default();

    let mut record = ExecutionRecord {
      duration,
      peak_memory_bytes: usage.peak_memory(),
      cpu_percent: usage.mean_cpu(),
      stdout_len,
      ..ExecutionRecord::new(artifact, Outcome::Success)
    };

    match verdict {
      Verdict::TimedOut => {
        record.outcome = Outcome::Timeout;
        record.error = Some(format!("timed out after {timeout:?}"));
      }
      Verdict::Cancelled => {
        record.outcome = Outcome::Cancelled;
        record.error = Some("cancelled".to_string());
      }
      Verdict::WaitFailed(err) => {
        record.outcome = Outcome::ProcessError;
        record.error = Some(format!("wait: {err}"));
      }
      Verdict::Exited(status) => {
        record.exit_code = Some(status.code_or_signal());
        if let Err(err) = status.check_success() {
          record.outcome = Outcome::NonZeroExit;
          let stderr = String::from_utf8_lossy(&stderr);
          record.error = Some(match stderr.trim() {
            "" => err.to_string(),
            detail => format!("{err}: {detail}"),
          });
        }
      }
    }

    debug!(
      task = %record.task,
      language = %record.language,
      outcome = ?record.outcome,
      duration_ms = record.duration_ms(),
      "executed"
    );

    record
  }

  fn wait(&self, child: &mut Child, start: Instant, timeout: Duration) -> Verdict {
    let deadline = start + timeout;
    loop {
      if self.cancel.is_cancelled() {
        return Verdict::Cancelled;
      }

      let now = Instant::now();
      if now >= deadline {
        return Verdict::TimedOut;
      }

      match child.wait_timeout((deadline - now).min(CANCEL_POLL)) {
        Ok(Some(status)) => return Verdict::Exited(status),
        Ok(None) => {}
        Err(err) => return Verdict::WaitFailed(err),
      }
    }
  }

  /// Stops whatever is left of the process tree and reaps the leader.
  fn reap(&self, child: &mut Child, verdict: &Verdict, tree: &[u32]) {
    let pid = child.id();
    let result = match verdict {
      Verdict::Exited(_) => signal_group(pid, libc::SIGKILL),
      _ => child.terminate_group(self.options.grace).map(drop),
    };
    if let Err(err) = result {
      debug!(pid, %err, "process group cleanup failed");
    }

    // Descendants that called setsid left the group and are only reachable
    // by pid.
    let strays: Vec<u32> = tree.iter().copied().filter(|&stray| stray != pid).collect();
    if let Err(err) = signal_all(&strays, libc::SIGKILL) {
      debug!(pid, ?strays, %err, "stray cleanup failed");
    }
  }
}

/// Consumes a pipe on a detached thread and delivers the result once every
/// writer has closed it.
fn read_in_background<R, T>(pipe: Option<R>, read: impl FnOnce(R) -> T + Send + 'static) -> Receiver<T>
where
  R: Read + Send + 'static,
  T: Default + Send + 'static,
{
  let (tx, rx) = bounded(1);
  thread::spawn(move || {
    let _ = tx.send(pipe.map(read).unwrap_or_default());
  });
  rx
}

/// Reads to the end, keeping only the last `limit` bytes.
fn tail<R: Read>(reader: &mut R, limit: usize) -> Vec<u8> {
  let mut kept = Vec::new();
  let mut buf = [0u8; 8192];
  loop {
    match reader.read(&mut buf) {
      Ok(0) | Err(_) => break,
      Ok(n) => {
        kept.extend_from_slice(&buf[..n]);
        if kept.len() > limit * 2 {
          kept.drain(..kept.len() - limit);
        }
      }
    }
  }

  if kept.len() > limit {
    kept.drain(..kept.len() - limit);
  }
  kept
}
