//! Iteration Sampler.

use std::{ffi::OsString, iter::FusedIterator, time::Duration};

use tracing::{debug, warn};

use crate::{
  build::BuildArtifact,
  exec::{ExecutionRecord, Executor, Outcome},
  task::TaskSpec,
};

/// Lazily runs an artifact `count` times, strictly one after another.
///
/// Yields exactly `count` records. If the artifact turns out to be unusable,
/// the iterations that can no longer run are yielded as `Skipped`. The only
/// early end is session cancellation: the cancelled iteration is yielded and
/// nothing after it. Skipped placeholders stop without one.
pub struct Sampler<'a> {
  executor: &'a Executor,
  artifact: &'a BuildArtifact,
  args: Vec<OsString>,
  timeout: Duration,
  warmup: usize,
  count: usize,
  next: usize,
  started: bool,
  stopped: bool,
  /// Set once the artifact is found unusable.
  unusable: Option<String>,
}

/// Runs `task.iterations` measured executions of `artifact`, preceded by
/// `task.warmup` discarded ones.
pub fn sample<'a>(
  executor: &'a Executor,
  task: &TaskSpec,
  artifact: &'a BuildArtifact,
  args: Vec<OsString>,
) -> Sampler<'a> {
  Sampler {
    executor,
    artifact,
    args,
    timeout: task.timeout,
    warmup: task.warmup,
    count: task.iterations,
    next: 0,
    started: false,
    stopped: false,
    unusable: None,
  }
}

#[cfg(test)]
impl Sampler<'_> {
  fn with_count(mut self, count: usize) -> Self {
    self.count = count;
    self
  }

  fn with_warmup(mut self, warmup: usize) -> Self {
    self.warmup = warmup;
    self
  }
}

impl Sampler<'_> {
  fn start(&mut self) {
    self.started = true;

    if let Err(err) = self.artifact.validate() {
      warn!(
        task = %self.artifact.task,
        language = %self.artifact.language,
        %err,
        "artifact unusable, skipping iterations"
      );
      self.unusable = Some(err.to_string());
      return;
    }

    for round in 0..self.warmup {
      let record = self.executor.execute(self.artifact, &self.args, self.timeout);
      debug!(
        task = %self.artifact.task,
        language = %self.artifact.language,
        round,
        outcome = ?record.outcome,
        "warmup"
      );
      if record.outcome == Outcome::Cancelled {
        break;
      }
    }
  }

  fn run(&mut self, iteration: usize) -> ExecutionRecord {
    if let Some(reason) = &self.unusable {
      return ExecutionRecord::skipped(self.artifact, iteration, reason.clone());
    }

    let record = self
      .executor
      .execute(self.artifact, &self.args, self.timeout)
      .with_iteration(iteration);

    match record.outcome {
      Outcome::Cancelled => self.stopped = true,
      // A spawn failure may mean the artifact vanished mid-run.
      Outcome::ProcessError => {
        if let Err(err) = self.artifact.validate() {
          warn!(
            task = %self.artifact.task,
            language = %self.artifact.language,
            iteration,
            %err,
            "artifact lost, skipping remaining iterations"
          );
          self.unusable = Some(err.to_string());
        }
      }
      _ => {}
    }

    record
  }
}

impl Iterator for Sampler<'_> {
  type Item = ExecutionRecord;

  fn next(&mut self) -> Option<ExecutionRecord> {
    if self.stopped || self.next >= self.count {
      return None;
    }

    if !self.started {
      self.start();
    }
    if self.unusable.is_some() && self.executor.cancel_token().is_cancelled() {
      self.stopped = true;
      return None;
    }

    let iteration = self.next;
    self.next += 1;
    Some(self.run(iteration))
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    if self.stopped {
      return (0, Some(0));
    }

    let remaining = self.count - self.next;
    (remaining.min(1), Some(remaining))
  }
}

impl FusedIterator for Sampler<'_> {}

#[cfg(test)]
mod tests {
  use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::Path,
  };

  use super::*;
  use crate::{
    build::BuildStatus,
    cancel::CancellationToken,
    exec::ExecutorOptions,
    task::Language,
  };

  fn artifact(dir: &Path, body: &str) -> BuildArtifact {
    let path = dir.join("unit");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

    BuildArtifact {
      status: BuildStatus::Ready,
      path: Some(path),
      ..BuildArtifact::pending(&task(), &Language::from("shell"))
    }
  }

  fn task() -> TaskSpec {
    TaskSpec::new("unit", "test")
      .with_iterations(4)
      .with_timeout(Duration::from_secs(10))
  }

  fn executor() -> Executor {
    Executor::new(
      ExecutorOptions {
        grace: Duration::from_millis(50),
        sample_interval: Duration::from_millis(20),
      },
      CancellationToken::new(),
    )
  }

  #[test]
  fn test_yields_exactly_count() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = artifact(dir.path(), "exit 0");
    let executor = executor();

    let records: Vec<_> = sample(&executor, &task(), &artifact, Vec::new()).collect();

    assert_eq!(records.len(), 4);
    let iterations: Vec<_> = records.iter().map(|r| r.iteration).collect();
    assert_eq!(iterations, [0, 1, 2, 3]);
    assert!(records.iter().all(|r| r.outcome == Outcome::Success));
  }

  #[test]
  fn test_failures_are_kept_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");
    let artifact = artifact(
      dir.path(),
      &format!("echo x >> {0}; [ $(wc -l < {0}) -ne 2 ]", counter.display()),
    );
    let executor = executor();

    let outcomes: Vec<_> = sample(&executor, &task(), &artifact, Vec::new())
      .map(|r| r.outcome)
      .collect();

    assert_eq!(
      outcomes,
      [Outcome::Success, Outcome::NonZeroExit, Outcome::Success, Outcome::Success]
    );
  }

  #[test]
  fn test_missing_artifact_skips_remaining() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = artifact(dir.path(), "exit 0");
    fs::remove_file(artifact.path.as_ref().unwrap()).unwrap();
    let executor = executor();

    let records: Vec<_> = sample(&executor, &task(), &artifact, Vec::new()).collect();

    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| r.outcome == Outcome::Skipped));
    assert!(records[0].error.as_deref().unwrap().contains("missing"));
  }

  #[test]
  fn test_warmup_runs_are_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("count");
    let artifact = artifact(dir.path(), &format!("echo x >> {}", counter.display()));
    let executor = executor();

    let records: Vec<_> = sample(&executor, &task(), &artifact, Vec::new())
      .with_count(2)
      .with_warmup(3)
      .collect();

    assert_eq!(records.len(), 2);
    assert_eq!(fs::read_to_string(&counter).unwrap().lines().count(), 5);
  }

  #[test]
  fn test_cancellation_ends_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = artifact(dir.path(), "exit 0");
    let executor = executor();

    let mut sampler = sample(&executor, &task(), &artifact, Vec::new());
    assert_eq!(sampler.next().unwrap().outcome, Outcome::Success);

    executor.cancel_token().cancel();
    assert_eq!(sampler.next().unwrap().outcome, Outcome::Cancelled);
    assert!(sampler.next().is_none());
    assert!(sampler.next().is_none());
  }

  #[test]
  fn test_cancellation_ends_skipped_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = artifact(dir.path(), "exit 0");
    fs::remove_file(artifact.path.as_ref().unwrap()).unwrap();
    let executor = executor();

    let mut sampler = sample(&executor, &task(), &artifact, Vec::new());
    assert_eq!(sampler.next().unwrap().outcome, Outcome::Skipped);

    executor.cancel_token().cancel();
    assert!(sampler.next().is_none());
    assert_eq!(sampler.size_hint(), (0, Some(0)));
  }

  #[test]
  fn test_lazy_until_polled() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let artifact = artifact(dir.path(), &format!("touch {}", marker.display()));
    let executor = executor();

    let sampler = sample(&executor, &task(), &artifact, Vec::new());
    assert!(!marker.exists());
    drop(sampler);
    assert!(!marker.exists());
  }
}
