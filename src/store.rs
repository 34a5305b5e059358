//! Append-only results store.
//!
//! Workers never touch the store directly: they send records over a channel
//! to a single collector thread, which is the only writer.

use std::{
  collections::BTreeMap,
  sync::Arc,
  thread::{self, JoinHandle},
};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::trace;

use crate::{exec::ExecutionRecord, task::Language};

/// Records of one task, by language, in iteration order.
pub type TaskRecords = BTreeMap<Language, Vec<ExecutionRecord>>;

/// Records of every task.
pub type Snapshot = BTreeMap<String, TaskRecords>;

#[derive(Debug, Default)]
pub struct ResultsStore {
  records: Mutex<Snapshot>,
}

impl ResultsStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn append(&self, record: ExecutionRecord) {
    self
      .records
      .lock()
      .entry(record.task.clone())
      .or_default()
      .entry(record.language.clone())
      .or_default()
      .push(record);
  }

  /// A copy of everything appended so far.
  pub fn snapshot(&self) -> Snapshot {
    self.records.lock().clone()
  }
}

#[cfg(test)]
impl ResultsStore {
  fn task(&self, task: &str) -> TaskRecords {
    self.records.lock().get(task).cloned().unwrap_or_default()
  }

  fn len(&self) -> usize {
    self
      .records
      .lock()
      .values()
      .flat_map(BTreeMap::values)
      .map(Vec::len)
      .sum()
  }
}

/// Owns the receiving end of the record channel and appends to a store.
pub struct Collector {
  sender: Sender<ExecutionRecord>,
  handle: JoinHandle<usize>,
}

impl Collector {
  pub fn spawn(store: Arc<ResultsStore>) -> Self {
    let (sender, receiver) = unbounded::<ExecutionRecord>();

    let handle = thread::spawn(move || {
      let mut collected = 0;
      for record in receiver {
        trace!(task = %record.task, language = %record.language, iteration = record.iteration, "collected");
        store.append(record);
        collected += 1;
      }
      collected
    });

    Self { sender, handle }
  }

  pub fn sender(&self) -> Sender<ExecutionRecord> {
    self.sender.clone()
  }

  /// Waits until every record sent so far is in the store. Returns how many
  /// records were collected. Outstanding clones of the sender must already be
  /// dropped.
  pub fn finish(self) -> usize {
    drop(self.sender);
    self.handle.join().unwrap_or(0)
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::{build::BuildArtifact, exec::Outcome, task::TaskSpec};

  fn record(task: &str, language: &str, iteration: usize) -> ExecutionRecord {
    let artifact = BuildArtifact::pending(&TaskSpec::new(task, "test"), &Language::from(language));
    ExecutionRecord {
      outcome: Outcome::Success,
      duration: Duration::from_millis(10),
      ..ExecutionRecord::skipped(&artifact, iteration, "")
    }
  }

  #[test]
  fn test_snapshot_is_a_copy() {
    let store = ResultsStore::new();
    store.append(record("sum_n", "rust", 0));

    let snapshot = store.snapshot();
    store.append(record("sum_n", "rust", 1));

    assert_eq!(snapshot["sum_n"][&Language::from("rust")].len(), 1);
    assert_eq!(store.task("sum_n")[&Language::from("rust")].len(), 2);
    assert!(store.task("missing").is_empty());
  }

  #[test]
  fn test_collector_from_many_workers() {
    let store = Arc::new(ResultsStore::new());
    let collector = Collector::spawn(store.clone());

    thread::scope(|scope| {
      for language in ["go", "python", "rust"] {
        let sender = collector.sender();
        scope.spawn(move || {
          for iteration in 0..50 {
            sender.send(record("sum_n", language, iteration)).unwrap();
          }
        });
      }
    });

    assert_eq!(collector.finish(), 150);
    assert_eq!(store.len(), 150);

    let rust = &store.task("sum_n")[&Language::from("rust")];
    let iterations: Vec<_> = rust.iter().map(|r| r.iteration).collect();
    assert_eq!(iterations, (0..50).collect::<Vec<_>>());
  }
}
