//! Periodic resource sampling of a running process tree.

use std::{
  collections::{HashMap, HashSet},
  time::{Duration, Instant},
};

use crossbeam_channel::{select, tick, Receiver};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, MINIMUM_CPU_UPDATE_INTERVAL};

/// Resource usage observed over a process's lifetime.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Usage {
  /// Largest summed RSS of the tree across all samples, in bytes.
  pub peak_memory_bytes: u64,
  memory_samples: usize,
  cpu_total: f64,
  cpu_samples: usize,
  /// Processes in the tree at the last sample that found it alive.
  pub tree: Vec<u32>,
}

impl Usage {
  fn record_memory(&mut self, memory_bytes: u64, tree: Vec<u32>) {
    self.peak_memory_bytes = self.peak_memory_bytes.max(memory_bytes);
    self.memory_samples += 1;
    self.tree = tree;
  }

  /// Zero readings are dropped.
  fn record_cpu(&mut self, cpu_percent: f64) {
    if cpu_percent > 0.0 {
      self.cpu_total += cpu_percent;
      self.cpu_samples += 1;
    }
  }

  /// Peak RSS, or `None` if no sample ever saw the process resident.
  pub fn peak_memory(&self) -> Option<u64> {
    (self.peak_memory_bytes > 0).then_some(self.peak_memory_bytes)
  }

  /// Mean CPU utilization of the tree, in percent of one core.
  pub fn mean_cpu(&self) -> Option<f64> {
    (self.cpu_samples > 0).then(|| self.cpu_total / self.cpu_samples as f64)
  }

  pub fn samples(&self) -> usize {
    self.memory_samples
  }
}

/// Memory and CPU are read through separate `System`s. Every process refresh
/// moves sysinfo's per-process CPU baseline, while global CPU times only move
/// once per `MINIMUM_CPU_UPDATE_INTERVAL`, so the CPU side must not be
/// refreshed faster than that.
struct Monitor {
  root: Pid,
  memory: System,
  cpu: System,
  last_cpu: Option<Instant>,
  /// Pids whose first CPU reading, always zero, has been discarded.
  primed: HashSet<Pid>,
  usage: Usage,
}

impl Monitor {
  fn new(root: u32) -> Self {
    Self {
      root: Pid::from_u32(root),
      memory: System::new(),
      cpu: System::new(),
      last_cpu: None,
      primed: HashSet::new(),
      usage: Usage::default(),
    }
  }

  fn sample_memory(&mut self) {
    self.memory.refresh_processes_specifics(
      ProcessesToUpdate::All,
      true,
      ProcessRefreshKind::nothing().with_memory(),
    );

    let tree = descendants(&self.memory, self.root);
    if tree.is_empty() {
      return;
    }

    let memory = tree
      .iter()
      .filter_map(|pid| self.memory.process(*pid))
      .map(|process| process.memory())
      .sum();
    self.usage.record_memory(memory, tree.iter().map(|pid| pid.as_u32()).collect());
  }

  fn sample_cpu(&mut self) {
    if self.last_cpu.is_some_and(|last| last.elapsed() <= MINIMUM_CPU_UPDATE_INTERVAL) {
      return;
    }
    self.last_cpu = Some(Instant::now());

    self.cpu.refresh_processes_specifics(
      ProcessesToUpdate::All,
      true,
      ProcessRefreshKind::nothing().with_cpu(),
    );

    let mut total = 0.0;
    let mut readings = 0;
    for pid in descendants(&self.cpu, self.root) {
      let Some(process) = self.cpu.process(pid) else { continue };
      if self.primed.insert(pid) {
        continue;
      }
      total += f64::from(process.cpu_usage());
      readings += 1;
    }

    if readings > 0 {
      self.usage.record_cpu(total);
    }
  }
}

/// How often CPU is read. Kept above the minimum so tick jitter cannot land a
/// refresh inside a stale window.
fn cpu_interval(interval: Duration) -> Duration {
  interval.max(MINIMUM_CPU_UPDATE_INTERVAL + MINIMUM_CPU_UPDATE_INTERVAL / 4)
}

/// Samples the tree rooted at `root` every `interval` until `stop` fires or
/// its sender is dropped, then once more.
pub fn watch(root: u32, interval: Duration, stop: Receiver<()>) -> Usage {
  let mut monitor = Monitor::new(root);
  let memory_ticker = tick(interval);
  let cpu_ticker = tick(cpu_interval(interval));

  monitor.sample_memory();
  monitor.sample_cpu();
  loop {
    select! {
      recv(stop) -> _ => break,
      recv(memory_ticker) -> _ => monitor.sample_memory(),
      recv(cpu_ticker) -> _ => monitor.sample_cpu(),
    }
  }
  monitor.sample_memory();
  monitor.sample_cpu();

  monitor.usage
}

/// `root` and every live process below it.
fn descendants(system: &System, root: Pid) -> Vec<Pid> {
  if system.process(root).is_none() {
    return Vec::new();
  }

  let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
  for (pid, process) in system.processes() {
    // Threads share their process's memory and CPU time.
    if process.thread_kind().is_some() {
      continue;
    }
    if let Some(parent) = process.parent() {
      children.entry(parent).or_default().push(*pid);
    }
  }

  let mut tree = vec![root];
  let mut next = 0;
  while let Some(&pid) = tree.get(next) {
    if let Some(kids) = children.get(&pid) {
      tree.extend(kids.iter().copied());
    }
    next += 1;
  }

  tree
}
