//! End-to-end session driver.
//!
//! Probes toolchains, then runs one build-and-sample pipeline per
//! (task, language) pair on a worker pool. Records flow to a single
//! collector; analysis starts only after every pipeline has finished and
//! the collector has drained.

use std::{
  collections::{BTreeMap, BTreeSet},
  ffi::OsString,
  fs,
  path::PathBuf,
  sync::Arc,
  time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use rayon::{prelude::*, ThreadPoolBuilder};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
  build::{ArtifactCache, BuildArtifact, Builder, Resolver, ResolverOptions},
  cancel::CancellationToken,
  config::Config,
  error::EngineError,
  exec::{ExecutionRecord, Executor, ExecutorOptions},
  sampler::sample,
  stats::{analyze, ScoreWeights},
  store::{Collector, ResultsStore, TaskRecords},
  summary::{aggregate, PerformanceSummary},
  task::{duration_ms, Language, SourceLayout, TaskSpec},
  toolchain::{deps::RuleTable, probe_all, ToolchainSpec},
};

/// Exit code for a session ended by an interrupt.
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Clone, Debug)]
pub struct SessionOptions {
  /// Concurrent (task, language) pipelines.
  pub jobs: usize,
  pub executor: ExecutorOptions,
  pub resolver: ResolverOptions,
  pub weights: ScoreWeights,
  /// Persistent artifact cache. A temporary one is used when unset.
  pub cache_dir: Option<PathBuf>,
}

impl Default for SessionOptions {
  fn default() -> Self {
    Self {
      jobs: 1,
      executor: ExecutorOptions::default(),
      resolver: ResolverOptions::default(),
      weights: ScoreWeights::default(),
      cache_dir: None,
    }
  }
}

impl SessionOptions {
  pub fn from_config(config: &Config) -> anyhow::Result<Self> {
    Ok(Self {
      jobs: config.runner.jobs.max(1),
      executor: ExecutorOptions {
        grace: config.grace()?,
        sample_interval: config.sample_interval()?,
      },
      resolver: ResolverOptions {
        build_timeout: config.build_timeout()?,
        grace: config.grace()?,
      },
      weights: config.scoring.clone(),
      cache_dir: config.system.cache_dir.clone(),
    })
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
  /// Every requested (task, language) pair has a performance.
  Complete,
  /// Finished, but some pairs are absent. See `PerformanceSummary::absences`.
  Degraded,
  /// Interrupted. Whatever was collected was still analyzed.
  Cancelled,
}

#[derive(Debug, Serialize)]
pub struct SessionReport {
  pub id: String,
  pub started_at: DateTime<Utc>,
  #[serde(rename = "elapsed_ms", with = "duration_ms")]
  pub elapsed: Duration,
  /// Detected version of each available toolchain.
  pub language_versions: BTreeMap<Language, Option<String>>,
  pub artifacts: Vec<BuildArtifact>,
  pub records: Vec<ExecutionRecord>,
  pub summary: PerformanceSummary,
  pub status: SessionStatus,
}

impl SessionReport {
  pub fn exit_code(&self) -> i32 {
    match self.status {
      SessionStatus::Complete | SessionStatus::Degraded => 0,
      SessionStatus::Cancelled => EXIT_CANCELLED,
    }
  }
}

pub struct Session {
  id: String,
  tasks: Vec<TaskSpec>,
  layout: SourceLayout,
  specs: BTreeMap<Language, ToolchainSpec>,
  rules: RuleTable,
  options: SessionOptions,
  cancel: CancellationToken,
  builders: Vec<(Language, Arc<dyn Builder>)>,
}

impl Session {
  pub fn new(
    tasks: Vec<TaskSpec>,
    layout: SourceLayout,
    specs: BTreeMap<Language, ToolchainSpec>,
    rules: RuleTable,
    options: SessionOptions,
  ) -> Self {
    Self {
      id: format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"), std::process::id()),
      tasks,
      layout,
      specs,
      rules,
      options,
      cancel: CancellationToken::new(),
      builders: Vec::new(),
    }
  }

  pub fn from_config(config: &Config, tasks: Vec<TaskSpec>) -> anyhow::Result<Self> {
    Ok(Self::new(
      tasks,
      SourceLayout::new(&config.system.tasks_dir),
      config.toolchain_specs(),
      config.rule_table(),
      SessionOptions::from_config(config)?,
    ))
  }

  pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
    self.cancel = cancel;
    self
  }

  /// Overrides the builder for one language.
  pub fn with_builder(mut self, language: impl Into<Language>, builder: Arc<dyn Builder>) -> Self {
    self.builders.push((language.into(), builder));
    self
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn run(self) -> Result<SessionReport, EngineError> {
    let started_at = Utc::now();
    let start = Instant::now();

    if self.tasks.is_empty() {
      return Err(EngineError::NoTasks);
    }
    let mut names = BTreeSet::new();
    for task in &self.tasks {
      if !names.insert(task.name.as_str()) {
        return Err(EngineError::Config(format!("duplicate task name {:?}", task.name)));
      }
    }

    let languages: BTreeSet<&Language> = self.tasks.iter().flat_map(|task| &task.languages).collect();
    let toolchains = probe_all(&self.specs, languages.iter().copied());

    let mut missing = Vec::new();
    for (language, toolchain) in &toolchains {
      if let Err(err) = toolchain {
        warn!(%language, %err, "toolchain unavailable");
        missing.push(format!("{language}: {err}"));
      }
    }
    if toolchains.values().all(Result::is_err) {
      return Err(EngineError::NoToolchains(missing.join("; ")));
    }

    let language_versions: BTreeMap<_, _> = toolchains
      .iter()
      .filter_map(|(language, toolchain)| Some((language.clone(), toolchain.as_ref().ok()?.version())))
      .collect();
    for (language, version) in &language_versions {
      info!(%language, version = version.as_deref().unwrap_or("unknown"), "toolchain");
    }

    let cache = match &self.options.cache_dir {
      Some(dir) => ArtifactCache::persistent(dir),
      None => ArtifactCache::temporary(),
    }
    .map_err(|err| EngineError::resource("artifact cache", err))?;

    let mut resolver = Resolver::new(
      self.layout.clone(),
      cache,
      toolchains,
      &self.rules,
      self.options.resolver.clone(),
    )
    .map_err(|err| EngineError::Config(format!("{err:#}")))?
    .with_cancellation(self.cancel.clone());
    for (language, builder) in &self.builders {
      resolver = resolver.with_builder(language.clone(), builder.clone());
    }

    let executor = Executor::new(self.options.executor.clone(), self.cancel.clone());
    let store = Arc::new(ResultsStore::new());
    let collector = Collector::spawn(store.clone());

    let pairs: Vec<(&TaskSpec, &Language)> = self
      .tasks
      .iter()
      .flat_map(|task| task.languages.iter().map(move |language| (task, language)))
      .collect();

    let pool = ThreadPoolBuilder::new()
      .num_threads(self.options.jobs.clamp(1, pairs.len().max(1)))
      .build()
      .map_err(|err| EngineError::WorkerPool(err.to_string()))?;

    info!(
      session = %self.id,
      tasks = self.tasks.len(),
      pipelines = pairs.len(),
      jobs = pool.current_num_threads(),
      "starting session"
    );

    let outcomes: Vec<Result<BuildArtifact, EngineError>> = pool.install(|| {
      let sender = collector.sender();
      pairs
        .par_iter()
        .map(|(task, language)| self.pipeline(&resolver, &executor, &sender, task, language))
        .collect()
    });

    // Join barrier: every record sent above is in the store after this.
    let collected = collector.finish();
    debug!(collected, "collector drained");

    let mut artifacts = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
      artifacts.push(outcome?);
    }

    let mut unavailable: BTreeMap<&str, BTreeMap<Language, String>> = BTreeMap::new();
    for artifact in &artifacts {
      let Some(reason) = artifact.failure_reason() else { continue };
      unavailable
        .entry(artifact.task.as_str())
        .or_default()
        .insert(artifact.language.clone(), reason);
    }

    let snapshot = store.snapshot();
    let empty_records = TaskRecords::new();
    let empty_unavailable = BTreeMap::new();
    let summary = aggregate(self.tasks.iter().map(|task| {
      analyze(
        task,
        snapshot.get(&task.name).unwrap_or(&empty_records),
        unavailable.get(task.name.as_str()).unwrap_or(&empty_unavailable),
        &self.options.weights,
      )
    }));

    let records = snapshot
      .into_values()
      .flat_map(BTreeMap::into_values)
      .flatten()
      .collect();

    let status = if self.cancel.is_cancelled() {
      SessionStatus::Cancelled
    } else if summary.absences.is_empty() {
      SessionStatus::Complete
    } else {
      SessionStatus::Degraded
    };

    let elapsed = start.elapsed();
    info!(session = %self.id, ?status, elapsed = ?elapsed, "session finished");

    Ok(SessionReport {
      id: self.id,
      started_at,
      elapsed,
      language_versions,
      artifacts,
      records,
      summary,
      status,
    })
  }

  /// Resolves and samples one (task, language) pair. Errors are fatal to the
  /// whole session and cancel the other pipelines.
  fn pipeline(
    &self,
    resolver: &Resolver,
    executor: &Executor,
    sender: &Sender<ExecutionRecord>,
    task: &TaskSpec,
    language: &Language,
  ) -> Result<BuildArtifact, EngineError> {
    if self.cancel.is_cancelled() {
      return Ok(BuildArtifact::pending(task, language));
    }

    let artifact = resolver.resolve(task, language).inspect_err(|err| {
      error!(task = %task.name, %language, %err, "resolver failed");
      self.cancel.cancel();
    })?;

    if !artifact.is_ready() {
      info!(
        task = %task.name,
        %language,
        reason = artifact.failure_reason().as_deref().unwrap_or("not built"),
        "skipping"
      );
      return Ok(artifact);
    }

    let mut args: Vec<OsString> = task.args.iter().map(OsString::from).collect();
    if let Some(input) = self.layout.input(task) {
      args.push(fs::canonicalize(&input).unwrap_or(input).into_os_string());
    }

    info!(task = %task.name, %language, iterations = task.iterations, cached = artifact.cached, "sampling");
    for record in sample(executor, task, &artifact, args) {
      if sender.send(record).is_err() {
        break;
      }
    }

    Ok(artifact)
  }
}
