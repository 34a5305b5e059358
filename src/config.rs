//! Configuration loading from `bench.toml`.
//!
//! The file is discovered by walking up from the current directory unless a
//! path is given explicitly. Every section is optional.

use std::{
  collections::BTreeMap,
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{
  stats::ScoreWeights,
  task::{Language, SourceLayout, TaskSpec},
  toolchain::{
    builtin_specs,
    deps::{LanguageRules, RuleTable},
    ToolchainSpec,
  },
};

pub const CONFIG_FILE: &str = "bench.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
  #[serde(default)]
  pub runner: RunnerConfig,
  #[serde(default)]
  pub scoring: ScoreWeights,
  #[serde(default)]
  pub output: OutputConfig,
  #[serde(default)]
  pub system: SystemConfig,
  /// Toolchain registry entries; these replace built-in entries of the same
  /// name.
  #[serde(default)]
  pub languages: BTreeMap<Language, ToolchainSpec>,
  /// Additional dependency rules, merged over the built-in table.
  #[serde(default)]
  pub rules: BTreeMap<Language, LanguageRules>,
  #[serde(default)]
  pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
  #[serde(default = "default_iterations")]
  pub iterations: usize,
  #[serde(default)]
  pub warmup: usize,
  /// Per-iteration wall-clock timeout (e.g. "60s").
  #[serde(default = "default_timeout")]
  pub timeout: String,
  /// Time between SIGTERM and SIGKILL.
  #[serde(default = "default_grace")]
  pub grace: String,
  #[serde(default = "default_sample_interval")]
  pub sample_interval: String,
  #[serde(default = "default_build_timeout")]
  pub build_timeout: String,
  /// Number of concurrent (task, language) pipelines.
  #[serde(default = "default_jobs")]
  pub jobs: usize,
}

impl Default for RunnerConfig {
  fn default() -> Self {
    Self {
      iterations: default_iterations(),
      warmup: 0,
      timeout: default_timeout(),
      grace: default_grace(),
      sample_interval: default_sample_interval(),
      build_timeout: default_build_timeout(),
      jobs: default_jobs(),
    }
  }
}

fn default_iterations() -> usize {
  10
}
fn default_timeout() -> String {
  "60s".to_string()
}
fn default_grace() -> String {
  "500ms".to_string()
}
fn default_sample_interval() -> String {
  "100ms".to_string()
}
fn default_build_timeout() -> String {
  "300s".to_string()
}
fn default_jobs() -> usize {
  1
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
  #[serde(default = "default_output_dir")]
  pub directory: PathBuf,
  /// "table" or "json"
  #[serde(default = "default_format")]
  pub format: String,
}

impl Default for OutputConfig {
  fn default() -> Self {
    Self {
      directory: default_output_dir(),
      format: default_format(),
    }
  }
}

fn default_output_dir() -> PathBuf {
  PathBuf::from("results")
}
fn default_format() -> String {
  "table".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
  /// Root of the `<category>/<task>/<task>.<ext>` source tree.
  #[serde(default = "default_tasks_dir")]
  pub tasks_dir: PathBuf,
  /// Persistent artifact cache. When unset, artifacts live in a temporary
  /// directory removed at the end of the session.
  #[serde(default)]
  pub cache_dir: Option<PathBuf>,
}

impl Default for SystemConfig {
  fn default() -> Self {
    Self {
      tasks_dir: default_tasks_dir(),
      cache_dir: None,
    }
  }
}

fn default_tasks_dir() -> PathBuf {
  PathBuf::from("tests")
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
  pub name: String,
  pub category: String,
  #[serde(default)]
  pub iterations: Option<usize>,
  #[serde(default)]
  pub warmup: Option<usize>,
  #[serde(default)]
  pub timeout: Option<String>,
  /// Defaults to every configured language.
  #[serde(default)]
  pub languages: Option<Vec<Language>>,
  #[serde(default)]
  pub args: Vec<String>,
}

impl Config {
  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;
    toml::from_str(&content).with_context(|| format!("parse {path:?}"))
  }

  /// Walks up from the current directory looking for `bench.toml`.
  pub fn discover() -> Option<PathBuf> {
    let mut dir = std::env::current_dir().ok()?;
    loop {
      let candidate = dir.join(CONFIG_FILE);
      if candidate.is_file() {
        return Some(candidate);
      }
      if !dir.pop() {
        return None;
      }
    }
  }

  pub fn timeout(&self) -> Result<Duration> {
    parse_duration(&self.runner.timeout).context("runner.timeout")
  }

  pub fn grace(&self) -> Result<Duration> {
    parse_duration(&self.runner.grace).context("runner.grace")
  }

  pub fn sample_interval(&self) -> Result<Duration> {
    parse_duration(&self.runner.sample_interval).context("runner.sample_interval")
  }

  /// Built-in toolchain entries with `[languages.*]` applied over them.
  pub fn toolchain_specs(&self) -> BTreeMap<Language, ToolchainSpec> {
    let mut specs = builtin_specs();
    specs.extend(self.languages.iter().map(|(language, spec)| (language.clone(), spec.clone())));
    specs
  }

  /// The embedded dependency rule table extended with `[rules.*]`.
  pub fn rule_table(&self) -> RuleTable {
    RuleTable::builtin().merged(&self.rules)
  }

  pub fn build_timeout(&self) -> Result<Duration> {
    parse_duration(&self.runner.build_timeout).context("runner.build_timeout")
  }

  /// Resolves `[[tasks]]` entries against runner defaults. `all_languages`
  /// is used for tasks that do not name their languages. Without any
  /// `[[tasks]]`, every task directory under `system.tasks_dir` is used.
  pub fn task_specs(&self, all_languages: &[Language]) -> Result<Vec<TaskSpec>> {
    let default_timeout = self.timeout()?;

    if self.tasks.is_empty() {
      let layout = SourceLayout::new(&self.system.tasks_dir);
      let found = layout
        .discover()
        .with_context(|| format!("discover tasks in {:?}", self.system.tasks_dir))?;

      return Ok(
        found
          .into_iter()
          .map(|(category, name)| TaskSpec {
            iterations: self.runner.iterations,
            warmup: self.runner.warmup,
            timeout: default_timeout,
            languages: all_languages.to_vec(),
            ..TaskSpec::new(name, category)
          })
          .collect(),
      );
    }

    self
      .tasks
      .iter()
      .map(|task| {
        let timeout = match &task.timeout {
          Some(timeout) => parse_duration(timeout).with_context(|| format!("tasks.{}.timeout", task.name))?,
          None => default_timeout,
        };

        Ok(TaskSpec {
          name: task.name.clone(),
          category: task.category.clone(),
          iterations: task.iterations.unwrap_or(self.runner.iterations),
          warmup: task.warmup.unwrap_or(self.runner.warmup),
          timeout,
          languages: task.languages.clone().unwrap_or_else(|| all_languages.to_vec()),
          args: task.args.clone(),
        })
      })
      .collect()
  }
}

/// Parses a duration string such as "3s", "500ms" or "2m".
pub fn parse_duration(s: &str) -> Result<Duration> {
  let s = s.trim();
  if s.is_empty() {
    anyhow::bail!("empty duration string");
  }

  let (number, unit) = s
    .char_indices()
    .find(|(_, c)| c.is_alphabetic() || *c == 'µ')
    .map(|(i, _)| s.split_at(i))
    .unwrap_or((s, "s"));

  let value: f64 = number
    .trim()
    .parse()
    .with_context(|| format!("invalid duration number {number:?}"))?;
  if !value.is_finite() || value < 0.0 {
    anyhow::bail!("invalid duration {s:?}");
  }

  let nanos_per_unit: f64 = match unit.to_lowercase().as_str() {
    "ns" => 1.0,
    "us" | "µs" => 1e3,
    "ms" => 1e6,
    "s" => 1e9,
    "m" | "min" => 60e9,
    _ => anyhow::bail!("unknown duration unit {unit:?}"),
  };

  Ok(Duration::from_nanos((value * nanos_per_unit) as u64))
}
