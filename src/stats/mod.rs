//! Statistics Engine.
//!
//! Everything here is a pure function of a snapshot of execution records.
//! Aggregates are recomputed from scratch on every call and only successful
//! records contribute to timing and memory figures.

pub mod describe;
pub mod significance;

use std::{cmp::Ordering, collections::BTreeMap};

use serde::{Deserialize, Serialize};

use self::{
  describe::Summary,
  significance::{compare, PairwiseComparison},
};
use crate::{
  exec::{ExecutionRecord, Outcome},
  store::TaskRecords,
  task::{Language, TaskSpec},
};

/// Smallest mean duration used in the speed term, in milliseconds.
const MIN_MEAN_MS: f64 = 1e-3;

/// Smallest mean memory used in the memory term, in megabytes.
const MIN_MEAN_MB: f64 = 1.0;

/// Weights and normalization constants of the composite score:
///
/// ```text
/// score = speed_weight * speed_scale / mean_ms
///       + memory_weight * memory_scale / max(mean_mb, 1)
///       + reliability_weight * reliability
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
  pub speed_weight: f64,
  pub memory_weight: f64,
  pub reliability_weight: f64,
  /// K: a 1 ms mean duration scores `speed_scale` before weighting.
  pub speed_scale: f64,
  /// K2: a 1 MB mean footprint scores `memory_scale` before weighting.
  pub memory_scale: f64,
  /// Alpha for the pairwise Welch tests.
  pub significance_level: f64,
}

impl Default for ScoreWeights {
  fn default() -> Self {
    Self {
      speed_weight: 0.9,
      memory_weight: 0.05,
      reliability_weight: 0.05,
      speed_scale: 10_000.0,
      memory_scale: 100.0,
      significance_level: 0.05,
    }
  }
}

impl ScoreWeights {
  /// `0.8 * success_rate + 0.2 / (1 + std_dev_ms)`.
  pub fn reliability(success_rate: f64, std_dev_ms: f64) -> f64 {
    0.8 * success_rate + 0.2 * (1.0 / (1.0 + std_dev_ms))
  }

  /// Composite score. A missing memory figure contributes nothing.
  pub fn score(&self, mean_ms: f64, mean_mb: Option<f64>, reliability: f64) -> f64 {
    let speed = self.speed_scale / mean_ms.max(MIN_MEAN_MS);
    let memory = mean_mb.map_or(0.0, |mb| self.memory_scale / mb.max(MIN_MEAN_MB));

    self.speed_weight * speed + self.memory_weight * memory + self.reliability_weight * reliability
  }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MemoryStats {
  pub mean_mb: f64,
  pub min_mb: f64,
  pub peak_mb: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CpuStats {
  pub mean_percent: f64,
  pub max_percent: f64,
}

/// Aggregate performance of one language on one task.
///
/// Timing, memory and score fields are `None` when the language has no
/// successful record. Absent is not zero.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LanguagePerformance {
  pub language: Language,
  /// Every record, cancelled ones included.
  pub count: usize,
  /// Records counted in the success rate (all but cancelled).
  pub attempts: usize,
  pub successes: usize,
  pub success_rate: f64,
  pub outcomes: BTreeMap<Outcome, usize>,
  /// Successful durations, in milliseconds.
  pub duration: Option<Summary>,
  pub memory: Option<MemoryStats>,
  pub cpu: Option<CpuStats>,
  pub reliability: Option<f64>,
  pub score: Option<f64>,
  /// First failure reason, for traceability.
  pub first_error: Option<String>,
}

impl LanguagePerformance {
  pub fn from_records(language: &Language, records: &[ExecutionRecord], weights: &ScoreWeights) -> Self {
    let mut outcomes = BTreeMap::new();
    for record in records {
      *outcomes.entry(record.outcome).or_insert(0) += 1;
    }

    let successful: Vec<_> = records.iter().filter(|r| r.outcome.is_success()).collect();
    let attempts = records.iter().filter(|r| r.outcome.is_attempt()).count();
    let success_rate = match attempts {
      0 => 0.0,
      n => successful.len() as f64 / n as f64,
    };

    let durations: Vec<_> = successful.iter().map(|r| r.duration_ms()).collect();
    let duration = Summary::of(&durations);

    let memory_mb: Vec<_> = successful.iter().filter_map(|r| r.memory_mb()).collect();
    let memory = Summary::of(&memory_mb).map(|m| MemoryStats {
      mean_mb: m.mean,
      min_mb: m.min,
      peak_mb: m.max,
    });

    let cpu_percent: Vec<_> = successful.iter().filter_map(|r| r.cpu_percent).collect();
    let cpu = Summary::of(&cpu_percent).map(|c| CpuStats {
      mean_percent: c.mean,
      max_percent: c.max,
    });

    let reliability = duration
      .as_ref()
      .map(|d| ScoreWeights::reliability(success_rate, d.std_dev));
    let score = duration
      .as_ref()
      .zip(reliability)
      .map(|(d, reliability)| weights.score(d.mean, memory.as_ref().map(|m| m.mean_mb), reliability));

    Self {
      language: language.clone(),
      count: records.len(),
      attempts,
      successes: successful.len(),
      success_rate,
      outcomes,
      duration,
      memory,
      cpu,
      reliability,
      score,
      first_error: records.iter().find_map(|r| r.error.clone()),
    }
  }

  pub fn mean_duration_ms(&self) -> Option<f64> {
    self.duration.as_ref().map(|d| d.mean)
  }

  pub fn mean_memory_mb(&self) -> Option<f64> {
    self.memory.as_ref().map(|m| m.mean_mb)
  }

  pub fn has_success(&self) -> bool {
    self.successes > 0
  }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Ranked {
  pub language: Language,
  pub score: f64,
}

/// Analysis of one task across languages.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskAnalysis {
  pub task: String,
  pub category: String,
  pub performances: BTreeMap<Language, LanguagePerformance>,
  pub fastest: Option<Language>,
  pub most_memory_efficient: Option<Language>,
  pub most_reliable: Option<Language>,
  /// Score descending, ties by language id.
  pub ranking: Vec<Ranked>,
  /// One entry per language pair with at least two successes on each side.
  pub significance: Vec<PairwiseComparison>,
  /// Languages with no performance at all, with the recorded reason.
  pub unavailable: BTreeMap<Language, String>,
}

impl TaskAnalysis {
  /// The top of the composite ranking.
  pub fn winner(&self) -> Option<&Ranked> {
    self.ranking.first()
  }
}

/// Analyzes one task. `records` must be complete for the task; languages in
/// `unavailable` never ran.
pub fn analyze(
  task: &TaskSpec,
  records: &TaskRecords,
  unavailable: &BTreeMap<Language, String>,
  weights: &ScoreWeights,
) -> TaskAnalysis {
  let performances: BTreeMap<_, _> = records
    .iter()
    .filter(|(_, records)| !records.is_empty())
    .map(|(language, records)| {
      (
        language.clone(),
        LanguagePerformance::from_records(language, records, weights),
      )
    })
    .collect();

  let mut unavailable = unavailable.clone();
  for language in &task.languages {
    if !performances.contains_key(language) {
      unavailable
        .entry(language.clone())
        .or_insert_with(|| "no executions recorded".to_string());
    }
  }

  let fastest = select(&performances, LanguagePerformance::mean_duration_ms, Ordering::Less);
  let most_memory_efficient = select(&performances, LanguagePerformance::mean_memory_mb, Ordering::Less);
  let most_reliable = select(&performances, |p| p.reliability, Ordering::Greater);

  let mut ranking: Vec<_> = performances
    .values()
    .filter_map(|p| {
      p.score.map(|score| Ranked {
        language: p.language.clone(),
        score,
      })
    })
    .collect();
  sort_ranking(&mut ranking);

  TaskAnalysis {
    task: task.name.clone(),
    category: task.category.clone(),
    significance: significance(records, weights.significance_level),
    performances,
    fastest,
    most_memory_efficient,
    most_reliable,
    ranking,
    unavailable,
  }
}

/// The language whose `key` is best in direction `better`, among languages
/// with at least one success. Ties go to the lexically first language.
fn select<F>(performances: &BTreeMap<Language, LanguagePerformance>, key: F, better: Ordering) -> Option<Language>
where
  F: Fn(&LanguagePerformance) -> Option<f64>,
{
  let mut best: Option<(&Language, f64)> = None;

  // BTreeMap iterates in lexical order, so only a strictly better value
  // replaces the current best.
  for (language, performance) in performances.iter().filter(|(_, p)| p.has_success()) {
    let Some(value) = key(performance) else { continue };
    match best {
      Some((_, current)) if value.total_cmp(&current) != better => {}
      _ => best = Some((language, value)),
    }
  }

  best.map(|(language, _)| language.clone())
}

/// Sorts by score descending, then language id ascending.
pub fn sort_ranking(ranking: &mut [Ranked]) {
  ranking.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.language.cmp(&b.language)));
}

fn significance(records: &TaskRecords, alpha: f64) -> Vec<PairwiseComparison> {
  let samples: Vec<(&Language, Vec<f64>)> = records
    .iter()
    .map(|(language, records)| {
      let durations = records
        .iter()
        .filter(|r| r.outcome.is_success())
        .map(ExecutionRecord::duration_ms)
        .collect();
      (language, durations)
    })
    .filter(|(_, durations): &(_, Vec<f64>)| durations.len() >= 2)
    .collect();

  let mut comparisons = Vec::new();
  for (i, (a, a_samples)) in samples.iter().enumerate() {
    for (b, b_samples) in &samples[i + 1..] {
      if let Some(comparison) = compare((*a, a_samples.as_slice()), (*b, b_samples.as_slice()), alpha) {
        comparisons.push(comparison);
      }
    }
  }

  comparisons
}

#[cfg(test)]
pub(crate) mod tests {
  use std::time::Duration;

  use super::*;
  use crate::build::BuildArtifact;

  pub(crate) fn record(language: &str, iteration: usize, ms: f64, outcome: Outcome) -> ExecutionRecord {
    let artifact = BuildArtifact::pending(&TaskSpec::new("sum_n", "mathematical"), &Language::from(language));
    ExecutionRecord {
      outcome,
      duration: Duration::from_secs_f64(ms / 1000.0),
      peak_memory_bytes: Some(8 * 1024 * 1024),
      cpu_percent: Some(95.0),
      error: (outcome != Outcome::Success).then(|| format!("{outcome:?}")),
      ..ExecutionRecord::skipped(&artifact, iteration, "")
    }
  }

  pub(crate) fn records(language: &str, runs: &[(f64, Outcome)]) -> Vec<ExecutionRecord> {
    runs
      .iter()
      .enumerate()
      .map(|(i, &(ms, outcome))| record(language, i, ms, outcome))
      .collect()
  }

  fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
  }

  fn sum_n() -> TaskSpec {
    TaskSpec::new("sum_n", "mathematical")
      .with_iterations(3)
      .with_languages(["a", "b"])
  }

  #[test]
  fn test_sum_n_scenario() {
    use Outcome::*;

    let mut by_language = TaskRecords::new();
    by_language.insert(
      Language::from("a"),
      records("a", &[(10.0, Success), (12.0, Success), (11.0, Success)]),
    );
    by_language.insert(
      Language::from("b"),
      records("b", &[(100.0, Success), (0.0, Timeout), (100.0, Success)]),
    );

    let analysis = analyze(&sum_n(), &by_language, &BTreeMap::new(), &ScoreWeights::default());
    let a = &analysis.performances[&Language::from("a")];
    let b = &analysis.performances[&Language::from("b")];

    assert!(close(a.success_rate, 1.0));
    assert!(close(a.mean_duration_ms().unwrap(), 11.0));
    assert!(close(b.success_rate, 2.0 / 3.0));
    assert!(close(b.mean_duration_ms().unwrap(), 100.0));
    assert_eq!(analysis.fastest, Some(Language::from("a")));
    assert_eq!(analysis.ranking[0].language, Language::from("a"));
    assert_eq!(analysis.significance.len(), 1);
    assert!(analysis.unavailable.is_empty());
  }

  #[test]
  fn test_partial_success() {
    let runs: Vec<_> = (0..10)
      .map(|i| match i {
        2 | 5 | 8 => (1.0, Outcome::NonZeroExit),
        _ => (20.0 + i as f64, Outcome::Success),
      })
      .collect();
    let performance = LanguagePerformance::from_records(&Language::from("go"), &records("go", &runs), &ScoreWeights::default());

    assert!(close(performance.success_rate, 0.7));
    let expected = [20.0, 21.0, 23.0, 24.0, 26.0, 27.0, 29.0].iter().sum::<f64>() / 7.0;
    assert!(close(performance.mean_duration_ms().unwrap(), expected));
    assert_eq!(performance.outcomes[&Outcome::NonZeroExit], 3);
    assert_eq!(performance.duration.as_ref().unwrap().count, 7);
  }

  #[test]
  fn test_no_successes_is_absent() {
    let performance = LanguagePerformance::from_records(
      &Language::from("python"),
      &records("python", &[(5.0, Outcome::Timeout), (5.0, Outcome::NonZeroExit)]),
      &ScoreWeights::default(),
    );

    assert_eq!(performance.success_rate, 0.0);
    assert!(performance.duration.is_none());
    assert!(performance.memory.is_none());
    assert!(performance.score.is_none());
    assert_eq!(performance.first_error.as_deref(), Some("Timeout"));

    let json = serde_json::to_value(&performance).unwrap();
    assert!(json["duration"].is_null());
    assert!(json["score"].is_null());
  }

  #[test]
  fn test_failed_language_never_wins() {
    let mut by_language = TaskRecords::new();
    by_language.insert(Language::from("a"), records("a", &[(50.0, Outcome::Success)]));
    // Zero-length timeouts would "win" on speed if they were counted.
    by_language.insert(Language::from("b"), records("b", &[(0.0, Outcome::Timeout)]));

    let task = sum_n();
    let analysis = analyze(&task, &by_language, &BTreeMap::new(), &ScoreWeights::default());

    assert_eq!(analysis.fastest, Some(Language::from("a")));
    assert_eq!(analysis.most_memory_efficient, Some(Language::from("a")));
    assert_eq!(analysis.most_reliable, Some(Language::from("a")));
    assert_eq!(analysis.ranking.len(), 1);
  }

  #[test]
  fn test_ties_break_lexically() {
    let mut by_language = TaskRecords::new();
    for language in ["zig", "c", "rust"] {
      by_language.insert(
        Language::from(language),
        records(language, &[(20.0, Outcome::Success), (20.0, Outcome::Success)]),
      );
    }
    let task = TaskSpec::new("sum_n", "mathematical").with_languages(["zig", "c", "rust"]);

    for _ in 0..3 {
      let analysis = analyze(&task, &by_language, &BTreeMap::new(), &ScoreWeights::default());
      assert_eq!(analysis.fastest, Some(Language::from("c")));
      assert_eq!(analysis.most_memory_efficient, Some(Language::from("c")));
      assert_eq!(analysis.most_reliable, Some(Language::from("c")));

      let order: Vec<_> = analysis.ranking.iter().map(|r| r.language.as_str()).collect();
      assert_eq!(order, ["c", "rust", "zig"]);
    }
  }

  #[test]
  fn test_sort_ranking_equal_scores() {
    let mut ranking = vec![
      Ranked { language: Language::from("b"), score: 50.0 },
      Ranked { language: Language::from("a"), score: 50.0 },
      Ranked { language: Language::from("c"), score: 60.0 },
    ];
    sort_ranking(&mut ranking);

    let order: Vec<_> = ranking.iter().map(|r| r.language.as_str()).collect();
    assert_eq!(order, ["c", "a", "b"]);
  }

  #[test]
  fn test_cancelled_records_excluded_from_rate() {
    let performance = LanguagePerformance::from_records(
      &Language::from("rust"),
      &records("rust", &[(10.0, Outcome::Success), (10.0, Outcome::Success), (3.0, Outcome::Cancelled)]),
      &ScoreWeights::default(),
    );

    assert_eq!(performance.count, 3);
    assert_eq!(performance.attempts, 2);
    assert!(close(performance.success_rate, 1.0));
  }

  #[test]
  fn test_score_formula() {
    let weights = ScoreWeights::default();
    let reliability = ScoreWeights::reliability(1.0, 0.0);
    assert!(close(reliability, 1.0));

    // 0.9 * 10000 / 100 + 0.05 * 100 / 1 + 0.05 * 1.0
    assert!(close(weights.score(100.0, Some(0.5), reliability), 90.0 + 5.0 + 0.05));
    // Durations below the floor do not blow up the speed term.
    assert!(weights.score(0.0, None, 0.0).is_finite());
  }

  #[test]
  fn test_unlisted_language_is_unavailable() {
    let mut unavailable = BTreeMap::new();
    unavailable.insert(Language::from("b"), "toolchain missing: go not found".to_string());

    let mut by_language = TaskRecords::new();
    by_language.insert(Language::from("a"), records("a", &[(10.0, Outcome::Success)]));

    let analysis = analyze(&sum_n(), &by_language, &unavailable, &ScoreWeights::default());
    assert_eq!(analysis.unavailable.len(), 1);
    assert!(analysis.unavailable[&Language::from("b")].contains("go not found"));
    assert!(analysis.significance.is_empty());
  }
}
