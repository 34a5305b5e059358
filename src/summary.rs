//! Summary Aggregator.
//!
//! Folds per-task analyses into session-wide rankings. A language only
//! contributes to a ranking from tasks where it had at least one success;
//! tasks where it failed or never ran are left out of its average rather
//! than counted as zero.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
  stats::{sort_ranking, LanguagePerformance, Ranked, TaskAnalysis},
  task::Language,
};

/// Per-task scores averaged into one global ranking entry.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GlobalRank {
  pub language: Language,
  /// Mean of the per-task values; higher is better.
  pub score: f64,
  /// Tasks that contributed.
  pub tasks: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Totals {
  pub tasks: usize,
  pub languages: usize,
  pub executions: usize,
  pub successful: usize,
  /// Non-cancelled executions that did not succeed.
  pub failed: usize,
  pub cancelled: usize,
  /// `successful / (successful + failed)`, or `None` with no attempts.
  pub success_rate: Option<f64>,
}

/// A (task, language) pair with no usable performance, and why.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Absence {
  pub task: String,
  pub language: Language,
  pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PerformanceSummary {
  pub generated_at: DateTime<Utc>,
  pub tasks: BTreeMap<String, TaskAnalysis>,
  /// By mean runs per second (`1000 / mean_ms`).
  pub by_speed: Vec<GlobalRank>,
  /// By `100 / max(mean_mb, 1)`.
  pub by_memory: Vec<GlobalRank>,
  /// By reliability, as a percentage.
  pub by_reliability: Vec<GlobalRank>,
  /// By composite score.
  pub by_composite: Vec<GlobalRank>,
  /// Per task category, the language with the best mean composite score.
  pub category_winners: BTreeMap<String, Language>,
  pub totals: Totals,
  pub absences: Vec<Absence>,
}

impl PerformanceSummary {
  pub fn overall_winner(&self) -> Option<&Language> {
    self.by_composite.first().map(|rank| &rank.language)
  }
}

#[derive(Default)]
struct Accumulator {
  scores: BTreeMap<Language, Vec<f64>>,
}

impl Accumulator {
  fn add(&mut self, language: &Language, value: Option<f64>) {
    if let Some(value) = value {
      self.scores.entry(language.clone()).or_default().push(value);
    }
  }

  fn ranking(&self) -> Vec<GlobalRank> {
    let mut ranked: Vec<_> = self
      .scores
      .iter()
      .filter(|(_, scores)| !scores.is_empty())
      .map(|(language, scores)| Ranked {
        language: language.clone(),
        score: scores.iter().sum::<f64>() / scores.len() as f64,
      })
      .collect();
    sort_ranking(&mut ranked);

    ranked
      .into_iter()
      .map(|Ranked { language, score }| GlobalRank {
        tasks: self.scores[&language].len(),
        language,
        score,
      })
      .collect()
  }

  fn best(&self) -> Option<Language> {
    self.ranking().into_iter().next().map(|rank| rank.language)
  }
}

fn speed_score(performance: &LanguagePerformance) -> Option<f64> {
  performance.mean_duration_ms().map(|ms| 1000.0 / ms.max(1e-3))
}

fn memory_score(performance: &LanguagePerformance) -> Option<f64> {
  performance.mean_memory_mb().map(|mb| 100.0 / mb.max(1.0))
}

/// Aggregates every task analysis of a session.
pub fn aggregate<I>(analyses: I) -> PerformanceSummary
where
  I: IntoIterator<Item = TaskAnalysis>,
{
  let tasks: BTreeMap<_, _> = analyses
    .into_iter()
    .map(|analysis| (analysis.task.clone(), analysis))
    .collect();

  let mut speed = Accumulator::default();
  let mut memory = Accumulator::default();
  let mut reliability = Accumulator::default();
  let mut composite = Accumulator::default();
  let mut categories: BTreeMap<&str, Accumulator> = BTreeMap::new();

  let mut totals = Totals {
    tasks: tasks.len(),
    ..Totals::default()
  };
  let mut languages = BTreeSet::new();
  let mut absences = Vec::new();

  for analysis in tasks.values() {
    for (language, reason) in &analysis.unavailable {
      absences.push(Absence {
        task: analysis.task.clone(),
        language: language.clone(),
        reason: reason.clone(),
      });
    }

    for (language, performance) in &analysis.performances {
      languages.insert(language);
      totals.executions += performance.count;
      totals.successful += performance.successes;
      totals.failed += performance.attempts - performance.successes;
      totals.cancelled += performance.count - performance.attempts;

      if !performance.has_success() {
        absences.push(Absence {
          task: analysis.task.clone(),
          language: language.clone(),
          reason: performance
            .first_error
            .clone()
            .unwrap_or_else(|| "no successful executions".to_string()),
        });
        continue;
      }

      speed.add(language, speed_score(performance));
      memory.add(language, memory_score(performance));
      reliability.add(language, performance.reliability.map(|r| r * 100.0));
      composite.add(language, performance.score);
      categories
        .entry(analysis.category.as_str())
        .or_default()
        .add(language, performance.score);
    }
  }

  totals.languages = languages.len();
  let attempts = totals.successful + totals.failed;
  totals.success_rate = (attempts > 0).then(|| totals.successful as f64 / attempts as f64);

  let category_winners = categories
    .iter()
    .filter_map(|(category, scores)| Some((category.to_string(), scores.best()?)))
    .collect();

  PerformanceSummary {
    generated_at: Utc::now(),
    by_speed: speed.ranking(),
    by_memory: memory.ranking(),
    by_reliability: reliability.ranking(),
    by_composite: composite.ranking(),
    category_winners,
    totals,
    absences,
    tasks,
  }
}
