//! Descriptive statistics over duration and memory samples.

use std::cmp::Ordering;

use serde::Serialize;

/// IQR multiplier for outlier fences.
const OUTLIER_FENCE: f64 = 1.5;

/// Summary of a non-empty sample.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Summary {
  pub count: usize,
  pub mean: f64,
  pub median: f64,
  pub min: f64,
  pub max: f64,
  /// Sample standard deviation (n - 1). Zero for a single sample.
  pub std_dev: f64,
  pub p90: f64,
  pub p95: f64,
  /// `std_dev / mean`, undefined for a zero mean.
  pub cv: Option<f64>,
  /// Samples outside the 1.5 IQR fences. Reported, never removed.
  pub outliers: usize,
}

impl Summary {
  pub fn of(samples: &[f64]) -> Option<Self> {
    let mean = mean(samples)?;
    let sorted = sorted(samples);
    let std_dev = std_dev(samples)?;

    Some(Self {
      count: samples.len(),
      mean,
      median: percentile(&sorted, 50.0),
      min: sorted[0],
      max: sorted[sorted.len() - 1],
      std_dev,
      p90: percentile(&sorted, 90.0),
      p95: percentile(&sorted, 95.0),
      cv: (mean != 0.0).then(|| std_dev / mean),
      outliers: count_outliers(&sorted),
    })
  }
}

pub fn mean(samples: &[f64]) -> Option<f64> {
  if samples.is_empty() {
    return None;
  }

  Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

pub fn variance(samples: &[f64]) -> Option<f64> {
  let mean = mean(samples)?;
  if samples.len() < 2 {
    return Some(0.0);
  }

  let squares: f64 = samples.iter().map(|x| (x - mean).powi(2)).sum();
  Some(squares / (samples.len() - 1) as f64)
}

pub fn std_dev(samples: &[f64]) -> Option<f64> {
  variance(samples).map(f64::sqrt)
}

fn sorted(samples: &[f64]) -> Vec<f64> {
  let mut sorted = samples.to_vec();
  sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
  sorted
}

/// Percentile of an ascending, non-empty slice by linear interpolation
/// between closest ranks.
pub fn percentile(sorted: &[f64], percentile: f64) -> f64 {
  if sorted.len() == 1 {
    return sorted[0];
  }

  let rank = percentile / 100.0 * (sorted.len() - 1) as f64;
  let lower = rank.floor() as usize;
  let upper = (lower + 1).min(sorted.len() - 1);
  let fraction = rank - lower as f64;

  sorted[lower] + fraction * (sorted[upper] - sorted[lower])
}

fn count_outliers(sorted: &[f64]) -> usize {
  if sorted.len() < 4 {
    return 0;
  }

  let q1 = percentile(sorted, 25.0);
  let q3 = percentile(sorted, 75.0);
  let iqr = q3 - q1;
  let (low, high) = (q1 - OUTLIER_FENCE * iqr, q3 + OUTLIER_FENCE * iqr);

  sorted.iter().filter(|&&x| x < low || x > high).count()
}
