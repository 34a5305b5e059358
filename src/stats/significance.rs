//! Pairwise significance of duration differences.
//!
//! Welch's unequal-variance t-test with Welch–Satterthwaite degrees of
//! freedom. The two-tailed p-value is `I_{df/(df+t²)}(df/2, 1/2)`, the
//! regularized incomplete beta function, evaluated by continued fraction.

use std::fmt;

use serde::Serialize;

use super::describe::{mean, variance};
use crate::task::Language;

/// Magnitude of Cohen's d.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectInterpretation {
  /// |d| < 0.2
  Negligible,
  /// 0.2 <= |d| < 0.5
  Small,
  /// 0.5 <= |d| < 0.8
  Medium,
  /// |d| >= 0.8
  Large,
}

impl EffectInterpretation {
  pub fn of(d: f64) -> Self {
    match d.abs() {
      d if d < 0.2 => Self::Negligible,
      d if d < 0.5 => Self::Small,
      d if d < 0.8 => Self::Medium,
      _ => Self::Large,
    }
  }
}

impl fmt::Display for EffectInterpretation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Negligible => "negligible",
      Self::Small => "small",
      Self::Medium => "medium",
      Self::Large => "large",
    })
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct WelchTest {
  /// `None` when both samples are constant but their means differ.
  pub t_statistic: Option<f64>,
  pub degrees_of_freedom: f64,
  pub p_value: f64,
}

/// Comparison of two languages' successful durations on one task.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PairwiseComparison {
  pub a: Language,
  pub b: Language,
  /// `mean(a) - mean(b)`, in milliseconds.
  pub mean_difference_ms: f64,
  #[serde(flatten)]
  pub test: WelchTest,
  /// Cohen's d with pooled standard deviation. `None` when both samples are
  /// constant.
  pub effect_size: Option<f64>,
  pub effect: Option<EffectInterpretation>,
  /// `p_value < alpha`.
  pub significant: bool,
}

/// Welch's t-test. Needs at least two samples on each side.
pub fn welch(a: &[f64], b: &[f64]) -> Option<WelchTest> {
  if a.len() < 2 || b.len() < 2 {
    return None;
  }

  let (na, nb) = (a.len() as f64, b.len() as f64);
  let (ma, mb) = (mean(a)?, mean(b)?);
  let (va, vb) = (variance(a)? / na, variance(b)? / nb);
  let se2 = va + vb;

  if se2 == 0.0 {
    let same = ma == mb;
    return Some(WelchTest {
      t_statistic: same.then_some(0.0),
      degrees_of_freedom: na + nb - 2.0,
      p_value: if same { 1.0 } else { 0.0 },
    });
  }

  let t = (ma - mb) / se2.sqrt();
  let df = se2.powi(2) / (va.powi(2) / (na - 1.0) + vb.powi(2) / (nb - 1.0));

  Some(WelchTest {
    t_statistic: Some(t),
    degrees_of_freedom: df,
    p_value: two_tailed_p(t, df),
  })
}

/// Cohen's d using the pooled standard deviation.
pub fn cohens_d(a: &[f64], b: &[f64]) -> Option<f64> {
  if a.len() < 2 || b.len() < 2 {
    return None;
  }

  let (na, nb) = (a.len() as f64, b.len() as f64);
  let pooled = (((na - 1.0) * variance(a)? + (nb - 1.0) * variance(b)?) / (na + nb - 2.0)).sqrt();
  if pooled == 0.0 {
    return None;
  }

  Some((mean(a)? - mean(b)?) / pooled)
}

pub fn compare(a: (&Language, &[f64]), b: (&Language, &[f64]), alpha: f64) -> Option<PairwiseComparison> {
  let test = welch(a.1, b.1)?;
  let effect_size = cohens_d(a.1, b.1);

  Some(PairwiseComparison {
    a: a.0.clone(),
    b: b.0.clone(),
    mean_difference_ms: mean(a.1)? - mean(b.1)?,
    test,
    effect_size,
    effect: effect_size.map(EffectInterpretation::of),
    significant: test.p_value < alpha,
  })
}

/// Two-tailed p-value of Student's t distribution.
pub fn two_tailed_p(t: f64, df: f64) -> f64 {
  if !t.is_finite() {
    return 0.0;
  }
  if df <= 0.0 || !df.is_finite() {
    return 1.0;
  }

  regularized_beta(df / (df + t * t), df / 2.0, 0.5).clamp(0.0, 1.0)
}

/// `I_x(a, b)`.
fn regularized_beta(x: f64, a: f64, b: f64) -> f64 {
  if x <= 0.0 {
    return 0.0;
  }
  if x >= 1.0 {
    return 1.0;
  }

  let front = (ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln()).exp();

  // The continued fraction converges fastest below the mean of the
  // distribution; use the symmetry relation above it.
  if x < (a + 1.0) / (a + b + 2.0) {
    front * beta_fraction(x, a, b) / a
  } else {
    1.0 - front * beta_fraction(1.0 - x, b, a) / b
  }
}

fn beta_fraction(x: f64, a: f64, b: f64) -> f64 {
  const MAX_ITERATIONS: usize = 1000;
  const EPSILON: f64 = 3e-15;
  const TINY: f64 = 1e-300;

  let nonzero = |v: f64| if v.abs() < TINY { TINY } else { v };

  let (qab, qap, qam) = (a + b, a + 1.0, a - 1.0);
  let mut c = 1.0;
  let mut d = 1.0 / nonzero(1.0 - qab * x / qap);
  let mut h = d;

  for m in 1..=MAX_ITERATIONS {
    let m = m as f64;
    let m2 = 2.0 * m;

    let even = m * (b - m) * x / ((qam + m2) * (a + m2));
    d = 1.0 / nonzero(1.0 + even * d);
    c = nonzero(1.0 + even / c);
    h *= d * c;

    let odd = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
    d = 1.0 / nonzero(1.0 + odd * d);
    c = nonzero(1.0 + odd / c);
    let delta = d * c;
    h *= delta;

    if (delta - 1.0).abs() < EPSILON {
      break;
    }
  }

  h
}

/// Lanczos approximation (g = 7, n = 9).
fn ln_gamma(x: f64) -> f64 {
  const COEFFICIENTS: [f64; 9] = [
    0.999_999_999_999_809_9,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_6,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_572e-6,
    1.505_632_735_149_311_6e-7,
  ];

  if x < 0.5 {
    let pi = std::f64::consts::PI;
    return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
  }

  let x = x - 1.0;
  let t = x + 7.5;
  let series = COEFFICIENTS[1..]
    .iter()
    .enumerate()
    .fold(COEFFICIENTS[0], |sum, (i, c)| sum + c / (x + i as f64 + 1.0));

  0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + series.ln()
}
