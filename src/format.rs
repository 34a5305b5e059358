use std::fmt::Write;

use anyhow::Result;

use crate::{
  session::SessionReport,
  stats::TaskAnalysis,
  summary::{GlobalRank, PerformanceSummary},
};

const COLUMN_WIDTH: usize = 14;
const COLUMN_PADDING: &str = "  ";

fn format_header<'a, I: IntoIterator<Item = &'a str>>(columns: I) -> String {
  let header = columns
    .into_iter()
    .map(|col| format!("{col:<COLUMN_WIDTH$}"))
    .collect::<Vec<_>>()
    .join(COLUMN_PADDING);

  format!("{header}\n{}", "=".repeat(header.len()))
}

/// Writes one row: the first column left-aligned, the rest right-aligned.
macro_rules! writeln_row {
  ($rows:ident, $($col:expr),+ $(,)?) => {{
    let row = [$($col),+]
      .iter()
      .enumerate()
      .map(|(i, col)| {
        if i == 0 {
          format!("{col:<COLUMN_WIDTH$}")
        } else {
          format!("{col:>COLUMN_WIDTH$}")
        }
      })
      .collect::<Vec<_>>()
      .join(COLUMN_PADDING);

    writeln!($rows, "{}", row.trim_end())?;

    row
  }};
}

fn number(value: Option<f64>, precision: usize) -> String {
  match value {
    Some(value) => format!("{value:.precision$}"),
    None => "-".to_string(),
  }
}

fn format_task(analysis: &TaskAnalysis) -> Result<String> {
  let mut rows = String::new();

  writeln!(rows, "{} ({})", analysis.task, analysis.category)?;
  writeln!(
    rows,
    "{}",
    format_header(["language", "mean ms", "std ms", "memory mb", "success", "score"])
  )?;

  for ranked in &analysis.ranking {
    let Some(performance) = analysis.performances.get(&ranked.language) else {
      continue;
    };
    let duration = performance.duration.as_ref();

    writeln_row!(
      rows,
      performance.language.to_string(),
      number(duration.map(|d| d.mean), 2),
      number(duration.map(|d| d.std_dev), 2),
      number(performance.mean_memory_mb(), 1),
      format!("{}/{}", performance.successes, performance.attempts),
      number(performance.score, 1),
    );
  }

  for performance in analysis.performances.values().filter(|p| !p.has_success()) {
    writeln_row!(
      rows,
      performance.language.to_string(),
      "error".to_string(),
      "-".to_string(),
      "-".to_string(),
      format!("0/{}", performance.attempts),
      "-".to_string(),
    );
  }

  for language in analysis.unavailable.keys() {
    writeln_row!(
      rows,
      language.to_string(),
      "unavailable".to_string(),
      "-".to_string(),
      "-".to_string(),
      "-".to_string(),
      "-".to_string(),
    );
  }

  let winners = [
    ("fastest", &analysis.fastest),
    ("leanest", &analysis.most_memory_efficient),
    ("most reliable", &analysis.most_reliable),
  ];
  let winners: Vec<_> = winners
    .iter()
    .filter_map(|&(label, language)| Some(format!("{label}: {}", language.as_ref()?)))
    .collect();
  if !winners.is_empty() {
    writeln!(rows, "{}", winners.join(", "))?;
  }
  if let Some(winner) = analysis.winner() {
    writeln!(rows, "winner: {} ({:.1})", winner.language, winner.score)?;
  }

  for comparison in analysis.significance.iter().filter(|c| c.significant) {
    writeln!(
      rows,
      "{} vs {}: {:+.2} ms (p = {:.4}, {} effect)",
      comparison.a,
      comparison.b,
      comparison.mean_difference_ms,
      comparison.test.p_value,
      comparison
        .effect
        .map(|effect| effect.to_string())
        .unwrap_or_else(|| "undefined".to_string()),
    )?;
  }

  Ok(rows)
}

fn score_of(ranking: &[GlobalRank], rank: &GlobalRank) -> String {
  ranking
    .iter()
    .find(|r| r.language == rank.language)
    .map(|r| format!("{:.1}", r.score))
    .unwrap_or_else(|| "-".to_string())
}

fn format_rankings(summary: &PerformanceSummary) -> Result<String> {
  let mut rows = String::new();

  writeln!(
    rows,
    "{}",
    format_header(["language", "composite", "speed", "memory", "reliability", "tasks"])
  )?;

  for rank in &summary.by_composite {
    writeln_row!(
      rows,
      rank.language.to_string(),
      format!("{:.1}", rank.score),
      score_of(&summary.by_speed, rank),
      score_of(&summary.by_memory, rank),
      score_of(&summary.by_reliability, rank),
      rank.tasks.to_string(),
    );
  }

  Ok(rows)
}

pub fn format(report: &SessionReport) -> Result<String> {
  let summary = &report.summary;
  let mut table = String::new();

  writeln!(table, "tasks")?;
  writeln!(table, "=====")?;
  writeln!(table)?;

  for analysis in summary.tasks.values() {
    writeln!(table, "{}", format_task(analysis)?)?;
  }

  writeln!(table, "overall")?;
  writeln!(table, "=======")?;
  writeln!(table)?;

  writeln!(table, "{}", format_rankings(summary)?)?;

  for (category, language) in &summary.category_winners {
    writeln!(table, "{category}: {language}")?;
  }
  if let Some(winner) = summary.overall_winner() {
    writeln!(table, "overall winner: {winner}")?;
  }

  let totals = &summary.totals;
  writeln!(
    table,
    "{} executions, {} successful, {} failed, {} cancelled",
    totals.executions, totals.successful, totals.failed, totals.cancelled
  )?;

  if !summary.absences.is_empty() {
    writeln!(table)?;
    writeln!(table, "absent")?;
    writeln!(table, "======")?;
    writeln!(table)?;
    for absence in &summary.absences {
      writeln!(table, "{} / {}: {}", absence.task, absence.language, absence.reason)?;
    }
  }

  Ok(table)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_header_is_underlined() {
    let header = format_header(["language", "score"]);
    let mut lines = header.lines();
    let first = lines.next().unwrap();
    assert!(first.starts_with("language"));
    assert_eq!(lines.next().unwrap(), "=".repeat(first.len()));
  }

  #[test]
  fn test_row_alignment() -> Result<()> {
    let mut rows = String::new();
    let row = writeln_row!(rows, "rust".to_string(), "1.50".to_string());

    assert_eq!(row, format!("{:<14}  {:>14}", "rust", "1.50"));
    assert_eq!(rows, format!("{row}\n"));
    Ok(())
  }

  #[test]
  fn test_missing_numbers() {
    assert_eq!(number(None, 2), "-");
    assert_eq!(number(Some(1.234), 1), "1.2");
  }
}
