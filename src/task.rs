use std::{
  fmt, fs, io,
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};

/// Identifier of a language toolchain, e.g. `rust` or `python`.
///
/// Ordering is lexical on the identifier, which is what every winner
/// tie-break in the statistics engine relies on.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Language(String);

impl Language {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Language {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(&self.0)
  }
}

impl From<&str> for Language {
  fn from(id: &str) -> Self {
    Self::new(id)
  }
}

/// One benchmark exercised across languages. Immutable once loaded.
#[derive(Clone, Debug, Serialize)]
pub struct TaskSpec {
  pub name: String,
  pub category: String,
  pub iterations: usize,
  pub warmup: usize,
  #[serde(with = "duration_ms")]
  pub timeout: Duration,
  pub languages: Vec<Language>,
  /// Extra arguments passed to every iteration, before the input file.
  pub args: Vec<String>,
}

impl TaskSpec {
  pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      category: category.into(),
      iterations: 10,
      warmup: 0,
      timeout: Duration::from_secs(60),
      languages: Vec::new(),
      args: Vec::new(),
    }
  }

  pub fn with_iterations(mut self, iterations: usize) -> Self {
    self.iterations = iterations;
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_languages<I, L>(mut self, languages: I) -> Self
  where
    I: IntoIterator<Item = L>,
    L: Into<Language>,
  {
    self.languages = languages.into_iter().map(Into::into).collect();
    self
  }
}

/// Filesystem convention for locating a task's sources:
/// `<root>/<category>/<task>/<task>.<ext>` with an optional `input.json`
/// next to it.
#[derive(Clone, Debug)]
pub struct SourceLayout {
  root: PathBuf,
}

pub const INPUT_FILE: &str = "input.json";

impl SourceLayout {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn task_dir(&self, task: &TaskSpec) -> PathBuf {
    self.root.join(&task.category).join(&task.name)
  }

  pub fn source(&self, task: &TaskSpec, extension: &str) -> PathBuf {
    let extension = extension.trim_start_matches('.');
    self.task_dir(task).join(format!("{}.{extension}", task.name))
  }

  /// Returns the task's input file, if one exists.
  pub fn input(&self, task: &TaskSpec) -> Option<PathBuf> {
    let input = self.task_dir(task).join(INPUT_FILE);
    input.is_file().then_some(input)
  }

  /// Every `(category, task)` directory pair under the root, sorted.
  pub fn discover(&self) -> io::Result<Vec<(String, String)>> {
    let mut found = Vec::new();
    for category in subdirectories(&self.root)? {
      for task in subdirectories(&self.root.join(&category))? {
        found.push((category.clone(), task));
      }
    }

    found.sort();
    Ok(found)
  }
}

fn subdirectories(dir: &Path) -> io::Result<Vec<String>> {
  let mut names = Vec::new();
  for entry in fs::read_dir(dir)? {
    let entry = entry?;
    if entry.file_type()?.is_dir() {
      if let Some(name) = entry.file_name().to_str() {
        if !name.starts_with('.') {
          names.push(name.to_string());
        }
      }
    }
  }

  Ok(names)
}

pub(crate) mod duration_ms {
  use std::time::Duration;

  use serde::Serializer;

  pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
  }
}

#[cfg(test)]
mod tests {
  use std::fs;

  use super::*;

  #[test]
  fn test_source_layout_paths() {
    let layout = SourceLayout::new("/bench/tests");
    let task = TaskSpec::new("quicksort", "algorithms");

    assert_eq!(
      layout.source(&task, ".rs"),
      PathBuf::from("/bench/tests/algorithms/quicksort/quicksort.rs")
    );
    assert_eq!(
      layout.source(&task, "py"),
      PathBuf::from("/bench/tests/algorithms/quicksort/quicksort.py")
    );
  }

  #[test]
  fn test_input_only_when_present() {
    let dir = tempfile::tempdir().unwrap();
    let layout = SourceLayout::new(dir.path());
    let task = TaskSpec::new("json_parsing", "io");

    assert!(layout.input(&task).is_none());

    fs::create_dir_all(layout.task_dir(&task)).unwrap();
    fs::write(layout.task_dir(&task).join(INPUT_FILE), "{}").unwrap();
    assert_eq!(layout.input(&task), Some(layout.task_dir(&task).join(INPUT_FILE)));
  }

  #[test]
  fn test_discover_tasks() {
    let dir = tempfile::tempdir().unwrap();
    for path in ["mathematical/sum_n", "algorithms/quicksort", "algorithms/binary_search", ".git/objects"] {
      fs::create_dir_all(dir.path().join(path)).unwrap();
    }
    fs::write(dir.path().join("README.md"), "").unwrap();

    let found = SourceLayout::new(dir.path()).discover().unwrap();
    assert_eq!(
      found,
      [
        ("algorithms".to_string(), "binary_search".to_string()),
        ("algorithms".to_string(), "quicksort".to_string()),
        ("mathematical".to_string(), "sum_n".to_string()),
      ]
    );
  }

  #[test]
  fn test_language_ordering_is_lexical() {
    let mut languages = vec![Language::from("rust"), Language::from("go"), Language::from("python")];
    languages.sort();
    let ids: Vec<_> = languages.iter().map(Language::as_str).collect();
    assert_eq!(ids, ["go", "python", "rust"]);
  }
}
