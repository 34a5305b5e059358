use serde::Serialize;
use thiserror::Error;

/// Why a (task, language) pair has no runnable artifact. Recorded inside the
/// artifact rather than propagated.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason")]
pub enum BuildError {
  #[error("toolchain missing: {0}")]
  ToolchainMissing(String),

  #[error("dependency unresolved: {0}")]
  DependencyUnresolved(String),

  #[error("build failed: {0}")]
  BuildFailed(String),

  #[error("artifact missing: {0}")]
  ArtifactMissing(String),
}

/// Errors that stop the whole session.
#[derive(Debug, Error)]
pub enum EngineError {
  #[error("no toolchain available for any requested language ({0})")]
  NoToolchains(String),

  #[error("no tasks selected")]
  NoTasks,

  #[error("invalid configuration: {0}")]
  Config(String),

  #[error("failed to build worker pool: {0}")]
  WorkerPool(String),

  #[error("{context}: {source}")]
  Resource {
    context: String,
    #[source]
    source: std::io::Error,
  },
}

impl EngineError {
  pub fn resource(context: impl Into<String>, source: std::io::Error) -> Self {
    Self::Resource {
      context: context.into(),
      source,
    }
  }
}
