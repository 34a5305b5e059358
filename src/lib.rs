//! Multi-language benchmark execution and analysis engine.
//!
//! Builds each task's per-language source once, runs it repeatedly as an
//! isolated child process with a timeout, and turns the recorded executions
//! into per-task and session-wide rankings.

pub mod build;
pub mod cancel;
pub mod config;
pub mod error;
pub mod exec;
pub mod ext;
pub mod format;
pub mod sampler;
pub mod session;
pub mod stats;
pub mod store;
pub mod summary;
pub mod task;
pub mod toolchain;

pub use self::{
  error::{BuildError, EngineError},
  session::{Session, SessionOptions, SessionReport, SessionStatus},
  summary::PerformanceSummary,
  task::{Language, SourceLayout, TaskSpec},
};
