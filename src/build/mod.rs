//! Build Unit Resolver.
//!
//! Turns a (task, language) pair into a runnable [`BuildArtifact`]. Sources
//! that need compiling are built once in a throwaway project directory and
//! the result is installed under a content-addressed path, so resolving the
//! same unchanged source again reuses it without touching the toolchain.

mod cache;
mod cargo;
mod command;
mod go;
mod tsc;

use std::{
  collections::{BTreeMap, HashMap},
  fs,
  path::{Path, PathBuf},
  process::Command,
  sync::Arc,
  time::{Duration, SystemTime},
};

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

pub use self::{
  cache::ArtifactCache,
  cargo::CargoBuilder,
  command::CommandBuilder,
  go::GoBuilder,
  tsc::TscBuilder,
};
use crate::{
  cancel::CancellationToken,
  error::{BuildError, EngineError},
  ext::CommandExt,
  task::{Language, SourceLayout, TaskSpec},
  toolchain::{
    deps::{Dependency, Detector, RuleTable},
    is_executable, BuildKind, Toolchain,
  },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
  Pending,
  Ready,
  Failed,
}

/// A runnable unit for one (task, language) pair.
#[derive(Clone, Debug, Serialize)]
pub struct BuildArtifact {
  pub task: String,
  pub language: Language,
  pub status: BuildStatus,
  /// Binary or script to run. Set when `status` is `Ready`.
  pub path: Option<PathBuf>,
  /// Interpreter that runs `path`, if it is not itself executable.
  pub launcher: Option<PathBuf>,
  pub runtime_args: Vec<String>,
  pub failure: Option<BuildError>,
  pub dependencies: Vec<Dependency>,
  pub cache_key: Option<String>,
  /// The artifact came from the cache without invoking the toolchain.
  pub cached: bool,
}

impl BuildArtifact {
  pub fn pending(task: &TaskSpec, language: &Language) -> Self {
    Self {
      task: task.name.clone(),
      language: language.clone(),
      status: BuildStatus::Pending,
      path: None,
      launcher: None,
      runtime_args: Vec::new(),
      failure: None,
      dependencies: Vec::new(),
      cache_key: None,
      cached: false,
    }
  }

  fn ready(mut self, path: PathBuf, toolchain: &Toolchain) -> Self {
    self.status = BuildStatus::Ready;
    self.path = Some(path);
    self.launcher = toolchain.launcher.clone();
    self.runtime_args = toolchain.spec.runtime_args.clone();
    self
  }

  pub fn failed(mut self, failure: BuildError) -> Self {
    self.status = BuildStatus::Failed;
    self.path = None;
    self.failure = Some(failure);
    self
  }

  pub fn is_ready(&self) -> bool {
    self.status == BuildStatus::Ready
  }

  /// Human-readable reason this artifact cannot run, if any.
  pub fn failure_reason(&self) -> Option<String> {
    match self.status {
      BuildStatus::Ready => None,
      // Only a cancelled session leaves an artifact unresolved.
      BuildStatus::Pending => Some("cancelled before execution".to_string()),
      BuildStatus::Failed => Some(
        self
          .failure
          .as_ref()
          .map(ToString::to_string)
          .unwrap_or_else(|| "build failed".to_string()),
      ),
    }
  }

  /// Re-checks that a ready artifact can still be launched.
  pub fn validate(&self) -> Result<(), BuildError> {
    if let Some(reason) = self.failure_reason() {
      return Err(self.failure.clone().unwrap_or(BuildError::ArtifactMissing(reason)));
    }

    let path = self
      .path
      .as_deref()
      .ok_or_else(|| BuildError::ArtifactMissing("ready artifact has no path".to_string()))?;

    let usable = match self.launcher {
      Some(_) => path.is_file(),
      None => is_executable(path),
    };
    if !usable {
      return Err(BuildError::ArtifactMissing(format!(
        "{} is missing or not executable",
        path.display()
      )));
    }

    Ok(())
  }

  /// The command that runs this artifact once, without per-iteration args.
  pub fn command(&self) -> Option<Command> {
    let path = self.path.as_ref()?;

    let command = match &self.launcher {
      Some(launcher) => {
        let mut command = Command::new(launcher);
        command.args(&self.runtime_args).arg(path);
        command
      }
      None => {
        let mut command = Command::new(path);
        command.args(&self.runtime_args);
        command
      }
    };

    Some(command)
  }
}

/// Everything a [`Builder`] needs to know about the unit it builds.
pub struct BuildUnit<'a> {
  pub task: &'a TaskSpec,
  pub toolchain: &'a Toolchain,
  pub source: &'a Path,
  pub dependencies: &'a [Dependency],
}

/// A language-specific way of turning a source file into an artifact.
pub trait Builder: Send + Sync {
  /// Writes the isolated build project into `project` and returns the single
  /// toolchain invocation that builds it.
  fn prepare(&self, unit: &BuildUnit<'_>, project: &Path) -> Result<Command>;

  /// Where the toolchain leaves the artifact after a successful build.
  fn produced(&self, unit: &BuildUnit<'_>, project: &Path) -> PathBuf;

  /// File name of the installed artifact.
  fn artifact_name(&self, unit: &BuildUnit<'_>) -> String {
    unit.task.name.clone()
  }
}

pub fn builder_for(kind: &BuildKind) -> Arc<dyn Builder> {
  match kind {
    BuildKind::Cargo => Arc::new(CargoBuilder),
    BuildKind::Go => Arc::new(GoBuilder),
    BuildKind::Tsc => Arc::new(TscBuilder),
    BuildKind::Command { argv } => Arc::new(CommandBuilder::new(argv.clone())),
  }
}

/// Tunables for [`Resolver`].
#[derive(Clone, Debug)]
pub struct ResolverOptions {
  pub build_timeout: Duration,
  pub grace: Duration,
}

impl Default for ResolverOptions {
  fn default() -> Self {
    Self {
      build_timeout: Duration::from_secs(300),
      grace: Duration::from_millis(500),
    }
  }
}

pub struct Resolver {
  layout: SourceLayout,
  cache: ArtifactCache,
  toolchains: BTreeMap<Language, Result<Toolchain, BuildError>>,
  builders: BTreeMap<Language, Arc<dyn Builder>>,
  detectors: BTreeMap<Language, Detector>,
  options: ResolverOptions,
  cancel: CancellationToken,
  /// Build failures by cache key, so a broken source is not rebuilt.
  failures: Mutex<HashMap<String, BuildError>>,
}

impl Resolver {
  pub fn new(
    layout: SourceLayout,
    cache: ArtifactCache,
    toolchains: BTreeMap<Language, Result<Toolchain, BuildError>>,
    rules: &RuleTable,
    options: ResolverOptions,
  ) -> Result<Self> {
    let mut builders = BTreeMap::new();
    let mut detectors = BTreeMap::new();

    for (language, toolchain) in &toolchains {
      let Ok(toolchain) = toolchain else { continue };
      if let Some(kind) = &toolchain.spec.build {
        builders.insert(language.clone(), builder_for(kind));
        detectors.insert(language.clone(), rules.compile(language)?);
      }
    }

    Ok(Self {
      layout,
      cache,
      toolchains,
      builders,
      detectors,
      options,
      cancel: CancellationToken::new(),
      failures: Mutex::new(HashMap::new()),
    })
  }

  /// Aborts in-flight builds when `cancel` fires.
  pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
    self.cancel = cancel;
    self
  }

  /// Replaces the builder used for `language`.
  pub fn with_builder(mut self, language: Language, builder: Arc<dyn Builder>) -> Self {
    self.builders.insert(language, builder);
    self
  }

  /// Resolves a runnable artifact. Build problems are recorded in the
  /// returned artifact; only failures of the engine's own scratch space are
  /// returned as errors.
  pub fn resolve(&self, task: &TaskSpec, language: &Language) -> Result<BuildArtifact, EngineError> {
    let artifact = BuildArtifact::pending(task, language);

    let toolchain = match self.toolchains.get(language) {
      Some(Ok(toolchain)) => toolchain,
      Some(Err(err)) => return Ok(artifact.failed(err.clone())),
      None => {
        return Ok(artifact.failed(BuildError::ToolchainMissing(format!(
          "no toolchain configured for {language}"
        ))))
      }
    };

    let source = self.layout.source(task, &toolchain.spec.extension);
    let source = match fs::canonicalize(&source) {
      Ok(source) if source.is_file() => source,
      _ => {
        return Ok(artifact.failed(BuildError::ArtifactMissing(format!(
          "source not found: {}",
          source.display()
        ))))
      }
    };

    let Some(builder) = self.builders.get(language).filter(|_| toolchain.spec.needs_build()) else {
      debug!(task = %task.name, %language, "no build step");
      return Ok(artifact.ready(source, toolchain));
    };

    let text = match fs::read(&source) {
      Ok(text) => text,
      Err(err) => {
        return Ok(artifact.failed(BuildError::ArtifactMissing(format!(
          "cannot read {}: {err}",
          source.display()
        ))))
      }
    };

    let dependencies = match self.detectors.get(language) {
      Some(detector) => match detector.detect(&String::from_utf8_lossy(&text)) {
        Ok(dependencies) => dependencies,
        Err(err) => {
          warn!(task = %task.name, %language, %err, "dependency detection failed");
          return Ok(artifact.failed(err));
        }
      },
      None => Vec::new(),
    };

    let key = content_key(&text, language, &dependencies, &toolchain.spec.build_fingerprint());
    let mut artifact = BuildArtifact {
      dependencies,
      cache_key: Some(key.clone()),
      ..artifact
    };

    let unit = BuildUnit {
      task,
      toolchain,
      source: &source,
      dependencies: &artifact.dependencies,
    };
    let installed = self.cache.entry(language, &task.name, &key, &builder.artifact_name(&unit));
    let needs_exec = toolchain.launcher.is_none();

    if ArtifactCache::is_fresh(&installed, &source, needs_exec) {
      debug!(task = %task.name, %language, path = ?installed, "using cached artifact");
      artifact.cached = true;
      return Ok(artifact.ready(installed, toolchain));
    }

    if let Some(err) = self.failures.lock().get(&key) {
      return Ok(artifact.failed(err.clone()));
    }

    if self.cancel.is_cancelled() {
      return Ok(artifact);
    }

    info!(task = %task.name, %language, "building");
    match self.build(builder.as_ref(), &unit, &installed)? {
      Ok(()) => Ok(artifact.ready(installed, toolchain)),
      Err(_) if self.cancel.is_cancelled() => {
        info!(task = %task.name, %language, "build cancelled");
        Ok(artifact)
      }
      Err(err) => {
        warn!(task = %task.name, %language, %err, "build failed");
        self.failures.lock().insert(key, err.clone());
        Ok(artifact.failed(err))
      }
    }
  }

  fn build(
    &self,
    builder: &dyn Builder,
    unit: &BuildUnit<'_>,
    installed: &Path,
  ) -> Result<Result<(), BuildError>, EngineError> {
    let project = self
      .cache
      .scratch()
      .map_err(|err| EngineError::resource("create build directory", err))?;

    let mut command = match builder.prepare(unit, project.path()) {
      Ok(command) => command,
      Err(err) => return Ok(Err(BuildError::BuildFailed(format!("{err:#}")))),
    };

    let output = match command.output_until(self.options.build_timeout, self.options.grace, &self.cancel) {
      Ok(Some(output)) => output,
      Ok(None) => {
        return Ok(Err(BuildError::BuildFailed(format!(
          "build timed out after {:?}",
          self.options.build_timeout
        ))))
      }
      Err(err) => return Ok(Err(BuildError::ToolchainMissing(format!("{err:#}")))),
    };

    if !output.status.success() {
      let mut diagnostics = String::from_utf8_lossy(&output.stderr).into_owned();
      diagnostics.push_str(&String::from_utf8_lossy(&output.stdout));
      if diagnostics.trim().is_empty() {
        diagnostics = format!("toolchain exited with {}", output.status);
      }
      return Ok(Err(BuildError::BuildFailed(diagnostics)));
    }

    let produced = builder.produced(unit, project.path());
    if !produced.is_file() {
      return Ok(Err(BuildError::BuildFailed(format!(
        "toolchain succeeded but produced no artifact at {}",
        produced.display()
      ))));
    }
    if unit.toolchain.launcher.is_none() && !is_executable(&produced) {
      return Ok(Err(BuildError::BuildFailed(format!(
        "toolchain produced {} but it is not executable",
        produced.display()
      ))));
    }

    self
      .cache
      .install(&produced, installed)
      .map_err(|err| EngineError::resource("install artifact", err))?;

    Ok(Ok(()))
  }
}

/// Content hash of everything that determines a build's output.
pub fn content_key(source: &[u8], language: &Language, dependencies: &[Dependency], fingerprint: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(language.as_str().as_bytes());
  hasher.update([0]);
  hasher.update(fingerprint.as_bytes());
  hasher.update([0]);
  for dependency in dependencies {
    hasher.update(dependency.declaration.as_bytes());
    hasher.update([0]);
  }
  hasher.update(source);

  format!("{:x}", hasher.finalize())
}

pub(crate) fn modified(path: &Path) -> Option<SystemTime> {
  path.metadata().and_then(|meta| meta.modified()).ok()
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;
  use crate::toolchain::ToolchainSpec;

  /// Copies the source into place with `cp`, counting invocations.
  struct CountingBuilder {
    invocations: AtomicUsize,
  }

  impl Builder for CountingBuilder {
    fn prepare(&self, unit: &BuildUnit<'_>, project: &Path) -> Result<Command> {
      self.invocations.fetch_add(1, Ordering::SeqCst);
      let mut command = Command::new("sh");
      command
        .arg("-c")
        .arg(r#"cp "$0" "$1" && chmod +x "$1""#)
        .arg(unit.source)
        .arg(project.join("out"));
      Ok(command)
    }

    fn produced(&self, _unit: &BuildUnit<'_>, project: &Path) -> PathBuf {
      project.join("out")
    }
  }

  struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    resolver: Resolver,
    builder: Arc<CountingBuilder>,
    task: TaskSpec,
  }

  fn fixture(script: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("tests");
    let task = TaskSpec::new("sum_n", "mathematical");
    let task_dir = root.join("mathematical/sum_n");
    fs::create_dir_all(&task_dir).unwrap();
    fs::write(task_dir.join("sum_n.sh"), script).unwrap();

    let spec = ToolchainSpec {
      build: Some(BuildKind::Command { argv: vec!["sh".to_string()] }),
      ..ToolchainSpec::interpreted("sh", "sh")
    };
    let language = Language::from("shell");
    let toolchain = Toolchain::probe(&language, &spec).unwrap();

    let builder = Arc::new(CountingBuilder {
      invocations: AtomicUsize::new(0),
    });
    let cache = ArtifactCache::persistent(dir.path().join("cache")).unwrap();
    let resolver = Resolver::new(
      SourceLayout::new(&root),
      cache,
      BTreeMap::from([(language.clone(), Ok(toolchain))]),
      RuleTable::builtin(),
      ResolverOptions::default(),
    )
    .unwrap()
    .with_builder(language, builder.clone());

    Fixture {
      _dir: dir,
      root,
      resolver,
      builder,
      task,
    }
  }

  #[test]
  fn test_resolve_twice_builds_once() {
    let f = fixture("#!/bin/sh\necho 42\n");
    let shell = Language::from("shell");

    let first = f.resolver.resolve(&f.task, &shell).unwrap();
    assert!(first.is_ready(), "{:?}", first.failure);
    assert!(!first.cached);

    let second = f.resolver.resolve(&f.task, &shell).unwrap();
    assert!(second.is_ready());
    assert!(second.cached);
    assert_eq!(first.path, second.path);
    assert_eq!(f.builder.invocations.load(Ordering::SeqCst), 1);
    assert!(second.validate().is_ok());
  }

  #[test]
  fn test_newer_source_invalidates_cache() {
    let f = fixture("#!/bin/sh\necho 1\n");
    let shell = Language::from("shell");

    let first = f.resolver.resolve(&f.task, &shell).unwrap();
    assert!(first.is_ready());

    // Same content, newer mtime.
    let source = f.root.join("mathematical/sum_n/sum_n.sh");
    let later = SystemTime::now() + Duration::from_secs(60);
    fs::File::options()
      .write(true)
      .open(&source)
      .unwrap()
      .set_modified(later)
      .unwrap();

    let second = f.resolver.resolve(&f.task, &shell).unwrap();
    assert!(second.is_ready());
    assert!(!second.cached);
    assert_eq!(first.path, second.path);
    assert_eq!(f.builder.invocations.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_changed_content_gets_new_key() {
    let f = fixture("#!/bin/sh\necho 1\n");
    let shell = Language::from("shell");

    let first = f.resolver.resolve(&f.task, &shell).unwrap();
    fs::write(f.root.join("mathematical/sum_n/sum_n.sh"), "#!/bin/sh\necho 2\n").unwrap();
    let second = f.resolver.resolve(&f.task, &shell).unwrap();

    assert_ne!(first.cache_key, second.cache_key);
    assert_ne!(first.path, second.path);
  }

  #[test]
  fn test_missing_source_is_recorded() {
    let f = fixture("#!/bin/sh\n");
    let task = TaskSpec::new("absent", "mathematical");
    let artifact = f.resolver.resolve(&task, &Language::from("shell")).unwrap();

    assert_eq!(artifact.status, BuildStatus::Failed);
    assert!(matches!(artifact.failure, Some(BuildError::ArtifactMissing(_))));
    assert!(artifact.failure_reason().unwrap().contains("source not found"));
    assert_eq!(f.builder.invocations.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_missing_toolchain_is_recorded() {
    let f = fixture("#!/bin/sh\n");
    let artifact = f.resolver.resolve(&f.task, &Language::from("cobol")).unwrap();
    assert!(matches!(artifact.failure, Some(BuildError::ToolchainMissing(_))));
  }

  #[test]
  fn test_build_failure_keeps_diagnostics() {
    struct Failing;

    impl Builder for Failing {
      fn prepare(&self, _unit: &BuildUnit<'_>, _project: &Path) -> Result<Command> {
        let mut command = Command::new("sh");
        command.args(["-c", "echo 'error[E0425]: cannot find value' >&2; exit 101"]);
        Ok(command)
      }

      fn produced(&self, _unit: &BuildUnit<'_>, project: &Path) -> PathBuf {
        project.join("never")
      }
    }

    let f = fixture("#!/bin/sh\n");
    let shell = Language::from("shell");
    let resolver = f.resolver.with_builder(shell.clone(), Arc::new(Failing));
    let artifact = resolver.resolve(&f.task, &shell).unwrap();

    match artifact.failure {
      Some(BuildError::BuildFailed(reason)) => assert!(reason.contains("error[E0425]: cannot find value")),
      other => panic!("expected BuildFailed, got {other:?}"),
    }
  }

  #[test]
  fn test_non_executable_product_fails_build() {
    struct PlainCopy;

    impl Builder for PlainCopy {
      fn prepare(&self, unit: &BuildUnit<'_>, project: &Path) -> Result<Command> {
        let mut command = Command::new("sh");
        command
          .arg("-c")
          .arg(r#"cp "$0" "$1" && chmod 644 "$1""#)
          .arg(unit.source)
          .arg(project.join("out"));
        Ok(command)
      }

      fn produced(&self, _unit: &BuildUnit<'_>, project: &Path) -> PathBuf {
        project.join("out")
      }
    }

    let f = fixture("#!/bin/sh\necho 42\n");
    let shell = Language::from("shell");
    let resolver = f.resolver.with_builder(shell.clone(), Arc::new(PlainCopy));
    let artifact = resolver.resolve(&f.task, &shell).unwrap();

    assert_eq!(artifact.status, BuildStatus::Failed);
    match artifact.failure {
      Some(BuildError::BuildFailed(reason)) => assert!(reason.contains("not executable"), "{reason}"),
      other => panic!("expected BuildFailed, got {other:?}"),
    }
  }

  #[test]
  fn test_cancelled_build_stays_pending() {
    struct Slow;

    impl Builder for Slow {
      fn prepare(&self, _unit: &BuildUnit<'_>, _project: &Path) -> Result<Command> {
        let mut command = Command::new("sleep");
        command.arg("30");
        Ok(command)
      }

      fn produced(&self, _unit: &BuildUnit<'_>, project: &Path) -> PathBuf {
        project.join("never")
      }
    }

    let f = fixture("#!/bin/sh\necho 42\n");
    let shell = Language::from("shell");
    let cancel = CancellationToken::new();
    let resolver = f
      .resolver
      .with_builder(shell.clone(), Arc::new(Slow))
      .with_cancellation(cancel.clone());

    let canceller = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(200));
      cancel.cancel();
    });
    let start = std::time::Instant::now();
    let artifact = resolver.resolve(&f.task, &shell).unwrap();
    canceller.join().unwrap();

    assert!(start.elapsed() < Duration::from_secs(5), "{:?}", start.elapsed());
    assert_eq!(artifact.status, BuildStatus::Pending);
    assert_eq!(artifact.failure_reason().as_deref(), Some("cancelled before execution"));
    assert!(resolver.failures.lock().is_empty());
  }

  #[test]
  fn test_validate_detects_deleted_artifact() {
    let f = fixture("#!/bin/sh\necho 42\n");
    let artifact = f.resolver.resolve(&f.task, &Language::from("shell")).unwrap();

    fs::remove_file(artifact.path.as_ref().unwrap()).unwrap();
    assert!(matches!(artifact.validate(), Err(BuildError::ArtifactMissing(_))));
  }

  #[test]
  fn test_content_key_depends_on_dependencies() {
    let shell = Language::from("shell");
    let dep = Dependency {
      id: "rand".to_string(),
      declaration: "rand = \"0.8\"".to_string(),
    };

    let bare = content_key(b"fn main() {}", &shell, &[], "cargo");
    let with_dep = content_key(b"fn main() {}", &shell, &[dep], "cargo");
    assert_ne!(bare, with_dep);
    assert_eq!(bare, content_key(b"fn main() {}", &shell, &[], "cargo"));
    assert_eq!(bare.len(), 64);
  }
}
