//! Language toolchain registry.
//!
//! A toolchain describes how a language turns a source file into something
//! runnable: which executable must be present, whether a build step exists,
//! and what launches the result.

pub mod deps;

use std::{
  collections::BTreeMap,
  env,
  path::{Path, PathBuf},
  process::Command,
  sync::OnceLock,
  time::Duration,
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{error::BuildError, ext::CommandExt, task::Language};

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// How a language's sources are built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildKind {
  Cargo,
  Go,
  Tsc,
  /// A generic compiler invocation. `argv` may reference `{source}`,
  /// `{output}` and `{project}`.
  Command { argv: Vec<String> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolchainSpec {
  /// Compiler or interpreter looked up on `PATH`.
  pub executable: String,
  #[serde(default = "default_version_arg")]
  pub version_arg: String,
  /// Source file extension, without the dot.
  pub extension: String,
  #[serde(default)]
  pub build: Option<BuildKind>,
  /// Program that launches a built artifact (e.g. `node` for emitted
  /// JavaScript). Unbuilt sources are launched with `executable`.
  #[serde(default)]
  pub runner: Option<String>,
  #[serde(default)]
  pub runtime_args: Vec<String>,
  #[serde(default)]
  pub install_hint: Option<String>,
}

fn default_version_arg() -> String {
  "--version".to_string()
}

impl ToolchainSpec {
  pub fn interpreted(executable: &str, extension: &str) -> Self {
    Self {
      executable: executable.to_string(),
      version_arg: default_version_arg(),
      extension: extension.to_string(),
      build: None,
      runner: None,
      runtime_args: Vec::new(),
      install_hint: None,
    }
  }

  pub fn needs_build(&self) -> bool {
    self.build.is_some()
  }

  /// Program that runs the artifact, or `None` when the artifact is itself
  /// executable.
  pub fn launcher(&self) -> Option<&str> {
    match (&self.build, &self.runner) {
      (_, Some(runner)) => Some(runner),
      (None, None) => Some(&self.executable),
      (Some(_), None) => None,
    }
  }

  /// A string that changes whenever the way this toolchain builds changes.
  pub fn build_fingerprint(&self) -> String {
    format!("{}|{:?}", self.executable, self.build)
  }
}

/// Built-in entries for the four languages the tool ships with.
pub fn builtin_specs() -> BTreeMap<Language, ToolchainSpec> {
  let mut specs = BTreeMap::new();

  specs.insert(
    Language::from("python"),
    ToolchainSpec {
      install_hint: Some("install Python 3 from https://python.org".to_string()),
      ..ToolchainSpec::interpreted("python3", "py")
    },
  );
  specs.insert(
    Language::from("rust"),
    ToolchainSpec {
      build: Some(BuildKind::Cargo),
      install_hint: Some("install the Rust toolchain from https://rustup.rs".to_string()),
      ..ToolchainSpec::interpreted("cargo", "rs")
    },
  );
  specs.insert(
    Language::from("go"),
    ToolchainSpec {
      version_arg: "version".to_string(),
      build: Some(BuildKind::Go),
      install_hint: Some("install Go from https://go.dev".to_string()),
      ..ToolchainSpec::interpreted("go", "go")
    },
  );
  specs.insert(
    Language::from("typescript"),
    ToolchainSpec {
      build: Some(BuildKind::Tsc),
      runner: Some("node".to_string()),
      install_hint: Some("install TypeScript with `npm install -g typescript`".to_string()),
      ..ToolchainSpec::interpreted("tsc", "ts")
    },
  );

  specs
}

/// A registry entry whose executables have been located.
#[derive(Clone, Debug)]
pub struct Toolchain {
  pub language: Language,
  pub spec: ToolchainSpec,
  pub executable: PathBuf,
  pub launcher: Option<PathBuf>,
}

impl Toolchain {
  /// Locates the toolchain's executables on `PATH`.
  pub fn probe(language: &Language, spec: &ToolchainSpec) -> Result<Self, BuildError> {
    let missing = |exe: &str| {
      let hint = spec
        .install_hint
        .as_deref()
        .map(|hint| format!("; {hint}"))
        .unwrap_or_default();
      BuildError::ToolchainMissing(format!("{exe} not found on PATH{hint}"))
    };

    let executable = find_executable(&spec.executable).ok_or_else(|| missing(&spec.executable))?;
    let launcher = match spec.launcher() {
      Some(launcher) if launcher == spec.executable => Some(executable.clone()),
      Some(launcher) => Some(find_executable(launcher).ok_or_else(|| missing(launcher))?),
      None => None,
    };

    debug!(%language, executable = ?executable, "toolchain located");

    Ok(Self {
      language: language.clone(),
      spec: spec.clone(),
      executable,
      launcher,
    })
  }

  /// Runs `<executable> <version_arg>` and extracts a version number.
  pub fn version(&self) -> Option<String> {
    let output = Command::new(&self.executable)
      .arg(&self.spec.version_arg)
      .output_timeout(VERSION_TIMEOUT, Duration::from_millis(100))
      .ok()??;

    if !output.status.success() {
      return None;
    }

    let text = format!(
      "{}{}",
      String::from_utf8_lossy(&output.stdout),
      String::from_utf8_lossy(&output.stderr)
    );
    extract_version(&text)
  }
}

/// Probes every requested language. Unavailable languages map to the reason.
pub fn probe_all<'a, I>(
  specs: &BTreeMap<Language, ToolchainSpec>,
  languages: I,
) -> BTreeMap<Language, Result<Toolchain, BuildError>>
where
  I: IntoIterator<Item = &'a Language>,
{
  languages
    .into_iter()
    .map(|language| {
      let toolchain = match specs.get(language) {
        Some(spec) => Toolchain::probe(language, spec),
        None => Err(BuildError::ToolchainMissing(format!("no toolchain configured for {language}"))),
      };
      (language.clone(), toolchain)
    })
    .collect()
}

/// Resolves `name` against `PATH`, or checks it directly if it contains a
/// path separator.
pub fn find_executable(name: &str) -> Option<PathBuf> {
  let candidate = Path::new(name);
  if candidate.components().count() > 1 {
    return is_executable(candidate).then(|| candidate.to_path_buf());
  }

  env::split_paths(&env::var_os("PATH")?)
    .map(|dir| dir.join(name))
    .find(|path| is_executable(path))
}

pub fn is_executable(path: &Path) -> bool {
  use std::os::unix::fs::PermissionsExt;

  path
    .metadata()
    .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
    .unwrap_or(false)
}

fn extract_version(text: &str) -> Option<String> {
  static VERSION: OnceLock<Regex> = OnceLock::new();
  let re = VERSION.get_or_init(|| Regex::new(r"\d+\.\d+(?:\.\d+)?").expect("valid regex"));

  re.find(text).map(|m| m.as_str().to_string())
}
