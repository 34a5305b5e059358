use std::{
  fmt::Write as _,
  fs,
  path::{Path, PathBuf},
  process::Command,
};

use anyhow::{Context, Result};

use super::{BuildUnit, Builder};

const MODULE: &str = "benchmark_unit";
const GO_VERSION: &str = "1.19";

/// Builds a single-file Go program in a generated module. Required modules
/// are declared in `go.mod` and fetched by the same `go build` invocation.
pub struct GoBuilder;

impl GoBuilder {
  fn go_mod(unit: &BuildUnit<'_>) -> String {
    let mut go_mod = format!("module {MODULE}\n\ngo {GO_VERSION}\n");
    if !unit.dependencies.is_empty() {
      go_mod.push_str("\nrequire (\n");
      for dependency in unit.dependencies {
        let _ = writeln!(go_mod, "\t{}", dependency.declaration);
      }
      go_mod.push_str(")\n");
    }

    go_mod
  }
}

impl Builder for GoBuilder {
  fn prepare(&self, unit: &BuildUnit<'_>, project: &Path) -> Result<Command> {
    fs::write(project.join("go.mod"), Self::go_mod(unit)).context("write go.mod")?;
    fs::copy(unit.source, project.join("main.go")).context("copy source")?;

    let mut go = Command::new(&unit.toolchain.executable);
    go.current_dir(project)
      .args(["build", "-mod=mod", "-ldflags", "-s -w", "-o"])
      .arg(self.produced(unit, project))
      .arg(".");

    Ok(go)
  }

  fn produced(&self, _unit: &BuildUnit<'_>, project: &Path) -> PathBuf {
    project.join(MODULE)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    task::{Language, TaskSpec},
    toolchain::{deps::Dependency, Toolchain, ToolchainSpec},
  };

  #[test]
  fn test_go_mod_requires() {
    let task = TaskSpec::new("uuid_gen", "system");
    let toolchain = Toolchain::probe(&Language::from("shell"), &ToolchainSpec::interpreted("sh", "go")).unwrap();
    let dependencies = vec![Dependency {
      id: "github.com/google/uuid".to_string(),
      declaration: "github.com/google/uuid v1.6.0".to_string(),
    }];
    let mut unit = BuildUnit {
      task: &task,
      toolchain: &toolchain,
      source: Path::new("uuid_gen.go"),
      dependencies: &dependencies,
    };

    let go_mod = GoBuilder::go_mod(&unit);
    assert!(go_mod.starts_with("module benchmark_unit\n"));
    assert!(go_mod.contains("require (\n\tgithub.com/google/uuid v1.6.0\n)"));

    unit.dependencies = &[];
    assert!(!GoBuilder::go_mod(&unit).contains("require"));
  }
}
