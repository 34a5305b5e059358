use std::{
  fs,
  path::{Path, PathBuf},
  process::Command,
};

use anyhow::{Context, Result};

use super::{BuildUnit, Builder};

const OUT_DIR: &str = "out";

/// Compiles a single TypeScript file to CommonJS for `node`.
pub struct TscBuilder;

impl TscBuilder {
  fn file_stem<'a>(unit: &'a BuildUnit<'_>) -> &'a str {
    &unit.task.name
  }
}

impl Builder for TscBuilder {
  fn prepare(&self, unit: &BuildUnit<'_>, project: &Path) -> Result<Command> {
    let source = project.join(format!("{}.ts", Self::file_stem(unit)));
    fs::copy(unit.source, &source).context("copy source")?;

    let mut tsc = Command::new(&unit.toolchain.executable);
    tsc
      .current_dir(project)
      .arg(&source)
      .arg("--outDir")
      .arg(project.join(OUT_DIR))
      .args([
        "--target",
        "ES2020",
        "--module",
        "commonjs",
        "--moduleResolution",
        "node",
        "--strict",
        "--esModuleInterop",
        "--skipLibCheck",
        "--noEmitOnError",
      ]);

    Ok(tsc)
  }

  fn produced(&self, unit: &BuildUnit<'_>, project: &Path) -> PathBuf {
    project.join(OUT_DIR).join(self.artifact_name(unit))
  }

  fn artifact_name(&self, unit: &BuildUnit<'_>) -> String {
    format!("{}.js", Self::file_stem(unit))
  }
}

#[cfg(test)]
mod tests {
  use std::ffi::OsStr;

  use super::*;
  use crate::{
    task::{Language, TaskSpec},
    toolchain::{Toolchain, ToolchainSpec},
  };

  #[test]
  fn test_project_layout_follows_task_name() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("anything.ts");
    fs::write(&source, "console.log(1);\n").unwrap();
    let project = dir.path().join("project");
    fs::create_dir(&project).unwrap();

    let task = TaskSpec::new("sum_n", "mathematical");
    let toolchain = Toolchain::probe(&Language::from("typescript"), &ToolchainSpec::interpreted("sh", "ts")).unwrap();
    let unit = BuildUnit {
      task: &task,
      toolchain: &toolchain,
      source: &source,
      dependencies: &[],
    };

    let command = TscBuilder.prepare(&unit, &project).unwrap();
    let copied = project.join("sum_n.ts");
    assert!(copied.is_file());
    assert_eq!(command.get_args().next(), Some(copied.as_os_str()));
    assert!(command.get_args().any(|arg| arg == OsStr::new("--strict")));

    assert_eq!(TscBuilder.artifact_name(&unit), "sum_n.js");
    assert_eq!(TscBuilder.produced(&unit, &project), project.join("out/sum_n.js"));
  }
}
