use std::{
  fs,
  path::{Path, PathBuf},
  process::Command,
};

use anyhow::{Context, Result};

use super::{BuildUnit, Builder};

/// Runs a configured compiler command line. Each argument may contain
/// `{source}`, `{output}` and `{project}`, which are replaced with paths
/// inside the build project.
pub struct CommandBuilder {
  argv: Vec<String>,
}

impl CommandBuilder {
  pub fn new(argv: Vec<String>) -> Self {
    Self { argv }
  }

  fn expand(arg: &str, source: &Path, output: &Path, project: &Path) -> String {
    arg
      .replace("{source}", &source.to_string_lossy())
      .replace("{output}", &output.to_string_lossy())
      .replace("{project}", &project.to_string_lossy())
  }
}

impl Builder for CommandBuilder {
  fn prepare(&self, unit: &BuildUnit<'_>, project: &Path) -> Result<Command> {
    let (program, args) = self.argv.split_first().context("empty build command")?;

    let file_name = unit.source.file_name().context("source file name")?;
    let source = project.join(file_name);
    fs::copy(unit.source, &source).context("copy source")?;
    let output = self.produced(unit, project);

    let mut command = if *program == unit.toolchain.spec.executable {
      Command::new(&unit.toolchain.executable)
    } else {
      Command::new(Self::expand(program, &source, &output, project))
    };
    command
      .current_dir(project)
      .args(args.iter().map(|arg| Self::expand(arg, &source, &output, project)));

    Ok(command)
  }

  fn produced(&self, unit: &BuildUnit<'_>, project: &Path) -> PathBuf {
    project.join(&unit.task.name)
  }
}
