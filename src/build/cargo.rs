use std::{
  fmt::Write as _,
  fs,
  path::{Path, PathBuf},
  process::Command,
};

use anyhow::{Context, Result};

use super::{BuildUnit, Builder};

const PACKAGE: &str = "benchmark_unit";

/// Builds a single-file Rust program as a release binary in a generated
/// Cargo project.
pub struct CargoBuilder;

impl CargoBuilder {
  fn manifest(unit: &BuildUnit<'_>) -> String {
    let mut manifest = format!(
      "[package]\n\
       name = \"{PACKAGE}\"\n\
       version = \"0.1.0\"\n\
       edition = \"2021\"\n\
       \n\
       [[bin]]\n\
       name = \"{PACKAGE}\"\n\
       path = \"src/main.rs\"\n\
       \n\
       [dependencies]\n"
    );
    for dependency in unit.dependencies {
      let _ = writeln!(manifest, "{}", dependency.declaration);
    }
    manifest.push_str(
      "\n[profile.release]\n\
       opt-level = 3\n\
       lto = true\n\
       codegen-units = 1\n\
       panic = \"abort\"\n\
       debug = false\n",
    );

    manifest
  }
}

impl Builder for CargoBuilder {
  fn prepare(&self, unit: &BuildUnit<'_>, project: &Path) -> Result<Command> {
    fs::create_dir_all(project.join("src")).context("create_dir src")?;
    fs::write(project.join("Cargo.toml"), Self::manifest(unit)).context("write Cargo.toml")?;
    fs::copy(unit.source, project.join("src/main.rs")).context("copy source")?;

    let mut cargo = Command::new(&unit.toolchain.executable);
    cargo
      .current_dir(project)
      .args(["build", "--release", "--quiet"])
      .env("CARGO_TARGET_DIR", project.join("target"));

    Ok(cargo)
  }

  fn produced(&self, _unit: &BuildUnit<'_>, project: &Path) -> PathBuf {
    project.join("target/release").join(PACKAGE)
  }
}
