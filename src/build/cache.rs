use std::{
  fs, io,
  os::unix::fs::PermissionsExt,
  path::{Path, PathBuf},
};

use tempfile::TempDir;

use super::modified;
use crate::{task::Language, toolchain::is_executable};

/// Content-addressed store of built artifacts:
/// `<root>/bin/<language>/<task>-<key>/<name>`.
///
/// A temporary cache is removed when dropped; a persistent one survives the
/// session so later runs can reuse its artifacts.
#[derive(Debug)]
pub struct ArtifactCache {
  root: PathBuf,
  _temp: Option<TempDir>,
}

const KEY_LEN: usize = 16;

impl ArtifactCache {
  pub fn temporary() -> io::Result<Self> {
    let temp = TempDir::with_prefix("langbench-")?;
    Ok(Self {
      root: temp.path().to_path_buf(),
      _temp: Some(temp),
    })
  }

  pub fn persistent(root: impl Into<PathBuf>) -> io::Result<Self> {
    let root = root.into();
    fs::create_dir_all(&root)?;
    Ok(Self { root, _temp: None })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn entry(&self, language: &Language, task: &str, key: &str, name: &str) -> PathBuf {
    let key = &key[..key.len().min(KEY_LEN)];
    self
      .root
      .join("bin")
      .join(language.as_str())
      .join(format!("{task}-{key}"))
      .join(name)
  }

  /// A fresh project directory, removed when the returned guard drops.
  pub fn scratch(&self) -> io::Result<TempDir> {
    let work = self.root.join("work");
    fs::create_dir_all(&work)?;
    tempfile::Builder::new().prefix("build-").tempdir_in(work)
  }

  /// Whether `artifact` can be reused for `source`: it exists, is launchable,
  /// and is not older than the source.
  pub fn is_fresh(artifact: &Path, source: &Path, needs_exec: bool) -> bool {
    let usable = if needs_exec {
      is_executable(artifact)
    } else {
      artifact.is_file()
    };
    if !usable {
      return false;
    }

    match (modified(artifact), modified(source)) {
      (Some(built), Some(edited)) => built >= edited,
      _ => false,
    }
  }

  /// Copies `produced` to `dest` under a temporary name and renames it into
  /// place, so readers never observe a partial file.
  pub fn install(&self, produced: &Path, dest: &Path) -> io::Result<()> {
    let dir = dest
      .parent()
      .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "artifact path has no parent"))?;
    fs::create_dir_all(dir)?;

    let staging = tempfile::Builder::new().prefix(".staging-").tempfile_in(dir)?;
    fs::copy(produced, staging.path())?;

    let mode = fs::metadata(produced)?.permissions().mode();
    fs::set_permissions(staging.path(), fs::Permissions::from_mode(mode | 0o444))?;

    staging.persist(dest).map_err(|err| err.error)?;
    Ok(())
  }
}
