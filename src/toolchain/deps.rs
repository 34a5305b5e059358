//! Declarative dependency detection.
//!
//! The rule table is data (`rules.toml`, embedded at build time) rather than
//! code, so it can be versioned, extended from `bench.toml`, and tested on its
//! own. Detection fails closed: any import that no rule accounts for is an
//! error, never a silently missing declaration.

use std::{collections::BTreeMap, sync::OnceLock};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{error::BuildError, task::Language};

const BUILTIN_RULES: &str = include_str!("rules.toml");

/// Supported rule table format.
pub const RULES_VERSION: u32 = 1;

#[derive(Clone, Debug, Deserialize)]
pub struct RuleTable {
  pub version: u32,
  #[serde(default)]
  pub languages: BTreeMap<Language, LanguageRules>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LanguageRules {
  /// Regexes whose first capture group names an imported module.
  #[serde(default)]
  pub imports: Vec<String>,
  /// Regexes whose first capture group names a module defined by the source
  /// itself.
  #[serde(default)]
  pub locals: Vec<String>,
  /// The import captures contain one or more double-quoted paths.
  #[serde(default)]
  pub quoted: bool,
  /// Imports whose first path element has no dot belong to the standard
  /// library.
  #[serde(default)]
  pub stdlib_without_dot: bool,
  #[serde(default)]
  pub builtin: Vec<String>,
  #[serde(default)]
  pub builtin_prefixes: Vec<String>,
  #[serde(default, rename = "rule")]
  pub rules: Vec<DependencyRule>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DependencyRule {
  pub id: String,
  /// Matched against the whole source text.
  pub pattern: String,
  /// Module roots this dependency satisfies; defaults to `[id]`.
  #[serde(default)]
  pub provides: Vec<String>,
  /// Line emitted into the generated build manifest.
  pub declaration: String,
}

/// A detected external dependency.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Dependency {
  pub id: String,
  pub declaration: String,
}

impl RuleTable {
  pub fn parse(text: &str) -> Result<Self> {
    let table: Self = toml::from_str(text).context("parse rule table")?;
    if table.version != RULES_VERSION {
      anyhow::bail!(
        "unsupported rule table version {} (expected {RULES_VERSION})",
        table.version
      );
    }

    Ok(table)
  }

  /// The table compiled into the binary.
  pub fn builtin() -> &'static RuleTable {
    static TABLE: OnceLock<RuleTable> = OnceLock::new();
    TABLE.get_or_init(|| RuleTable::parse(BUILTIN_RULES).expect("embedded rule table is valid"))
  }

  /// Merges `extra` over this table: patterns, builtins and rules are
  /// appended, flags are or-ed.
  pub fn merged(&self, extra: &BTreeMap<Language, LanguageRules>) -> RuleTable {
    let mut merged = self.clone();
    for (language, rules) in extra {
      let entry = merged.languages.entry(language.clone()).or_default();
      entry.imports.extend(rules.imports.iter().cloned());
      entry.locals.extend(rules.locals.iter().cloned());
      entry.quoted |= rules.quoted;
      entry.stdlib_without_dot |= rules.stdlib_without_dot;
      entry.builtin.extend(rules.builtin.iter().cloned());
      entry.builtin_prefixes.extend(rules.builtin_prefixes.iter().cloned());
      entry.rules.extend(rules.rules.iter().cloned());
    }

    merged
  }

  pub fn compile(&self, language: &Language) -> Result<Detector> {
    match self.languages.get(language) {
      Some(rules) => Detector::compile(rules).with_context(|| format!("rules for {language}")),
      None => Ok(Detector::default()),
    }
  }
}

struct CompiledRule {
  id: String,
  pattern: Regex,
  provides: Vec<String>,
  declaration: String,
}

/// Rules for one language, compiled and ready to scan sources.
#[derive(Default)]
pub struct Detector {
  imports: Vec<Regex>,
  locals: Vec<Regex>,
  quoted: bool,
  stdlib_without_dot: bool,
  builtin: Vec<String>,
  builtin_prefixes: Vec<String>,
  rules: Vec<CompiledRule>,
}

impl Detector {
  fn compile(rules: &LanguageRules) -> Result<Self> {
    let compile_all = |patterns: &[String]| -> Result<Vec<Regex>> {
      patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("pattern {p:?}")))
        .collect()
    };

    Ok(Self {
      imports: compile_all(&rules.imports)?,
      locals: compile_all(&rules.locals)?,
      quoted: rules.quoted,
      stdlib_without_dot: rules.stdlib_without_dot,
      builtin: rules.builtin.clone(),
      builtin_prefixes: rules.builtin_prefixes.clone(),
      rules: rules
        .rules
        .iter()
        .map(|rule| {
          Ok(CompiledRule {
            id: rule.id.clone(),
            pattern: Regex::new(&rule.pattern).with_context(|| format!("rule {:?}", rule.id))?,
            provides: if rule.provides.is_empty() {
              vec![rule.id.clone()]
            } else {
              rule.provides.clone()
            },
            declaration: rule.declaration.clone(),
          })
        })
        .collect::<Result<_>>()?,
    })
  }

  /// Every module the source imports, in order of first appearance.
  pub fn imports(&self, source: &str) -> Vec<String> {
    let mut imports: Vec<String> = Vec::new();
    let quoted = quoted_pattern();

    for re in &self.imports {
      for captures in re.captures_iter(source) {
        let Some(capture) = captures.get(1) else { continue };
        let found: Vec<String> = if self.quoted {
          quoted
            .captures_iter(capture.as_str())
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect()
        } else {
          vec![capture.as_str().to_string()]
        };

        for import in found {
          if !imports.contains(&import) {
            imports.push(import);
          }
        }
      }
    }

    imports
  }

  /// Returns the dependencies the source needs, sorted by id, or
  /// `DependencyUnresolved` naming every import nothing accounts for.
  pub fn detect(&self, source: &str) -> Result<Vec<Dependency>, BuildError> {
    let matched: Vec<&CompiledRule> = self.rules.iter().filter(|rule| rule.pattern.is_match(source)).collect();

    let locals: Vec<&str> = self
      .locals
      .iter()
      .flat_map(|re| re.captures_iter(source))
      .filter_map(|c| c.get(1).map(|m| m.as_str()))
      .collect();

    let unresolved: Vec<String> = self
      .imports(source)
      .into_iter()
      .filter(|import| !self.is_builtin(import) && !locals.contains(&import.as_str()))
      .filter(|import| {
        !matched
          .iter()
          .any(|rule| rule.provides.iter().any(|root| covers(root, import)))
      })
      .collect();

    if !unresolved.is_empty() {
      return Err(BuildError::DependencyUnresolved(format!(
        "no dependency rule for {}",
        unresolved.join(", ")
      )));
    }

    let mut dependencies: Vec<Dependency> = matched
      .into_iter()
      .map(|rule| Dependency {
        id: rule.id.clone(),
        declaration: rule.declaration.clone(),
      })
      .collect();
    dependencies.sort();
    dependencies.dedup();

    Ok(dependencies)
  }

  fn is_builtin(&self, import: &str) -> bool {
    if self.stdlib_without_dot {
      let first = import.split('/').next().unwrap_or(import);
      if !first.contains('.') {
        return true;
      }
    }

    self.builtin.iter().any(|root| covers(root, import))
      || self.builtin_prefixes.iter().any(|prefix| import.starts_with(prefix.as_str()))
  }
}

/// Whether module root `root` accounts for `import` (equal, or a path below
/// it).
fn covers(root: &str, import: &str) -> bool {
  import == root
    || import
      .strip_prefix(root)
      .is_some_and(|rest| rest.starts_with('/') || rest.starts_with("::"))
}

fn quoted_pattern() -> &'static Regex {
  static QUOTED: OnceLock<Regex> = OnceLock::new();
  QUOTED.get_or_init(|| Regex::new(r#""([^"]+)""#).expect("valid regex"))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn detector(language: &str) -> Detector {
    RuleTable::builtin().compile(&Language::from(language)).unwrap()
  }

  #[test]
  fn test_builtin_table_parses() {
    let table = RuleTable::builtin();
    assert_eq!(table.version, RULES_VERSION);
    assert!(table.languages.contains_key(&Language::from("rust")));
    assert!(table.languages.contains_key(&Language::from("go")));
  }

  #[test]
  fn test_rejects_other_versions() {
    assert!(RuleTable::parse("version = 2").is_err());
  }

  #[test]
  fn test_rust_std_only() {
    let source = "use std::time::Instant;\nuse std::{env, fs};\nfn main() {}\n";
    assert_eq!(detector("rust").detect(source).unwrap(), Vec::new());
  }

  #[test]
  fn test_rust_known_dependencies() {
    let source = r#"
      use rand::Rng;
      use serde::{Deserialize, Serialize};
      use std::collections::HashMap;

      fn main() {
        let v: serde_json::Value = serde_json::json!({});
        let _ = rand::thread_rng().gen::<u8>();
      }
    "#;

    let ids: Vec<String> = detector("rust")
      .detect(source)
      .unwrap()
      .into_iter()
      .map(|d| d.id)
      .collect();
    assert_eq!(ids, ["rand", "serde", "serde_json"]);
  }

  #[test]
  fn test_rust_unknown_crate_fails_closed() {
    let source = "use rand::Rng;\nuse ndarray::Array2;\nfn main() {}\n";
    match detector("rust").detect(source) {
      Err(BuildError::DependencyUnresolved(reason)) => {
        assert!(reason.contains("ndarray"));
        assert!(!reason.contains("rand"));
      }
      other => panic!("expected DependencyUnresolved, got {other:?}"),
    }
  }

  #[test]
  fn test_rust_local_modules_are_not_dependencies() {
    let source = "mod helpers;\nuse helpers::fib;\nfn main() {}\n";
    assert!(detector("rust").detect(source).unwrap().is_empty());
  }

  #[test]
  fn test_go_import_block() {
    let source = r#"
package main

import (
	"encoding/json"
	"fmt"
	"github.com/google/uuid"
)

func main() {}
"#;

    let detector = detector("go");
    assert_eq!(detector.imports(source), ["encoding/json", "fmt", "github.com/google/uuid"]);
    let deps = detector.detect(source).unwrap();
    assert_eq!(deps.len(), 1);
    assert_eq!(deps[0].declaration, "github.com/google/uuid v1.6.0");
  }

  #[test]
  fn test_go_unknown_module_fails_closed() {
    let source = "package main\n\nimport \"golang.org/x/sync/errgroup\"\n\nfunc main() {}\n";
    assert!(matches!(
      detector("go").detect(source),
      Err(BuildError::DependencyUnresolved(_))
    ));
  }

  #[test]
  fn test_typescript_builtins() {
    let source = "import * as fs from 'fs';\nimport { gzipSync } from \"zlib\";\nconst os = require('node:os');\n";
    assert!(detector("typescript").detect(source).unwrap().is_empty());

    let source = "import axios from 'axios';\n";
    assert!(detector("typescript").detect(source).is_err());
  }

  #[test]
  fn test_merge_adds_rules() {
    let extra: RuleTable = toml::from_str(
      r#"
        version = 1
        [[languages.rust.rule]]
        id = "ndarray"
        pattern = '\bndarray::'
        declaration = 'ndarray = "0.15"'
      "#,
    )
    .unwrap();

    let merged = RuleTable::builtin().merged(&extra.languages);
    let detector = merged.compile(&Language::from("rust")).unwrap();
    let deps = detector.detect("use ndarray::Array2;\nfn main() {}\n").unwrap();
    assert_eq!(deps[0].id, "ndarray");
  }

  #[test]
  fn test_unknown_language_has_no_rules() {
    let detector = RuleTable::builtin().compile(&Language::from("zig")).unwrap();
    assert!(detector.detect("const std = @import(\"std\");").unwrap().is_empty());
  }
}
