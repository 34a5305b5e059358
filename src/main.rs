use std::{collections::BTreeSet, fs, path::PathBuf, process};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use langbench::{
  cancel::CancellationToken,
  config::Config,
  format,
  toolchain::{probe_all, Toolchain},
  Language, Session, SessionStatus, TaskSpec,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SUMMARY_FILE: &str = "summary.json";

#[derive(Parser)]
#[command(version, about = "Build, run and compare the same tasks across languages")]
struct Args {
  /// Path to the configuration file. Defaults to the nearest bench.toml.
  #[arg(long, global = true)]
  config: Option<PathBuf>,
  /// Log at debug level.
  #[arg(short, long, global = true)]
  verbose: bool,
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Build and benchmark tasks.
  Run {
    /// Languages to run. Defaults to every configured language.
    #[arg(short, long)]
    language: Vec<Language>,
    /// Tasks to run, by name. Defaults to every task.
    #[arg(short, long)]
    task: Vec<String>,
    /// Measured iterations per task, overriding the configuration.
    #[arg(short = 'n', long)]
    iterations: Option<usize>,
    /// Concurrent (task, language) pipelines.
    #[arg(short, long)]
    jobs: Option<usize>,
    /// Print the report as JSON instead of a table.
    #[arg(long)]
    json: bool,
  },
  /// Check which toolchains are available.
  Validate {
    #[arg(short, long)]
    language: Vec<Language>,
  },
  /// List the tasks that would run.
  List,
}

fn init_tracing(verbose: bool) {
  let default = if verbose { "langbench=debug" } else { "langbench=info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .with_target(false)
    .init();
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
  match path.or_else(Config::discover) {
    Some(path) => Config::load(&path).with_context(|| format!("load {path:?}")),
    None => Ok(Config::default()),
  }
}

/// Tasks from the configuration, narrowed by the command line.
fn select_tasks(config: &Config, languages: &[Language], names: &[String]) -> Result<Vec<TaskSpec>> {
  let all_languages: Vec<Language> = if languages.is_empty() {
    config.toolchain_specs().into_keys().collect()
  } else {
    languages.to_vec()
  };

  let mut tasks = config.task_specs(&all_languages).context("task specs")?;
  if !names.is_empty() {
    tasks.retain(|task| names.contains(&task.name));
  }
  if !languages.is_empty() {
    for task in &mut tasks {
      task.languages.retain(|language| languages.contains(language));
    }
  }
  tasks.retain(|task| !task.languages.is_empty());

  Ok(tasks)
}

fn main() -> Result<()> {
  let args = Args::parse();
  init_tracing(args.verbose);

  let mut config = load_config(args.config).context("config")?;

  match args.command {
    Command::Run {
      language,
      task,
      iterations,
      jobs,
      json,
    } => {
      if let Some(jobs) = jobs {
        config.runner.jobs = jobs;
      }

      let mut tasks = select_tasks(&config, &language, &task).context("select tasks")?;
      if let Some(iterations) = iterations {
        for task in &mut tasks {
          task.iterations = iterations;
        }
      }

      let session = Session::from_config(&config, tasks)
        .context("session")?
        .with_cancellation(CancellationToken::from_signals());
      info!(session = session.id(), "session created");
      let report = session.run().context("run")?;

      fs::create_dir_all(&config.output.directory).context("create output dir")?;
      let summary_path = config.output.directory.join(SUMMARY_FILE);
      let encoded = serde_json::to_string_pretty(&report).context("encode report")?;
      fs::write(&summary_path, &encoded).with_context(|| format!("write {summary_path:?}"))?;
      info!(path = ?summary_path, "report written");

      if json || config.output.format == "json" {
        println!("{encoded}");
      } else {
        println!("{}", format::format(&report).context("format")?);
      }

      if report.status == SessionStatus::Cancelled {
        process::exit(report.exit_code());
      }
    }
    Command::Validate { language } => {
      let specs = config.toolchain_specs();
      let languages: BTreeSet<Language> = if language.is_empty() {
        specs.keys().cloned().collect()
      } else {
        language.into_iter().collect()
      };

      let mut available = 0;
      for (language, toolchain) in probe_all(&specs, &languages) {
        match toolchain {
          Ok(toolchain) => {
            available += 1;
            println!("{language:<14}  {}", describe(&toolchain));
          }
          Err(err) => println!("{language:<14}  {err}"),
        }
      }

      if available == 0 {
        anyhow::bail!("no toolchain available");
      }
    }
    Command::List => {
      let tasks = select_tasks(&config, &[], &[]).context("select tasks")?;
      for task in tasks {
        let languages: Vec<_> = task.languages.iter().map(Language::as_str).collect();
        println!("{:<14}  {:<24}  {}", task.category, task.name, languages.join(" "));
      }
    }
  }

  Ok(())
}

fn describe(toolchain: &Toolchain) -> String {
  format!(
    "{} ({})",
    toolchain.version().unwrap_or_else(|| "unknown version".to_string()),
    toolchain.executable.display()
  )
}
