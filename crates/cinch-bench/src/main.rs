//! Run a batch of context-budgeted agent sessions and resume it after a
//! crash or interrupt.
//!
//! Reads API keys from `CINCH_BENCH_API_KEYS` (comma-separated) unless
//! `--api-keys` is given.
//!
//! # Examples
//!
//! ```sh
//! # Run every task in tasks.json, 8 sessions at a time
//! cinch-bench run --tasks tasks.json --output runs/ --workers 8
//!
//! # Session settings from a TOML file, three runs per config group
//! cinch-bench run --tasks tasks.json --config bench.toml --runs-per-config 3
//!
//! # What is left to run? Delete failed artifacts first.
//! cinch-bench resume --tasks tasks.json --output runs/ --clean
//!
//! # JSON Schema of the task file
//! cinch-bench schema > tasks.schema.json
//! ```

use anyhow::{Context, bail};
use cinch_bench::agent::config::{ConfigFile, SessionConfig};
use cinch_bench::agent::events::{CompositeEventHandler, EventObserver, LoggingHandler, SessionEvent};
use cinch_bench::agent::artifact::ArtifactStore;
use cinch_bench::api::executor::CredentialPool;
use cinch_bench::run::resume::{ResumeScanner, ResumeState};
use cinch_bench::run::tasks::{self, RunTask};
use cinch_bench::run::{DEFAULT_WORKERS, Orchestrator};
use cinch_bench::{DEFAULT_BASE_URL, HttpChatClient, exit_codes, logging};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Context-budgeted agent sessions with a resumable parallel runner.
#[derive(Parser)]
#[command(name = "cinch-bench", version)]
struct Cli {
    /// Debug-level logging for this crate (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every task not already completed in the output directory
    Run(RunArgs),
    /// List the runs that still need to execute
    Resume(ResumeArgs),
    /// Print the JSON Schema of the task declaration file
    Schema,
}

/// Options shared by `run` and `resume`.
#[derive(Args)]
struct BatchArgs {
    /// Task declaration file (JSON array)
    #[arg(long)]
    tasks: PathBuf,

    /// Directory for run artifacts and summary.json
    #[arg(long, default_value = "runs")]
    output: PathBuf,

    /// Session settings (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Runs per config group (at least one per declared seed)
    #[arg(long)]
    runs_per_config: Option<usize>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    batch: BatchArgs,

    /// Comma-separated API keys, rotated on auth and rate-limit errors
    #[arg(long, env = "CINCH_BENCH_API_KEYS", hide_env_values = true)]
    api_keys: Option<String>,

    /// Chat completions endpoint
    #[arg(long, env = "CINCH_BENCH_BASE_URL")]
    base_url: Option<String>,

    /// Model ID (overrides the config file)
    #[arg(long)]
    model: Option<String>,

    /// Concurrent sessions
    #[arg(long)]
    workers: Option<usize>,

    /// Turn cap per session (overrides the config file)
    #[arg(long)]
    max_turns: Option<u32>,

    /// Working directory for command tools
    #[arg(long)]
    tool_workdir: Option<PathBuf>,

    /// Print edits and fatal errors as they happen
    #[arg(long)]
    progress: bool,
}

#[derive(Args)]
struct ResumeArgs {
    #[command(flatten)]
    batch: BatchArgs,

    /// Delete artifacts of failed runs so they are regenerated cleanly
    #[arg(long)]
    clean: bool,

    /// Print the plan as JSON
    #[arg(long)]
    json: bool,
}

fn load_config_file(args: &BatchArgs) -> anyhow::Result<ConfigFile> {
    match &args.config {
        Some(path) => Ok(ConfigFile::load(path)?),
        None => Ok(ConfigFile::default()),
    }
}

fn plan_tasks(args: &BatchArgs, file: &ConfigFile) -> anyhow::Result<Vec<RunTask>> {
    let decls = tasks::load_declarations(&args.tasks)
        .with_context(|| format!("loading {}", args.tasks.display()))?;
    let runs_per_config = args.runs_per_config.or(file.runs_per_config).unwrap_or(1);
    Ok(tasks::plan(decls, runs_per_config))
}

/// CLI flags over the config file over defaults.
fn session_config(args: &RunArgs, file: &ConfigFile) -> anyhow::Result<SessionConfig> {
    let mut config = file.apply(SessionConfig::default());
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(n) = args.max_turns {
        config = config.with_max_turns(n);
    }
    config.validate().context("invalid session configuration")?;
    Ok(config)
}

/// First Ctrl-C: stop scheduling and let sessions finish their turn.
/// Second Ctrl-C: exit immediately.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received, stopping at the next turn boundary (Ctrl-C again to abort)");
        cancel.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            process::exit(exit_codes::INTERRUPTED);
        }
    });
}

async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let file = load_config_file(&args.batch)?;
    let config = session_config(&args, &file)?;
    let tasks = plan_tasks(&args.batch, &file)?;

    let Some(keys) = &args.api_keys else {
        bail!("no API keys: pass --api-keys or set CINCH_BENCH_API_KEYS");
    };
    let credentials = CredentialPool::from_csv(keys)?;
    let base_url = args
        .base_url
        .clone()
        .or_else(|| file.base_url.clone())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let client = HttpChatClient::new(base_url)?;
    let workers = args.workers.or(file.workers).unwrap_or(DEFAULT_WORKERS);

    info!(
        model = %config.model,
        strategy = config.strategy.name(),
        tasks = tasks.len(),
        keys = credentials.len(),
        "configured"
    );

    let events = CompositeEventHandler::new()
        .with(LoggingHandler)
        .with_if(
            args.progress,
            EventObserver::new(|event| match event {
                SessionEvent::EditApplied(report) => eprintln!(
                    "  [edit] {:?}: {} -> {} tokens",
                    report.kind, report.tokens_before, report.tokens_after
                ),
                SessionEvent::Fatal { error } => eprintln!("  [fatal] {error}"),
                _ => {}
            }),
        );

    let mut orchestrator = Orchestrator::new(
        Arc::new(client),
        config,
        credentials,
        ArtifactStore::new(&args.batch.output),
    )
    .with_workers(workers)
    .with_events(events);
    if let Some(dir) = &args.tool_workdir {
        orchestrator = orchestrator.with_tool_workdir(dir);
    }
    spawn_interrupt_handler(orchestrator.cancellation());

    let outcome = orchestrator.run(&tasks).await;
    eprintln!("{}", outcome.summary.render());
    if outcome.already_done > 0 {
        eprintln!("  ({} run(s) already done, skipped)", outcome.already_done);
    }
    eprintln!(
        "Summary written to {}",
        orchestrator.store().summary_path().display()
    );
    Ok(outcome.exit_code())
}

fn resume(args: ResumeArgs) -> anyhow::Result<i32> {
    let file = load_config_file(&args.batch)?;
    let tasks = plan_tasks(&args.batch, &file)?;
    let store = ArtifactStore::new(&args.batch.output);
    let scanner = ResumeScanner::new(&store);
    let plan = scanner.scan(&tasks);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        for entry in plan.entries.iter().filter(|e| e.state.needs_run()) {
            match &entry.state {
                ResumeState::Failed { reason } => println!("{}\tfailed: {reason}", entry.task.key()),
                _ => println!("{}\tnever started", entry.task.key()),
            }
        }
        eprintln!(
            "{} done, {} failed, {} never started",
            plan.done(),
            plan.failed(),
            plan.never_started()
        );
    }

    if args.clean {
        let removed = scanner.clean(&plan)?;
        eprintln!("Removed {removed} failed artifact(s)");
    }

    Ok(if plan.to_run().is_empty() {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let result = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Resume(args) => resume(args),
        Command::Schema => serde_json::to_string_pretty(&tasks::task_file_schema())
            .map(|s| {
                println!("{s}");
                exit_codes::OK
            })
            .map_err(Into::into),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(exit_codes::FAILED);
        }
    }
}
