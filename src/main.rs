use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use stagewise::config::Config;
use stagewise::core::TaskFile;
use stagewise::git::GitVcs;
use stagewise::orchestration::{
    Collaborators, CommandMutator, CommandVerifier, ExecutionPlan, FileAnalyzer, Orchestrator,
    ProgressStore,
};
use stagewise::{Error, Result};

/// Stagewise - dependency-aware batch scheduler for code-change tasks
#[derive(Parser, Debug)]
#[command(name = "stagewise")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    STAGEWISE_DEBUG=1     Enable debug logging (alternative to --debug)\n    RUST_LOG              Override the log filter"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.stagewise/stagewise.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ./stagewise.toml, then ~/.stagewise/config.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Show the stages and groups a task file plans into
    Plan {
        /// Task file (.json or .toml)
        tasks: PathBuf,

        /// Workload budget per group
        #[arg(long)]
        max_batch_cost: Option<u32>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Plan and execute a task file against a git repository
    Run {
        /// Task file (.json or .toml)
        tasks: PathBuf,

        /// Repository to work in (default: current directory)
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Shell command that applies a task
        #[arg(long)]
        mutate: Option<String>,

        /// Shell command that verifies a task; exit status 0 passes
        #[arg(long)]
        verify: Option<String>,

        /// Rollbacks allowed per task before it fails
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Workload budget per group
        #[arg(long)]
        max_batch_cost: Option<u32>,

        /// Timeout in seconds for each collaborator call
        #[arg(long)]
        timeout: Option<u64>,

        /// Mirror progress snapshots to this JSON file
        #[arg(long)]
        progress_file: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    stagewise::log::init_with_debug(cli.debug);
    tracing::info!(debug = cli.debug, "stagewise starting");

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Plan {
            tasks,
            max_batch_cost,
            json,
        } => {
            if let Some(budget) = max_batch_cost {
                config.max_batch_cost = budget;
            }
            config.validate()?;
            run_plan(&tasks, &config, json)
        }
        Command::Run {
            tasks,
            repo,
            mutate,
            verify,
            max_iterations,
            max_batch_cost,
            timeout,
            progress_file,
        } => {
            if let Some(budget) = max_batch_cost {
                config.max_batch_cost = budget;
            }
            if let Some(iterations) = max_iterations {
                config.max_iterations = iterations;
            }
            if timeout.is_some() {
                config.collaborator_timeout_secs = timeout;
            }
            if mutate.is_some() {
                config.mutate_command = mutate;
            }
            if verify.is_some() {
                config.verify_command = verify;
            }
            if let Some(path) = progress_file {
                config.progress_file = Some(path.to_string_lossy().into_owned());
            }
            config.validate()?;

            let repo = match repo {
                Some(path) => path,
                None => std::env::current_dir()?,
            };
            let success = run_tasks(&tasks, &repo, &config)?;
            if !success {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn load_plan(tasks: &Path, config: &Config) -> Result<ExecutionPlan> {
    let tasks = TaskFile::load(tasks)?;
    stagewise::plan(tasks, config.max_batch_cost)
}

/// Print the plan without executing anything.
fn run_plan(tasks: &Path, config: &Config, json: bool) -> Result<()> {
    let plan = load_plan(tasks, config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan.summary())?);
        return Ok(());
    }

    println!(
        "{} tasks in {} stages (max batch cost {})",
        plan.task_count(),
        plan.stages().len(),
        plan.max_batch_cost()
    );
    for stage in plan.stages() {
        println!();
        println!("Stage {}", stage.index);
        for group in &stage.groups {
            println!("  {} [{}, cost {}]", group.id, group.mode, group.cost);
            for id in &group.task_ids {
                let title = plan.task(id).map(|t| t.title.as_str()).unwrap_or_default();
                println!("    - {}: {}", id, title);
            }
        }
    }
    Ok(())
}

/// Execute the plan and print the final report. Returns whether every
/// task completed.
fn run_tasks(tasks: &Path, repo: &Path, config: &Config) -> Result<bool> {
    let plan = load_plan(tasks, config)?;
    let vcs = GitVcs::new(repo)?;
    let workdir = vcs.repo_path().to_path_buf();

    let mutate = config
        .mutate_command
        .clone()
        .ok_or_else(|| Error::Validation("no mutate command configured".to_string()))?;
    let verify = config
        .verify_command
        .clone()
        .ok_or_else(|| Error::Validation("no verify command configured".to_string()))?;

    let collaborators = Collaborators::new(
        Arc::new(FileAnalyzer::new(&workdir)),
        Arc::new(CommandMutator::new(mutate, &workdir)),
        Arc::new(CommandVerifier::new(verify, &workdir)),
        Arc::new(vcs),
    );
    let orchestrator = Orchestrator::new(collaborators, config.executor_settings());
    let progress_path = config.progress_path();
    let poll_interval = config.poll_interval();

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let cancel = CancellationToken::new();
        let ctrl_c = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling run");
                eprintln!("Cancelling: in-flight tasks are rolling back...");
                ctrl_c.cancel();
            }
        });

        let stop = CancellationToken::new();
        let poller = tokio::spawn(poll_progress(
            orchestrator.progress(),
            progress_path.clone(),
            poll_interval,
            stop.clone(),
        ));

        let report = orchestrator.execute(&plan, cancel).await;

        stop.cancel();
        let _ = poller.await;
        if let Some(path) = &progress_path {
            if let Err(e) = orchestrator.progress().write_to(path).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to write progress file");
            }
        }
        report
    });

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report.success())
}

/// Periodically log the progress snapshot and mirror it to `path`.
async fn poll_progress(
    store: ProgressStore,
    path: Option<PathBuf>,
    interval: std::time::Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = store.snapshot().await;
        let (fixed, failed, in_progress, pending) =
            snapshot.values().fold((0, 0, 0, 0), |acc, r| {
                (
                    acc.0 + r.counts.fixed,
                    acc.1 + r.counts.failed,
                    acc.2 + r.counts.in_progress,
                    acc.3 + r.counts.pending,
                )
            });
        tracing::info!(
            groups = snapshot.len(),
            fixed,
            failed,
            in_progress,
            pending,
            "progress"
        );

        if let Some(path) = &path {
            if let Err(e) = store.write_to(path).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to write progress file");
            }
        }
    }
}
