use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relay::config::Config;
use relay::core::{Task, TaskGraph, TaskId, TaskStatus};
use relay::git::GitWorkspaces;
use relay::orchestration::{
    CommandExecutor, LockManager, MergeCoordinator, MergeReport, ScheduleReport, Scheduler,
    SchedulerEvent, SchedulerSettings, StatusReport,
};
use relay::state::{FsStore, TaskRepository};
use relay::{rlog, rlog_error, Result};

/// Relay - runs a dependency graph of tasks on a pool of isolated workers
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    RELAY_DEBUG=1   Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Project root containing the git baseline and the .relay directory
    #[arg(short = 'C', long, default_value = ".")]
    pub root: PathBuf,

    /// Enable debug logging (writes to .relay/relay.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Create the .relay layout and a default relay.toml
    Init {
        /// Also add an example task to the backlog
        #[arg(long)]
        sample: bool,
    },

    /// Run the backlog to completion, then merge the results
    Launch {
        /// Maximum concurrent worker sessions (overrides relay.toml)
        #[arg(short = 'p', long)]
        pool_size: Option<usize>,

        /// Leave completed workspaces unmerged
        #[arg(long)]
        no_merge: bool,
    },

    /// Merge completed workspaces into the baseline
    Merge,

    /// Show task counts, active claims, blocked and unreachable tasks
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Revoke every claim and return all unfinished tasks to the backlog
    Reset,

    /// Move completed and blocked records into a timestamped archive
    Archive {
        /// Name appended to the archive directory
        label: String,
    },

    /// Check every task record and the dependency graph without scheduling
    Validate,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        rlog_error!("{}", e);
        eprintln!("error: {}", e);
        if let Some(path) = relay::log::log_path() {
            eprintln!("see {} for details", path.display());
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let root = cli.root.canonicalize()?;
    let state_dir = Config::ensure_state_dir(&root)?;
    relay::log::init_with_debug(&state_dir, cli.debug);
    rlog!("relay {:?} in {}", cli.command, root.display());

    match cli.command {
        Command::Init { sample } => run_init(&root, sample),
        Command::Launch { pool_size, no_merge } => run_launch(&root, pool_size, no_merge),
        Command::Merge => run_merge(&root),
        Command::Status { json } => run_status(&root, json),
        Command::Reset => run_reset(&root),
        Command::Archive { label } => run_archive(&root, &label),
        Command::Validate => run_validate(&root),
    }
}

fn open_store(root: &Path) -> Result<Arc<FsStore>> {
    let store = FsStore::new(root);
    store.init()?;
    Ok(Arc::new(store))
}

fn open_workspaces(root: &Path, config: &Config) -> Result<Arc<GitWorkspaces>> {
    Ok(Arc::new(GitWorkspaces::new(
        root,
        config.worktrees_dir(root),
        &config.branch_prefix,
    )?))
}

fn run_init(root: &Path, sample: bool) -> Result<()> {
    let store = open_store(root)?;
    if !Config::config_path(root).exists() {
        Config::default().save(root)?;
    }
    if sample {
        let task = Task::new(TaskId::new("example")?, "Add a README")
            .with_description("Write a short README.md describing the project.")
            .with_verification("test -s README.md")
            .with_criterion("README.md exists and is not empty");
        store.insert(&task)?;
    }
    println!("Initialized {}", store.tasks_dir().display());
    println!("Add task records to {}", store.collection(TaskStatus::Backlog).display());
    Ok(())
}

fn run_launch(root: &Path, pool_size: Option<usize>, no_merge: bool) -> Result<()> {
    let mut config = Config::load(root)?;
    if let Some(size) = pool_size {
        config.pool_size = size;
    }
    config.validate()?;

    let store = open_store(root)?;
    let workspaces = open_workspaces(root, &config)?;
    let executor = Arc::new(CommandExecutor::from_command_line(&config.executor)?);
    let locks = Arc::new(LockManager::new(
        store.clone(),
        store.clone(),
        config.stale_threshold(),
    ));

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, stopping workers...");
                on_signal.cancel();
            }
        });

        let (tx, mut rx) = mpsc::channel(64);
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                print_event(&event);
            }
        });

        let mut scheduler = Scheduler::new(
            store.clone(),
            locks,
            workspaces.clone(),
            executor,
            SchedulerSettings::from_config(&config),
        )
        .with_events(tx);
        println!("Launching with {} worker(s)", config.pool_size);
        let report = scheduler.run(cancel.clone()).await;
        drop(scheduler);
        let _ = printer.await;
        let report = report?;
        print_schedule_report(&report);

        if !no_merge && !report.cancelled {
            let merge = merge_coordinator(root, &config, store.clone(), workspaces.clone())
                .run()
                .await?;
            print_merge_report(&merge);
        }
        Ok::<ScheduleReport, relay::Error>(report)
    })?;

    if !report.blocked.is_empty() || !report.unreachable.is_empty() {
        println!("\nRun `relay status` for details on blocked and unreachable tasks.");
    }
    Ok(())
}

fn merge_coordinator(
    root: &Path,
    config: &Config,
    store: Arc<FsStore>,
    workspaces: Arc<GitWorkspaces>,
) -> MergeCoordinator {
    MergeCoordinator::from_config(config, store, workspaces)
        .with_report_path(Config::merge_report_path(root))
}

fn run_merge(root: &Path) -> Result<()> {
    let config = Config::load(root)?;
    let store = open_store(root)?;
    let workspaces = open_workspaces(root, &config)?;
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(merge_coordinator(root, &config, store, workspaces).run())?;
    print_merge_report(&report);
    Ok(())
}

fn run_status(root: &Path, json: bool) -> Result<()> {
    let config = Config::load(root)?;
    let store = open_store(root)?;
    let report = StatusReport::collect(store.as_ref(), store.as_ref(), config.stale_threshold())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report);
        if report.needs_attention() {
            println!("\nSome tasks need attention; see above.");
        }
    }
    Ok(())
}

fn run_reset(root: &Path) -> Result<()> {
    let config = Config::load(root)?;
    let store = open_store(root)?;
    let locks = LockManager::new(store.clone(), store.clone(), config.stale_threshold());
    let summary = locks.force_reclaim_all()?;
    println!(
        "Revoked {} claim(s), returned {} task(s) to the backlog",
        summary.revoked.len(),
        summary.requeued.len()
    );
    for id in &summary.requeued {
        println!("  {}", id);
    }
    Ok(())
}

fn run_archive(root: &Path, label: &str) -> Result<()> {
    let store = open_store(root)?;
    let summary = store.archive(label)?;
    match &summary.location {
        Some(location) => println!(
            "Archived {} completed and {} blocked task(s) to {}",
            summary.completed.len(),
            summary.blocked.len(),
            location.display()
        ),
        None => println!("Nothing to archive"),
    }
    Ok(())
}

fn run_validate(root: &Path) -> Result<()> {
    let store = open_store(root)?;
    let snapshot = store.snapshot()?;
    for record in &snapshot.invalid {
        println!("invalid: {}", record.reason);
    }
    let graph = TaskGraph::build(&snapshot.tasks)?;
    if !snapshot.invalid.is_empty() {
        return Err(relay::Error::Validation(format!(
            "{} malformed task record(s)",
            snapshot.invalid.len()
        )));
    }
    println!(
        "{} task(s), {} dependency edge(s), no cycles",
        graph.len(),
        graph.edge_count()
    );
    Ok(())
}

fn print_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::TaskClaimed { task_id, worker_id } => {
            println!("[claimed]     {} by {}", task_id, worker_id)
        }
        SchedulerEvent::TaskCompleted { task_id } => println!("[completed]   {}", task_id),
        SchedulerEvent::TaskBlocked { task_id, reason } => {
            println!("[blocked]     {}: {}", task_id, reason)
        }
        SchedulerEvent::TaskRequeued { task_id } => println!("[requeued]    {}", task_id),
        SchedulerEvent::ClaimReclaimed {
            task_id,
            worker_id,
            idle,
        } => println!(
            "[reclaimed]   {} from {} (idle {}s)",
            task_id,
            worker_id,
            idle.as_secs()
        ),
        SchedulerEvent::TasksUnreachable { tasks } => {
            for entry in tasks {
                println!("[unreachable] {}", entry);
            }
        }
        SchedulerEvent::PassAborted { error } => println!("[aborted]     {}", error),
    }
}

fn print_schedule_report(report: &ScheduleReport) {
    println!();
    println!(
        "Schedule finished: {} completed, {} blocked, {} requeued",
        report.completed.len(),
        report.blocked.len(),
        report.requeued.len()
    );
    if report.idle_timeout {
        println!("Stopped after idle timeout; still waiting on:");
        for id in &report.waiting {
            println!("  {}", id);
        }
    }
    if report.cancelled {
        println!("Cancelled; unfinished tasks were returned to the backlog");
    }
}

fn print_merge_report(report: &MergeReport) {
    println!();
    println!(
        "Merged {} of {} task(s)",
        report.merged.len(),
        report.order.len()
    );
    for conflict in &report.conflicts {
        println!(
            "  conflict in {} ({:?}): {}",
            conflict.task_id,
            conflict.resolution,
            conflict.paths.join(", ")
        );
    }
    if let Some(failure) = &report.failure {
        println!("  verification broke after {}: {}", failure.task_id, failure.reason);
        if !report.remaining.is_empty() {
            let remaining: Vec<&str> = report.remaining.iter().map(TaskId::as_str).collect();
            println!("  not merged: {}", remaining.join(", "));
        }
    }
}
