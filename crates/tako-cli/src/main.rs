//! The `tako` command-line interface.
//!
//! Wires the engine (tako-core) to the environment adapters (tako-infra)
//! and the tracing setup (tako-observe). Orchestration returns exit code 0
//! on success and 1 on failure with the first surfaced error on stderr.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tako_core::config::load_repo_config;
use tako_core::lock::LockManager;
use tako_core::orchestrator::Orchestrator;
use tako_core::runner::{EngineShared, Runner, WorkflowRunner};
use tako_core::runtime::BoxContainerRuntime;
use tako_core::state::{ExecutionPhase, ExecutionStateStore};
use tako_core::subscription::discovery::CacheDiscoverer;
use tako_infra::config::load_global_config;
use tako_infra::docker::DockerCliRuntime;
use tako_types::config::GlobalConfig;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "tako", version, about = "Multi-repository workflow orchestrator")]
struct Cli {
    /// Export spans via OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    otel: bool,

    /// Workspace root (state, locks, fan-out journals, children).
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Repository cache root.
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a workflow from a repository's tako.yml.
    Exec {
        /// Workflow name.
        workflow: String,
        /// Path to the repository checkout.
        #[arg(long)]
        repo: PathBuf,
        /// Workflow inputs as `name=value` (repeatable).
        #[arg(long = "input", value_parser = parse_key_value)]
        inputs: Vec<(String, String)>,
        /// Report steps without executing them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Parse and validate a repository's tako.yml.
    Validate {
        /// Path to the repository checkout.
        #[arg(long)]
        repo: PathBuf,
    },
    /// List subscription matches for an artifact and event type.
    Discover {
        /// Artifact id (`owner/repo:name`).
        artifact: String,
        /// Event type.
        event_type: String,
    },
    /// Inspect or clean repository locks.
    Locks {
        #[command(subcommand)]
        action: LocksAction,
    },
    /// Show the persisted execution state of a run.
    Status {
        /// Run id (e.g. `exec-20250314-093015-deadbeef`).
        run_id: String,
    },
}

#[derive(Subcommand)]
enum LocksAction {
    /// List all lock records, marking stale ones.
    List,
    /// Remove expired and orphaned lock records.
    Clean,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("'{raw}' is not of the form name=value"))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = tako_observe::tracing_setup::init_tracing(cli.otel) {
        eprintln!("failed to initialize tracing: {err}");
    }

    let exit = match run(cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    tako_observe::tracing_setup::shutdown_tracing();
    std::process::exit(exit);
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let data_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tako");
    let settings = load_global_config(&data_dir).await;

    let workspace = cli
        .workspace
        .or_else(|| settings.workspace_dir.clone())
        .unwrap_or_else(|| data_dir.join("workspace"));
    let cache = cli
        .cache
        .or_else(|| settings.cache_dir.clone())
        .unwrap_or_else(|| data_dir.join("cache"));

    match cli.command {
        Command::Exec {
            workflow,
            repo,
            inputs,
            dry_run,
        } => exec(workspace, cache, settings, workflow, repo, inputs, dry_run).await,
        Command::Validate { repo } => validate(repo),
        Command::Discover {
            artifact,
            event_type,
        } => discover(cache, settings, artifact, event_type).await,
        Command::Locks { action } => locks(workspace, settings, action),
        Command::Status { run_id } => status(workspace, run_id),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn exec(
    workspace: PathBuf,
    cache: PathBuf,
    settings: GlobalConfig,
    workflow: String,
    repo: PathBuf,
    inputs: Vec<(String, String)>,
    dry_run: bool,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("creating workspace {}", workspace.display()))?;

    let shared = EngineShared::bootstrap(
        &workspace,
        cache,
        settings,
        Some(BoxContainerRuntime::new(DockerCliRuntime::default())),
    )?;
    let runner = Runner::root(Arc::clone(&shared), workspace, dry_run);

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, canceling run");
            signal_token.cancel();
        }
    });

    let input_map: BTreeMap<String, Value> = inputs
        .into_iter()
        .map(|(name, value)| (name, Value::String(value)))
        .collect();

    let run_id = runner.run_id().to_string();
    println!("run {run_id}");
    let result = runner
        .execute_workflow(&cancel, &workflow, input_map, &repo)
        .await?;

    for step in &result.steps {
        let mark = if step.success { "ok" } else { "failed" };
        println!("  step {:<20} {mark}", step.id);
        for (name, value) in &step.outputs {
            println!("    {name} = {value}");
        }
    }

    shared.lock_manager.release_all_locks(&run_id)?;

    match result.phase {
        ExecutionPhase::Completed => {
            println!("completed");
            Ok(())
        }
        _ => bail!(result
            .error
            .unwrap_or_else(|| "workflow failed".to_string())),
    }
}

fn validate(repo: PathBuf) -> anyhow::Result<()> {
    let config = load_repo_config(&repo)?;
    let templates = tako_core::template::TemplateEngine::new(64 * 1024);

    for (name, workflow) in &config.workflows {
        for step in &workflow.steps {
            if let Some(run) = &step.run {
                templates.validate_template(run).with_context(|| {
                    format!("workflow '{name}' step '{}' run template", step.id)
                })?;
            }
        }
    }

    println!(
        "ok: {} workflow(s), {} subscription(s), {} dependent(s)",
        config.workflows.len(),
        config.subscriptions.len(),
        config.dependents.len()
    );
    Ok(())
}

async fn discover(
    cache: PathBuf,
    settings: GlobalConfig,
    artifact: String,
    event_type: String,
) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::new(
        CacheDiscoverer::new(cache),
        settings.drop_disabled_subscriptions,
        settings.prioritize_matches,
    );
    let cancel = CancellationToken::new();
    let matches = orchestrator
        .discover_subscriptions(&cancel, &artifact, &event_type)
        .await?;

    if matches.is_empty() {
        println!("no subscribers");
        return Ok(());
    }
    for entry in matches {
        println!("{} -> {}", entry.repository, entry.subscription.workflow);
    }
    Ok(())
}

fn locks(
    workspace: PathBuf,
    settings: GlobalConfig,
    action: LocksAction,
) -> anyhow::Result<()> {
    let manager = LockManager::new(
        &workspace,
        Duration::from_secs(settings.lock_ttl_secs),
    )?;

    match action {
        LocksAction::List => {
            let stale: Vec<_> = manager
                .detect_deadlocks()
                .into_iter()
                .map(|record| (record.repository.clone(), record.lock_type))
                .collect();
            let records = manager.list_locks();
            if records.is_empty() {
                println!("no locks held");
                return Ok(());
            }
            for record in records {
                let flag = if stale.contains(&(record.repository.clone(), record.lock_type))
                {
                    " (stale)"
                } else {
                    ""
                };
                println!(
                    "{} {} held by {} (pid {}, expires {}){flag}",
                    record.repository,
                    record.lock_type,
                    record.run_id,
                    record.process_id,
                    record.expires_at
                );
            }
        }
        LocksAction::Clean => {
            let removed = manager.cleanup_stale_locks();
            println!("removed {removed} stale lock(s)");
        }
    }
    Ok(())
}

fn status(workspace: PathBuf, run_id: String) -> anyhow::Result<()> {
    let store = ExecutionStateStore::new(&workspace)?;
    let state = store.load(&run_id)?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}
