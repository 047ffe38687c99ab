use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepflow_core::config::{expand_home, load_workflow, AppConfig};
use stepflow_core::event::EventBus;
use stepflow_core::types::{
    ChainRequest, RunId, RunInputs, RunStatus, StepStatus, WorkflowRequest, WorkflowRun,
};

use stepflow_agents::{AgentRegistry, EchoAgent};
use stepflow_engine::{ExecutionPlan, PlanLimits, RunLogger, WorkflowService};
use stepflow_store::SqliteRunStore;

#[derive(Parser)]
#[command(name = "stepflow", version, about = "Multi-step agent workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow file and print its execution order
    Validate {
        /// Workflow file (TOML, or JSON with a .json extension)
        file: PathBuf,
    },
    /// Run a workflow file to completion
    Run {
        file: PathBuf,
        /// Overall run deadline in seconds (overrides engine.run_timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,
        /// Seed input available to templates as {{input.KEY}}
        #[arg(long = "input", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        inputs: Vec<(String, String)>,
        /// Answer every step with the rendered message instead of calling agents
        #[arg(long)]
        dry_run: bool,
    },
    /// Send one message through a list of agents
    Chain {
        /// Agent reference, repeat for each step
        #[arg(long = "agent", required = true)]
        agents: Vec<String>,
        #[arg(short, long)]
        message: String,
        /// Run all agents at once instead of one after another
        #[arg(long)]
        parallel: bool,
        #[arg(long)]
        name: Option<String>,
    },
    /// Show the status of a run
    Status { run_id: String },
    /// Show a run with step outputs, tool calls and errors
    Show { run_id: String },
    /// List recent runs
    History {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// List configured agents
    Agents,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stepflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "stepflow", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { file } => {
            let request = load_workflow(&file)?;
            let plan = ExecutionPlan::build(
                request.into_definition(),
                PlanLimits::from(&config.engine),
            )?;
            print_plan(&plan);

            let unresolved = AgentRegistry::from_config(&config.agents).unresolved(plan.definition());
            if !unresolved.is_empty() {
                warn!(agents = ?unresolved, "Workflow references agents missing from config");
            }
        }
        Commands::Run {
            file,
            timeout,
            inputs,
            dry_run,
        } => {
            if let Some(secs) = timeout {
                config.engine.run_timeout_secs = secs;
            }
            let request = load_workflow(&file)?;
            let inputs: RunInputs = inputs.into_iter().collect();
            let run = run_to_completion(&config, request, inputs, dry_run).await?;
            finish(&run);
        }
        Commands::Chain {
            agents,
            message,
            parallel,
            name,
        } => {
            let request = ChainRequest {
                agent_refs: agents,
                message,
                workflow_name: name,
                parallel_execution: parallel,
            }
            .into_request();
            let run = run_to_completion(&config, request, RunInputs::new(), false).await?;
            finish(&run);
        }
        Commands::Status { run_id } => {
            let service = build_service(&config, false, Arc::new(EventBus::default()))?;
            let report = service.status(&RunId::from_string(&run_id)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Show { run_id } => {
            let service = build_service(&config, false, Arc::new(EventBus::default()))?;
            let run = service.details(&RunId::from_string(&run_id)).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Commands::History { limit, offset } => {
            let service = build_service(&config, false, Arc::new(EventBus::default()))?;
            let runs = service.history(limit, offset).await?;
            if runs.is_empty() {
                println!("No workflow runs recorded yet.");
            }
            for run in &runs {
                println!(
                    "{}  {:<16} {:<32} {}/{} ok, {} failed, {} skipped  {}",
                    run.run_id,
                    run.status,
                    truncate(&run.workflow_name, 32),
                    run.succeeded_steps,
                    run.step_count,
                    run.failed_steps,
                    run.skipped_steps,
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }
        Commands::Agents => {
            let registry = AgentRegistry::from_config(&config.agents);
            if registry.list().is_empty() {
                println!("No agents configured.");
            }
            for name in registry.list() {
                println!("{}", name);
            }
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    let home_config = expand_home("~/.stepflow/config.toml");
    if home_config.exists() {
        info!(path = %home_config.display(), "Loading config from home directory");
        return Ok(AppConfig::load(&home_config)?);
    }

    info!("No config file found, using defaults");
    Ok(AppConfig::default())
}

fn build_service(
    config: &AppConfig,
    dry_run: bool,
    event_bus: Arc<EventBus>,
) -> anyhow::Result<WorkflowService> {
    let registry = if dry_run {
        AgentRegistry::new().with_fallback(EchoAgent::default())
    } else {
        AgentRegistry::from_config(&config.agents)
    };
    let store = SqliteRunStore::open(&config.store.resolved_path())?;

    Ok(WorkflowService::from_config(
        &config.engine,
        Arc::new(registry),
        Arc::new(store),
        event_bus,
    ))
}

/// Submit, wait for the run to finish and flush the run log. Ctrl-C cancels
/// the run and still waits for its final state.
async fn run_to_completion(
    config: &AppConfig,
    request: WorkflowRequest,
    inputs: RunInputs,
    dry_run: bool,
) -> anyhow::Result<WorkflowRun> {
    let event_bus = Arc::new(EventBus::default());
    let service = build_service(config, dry_run, event_bus.clone())?;

    let log_cancel = CancellationToken::new();
    let logger = config.log.as_ref().map(|log_config| {
        let handle = RunLogger::new(log_config.resolved_dir(), log_config.level)
            .spawn(&event_bus, log_cancel.clone());
        info!(level = log_config.level, "RunLogger enabled");
        handle
    });

    let submission = service.submit_with_inputs(request, inputs).await?;
    println!("Run {} accepted", submission.run_id);

    let run = tokio::select! {
        run = service.wait(&submission.run_id) => run?,
        _ = tokio::signal::ctrl_c() => {
            info!(run_id = %submission.run_id, "Interrupted, cancelling run");
            service.cancel(&submission.run_id).await?;
            service.wait(&submission.run_id).await?
        }
    };

    log_cancel.cancel();
    if let Some(handle) = logger {
        handle.await.ok();
    }
    Ok(run)
}

fn print_plan(plan: &ExecutionPlan) {
    let definition = plan.definition();
    println!(
        "Workflow '{}' is valid: {} step(s), {}",
        definition.name,
        plan.len(),
        if plan.is_parallel() { "parallel" } else { "sequential" }
    );
    if plan.is_parallel() {
        for (i, wave) in plan.wave_names().iter().enumerate() {
            println!("  wave {}: {}", i + 1, wave.join(", "));
        }
    } else {
        println!("  order: {}", plan.ordered_names().join(" -> "));
    }
}

fn finish(run: &WorkflowRun) {
    print_run(run);
    if run.status != RunStatus::Succeeded {
        std::process::exit(1);
    }
}

fn print_run(run: &WorkflowRun) {
    println!(
        "\n{} [{}] {}",
        run.workflow_name,
        run.status,
        run.total_elapsed_ms
            .map(|ms| format!("in {}ms", ms))
            .unwrap_or_default()
    );
    for step in &run.steps {
        let marker = match step.status {
            StepStatus::Succeeded => "ok",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "skipped",
            StepStatus::Pending | StepStatus::Running => "-",
        };
        println!("  {:<8} {} ({})", marker, step.step_name, step.agent_ref);
        if let Some(output) = &step.output {
            println!("           {}", truncate(output.lines().next().unwrap_or(""), 100));
        }
        if let Some(error) = &step.error_message {
            println!("           {}", error);
        }
    }
    if let Some(error) = &run.error {
        println!("\nerror: {}", error);
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
