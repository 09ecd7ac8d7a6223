use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quasar::collaborators::{
    AgentInvoker, AgentOutput, BeadClient, GitCommitter, InMemoryBeadClient, Linter, NullCommitter,
    NullLinter,
};
use quasar::config::{load_nebula, ExecutionOverrides};
use quasar::errors::InvocationError;
use quasar::fabric::{Fabric, InMemoryFabric};
use quasar::hail::{format_relay_block, HailQueue};
use quasar::phase::{GateMode, Nebula, Phase};
use quasar::phase_loop::{PhaseLoop, PhaseLoopConfig};
use quasar::worker_group::{Intervention, PhaseLoopFactory, WorkerGroup};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "quasar")]
#[command(version, about = "Orchestrates coder/reviewer agent sessions over a DAG of phases")]
struct Cli {
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a nebula file and run it to completion.
    Run {
        nebula_file: PathBuf,

        #[arg(long)]
        max_workers: Option<usize>,

        #[arg(long)]
        gate: Option<GateModeArg>,

        #[arg(long)]
        speculative: Option<bool>,

        #[arg(long)]
        attended: bool,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum GateModeArg {
    Auto,
    Watch,
}

impl From<GateModeArg> for GateMode {
    fn from(value: GateModeArg) -> Self {
        match value {
            GateModeArg::Auto => GateMode::Auto,
            GateModeArg::Watch => GateMode::Watch,
        }
    }
}

/// Placeholder `AgentInvoker` for deployments that have not wired a real
/// transport. The agent invocation transport is explicitly out of scope;
/// production builds of this binary are expected to swap this out before
/// `quasar run` is used against a live nebula.
struct UnimplementedInvoker;

#[async_trait::async_trait]
impl AgentInvoker for UnimplementedInvoker {
    async fn invoke(&self, _prompt: &str, _model: &str) -> Result<AgentOutput, InvocationError> {
        Err(InvocationError::AgentFailed(
            "no agent invocation transport is configured for this build".into(),
        ))
    }
}

struct DeploymentFactory {
    project_dir: PathBuf,
    fabric: Arc<dyn Fabric>,
    hails: Arc<HailQueue>,
    bead_client: Arc<dyn BeadClient>,
    linter: Arc<dyn Linter>,
    committer: Option<Arc<dyn quasar::collaborators::CycleCommitter>>,
}

impl PhaseLoopFactory for DeploymentFactory {
    fn build(&self, phase: &Phase) -> PhaseLoop {
        let (_tx, rx) = watch::channel(None);
        PhaseLoop::new(
            PhaseLoopConfig::new(&phase.id, &phase.title, &phase.body),
            Arc::new(UnimplementedInvoker),
            Arc::new(UnimplementedInvoker),
            self.linter.clone(),
            self.committer.clone(),
            self.bead_client.clone(),
            self.fabric.clone(),
            self.hails.clone(),
            self.project_dir.clone(),
            rx,
        )
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt().with_env_filter(filter).init();
}

async fn resolve_hails_interactively(hails: &HailQueue) {
    use dialoguer::Input;
    for hail in hails.unresolved() {
        println!("[{:?}] {} ({})", hail.kind, hail.summary, hail.phase_id);
        if !hail.detail.is_empty() {
            println!("  {}", hail.detail);
        }
        let answer: String = Input::new()
            .with_prompt("resolution")
            .allow_empty(true)
            .interact_text()
            .unwrap_or_default();
        if !answer.is_empty() {
            let _ = hails.resolve(hail.id, &answer);
        }
    }
}

async fn run_nebula(nebula: Nebula, attended: bool) -> Result<()> {
    let project_dir = std::env::current_dir().context("failed to resolve working directory")?;
    let fabric: Arc<dyn Fabric> = Arc::new(InMemoryFabric::new());
    let hails = Arc::new(HailQueue::new(Some(chrono::Duration::minutes(30))));
    let bead_client: Arc<dyn BeadClient> = Arc::new(InMemoryBeadClient::new());
    let linter: Arc<dyn Linter> = Arc::new(NullLinter);
    let committer: Option<Arc<dyn quasar::collaborators::CycleCommitter>> =
        Some(match GitCommitter::new(&project_dir) {
            Ok(git) => Arc::new(git),
            Err(_) => Arc::new(NullCommitter),
        });

    let factory = Arc::new(DeploymentFactory {
        project_dir: project_dir.clone(),
        fabric: fabric.clone(),
        hails: hails.clone(),
        bead_client,
        linter,
        committer,
    });

    let cancellation = CancellationToken::new();
    let (intervention_tx, intervention_rx) = watch::channel(Intervention::Run);

    {
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested, cancelling run");
                cancellation.cancel();
            }
        });
    }

    if attended {
        let hails = hails.clone();
        let intervention_tx = intervention_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                resolve_hails_interactively(&hails).await;
                if let Some(block) = format_relay_block(&hails.unrelayed_resolved()) {
                    tracing::info!(%block, "relaying resolved hails");
                }
                if intervention_tx.is_closed() {
                    break;
                }
            }
        });
    }

    let group = WorkerGroup::new(
        &nebula.phases,
        &nebula.execution,
        fabric,
        factory,
        None,
        std::collections::HashMap::new(),
        cancellation,
        intervention_rx,
    )?;

    let report = group.run(&nebula.phases).await;
    for result in &report.results {
        match &result.outcome {
            Ok(outcome) => tracing::info!(
                phase = %result.phase_id,
                cycles = outcome.cycles_used,
                cost = outcome.total_cost_usd,
                "phase completed"
            ),
            Err(err) => tracing::warn!(phase = %result.phase_id, %err, "phase failed"),
        }
    }

    if report.manually_stopped {
        println!("run stopped by operator intervention");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            nebula_file,
            max_workers,
            gate,
            speculative,
            attended,
        } => {
            let overrides = ExecutionOverrides {
                max_workers,
                gate: gate.map(Into::into),
                speculative,
            };
            let nebula = load_nebula(&nebula_file, &overrides)
                .with_context(|| format!("failed to load nebula file {}", nebula_file.display()))?;
            run_nebula(nebula, attended).await
        }
    }
}
