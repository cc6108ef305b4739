use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use valet_config::{ConfigLoader, ValetConfig};
use valet_core::EventBus;
use valet_llm::{LlmProvider, MockProvider};
use valet_runtime::{
    AutoApprove, CronAgentRunner, CronStore, LogNotifier, LoopConfig, SubAgentRegistry,
    SubAgentRunner, SubAgentTool, ToolRegistry, register_builtins, run_scheduler,
};

#[derive(Parser)]
#[command(name = "valet", about = "Valet — desktop assistant agent runtime")]
struct Cli {
    /// Path to valet.toml (default: ~/.valet/valet.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon: scheduler plus any configured channels.
    Start,
    /// Load and validate the configuration, then exit.
    Check,
}

/// Resolve the provider adapter for the configured model. Wire-protocol
/// adapters register themselves here; the workspace ships with the mock.
fn resolve_provider(config: &ValetConfig) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let model = &config.agent.model;
    if model.starts_with("mock/") {
        return Ok(Arc::new(MockProvider::new()));
    }
    bail!("no provider adapter registered for model '{model}'");
}

fn init_logging(config: &ValetConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn start(config: ValetConfig) -> anyhow::Result<()> {
    let provider = resolve_provider(&config)?;

    let registry = ToolRegistry::new();
    register_builtins(&registry);
    let registry = Arc::new(registry);

    let profiles = Arc::new(SubAgentRegistry::with_default_profiles());
    let sub_agents = Arc::new(SubAgentRunner::new(
        Arc::clone(&provider),
        Arc::clone(&registry),
        Arc::clone(&profiles),
        LoopConfig::from_agent_config(&config.agent),
        config.agent.max_sub_agent_depth,
    ));
    registry.register(Arc::new(SubAgentTool::new(sub_agents, Arc::new(AutoApprove))));

    let bus = EventBus::default();
    let store = Arc::new(CronStore::new());
    let runner = Arc::new(CronAgentRunner::new(
        Arc::clone(&store),
        provider,
        registry,
        profiles,
        &config.cron.default_profile,
        LoopConfig::from_agent_config(&config.agent),
        config.workspace.working_dir.clone(),
        Arc::new(LogNotifier),
        bus,
    ));

    let shutdown = CancellationToken::new();
    let scheduler = tokio::spawn(run_scheduler(
        Arc::clone(&runner),
        Duration::from_secs(config.cron.tick_secs),
        shutdown.clone(),
    ));

    info!("valet started — press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    shutdown.cancel();
    let _ = scheduler.await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Configuration errors fail fast: no run is ever started from a broken
    // config.
    let loader = ConfigLoader::load(cli.config.as_deref()).context("configuration error")?;
    let config = loader.get();
    init_logging(&config);

    match cli.command {
        Command::Start => start(config).await,
        Command::Check => {
            println!("configuration ok: {}", loader.path().display());
            Ok(())
        }
    }
}
