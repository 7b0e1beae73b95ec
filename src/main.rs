use std::path::PathBuf;
use std::sync::Arc;

use agent_pipeline_core::config::DeploymentLoader;
use agent_pipeline_core::orchestrator::{Orchestrator, PipelineDefaults};
use agent_pipeline_core::pipeline::{Handler, HandlerInput};
use agent_pipeline_core::store::{DeadLetterStore, InMemoryDeadLetterStore, InMemoryMessageStore, MessageStore};
use agent_pipeline_core::supervisor::{stdio_transport_factory, SupervisorPolicy};
use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pipelined", about = "Runs agent message pipelines against remote MCP tool servers")]
struct Cli {
    /// Directory containing configs/agents/*.json and configs/deployment_groups.yaml
    #[arg(long, default_value = ".")]
    base_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single agent's pipeline until ctrl-c.
    Agent {
        /// Agent name; looks up configs/agents/<name>.json
        name: String,
    },
    /// Run every agent in a deployment group until ctrl-c.
    Group {
        /// Deployment group id from configs/deployment_groups.yaml
        group_id: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let result = runtime.block_on(async_main());
    runtime.shutdown_timeout(std::time::Duration::from_millis(100));
    result
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();

    let orchestrator = Orchestrator::new(
        cli.base_dir.clone(),
        SupervisorPolicy::default(),
        stdio_transport_factory(),
        PipelineDefaults::default(),
    );

    let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
    let dead_letters: Arc<dyn DeadLetterStore> = Arc::new(InMemoryDeadLetterStore::new());

    match cli.command {
        Command::Agent { name } => {
            let handle = orchestrator.run_agent(&name, store, dead_letters, echo_handler()).await?;
            tracing::info!(agent = %name, "agent running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            handle.stop().await;
        }
        Command::Group { group_id } => {
            let known_agents = known_agent_names(&cli.base_dir);
            let loader = DeploymentLoader::new(&cli.base_dir, &known_agents);
            let handles = orchestrator
                .run_deployment_group(&loader, &group_id, store, dead_letters, |_agent_id| echo_handler())
                .await?;
            tracing::info!(group = %group_id, agents = handles.len(), "deployment group running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            for handle in handles {
                handle.stop().await;
            }
        }
    }

    Ok(())
}

/// Scans `<base_dir>/configs/agents/*.json` for agent ids, standing in for
/// the original's `ConfigLoader.list_configs()` directory scan.
fn known_agent_names(base_dir: &std::path::Path) -> Vec<String> {
    let agents_dir = base_dir.join("configs/agents");
    let Ok(entries) = std::fs::read_dir(&agents_dir) else {
        tracing::warn!(dir = %agents_dir.display(), "no agent configs directory found");
        return Vec::new();
    };

    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().and_then(std::ffi::OsStr::to_str) == Some("json"))
        .filter_map(|entry| entry.path().file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect()
}

/// Placeholder handler that echoes the mention back; real reasoning is
/// supplied by the caller embedding this crate, not by the pipeline core.
fn echo_handler() -> Handler {
    Arc::new(|input: HandlerInput| {
        Box::pin(async move { Ok(format!("received: {}", input.content)) })
    })
}
