//! Orchestrator (C9): per-agent lifecycle (load config, build supervisor,
//! build pipeline, run) plus deployment-group-driven multi-agent launch
//! (`spec.md` §2 control flow; `SPEC_FULL.md` §11-§12).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{AgentConfig, DeploymentLoader};
use crate::error::{ConfigError, PipelineError};
use crate::pipeline::{Handler, Pipeline, PipelineConfig};
use crate::store::{DeadLetterStore, MessageStore};
use crate::supervisor::{SessionSupervisor, SupervisorPolicy, TransportFactory};

/// Pipeline tunables shared by every agent the orchestrator launches, save
/// for the fields that are genuinely per-agent (name, server).
#[derive(Debug, Clone)]
pub struct PipelineDefaults {
    pub mark_read: bool,
    pub startup_sweep: bool,
    pub startup_sweep_limit: u32,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub kill_switch_path: PathBuf,
}

impl Default for PipelineDefaults {
    fn default() -> Self {
        Self {
            mark_read: true,
            startup_sweep: true,
            startup_sweep_limit: 0,
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(240),
            kill_switch_path: PathBuf::from("data/KILL_SWITCH"),
        }
    }
}

/// A running agent: its supervisor, pipeline, and the handle needed to
/// stop it cleanly.
pub struct AgentHandle {
    pub name: String,
    pub supervisor: Arc<SessionSupervisor>,
    pub pipeline: Arc<Pipeline>,
    cancel_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl AgentHandle {
    /// Signals the pipeline to stop, awaits its shutdown, then tears down
    /// the supervisor's sessions.
    pub async fn stop(self) {
        let _ = self.cancel_tx.send(true);
        let _ = self.join.await;
        self.supervisor.disconnect_all().await;
    }
}

pub struct Orchestrator {
    base_dir: PathBuf,
    policy: SupervisorPolicy,
    transport_factory: TransportFactory,
    pipeline_defaults: PipelineDefaults,
}

impl Orchestrator {
    pub fn new(base_dir: impl Into<PathBuf>, policy: SupervisorPolicy, transport_factory: TransportFactory, pipeline_defaults: PipelineDefaults) -> Self {
        Self {
            base_dir: base_dir.into(),
            policy,
            transport_factory,
            pipeline_defaults,
        }
    }

    fn agent_config_path(&self, agent_name: &str) -> PathBuf {
        self.base_dir.join("configs/agents").join(format!("{agent_name}.json"))
    }

    /// Loads config, connects sessions, builds and starts the pipeline for
    /// one agent. The returned handle owns the running background task.
    pub async fn run_agent(
        &self,
        agent_name: &str,
        store: Arc<dyn MessageStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        handler: Handler,
    ) -> Result<AgentHandle, PipelineError> {
        let config_path = self.agent_config_path(agent_name);
        let config = AgentConfig::load(&config_path)?;

        let supervisor = Arc::new(SessionSupervisor::new(agent_name, self.policy, self.transport_factory.clone()));
        supervisor.connect_all(&config).await;
        let server_name = supervisor
            .primary_name()
            .await
            .map_err(PipelineError::Mcp)?;

        let pipeline_config = PipelineConfig {
            agent_name: agent_name.to_string(),
            server_name,
            mark_read: self.pipeline_defaults.mark_read,
            startup_sweep: self.pipeline_defaults.startup_sweep,
            startup_sweep_limit: self.pipeline_defaults.startup_sweep_limit,
            poll_interval: self.pipeline_defaults.poll_interval,
            heartbeat_interval: self.pipeline_defaults.heartbeat_interval,
            kill_switch_path: self.pipeline_defaults.kill_switch_path.clone(),
        };

        let pipeline = Arc::new(Pipeline::new(pipeline_config, supervisor.clone(), store, dead_letters, handler));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let join = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.run(cancel_rx).await })
        };

        Ok(AgentHandle {
            name: agent_name.to_string(),
            supervisor,
            pipeline,
            cancel_tx,
            join,
        })
    }

    /// Expands a deployment group into one running agent per valid member,
    /// honoring each agent's `start_delay_ms` stagger and skipping (with a
    /// logged error) any agent whose own config fails to load — one bad
    /// agent in a group must not prevent the rest from starting.
    pub async fn run_deployment_group(
        &self,
        loader: &DeploymentLoader,
        group_id: &str,
        store: Arc<dyn MessageStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        mut handler_for: impl FnMut(&str) -> Handler,
    ) -> Result<Vec<AgentHandle>, ConfigError> {
        let group = loader
            .get_group(group_id)
            .ok_or_else(|| ConfigError::MissingAgentsList(group_id.to_string()))?;

        let mut handles = Vec::with_capacity(group.agents.len());
        for agent in &group.agents {
            if let Some(delay_ms) = agent.start_delay_ms {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            let handler = handler_for(&agent.id);
            match self.run_agent(&agent.id, store.clone(), dead_letters.clone(), handler).await {
                Ok(handle) => handles.push(handle),
                Err(e) => tracing::error!(agent = %agent.id, group = %group_id, error = %e, "failed to start agent in deployment group"),
            }
        }
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::fake::FakeTransport;
    use crate::mcp::McpTransport;
    use crate::store::{InMemoryDeadLetterStore, InMemoryMessageStore};

    fn write_agent_config(dir: &std::path::Path, agent_name: &str) {
        let path = dir.join("configs/agents").join(format!("{agent_name}.json"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"mcpServers": {"ax-gcp": {"args": ["mcp-remote", "https://example.test"]}}}"#).unwrap();
    }

    #[tokio::test]
    async fn run_agent_fails_cleanly_when_config_missing() {
        let dir = tempfile::tempdir().unwrap();
        let factory: TransportFactory = Arc::new(|_n, _c| Ok(Box::new(FakeTransport::new()) as Box<dyn McpTransport>));
        let orchestrator = Orchestrator::new(dir.path(), SupervisorPolicy::default(), factory, PipelineDefaults::default());

        let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
        let dead_letters: Arc<dyn DeadLetterStore> = Arc::new(InMemoryDeadLetterStore::new());
        let handler: Handler = Arc::new(|_input| Box::pin(async move { Ok(String::new()) }));

        let err = orchestrator.run_agent("ghost", store, dead_letters, handler).await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::NotFound(_))));
    }

    #[tokio::test]
    async fn run_agent_starts_and_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        write_agent_config(dir.path(), "agent-a");
        let factory: TransportFactory = Arc::new(|_n, _c| Ok(Box::new(FakeTransport::new()) as Box<dyn McpTransport>));
        let mut defaults = PipelineDefaults::default();
        defaults.startup_sweep = false;
        defaults.heartbeat_interval = Duration::ZERO;
        defaults.poll_interval = Duration::from_millis(5);
        let orchestrator = Orchestrator::new(dir.path(), SupervisorPolicy::default(), factory, defaults);

        let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
        let dead_letters: Arc<dyn DeadLetterStore> = Arc::new(InMemoryDeadLetterStore::new());
        let handler: Handler = Arc::new(|_input| Box::pin(async move { Ok(String::new()) }));

        let handle = orchestrator.run_agent("agent-a", store, dead_letters, handler).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.pipeline.is_running());
        handle.stop().await;
    }
}
