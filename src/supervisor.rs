//! Session Supervisor (C5): owns a named set of MCP transports per agent,
//! connects/reconnects them, and wraps every remote operation in the
//! retry-with-backoff contract (`spec.md` §4.4), grounded on
//! `mcp_manager.py::MCPServerManager`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::{AgentConfig, McpServerConfig};
use crate::error::McpError;
use crate::heartbeat::HeartbeatDriver;
use crate::liveness::LivenessRegistry;
use crate::mcp::stdio::StdioSession;
use crate::mcp::McpTransport;
use crate::metric;

/// The well-known primary messaging server name (`spec.md` §4.4
/// `get_primary_session`).
pub const PRIMARY_SERVER_NAME: &str = "ax-gcp";

/// Builds a transport for a named server from its config. Production code
/// uses `stdio_transport_factory`; tests inject a factory that returns
/// `FakeTransport`s instead of spawning real child processes.
pub type TransportFactory =
    Arc<dyn Fn(&str, &McpServerConfig) -> Result<Box<dyn McpTransport>, McpError> + Send + Sync>;

/// The default factory: spawns a real stdio child process per server.
pub fn stdio_transport_factory() -> TransportFactory {
    Arc::new(|name, config| StdioSession::spawn(name, config).map(|s| Box::new(s) as Box<dyn McpTransport>))
}

struct ServerState {
    config: McpServerConfig,
    session: Option<Arc<Mutex<dyn McpTransport>>>,
    reconnect_attempts: u32,
    last_error: Option<String>,
    tool_count: usize,
}

/// Tunable policy knobs, mirroring `MCPServerManager.__init__`'s
/// `operation_timeout`/`max_operation_retries`/`reconnect_backoff`/
/// `heartbeat_interval` parameters.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorPolicy {
    pub operation_timeout: Duration,
    pub max_operation_retries: u32,
    pub reconnect_backoff: f64,
    pub heartbeat_interval: Duration,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            max_operation_retries: 3,
            reconnect_backoff: 2.0,
            heartbeat_interval: Duration::from_secs(240),
        }
    }
}

pub struct SessionSupervisor {
    agent_name: String,
    policy: SupervisorPolicy,
    factory: TransportFactory,
    states: Mutex<HashMap<String, ServerState>>,
    insertion_order: Mutex<Vec<String>>,
    heartbeats: Arc<HeartbeatDriver>,
    liveness: Arc<LivenessRegistry>,
}

impl SessionSupervisor {
    pub fn new(agent_name: impl Into<String>, policy: SupervisorPolicy, factory: TransportFactory) -> Self {
        Self {
            agent_name: agent_name.into(),
            policy,
            factory,
            states: Mutex::new(HashMap::new()),
            insertion_order: Mutex::new(Vec::new()),
            heartbeats: Arc::new(HeartbeatDriver::new()),
            liveness: Arc::new(LivenessRegistry::new("mcp")),
        }
    }

    pub fn liveness(&self) -> Arc<LivenessRegistry> {
        self.liveness.clone()
    }

    /// Connects every server named in `config.mcp_servers`. A failed
    /// connect is non-fatal — the server stays in the table for later
    /// on-demand reconnect via `execute_with_retry` (`spec.md` §4.4).
    pub async fn connect_all(&self, config: &AgentConfig) {
        for (name, server_config) in &config.mcp_servers {
            {
                let mut states = self.states.lock().await;
                states.insert(
                    name.clone(),
                    ServerState {
                        config: server_config.clone(),
                        session: None,
                        reconnect_attempts: 0,
                        last_error: None,
                        tool_count: 0,
                    },
                );
            }
            self.insertion_order.lock().await.push(name.clone());
            let connected = self.connect_single(name).await;
            tracing::info!(server = %name, connected, "mcp server connect attempt");
        }
    }

    async fn connect_single(&self, name: &str) -> bool {
        let config = {
            let states = self.states.lock().await;
            match states.get(name) {
                Some(state) => state.config.clone(),
                None => return false,
            }
        };

        match self.try_connect(name, &config).await {
            Ok((session, tool_count)) => {
                let mut states = self.states.lock().await;
                if let Some(state) = states.get_mut(name) {
                    state.session = Some(session);
                    state.last_error = None;
                    state.reconnect_attempts = 0;
                    state.tool_count = tool_count;
                }
                drop(states);
                self.maybe_start_heartbeat(name, &config).await;
                self.liveness.beat(name).await;
                metric!("mcp_connected", "server" => name, "tool_count" => tool_count);
                true
            }
            Err(e) => {
                let mut states = self.states.lock().await;
                if let Some(state) = states.get_mut(name) {
                    state.last_error = Some(e.to_string());
                }
                metric!("mcp_connection_failed", "server" => name, "error" => e.to_string());
                tracing::error!(server = %name, error = %e, "failed to connect to mcp server");
                false
            }
        }
    }

    async fn try_connect(
        &self,
        name: &str,
        config: &McpServerConfig,
    ) -> Result<(Arc<Mutex<dyn McpTransport>>, usize), McpError> {
        let mut transport = (self.factory)(name, config)?;

        tokio::time::timeout(self.policy.operation_timeout, transport.initialize())
            .await
            .map_err(|_| McpError::OperationTimeout {
                op: "initialize".to_string(),
                timeout_secs: self.policy.operation_timeout.as_secs(),
            })??;

        let tools = tokio::time::timeout(self.policy.operation_timeout, transport.list_tools())
            .await
            .map_err(|_| McpError::OperationTimeout {
                op: "list_tools".to_string(),
                timeout_secs: self.policy.operation_timeout.as_secs(),
            })??;

        self.liveness
            .register(name, heartbeat_liveness_timeout(self.policy.heartbeat_interval))
            .await;

        Ok((Arc::new(Mutex::new(transport)), tools.len()))
    }

    /// Heuristic from `_maybe_start_heartbeat`: only "remote" servers need
    /// a keep-alive ping against idle eviction.
    async fn maybe_start_heartbeat(&self, name: &str, config: &McpServerConfig) {
        let requires_heartbeat = name.starts_with("ax-") || config.args.iter().any(|a| a.contains("mcp-remote"));
        if !requires_heartbeat {
            tracing::debug!(server = %name, "skipping heartbeat for local server");
            return;
        }
        let session = {
            let states = self.states.lock().await;
            states.get(name).and_then(|s| s.session.clone())
        };
        let Some(session) = session else { return };
        self.heartbeats
            .start(
                format!("{}/{}", self.agent_name, name),
                Arc::downgrade(&session),
                self.policy.heartbeat_interval,
                self.liveness.clone(),
            )
            .await;
        tracing::info!(server = %name, "started heartbeat for remote server");
    }

    /// Stops every heartbeat and tears down sessions in reverse
    /// acquisition order. Safe to call more than once.
    pub async fn disconnect_all(&self) {
        self.heartbeats.stop_all().await;

        let order: Vec<String> = {
            let mut order = self.insertion_order.lock().await;
            std::mem::take(&mut *order)
        };
        for name in order.into_iter().rev() {
            let session = {
                let mut states = self.states.lock().await;
                states.remove(&name).and_then(|s| s.session)
            };
            if let Some(session) = session {
                session.lock().await.close().await;
            }
        }
    }

    pub async fn get_session(&self, name: &str) -> Option<Arc<Mutex<dyn McpTransport>>> {
        self.states.lock().await.get(name).and_then(|s| s.session.clone())
    }

    /// Resolves the server name `get_primary_session` would use, for
    /// callers (the pipeline) that need to route `execute_with_retry`
    /// calls by name rather than holding a session directly.
    pub async fn primary_name(&self) -> Result<String, McpError> {
        let states = self.states.lock().await;
        if states.contains_key(PRIMARY_SERVER_NAME) {
            return Ok(PRIMARY_SERVER_NAME.to_string());
        }
        states.keys().next().cloned().ok_or(McpError::NoSessionsAvailable)
    }

    /// Prefers `ax-gcp`; else any connected session; fails when none exist.
    pub async fn get_primary_session(&self) -> Result<Arc<Mutex<dyn McpTransport>>, McpError> {
        let states = self.states.lock().await;
        if let Some(session) = states.get(PRIMARY_SERVER_NAME).and_then(|s| s.session.clone()) {
            return Ok(session);
        }
        states
            .values()
            .find_map(|s| s.session.clone())
            .ok_or(McpError::NoSessionsAvailable)
    }

    /// Returns the existing session for `name`, connecting lazily with an
    /// exponential reconnect schedule if absent (`spec.md` §4.4
    /// `ensure_session`).
    async fn ensure_session(&self, name: &str) -> Result<Arc<Mutex<dyn McpTransport>>, McpError> {
        if let Some(session) = self.get_session(name).await {
            return Ok(session);
        }
        if !self.states.lock().await.contains_key(name) {
            return Err(McpError::UnknownServer(name.to_string()));
        }

        for attempt in 1..=self.policy.max_operation_retries {
            let backoff = self.policy.reconnect_backoff * 2f64.powi(attempt as i32 - 1);
            tracing::warn!(server = %name, attempt, backoff, "reconnecting to mcp server");
            tokio::time::sleep(Duration::from_secs_f64(backoff)).await;

            {
                let mut states = self.states.lock().await;
                if let Some(state) = states.get_mut(name) {
                    state.reconnect_attempts = attempt;
                }
            }
            if self.connect_single(name).await {
                metric!("mcp_reconnected", "server" => name, "attempt" => attempt);
                if let Some(session) = self.get_session(name).await {
                    return Ok(session);
                }
            }
        }

        metric!("mcp_reconnect_failed", "server" => name, "attempts" => self.policy.max_operation_retries);
        Err(McpError::RetryExhausted {
            op: "reconnect".to_string(),
            server: name.to_string(),
            attempts: self.policy.max_operation_retries,
            source: anyhow::anyhow!("no successful reconnect attempt"),
        })
    }

    /// The central resilience primitive (`spec.md` §4.4 `execute_with_retry`).
    /// The per-attempt sleep is linear (`reconnect_backoff × attempt`) — the
    /// classifier's exponential ladder belongs to the pipeline's poller
    /// loop, not here (an intentional, documented mismatch).
    pub async fn execute_with_retry<T, F, Fut>(&self, name: &str, op_label: &str, op: F) -> Result<T, McpError>
    where
        F: Fn(Arc<Mutex<dyn McpTransport>>) -> Fut,
        Fut: Future<Output = Result<T, McpError>>,
    {
        let mut last_error: Option<McpError> = None;

        for attempt in 1..=self.policy.max_operation_retries {
            let session = match self.ensure_session(name).await {
                Ok(session) => session,
                Err(e) => {
                    self.liveness.miss(name).await;
                    last_error = Some(e);
                    tokio::time::sleep(Duration::from_secs_f64(self.policy.reconnect_backoff * attempt as f64)).await;
                    continue;
                }
            };

            match tokio::time::timeout(self.policy.operation_timeout, op(session)).await {
                Ok(Ok(result)) => {
                    self.liveness.beat(name).await;
                    if attempt > 1 {
                        metric!("mcp_retry_success", "server" => name, "op" => op_label, "attempt" => attempt);
                    }
                    return Ok(result);
                }
                Ok(Err(e)) => {
                    metric!("mcp_operation_failure", "server" => name, "op" => op_label, "attempt" => attempt, "error" => e.to_string());
                    self.liveness.miss(name).await;
                    self.evict(name).await;
                    last_error = Some(e);
                }
                Err(_elapsed) => {
                    metric!("mcp_operation_timeout", "server" => name, "op" => op_label, "attempt" => attempt);
                    self.liveness.miss(name).await;
                    last_error = Some(McpError::OperationTimeout {
                        op: op_label.to_string(),
                        timeout_secs: self.policy.operation_timeout.as_secs(),
                    });
                }
            }
            tokio::time::sleep(Duration::from_secs_f64(self.policy.reconnect_backoff * attempt as f64)).await;
        }

        self.liveness.mark_dead(name).await;
        Err(McpError::RetryExhausted {
            op: op_label.to_string(),
            server: name.to_string(),
            attempts: self.policy.max_operation_retries,
            source: last_error
                .map(|e| anyhow::anyhow!(e.to_string()))
                .unwrap_or_else(|| anyhow::anyhow!("unknown error")),
        })
    }

    /// Forces eviction of a session that just failed an operation so the
    /// next `ensure_session` call reconnects from scratch (`spec.md` §4.4
    /// step 5 "force session eviction and close").
    async fn evict(&self, name: &str) {
        let session = {
            let mut states = self.states.lock().await;
            states.get_mut(name).and_then(|s| s.session.take())
        };
        if let Some(session) = session {
            session.lock().await.close().await;
        }
    }

    /// Convenience wrapper for `messages`-tool invocations via the retry
    /// primitive.
    pub async fn call_tool(&self, name: &str, tool: &str, arguments: serde_json::Value) -> Result<serde_json::Value, McpError> {
        let op_label = format!("call_tool:{tool}");
        let tool = tool.to_string();
        self.execute_with_retry(name, &op_label, move |session| {
            let tool = tool.clone();
            let arguments = arguments.clone();
            async move { session.lock().await.call_tool(&tool, arguments).await }
        })
        .await
    }
}

fn heartbeat_liveness_timeout(heartbeat_interval: Duration) -> Duration {
    if heartbeat_interval.is_zero() {
        Duration::from_secs(300)
    } else {
        heartbeat_interval * 3
    }
}
