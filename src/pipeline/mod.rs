//! Inbound Pipeline (C8): startup sweep, poller, processor, and heartbeat
//! for one agent's mention traffic, grounded on `queue_manager.py::QueueManager`.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::error_classifier::BackoffState;
use crate::heartbeat::HeartbeatDriver;
use crate::mention;
use crate::store::{DeadLetterStore, MessageStore, QueuedMessage, SortOrder};
use crate::supervisor::SessionSupervisor;

/// Handler future type: the user-supplied mention handler turns a batch
/// context into a reply, or fails (`spec.md` §7 `HandlerFailed`).
pub type HandlerFuture = Pin<Box<dyn std::future::Future<Output = anyhow::Result<String>> + Send>>;
pub type Handler = Arc<dyn Fn(HandlerInput) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct QueueMessageSnapshot {
    pub id: String,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&QueuedMessage> for QueueMessageSnapshot {
    fn from(msg: &QueuedMessage) -> Self {
        Self {
            id: msg.id.clone(),
            sender: msg.sender.clone(),
            content: msg.content.clone(),
            timestamp: msg.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub backlog_count: u64,
    pub pending_messages: Vec<QueueMessageSnapshot>,
}

/// Handler input context (`spec.md` §4.6.3 step 6).
#[derive(Debug, Clone, Serialize)]
pub struct HandlerInput {
    pub content: String,
    pub sender: String,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub batch_mode: bool,
    pub batch_size: Option<usize>,
    pub history_messages: Option<Vec<QueueMessageSnapshot>>,
    pub queue_status: QueueStatus,
    pub queue_messages: Vec<QueueMessageSnapshot>,
}

/// Tunables mirroring `QueueManager.__init__`'s `mark_read`/`startup_sweep`/
/// `startup_sweep_limit`/`poll_interval`/`heartbeat_interval` parameters.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub agent_name: String,
    /// Which connected server name to poll/send `messages` calls against
    /// (normally `supervisor.primary_name()`).
    pub server_name: String,
    pub mark_read: bool,
    pub startup_sweep: bool,
    /// 0 = unlimited (still bounded by the 200-iteration safety cap).
    pub startup_sweep_limit: u32,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub kill_switch_path: PathBuf,
}

pub struct Pipeline {
    config: PipelineConfig,
    supervisor: Arc<SessionSupervisor>,
    store: Arc<dyn MessageStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    handler: Handler,
    heartbeat_driver: HeartbeatDriver,
    running: AtomicBool,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        supervisor: Arc<SessionSupervisor>,
        store: Arc<dyn MessageStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        handler: Handler,
    ) -> Self {
        Self {
            config,
            supervisor,
            store,
            dead_letters,
            handler,
            heartbeat_driver: HeartbeatDriver::new(),
            running: AtomicBool::new(false),
        }
    }

    async fn call_messages_tool(&self, params: Value) -> Result<Value, crate::error::McpError> {
        self.supervisor.call_tool(&self.config.server_name, "messages", params).await
    }

    /// Catches up on unread messages before steady-state polling begins
    /// (`spec.md` §4.6.1).
    async fn startup_sweep(&self) {
        if !self.config.startup_sweep {
            tracing::info!("startup sweep disabled, starting poller");
            return;
        }
        tracing::info!(limit = self.config.startup_sweep_limit, "starting unread message sweep");

        const MAX_ITERATIONS: u32 = 200;
        let mut fetched = 0u32;

        for iteration in 0..MAX_ITERATIONS {
            if self.config.startup_sweep_limit > 0 && fetched >= self.config.startup_sweep_limit {
                tracing::info!(fetched, "sweep limit reached");
                break;
            }

            let params = json!({
                "action": "check",
                "filter_agent": self.config.agent_name,
                "mode": "unread",
                "wait": false,
                "limit": 1,
                "mark_read": true,
            });

            let result = match self.call_messages_tool(params).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, "startup sweep error, continuing with normal polling");
                    break;
                }
            };

            let Some(parsed) = mention::parse_messages_result(&result, &self.config.agent_name) else {
                tracing::info!(fetched, "sweep complete");
                break;
            };

            if self
                .store
                .store_message(&parsed.id, &self.config.agent_name, &parsed.sender, &parsed.content)
                .await
            {
                fetched += 1;
            }

            if iteration + 1 == MAX_ITERATIONS {
                tracing::warn!(MAX_ITERATIONS, "hit max iterations during startup sweep");
            }

            // Stay under the remote service's ~100 req/min rate ceiling.
            tokio::time::sleep(Duration::from_millis(700)).await;
        }
    }

    async fn poller_loop(&self, cancel: &mut watch::Receiver<bool>) {
        tracing::info!("poller task started");
        let mut backoff = BackoffState::new();

        loop {
            if *cancel.borrow() {
                break;
            }

            if self.store.is_agent_paused(&self.config.agent_name).await {
                self.store.check_auto_resume(&self.config.agent_name).await;
                if sleep_or_cancel(Duration::from_secs(1), cancel).await {
                    break;
                }
                continue;
            }

            let params = json!({
                "action": "check",
                "filter_agent": self.config.agent_name,
                "wait": false,
                "mark_read": self.config.mark_read,
            });

            match self.call_messages_tool(params).await {
                Ok(result) => {
                    backoff.reset();
                    match mention::parse_messages_result(&result, &self.config.agent_name) {
                        Some(parsed) => {
                            let stored = self
                                .store
                                .store_message(&parsed.id, &self.config.agent_name, &parsed.sender, &parsed.content)
                                .await;
                            if stored {
                                let backlog = self.store.get_backlog_count(&self.config.agent_name).await;
                                tracing::info!(id = %parsed.id, sender = %parsed.sender, backlog, "stored message");
                            } else {
                                tracing::warn!(id = %parsed.id, "duplicate message, already stored");
                            }
                        }
                        None => {
                            if sleep_or_cancel(Duration::from_secs(5), cancel).await {
                                break;
                            }
                            continue;
                        }
                    }
                }
                Err(e) => {
                    let classified = crate::error_classifier::classify(&e.to_string(), &mut backoff);
                    tracing::warn!(kind = ?classified.kind, wait_secs = classified.wait.as_secs(), error = %e, "poll failed");
                    if sleep_or_cancel(classified.wait, cancel).await {
                        break;
                    }
                }
            }
        }
        tracing::info!("poller task stopped");
    }

    async fn processor_loop(&self, cancel: &mut watch::Receiver<bool>) {
        tracing::info!("processor task started");

        loop {
            if *cancel.borrow() {
                break;
            }

            if self.config.kill_switch_path.exists() {
                tracing::warn!("kill switch active, processing paused");
                if sleep_or_cancel(Duration::from_secs(5), cancel).await {
                    break;
                }
                continue;
            }

            if self.store.is_agent_paused(&self.config.agent_name).await {
                if self.store.check_auto_resume(&self.config.agent_name).await {
                    tracing::info!("agent auto-resumed");
                } else {
                    if sleep_or_cancel(Duration::from_secs(5), cancel).await {
                        break;
                    }
                    continue;
                }
            }

            let backlog = self.store.get_backlog_count(&self.config.agent_name).await;
            let order = if backlog > 100 { SortOrder::Asc } else { SortOrder::Desc };
            if backlog > 100 {
                tracing::info!(backlog, "high backlog, switching to FIFO to drain");
            }

            let pending = self.store.get_pending_messages(&self.config.agent_name, 100, order).await;
            if pending.is_empty() {
                if sleep_or_cancel(self.config.poll_interval, cancel).await {
                    break;
                }
                continue;
            }

            self.process_batch(pending, backlog, order).await;
        }
        tracing::info!("processor task stopped");
    }

    async fn process_batch(&self, pending: Vec<QueuedMessage>, backlog: u64, order: SortOrder) {
        let batch_size = pending.len();
        let snapshot: Vec<QueueMessageSnapshot> = pending.iter().map(QueueMessageSnapshot::from).collect();

        if batch_size > 1 {
            tracing::info!(batch_size, backlog, "batch mode processing");
        } else {
            tracing::info!(id = %pending[0].id, sender = %pending[0].sender, backlog, "single mode processing");
        }

        for msg in &pending {
            self.store.mark_processing_started(&msg.id, &self.config.agent_name).await;
        }

        let queue_status = QueueStatus {
            backlog_count: backlog,
            pending_messages: snapshot.clone(),
        };

        let input = if batch_size > 1 {
            let current = &pending[0];
            let mut history: Vec<QueueMessageSnapshot> = pending[1..].iter().map(QueueMessageSnapshot::from).collect();
            // Both orderings fetch with "current" first; history must always
            // read oldest-to-newest regardless of fetch order (`spec.md`
            // §4.6.3 step 6).
            if matches!(order, SortOrder::Desc) {
                history.reverse();
            }
            HandlerInput {
                content: current.content.clone(),
                sender: current.sender.clone(),
                id: current.id.clone(),
                timestamp: current.timestamp,
                batch_mode: true,
                batch_size: Some(batch_size),
                history_messages: Some(history),
                queue_status,
                queue_messages: snapshot,
            }
        } else {
            let msg = &pending[0];
            HandlerInput {
                content: msg.content.clone(),
                sender: msg.sender.clone(),
                id: msg.id.clone(),
                timestamp: msg.timestamp,
                batch_mode: false,
                batch_size: None,
                history_messages: None,
                queue_status,
                queue_messages: snapshot,
            }
        };

        let reply_to_id = pending[0].id.clone();
        let outcome = (self.handler)(input).await;

        match outcome {
            Ok(response) if !response.trim().is_empty() => {
                let send_result = self
                    .call_messages_tool(json!({
                        "action": "send",
                        "content": response,
                        "parent_message_id": reply_to_id,
                    }))
                    .await;
                match send_result {
                    Ok(_) => {
                        for msg in &pending {
                            self.store.mark_processed(&msg.id, &self.config.agent_name).await;
                        }
                        tracing::info!(batch_size, "completed with threaded reply");
                    }
                    Err(e) => self.dead_letter_batch(&pending, &e.to_string()).await,
                }
            }
            Ok(_) => {
                for msg in &pending {
                    self.store.mark_processed(&msg.id, &self.config.agent_name).await;
                }
                tracing::info!(batch_size, "handler suppressed response");
            }
            Err(e) => self.dead_letter_batch(&pending, &e.to_string()).await,
        }
    }

    async fn dead_letter_batch(&self, pending: &[QueuedMessage], error: &str) {
        tracing::error!(batch_size = pending.len(), error, "handler/send failed, dead-lettering batch");
        for msg in pending {
            self.store.mark_failed(&msg.id, &self.config.agent_name).await;
            self.dead_letters
                .record(&msg.id, &self.config.agent_name, &msg.content, error)
                .await;
        }
    }

    /// Starts the poller, processor, and (if enabled) heartbeat, runs until
    /// `cancel` fires or an unrecoverable task error occurs, then prints
    /// final stats (`spec.md` §4.6.5).
    pub async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        self.running.store(true, Ordering::SeqCst);

        let stats = self.store.get_stats(&self.config.agent_name).await;
        tracing::info!(pending = stats.pending, completed = stats.completed, "initial queue stats");

        self.startup_sweep().await;

        let heartbeat_name = format!("{}/pipeline", self.config.agent_name);
        if !self.config.heartbeat_interval.is_zero() {
            if let Ok(session) = self.supervisor.get_primary_session().await {
                let liveness = self.supervisor.liveness();
                liveness
                    .register(&heartbeat_name, self.config.heartbeat_interval * 3)
                    .await;
                self.heartbeat_driver
                    .start(
                        heartbeat_name.clone(),
                        Arc::downgrade(&session),
                        self.config.heartbeat_interval,
                        liveness,
                    )
                    .await;
            }
        }

        let mut poller_cancel = cancel.clone();
        let mut processor_cancel = cancel.clone();
        let poller_self = self.clone();
        let processor_self = self.clone();
        let mut poller_handle = tokio::spawn(async move { poller_self.poller_loop(&mut poller_cancel).await });
        let mut processor_handle = tokio::spawn(async move { processor_self.processor_loop(&mut processor_cancel).await });

        tokio::select! {
            _ = cancel.changed() => {}
            _ = &mut poller_handle => {}
            _ = &mut processor_handle => {}
        }

        self.running.store(false, Ordering::SeqCst);
        poller_handle.abort();
        processor_handle.abort();
        self.heartbeat_driver.stop(&heartbeat_name).await;

        let stats = self.store.get_stats(&self.config.agent_name).await;
        tracing::info!(
            pending = stats.pending,
            completed = stats.completed,
            avg_processing_time = stats.avg_processing_time,
            "final queue stats"
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn cleanup_old_messages(&self, days: i64) -> u64 {
        let count = self.store.cleanup_old_messages(days).await;
        tracing::info!(count, days, "cleaned up old messages");
        count
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        result = cancel.changed() => result.is_err() || *cancel.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, McpServerConfig};
    use crate::mcp::fake::FakeTransport;
    use crate::mcp::McpTransport;
    use crate::store::{InMemoryDeadLetterStore, InMemoryMessageStore};
    use crate::supervisor::{SupervisorPolicy, TransportFactory};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn config(agent: &str, server: &str, sweep: bool, poll_interval_ms: u64) -> PipelineConfig {
        PipelineConfig {
            agent_name: agent.to_string(),
            server_name: server.to_string(),
            mark_read: true,
            startup_sweep: sweep,
            startup_sweep_limit: 0,
            poll_interval: Duration::from_millis(poll_interval_ms),
            heartbeat_interval: Duration::ZERO,
            kill_switch_path: tempdir().unwrap().path().join("KILL_SWITCH"),
        }
    }

    async fn build_supervisor(factory: TransportFactory) -> Arc<SessionSupervisor> {
        let supervisor = Arc::new(SessionSupervisor::new("agent", SupervisorPolicy::default(), factory));
        let mut mcp_servers = HashMap::new();
        mcp_servers.insert(
            "ax-gcp".to_string(),
            McpServerConfig {
                command: "npx".to_string(),
                args: vec!["mcp-remote".to_string()],
                env: None,
            },
        );
        supervisor.connect_all(&AgentConfig { mcp_servers }).await;
        supervisor
    }

    #[tokio::test]
    async fn batch_reply_threads_to_freshest_message_and_marks_processed() {
        let factory: TransportFactory = Arc::new(|_name, _config| {
            let mut fake = FakeTransport::new();
            fake.push_ok(serde_json::json!({})); // send ack
            Ok(Box::new(fake) as Box<dyn McpTransport>)
        });
        let supervisor = build_supervisor(factory).await;
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
        let dead_letters: Arc<dyn DeadLetterStore> = Arc::new(InMemoryDeadLetterStore::new());

        store.store_message("m1", "agent", "bob", "first").await;
        store.store_message("m2", "agent", "bob", "second").await;

        let seen_batch_size = Arc::new(std::sync::Mutex::new(None));
        let seen_clone = seen_batch_size.clone();
        let handler: Handler = Arc::new(move |input: HandlerInput| {
            let seen_clone = seen_clone.clone();
            Box::pin(async move {
                *seen_clone.lock().unwrap() = input.batch_size;
                Ok("ack".to_string())
            })
        });

        let pipeline = Arc::new(Pipeline::new(
            config("agent", "ax-gcp", false, 10),
            supervisor.clone(),
            store.clone(),
            dead_letters,
            handler,
        ));

        let pending = store.get_pending_messages("agent", 100, SortOrder::Desc).await;
        pipeline.process_batch(pending, 2, SortOrder::Desc).await;

        assert_eq!(*seen_batch_size.lock().unwrap(), Some(2));
        assert_eq!(store.get_backlog_count("agent").await, 0);
        supervisor.disconnect_all().await;
    }

    #[tokio::test]
    async fn handler_failure_dead_letters_without_retry() {
        let factory: TransportFactory = Arc::new(|_name, _config| Ok(Box::new(FakeTransport::new()) as Box<dyn McpTransport>));
        let supervisor = build_supervisor(factory).await;
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());

        store.store_message("m1", "agent", "bob", "hello").await;

        let handler: Handler = Arc::new(|_input: HandlerInput| Box::pin(async move { Err(anyhow::anyhow!("handler exploded")) }));

        let pipeline = Pipeline::new(
            config("agent", "ax-gcp", false, 10),
            supervisor.clone(),
            store.clone(),
            dead_letters.clone() as Arc<dyn DeadLetterStore>,
            handler,
        );

        let pending = store.get_pending_messages("agent", 100, SortOrder::Desc).await;
        pipeline.process_batch(pending, 1, SortOrder::Desc).await;

        assert_eq!(store.get_backlog_count("agent").await, 0);
        let entries = dead_letters.list("agent").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "m1");
        supervisor.disconnect_all().await;
    }

    #[tokio::test]
    async fn empty_handler_response_skips_send_but_still_marks_processed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let factory: TransportFactory = Arc::new(move |_name, _config| {
            calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Box::new(FakeTransport::new()) as Box<dyn McpTransport>)
        });
        let supervisor = build_supervisor(factory).await;
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
        let dead_letters = Arc::new(InMemoryDeadLetterStore::new());

        store.store_message("m1", "agent", "bob", "hello").await;
        let handler: Handler = Arc::new(|_input: HandlerInput| Box::pin(async move { Ok(String::new()) }));

        let pipeline = Pipeline::new(
            config("agent", "ax-gcp", false, 10),
            supervisor.clone(),
            store.clone(),
            dead_letters as Arc<dyn DeadLetterStore>,
            handler,
        );

        let pending = store.get_pending_messages("agent", 100, SortOrder::Desc).await;
        pipeline.process_batch(pending, 1, SortOrder::Desc).await;

        assert_eq!(store.get_backlog_count("agent").await, 0);
        supervisor.disconnect_all().await;
    }
}
