//! Periodic keep-alive pings for sessions that would otherwise be reaped
//! by remote idle timeouts (`spec.md` §4.2).
//!
//! Grounded on `mcp_heartbeat.keep_alive`/`HeartbeatManager` (referenced but
//! not included in the retrieved source set) and on `queue_manager.py`'s
//! `heartbeat()` task, which simply delegates to the shared keep-alive
//! utility. The driver does not reconnect on failure — that's the
//! supervisor's job (§4.2) — it only ticks the liveness registry.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::liveness::LivenessRegistry;
use crate::mcp::McpTransport;
use crate::metric;

/// A running heartbeat task's cancellation handle.
pub struct HeartbeatHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Signals cooperative cancellation and awaits clean exit. The current
    /// ping in flight (bounded by the caller's own timeout) is allowed to
    /// complete before the loop exits (`spec.md` §5 "Cancellation").
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.join.await;
    }
}

/// Launches and tracks heartbeat tasks for named sessions.
#[derive(Default)]
pub struct HeartbeatDriver {
    handles: Mutex<HashMap<String, HeartbeatHandle>>,
}

impl HeartbeatDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a ping loop for `name` against `session` every `interval`.
    /// `interval == 0` disables the driver and returns immediately without
    /// starting a task (`spec.md` §4.2).
    pub async fn start(
        &self,
        name: String,
        session: Weak<Mutex<dyn McpTransport>>,
        interval: Duration,
        liveness: Arc<LivenessRegistry>,
    ) {
        if interval.is_zero() {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task_name = name.clone();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(session) = session.upgrade() else {
                            // The owning session was dropped; nothing left to ping.
                            break;
                        };
                        let result = {
                            let mut guard = session.lock().await;
                            guard.ping().await
                        };
                        match result {
                            Ok(()) => liveness.beat(&task_name).await,
                            Err(e) => {
                                liveness.miss(&task_name).await;
                                tracing::warn!(name = %task_name, error = %e, "heartbeat ping failed");
                            }
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        let mut handles = self.handles.lock().await;
        handles.insert(name, HeartbeatHandle { stop_tx, join });
    }

    /// Stops a single named heartbeat, if running.
    pub async fn stop(&self, name: &str) {
        let handle = self.handles.lock().await.remove(name);
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// Stops every running heartbeat and awaits clean exit of each.
    pub async fn stop_all(&self) {
        let handles: Vec<_> = {
            let mut map = self.handles.lock().await;
            map.drain().collect()
        };
        for (name, handle) in handles {
            metric!("mcp_heartbeat_stopped", "name" => name);
            handle.stop().await;
        }
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.handles.lock().await.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::fake::FakeTransport;

    #[tokio::test]
    async fn zero_interval_starts_no_task() {
        let driver = HeartbeatDriver::new();
        let transport: Arc<Mutex<dyn McpTransport>> = Arc::new(Mutex::new(FakeTransport::new()));
        let liveness = Arc::new(LivenessRegistry::new("mcp"));
        liveness.register("ax-gcp", Duration::from_secs(60)).await;

        driver
            .start(
                "ax-gcp".to_string(),
                Arc::downgrade(&transport),
                Duration::ZERO,
                liveness,
            )
            .await;

        assert!(!driver.is_running("ax-gcp").await);
    }

    #[tokio::test]
    async fn successful_pings_keep_liveness_alive() {
        let driver = HeartbeatDriver::new();
        let transport: Arc<Mutex<dyn McpTransport>> = Arc::new(Mutex::new(FakeTransport::new()));
        let liveness = Arc::new(LivenessRegistry::new("mcp"));
        liveness.register("ax-gcp", Duration::from_millis(500)).await;

        driver
            .start(
                "ax-gcp".to_string(),
                Arc::downgrade(&transport),
                Duration::from_millis(20),
                liveness.clone(),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(liveness.is_alive("ax-gcp").await);
        driver.stop("ax-gcp").await;
    }

    #[tokio::test]
    async fn failed_pings_record_misses_without_reconnecting() {
        let driver = HeartbeatDriver::new();
        let mut fake = FakeTransport::new();
        fake.fail_next_pings(100);
        let transport: Arc<Mutex<dyn McpTransport>> = Arc::new(Mutex::new(fake));
        let liveness = Arc::new(LivenessRegistry::new("mcp"));
        liveness.register("ax-gcp", Duration::from_millis(500)).await;

        driver
            .start(
                "ax-gcp".to_string(),
                Arc::downgrade(&transport),
                Duration::from_millis(15),
                liveness.clone(),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(70)).await;
        let summary = liveness.summary().await;
        let row = summary.iter().find(|r| r.name == "ax-gcp").unwrap();
        assert!(row.consecutive_misses >= 2);
        driver.stop("ax-gcp").await;
    }

    #[tokio::test]
    async fn stop_all_is_idempotent() {
        let driver = HeartbeatDriver::new();
        driver.stop_all().await;
        driver.stop_all().await;
    }
}
