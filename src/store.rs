//! The message store interface (`spec.md` §3 `QueuedMessage`, §6
//! `MessageStore`) plus an in-process reference implementation.
//!
//! The real store is an external collaborator (`spec.md` §1 Out of scope);
//! `InMemoryMessageStore` exists so the pipeline is runnable and testable
//! standalone, the way the teacher keeps a `test-support` feature
//! (`oj-core`, `oj-adapters`) with fake/in-memory stand-ins for its external
//! collaborators rather than mocking them inline at every call site.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// Status progression is monotone: `pending -> processing -> {processed,
/// failed}`, never backwards (`spec.md` §3, §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Processing => 1,
            MessageStatus::Processed => 2,
            MessageStatus::Failed => 2,
        }
    }

    /// Whether a transition from `self` to `next` is allowed under the
    /// monotone-progression invariant.
    fn can_advance_to(self, next: MessageStatus) -> bool {
        next.rank() >= self.rank() && !(self.rank() == 2 && next.rank() < 2)
    }
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: String,
    pub agent: String,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, Default)]
pub struct AgentStats {
    pub pending: u64,
    pub completed: u64,
    pub avg_processing_time: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AgentStatus {
    pub paused: bool,
    pub paused_reason: Option<String>,
    pub auto_resume_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// The durable message store interface (`spec.md` §6). Implementations
/// must be row-granular concurrent-safe: "mark processing" must act as an
/// exclusive claim (`spec.md` §5).
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Stores a new message; returns `false` (and leaves state untouched)
    /// if `id` already exists (`spec.md` §8 idempotence).
    async fn store_message(&self, id: &str, agent: &str, sender: &str, content: &str) -> bool;

    async fn get_pending_messages(&self, agent: &str, limit: usize, order: SortOrder) -> Vec<QueuedMessage>;

    async fn get_backlog_count(&self, agent: &str) -> u64;

    async fn mark_processing_started(&self, id: &str, agent: &str);

    async fn mark_processed(&self, id: &str, agent: &str);

    async fn mark_failed(&self, id: &str, agent: &str);

    async fn is_agent_paused(&self, agent: &str) -> bool;

    /// Checks whether a scheduled auto-resume has elapsed and, if so,
    /// clears the pause. Returns `true` if the agent was (or became)
    /// unpaused as a result of this call.
    async fn check_auto_resume(&self, agent: &str) -> bool;

    async fn get_agent_status(&self, agent: &str) -> AgentStatus;

    async fn get_stats(&self, agent: &str) -> AgentStats;

    /// Deletes processed/failed messages older than `days`; returns the
    /// count removed.
    async fn cleanup_old_messages(&self, days: i64) -> u64;
}

/// The dead-letter store resolving Open Question (a) in `spec.md` §9: a
/// handler/send failure no longer simply disappears into `processed` — it
/// is additionally recorded here for later inspection or replay.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn record(&self, id: &str, agent: &str, content: &str, error: &str);
    async fn list(&self, agent: &str) -> Vec<DeadLetter>;
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: String,
    pub agent: String,
    pub content: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

struct StoreRow {
    message: QueuedMessage,
    processing_started_at: Option<Instant>,
    processing_duration_secs: Option<f64>,
}

#[derive(Default)]
struct StoreState {
    rows: HashMap<String, StoreRow>,
    agent_status: HashMap<String, AgentStatus>,
}

/// In-memory reference implementation. One mutex guards the whole table,
/// matching `spec.md` §5's "row-level atomicity" via a single critical
/// section rather than per-row locks — adequate at this scale, as the
/// teacher's own in-memory stand-ins (`oj-core::test_support`) do.
#[derive(Default)]
pub struct InMemoryMessageStore {
    state: Mutex<StoreState>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/control hook: pauses an agent the way the external control
    /// channel does on a server-issued `stop` action (`spec.md` §3).
    pub async fn set_paused(&self, agent: &str, reason: Option<String>, auto_resume_at: Option<DateTime<Utc>>) {
        let mut state = self.state.lock().await;
        state.agent_status.insert(
            agent.to_string(),
            AgentStatus {
                paused: true,
                paused_reason: reason,
                auto_resume_at,
            },
        );
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn store_message(&self, id: &str, agent: &str, sender: &str, content: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.rows.contains_key(id) {
            return false;
        }
        state.rows.insert(
            id.to_string(),
            StoreRow {
                message: QueuedMessage {
                    id: id.to_string(),
                    agent: agent.to_string(),
                    sender: sender.to_string(),
                    content: content.to_string(),
                    timestamp: Utc::now(),
                    status: MessageStatus::Pending,
                },
                processing_started_at: None,
                processing_duration_secs: None,
            },
        );
        true
    }

    async fn get_pending_messages(&self, agent: &str, limit: usize, order: SortOrder) -> Vec<QueuedMessage> {
        let state = self.state.lock().await;
        let mut pending: Vec<QueuedMessage> = state
            .rows
            .values()
            .filter(|row| row.message.agent == agent && row.message.status == MessageStatus::Pending)
            .map(|row| row.message.clone())
            .collect();
        match order {
            SortOrder::Asc => pending.sort_by_key(|m| m.timestamp),
            SortOrder::Desc => pending.sort_by_key(|m| std::cmp::Reverse(m.timestamp)),
        }
        pending.truncate(limit);
        pending
    }

    async fn get_backlog_count(&self, agent: &str) -> u64 {
        let state = self.state.lock().await;
        state
            .rows
            .values()
            .filter(|row| row.message.agent == agent && row.message.status == MessageStatus::Pending)
            .count() as u64
    }

    async fn mark_processing_started(&self, id: &str, agent: &str) {
        let mut state = self.state.lock().await;
        if let Some(row) = state.rows.get_mut(id) {
            if row.message.agent == agent && row.message.status.can_advance_to(MessageStatus::Processing) {
                row.message.status = MessageStatus::Processing;
                row.processing_started_at = Some(Instant::now());
            }
        }
    }

    async fn mark_processed(&self, id: &str, agent: &str) {
        let mut state = self.state.lock().await;
        if let Some(row) = state.rows.get_mut(id) {
            if row.message.agent == agent && row.message.status.can_advance_to(MessageStatus::Processed) {
                if let Some(started) = row.processing_started_at {
                    row.processing_duration_secs = Some(started.elapsed().as_secs_f64());
                }
                row.message.status = MessageStatus::Processed;
            }
        }
    }

    async fn mark_failed(&self, id: &str, agent: &str) {
        let mut state = self.state.lock().await;
        if let Some(row) = state.rows.get_mut(id) {
            if row.message.agent == agent && row.message.status.can_advance_to(MessageStatus::Failed) {
                row.message.status = MessageStatus::Failed;
            }
        }
    }

    async fn is_agent_paused(&self, agent: &str) -> bool {
        let state = self.state.lock().await;
        state
            .agent_status
            .get(agent)
            .map(|s| s.paused)
            .unwrap_or(false)
    }

    async fn check_auto_resume(&self, agent: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(status) = state.agent_status.get_mut(agent) else {
            return true;
        };
        if !status.paused {
            return true;
        }
        if let Some(resume_at) = status.auto_resume_at {
            if Utc::now() >= resume_at {
                status.paused = false;
                status.paused_reason = None;
                status.auto_resume_at = None;
                return true;
            }
        }
        false
    }

    async fn get_agent_status(&self, agent: &str) -> AgentStatus {
        let state = self.state.lock().await;
        state.agent_status.get(agent).cloned().unwrap_or_default()
    }

    async fn get_stats(&self, agent: &str) -> AgentStats {
        let state = self.state.lock().await;
        let mut pending = 0u64;
        let mut completed = 0u64;
        let mut total_duration = 0.0f64;
        let mut completed_with_duration = 0u64;
        for row in state.rows.values().filter(|row| row.message.agent == agent) {
            match row.message.status {
                MessageStatus::Pending | MessageStatus::Processing => pending += 1,
                MessageStatus::Processed => {
                    completed += 1;
                    if let Some(d) = row.processing_duration_secs {
                        total_duration += d;
                        completed_with_duration += 1;
                    }
                }
                MessageStatus::Failed => completed += 1,
            }
        }
        let avg_processing_time = if completed_with_duration > 0 {
            total_duration / completed_with_duration as f64
        } else {
            0.0
        };
        AgentStats {
            pending,
            completed,
            avg_processing_time,
        }
    }

    async fn cleanup_old_messages(&self, days: i64) -> u64 {
        let mut state = self.state.lock().await;
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let before = state.rows.len();
        state.rows.retain(|_, row| {
            !matches!(row.message.status, MessageStatus::Processed | MessageStatus::Failed)
                || row.message.timestamp >= cutoff
        });
        (before - state.rows.len()) as u64
    }
}

/// In-memory dead-letter store, paired with `InMemoryMessageStore` for
/// tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    entries: Mutex<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn record(&self, id: &str, agent: &str, content: &str, error: &str) {
        let mut entries = self.entries.lock().await;
        entries.push(DeadLetter {
            id: id.to_string(),
            agent: agent.to_string(),
            content: content.to_string(),
            error: error.to_string(),
            failed_at: Utc::now(),
        });
    }

    async fn list(&self, agent: &str) -> Vec<DeadLetter> {
        let entries = self.entries.lock().await;
        entries.iter().filter(|e| e.agent == agent).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_message_is_idempotent_by_id() {
        let store = InMemoryMessageStore::new();
        assert!(store.store_message("aaaa-1111", "agent", "bob", "hi").await);
        assert!(!store.store_message("aaaa-1111", "agent", "bob", "hi again").await);
        assert_eq!(store.get_backlog_count("agent").await, 1);
    }

    #[tokio::test]
    async fn status_progression_is_monotone() {
        let store = InMemoryMessageStore::new();
        store.store_message("m1", "agent", "bob", "hi").await;
        store.mark_processing_started("m1", "agent").await;
        store.mark_processed("m1", "agent").await;
        // A late duplicate "mark processing" must not regress a terminal message.
        store.mark_processing_started("m1", "agent").await;

        let pending = store.get_pending_messages("agent", 10, SortOrder::Desc).await;
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn fifo_and_filo_ordering() {
        let store = InMemoryMessageStore::new();
        for i in 0..5 {
            let id = format!("m{i}");
            store.store_message(&id, "agent", "bob", "hi").await;
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let filo = store.get_pending_messages("agent", 10, SortOrder::Desc).await;
        let fifo = store.get_pending_messages("agent", 10, SortOrder::Asc).await;
        assert_eq!(filo[0].id, "m4");
        assert_eq!(fifo[0].id, "m0");
    }

    #[tokio::test]
    async fn auto_resume_clears_pause_after_deadline() {
        let store = InMemoryMessageStore::new();
        store
            .set_paused("agent", Some("stopped".to_string()), Some(Utc::now() - chrono::Duration::seconds(1)))
            .await;
        assert!(store.is_agent_paused("agent").await);
        assert!(store.check_auto_resume("agent").await);
        assert!(!store.is_agent_paused("agent").await);
    }

    #[tokio::test]
    async fn dead_letter_store_records_failures() {
        let dead_letters = InMemoryDeadLetterStore::new();
        dead_letters.record("m1", "agent", "hello", "handler panicked").await;
        let entries = dead_letters.list("agent").await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "m1");
    }
}
