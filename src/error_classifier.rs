//! Maps an opaque failure string to `{kind, wait_hint_seconds}`
//! (`spec.md` §4.3), grounded directly on
//! `queue_manager.py::_parse_error_and_get_wait_time`.

use std::time::Duration;

use serde_json::Value;

use crate::error::ErrorKind;

const INITIAL_BACKOFF_SECS: u64 = 5;
const MAX_BACKOFF_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_WAIT_SECS: u64 = 30;

/// Carries the poller's exponential-backoff ladder across classifications.
/// Rate-limit waits never touch this counter; connection/unknown errors
/// double it (capped) on every consecutive classification, and any
/// successful operation resets it.
#[derive(Debug, Clone, Copy)]
pub struct BackoffState {
    current_secs: u64,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self {
            current_secs: INITIAL_BACKOFF_SECS,
        }
    }
}

impl BackoffState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the ladder to its initial value after a successful operation
    /// (`spec.md` §4.3 "Backoff state resets to 5 s on the first successful
    /// operation after any consecutive-error streak").
    pub fn reset(&mut self) {
        self.current_secs = INITIAL_BACKOFF_SECS;
    }

    fn current(&self) -> Duration {
        Duration::from_secs(self.current_secs)
    }

    /// Doubles the ladder, capped at 60s, and returns the *pre-advance*
    /// wait so the caller sleeps the wait that was in effect when the
    /// error occurred, then the ladder is ready for the next one.
    fn advance(&mut self) -> Duration {
        let wait = self.current();
        self.current_secs = (self.current_secs * 2).min(MAX_BACKOFF_SECS);
        wait
    }
}

/// Result of classifying a failure.
#[derive(Debug, Clone, Copy)]
pub struct Classified {
    pub kind: ErrorKind,
    pub wait: Duration,
}

/// Classifies `error_message` and returns the kind plus how long to wait
/// before retrying, mutating `backoff` in place for connection/unknown
/// errors (`spec.md` §4.3). Rate-limit waits use the server's `retry_after`
/// when present, else a flat 30s, and never advance `backoff`.
pub fn classify(error_message: &str, backoff: &mut BackoffState) -> Classified {
    if error_message.contains("HTTP 429") || error_message.to_lowercase().contains("rate_limited") {
        let wait = extract_retry_after(error_message)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_RATE_LIMIT_WAIT_SECS));
        return Classified {
            kind: ErrorKind::RateLimit,
            wait,
        };
    }

    if error_message.contains("ConnectTimeoutError")
        || error_message.contains("Connection timeout")
        || error_message.contains("TimeoutError")
    {
        return Classified {
            kind: ErrorKind::ConnectTimeout,
            wait: backoff.advance(),
        };
    }

    if error_message.contains("ECONNRESET")
        || error_message.contains("ConnectionResetError")
        || error_message.contains("ConnectionRefusedError")
        || error_message.contains("OSError")
    {
        return Classified {
            kind: ErrorKind::ConnectError,
            wait: backoff.advance(),
        };
    }

    Classified {
        kind: ErrorKind::Unknown,
        wait: backoff.advance(),
    }
}

/// Pulls a `retry_after` integer out of an embedded JSON error payload,
/// e.g. `{"error":"rate_limited","retry_after":27}`. Returns `None` if no
/// JSON object is present or it doesn't carry the field.
fn extract_retry_after(error_message: &str) -> Option<u64> {
    let start = error_message.find('{')?;
    let end = error_message.rfind('}')?;
    if end < start {
        return None;
    }
    let candidate = &error_message[start..=end];
    let value: Value = serde_json::from_str(candidate).ok()?;
    value.get("retry_after").and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_uses_exact_retry_after() {
        let mut backoff = BackoffState::new();
        let result = classify(
            r#"RuntimeError: {"error":"rate_limited","retry_after":27}"#,
            &mut backoff,
        );
        assert_eq!(result.kind, ErrorKind::RateLimit);
        assert_eq!(result.wait, Duration::from_secs(27));
        // Rate limits never advance the ladder.
        assert_eq!(backoff.current_secs, INITIAL_BACKOFF_SECS);
    }

    #[test]
    fn rate_limit_without_retry_after_defaults_to_30() {
        let mut backoff = BackoffState::new();
        let result = classify("rate_limited", &mut backoff);
        assert_eq!(result.wait, Duration::from_secs(30));
    }

    #[test]
    fn connection_error_ladder_doubles_and_caps_at_60() {
        let mut backoff = BackoffState::new();
        let waits: Vec<u64> = (0..6)
            .map(|_| classify("ECONNRESET", &mut backoff).wait.as_secs())
            .collect();
        assert_eq!(waits, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn reset_restores_initial_backoff() {
        let mut backoff = BackoffState::new();
        classify("ECONNRESET", &mut backoff);
        classify("ECONNRESET", &mut backoff);
        assert_eq!(backoff.current_secs, 20);
        backoff.reset();
        assert_eq!(backoff.current_secs, INITIAL_BACKOFF_SECS);
    }

    #[test]
    fn unknown_error_uses_same_ladder_as_connection_errors() {
        let mut backoff = BackoffState::new();
        let result = classify("something bizarre happened", &mut backoff);
        assert_eq!(result.kind, ErrorKind::Unknown);
        assert_eq!(result.wait, Duration::from_secs(5));
    }

    #[test]
    fn connect_timeout_is_classified_distinctly() {
        let mut backoff = BackoffState::new();
        let result = classify("raised TimeoutError waiting for response", &mut backoff);
        assert_eq!(result.kind, ErrorKind::ConnectTimeout);
    }
}
