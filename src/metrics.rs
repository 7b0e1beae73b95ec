//! Structured metric emission.
//!
//! Grounded on `monitoring/metrics.py::log_metric`: a fire-and-forget
//! structured event logger that must never raise. The Rust port emits
//! through `tracing` instead of hand-rolled JSON, since every crate in the
//! example pack that needs structured telemetry (e.g. `oj-daemon`) reaches
//! for `tracing` rather than rolling its own JSON logger.

use std::fmt;

/// Emits a structured metric event. Fields are rendered as `tracing`
/// key/value pairs under a single `metric` target so they can be filtered
/// independently of ordinary log lines (`RUST_LOG=agent_pipeline_core::metrics=info`).
///
/// This function cannot fail: any field that can't be rendered is simply
/// shown via its `Display`/`Debug` impl, matching the original's
/// best-effort `try/except` around `json.dumps`.
pub fn log_metric(event: &str, fields: &[(&str, &dyn fmt::Display)]) {
    let rendered: Vec<String> = fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    tracing::info!(target: "metric", event, fields = %rendered.join(" "), "metric");
}

/// Convenience macro mirroring `log_metric(event, **fields)` call sites in
/// the original without forcing callers to build a `Vec` of trait objects
/// by hand.
#[macro_export]
macro_rules! metric {
    ($event:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::log_metric($event, &[$(($k, &$v as &dyn std::fmt::Display)),*]);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_metric_does_not_panic_with_no_fields() {
        log_metric("mcp_connected", &[]);
    }

    #[test]
    fn log_metric_renders_fields() {
        let server = "ax-gcp";
        let count = 5;
        metric!("mcp_connected", "server" => server, "tool_count" => count);
    }
}
