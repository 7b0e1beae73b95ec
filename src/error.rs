//! Error kinds for the pipeline core.
//!
//! Library-internal failures are typed with `thiserror`; callers at the
//! binary boundary (see `main.rs`) wrap these in `anyhow::Result` the way
//! the rest of the studio's tooling does.

use thiserror::Error;

/// Errors raised while loading or validating agent/deployment configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("agent config not found: {0}")]
    NotFound(std::path::PathBuf),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path} as {format}: {source}")]
    Parse {
        path: std::path::PathBuf,
        format: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid config format: expected 'mcpServers' key in {0}")]
    MissingMcpServers(std::path::PathBuf),

    #[error("deployment group '{0}' must define an 'agents' list")]
    MissingAgentsList(String),
}

/// Errors surfaced by the MCP session transport and supervisor.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("unknown server '{0}'")]
    UnknownServer(String),

    #[error("no MCP sessions available")]
    NoSessionsAvailable,

    #[error("operation '{op}' timed out after {timeout_secs}s")]
    OperationTimeout { op: String, timeout_secs: u64 },

    #[error("operation '{op}' failed for server '{server}' after {attempts} attempts: {source}")]
    RetryExhausted {
        op: String,
        server: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to spawn stdio server '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error for '{server}': {message}")]
    Transport { server: String, message: String },
}

/// The classifier's output kind (`spec.md` §4.3 / §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimit,
    ConnectTimeout,
    ConnectError,
    Unknown,
}

/// Pipeline-level error kinds (`spec.md` §7). `HandlerFailed` is recoverable
/// at the pipeline level (messages are dead-lettered, not retried) but is
/// still modeled as a distinct kind so callers can tell it apart from a
/// transport failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error("handler failed for message {id}: {source}")]
    HandlerFailed {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}
