pub mod config;
pub mod error;
pub mod error_classifier;
pub mod heartbeat;
pub mod liveness;
pub mod mcp;
pub mod mention;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod store;
pub mod supervisor;

pub use error::{ConfigError, ErrorKind, McpError, PipelineError};
pub use orchestrator::{AgentHandle, Orchestrator, PipelineDefaults};
pub use pipeline::{Handler, HandlerInput, Pipeline, PipelineConfig};
pub use supervisor::{SessionSupervisor, SupervisorPolicy};
