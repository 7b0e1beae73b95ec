//! Configuration loading: per-agent MCP server definitions and
//! multi-agent deployment groups (`spec.md` §6, §12).

pub mod agent_config;
pub mod deployment;

pub use agent_config::{AgentConfig, McpServerConfig};
pub use deployment::{DeploymentAgent, DeploymentGroup, DeploymentLoader};
