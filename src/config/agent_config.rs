//! Per-agent MCP server configuration (`spec.md` §6), loaded from the same
//! `mcpServers` JSON shape Claude Desktop/Code configs use.
//!
//! Grounded on the teacher's `config.rs::AgentConfig` loader (JSON-via-serde
//! with a dedicated `ConfigError`), generalized from the teacher's
//! planning-agent fields to the `mcpServers` map this domain actually needs.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::mcp::stdio::default_command;

/// One MCP server entry: how to spawn it.
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerConfig {
    #[serde(default = "default_command_owned")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

fn default_command_owned() -> String {
    default_command().to_string()
}

/// The top-level agent config file: a map of server name to its launch
/// parameters, keyed under `mcpServers` (`spec.md` §6 config file shape).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

impl AgentConfig {
    /// Loads and validates an agent config file from `path`. JSON is the
    /// format this shape is conventionally written in; `spec.md` §6 doesn't
    /// name an extension so we parse by content rather than by suffix.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                format: "json",
                source: anyhow::Error::new(e),
            })?;

        if value.get("mcpServers").is_none() {
            return Err(ConfigError::MissingMcpServers(path.to_path_buf()));
        }

        serde_json::from_value(value).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            format: "json",
            source: anyhow::Error::new(e),
        })
    }
}
