//! Stdio child-process transport: spawns the tool server's `command`/`args`
//! and speaks newline-delimited JSON-RPC over its stdin/stdout.
//!
//! Grounded on the teacher's `agents/runner.rs::run_agent_process`, which
//! spawns a `tokio::process::Command`, takes its piped stdio, and reads
//! line-by-line with `tokio::io::BufReader`/`AsyncBufReadExt`. This module
//! reuses that shape but writes requests to stdin (the agent runner never
//! needed to, since its subprocess is a one-shot CLI invocation rather than
//! a long-lived RPC peer).

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::config::agent_config::McpServerConfig;
use crate::error::McpError;
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::mcp::transport::McpTransport;

/// A live stdio connection to one MCP tool server.
pub struct StdioSession {
    name: String,
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    next_id: AtomicU64,
}

impl StdioSession {
    /// Spawns the child process described by `config` (`spec.md` §4.4
    /// `_build_server_params`/`_connect_single_server`). Does not perform
    /// the `initialize` handshake — callers invoke `initialize()` under
    /// their own timeout, matching the supervisor's contract.
    pub fn spawn(name: &str, config: &McpServerConfig) -> Result<Self, McpError> {
        let mut command = Command::new(&config.command);
        command.args(&config.args);
        if let Some(env) = &config.env {
            for (k, v) in env {
                command.env(k, v);
            }
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = command.spawn().map_err(|source| McpError::Spawn {
            name: name.to_string(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .expect("stdin was requested as piped at spawn time");
        let stdout = child
            .stdout
            .take()
            .expect("stdout was requested as piped at spawn time");
        let lines = BufReader::new(stdout).lines();

        Ok(Self {
            name: name.to_string(),
            child,
            stdin,
            lines,
            next_id: AtomicU64::new(1),
        })
    }

    async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let mut line = serde_json::to_string(&request).map_err(|e| McpError::Transport {
            server: self.name.clone(),
            message: format!("failed to encode request: {e}"),
        })?;
        line.push('\n');

        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::Transport {
                server: self.name.clone(),
                message: format!("failed to write request: {e}"),
            })?;
        self.stdin.flush().await.map_err(|e| McpError::Transport {
            server: self.name.clone(),
            message: format!("failed to flush stdin: {e}"),
        })?;

        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| McpError::Transport {
                    server: self.name.clone(),
                    message: format!("failed to read response: {e}"),
                })?
                .ok_or_else(|| McpError::Transport {
                    server: self.name.clone(),
                    message: "server closed stdout".to_string(),
                })?;
            if line.trim().is_empty() {
                continue;
            }
            let response: JsonRpcResponse =
                serde_json::from_str(&line).map_err(|e| McpError::Transport {
                    server: self.name.clone(),
                    message: format!("malformed response line: {e}"),
                })?;
            if response.id != Some(id) {
                // A response to an older/foreign request; the stdio
                // transport is strictly request/response so this should
                // not happen in practice, but we don't want to wedge on a
                // stray line.
                continue;
            }
            if let Some(error) = response.error {
                return Err(McpError::Transport {
                    server: self.name.clone(),
                    message: error.message,
                });
            }
            return Ok(response.result.unwrap_or(Value::Null));
        }
    }
}

#[async_trait]
impl McpTransport for StdioSession {
    async fn initialize(&mut self) -> Result<(), McpError> {
        self.request("initialize", Some(serde_json::json!({}))).await?;
        Ok(())
    }

    async fn list_tools(&mut self) -> Result<Vec<String>, McpError> {
        let result = self.request("tools/list", None).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| t.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(tools)
    }

    async fn call_tool(&mut self, tool: &str, arguments: Value) -> Result<Value, McpError> {
        let params = serde_json::json!({ "name": tool, "arguments": arguments });
        self.request("tools/call", Some(params)).await
    }

    async fn close(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Default `command` when a server config omits one, matching
/// `_build_server_params`'s `server_config.get("command", "npx")`.
pub fn default_command() -> &'static str {
    "npx"
}
