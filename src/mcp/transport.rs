//! The remote RPC surface (`spec.md` §6) modeled as a trait so the
//! supervisor and pipeline can be tested against a fake.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::McpError;

/// A single MCP tool-invocation transport: one stdio child process (or, in
/// tests, a fake) speaking the `messages` tool protocol.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Performs the MCP `initialize` handshake.
    async fn initialize(&mut self) -> Result<(), McpError>;

    /// Lists available tools; used only to populate `metadata.tool_count`.
    async fn list_tools(&mut self) -> Result<Vec<String>, McpError>;

    /// Invokes a named tool with arguments, returning its raw JSON result.
    async fn call_tool(&mut self, tool: &str, arguments: Value) -> Result<Value, McpError>;

    /// A no-op ping used by the heartbeat driver to defeat remote idle
    /// eviction (`spec.md` §4.2). Implemented as `call_tool("ping", {})`
    /// for a real stdio session; fakes may implement it more cheaply.
    async fn ping(&mut self) -> Result<(), McpError> {
        self.call_tool("ping", serde_json::json!({})).await?;
        Ok(())
    }

    /// Tears down the underlying process/connection. Must be safe to call
    /// more than once.
    async fn close(&mut self);
}
