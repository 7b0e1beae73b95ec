//! The MCP stdio tool-invocation surface (`spec.md` §6).

pub mod protocol;
pub mod stdio;
pub mod transport;

#[cfg(test)]
pub mod fake;

pub use stdio::StdioSession;
pub use transport::McpTransport;
