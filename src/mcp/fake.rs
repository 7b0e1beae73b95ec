//! An in-process fake transport used by supervisor/pipeline tests so they
//! don't need a real stdio child process (`spec.md` §8's scenarios are
//! specified against a simulated remote, not a live MCP server).

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::McpError;
use crate::mcp::transport::McpTransport;

/// A scripted response or error for one `call_tool`/`ping` invocation.
pub enum Scripted {
    Ok(Value),
    Err(McpError),
}

/// A transport whose responses are driven by a queue the test pre-loads.
/// Calls past the end of the queue return an empty object, so a test that
/// only cares about the first few calls doesn't need to pad the script.
pub struct FakeTransport {
    inner: Arc<Mutex<FakeState>>,
}

struct FakeState {
    script: VecDeque<Scripted>,
    ping_failures_remaining: u32,
    initialized: bool,
    closed: bool,
    calls: Vec<(String, Value)>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeState {
                script: VecDeque::new(),
                ping_failures_remaining: 0,
                initialized: false,
                closed: false,
                calls: Vec::new(),
            })),
        }
    }

    pub fn handle(&self) -> FakeHandle {
        FakeHandle {
            inner: self.inner.clone(),
        }
    }

    pub fn push_ok(&mut self, value: Value) {
        // Synchronous push used at test setup time, before any task has a
        // chance to contend on the lock.
        self.inner
            .try_lock()
            .expect("fake transport is not shared yet")
            .script
            .push_back(Scripted::Ok(value));
    }

    pub fn push_err(&mut self, err: McpError) {
        self.inner
            .try_lock()
            .expect("fake transport is not shared yet")
            .script
            .push_back(Scripted::Err(err));
    }

    pub fn fail_next_pings(&mut self, count: u32) {
        self.inner
            .try_lock()
            .expect("fake transport is not shared yet")
            .ping_failures_remaining = count;
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// A cloneable observer handle for assertions after the transport has been
/// moved into a `Session`.
#[derive(Clone)]
pub struct FakeHandle {
    inner: Arc<Mutex<FakeState>>,
}

impl FakeHandle {
    pub async fn calls(&self) -> Vec<(String, Value)> {
        self.inner.lock().await.calls.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }
}

#[async_trait]
impl McpTransport for FakeTransport {
    async fn initialize(&mut self) -> Result<(), McpError> {
        self.inner.lock().await.initialized = true;
        Ok(())
    }

    async fn list_tools(&mut self) -> Result<Vec<String>, McpError> {
        Ok(vec!["messages".to_string()])
    }

    async fn call_tool(&mut self, tool: &str, arguments: Value) -> Result<Value, McpError> {
        let mut state = self.inner.lock().await;
        state.calls.push((tool.to_string(), arguments));
        match state.script.pop_front() {
            Some(Scripted::Ok(v)) => Ok(v),
            Some(Scripted::Err(e)) => Err(e),
            None => Ok(serde_json::json!({})),
        }
    }

    async fn ping(&mut self) -> Result<(), McpError> {
        let mut state = self.inner.lock().await;
        if state.ping_failures_remaining > 0 {
            state.ping_failures_remaining -= 1;
            return Err(McpError::Transport {
                server: "fake".to_string(),
                message: "simulated ping failure".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.inner.lock().await.closed = true;
    }
}
