use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use skein::node::{Node, NodeContext, NodeError, NodeOutput};

/// Adds one to its numeric input and writes the result to `target`.
pub struct AddOne {
    pub target: &'static str,
}

#[async_trait]
impl Node for AddOne {
    async fn run(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let n = input.as_i64().ok_or(NodeError::MissingInput { what: "number" })?;
        Ok(NodeOutput::write(self.target, json!(n + 1)))
    }
}

/// Writes a fixed value to `target`.
pub struct WriteValue {
    pub target: &'static str,
    pub value: Value,
}

#[async_trait]
impl Node for WriteValue {
    async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::write(self.target, self.value.clone()))
    }
}

/// Fails the first `failures` calls, then writes the call count to `target`.
pub struct Flaky {
    pub failures: u32,
    pub calls: Arc<AtomicU32>,
    pub target: &'static str,
}

#[async_trait]
impl Node for Flaky {
    async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(NodeError::Other(format!("transient failure #{call}")));
        }
        Ok(NodeOutput::write(self.target, json!(call)))
    }
}

/// Counts invocations and writes `value` to `target`.
pub struct Counting {
    pub calls: Arc<AtomicU32>,
    pub target: &'static str,
    pub value: Value,
}

#[async_trait]
impl Node for Counting {
    async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(NodeOutput::write(self.target, self.value.clone()))
    }
}
