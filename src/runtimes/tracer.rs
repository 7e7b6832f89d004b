//! Observability callbacks.
//!
//! A [`Tracer`] receives lifecycle notifications from the superstep loop.
//! The engine never depends on callback return values; implementations are
//! free to forward to any telemetry backend. All methods default to no-ops
//! so implementers opt into the hooks they need.

use serde_json::Value;

use crate::types::{TaskId, TaskPath};

/// Borrowed description of a task handed to tracer callbacks.
#[derive(Clone, Copy, Debug)]
pub struct TraceTask<'a> {
    pub id: &'a TaskId,
    pub name: &'a str,
    pub path: &'a TaskPath,
    pub step: i64,
    pub input: &'a Value,
}

/// Lifecycle callbacks for a run.
pub trait Tracer: Send + Sync {
    /// A superstep is about to execute its planned tasks.
    fn on_chain_start(&self, _namespace: &str, _step: i64, _task_count: usize) {}

    /// A superstep completed its apply phase.
    fn on_chain_end(&self, _namespace: &str, _step: i64) {}

    /// A task is about to run.
    fn on_task_start(&self, _task: TraceTask<'_>) {}

    /// A task finished; `error` carries the rendered failure, if any.
    fn on_task_end(&self, _task: TraceTask<'_>, _error: Option<&str>) {}
}
