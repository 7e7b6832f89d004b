//! Engine event streaming.
//!
//! The runner emits typed [`StreamEvent`]s into a `flume` channel as the
//! loop progresses; [`EventStream`] is the consuming handle returned by
//! `App::stream`. Events are emitted in the order they occur within the
//! loop: task events of one superstep interleave nondeterministically, but
//! each task's own events are ordered and the step's checkpoint record
//! follows all of its task results.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::checkpoint::CheckpointId;
use crate::control::Interrupt;
use crate::runtimes::GraphError;
use crate::types::{TaskId, TaskPath};

/// Channel name whose writes feed [`StreamMode::Messages`].
pub const MESSAGES_CHANNEL: &str = "messages";

/// What the stream carries; multiple modes may be combined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
    /// Full output-channel value map after each apply phase.
    Values,
    /// Per-node write batches after each apply phase.
    Updates,
    /// Individual items written to the `messages` channel, as produced.
    Messages,
    /// Values a node publishes through its context writer.
    Custom,
    /// Low-level lifecycle records: task, task result, checkpoint.
    Debug,
}

/// Low-level lifecycle record for [`StreamMode::Debug`].
#[derive(Clone, Debug)]
pub enum DebugRecord {
    Task {
        step: i64,
        id: TaskId,
        name: String,
        path: TaskPath,
        input: Value,
        triggers: Vec<String>,
        cached: bool,
        at: DateTime<Utc>,
    },
    TaskResult {
        step: i64,
        id: TaskId,
        name: String,
        writes: Vec<(String, Value)>,
        error: Option<String>,
        at: DateTime<Utc>,
    },
    Checkpoint {
        step: i64,
        checkpoint: CheckpointId,
        at: DateTime<Utc>,
    },
}

/// An event produced by a run. `namespace` is empty for the root graph and
/// carries the subgraph lineage when subgraph streaming is enabled.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Values {
        namespace: String,
        step: i64,
        values: FxHashMap<String, Value>,
    },
    Updates {
        namespace: String,
        step: i64,
        node: String,
        writes: Vec<FxHashMap<String, Value>>,
    },
    Message {
        namespace: String,
        step: i64,
        node: String,
        message: Value,
    },
    Custom {
        namespace: String,
        step: i64,
        node: String,
        value: Value,
    },
    Interrupt {
        namespace: String,
        step: i64,
        interrupts: Vec<Interrupt>,
    },
    Debug {
        namespace: String,
        record: DebugRecord,
    },
}

/// Sending half handed through the runner and node contexts.
#[derive(Clone)]
pub(crate) struct StreamEmitter {
    tx: Option<flume::Sender<StreamEvent>>,
    modes: Arc<Vec<StreamMode>>,
    namespace: String,
    subgraphs: bool,
}

impl StreamEmitter {
    pub(crate) fn disabled() -> Self {
        Self {
            tx: None,
            modes: Arc::new(Vec::new()),
            namespace: String::new(),
            subgraphs: false,
        }
    }

    pub(crate) fn new(
        tx: flume::Sender<StreamEvent>,
        modes: Vec<StreamMode>,
        namespace: String,
        subgraphs: bool,
    ) -> Self {
        Self {
            tx: Some(tx),
            modes: Arc::new(modes),
            namespace,
            subgraphs,
        }
    }

    pub(crate) fn enabled(&self, mode: StreamMode) -> bool {
        self.tx.is_some() && self.modes.contains(&mode)
    }

    pub(crate) fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Emitter for a nested run. Subgraph events flow into the same channel,
    /// tagged with the child namespace, unless subgraph streaming is off.
    pub(crate) fn child(&self, namespace: String) -> Self {
        if self.subgraphs {
            Self {
                tx: self.tx.clone(),
                modes: Arc::clone(&self.modes),
                namespace,
                subgraphs: true,
            }
        } else {
            Self::disabled()
        }
    }

    pub(crate) fn emit(&self, event: StreamEvent) {
        if let Some(tx) = &self.tx
            && tx.send(event).is_err()
        {
            tracing::debug!("event stream receiver dropped; discarding event");
        }
    }

    pub(crate) fn emit_custom(&self, step: i64, node: &str, value: Value) {
        if self.enabled(StreamMode::Custom) {
            self.emit(StreamEvent::Custom {
                namespace: self.namespace.clone(),
                step,
                node: node.to_string(),
                value,
            });
        }
    }
}

/// Consuming handle for a streamed run.
///
/// The sequence is finite and not restartable: it ends when the run
/// completes, interrupts, or fails, after which [`EventStream::join`]
/// returns the run's outcome.
pub struct EventStream {
    rx: flume::Receiver<StreamEvent>,
    handle: tokio::task::JoinHandle<Result<Value, GraphError>>,
}

impl EventStream {
    pub(crate) fn new(
        rx: flume::Receiver<StreamEvent>,
        handle: tokio::task::JoinHandle<Result<Value, GraphError>>,
    ) -> Self {
        Self { rx, handle }
    }

    /// Next event, or `None` once the run has finished and the buffer is
    /// drained.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv_async().await.ok()
    }

    /// Await the run's outcome, discarding any events not yet consumed.
    pub async fn join(self) -> Result<Value, GraphError> {
        drop(self.rx);
        self.handle.await?
    }

    /// Drain all remaining events, then return them with the run outcome.
    pub async fn collect(mut self) -> (Vec<StreamEvent>, Result<Value, GraphError>) {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        let outcome = match self.handle.await {
            Ok(result) => result,
            Err(join_error) => Err(GraphError::from(join_error)),
        };
        (events, outcome)
    }
}
