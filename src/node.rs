//! Node execution surface.
//!
//! A [`Node`] is a unit of computation scheduled by the superstep loop. It
//! receives its mapped input and a [`NodeContext`], and returns either plain
//! channel writes or a [`Command`] combining writes with routing. Nodes are
//! isolated: they observe committed channel values only, never another
//! task's uncommitted writes from the same superstep.
//!
//! # Interrupts
//!
//! [`NodeContext::interrupt`] is the cooperative suspension primitive. The
//! first unresolved call returns [`NodeError::Interrupted`], which node code
//! propagates with `?`; the engine treats that variant as a control signal,
//! not a failure — it is never retried and never recorded as an error.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::channels::ChannelError;
use crate::checkpoint::{CheckpointId, CheckpointStore};
use crate::control::{Command, Interrupt, ResumeValue};
use crate::runtimes::Durability;
use crate::stream::StreamEmitter;
use crate::types::{derive_interrupt_id, TaskId, TaskPath};

/// Core trait for executable nodes.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
/// use skein::node::{Node, NodeContext, NodeError, NodeOutput};
///
/// struct Increment;
///
/// #[async_trait]
/// impl Node for Increment {
///     async fn run(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
///         let n = input.as_i64().ok_or(NodeError::MissingInput { what: "number" })?;
///         Ok(NodeOutput::write("out", json!(n + 1)))
///     }
/// }
/// ```
#[async_trait]
pub trait Node: Send + Sync {
    /// Execute this node with its mapped input.
    async fn run(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError>;
}

/// Blanket impl so plain async closures can be mounted as nodes.
#[async_trait]
impl<F, Fut> Node for F
where
    F: Fn(Value, NodeContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<NodeOutput, NodeError>> + Send,
{
    async fn run(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self(input, ctx).await
    }
}

/// What a node produced.
#[derive(Clone, Debug)]
pub enum NodeOutput {
    /// Channel writes, applied at the barrier in task order.
    Writes(Vec<(String, Value)>),
    /// Writes combined with routing intent.
    Command(Command),
    /// Several commands; their updates are applied as separate write
    /// batches, in order.
    Commands(Vec<Command>),
}

impl NodeOutput {
    /// No writes, no routing.
    #[must_use]
    pub fn empty() -> Self {
        NodeOutput::Writes(Vec::new())
    }

    /// A single channel write.
    #[must_use]
    pub fn write(channel: impl Into<String>, value: Value) -> Self {
        NodeOutput::Writes(vec![(channel.into(), value)])
    }

    /// Writes from an iterator of `(channel, value)` pairs.
    pub fn writes<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        NodeOutput::Writes(
            pairs
                .into_iter()
                .map(|(channel, value)| (channel.into(), value))
                .collect(),
        )
    }
}

impl From<Command> for NodeOutput {
    fn from(command: Command) -> Self {
        NodeOutput::Command(command)
    }
}

impl From<Vec<Command>> for NodeOutput {
    fn from(commands: Vec<Command>) -> Self {
        NodeOutput::Commands(commands)
    }
}

/// Execution context handed to a node for one task attempt.
///
/// Carries the task's identity, a snapshot of committed channel values, the
/// interrupt/resume machinery, and the run's cancellation token.
#[derive(Clone)]
pub struct NodeContext {
    pub(crate) node: String,
    pub(crate) task_id: TaskId,
    pub(crate) path: TaskPath,
    pub(crate) step: i64,
    pub(crate) namespace: String,
    pub(crate) values: Arc<FxHashMap<String, Value>>,
    pub(crate) configurable: Arc<FxHashMap<String, Value>>,
    pub(crate) resume_history: Arc<Vec<Value>>,
    pub(crate) incoming_resume: Option<ResumeValue>,
    pub(crate) consumed_resumes: Arc<Mutex<Vec<Value>>>,
    pub(crate) interrupt_seq: Arc<AtomicUsize>,
    pub(crate) emitter: StreamEmitter,
    pub(crate) cancel: CancellationToken,
    pub(crate) store: Option<Arc<dyn CheckpointStore>>,
    pub(crate) thread_id: Option<String>,
    pub(crate) parent_checkpoint: Option<CheckpointId>,
    pub(crate) durability: Durability,
    pub(crate) recursion_limit: usize,
    pub(crate) declared_writes: Vec<String>,
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("node", &self.node)
            .field("task_id", &self.task_id)
            .field("step", &self.step)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl NodeContext {
    /// Name of the executing node.
    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Deterministic id of the executing task.
    #[must_use]
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Superstep index of this task.
    #[must_use]
    pub fn step(&self) -> i64 {
        self.step
    }

    /// Checkpoint namespace of the executing graph.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Opaque configuration passed through from the run config.
    #[must_use]
    pub fn configurable(&self) -> &FxHashMap<String, Value> {
        &self.configurable
    }

    /// Token observed by the run; cooperative I/O should select against it.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Read a committed channel value from the task's snapshot.
    ///
    /// The snapshot reflects the state the superstep was planned from; it
    /// never includes sibling tasks' uncommitted writes.
    pub fn read(&self, channel: &str) -> Result<Value, NodeError> {
        self.values
            .get(channel)
            .cloned()
            .ok_or_else(|| NodeError::Channel(ChannelError::Empty {
                channel: channel.to_string(),
            }))
    }

    /// Publish a value on the custom stream, tagged with this node.
    pub fn write(&self, value: Value) {
        self.emitter.emit_custom(self.step, &self.node, value);
    }

    /// Suspend the task until a matching resume value is supplied.
    ///
    /// Interrupt ids are deterministic per task and per call index, so a
    /// re-executed task replays resolved calls from history and only the
    /// first unresolved call raises.
    pub fn interrupt(&self, value: Value) -> Result<Value, NodeError> {
        if self.store.is_none() {
            return Err(NodeError::NoCheckpointer {
                feature: "interrupt",
            });
        }
        let index = self.interrupt_seq.fetch_add(1, Ordering::SeqCst);
        let id = derive_interrupt_id(&self.namespace, &self.node, &self.path, index);

        // Calls resolved in earlier rounds replay from persisted history.
        if let Some(resolved) = self.resume_history.get(index) {
            return Ok(resolved.clone());
        }

        let mut consumed = self
            .consumed_resumes
            .lock()
            .map_err(|e| NodeError::Other(format!("resume bookkeeping poisoned: {e}")))?;
        match &self.incoming_resume {
            Some(ResumeValue::Map(values)) => {
                if let Some(answer) = values.get(&id) {
                    consumed.push(answer.clone());
                    return Ok(answer.clone());
                }
            }
            Some(ResumeValue::Single(answer)) => {
                // The single-value form answers exactly the first call that
                // has no history entry.
                if index == self.resume_history.len() && consumed.is_empty() {
                    consumed.push(answer.clone());
                    return Ok(answer.clone());
                }
            }
            None => {}
        }
        drop(consumed);

        Err(NodeError::Interrupted(Interrupt { id, value }))
    }
}

/// Errors surfaced by node execution.
///
/// [`NodeError::Interrupted`] is a control signal, not a failure: the engine
/// pauses the task and persists state instead of entering the retry/failure
/// path.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Cooperative suspension raised by [`NodeContext::interrupt`].
    #[error("interrupted awaiting external input")]
    #[diagnostic(
        code(skein::node::interrupted),
        help("Resume the run with a Command carrying a resume value.")
    )]
    Interrupted(Interrupt),

    /// A persistence-requiring feature was used without a checkpoint store.
    #[error("no checkpointer configured: {feature} requires persistence")]
    #[diagnostic(
        code(skein::node::no_checkpointer),
        help("Attach a checkpoint store to the graph builder to use {feature}.")
    )]
    NoCheckpointer { feature: &'static str },

    /// Expected input data is missing.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(skein::node::missing_input),
        help("Check that an upstream node produced the required data: {what}.")
    )]
    MissingInput { what: &'static str },

    /// JSON (de)serialization failed inside the node.
    #[error(transparent)]
    #[diagnostic(code(skein::node::serde))]
    Serde(#[from] serde_json::Error),

    /// Input validation failed.
    #[error("validation failed: {0}")]
    #[diagnostic(code(skein::node::validation))]
    ValidationFailed(String),

    /// Channel read failed.
    #[error(transparent)]
    #[diagnostic(code(skein::node::channel))]
    Channel(#[from] ChannelError),

    /// Any other node failure.
    #[error("{0}")]
    #[diagnostic(code(skein::node::other))]
    Other(String),
}

/// Retry policy for a node's failures.
///
/// Interrupts and cancellation are never retried; everything else passes
/// through the classifier. Writes from failed attempts are discarded.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Option<Duration>,
    classify: Arc<dyn Fn(&NodeError) -> bool + std::marker::Send + Sync>,
}

impl RetryPolicy {
    /// Retry every classified-retryable failure up to `max_attempts` total
    /// attempts.
    #[must_use]
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: None,
            classify: Arc::new(|_| true),
        }
    }

    /// Fixed delay between attempts.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Decide retryability per error.
    #[must_use]
    pub fn with_classifier(
        mut self,
        classify: impl Fn(&NodeError) -> bool + std::marker::Send + Sync + 'static,
    ) -> Self {
        self.classify = Arc::new(classify);
        self
    }

    #[must_use]
    pub fn is_retryable(&self, error: &NodeError) -> bool {
        !matches!(
            error,
            NodeError::Interrupted(_) | NodeError::NoCheckpointer { .. }
        ) && (self.classify.as_ref())(error)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::attempts(1)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// Cache policy for a node: results are keyed by a deterministic hash of the
/// task input and reused until the optional TTL lapses.
#[derive(Clone, Debug, Default)]
pub struct CachePolicy {
    pub ttl: Option<Duration>,
}

impl CachePolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}
