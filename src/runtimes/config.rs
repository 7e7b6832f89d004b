//! Run configuration.
//!
//! A [`RunConfig`] carries everything a single run needs beyond its input:
//! persistence addressing (thread, namespace, optional historical checkpoint
//! to resume or fork from), loop limits, breakpoints, durability, streaming
//! options, observability tags, and the opaque `configurable` map passed
//! through to node code. Configuration travels explicitly with the run; the
//! engine keeps no process-wide state.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointId, CheckpointRef};
use crate::stream::StreamMode;
use crate::types::TaskId;

/// Default superstep limit per run.
pub const DEFAULT_RECURSION_LIMIT: usize = 25;

/// Separator between namespace segments.
pub const NS_SEP: &str = "|";
/// Separator between a node name and its task id within a segment.
pub const NS_END: &str = ":";

/// When checkpoints are persisted relative to loop progress.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Durability {
    /// Persist opportunistically, in parallel with the next superstep.
    Async,
    /// Persist before the loop advances.
    #[default]
    Sync,
    /// Persist only at run end or on interrupt.
    Exit,
}

/// Per-run configuration.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Persistence scope; required whenever a checkpoint store is attached.
    pub thread_id: Option<String>,
    /// Hierarchical checkpoint namespace; empty at the root.
    pub checkpoint_ns: String,
    /// Pin a historical checkpoint to resume or fork from.
    pub checkpoint_id: Option<CheckpointId>,
    /// Maximum supersteps per run.
    pub recursion_limit: usize,
    /// Node names (or `*`) to pause before.
    pub interrupt_before: Vec<String>,
    /// Node names (or `*`) to pause after.
    pub interrupt_after: Vec<String>,
    pub durability: Durability,
    /// Stream modes for `App::stream`; defaults to `values` when empty.
    pub stream_modes: Vec<StreamMode>,
    /// Emit subgraph events alongside parent events, tagged with namespace.
    pub stream_subgraphs: bool,
    pub tags: Vec<String>,
    pub metadata: FxHashMap<String, Value>,
    pub run_id: Option<String>,
    pub run_name: Option<String>,
    /// Opaque key-value map passed through to node contexts.
    pub configurable: FxHashMap<String, Value>,
    /// Ancestor checkpoint per namespace; populated when the run executes as
    /// a subgraph and recorded into checkpoint metadata.
    pub parents: FxHashMap<String, CheckpointId>,
    /// External cancellation signal for the run.
    pub cancellation: CancellationToken,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            thread_id: None,
            checkpoint_ns: String::new(),
            checkpoint_id: None,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            interrupt_before: Vec::new(),
            interrupt_after: Vec::new(),
            durability: Durability::default(),
            stream_modes: Vec::new(),
            stream_subgraphs: false,
            tags: Vec::new(),
            metadata: FxHashMap::default(),
            run_id: None,
            run_name: None,
            configurable: FxHashMap::default(),
            parents: FxHashMap::default(),
            cancellation: CancellationToken::new(),
        }
    }
}

impl RunConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    #[must_use]
    pub fn with_checkpoint_id(mut self, id: CheckpointId) -> Self {
        self.checkpoint_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    #[must_use]
    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    #[must_use]
    pub fn with_interrupt_before<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interrupt_before = nodes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_interrupt_after<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interrupt_after = nodes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_stream_modes<I>(mut self, modes: I) -> Self
    where
        I: IntoIterator<Item = StreamMode>,
    {
        self.stream_modes = modes.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_stream_subgraphs(mut self, enabled: bool) -> Self {
        self.stream_subgraphs = enabled;
        self
    }

    #[must_use]
    pub fn with_configurable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.configurable.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Store address for this run, when a thread id is configured.
    #[must_use]
    pub fn checkpoint_ref(&self) -> Option<CheckpointRef> {
        self.thread_id.as_ref().map(|thread_id| CheckpointRef {
            thread_id: thread_id.clone(),
            namespace: self.checkpoint_ns.clone(),
            checkpoint_id: self.checkpoint_id,
        })
    }

    /// Stable fingerprint of `configurable` for deterministic task ids.
    ///
    /// Keys are sorted before serialization so hash-map iteration order
    /// cannot leak into task identity.
    #[must_use]
    pub fn configurable_fingerprint(&self) -> String {
        let sorted: BTreeMap<&String, &Value> = self.configurable.iter().collect();
        serde_json::to_string(&sorted).unwrap_or_default()
    }

    /// Does `node` match an interrupt list entry (exact or wildcard)?
    #[must_use]
    pub(crate) fn matches_breakpoint(list: &[String], node: &str) -> bool {
        list.iter()
            .any(|entry| entry == node || entry == crate::control::ALL_NODES)
    }
}

/// Namespace for a subgraph entered through `node` by task `task_id`.
#[must_use]
pub fn child_namespace(parent: &str, node: &str, task_id: &TaskId) -> String {
    if parent.is_empty() {
        format!("{node}{NS_END}{task_id}")
    } else {
        format!("{parent}{NS_SEP}{node}{NS_END}{task_id}")
    }
}
