//! Checkpoint model: immutable snapshots of channel state.
//!
//! A [`Checkpoint`] captures, at a superstep boundary, the serialized channel
//! values, the per-channel versions, the per-node record of versions already
//! observed, and the dispatch records scheduled for the next superstep. It is
//! the unit of persistence and the sole input to task planning, which is what
//! makes runs resumable from any point in a thread's history.

pub mod store;

use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channels::{ChannelError, Channels};
use crate::control::Send;
use crate::types::TaskId;

pub use store::{
    CheckpointRef, CheckpointStore, CheckpointTuple, InMemorySaver, ListFilter, StoreError,
};

/// Strictly ordered checkpoint identifier, unique within a
/// `(thread, namespace)` lineage.
///
/// Identifiers are allocated monotonically (`latest + 1`), never from the
/// clock, so replaying a run assigns the same ids and the task ids derived
/// from them stay stable.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CheckpointId(u64);

impl CheckpointId {
    /// Id of the first persisted checkpoint in a thread.
    #[must_use]
    pub fn first() -> Self {
        CheckpointId(1)
    }

    #[must_use]
    pub fn next(self) -> Self {
        CheckpointId(self.0 + 1)
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// What produced a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    /// Input mapping applied before the first planned superstep.
    Input,
    /// A completed superstep of the main loop.
    Loop,
    /// A state update synthesized through `update_state`.
    Update,
}

/// Metadata persisted alongside a checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub source: CheckpointSource,
    /// Superstep index; `-1` for the initial input checkpoint.
    pub step: i64,
    /// Parent checkpoint per ancestor namespace, recorded when a subgraph
    /// checkpoints beneath a parent task.
    pub parents: FxHashMap<String, CheckpointId>,
}

impl CheckpointMetadata {
    #[must_use]
    pub fn new(source: CheckpointSource, step: i64) -> Self {
        Self {
            source,
            step,
            parents: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_parent(mut self, namespace: impl Into<String>, id: CheckpointId) -> Self {
        self.parents.insert(namespace.into(), id);
        self
    }
}

/// Immutable snapshot of channel state at a superstep boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    /// Serialized value per channel, present only for channels that hold one.
    pub values: FxHashMap<String, Value>,
    /// Version per channel, present once the channel was first written.
    pub versions: FxHashMap<String, u64>,
    /// Per node, the channel versions it had observed when it last ran.
    /// The reserved `__interrupt__` key records what the breakpoint gate saw.
    pub versions_seen: FxHashMap<String, FxHashMap<String, u64>>,
    /// Dispatch records consumed by the planner at the start of the next
    /// superstep.
    pub pending_sends: Vec<Send>,
}

impl Checkpoint {
    /// Fresh, empty checkpoint for a thread that has no history yet.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            id: CheckpointId::default(),
            values: FxHashMap::default(),
            versions: FxHashMap::default(),
            versions_seen: FxHashMap::default(),
            pending_sends: Vec::new(),
        }
    }

    /// Version of `channel`, if it was ever written.
    #[must_use]
    pub fn version(&self, channel: &str) -> Option<u64> {
        self.versions.get(channel).copied()
    }

    /// Version of `channel` as last observed by `node`.
    #[must_use]
    pub fn seen(&self, node: &str, channel: &str) -> Option<u64> {
        self.versions_seen
            .get(node)
            .and_then(|seen| seen.get(channel))
            .copied()
    }

    /// Record that `node` has observed the given channel versions.
    pub fn record_seen(&mut self, node: &str, observed: impl IntoIterator<Item = (String, u64)>) {
        let seen = self.versions_seen.entry(node.to_string()).or_default();
        for (channel, version) in observed {
            seen.insert(channel, version);
        }
    }

    /// Refresh `values` from the live channels after an apply phase.
    pub fn sync_values(&mut self, channels: &Channels) {
        self.values = channels.checkpoint();
    }

    /// Rehydrate live channels from this checkpoint.
    pub fn restore_channels(&self, prototype: &Channels) -> Result<Channels, ChannelError> {
        let mut channels = prototype.clone();
        channels.restore(&self.values)?;
        Ok(channels)
    }
}

/// A single write persisted for crash recovery before it is applied.
///
/// Reserved channel names carry engine bookkeeping: `__error__` for a task's
/// terminal failure, `__interrupt__` for a raised interrupt, `__resume__` for
/// consumed resume values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub task_id: TaskId,
    pub channel: String,
    pub value: Value,
}

impl PendingWrite {
    #[must_use]
    pub fn new(task_id: TaskId, channel: impl Into<String>, value: Value) -> Self {
        Self {
            task_id,
            channel: channel.into(),
            value,
        }
    }
}
