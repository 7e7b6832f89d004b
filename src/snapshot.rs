//! State snapshots for inspection and time travel.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::checkpoint::{CheckpointMetadata, CheckpointRef};
use crate::control::Interrupt;
use crate::types::{TaskId, TaskPath};

/// Read-only view of a thread at one checkpoint.
#[derive(Clone, Debug)]
pub struct StateSnapshot {
    /// Channel values at the checkpoint.
    pub values: FxHashMap<String, Value>,
    /// Names of the nodes the next superstep would run.
    pub next: Vec<String>,
    /// The planned tasks, with any recorded interrupts, errors, and results.
    pub tasks: Vec<TaskDescription>,
    /// Address pinned to this checkpoint.
    pub config: CheckpointRef,
    /// Address of the parent checkpoint, if any.
    pub parent_config: Option<CheckpointRef>,
    pub metadata: CheckpointMetadata,
    pub created_at: DateTime<Utc>,
}

/// One planned task in a snapshot.
#[derive(Clone, Debug)]
pub struct TaskDescription {
    pub id: TaskId,
    pub name: String,
    pub path: TaskPath,
    /// Interrupts the task has raised and not yet resolved.
    pub interrupts: Vec<Interrupt>,
    /// Nested snapshot when the task mounts a subgraph and nested state was
    /// requested.
    pub state: Option<Box<StateSnapshot>>,
    /// Recorded terminal failure, if any.
    pub error: Option<String>,
    /// Writes already recorded for the task (crash recovery), by channel.
    pub result: Option<FxHashMap<String, Value>>,
}
