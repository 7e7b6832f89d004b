//! Task planning.
//!
//! Given a checkpoint, the live channels, and the node specs, produce the
//! ordered task set for the next superstep:
//!
//! 1. Every pending send becomes a push task, in send order, provided the
//!    target node exists and declares at least one writer; other sends are
//!    dropped with a trace note.
//! 2. A node gets a pull task when one of its trigger channels advanced past
//!    the version it last observed, that channel holds a value, and all of
//!    its read channels hold values.
//! 3. Deferred nodes are held back while any non-deferred task is ready;
//!    once nothing else is, all ready deferred nodes run as one batch.
//!
//! Task ids are deterministic (checkpoint id + namespace + path +
//! configuration), so re-planning the same superstep after a crash or an
//! interrupt reproduces the same ids.

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::channels::Channels;
use crate::checkpoint::Checkpoint;
use crate::control::TASKS;
use crate::graphs::NodeSpec;
use crate::runtimes::RunConfig;
use crate::types::{derive_task_id, TaskId, TaskPath};

/// A task scheduled for one superstep.
#[derive(Clone, Debug)]
pub(crate) struct PlannedTask {
    pub id: TaskId,
    pub name: String,
    pub path: TaskPath,
    pub input: Value,
    pub triggers: Vec<String>,
    /// Trigger versions at planning time; recorded as seen when the task's
    /// writes are applied, so a node does not re-fire on versions it already
    /// consumed but does re-fire on its own writes.
    pub observed: Vec<(String, u64)>,
}

/// Plan the task set for the superstep following `checkpoint`.
pub(crate) fn plan_step(
    checkpoint: &Checkpoint,
    channels: &Channels,
    nodes: &[NodeSpec],
    config: &RunConfig,
) -> Vec<PlannedTask> {
    let fingerprint = config.configurable_fingerprint();
    let namespace = &config.checkpoint_ns;
    let mut tasks: Vec<PlannedTask> = Vec::new();
    let mut seen_ids: FxHashSet<TaskId> = FxHashSet::default();

    // Push tasks, in send order.
    for (index, send) in checkpoint.pending_sends.iter().enumerate() {
        let Some(spec) = nodes.iter().find(|spec| spec.name == send.target) else {
            tracing::debug!(target = %send.target, "dropping send: unknown node");
            continue;
        };
        if spec.writes.is_empty() {
            tracing::debug!(target = %send.target, "dropping send: node declares no writers");
            continue;
        }
        let path = TaskPath::Push(index);
        let id = derive_task_id(checkpoint.id, namespace, &path, &fingerprint);
        if !seen_ids.insert(id.clone()) {
            continue;
        }
        tasks.push(PlannedTask {
            id,
            name: spec.name.clone(),
            path,
            input: send.payload.clone(),
            triggers: vec![TASKS.to_string()],
            observed: Vec::new(),
        });
    }
    let push_ready = !tasks.is_empty();

    // Pull tasks, in node declaration order; deferred nodes collected apart.
    let mut ready: Vec<PlannedTask> = Vec::new();
    let mut deferred: Vec<PlannedTask> = Vec::new();
    for spec in nodes {
        let mut triggered = false;
        let mut observed: Vec<(String, u64)> = Vec::new();
        for trigger in &spec.triggers {
            let Some(version) = checkpoint.version(trigger) else {
                continue;
            };
            observed.push((trigger.clone(), version));
            let advanced = checkpoint
                .seen(&spec.name, trigger)
                .is_none_or(|seen| version > seen);
            if advanced && channels.is_available(trigger) {
                triggered = true;
            }
        }
        if !triggered {
            continue;
        }
        let reads = spec.effective_reads();
        if !reads.iter().all(|read| channels.is_available(read)) {
            continue;
        }

        let path = TaskPath::Pull(spec.name.clone());
        let id = derive_task_id(checkpoint.id, namespace, &path, &fingerprint);
        if !seen_ids.insert(id.clone()) {
            continue;
        }
        let task = PlannedTask {
            id,
            name: spec.name.clone(),
            path,
            input: map_input(spec, channels),
            triggers: spec.triggers.clone(),
            observed,
        };
        if spec.defer {
            deferred.push(task);
        } else {
            ready.push(task);
        }
    }

    if push_ready || !ready.is_empty() {
        if !deferred.is_empty() {
            tracing::debug!(
                held = deferred.len(),
                "holding deferred nodes behind ready peers"
            );
        }
        tasks.extend(ready);
    } else {
        tasks.extend(deferred);
    }
    tasks
}

/// Map a node's read channels into its input payload: the raw value for a
/// single read, an object keyed by channel otherwise, unless the node
/// supplies its own mapper.
fn map_input(spec: &NodeSpec, channels: &Channels) -> Value {
    let reads = spec.effective_reads();
    let mut values: FxHashMap<String, Value> = FxHashMap::default();
    for read in reads {
        if let Ok(value) = channels.read(read) {
            values.insert(read.clone(), value);
        }
    }
    if let Some(mapper) = &spec.input_map {
        return (mapper.as_ref())(&values);
    }
    match reads {
        [only] => values.remove(only).unwrap_or(Value::Null),
        _ => Value::Object(values.into_iter().collect()),
    }
}
