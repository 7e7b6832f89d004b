//! Write application: the barrier at the end of a superstep.
//!
//! All task writes are collected in task order (write order preserved within
//! a task), grouped per channel, and merged through each channel's own rule
//! in a single call. A merge rejection fails the superstep before any
//! version is bumped or checkpoint produced: the previous step remains the
//! durable state. Writes addressed to the reserved tasks channel become the
//! next checkpoint's pending sends instead of channel updates.

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::channels::{ChannelError, Channels};
use crate::checkpoint::Checkpoint;
use crate::control::{Send, TASKS};
use crate::runtimes::runner::GraphError;
use crate::runtimes::VersionGenerator;
use crate::types::TaskId;

/// One completed task's contribution to the barrier.
#[derive(Clone, Debug)]
pub(crate) struct TaskWrites {
    pub id: TaskId,
    pub name: String,
    /// Trigger versions captured at planning time.
    pub observed: Vec<(String, u64)>,
    pub writes: Vec<(String, Value)>,
}

/// Result of applying one superstep's writes. Extracted sends land directly
/// on the checkpoint's `pending_sends`.
#[derive(Clone, Debug)]
pub(crate) struct AppliedStep {
    /// Channels whose version advanced, in declaration order.
    pub updated_channels: Vec<String>,
}

/// Merge the superstep's writes into the channels and the checkpoint.
///
/// On success the checkpoint's `values`, `versions`, `versions_seen`, and
/// `pending_sends` reflect the new state; the caller assigns the new
/// checkpoint id and persists.
pub(crate) fn apply_writes(
    checkpoint: &mut Checkpoint,
    channels: &mut Channels,
    tasks: &[TaskWrites],
    version_gen: &VersionGenerator,
) -> Result<AppliedStep, GraphError> {
    let mut pending_sends: Vec<Send> = Vec::new();
    let mut grouped: FxHashMap<&str, Vec<Value>> = FxHashMap::default();

    for task in tasks {
        for (channel, value) in &task.writes {
            if channel == TASKS {
                let send: Send = serde_json::from_value(value.clone()).map_err(|e| {
                    GraphError::InvalidInput {
                        reason: format!("malformed send from node `{}`: {e}", task.name),
                    }
                })?;
                pending_sends.push(send);
                continue;
            }
            if !channels.contains(channel) {
                return Err(GraphError::Channel(ChannelError::Unknown {
                    channel: channel.clone(),
                }));
            }
            grouped.entry(channel.as_str()).or_default().push(value.clone());
        }
    }

    // Merge in declaration order; channels not written this step get an
    // empty update so reset-semantics variants can decay.
    let names: Vec<String> = channels.names().to_vec();
    let mut updated_channels: Vec<String> = Vec::new();
    for name in &names {
        let writes = grouped.remove(name.as_str()).unwrap_or_default();
        let changed = channels.apply(name, writes)?;
        if changed {
            let previous = checkpoint.versions.get(name).copied();
            let next = (version_gen.as_ref())(previous, name);
            checkpoint.versions.insert(name.clone(), next);
            tracing::debug!(
                channel = %name,
                from = ?previous,
                to = next,
                "channel updated"
            );
            updated_channels.push(name.clone());
        }
    }

    checkpoint.sync_values(channels);
    for task in tasks {
        checkpoint.record_seen(&task.name, task.observed.iter().cloned());
    }
    checkpoint.pending_sends = pending_sends;

    Ok(AppliedStep { updated_channels })
}

/// Read channel values as one task would see them.
///
/// With `fresh`, the task's buffered writes are applied on a copy of the
/// channels before reading, so routing can observe what the task just
/// produced without exposing it to sibling tasks. Shared state is never
/// mutated.
pub fn local_read(
    channels: &Channels,
    writes: &[(String, Value)],
    select: &[String],
    fresh: bool,
) -> Result<FxHashMap<String, Value>, ChannelError> {
    let read_from = |channels: &Channels| {
        let mut values = FxHashMap::default();
        for name in select {
            if !channels.contains(name) {
                return Err(ChannelError::Unknown {
                    channel: name.clone(),
                });
            }
            if let Some(cell) = channels.get(name)
                && let Some(value) = cell.value()
            {
                values.insert(name.clone(), value);
            }
        }
        Ok(values)
    };

    if !fresh {
        return read_from(channels);
    }

    let mut scratch = channels.clone();
    let mut grouped: FxHashMap<&str, Vec<Value>> = FxHashMap::default();
    for (channel, value) in writes {
        if channel == TASKS {
            continue;
        }
        grouped.entry(channel.as_str()).or_default().push(value.clone());
    }
    for (channel, values) in grouped {
        scratch.apply(channel, values)?;
    }
    read_from(&scratch)
}
