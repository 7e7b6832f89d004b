//! Core identity types for the skein execution engine.
//!
//! This module defines the identifiers the engine uses to name units of
//! work: [`TaskId`] (deterministic per task per checkpoint) and [`TaskPath`]
//! (how a task came to be scheduled). Both are derived with a seed-free
//! hash so identical runs produce identical identifiers, which is what makes
//! retries, caching, and crash recovery safe.

use std::fmt;
use std::hash::Hasher;

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointId;

/// How a task was scheduled.
///
/// - `Pull(node)`: a subscribed channel advanced since the node last ran.
/// - `Push(index)`: the task was created from the pending send at `index`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPath {
    Pull(String),
    Push(usize),
}

impl TaskPath {
    /// Encode the path into its stable string form, used for hashing and
    /// persistence.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            TaskPath::Pull(node) => format!("pull:{node}"),
            TaskPath::Push(index) => format!("push:{index}"),
        }
    }
}

impl fmt::Display for TaskPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Deterministic task identifier.
///
/// Derived from the checkpoint id, the checkpoint namespace, the task path,
/// and the run's `configurable` map. Two runs planning the same superstep
/// from the same checkpoint assign the same ids, so persisted per-task
/// writes can be matched back to their tasks on resume.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Seed-free 64-bit hash over length-prefixed byte parts.
///
/// `FxHasher` has no per-process random state, so the result is stable
/// across runs for the same inputs.
fn stable_hash(domain: u8, parts: &[&[u8]]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_u8(domain);
    for part in parts {
        hasher.write_usize(part.len());
        hasher.write(part);
    }
    hasher.finish()
}

/// 128-bit hex digest from two domain-separated passes.
fn stable_digest(parts: &[&[u8]]) -> String {
    let hi = stable_hash(0xA1, parts);
    let lo = stable_hash(0xB7, parts);
    format!("{hi:016x}{lo:016x}")
}

/// Derive the deterministic id for a task planned from `checkpoint`.
#[must_use]
pub fn derive_task_id(
    checkpoint: CheckpointId,
    namespace: &str,
    path: &TaskPath,
    configurable: &str,
) -> TaskId {
    let checkpoint_bytes = checkpoint.value().to_be_bytes();
    let encoded_path = path.encode();
    TaskId(stable_digest(&[
        &checkpoint_bytes,
        namespace.as_bytes(),
        encoded_path.as_bytes(),
        configurable.as_bytes(),
    ]))
}

/// Derive the id for the `index`-th interrupt raised by a task.
///
/// Deliberately independent of the checkpoint id: a task re-executed after a
/// resume raises interrupts with the same ids as the original attempt, so
/// repeated resumption converges.
#[must_use]
pub fn derive_interrupt_id(namespace: &str, node: &str, path: &TaskPath, index: usize) -> String {
    let encoded_path = path.encode();
    let index_bytes = (index as u64).to_be_bytes();
    stable_digest(&[
        namespace.as_bytes(),
        node.as_bytes(),
        encoded_path.as_bytes(),
        &index_bytes,
    ])
}

/// Derive the cache key for a node invocation from its serialized input.
#[must_use]
pub fn derive_cache_key(node: &str, input_json: &str) -> String {
    stable_digest(&[node.as_bytes(), input_json.as_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_stable() {
        let a = derive_task_id(
            CheckpointId::first(),
            "",
            &TaskPath::Pull("worker".into()),
            "{}",
        );
        let b = derive_task_id(
            CheckpointId::first(),
            "",
            &TaskPath::Pull("worker".into()),
            "{}",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn task_ids_distinguish_paths() {
        let pull = derive_task_id(
            CheckpointId::first(),
            "",
            &TaskPath::Pull("worker".into()),
            "{}",
        );
        let push = derive_task_id(CheckpointId::first(), "", &TaskPath::Push(0), "{}");
        assert_ne!(pull, push);
    }

    #[test]
    fn interrupt_ids_ignore_checkpoint_identity() {
        let path = TaskPath::Pull("gate".into());
        let first = derive_interrupt_id("ns", "gate", &path, 0);
        let second = derive_interrupt_id("ns", "gate", &path, 0);
        assert_eq!(first, second);
        assert_ne!(first, derive_interrupt_id("ns", "gate", &path, 1));
    }

    #[test]
    fn path_encoding_is_stable() {
        assert_eq!(TaskPath::Pull("a".into()).encode(), "pull:a");
        assert_eq!(TaskPath::Push(3).encode(), "push:3");
    }
}
