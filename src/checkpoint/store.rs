//! Checkpoint persistence.
//!
//! The engine talks to storage exclusively through [`CheckpointStore`]; the
//! in-memory implementation here keeps the full lineage per
//! `(thread, namespace)` so history listing and forking work without a
//! durable backend. Store failures propagate to callers unwrapped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::sync::RwLock;
use thiserror::Error;

use super::{Checkpoint, CheckpointId, CheckpointMetadata, PendingWrite};

/// Address of a checkpoint lineage, optionally pinned to one checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CheckpointRef {
    pub thread_id: String,
    /// Hierarchical namespace; empty at the root, extended with
    /// `|node:task_id` segments when entering subgraphs.
    pub namespace: String,
    /// `None` addresses the latest checkpoint of the lineage.
    pub checkpoint_id: Option<CheckpointId>,
}

impl CheckpointRef {
    #[must_use]
    pub fn new(thread_id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            namespace: namespace.into(),
            checkpoint_id: None,
        }
    }

    #[must_use]
    pub fn at(mut self, id: CheckpointId) -> Self {
        self.checkpoint_id = Some(id);
        self
    }

    /// The same lineage without a pinned checkpoint.
    #[must_use]
    pub fn lineage(&self) -> Self {
        Self {
            thread_id: self.thread_id.clone(),
            namespace: self.namespace.clone(),
            checkpoint_id: None,
        }
    }
}

/// A loaded checkpoint with everything needed to resume from it.
#[derive(Clone, Debug)]
pub struct CheckpointTuple {
    /// Address pinned to the loaded checkpoint.
    pub config: CheckpointRef,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    /// Address of the parent checkpoint this one was appended to, if any.
    pub parent_config: Option<CheckpointRef>,
    /// Per-task writes persisted before they were applied (crash recovery,
    /// interrupt bookkeeping).
    pub pending_writes: Vec<PendingWrite>,
    pub created_at: DateTime<Utc>,
}

/// Options for [`CheckpointStore::list`].
#[derive(Clone, Debug, Default)]
pub struct ListFilter {
    /// Only checkpoints strictly older than this id.
    pub before: Option<CheckpointId>,
    pub limit: Option<usize>,
}

impl ListFilter {
    #[must_use]
    pub fn latest() -> Self {
        Self {
            before: None,
            limit: Some(1),
        }
    }
}

/// Errors from checkpoint store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    /// The addressed checkpoint does not exist.
    #[error("checkpoint not found: thread `{thread_id}`, namespace `{namespace}`")]
    #[diagnostic(
        code(skein::store::not_found),
        help("Verify the thread id and checkpoint id; the lineage may not have been written yet.")
    )]
    NotFound {
        thread_id: String,
        namespace: String,
    },

    /// Backend storage failure (database, filesystem, network).
    #[error("backend error: {message}")]
    #[diagnostic(
        code(skein::store::backend),
        help("Check backend connectivity and permissions; backend message: {message}.")
    )]
    Backend { message: String },

    /// Serialization of a checkpoint or its writes failed.
    #[error("serialization failed: {source}")]
    #[diagnostic(code(skein::store::serde))]
    Serde {
        #[from]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Abstract persistence for checkpoints and per-task pending writes.
///
/// Implementations must provide linearizable `put` per
/// `(thread_id, namespace)`; the engine serializes its own writes within a
/// run but concurrent runs on one thread are the store's problem.
#[async_trait]
pub trait CheckpointStore: std::marker::Send + Sync {
    /// Load the checkpoint addressed by `config`, or the latest of the
    /// lineage when no id is pinned. `Ok(None)` when the lineage is empty.
    async fn get_tuple(&self, config: &CheckpointRef) -> Result<Option<CheckpointTuple>>;

    /// List checkpoints of the lineage, newest first.
    async fn list(&self, config: &CheckpointRef, filter: ListFilter)
        -> Result<Vec<CheckpointTuple>>;

    /// Persist a full snapshot. `config.checkpoint_id` names the parent the
    /// snapshot was produced from; the returned address pins the new
    /// checkpoint.
    async fn put(
        &self,
        config: &CheckpointRef,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointRef>;

    /// Persist per-task writes against the checkpoint pinned by `config`.
    async fn put_writes(&self, config: &CheckpointRef, writes: Vec<PendingWrite>) -> Result<()>;
}

#[derive(Clone, Debug)]
struct StoredCheckpoint {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    parent: Option<CheckpointId>,
    writes: Vec<PendingWrite>,
    created_at: DateTime<Utc>,
}

/// In-memory checkpoint store retaining full history per lineage.
#[derive(Default)]
pub struct InMemorySaver {
    inner: RwLock<FxHashMap<(String, String), Vec<StoredCheckpoint>>>,
}

impl InMemorySaver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(config: &CheckpointRef) -> (String, String) {
        (config.thread_id.clone(), config.namespace.clone())
    }

    fn tuple_from(config: &CheckpointRef, stored: &StoredCheckpoint) -> CheckpointTuple {
        CheckpointTuple {
            config: config.lineage().at(stored.checkpoint.id),
            checkpoint: stored.checkpoint.clone(),
            metadata: stored.metadata.clone(),
            parent_config: stored.parent.map(|id| config.lineage().at(id)),
            pending_writes: stored.writes.clone(),
            created_at: stored.created_at,
        }
    }
}

#[async_trait]
impl CheckpointStore for InMemorySaver {
    async fn get_tuple(&self, config: &CheckpointRef) -> Result<Option<CheckpointTuple>> {
        let map = self.inner.read().map_err(|e| StoreError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        let Some(history) = map.get(&Self::key(config)) else {
            return Ok(None);
        };
        let stored = match config.checkpoint_id {
            Some(id) => history.iter().find(|s| s.checkpoint.id == id),
            None => history.iter().max_by_key(|s| s.checkpoint.id),
        };
        Ok(stored.map(|s| Self::tuple_from(config, s)))
    }

    async fn list(
        &self,
        config: &CheckpointRef,
        filter: ListFilter,
    ) -> Result<Vec<CheckpointTuple>> {
        let map = self.inner.read().map_err(|e| StoreError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        let Some(history) = map.get(&Self::key(config)) else {
            return Ok(Vec::new());
        };
        let mut tuples: Vec<&StoredCheckpoint> = history
            .iter()
            .filter(|s| filter.before.is_none_or(|before| s.checkpoint.id < before))
            .collect();
        tuples.sort_by_key(|s| std::cmp::Reverse(s.checkpoint.id));
        if let Some(limit) = filter.limit {
            tuples.truncate(limit);
        }
        Ok(tuples
            .into_iter()
            .map(|s| Self::tuple_from(config, s))
            .collect())
    }

    async fn put(
        &self,
        config: &CheckpointRef,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointRef> {
        let mut map = self.inner.write().map_err(|e| StoreError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        let history = map.entry(Self::key(config)).or_default();
        let id = checkpoint.id;
        let stored = StoredCheckpoint {
            checkpoint,
            metadata,
            parent: config.checkpoint_id,
            writes: Vec::new(),
            created_at: Utc::now(),
        };
        // Re-putting the same id replaces the snapshot (idempotent saves);
        // recorded writes and the original parent are preserved.
        if let Some(existing) = history.iter_mut().find(|s| s.checkpoint.id == id) {
            let writes = std::mem::take(&mut existing.writes);
            let parent = existing.parent;
            *existing = StoredCheckpoint {
                writes,
                parent,
                ..stored
            };
        } else {
            history.push(stored);
        }
        Ok(config.lineage().at(id))
    }

    async fn put_writes(&self, config: &CheckpointRef, writes: Vec<PendingWrite>) -> Result<()> {
        let Some(id) = config.checkpoint_id else {
            return Err(StoreError::Backend {
                message: "put_writes requires a pinned checkpoint id".to_string(),
            });
        };
        let mut map = self.inner.write().map_err(|e| StoreError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        let stored = map
            .get_mut(&Self::key(config))
            .and_then(|history| history.iter_mut().find(|s| s.checkpoint.id == id))
            .ok_or_else(|| StoreError::NotFound {
                thread_id: config.thread_id.clone(),
                namespace: config.namespace.clone(),
            })?;
        stored.writes.extend(writes);
        Ok(())
    }
}
