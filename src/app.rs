//! The compiled graph and its execution surface.
//!
//! [`App`] is what [`GraphBuilder`](crate::graphs::GraphBuilder) compiles
//! into: the node specs, the channel prototypes, persistence handles, and
//! the version generator. It is cheap to clone (contents are shared) and a
//! single `App` can serve many concurrent runs, each isolated by its
//! [`RunConfig`].
//!
//! # Entry points
//!
//! - [`App::invoke`] — run to completion, interrupt, or failure.
//! - [`App::stream`] — run in the background, yielding engine events.
//! - [`App::get_state`] / [`App::get_state_history`] — inspect a thread.
//! - [`App::update_state`] / [`App::bulk_update_state`] — synthesize
//!   checkpoints as if a node had produced the given writes (time travel,
//!   forking, manual repair).

use std::sync::Arc;

use futures_util::future::BoxFuture;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::instrument;

use crate::channels::Channels;
use crate::checkpoint::{
    Checkpoint, CheckpointId, CheckpointMetadata, CheckpointSource, CheckpointStore,
    CheckpointTuple, ListFilter, StoreError,
};
use crate::control::{GraphInput, Interrupt, COPY, END, ERROR, INPUT, INTERRUPT, RESUME, TASKS};
use crate::graphs::NodeSpec;
use crate::runtimes::barrier::{apply_writes, TaskWrites};
use crate::runtimes::planner::plan_step;
use crate::runtimes::runner::{GraphRunner, RunOutcome};
use crate::runtimes::{CacheStore, GraphError, RunConfig, Tracer, VersionGenerator};
use crate::snapshot::{StateSnapshot, TaskDescription};
use crate::stream::{EventStream, StreamEmitter, StreamMode};
use crate::types::{derive_task_id, TaskPath};

/// One update inside a bulk superstep.
#[derive(Clone, Debug)]
pub struct StateUpdate {
    /// Channel writes, as an object keyed by channel (or a bare value when
    /// the graph has a single input channel).
    pub values: Value,
    /// The node these writes are attributed to.
    pub as_node: Option<String>,
}

impl StateUpdate {
    #[must_use]
    pub fn new(values: Value, as_node: Option<&str>) -> Self {
        Self {
            values,
            as_node: as_node.map(str::to_string),
        }
    }
}

/// One atomically-applied superstep of a bulk update.
#[derive(Clone, Debug)]
pub struct BulkSuperstep {
    pub updates: Vec<StateUpdate>,
}

impl BulkSuperstep {
    #[must_use]
    pub fn new(updates: Vec<StateUpdate>) -> Self {
        Self { updates }
    }
}

/// An executable graph.
#[derive(Clone)]
pub struct App {
    nodes: Arc<Vec<NodeSpec>>,
    channels: Channels,
    input_channels: Arc<Vec<String>>,
    output_channels: Arc<Vec<String>>,
    store: Option<Arc<dyn CheckpointStore>>,
    cache: Option<Arc<dyn CacheStore>>,
    tracer: Option<Arc<dyn Tracer>>,
    version_gen: VersionGenerator,
}

impl App {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        nodes: Vec<NodeSpec>,
        channels: Channels,
        input_channels: Vec<String>,
        output_channels: Vec<String>,
        store: Option<Arc<dyn CheckpointStore>>,
        cache: Option<Arc<dyn CacheStore>>,
        tracer: Option<Arc<dyn Tracer>>,
        version_gen: VersionGenerator,
    ) -> Self {
        Self {
            nodes: Arc::new(nodes),
            channels,
            input_channels: Arc::new(input_channels),
            output_channels: Arc::new(output_channels),
            store,
            cache,
            tracer,
            version_gen,
        }
    }

    pub(crate) fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub(crate) fn nodes_arc(&self) -> &Arc<Vec<NodeSpec>> {
        &self.nodes
    }

    pub(crate) fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|spec| spec.name == name)
    }

    pub(crate) fn channels(&self) -> &Channels {
        &self.channels
    }

    pub(crate) fn input_channels(&self) -> &[String] {
        &self.input_channels
    }

    pub(crate) fn output_channels(&self) -> &[String] {
        &self.output_channels
    }

    pub(crate) fn store(&self) -> Option<&Arc<dyn CheckpointStore>> {
        self.store.as_ref()
    }

    pub(crate) fn cache(&self) -> Option<&Arc<dyn CacheStore>> {
        self.cache.as_ref()
    }

    pub(crate) fn tracer(&self) -> Option<&Arc<dyn Tracer>> {
        self.tracer.as_ref()
    }

    pub(crate) fn version_gen(&self) -> &VersionGenerator {
        &self.version_gen
    }

    pub(crate) async fn run_internal(
        &self,
        input: GraphInput,
        config: RunConfig,
        store_override: Option<Arc<dyn CheckpointStore>>,
        emitter: StreamEmitter,
    ) -> Result<RunOutcome, GraphError> {
        GraphRunner::new(self.clone(), config, store_override, emitter)
            .run(input)
            .await
    }

    /// Run until completion, interrupt, or a terminal condition, returning
    /// the output-channel projection.
    ///
    /// A paused run also returns `Ok`: inspect [`App::get_state`] for the
    /// pending tasks and their interrupts.
    #[instrument(skip(self, input, config), err)]
    pub async fn invoke(
        &self,
        input: impl Into<GraphInput>,
        config: RunConfig,
    ) -> Result<Value, GraphError> {
        let outcome = self
            .run_internal(input.into(), config, None, StreamEmitter::disabled())
            .await?;
        Ok(outcome.output)
    }

    /// Run in a background task, yielding engine events as they occur.
    ///
    /// The returned sequence is finite and not restartable; it ends when the
    /// run finishes, after which [`EventStream::join`] yields the outcome.
    pub fn stream(&self, input: impl Into<GraphInput>, config: RunConfig) -> EventStream {
        let modes = if config.stream_modes.is_empty() {
            vec![StreamMode::Values]
        } else {
            config.stream_modes.clone()
        };
        let (tx, rx) = flume::unbounded();
        let emitter = StreamEmitter::new(
            tx,
            modes,
            config.checkpoint_ns.clone(),
            config.stream_subgraphs,
        );
        let app = self.clone();
        let input = input.into();
        let handle = tokio::spawn(async move {
            app.run_internal(input, config, None, emitter)
                .await
                .map(|outcome| outcome.output)
        });
        EventStream::new(rx, handle)
    }

    /// Snapshot the thread at the configured (or latest) checkpoint.
    ///
    /// With `subgraphs`, pending subgraph tasks carry their own nested
    /// snapshots.
    pub async fn get_state(
        &self,
        config: &RunConfig,
        subgraphs: bool,
    ) -> Result<StateSnapshot, GraphError> {
        let store = self.require_store("state inspection")?;
        let config_ref = config
            .checkpoint_ref()
            .ok_or(GraphError::MissingConfig { what: "thread_id" })?;
        let tuple = store.get_tuple(&config_ref).await?.ok_or_else(|| {
            GraphError::Store(StoreError::NotFound {
                thread_id: config_ref.thread_id.clone(),
                namespace: config_ref.namespace.clone(),
            })
        })?;
        self.snapshot_from_tuple(config, tuple, subgraphs).await
    }

    /// Checkpoint history of the thread, newest first.
    pub async fn get_state_history(
        &self,
        config: &RunConfig,
        limit: Option<usize>,
        before: Option<CheckpointId>,
    ) -> Result<Vec<StateSnapshot>, GraphError> {
        let store = self.require_store("state history")?;
        let config_ref = config
            .checkpoint_ref()
            .ok_or(GraphError::MissingConfig { what: "thread_id" })?;
        let tuples = store
            .list(&config_ref.lineage(), ListFilter { before, limit })
            .await?;
        let mut snapshots = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            snapshots.push(self.snapshot_from_tuple(config, tuple, false).await?);
        }
        Ok(snapshots)
    }

    /// Append a checkpoint as if `as_node` had produced `values`, returning
    /// a config pinned to it.
    ///
    /// Pointing `config.checkpoint_id` at a historical checkpoint forks the
    /// thread: the new checkpoint shares ancestors with the original branch.
    #[instrument(skip(self, config, values), err)]
    pub async fn update_state(
        &self,
        config: &RunConfig,
        values: Value,
        as_node: Option<&str>,
    ) -> Result<RunConfig, GraphError> {
        let supersteps = vec![BulkSuperstep::new(vec![StateUpdate::new(values, as_node)])];
        self.bulk_update_state(config, supersteps).await
    }

    /// Apply a sequence of update supersteps atomically, one checkpoint per
    /// superstep.
    pub async fn bulk_update_state(
        &self,
        config: &RunConfig,
        supersteps: Vec<BulkSuperstep>,
    ) -> Result<RunConfig, GraphError> {
        let store = self.require_store("state updates")?;
        let config_ref = config
            .checkpoint_ref()
            .ok_or(GraphError::MissingConfig { what: "thread_id" })?;
        if supersteps.is_empty() {
            return Err(GraphError::InvalidInput {
                reason: "bulk update requires at least one superstep".to_string(),
            });
        }

        let tuple = store.get_tuple(&config_ref).await?;
        if tuple.is_none() && config_ref.checkpoint_id.is_some() {
            return Err(GraphError::Store(StoreError::NotFound {
                thread_id: config_ref.thread_id.clone(),
                namespace: config_ref.namespace.clone(),
            }));
        }
        let head = store
            .list(&config_ref.lineage(), ListFilter::latest())
            .await?;
        let mut last_id = head
            .first()
            .map(|t| t.checkpoint.id)
            .unwrap_or_default();

        let (mut checkpoint, mut channels, mut meta_step, mut parent_ref, mut has_history) =
            match tuple {
                Some(tuple) => {
                    let channels = tuple.checkpoint.restore_channels(&self.channels)?;
                    (
                        tuple.checkpoint,
                        channels,
                        tuple.metadata.step,
                        tuple.config,
                        true,
                    )
                }
                None => (
                    Checkpoint::empty(),
                    self.channels.clone(),
                    -2,
                    config_ref.lineage(),
                    false,
                ),
            };

        let fingerprint = config.configurable_fingerprint();
        let mut pinned = parent_ref.clone();
        for superstep in supersteps {
            if superstep.updates.is_empty() {
                return Err(GraphError::InvalidInput {
                    reason: "bulk superstep has no updates".to_string(),
                });
            }
            let is_input_step = !has_history;
            let mut task_writes: Vec<TaskWrites> = Vec::with_capacity(superstep.updates.len());
            for update in &superstep.updates {
                let as_node = self.resolve_as_node(update.as_node.as_deref(), is_input_step)?;
                self.reject_reserved_markers(&as_node, &update.values)?;
                let writes = self.writes_from_values(update.values.clone())?;
                let observed = self.observed_for(&as_node, &checkpoint);
                task_writes.push(TaskWrites {
                    id: derive_task_id(
                        checkpoint.id,
                        &config.checkpoint_ns,
                        &TaskPath::Pull(as_node.clone()),
                        &fingerprint,
                    ),
                    name: as_node,
                    observed,
                    writes,
                });
            }

            // Updates never consume pending sends, but they may add some.
            let prior_sends = std::mem::take(&mut checkpoint.pending_sends);
            apply_writes(&mut checkpoint, &mut channels, &task_writes, &self.version_gen)?;
            let mut sends = prior_sends;
            sends.append(&mut checkpoint.pending_sends);
            checkpoint.pending_sends = sends;

            last_id = last_id.next();
            checkpoint.id = last_id;
            meta_step = if is_input_step { -1 } else { meta_step + 1 };
            let source = if is_input_step {
                CheckpointSource::Input
            } else {
                CheckpointSource::Update
            };
            let mut metadata = CheckpointMetadata::new(source, meta_step);
            metadata.parents = config.parents.clone();

            pinned = store.put(&parent_ref, checkpoint.clone(), metadata).await?;
            parent_ref = pinned.clone();
            has_history = true;
        }

        let mut next = config.clone();
        next.checkpoint_id = pinned.checkpoint_id;
        Ok(next)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn require_store(&self, feature: &'static str) -> Result<Arc<dyn CheckpointStore>, GraphError> {
        self.store
            .clone()
            .ok_or(GraphError::NoCheckpointer { feature })
    }

    fn resolve_as_node(
        &self,
        as_node: Option<&str>,
        is_input_step: bool,
    ) -> Result<String, GraphError> {
        match as_node {
            Some(INPUT) => Ok(INPUT.to_string()),
            Some(name) => {
                if self.node(name).is_none() {
                    return Err(GraphError::UnknownNode {
                        name: name.to_string(),
                    });
                }
                Ok(name.to_string())
            }
            None if is_input_step => Ok(INPUT.to_string()),
            None => {
                if let [only] = self.nodes.as_slice() {
                    Ok(only.name.clone())
                } else {
                    Err(GraphError::InvalidInput {
                        reason: "as_node is required when it cannot be inferred".to_string(),
                    })
                }
            }
        }
    }

    fn reject_reserved_markers(&self, as_node: &str, values: &Value) -> Result<(), GraphError> {
        let mut markers = vec![];
        if as_node == END || as_node == COPY {
            markers.push(as_node.to_string());
        }
        if let Value::Object(map) = values {
            for key in [END, COPY] {
                if map.contains_key(key) {
                    markers.push(key.to_string());
                }
            }
        }
        if markers.is_empty() {
            Ok(())
        } else {
            Err(GraphError::InvalidInput {
                reason: format!("reserved markers in bulk superstep: {}", markers.join(", ")),
            })
        }
    }

    fn writes_from_values(&self, values: Value) -> Result<Vec<(String, Value)>, GraphError> {
        match values {
            Value::Object(map) => Ok(map.into_iter().collect()),
            other => {
                if let [only] = self.input_channels.as_slice() {
                    Ok(vec![(only.clone(), other)])
                } else {
                    Err(GraphError::InvalidInput {
                        reason: "state update values must be an object keyed by channel"
                            .to_string(),
                    })
                }
            }
        }
    }

    /// Trigger versions `as_node` would have observed, mirroring what the
    /// planner records for a live run.
    fn observed_for(&self, as_node: &str, checkpoint: &Checkpoint) -> Vec<(String, u64)> {
        let Some(spec) = self.node(as_node) else {
            return Vec::new();
        };
        spec.triggers
            .iter()
            .filter_map(|trigger| {
                checkpoint
                    .version(trigger)
                    .map(|version| (trigger.clone(), version))
            })
            .collect()
    }

    fn snapshot_from_tuple<'a>(
        &'a self,
        config: &'a RunConfig,
        tuple: CheckpointTuple,
        subgraphs: bool,
    ) -> BoxFuture<'a, Result<StateSnapshot, GraphError>> {
        Box::pin(async move {
            let channels = tuple.checkpoint.restore_channels(&self.channels)?;
            let planned = plan_step(&tuple.checkpoint, &channels, &self.nodes, config);

            let mut tasks: Vec<TaskDescription> = Vec::with_capacity(planned.len());
            let mut next: Vec<String> = Vec::new();
            for task in &planned {
                if !next.contains(&task.name) {
                    next.push(task.name.clone());
                }

                let mut interrupts: Vec<Interrupt> = Vec::new();
                let mut resolved = 0usize;
                let mut error: Option<String> = None;
                let mut result: FxHashMap<String, Value> = FxHashMap::default();
                for write in &tuple.pending_writes {
                    if write.task_id != task.id {
                        continue;
                    }
                    match write.channel.as_str() {
                        INTERRUPT => {
                            if let Ok(interrupt) =
                                serde_json::from_value::<Interrupt>(write.value.clone())
                            {
                                interrupts.push(interrupt);
                            }
                        }
                        RESUME => resolved += 1,
                        ERROR => error = write.value.as_str().map(str::to_string),
                        TASKS => {}
                        channel => {
                            result.insert(channel.to_string(), write.value.clone());
                        }
                    }
                }
                // Interrupts answered by a recorded resume value are no
                // longer pending.
                let interrupts: Vec<Interrupt> =
                    interrupts.into_iter().skip(resolved).collect();

                let spec = self.node(&task.name);
                let state = match (subgraphs, spec.and_then(|s| s.subgraph.as_ref())) {
                    (true, Some(child)) => {
                        let child_config = RunConfig {
                            thread_id: config.thread_id.clone(),
                            checkpoint_ns: crate::runtimes::child_namespace(
                                &config.checkpoint_ns,
                                &task.name,
                                &task.id,
                            ),
                            ..RunConfig::default()
                        };
                        let child = Arc::clone(child);
                        match child.get_state(&child_config, true).await {
                            Ok(snapshot) => Some(Box::new(snapshot)),
                            Err(GraphError::Store(StoreError::NotFound { .. })) => None,
                            Err(other) => return Err(other),
                        }
                    }
                    _ => None,
                };

                tasks.push(TaskDescription {
                    id: task.id.clone(),
                    name: task.name.clone(),
                    path: task.path.clone(),
                    interrupts,
                    state,
                    error,
                    result: if result.is_empty() { None } else { Some(result) },
                });
            }

            Ok(StateSnapshot {
                values: tuple.checkpoint.values.clone(),
                next,
                tasks,
                config: tuple.config,
                parent_config: tuple.parent_config,
                metadata: tuple.metadata,
                created_at: tuple.created_at,
            })
        })
    }
}
