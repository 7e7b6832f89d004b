//! The superstep loop.
//!
//! One run is a state machine: load the latest (or pinned) checkpoint, then
//! repeat plan → run → apply → checkpoint until planning produces no tasks,
//! an interrupt pauses the run, the recursion limit trips, or a task fails.
//! Tasks of one superstep execute concurrently on the cooperative scheduler
//! with per-task write buffers; channel state is only mutated at the apply
//! barrier, which also decides version bumps and extracts pending sends.
//!
//! Interrupt handling persists the partial superstep as per-task pending
//! writes: completed siblings keep their writes, the interrupted task keeps
//! its raised interrupt and any consumed resume values. Resuming re-plans
//! the same superstep from the same checkpoint — deterministic task ids make
//! the recorded writes land on the same tasks — so only the interrupted task
//! re-executes.

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::instrument;

use crate::app::App;
use crate::channels::{ChannelError, Channels};
use crate::checkpoint::{
    Checkpoint, CheckpointId, CheckpointMetadata, CheckpointRef, CheckpointSource, CheckpointStore,
    CheckpointTuple, ListFilter, PendingWrite, StoreError,
};
use crate::control::{
    Command, CommandScope, GraphInput, Goto, Interrupt, ResumeValue, Send as SendPacket, ERROR,
    INPUT, INTERRUPT, RESUME, TASKS,
};
use crate::graphs::NodeSpec;
use crate::node::{NodeContext, NodeError, NodeOutput, RetryPolicy};
use crate::runtimes::barrier::{apply_writes, local_read, TaskWrites};
use crate::runtimes::planner::{plan_step, PlannedTask};
use crate::runtimes::tracer::TraceTask;
use crate::runtimes::{Durability, RunConfig};
use crate::stream::{DebugRecord, StreamEmitter, StreamEvent, StreamMode, MESSAGES_CHANNEL};
use crate::types::{derive_cache_key, derive_interrupt_id, derive_task_id, TaskId, TaskPath};

/// Errors that abort a run.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    /// The superstep limit was exceeded.
    #[error("graph recursion limit of {limit} supersteps exceeded")]
    #[diagnostic(
        code(skein::runner::recursion),
        help("Raise recursion_limit on the run config, or break the cycle feeding the loop.")
    )]
    Recursion { limit: usize },

    /// A channel rejected the superstep's writes, or a write addressed an
    /// unknown channel. No checkpoint is produced for the offending step.
    #[error(transparent)]
    #[diagnostic(code(skein::runner::channel))]
    Channel(#[from] ChannelError),

    /// A persistence-requiring feature was used without a checkpoint store.
    #[error("no checkpointer configured: {feature} requires persistence")]
    #[diagnostic(
        code(skein::runner::no_checkpointer),
        help("Attach a checkpoint store to the graph builder to use {feature}.")
    )]
    NoCheckpointer { feature: &'static str },

    /// The run was cancelled externally; state is preserved up to the last
    /// applied superstep.
    #[error("run cancelled")]
    #[diagnostic(code(skein::runner::cancelled))]
    Cancelled,

    /// A node failed terminally after exhausting its retry policy.
    #[error("node `{node}` failed after {attempts} attempt(s): {source}")]
    #[diagnostic(code(skein::runner::node))]
    Node {
        node: String,
        attempts: u32,
        #[source]
        source: NodeError,
    },

    /// Propagated from the checkpoint store without wrapping.
    #[error(transparent)]
    #[diagnostic(code(skein::runner::store))]
    Store(#[from] StoreError),

    /// Required configuration is missing.
    #[error("missing configuration: {what}")]
    #[diagnostic(code(skein::runner::missing_config))]
    MissingConfig { what: &'static str },

    /// A state update referenced an unknown node.
    #[error("unknown node: `{name}`")]
    #[diagnostic(code(skein::runner::unknown_node))]
    UnknownNode { name: String },

    /// Malformed input or state update.
    #[error("invalid input: {reason}")]
    #[diagnostic(code(skein::runner::invalid_input))]
    InvalidInput { reason: String },

    /// A spawned task panicked or was aborted.
    #[error("task join error: {0}")]
    #[diagnostic(code(skein::runner::join))]
    Join(#[from] tokio::task::JoinError),
}

/// Result of one run, including pause information the public surface folds
/// into events and state snapshots.
#[derive(Debug)]
pub(crate) struct RunOutcome {
    pub output: Value,
    /// Interrupts that paused the run; empty when it completed.
    pub interrupts: Vec<Interrupt>,
    /// Commands addressed to the parent graph, collected across supersteps.
    pub parent_commands: Vec<Command>,
}

/// What one task attempt produced.
enum TaskOutcome {
    Completed {
        /// Write batches in production order; one batch per returned command.
        batches: Vec<Vec<(String, Value)>>,
        parent_commands: Vec<Command>,
        consumed_resumes: Vec<Value>,
        cached: bool,
        /// Writes were recovered from persisted pending writes; the task was
        /// not re-executed and its writes are already durable.
        recovered: bool,
    },
    Interrupted {
        interrupt: Interrupt,
        consumed_resumes: Vec<Value>,
    },
    Failed {
        error: NodeError,
        attempts: u32,
    },
    Cancelled,
}

impl TaskOutcome {
    fn flat_writes(&self) -> Vec<(String, Value)> {
        match self {
            TaskOutcome::Completed { batches, .. } => batches.iter().flatten().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

/// Mutable state of one run.
struct RunState {
    checkpoint: Checkpoint,
    channels: Channels,
    /// Next superstep index.
    step: i64,
    /// Highest checkpoint id allocated in the lineage; new checkpoints take
    /// `last_id.next()` so forks never collide with existing history.
    last_id: CheckpointId,
    /// Parent address for the next `put`.
    prev_ref: Option<CheckpointRef>,
    metadata: CheckpointMetadata,
    persisted: bool,
    pending_put: Option<JoinHandle<Result<CheckpointRef, StoreError>>>,
    resume: Option<ResumeValue>,
    recovered: FxHashMap<TaskId, Vec<(String, Value)>>,
    resume_history: FxHashMap<TaskId, Vec<Value>>,
    interrupted_ids: FxHashSet<TaskId>,
    parent_commands: Vec<Command>,
    supersteps: usize,
}

impl RunState {
    fn current_ref(&self, config: &RunConfig) -> Option<CheckpointRef> {
        config
            .checkpoint_ref()
            .map(|r| r.lineage().at(self.checkpoint.id))
    }
}

/// Executes one run of a compiled graph.
pub(crate) struct GraphRunner {
    app: App,
    config: RunConfig,
    store: Option<Arc<dyn CheckpointStore>>,
    emitter: StreamEmitter,
}

impl GraphRunner {
    pub(crate) fn new(
        app: App,
        config: RunConfig,
        store_override: Option<Arc<dyn CheckpointStore>>,
        emitter: StreamEmitter,
    ) -> Self {
        let store = store_override.or_else(|| app.store().cloned());
        Self {
            app,
            config,
            store,
            emitter,
        }
    }

    #[instrument(skip(self, input), fields(ns = %self.config.checkpoint_ns), err)]
    pub(crate) async fn run(&self, input: GraphInput) -> Result<RunOutcome, GraphError> {
        let run_id = self
            .config
            .run_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        tracing::debug!(
            run_id = %run_id,
            run_name = self.config.run_name.as_deref().unwrap_or_default(),
            tags = ?self.config.tags,
            "run starting"
        );

        if self.store.is_some() && self.config.thread_id.is_none() {
            return Err(GraphError::MissingConfig { what: "thread_id" });
        }
        if self.store.is_none()
            && (!self.config.interrupt_before.is_empty() || !self.config.interrupt_after.is_empty())
        {
            return Err(GraphError::NoCheckpointer {
                feature: "breakpoints",
            });
        }

        let mut state = self.load().await?;
        self.accept_input(&mut state, input).await?;

        loop {
            if self.config.cancellation.is_cancelled() {
                return Err(GraphError::Cancelled);
            }

            let planned = plan_step(
                &state.checkpoint,
                &state.channels,
                self.app.nodes(),
                &self.config,
            );
            if planned.is_empty() {
                break;
            }
            if state.supersteps >= self.config.recursion_limit {
                return Err(GraphError::Recursion {
                    limit: self.config.recursion_limit,
                });
            }

            // Static breakpoint before the batch runs.
            if self.should_pause(&state, &planned, &self.config.interrupt_before) {
                return self.pause_at_breakpoint(&mut state, &planned).await;
            }

            // Sends are consumed by the planning that just happened; the
            // persisted checkpoint keeps them so an interrupted or crashed
            // step re-plans identically.
            state.checkpoint.pending_sends.clear();

            let outcomes = self.run_tasks(&state, &planned).await?;

            if outcomes
                .iter()
                .any(|outcome| matches!(outcome, TaskOutcome::Cancelled))
            {
                return Err(GraphError::Cancelled);
            }
            if let Some(index) = outcomes
                .iter()
                .position(|outcome| matches!(outcome, TaskOutcome::Failed { .. }))
            {
                let Some(TaskOutcome::Failed { error, attempts }) =
                    outcomes.into_iter().nth(index)
                else {
                    unreachable!("position points at a failed outcome");
                };
                return Err(self
                    .fail_task(&mut state, &planned[index], error, attempts)
                    .await);
            }
            if outcomes
                .iter()
                .any(|outcome| matches!(outcome, TaskOutcome::Interrupted { .. }))
            {
                return self.pause_interrupted(&mut state, &planned, &outcomes).await;
            }

            self.apply_step(&mut state, &planned, &outcomes).await?;

            if self.should_pause_after(&planned) {
                return self.pause_at_breakpoint(&mut state, &planned).await;
            }
        }

        self.finish(&mut state).await?;
        Ok(RunOutcome {
            output: self.project_output(&state.channels),
            interrupts: Vec::new(),
            parent_commands: std::mem::take(&mut state.parent_commands),
        })
    }

    // ------------------------------------------------------------------
    // Loading and input
    // ------------------------------------------------------------------

    async fn load(&self) -> Result<RunState, GraphError> {
        let mut loaded: Option<CheckpointTuple> = None;
        let mut last_id = CheckpointId::default();

        if let (Some(store), Some(config_ref)) = (&self.store, self.config.checkpoint_ref()) {
            loaded = store.get_tuple(&config_ref).await?;
            if loaded.is_none() && config_ref.checkpoint_id.is_some() {
                return Err(GraphError::Store(StoreError::NotFound {
                    thread_id: config_ref.thread_id,
                    namespace: config_ref.namespace,
                }));
            }
            let head = store.list(&config_ref.lineage(), ListFilter::latest()).await?;
            if let Some(newest) = head.first() {
                last_id = newest.checkpoint.id;
            }
        }

        let state = match loaded {
            Some(tuple) => {
                let channels = tuple.checkpoint.restore_channels(self.app.channels())?;
                let mut recovered: FxHashMap<TaskId, Vec<(String, Value)>> = FxHashMap::default();
                let mut resume_history: FxHashMap<TaskId, Vec<Value>> = FxHashMap::default();
                let mut interrupted_ids: FxHashSet<TaskId> = FxHashSet::default();
                for write in &tuple.pending_writes {
                    match write.channel.as_str() {
                        RESUME => resume_history
                            .entry(write.task_id.clone())
                            .or_default()
                            .push(write.value.clone()),
                        INTERRUPT => {
                            interrupted_ids.insert(write.task_id.clone());
                        }
                        ERROR => {}
                        _ => recovered
                            .entry(write.task_id.clone())
                            .or_default()
                            .push((write.channel.clone(), write.value.clone())),
                    }
                }
                RunState {
                    step: tuple.metadata.step + 1,
                    last_id,
                    prev_ref: Some(tuple.config.clone()),
                    metadata: tuple.metadata,
                    persisted: true,
                    pending_put: None,
                    checkpoint: tuple.checkpoint,
                    channels,
                    resume: None,
                    recovered,
                    resume_history,
                    interrupted_ids,
                    parent_commands: Vec::new(),
                    supersteps: 0,
                }
            }
            None => RunState {
                checkpoint: Checkpoint::empty(),
                channels: self.app.channels().clone(),
                step: 0,
                last_id,
                prev_ref: self.config.checkpoint_ref().map(|r| r.lineage()),
                metadata: CheckpointMetadata::new(CheckpointSource::Input, -1),
                persisted: false,
                pending_put: None,
                resume: None,
                recovered: FxHashMap::default(),
                resume_history: FxHashMap::default(),
                interrupted_ids: FxHashSet::default(),
                parent_commands: Vec::new(),
                supersteps: 0,
            },
        };
        Ok(state)
    }

    async fn accept_input(
        &self,
        state: &mut RunState,
        input: GraphInput,
    ) -> Result<(), GraphError> {
        match input {
            GraphInput::Value(value) => {
                let writes = self.map_input(value)?;
                self.apply_entry_writes(state, INPUT, writes).await?;
            }
            GraphInput::Command(command) => {
                if let Some(resume) = command.resume {
                    if self.store.is_none() {
                        return Err(GraphError::NoCheckpointer { feature: "resume" });
                    }
                    if !state.persisted {
                        return Err(GraphError::InvalidInput {
                            reason: "cannot resume: the thread has no checkpoint".to_string(),
                        });
                    }
                    state.resume = Some(resume);
                }
                if !command.update.is_empty() {
                    self.apply_entry_writes(state, INPUT, command.update.clone())
                        .await?;
                }
                for goto in command.goto {
                    let send = resolve_goto(goto, self.app.nodes(), &state.channels, &[])
                        .map_err(|e| GraphError::InvalidInput {
                            reason: e.to_string(),
                        })?;
                    state.checkpoint.pending_sends.push(send);
                }
                if matches!(command.graph, Some(CommandScope::Parent)) {
                    tracing::warn!("parent-addressed command at the root graph has no parent; ignoring scope");
                }
            }
        }
        Ok(())
    }

    fn map_input(&self, value: Value) -> Result<Vec<(String, Value)>, GraphError> {
        let inputs = self.app.input_channels();
        if let [only] = inputs {
            return Ok(vec![(only.clone(), value)]);
        }
        let Value::Object(map) = value else {
            return Err(GraphError::InvalidInput {
                reason: "graph has multiple input channels; input must be an object keyed by channel".to_string(),
            });
        };
        let mut writes = Vec::new();
        for (key, value) in map {
            if !inputs.contains(&key) {
                return Err(GraphError::Channel(ChannelError::Unknown { channel: key }));
            }
            writes.push((key, value));
        }
        Ok(writes)
    }

    /// Apply entry writes (fresh input or a command's pre-run update) as a
    /// synthetic superstep attributed to `as_node`.
    async fn apply_entry_writes(
        &self,
        state: &mut RunState,
        as_node: &str,
        writes: Vec<(String, Value)>,
    ) -> Result<(), GraphError> {
        // Input does not consume pending sends.
        let sends = std::mem::take(&mut state.checkpoint.pending_sends);
        let observed = Vec::new();
        let task = TaskWrites {
            id: derive_task_id(
                state.checkpoint.id,
                &self.config.checkpoint_ns,
                &TaskPath::Pull(as_node.to_string()),
                &self.config.configurable_fingerprint(),
            ),
            name: as_node.to_string(),
            observed,
            writes,
        };
        apply_writes(
            &mut state.checkpoint,
            &mut state.channels,
            std::slice::from_ref(&task),
            self.app.version_gen(),
        )?;
        state.checkpoint.pending_sends = sends;

        let meta_step = if state.persisted { state.step } else { -1 };
        if state.persisted {
            state.step += 1;
        }
        self.advance_checkpoint(state, CheckpointSource::Input, meta_step)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Task execution
    // ------------------------------------------------------------------

    async fn run_tasks(
        &self,
        state: &RunState,
        planned: &[PlannedTask],
    ) -> Result<Vec<TaskOutcome>, GraphError> {
        let committed: Arc<FxHashMap<String, Value>> =
            Arc::new(read_all_values(&state.channels));
        let channels = Arc::new(state.channels.clone());
        let configurable: Arc<FxHashMap<String, Value>> =
            Arc::new(self.config.configurable.clone());
        let concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        if let Some(tracer) = self.app.tracer() {
            tracer.on_chain_start(&self.config.checkpoint_ns, state.step, planned.len());
        }

        let mut outcomes: Vec<Option<TaskOutcome>> = Vec::new();
        outcomes.resize_with(planned.len(), || None);
        let mut join_set: JoinSet<(usize, TaskOutcome)> = JoinSet::new();

        for (index, task) in planned.iter().enumerate() {
            if let Some(tracer) = self.app.tracer() {
                tracer.on_task_start(self.trace_task(state.step, task));
            }
            if self.emitter.enabled(StreamMode::Debug) {
                self.emitter.emit(StreamEvent::Debug {
                    namespace: self.emitter.namespace().to_string(),
                    record: DebugRecord::Task {
                        step: state.step,
                        id: task.id.clone(),
                        name: task.name.clone(),
                        path: task.path.clone(),
                        input: task.input.clone(),
                        triggers: task.triggers.clone(),
                        cached: false,
                        at: Utc::now(),
                    },
                });
            }

            // Writes persisted by a previous round of this superstep are
            // reused; the task does not re-execute.
            if let Some(writes) = state.recovered.get(&task.id) {
                outcomes[index] = Some(TaskOutcome::Completed {
                    batches: vec![writes.clone()],
                    parent_commands: Vec::new(),
                    consumed_resumes: Vec::new(),
                    cached: false,
                    recovered: true,
                });
                continue;
            }

            let Some(spec) = self.app.node(&task.name).cloned() else {
                outcomes[index] = Some(TaskOutcome::Failed {
                    error: NodeError::Other(format!("node `{}` vanished from the graph", task.name)),
                    attempts: 0,
                });
                continue;
            };
            let resume = if resume_targets_task(state, planned, &task.id) {
                state.resume.clone()
            } else {
                None
            };
            let context_seed = ContextSeed {
                task: task.clone(),
                step: state.step,
                namespace: self.config.checkpoint_ns.clone(),
                committed: Arc::clone(&committed),
                configurable: Arc::clone(&configurable),
                resume_history: state
                    .resume_history
                    .get(&task.id)
                    .cloned()
                    .unwrap_or_default(),
                resume,
                emitter: self.emitter.clone(),
                cancel: self.config.cancellation.clone(),
                store: self.store.clone(),
                thread_id: self.config.thread_id.clone(),
                parent_checkpoint: state.checkpoint.id,
                durability: self.config.durability,
                recursion_limit: self.config.recursion_limit,
            };
            let nodes = Arc::clone(self.app.nodes_arc());
            let channels = Arc::clone(&channels);
            let cache = self.app.cache().cloned();
            let semaphore = Arc::clone(&semaphore);

            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, TaskOutcome::Cancelled);
                };
                let outcome = execute_task(spec, context_seed, nodes, channels, cache).await;
                (index, outcome)
            });
        }

        // Wait for every in-flight task before deciding anything.
        while let Some(joined) = join_set.join_next().await {
            let (index, outcome) = joined?;
            outcomes[index] = Some(outcome);
        }

        if let Some(tracer) = self.app.tracer() {
            for (task, outcome) in planned.iter().zip(outcomes.iter()) {
                let error = match outcome {
                    Some(TaskOutcome::Failed { error, .. }) => Some(error.to_string()),
                    Some(TaskOutcome::Cancelled) | None => Some("cancelled".to_string()),
                    _ => None,
                };
                tracer.on_task_end(self.trace_task(state.step, task), error.as_deref());
            }
        }

        if self.emitter.enabled(StreamMode::Debug) {
            for (task, outcome) in planned.iter().zip(outcomes.iter()) {
                if let Some(outcome) = outcome {
                    let (writes, error) = match outcome {
                        TaskOutcome::Completed { .. } => (outcome.flat_writes(), None),
                        TaskOutcome::Interrupted { .. } => (Vec::new(), None),
                        TaskOutcome::Failed { error, .. } => (Vec::new(), Some(error.to_string())),
                        TaskOutcome::Cancelled => (Vec::new(), Some("cancelled".to_string())),
                    };
                    self.emitter.emit(StreamEvent::Debug {
                        namespace: self.emitter.namespace().to_string(),
                        record: DebugRecord::TaskResult {
                            step: state.step,
                            id: task.id.clone(),
                            name: task.name.clone(),
                            writes,
                            error,
                            at: Utc::now(),
                        },
                    });
                }
            }
        }

        Ok(outcomes
            .into_iter()
            .map(|outcome| outcome.unwrap_or(TaskOutcome::Cancelled))
            .collect())
    }

    // ------------------------------------------------------------------
    // Outcome handling
    // ------------------------------------------------------------------

    async fn fail_task(
        &self,
        state: &mut RunState,
        task: &PlannedTask,
        error: NodeError,
        attempts: u32,
    ) -> GraphError {
        if let NodeError::NoCheckpointer { feature } = error {
            return GraphError::NoCheckpointer { feature };
        }
        // Record the failure for post-mortem state inspection; the error
        // itself is surfaced to the caller.
        if let Some(store) = self.store.clone() {
            if let Err(persist_error) = self.force_persist(state).await {
                tracing::warn!(error = %persist_error, "failed to persist checkpoint for error record");
            } else if let Some(current) = state.current_ref(&self.config) {
                let write =
                    PendingWrite::new(task.id.clone(), ERROR, Value::String(error.to_string()));
                if let Err(persist_error) = store.put_writes(&current, vec![write]).await {
                    tracing::warn!(error = %persist_error, "failed to record task error");
                }
            }
        }
        GraphError::Node {
            node: task.name.clone(),
            attempts,
            source: error,
        }
    }

    async fn pause_interrupted(
        &self,
        state: &mut RunState,
        planned: &[PlannedTask],
        outcomes: &[TaskOutcome],
    ) -> Result<RunOutcome, GraphError> {
        let Some(store) = self.store.clone() else {
            return Err(GraphError::NoCheckpointer {
                feature: "interrupt",
            });
        };
        self.force_persist(state).await?;
        let current = state
            .current_ref(&self.config)
            .ok_or(GraphError::MissingConfig { what: "thread_id" })?;

        let mut interrupts = Vec::new();
        let mut writes: Vec<PendingWrite> = Vec::new();
        for (task, outcome) in planned.iter().zip(outcomes.iter()) {
            match outcome {
                TaskOutcome::Completed {
                    consumed_resumes,
                    recovered,
                    ..
                } => {
                    if !recovered {
                        for value in consumed_resumes {
                            writes.push(PendingWrite::new(task.id.clone(), RESUME, value.clone()));
                        }
                        for (channel, value) in outcome.flat_writes() {
                            writes.push(PendingWrite::new(task.id.clone(), channel, value));
                        }
                    }
                }
                TaskOutcome::Interrupted {
                    interrupt,
                    consumed_resumes,
                } => {
                    for value in consumed_resumes {
                        writes.push(PendingWrite::new(task.id.clone(), RESUME, value.clone()));
                    }
                    writes.push(PendingWrite::new(
                        task.id.clone(),
                        INTERRUPT,
                        serde_json::to_value(interrupt).map_err(StoreError::from)?,
                    ));
                    interrupts.push(interrupt.clone());
                }
                TaskOutcome::Failed { .. } | TaskOutcome::Cancelled => {}
            }
        }
        store.put_writes(&current, writes).await?;

        self.emitter.emit(StreamEvent::Interrupt {
            namespace: self.emitter.namespace().to_string(),
            step: state.step,
            interrupts: interrupts.clone(),
        });

        // The returned output previews the paused step: committed state with
        // the completed siblings' writes overlaid.
        let mut overlay: Vec<(String, Value)> = Vec::new();
        for outcome in outcomes {
            overlay.extend(outcome.flat_writes());
        }
        let output = match local_read(
            &state.channels,
            &overlay,
            self.app.output_channels(),
            true,
        ) {
            Ok(values) => project_values(self.app.output_channels(), values),
            Err(error) => {
                tracing::debug!(%error, "pending writes preview failed; returning committed state");
                self.project_output(&state.channels)
            }
        };

        Ok(RunOutcome {
            output,
            interrupts,
            parent_commands: std::mem::take(&mut state.parent_commands),
        })
    }

    async fn apply_step(
        &self,
        state: &mut RunState,
        planned: &[PlannedTask],
        outcomes: &[TaskOutcome],
    ) -> Result<(), GraphError> {
        let mut task_writes: Vec<TaskWrites> = Vec::with_capacity(planned.len());
        for (task, outcome) in planned.iter().zip(outcomes.iter()) {
            if let TaskOutcome::Completed { parent_commands, .. } = outcome {
                state.parent_commands.extend(parent_commands.iter().cloned());
            }
            task_writes.push(TaskWrites {
                id: task.id.clone(),
                name: task.name.clone(),
                observed: task.observed.clone(),
                writes: outcome.flat_writes(),
            });
        }

        let applied = apply_writes(
            &mut state.checkpoint,
            &mut state.channels,
            &task_writes,
            self.app.version_gen(),
        )?;
        let cached = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, TaskOutcome::Completed { cached: true, .. }))
            .count();
        tracing::debug!(
            step = state.step,
            updated = ?applied.updated_channels,
            sends = state.checkpoint.pending_sends.len(),
            cached,
            "superstep applied"
        );

        self.emit_step_events(state, planned, outcomes);

        let step = state.step;
        state.step += 1;
        state.supersteps += 1;
        // Re-planning after this point starts from a fresh checkpoint, so
        // recovery bookkeeping from the paused round no longer applies.
        state.recovered.clear();
        state.resume_history.clear();
        state.interrupted_ids.clear();
        state.resume = None;

        self.advance_checkpoint(state, CheckpointSource::Loop, step)
            .await?;
        if let Some(tracer) = self.app.tracer() {
            tracer.on_chain_end(&self.config.checkpoint_ns, step);
        }
        Ok(())
    }

    fn trace_task<'a>(&self, step: i64, task: &'a PlannedTask) -> TraceTask<'a> {
        TraceTask {
            id: &task.id,
            name: &task.name,
            path: &task.path,
            step,
            input: &task.input,
        }
    }

    fn emit_step_events(
        &self,
        state: &RunState,
        planned: &[PlannedTask],
        outcomes: &[TaskOutcome],
    ) {
        let namespace = self.emitter.namespace().to_string();
        if self.emitter.enabled(StreamMode::Updates) {
            for (task, outcome) in planned.iter().zip(outcomes.iter()) {
                let TaskOutcome::Completed { batches, .. } = outcome else {
                    continue;
                };
                let write_maps: Vec<FxHashMap<String, Value>> = batches
                    .iter()
                    .map(|batch| {
                        batch
                            .iter()
                            .filter(|(channel, _)| channel != TASKS)
                            .cloned()
                            .collect()
                    })
                    .collect();
                self.emitter.emit(StreamEvent::Updates {
                    namespace: namespace.clone(),
                    step: state.step,
                    node: task.name.clone(),
                    writes: write_maps,
                });
            }
        }
        if self.emitter.enabled(StreamMode::Messages) {
            for (task, outcome) in planned.iter().zip(outcomes.iter()) {
                for (channel, value) in outcome.flat_writes() {
                    if channel != MESSAGES_CHANNEL {
                        continue;
                    }
                    let items = match value {
                        Value::Array(items) => items,
                        other => vec![other],
                    };
                    for message in items {
                        self.emitter.emit(StreamEvent::Message {
                            namespace: namespace.clone(),
                            step: state.step,
                            node: task.name.clone(),
                            message,
                        });
                    }
                }
            }
        }
        if self.emitter.enabled(StreamMode::Values) {
            let values = self
                .app
                .output_channels()
                .iter()
                .filter_map(|name| {
                    state
                        .channels
                        .get(name)
                        .and_then(|cell| cell.value())
                        .map(|value| (name.clone(), value))
                })
                .collect();
            self.emitter.emit(StreamEvent::Values {
                namespace: namespace.clone(),
                step: state.step,
                values,
            });
        }
    }

    // ------------------------------------------------------------------
    // Breakpoints
    // ------------------------------------------------------------------

    fn should_pause(&self, state: &RunState, planned: &[PlannedTask], list: &[String]) -> bool {
        if list.is_empty() {
            return false;
        }
        let matching = planned
            .iter()
            .any(|task| RunConfig::matches_breakpoint(list, &task.name));
        matching && gate_advanced(&state.checkpoint)
    }

    fn should_pause_after(&self, planned: &[PlannedTask]) -> bool {
        !self.config.interrupt_after.is_empty()
            && planned
                .iter()
                .any(|task| RunConfig::matches_breakpoint(&self.config.interrupt_after, &task.name))
    }

    /// Pause at a static breakpoint: record what the gate has seen, persist,
    /// and surface a synthetic zero-value interrupt.
    async fn pause_at_breakpoint(
        &self,
        state: &mut RunState,
        planned: &[PlannedTask],
    ) -> Result<RunOutcome, GraphError> {
        let observed: Vec<(String, u64)> = state
            .checkpoint
            .versions
            .iter()
            .map(|(channel, version)| (channel.clone(), *version))
            .collect();
        state.checkpoint.record_seen(INTERRUPT, observed);
        self.force_persist(state).await?;
        self.repersist_gate(state).await?;

        let interrupts: Vec<Interrupt> = planned
            .iter()
            .filter(|task| {
                RunConfig::matches_breakpoint(&self.config.interrupt_before, &task.name)
                    || RunConfig::matches_breakpoint(&self.config.interrupt_after, &task.name)
            })
            .map(|task| Interrupt {
                id: derive_interrupt_id(
                    &self.config.checkpoint_ns,
                    &task.name,
                    &task.path,
                    0,
                ),
                value: Value::Null,
            })
            .collect();
        self.emitter.emit(StreamEvent::Interrupt {
            namespace: self.emitter.namespace().to_string(),
            step: state.step,
            interrupts: interrupts.clone(),
        });

        Ok(RunOutcome {
            output: self.project_output(&state.channels),
            interrupts,
            parent_commands: std::mem::take(&mut state.parent_commands),
        })
    }

    /// Persist the gate's versions-seen mutation onto the already-stored
    /// checkpoint (same id, pending writes preserved).
    async fn repersist_gate(&self, state: &mut RunState) -> Result<(), GraphError> {
        if let (Some(store), Some(prev)) = (&self.store, &state.prev_ref) {
            store
                .put(prev, state.checkpoint.clone(), state.metadata.clone())
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Checkpointing
    // ------------------------------------------------------------------

    /// Give the current state a fresh checkpoint id and persist it according
    /// to the durability policy.
    async fn advance_checkpoint(
        &self,
        state: &mut RunState,
        source: CheckpointSource,
        step: i64,
    ) -> Result<(), GraphError> {
        state.last_id = state.last_id.next();
        state.checkpoint.id = state.last_id;
        let mut metadata = CheckpointMetadata::new(source, step);
        metadata.parents = self.config.parents.clone();
        state.metadata = metadata;

        if self.emitter.enabled(StreamMode::Debug) {
            self.emitter.emit(StreamEvent::Debug {
                namespace: self.emitter.namespace().to_string(),
                record: DebugRecord::Checkpoint {
                    step,
                    checkpoint: state.checkpoint.id,
                    at: Utc::now(),
                },
            });
        }

        let Some(store) = self.store.clone() else {
            state.persisted = false;
            return Ok(());
        };
        let parent = state
            .prev_ref
            .clone()
            .unwrap_or_else(|| {
                self.config
                    .checkpoint_ref()
                    .expect("store implies thread configured")
                    .lineage()
            });

        match self.config.durability {
            Durability::Sync => {
                self.flush(state).await?;
                let pinned = store
                    .put(&parent, state.checkpoint.clone(), state.metadata.clone())
                    .await?;
                state.prev_ref = Some(pinned);
                state.persisted = true;
            }
            Durability::Async => {
                self.flush(state).await?;
                let checkpoint = state.checkpoint.clone();
                let metadata = state.metadata.clone();
                state.pending_put = Some(tokio::spawn(async move {
                    store.put(&parent, checkpoint, metadata).await
                }));
                state.prev_ref = state.current_ref(&self.config);
                state.persisted = true;
            }
            Durability::Exit => {
                state.prev_ref = Some(parent);
                state.persisted = false;
            }
        }
        Ok(())
    }

    /// Persist the current checkpoint now if the durability policy deferred
    /// it; used before pending-write records and at run end.
    async fn force_persist(&self, state: &mut RunState) -> Result<(), GraphError> {
        self.flush(state).await?;
        if state.persisted {
            return Ok(());
        }
        let Some(store) = &self.store else {
            return Ok(());
        };
        let parent = state
            .prev_ref
            .clone()
            .unwrap_or_else(|| {
                self.config
                    .checkpoint_ref()
                    .expect("store implies thread configured")
                    .lineage()
            });
        let pinned = store
            .put(&parent, state.checkpoint.clone(), state.metadata.clone())
            .await?;
        state.prev_ref = Some(pinned);
        state.persisted = true;
        Ok(())
    }

    /// Await an in-flight asynchronous persist, surfacing its error.
    async fn flush(&self, state: &mut RunState) -> Result<(), GraphError> {
        if let Some(handle) = state.pending_put.take() {
            let pinned = handle.await??;
            state.prev_ref = Some(pinned);
        }
        Ok(())
    }

    async fn finish(&self, state: &mut RunState) -> Result<(), GraphError> {
        self.force_persist(state).await
    }

    fn project_output(&self, channels: &Channels) -> Value {
        let values = read_selected_values(channels, self.app.output_channels());
        project_values(self.app.output_channels(), values)
    }
}

// ----------------------------------------------------------------------
// Task execution helpers
// ----------------------------------------------------------------------

/// Everything a spawned task needs to build node contexts.
struct ContextSeed {
    task: PlannedTask,
    step: i64,
    namespace: String,
    committed: Arc<FxHashMap<String, Value>>,
    configurable: Arc<FxHashMap<String, Value>>,
    resume_history: Vec<Value>,
    resume: Option<ResumeValue>,
    emitter: StreamEmitter,
    cancel: tokio_util::sync::CancellationToken,
    store: Option<Arc<dyn CheckpointStore>>,
    thread_id: Option<String>,
    parent_checkpoint: CheckpointId,
    durability: Durability,
    recursion_limit: usize,
}

async fn execute_task(
    spec: NodeSpec,
    seed: ContextSeed,
    nodes: Arc<Vec<NodeSpec>>,
    channels: Arc<Channels>,
    cache: Option<Arc<dyn crate::runtimes::CacheStore>>,
) -> TaskOutcome {
    // Cache lookup precedes execution; a hit skips the node entirely.
    let cache_key = match (&spec.cache, &cache) {
        (Some(_), Some(_)) => {
            let input_json = serde_json::to_string(&seed.task.input).unwrap_or_default();
            Some(derive_cache_key(&seed.task.name, &input_json))
        }
        _ => None,
    };
    if let (Some(key), Some(cache)) = (&cache_key, &cache)
        && let Some(writes) = cache.get(key).await
    {
        tracing::debug!(node = %seed.task.name, "cache hit; skipping execution");
        return TaskOutcome::Completed {
            batches: vec![writes],
            parent_commands: Vec::new(),
            consumed_resumes: Vec::new(),
            cached: true,
            recovered: false,
        };
    }

    let retry: RetryPolicy = spec.retry.clone().unwrap_or_default();
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        let resume_history = Arc::new(seed.resume_history.clone());
        let consumed = Arc::new(Mutex::new(Vec::new()));
        let ctx = NodeContext {
            node: seed.task.name.clone(),
            task_id: seed.task.id.clone(),
            path: seed.task.path.clone(),
            step: seed.step,
            namespace: seed.namespace.clone(),
            values: Arc::clone(&seed.committed),
            configurable: Arc::clone(&seed.configurable),
            resume_history,
            incoming_resume: seed.resume.clone(),
            consumed_resumes: Arc::clone(&consumed),
            interrupt_seq: Arc::new(AtomicUsize::new(0)),
            emitter: seed.emitter.clone(),
            cancel: seed.cancel.clone(),
            store: seed.store.clone(),
            thread_id: seed.thread_id.clone(),
            parent_checkpoint: Some(seed.parent_checkpoint),
            durability: seed.durability,
            recursion_limit: seed.recursion_limit,
            declared_writes: spec.writes.clone(),
        };

        let run = spec.node.run(seed.task.input.clone(), ctx);
        let result = tokio::select! {
            () = seed.cancel.cancelled() => return TaskOutcome::Cancelled,
            result = run => result,
        };
        let consumed_resumes = consumed
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default();

        match result {
            Ok(output) => {
                match convert_output(&seed.task.name, output, &nodes, &channels) {
                    Ok((batches, parent_commands)) => {
                        if let (Some(key), Some(cache)) = (&cache_key, &cache) {
                            let flat: Vec<(String, Value)> =
                                batches.iter().flatten().cloned().collect();
                            let ttl = spec.cache.as_ref().and_then(|policy| policy.ttl);
                            cache.set(key.clone(), flat, ttl).await;
                        }
                        return TaskOutcome::Completed {
                            batches,
                            parent_commands,
                            consumed_resumes,
                            cached: false,
                            recovered: false,
                        };
                    }
                    Err(error) => return TaskOutcome::Failed { error, attempts },
                }
            }
            Err(NodeError::Interrupted(interrupt)) => {
                return TaskOutcome::Interrupted {
                    interrupt,
                    consumed_resumes,
                };
            }
            Err(error) => {
                let can_retry = attempts < retry.max_attempts
                    && retry.is_retryable(&error)
                    && !seed.cancel.is_cancelled();
                if !can_retry {
                    return TaskOutcome::Failed { error, attempts };
                }
                tracing::debug!(
                    node = %seed.task.name,
                    attempt = attempts,
                    error = %error,
                    "retrying task; discarding failed attempt"
                );
                if let Some(backoff) = retry.backoff {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

/// Turn a node's output into write batches, resolving routing into sends.
fn convert_output(
    node: &str,
    output: NodeOutput,
    nodes: &[NodeSpec],
    channels: &Channels,
) -> Result<(Vec<Vec<(String, Value)>>, Vec<Command>), NodeError> {
    let commands = match output {
        NodeOutput::Writes(writes) => return Ok((vec![writes], Vec::new())),
        NodeOutput::Command(command) => vec![command],
        NodeOutput::Commands(commands) => commands,
    };

    let mut batches: Vec<Vec<(String, Value)>> = Vec::new();
    let mut parent_commands = Vec::new();
    for command in commands {
        if matches!(command.graph, Some(CommandScope::Parent)) {
            parent_commands.push(command);
            continue;
        }
        if command.resume.is_some() {
            tracing::warn!(node = %node, "resume on a node-returned command is ignored");
        }
        let mut writes = command.update;
        let buffered: Vec<(String, Value)> = batches
            .iter()
            .flatten()
            .cloned()
            .chain(writes.iter().cloned())
            .collect();
        for goto in command.goto {
            let send = resolve_goto(goto, nodes, channels, &buffered)?;
            writes.push((TASKS.to_string(), serde_json::to_value(send)?));
        }
        batches.push(writes);
    }
    Ok((batches, parent_commands))
}

/// Resolve a routing target into a send. A bare node target reads its input
/// from the channels with the commanding task's writes overlaid, so routing
/// observes what the task just produced without exposing it to siblings.
fn resolve_goto(
    goto: Goto,
    nodes: &[NodeSpec],
    channels: &Channels,
    task_writes: &[(String, Value)],
) -> Result<SendPacket, NodeError> {
    match goto {
        Goto::Send(send) => Ok(send),
        Goto::Node(name) => {
            let Some(target) = nodes.iter().find(|spec| spec.name == name) else {
                // The planner drops sends to unknown nodes with a trace.
                return Ok(SendPacket::new(name, Value::Null));
            };
            let reads = target.effective_reads();
            let values = local_read(channels, task_writes, reads, true)?;
            let payload = match reads {
                [] => Value::Null,
                [only] => values.get(only).cloned().unwrap_or(Value::Null),
                _ => Value::Object(values.into_iter().collect()),
            };
            Ok(SendPacket::new(name, payload))
        }
    }
}

// ----------------------------------------------------------------------
// Shared helpers
// ----------------------------------------------------------------------

/// Should the incoming resume value be visible to this task? When the
/// paused round recorded which task interrupted, only that task sees it;
/// otherwise (fresh checkpoint after a pre-run update) every task does.
fn resume_targets_task(state: &RunState, planned: &[PlannedTask], task_id: &TaskId) -> bool {
    let any_recorded_planned = planned
        .iter()
        .any(|task| state.interrupted_ids.contains(&task.id));
    !any_recorded_planned || state.interrupted_ids.contains(task_id)
}

/// Has any channel advanced past what the breakpoint gate recorded?
fn gate_advanced(checkpoint: &Checkpoint) -> bool {
    if checkpoint.versions.is_empty() {
        return true;
    }
    checkpoint.versions.iter().any(|(channel, version)| {
        checkpoint
            .seen(INTERRUPT, channel)
            .is_none_or(|seen| *version > seen)
    })
}

pub(crate) fn read_all_values(channels: &Channels) -> FxHashMap<String, Value> {
    channels
        .names()
        .iter()
        .filter_map(|name| {
            channels
                .get(name)
                .and_then(|cell| cell.value())
                .map(|value| (name.clone(), value))
        })
        .collect()
}

pub(crate) fn read_selected_values(
    channels: &Channels,
    select: &[String],
) -> FxHashMap<String, Value> {
    select
        .iter()
        .filter_map(|name| {
            channels
                .get(name)
                .and_then(|cell| cell.value())
                .map(|value| (name.clone(), value))
        })
        .collect()
}

/// Project selected values into run output: the raw value for a single
/// output channel, an object otherwise.
pub(crate) fn project_values(select: &[String], mut values: FxHashMap<String, Value>) -> Value {
    match select {
        [only] => values.remove(only).unwrap_or(Value::Null),
        _ => Value::Object(values.into_iter().collect()),
    }
}
