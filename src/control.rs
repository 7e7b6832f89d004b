//! Control-flow primitives nodes use to influence scheduling.
//!
//! Routing intent is kept separate from state updates: a node returns plain
//! channel writes, or a [`Command`] combining writes with dispatch targets,
//! and the runner reconciles them deterministically at the barrier. [`Send`]
//! is the fan-out primitive: it becomes a push-scheduled task for the target
//! node in the next superstep, carrying an explicit payload.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved channel receiving serialized [`Send`] records; its writes become
/// the next checkpoint's pending sends.
pub const TASKS: &str = "__tasks__";
/// Reserved `versions_seen` key for the static breakpoint gate.
pub const INTERRUPT: &str = "__interrupt__";
/// Reserved pending-write channel recording a task's terminal failure.
pub const ERROR: &str = "__error__";
/// Reserved pending-write channel recording consumed resume values.
pub const RESUME: &str = "__resume__";
/// Synthetic writer name for input mapping.
pub const INPUT: &str = "__input__";
/// Virtual entry marker.
pub const START: &str = "__start__";
/// Virtual exit marker.
pub const END: &str = "__end__";
/// Copy marker reserved by the bulk-update surface.
pub const COPY: &str = "__copy__";
/// Wildcard accepted by `interrupt_before` / `interrupt_after`.
pub const ALL_NODES: &str = "*";

/// Names the engine reserves; they cannot be used as channel or node names.
pub const RESERVED_NAMES: &[&str] = &[TASKS, INTERRUPT, ERROR, RESUME, INPUT, START, END, COPY];

#[must_use]
pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// A dispatch record: run `target` next superstep with `payload` as input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Send {
    pub target: String,
    pub payload: Value,
}

impl Send {
    #[must_use]
    pub fn new(target: impl Into<String>, payload: Value) -> Self {
        Self {
            target: target.into(),
            payload,
        }
    }
}

/// Dispatch target inside a [`Command`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goto {
    /// Route to a node; its input is read from its channels, including the
    /// commanding task's own uncommitted writes.
    Node(String),
    /// Dispatch with an explicit payload.
    Send(Send),
}

/// Where a command applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandScope {
    /// Propagate the command one level up, onto the parent graph's state at
    /// the task boundary.
    Parent,
}

/// Value(s) answering pending interrupts on resumption.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResumeValue {
    /// Answers interrupts by id.
    Map(FxHashMap<String, Value>),
    /// Answers the first unresolved interrupt.
    Single(Value),
}

/// A structured control object combining state updates with routing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Channel writes to apply as this task's output.
    #[serde(default)]
    pub update: Vec<(String, Value)>,
    /// Dispatch targets for the next superstep.
    #[serde(default)]
    pub goto: Vec<Goto>,
    /// Resume values; meaningful only when the command enters a run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeValue>,
    /// Redirects the command to an ancestor graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<CommandScope>,
}

impl Command {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Command resuming the first unresolved interrupt with `value`.
    #[must_use]
    pub fn resume(value: Value) -> Self {
        Self {
            resume: Some(ResumeValue::Single(value)),
            ..Self::default()
        }
    }

    /// Command resuming interrupts by id.
    #[must_use]
    pub fn resume_map(values: FxHashMap<String, Value>) -> Self {
        Self {
            resume: Some(ResumeValue::Map(values)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_update(mut self, channel: impl Into<String>, value: Value) -> Self {
        self.update.push((channel.into(), value));
        self
    }

    #[must_use]
    pub fn with_goto(mut self, goto: Goto) -> Self {
        self.goto.push(goto);
        self
    }

    #[must_use]
    pub fn with_send(mut self, target: impl Into<String>, payload: Value) -> Self {
        self.goto.push(Goto::Send(Send::new(target, payload)));
        self
    }

    /// Address the command to the parent graph.
    #[must_use]
    pub fn to_parent(mut self) -> Self {
        self.graph = Some(CommandScope::Parent);
        self
    }
}

/// A cooperative suspension raised inside a node.
///
/// Not an error: the run pauses, state is persisted, and a later invocation
/// carrying a matching resume value re-enters the task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    /// Deterministic per task and per call index within the task.
    pub id: String,
    pub value: Value,
}

/// Input to a run.
#[derive(Clone, Debug)]
pub enum GraphInput {
    /// Fresh input written to the graph's input channels.
    Value(Value),
    /// Control re-entry: resume values, pre-run updates, or dispatches.
    Command(Command),
}

impl From<Value> for GraphInput {
    fn from(value: Value) -> Self {
        GraphInput::Value(value)
    }
}

impl From<Command> for GraphInput {
    fn from(command: Command) -> Self {
        GraphInput::Command(command)
    }
}
