//! Compiled graphs mounted as nodes.
//!
//! A [`SubgraphNode`] invokes an inner [`App`] inside a parent task. The
//! child run inherits the parent's thread and checkpoint store but scopes
//! its checkpoints beneath the namespace `parent|node:task_id`, with the
//! parent checkpoint recorded in its metadata. Interrupts raised inside the
//! child pause the parent task; resume values pass through unchanged, and
//! the child picks its own run back up from its namespaced lineage.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::app::App;
use crate::control::{Command, CommandScope, GraphInput, Goto};
use crate::node::{Node, NodeContext, NodeError, NodeOutput};
use crate::runtimes::config::child_namespace;
use crate::runtimes::{GraphError, RunConfig};

/// A compiled graph registered as a node of another graph.
pub struct SubgraphNode {
    app: Arc<App>,
    interrupt_before: Vec<String>,
    interrupt_after: Vec<String>,
}

impl SubgraphNode {
    #[must_use]
    pub fn new(app: App) -> Self {
        Self::from_arc(Arc::new(app))
    }

    #[must_use]
    pub fn from_arc(app: Arc<App>) -> Self {
        Self {
            app,
            interrupt_before: Vec::new(),
            interrupt_after: Vec::new(),
        }
    }

    /// Pause the child run before these inner nodes.
    #[must_use]
    pub fn with_interrupt_before<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interrupt_before = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Pause the child run after these inner nodes.
    #[must_use]
    pub fn with_interrupt_after<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interrupt_after = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn app(&self) -> Arc<App> {
        Arc::clone(&self.app)
    }

    /// Map the child's output into parent channel writes.
    fn output_writes(
        &self,
        output: Value,
        declared: &[String],
    ) -> Result<Vec<(String, Value)>, NodeError> {
        match output {
            Value::Object(map) if declared.len() != 1 => Ok(map.into_iter().collect()),
            other => match declared {
                [only, ..] => Ok(vec![(only.clone(), other)]),
                [] => Err(NodeError::Other(
                    "subgraph output needs a declared writer channel on the mounting node"
                        .to_string(),
                )),
            },
        }
    }
}

#[async_trait]
impl Node for SubgraphNode {
    async fn run(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let namespace = child_namespace(&ctx.namespace, &ctx.node, &ctx.task_id);
        let mut config = RunConfig {
            thread_id: ctx.thread_id.clone(),
            checkpoint_ns: namespace.clone(),
            durability: ctx.durability,
            recursion_limit: ctx.recursion_limit,
            interrupt_before: self.interrupt_before.clone(),
            interrupt_after: self.interrupt_after.clone(),
            configurable: (*ctx.configurable).clone(),
            cancellation: ctx.cancel.clone(),
            ..RunConfig::default()
        };
        if let Some(parent_id) = ctx.parent_checkpoint {
            config.parents.insert(ctx.namespace.clone(), parent_id);
        }

        // A child lineage with history resumes; a fresh one starts from the
        // parent-provided input.
        let store = ctx.store.clone().or_else(|| self.app.store().cloned());
        let has_history = match (&store, config.checkpoint_ref()) {
            (Some(store), Some(config_ref)) => store
                .get_tuple(&config_ref)
                .await
                .map_err(|e| NodeError::Other(e.to_string()))?
                .is_some(),
            _ => false,
        };
        let child_input = if has_history {
            GraphInput::Command(Command {
                resume: ctx.incoming_resume.clone(),
                ..Command::default()
            })
        } else {
            GraphInput::Value(input)
        };

        let outcome = self
            .app
            .run_internal(
                child_input,
                config,
                ctx.store.clone(),
                ctx.emitter.child(namespace),
            )
            .await
            .map_err(|error| match error {
                GraphError::Cancelled => NodeError::Other("subgraph cancelled".to_string()),
                other => NodeError::Other(other.to_string()),
            })?;

        // A paused child pauses the parent task; the parent surfaces the
        // child's interrupt verbatim so resume values address the same id.
        if let Some(interrupt) = outcome.interrupts.into_iter().next() {
            return Err(NodeError::Interrupted(interrupt));
        }

        let mut writes = self.output_writes(outcome.output, &ctx.declared_writes)?;
        let mut goto: Vec<Goto> = Vec::new();
        for command in outcome.parent_commands {
            debug_assert!(matches!(command.graph, Some(CommandScope::Parent)));
            writes.extend(command.update);
            goto.extend(command.goto);
        }
        Ok(NodeOutput::Command(Command {
            update: writes,
            goto,
            resume: None,
            graph: None,
        }))
    }
}
