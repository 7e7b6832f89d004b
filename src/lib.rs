//! # Skein: Stateful Graph Execution Engine
//!
//! Skein executes graph-shaped computations over named, versioned channels
//! in discrete supersteps: each step plans a task set from channel version
//! changes and dynamic sends, runs the tasks concurrently with isolated
//! write buffers, merges the writes atomically at a barrier, and checkpoints
//! the result. Runs are deterministic to resume from any checkpoint, can
//! pause on human-in-the-loop interrupts, and compose: a compiled graph
//! mounts as a node of another graph with its own checkpoint lineage.
//!
//! ## Core Concepts
//!
//! - **Channels**: Named state cells with variant-specific merge semantics
//!   (last-value, topic, ephemeral, aggregate, reducer-backed)
//! - **Nodes**: Async units of work subscribed to channels, returning writes
//!   or structured commands
//! - **Supersteps**: Plan → run → apply → checkpoint cycles that give the
//!   engine its ordering guarantees
//! - **Checkpoints**: Immutable snapshots of values, versions, and pending
//!   dispatches, persisted through a pluggable store
//! - **Sends**: Dynamic fan-out — dispatch a payload to a named node in the
//!   next superstep
//! - **Interrupts**: Cooperative suspension with deterministic resumption
//!
//! ## Quick Start
//!
//! ```rust
//! use serde_json::{json, Value};
//! use skein::channels::Channel;
//! use skein::graphs::{GraphBuilder, NodeSpec};
//! use skein::node::{NodeContext, NodeError, NodeOutput};
//! use skein::runtimes::RunConfig;
//!
//! async fn shout(input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
//!     let text = input.as_str().unwrap_or_default().to_uppercase();
//!     Ok(NodeOutput::write("reply", json!(text)))
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let app = GraphBuilder::new()
//!     .add_channel("prompt", Channel::last_value())
//!     .add_channel("reply", Channel::last_value())
//!     .add_node(
//!         NodeSpec::new("shout", shout)
//!             .with_triggers(["prompt"])
//!             .with_writes(["reply"]),
//!     )
//!     .with_input_channels(["prompt"])
//!     .with_output_channels(["reply"])
//!     .compile()?;
//!
//! let output = app.invoke(json!("hello"), RunConfig::default()).await?;
//! assert_eq!(output, json!("HELLO"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence and Resumption
//!
//! Attach a [`checkpoint::CheckpointStore`] to the builder and give each run
//! a `thread_id`; every superstep then appends a checkpoint to the thread's
//! lineage. A later invocation with the same thread resumes where the
//! previous one stopped, `get_state_history` walks the lineage, and
//! `update_state` forks it.
//!
//! ## Module Guide
//!
//! - [`channels`] - Versioned state cells and their merge rules
//! - [`checkpoint`] - Snapshot model and the abstract store
//! - [`control`] - Sends, commands, interrupts, reserved names
//! - [`node`] - The `Node` trait, execution context, retry and cache policies
//! - [`graphs`] - Graph declaration and compilation
//! - [`app`] - The compiled graph: invoke, stream, state surface
//! - [`runtimes`] - The superstep loop, subgraphs, caching, run configuration
//! - [`stream`] - Engine event streaming
//! - [`snapshot`] - Read-only state views
//! - [`types`] - Deterministic task and interrupt identity

pub mod app;
pub mod channels;
pub mod checkpoint;
pub mod control;
pub mod graphs;
pub mod node;
pub mod runtimes;
pub mod snapshot;
pub mod stream;
pub mod types;
