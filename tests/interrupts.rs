mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use skein::app::App;
use skein::channels::Channel;
use skein::checkpoint::InMemorySaver;
use skein::control::Command;
use skein::graphs::{GraphBuilder, NodeSpec};
use skein::node::{Node, NodeContext, NodeError, NodeOutput};
use skein::runtimes::{GraphError, RunConfig};

use common::fixtures::concat_string;
use common::nodes::AddOne;

/// Interrupts when the market is DE, otherwise reports all good.
struct ToolTwo;

#[async_trait]
impl Node for ToolTwo {
    async fn run(&self, input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        if input.as_str() == Some("DE") {
            let answer = ctx.interrupt(json!("Just because..."))?;
            let answer = answer.as_str().unwrap_or_default();
            return Ok(NodeOutput::write("my_key", json!(format!(" {answer}"))));
        }
        Ok(NodeOutput::write("my_key", json!(" all good")))
    }
}

fn approval_app(store: Option<Arc<InMemorySaver>>) -> App {
    let mut builder = GraphBuilder::new()
        .add_channel("my_key", concat_string())
        .add_channel("market", Channel::last_value())
        .add_node(
            NodeSpec::new("tool_two", ToolTwo)
                .with_triggers(["market"])
                .with_writes(["my_key"]),
        )
        .with_input_channels(["my_key", "market"])
        .with_output_channels(["my_key"]);
    if let Some(store) = store {
        builder = builder.with_store(store);
    }
    builder.compile().unwrap()
}

#[tokio::test]
async fn interrupt_pauses_then_resume_completes() {
    common::init_tracing();
    let store = Arc::new(InMemorySaver::new());
    let app = approval_app(Some(store));
    let config = RunConfig::default().with_thread_id("1");

    let paused = app
        .invoke(json!({ "my_key": "value", "market": "DE" }), config.clone())
        .await
        .unwrap();
    assert_eq!(paused, json!("value"));

    let state = app.get_state(&config, false).await.unwrap();
    assert_eq!(state.next, vec!["tool_two".to_string()]);
    assert_eq!(state.tasks.len(), 1);
    assert_eq!(state.tasks[0].interrupts.len(), 1);
    assert_eq!(state.tasks[0].interrupts[0].value, json!("Just because..."));

    let resumed = app
        .invoke(Command::resume(json!(" this is great")), config.clone())
        .await
        .unwrap();
    assert_eq!(resumed, json!("value  this is great"));

    // The run is finished: nothing left to schedule.
    let state = app.get_state(&config, false).await.unwrap();
    assert!(state.next.is_empty());
}

#[tokio::test]
async fn non_matching_market_never_interrupts() {
    let store = Arc::new(InMemorySaver::new());
    let app = approval_app(Some(store));
    let config = RunConfig::default().with_thread_id("2");

    let output = app
        .invoke(json!({ "my_key": "value", "market": "US" }), config)
        .await
        .unwrap();
    assert_eq!(output, json!("value all good"));
}

#[tokio::test]
async fn interrupt_without_checkpointer_is_rejected() {
    let app = approval_app(None);
    let error = app
        .invoke(
            json!({ "my_key": "value", "market": "DE" }),
            RunConfig::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, GraphError::NoCheckpointer { .. }));
}

#[tokio::test]
async fn breakpoints_without_checkpointer_fail_before_any_node_runs() {
    let calls = Arc::new(AtomicU32::new(0));
    let app = GraphBuilder::new()
        .add_channel("input", Channel::last_value())
        .add_channel("output", Channel::last_value())
        .add_node(
            NodeSpec::new(
                "worker",
                common::nodes::Counting {
                    calls: calls.clone(),
                    target: "output",
                    value: json!(1),
                },
            )
            .with_triggers(["input"])
            .with_writes(["output"]),
        )
        .with_input_channels(["input"])
        .with_output_channels(["output"])
        .compile()
        .unwrap();

    let config = RunConfig::default().with_interrupt_before(["worker"]);
    let error = app.invoke(json!(1), config).await.unwrap_err();
    assert!(matches!(error, GraphError::NoCheckpointer { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

fn pipeline_with_store(store: Arc<InMemorySaver>) -> App {
    GraphBuilder::new()
        .add_channel("input", Channel::last_value())
        .add_channel("middle", Channel::last_value())
        .add_channel("output", Channel::last_value())
        .add_node(
            NodeSpec::new("A", AddOne { target: "middle" })
                .with_triggers(["input"])
                .with_writes(["middle"]),
        )
        .add_node(
            NodeSpec::new("B", AddOne { target: "output" })
                .with_triggers(["middle"])
                .with_writes(["output"]),
        )
        .with_input_channels(["input"])
        .with_output_channels(["output"])
        .with_store(store)
        .compile()
        .unwrap()
}

#[tokio::test]
async fn static_breakpoint_pauses_before_node_and_resumes() {
    let store = Arc::new(InMemorySaver::new());
    let app = pipeline_with_store(store);
    let config = RunConfig::default()
        .with_thread_id("bp")
        .with_interrupt_before(["B"]);

    let paused = app.invoke(json!(2), config.clone()).await.unwrap();
    // B has not run: the output channel is still empty.
    assert_eq!(paused, Value::Null);

    let state = app.get_state(&config, false).await.unwrap();
    assert_eq!(state.next, vec!["B".to_string()]);
    assert_eq!(state.values.get("middle"), Some(&json!(3)));

    // Re-entering with no new input passes the gate and finishes.
    let resumed = app.invoke(Command::default(), config.clone()).await.unwrap();
    assert_eq!(resumed, json!(4));
}

#[tokio::test]
async fn interrupt_after_pauses_once_node_writes_are_applied() {
    let store = Arc::new(InMemorySaver::new());
    let app = pipeline_with_store(store);
    let config = RunConfig::default()
        .with_thread_id("bp-after")
        .with_interrupt_after(["A"]);

    app.invoke(json!(2), config.clone()).await.unwrap();
    let state = app.get_state(&config, false).await.unwrap();
    // A's write is applied; B is next.
    assert_eq!(state.values.get("middle"), Some(&json!(3)));
    assert_eq!(state.next, vec!["B".to_string()]);

    let resumed = app.invoke(Command::default(), config.clone()).await.unwrap();
    assert_eq!(resumed, json!(4));
}

/// A task with two sequential interrupts converges over repeated resumes:
/// resolved calls replay from history, the next unresolved one raises.
#[tokio::test]
async fn sequential_interrupts_replay_resolved_calls() {
    struct TwoGates;

    #[async_trait]
    impl Node for TwoGates {
        async fn run(&self, _input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
            let first = ctx.interrupt(json!("first?"))?;
            let second = ctx.interrupt(json!("second?"))?;
            Ok(NodeOutput::write(
                "log",
                json!(format!(
                    "{}+{}",
                    first.as_str().unwrap_or_default(),
                    second.as_str().unwrap_or_default()
                )),
            ))
        }
    }

    let store = Arc::new(InMemorySaver::new());
    let app = GraphBuilder::new()
        .add_channel("start", Channel::last_value())
        .add_channel("log", Channel::last_value())
        .add_node(
            NodeSpec::new("gates", TwoGates)
                .with_triggers(["start"])
                .with_writes(["log"]),
        )
        .with_input_channels(["start"])
        .with_output_channels(["log"])
        .with_store(store)
        .compile()
        .unwrap();
    let config = RunConfig::default().with_thread_id("gates");

    app.invoke(json!(true), config.clone()).await.unwrap();
    let state = app.get_state(&config, false).await.unwrap();
    assert_eq!(state.tasks[0].interrupts[0].value, json!("first?"));

    app.invoke(Command::resume(json!("a")), config.clone())
        .await
        .unwrap();
    let state = app.get_state(&config, false).await.unwrap();
    assert_eq!(state.tasks[0].interrupts.len(), 1);
    assert_eq!(state.tasks[0].interrupts[0].value, json!("second?"));

    let finished = app
        .invoke(Command::resume(json!("b")), config.clone())
        .await
        .unwrap();
    assert_eq!(finished, json!("a+b"));
}
