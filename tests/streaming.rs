mod common;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use skein::channels::Channel;
use skein::checkpoint::InMemorySaver;
use skein::graphs::{GraphBuilder, NodeSpec};
use skein::node::{Node, NodeContext, NodeError, NodeOutput};
use skein::runtimes::{RunConfig, SubgraphNode};
use skein::stream::{DebugRecord, StreamEvent, StreamMode};

use common::nodes::AddOne;

fn pipeline() -> skein::app::App {
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
        .compile()
        .unwrap()
}

#[tokio::test]
async fn values_mode_projects_output_channels_after_each_step() {
    let app = pipeline();
    let config = RunConfig::default().with_stream_modes([StreamMode::Values]);
    let (events, outcome) = app.stream(json!(2), config).collect().await;
    assert_eq!(outcome.unwrap(), json!(4));

    let values: Vec<_> = events
        .into_iter()
        .filter_map(|event| match event {
            StreamEvent::Values { step, values, .. } => Some((step, values)),
            _ => None,
        })
        .collect();
    assert_eq!(values.len(), 2);
    // The output channel is still empty after the first step.
    assert!(values[0].1.is_empty());
    assert_eq!(values[1].1.get("output"), Some(&json!(4)));
}

#[tokio::test]
async fn debug_mode_orders_task_results_before_the_step_checkpoint() {
    let app = pipeline();
    let config = RunConfig::default().with_stream_modes([StreamMode::Debug]);
    let (events, outcome) = app.stream(json!(2), config).collect().await;
    outcome.unwrap();

    let records: Vec<DebugRecord> = events
        .into_iter()
        .filter_map(|event| match event {
            StreamEvent::Debug { record, .. } => Some(record),
            _ => None,
        })
        .collect();

    let task_count = records
        .iter()
        .filter(|record| matches!(record, DebugRecord::Task { .. }))
        .count();
    assert_eq!(task_count, 2);

    // Within a step, every task result precedes the checkpoint record.
    for step in [0_i64, 1] {
        let result_index = records.iter().position(|record| {
            matches!(record, DebugRecord::TaskResult { step: s, .. } if *s == step)
        });
        let checkpoint_index = records.iter().position(|record| {
            matches!(record, DebugRecord::Checkpoint { step: s, .. } if *s == step)
        });
        let (Some(result_index), Some(checkpoint_index)) = (result_index, checkpoint_index)
        else {
            panic!("missing records for step {step}");
        };
        assert!(result_index < checkpoint_index);
    }
}

#[tokio::test]
async fn custom_mode_carries_node_writer_values() {
    struct Shouter;

    #[async_trait]
    impl Node for Shouter {
        async fn run(&self, _input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
            ctx.write(json!("working on it"));
            Ok(NodeOutput::write("out", json!("done")))
        }
    }

    let app = GraphBuilder::new()
        .add_channel("in", Channel::last_value())
        .add_channel("out", Channel::last_value())
        .add_node(
            NodeSpec::new("shouter", Shouter)
                .with_triggers(["in"])
                .with_writes(["out"]),
        )
        .with_input_channels(["in"])
        .with_output_channels(["out"])
        .compile()
        .unwrap();

    let config = RunConfig::default().with_stream_modes([StreamMode::Custom]);
    let (events, outcome) = app.stream(json!(1), config).collect().await;
    outcome.unwrap();

    let custom: Vec<_> = events
        .into_iter()
        .filter_map(|event| match event {
            StreamEvent::Custom { node, value, .. } => Some((node, value)),
            _ => None,
        })
        .collect();
    assert_eq!(custom, vec![("shouter".to_string(), json!("working on it"))]);
}

#[tokio::test]
async fn messages_mode_splits_message_batches() {
    struct Chatty;

    #[async_trait]
    impl Node for Chatty {
        async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
            Ok(NodeOutput::write(
                "messages",
                json!([
                    { "role": "assistant", "content": "one" },
                    { "role": "tool", "content": "two" },
                ]),
            ))
        }
    }

    let app = GraphBuilder::new()
        .add_channel("in", Channel::last_value())
        .add_channel("messages", Channel::topic(true))
        .add_node(
            NodeSpec::new("chatty", Chatty)
                .with_triggers(["in"])
                .with_writes(["messages"]),
        )
        .with_input_channels(["in"])
        .with_output_channels(["messages"])
        .compile()
        .unwrap();

    let config = RunConfig::default().with_stream_modes([StreamMode::Messages]);
    let (events, outcome) = app.stream(json!(1), config).collect().await;
    outcome.unwrap();

    let messages: Vec<Value> = events
        .into_iter()
        .filter_map(|event| match event {
            StreamEvent::Message { message, node, .. } => {
                assert_eq!(node, "chatty");
                Some(message)
            }
            _ => None,
        })
        .collect();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["content"], json!("one"));
    assert_eq!(messages[1]["content"], json!("two"));
}

#[tokio::test]
async fn interrupt_events_surface_on_the_stream() {
    struct Gate;

    #[async_trait]
    impl Node for Gate {
        async fn run(&self, _input: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
            let answer = ctx.interrupt(json!("approve?"))?;
            Ok(NodeOutput::write("out", answer))
        }
    }

    let store = Arc::new(InMemorySaver::new());
    let app = GraphBuilder::new()
        .add_channel("in", Channel::last_value())
        .add_channel("out", Channel::last_value())
        .add_node(
            NodeSpec::new("gate", Gate)
                .with_triggers(["in"])
                .with_writes(["out"]),
        )
        .with_input_channels(["in"])
        .with_output_channels(["out"])
        .with_store(store)
        .compile()
        .unwrap();

    let config = RunConfig::default()
        .with_thread_id("stream-interrupt")
        .with_stream_modes([StreamMode::Values]);
    let (events, outcome) = app.stream(json!(1), config).collect().await;
    outcome.unwrap();

    let interrupts: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Interrupt { interrupts, .. } => Some(interrupts),
            _ => None,
        })
        .collect();
    assert_eq!(interrupts.len(), 1);
    assert_eq!(interrupts[0][0].value, json!("approve?"));
}

#[tokio::test]
async fn subgraph_events_are_tagged_with_their_namespace() {
    let child = GraphBuilder::new()
        .add_channel("go", Channel::last_value())
        .add_channel("done", Channel::last_value())
        .add_node(
            NodeSpec::new("worker", AddOne { target: "done" })
                .with_triggers(["go"])
                .with_writes(["done"]),
        )
        .with_input_channels(["go"])
        .with_output_channels(["done"])
        .compile()
        .unwrap();

    let store = Arc::new(InMemorySaver::new());
    let app = GraphBuilder::new()
        .add_channel("start", Channel::last_value())
        .add_channel("result", Channel::last_value())
        .add_node(
            NodeSpec::subgraph("child", SubgraphNode::new(child))
                .with_triggers(["start"])
                .with_writes(["result"]),
        )
        .with_input_channels(["start"])
        .with_output_channels(["result"])
        .with_store(store)
        .compile()
        .unwrap();

    let config = RunConfig::default()
        .with_thread_id("stream-subgraph")
        .with_stream_modes([StreamMode::Updates])
        .with_stream_subgraphs(true);
    let (events, outcome) = app.stream(json!(1), config).collect().await;
    assert_eq!(outcome.unwrap(), json!(2));

    let namespaces: Vec<String> = events
        .into_iter()
        .filter_map(|event| match event {
            StreamEvent::Updates { namespace, .. } => Some(namespace),
            _ => None,
        })
        .collect();
    assert!(namespaces.iter().any(String::is_empty));
    assert!(namespaces
        .iter()
        .any(|namespace| namespace.starts_with("child:")));
}
