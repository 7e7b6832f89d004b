mod common;

use async_trait::async_trait;
use serde_json::{json, Value};
use skein::app::App;
use skein::channels::Channel;
use skein::control::Command;
use skein::graphs::{GraphBuilder, NodeSpec};
use skein::node::{Node, NodeContext, NodeError, NodeOutput};
use skein::runtimes::RunConfig;

use common::fixtures::{concat_array, sum_channel};
use common::nodes::Counting;

/// Dispatches one send per subject to `generate_joke`.
struct FanOut;

#[async_trait]
impl Node for FanOut {
    async fn run(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let subjects = input
            .as_array()
            .ok_or(NodeError::MissingInput { what: "subjects" })?;
        let mut command = Command::new();
        for subject in subjects {
            command = command.with_send("generate_joke", json!({ "subjects": [subject] }));
        }
        Ok(command.into())
    }
}

struct GenerateJoke;

#[async_trait]
impl Node for GenerateJoke {
    async fn run(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let subject = input["subjects"][0]
            .as_str()
            .ok_or(NodeError::MissingInput { what: "subject" })?;
        Ok(NodeOutput::write(
            "jokes",
            json!([format!("Joke about {subject}")]),
        ))
    }
}

fn map_reduce_app() -> App {
    GraphBuilder::new()
        .add_channel("subjects", Channel::last_value())
        .add_channel("jokes", concat_array())
        .add_node(
            NodeSpec::new("fan_out", FanOut)
                .with_triggers(["subjects"])
                .with_reads(["subjects"]),
        )
        .add_node(NodeSpec::new("generate_joke", GenerateJoke).with_writes(["jokes"]))
        .with_input_channels(["subjects", "jokes"])
        .compile()
        .unwrap()
}

#[tokio::test]
async fn map_reduce_fans_out_in_send_order() {
    let app = map_reduce_app();
    let output = app
        .invoke(json!({ "subjects": ["cats", "dogs"] }), RunConfig::default())
        .await
        .unwrap();
    assert_eq!(
        output["jokes"],
        json!(["Joke about cats", "Joke about dogs"])
    );
    assert_eq!(output["subjects"], json!(["cats", "dogs"]));
}

/// Sends to writer-less or unknown nodes are dropped without failing the
/// superstep or occupying a task slot.
#[tokio::test]
async fn sends_to_writerless_nodes_are_dropped() {
    let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));

    struct Dispatch;

    #[async_trait]
    impl Node for Dispatch {
        async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
            Ok(Command::new()
                .with_send("sink", json!(1))
                .with_send("ghost", json!(2))
                .with_send("worker", json!(3))
                .into())
        }
    }

    let app = GraphBuilder::new()
        .add_channel("start", Channel::last_value())
        .add_channel("total", sum_channel())
        .add_node(NodeSpec::new("dispatch", Dispatch).with_triggers(["start"]))
        // Declares no writers, so it is never a valid send target.
        .add_node(NodeSpec::new(
            "sink",
            Counting {
                calls: calls.clone(),
                target: "total",
                value: json!(0),
            },
        ))
        .add_node(
            NodeSpec::new(
                "worker",
                Counting {
                    calls: calls.clone(),
                    target: "total",
                    value: json!(10),
                },
            )
            .with_writes(["total"]),
        )
        .with_input_channels(["start"])
        .with_output_channels(["total"])
        .compile()
        .unwrap();

    let output = app.invoke(json!(true), RunConfig::default()).await.unwrap();
    assert_eq!(output, json!(10));
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

/// Concurrent push tasks writing one aggregate channel fold in task order.
#[tokio::test]
async fn concurrent_sends_fold_into_aggregate_in_order() {
    struct Seed;

    #[async_trait]
    impl Node for Seed {
        async fn run(&self, _input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
            Ok(Command::new()
                .with_send("adder", json!(1))
                .with_send("adder", json!(2))
                .with_send("adder", json!(3))
                .into())
        }
    }

    struct Adder;

    #[async_trait]
    impl Node for Adder {
        async fn run(&self, input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
            Ok(NodeOutput::write("total", input))
        }
    }

    let app = GraphBuilder::new()
        .add_channel("start", Channel::last_value())
        .add_channel("total", sum_channel())
        .add_node(NodeSpec::new("seed", Seed).with_triggers(["start"]))
        .add_node(NodeSpec::new("adder", Adder).with_writes(["total"]))
        .with_input_channels(["start"])
        .with_output_channels(["total"])
        .compile()
        .unwrap();

    let output = app.invoke(json!(true), RunConfig::default()).await.unwrap();
    assert_eq!(output, json!(6));
}
