mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use skein::channels::Channel;
use skein::graphs::{GraphBuilder, NodeSpec};
use skein::node::{CachePolicy, NodeError, RetryPolicy};
use skein::runtimes::{GraphError, InMemoryCache, RunConfig};

use common::nodes::{Counting, Flaky, WriteValue};

/// A deferred node runs only after its non-deferred peers have completed.
#[tokio::test]
async fn deferred_nodes_run_after_ready_peers() {
    let app = GraphBuilder::new()
        .add_channel("start", Channel::last_value())
        .add_channel("log", Channel::topic(true))
        .add_node(
            NodeSpec::new(
                "eager",
                WriteValue {
                    target: "log",
                    value: json!("eager"),
                },
            )
            .with_triggers(["start"])
            .with_writes(["log"]),
        )
        .add_node(
            NodeSpec::new(
                "late",
                WriteValue {
                    target: "log",
                    value: json!("late"),
                },
            )
            .with_triggers(["start"])
            .with_writes(["log"])
            .deferred(),
        )
        .with_input_channels(["start"])
        .with_output_channels(["log"])
        .compile()
        .unwrap();

    let output = app.invoke(json!(true), RunConfig::default()).await.unwrap();
    assert_eq!(output, json!(["eager", "late"]));
}

/// Once no non-deferred work remains, all ready deferred nodes run together
/// in a single superstep, in declaration order.
#[tokio::test]
async fn simultaneous_deferred_nodes_share_one_superstep() {
    let app = GraphBuilder::new()
        .add_channel("start", Channel::last_value())
        .add_channel("log", Channel::topic(true))
        .add_node(
            NodeSpec::new(
                "first",
                WriteValue {
                    target: "log",
                    value: json!("first"),
                },
            )
            .with_triggers(["start"])
            .with_writes(["log"])
            .deferred(),
        )
        .add_node(
            NodeSpec::new(
                "second",
                WriteValue {
                    target: "log",
                    value: json!("second"),
                },
            )
            .with_triggers(["start"])
            .with_writes(["log"])
            .deferred(),
        )
        .with_input_channels(["start"])
        .with_output_channels(["log"])
        .compile()
        .unwrap();

    // Two supersteps total would re-trigger nothing; both writes land in one
    // batch, in declaration order.
    let config = RunConfig::default().with_recursion_limit(1);
    let output = app.invoke(json!(true), config).await.unwrap();
    assert_eq!(output, json!(["first", "second"]));
}

#[tokio::test]
async fn retry_policy_reruns_transient_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let app = GraphBuilder::new()
        .add_channel("start", Channel::last_value())
        .add_channel("out", Channel::last_value())
        .add_node(
            NodeSpec::new(
                "flaky",
                Flaky {
                    failures: 2,
                    calls: calls.clone(),
                    target: "out",
                },
            )
            .with_triggers(["start"])
            .with_writes(["out"])
            .with_retry(RetryPolicy::attempts(3).with_backoff(Duration::from_millis(1))),
        )
        .with_input_channels(["start"])
        .with_output_channels(["out"])
        .compile()
        .unwrap();

    let output = app.invoke(json!(true), RunConfig::default()).await.unwrap();
    assert_eq!(output, json!(3));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_surface_the_node_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let app = GraphBuilder::new()
        .add_channel("start", Channel::last_value())
        .add_channel("out", Channel::last_value())
        .add_node(
            NodeSpec::new(
                "flaky",
                Flaky {
                    failures: 5,
                    calls: calls.clone(),
                    target: "out",
                },
            )
            .with_triggers(["start"])
            .with_writes(["out"])
            .with_retry(RetryPolicy::attempts(2)),
        )
        .with_input_channels(["start"])
        .with_output_channels(["out"])
        .compile()
        .unwrap();

    let error = app
        .invoke(json!(true), RunConfig::default())
        .await
        .unwrap_err();
    match error {
        GraphError::Node { node, attempts, .. } => {
            assert_eq!(node, "flaky");
            assert_eq!(attempts, 2);
        }
        other => panic!("expected node failure, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn classifier_can_mark_errors_terminal() {
    let calls = Arc::new(AtomicU32::new(0));
    let app = GraphBuilder::new()
        .add_channel("start", Channel::last_value())
        .add_channel("out", Channel::last_value())
        .add_node(
            NodeSpec::new(
                "flaky",
                Flaky {
                    failures: 5,
                    calls: calls.clone(),
                    target: "out",
                },
            )
            .with_triggers(["start"])
            .with_writes(["out"])
            .with_retry(
                RetryPolicy::attempts(4)
                    .with_classifier(|error| !matches!(error, NodeError::Other(_))),
            ),
        )
        .with_input_channels(["start"])
        .with_output_channels(["out"])
        .compile()
        .unwrap();

    let error = app
        .invoke(json!(true), RunConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(error, GraphError::Node { attempts: 1, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cached_nodes_skip_execution_on_identical_input() {
    let calls = Arc::new(AtomicU32::new(0));
    let cache = Arc::new(InMemoryCache::new());
    let app = GraphBuilder::new()
        .add_channel("q", Channel::last_value())
        .add_channel("a", Channel::last_value())
        .add_node(
            NodeSpec::new(
                "answer",
                Counting {
                    calls: calls.clone(),
                    target: "a",
                    value: json!("pong"),
                },
            )
            .with_triggers(["q"])
            .with_writes(["a"])
            .with_cache(CachePolicy::new()),
        )
        .with_input_channels(["q"])
        .with_output_channels(["a"])
        .with_cache(cache)
        .compile()
        .unwrap();

    let first = app.invoke(json!("ping"), RunConfig::default()).await.unwrap();
    let second = app.invoke(json!("ping"), RunConfig::default()).await.unwrap();
    assert_eq!(first, json!("pong"));
    assert_eq!(second, json!("pong"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A different input misses the cache and executes.
    app.invoke(json!("other"), RunConfig::default())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn tracer_sees_every_task_and_superstep() {
    use skein::runtimes::{TraceTask, Tracer};

    #[derive(Default)]
    struct CountingTracer {
        chains: AtomicU32,
        tasks: AtomicU32,
    }

    impl Tracer for CountingTracer {
        fn on_chain_start(&self, _namespace: &str, _step: i64, _task_count: usize) {
            self.chains.fetch_add(1, Ordering::SeqCst);
        }

        fn on_task_end(&self, _task: TraceTask<'_>, error: Option<&str>) {
            assert!(error.is_none());
            self.tasks.fetch_add(1, Ordering::SeqCst);
        }
    }

    let tracer = Arc::new(CountingTracer::default());
    let app = GraphBuilder::new()
        .add_channel("start", Channel::last_value())
        .add_channel("middle", Channel::last_value())
        .add_channel("out", Channel::last_value())
        .add_node(
            NodeSpec::new("a", common::nodes::AddOne { target: "middle" })
                .with_triggers(["start"])
                .with_writes(["middle"]),
        )
        .add_node(
            NodeSpec::new("b", common::nodes::AddOne { target: "out" })
                .with_triggers(["middle"])
                .with_writes(["out"]),
        )
        .with_input_channels(["start"])
        .with_output_channels(["out"])
        .with_tracer(tracer.clone())
        .compile()
        .unwrap();

    app.invoke(json!(1), RunConfig::default()).await.unwrap();
    assert_eq!(tracer.chains.load(Ordering::SeqCst), 2);
    assert_eq!(tracer.tasks.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cancellation_aborts_the_run() {
    use tokio_util::sync::CancellationToken;

    struct Stuck;

    #[async_trait::async_trait]
    impl skein::node::Node for Stuck {
        async fn run(
            &self,
            _input: serde_json::Value,
            ctx: skein::node::NodeContext,
        ) -> Result<skein::node::NodeOutput, NodeError> {
            // Cooperative suspension point: waits forever unless cancelled.
            ctx.cancellation().cancelled().await;
            Ok(skein::node::NodeOutput::empty())
        }
    }

    let app = GraphBuilder::new()
        .add_channel("start", Channel::last_value())
        .add_channel("out", Channel::last_value())
        .add_node(
            NodeSpec::new("stuck", Stuck)
                .with_triggers(["start"])
                .with_writes(["out"]),
        )
        .with_input_channels(["start"])
        .with_output_channels(["out"])
        .compile()
        .unwrap();

    let token = CancellationToken::new();
    let config = RunConfig::default().with_cancellation(token.clone());
    let handle = tokio::spawn(async move { app.invoke(json!(true), config).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(GraphError::Cancelled)));
}
