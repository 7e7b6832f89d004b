//! GraphBuilder: fluent construction and validation of executable graphs.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use super::{GraphBuildError, NodeSpec};
use crate::app::App;
use crate::channels::{Channel, Channels};
use crate::checkpoint::CheckpointStore;
use crate::control::is_reserved;
use crate::runtimes::{CacheStore, Tracer, VersionGenerator};

/// Builder for executable graphs.
///
/// # Examples
///
/// ```rust
/// use serde_json::{json, Value};
/// use skein::channels::Channel;
/// use skein::graphs::{GraphBuilder, NodeSpec};
/// use skein::node::{NodeContext, NodeError, NodeOutput};
///
/// async fn double(input: Value, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
///     let n = input.as_i64().unwrap_or(0);
///     Ok(NodeOutput::write("out", json!(n * 2)))
/// }
///
/// let app = GraphBuilder::new()
///     .add_channel("in", Channel::last_value())
///     .add_channel("out", Channel::last_value())
///     .add_node(NodeSpec::new("double", double).with_triggers(["in"]).with_writes(["out"]))
///     .with_input_channels(["in"])
///     .with_output_channels(["out"])
///     .compile()
///     .unwrap();
/// # let _ = app;
/// ```
pub struct GraphBuilder {
    channels: Vec<(String, Channel)>,
    nodes: Vec<NodeSpec>,
    input_channels: Vec<String>,
    output_channels: Vec<String>,
    store: Option<Arc<dyn CheckpointStore>>,
    cache: Option<Arc<dyn CacheStore>>,
    tracer: Option<Arc<dyn Tracer>>,
    version_gen: Option<VersionGenerator>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            nodes: Vec::new(),
            input_channels: Vec::new(),
            output_channels: Vec::new(),
            store: None,
            cache: None,
            tracer: None,
            version_gen: None,
        }
    }

    /// Declare a named channel. Declaration order is the engine's canonical
    /// channel order.
    #[must_use]
    pub fn add_channel(mut self, name: impl Into<String>, channel: Channel) -> Self {
        self.channels.push((name.into(), channel));
        self
    }

    /// Mount a node.
    #[must_use]
    pub fn add_node(mut self, spec: NodeSpec) -> Self {
        self.nodes.push(spec);
        self
    }

    /// Channels fresh input is written to. Defaults to every declared
    /// channel.
    #[must_use]
    pub fn with_input_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_channels = channels.into_iter().map(Into::into).collect();
        self
    }

    /// Channels projected into run output. Defaults to every declared
    /// channel.
    #[must_use]
    pub fn with_output_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_channels = channels.into_iter().map(Into::into).collect();
        self
    }

    /// Attach a checkpoint store; required for resumption, interrupts, and
    /// state inspection.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attach a shared node-result cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Attach lifecycle callbacks; the engine never depends on their return
    /// values.
    #[must_use]
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Replace the default `prev + 1` version generator.
    #[must_use]
    pub fn with_version_generator(
        mut self,
        generator: impl Fn(Option<u64>, &str) -> u64 + Send + Sync + 'static,
    ) -> Self {
        self.version_gen = Some(Arc::new(generator));
        self
    }

    /// Validate the topology and produce an executable [`App`].
    pub fn compile(self) -> Result<App, GraphBuildError> {
        if self.nodes.is_empty() {
            return Err(GraphBuildError::NoNodes);
        }

        let mut channels = Channels::new();
        for (name, channel) in self.channels {
            if is_reserved(&name) {
                return Err(GraphBuildError::ReservedName {
                    name,
                    what: "channel",
                });
            }
            if channels.contains(&name) {
                return Err(GraphBuildError::DuplicateChannel { name });
            }
            channels.insert(name, channel);
        }

        let mut node_names: FxHashSet<&str> = FxHashSet::default();
        for spec in &self.nodes {
            if is_reserved(&spec.name) {
                return Err(GraphBuildError::ReservedName {
                    name: spec.name.clone(),
                    what: "node",
                });
            }
            if !node_names.insert(spec.name.as_str()) {
                return Err(GraphBuildError::DuplicateNode {
                    name: spec.name.clone(),
                });
            }
            for (role, referenced) in [
                ("trigger", &spec.triggers),
                ("read", &spec.reads),
                ("write target", &spec.writes),
            ] {
                for channel in referenced {
                    if !channels.contains(channel) {
                        return Err(GraphBuildError::UnknownChannel {
                            node: spec.name.clone(),
                            channel: channel.clone(),
                            role,
                        });
                    }
                }
            }
        }

        let all_channels: Vec<String> = channels.names().to_vec();
        let input_channels = if self.input_channels.is_empty() {
            all_channels.clone()
        } else {
            self.input_channels
        };
        let output_channels = if self.output_channels.is_empty() {
            all_channels
        } else {
            self.output_channels
        };
        for (role, io) in [("input", &input_channels), ("output", &output_channels)] {
            for channel in io {
                if !channels.contains(channel) {
                    return Err(GraphBuildError::UnknownIoChannel {
                        channel: channel.clone(),
                        role,
                    });
                }
            }
        }

        Ok(App::from_parts(
            self.nodes,
            channels,
            input_channels,
            output_channels,
            self.store,
            self.cache,
            self.tracer,
            self.version_gen
                .unwrap_or_else(|| Arc::new(|prev, _| prev.unwrap_or(0) + 1)),
        ))
    }
}
