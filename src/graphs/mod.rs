//! Graph definition and compilation.
//!
//! [`GraphBuilder`] is the declarative surface: register channels, mount
//! nodes with their subscriptions, pick input/output channels, attach
//! persistence, then [`GraphBuilder::compile`] into an executable
//! [`App`](crate::app::App). Compilation validates the topology up front so
//! runs never discover a dangling channel reference mid-superstep.

mod builder;

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::app::App;
use crate::node::{CachePolicy, Node, RetryPolicy};
use crate::runtimes::SubgraphNode;

pub use builder::GraphBuilder;

/// Maps a node's read-channel values into its input payload.
pub type InputMapper = Arc<dyn Fn(&FxHashMap<String, Value>) -> Value + Send + Sync>;

/// Static declaration of a node: its executable, subscriptions, and
/// execution options.
#[derive(Clone)]
pub struct NodeSpec {
    pub(crate) name: String,
    pub(crate) node: Arc<dyn Node>,
    /// Channels whose advancement schedules this node.
    pub(crate) triggers: Vec<String>,
    /// Channels read to form the node's input; defaults to the triggers.
    pub(crate) reads: Vec<String>,
    /// Channels this node may write; a node is a valid send target only if
    /// it declares at least one.
    pub(crate) writes: Vec<String>,
    pub(crate) input_map: Option<InputMapper>,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) cache: Option<CachePolicy>,
    /// Run only once no non-deferred peer is ready.
    pub(crate) defer: bool,
    /// The compiled graph mounted here, when this node is a subgraph.
    pub(crate) subgraph: Option<Arc<App>>,
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("triggers", &self.triggers)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .field("defer", &self.defer)
            .field("subgraph", &self.subgraph.is_some())
            .finish_non_exhaustive()
    }
}

impl NodeSpec {
    /// Declare a node running `node`.
    pub fn new(name: impl Into<String>, node: impl Node + 'static) -> Self {
        Self {
            name: name.into(),
            node: Arc::new(node),
            triggers: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
            input_map: None,
            retry: None,
            cache: None,
            defer: false,
            subgraph: None,
        }
    }

    /// Mount a compiled graph as a node.
    pub fn subgraph(name: impl Into<String>, subgraph: SubgraphNode) -> Self {
        let app = subgraph.app();
        let mut spec = Self::new(name, subgraph);
        spec.subgraph = Some(app);
        spec
    }

    #[must_use]
    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers = triggers.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_reads<I, S>(mut self, reads: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads = reads.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_writes<I, S>(mut self, writes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.writes = writes.into_iter().map(Into::into).collect();
        self
    }

    /// Custom mapping from read-channel values to the node input.
    #[must_use]
    pub fn with_input_mapper(
        mut self,
        mapper: impl Fn(&FxHashMap<String, Value>) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.input_map = Some(Arc::new(mapper));
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Defer this node: it runs only in supersteps where no non-deferred
    /// task is ready.
    #[must_use]
    pub fn deferred(mut self) -> Self {
        self.defer = true;
        self
    }

    pub(crate) fn effective_reads(&self) -> &[String] {
        if self.reads.is_empty() {
            &self.triggers
        } else {
            &self.reads
        }
    }
}

/// Errors detected while compiling a graph.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphBuildError {
    #[error("graph has no nodes")]
    #[diagnostic(
        code(skein::graphs::no_nodes),
        help("Add at least one node before compiling.")
    )]
    NoNodes,

    #[error("duplicate channel: `{name}`")]
    #[diagnostic(code(skein::graphs::duplicate_channel))]
    DuplicateChannel { name: String },

    #[error("duplicate node: `{name}`")]
    #[diagnostic(code(skein::graphs::duplicate_node))]
    DuplicateNode { name: String },

    #[error("`{name}` is reserved and cannot name a {what}")]
    #[diagnostic(
        code(skein::graphs::reserved_name),
        help("Names starting and ending with double underscores are reserved for engine bookkeeping.")
    )]
    ReservedName { name: String, what: &'static str },

    #[error("node `{node}` references unknown channel `{channel}` as {role}")]
    #[diagnostic(
        code(skein::graphs::unknown_channel),
        help("Declare the channel with add_channel before referencing it.")
    )]
    UnknownChannel {
        node: String,
        channel: String,
        role: &'static str,
    },

    #[error("{role} channel `{channel}` is not declared")]
    #[diagnostic(code(skein::graphs::unknown_io_channel))]
    UnknownIoChannel {
        channel: String,
        role: &'static str,
    },
}
