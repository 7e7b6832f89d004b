//! Runtime execution: planning, the apply barrier, the superstep loop,
//! subgraph composition, caching, and run configuration.
//!
//! The public surface of a run lives on [`App`](crate::app::App); the types
//! here configure it ([`RunConfig`], [`Durability`]) or plug into it
//! ([`CacheStore`], [`SubgraphNode`]). The planner and barrier are internal:
//! their observable contract is the superstep semantics documented on the
//! crate root.

pub mod barrier;
pub mod cache;
pub mod config;
pub(crate) mod planner;
pub mod runner;
pub mod subgraph;
pub mod tracer;

use std::sync::Arc;

pub use barrier::local_read;
pub use cache::{CacheStore, CachedWrites, InMemoryCache};
pub use config::{
    child_namespace, Durability, RunConfig, DEFAULT_RECURSION_LIMIT, NS_END, NS_SEP,
};
pub use runner::GraphError;
pub use subgraph::SubgraphNode;
pub use tracer::{TraceTask, Tracer};

/// Produces the next version for a channel from its previous one.
///
/// Any strictly monotone scheme works; the default is `prev + 1`. Keeping
/// the generator injectable isolates persistence from timing: wall-clock
/// skew can never reorder versions.
pub type VersionGenerator = Arc<dyn Fn(Option<u64>, &str) -> u64 + Send + Sync>;
