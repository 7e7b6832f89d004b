//! Versioned state channels.
//!
//! A channel is a named state cell with variant-specific merge semantics.
//! All writes a superstep produces for a channel are handed to
//! [`Channel::apply`] in one call; the variant decides how (and whether)
//! they merge. Keeping the merge rules inside the channel is what makes the
//! barrier's correctness argument local: the applier only groups writes and
//! bumps versions, it never interprets values.
//!
//! # Variants
//!
//! - [`Channel::last_value`]: exclusive cell, at most one write per superstep.
//! - [`Channel::topic`]: ordered sequence of writes, optionally accumulated
//!   across supersteps.
//! - [`Channel::ephemeral`]: like a last-value cell, but cleared by the first
//!   superstep that does not write it.
//! - [`Channel::aggregate`]: folds writes into a running value with an
//!   associative binary operator.
//! - [`Channel::reducer`]: user-defined merge of the current value and a
//!   batch of writes.
//!
//! Checkpointing is lossless: `restore(checkpoint())` reproduces the channel
//! byte for byte.

pub mod errors;

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;

pub use errors::ChannelError;

/// Associative fold operator for [`Channel::aggregate`].
pub type BinaryOperator = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;

/// User-defined merge of the current value and one-or-many writes.
pub trait Reducer: Send + Sync {
    /// Produce the next value from the current one and the writes of a
    /// single superstep (in task order).
    fn reduce(&self, current: Option<Value>, writes: Vec<Value>) -> Result<Value, ChannelError>;
}

impl<F> Reducer for F
where
    F: Fn(Option<Value>, Vec<Value>) -> Result<Value, ChannelError> + Send + Sync,
{
    fn reduce(&self, current: Option<Value>, writes: Vec<Value>) -> Result<Value, ChannelError> {
        self(current, writes)
    }
}

/// A typed state cell; see the module docs for variant semantics.
#[derive(Clone)]
pub enum Channel {
    LastValue {
        value: Option<Value>,
    },
    Topic {
        accumulate: bool,
        values: Vec<Value>,
    },
    Ephemeral {
        value: Option<Value>,
    },
    Aggregate {
        op: BinaryOperator,
        value: Option<Value>,
    },
    Custom {
        reducer: Arc<dyn Reducer>,
        value: Option<Value>,
    },
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::LastValue { value } => f.debug_struct("LastValue").field("value", value).finish(),
            Channel::Topic { accumulate, values } => f
                .debug_struct("Topic")
                .field("accumulate", accumulate)
                .field("values", values)
                .finish(),
            Channel::Ephemeral { value } => f.debug_struct("Ephemeral").field("value", value).finish(),
            Channel::Aggregate { value, .. } => {
                f.debug_struct("Aggregate").field("value", value).finish()
            }
            Channel::Custom { value, .. } => f.debug_struct("Custom").field("value", value).finish(),
        }
    }
}

impl Channel {
    /// Exclusive cell holding the last written value.
    #[must_use]
    pub fn last_value() -> Self {
        Channel::LastValue { value: None }
    }

    /// Ordered sequence of writes. With `accumulate`, values survive across
    /// supersteps; without it, each writing superstep replaces the sequence
    /// and a non-writing superstep clears it.
    #[must_use]
    pub fn topic(accumulate: bool) -> Self {
        Channel::Topic {
            accumulate,
            values: Vec::new(),
        }
    }

    /// Last-value cell cleared by the first superstep that does not write it.
    #[must_use]
    pub fn ephemeral() -> Self {
        Channel::Ephemeral { value: None }
    }

    /// Fold writes into a running value with `op`.
    pub fn aggregate(op: impl Fn(Value, Value) -> Value + Send + Sync + 'static) -> Self {
        Channel::Aggregate {
            op: Arc::new(op),
            value: None,
        }
    }

    /// Reducer-backed cell with a user-defined merge.
    pub fn reducer(reducer: impl Reducer + 'static) -> Self {
        Channel::Custom {
            reducer: Arc::new(reducer),
            value: None,
        }
    }

    /// Whether the channel currently holds a value.
    #[must_use]
    pub fn is_available(&self) -> bool {
        match self {
            Channel::LastValue { value }
            | Channel::Ephemeral { value }
            | Channel::Aggregate { value, .. }
            | Channel::Custom { value, .. } => value.is_some(),
            Channel::Topic { values, .. } => !values.is_empty(),
        }
    }

    /// Current value, if any. Topics yield the sequence as an array.
    #[must_use]
    pub fn value(&self) -> Option<Value> {
        match self {
            Channel::LastValue { value }
            | Channel::Ephemeral { value }
            | Channel::Aggregate { value, .. }
            | Channel::Custom { value, .. } => value.clone(),
            Channel::Topic { values, .. } => {
                if values.is_empty() {
                    None
                } else {
                    Some(Value::Array(values.clone()))
                }
            }
        }
    }

    /// Merge one superstep's writes into the cell.
    ///
    /// Returns `true` when the stored value changed (the barrier bumps the
    /// version exactly then). An empty `writes` batch is a no-op except for
    /// variants with reset semantics: ephemerals and non-accumulating topics
    /// clear themselves when a superstep passes without writing them.
    pub fn apply(&mut self, channel: &str, writes: Vec<Value>) -> Result<bool, ChannelError> {
        match self {
            Channel::LastValue { value } => {
                if writes.is_empty() {
                    return Ok(false);
                }
                if writes.len() > 1 {
                    return Err(ChannelError::invalid(
                        channel,
                        format!("received {} writes in one superstep", writes.len()),
                    ));
                }
                *value = writes.into_iter().next();
                Ok(true)
            }
            Channel::Topic { accumulate, values } => {
                if writes.is_empty() {
                    if *accumulate || values.is_empty() {
                        return Ok(false);
                    }
                    values.clear();
                    return Ok(true);
                }
                if *accumulate {
                    values.extend(writes);
                } else {
                    *values = writes;
                }
                Ok(true)
            }
            Channel::Ephemeral { value } => {
                if writes.is_empty() {
                    return Ok(value.take().is_some());
                }
                if writes.len() > 1 {
                    return Err(ChannelError::invalid(
                        channel,
                        format!("received {} writes in one superstep", writes.len()),
                    ));
                }
                *value = writes.into_iter().next();
                Ok(true)
            }
            Channel::Aggregate { op, value } => {
                if writes.is_empty() {
                    return Ok(false);
                }
                let mut acc = value.take();
                for write in writes {
                    acc = Some(match acc {
                        Some(current) => (op.as_ref())(current, write),
                        None => write,
                    });
                }
                *value = acc;
                Ok(true)
            }
            Channel::Custom { reducer, value } => {
                if writes.is_empty() {
                    return Ok(false);
                }
                let next = reducer.reduce(value.take(), writes)?;
                *value = Some(next);
                Ok(true)
            }
        }
    }

    /// Serializable payload for persistence, `None` when empty.
    #[must_use]
    pub fn checkpoint(&self) -> Option<Value> {
        match self {
            Channel::LastValue { value }
            | Channel::Ephemeral { value }
            | Channel::Aggregate { value, .. }
            | Channel::Custom { value, .. } => value.clone(),
            Channel::Topic { values, .. } => {
                if values.is_empty() {
                    None
                } else {
                    Some(Value::Array(values.clone()))
                }
            }
        }
    }

    /// Rehydrate the cell from a persisted payload.
    pub fn restore(&mut self, channel: &str, payload: Option<Value>) -> Result<(), ChannelError> {
        match self {
            Channel::LastValue { value }
            | Channel::Ephemeral { value }
            | Channel::Aggregate { value, .. }
            | Channel::Custom { value, .. } => {
                *value = payload;
                Ok(())
            }
            Channel::Topic { values, .. } => {
                match payload {
                    None => values.clear(),
                    Some(Value::Array(items)) => *values = items,
                    Some(other) => {
                        return Err(ChannelError::invalid(
                            channel,
                            format!("topic payload must be an array, got {other}"),
                        ));
                    }
                }
                Ok(())
            }
        }
    }
}

/// The named channels of a graph, in declaration order.
///
/// This is the live, in-memory shape the runner mutates during the apply
/// phase; checkpoints hold the serialized projection of it.
#[derive(Clone, Debug, Default)]
pub struct Channels {
    cells: FxHashMap<String, Channel>,
    order: Vec<String>,
}

impl Channels {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel. Later registrations with the same name replace
    /// the earlier cell but keep its position.
    pub fn insert(&mut self, name: impl Into<String>, channel: Channel) {
        let name = name.into();
        if self.cells.insert(name.clone(), channel).is_none() {
            self.order.push(name);
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.cells.contains_key(name)
    }

    /// Channel names in declaration order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.order
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.cells.get(name)
    }

    #[must_use]
    pub fn is_available(&self, name: &str) -> bool {
        self.cells.get(name).is_some_and(Channel::is_available)
    }

    /// Read a channel's value; errors when the channel is unknown or empty.
    pub fn read(&self, name: &str) -> Result<Value, ChannelError> {
        let cell = self.cells.get(name).ok_or_else(|| ChannelError::Unknown {
            channel: name.to_string(),
        })?;
        cell.value().ok_or_else(|| ChannelError::Empty {
            channel: name.to_string(),
        })
    }

    /// Merge one superstep's writes into `name`; `true` when it changed.
    pub fn apply(&mut self, name: &str, writes: Vec<Value>) -> Result<bool, ChannelError> {
        let cell = self
            .cells
            .get_mut(name)
            .ok_or_else(|| ChannelError::Unknown {
                channel: name.to_string(),
            })?;
        cell.apply(name, writes)
    }

    /// Serialize all non-empty channels.
    #[must_use]
    pub fn checkpoint(&self) -> FxHashMap<String, Value> {
        let mut values = FxHashMap::default();
        for name in &self.order {
            if let Some(payload) = self.cells[name].checkpoint() {
                values.insert(name.clone(), payload);
            }
        }
        values
    }

    /// Rehydrate every channel from persisted values; channels absent from
    /// `values` are reset to empty.
    pub fn restore(&mut self, values: &FxHashMap<String, Value>) -> Result<(), ChannelError> {
        for name in &self.order {
            let cell = self.cells.get_mut(name).expect("order tracks cells");
            cell.restore(name, values.get(name).cloned())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_value_rejects_two_writes() {
        let mut cell = Channel::last_value();
        let err = cell
            .apply("out", vec![json!(1), json!(2)])
            .expect_err("two writes must be rejected");
        assert!(matches!(err, ChannelError::InvalidUpdate { .. }));
    }

    #[test]
    fn topic_accumulates_in_order() {
        let mut cell = Channel::topic(true);
        cell.apply("log", vec![json!("a")]).unwrap();
        cell.apply("log", vec![json!("b"), json!("c")]).unwrap();
        assert_eq!(cell.value(), Some(json!(["a", "b", "c"])));
    }

    #[test]
    fn ephemeral_clears_on_empty_update() {
        let mut cell = Channel::ephemeral();
        cell.apply("tick", vec![json!(1)]).unwrap();
        assert!(cell.apply("tick", vec![]).unwrap());
        assert!(!cell.is_available());
        assert!(!cell.apply("tick", vec![]).unwrap());
    }

    #[test]
    fn aggregate_folds_writes() {
        let mut cell = Channel::aggregate(|a, b| {
            json!(a.as_i64().unwrap_or(0) + b.as_i64().unwrap_or(0))
        });
        cell.apply("sum", vec![json!(1), json!(2)]).unwrap();
        cell.apply("sum", vec![json!(4)]).unwrap();
        assert_eq!(cell.value(), Some(json!(7)));
    }

    #[test]
    fn falsy_values_are_values() {
        let mut cell = Channel::last_value();
        cell.apply("flag", vec![json!(null)]).unwrap();
        assert!(cell.is_available());
        assert_eq!(cell.value(), Some(Value::Null));
    }

    #[test]
    fn checkpoint_restore_round_trips() {
        let mut topic = Channel::topic(true);
        topic.apply("log", vec![json!("x"), json!("y")]).unwrap();
        let payload = topic.checkpoint();

        let mut restored = Channel::topic(true);
        restored.restore("log", payload).unwrap();
        assert_eq!(restored.value(), topic.value());
    }
}
