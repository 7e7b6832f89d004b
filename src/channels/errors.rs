//! Error taxonomy for channel operations.

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised by channel reads and merges.
///
/// `InvalidUpdate` is fatal for the superstep that produced it: the barrier
/// rejects the whole batch and no checkpoint is written for that step.
#[derive(Debug, Error, Diagnostic)]
pub enum ChannelError {
    /// The writes handed to a channel violate its merge rule, e.g. two
    /// tasks wrote an exclusive channel in the same superstep.
    #[error("invalid update for channel `{channel}`: {reason}")]
    #[diagnostic(
        code(skein::channels::invalid_update),
        help("Exclusive channels accept at most one write per superstep; route the extra writes through an accumulating channel or a reducer.")
    )]
    InvalidUpdate { channel: String, reason: String },

    /// The channel holds no value.
    #[error("channel `{channel}` is empty")]
    #[diagnostic(
        code(skein::channels::empty),
        help("Read the channel only after a writer has produced a value for it.")
    )]
    Empty { channel: String },

    /// No channel with this name exists in the graph.
    #[error("unknown channel: `{channel}`")]
    #[diagnostic(
        code(skein::channels::unknown),
        help("Declare the channel on the graph builder before writing to it.")
    )]
    Unknown { channel: String },
}

impl ChannelError {
    pub(crate) fn invalid(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        ChannelError::InvalidUpdate {
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}
