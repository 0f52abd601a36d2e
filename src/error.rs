//! Errors surfaced by a replication round and by its collaborators.

use std::time::Duration;

use anyerror::AnyError;

use crate::types::NodeId;

/// Error returned to the caller of a replication round.
///
/// Only a subset of these is ever surfaced by
/// [`wait_for_majority`](crate::replication::ReplicateEntriesStm::wait_for_majority):
/// dispatch errors are absorbed into the per-follower reply path and show up
/// as a lack of acknowledgement, never as a round failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicateError {
    /// Appending the batch to the leader's own log failed; terminal for the
    /// round.
    #[error("failed to append entries to the leader log")]
    LeaderAppendFailed,

    /// Flushing the leader's log failed; reported as the leader's own
    /// `AppendEntries` reply error.
    #[error("failed to flush the leader log")]
    LeaderFlushFailed,

    /// A request to a follower could not be sent, or its reply could not be
    /// received. Counted, not fatal to the round.
    #[error("failed to dispatch append entries request")]
    AppendEntriesDispatchError,

    /// The appended entries were overwritten by a newer leader before they
    /// could be committed.
    #[error("replicated entry was truncated by a newer leader")]
    ReplicatedEntryTruncated,

    /// The node is shutting down; the commit wait was abandoned.
    #[error("replication aborted - shutting down")]
    ShuttingDown,
}

/// A failure inside the log storage layer, wrapping the foreign cause.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("storage error: {source}")]
pub struct StorageError {
    pub source: AnyError,
}

impl StorageError {
    pub fn new(source: &(impl std::error::Error + 'static)) -> Self {
        Self {
            source: AnyError::new(source),
        }
    }

    pub fn with_message(msg: impl ToString) -> Self {
        Self {
            source: AnyError::error(msg),
        }
    }
}

/// A failure in the RPC transport while talking to one target node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RPCError {
    /// The target did not reply within the request deadline.
    #[error("timeout after {timeout:?} sending append entries to {target}")]
    Timeout { target: NodeId, timeout: Duration },

    /// No connection to the target could be established.
    #[error("node {target} is unreachable: {source}")]
    Unreachable { target: NodeId, source: AnyError },

    /// Any other transport-level failure.
    #[error("network error: {source}")]
    Network { source: AnyError },
}

/// Error raised when building an invalid [`Config`](crate::config::Config).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("replicate append timeout must be at least 1ms, got {got}ms")]
    ReplicateAppendTimeoutTooSmall { got: u64 },
}
