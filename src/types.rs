//! Identifier and wire types exchanged with the consensus collaborator.
//!
//! Offsets and terms are plain `u64`s. The first record of a log lives at
//! offset `1`; offset `0` means "no entries", so `prev_log_index == 0`
//! denotes an append at the head of an empty log and `committed_offset ==
//! 0` means nothing has been committed yet.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::batch::BatchReader;

/// A Raft node ID.
pub type NodeId = u64;

/// The offset of a record in the replicated log.
pub type LogIndex = u64;

/// A Raft election term.
pub type Term = u64;

/// Identifier of a Raft group (one replicated log).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing sequence number of requests sent to one
/// follower, supplied by the caller so that replies can be matched to
/// requests and reorderings detected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
pub struct FollowerReqSeq(pub u64);

impl FollowerReqSeq {
    /// Whether this sequence number denotes the first request ever sent to
    /// a follower. Sequence `0` is reserved for the leader's own flush.
    pub fn is_first(&self) -> bool {
        self.0 <= 1
    }
}

impl fmt::Display for FollowerReqSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Consistency level requested for a leader-side write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// The write is acknowledged only after a majority has flushed it.
    QuorumAck,
    /// The write is acknowledged once the leader has appended it.
    LeaderAck,
    /// The write is not acknowledged at all.
    NoAck,
}

/// The `AppendEntries` metadata describing where a batch attaches to the
/// log, fixed for the lifetime of one replication round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct ProtocolMetadata {
    /// The Raft group this request belongs to.
    pub group: GroupId,
    /// The leader's current term.
    pub term: Term,
    /// The id of the leader issuing the request.
    pub leader_id: NodeId,
    /// Offset of the entry immediately preceding the batch.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// The leader's commit index at request build time.
    pub commit_index: LogIndex,
}

impl fmt::Display for ProtocolMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{group: {}, term: {}, leader: {}, prev_log_index: {}, prev_log_term: {}, commit_index: {}}}",
            self.group, self.term, self.leader_id, self.prev_log_index, self.prev_log_term, self.commit_index
        )
    }
}

/// An `AppendEntries` RPC payload: metadata plus a readable view of the
/// record batches to replicate.
///
/// The batches are a zero-copy reader over the round's shared payload; the
/// transport consumes the reader when serializing the request.
#[derive(Debug)]
pub struct AppendEntriesRequest {
    /// The node issuing the request (the leader).
    pub source: NodeId,
    /// The node the request is addressed to.
    pub target: NodeId,
    /// Where the batch attaches to the log.
    pub meta: ProtocolMetadata,
    /// The records to append.
    pub batches: BatchReader,
    /// Whether the follower must flush before acknowledging.
    pub flush_after_append: bool,
}

/// Outcome carried by an [`AppendEntriesReply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub enum ReplyResult {
    /// The follower appended (and, if requested, flushed) the batch.
    Success,
    /// The follower rejected the request.
    Failure,
    /// The follower does not serve this group right now.
    GroupUnavailable,
    /// The follower timed out processing the request.
    Timeout,
}

/// A follower's (or the leader's own synthetic) reply to `AppendEntries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct AppendEntriesReply {
    /// The Raft group the reply belongs to.
    pub group: GroupId,
    /// The node that produced the reply.
    pub node_id: NodeId,
    /// The node the reply is addressed to (the leader).
    pub target_node_id: NodeId,
    /// The replier's current term.
    pub term: Term,
    /// The last offset present in the replier's log, flushed or not.
    pub last_dirty_log_index: LogIndex,
    /// The last offset the replier has made durable.
    pub last_flushed_log_index: LogIndex,
    /// Whether the append was accepted.
    pub result: ReplyResult,
}

impl fmt::Display for AppendEntriesReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{group: {}, node: {}, target: {}, term: {}, dirty: {}, flushed: {}, result: {:?}}}",
            self.group,
            self.node_id,
            self.target_node_id,
            self.term,
            self.last_dirty_log_index,
            self.last_flushed_log_index,
            self.result
        )
    }
}

/// Outcome of appending a batch to the leader's local log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct AppendResult {
    /// Offset of the first appended record.
    pub base_offset: LogIndex,
    /// Offset of the last appended record.
    pub last_offset: LogIndex,
    /// Term under which the records were appended.
    pub last_term: Term,
}

impl fmt::Display for AppendResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{base_offset: {}, last_offset: {}, last_term: {}}}",
            self.base_offset, self.last_offset, self.last_term
        )
    }
}

/// Successful outcome of a replication round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct ReplicateResult {
    /// The last offset the round appended and replicated.
    pub last_offset: LogIndex,
}
