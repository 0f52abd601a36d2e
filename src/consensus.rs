//! The contract a replication round consumes from the long-lived consensus
//! object.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::batch::BatchReader;
use crate::error::RPCError;
use crate::error::ReplicateError;
use crate::error::StorageError;
use crate::follower::FollowerStats;
use crate::follower::HeartbeatGuard;
use crate::membership::GroupConfiguration;
use crate::metrics::Probe;
use crate::network::AppendEntriesWireVersion;
use crate::network::RPCOption;
use crate::types::AppendEntriesReply;
use crate::types::AppendEntriesRequest;
use crate::types::AppendResult;
use crate::types::ConsistencyLevel;
use crate::types::FollowerReqSeq;
use crate::types::GroupId;
use crate::types::LogIndex;
use crate::types::NodeId;
use crate::types::Term;

/// Capabilities the replication state machine borrows from the consensus
/// instance it runs inside of.
///
/// Everything here is observed or invoked from concurrently running
/// dispatch tasks, so implementations use interior mutability and all
/// methods take `&self`.
#[async_trait]
pub trait Consensus: Send + Sync + 'static {
    /// This node's id (the leader of the round).
    fn self_id(&self) -> NodeId;

    /// The Raft group being replicated.
    fn group(&self) -> GroupId;

    /// The current term.
    fn term(&self) -> Term;

    /// The highest offset known to be committed.
    fn committed_offset(&self) -> LogIndex;

    /// The highest offset replicated to a majority with quorum
    /// acknowledgement semantics.
    fn last_quorum_replicated_index(&self) -> LogIndex;

    /// Snapshot of the current group configuration.
    fn config(&self) -> GroupConfiguration;

    /// The per-follower state table.
    fn follower_stats(&self) -> &FollowerStats;

    /// Replication counters.
    fn probe(&self) -> &Probe;

    /// How long one append entries request may stay in flight.
    fn replicate_append_timeout(&self) -> Duration;

    /// The payload encoding the whole group currently accepts.
    fn append_entries_wire_version(&self) -> AppendEntriesWireVersion {
        AppendEntriesWireVersion::default()
    }

    /// A receiver notified every time the commit index moves. The channel
    /// closes when the node shuts down.
    fn commit_index_updates(&self) -> watch::Receiver<LogIndex>;

    /// Record the consistency level of the latest leader-side write.
    fn set_last_write_consistency(&self, level: ConsistencyLevel);

    /// Raise the offset up to which relaxed-consistency readers may
    /// observe data, if it is not already higher.
    fn update_visibility_upper_bound(&self, offset: LogIndex);

    /// Re-evaluate the majority replicated index after leader-local
    /// progress.
    fn maybe_update_majority_replicated_index(&self);

    /// Term of the entry stored at `offset`, or `None` if the log holds no
    /// such entry.
    fn log_term(&self, offset: LogIndex) -> Option<Term>;

    /// Append batches to the local log. When `update_quorum_index` is set
    /// the append advances the quorum-index watermark used for
    /// quorum-acknowledged writes.
    async fn disk_append(
        &self,
        batches: BatchReader,
        update_quorum_index: bool,
    ) -> Result<AppendResult, StorageError>;

    /// Durability barrier for the local log.
    async fn flush_log(&self) -> Result<(), StorageError>;

    /// Send one append entries request over the client protocol.
    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
        option: RPCOption,
    ) -> Result<AppendEntriesReply, RPCError>;

    /// Hand a reply (or dispatch error) to the long-lived follower state:
    /// reply matching by `seq`, follower stats update, quorum and commit
    /// index evaluation.
    fn process_append_entries_reply(
        &self,
        node: NodeId,
        reply: Result<AppendEntriesReply, ReplicateError>,
        seq: FollowerReqSeq,
        dirty_offset: LogIndex,
    );

    /// Suppress heartbeats to one follower for the lifetime of the
    /// returned guard.
    fn suppress_heartbeats(&self, id: NodeId) -> HeartbeatGuard {
        self.follower_stats().suppress_heartbeats(id)
    }

    /// Sanity-check that a reply actually comes from the node the request
    /// was sent to and is addressed to this node. Mis-routed replies are
    /// degraded to dispatch errors.
    fn validate_reply_target_node(
        &self,
        context: &str,
        reply: AppendEntriesReply,
        expected_node: NodeId,
    ) -> Result<AppendEntriesReply, ReplicateError> {
        if reply.node_id != expected_node {
            tracing::warn!(
                "{}: reply source {} does not match requested node {} - {}",
                context,
                reply.node_id,
                expected_node,
                reply
            );
            return Err(ReplicateError::AppendEntriesDispatchError);
        }
        if reply.target_node_id != self.self_id() {
            tracing::warn!(
                "{}: reply from {} addressed to {}, not to this node {} - {}",
                context,
                reply.node_id,
                reply.target_node_id,
                self.self_id(),
                reply
            );
            return Err(ReplicateError::AppendEntriesDispatchError);
        }
        Ok(reply)
    }
}
