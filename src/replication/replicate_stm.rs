//! The single-round replication state machine.
//!
//! A round appends a batch to the leader log without flushing, dispatches
//! append entries requests to the followers while flushing the leader log
//! in parallel, and then waits until one of the stop conditions holds:
//!
//! 1. the commit index passed the offset of the appended entries (success);
//! 2. the term changed and the entry at the appended offset no longer
//!    carries the appended term (truncated, failure);
//! 3. the node is shutting down (failure).
//!
//! ```text
//!                            N1 (leader)       +
//!                            +-------+         |
//!                        +-->| flush |-------->+    OK
//!                        |   +-------+         |    +----(1)----> SUCCESS
//!                        |                     |    |
//!      N1 (leader)       |   N2                |    |
//! +-------------------+  |   +--------+------+ |    |
//! | append to own log |--+-->| append | flush |-+-->+
//! +-------------------+  |   +--------+------+ |    |
//!                     |  |                     |    |
//!                     |  |   N3                |    +-(2)-(3)---> FAILURE
//!                     |  |   +--------+------+ |    ERR
//!                     |  +-->| append | flush |-+
//!                     |      +--------+------+ |
//!                     v                        +
//!       store entry offset & term      wait for (1) or (2)
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::time::timeout_at;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use crate::batch::BatchReader;
use crate::batch::SharedBatches;
use crate::consensus::Consensus;
use crate::error::ReplicateError;
use crate::follower::HeartbeatGuard;
use crate::network::RPCOption;
use crate::types::AppendEntriesReply;
use crate::types::AppendEntriesRequest;
use crate::types::AppendResult;
use crate::types::ConsistencyLevel;
use crate::types::FollowerReqSeq;
use crate::types::LogIndex;
use crate::types::NodeId;
use crate::types::ProtocolMetadata;
use crate::types::ReplicateResult;
use crate::types::ReplyResult;
use crate::types::Term;
use crate::units::ReplicateUnits;

/// Signals the round's dispatch semaphore exactly once, when dropped.
///
/// Every dispatched request routes its completion through one of these so
/// the unit-release task cannot be starved (deadlock) or woken early
/// (units freed while requests still reference them), whatever path the
/// request takes.
struct DispatchSignal {
    sem: Arc<Semaphore>,
}

impl DispatchSignal {
    fn new(sem: Arc<Semaphore>) -> Self {
        Self { sem }
    }
}

impl Drop for DispatchSignal {
    fn drop(&mut self) {
        self.sem.add_permits(1);
    }
}

/// Everything one dispatch task needs, owned by value so the task outlives
/// the `apply` call that spawned it.
struct DispatchContext<C: Consensus> {
    consensus: Arc<C>,
    batches: Arc<SharedBatches>,
    dispatch_sem: Arc<Semaphore>,
    units: Arc<ReplicateUnits>,
    meta: ProtocolMetadata,
    is_flush_required: bool,
    dirty_offset: LogIndex,
}

/// A single-shot state machine driving one replication round.
///
/// The caller creates the machine with the request context, runs
/// [`apply`](Self::apply) to append locally and launch the fan-out,
/// [`wait_for_majority`](Self::wait_for_majority) to await the outcome,
/// and [`wait_for_shutdown`](Self::wait_for_shutdown) to drain the
/// round's background tasks before dropping it.
pub struct ReplicateEntriesStm<C: Consensus> {
    consensus: Arc<C>,
    meta: ProtocolMetadata,
    is_flush_required: bool,
    batches: Arc<SharedBatches>,
    followers_seq: BTreeMap<NodeId, FollowerReqSeq>,

    dispatch_sem: Arc<Semaphore>,
    req_bg: TaskTracker,

    append_result: Option<Result<AppendResult, ReplicateError>>,
    dirty_offset: LogIndex,
    initial_committed_offset: LogIndex,
    requests_count: u32,
}

impl<C: Consensus> ReplicateEntriesStm<C> {
    pub fn new(
        consensus: Arc<C>,
        meta: ProtocolMetadata,
        is_flush_required: bool,
        batches: BatchReader,
        followers_seq: BTreeMap<NodeId, FollowerReqSeq>,
    ) -> Self {
        Self {
            consensus,
            meta,
            is_flush_required,
            batches: Arc::new(SharedBatches::new(batches)),
            followers_seq,
            dispatch_sem: Arc::new(Semaphore::new(0)),
            req_bg: TaskTracker::new(),
            append_result: None,
            dirty_offset: 0,
            initial_committed_offset: 0,
            requests_count: 0,
        }
    }

    /// Phase one: append to the leader log and launch the fan-out.
    ///
    /// Returns as soon as every request has been *launched*, not
    /// completed; the resource `units` are held on behalf of the batch and
    /// released in the background once all dispatched requests have
    /// finished consuming it.
    #[tracing::instrument(level = "debug", skip_all, fields(group = %self.consensus.group()))]
    pub async fn apply(&mut self, units: ReplicateUnits) -> Result<ReplicateResult, ReplicateError> {
        let cfg = self.consensus.config();
        let self_id = self.consensus.self_id();

        // Suppress follower heartbeats before appending to the own log, so
        // no heartbeat carrying stale metadata races the in-flight append.
        let mut hb_guards: BTreeMap<NodeId, HeartbeatGuard> = BTreeMap::new();
        for id in cfg.broker_ids() {
            if id != self_id {
                hb_guards.insert(id, self.consensus.suppress_heartbeats(id));
            }
        }

        let units = Arc::new(units);

        let append_result = self.append_to_self().await;
        self.append_result = Some(append_result);

        let append = match self.append_result.as_ref().unwrap() {
            Ok(append) => *append,
            Err(_) => {
                // Dropping the guards re-enables heartbeats to everyone.
                drop(hb_guards);
                return self.build_replicate_result();
            }
        };
        self.dirty_offset = append.last_offset;
        // Sampled before the fan-out so the commit phase can tell genuine
        // progress from stale observations.
        self.initial_committed_offset = self.consensus.committed_offset();

        // Dispatch requests to the followers and the leader flush.
        for id in cfg.broker_ids() {
            if self.should_skip_follower_request(id) {
                if let Some(guard) = hb_guards.remove(&id) {
                    guard.unsuppress();
                }
                continue;
            }
            if id != self_id {
                self.consensus
                    .follower_stats()
                    .set_dispatch_target(id, self.dirty_offset, self.meta);
            }
            self.requests_count += 1;
            let guard = hb_guards.remove(&id);
            self.spawn_dispatch_one(id, guard, units.clone());
        }

        // Wait in the background for all requests to be dispatched, then
        // free the batch and the resource units.
        let dispatch_sem = self.dispatch_sem.clone();
        let requests_count = self.requests_count;
        let batches = self.batches.clone();
        let bg = self.req_bg.clone();
        self.req_bg.spawn(async move {
            if bg.is_closed() {
                return;
            }
            let _permits = dispatch_sem
                .acquire_many(requests_count)
                .await
                .expect("the dispatch semaphore is never closed");
            batches.release().await;
            drop(units);
        });

        self.build_replicate_result()
    }

    /// Phase two: wait until the appended entries are committed by the
    /// majority, truncated by a newer leader, or the node shuts down.
    #[tracing::instrument(level = "debug", skip_all, fields(group = %self.consensus.group()))]
    pub async fn wait_for_majority(&self) -> Result<ReplicateResult, ReplicateError> {
        let (appended_offset, appended_term) = match &self.append_result {
            Some(Ok(append)) => (append.last_offset, append.last_term),
            _ => return self.build_replicate_result(),
        };

        // Replication finishes when the committed offset reaches the
        // appended offset, or when the term changed after a commit index
        // update; the latter means the entry was either committed or
        // truncated.
        let stop_cond = || {
            let current_committed_offset = self.consensus.committed_offset();
            let committed = current_committed_offset >= appended_offset;
            let truncated = self.consensus.term() > appended_term
                && current_committed_offset > self.initial_committed_offset
                && self.consensus.log_term(appended_offset) != Some(appended_term);
            committed || truncated
        };

        let mut commit_rx = self.consensus.commit_index_updates();
        loop {
            if stop_cond() {
                return self.process_result(appended_offset, appended_term);
            }
            if commit_rx.changed().await.is_err() {
                tracing::debug!(
                    "replication of entries with last offset {} aborted - shutting down",
                    self.dirty_offset
                );
                return Err(ReplicateError::ShuttingDown);
            }
        }
    }

    /// Drain all background tasks of the round. Must be called before the
    /// machine is dropped; idempotent.
    pub async fn wait_for_shutdown(&self) {
        self.req_bg.close();
        self.req_bg.wait().await;
    }

    fn build_replicate_result(&self) -> Result<ReplicateResult, ReplicateError> {
        let append_result = self
            .append_result
            .as_ref()
            .expect("leader append result must be present before returning any result to the caller");

        match append_result {
            Ok(append) => Ok(ReplicateResult {
                last_offset: append.last_offset,
            }),
            Err(e) => Err(e.clone()),
        }
    }

    async fn append_to_self(&self) -> Result<AppendResult, ReplicateError> {
        let batches = self.batches.share().await;
        tracing::trace!("self append entries - {}", self.meta);

        self.consensus.set_last_write_consistency(if self.is_flush_required {
            ConsistencyLevel::QuorumAck
        } else {
            ConsistencyLevel::LeaderAck
        });

        let res = self
            .consensus
            .disk_append(batches, self.is_flush_required)
            .await;

        match res {
            Ok(append) => {
                tracing::trace!("leader append result: {}", append);
                // Only update the visibility upper bound if all quorum
                // replicated entries are committed already.
                if self.consensus.committed_offset() >= self.consensus.last_quorum_replicated_index() {
                    self.consensus.update_visibility_upper_bound(append.last_offset);
                    self.consensus.maybe_update_majority_replicated_index();
                }
                Ok(append)
            }
            Err(e) => {
                tracing::warn!("error replicating entries, leader append failed - {}", e);
                Err(ReplicateError::LeaderAppendFailed)
            }
        }
    }

    /// Whether to skip dispatching to a follower this round.
    ///
    /// A request is skipped when the follower is known to be unable to
    /// accept it: either it stayed silent for longer than the append
    /// timeout (presumed down; queueing more requests would only build up
    /// memory pressure, heartbeats continue and recovery catches it up),
    /// or its expected log tail does not match what this request assumes
    /// (recovery will reconcile). Learners are lagging by construction and
    /// first-ever requests lack the information to decide, so neither is
    /// exempted from dispatch by the rules above alone.
    fn should_skip_follower_request(&self, id: NodeId) -> bool {
        let snapshot = self.consensus.follower_stats().with(id, |meta| {
            (
                meta.is_learner,
                meta.last_received_reply_timestamp,
                meta.expected_log_end_offset,
            )
        });
        let Some((is_learner, last_reply, expected_log_end_offset)) = snapshot else {
            // No metadata at all: default to sending.
            return false;
        };

        let seq = match self.followers_seq.get(&id) {
            Some(seq) => *seq,
            None => panic!("no follower request sequence found for {}", id),
        };
        if !is_learner && seq.is_first() {
            // The first request to a voter (likely replicating the
            // configuration after a leadership change) is sent regardless,
            // as the voter is likely to be in sync.
            return false;
        }

        if last_reply.elapsed() > self.consensus.replicate_append_timeout() {
            tracing::trace!(
                "skipping append entries request to {} - no follower reply within the append timeout",
                id
            );
            return true;
        }
        if expected_log_end_offset != self.meta.prev_log_index {
            tracing::trace!(
                "skipping append entries request to {} - expected follower log end offset: {}, request prev offset: {}",
                id,
                expected_log_end_offset,
                self.meta.prev_log_index
            );
            return true;
        }
        false
    }

    fn spawn_dispatch_one(&self, id: NodeId, hb_guard: Option<HeartbeatGuard>, units: Arc<ReplicateUnits>) {
        let seq = if id == self.consensus.self_id() {
            FollowerReqSeq(0)
        } else {
            match self.followers_seq.get(&id) {
                Some(seq) => *seq,
                None => panic!(
                    "follower request sequence is required to exist for each follower; none found for {}",
                    id
                ),
            }
        };

        let ctx = DispatchContext {
            consensus: self.consensus.clone(),
            batches: self.batches.clone(),
            dispatch_sem: self.dispatch_sem.clone(),
            units,
            meta: self.meta,
            is_flush_required: self.is_flush_required,
            dirty_offset: self.dirty_offset,
        };
        let bg = self.req_bg.clone();
        self.req_bg.spawn(async move {
            if bg.is_closed() {
                return;
            }
            ctx.dispatch_one(id, seq, hb_guard).await;
        });
    }

    fn process_result(
        &self,
        appended_offset: LogIndex,
        appended_term: Term,
    ) -> Result<ReplicateResult, ReplicateError> {
        tracing::trace!(
            "replication result [offset: {}, term: {}, commit_idx: {}, current_term: {}]",
            appended_offset,
            appended_term,
            self.consensus.committed_offset(),
            self.consensus.term()
        );

        // If the term changed we have to check whether the entry survived.
        if appended_term != self.consensus.term() {
            let current_term = self.consensus.log_term(appended_offset);
            if current_term != Some(appended_term) {
                tracing::debug!(
                    "replication failure: appended term of entry {} is different than expected, expected term: {}, current term: {:?}",
                    appended_offset,
                    appended_term,
                    current_term
                );
                return Err(ReplicateError::ReplicatedEntryTruncated);
            }
        }

        // Better crash than allow for inconsistency.
        assert!(
            appended_offset <= self.consensus.committed_offset(),
            "group {} - successful replication means the committed offset passed the last appended offset; committed offset: {}, last appended offset: {}, initial committed offset: {}",
            self.consensus.group(),
            self.consensus.committed_offset(),
            appended_offset,
            self.initial_committed_offset
        );

        tracing::trace!(
            "replication success, last offset: {}, term: {}",
            appended_offset,
            appended_term
        );
        self.build_replicate_result()
    }
}

impl<C: Consensus> Drop for ReplicateEntriesStm<C> {
    fn drop(&mut self) {
        assert!(
            self.req_bg.is_empty() || self.req_bg.is_closed(),
            "replication round dropped with live background tasks; call wait_for_shutdown() first"
        );
    }
}

impl<C: Consensus> DispatchContext<C> {
    async fn dispatch_one(&self, id: NodeId, seq: FollowerReqSeq, hb_guard: Option<HeartbeatGuard>) {
        let reply = self.dispatch_single_retry(id, hb_guard).await;
        if reply.is_err() {
            self.consensus.probe().replicate_request_error();
        }
        self.consensus
            .process_append_entries_reply(id, reply, seq, self.dirty_offset);
    }

    async fn dispatch_single_retry(
        &self,
        id: NodeId,
        hb_guard: Option<HeartbeatGuard>,
    ) -> Result<AppendEntriesReply, ReplicateError> {
        if id == self.consensus.self_id() {
            self.flush_log().await
        } else {
            let batches = self.batches.share().await;
            self.send_append_entries_request(id, batches, hb_guard).await
        }
    }

    /// The leader's own slot in the fan-out: flush if the round requires
    /// it and acknowledge ourselves at the appended offset.
    async fn flush_log(&self) -> Result<AppendEntriesReply, ReplicateError> {
        let _signal = DispatchSignal::new(self.dispatch_sem.clone());

        if self.is_flush_required {
            if let Err(e) = self.consensus.flush_log().await {
                tracing::warn!("leader flush failed - {}", e);
                return Err(ReplicateError::LeaderFlushFailed);
            }
        }

        // The dirty offset was sampled after the successful self append;
        // after the flush, data up to it is durable, so the dirty and
        // flushed offsets of the synthetic reply are the same.
        let new_committed_offset = self.dirty_offset;
        Ok(AppendEntriesReply {
            group: self.consensus.group(),
            node_id: self.consensus.self_id(),
            target_node_id: self.consensus.self_id(),
            term: self.consensus.term(),
            last_dirty_log_index: new_committed_offset,
            last_flushed_log_index: new_committed_offset,
            result: ReplyResult::Success,
        })
    }

    async fn send_append_entries_request(
        &self,
        id: NodeId,
        batches: BatchReader,
        hb_guard: Option<HeartbeatGuard>,
    ) -> Result<AppendEntriesReply, ReplicateError> {
        // Dropped when this request settles, re-enabling heartbeats to the
        // follower; declared first so it is released after the dispatch
        // signal and the serialization permit.
        let _hb_guard = hb_guard;

        self.consensus.follower_stats().note_request_in_flight(id);
        tracing::trace!("sending append entries request {} to {}", self.meta, id);

        let timeout = self.consensus.replicate_append_timeout();
        let deadline = Instant::now() + timeout;
        let opts = RPCOption::new(deadline)
            .with_resource_units(self.units.clone())
            .with_wire_version(self.consensus.append_entries_wire_version());

        let _signal = DispatchSignal::new(self.dispatch_sem.clone());

        // When the permit is released the next append entries request can
        // be dispatched to this follower.
        let _permit = match self.consensus.follower_stats().get_append_entries_unit(id).await {
            Ok(permit) => permit,
            Err(_) => return Err(ReplicateError::AppendEntriesDispatchError),
        };

        let request = AppendEntriesRequest {
            source: self.consensus.self_id(),
            target: id,
            meta: self.meta,
            batches,
            flush_after_append: self.is_flush_required,
        };

        let reply = match timeout_at(deadline, self.consensus.append_entries(id, request, opts)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::warn!("error while replicating entries to {} - {}", id, e);
                return Err(ReplicateError::AppendEntriesDispatchError);
            }
            Err(_) => {
                tracing::warn!("append entries request to {} timed out after {:?}", id, timeout);
                return Err(ReplicateError::AppendEntriesDispatchError);
            }
        };

        self.consensus
            .validate_reply_target_node("append_entries_replicate", reply, id)
    }
}
