//! Fixtures for driving replication rounds against a scripted consensus
//! collaborator.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Once;
use std::time::Duration;

use anyerror::AnyError;
use async_trait::async_trait;
use bytes::Bytes;
use raft_replicate::AppendEntriesReply;
use raft_replicate::AppendEntriesRequest;
use raft_replicate::AppendResult;
use raft_replicate::BatchReader;
use raft_replicate::Consensus;
use raft_replicate::ConsistencyLevel;
use raft_replicate::FollowerReqSeq;
use raft_replicate::FollowerStats;
use raft_replicate::GroupConfiguration;
use raft_replicate::GroupId;
use raft_replicate::LogIndex;
use raft_replicate::NodeId;
use raft_replicate::Probe;
use raft_replicate::ProtocolMetadata;
use raft_replicate::RPCError;
use raft_replicate::RPCOption;
use raft_replicate::RecordBatch;
use raft_replicate::ReplicateError;
use raft_replicate::ReplicateUnits;
use raft_replicate::ReplyResult;
use raft_replicate::StorageError;
use raft_replicate::Term;
use tokio::sync::watch;
use tokio::sync::Semaphore;

/// Initialize tracing for tests; controlled by `RUST_LOG`.
pub fn init_tracing() {
    static START: Once = Once::new();
    START.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// How the scripted transport answers an append entries request to one
/// follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerBehavior {
    /// Reply success with everything flushed up to the request's implied
    /// log end.
    AckFlushed,
    /// Reply success, but report nothing new flushed.
    AckUnflushed,
    /// Fail the request locally.
    ReplyError,
    /// Reply success, but claim the reply comes from a different node.
    WrongSourceNode(NodeId),
    /// Never reply; the caller's deadline has to fire.
    Hang,
    /// Ack flushed after a delay.
    DelayedAckFlushed(Duration),
}

/// One `process_append_entries_reply` invocation, as observed by the
/// collaborator.
#[derive(Debug, Clone)]
pub struct ReplyRecord {
    pub node: NodeId,
    pub seq: FollowerReqSeq,
    pub dirty_offset: LogIndex,
    pub reply: Result<AppendEntriesReply, ReplicateError>,
}

#[derive(Debug, Default)]
struct MemLog {
    dirty_offset: LogIndex,
    terms: BTreeMap<LogIndex, Term>,
}

/// A scripted consensus collaborator.
///
/// Implements just enough of the long-lived consensus state for a round to
/// run end to end: an in-memory log, follower stats, a quorum evaluation
/// that advances the commit index once a majority of voters acknowledged
/// the round's dirty offset, and a commit index watch channel.
pub struct TestConsensus {
    self_id: NodeId,
    group: GroupId,
    config: GroupConfiguration,
    replicate_append_timeout: Duration,

    term: AtomicU64,
    committed_offset: AtomicU64,
    last_quorum_replicated_index: AtomicU64,
    visibility_upper_bound: AtomicU64,
    majority_nudges: AtomicU64,
    last_write_consistency: Mutex<Option<ConsistencyLevel>>,

    log: Mutex<MemLog>,
    append_fails: AtomicBool,
    flush_fails: AtomicBool,
    flush_calls: AtomicU64,
    flushed_offset: AtomicU64,

    stats: FollowerStats,
    probe: Probe,

    commit_tx: Mutex<Option<watch::Sender<LogIndex>>>,
    commit_rx: watch::Receiver<LogIndex>,

    behaviors: Mutex<BTreeMap<NodeId, FollowerBehavior>>,
    requests_sent: Mutex<Vec<NodeId>>,
    acks: Mutex<BTreeSet<NodeId>>,
    replies: Mutex<Vec<ReplyRecord>>,
}

impl TestConsensus {
    /// A leader `self_id` of the given configuration at term 1, with a
    /// follower stats entry registered for every other member.
    pub fn new(
        self_id: NodeId,
        config: GroupConfiguration,
        replicate_append_timeout: Duration,
    ) -> Arc<Self> {
        let (tx, rx) = watch::channel(0);
        let stats = FollowerStats::new();
        for id in config.broker_ids() {
            if id != self_id {
                stats.register(id, config.is_learner(id));
            }
        }
        Arc::new(Self {
            self_id,
            group: GroupId(7),
            config,
            replicate_append_timeout,
            term: AtomicU64::new(1),
            committed_offset: AtomicU64::new(0),
            last_quorum_replicated_index: AtomicU64::new(0),
            visibility_upper_bound: AtomicU64::new(0),
            majority_nudges: AtomicU64::new(0),
            last_write_consistency: Mutex::new(None),
            log: Mutex::new(MemLog::default()),
            append_fails: AtomicBool::new(false),
            flush_fails: AtomicBool::new(false),
            flush_calls: AtomicU64::new(0),
            flushed_offset: AtomicU64::new(0),
            stats,
            probe: Probe::new(),
            commit_tx: Mutex::new(Some(tx)),
            commit_rx: rx,
            behaviors: Mutex::new(BTreeMap::new()),
            requests_sent: Mutex::new(Vec::new()),
            acks: Mutex::new(BTreeSet::new()),
            replies: Mutex::new(Vec::new()),
        })
    }

    pub fn set_behavior(&self, id: NodeId, behavior: FollowerBehavior) {
        self.behaviors.lock().unwrap().insert(id, behavior);
    }

    pub fn fail_appends(&self) {
        self.append_fails.store(true, Ordering::Relaxed);
    }

    pub fn fail_flushes(&self) {
        self.flush_fails.store(true, Ordering::Relaxed);
    }

    pub fn set_term(&self, term: Term) {
        self.term.store(term, Ordering::Relaxed);
    }

    pub fn set_last_quorum_replicated_index(&self, offset: LogIndex) {
        self.last_quorum_replicated_index.store(offset, Ordering::Relaxed);
    }

    /// Pretend a newer leader overwrote the log suffix starting at
    /// `from_offset` with entries of `term`, extending it to `to_offset`.
    pub fn rewrite_log_suffix(&self, from_offset: LogIndex, to_offset: LogIndex, term: Term) {
        let mut log = self.log.lock().unwrap();
        log.terms.retain(|offset, _| *offset < from_offset);
        for offset in from_offset..=to_offset {
            log.terms.insert(offset, term);
        }
        log.dirty_offset = log.dirty_offset.max(to_offset);
    }

    /// Advance the commit index and notify waiters, as the quorum
    /// machinery would.
    pub fn force_commit(&self, to: LogIndex) {
        let current = self.committed_offset.load(Ordering::Relaxed);
        if to <= current {
            return;
        }
        self.committed_offset.store(to, Ordering::Relaxed);
        if let Some(tx) = &*self.commit_tx.lock().unwrap() {
            let _ = tx.send(to);
        }
    }

    /// Drop the commit index watch sender, as node shutdown would.
    pub fn break_commit_notifications(&self) {
        self.commit_tx.lock().unwrap().take();
    }

    /// Wake commit index waiters without moving the commit index.
    pub fn touch_commit_watch(&self) {
        if let Some(tx) = &*self.commit_tx.lock().unwrap() {
            let _ = tx.send(self.committed_offset.load(Ordering::Relaxed));
        }
    }

    pub fn flush_calls(&self) -> u64 {
        self.flush_calls.load(Ordering::Relaxed)
    }

    pub fn flushed_offset(&self) -> LogIndex {
        self.flushed_offset.load(Ordering::Relaxed)
    }

    pub fn dirty_offset(&self) -> LogIndex {
        self.log.lock().unwrap().dirty_offset
    }

    pub fn visibility_upper_bound(&self) -> LogIndex {
        self.visibility_upper_bound.load(Ordering::Relaxed)
    }

    pub fn majority_nudges(&self) -> u64 {
        self.majority_nudges.load(Ordering::Relaxed)
    }

    pub fn last_write_consistency(&self) -> Option<ConsistencyLevel> {
        *self.last_write_consistency.lock().unwrap()
    }

    /// Node ids append entries requests were actually sent to, in dispatch
    /// order.
    pub fn requests_sent(&self) -> Vec<NodeId> {
        self.requests_sent.lock().unwrap().clone()
    }

    pub fn replies(&self) -> Vec<ReplyRecord> {
        self.replies.lock().unwrap().clone()
    }

    pub fn reply_for(&self, node: NodeId) -> Option<ReplyRecord> {
        self.replies.lock().unwrap().iter().find(|r| r.node == node).cloned()
    }

    /// The protocol metadata a replicate request built against the current
    /// log state would carry.
    pub fn protocol_meta(&self) -> ProtocolMetadata {
        let log = self.log.lock().unwrap();
        let prev_log_index = log.dirty_offset;
        let prev_log_term = log.terms.get(&prev_log_index).copied().unwrap_or(0);
        ProtocolMetadata {
            group: self.group,
            term: self.term.load(Ordering::Relaxed),
            leader_id: self.self_id,
            prev_log_index,
            prev_log_term,
            commit_index: self.committed_offset.load(Ordering::Relaxed),
        }
    }

    fn behavior_for(&self, id: NodeId) -> FollowerBehavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .unwrap_or(FollowerBehavior::AckFlushed)
    }

    fn ack_reply(&self, node: NodeId, log_end: LogIndex, flushed: LogIndex) -> AppendEntriesReply {
        AppendEntriesReply {
            group: self.group,
            node_id: node,
            target_node_id: self.self_id,
            term: self.term.load(Ordering::Relaxed),
            last_dirty_log_index: log_end,
            last_flushed_log_index: flushed,
            result: ReplyResult::Success,
        }
    }
}

#[async_trait]
impl Consensus for TestConsensus {
    fn self_id(&self) -> NodeId {
        self.self_id
    }

    fn group(&self) -> GroupId {
        self.group
    }

    fn term(&self) -> Term {
        self.term.load(Ordering::Relaxed)
    }

    fn committed_offset(&self) -> LogIndex {
        self.committed_offset.load(Ordering::Relaxed)
    }

    fn last_quorum_replicated_index(&self) -> LogIndex {
        self.last_quorum_replicated_index.load(Ordering::Relaxed)
    }

    fn config(&self) -> GroupConfiguration {
        self.config.clone()
    }

    fn follower_stats(&self) -> &FollowerStats {
        &self.stats
    }

    fn probe(&self) -> &Probe {
        &self.probe
    }

    fn replicate_append_timeout(&self) -> Duration {
        self.replicate_append_timeout
    }

    fn commit_index_updates(&self) -> watch::Receiver<LogIndex> {
        self.commit_rx.clone()
    }

    fn set_last_write_consistency(&self, level: ConsistencyLevel) {
        *self.last_write_consistency.lock().unwrap() = Some(level);
    }

    fn update_visibility_upper_bound(&self, offset: LogIndex) {
        let current = self.visibility_upper_bound.load(Ordering::Relaxed);
        self.visibility_upper_bound.store(current.max(offset), Ordering::Relaxed);
    }

    fn maybe_update_majority_replicated_index(&self) {
        self.majority_nudges.fetch_add(1, Ordering::Relaxed);
    }

    fn log_term(&self, offset: LogIndex) -> Option<Term> {
        self.log.lock().unwrap().terms.get(&offset).copied()
    }

    async fn disk_append(
        &self,
        batches: BatchReader,
        _update_quorum_index: bool,
    ) -> Result<AppendResult, StorageError> {
        if self.append_fails.load(Ordering::Relaxed) {
            return Err(StorageError {
                source: AnyError::error("injected append failure"),
            });
        }
        let term = self.term.load(Ordering::Relaxed);
        let mut log = self.log.lock().unwrap();
        let base_offset = log.dirty_offset + 1;
        let last_offset = log.dirty_offset + batches.record_count();
        for offset in base_offset..=last_offset {
            log.terms.insert(offset, term);
        }
        log.dirty_offset = last_offset;
        Ok(AppendResult {
            base_offset,
            last_offset,
            last_term: term,
        })
    }

    async fn flush_log(&self) -> Result<(), StorageError> {
        self.flush_calls.fetch_add(1, Ordering::Relaxed);
        if self.flush_fails.load(Ordering::Relaxed) {
            return Err(StorageError {
                source: AnyError::error("injected flush failure"),
            });
        }
        let dirty = self.log.lock().unwrap().dirty_offset;
        self.flushed_offset.store(dirty, Ordering::Relaxed);
        Ok(())
    }

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
        _option: RPCOption,
    ) -> Result<AppendEntriesReply, RPCError> {
        self.requests_sent.lock().unwrap().push(target);

        let log_end = request.meta.prev_log_index + request.batches.record_count();
        match self.behavior_for(target) {
            FollowerBehavior::AckFlushed => Ok(self.ack_reply(target, log_end, log_end)),
            FollowerBehavior::AckUnflushed => {
                Ok(self.ack_reply(target, log_end, request.meta.prev_log_index))
            }
            FollowerBehavior::ReplyError => Err(RPCError::Network {
                source: AnyError::error("injected transport failure"),
            }),
            FollowerBehavior::WrongSourceNode(other) => Ok(self.ack_reply(other, log_end, log_end)),
            FollowerBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(RPCError::Unreachable {
                    target,
                    source: AnyError::error("hung request resumed"),
                })
            }
            FollowerBehavior::DelayedAckFlushed(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.ack_reply(target, log_end, log_end))
            }
        }
    }

    fn process_append_entries_reply(
        &self,
        node: NodeId,
        reply: Result<AppendEntriesReply, ReplicateError>,
        seq: FollowerReqSeq,
        dirty_offset: LogIndex,
    ) {
        self.replies.lock().unwrap().push(ReplyRecord {
            node,
            seq,
            dirty_offset,
            reply: reply.clone(),
        });

        let Ok(reply) = reply else {
            return;
        };
        if reply.result != ReplyResult::Success {
            return;
        }
        self.stats.note_reply_received(node);

        if reply.last_flushed_log_index >= dirty_offset {
            let acks = {
                let mut acks = self.acks.lock().unwrap();
                acks.insert(node);
                let voters: BTreeSet<NodeId> = self.config.voters().collect();
                acks.iter().filter(|id| voters.contains(id)).count()
            };
            if acks >= self.config.majority() {
                self.force_commit(dirty_offset);
            }
        }
    }
}

/// A reader over `counts.len()` batches with the given record counts.
pub fn batches(counts: &[u32]) -> BatchReader {
    let batches = counts
        .iter()
        .map(|count| RecordBatch::new(*count, Bytes::from(vec![0xa5; 16 * *count as usize])))
        .collect();
    BatchReader::new(batches)
}

/// Follower request sequences keyed by node id.
pub fn seqs(pairs: &[(NodeId, u64)]) -> BTreeMap<NodeId, FollowerReqSeq> {
    pairs.iter().map(|(id, seq)| (*id, FollowerReqSeq(*seq))).collect()
}

/// Acquire `n` units from `sem` as a round's resource reservation.
pub async fn acquire_units(sem: &Arc<Semaphore>, n: u32) -> ReplicateUnits {
    let mut permits = Vec::new();
    for _ in 0..n {
        permits.push(sem.clone().acquire_owned().await.unwrap());
    }
    ReplicateUnits::new(permits)
}

/// Poll until `cond` holds, failing the test after a few seconds.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
