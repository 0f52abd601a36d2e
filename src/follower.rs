//! Per-follower dispatch state shared between replication rounds, the
//! heartbeat machinery and the reply handling path.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::AcquireError;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;

use crate::types::LogIndex;
use crate::types::NodeId;
use crate::types::ProtocolMetadata;

/// Mutable bookkeeping the leader keeps about one follower.
#[derive(Debug)]
pub struct FollowerMetadata {
    /// Whether the node is a learner (receives entries, does not vote).
    pub is_learner: bool,
    /// When the last reply from this follower arrived.
    pub last_received_reply_timestamp: Instant,
    /// When the last append entries request to this follower was issued.
    pub last_sent_append_timestamp: Instant,
    /// The log end offset the follower is expected to have once all
    /// dispatched requests are applied.
    pub expected_log_end_offset: LogIndex,
    /// Metadata of the most recently dispatched request.
    pub last_sent_protocol_meta: Option<ProtocolMetadata>,
    /// How many in-flight appends currently suppress heartbeats to this
    /// follower.
    suppressed_heartbeats: u32,
    /// Serializes append entries requests to this follower across rounds.
    append_entries_sem: Arc<Semaphore>,
}

impl FollowerMetadata {
    fn new(is_learner: bool) -> Self {
        let now = Instant::now();
        Self {
            is_learner,
            last_received_reply_timestamp: now,
            last_sent_append_timestamp: now,
            expected_log_end_offset: 0,
            last_sent_protocol_meta: None,
            suppressed_heartbeats: 0,
            append_entries_sem: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn heartbeats_suppressed(&self) -> bool {
        self.suppressed_heartbeats > 0
    }
}

/// Serialization permit for append entries requests to one follower.
///
/// Holds the permit until dropped. A follower without a stats entry needs
/// no serialization, so the permit may be empty.
#[derive(Debug)]
pub struct AppendEntriesPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

/// The per-follower state table owned by the consensus collaborator.
///
/// Cloning produces another handle to the same table. All mutation happens
/// under one lock with short critical sections; waiting (permit
/// acquisition) happens outside of it.
#[derive(Debug, Clone, Default)]
pub struct FollowerStats {
    inner: Arc<Mutex<BTreeMap<NodeId, FollowerMetadata>>>,
}

impl FollowerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset) the entry for a follower.
    pub fn register(&self, id: NodeId, is_learner: bool) {
        self.inner.lock().unwrap().insert(id, FollowerMetadata::new(is_learner));
    }

    pub fn remove(&self, id: NodeId) {
        self.inner.lock().unwrap().remove(&id);
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.inner.lock().unwrap().contains_key(&id)
    }

    /// Read fields of one follower's metadata. Returns `None` when the
    /// follower has no entry.
    pub fn with<R>(&self, id: NodeId, f: impl FnOnce(&FollowerMetadata) -> R) -> Option<R> {
        self.inner.lock().unwrap().get(&id).map(f)
    }

    /// Mutate one follower's metadata. Returns `None` when the follower
    /// has no entry.
    pub fn with_mut<R>(&self, id: NodeId, f: impl FnOnce(&mut FollowerMetadata) -> R) -> Option<R> {
        self.inner.lock().unwrap().get_mut(&id).map(f)
    }

    /// Stamp the follower as having a request in flight right now.
    pub fn note_request_in_flight(&self, id: NodeId) {
        let _ = self.with_mut(id, |meta| meta.last_sent_append_timestamp = Instant::now());
    }

    /// Stamp the follower as having replied right now.
    pub fn note_reply_received(&self, id: NodeId) {
        let _ = self.with_mut(id, |meta| meta.last_received_reply_timestamp = Instant::now());
    }

    /// Record what a dispatched request implies about the follower's log:
    /// its expected tail and the metadata it was sent.
    pub fn set_dispatch_target(&self, id: NodeId, expected_log_end_offset: LogIndex, meta: ProtocolMetadata) {
        let _ = self.with_mut(id, |m| {
            m.expected_log_end_offset = expected_log_end_offset;
            m.last_sent_protocol_meta = Some(meta);
        });
    }

    pub fn heartbeats_suppressed(&self, id: NodeId) -> bool {
        self.with(id, FollowerMetadata::heartbeats_suppressed).unwrap_or(false)
    }

    /// Suppress heartbeats to a follower until the returned guard is
    /// released. Guards for the same follower stack, so overlapping rounds
    /// compose. Suppressing an unknown follower yields an inert guard.
    pub fn suppress_heartbeats(&self, id: NodeId) -> HeartbeatGuard {
        let _ = self.with_mut(id, |meta| meta.suppressed_heartbeats += 1);
        HeartbeatGuard {
            stats: self.clone(),
            id,
            released: false,
        }
    }

    /// Acquire the permit serializing append entries requests to one
    /// follower. Fails only when the table was closed for shutdown.
    pub async fn get_append_entries_unit(&self, id: NodeId) -> Result<AppendEntriesPermit, AcquireError> {
        let sem = {
            let inner = self.inner.lock().unwrap();
            inner.get(&id).map(|meta| meta.append_entries_sem.clone())
        };
        let permit = match sem {
            Some(sem) => Some(sem.acquire_owned().await?),
            None => None,
        };
        Ok(AppendEntriesPermit { _permit: permit })
    }

    /// Close every per-follower permit semaphore; pending and future
    /// acquisitions fail. Used on shutdown.
    pub fn close(&self) {
        let inner = self.inner.lock().unwrap();
        for meta in inner.values() {
            meta.append_entries_sem.close();
        }
    }
}

/// Scoped token suppressing heartbeats to one follower.
///
/// Releasing happens exactly once: through an explicit
/// [`unsuppress`](HeartbeatGuard::unsuppress) or when the guard drops,
/// whichever comes first. A leaked guard would starve the follower of
/// heartbeats and trigger spurious elections.
#[derive(Debug)]
pub struct HeartbeatGuard {
    stats: FollowerStats,
    id: NodeId,
    released: bool,
}

impl HeartbeatGuard {
    /// Re-enable heartbeats to the follower now.
    pub fn unsuppress(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let _ = self.stats.with_mut(self.id, |meta| {
            meta.suppressed_heartbeats = meta.suppressed_heartbeats.saturating_sub(1);
        });
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.release_once();
    }
}
