//! Single-round replication for a Raft leader.
//!
//! This crate implements the state machine that drives one `AppendEntries`
//! fan-out on behalf of a leader: append a batch of records to the leader's
//! own log, dispatch the same batch to every other member of the current
//! configuration in parallel, optionally flush the leader's log, and wait
//! until the appended entries are committed by a majority, known to be
//! truncated by a newer leader, or the node is shutting down.
//!
//! The long-lived consensus object (election, recovery, storage, transport)
//! is an external collaborator, abstracted by the [`Consensus`] trait. A
//! round is a single-shot [`ReplicateEntriesStm`]:
//!
//! ```ignore
//! let mut stm = ReplicateEntriesStm::new(consensus, meta, flush, batches, seqs);
//! let launched = stm.apply(units).await;
//! let result = stm.wait_for_majority().await;
//! stm.wait_for_shutdown().await;
//! ```
//!
//! Stop conditions for a round:
//!
//! 1. the leader's commit index reaches the offset the round appended
//!    (success);
//! 2. the term changed and the log no longer holds the appended entry at
//!    its original term (the entry was truncated, failure);
//! 3. the node is shutting down (failure).
//!
//! The wait is realized with a watch channel that is only notified when the
//! commit index changes.

#![allow(clippy::uninlined_format_args)]
#![deny(unused_qualifications)]

pub mod batch;
pub mod config;
pub mod consensus;
pub mod error;
pub mod follower;
pub mod membership;
pub mod metrics;
pub mod network;
pub mod replication;
pub mod types;
pub mod units;

pub use anyerror;
pub use anyerror::AnyError;

pub use crate::batch::BatchReader;
pub use crate::batch::RecordBatch;
pub use crate::config::Config;
pub use crate::consensus::Consensus;
pub use crate::error::ConfigError;
pub use crate::error::RPCError;
pub use crate::error::ReplicateError;
pub use crate::error::StorageError;
pub use crate::follower::FollowerMetadata;
pub use crate::follower::FollowerStats;
pub use crate::follower::HeartbeatGuard;
pub use crate::membership::GroupConfiguration;
pub use crate::metrics::Probe;
pub use crate::network::AppendEntriesWireVersion;
pub use crate::network::RPCOption;
pub use crate::replication::ReplicateEntriesStm;
pub use crate::types::AppendEntriesReply;
pub use crate::types::AppendEntriesRequest;
pub use crate::types::AppendResult;
pub use crate::types::ConsistencyLevel;
pub use crate::types::FollowerReqSeq;
pub use crate::types::GroupId;
pub use crate::types::LogIndex;
pub use crate::types::NodeId;
pub use crate::types::ProtocolMetadata;
pub use crate::types::ReplicateResult;
pub use crate::types::ReplyResult;
pub use crate::types::Term;
pub use crate::units::ReplicateUnits;
