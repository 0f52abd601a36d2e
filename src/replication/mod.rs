//! One-shot replication of a record batch from the leader to the group.

mod replicate_stm;

pub use replicate_stm::ReplicateEntriesStm;
