//! Snapshot of the group configuration used for a single fan-out.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::types::NodeId;

/// The set of voters and learners a round replicates to.
///
/// The leader itself is part of the voter set. A node is never both a voter
/// and a learner; voter membership wins if a caller passes overlapping
/// sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct GroupConfiguration {
    voters: BTreeSet<NodeId>,
    learners: BTreeSet<NodeId>,
}

impl GroupConfiguration {
    pub fn new(voters: BTreeSet<NodeId>, mut learners: BTreeSet<NodeId>) -> Self {
        learners.retain(|id| !voters.contains(id));
        Self { voters, learners }
    }

    pub fn voters(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.voters.iter().copied()
    }

    pub fn learners(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.learners.iter().copied()
    }

    /// Iterate every member of the configuration, voters then learners.
    pub fn broker_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.voters().chain(self.learners())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.voters.contains(&id) || self.learners.contains(&id)
    }

    pub fn is_learner(&self, id: NodeId) -> bool {
        self.learners.contains(&id)
    }

    /// Number of voter acknowledgements required to commit.
    pub fn majority(&self) -> usize {
        self.voters.len() / 2 + 1
    }
}
