//! RPC plumbing shared with the transport implementation.

use std::sync::Arc;

use tokio::time::Instant;

use crate::units::ReplicateUnits;

/// Wire encoding generation for `AppendEntries` payloads, advertised by the
/// consensus feature gate and honored by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AppendEntriesWireVersion {
    /// Legacy encoding, understood by all releases.
    V1,
    /// Structured encoding, used once the whole group supports it.
    #[default]
    V2,
}

/// Per-request options handed to the transport.
#[derive(Debug, Clone)]
pub struct RPCOption {
    /// Absolute point in time after which the request is abandoned.
    deadline: Instant,

    /// Resource reservation kept alive for the lifetime of the request.
    ///
    /// The transport may finish the request on another executor thread;
    /// holding the shared handle keeps the quota charged to this
    /// replication round live wherever the continuation runs.
    resource_units: Option<Arc<ReplicateUnits>>,

    /// Payload encoding the target is expected to accept.
    wire_version: AppendEntriesWireVersion,
}

impl RPCOption {
    pub fn new(deadline: Instant) -> Self {
        Self {
            deadline,
            resource_units: None,
            wire_version: AppendEntriesWireVersion::default(),
        }
    }

    pub fn with_resource_units(mut self, units: Arc<ReplicateUnits>) -> Self {
        self.resource_units = Some(units);
        self
    }

    pub fn with_wire_version(mut self, version: AppendEntriesWireVersion) -> Self {
        self.wire_version = version;
        self
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn resource_units(&self) -> Option<&Arc<ReplicateUnits>> {
        self.resource_units.as_ref()
    }

    pub fn wire_version(&self) -> AppendEntriesWireVersion {
        self.wire_version
    }
}
