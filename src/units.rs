//! Resource reservations held on behalf of an in-flight replication round.

use std::fmt;

use tokio::sync::OwnedSemaphorePermit;

/// Memory and slot reservations acquired by the caller for the batch being
/// replicated.
///
/// The reservation must stay alive for as long as any dispatched request
/// still references the batch, including request continuations running on
/// other executor threads, so rounds share it as an
/// `Arc<ReplicateUnits>` and the permits are owned (not scoped to the
/// acquiring task). The permits return to their semaphores when the last
/// holder drops its handle.
#[derive(Default)]
pub struct ReplicateUnits {
    permits: Vec<OwnedSemaphorePermit>,
}

impl ReplicateUnits {
    pub fn new(permits: Vec<OwnedSemaphorePermit>) -> Self {
        Self { permits }
    }

    pub fn count(&self) -> usize {
        self.permits.len()
    }
}

impl fmt::Debug for ReplicateUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicateUnits").field("count", &self.count()).finish()
    }
}
