//! Probe counters exported by the consensus collaborator.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Counters fed by the replication path.
#[derive(Debug, Default)]
pub struct Probe {
    replicate_request_errors: AtomicU64,
}

impl Probe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one failed append entries dispatch.
    pub fn replicate_request_error(&self) {
        self.replicate_request_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replicate_request_errors(&self) -> u64 {
        self.replicate_request_errors.load(Ordering::Relaxed)
    }
}
