//! Record batches and zero-copy sharing of one payload across many
//! dispatch targets.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;

/// A contiguous run of records, the unit of appending and replication.
///
/// The payload is a [`Bytes`] handle, so duplicating a batch never copies
/// record data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    /// Number of records in the batch.
    pub record_count: u32,
    /// Opaque serialized records.
    pub data: Bytes,
}

impl RecordBatch {
    pub fn new(record_count: u32, data: Bytes) -> Self {
        Self { record_count, data }
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

/// A readable view over an immutable sequence of record batches.
///
/// Readers produced from the same source share the underlying batches by
/// reference count; handing a reader to another task never copies payload.
#[derive(Debug)]
pub struct BatchReader {
    batches: Arc<[RecordBatch]>,
}

impl BatchReader {
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        Self {
            batches: batches.into(),
        }
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    /// Total number of records across all batches.
    pub fn record_count(&self) -> u64 {
        self.batches.iter().map(|b| u64::from(b.record_count)).sum()
    }

    /// Total payload size, as accounted by the quota system.
    pub fn size_bytes(&self) -> usize {
        self.batches.iter().map(RecordBatch::size_bytes).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Produce two independent views of the same underlying batches.
    fn share(&self) -> (BatchReader, BatchReader) {
        let a = BatchReader {
            batches: self.batches.clone(),
        };
        let b = BatchReader {
            batches: self.batches.clone(),
        };
        (a, b)
    }
}

/// Holder of the round's master copy of the record batches.
///
/// Every dispatch destination and the leader's own append consume the same
/// logical payload; `share` hands out one fresh reader per call and keeps
/// one spare master copy behind for the next caller (retries included). The
/// mutex makes concurrent sharers see a well-defined current master.
#[derive(Debug)]
pub(crate) struct SharedBatches {
    master: Mutex<Option<BatchReader>>,
}

impl SharedBatches {
    pub(crate) fn new(reader: BatchReader) -> Self {
        Self {
            master: Mutex::new(Some(reader)),
        }
    }

    /// Produce one fresh reader. Panics if the batches were already
    /// released, which is a bug in the round's lifecycle management.
    pub(crate) async fn share(&self) -> BatchReader {
        let mut master = self.master.lock().await;
        let current = master
            .take()
            .expect("record batches shared after they were released");
        let (keep, out) = current.share();
        *master = Some(keep);
        out
    }

    /// Drop the master copy, freeing the payload once the last outstanding
    /// reader is gone.
    pub(crate) async fn release(&self) {
        *self.master.lock().await = None;
    }
}
