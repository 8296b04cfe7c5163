//! Sinks backed by keyed tables or plain buffers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ledgerbatch_core::{ItemError, ItemResult};
use ledgerbatch_engine::Sink;
use tracing::{debug, warn};

use crate::table::{Keyed, LedgerTable};

/// Upserts each batch into a table under one write lock, by record key.
pub struct TableSink<V> {
    table: Arc<dyn LedgerTable<V>>,
    failures: AtomicU32,
}

impl<V> std::fmt::Debug for TableSink<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableSink")
            .field("pending_failures", &self.failures.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<V> TableSink<V> {
    pub fn new(table: Arc<dyn LedgerTable<V>>) -> Self {
        Self {
            table,
            failures: AtomicU32::new(0),
        }
    }

    /// The next `n` writes fail with a transient error and store nothing.
    pub fn with_transient_failures(self, n: u32) -> Self {
        self.failures.store(n, Ordering::Relaxed);
        self
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl<V> Sink for TableSink<V>
where
    V: Keyed + Clone + Send + Sync,
{
    type Item = V;

    fn write(&self, batch: &[V]) -> ItemResult<()> {
        if self.take_failure() {
            warn!(rows = batch.len(), "table write interrupted");
            return Err(ItemError::transient("connection reset while writing batch"));
        }
        let rows = batch.iter().map(|row| (row.key(), row.clone())).collect();
        self.table.upsert_all(rows)?;
        debug!(rows = batch.len(), "batch upserted");
        Ok(())
    }
}

/// Appends every committed batch to an in-memory buffer.
#[derive(Debug)]
pub struct CollectingSink<T> {
    batches: Mutex<Vec<Vec<T>>>,
}

impl<T> Default for CollectingSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CollectingSink<T> {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
        }
    }

    /// Committed batches in commit order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        let batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        batches.iter().map(Vec::len).collect()
    }

    pub fn len(&self) -> usize {
        let batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        batches.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> CollectingSink<T> {
    /// Every committed item, flattened in commit order.
    pub fn items(&self) -> Vec<T> {
        let batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        batches.iter().flatten().cloned().collect()
    }
}

impl<T> Sink for CollectingSink<T>
where
    T: Clone + Send,
{
    type Item = T;

    fn write(&self, batch: &[T]) -> ItemResult<()> {
        let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        batches.push(batch.to_vec());
        Ok(())
    }
}
