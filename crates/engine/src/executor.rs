//! Single-pipeline step executor.
//!
//! Drives one Source → Transform → Sink pipeline chunk by chunk. Every
//! failure is handed to the executor's own [`FaultPolicyEngine`]; only an
//! abort decision stops the run.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use ledgerbatch_core::{FailureCategory, ItemError, ItemResult};

use crate::chunk::Chunk;
use crate::fault::{AbortReason, FailureSite, FaultDecision, FaultPolicy, FaultPolicyEngine};
use crate::metrics::{MetricsCollector, MetricsSnapshot, StepMetrics};
use crate::partition::Partition;
use crate::stage::{BoxSource, BoxTransform, SharedSink};

/// Executor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Ready,
    Running,
    Completed,
    Failed,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Completed | StepState::Failed)
    }
}

/// Why a step or partition ended in [`StepState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{reason}: {message}")]
pub struct StepFailure {
    /// Partition label, when the failure happened inside a partition.
    pub partition: Option<String>,
    pub site: Option<FailureSite>,
    pub category: Option<FailureCategory>,
    pub reason: AbortReason,
    pub message: String,
}

impl StepFailure {
    /// Failure raised by the executor machinery rather than by an item.
    pub fn new(reason: AbortReason, message: impl Into<String>) -> Self {
        Self {
            partition: None,
            site: None,
            category: None,
            reason,
            message: message.into(),
        }
    }

    pub fn from_item(site: FailureSite, err: &ItemError, reason: AbortReason) -> Self {
        Self {
            partition: None,
            site: Some(site),
            category: Some(err.category()),
            reason,
            message: err.to_string(),
        }
    }

    pub fn in_partition(mut self, label: impl Into<String>) -> Self {
        self.partition = Some(label.into());
        self
    }
}

/// Result of one executor run.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub step: String,
    pub partition: Option<Partition>,
    pub state: StepState,
    pub metrics: StepMetrics,
    pub elapsed: Duration,
    pub failure: Option<StepFailure>,
}

impl ExecutionOutcome {
    pub fn is_completed(&self) -> bool {
        self.state == StepState::Completed
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot::new(self.step.clone(), self.metrics, self.elapsed)
    }
}

/// Runs one pipeline to a terminal state.
///
/// Owns its source, transform, chunk, fault counters and metrics. Only the
/// sink is shared (with the other partitions of the same step).
pub struct StepExecutor<I, O> {
    name: String,
    partition: Option<Partition>,
    chunk: Chunk<O>,
    source: BoxSource<I>,
    transform: BoxTransform<I, O>,
    sink: SharedSink<O>,
    faults: FaultPolicyEngine,
    metrics: MetricsCollector,
    state: StepState,
}

impl<I, O> std::fmt::Debug for StepExecutor<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("name", &self.name)
            .field("partition", &self.partition)
            .field("chunk_size", &self.chunk.capacity())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<I, O> StepExecutor<I, O> {
    pub fn new(
        name: impl Into<String>,
        chunk_size: usize,
        source: BoxSource<I>,
        transform: BoxTransform<I, O>,
        sink: SharedSink<O>,
        policy: Arc<FaultPolicy>,
    ) -> Self {
        Self {
            name: name.into(),
            partition: None,
            chunk: Chunk::with_capacity(chunk_size),
            source,
            transform,
            sink,
            faults: FaultPolicyEngine::new(policy),
            metrics: MetricsCollector::new(),
            state: StepState::Ready,
        }
    }

    pub fn for_partition(mut self, partition: Partition) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition(&self) -> Option<&Partition> {
        self.partition.as_ref()
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    /// Run until the source is exhausted or a failure aborts the run.
    pub fn run(mut self) -> ExecutionOutcome {
        let label = self.partition.as_ref().map(|p| p.label().to_string()).unwrap_or_default();

        self.state = StepState::Running;
        self.metrics.start();
        info!(
            step = %self.name,
            partition = %label,
            chunk_size = self.chunk.capacity(),
            policy = %self.faults.policy().name(),
            "executor started"
        );

        let failure = match self.drive() {
            Ok(()) => {
                self.state = StepState::Completed;
                None
            }
            Err(mut failure) => {
                let discarded = self.chunk.discard();
                // A failed write already counted its rollback.
                if discarded > 0 && failure.site != Some(FailureSite::Write) {
                    self.metrics.record_rollback();
                }
                if let Some(p) = &self.partition {
                    failure.partition = Some(p.label().to_string());
                }
                self.state = StepState::Failed;
                error!(
                    step = %self.name,
                    partition = %label,
                    discarded,
                    failure = %failure,
                    "executor aborted"
                );
                Some(failure)
            }
        };
        self.metrics.stop();

        let metrics = self.metrics.metrics();
        info!(
            step = %self.name,
            partition = %label,
            state = ?self.state,
            read = metrics.read,
            written = metrics.written,
            skipped = metrics.skipped,
            rolled_back = metrics.rolled_back,
            elapsed_ms = self.metrics.elapsed().as_millis() as u64,
            "executor finished"
        );

        ExecutionOutcome {
            step: self.name,
            partition: self.partition,
            state: self.state,
            metrics,
            elapsed: self.metrics.elapsed(),
            failure,
        }
    }

    fn drive(&mut self) -> Result<(), StepFailure> {
        loop {
            let next = with_faults(&mut self.faults, &mut self.metrics, FailureSite::Read, 1, || {
                self.source.next()
            })?;

            let item = match next {
                // Skipped read: move past the failed position.
                None => {
                    self.source.skip_current();
                    continue;
                }
                Some(None) => break,
                Some(Some(item)) => item,
            };
            self.metrics.record_read();

            let outputs = with_faults(&mut self.faults, &mut self.metrics, FailureSite::Process, 1, || {
                self.transform.transform(&item)
            })?;
            if let Some(outputs) = outputs {
                self.metrics.record_processed(outputs.len());
                self.append(outputs)?;
            }
        }

        let trailing = with_faults(&mut self.faults, &mut self.metrics, FailureSite::Process, 1, || {
            self.transform.finish()
        })?;
        if let Some(outputs) = trailing {
            self.append(outputs)?;
        }

        self.flush()
    }

    fn append(&mut self, outputs: Vec<O>) -> Result<(), StepFailure> {
        for output in outputs {
            if self.chunk.push(output) {
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Commit the chunk as one unit. No-op when empty.
    fn flush(&mut self) -> Result<(), StepFailure> {
        if self.chunk.is_empty() {
            return Ok(());
        }

        let len = self.chunk.len();
        let sink = &self.sink;
        let items = self.chunk.items();
        let committed = with_faults(&mut self.faults, &mut self.metrics, FailureSite::Write, len as u64, || {
            sink.write(items)
        })?;

        if committed.is_some() {
            self.metrics.record_commit(len);
            debug!(step = %self.name, items = len, "chunk committed");
        }
        self.chunk.clear();
        Ok(())
    }
}

/// Run `op` until it succeeds, is skipped (`Ok(None)`) or aborts.
fn with_faults<T>(
    faults: &mut FaultPolicyEngine,
    metrics: &mut MetricsCollector,
    site: FailureSite,
    weight: u64,
    mut op: impl FnMut() -> ItemResult<T>,
) -> Result<Option<T>, StepFailure> {
    let mut attempts = 0u32;
    loop {
        let err = match op() {
            Ok(value) => return Ok(Some(value)),
            Err(err) => err,
        };

        if site == FailureSite::Write {
            metrics.record_rollback();
        }

        match faults.on_failure(site, &err, attempts, weight) {
            FaultDecision::Retry { .. } => {
                attempts += 1;
                metrics.record_retry();
                let delay = faults.backoff(attempts);
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
            FaultDecision::Skip => {
                metrics.record_skip(site, weight);
                return Ok(None);
            }
            FaultDecision::Abort(reason) => return Err(StepFailure::from_item(site, &err, reason)),
        }
    }
}
