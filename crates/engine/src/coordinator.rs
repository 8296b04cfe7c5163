//! Fan-out of partitions onto a worker pool.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::executor::{ExecutionOutcome, StepFailure, StepState};
use crate::fault::AbortReason;
use crate::metrics::StepMetrics;
use crate::partition::Partition;
use crate::pool::{PoolStats, WorkerPool};
use crate::stage::StepTemplate;

/// Terminal result of one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionReport {
    pub label: String,
    pub lower: u64,
    pub upper: u64,
    pub state: StepState,
    pub metrics: StepMetrics,
    pub elapsed_ms: u64,
    pub failure: Option<StepFailure>,
}

impl PartitionReport {
    fn from_outcome(partition: &Partition, outcome: ExecutionOutcome) -> Self {
        Self {
            label: partition.label().to_string(),
            lower: partition.lower(),
            upper: partition.upper(),
            state: outcome.state,
            metrics: outcome.metrics,
            elapsed_ms: outcome.elapsed.as_millis() as u64,
            failure: outcome.failure,
        }
    }

    fn failed(partition: &Partition, reason: AbortReason, message: impl Into<String>) -> Self {
        Self {
            label: partition.label().to_string(),
            lower: partition.lower(),
            upper: partition.upper(),
            state: StepState::Failed,
            metrics: StepMetrics::default(),
            elapsed_ms: 0,
            failure: Some(StepFailure::new(reason, message).in_partition(partition.label())),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == StepState::Completed
    }
}

/// Aggregate of every partition of one step.
#[derive(Debug, Clone)]
pub struct CoordinatorOutcome {
    /// `Failed` if any partition failed.
    pub state: StepState,
    /// Field-wise sum over partitions.
    pub metrics: StepMetrics,
    /// Ascending by lower bound.
    pub partitions: Vec<PartitionReport>,
    pub failures: Vec<StepFailure>,
    pub pool: PoolStats,
    pub elapsed: Duration,
}

/// Runs one executor per partition and waits for all of them.
///
/// A failing partition never cancels its siblings; chunks they commit stay
/// committed.
#[derive(Debug)]
pub struct PartitionCoordinator {
    pool: WorkerPool,
}

impl PartitionCoordinator {
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool }
    }

    pub fn run<I, O>(mut self, partitions: Vec<Partition>, template: &StepTemplate<I, O>) -> CoordinatorOutcome
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let started = Instant::now();
        let step = template.name().to_string();
        info!(
            step = %step,
            partitions = partitions.len(),
            pool = %self.pool.profile().name,
            "dispatching partitions"
        );

        let (tx, rx) = mpsc::channel::<PartitionReport>();
        let mut rejected: HashMap<String, PartitionReport> = HashMap::new();

        for partition in &partitions {
            let tx = tx.clone();
            let template = template.clone();
            let task_partition = partition.clone();

            let submitted = self.pool.submit(move || {
                let report = run_partition(&template, &task_partition);
                let _ = tx.send(report);
            });

            if let Err(e) = submitted {
                error!(step = %step, partition = %partition.label(), error = %e, "partition not dispatched");
                rejected.insert(
                    partition.label().to_string(),
                    PartitionReport::failed(partition, AbortReason::PoolUnavailable, e.to_string()),
                );
            }
        }
        // Each task holds its own sender; the iterator ends once all are done.
        drop(tx);

        let mut received: HashMap<String, PartitionReport> = rx
            .iter()
            .map(|report| (report.label.clone(), report))
            .collect();
        let pool = self.pool.shutdown();

        let mut reports = Vec::with_capacity(partitions.len());
        for partition in &partitions {
            let report = received
                .remove(partition.label())
                .or_else(|| rejected.remove(partition.label()))
                .unwrap_or_else(|| {
                    warn!(step = %step, partition = %partition.label(), "partition never reported");
                    PartitionReport::failed(partition, AbortReason::WorkerLost, "partition never reported a result")
                });
            reports.push(report);
        }
        reports.sort_by_key(|r| r.lower);

        let metrics: StepMetrics = reports.iter().map(|r| &r.metrics).sum();
        let failures: Vec<StepFailure> = reports.iter().filter_map(|r| r.failure.clone()).collect();
        let state = if reports.iter().all(PartitionReport::is_completed) {
            StepState::Completed
        } else {
            StepState::Failed
        };

        info!(
            step = %step,
            state = ?state,
            partitions = reports.len(),
            failed = failures.len(),
            written = metrics.written,
            skipped = metrics.skipped,
            "partitions finished"
        );

        CoordinatorOutcome {
            state,
            metrics,
            partitions: reports,
            failures,
            pool,
            elapsed: started.elapsed(),
        }
    }
}

fn run_partition<I, O>(template: &StepTemplate<I, O>, partition: &Partition) -> PartitionReport
where
    I: Send + 'static,
    O: Send + 'static,
{
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        template.executor_for(Some(partition)).map(|executor| executor.run())
    }));

    match result {
        Ok(Ok(outcome)) => PartitionReport::from_outcome(partition, outcome),
        Ok(Err(err)) => {
            error!(step = %template.name(), partition = %partition.label(), error = %err, "source unavailable");
            PartitionReport::failed(partition, AbortReason::SourceUnavailable, err.to_string())
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(step = %template.name(), partition = %partition.label(), %message, "partition panicked");
            PartitionReport::failed(partition, AbortReason::WorkerPanicked, message)
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
