//! Steps, jobs and their reports.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use ledgerbatch_core::RunId;

use crate::coordinator::{PartitionCoordinator, PartitionReport, panic_message};
use crate::executor::{StepFailure, StepState};
use crate::fault::AbortReason;
use crate::listener::StepListener;
use crate::metrics::{MetricsSnapshot, StepMetrics};
use crate::partition::{KeyDomain, Partitioner};
use crate::pool::{PoolProfile, PoolStats, WorkerPool};
use crate::stage::StepTemplate;

/// Terminal report of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: String,
    pub state: StepState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub snapshot: MetricsSnapshot,
    /// Empty for plain steps.
    pub partitions: Vec<PartitionReport>,
    pub failures: Vec<StepFailure>,
    /// Pool counters, partitioned steps only.
    pub pool: Option<PoolStats>,
}

impl StepReport {
    pub fn metrics(&self) -> &StepMetrics {
        &self.snapshot.metrics
    }

    pub fn is_failed(&self) -> bool {
        self.state == StepState::Failed
    }

    /// Completed, but some items were skipped.
    pub fn has_omissions(&self) -> bool {
        self.snapshot.metrics.skipped > 0
    }

    fn failed_before_start(step: &str, started_at: DateTime<Utc>, failure: StepFailure) -> Self {
        Self {
            step: step.to_string(),
            state: StepState::Failed,
            started_at,
            finished_at: Utc::now(),
            snapshot: MetricsSnapshot::new(step, StepMetrics::default(), Default::default()),
            partitions: Vec::new(),
            failures: vec![failure],
            pool: None,
        }
    }
}

/// Anything a [`Job`] can run.
pub trait RunnableStep: Send + Sync {
    fn name(&self) -> &str;

    /// Run to a terminal state. Never panics on item failures; every outcome
    /// is in the report.
    fn execute(&self) -> StepReport;
}

#[derive(Debug, Clone)]
enum Execution {
    Plain,
    Partitioned {
        partitioner: Partitioner,
        domain: KeyDomain,
        count: usize,
        pool: PoolProfile,
    },
}

/// One step: a template plus how to execute it.
#[derive(Debug, Clone)]
pub struct Step<I, O> {
    template: StepTemplate<I, O>,
    execution: Execution,
}

impl<I, O> Step<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Single executor over the whole input.
    pub fn plain(template: StepTemplate<I, O>) -> Self {
        Self {
            template,
            execution: Execution::Plain,
        }
    }

    /// One executor per partition of `domain`, run on a pool built from
    /// `pool` when the step starts.
    pub fn partitioned(
        template: StepTemplate<I, O>,
        partitioner: Partitioner,
        domain: KeyDomain,
        count: usize,
        pool: PoolProfile,
    ) -> Self {
        Self {
            template,
            execution: Execution::Partitioned {
                partitioner,
                domain,
                count,
                pool,
            },
        }
    }

    pub fn template(&self) -> &StepTemplate<I, O> {
        &self.template
    }

    pub fn is_partitioned(&self) -> bool {
        matches!(self.execution, Execution::Partitioned { .. })
    }

    fn execute_plain(&self, started_at: DateTime<Utc>) -> StepReport {
        let name = self.template.name();
        let executor = match self.template.executor_for(None) {
            Ok(executor) => executor,
            Err(err) => {
                error!(step = %name, error = %err, "source unavailable");
                return StepReport::failed_before_start(
                    name,
                    started_at,
                    StepFailure::new(AbortReason::SourceUnavailable, err.to_string()),
                );
            }
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| executor.run())) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(step = %name, %message, "step panicked");
                return StepReport::failed_before_start(
                    name,
                    started_at,
                    StepFailure::new(AbortReason::WorkerPanicked, message),
                );
            }
        };
        StepReport {
            step: name.to_string(),
            state: outcome.state,
            started_at,
            finished_at: Utc::now(),
            snapshot: outcome.snapshot(),
            partitions: Vec::new(),
            failures: outcome.failure.into_iter().collect(),
            pool: None,
        }
    }

    fn execute_partitioned(
        &self,
        started_at: DateTime<Utc>,
        partitioner: &Partitioner,
        domain: KeyDomain,
        count: usize,
        profile: &PoolProfile,
    ) -> StepReport {
        let name = self.template.name();

        let partitions = match partitioner.plan(domain, count) {
            Ok(partitions) => partitions,
            Err(err) => {
                error!(step = %name, error = %err, "partition plan rejected");
                return StepReport::failed_before_start(
                    name,
                    started_at,
                    StepFailure::new(AbortReason::InvalidPartitionPlan, err.to_string()),
                );
            }
        };

        let pool = match WorkerPool::new(profile.clone()) {
            Ok(pool) => pool,
            Err(err) => {
                error!(step = %name, error = %err, "worker pool unavailable");
                return StepReport::failed_before_start(
                    name,
                    started_at,
                    StepFailure::new(AbortReason::PoolUnavailable, err.to_string()),
                );
            }
        };

        let outcome = PartitionCoordinator::new(pool).run(partitions, &self.template);
        StepReport {
            step: name.to_string(),
            state: outcome.state,
            started_at,
            finished_at: Utc::now(),
            snapshot: MetricsSnapshot::new(name, outcome.metrics, outcome.elapsed),
            partitions: outcome.partitions,
            failures: outcome.failures,
            pool: Some(outcome.pool),
        }
    }
}

impl<I, O> RunnableStep for Step<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &str {
        self.template.name()
    }

    fn execute(&self) -> StepReport {
        let started_at = Utc::now();
        match &self.execution {
            Execution::Plain => self.execute_plain(started_at),
            Execution::Partitioned {
                partitioner,
                domain,
                count,
                pool,
            } => self.execute_partitioned(started_at, partitioner, *domain, *count, pool),
        }
    }
}

/// Overall outcome of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    /// Nothing aborted, but at least one item was skipped.
    CompletedWithOmissions,
    Failed,
}

impl JobStatus {
    pub fn from_steps(steps: &[StepReport]) -> Self {
        if steps.iter().any(StepReport::is_failed) {
            JobStatus::Failed
        } else if steps.iter().any(StepReport::has_omissions) {
            JobStatus::CompletedWithOmissions
        } else {
            JobStatus::Completed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub run_id: RunId,
    pub job: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Reports of the steps that ran, in order. Steps after a failed one are
    /// absent.
    pub steps: Vec<StepReport>,
}

impl JobReport {
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step == name)
    }
}

/// Ordered list of steps, run once each.
pub struct Job {
    name: String,
    steps: Vec<Box<dyn RunnableStep>>,
    listeners: Vec<Arc<dyn StepListener>>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: impl RunnableStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn StepListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order, stopping after the first failed one.
    pub fn run(&self) -> JobReport {
        let run_id = RunId::new();
        let started_at = Utc::now();
        info!(job = %self.name, %run_id, steps = self.steps.len(), "job started");

        let mut reports = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            for listener in &self.listeners {
                listener.on_step_start(step.name());
            }

            let report = step.execute();

            for listener in &self.listeners {
                listener.on_step_end(&report);
            }

            let failed = report.is_failed();
            reports.push(report);
            if failed {
                error!(job = %self.name, %run_id, step = %step.name(), "step failed, stopping job");
                break;
            }
        }

        let report = JobReport {
            run_id,
            job: self.name.clone(),
            status: JobStatus::from_steps(&reports),
            started_at,
            finished_at: Utc::now(),
            steps: reports,
        };

        for listener in &self.listeners {
            listener.on_job_end(&report);
        }
        report
    }
}
