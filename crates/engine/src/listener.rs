//! Step observers.
//!
//! Listeners are notified synchronously on the job thread. They observe only;
//! nothing they do changes how the job proceeds.

use std::sync::Mutex;

use tracing::{info, warn};

use crate::executor::StepState;
use crate::job::{JobReport, StepReport};

/// Hook invoked around every step of a job.
pub trait StepListener: Send + Sync {
    fn on_step_start(&self, step: &str);

    fn on_step_end(&self, report: &StepReport);

    fn on_job_end(&self, _report: &JobReport) {}
}

/// Logs step boundaries through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl StepListener for TracingListener {
    fn on_step_start(&self, step: &str) {
        info!(step = %step, "step started");
    }

    fn on_step_end(&self, report: &StepReport) {
        let snap = &report.snapshot;
        match report.state {
            StepState::Completed if report.has_omissions() => warn!(
                step = %report.step,
                read = snap.metrics.read,
                written = snap.metrics.written,
                skipped = snap.metrics.skipped,
                skip_ratio = snap.skip_ratio,
                "step completed with omissions"
            ),
            StepState::Completed => info!(
                step = %report.step,
                read = snap.metrics.read,
                written = snap.metrics.written,
                elapsed_ms = snap.elapsed_ms,
                throughput_per_sec = snap.throughput_per_sec,
                "step completed"
            ),
            _ => warn!(
                step = %report.step,
                state = ?report.state,
                failures = report.failures.len(),
                written = snap.metrics.written,
                rolled_back = snap.metrics.rolled_back,
                "step failed"
            ),
        }
    }

    fn on_job_end(&self, report: &JobReport) {
        info!(
            job = %report.job,
            run_id = %report.run_id,
            status = ?report.status,
            steps = report.steps.len(),
            "job finished"
        );
    }
}

/// What a [`RecordingListener`] saw.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    StepStarted(String),
    StepEnded(StepReport),
    JobEnded(JobReport),
}

/// Keeps every notification in memory (tests, embedding).
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn push(&self, event: ListenerEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event);
    }
}

impl StepListener for RecordingListener {
    fn on_step_start(&self, step: &str) {
        self.push(ListenerEvent::StepStarted(step.to_string()));
    }

    fn on_step_end(&self, report: &StepReport) {
        self.push(ListenerEvent::StepEnded(report.clone()));
    }

    fn on_job_end(&self, report: &JobReport) {
        self.push(ListenerEvent::JobEnded(report.clone()));
    }
}
