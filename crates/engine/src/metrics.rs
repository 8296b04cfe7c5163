//! Run metrics.

use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::fault::FailureSite;

/// Counters for one executor, or summed across a step's partitions.
///
/// Every field only ever grows during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Items successfully pulled from the source.
    pub read: u64,
    /// Items the transform accepted (including filtered ones).
    pub processed: u64,
    /// Items the transform turned into zero outputs.
    pub filtered: u64,
    /// Outputs committed to the sink.
    pub written: u64,
    /// Items dropped by a skip decision, all sites.
    pub skipped: u64,
    pub read_skipped: u64,
    pub process_skipped: u64,
    pub write_skipped: u64,
    /// Chunks rolled back (failed write attempts and aborted chunks).
    pub rolled_back: u64,
    /// Successful sink writes.
    pub commits: u64,
    pub retries: u64,
}

impl AddAssign for StepMetrics {
    fn add_assign(&mut self, rhs: Self) {
        self.read += rhs.read;
        self.processed += rhs.processed;
        self.filtered += rhs.filtered;
        self.written += rhs.written;
        self.skipped += rhs.skipped;
        self.read_skipped += rhs.read_skipped;
        self.process_skipped += rhs.process_skipped;
        self.write_skipped += rhs.write_skipped;
        self.rolled_back += rhs.rolled_back;
        self.commits += rhs.commits;
        self.retries += rhs.retries;
    }
}

impl Add for StepMetrics {
    type Output = StepMetrics;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl Sum for StepMetrics {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(StepMetrics::default(), Add::add)
    }
}

impl<'a> Sum<&'a StepMetrics> for StepMetrics {
    fn sum<I: Iterator<Item = &'a StepMetrics>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// Passive accumulator owned by one executor.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    metrics: StepMetrics,
    started: Option<Instant>,
    elapsed: Option<Duration>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.started = Some(Instant::now());
        self.elapsed = None;
    }

    pub fn stop(&mut self) {
        if let Some(started) = self.started {
            self.elapsed = Some(started.elapsed());
        }
    }

    /// Wall-clock time since `start`, frozen at `stop`.
    pub fn elapsed(&self) -> Duration {
        match (self.elapsed, self.started) {
            (Some(elapsed), _) => elapsed,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        }
    }

    pub fn metrics(&self) -> StepMetrics {
        self.metrics
    }

    pub fn record_read(&mut self) {
        self.metrics.read += 1;
    }

    /// `outputs` is the number of items the transform produced for one input.
    pub fn record_processed(&mut self, outputs: usize) {
        self.metrics.processed += 1;
        if outputs == 0 {
            self.metrics.filtered += 1;
        }
    }

    pub fn record_commit(&mut self, written: usize) {
        self.metrics.commits += 1;
        self.metrics.written += written as u64;
    }

    pub fn record_skip(&mut self, site: FailureSite, items: u64) {
        self.metrics.skipped += items;
        match site {
            FailureSite::Read => self.metrics.read_skipped += items,
            FailureSite::Process => self.metrics.process_skipped += items,
            FailureSite::Write => self.metrics.write_skipped += items,
        }
    }

    pub fn record_rollback(&mut self) {
        self.metrics.rolled_back += 1;
    }

    pub fn record_retry(&mut self) {
        self.metrics.retries += 1;
    }

    pub fn snapshot(&self, step: impl Into<String>) -> MetricsSnapshot {
        MetricsSnapshot::new(step, self.metrics, self.elapsed())
    }
}

/// Metrics plus derived rates, as handed to listeners and reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub step: String,
    pub metrics: StepMetrics,
    pub elapsed_ms: u64,
    /// Written items per second; 0 when no time elapsed.
    pub throughput_per_sec: f64,
    /// Skipped items over items attempted (read + failed reads).
    pub skip_ratio: f64,
    /// Rolled back chunks over chunks attempted.
    pub rollback_ratio: f64,
    /// Written over read; 1.0 when nothing was read.
    pub success_ratio: f64,
}

impl MetricsSnapshot {
    pub fn new(step: impl Into<String>, metrics: StepMetrics, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let throughput_per_sec = if secs > 0.0 {
            metrics.written as f64 / secs
        } else {
            0.0
        };

        Self {
            step: step.into(),
            metrics,
            elapsed_ms: elapsed.as_millis() as u64,
            throughput_per_sec,
            skip_ratio: ratio(metrics.skipped, metrics.read + metrics.read_skipped, 0.0),
            rollback_ratio: ratio(metrics.rolled_back, metrics.commits + metrics.rolled_back, 0.0),
            success_ratio: ratio(metrics.written, metrics.read, 1.0),
        }
    }
}

fn ratio(numerator: u64, denominator: u64, empty: f64) -> f64 {
    if denominator == 0 {
        empty
    } else {
        numerator as f64 / denominator as f64
    }
}
