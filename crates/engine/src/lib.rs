//! Partitioned, chunk-oriented, fault-tolerant batch execution.
//!
//! ## Design
//!
//! - A `Job` is an ordered list of steps; it stops at the first step that aborts
//! - A step reads from a `Source`, applies a `Transform` and commits `Chunk`s to a `Sink`
//! - Every per-item failure goes through a `FaultPolicyEngine` (retry / skip / abort)
//! - Partitioned steps split a key domain with a `Partitioner` and run one
//!   `StepExecutor` per partition on a bounded `WorkerPool`
//! - `MetricsCollector` counts, `StepListener`s observe; neither steers execution
//!
//! ## Components
//!
//! - `chunk`: bounded commit buffer
//! - `stage`: Source / Transform / Sink contract and factories
//! - `fault`: failure sites, presets, decisions and per-run counters
//! - `executor`: the single-pipeline state machine
//! - `partition`: key domains and range planning
//! - `pool`: named pool profiles and the worker pool
//! - `coordinator`: fan-out of partitions and aggregation
//! - `metrics`, `listener`: observability surface
//! - `job`: steps, job runs and reports
//! - `config`: serde configuration surface

pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod executor;
pub mod fault;
pub mod job;
pub mod listener;
pub mod metrics;
pub mod partition;
pub mod pool;
pub mod stage;

#[cfg(test)]
mod integration_tests;

pub use chunk::Chunk;
pub use config::{BatchConfig, ConfigError, FaultPreset, StepConfig};
pub use coordinator::{CoordinatorOutcome, PartitionCoordinator, PartitionReport};
pub use executor::{ExecutionOutcome, StepExecutor, StepFailure, StepState};
pub use fault::{
    AbortReason, Backoff, BackoffStrategy, FailureSite, FaultDecision, FaultPolicy,
    FaultPolicyEngine, FaultRules,
};
pub use job::{Job, JobReport, JobStatus, RunnableStep, Step, StepReport};
pub use listener::{ListenerEvent, RecordingListener, StepListener, TracingListener};
pub use metrics::{MetricsCollector, MetricsSnapshot, StepMetrics};
pub use partition::{KeyDomain, Partition, PartitionError, PartitionStrategy, Partitioner};
pub use pool::{PoolError, PoolFactory, PoolProfile, PoolStats, WorkerPool};
pub use stage::{
    BoxSource, BoxTransform, Chain, FnTransform, IterSource, SharedSink, Sink, Source, StepTemplate,
    Transform,
};
