//! Named pool profiles and a bounded OS-thread worker pool.
//!
//! Core workers start eagerly and pull tasks from a bounded queue. When the
//! queue is full the pool grows up to `max_size`; beyond that the submitting
//! thread runs the task itself.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Sizing of one named pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolProfile {
    pub name: String,
    pub core_size: usize,
    pub max_size: usize,
    pub queue_capacity: usize,
}

impl PoolProfile {
    pub fn new(name: impl Into<String>, core_size: usize, max_size: usize, queue_capacity: usize) -> Self {
        Self {
            name: name.into(),
            core_size,
            max_size,
            queue_capacity,
        }
    }

    /// General batch work.
    pub fn bank_batch() -> Self {
        Self::new("bank-batch", 3, 5, 50)
    }

    pub fn transactions() -> Self {
        Self::new("transactions", 3, 3, 30)
    }

    pub fn accounts() -> Self {
        Self::new("accounts", 3, 4, 40)
    }

    pub fn anomalies() -> Self {
        Self::new("anomalies", 3, 6, 60)
    }

    pub fn defaults() -> Vec<Self> {
        vec![
            Self::bank_batch(),
            Self::transactions(),
            Self::accounts(),
            Self::anomalies(),
        ]
    }

    pub fn with_core_size(mut self, core_size: usize) -> Self {
        self.core_size = core_size;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        let invalid = |reason: &str| PoolError::InvalidProfile {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }
        if self.core_size == 0 {
            return Err(invalid("core_size must be at least 1"));
        }
        if self.max_size < self.core_size {
            return Err(invalid("max_size is below core_size"));
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("invalid pool profile '{name}': {reason}")]
    InvalidProfile { name: String, reason: String },

    #[error("unknown pool profile: {0}")]
    UnknownProfile(String),

    #[error("failed to spawn worker for pool '{name}': {reason}")]
    Spawn { name: String, reason: String },

    #[error("pool is shut down")]
    ShutDown,
}

/// Builds pools from named profiles. One factory per process, one pool per
/// partitioned step.
#[derive(Debug, Clone, Default)]
pub struct PoolFactory {
    profiles: BTreeMap<String, PoolProfile>,
}

impl PoolFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory preloaded with the built-in profiles.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        for profile in PoolProfile::defaults() {
            factory.profiles.insert(profile.name.clone(), profile);
        }
        factory
    }

    /// Add or replace a profile.
    pub fn register(&mut self, profile: PoolProfile) -> Result<(), PoolError> {
        profile.validate()?;
        self.profiles.insert(profile.name.clone(), profile);
        Ok(())
    }

    pub fn profile(&self, name: &str) -> Result<&PoolProfile, PoolError> {
        self.profiles
            .get(name)
            .ok_or_else(|| PoolError::UnknownProfile(name.to_string()))
    }

    pub fn profiles(&self) -> impl Iterator<Item = &PoolProfile> {
        self.profiles.values()
    }

    pub fn build(&self, name: &str) -> Result<WorkerPool, PoolError> {
        WorkerPool::new(self.profile(name)?.clone())
    }
}

/// Counters reported when a pool shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub workers_spawned: usize,
    pub tasks_submitted: u64,
    /// Tasks the submitting thread ran itself because the pool was saturated.
    pub caller_runs: u64,
}

/// Bounded worker pool.
pub struct WorkerPool {
    profile: PoolProfile,
    sender: Option<SyncSender<Task>>,
    receiver: Arc<Mutex<Receiver<Task>>>,
    workers: Vec<JoinHandle<()>>,
    stats: PoolStats,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("profile", &self.profile)
            .field("workers", &self.workers.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Validate the profile and start `core_size` workers.
    pub fn new(profile: PoolProfile) -> Result<Self, PoolError> {
        profile.validate()?;

        let (sender, receiver) = mpsc::sync_channel::<Task>(profile.queue_capacity);
        let mut pool = Self {
            profile,
            sender: Some(sender),
            receiver: Arc::new(Mutex::new(receiver)),
            workers: Vec::new(),
            stats: PoolStats::default(),
        };

        for _ in 0..pool.profile.core_size {
            pool.spawn_worker(None)?;
        }

        info!(
            pool = %pool.profile.name,
            core_size = pool.profile.core_size,
            max_size = pool.profile.max_size,
            queue_capacity = pool.profile.queue_capacity,
            "worker pool started"
        );
        Ok(pool)
    }

    pub fn profile(&self) -> &PoolProfile {
        &self.profile
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Queue `task`, growing the pool or running it inline when saturated.
    pub fn submit<F>(&mut self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(PoolError::ShutDown)?;
        self.stats.tasks_submitted += 1;

        match sender.try_send(Box::new(task)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => {
                if self.workers.len() < self.profile.max_size {
                    debug!(pool = %self.profile.name, workers = self.workers.len() + 1, "queue full, growing pool");
                    self.spawn_worker(Some(task))
                } else {
                    self.stats.caller_runs += 1;
                    debug!(pool = %self.profile.name, "pool saturated, running task on caller");
                    run_task(&self.profile.name, task);
                    Ok(())
                }
            }
            Err(TrySendError::Disconnected(_)) => Err(PoolError::ShutDown),
        }
    }

    /// Stop accepting tasks, let queued tasks drain and join every worker.
    pub fn shutdown(&mut self) -> PoolStats {
        if self.sender.take().is_none() {
            return self.stats;
        }

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!(pool = %self.profile.name, "worker thread terminated abnormally");
            }
        }

        info!(
            pool = %self.profile.name,
            workers_spawned = self.stats.workers_spawned,
            tasks_submitted = self.stats.tasks_submitted,
            caller_runs = self.stats.caller_runs,
            "worker pool stopped"
        );
        self.stats
    }

    fn spawn_worker(&mut self, first: Option<Task>) -> Result<(), PoolError> {
        let name = format!("{}-{}", self.profile.name, self.stats.workers_spawned);
        let pool_name = self.profile.name.clone();
        let receiver = self.receiver.clone();

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(&pool_name, first, receiver))
            .map_err(|e| PoolError::Spawn {
                name: self.profile.name.clone(),
                reason: e.to_string(),
            })?;

        self.workers.push(handle);
        self.stats.workers_spawned += 1;
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(pool: &str, first: Option<Task>, receiver: Arc<Mutex<Receiver<Task>>>) {
    if let Some(task) = first {
        run_task(pool, task);
    }

    loop {
        // Hold the lock only while waiting for the next task.
        let next = {
            let guard = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            guard.recv()
        };
        match next {
            Ok(task) => run_task(pool, task),
            // Sender dropped and queue drained.
            Err(_) => break,
        }
    }
}

fn run_task(pool: &str, task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        warn!(pool = %pool, "pool task panicked");
    }
}
