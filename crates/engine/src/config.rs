//! Configuration surface.
//!
//! Everything is plain serde data with defaults, loaded from JSON:
//!
//! ```json
//! {
//!   "pools": [{ "name": "nightly", "core_size": 2, "max_size": 4, "queue_capacity": 16 }],
//!   "steps": {
//!     "transactions": { "chunk_size": 10, "partition_count": 4, "fault": "lenient" },
//!     "interest-accrual": { "fault": "strict", "skip_limit": 0 }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ledgerbatch_core::FailureCategory;

use crate::fault::FaultPolicy;
use crate::partition::Partitioner;
use crate::pool::{PoolError, PoolFactory, PoolProfile};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config field '{field}': {reason}")]
    Invalid { field: String, reason: String },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Fault policy preset a step starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPreset {
    #[default]
    Lenient,
    Strict,
}

impl FaultPreset {
    pub fn policy(&self) -> FaultPolicy {
        match self {
            FaultPreset::Lenient => FaultPolicy::lenient(),
            FaultPreset::Strict => FaultPolicy::strict(),
        }
    }
}

/// Per-step settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    pub chunk_size: usize,
    /// Present means the step is partitioned.
    pub partition_count: Option<usize>,
    /// Fixed range width; balanced ranges when absent.
    pub partition_range_width: Option<u64>,
    /// Pool profile name.
    pub pool: Option<String>,
    pub pool_core_size: Option<usize>,
    pub pool_max_size: Option<usize>,
    pub pool_queue_capacity: Option<usize>,
    pub fault: FaultPreset,
    /// Read/process retry budgets replacing the preset's.
    pub retry_limits_by_category: BTreeMap<FailureCategory, u32>,
    pub skip_limit: Option<u64>,
    pub never_skip_categories: Option<BTreeSet<FailureCategory>>,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5,
            partition_count: None,
            partition_range_width: None,
            pool: None,
            pool_core_size: None,
            pool_max_size: None,
            pool_queue_capacity: None,
            fault: FaultPreset::Lenient,
            retry_limits_by_category: BTreeMap::new(),
            skip_limit: None,
            never_skip_categories: None,
        }
    }
}

impl StepConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_partitions(mut self, count: usize) -> Self {
        self.partition_count = Some(count);
        self
    }

    pub fn with_range_width(mut self, width: u64) -> Self {
        self.partition_range_width = Some(width);
        self
    }

    pub fn with_pool(mut self, name: impl Into<String>) -> Self {
        self.pool = Some(name.into());
        self
    }

    pub fn with_fault(mut self, preset: FaultPreset) -> Self {
        self.fault = preset;
        self
    }

    pub fn with_skip_limit(mut self, skip_limit: u64) -> Self {
        self.skip_limit = Some(skip_limit);
        self
    }

    pub fn is_partitioned(&self) -> bool {
        self.partition_count.is_some()
    }

    /// The preset with every configured override applied.
    pub fn fault_policy(&self) -> FaultPolicy {
        let mut policy = self.fault.policy();
        for (&category, &attempts) in &self.retry_limits_by_category {
            policy = policy.with_item_retries(category, attempts);
        }
        if let Some(limit) = self.skip_limit {
            policy = policy.with_skip_limit(limit);
        }
        if let Some(categories) = &self.never_skip_categories {
            policy = policy.with_never_skip(categories.iter().copied());
        }
        policy
    }

    pub fn partitioner(&self) -> Partitioner {
        match self.partition_range_width {
            Some(width) => Partitioner::fixed_width(width),
            None => Partitioner::balanced(),
        }
    }

    /// Named profile (or `default_pool`) with the size overrides applied.
    pub fn pool_profile(&self, factory: &PoolFactory, default_pool: &str) -> Result<PoolProfile, ConfigError> {
        let name = self.pool.as_deref().unwrap_or(default_pool);
        let mut profile = factory.profile(name)?.clone();
        if let Some(core) = self.pool_core_size {
            profile.core_size = core;
        }
        if let Some(max) = self.pool_max_size {
            profile.max_size = max;
        }
        if let Some(queue) = self.pool_queue_capacity {
            profile.queue_capacity = queue;
        }
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self, step: &str) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::invalid(format!("steps.{step}.chunk_size"), "must be at least 1"));
        }
        if self.partition_count == Some(0) {
            return Err(ConfigError::invalid(format!("steps.{step}.partition_count"), "must be at least 1"));
        }
        if self.partition_range_width == Some(0) {
            return Err(ConfigError::invalid(
                format!("steps.{step}.partition_range_width"),
                "must be at least 1",
            ));
        }
        if self.pool_core_size == Some(0) {
            return Err(ConfigError::invalid(format!("steps.{step}.pool_core_size"), "must be at least 1"));
        }
        if let (Some(core), Some(max)) = (self.pool_core_size, self.pool_max_size) {
            if max < core {
                return Err(ConfigError::invalid(
                    format!("steps.{step}.pool_max_size"),
                    "must not be below pool_core_size",
                ));
            }
        }
        Ok(())
    }
}

/// Whole configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Extra or replacement pool profiles, on top of the built-in ones.
    pub pools: Vec<PoolProfile>,
    pub steps: BTreeMap<String, StepConfig>,
}

impl BatchConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn with_step(mut self, name: impl Into<String>, step: StepConfig) -> Self {
        self.steps.insert(name.into(), step);
        self
    }

    pub fn with_pool(mut self, profile: PoolProfile) -> Self {
        self.pools.push(profile);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for profile in &self.pools {
            profile.validate()?;
        }
        for (name, step) in &self.steps {
            step.validate(name)?;
        }
        Ok(())
    }

    /// Settings for `name`, or the defaults when the step is not configured.
    pub fn step(&self, name: &str) -> StepConfig {
        self.steps.get(name).cloned().unwrap_or_default()
    }

    pub fn pool_factory(&self) -> Result<PoolFactory, ConfigError> {
        let mut factory = PoolFactory::with_defaults();
        for profile in &self.pools {
            factory.register(profile.clone())?;
        }
        Ok(factory)
    }
}
