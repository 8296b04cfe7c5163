//! Fault policy: retry, skip or abort, decided per failure.
//!
//! [`FaultPolicy`] is immutable configuration shared by every executor of a
//! step. [`FaultPolicyEngine`] wraps it with the mutable counters of one
//! executor (one step, or one partition of a step) and is never shared.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use ledgerbatch_core::{FailureCategory, ItemError, classify};

/// Where in the pipeline a failure happened.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSite {
    Read,
    Process,
    Write,
}

impl core::fmt::Display for FailureSite {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            FailureSite::Read => "read",
            FailureSite::Process => "process",
            FailureSite::Write => "write",
        })
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Linear backoff: base * attempt
    Linear,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
}

/// Delay applied before each retry of the same item or chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::none()
    }
}

impl Backoff {
    /// Retry immediately.
    pub fn none() -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

/// Retry budgets and skippable categories for one failure site group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRules {
    /// Maximum retries per item (per chunk for writes), keyed by category.
    /// Missing categories get no retries.
    pub retry_limits: BTreeMap<FailureCategory, u32>,
    /// Categories that may be skipped once retries are exhausted.
    pub skippable: BTreeSet<FailureCategory>,
}

impl FaultRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retries(mut self, category: FailureCategory, attempts: u32) -> Self {
        self.retry_limits.insert(category, attempts);
        self
    }

    pub fn with_skippable(mut self, category: FailureCategory) -> Self {
        self.skippable.insert(category);
        self
    }

    pub fn retry_limit(&self, category: FailureCategory) -> u32 {
        self.retry_limits.get(&category).copied().unwrap_or(0)
    }

    pub fn is_skippable(&self, category: FailureCategory) -> bool {
        self.skippable.contains(&category)
    }
}

/// Why a step (or partition) stopped before its source was exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AbortReason {
    /// The category is on the never-skip list.
    NeverSkip { category: FailureCategory },
    /// Retries exhausted and the category may not be skipped here.
    NotSkippable { category: FailureCategory },
    /// Skipping would take the skip count above the limit.
    SkipLimitExceeded { limit: u64 },
    /// The source could not be opened.
    SourceUnavailable,
    /// The partition plan could not be built.
    InvalidPartitionPlan,
    /// The worker pool could not be built.
    PoolUnavailable,
    /// The executor panicked.
    WorkerPanicked,
    /// A partition never reported back.
    WorkerLost,
}

impl core::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AbortReason::NeverSkip { category } => write!(f, "{category} failures are never skipped"),
            AbortReason::NotSkippable { category } => {
                write!(f, "{category} failure is not skippable and retries are exhausted")
            }
            AbortReason::SkipLimitExceeded { limit } => write!(f, "skip limit exceeded ({limit})"),
            AbortReason::SourceUnavailable => f.write_str("source unavailable"),
            AbortReason::InvalidPartitionPlan => f.write_str("invalid partition plan"),
            AbortReason::PoolUnavailable => f.write_str("worker pool unavailable"),
            AbortReason::WorkerPanicked => f.write_str("worker panicked"),
            AbortReason::WorkerLost => f.write_str("worker lost"),
        }
    }
}

/// Outcome of one fault evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultDecision {
    /// Re-invoke the failed stage. `remaining_attempts` counts this retry.
    Retry { remaining_attempts: u32 },
    /// Drop the item (or the chunk, for writes) and continue.
    Skip,
    /// Stop the step.
    Abort(AbortReason),
}

/// Named, immutable fault configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPolicy {
    name: String,
    /// Rules for read and process failures.
    item: FaultRules,
    /// Rules for sink failures.
    write: FaultRules,
    skip_limit: u64,
    never_skip: BTreeSet<FailureCategory>,
    backoff: Backoff,
}

impl FaultPolicy {
    pub fn new(name: impl Into<String>, item: FaultRules, write: FaultRules, skip_limit: u64) -> Self {
        Self {
            name: name.into(),
            item,
            write,
            skip_limit,
            never_skip: BTreeSet::from([FailureCategory::Security]),
            backoff: Backoff::none(),
        }
    }

    /// Bulk record ingestion: generous retries, tolerant of malformed fields.
    pub fn lenient() -> Self {
        use FailureCategory::*;

        let item = FaultRules::new()
            .with_retries(TransientIo, 5)
            .with_retries(Storage, 5)
            .with_retries(Unknown, 3)
            .with_skippable(Validation)
            .with_skippable(Parse)
            .with_skippable(TransientIo);
        let write = FaultRules::new()
            .with_retries(TransientIo, 3)
            .with_retries(Storage, 3)
            .with_retries(Unknown, 1)
            .with_skippable(Validation);

        Self::new("lenient", item, write, 10)
            .with_backoff(Backoff::exponential(Duration::from_millis(5), Duration::from_millis(200)))
    }

    /// Monetary balances: few retries, near-zero skips, storage never skipped.
    pub fn strict() -> Self {
        use FailureCategory::*;

        let item = FaultRules::new()
            .with_retries(TransientIo, 3)
            .with_retries(Storage, 3)
            .with_retries(Unknown, 2)
            .with_skippable(Validation);
        let write = FaultRules::new()
            .with_retries(TransientIo, 2)
            .with_retries(Storage, 2);

        Self::new("strict", item, write, 3)
            .with_backoff(Backoff::exponential(Duration::from_millis(10), Duration::from_millis(500)))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_skip_limit(mut self, skip_limit: u64) -> Self {
        self.skip_limit = skip_limit;
        self
    }

    pub fn with_never_skip(mut self, categories: impl IntoIterator<Item = FailureCategory>) -> Self {
        self.never_skip = categories.into_iter().collect();
        self
    }

    /// Override the read/process retry budget of one category.
    pub fn with_item_retries(mut self, category: FailureCategory, attempts: u32) -> Self {
        self.item.retry_limits.insert(category, attempts);
        self
    }

    pub fn with_item_rules(mut self, rules: FaultRules) -> Self {
        self.item = rules;
        self
    }

    pub fn with_write_rules(mut self, rules: FaultRules) -> Self {
        self.write = rules;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn skip_limit(&self) -> u64 {
        self.skip_limit
    }

    pub fn never_skip(&self) -> &BTreeSet<FailureCategory> {
        &self.never_skip
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn rules(&self, site: FailureSite) -> &FaultRules {
        match site {
            FailureSite::Read | FailureSite::Process => &self.item,
            FailureSite::Write => &self.write,
        }
    }

    pub fn classify(&self, err: &ItemError) -> FailureCategory {
        classify(err)
    }

    /// Decide for a single item.
    ///
    /// `attempts` is the number of retries already spent on this item,
    /// `skips` the number of items skipped so far by this executor.
    pub fn decide(&self, site: FailureSite, category: FailureCategory, attempts: u32, skips: u64) -> FaultDecision {
        self.decide_weighted(site, category, attempts, skips, 1)
    }

    /// Like [`decide`](Self::decide), for a failure that would skip `weight`
    /// items at once (a whole chunk on write).
    pub fn decide_weighted(
        &self,
        site: FailureSite,
        category: FailureCategory,
        attempts: u32,
        skips: u64,
        weight: u64,
    ) -> FaultDecision {
        if self.never_skip.contains(&category) {
            return FaultDecision::Abort(AbortReason::NeverSkip { category });
        }

        let rules = self.rules(site);
        let limit = rules.retry_limit(category);
        if attempts < limit {
            return FaultDecision::Retry {
                remaining_attempts: limit - attempts,
            };
        }

        if !rules.is_skippable(category) {
            return FaultDecision::Abort(AbortReason::NotSkippable { category });
        }

        if skips.saturating_add(weight) > self.skip_limit {
            return FaultDecision::Abort(AbortReason::SkipLimitExceeded {
                limit: self.skip_limit,
            });
        }

        FaultDecision::Skip
    }
}

/// Fault counters of one executor.
#[derive(Debug)]
pub struct FaultPolicyEngine {
    policy: Arc<FaultPolicy>,
    skips: u64,
    retries: BTreeMap<FailureCategory, u64>,
}

impl FaultPolicyEngine {
    pub fn new(policy: Arc<FaultPolicy>) -> Self {
        Self {
            policy,
            skips: 0,
            retries: BTreeMap::new(),
        }
    }

    pub fn policy(&self) -> &FaultPolicy {
        &self.policy
    }

    /// Items skipped so far. Never decreases.
    pub fn skips(&self) -> u64 {
        self.skips
    }

    pub fn retries(&self, category: FailureCategory) -> u64 {
        self.retries.get(&category).copied().unwrap_or(0)
    }

    pub fn total_retries(&self) -> u64 {
        self.retries.values().sum()
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.policy.backoff.delay_for_attempt(attempt)
    }

    /// Evaluate a failure and update the counters.
    ///
    /// `weight` is the number of items a skip would drop (1 for reads and
    /// transforms, the chunk length for writes).
    pub fn on_failure(&mut self, site: FailureSite, err: &ItemError, attempts: u32, weight: u64) -> FaultDecision {
        let category = classify(err);
        let decision = self
            .policy
            .decide_weighted(site, category, attempts, self.skips, weight);

        match &decision {
            FaultDecision::Retry { remaining_attempts } => {
                *self.retries.entry(category).or_insert(0) += 1;
                debug!(
                    policy = %self.policy.name,
                    %site,
                    %category,
                    remaining_attempts,
                    error = %err,
                    "retrying"
                );
            }
            FaultDecision::Skip => {
                self.skips += weight;
                warn!(
                    policy = %self.policy.name,
                    %site,
                    %category,
                    skipped = weight,
                    skips = self.skips,
                    skip_limit = self.policy.skip_limit,
                    error = %err,
                    "skipping"
                );
            }
            FaultDecision::Abort(reason) => {
                error!(
                    policy = %self.policy.name,
                    %site,
                    %category,
                    %reason,
                    error = %err,
                    "aborting"
                );
            }
        }

        decision
    }
}
