//! Per-item failure model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used by sources, transforms and sinks.
pub type ItemResult<T> = Result<T, ItemError>;

/// Failure raised while reading, transforming or writing records.
///
/// Keep this focused on what went wrong with a record or a batch. How the
/// engine reacts (retry, skip, abort) is decided from the [`FailureCategory`]
/// returned by [`classify`], never from the variant directly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ItemError {
    /// Temporary I/O trouble (network blip, lock timeout, ...).
    #[error("transient i/o failure: {0}")]
    TransientIo(String),

    /// A record failed a business rule.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A raw field could not be decoded (malformed number, date, ...).
    #[error("parse failure: {0}")]
    Parse(String),

    /// Authorization or integrity violation. Always fatal.
    #[error("security violation: {0}")]
    Security(String),

    /// The underlying store rejected or lost the operation.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Anything else.
    #[error("unexpected failure: {0}")]
    Unknown(String),
}

impl ItemError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientIo(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn security(msg: impl Into<String>) -> Self {
        Self::Security(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    /// Shorthand for [`classify`].
    pub fn category(&self) -> FailureCategory {
        classify(self)
    }
}

/// Closed set of failure categories the fault policy is keyed by.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    TransientIo,
    Validation,
    Parse,
    Security,
    Storage,
    Unknown,
}

impl FailureCategory {
    pub const ALL: [FailureCategory; 6] = [
        FailureCategory::TransientIo,
        FailureCategory::Validation,
        FailureCategory::Parse,
        FailureCategory::Security,
        FailureCategory::Storage,
        FailureCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::TransientIo => "transient-io",
            FailureCategory::Validation => "validation",
            FailureCategory::Parse => "parse",
            FailureCategory::Security => "security",
            FailureCategory::Storage => "storage",
            FailureCategory::Unknown => "unknown",
        }
    }
}

impl core::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message fragments that mark an otherwise unclassified failure as transient.
const TRANSIENT_HINTS: [&str; 4] = ["timeout", "temporary", "retry", "connection"];

/// Map a failure to its category.
///
/// Pure and deterministic: the same error always yields the same category.
/// `Unknown` failures whose message hints at a temporary condition are
/// promoted to [`FailureCategory::TransientIo`].
pub fn classify(err: &ItemError) -> FailureCategory {
    match err {
        ItemError::TransientIo(_) => FailureCategory::TransientIo,
        ItemError::Validation(_) => FailureCategory::Validation,
        ItemError::Parse(_) => FailureCategory::Parse,
        ItemError::Security(_) => FailureCategory::Security,
        ItemError::Storage(_) => FailureCategory::Storage,
        ItemError::Unknown(msg) => {
            let msg = msg.to_ascii_lowercase();
            if TRANSIENT_HINTS.iter().any(|hint| msg.contains(hint)) {
                FailureCategory::TransientIo
            } else {
                FailureCategory::Unknown
            }
        }
    }
}
