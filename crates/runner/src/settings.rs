//! Process settings read from the environment.

use std::path::PathBuf;

use anyhow::Context;
use chrono::{Datelike, NaiveDate, Utc};
use tracing::{info, warn};

use ledgerbatch_engine::BatchConfig;

use crate::nightly::default_config;
use crate::seed::DEFAULT_RECORDS;

pub const CONFIG_ENV: &str = "LEDGERBATCH_CONFIG";
pub const SEED_RECORDS_ENV: &str = "LEDGERBATCH_SEED_RECORDS";
pub const STATEMENT_YEAR_ENV: &str = "LEDGERBATCH_STATEMENT_YEAR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub config_path: Option<PathBuf>,
    pub seed_records: u64,
    pub statement_year: i32,
    pub today: NaiveDate,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Settings::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let today = Utc::now().date_naive();

        let seed_records = match lookup(SEED_RECORDS_ENV) {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("{SEED_RECORDS_ENV} must be a non-negative integer, got '{raw}'"))?,
            None => DEFAULT_RECORDS,
        };

        let statement_year = match lookup(STATEMENT_YEAR_ENV) {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("{STATEMENT_YEAR_ENV} must be a year, got '{raw}'"))?,
            None => today.year() - 1,
        };

        Ok(Self {
            config_path: lookup(CONFIG_ENV).filter(|p| !p.trim().is_empty()).map(PathBuf::from),
            seed_records,
            statement_year,
            today,
        })
    }

    /// The configured batch file, or the built-in defaults when none is set.
    pub fn load_config(&self) -> anyhow::Result<BatchConfig> {
        match &self.config_path {
            Some(path) => {
                let config = BatchConfig::from_path(path)
                    .with_context(|| format!("loading batch config from {}", path.display()))?;
                info!(path = %path.display(), steps = config.steps.len(), "batch config loaded");
                Ok(config)
            }
            None => {
                warn!("{CONFIG_ENV} not set; using built-in nightly defaults");
                Ok(default_config())
            }
        }
    }
}
