//! Nightly ledger batch: demo data, job assembly and configuration loading.

pub mod nightly;
pub mod seed;
pub mod settings;

pub use nightly::{BuildError, build_job, default_config};
pub use seed::DemoLedger;
pub use settings::Settings;
