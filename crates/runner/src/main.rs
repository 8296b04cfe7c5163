use std::process::ExitCode;

use anyhow::Context;
use tracing::{error, info};

use ledgerbatch_engine::JobStatus;
use ledgerbatch_runner::{DemoLedger, Settings, build_job};

fn main() -> ExitCode {
    ledgerbatch_observability::init();

    match run() {
        Ok(JobStatus::Failed) => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "nightly batch could not start");
            ExitCode::from(2)
        }
    }
}

fn run() -> anyhow::Result<JobStatus> {
    let settings = Settings::from_env()?;
    let config = settings.load_config()?;

    let ledger = DemoLedger::seed(settings.seed_records, settings.statement_year).context("seeding demo ledger")?;
    let job = build_job(&config, &ledger, settings.today).context("assembling nightly job")?;

    info!(job = %job.name(), steps = ?job.step_names(), "starting");
    let report = job.run();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report.status)
}
