//! The nightly ledger job, assembled from configuration.

use std::sync::Arc;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{info, warn};

use ledgerbatch_core::ItemResult;
use ledgerbatch_engine::{
    BatchConfig, BoxSource, BoxTransform, Chain, ConfigError, FaultPreset, Job, KeyDomain, Partition, PoolFactory,
    SharedSink, Step, StepConfig, StepListener, StepTemplate, TracingListener,
};
use ledgerbatch_infra::{FlattenSource, Keyed, LedgerTable, RangeSource, TableError, TableSink, key_domain};
use ledgerbatch_ledger::{
    Account, AccountAnomaly, AccountValidator, AnnualEntry, AnnualStatement, AnomalyDetector, DuplicateAccountDetector,
    InterestAccrual, InterestAccrued, RawTransaction, StatementAggregator, Transaction, TransactionAnomaly,
    TransactionParser, TransactionValidator,
};

use crate::seed::DemoLedger;

pub const JOB_NAME: &str = "nightly-ledger";

pub const TRANSACTIONS: &str = "transactions";
pub const INTEREST_ACCRUAL: &str = "interest-accrual";
pub const ANNUAL_STATEMENTS: &str = "annual-statements";
pub const ANOMALIES: &str = "anomalies";
pub const ACCOUNT_AUDIT: &str = "account-audit";

/// Configuration used when no file is given.
pub fn default_config() -> BatchConfig {
    BatchConfig::default()
        .with_step(
            TRANSACTIONS,
            StepConfig::default()
                .with_chunk_size(10)
                .with_partitions(4)
                .with_pool("transactions")
                .with_fault(FaultPreset::Lenient),
        )
        .with_step(
            INTEREST_ACCRUAL,
            StepConfig::default()
                .with_chunk_size(10)
                .with_partitions(4)
                .with_pool("accounts")
                .with_fault(FaultPreset::Strict),
        )
        .with_step(
            ANNUAL_STATEMENTS,
            StepConfig::default()
                .with_chunk_size(10)
                .with_partitions(3)
                .with_pool("bank-batch"),
        )
        .with_step(
            ANOMALIES,
            StepConfig::default()
                .with_chunk_size(20)
                .with_partitions(4)
                .with_pool("anomalies")
                .with_fault(FaultPreset::Lenient),
        )
        .with_step(ACCOUNT_AUDIT, StepConfig::default().with_chunk_size(20))
}

/// Why the nightly job could not be assembled.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot plan partitions over {table}: {source}")]
    Table {
        table: &'static str,
        #[source]
        source: TableError,
    },
}

/// Builds steps from their configuration and the pool factory.
struct StepBuilder<'a> {
    config: &'a BatchConfig,
    pools: PoolFactory,
}

impl<'a> StepBuilder<'a> {
    fn new(config: &'a BatchConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            config,
            pools: config.pool_factory()?,
        })
    }

    /// Partitioned when configured and `domain` is known, plain otherwise.
    fn build<I, O>(
        &self,
        template: StepTemplate<I, O>,
        default_pool: &str,
        domain: Option<KeyDomain>,
    ) -> Result<Step<I, O>, ConfigError>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let name = template.name().to_string();
        let step_config = self.config.step(&name);
        let template = template
            .with_chunk_size(step_config.chunk_size)
            .with_policy(step_config.fault_policy());

        let Some(count) = step_config.partition_count else {
            info!(step = %name, chunk_size = step_config.chunk_size, "plain step");
            return Ok(Step::plain(template));
        };
        let Some(domain) = domain else {
            warn!(step = %name, "no keys to partition; running as a plain step");
            return Ok(Step::plain(template));
        };

        let pool = step_config.pool_profile(&self.pools, default_pool)?;
        info!(
            step = %name,
            partitions = count,
            pool = %pool.name,
            chunk_size = step_config.chunk_size,
            "partitioned step"
        );
        Ok(Step::partitioned(template, step_config.partitioner(), domain, count, pool))
    }
}

fn range_source<V>(table: Arc<dyn LedgerTable<V>>) -> impl Fn(Option<&Partition>) -> ItemResult<BoxSource<V>> + Send + Sync
where
    V: Send + 'static,
{
    move |partition: Option<&Partition>| Ok(Box::new(RangeSource::new(table.clone(), partition)) as BoxSource<V>)
}

/// Key range to partition `table` over; `None` when it is empty.
fn domain_of<V>(name: &'static str, table: &dyn LedgerTable<V>) -> Result<Option<KeyDomain>, BuildError> {
    key_domain(table).map_err(|source| BuildError::Table { table: name, source })
}

fn table_sink<V>(table: Arc<dyn LedgerTable<V>>) -> SharedSink<V>
where
    V: Keyed + Clone + Send + Sync + 'static,
{
    Arc::new(TableSink::new(table))
}

/// Assemble the nightly job over `ledger`.
///
/// `today` bounds transaction dates; statements cover `ledger.year`.
pub fn build_job(config: &BatchConfig, ledger: &DemoLedger, today: NaiveDate) -> Result<Job, BuildError> {
    config.validate()?;
    let steps = StepBuilder::new(config)?;

    let transactions = StepTemplate::new(
        TRANSACTIONS,
        range_source::<RawTransaction>(ledger.raw_transactions.clone()),
        move || {
            Box::new(Chain::new(TransactionParser, TransactionValidator::new(today)))
                as BoxTransform<RawTransaction, Transaction>
        },
        table_sink::<Transaction>(ledger.transactions.clone()),
    );
    let raw_rows = domain_of::<RawTransaction>("raw transactions", &*ledger.raw_transactions)?;

    let accrual = StepTemplate::new(
        INTEREST_ACCRUAL,
        range_source::<Account>(ledger.accounts.clone()),
        || Box::new(Chain::new(AccountValidator, InterestAccrual)) as BoxTransform<Account, InterestAccrued>,
        table_sink::<InterestAccrued>(ledger.accruals.clone()),
    );
    let account_ids = domain_of::<Account>("accounts", &*ledger.accounts)?;

    let entries: Arc<dyn LedgerTable<Vec<AnnualEntry>>> = ledger.entries.clone();
    let year = ledger.year;
    let statements = StepTemplate::new(
        ANNUAL_STATEMENTS,
        move |partition: Option<&Partition>| {
            Ok(Box::new(FlattenSource::new(RangeSource::new(entries.clone(), partition))) as BoxSource<AnnualEntry>)
        },
        move || Box::new(StatementAggregator::new(year)) as BoxTransform<AnnualEntry, AnnualStatement>,
        table_sink::<AnnualStatement>(ledger.statements.clone()),
    );
    let statement_accounts = domain_of::<Vec<AnnualEntry>>("annual entries", &*ledger.entries)?;

    let anomalies = StepTemplate::new(
        ANOMALIES,
        range_source::<Transaction>(ledger.transactions.clone()),
        || Box::new(AnomalyDetector) as BoxTransform<Transaction, TransactionAnomaly>,
        ledger.anomalies.clone() as SharedSink<TransactionAnomaly>,
    );

    let audit = StepTemplate::new(
        ACCOUNT_AUDIT,
        range_source::<Account>(ledger.accounts.clone()),
        || Box::new(DuplicateAccountDetector::new()) as BoxTransform<Account, AccountAnomaly>,
        ledger.account_anomalies.clone() as SharedSink<AccountAnomaly>,
    );

    let listener: Arc<dyn StepListener> = Arc::new(TracingListener);
    Ok(Job::new(JOB_NAME)
        .with_listener(listener)
        .with_step(steps.build(transactions, "transactions", raw_rows)?)
        .with_step(steps.build(accrual, "accounts", account_ids)?)
        .with_step(steps.build(statements, "bank-batch", statement_accounts)?)
        .with_step(steps.build(anomalies, "anomalies", ledger.transaction_ids())?)
        .with_step(steps.build(audit, "accounts", account_ids)?))
}
