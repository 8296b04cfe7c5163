//! Integration tests for ledger steps over in-memory tables.
//!
//! Tests: Table → RangeSource → ledger Transform → TableSink / CollectingSink
//!
//! Verifies:
//! - Partitioned steps read every row exactly once
//! - Strict and lenient presets behave as configured on real ledger records
//! - Interrupted table writes are retried without losing rows

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;

    use ledgerbatch_core::Money;
    use ledgerbatch_engine::{
        AbortReason, BoxSource, BoxTransform, Chain, FaultPolicy, Job, JobStatus, Partition, Partitioner, PoolProfile,
        SharedSink, Step, StepState, StepTemplate,
    };
    use ledgerbatch_ledger::{
        Account, AccountValidator, AnnualEntry, AnnualStatement, InterestAccrual, InterestAccrued, RawTransaction,
        StatementAggregator, Transaction, TransactionParser, TransactionValidator,
    };

    use crate::sink::{CollectingSink, TableSink};
    use crate::source::{FlattenSource, RangeSource, key_domain};
    use crate::table::{InMemoryTable, Keyed, LedgerTable};

    fn accounts(n: u64) -> Arc<InMemoryTable<Account>> {
        Arc::new(InMemoryTable::from_rows((1..=n).map(|id| {
            Account::new(id, format!("Holder {}", char::from(b'A' + (id % 26) as u8)), Money::from_units(1_000), 30, "savings")
        })))
    }

    fn table_sink<V>(table: Arc<InMemoryTable<V>>) -> SharedSink<V>
    where
        V: Keyed + Clone + Send + Sync + 'static,
    {
        Arc::new(TableSink::new(table))
    }

    fn accrual_step(
        accounts: Arc<InMemoryTable<Account>>,
        out: Arc<InMemoryTable<InterestAccrued>>,
        policy: FaultPolicy,
        partitions: usize,
    ) -> Step<Account, InterestAccrued> {
        let domain = key_domain(&*accounts).unwrap().unwrap();
        let source: Arc<dyn LedgerTable<Account>> = accounts;
        let template = StepTemplate::new(
            "interest-accrual",
            move |p: Option<&Partition>| Ok(Box::new(RangeSource::new(source.clone(), p).with_page_size(7)) as BoxSource<Account>),
            || Box::new(Chain::new(AccountValidator, InterestAccrual)) as BoxTransform<Account, InterestAccrued>,
            table_sink(out),
        )
        .with_chunk_size(4)
        .with_policy(policy);
        Step::partitioned(template, Partitioner::balanced(), domain, partitions, PoolProfile::accounts())
    }

    #[test]
    fn partitioned_accrual_covers_every_account() {
        let out = Arc::new(InMemoryTable::new());
        let step = accrual_step(accounts(40), out.clone(), FaultPolicy::strict(), 4);

        let report = Job::new("nightly").with_step(step).run();

        assert_eq!(report.status, JobStatus::Completed);
        let step = &report.steps[0];
        assert_eq!(step.partitions.len(), 4);
        assert_eq!(step.metrics().read, 40);
        assert_eq!(step.metrics().written, 40);
        assert_eq!(out.len(), Ok(40));

        let row = out.get(17).unwrap().unwrap();
        assert_eq!(row.previous_balance, Money::from_units(1_000));
        assert_eq!(row.interest, Money::from_cents(1_875));
    }

    #[test]
    fn strict_accrual_aborts_past_its_skip_limit() {
        let table = accounts(40);
        let broken: Vec<(u64, Account)> = (1..=4)
            .map(|id| (id, Account::new(id, "X", Money::from_units(-1), 10, "savings")))
            .collect();
        table.upsert_all(broken).unwrap();

        let out = Arc::new(InMemoryTable::new());
        let report = Job::new("nightly")
            .with_step(accrual_step(table, out.clone(), FaultPolicy::strict(), 4))
            .run();

        assert_eq!(report.status, JobStatus::Failed);
        let step = &report.steps[0];
        assert_eq!(step.state, StepState::Failed);
        assert_eq!(step.failures.len(), 1);
        assert!(matches!(step.failures[0].reason, AbortReason::SkipLimitExceeded { limit: 3 }));

        // Sibling partitions still committed their accounts.
        assert_eq!(out.len(), Ok(30));
    }

    #[test]
    fn lenient_accrual_skips_invalid_accounts() {
        let table = accounts(20);
        table
            .upsert_all(vec![(5, Account::new(5, "", Money::ZERO, 40, "checking"))])
            .unwrap();

        let out = Arc::new(InMemoryTable::new());
        let report = Job::new("nightly")
            .with_step(accrual_step(table, out.clone(), FaultPolicy::lenient(), 2))
            .run();

        assert_eq!(report.status, JobStatus::CompletedWithOmissions);
        assert_eq!(report.steps[0].metrics().process_skipped, 1);
        assert_eq!(out.len(), Ok(19));
        assert_eq!(out.get(5), Ok(None));
    }

    #[test]
    fn interrupted_writes_are_retried() {
        let source: Arc<dyn LedgerTable<Account>> = accounts(12);
        let out = Arc::new(InMemoryTable::<InterestAccrued>::new());
        let template = StepTemplate::new(
            "interest-accrual",
            move |p: Option<&Partition>| Ok(Box::new(RangeSource::new(source.clone(), p)) as BoxSource<Account>),
            || Box::new(InterestAccrual) as BoxTransform<Account, InterestAccrued>,
            Arc::new(TableSink::new(out.clone()).with_transient_failures(2)) as SharedSink<InterestAccrued>,
        )
        .with_chunk_size(5);

        let report = Job::new("nightly").with_step(Step::plain(template)).run();

        assert_eq!(report.status, JobStatus::Completed);
        let metrics = report.steps[0].metrics();
        assert_eq!(metrics.written, 12);
        assert_eq!(metrics.rolled_back, 2);
        assert_eq!(out.len(), Ok(12));
    }

    #[test]
    fn statements_partitioned_by_account() {
        let entries = Arc::new(InMemoryTable::<Vec<AnnualEntry>>::new());
        let on = |m, d| NaiveDate::from_ymd_opt(2024, m, d);
        let rows = (1..=9u64)
            .map(|account| {
                let deposit = AnnualEntry::new(account, on(1, 3), "deposit", Money::from_units(100 * account as i64));
                let withdrawal = AnnualEntry::new(account, on(6, 9), "withdrawal", Money::from_units(-10));
                (account, vec![deposit, withdrawal])
            })
            .collect();
        entries.upsert_all(rows).unwrap();

        let domain = key_domain(&*entries).unwrap().unwrap();
        let statements = Arc::new(InMemoryTable::<AnnualStatement>::new());
        let source: Arc<dyn LedgerTable<Vec<AnnualEntry>>> = entries;
        let template = StepTemplate::new(
            "annual-statements",
            move |p: Option<&Partition>| {
                Ok(Box::new(FlattenSource::new(RangeSource::new(source.clone(), p))) as BoxSource<AnnualEntry>)
            },
            || Box::new(StatementAggregator::new(2024)) as BoxTransform<AnnualEntry, AnnualStatement>,
            table_sink(statements.clone()),
        );
        let step = Step::partitioned(template, Partitioner::balanced(), domain, 3, PoolProfile::bank_batch());

        let report = Job::new("year-end").with_step(step).run();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.steps[0].metrics().read, 18);
        assert_eq!(report.steps[0].metrics().filtered, 18);
        assert_eq!(statements.len(), Ok(9));

        let third = statements.get(3).unwrap().unwrap();
        assert_eq!(third.transactions, 2);
        assert_eq!(third.final_balance, Money::from_units(290));
        assert_eq!(third.interest_earned, Money::from_cents(290));
    }

    #[test]
    fn transactions_parse_validate_and_flag() {
        let raw = Arc::new(InMemoryTable::<RawTransaction>::new());
        raw.upsert_all(vec![
            (1, RawTransaction::new("101", "2024-03-01", "25.00", "credit")),
            (2, RawTransaction::new("102", "2024-03-01", "not money", "debit")),
            (3, RawTransaction::new("103", "", "99999.00", "CREDITO")),
            (4, RawTransaction::new("104", "2024-03-02", "-3.50", "DEBIT")),
        ])
        .unwrap();

        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let sink = Arc::new(CollectingSink::<Transaction>::new());
        let source: Arc<dyn LedgerTable<RawTransaction>> = raw;
        let template = StepTemplate::new(
            "transactions",
            move |p: Option<&Partition>| Ok(Box::new(RangeSource::new(source.clone(), p)) as BoxSource<RawTransaction>),
            move || {
                Box::new(Chain::new(TransactionParser, TransactionValidator::new(today)))
                    as BoxTransform<RawTransaction, Transaction>
            },
            sink.clone() as SharedSink<Transaction>,
        )
        .with_chunk_size(2);

        let report = Job::new("nightly").with_step(Step::plain(template)).run();

        assert_eq!(report.status, JobStatus::CompletedWithOmissions);
        assert_eq!(report.steps[0].metrics().process_skipped, 1);

        let written = sink.items();
        assert_eq!(written.iter().map(|t| t.id).collect::<Vec<_>>(), vec![101, 103, 104]);
        assert!(!written[0].is_anomalous());
        assert_eq!(written[1].date, Some(today));
        assert_eq!(written[1].anomalies.len(), 2);
        assert!(written[2].is_anomalous());
    }
}
