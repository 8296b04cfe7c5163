//! Ledger records and the transforms the nightly job runs over them.
//!
//! Pure domain logic only: no IO, no threads, no persistence concerns. Every
//! transform owns its state, so each partition gets an independent instance.

pub mod account;
pub mod anomaly;
pub mod statement;
pub mod transaction;

pub use account::{
    Account, AccountAnomaly, AccountAnomalyKind, AccountKind, AccountValidator, DuplicateAccountDetector,
    InterestAccrual, InterestAccrued,
};
pub use anomaly::{AnomalyDetector, AnomalyKind, Severity, TransactionAnomaly};
pub use statement::{AnnualEntry, AnnualStatement, MovementKind, StatementAggregator};
pub use transaction::{
    RawTransaction, Transaction, TransactionKind, TransactionParser, TransactionValidator, parse_date,
};
