//! Transaction anomaly detection.

use serde::{Deserialize, Serialize};
use tracing::warn;

use ledgerbatch_core::{ItemResult, Money};
use ledgerbatch_engine::Transform;

use crate::transaction::{DAILY_LIMIT, Transaction, TransactionKind};

/// Debits above this size are worth a second look.
pub const LARGE_DEBIT: Money = Money::from_units(10_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    NegativeAmount,
    ZeroAmount,
    ExcessiveAmount,
    LargeDebit,
    InvalidKind,
    MissingKind,
    MissingDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl AnomalyKind {
    pub fn severity(&self) -> Severity {
        match self {
            AnomalyKind::ExcessiveAmount => Severity::Critical,
            AnomalyKind::NegativeAmount | AnomalyKind::InvalidKind => Severity::High,
            AnomalyKind::LargeDebit | AnomalyKind::MissingKind | AnomalyKind::MissingDate => Severity::Medium,
            AnomalyKind::ZeroAmount => Severity::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAnomaly {
    pub transaction_id: u64,
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub detail: String,
}

/// Emits one record per anomaly found on a transaction (zero or more).
#[derive(Debug, Default, Clone, Copy)]
pub struct AnomalyDetector;

impl AnomalyDetector {
    pub fn detect(tx: &Transaction) -> Vec<TransactionAnomaly> {
        let mut found = Vec::new();
        let mut flag = |kind: AnomalyKind, detail: String| {
            found.push(TransactionAnomaly {
                transaction_id: tx.id,
                kind,
                severity: kind.severity(),
                detail,
            })
        };

        let amount = tx.amount_or_zero();
        if amount.is_negative() {
            flag(AnomalyKind::NegativeAmount, format!("amount {amount}"));
        } else if amount.is_zero() {
            flag(AnomalyKind::ZeroAmount, "amount is zero".to_string());
        }
        if amount.abs() > DAILY_LIMIT {
            flag(AnomalyKind::ExcessiveAmount, format!("amount {amount} above {DAILY_LIMIT}"));
        }
        if amount.is_negative() && amount.abs() > LARGE_DEBIT {
            flag(AnomalyKind::LargeDebit, format!("debit {amount} needs review"));
        }

        match &tx.kind {
            None => flag(AnomalyKind::MissingKind, "transaction kind missing".to_string()),
            Some(TransactionKind::Other(raw)) => flag(AnomalyKind::InvalidKind, format!("kind '{raw}'")),
            Some(_) => {}
        }

        if tx.date.is_none() {
            flag(AnomalyKind::MissingDate, "transaction date missing".to_string());
        }

        found
    }
}

impl Transform for AnomalyDetector {
    type Input = Transaction;
    type Output = TransactionAnomaly;

    fn transform(&mut self, tx: &Transaction) -> ItemResult<Vec<TransactionAnomaly>> {
        let found = Self::detect(tx);
        for anomaly in &found {
            warn!(
                transaction = tx.id,
                kind = ?anomaly.kind,
                severity = ?anomaly.severity,
                detail = %anomaly.detail,
                "transaction anomaly"
            );
        }
        Ok(found)
    }
}
