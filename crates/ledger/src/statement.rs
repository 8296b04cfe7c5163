//! Annual account statements.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use ledgerbatch_core::{ItemError, ItemResult, Money, Rate};
use ledgerbatch_engine::Transform;

/// Interest credited on a positive year-end balance.
pub const ANNUAL_INTEREST: Rate = Rate::from_micros(10_000);

/// Kind of movement on an annual ledger line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Deposit,
    Withdrawal,
    Debit,
    Purchase,
    Transfer,
    Payment,
    Interest,
    Other(String),
}

impl MovementKind {
    pub fn normalize(raw: &str) -> Self {
        let upper = raw.trim().to_uppercase();
        match upper.as_str() {
            "DEPOSIT" | "DEPOSITS" | "DEPOSITO" | "DEPOSITOS" => MovementKind::Deposit,
            "WITHDRAWAL" | "WITHDRAW" | "RETIRO" | "RETIROS" => MovementKind::Withdrawal,
            "DEBIT" | "DEBITO" => MovementKind::Debit,
            "PURCHASE" | "COMPRA" => MovementKind::Purchase,
            "TRANSFER" | "TRANSFERS" | "TRANSFERENCIA" => MovementKind::Transfer,
            "PAYMENT" | "PAGO" | "PAGOS" => MovementKind::Payment,
            "INTEREST" | "INTERES" | "INTERESES" => MovementKind::Interest,
            _ => MovementKind::Other(upper),
        }
    }

    /// Movements whose negative amounts count as withdrawals.
    fn is_outflow(&self) -> bool {
        matches!(self, MovementKind::Withdrawal | MovementKind::Debit | MovementKind::Purchase)
    }
}

/// One line of an account's yearly ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnualEntry {
    pub account_id: u64,
    pub date: Option<NaiveDate>,
    pub movement: MovementKind,
    /// Signed: deposits positive, withdrawals negative.
    pub amount: Money,
    pub description: String,
}

impl AnnualEntry {
    pub fn new(account_id: u64, date: Option<NaiveDate>, movement: &str, amount: Money) -> Self {
        Self {
            account_id,
            date,
            movement: MovementKind::normalize(movement),
            amount,
            description: String::new(),
        }
    }
}

/// Year-end totals of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnualStatement {
    pub account_id: u64,
    pub year: i32,
    pub total_deposits: Money,
    pub total_withdrawals: Money,
    pub final_balance: Money,
    pub transactions: u64,
    pub interest_earned: Money,
}

impl AnnualStatement {
    fn empty(account_id: u64, year: i32) -> Self {
        Self {
            account_id,
            year,
            total_deposits: Money::ZERO,
            total_withdrawals: Money::ZERO,
            final_balance: Money::ZERO,
            transactions: 0,
            interest_earned: Money::ZERO,
        }
    }

    fn apply(&mut self, entry: &AnnualEntry) {
        match &entry.movement {
            MovementKind::Deposit if entry.amount.is_positive() => self.total_deposits += entry.amount,
            kind if kind.is_outflow() && entry.amount.is_negative() => self.total_withdrawals += entry.amount.abs(),
            _ => {}
        }
        self.transactions += 1;
        self.final_balance = self.total_deposits - self.total_withdrawals;
        self.interest_earned = if self.final_balance.is_positive() {
            self.final_balance.apply_rate(ANNUAL_INTEREST)
        } else {
            Money::ZERO
        };
    }
}

/// Folds annual entries into one statement per account.
///
/// Every entry is consumed (filtered); the statements are emitted from
/// [`Transform::finish`], ascending by account id. Entries dated in another
/// year are ignored.
#[derive(Debug)]
pub struct StatementAggregator {
    year: i32,
    statements: BTreeMap<u64, AnnualStatement>,
}

impl StatementAggregator {
    pub fn new(year: i32) -> Self {
        Self {
            year,
            statements: BTreeMap::new(),
        }
    }
}

impl Transform for StatementAggregator {
    type Input = AnnualEntry;
    type Output = AnnualStatement;

    fn transform(&mut self, entry: &AnnualEntry) -> ItemResult<Vec<AnnualStatement>> {
        if entry.account_id == 0 {
            return Err(ItemError::validation("annual entry without a valid account id"));
        }
        if let Some(date) = entry.date {
            if date.year() != self.year {
                debug!(account = entry.account_id, %date, year = self.year, "entry outside statement year");
                return Ok(Vec::new());
            }
        }

        let year = self.year;
        self.statements
            .entry(entry.account_id)
            .or_insert_with(|| AnnualStatement::empty(entry.account_id, year))
            .apply(entry);
        Ok(Vec::new())
    }

    fn finish(&mut self) -> ItemResult<Vec<AnnualStatement>> {
        let statements: Vec<AnnualStatement> = std::mem::take(&mut self.statements).into_values().collect();
        info!(year = self.year, accounts = statements.len(), "annual statements built");
        Ok(statements)
    }
}
