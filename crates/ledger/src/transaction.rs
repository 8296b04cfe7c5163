//! Transactions: raw rows, parsing and validation.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ledgerbatch_core::{ItemError, ItemResult, Money};
use ledgerbatch_engine::Transform;

/// Largest amount accepted for a single day.
pub const DAILY_LIMIT: Money = Money::from_units(50_000);

/// Smallest non-zero amount accepted.
pub const MINIMUM_AMOUNT: Money = Money::from_cents(1);

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d-%m-%Y", "%Y/%m/%d", "%d/%m/%Y"];

/// Parse a date in one of the accepted layouts.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

/// A transaction row as it arrives, every field still text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub id: String,
    pub date: String,
    pub amount: String,
    pub kind: String,
}

impl RawTransaction {
    pub fn new(id: impl Into<String>, date: impl Into<String>, amount: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            date: date.into(),
            amount: amount.into(),
            kind: kind.into(),
        }
    }
}

/// Direction of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Debit,
    Credit,
    /// Anything else, upper-cased.
    Other(String),
}

impl TransactionKind {
    /// Normalizes the English and Spanish spellings.
    pub fn normalize(raw: &str) -> Self {
        let upper = raw.trim().to_uppercase();
        match upper.as_str() {
            "DEBIT" | "DEBITO" | "DÉBITO" => TransactionKind::Debit,
            "CREDIT" | "CREDITO" | "CRÉDITO" => TransactionKind::Credit,
            _ => TransactionKind::Other(upper),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, TransactionKind::Other(_))
    }
}

/// Typed transaction. Missing fields stay `None` until validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub date: Option<NaiveDate>,
    pub amount: Option<Money>,
    pub kind: Option<TransactionKind>,
    /// Reasons this transaction was flagged; empty when clean.
    #[serde(default)]
    pub anomalies: Vec<String>,
}

impl Transaction {
    pub fn new(id: u64, date: Option<NaiveDate>, amount: Money, kind: TransactionKind) -> Self {
        Self {
            id,
            date,
            amount: Some(amount),
            kind: Some(kind),
            anomalies: Vec::new(),
        }
    }

    pub fn is_anomalous(&self) -> bool {
        !self.anomalies.is_empty()
    }

    pub fn amount_or_zero(&self) -> Money {
        self.amount.unwrap_or(Money::ZERO)
    }
}

/// Decodes [`RawTransaction`]s. Undecodable fields are [`ItemError::Parse`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TransactionParser;

impl Transform for TransactionParser {
    type Input = RawTransaction;
    type Output = Transaction;

    fn transform(&mut self, raw: &RawTransaction) -> ItemResult<Vec<Transaction>> {
        let id = raw
            .id
            .trim()
            .parse::<u64>()
            .map_err(|_| ItemError::parse(format!("transaction id '{}' is not a number", raw.id)))?;

        let date = if raw.date.trim().is_empty() {
            None
        } else {
            let parsed = parse_date(&raw.date)
                .ok_or_else(|| ItemError::parse(format!("transaction {id}: unreadable date '{}'", raw.date)))?;
            Some(parsed)
        };

        let amount = if raw.amount.trim().is_empty() {
            None
        } else {
            let parsed = raw
                .amount
                .parse::<Money>()
                .map_err(|e| ItemError::parse(format!("transaction {id}: {e}")))?;
            Some(parsed)
        };

        let kind = Some(raw.kind.trim()).filter(|k| !k.is_empty()).map(TransactionKind::normalize);

        Ok(vec![Transaction {
            id,
            date,
            amount,
            kind,
            anomalies: Vec::new(),
        }])
    }
}

/// Normalizes a transaction and flags suspicious values.
///
/// Flagging is not failing: flagged transactions still flow downstream with
/// their reasons attached. Only an id of 0 is rejected outright.
#[derive(Debug, Clone)]
pub struct TransactionValidator {
    today: NaiveDate,
}

impl Default for TransactionValidator {
    fn default() -> Self {
        Self::new(Utc::now().date_naive())
    }
}

impl TransactionValidator {
    /// `today` bounds future dates and replaces missing ones.
    pub fn new(today: NaiveDate) -> Self {
        Self { today }
    }
}

impl Transform for TransactionValidator {
    type Input = Transaction;
    type Output = Transaction;

    fn transform(&mut self, input: &Transaction) -> ItemResult<Vec<Transaction>> {
        if input.id == 0 {
            return Err(ItemError::validation("transaction id must be positive"));
        }

        let mut tx = input.clone();
        let mut reasons = Vec::new();

        match tx.amount {
            None => {
                tx.amount = Some(Money::ZERO);
                reasons.push("missing amount set to 0".to_string());
            }
            Some(amount) if amount > DAILY_LIMIT => {
                reasons.push(format!("amount exceeds daily limit ({DAILY_LIMIT})"));
            }
            Some(amount) if amount < MINIMUM_AMOUNT && !amount.is_zero() => {
                reasons.push(format!("amount below minimum ({MINIMUM_AMOUNT})"));
            }
            Some(_) => {}
        }

        match &tx.kind {
            None => reasons.push("missing transaction kind".to_string()),
            Some(TransactionKind::Other(raw)) => reasons.push(format!("invalid transaction kind '{raw}'")),
            Some(_) => {}
        }

        match tx.date {
            None => {
                tx.date = Some(self.today);
                reasons.push("missing date set to processing date".to_string());
            }
            Some(date) if date > self.today => reasons.push("future date".to_string()),
            Some(_) => {}
        }

        if reasons.is_empty() {
            debug!(transaction = tx.id, "transaction clean");
        } else {
            warn!(transaction = tx.id, reasons = %reasons.join("; "), "transaction flagged");
        }
        tx.anomalies.extend(reasons);

        Ok(vec![tx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_a_clean_row() {
        let raw = RawTransaction::new(" 12 ", "2024-03-05", "-120.50", "debit");
        let out = TransactionParser.transform(&raw).unwrap();
        assert_eq!(
            out,
            vec![Transaction::new(12, Some(date(2024, 3, 5)), Money::from_cents(-12_050), TransactionKind::Debit)]
        );
    }

    #[test]
    fn accepts_alternate_date_layouts() {
        assert_eq!(parse_date("05/03/2024"), Some(date(2024, 3, 5)));
        assert_eq!(parse_date("2024/03/05"), Some(date(2024, 3, 5)));
        assert_eq!(parse_date("05-03-2024"), Some(date(2024, 3, 5)));
        assert_eq!(parse_date("March 5th"), None);
    }

    #[test]
    fn undecodable_fields_are_parse_failures() {
        let bad_id = RawTransaction::new("x1", "2024-01-01", "1", "CREDIT");
        assert!(matches!(TransactionParser.transform(&bad_id), Err(ItemError::Parse(_))));

        let bad_amount = RawTransaction::new("1", "2024-01-01", "12,00", "CREDIT");
        assert!(matches!(TransactionParser.transform(&bad_amount), Err(ItemError::Parse(_))));

        let bad_date = RawTransaction::new("1", "yesterday", "1", "CREDIT");
        assert!(matches!(TransactionParser.transform(&bad_date), Err(ItemError::Parse(_))));
    }

    #[test]
    fn empty_fields_are_missing_not_malformed() {
        let raw = RawTransaction::new("3", "", " ", "");
        let tx = TransactionParser.transform(&raw).unwrap().remove(0);
        assert_eq!((tx.date, tx.amount, tx.kind), (None, None, None));
    }

    #[test]
    fn normalizes_kind_spellings() {
        assert_eq!(TransactionKind::normalize(" debito "), TransactionKind::Debit);
        assert_eq!(TransactionKind::normalize("CREDIT"), TransactionKind::Credit);
        assert_eq!(TransactionKind::normalize("refund"), TransactionKind::Other("REFUND".into()));
    }

    #[test]
    fn validator_flags_without_failing() {
        let today = date(2024, 6, 1);
        let mut validator = TransactionValidator::new(today);

        let clean = Transaction::new(1, Some(date(2024, 5, 1)), Money::from_units(100), TransactionKind::Credit);
        assert!(!validator.transform(&clean).unwrap()[0].is_anomalous());

        let big = Transaction::new(2, Some(date(2024, 5, 1)), Money::from_units(60_000), TransactionKind::Credit);
        let flagged = validator.transform(&big).unwrap().remove(0);
        assert!(flagged.anomalies[0].contains("daily limit"));

        let future = Transaction::new(3, Some(date(2024, 7, 1)), Money::from_units(1), TransactionKind::Other("X".into()));
        let flagged = validator.transform(&future).unwrap().remove(0);
        assert_eq!(flagged.anomalies.len(), 2);

        let missing = Transaction {
            id: 4,
            date: None,
            amount: None,
            kind: None,
            anomalies: Vec::new(),
        };
        let fixed = validator.transform(&missing).unwrap().remove(0);
        assert_eq!(fixed.amount, Some(Money::ZERO));
        assert_eq!(fixed.date, Some(today));
        assert_eq!(fixed.anomalies.len(), 3);
    }

    #[test]
    fn negative_amounts_are_below_minimum() {
        let mut validator = TransactionValidator::new(date(2024, 6, 1));
        let debit = Transaction::new(5, Some(date(2024, 5, 1)), Money::from_cents(-500), TransactionKind::Debit);
        let out = validator.transform(&debit).unwrap().remove(0);
        assert!(out.anomalies[0].contains("below minimum"));

        let zero = Transaction::new(6, Some(date(2024, 5, 1)), Money::ZERO, TransactionKind::Debit);
        assert!(!validator.transform(&zero).unwrap()[0].is_anomalous());
    }

    #[test]
    fn id_zero_is_rejected() {
        let mut validator = TransactionValidator::new(date(2024, 6, 1));
        let tx = Transaction::new(0, None, Money::ZERO, TransactionKind::Debit);
        assert!(matches!(validator.transform(&tx), Err(ItemError::Validation(_))));
    }
}
