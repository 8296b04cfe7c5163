//! Accounts: validation, monthly interest accrual and duplicate detection.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ledgerbatch_core::{ItemError, ItemResult, Money, Rate};
use ledgerbatch_engine::Transform;

/// Deepest overdraft any account may carry.
pub const MIN_BALANCE: Money = Money::from_units(-50_000);
pub const MAX_BALANCE: Money = Money::from_units(10_000_000);
/// Deepest overdraft on a checking account.
pub const CHECKING_OVERDRAFT: Money = Money::from_units(-5_000);
pub const MIN_AGE: u32 = 18;
pub const MAX_AGE: u32 = 120;

/// Product type of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Savings,
    Checking,
    Loan,
    Mortgage,
    Investment,
}

impl AccountKind {
    /// Accepts the English and Spanish names, any case.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "SAVINGS" | "AHORRO" => Some(AccountKind::Savings),
            "CHECKING" | "CORRIENTE" => Some(AccountKind::Checking),
            "LOAN" | "PRESTAMO" | "PRÉSTAMO" => Some(AccountKind::Loan),
            "MORTGAGE" | "HIPOTECA" => Some(AccountKind::Mortgage),
            "INVESTMENT" | "INVERSION" | "INVERSIÓN" => Some(AccountKind::Investment),
            _ => None,
        }
    }

    /// Monthly interest rate. Loans accrue a charge (negative rate).
    pub fn monthly_rate(&self) -> Rate {
        match self {
            AccountKind::Savings => Rate::from_micros(18_750),
            AccountKind::Checking => Rate::from_micros(4_170),
            AccountKind::Loan => Rate::from_micros(-70_830),
            AccountKind::Mortgage | AccountKind::Investment => Rate::ZERO,
        }
    }
}

/// Account master record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: u64,
    pub holder: String,
    pub balance: Money,
    pub age: u32,
    /// Product type as recorded; see [`Account::kind`].
    pub kind: String,
}

impl Account {
    pub fn new(id: u64, holder: impl Into<String>, balance: Money, age: u32, kind: impl Into<String>) -> Self {
        Self {
            id,
            holder: holder.into(),
            balance,
            age,
            kind: kind.into(),
        }
    }

    pub fn account_kind(&self) -> Option<AccountKind> {
        AccountKind::parse(&self.kind)
    }
}

fn valid_holder_char(c: char) -> bool {
    c.is_alphabetic() || c.is_whitespace() || matches!(c, '\'' | '.' | '-')
}

/// Rejects accounts that break a business rule. All violations are reported
/// together in one [`ItemError::Validation`].
#[derive(Debug, Default, Clone, Copy)]
pub struct AccountValidator;

impl AccountValidator {
    pub fn violations(account: &Account) -> Vec<String> {
        let mut errors = Vec::new();

        if account.id == 0 {
            errors.push("account id must be positive".to_string());
        }

        let holder = account.holder.trim();
        if holder.is_empty() {
            errors.push("holder name is empty".to_string());
        } else {
            let len = holder.chars().count();
            if !(2..=100).contains(&len) {
                errors.push(format!("holder name length {len} outside 2..=100"));
            }
            if !holder.chars().all(valid_holder_char) {
                errors.push("holder name contains invalid characters".to_string());
            }
        }

        if account.balance < MIN_BALANCE {
            errors.push(format!("overdraft exceeds {MIN_BALANCE}"));
        }
        if account.balance > MAX_BALANCE {
            errors.push(format!("balance exceeds {MAX_BALANCE}"));
        }

        if !(MIN_AGE..=MAX_AGE).contains(&account.age) {
            errors.push(format!("age {} outside {MIN_AGE}..={MAX_AGE}", account.age));
        }

        match account.account_kind() {
            None => errors.push(format!("invalid account type '{}'", account.kind)),
            Some(AccountKind::Savings) if account.balance.is_negative() => {
                errors.push("savings account with negative balance".to_string());
            }
            Some(AccountKind::Checking) if account.balance < CHECKING_OVERDRAFT => {
                errors.push(format!("checking overdraft exceeds {CHECKING_OVERDRAFT}"));
            }
            Some(_) => {}
        }

        errors
    }
}

impl Transform for AccountValidator {
    type Input = Account;
    type Output = Account;

    fn transform(&mut self, account: &Account) -> ItemResult<Vec<Account>> {
        let errors = Self::violations(account);
        if errors.is_empty() {
            Ok(vec![account.clone()])
        } else {
            Err(ItemError::validation(format!("account {}: {}", account.id, errors.join("; "))))
        }
    }
}

/// One month of interest on one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterestAccrued {
    pub account_id: u64,
    pub kind: AccountKind,
    pub previous_balance: Money,
    pub rate: Rate,
    pub interest: Money,
    pub new_balance: Money,
}

/// Applies the monthly rate of each account's type.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterestAccrual;

impl Transform for InterestAccrual {
    type Input = Account;
    type Output = InterestAccrued;

    fn transform(&mut self, account: &Account) -> ItemResult<Vec<InterestAccrued>> {
        let kind = account
            .account_kind()
            .ok_or_else(|| ItemError::validation(format!("account {}: unknown type '{}'", account.id, account.kind)))?;

        let rate = kind.monthly_rate();
        let interest = account.balance.apply_rate(rate);
        let accrued = InterestAccrued {
            account_id: account.id,
            kind,
            previous_balance: account.balance,
            rate,
            interest,
            new_balance: account.balance + interest,
        };
        debug!(
            account = account.id,
            previous = %accrued.previous_balance,
            interest = %accrued.interest,
            new_balance = %accrued.new_balance,
            "interest accrued"
        );
        Ok(vec![accrued])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountAnomalyKind {
    Duplicate,
    NegativeBalance,
    MissingHolder,
    AgeOutOfRange,
    InvalidType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAnomaly {
    pub account_id: u64,
    pub kind: AccountAnomalyKind,
    pub detail: String,
}

/// Flags suspicious accounts, including repeats of an earlier
/// (holder, age, type) seen by this instance.
///
/// The seen-set is per instance, so under partitioning duplicates are only
/// detected within one partition.
#[derive(Debug, Default)]
pub struct DuplicateAccountDetector {
    seen: HashSet<(String, u32, String)>,
}

impl DuplicateAccountDetector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transform for DuplicateAccountDetector {
    type Input = Account;
    type Output = AccountAnomaly;

    fn transform(&mut self, account: &Account) -> ItemResult<Vec<AccountAnomaly>> {
        let mut found = Vec::new();
        let mut flag = |kind, detail: String| {
            found.push(AccountAnomaly {
                account_id: account.id,
                kind,
                detail,
            })
        };

        let holder = account.holder.trim();
        if holder.is_empty() {
            flag(AccountAnomalyKind::MissingHolder, "holder name is empty".to_string());
        } else {
            let key = (holder.to_lowercase(), account.age, account.kind.trim().to_uppercase());
            if !self.seen.insert(key) {
                flag(
                    AccountAnomalyKind::Duplicate,
                    format!("same holder, age and type as an earlier account ({holder}, {})", account.age),
                );
            }
        }

        if account.balance.is_negative() {
            flag(AccountAnomalyKind::NegativeBalance, format!("balance {}", account.balance));
        }
        if !(MIN_AGE..=MAX_AGE).contains(&account.age) {
            flag(AccountAnomalyKind::AgeOutOfRange, format!("age {}", account.age));
        }
        if account.account_kind().is_none() {
            flag(AccountAnomalyKind::InvalidType, format!("type '{}'", account.kind));
        }

        if !found.is_empty() {
            warn!(account = account.id, anomalies = found.len(), "account anomalies detected");
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(id: u64, holder: &str, balance: i64, age: u32, kind: &str) -> Account {
        Account::new(id, holder, Money::from_units(balance), age, kind)
    }

    #[test]
    fn valid_account_passes() {
        let acc = account(1, "María O'Neil-Pérez", 1_500, 34, "ahorro");
        assert_eq!(AccountValidator.transform(&acc).unwrap(), vec![acc]);
    }

    #[test]
    fn violations_are_collected() {
        let acc = account(0, "J", -60_000, 15, "savings");
        let errors = AccountValidator::violations(&acc);
        assert_eq!(errors.len(), 5, "{errors:?}");

        let err = AccountValidator.transform(&acc).unwrap_err();
        assert!(matches!(err, ItemError::Validation(ref msg) if msg.starts_with("account 0:")));
    }

    #[test]
    fn type_specific_rules() {
        assert!(!AccountValidator::violations(&account(1, "Ana", -10, 30, "SAVINGS")).is_empty());
        assert!(!AccountValidator::violations(&account(1, "Ana", -6_000, 30, "checking")).is_empty());
        assert!(AccountValidator::violations(&account(1, "Ana", -4_000, 30, "checking")).is_empty());
        assert!(AccountValidator::violations(&account(1, "Ana", -40_000, 30, "loan")).is_empty());
        assert!(!AccountValidator::violations(&account(1, "Ana", 10, 30, "crypto")).is_empty());
        assert!(!AccountValidator::violations(&account(1, "R2D2", 10, 30, "loan")).is_empty());
    }

    #[test]
    fn interest_by_account_type() {
        let mut accrual = InterestAccrual;

        let savings = accrual.transform(&account(1, "Ana", 1_000, 30, "savings")).unwrap().remove(0);
        assert_eq!(savings.interest, Money::from_cents(1_875));
        assert_eq!(savings.new_balance, Money::from_cents(101_875));

        let checking = accrual.transform(&account(2, "Ana", 1_000, 30, "CORRIENTE")).unwrap().remove(0);
        assert_eq!(checking.interest, Money::from_cents(417));

        let loan = accrual.transform(&account(3, "Ana", -10_000, 30, "loan")).unwrap().remove(0);
        assert_eq!(loan.interest, Money::from_cents(70_830));
        assert_eq!(loan.new_balance, Money::from_cents(-929_170));

        let mortgage = accrual.transform(&account(4, "Ana", 1_000, 30, "mortgage")).unwrap().remove(0);
        assert_eq!(mortgage.interest, Money::ZERO);

        assert!(matches!(
            accrual.transform(&account(5, "Ana", 1, 30, "crypto")),
            Err(ItemError::Validation(_))
        ));
    }

    #[test]
    fn duplicates_are_detected_per_instance() {
        let mut detector = DuplicateAccountDetector::new();
        assert!(detector.transform(&account(1, "Ana Soto", 10, 30, "savings")).unwrap().is_empty());

        let repeat = detector.transform(&account(2, " ana soto ", 99, 30, "SAVINGS")).unwrap();
        assert_eq!(repeat.len(), 1);
        assert_eq!(repeat[0].kind, AccountAnomalyKind::Duplicate);
        assert_eq!(repeat[0].account_id, 2);

        let mut fresh = DuplicateAccountDetector::new();
        assert!(fresh.transform(&account(2, "Ana Soto", 99, 30, "savings")).unwrap().is_empty());
    }

    #[test]
    fn several_anomalies_on_one_account() {
        let mut detector = DuplicateAccountDetector::new();
        let found = detector.transform(&account(9, "  ", -5, 130, "crypto")).unwrap();
        let kinds: Vec<AccountAnomalyKind> = found.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                AccountAnomalyKind::MissingHolder,
                AccountAnomalyKind::NegativeBalance,
                AccountAnomalyKind::AgeOutOfRange,
                AccountAnomalyKind::InvalidType,
            ]
        );
    }
}
