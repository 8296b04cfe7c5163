//! Deterministic demo ledger.
//!
//! Produces the same rows for the same `(records, year)`, including a handful
//! of deliberately bad ones so every fault path shows up in a demo run.

use std::sync::Arc;

use chrono::NaiveDate;
use tracing::info;

use ledgerbatch_core::{Money, Rate};
use ledgerbatch_engine::KeyDomain;
use ledgerbatch_infra::{CollectingSink, InMemoryTable, LedgerTable, TableError};
use ledgerbatch_ledger::{
    Account, AccountAnomaly, AnnualEntry, AnnualStatement, InterestAccrued, RawTransaction, Transaction,
    TransactionAnomaly,
};

/// Number of accounts seeded when nothing else is asked for.
pub const DEFAULT_RECORDS: u64 = 200;

/// Transaction ids start above this.
pub const TRANSACTION_ID_BASE: u64 = 100_000;

const TRANSACTIONS_PER_ACCOUNT: u64 = 3;
const MALFORMED_ROWS: [u64; 3] = [37, 111, 185];

/// Share of the spring purchase withdrawn again in autumn.
const AUTUMN_WITHDRAWAL: Rate = Rate::from_micros(500_000);
/// Share of the January deposit topped up in December.
const YEAR_END_TOP_UP: Rate = Rate::from_micros(250_000);

const FIRST_NAMES: [&str; 8] = ["Ana", "Bruno", "Carmen", "Diego", "Elena", "Felipe", "Gloria", "Hugo"];
const LAST_NAMES: [&str; 6] = ["Garcia", "Lopez", "Martinez", "Rojas", "Silva", "Torres"];
const ACCOUNT_KINDS: [&str; 6] = ["savings", "checking", "loan", "investment", "AHORRO", "mortgage"];

/// Every table the nightly job reads or writes.
#[derive(Debug)]
pub struct DemoLedger {
    pub year: i32,
    pub raw_transactions: Arc<InMemoryTable<RawTransaction>>,
    pub transactions: Arc<InMemoryTable<Transaction>>,
    pub accounts: Arc<InMemoryTable<Account>>,
    pub accruals: Arc<InMemoryTable<InterestAccrued>>,
    /// Annual ledger lines, one row per account.
    pub entries: Arc<InMemoryTable<Vec<AnnualEntry>>>,
    pub statements: Arc<InMemoryTable<AnnualStatement>>,
    pub anomalies: Arc<CollectingSink<TransactionAnomaly>>,
    pub account_anomalies: Arc<CollectingSink<AccountAnomaly>>,
    transaction_ids: Option<KeyDomain>,
}

impl DemoLedger {
    /// Seed `records` accounts and their activity during `year`.
    pub fn seed(records: u64, year: i32) -> Result<Self, TableError> {
        let accounts = InMemoryTable::from_rows((1..=records).map(account));

        let rows = records * TRANSACTIONS_PER_ACCOUNT;
        let raw_transactions = InMemoryTable::new();
        raw_transactions.upsert_all((1..=rows).map(|row| (row, raw_transaction(row, year))).collect())?;

        let entries = InMemoryTable::new();
        entries.upsert_all((1..=records).map(|id| (id, annual_entries(id, year))).collect())?;

        let transaction_ids = KeyDomain::new(TRANSACTION_ID_BASE + 1, TRANSACTION_ID_BASE + rows).ok();
        info!(accounts = records, transactions = rows, year, "demo ledger seeded");

        Ok(Self {
            year,
            raw_transactions: Arc::new(raw_transactions),
            transactions: Arc::new(InMemoryTable::new()),
            accounts: Arc::new(accounts),
            accruals: Arc::new(InMemoryTable::new()),
            entries: Arc::new(entries),
            statements: Arc::new(InMemoryTable::new()),
            anomalies: Arc::new(CollectingSink::new()),
            account_anomalies: Arc::new(CollectingSink::new()),
            transaction_ids,
        })
    }

    /// Key range of the validated transactions table once it is populated.
    pub fn transaction_ids(&self) -> Option<KeyDomain> {
        self.transaction_ids
    }
}

/// Cheap deterministic mixing so the demo data looks varied.
fn mix(n: u64) -> u64 {
    let mut z = n.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn pick<'a>(options: &[&'a str], n: u64) -> &'a str {
    options[(n % options.len() as u64) as usize]
}

fn account(id: u64) -> Account {
    let r = mix(id);
    // Account 13 repeats account 12's holder, age and type.
    let basis = if id == 13 { mix(12) } else { r };
    let holder = format!("{} {}", pick(&FIRST_NAMES, basis), pick(&LAST_NAMES, basis >> 8));
    let kind = pick(&ACCOUNT_KINDS, basis >> 16);
    let age = if id == 7 { 16 } else { 18 + (basis >> 24) as u32 % 70 };

    let cents = (r >> 32) as i64 % 5_000_000;
    let balance = match kind {
        "loan" | "mortgage" => Money::from_cents(-cents),
        _ => Money::from_cents(cents),
    };
    Account::new(id, holder, balance, age, kind)
}

fn raw_transaction(row: u64, year: i32) -> RawTransaction {
    let r = mix(row ^ 0x5EED);
    let month = 1 + r % 12;
    let day = 1 + (r >> 8) % 28;
    let date = match row {
        _ if row % 53 == 0 => String::new(),
        _ if row % 5 == 0 => format!("{day:02}/{month:02}/{year}"),
        _ => format!("{year}-{month:02}-{day:02}"),
    };

    let cents = 100 + (r >> 16) % 400_000;
    let amount = if MALFORMED_ROWS.contains(&row) {
        "12,50".to_string()
    } else if row % 61 == 0 {
        "75000.00".to_string()
    } else if row % 2 == 0 {
        format!("-{}.{:02}", cents / 100, cents % 100)
    } else {
        format!("{}.{:02}", cents / 100, cents % 100)
    };

    let kind = match row {
        _ if row % 41 == 0 => "REFUND",
        _ if row % 2 == 0 => "DEBITO",
        _ => "credit",
    };

    RawTransaction::new((TRANSACTION_ID_BASE + row).to_string(), date, amount, kind)
}

fn annual_entries(account_id: u64, year: i32) -> Vec<AnnualEntry> {
    let r = mix(account_id ^ 0xA11);
    let on = |month: u32, day: u32| NaiveDate::from_ymd_opt(year, month, day);
    let deposit = Money::from_cents(10_000 + (r % 900_000) as i64);
    let spend = Money::from_cents(((r >> 20) % 400_000) as i64);

    vec![
        AnnualEntry::new(account_id, on(1, 15), "DEPOSITO", deposit),
        AnnualEntry::new(account_id, on(4, 2), "purchase", -spend),
        AnnualEntry::new(account_id, on(9, 30), "RETIRO", -spend.apply_rate(AUTUMN_WITHDRAWAL)),
        AnnualEntry::new(account_id, on(12, 20), "deposit", deposit.apply_rate(YEAR_END_TOP_UP)),
    ]
}
