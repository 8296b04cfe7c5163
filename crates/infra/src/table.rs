//! Keyed tables the ledger steps read from and write to.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use ledgerbatch_core::ItemError;
use ledgerbatch_ledger::{Account, AnnualStatement, InterestAccrued, Transaction};

/// Record stored under a numeric key.
pub trait Keyed {
    fn key(&self) -> u64;
}

impl Keyed for Account {
    fn key(&self) -> u64 {
        self.id
    }
}

impl Keyed for Transaction {
    fn key(&self) -> u64 {
        self.id
    }
}

impl Keyed for InterestAccrued {
    fn key(&self) -> u64 {
        self.account_id
    }
}

impl Keyed for AnnualStatement {
    fn key(&self) -> u64 {
        self.account_id
    }
}

/// Table failure. Surfaces to the engine as [`ItemError::Storage`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("table lock poisoned: {0}")]
    Poisoned(&'static str),
}

impl From<TableError> for ItemError {
    fn from(err: TableError) -> Self {
        ItemError::storage(err.to_string())
    }
}

/// Key-ordered table abstraction used by range sources and table sinks.
pub trait LedgerTable<V>: Send + Sync {
    fn get(&self, key: u64) -> Result<Option<V>, TableError>;

    /// Insert or replace every row of `rows` under one lock.
    fn upsert_all(&self, rows: Vec<(u64, V)>) -> Result<(), TableError>;

    /// Up to `limit` rows with keys in `[lower, upper]`, strictly after
    /// `after` when given, ascending.
    fn page(&self, lower: u64, upper: u64, after: Option<u64>, limit: usize) -> Result<Vec<(u64, V)>, TableError>;

    /// Smallest and largest key, `None` when empty.
    fn key_bounds(&self) -> Result<Option<(u64, u64)>, TableError>;

    fn len(&self) -> Result<usize, TableError>;
}

impl<V, T> LedgerTable<V> for Arc<T>
where
    T: LedgerTable<V> + ?Sized,
{
    fn get(&self, key: u64) -> Result<Option<V>, TableError> {
        (**self).get(key)
    }

    fn upsert_all(&self, rows: Vec<(u64, V)>) -> Result<(), TableError> {
        (**self).upsert_all(rows)
    }

    fn page(&self, lower: u64, upper: u64, after: Option<u64>, limit: usize) -> Result<Vec<(u64, V)>, TableError> {
        (**self).page(lower, upper, after, limit)
    }

    fn key_bounds(&self) -> Result<Option<(u64, u64)>, TableError> {
        (**self).key_bounds()
    }

    fn len(&self) -> Result<usize, TableError> {
        (**self).len()
    }
}

/// In-memory table for tests, benches and the demo runner.
#[derive(Debug)]
pub struct InMemoryTable<V> {
    inner: RwLock<BTreeMap<u64, V>>,
}

impl<V> InMemoryTable<V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<V> Default for InMemoryTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Keyed> InMemoryTable<V> {
    /// Table preloaded with `rows`, each under its own key.
    pub fn from_rows(rows: impl IntoIterator<Item = V>) -> Self {
        Self {
            inner: RwLock::new(rows.into_iter().map(|row| (row.key(), row)).collect()),
        }
    }
}

impl<V: Clone> InMemoryTable<V> {
    /// All rows in key order.
    pub fn rows(&self) -> Result<Vec<V>, TableError> {
        let map = self.inner.read().map_err(|_| TableError::Poisoned("read"))?;
        Ok(map.values().cloned().collect())
    }
}

impl<V> LedgerTable<V> for InMemoryTable<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: u64) -> Result<Option<V>, TableError> {
        let map = self.inner.read().map_err(|_| TableError::Poisoned("read"))?;
        Ok(map.get(&key).cloned())
    }

    fn upsert_all(&self, rows: Vec<(u64, V)>) -> Result<(), TableError> {
        let mut map = self.inner.write().map_err(|_| TableError::Poisoned("write"))?;
        map.extend(rows);
        Ok(())
    }

    fn page(&self, lower: u64, upper: u64, after: Option<u64>, limit: usize) -> Result<Vec<(u64, V)>, TableError> {
        let start = match after {
            Some(after) if after >= upper => return Ok(Vec::new()),
            Some(after) => lower.max(after + 1),
            None => lower,
        };
        if start > upper {
            return Ok(Vec::new());
        }

        let map = self.inner.read().map_err(|_| TableError::Poisoned("read"))?;
        Ok(map
            .range(start..=upper)
            .take(limit)
            .map(|(k, v)| (*k, v.clone()))
            .collect())
    }

    fn key_bounds(&self) -> Result<Option<(u64, u64)>, TableError> {
        let map = self.inner.read().map_err(|_| TableError::Poisoned("read"))?;
        Ok(map.keys().next().copied().zip(map.keys().next_back().copied()))
    }

    fn len(&self) -> Result<usize, TableError> {
        let map = self.inner.read().map_err(|_| TableError::Poisoned("read"))?;
        Ok(map.len())
    }
}
