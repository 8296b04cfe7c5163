//! Paged readers over keyed tables.

use std::collections::VecDeque;
use std::sync::Arc;

use ledgerbatch_core::ItemResult;
use ledgerbatch_engine::{KeyDomain, Partition, Source};
use tracing::trace;

use crate::table::{LedgerTable, TableError};

/// Rows fetched per table round trip unless overridden.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Reads the rows of one key range in key order, a page at a time.
///
/// A source bound to no partition reads the whole table.
pub struct RangeSource<V> {
    table: Arc<dyn LedgerTable<V>>,
    lower: u64,
    upper: u64,
    page_size: usize,
    cursor: Option<u64>,
    buffer: VecDeque<V>,
    exhausted: bool,
}

impl<V> std::fmt::Debug for RangeSource<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeSource")
            .field("lower", &self.lower)
            .field("upper", &self.upper)
            .field("cursor", &self.cursor)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl<V> RangeSource<V> {
    pub fn new(table: Arc<dyn LedgerTable<V>>, partition: Option<&Partition>) -> Self {
        let (lower, upper) = partition.map_or((0, u64::MAX), |p| (p.lower(), p.upper()));
        Self {
            table,
            lower,
            upper,
            page_size: DEFAULT_PAGE_SIZE,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn fill(&mut self) -> Result<(), TableError> {
        let page = self.table.page(self.lower, self.upper, self.cursor, self.page_size)?;
        trace!(lower = self.lower, upper = self.upper, rows = page.len(), "page fetched");
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some((last, _)) = page.last() {
            self.cursor = Some(*last);
        }
        self.buffer.extend(page.into_iter().map(|(_, row)| row));
        Ok(())
    }
}

impl<V: Send> Source for RangeSource<V> {
    type Item = V;

    fn next(&mut self) -> ItemResult<Option<V>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill()?;
        }
        Ok(self.buffer.pop_front())
    }
}

/// Yields the elements of every group read by the inner source, in order.
///
/// Lets a table keyed by owner (one row holding all of an account's entries)
/// feed a transform that works entry by entry.
#[derive(Debug)]
pub struct FlattenSource<S, T> {
    inner: S,
    pending: VecDeque<T>,
}

impl<S, T> FlattenSource<S, T>
where
    S: Source<Item = Vec<T>>,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: VecDeque::new(),
        }
    }
}

impl<S, T> Source for FlattenSource<S, T>
where
    S: Source<Item = Vec<T>>,
    T: Send,
{
    type Item = T;

    fn next(&mut self) -> ItemResult<Option<T>> {
        while self.pending.is_empty() {
            match self.inner.next()? {
                Some(group) => self.pending.extend(group),
                None => return Ok(None),
            }
        }
        Ok(self.pending.pop_front())
    }

    fn skip_current(&mut self) {
        self.inner.skip_current();
    }
}

/// Key domain spanning the table's smallest and largest key.
pub fn key_domain<V>(table: &dyn LedgerTable<V>) -> Result<Option<KeyDomain>, TableError> {
    Ok(table.key_bounds()?.and_then(|(lo, hi)| KeyDomain::new(lo, hi).ok()))
}
