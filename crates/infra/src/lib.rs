//! Storage adapters for batch steps: keyed tables, range sources and sinks.

pub mod sink;
pub mod source;
pub mod table;

#[cfg(test)]
mod integration_tests;

pub use sink::{CollectingSink, TableSink};
pub use source::{DEFAULT_PAGE_SIZE, FlattenSource, RangeSource, key_domain};
pub use table::{InMemoryTable, Keyed, LedgerTable, TableError};
