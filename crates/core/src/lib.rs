//! Shared building blocks for the batch engine.
//!
//! This crate contains **pure** primitives (no threads, no IO): the per-item
//! failure taxonomy, fixed-point money, run identifiers and the value-object
//! marker.

pub mod error;
pub mod id;
pub mod money;
pub mod value_object;

pub use error::{FailureCategory, ItemError, ItemResult, classify};
pub use id::{InvalidId, RunId};
pub use money::{Money, MoneyError, Rate};
pub use value_object::ValueObject;
