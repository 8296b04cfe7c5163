//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**: two partitions
/// with the same bounds and label, or two amounts with the same number of
/// cents, are the same thing. To "modify" one, build a new one.
///
/// The bounds make them safe to hand to worker threads and to log:
/// - **Clone**: cheap to copy
/// - **PartialEq**: compared by attribute values
/// - **Debug**: printable in traces and test failures
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
