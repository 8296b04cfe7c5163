//! Bounded commit buffer.

/// Ordered list of transformed items written to a sink as one unit.
///
/// A chunk never holds more than `capacity` items. The executor flushes it
/// when [`Chunk::push`] reports it full, and once more at end of input if
/// anything is left over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> Chunk<T> {
    /// Create an empty chunk. A zero capacity is treated as 1.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an item. Returns `true` when the chunk is now full.
    pub fn push(&mut self, item: T) -> bool {
        debug_assert!(!self.is_full(), "push into a full chunk");
        self.items.push(item);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Clear after a successful commit (or a skipped write).
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Drop the in-flight items on abort. Returns how many were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }
}
