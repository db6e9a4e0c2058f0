//! Bounded batches of items.

use crate::errors::BatchError;

/// An item excluded from a chunk, with the failure that excluded it.
///
/// Read skips carry no item: the reader never produced one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedItem<T> {
    /// The skipped item, if one was produced.
    pub item: Option<T>,
    /// Why it was skipped.
    pub error: BatchError,
}

/// An ordered batch of items read within one commit interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<T> {
    items: Vec<T>,
    skips: Vec<SkippedItem<T>>,
    end: bool,
}

impl<T> Default for Chunk<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> From<Vec<T>> for Chunk<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            items,
            skips: Vec::new(),
            end: false,
        }
    }
}

impl<T> Chunk<T> {
    /// Creates an empty chunk.
    #[must_use]
    pub fn new() -> Self {
        Self::from(Vec::new())
    }

    /// Appends an item.
    pub fn add(&mut self, item: T) {
        self.items.push(item);
    }

    /// The items, in read order.
    #[must_use]
    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if there are no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates over the items.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Consumes the chunk, returning its items.
    #[must_use]
    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    /// Removes and returns the item at `index`.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        (index < self.items.len()).then(|| self.items.remove(index))
    }

    /// Marks that the reader has no more data.
    pub fn set_end(&mut self) {
        self.end = true;
    }

    /// Returns true if this is the last chunk of the step.
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.end
    }

    /// Records a read failure that was skipped.
    pub fn skip_read(&mut self, error: BatchError) {
        self.skips.push(SkippedItem { item: None, error });
    }

    /// Records an item that was skipped.
    pub fn skip_item(&mut self, item: T, error: BatchError) {
        self.skips.push(SkippedItem {
            item: Some(item),
            error,
        });
    }

    /// Skips recorded for this chunk.
    #[must_use]
    pub fn skips(&self) -> &[SkippedItem<T>] {
        &self.skips
    }
}

impl<'a, T> IntoIterator for &'a Chunk<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T> IntoIterator for Chunk<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_and_skip() {
        let mut chunk = Chunk::from(vec![1, 2, 3]);
        assert_eq!(chunk.remove(1), Some(2));
        assert_eq!(chunk.remove(7), None);
        chunk.skip_item(2, BatchError::item("poison", "bad"));
        chunk.skip_read(BatchError::item("parse", "garbled"));

        assert_eq!(chunk.items(), &[1, 3]);
        assert_eq!(chunk.skips().len(), 2);
        assert_eq!(chunk.skips()[0].item, Some(2));
        assert!(chunk.skips()[1].item.is_none());
    }

    #[test]
    fn test_end_flag() {
        let mut chunk: Chunk<u8> = Chunk::new();
        assert!(!chunk.is_end());
        chunk.set_end();
        assert!(chunk.is_end());
        assert!(chunk.is_empty());
    }
}
