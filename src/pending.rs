//! Insertion-ordered pending-load buffer.
//!
//! A keyed, order-preserving map rather than a flat request list: the
//! `try_add` tie-break needs an O(1) "is this key already queued" check,
//! which a `Vec` of requests cannot give without a linear scan per load.

use std::hash::Hash;

use indexmap::IndexMap;

/// An insertion-ordered `K -> V` map used to coalesce concurrent loads
/// awaiting the next dispatch.
///
/// Not concurrency-safe on its own — the owning `LoaderCore` serializes all
/// access under its core mutex.
pub struct PendingBuffer<K, V> {
    entries: IndexMap<K, V>,
}

impl<K, V> PendingBuffer<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    /// Insert `value` under `key` only if `key` is absent.
    ///
    /// Returns `true` if the insert happened, `false` if another entry was
    /// already queued for this key (the caller should discard its own
    /// value and use [`PendingBuffer::get`] instead — this is the base
    /// spec's only correctness-critical tie-break).
    pub fn try_add(&mut self, key: K, value: V) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, value);
        true
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    /// The value stored for `key`, if any.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer holds no pending entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain all entries in insertion order, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }
}

impl<K, V> Default for PendingBuffer<K, V>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_add_preserves_insertion_order() {
        let mut buf: PendingBuffer<&str, i32> = PendingBuffer::new();
        assert!(buf.try_add("a", 1));
        assert!(buf.try_add("b", 2));
        assert!(buf.try_add("c", 3));
        assert_eq!(buf.keys().collect::<Vec<_>>(), vec![&"a", &"b", &"c"]);
    }

    #[test]
    fn try_add_rejects_duplicate_key() {
        let mut buf: PendingBuffer<&str, i32> = PendingBuffer::new();
        assert!(buf.try_add("a", 1));
        assert!(!buf.try_add("a", 2));
        assert_eq!(buf.get(&"a"), Some(&1));
    }

    #[test]
    fn drain_empties_the_buffer_and_returns_insertion_order() {
        let mut buf: PendingBuffer<&str, i32> = PendingBuffer::new();
        buf.try_add("a", 1);
        buf.try_add("b", 2);
        let drained = buf.drain();
        assert_eq!(drained, vec![("a", 1), ("b", 2)]);
        assert!(buf.is_empty());
    }
}
