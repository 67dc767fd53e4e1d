//! Expiry-ordered priority registry.
//!
//! A binary min-heap keyed by expiry instant, with an auxiliary index from
//! key to heap position so that an entry's expiry can be moved earlier or
//! later in O(log n).

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::time::Instant;

/// A single tracked item in the queue.
#[derive(Debug)]
struct Entry<T> {
    key: String,
    expires_at: Instant,
    item: T,
}

#[derive(Debug)]
struct Heap<T> {
    entries: Vec<Entry<T>>,
    /// Key -> position in `entries`
    positions: HashMap<String, usize>,
}

/// Thread-safe indexed min-heap ordered by expiry.
///
/// Every operation holds the internal lock only for the heap manipulation
/// itself; no callbacks run while it is held.
#[derive(Debug)]
pub struct ExpiryQueue<T> {
    heap: Mutex<Heap<T>>,
}

impl<T> ExpiryQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(Heap {
                entries: Vec::new(),
                positions: HashMap::new(),
            }),
        }
    }

    /// Insert an item, replacing any entry already tracked under `key`.
    pub fn insert(&self, key: &str, expires_at: Instant, item: T) {
        let mut heap = self.heap.lock();

        if let Some(&index) = heap.positions.get(key) {
            let entry = &mut heap.entries[index];
            entry.expires_at = expires_at;
            entry.item = item;
            heap.fix(index);
            return;
        }

        let index = heap.entries.len();
        heap.entries.push(Entry {
            key: key.to_string(),
            expires_at,
            item,
        });
        heap.positions.insert(key.to_string(), index);
        heap.sift_up(index);
    }

    /// Move the entry tracked under `key` to a new expiry.
    ///
    /// The update is applied only if `is_current` accepts the tracked item,
    /// which lets callers ignore entries that now belong to a newer owner of
    /// the same key. Returns `true` if an entry was updated.
    pub fn update_expiry<F>(&self, key: &str, expires_at: Instant, is_current: F) -> bool
    where
        F: FnOnce(&T) -> bool,
    {
        let mut heap = self.heap.lock();

        let Some(&index) = heap.positions.get(key) else {
            return false;
        };
        if !is_current(&heap.entries[index].item) {
            return false;
        }

        heap.entries[index].expires_at = expires_at;
        heap.fix(index);
        true
    }

    /// Remove and return the soonest-to-expire entry if it expired at or before `now`.
    ///
    /// Returns `None` and leaves the queue untouched otherwise.
    pub fn pop_if_expired(&self, now: Instant) -> Option<(String, T)> {
        let mut heap = self.heap.lock();

        match heap.entries.first() {
            Some(entry) if entry.expires_at <= now => {}
            _ => return None,
        }

        let entry = heap.remove_at(0);
        Some((entry.key, entry.item))
    }

    /// Expiry of the soonest-to-expire entry.
    pub fn peek_expiry(&self) -> Option<Instant> {
        self.heap.lock().entries.first().map(|e| e.expires_at)
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.heap.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for ExpiryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Heap<T> {
    fn less(&self, a: usize, b: usize) -> bool {
        self.entries[a].expires_at < self.entries[b].expires_at
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.positions.insert(self.entries[a].key.clone(), a);
        self.positions.insert(self.entries[b].key.clone(), b);
    }

    /// Re-establish heap order for an entry whose expiry changed in either direction.
    fn fix(&mut self, index: usize) {
        if !self.sift_down(index) {
            self.sift_up(index);
        }
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    /// Returns `true` if the entry moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let len = self.entries.len();
        let mut index = start;

        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.less(right, left) {
                right
            } else {
                left
            };
            if !self.less(child, index) {
                break;
            }
            self.swap(index, child);
            index = child;
        }

        index > start
    }

    fn remove_at(&mut self, index: usize) -> Entry<T> {
        let entry = self.entries.swap_remove(index);
        self.positions.remove(&entry.key);

        if index < self.entries.len() {
            self.positions.insert(self.entries[index].key.clone(), index);
            self.fix(index);
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    fn at(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    fn drain(queue: &ExpiryQueue<u32>, now: Instant) -> Vec<String> {
        std::iter::from_fn(|| queue.pop_if_expired(now).map(|(k, _)| k)).collect()
    }

    #[test]
    fn test_pop_in_expiry_order() {
        let base = Instant::now();
        let queue = ExpiryQueue::new();

        queue.insert("c", at(base, 30), 3);
        queue.insert("a", at(base, 10), 1);
        queue.insert("b", at(base, 20), 2);

        assert_eq!(queue.len(), 3);
        assert_eq!(drain(&queue, at(base, 100)), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_leaves_unexpired_entries() {
        let base = Instant::now();
        let queue = ExpiryQueue::new();

        queue.insert("a", at(base, 10), 1);
        queue.insert("b", at(base, 20), 2);

        assert!(queue.pop_if_expired(at(base, 5)).is_none());
        assert_eq!(queue.len(), 2);

        // Expiry is inclusive
        assert_eq!(drain(&queue, at(base, 10)), vec!["a"]);
        assert_eq!(queue.peek_expiry(), Some(at(base, 20)));
    }

    #[test]
    fn test_update_expiry_later_and_earlier() {
        let base = Instant::now();
        let queue = ExpiryQueue::new();

        queue.insert("a", at(base, 10), 1);
        queue.insert("b", at(base, 20), 2);
        queue.insert("c", at(base, 30), 3);

        assert!(queue.update_expiry("a", at(base, 40), |_| true));
        assert_eq!(queue.peek_expiry(), Some(at(base, 20)));

        assert!(queue.update_expiry("c", at(base, 5), |_| true));
        assert_eq!(queue.peek_expiry(), Some(at(base, 5)));

        assert_eq!(drain(&queue, at(base, 100)), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_update_expiry_respects_identity_check() {
        let base = Instant::now();
        let queue = ExpiryQueue::new();

        queue.insert("a", at(base, 10), 7);

        assert!(!queue.update_expiry("a", at(base, 50), |item| *item == 8));
        assert_eq!(queue.peek_expiry(), Some(at(base, 10)));
        assert!(!queue.update_expiry("missing", at(base, 50), |_| true));
    }

    #[test]
    fn test_insert_existing_key_replaces_entry() {
        let base = Instant::now();
        let queue = ExpiryQueue::new();

        queue.insert("a", at(base, 10), 1);
        queue.insert("a", at(base, 20), 2);

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop_if_expired(at(base, 20)), Some(("a".to_string(), 2)));
    }

    #[test]
    fn test_minimum_tracks_randomized_updates() {
        let base = Instant::now();
        let queue = ExpiryQueue::new();
        let mut expected: HashMap<String, Instant> = HashMap::new();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for round in 0..2_000u32 {
            let key = format!("key-{}", rng.gen_range(0..64));
            let expires_at = at(base, rng.gen_range(0..10_000));

            if expected.contains_key(&key) && rng.gen_bool(0.7) {
                assert!(queue.update_expiry(&key, expires_at, |_| true));
            } else {
                queue.insert(&key, expires_at, round);
            }
            expected.insert(key, expires_at);

            if round % 50 == 0 {
                let cutoff = at(base, rng.gen_range(0..2_000));
                while let Some((k, _)) = queue.pop_if_expired(cutoff) {
                    let popped = expected.remove(&k).expect("popped key was tracked");
                    assert!(popped <= cutoff);
                }
                assert!(expected.values().all(|e| *e > cutoff));
            }

            assert_eq!(queue.len(), expected.len());
            assert_eq!(queue.peek_expiry(), expected.values().min().copied());
        }
    }
}
