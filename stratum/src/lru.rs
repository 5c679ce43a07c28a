//! Fixed-capacity cache ordered by recency of access.
//!
//! Entries live in a slab of nodes linked into a doubly linked list, most
//! recently used at the head; a `HashMap` indexes the slab by key. `get` and
//! `put` are O(1).

use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
pub struct LruCache<K, V> {
    index: HashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    capacity: NonZeroUsize,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            index: HashMap::with_capacity(capacity.get()),
            slots: Vec::with_capacity(capacity.get()),
            free: Vec::new(),
            head: None,
            tail: None,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Returns the value for `key` and marks it most recently used.
    /// A miss leaves the cache untouched.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.touch(idx);
        Some(&self.node(idx).value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let idx = *self.index.get(key)?;
        self.touch(idx);
        Some(&mut self.node_mut(idx).value)
    }

    /// Looks up `key` without changing its recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        Some(&self.node(idx).value)
    }

    pub fn peek_mut(&mut self, key: &K) -> Option<&mut V> {
        let idx = *self.index.get(key)?;
        Some(&mut self.node_mut(idx).value)
    }

    /// Inserts or updates `key` and marks it most recently used.
    ///
    /// Returns the value of the least recently used entry when this insertion
    /// pushed the cache over capacity. The entry just inserted is never the
    /// one evicted.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&idx) = self.index.get(&key) {
            self.node_mut(idx).value = value;
            self.touch(idx);
            return None;
        }
        self.link_new(key, value);
        self.evict_over_capacity()
    }

    /// Returns the entry for `key` marked most recently used, inserting the
    /// value produced by `load` on a miss. A failed `load` leaves the cache
    /// untouched. As with [`put`](Self::put), an insertion that pushes the
    /// cache over capacity evicts the least recently used entry and returns
    /// its value alongside.
    pub fn get_or_try_insert_with<E, F>(
        &mut self,
        key: K,
        load: F,
    ) -> Result<(&mut V, Option<V>), E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(&idx) = self.index.get(&key) {
            self.touch(idx);
            return Ok((&mut self.node_mut(idx).value, None));
        }
        let value = load()?;
        let idx = self.link_new(key, value);
        let evicted = self.evict_over_capacity();
        Ok((&mut self.node_mut(idx).value, evicted))
    }

    /// Inserts `key` at the least recently used end, so it is the next
    /// entry [`pop_lru`](Self::pop_lru) returns. Nothing is evicted: the
    /// value is handed back when `key` is already present or the cache is
    /// full.
    pub fn push_lru(&mut self, key: K, value: V) -> Option<V> {
        if self.index.contains_key(&key) || self.index.len() >= self.capacity.get() {
            return Some(value);
        }
        let idx = self.link_new(key, value);
        self.unlink(idx);
        self.push_back(idx);
        None
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = *self.index.get(key)?;
        Some(self.remove_slot(idx).1)
    }

    /// Removes and returns the least recently used entry.
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        let idx = self.tail?;
        Some(self.remove_slot(idx))
    }

    /// Removes and returns the least recently used entry accepted by `pred`.
    pub fn pop_lru_where<F>(&mut self, mut pred: F) -> Option<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut cursor = self.tail;
        while let Some(idx) = cursor {
            let node = self.node(idx);
            if pred(&node.key, &node.value) {
                return Some(self.remove_slot(idx));
            }
            cursor = node.prev;
        }
        None
    }

    /// Entries from most to least recently used.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            cache: self,
            cursor: self.head,
        }
    }

    /// Mutable access to every entry in slab order, which is stable while
    /// no entry is inserted or removed. Recency is not changed.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.as_mut())
            .map(|node| (&node.key, &mut node.value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }

    /// Stores a new entry at the head of the recency list.
    fn link_new(&mut self, key: K, value: V) -> usize {
        let node = Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
        idx
    }

    fn evict_over_capacity(&mut self) -> Option<V> {
        if self.index.len() <= self.capacity.get() {
            return None;
        }
        // The newest entry sits at the head and at least two entries are
        // resident, so the tail is never the entry just linked.
        let victim = self.tail?;
        Some(self.remove_slot(victim).1)
    }

    fn node(&self, idx: usize) -> &Node<K, V> {
        self.slots[idx].as_ref().expect("linked LRU slot is vacant")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<K, V> {
        self.slots[idx].as_mut().expect("linked LRU slot is vacant")
    }

    fn touch(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node_mut(idx);
            let links = (node.prev, node.next);
            node.prev = None;
            node.next = None;
            links
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(idx);
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(h) => self.node_mut(h).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn push_back(&mut self, idx: usize) {
        let old_tail = self.tail;
        {
            let node = self.node_mut(idx);
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(t) => self.node_mut(t).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn remove_slot(&mut self, idx: usize) -> (K, V) {
        self.unlink(idx);
        let node = self.slots[idx].take().expect("linked LRU slot is vacant");
        self.free.push(idx);
        self.index.remove(&node.key);
        (node.key, node.value)
    }
}

/// Iterator over cache entries from most to least recently used.
pub struct Iter<'a, K, V> {
    cache: &'a LruCache<K, V>,
    cursor: Option<usize>,
}

impl<'a, K: Hash + Eq + Clone, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let node = self.cache.node(idx);
        self.cursor = node.next;
        Some((&node.key, &node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    fn cache<V>(capacity: usize) -> LruCache<i32, V> {
        LruCache::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn test_capacity_one_scenario() {
        let mut cache = cache(1);
        assert_eq!(cache.put(1, 2), None);
        assert_eq!(cache.get(&1), Some(&2));
        assert_eq!(cache.put(2, 3), Some(2));
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(&3));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_refreshes_recency() {
        let mut cache = cache(2);
        cache.put(1, "a");
        cache.put(2, "b");
        cache.get(&1);
        assert_eq!(cache.put(3, "c"), Some("b"));
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
    }

    #[test]
    fn test_update_existing_key_never_evicts() {
        let mut cache = cache(2);
        cache.put(1, 10);
        cache.put(2, 20);
        assert_eq!(cache.put(1, 11), None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.peek(&1), Some(&11));
        // 1 was refreshed by the update, so 2 is now least recent.
        assert_eq!(cache.put(3, 30), Some(20));
    }

    #[test]
    fn test_repeated_puts_keep_hot_key() {
        let mut cache = cache(2);
        for key in [1, 2, 1, 3, 1, 4, 1, 5, 1] {
            cache.put(key, 2);
            assert!(cache.len() <= 2);
        }
        cache.get(&1);
        let keys: Vec<_> = cache.keys().copied().collect();
        assert_eq!(keys, vec![1, 5]);
    }

    #[test]
    fn test_miss_has_no_side_effects() {
        let mut cache = cache(2);
        cache.put(1, 1);
        cache.put(2, 2);
        assert_eq!(cache.get(&9), None);
        let keys: Vec<_> = cache.keys().copied().collect();
        assert_eq!(keys, vec![2, 1]);
    }

    #[test]
    fn test_peek_does_not_touch() {
        let mut cache = cache(2);
        cache.put(1, 1);
        cache.put(2, 2);
        assert_eq!(cache.peek(&1), Some(&1));
        *cache.peek_mut(&1).unwrap() = 100;
        assert_eq!(cache.put(3, 3), Some(100));
    }

    #[test]
    fn test_pop_lru_where_skips_rejected_entries() {
        let mut cache = cache(4);
        for key in 1..=4 {
            cache.put(key, key * 10);
        }
        let popped = cache.pop_lru_where(|_, v| *v % 20 == 0);
        assert_eq!(popped, Some((2, 20)));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.pop_lru_where(|_, v| *v > 1000), None);
        assert_eq!(cache.pop_lru(), Some((1, 10)));
    }

    #[test]
    fn test_remove_and_slot_reuse() {
        let mut cache = cache(3);
        cache.put(1, 1);
        cache.put(2, 2);
        cache.put(3, 3);
        assert_eq!(cache.remove(&2), Some(2));
        assert_eq!(cache.remove(&2), None);
        cache.put(4, 4);
        assert_eq!(cache.len(), 3);
        let keys: Vec<_> = cache.keys().copied().collect();
        assert_eq!(keys, vec![4, 3, 1]);
    }

    #[test]
    fn test_iter_mut_visits_every_entry() {
        let mut cache = cache(3);
        cache.put(1, 1);
        cache.put(2, 2);
        cache.put(3, 3);
        for (_, value) in cache.iter_mut() {
            *value *= 10;
        }
        let mut values: Vec<_> = cache.values().copied().collect();
        values.sort();
        assert_eq!(values, vec![10, 20, 30]);
        // Recency order is untouched by iter_mut.
        let keys: Vec<_> = cache.keys().copied().collect();
        assert_eq!(keys, vec![3, 2, 1]);
    }

    #[test]
    fn test_get_or_try_insert_with() {
        let mut cache = cache(2);
        cache.put(1, 10);

        let (value, evicted) = cache
            .get_or_try_insert_with(1, || Err::<i32, &str>("not called"))
            .unwrap();
        assert_eq!((*value, evicted), (10, None));

        let err = cache.get_or_try_insert_with(2, || Err::<i32, &str>("io")).unwrap_err();
        assert_eq!(err, "io");
        assert_eq!(cache.len(), 1);

        let (value, evicted) = cache.get_or_try_insert_with(2, || Ok::<_, ()>(20)).unwrap();
        *value += 1;
        assert_eq!(evicted, None);
        assert_eq!(cache.peek(&2), Some(&21));

        let (_, evicted) = cache.get_or_try_insert_with(3, || Ok::<_, ()>(30)).unwrap();
        assert_eq!(evicted, Some(10));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_push_lru_goes_to_the_tail() {
        let mut cache = cache(3);
        cache.put(1, 10);
        cache.put(2, 20);
        assert_eq!(cache.push_lru(3, 30), None);
        let keys: Vec<_> = cache.keys().copied().collect();
        assert_eq!(keys, vec![2, 1, 3]);

        // Full, and an existing key: both refused without eviction
        assert_eq!(cache.push_lru(4, 40), Some(40));
        assert_eq!(cache.push_lru(1, 11), Some(11));
        assert_eq!(cache.peek(&1), Some(&10));
        assert_eq!(cache.pop_lru(), Some((3, 30)));
    }

    #[test]
    fn test_push_lru_into_empty_cache() {
        let mut cache = cache(2);
        assert_eq!(cache.push_lru(1, 1), None);
        cache.put(2, 2);
        assert_eq!(cache.put(3, 3), Some(1));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Get(i32),
        Put(i32, i32),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..8i32).prop_map(Op::Get),
            (0..8i32, any::<i32>()).prop_map(|(k, v)| Op::Put(k, v)),
        ]
    }

    proptest! {
        // Compares against a naive model: a deque ordered MRU first.
        #[test]
        fn prop_matches_reference_model(
            capacity in 1usize..5,
            ops in proptest::collection::vec(op_strategy(), 0..64),
        ) {
            let mut cache = cache(capacity);
            let mut model: VecDeque<(i32, i32)> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Get(k) => {
                        let expected = model.iter().position(|(mk, _)| *mk == k).map(|pos| {
                            let entry = model.remove(pos).unwrap();
                            model.push_front(entry);
                            entry.1
                        });
                        prop_assert_eq!(cache.get(&k).copied(), expected);
                    }
                    Op::Put(k, v) => {
                        let mut expected = None;
                        if let Some(pos) = model.iter().position(|(mk, _)| *mk == k) {
                            model.remove(pos);
                            model.push_front((k, v));
                        } else {
                            model.push_front((k, v));
                            if model.len() > capacity {
                                expected = model.pop_back().map(|(_, ev)| ev);
                            }
                        }
                        prop_assert_eq!(cache.put(k, v), expected);
                    }
                }
                prop_assert!(cache.len() <= capacity);
                let keys: Vec<i32> = cache.keys().copied().collect();
                let model_keys: Vec<i32> = model.iter().map(|(k, _)| *k).collect();
                prop_assert_eq!(keys, model_keys);
            }
        }
    }
}
