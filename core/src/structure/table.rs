use std::hash::Hash;

use crate::pool::Recyclable;
use crate::util::fast_map::{FastHashMap, fast_hash_map_with_capacity};
use crate::val::Value;

/// Hash map with a sorted key index rebuilt lazily after key-set changes.
///
/// Overwrites keep the index; inserts of new keys and removals mark it stale.
pub struct SortedTable<K> {
    map: FastHashMap<K, Value>,
    order: Vec<K>,
    stale: bool,
    capacity: usize,
}

impl<K: Ord + Hash + Clone> SortedTable<K> {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn insert(&mut self, key: K, value: Value) -> Option<Value> {
        let old = self.map.insert(key, value);
        if old.is_none() {
            self.stale = true;
        }
        old
    }

    pub fn get(&self, key: &K) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut Value> {
        self.map.get_mut(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<Value> {
        let old = self.map.remove(key);
        if old.is_some() {
            self.stale = true;
        }
        old
    }

    fn sorted(&mut self) -> &[K] {
        if self.stale {
            self.order.clear();
            self.order.extend(self.map.keys().cloned());
            self.order.sort_unstable();
            self.stale = false;
        }
        &self.order
    }

    /// Whether the sorted index is current; exposed for tests.
    pub fn is_index_fresh(&self) -> bool {
        !self.stale
    }

    pub fn first_key(&mut self) -> Option<K> {
        self.sorted().first().cloned()
    }

    pub fn last_key(&mut self) -> Option<K> {
        self.sorted().last().cloned()
    }

    pub fn next_key(&mut self, key: &K) -> Option<K> {
        let order = self.sorted();
        let idx = order.partition_point(|k| k <= key);
        order.get(idx).cloned()
    }

    pub fn prev_key(&mut self, key: &K) -> Option<K> {
        let order = self.sorted();
        let idx = order.partition_point(|k| k < key);
        idx.checked_sub(1).map(|i| order[i].clone())
    }

    /// Keys in ascending order.
    pub fn keys(&mut self) -> Vec<K> {
        self.sorted().to_vec()
    }

    pub fn drain_entries(&mut self) -> Vec<(K, Value)> {
        self.order.clear();
        self.stale = false;
        self.map.drain().collect()
    }

    /// Entries in the map's storage order.
    pub fn entries(&self) -> impl Iterator<Item = (&K, &Value)> {
        self.map.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.map.values()
    }

    /// Same keys as `self`, paired with `values` given in storage order.
    pub fn rebuild_like(&self, mut target: SortedTable<K>, values: Vec<Value>) -> SortedTable<K> {
        for (key, value) in self.map.keys().zip(values) {
            target.insert(key.clone(), value);
        }
        target
    }
}

impl<K: Ord + Hash + Clone> Recyclable for SortedTable<K> {
    fn fresh(capacity: usize) -> Self {
        Self {
            map: fast_hash_map_with_capacity(capacity),
            order: Vec::with_capacity(capacity),
            stale: false,
            capacity,
        }
    }

    fn pooled_capacity(&self) -> usize {
        self.capacity
    }

    fn drain_values(&mut self, sink: &mut Vec<Value>) {
        sink.extend(self.map.drain().map(|(_, v)| v));
        self.order.clear();
        self.stale = false;
    }
}
