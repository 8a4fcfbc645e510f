use std::collections::VecDeque;

use super::{Placement, Reject};
use crate::pool::Recyclable;
use crate::val::{Key, Value};

/// Double-ended queue addressed by logical integer index.
///
/// Keys run contiguously from `first`. Interior deletes leave tombstones that
/// are reclaimed once they reach either end, so both ends always hold a live
/// entry. With a `limit`, pushing past it evicts from the opposite end.
pub struct Ring {
    items: VecDeque<Option<Value>>,
    first: i64,
    live: usize,
    limit: Option<usize>,
    capacity: usize,
}

impl Ring {
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit.filter(|l| *l > 0);
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.live
    }

    /// Slot count including tombstones.
    pub fn span(&self) -> usize {
        self.items.len()
    }

    #[inline]
    fn end(&self) -> i64 {
        self.first + self.items.len() as i64
    }

    #[inline]
    fn offset(&self, key: &Key) -> Option<usize> {
        match key {
            Key::Int(k) if *k >= self.first && *k < self.end() => Some((*k - self.first) as usize),
            _ => None,
        }
    }

    pub fn place(&mut self, key: &Key, value: Value) -> Placement {
        let Key::Int(k) = *key else {
            return Placement::Rejected(value, Reject::Kind);
        };
        if let Some(off) = self.offset(key) {
            let old = self.items[off].replace(value);
            if old.is_none() {
                self.live += 1;
            }
            return Placement::Stored(old);
        }
        if k == self.end() || self.items.is_empty() {
            if self.items.is_empty() {
                self.first = k;
            }
            self.items.push_back(Some(value));
            self.live += 1;
            let evicted = if self.over_limit() { self.pop_front() } else { None };
            return Placement::Stored(evicted);
        }
        if k == self.first - 1 {
            self.items.push_front(Some(value));
            self.first -= 1;
            self.live += 1;
            let evicted = if self.over_limit() { self.pop_back() } else { None };
            return Placement::Stored(evicted);
        }
        Placement::Rejected(value, Reject::Kind)
    }

    #[inline]
    fn over_limit(&self) -> bool {
        self.limit.is_some_and(|l| self.live > l)
    }

    pub fn pop_front(&mut self) -> Option<Value> {
        let v = self.items.pop_front()?;
        self.first += 1;
        if v.is_some() {
            self.live -= 1;
        }
        self.trim();
        v
    }

    pub fn pop_back(&mut self) -> Option<Value> {
        let v = self.items.pop_back()?;
        if v.is_some() {
            self.live -= 1;
        }
        self.trim();
        v
    }

    fn trim(&mut self) {
        while let Some(None) = self.items.front() {
            self.items.pop_front();
            self.first += 1;
        }
        while let Some(None) = self.items.back() {
            self.items.pop_back();
        }
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.offset(key).and_then(|o| self.items[o].as_ref())
    }

    pub fn get_mut(&mut self, key: &Key) -> Option<&mut Value> {
        self.offset(key).and_then(move |o| self.items[o].as_mut())
    }

    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        let off = self.offset(key)?;
        let old = self.items[off].take()?;
        self.live -= 1;
        self.trim();
        Some(old)
    }

    pub fn first_key(&self) -> Option<Key> {
        (!self.items.is_empty()).then_some(Key::Int(self.first))
    }

    pub fn last_key(&self) -> Option<Key> {
        (!self.items.is_empty()).then(|| Key::Int(self.end() - 1))
    }

    pub fn next_key(&self, key: &Key) -> Option<Key> {
        let Key::Int(k) = *key else { return None };
        let start = if k < self.first { 0 } else { (k - self.first + 1) as usize };
        (start..self.items.len())
            .find(|i| self.items[*i].is_some())
            .map(|i| Key::Int(self.first + i as i64))
    }

    pub fn prev_key(&self, key: &Key) -> Option<Key> {
        let Key::Int(k) = *key else { return None };
        if k <= self.first {
            return None;
        }
        let end = ((k - self.first) as usize).min(self.items.len());
        self.items
            .range(..end)
            .rposition(Option::is_some)
            .map(|i| Key::Int(self.first + i as i64))
    }

    pub fn drain_entries(&mut self) -> Vec<(Key, Value)> {
        let first = self.first;
        let out = self
            .items
            .drain(..)
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (Key::Int(first + i as i64), v)))
            .collect();
        self.live = 0;
        out
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.items.iter().flatten()
    }

    pub fn entries(&self) -> impl Iterator<Item = (Key, &Value)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (Key::Int(self.first + i as i64), v)))
    }

    /// Same span and tombstones as `self`, filled with `values` in order.
    pub fn rebuild_like(&self, mut target: Ring, values: Vec<Value>) -> Ring {
        let mut values = values.into_iter();
        target.first = self.first;
        target.limit = self.limit;
        for slot in &self.items {
            let v = if slot.is_some() { values.next() } else { None };
            if v.is_some() {
                target.live += 1;
            }
            target.items.push_back(v);
        }
        target
    }
}

impl Recyclable for Ring {
    fn fresh(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            first: 0,
            live: 0,
            limit: None,
            capacity,
        }
    }

    fn pooled_capacity(&self) -> usize {
        self.capacity
    }

    fn drain_values(&mut self, sink: &mut Vec<Value>) {
        sink.extend(self.items.drain(..).flatten());
        self.first = 0;
        self.live = 0;
        self.limit = None;
    }
}
