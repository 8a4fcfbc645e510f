use super::{Placement, Reject};
use crate::pool::Recyclable;
use crate::val::{Key, Value};

/// Largest integer key a dense structure holds before widening.
pub const DENSE_LIMIT: i64 = 1 << 16;

/// Integer keys `0..capacity` stored by position.
pub struct Dense {
    slots: Vec<Option<Value>>,
    len: usize,
    /// Highest occupied index.
    high: Option<usize>,
}

impl Dense {
    #[inline]
    fn index(key: &Key) -> Option<usize> {
        match key {
            Key::Int(k) if (0..DENSE_LIMIT).contains(k) => Some(*k as usize),
            _ => None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn place(&mut self, key: &Key, value: Value) -> Placement {
        let Some(idx) = Self::index(key) else {
            return Placement::Rejected(value, Reject::Kind);
        };
        if idx >= self.slots.len() {
            let wanted = (idx + 1).max(self.slots.len() * 2);
            return Placement::Rejected(value, Reject::Capacity(wanted));
        }
        let old = self.slots[idx].replace(value);
        if old.is_none() {
            self.len += 1;
        }
        if self.high.is_none_or(|h| idx > h) {
            self.high = Some(idx);
        }
        Placement::Stored(old)
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        Self::index(key).and_then(|i| self.slots.get(i)).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, key: &Key) -> Option<&mut Value> {
        Self::index(key).and_then(|i| self.slots.get_mut(i)).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        let idx = Self::index(key)?;
        let old = self.slots.get_mut(idx)?.take()?;
        self.len -= 1;
        if self.high == Some(idx) {
            self.high = self.slots[..idx].iter().rposition(Option::is_some);
        }
        Some(old)
    }

    pub fn first_key(&self) -> Option<Key> {
        if self.len == 0 {
            return None;
        }
        self.slots.iter().position(Option::is_some).map(|i| Key::Int(i as i64))
    }

    pub fn last_key(&self) -> Option<Key> {
        self.high.map(|i| Key::Int(i as i64))
    }

    pub fn next_key(&self, key: &Key) -> Option<Key> {
        let start = match key {
            Key::Int(k) if *k < 0 => 0,
            Key::Int(k) => (*k as usize).saturating_add(1),
            _ => return None,
        };
        let high = self.high?;
        (start..=high)
            .find(|i| self.slots[*i].is_some())
            .map(|i| Key::Int(i as i64))
    }

    pub fn prev_key(&self, key: &Key) -> Option<Key> {
        let end = match key {
            Key::Int(k) if *k <= 0 => return None,
            Key::Int(k) => (*k as usize).min(self.slots.len()),
            _ => return None,
        };
        self.slots[..end].iter().rposition(Option::is_some).map(|i| Key::Int(i as i64))
    }

    /// Move every entry out in key order.
    pub fn drain_entries(&mut self) -> Vec<(Key, Value)> {
        let mut out = Vec::with_capacity(self.len);
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(v) = slot.take() {
                out.push((Key::Int(i as i64), v));
            }
        }
        self.len = 0;
        self.high = None;
        out
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.slots.iter().flatten()
    }

    pub fn entries(&self) -> impl Iterator<Item = (Key, &Value)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (Key::Int(i as i64), v)))
    }

    /// Same slot layout, filled with `values` in storage order.
    pub fn rebuild_like(&self, mut target: Dense, values: Vec<Value>) -> Dense {
        let mut values = values.into_iter();
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.is_some()
                && let Some(v) = values.next()
            {
                target.slots[i] = Some(v);
                target.len += 1;
                target.high = Some(i);
            }
        }
        target
    }
}

impl Recyclable for Dense {
    fn fresh(capacity: usize) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            len: 0,
            high: None,
        }
    }

    fn pooled_capacity(&self) -> usize {
        self.slots.len()
    }

    fn drain_values(&mut self, sink: &mut Vec<Value>) {
        if self.len > 0 {
            sink.extend(self.slots.iter_mut().filter_map(Option::take));
        }
        self.len = 0;
        self.high = None;
    }
}
