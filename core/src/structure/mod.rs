//! Adaptive containers behind one navigation interface.
//!
//! A [`DynStruct`] always holds the most specific representation that fits the
//! keys inserted so far. Inserting a key the current representation cannot hold
//! migrates the contents into a more general one; `Mixed` accepts everything and
//! never migrates back.

use std::sync::Arc;

use tracing::debug;

use crate::pool::{MAX_BUCKET, Pool};
use crate::val::{Key, Value, ValueFlags};

mod dense;
mod ring;
mod table;


pub use dense::{DENSE_LIMIT, Dense};
pub use ring::Ring;
pub use table::SortedTable;

pub type Keyed = SortedTable<Arc<str>>;
pub type Mixed = SortedTable<Key>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    Dense,
    Keyed,
    Mixed,
    Ring,
}

/// Why a representation refused a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reject {
    /// The key kind does not fit; a more general layout is needed.
    Kind,
    /// Same layout, but at least this many slots are needed.
    Capacity(usize),
}

pub enum Placement {
    /// Stored; carries the displaced or evicted value, if any.
    Stored(Option<Value>),
    Rejected(Value, Reject),
}

pub struct StructPools {
    pub dense: Pool<Dense>,
    pub keyed: Pool<Keyed>,
    pub mixed: Pool<Mixed>,
    pub ring: Pool<Ring>,
}

impl Default for StructPools {
    fn default() -> Self {
        Self {
            dense: Pool::new("dense"),
            keyed: Pool::new("keyed"),
            mixed: Pool::new("mixed"),
            ring: Pool::new("ring"),
        }
    }
}

enum Repr {
    Dense(Dense),
    Keyed(Keyed),
    Mixed(Mixed),
    Ring(Ring),
}

/// Indirection handle over the live representation.
pub struct DynStruct {
    repr: Repr,
    migrations: u32,
}

const MAX_PLACE_ATTEMPTS: usize = 4;

impl DynStruct {
    /// `capacity` is a hint; anything past [`MAX_BUCKET`] grows on demand.
    pub fn new(pools: &mut StructPools, capacity: usize) -> Self {
        Self {
            repr: Repr::Dense(pools.dense.checkout(capacity.min(MAX_BUCKET))),
            migrations: 0,
        }
    }

    /// Queue layout; `limit` of zero means unbounded.
    pub fn queue(pools: &mut StructPools, limit: usize) -> Self {
        let mut ring = pools.ring.checkout(limit.min(MAX_BUCKET));
        ring.set_limit(Some(limit));
        Self {
            repr: Repr::Ring(ring),
            migrations: 0,
        }
    }

    pub fn layout(&self) -> Layout {
        match self.repr {
            Repr::Dense(_) => Layout::Dense,
            Repr::Keyed(_) => Layout::Keyed,
            Repr::Mixed(_) => Layout::Mixed,
            Repr::Ring(_) => Layout::Ring,
        }
    }

    /// Number of representation changes so far.
    pub fn migrations(&self) -> u32 {
        self.migrations
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Dense(d) => d.len(),
            Repr::Keyed(t) => t.len(),
            Repr::Mixed(t) => t.len(),
            Repr::Ring(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn place(&mut self, key: &Key, value: Value) -> Placement {
        match &mut self.repr {
            Repr::Dense(d) => d.place(key, value),
            Repr::Keyed(t) => match key {
                Key::Str(s) => Placement::Stored(t.insert(s.clone(), value)),
                _ => Placement::Rejected(value, Reject::Kind),
            },
            Repr::Mixed(t) => Placement::Stored(t.insert(key.clone(), value)),
            Repr::Ring(r) => r.place(key, value),
        }
    }

    /// Insert or overwrite. Returns the displaced (or evicted) value, which the
    /// caller must dispose.
    pub fn set_child(&mut self, pools: &mut StructPools, key: Key, value: Value) -> Option<Value> {
        let mut value = value.with_flags(ValueFlags::IS_CHILD);
        for _ in 0..MAX_PLACE_ATTEMPTS {
            match self.place(&key, value) {
                Placement::Stored(displaced) => return displaced.map(Self::detach),
                Placement::Rejected(back, Reject::Capacity(needed)) => {
                    value = back;
                    self.grow(pools, needed);
                }
                Placement::Rejected(back, Reject::Kind) => {
                    value = back;
                    let target = self.widen_target(&key);
                    self.migrate(pools, target);
                }
            }
        }
        // unreachable in practice: two widenings always end in `Mixed`
        if self.layout() != Layout::Mixed {
            self.migrate(pools, Layout::Mixed);
        }
        match &mut self.repr {
            Repr::Mixed(t) => t.insert(key, value).map(Self::detach),
            _ => Some(value),
        }
    }

    fn detach(mut value: Value) -> Value {
        value.clear_flag(ValueFlags::IS_CHILD);
        value
    }

    fn widen_target(&self, key: &Key) -> Layout {
        match (&self.repr, key) {
            (Repr::Dense(d), Key::Str(_)) if d.len() == 0 => Layout::Keyed,
            _ => Layout::Mixed,
        }
    }

    fn grow(&mut self, pools: &mut StructPools, needed: usize) {
        if let Repr::Dense(d) = &mut self.repr {
            let mut bigger = pools.dense.checkout(needed);
            for (key, value) in d.drain_entries() {
                // capacity was checked above; storing cannot be rejected
                let _ = bigger.place(&key, value);
            }
            let old = std::mem::replace(d, bigger);
            pools.dense.checkin(old, &mut Vec::new());
            debug!(target: "ember::vm::struct", capacity = needed, "dense growth");
        }
    }

    fn migrate(&mut self, pools: &mut StructPools, target: Layout) {
        let from = self.layout();
        let entries = self.drain_entries();
        let repr = match target {
            Layout::Keyed => {
                let mut t = pools.keyed.checkout(entries.len());
                for (k, v) in entries {
                    if let Key::Str(s) = k {
                        t.insert(s, v);
                    }
                }
                Repr::Keyed(t)
            }
            _ => {
                let mut t = pools.mixed.checkout(entries.len());
                for (k, v) in entries {
                    t.insert(k, v);
                }
                Repr::Mixed(t)
            }
        };
        let old = std::mem::replace(&mut self.repr, repr);
        Self::release_repr(old, pools, &mut Vec::new());
        self.migrations += 1;
        debug!(target: "ember::vm::struct", ?from, to = ?target, len = self.len(), "structure migrated");
    }

    fn release_repr(repr: Repr, pools: &mut StructPools, sink: &mut Vec<Value>) {
        match repr {
            Repr::Dense(d) => pools.dense.checkin(d, sink),
            Repr::Keyed(t) => pools.keyed.checkin(t, sink),
            Repr::Mixed(t) => pools.mixed.checkin(t, sink),
            Repr::Ring(r) => pools.ring.checkin(r, sink),
        }
    }

    /// Return the backing storage to its pool; held values go to `sink`.
    pub fn recycle(self, pools: &mut StructPools, sink: &mut Vec<Value>) {
        Self::release_repr(self.repr, pools, sink);
    }

    pub fn get_child(&self, key: &Key) -> Option<&Value> {
        match (&self.repr, key) {
            (Repr::Dense(d), _) => d.get(key),
            (Repr::Keyed(t), Key::Str(s)) => t.get(s),
            (Repr::Keyed(_), _) => None,
            (Repr::Mixed(t), _) => t.get(key),
            (Repr::Ring(r), _) => r.get(key),
        }
    }

    pub fn get_child_mut(&mut self, key: &Key) -> Option<&mut Value> {
        match (&mut self.repr, key) {
            (Repr::Dense(d), _) => d.get_mut(key),
            (Repr::Keyed(t), Key::Str(s)) => t.get_mut(s),
            (Repr::Keyed(_), _) => None,
            (Repr::Mixed(t), _) => t.get_mut(key),
            (Repr::Ring(r), _) => r.get_mut(key),
        }
    }

    pub fn has_child(&self, key: &Key) -> bool {
        self.get_child(key).is_some()
    }

    /// Remove an entry and hand ownership of it back.
    pub fn delete_child(&mut self, key: &Key) -> Option<Value> {
        let removed = match (&mut self.repr, key) {
            (Repr::Dense(d), _) => d.remove(key),
            (Repr::Keyed(t), Key::Str(s)) => t.remove(s),
            (Repr::Keyed(_), _) => None,
            (Repr::Mixed(t), _) => t.remove(key),
            (Repr::Ring(r), _) => r.remove(key),
        };
        removed.map(Self::detach)
    }

    pub fn first_key(&mut self) -> Option<Key> {
        match &mut self.repr {
            Repr::Dense(d) => d.first_key(),
            Repr::Keyed(t) => t.first_key().map(Key::Str),
            Repr::Mixed(t) => t.first_key(),
            Repr::Ring(r) => r.first_key(),
        }
    }

    pub fn last_key(&mut self) -> Option<Key> {
        match &mut self.repr {
            Repr::Dense(d) => d.last_key(),
            Repr::Keyed(t) => t.last_key().map(Key::Str),
            Repr::Mixed(t) => t.last_key(),
            Repr::Ring(r) => r.last_key(),
        }
    }

    pub fn next_key(&mut self, key: &Key) -> Option<Key> {
        match (&mut self.repr, key) {
            (Repr::Dense(d), _) => d.next_key(key),
            (Repr::Keyed(t), Key::Str(s)) => t.next_key(s).map(Key::Str),
            (Repr::Keyed(t), _) => {
                // every string sorts after non-string keys of lower rank
                if *key < Key::str("") { t.first_key().map(Key::Str) } else { None }
            }
            (Repr::Mixed(t), _) => t.next_key(key),
            (Repr::Ring(r), _) => r.next_key(key),
        }
    }

    pub fn prev_key(&mut self, key: &Key) -> Option<Key> {
        match (&mut self.repr, key) {
            (Repr::Dense(d), _) => d.prev_key(key),
            (Repr::Keyed(t), Key::Str(s)) => t.prev_key(s).map(Key::Str),
            (Repr::Keyed(t), _) => {
                if *key > Key::str("") { t.last_key().map(Key::Str) } else { None }
            }
            (Repr::Mixed(t), _) => t.prev_key(key),
            (Repr::Ring(r), _) => r.prev_key(key),
        }
    }

    /// Key used by `Append`: one past the largest integer key.
    pub fn append_key(&mut self) -> Key {
        match &mut self.repr {
            Repr::Dense(d) => Key::Int(d.last_key().and_then(|k| k.as_int()).map_or(0, |k| k + 1)),
            Repr::Ring(r) => Key::Int(r.last_key().and_then(|k| k.as_int()).map_or(0, |k| k + 1)),
            Repr::Keyed(_) => Key::Int(0),
            Repr::Mixed(t) => {
                let keys = t.keys();
                let top = keys.iter().rev().find_map(Key::as_int);
                Key::Int(top.map_or(0, |k| k.saturating_add(1)))
            }
        }
    }

    /// Key used by `Prepend`: one below the smallest integer key.
    pub fn prepend_key(&mut self) -> Key {
        match &mut self.repr {
            Repr::Dense(d) => Key::Int(d.first_key().and_then(|k| k.as_int()).map_or(0, |k| k - 1)),
            Repr::Ring(r) => Key::Int(r.first_key().and_then(|k| k.as_int()).map_or(0, |k| k - 1)),
            Repr::Keyed(_) => Key::Int(0),
            Repr::Mixed(t) => {
                let keys = t.keys();
                let low = keys.iter().find_map(Key::as_int);
                Key::Int(low.map_or(0, |k| k.saturating_sub(1)))
            }
        }
    }

    /// Keys in navigation order.
    pub fn keys(&mut self) -> Vec<Key> {
        match &mut self.repr {
            Repr::Dense(d) => d.entries().map(|(k, _)| k).collect(),
            Repr::Keyed(t) => t.keys().into_iter().map(Key::Str).collect(),
            Repr::Mixed(t) => t.keys(),
            Repr::Ring(r) => r.entries().map(|(k, _)| k).collect(),
        }
    }

    /// Entries sorted by key, without touching the cached index.
    pub fn sorted_entries(&self) -> Vec<(Key, &Value)> {
        let mut out: Vec<(Key, &Value)> = match &self.repr {
            Repr::Dense(d) => return d.entries().collect(),
            Repr::Ring(r) => return r.entries().collect(),
            Repr::Keyed(t) => t.entries().map(|(k, v)| (Key::Str(k.clone()), v)).collect(),
            Repr::Mixed(t) => t.entries().map(|(k, v)| (k.clone(), v)).collect(),
        };
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Values in storage order, matching what [`DynStruct::rebuild_like`] consumes.
    pub fn values(&self) -> Vec<&Value> {
        match &self.repr {
            Repr::Dense(d) => d.values().collect(),
            Repr::Keyed(t) => t.values().collect(),
            Repr::Mixed(t) => t.values().collect(),
            Repr::Ring(r) => r.values().collect(),
        }
    }

    /// New structure with this one's layout and keys, holding `values`.
    pub fn rebuild_like(&self, pools: &mut StructPools, values: Vec<Value>) -> DynStruct {
        let values = values.into_iter().map(|v| v.with_flags(ValueFlags::IS_CHILD)).collect();
        let repr = match &self.repr {
            Repr::Dense(d) => Repr::Dense(d.rebuild_like(pools.dense.checkout(d.capacity()), values)),
            Repr::Keyed(t) => Repr::Keyed(t.rebuild_like(pools.keyed.checkout(t.len()), values)),
            Repr::Mixed(t) => Repr::Mixed(t.rebuild_like(pools.mixed.checkout(t.len()), values)),
            Repr::Ring(r) => Repr::Ring(r.rebuild_like(pools.ring.checkout(r.span()), values)),
        };
        DynStruct {
            repr,
            migrations: self.migrations,
        }
    }

    fn drain_entries(&mut self) -> Vec<(Key, Value)> {
        match &mut self.repr {
            Repr::Dense(d) => d.drain_entries(),
            Repr::Keyed(t) => t.drain_entries().into_iter().map(|(k, v)| (Key::Str(k), v)).collect(),
            Repr::Mixed(t) => t.drain_entries(),
            Repr::Ring(r) => r.drain_entries(),
        }
    }

    /// Detach the front entry (by key order).
    pub fn pop_front(&mut self) -> Option<Value> {
        if let Repr::Ring(r) = &mut self.repr {
            return r.pop_front().map(Self::detach);
        }
        let key = self.first_key()?;
        self.delete_child(&key)
    }

    pub fn pop_back(&mut self) -> Option<Value> {
        if let Repr::Ring(r) = &mut self.repr {
            return r.pop_back().map(Self::detach);
        }
        let key = self.last_key()?;
        self.delete_child(&key)
    }
}
