//! Capacity-bucketed recycling of heap-backed objects.
//!
//! Buckets are powers of two between [`MIN_BUCKET`] and [`MAX_BUCKET`].
//! Requests above the largest bucket bypass pooling entirely.

use tracing::trace;

use crate::val::Value;

mod copy;
mod heap;


pub use heap::{External, Heap, HeapObject, HeapStats, Pools};

pub const MIN_BUCKET: usize = 4;
pub const MAX_BUCKET: usize = 4096;
const BUCKET_COUNT: usize = (MAX_BUCKET.trailing_zeros() - MIN_BUCKET.trailing_zeros() + 1) as usize;
/// Idle objects retained per bucket.
const BUCKET_DEPTH: usize = 64;

/// Objects that can be parked in a [`Pool`].
pub trait Recyclable {
    /// Build an empty object able to hold `capacity` entries.
    fn fresh(capacity: usize) -> Self;
    /// Capacity the object was created with.
    fn pooled_capacity(&self) -> usize;
    /// Move every value still held into `sink` and leave the object empty.
    fn drain_values(&mut self, sink: &mut Vec<Value>);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub fresh: u64,
    pub recycled: u64,
    pub returned: u64,
    pub bypassed: u64,
}

pub struct Pool<T> {
    label: &'static str,
    buckets: Vec<Vec<T>>,
    stats: PoolStats,
}

impl<T: Recyclable> Pool<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
            stats: PoolStats::default(),
        }
    }

    /// Bucket size serving a request, or `None` when it must bypass the pool.
    pub fn bucket_size(capacity: usize) -> Option<usize> {
        let size = capacity.max(MIN_BUCKET).checked_next_power_of_two()?;
        (size <= MAX_BUCKET).then_some(size)
    }

    #[inline]
    fn bucket_index(size: usize) -> usize {
        (size.trailing_zeros() - MIN_BUCKET.trailing_zeros()) as usize
    }

    pub fn checkout(&mut self, capacity: usize) -> T {
        let Some(size) = Self::bucket_size(capacity) else {
            self.stats.bypassed += 1;
            trace!(target: "ember::vm::pool", pool = self.label, capacity, "bypass");
            return T::fresh(capacity);
        };
        match self.buckets[Self::bucket_index(size)].pop() {
            Some(object) => {
                self.stats.recycled += 1;
                trace!(target: "ember::vm::pool", pool = self.label, size, "recycled checkout");
                object
            }
            None => {
                self.stats.fresh += 1;
                trace!(target: "ember::vm::pool", pool = self.label, size, "fresh checkout");
                T::fresh(size)
            }
        }
    }

    /// Return an object. Held values go to `sink` for the caller to dispose.
    pub fn checkin(&mut self, mut object: T, sink: &mut Vec<Value>) {
        object.drain_values(sink);
        let capacity = object.pooled_capacity();
        if !(MIN_BUCKET..=MAX_BUCKET).contains(&capacity) {
            self.stats.bypassed += 1;
            return;
        }
        // floor to a bucket so every object in bucket `b` holds at least `b`
        let size = 1usize << (usize::BITS - 1 - capacity.leading_zeros());
        let bucket = &mut self.buckets[Self::bucket_index(size)];
        if bucket.len() < BUCKET_DEPTH {
            bucket.push(object);
            self.stats.returned += 1;
            trace!(target: "ember::vm::pool", pool = self.label, size, "checkin");
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn idle(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

impl Recyclable for Vec<Value> {
    fn fresh(capacity: usize) -> Self {
        Vec::with_capacity(capacity)
    }

    fn pooled_capacity(&self) -> usize {
        self.capacity()
    }

    fn drain_values(&mut self, sink: &mut Vec<Value>) {
        sink.append(self);
    }
}
