use std::collections::VecDeque;

use crate::pool::Heap;
use crate::val::Value;

/// Single-owner hand-off for arguments and returned values.
///
/// Values move in and move out exactly once; between steps the channel is
/// empty.
#[derive(Debug, Default)]
pub struct Channel {
    values: VecDeque<Value>,
}

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.values.push_back(value);
    }

    pub fn extend(&mut self, values: impl IntoIterator<Item = Value>) {
        self.values.extend(values);
    }

    /// Oldest value, if any.
    #[inline]
    pub fn take(&mut self) -> Option<Value> {
        self.values.pop_front()
    }

    pub fn drain(&mut self) -> Vec<Value> {
        self.values.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self, heap: &mut Heap) {
        heap.dispose_all(self.values.drain(..));
    }
}
