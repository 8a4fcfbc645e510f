//! Iterator objects: structural walks and suspended generator frames.

use anyhow::Result;

use super::dispatch::Flow;
use super::frame::Frame;
use crate::error::VmError;
use crate::pool::{Heap, HeapObject, Pools};
use crate::val::{Handle, HeapKind, Key, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterState {
    Created,
    /// Holds a current value and may have more.
    Active,
    /// Generator frame is on a job's stack.
    Running,
    Exhausted,
}

pub(crate) enum WalkPos {
    Start,
    After(Key),
    Done,
}

pub(crate) enum IterSource {
    Walk { target: Value, pos: WalkPos },
    /// `frame` is `None` while the generator runs or after it finished.
    Generator { frame: Option<Frame> },
}

pub struct IterObject {
    pub(crate) state: IterState,
    pub(crate) source: IterSource,
    key: Value,
    current: Vec<Value>,
    yields: i64,
}

impl IterObject {
    /// Walk over `target`'s keys in order. An owning `target` is owned by the
    /// iterator from now on.
    pub fn walk(target: Value) -> Self {
        Self::with_source(IterSource::Walk {
            target,
            pos: WalkPos::Start,
        })
    }

    pub(crate) fn generator(frame: Frame) -> Self {
        Self::with_source(IterSource::Generator { frame: Some(frame) })
    }

    fn with_source(source: IterSource) -> Self {
        Self {
            state: IterState::Created,
            source,
            key: Value::null(),
            current: Vec::new(),
            yields: 0,
        }
    }

    pub fn state(&self) -> IterState {
        self.state
    }

    pub fn is_generator(&self) -> bool {
        matches!(self.source, IterSource::Generator { .. })
    }

    pub fn current(&self) -> &[Value] {
        &self.current
    }

    /// Publish a new current entry; the previous one is returned for disposal.
    fn publish(&mut self, key: Value, values: Vec<Value>) -> Vec<Value> {
        let mut old = std::mem::replace(&mut self.current, values);
        old.push(std::mem::replace(&mut self.key, key));
        self.state = IterState::Active;
        old
    }

    /// Park a generator frame after a yield.
    pub(crate) fn park(&mut self, frame: Frame, values: Vec<Value>) -> Vec<Value> {
        if let IterSource::Generator { frame: slot } = &mut self.source {
            *slot = Some(frame);
        }
        let key = Value::int(self.yields);
        self.yields += 1;
        self.publish(key, values)
    }

    /// Tell the parked frame which iterator owns it.
    pub(crate) fn bind(&mut self, handle: Handle) {
        if let IterSource::Generator { frame: Some(frame) } = &mut self.source {
            frame.generator = Some(handle);
        }
    }

    /// Take the parked frame out to run it.
    pub(crate) fn resume(&mut self) -> Option<Frame> {
        match &mut self.source {
            IterSource::Generator { frame } if self.state != IterState::Exhausted => {
                let frame = frame.take()?;
                self.state = IterState::Running;
                Some(frame)
            }
            _ => None,
        }
    }

    /// One-way transition to `Exhausted`; returns values to dispose.
    pub(crate) fn finish(&mut self) -> Vec<Value> {
        self.state = IterState::Exhausted;
        let mut old = std::mem::take(&mut self.current);
        old.push(self.key.take());
        if let IterSource::Walk { pos, .. } = &mut self.source {
            *pos = WalkPos::Done;
        }
        old
    }

    pub(crate) fn recycle(self, pools: &mut Pools, sink: &mut Vec<Value>) {
        let IterObject {
            source, key, current, ..
        } = self;
        sink.push(key);
        sink.extend(current);
        match source {
            IterSource::Walk { target, .. } => sink.push(target),
            IterSource::Generator { frame: Some(frame) } => pools.frames.checkin(frame, sink),
            IterSource::Generator { frame: None } => {}
        }
    }
}

fn iterator_handle(value: &Value) -> Result<Handle> {
    match value.heap_ref() {
        Some((HeapKind::Iterator, handle)) => Ok(handle),
        _ => Err(VmError::type_mismatch("iterator", value)),
    }
}

/// Turn a value into an iterator. Iterators pass through; structures get a
/// walk that takes over an owning value.
pub fn open(heap: &mut Heap, value: Value) -> Result<Value> {
    match value.heap_ref() {
        Some((HeapKind::Iterator, _)) => Ok(value),
        Some((HeapKind::Struct, _)) => {
            // fail on stale pointers before the walk starts
            if let Err(err) = heap.structure(&value) {
                heap.dispose(value);
                return Err(err);
            }
            Ok(heap.alloc(HeapObject::Iterator(IterObject::walk(value))))
        }
        _ => {
            let err = VmError::type_mismatch("iterable", &value);
            heap.dispose(value);
            Err(err)
        }
    }
}

/// Advance a structural walk by one entry. Returns whether a new entry was
/// published.
pub(crate) fn advance_walk(heap: &mut Heap, handle: Handle) -> Result<bool> {
    let it = heap.iterator(handle)?;
    if it.state == IterState::Exhausted {
        return Ok(false);
    }
    let (target, from) = match &it.source {
        IterSource::Walk { target, pos } => (
            target.share(),
            match pos {
                WalkPos::Start => None,
                WalkPos::After(k) => Some(k.clone()),
                WalkPos::Done => return Ok(false),
            },
        ),
        IterSource::Generator { .. } => {
            return Err(VmError::TypeMismatch("generator advanced as a walk".to_string()).into());
        }
    };

    let next = {
        let s = heap.structure_mut(&target)?;
        let key = match &from {
            None => s.first_key(),
            Some(k) => s.next_key(k),
        };
        key.map(|k| {
            let v = s.get_child(&k).map(Value::share).unwrap_or_default();
            (k, v)
        })
    };

    let it = heap.iterator_mut(handle)?;
    let old = match next {
        Some((k, v)) => {
            let key_value = k.to_value();
            if let IterSource::Walk { pos, .. } = &mut it.source {
                *pos = WalkPos::After(k);
            }
            it.publish(key_value, vec![v])
        }
        None => it.finish(),
    };
    let more = it.state == IterState::Active;
    heap.dispose_all(old);
    Ok(more)
}

/// `IterNext`: continue to the next instruction when an entry is available,
/// otherwise jump to `exhausted`. Generators are resumed by the engine.
pub fn step(heap: &mut Heap, iterator: &Value, exhausted: usize) -> Result<Flow> {
    let handle = iterator_handle(iterator)?;
    let it = heap.iterator(handle)?;
    if it.is_generator() {
        return Ok(match it.state {
            IterState::Exhausted => Flow::Jump(exhausted),
            _ => Flow::Advance {
                iterator: handle,
                exhausted,
            },
        });
    }
    Ok(if advance_walk(heap, handle)? {
        Flow::Next
    } else {
        Flow::Jump(exhausted)
    })
}

/// Key or first value of the current entry, as a share.
pub fn current(heap: &Heap, iterator: &Value, key: bool) -> Result<Value> {
    let it = heap.iterator(iterator_handle(iterator)?)?;
    Ok(if key {
        it.key.share()
    } else {
        it.current.first().map(Value::share).unwrap_or_default()
    })
}

/// Mark a generator finished, dropping its current entry. A stale handle
/// means the iterator is already gone.
pub(crate) fn exhaust(heap: &mut Heap, handle: Handle) {
    if let Ok(it) = heap.iterator_mut(handle) {
        let old = it.finish();
        heap.dispose_all(old);
    }
}
