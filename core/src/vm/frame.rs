use std::sync::Arc;

use anyhow::Result;

use super::dispatch::CompiledUnit;
use crate::error::VmError;
use crate::pool::{Heap, Recyclable};
use crate::val::{Handle, Value};

/// Return held back while deferred blocks run.
pub enum PendingReturn {
    Values(Vec<Value>),
    /// Bit mask of locals handed to the caller.
    Locals(u64),
}

/// Activation record.
pub struct Frame {
    pub(crate) unit: Option<Arc<CompiledUnit>>,
    pub(crate) locals: Vec<Value>,
    pub(crate) stack: Vec<Value>,
    shadows: Vec<(usize, Value)>,
    pub(crate) cursor: usize,
    /// Handler position of the active trap.
    pub(crate) trap: Option<usize>,
    defers: Vec<bool>,
    pub(crate) pending_return: Option<PendingReturn>,
    pub(crate) pending_error: Option<anyhow::Error>,
    pub(crate) this: Value,
    /// Callable being run; captures are read through it.
    pub(crate) closure: Value,
    /// Iterator that owns this frame while it is parked between yields.
    pub(crate) generator: Option<Handle>,
    /// Where to resume when the generator this frame advanced finishes.
    pub(crate) on_exhaust: Option<usize>,
    capacity: usize,
}

impl Frame {
    /// Prepare for a fresh activation of `unit`.
    pub fn reset(&mut self, unit: Arc<CompiledUnit>) {
        self.locals.clear();
        self.locals.resize_with(unit.locals.max(unit.params), Value::null);
        self.stack.clear();
        self.shadows.clear();
        self.defers.clear();
        self.defers.resize(unit.defer_slots, false);
        self.cursor = 0;
        self.trap = None;
        self.pending_return = None;
        self.pending_error = None;
        self.this = Value::null();
        self.closure = Value::null();
        self.generator = None;
        self.on_exhaust = None;
        self.unit = Some(unit);
    }

    pub fn unit(&self) -> Option<&Arc<CompiledUnit>> {
        self.unit.as_ref()
    }

    pub fn unit_name(&self) -> &str {
        self.unit.as_ref().map_or("<none>", |u| &u.name)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn bad_slot(&self, slot: usize) -> anyhow::Error {
        VmError::malformed(self.unit_name(), format!("local slot {} out of range", slot))
    }

    pub fn local(&self, slot: usize) -> Result<&Value> {
        self.locals.get(slot).ok_or_else(|| self.bad_slot(slot))
    }

    /// Move a local out, leaving `Null`.
    pub fn take_local(&mut self, slot: usize) -> Result<Value> {
        match self.locals.get_mut(slot) {
            Some(v) => Ok(v.take()),
            None => Err(self.bad_slot(slot)),
        }
    }

    /// Store into a slot, disposing whatever it owned before.
    pub fn update_local(&mut self, heap: &mut Heap, slot: usize, value: Value) -> Result<()> {
        let Some(dst) = self.locals.get_mut(slot) else {
            heap.dispose(value);
            return Err(self.bad_slot(slot));
        };
        let old = std::mem::replace(dst, value);
        heap.dispose(old);
        Ok(())
    }

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Result<Value> {
        match self.stack.pop() {
            Some(v) => Ok(v),
            None => Err(VmError::malformed(self.unit_name(), "operand stack underflow")),
        }
    }

    pub fn peek(&self) -> Result<&Value> {
        self.stack
            .last()
            .ok_or_else(|| VmError::malformed(self.unit_name(), "operand stack underflow"))
    }

    pub fn peek_mut(&mut self) -> Result<&mut Value> {
        if self.stack.is_empty() {
            return Err(VmError::malformed(self.unit_name(), "operand stack underflow"));
        }
        let last = self.stack.len() - 1;
        Ok(&mut self.stack[last])
    }

    /// Pop `n` values, oldest first.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>> {
        if self.stack.len() < n {
            return Err(VmError::malformed(self.unit_name(), "operand stack underflow"));
        }
        let at = self.stack.len() - n;
        Ok(self.stack.split_off(at))
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn clear_stack(&mut self, heap: &mut Heap) {
        heap.dispose_all(self.stack.drain(..));
    }

    /// Park the current binding of `slot` so an inner scope can reuse it.
    pub fn shadow_save(&mut self, slot: usize) -> Result<()> {
        let saved = self.take_local(slot)?;
        self.shadows.push((slot, saved));
        Ok(())
    }

    pub fn shadow_restore(&mut self, heap: &mut Heap, slot: usize) -> Result<()> {
        let Some(pos) = self.shadows.iter().rposition(|(s, _)| *s == slot) else {
            return Err(VmError::malformed(
                self.unit_name(),
                format!("no shadowed binding for slot {}", slot),
            ));
        };
        let (_, saved) = self.shadows.remove(pos);
        self.update_local(heap, slot, saved)
    }

    pub fn arm_defer(&mut self, k: usize) -> Result<()> {
        match self.defers.get_mut(k) {
            Some(flag) => {
                *flag = true;
                Ok(())
            }
            None => Err(VmError::malformed(self.unit_name(), format!("defer slot {} out of range", k))),
        }
    }

    /// Disarm and report whether block `k` should run.
    pub fn take_defer(&mut self, k: usize) -> bool {
        self.defers.get_mut(k).is_some_and(std::mem::take)
    }

    pub fn has_armed_defers(&self) -> bool {
        self.defers.iter().any(|armed| *armed)
    }

    /// Dispose every owned slot except the locals selected by `except`,
    /// which are returned in slot order.
    pub fn destroy(&mut self, heap: &mut Heap, except: u64) -> Vec<Value> {
        let mut kept = Vec::new();
        for (i, slot) in self.locals.iter_mut().enumerate() {
            let v = slot.take();
            if i < 64 && except & (1 << i) != 0 {
                kept.push(v);
            } else {
                heap.dispose(v);
            }
        }
        let mut sink = Vec::new();
        self.drain_values(&mut sink);
        heap.dispose_all(sink);
        kept
    }
}

impl Recyclable for Frame {
    fn fresh(capacity: usize) -> Self {
        Self {
            unit: None,
            locals: Vec::with_capacity(capacity),
            stack: Vec::with_capacity(capacity),
            shadows: Vec::new(),
            cursor: 0,
            trap: None,
            defers: Vec::new(),
            pending_return: None,
            pending_error: None,
            this: Value::null(),
            closure: Value::null(),
            generator: None,
            on_exhaust: None,
            capacity,
        }
    }

    fn pooled_capacity(&self) -> usize {
        self.capacity
    }

    fn drain_values(&mut self, sink: &mut Vec<Value>) {
        sink.append(&mut self.locals);
        sink.append(&mut self.stack);
        sink.extend(self.shadows.drain(..).map(|(_, v)| v));
        if let Some(PendingReturn::Values(values)) = self.pending_return.take() {
            sink.extend(values);
        }
        if let Some(err) = self.pending_error.take()
            && let Ok(VmError::Thrown(v)) = err.downcast::<VmError>()
        {
            sink.push(v);
        }
        sink.push(self.this.take());
        sink.push(self.closure.take());
        self.unit = None;
        self.cursor = 0;
        self.trap = None;
        self.defers.clear();
        self.generator = None;
        self.on_exhaust = None;
    }
}
