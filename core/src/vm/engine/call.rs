use std::sync::Arc;

use anyhow::Result;
use tracing::trace;

use super::Job;
use crate::error::VmError;
use crate::pool::{Heap, HeapObject};
use crate::val::{Handle, Key, Value};
use crate::vm::Vm;
use crate::vm::callable::Callable;
use crate::vm::dispatch::{CallTarget, CompiledUnit, Flow};
use crate::vm::frame::{Frame, PendingReturn};
use crate::vm::host::{HostCall, HostFunction};
use crate::vm::iter::{self, IterObject, IterState};

enum Exit {
    Values,
    Locals(u64),
}

enum Resolved {
    Script(Arc<CompiledUnit>),
    Host(Arc<str>, HostFunction),
}

/// Collect surplus arguments into a dense structure.
fn pack(heap: &mut Heap, values: Vec<Value>) -> Result<Value> {
    let rest = heap.alloc_struct(values.len());
    for (i, v) in values.into_iter().enumerate() {
        if let Err(err) = heap.set_child_key(&rest, Key::Int(i as i64), v) {
            heap.dispose(rest);
            return Err(err);
        }
    }
    Ok(rest)
}

impl Job {
    fn top_mut(&mut self) -> Result<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| VmError::malformed("<job>", "no frame to continue"))
    }

    /// Apply a step's flow. `next` is the position after the step.
    pub(super) fn apply(&mut self, vm: &mut Vm, flow: Flow, next: usize) -> Result<()> {
        let frame = self.top_mut()?;
        frame.cursor = next;
        match flow {
            Flow::Next => Ok(()),
            Flow::Jump(target) => {
                frame.cursor = target;
                Ok(())
            }
            Flow::Call { target, this } => self.invoke(vm, target, this),
            Flow::Return => self.leave(vm, Exit::Values),
            Flow::ReturnLocals(mask) => self.leave(vm, Exit::Locals(mask)),
            Flow::Yield => self.suspend(vm),
            Flow::Finalize => {
                self.channel.clear(&mut vm.heap);
                self.leave(vm, Exit::Values)
            }
            Flow::Advance { iterator, exhausted } => self.advance(vm, iterator, exhausted),
        }
    }

    pub(super) fn invoke(&mut self, vm: &mut Vm, target: CallTarget, this: Value) -> Result<()> {
        let callee = match target {
            CallTarget::Unit(name) => {
                let Some(unit) = vm.units.get(&name).cloned() else {
                    vm.heap.dispose(this);
                    return Err(VmError::malformed(&name, "call to unknown unit"));
                };
                return self.enter(vm, unit, Value::null(), this);
            }
            CallTarget::Path(path) => {
                let callee = vm.globals.load(&path);
                if callee.is_null() {
                    vm.heap.dispose(this);
                    return Err(VmError::TypeMismatch(format!("'{}' is not bound to a callable", path)).into());
                }
                callee
            }
            CallTarget::Value(callee) => callee,
        };

        let resolved = vm.heap.callable(&callee).map(|c| match c {
            Callable::Script { unit, .. } => Resolved::Script(unit.clone()),
            Callable::Host { path, function } => Resolved::Host(path.clone(), function.clone()),
        });
        match resolved {
            Ok(Resolved::Script(unit)) => self.enter(vm, unit, callee, this),
            Ok(Resolved::Host(path, function)) => {
                vm.heap.dispose(callee);
                self.call_host(vm, &path, function, this)
            }
            Err(err) => {
                vm.heap.dispose(callee);
                vm.heap.dispose(this);
                Err(err)
            }
        }
    }

    /// Push a frame for `unit`, moving arguments out of the channel. Generator
    /// units park the frame in a fresh iterator instead and return that.
    pub(super) fn enter(&mut self, vm: &mut Vm, unit: Arc<CompiledUnit>, closure: Value, this: Value) -> Result<()> {
        if self.frames.len() >= vm.config.max_frames {
            vm.heap.dispose(closure);
            vm.heap.dispose(this);
            return Err(VmError::Fatal(format!("call depth limit of {} frames exceeded", vm.config.max_frames)).into());
        }
        let mut args = self.channel.drain();
        let fixed = if unit.variadic {
            unit.params.saturating_sub(1)
        } else {
            unit.params
        };
        if args.len() < fixed || (!unit.variadic && args.len() > fixed) {
            let got = args.len();
            vm.heap.dispose_all(args);
            vm.heap.dispose(closure);
            vm.heap.dispose(this);
            return Err(VmError::ParameterCount {
                callee: unit.name.to_string(),
                expected: fixed,
                got,
            }
            .into());
        }
        if unit.variadic && unit.params > 0 {
            let extra = args.split_off(fixed);
            match pack(&mut vm.heap, extra) {
                Ok(rest) => args.push(rest),
                Err(err) => {
                    vm.heap.dispose_all(args);
                    vm.heap.dispose(closure);
                    vm.heap.dispose(this);
                    return Err(err);
                }
            }
        }

        let mut frame = vm.heap.pools.frames.checkout(unit.frame_capacity());
        frame.reset(unit.clone());
        let mut args = args.into_iter();
        for (slot, v) in frame.locals.iter_mut().zip(args.by_ref()) {
            *slot = v;
        }
        // a variadic unit without a rest slot drops its surplus
        vm.heap.dispose_all(args);
        frame.closure = closure;
        frame.this = this;

        if unit.generator {
            let it = vm.heap.alloc(HeapObject::Iterator(IterObject::generator(frame)));
            if let Some((_, handle)) = it.heap_ref()
                && let Ok(obj) = vm.heap.iterator_mut(handle)
            {
                obj.bind(handle);
            }
            trace!(target: "ember::vm::engine", unit = %unit.name, "generator created");
            self.deliver(vec![it]);
            return Ok(());
        }
        trace!(target: "ember::vm::engine", unit = %unit.name, depth = self.frames.len() + 1, "call");
        self.frames.push(frame);
        Ok(())
    }

    fn call_host(&mut self, vm: &mut Vm, path: &str, function: HostFunction, this: Value) -> Result<()> {
        let args = self.channel.drain();
        let cursor = self.frames.last().map_or(0, Frame::cursor);
        let mut call = HostCall::new(path, cursor, this, args, &mut vm.heap, &mut self.channel);
        match function {
            HostFunction::Sync(f) => {
                let r = f(&mut call);
                call.finish();
                r?;
                let values = self.channel.drain();
                self.deliver(values);
            }
            HostFunction::Async(f) => {
                let r = f(&mut call);
                call.finish();
                self.pending = Some(r?);
                trace!(target: "ember::vm::engine", path, "awaiting host task");
            }
        }
        Ok(())
    }

    /// Leave the top frame. Armed defers divert the exit through the deferred
    /// blocks first; `DeferEnd` re-issues it.
    fn leave(&mut self, vm: &mut Vm, exit: Exit) -> Result<()> {
        let frame = self.top_mut()?;
        let defer_entry = frame.unit().and_then(|u| u.defer_entry);
        if let Some(entry) = defer_entry
            && frame.has_armed_defers()
        {
            let pending = match exit {
                Exit::Values => PendingReturn::Values(self.channel.drain()),
                Exit::Locals(mask) => PendingReturn::Locals(mask),
            };
            let frame = self.top_mut()?;
            let replaced = frame.pending_return.replace(pending);
            frame.cursor = entry;
            if let Some(PendingReturn::Values(old)) = replaced {
                vm.heap.dispose_all(old);
            }
            return Ok(());
        }

        let Some(frame) = self.frames.pop() else {
            return Ok(());
        };
        let generator = frame.generator;
        let returned = match exit {
            Exit::Values => {
                let values = self.channel.drain();
                self.retire(vm, frame, 0);
                values
            }
            Exit::Locals(mask) => self.retire(vm, frame, mask),
        };

        if let Some(handle) = generator {
            vm.heap.dispose_all(returned);
            iter::exhaust(&mut vm.heap, handle);
            if let Some(caller) = self.frames.last_mut()
                && let Some(at) = caller.on_exhaust.take()
            {
                caller.cursor = at;
            }
            return Ok(());
        }
        self.deliver(returned);
        Ok(())
    }

    /// Destroy a frame and return it to the pool. Locals selected by
    /// `except` are handed back.
    pub(super) fn retire(&mut self, vm: &mut Vm, mut frame: Frame, except: u64) -> Vec<Value> {
        let kept = frame.destroy(&mut vm.heap, except);
        let mut sink = Vec::new();
        vm.heap.pools.frames.checkin(frame, &mut sink);
        vm.heap.dispose_all(sink);
        kept
    }

    /// Park the generator frame on top and publish the yielded values.
    fn suspend(&mut self, vm: &mut Vm) -> Result<()> {
        let Some(frame) = self.frames.pop() else {
            return Ok(());
        };
        let Some(handle) = frame.generator else {
            let err = VmError::malformed(frame.unit_name(), "yield outside a generator");
            self.frames.push(frame);
            return Err(err);
        };
        let values = self.channel.drain();
        match vm.heap.iterator_mut(handle) {
            Ok(it) => {
                let old = it.park(frame, values);
                vm.heap.dispose_all(old);
            }
            Err(err) => {
                vm.heap.dispose_all(values);
                self.retire(vm, frame, 0);
                return Err(err);
            }
        }
        if let Some(caller) = self.frames.last_mut() {
            caller.on_exhaust = None;
        }
        Ok(())
    }

    /// Re-enter a parked generator. Exhausted generators never run again; the
    /// caller just continues at `exhausted`.
    pub(super) fn advance(&mut self, vm: &mut Vm, handle: Handle, exhausted: usize) -> Result<()> {
        if self.frames.len() >= vm.config.max_frames {
            return Err(VmError::Fatal(format!("call depth limit of {} frames exceeded", vm.config.max_frames)).into());
        }
        let it = vm.heap.iterator_mut(handle)?;
        if it.state() == IterState::Running {
            return Err(VmError::TypeMismatch("generator is already running".to_string()).into());
        }
        match it.resume() {
            Some(frame) => {
                if let Some(caller) = self.frames.last_mut() {
                    caller.on_exhaust = Some(exhausted);
                }
                self.frames.push(frame);
            }
            None => {
                if let Some(caller) = self.frames.last_mut() {
                    caller.cursor = exhausted;
                }
            }
        }
        Ok(())
    }

    /// Host-side resumption of a generator on an otherwise empty job.
    pub(crate) fn resume_generator(&mut self, vm: &mut Vm, handle: Handle) -> Result<()> {
        self.advance(vm, handle, 0)
    }
}
