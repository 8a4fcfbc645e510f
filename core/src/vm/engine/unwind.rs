use anyhow::Result;
use tracing::{debug, warn};

use super::Job;
use crate::error::VmError;
use crate::pool::Heap;
use crate::val::Value;
use crate::vm::Vm;
use crate::vm::frame::PendingReturn;
use crate::vm::iter;

/// Value a trap handler receives for an error.
fn payload(err: anyhow::Error) -> Value {
    match err.downcast::<VmError>() {
        Ok(VmError::Thrown(v)) => v,
        Ok(other) => Value::string(other.to_string()),
        Err(err) => Value::string(format!("{:#}", err)),
    }
}

fn discard(heap: &mut Heap, err: anyhow::Error) {
    if let Ok(VmError::Thrown(v)) = err.downcast::<VmError>() {
        heap.dispose(v);
    }
}

/// Host-facing form of an error that escaped every frame. Thrown values
/// become `Uncaught` carrying their rendered text.
pub(super) fn uncaught(vm: &mut Vm, err: anyhow::Error) -> anyhow::Error {
    match err.downcast::<VmError>() {
        Ok(VmError::Thrown(v)) => {
            let text = vm.heap.render(&v);
            vm.heap.dispose(v);
            VmError::Uncaught(text).into()
        }
        Ok(other) => other.into(),
        Err(err) => err,
    }
}

impl Job {
    /// Route an error raised by the top frame. Walks outward disposing frames
    /// until one has an active trap or armed deferred blocks. Fatal errors
    /// skip both. Returns the error when nothing consumed it.
    pub(super) fn raise(&mut self, vm: &mut Vm, err: anyhow::Error) -> Result<()> {
        self.channel.clear(&mut vm.heap);
        if VmError::is_fatal(&err) {
            warn!(target: "ember::vm::engine", error = %err, depth = self.frames.len(), "fatal error");
            self.unwind_all(vm);
            return Err(err);
        }
        while let Some(frame) = self.frames.last_mut() {
            if let Some(handler) = frame.trap.take() {
                frame.clear_stack(&mut vm.heap);
                debug!(target: "ember::vm::engine", unit = frame.unit_name(), handler, error = %err, "trap caught");
                frame.push(payload(err));
                frame.cursor = handler;
                return Ok(());
            }
            let defer_entry = frame.unit().and_then(|u| u.defer_entry);
            if let Some(entry) = defer_entry
                && frame.has_armed_defers()
            {
                frame.clear_stack(&mut vm.heap);
                let previous = frame.pending_error.replace(err);
                let abandoned = frame.pending_return.take();
                frame.cursor = entry;
                if let Some(prev) = previous {
                    discard(&mut vm.heap, prev);
                }
                if let Some(PendingReturn::Values(values)) = abandoned {
                    vm.heap.dispose_all(values);
                }
                return Ok(());
            }
            if let Some(frame) = self.frames.pop() {
                let generator = frame.generator;
                self.retire(vm, frame, 0);
                if let Some(handle) = generator {
                    iter::exhaust(&mut vm.heap, handle);
                }
            }
        }
        Err(err)
    }

    fn unwind_all(&mut self, vm: &mut Vm) {
        while let Some(frame) = self.frames.pop() {
            let generator = frame.generator;
            self.retire(vm, frame, 0);
            if let Some(handle) = generator {
                iter::exhaust(&mut vm.heap, handle);
            }
        }
    }

    /// Dispose every frame top down, drop any pending host task and empty
    /// the channel. The job can be reused afterwards.
    pub fn teardown(&mut self, vm: &mut Vm) {
        if !self.frames.is_empty() {
            debug!(target: "ember::vm::engine", depth = self.frames.len(), "tearing down job");
        }
        self.unwind_all(vm);
        self.pending = None;
        self.channel.clear(&mut vm.heap);
    }
}
