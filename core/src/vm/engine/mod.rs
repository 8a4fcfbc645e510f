//! The job loop.
//!
//! A [`Job`] owns a stack of frames and a transfer channel. All three run
//! modes go through [`Job::drive`], which executes steps until the frame
//! stack empties, the instruction budget runs out, or an async host call
//! leaves a pending task.

use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use tracing::{debug, warn};

use super::Vm;
use super::channel::Channel;
use super::dispatch::{CallTarget, CompiledUnit, ExecCtx, Flow};
use super::frame::Frame;
use super::host::HostTask;
use crate::error::VmError;
use crate::val::Value;

mod call;
mod unwind;

/// How a run call ended.
#[derive(Debug)]
pub enum Outcome {
    /// The entry frame returned these values.
    Completed(Vec<Value>),
    /// Budget exhausted or waiting on a host task; call again to continue.
    Halted,
    /// An uncaught error was handed to the error hook.
    Aborted,
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn into_values(self) -> Vec<Value> {
        match self {
            Outcome::Completed(values) => values,
            _ => Vec::new(),
        }
    }
}

pub(crate) enum Slice {
    Done(Vec<Value>),
    Spent,
    Pending,
}

/// One logical thread of execution.
#[derive(Default)]
pub struct Job {
    frames: Vec<Frame>,
    channel: Channel,
    pending: Option<HostTask>,
}

impl Job {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames currently on the stack.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_waiting(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.frames.is_empty() && self.pending.is_none()
    }

    /// Start a call to the function bound at `path`, or to a compiled unit of
    /// that name.
    pub fn call(&mut self, vm: &mut Vm, path: &str, args: Vec<Value>) -> Result<()> {
        let target = if vm.globals.contains(path) {
            CallTarget::Path(Arc::from(path))
        } else if vm.units.contains_key(path) {
            CallTarget::Unit(Arc::from(path))
        } else {
            vm.heap.dispose_all(args);
            return Err(VmError::TypeMismatch(format!("'{}' is not bound to a callable", path)).into());
        };
        self.channel.extend(args);
        self.start(vm, |job, vm| job.invoke(vm, target, Value::null()))
    }

    /// Start a call through a callable value.
    pub fn call_value(&mut self, vm: &mut Vm, callee: Value, args: Vec<Value>) -> Result<()> {
        self.channel.extend(args);
        self.start(vm, |job, vm| job.invoke(vm, CallTarget::Value(callee), Value::null()))
    }

    /// Start a unit that is not bound anywhere, such as a static initializer.
    pub fn call_unit(&mut self, vm: &mut Vm, unit: Arc<CompiledUnit>, args: Vec<Value>) -> Result<()> {
        self.channel.extend(args);
        self.start(vm, |job, vm| job.enter(vm, unit, Value::null(), Value::null()))
    }

    fn start(&mut self, vm: &mut Vm, f: impl FnOnce(&mut Job, &mut Vm) -> Result<()>) -> Result<()> {
        let r = f(self, vm);
        if r.is_err() {
            self.channel.clear(&mut vm.heap);
        }
        r
    }

    /// Run to completion. Pending host tasks are awaited by blocking the
    /// current thread.
    pub fn run(&mut self, vm: &mut Vm) -> Result<Outcome> {
        let r = self.run_blocking(vm);
        self.conclude(vm, r)
    }

    fn run_blocking(&mut self, vm: &mut Vm) -> Result<Outcome> {
        loop {
            if let Some(task) = self.pending.take() {
                let r = futures::executor::block_on(task);
                self.settle(vm, r)?;
            }
            let mut budget = u64::MAX;
            match self.drive(vm, &mut budget)? {
                Slice::Done(values) => return Ok(Outcome::Completed(values)),
                Slice::Spent | Slice::Pending => {}
            }
        }
    }

    /// Run at most `budget` instructions. The last step may overshoot when it
    /// is a fused unit. Pending host tasks are polled once per call.
    pub fn run_bounded(&mut self, vm: &mut Vm, budget: u64) -> Result<Outcome> {
        let r = self.run_slice(vm, budget);
        self.conclude(vm, r)
    }

    fn run_slice(&mut self, vm: &mut Vm, budget: u64) -> Result<Outcome> {
        let mut budget = budget;
        loop {
            if self.pending.is_some() {
                match self.poll_pending() {
                    Some(r) => self.settle(vm, r)?,
                    None => return Ok(Outcome::Halted),
                }
            }
            match self.drive(vm, &mut budget)? {
                Slice::Done(values) => return Ok(Outcome::Completed(values)),
                Slice::Spent => return Ok(Outcome::Halted),
                Slice::Pending => {}
            }
        }
    }

    fn poll_pending(&mut self) -> Option<Result<Vec<Value>>> {
        let task = self.pending.as_mut()?;
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        match task.as_mut().poll(&mut cx) {
            Poll::Ready(r) => {
                self.pending = None;
                Some(r)
            }
            Poll::Pending => None,
        }
    }

    /// Run to completion, awaiting host tasks and handing control back to
    /// the async runtime every `yield_interval` instructions.
    pub async fn run_async(&mut self, vm: &mut Vm) -> Result<Outcome> {
        let r = self.run_cooperative(vm).await;
        self.conclude(vm, r)
    }

    async fn run_cooperative(&mut self, vm: &mut Vm) -> Result<Outcome> {
        loop {
            if let Some(task) = self.pending.take() {
                let r = task.await;
                self.settle(vm, r)?;
            }
            let mut budget = vm.config.yield_interval.max(1) as u64;
            match self.drive(vm, &mut budget)? {
                Slice::Done(values) => return Ok(Outcome::Completed(values)),
                Slice::Spent => tokio::task::yield_now().await,
                Slice::Pending => {}
            }
        }
    }

    /// Execute steps until something needs the caller's attention. Script
    /// errors are routed through traps here; only uncaught ones escape.
    pub(crate) fn drive(&mut self, vm: &mut Vm, budget: &mut u64) -> Result<Slice> {
        loop {
            if self.pending.is_some() {
                return Ok(Slice::Pending);
            }
            let Some(frame) = self.frames.last_mut() else {
                return Ok(Slice::Done(self.channel.drain()));
            };
            if *budget == 0 {
                return Ok(Slice::Spent);
            }
            let Some(unit) = frame.unit.clone() else {
                let err = VmError::malformed(frame.unit_name(), "frame has no code unit");
                self.raise(vm, err)?;
                continue;
            };
            let cursor = frame.cursor;
            let (flow, next) = match unit.step_at(cursor) {
                Some(step) => {
                    *budget = budget.saturating_sub(step.len as u64);
                    let mut ctx = ExecCtx {
                        heap: &mut vm.heap,
                        globals: &mut vm.globals,
                        units: &vm.units,
                        frame,
                        channel: &mut self.channel,
                    };
                    (step.run(&mut ctx), step.start + step.len)
                }
                // running off the end is a plain return
                None if cursor >= unit.code.len() => (Ok(Flow::Return), cursor),
                None => (
                    Err(VmError::malformed(&unit.name, format!("cursor {} is inside a fused step", cursor))),
                    cursor,
                ),
            };
            if let Err(err) = flow.and_then(|flow| self.apply(vm, flow, next)) {
                self.raise(vm, err)?;
            }
        }
    }

    /// Deliver the result of a finished host task to the waiting frame.
    fn settle(&mut self, vm: &mut Vm, result: Result<Vec<Value>>) -> Result<()> {
        match result {
            Ok(values) => {
                let mut out = self.channel.drain();
                out.extend(values);
                self.deliver(out);
                Ok(())
            }
            Err(err) => self.raise(vm, err),
        }
    }

    fn conclude(&mut self, vm: &mut Vm, result: Result<Outcome>) -> Result<Outcome> {
        match result {
            Ok(outcome) => {
                if let Outcome::Completed(values) = &outcome {
                    debug!(target: "ember::vm::engine", returned = values.len(), "job completed");
                }
                Ok(outcome)
            }
            Err(err) => {
                self.teardown(vm);
                let err = unwind::uncaught(vm, err);
                warn!(target: "ember::vm::engine", error = %err, "job aborted");
                if vm.report(&err) { Ok(Outcome::Aborted) } else { Err(err) }
            }
        }
    }

    /// Push returned values to the caller, or keep them as the job's result
    /// once the stack is empty. A call that returns nothing yields `Null`.
    fn deliver(&mut self, values: Vec<Value>) {
        match self.frames.last_mut() {
            Some(caller) if values.is_empty() => caller.push(Value::null()),
            Some(caller) => {
                for v in values {
                    caller.push(v);
                }
            }
            None => self.channel.extend(values),
        }
    }
}
