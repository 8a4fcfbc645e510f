//! Bytecode virtual machine.
//!
//! A [`Vm`] owns the heap, the global namespace and every compiled unit.
//! Execution happens in [`Job`]s, each with its own frame stack; jobs share
//! the VM one at a time.

pub mod bytecode;
pub mod callable;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod frame;
pub mod globals;
pub mod host;
pub mod iter;
pub mod program;
pub mod scheduler;

#[cfg(test)]
mod vm_test;

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

pub use bytecode::{CodeBuilder, Instruction, Opcode};
pub use callable::Callable;
pub use config::EngineConfig;
pub use dispatch::{CompiledUnit, UnitTable};
pub use engine::{Job, Outcome};
pub use globals::Globals;
pub use host::{HostCall, HostFunction, HostTask};
pub use iter::IterState;
pub use program::{DataDef, EnumDef, Format, FunctionDef, Literal, ModuleDef, Program, StaticDef};
pub use scheduler::Scheduler;

use crate::error::VmError;
use crate::pool::{Heap, HeapObject};
use crate::util::fast_map::fast_hash_map_new;
use crate::val::{HeapKind, Value};

type ErrorHook = Box<dyn FnMut(&anyhow::Error)>;

pub struct Vm {
    pub heap: Heap,
    pub globals: Globals,
    pub(crate) units: UnitTable,
    pub config: EngineConfig,
    error_hook: Option<ErrorHook>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Vm {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            heap: Heap::new(),
            globals: Globals::new(),
            units: fast_hash_map_new(),
            config,
            error_hook: None,
        }
    }

    /// Bind a host function at a dotted path.
    pub fn register_host(&mut self, path: &str, function: HostFunction, overwritable: bool) -> Result<()> {
        let callable = self.heap.alloc(HeapObject::Callable(Callable::Host {
            path: Arc::from(path),
            function,
        }));
        self.globals.define(&mut self.heap, path, callable, overwritable)
    }

    /// Compile a function and add it to the unit table.
    pub fn compile_unit(&mut self, def: &FunctionDef) -> Result<Arc<CompiledUnit>> {
        if self.units.contains_key(def.name.as_str()) {
            return Err(VmError::DuplicateBinding(def.name.clone()).into());
        }
        let unit = Arc::new(dispatch::compile(def, self.config.fusion)?);
        self.units.insert(unit.name.clone(), unit.clone());
        Ok(unit)
    }

    pub fn unit(&self, name: &str) -> Option<&Arc<CompiledUnit>> {
        self.units.get(name)
    }

    /// Compiled units sorted by name.
    pub fn units(&self) -> Vec<&Arc<CompiledUnit>> {
        let mut units: Vec<_> = self.units.values().collect();
        units.sort_by(|a, b| a.name.cmp(&b.name));
        units
    }

    /// Receive uncaught errors instead of having them returned from the run
    /// call; the job then reports [`Outcome::Aborted`].
    pub fn set_error_hook(&mut self, hook: impl FnMut(&anyhow::Error) + 'static) {
        self.error_hook = Some(Box::new(hook));
    }

    pub fn clear_error_hook(&mut self) {
        self.error_hook = None;
    }

    /// Hand an uncaught error to the hook. False when there is none.
    pub(crate) fn report(&mut self, err: &anyhow::Error) -> bool {
        match self.error_hook.as_mut() {
            Some(hook) => {
                hook(err);
                true
            }
            None => false,
        }
    }

    /// Call the function at `path` to completion.
    pub fn call(&mut self, path: &str, args: Vec<Value>) -> Result<Outcome> {
        let mut job = Job::new();
        job.call(self, path, args)?;
        job.run(self)
    }

    /// Advance any iterator from the host. Generator frames run on a scratch
    /// job. Returns a share of the new current value, or `None` once
    /// exhausted.
    pub fn next_value(&mut self, iterator: &Value) -> Result<Option<Value>> {
        let handle = match iterator.heap_ref() {
            Some((HeapKind::Iterator, handle)) => handle,
            _ => return Err(VmError::type_mismatch("iterator", iterator)),
        };
        let it = self.heap.iterator(handle)?;
        if it.state() == IterState::Exhausted {
            return Ok(None);
        }
        if it.is_generator() {
            let mut job = Job::new();
            job.resume_generator(self, handle)?;
            match job.run(self)? {
                Outcome::Completed(values) => self.heap.dispose_all(values),
                Outcome::Halted | Outcome::Aborted => return Ok(None),
            }
        } else if !iter::advance_walk(&mut self.heap, handle)? {
            return Ok(None);
        }
        let it = self.heap.iterator(handle)?;
        Ok((it.state() == IterState::Active).then(|| it.current().first().map(Value::share).unwrap_or_default()))
    }

    /// Text form of a value, following structures.
    pub fn render(&self, value: &Value) -> String {
        self.heap.render(value)
    }

    /// Dispose every global. Units stay compiled.
    pub fn shutdown(&mut self) {
        debug!(target: "ember::vm::globals", globals = self.globals.len(), live = self.heap.live(), "shutdown");
        self.globals.clear(&mut self.heap);
    }
}
