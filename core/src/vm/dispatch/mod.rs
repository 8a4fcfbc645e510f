//! Load-time compilation of code units into step closures.
//!
//! Every instruction gets a handler closure. Runs of instructions that match a
//! registered pattern are folded into a single fused closure first; positions
//! a jump can land on always start a new step.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use super::bytecode::{Instruction, Opcode, Scan, max_stack};
use super::channel::Channel;
use super::frame::Frame;
use super::globals::Globals;
use super::program::FunctionDef;
use crate::error::VmError;
use crate::pool::Heap;
use crate::util::fast_map::{FastHashMap, FastHashSet, fast_hash_set_new};
use crate::val::{Handle, Value};

mod handlers;
mod matcher;
mod patterns;


pub use matcher::{Matcher, Pattern};

pub type UnitTable = FastHashMap<Arc<str>, Arc<CompiledUnit>>;

/// Everything a step may touch.
pub struct ExecCtx<'a> {
    pub heap: &'a mut Heap,
    pub globals: &'a mut Globals,
    pub units: &'a UnitTable,
    pub frame: &'a mut Frame,
    pub channel: &'a mut Channel,
}

pub enum CallTarget {
    Value(Value),
    Unit(Arc<str>),
    Path(Arc<str>),
}

/// What the engine does after a step.
pub enum Flow {
    Next,
    Jump(usize),
    /// Arguments are already in the channel.
    Call { target: CallTarget, this: Value },
    /// Return values are already in the channel.
    Return,
    ReturnLocals(u64),
    /// Yielded values are already in the channel.
    Yield,
    Finalize,
    /// Resume a parked generator; jump to `exhausted` once it finishes.
    Advance { iterator: Handle, exhausted: usize },
}

pub type StepFn = Box<dyn Fn(&mut ExecCtx<'_>) -> Result<Flow>>;

pub struct Step {
    pub start: usize,
    pub len: usize,
    pub pattern: &'static str,
    run: StepFn,
}

impl Step {
    #[inline]
    pub fn run(&self, ctx: &mut ExecCtx<'_>) -> Result<Flow> {
        (self.run)(ctx)
    }
}

pub struct CompiledUnit {
    pub name: Arc<str>,
    pub params: usize,
    pub locals: usize,
    pub variadic: bool,
    pub generator: bool,
    pub code: Vec<Instruction>,
    steps: Vec<Step>,
    /// Instruction index to step index; `u32::MAX` inside a fused span.
    entry: Vec<u32>,
    pub max_stack: usize,
    /// First deferred block, where exits are diverted while defers are armed.
    pub defer_entry: Option<usize>,
    pub defer_slots: usize,
}

impl CompiledUnit {
    #[inline]
    pub fn step_at(&self, cursor: usize) -> Option<&Step> {
        let idx = *self.entry.get(cursor)?;
        self.steps.get(idx as usize)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn fused_count(&self) -> usize {
        self.steps.iter().filter(|s| s.len > 1).count()
    }

    /// Frame slot count needed by this unit.
    pub fn frame_capacity(&self) -> usize {
        self.locals.max(self.params) + self.max_stack
    }

    /// Human-readable step layout.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "unit {} (params {}, locals {}, max stack {}, {} steps / {} instructions)",
            self.name,
            self.params,
            self.locals,
            self.max_stack,
            self.steps.len(),
            self.code.len()
        );
        for step in &self.steps {
            let _ = writeln!(out, "  {:>4} {}", step.start, step.pattern);
            for ins in &self.code[step.start..step.start + step.len] {
                let _ = writeln!(out, "         {}", ins);
            }
        }
        out
    }
}

/// Resolve depth-addressed targets once. Forward scans without a boundary
/// resume at the end of the code.
fn resolve_targets(name: &str, code: &[Instruction]) -> Result<Vec<Option<usize>>> {
    let mut targets = vec![None; code.len()];
    for (at, ins) in code.iter().enumerate() {
        let (scan, p) = match ins.op {
            Opcode::DeferCheck => (Scan::Forward, ins.depth as i64),
            op => match op.scan() {
                Some(scan) => (scan, ins.int),
                None => continue,
            },
        };
        let boundary = |i: &Instruction| (i.depth as i64) <= p;
        targets[at] = Some(match scan {
            Scan::Forward => code[at + 1..]
                .iter()
                .position(boundary)
                .map_or(code.len(), |o| at + 1 + o + 1),
            Scan::Backward => match code[..at].iter().rposition(boundary) {
                Some(o) => o + 1,
                None => {
                    return Err(VmError::malformed(
                        name,
                        format!("{} at {} has no boundary at depth {}", ins.op, at, p),
                    ));
                }
            },
        });
    }
    Ok(targets)
}

fn verify(def: &FunctionDef) -> Result<()> {
    let slots = def.locals.max(def.params);
    for (at, ins) in def.code.iter().enumerate() {
        match ins.op {
            Opcode::LoadLocal
            | Opcode::MoveLocal
            | Opcode::StoreLocal
            | Opcode::ShadowSave
            | Opcode::ShadowRestore => {
                if ins.int < 0 || ins.int as usize >= slots {
                    return Err(VmError::malformed(
                        &def.name,
                        format!("{} at {} uses slot {} of {}", ins.op, at, ins.int, slots),
                    ));
                }
            }
            Opcode::LoadGlobal
            | Opcode::StoreGlobal
            | Opcode::GetField
            | Opcode::SetField
            | Opcode::CallDirect
            | Opcode::CallName
            | Opcode::CallMethod
            | Opcode::MakeClosure => {
                if ins.str.is_none() {
                    return Err(VmError::malformed(&def.name, format!("{} at {} needs a name", ins.op, at)));
                }
            }
            Opcode::DeferArm | Opcode::DeferCheck if ins.int < 0 => {
                return Err(VmError::malformed(&def.name, format!("negative defer slot at {}", at)));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Compile a function body. With `fusion` off every instruction becomes its
/// own step.
pub fn compile(def: &FunctionDef, fusion: bool) -> Result<CompiledUnit> {
    verify(def)?;
    let code = def.code.clone();
    let targets = resolve_targets(&def.name, &code)?;

    let defer_entry = code.iter().position(|i| i.op == Opcode::DeferCheck);
    let defer_slots = code
        .iter()
        .filter(|i| matches!(i.op, Opcode::DeferArm | Opcode::DeferCheck))
        .map(|i| i.int as usize + 1)
        .max()
        .unwrap_or(0);

    let mut landings: FastHashSet<usize> = fast_hash_set_new();
    landings.extend(targets.iter().flatten().copied());
    landings.extend(defer_entry);

    let table = patterns::registry();
    let mut steps = Vec::new();
    let mut entry = vec![u32::MAX; code.len()];
    let mut at = 0;
    while at < code.len() {
        let selected = if fusion {
            matcher::select(table, &code, at, &landings)
        } else {
            None
        };
        let step = match selected {
            Some((pattern, len)) => Step {
                start: at,
                len,
                pattern: pattern.name,
                run: (pattern.build)(&code[at..at + len], &targets[at..at + len], &def.name)?,
            },
            None => Step {
                start: at,
                len: 1,
                pattern: "single",
                run: handlers::single(&code[at], targets[at], &def.name)?,
            },
        };
        entry[at] = steps.len() as u32;
        at += step.len;
        steps.push(step);
    }

    let unit = CompiledUnit {
        name: Arc::from(def.name.as_str()),
        params: def.params,
        locals: def.locals,
        variadic: def.variadic,
        generator: def.generator,
        max_stack: max_stack(&code),
        code,
        steps,
        entry,
        defer_entry,
        defer_slots,
    };
    debug!(
        target: "ember::vm::fuse",
        unit = %unit.name,
        instructions = unit.code.len(),
        steps = unit.steps.len(),
        fused = unit.fused_count(),
        "compiled unit"
    );
    Ok(unit)
}
