pub(super) use std::sync::Arc;

pub(super) use crate::error::VmError;
pub(super) use crate::val::Value;
pub(super) use crate::vm::{
    CodeBuilder, CompiledUnit, EngineConfig, HostCall, HostFunction, IterState, Job, Opcode, Outcome, Vm,
    program::FunctionDef,
};

/// Compile `name` from the code `build` emits.
pub(super) fn define(
    vm: &mut Vm,
    name: &str,
    params: usize,
    locals: usize,
    build: impl FnOnce(&mut CodeBuilder),
) -> Arc<CompiledUnit> {
    let mut b = CodeBuilder::new();
    build(&mut b);
    vm.compile_unit(&FunctionDef::new(name, params, locals, b.build())).unwrap()
}

pub(super) fn define_def(vm: &mut Vm, def: FunctionDef) -> Arc<CompiledUnit> {
    vm.compile_unit(&def).unwrap()
}

pub(super) fn code(build: impl FnOnce(&mut CodeBuilder)) -> Vec<crate::vm::Instruction> {
    let mut b = CodeBuilder::new();
    build(&mut b);
    b.build()
}

/// Run `name` to completion and return its values.
pub(super) fn run(vm: &mut Vm, name: &str, args: Vec<Value>) -> Vec<Value> {
    match vm.call(name, args).unwrap() {
        Outcome::Completed(values) => values,
        other => panic!("{} did not complete: {:?}", name, other),
    }
}

pub(super) fn run_int(vm: &mut Vm, name: &str, args: Vec<Value>) -> i64 {
    let values = run(vm, name, args);
    assert_eq!(values.len(), 1, "expected one value from {}", name);
    values[0].as_int().unwrap()
}

pub(super) fn run_err(vm: &mut Vm, name: &str) -> anyhow::Error {
    match vm.call(name, Vec::new()) {
        Err(err) => err,
        Ok(outcome) => panic!("{} should fail, got {:?}", name, outcome),
    }
}

pub(super) fn global_str(vm: &Vm, path: &str) -> Option<String> {
    vm.globals.get(path).and_then(|v| v.as_str().map(str::to_string))
}

/// Generator yielding `0..n` for its single argument `n`.
pub(super) fn define_counter(vm: &mut Vm, name: &str) {
    let body = code(|b| {
        b.push_int(0).store(1);
        b.while_loop(
            |c| {
                c.load(1).load(0).op(Opcode::Lt);
            },
            |c| {
                c.load(1).int(Opcode::Yield, 1);
                c.load(1).push_int(1).op(Opcode::Add).store(1);
            },
        );
    });
    define_def(vm, FunctionDef::new(name, 1, 2, body).generator());
}

mod calls;
mod errors;
mod host;
mod iteration;
mod loading;
