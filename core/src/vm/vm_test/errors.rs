use std::cell::RefCell;
use std::rc::Rc;

use super::*;

#[test]
fn trap_receives_thrown_value() {
    let mut vm = Vm::default();
    define(&mut vm, "main", 0, 0, |b| {
        b.trap(
            |body| {
                body.push_int(42).op(Opcode::Throw);
            },
            |handler| {
                handler.push_int(1).op(Opcode::Add).int(Opcode::Return, 1);
            },
        );
        b.push_int(0).int(Opcode::Return, 1);
    });
    assert_eq!(run_int(&mut vm, "main", Vec::new()), 43);
}

#[test]
fn cleared_trap_is_skipped() {
    let mut vm = Vm::default();
    define(&mut vm, "main", 0, 0, |b| {
        b.trap(
            |body| {
                body.push_int(1).op(Opcode::Pop);
            },
            |handler| {
                handler.int(Opcode::Return, 1);
            },
        );
        b.push_int(5).int(Opcode::Return, 1);
    });
    assert_eq!(run_int(&mut vm, "main", Vec::new()), 5);
}

#[test]
fn throw_unwinds_into_the_callers_trap() {
    let mut vm = Vm::default();
    define(&mut vm, "thrower", 0, 1, |b| {
        b.int(Opcode::NewStruct, 0).store(0);
        b.push_str("boom").op(Opcode::Throw);
    });
    define(&mut vm, "main", 0, 0, |b| {
        b.trap(
            |body| {
                body.str_int(Opcode::CallDirect, "thrower", 0).op(Opcode::Pop);
            },
            |handler| {
                handler.int(Opcode::Return, 1);
            },
        );
    });
    let values = run(&mut vm, "main", Vec::new());
    assert_eq!(values[0].as_str(), Some("boom"));
    // the thrower's frame and its structure are gone
    assert_eq!(vm.heap.live(), 0);
}

#[test]
fn uncaught_throw_surfaces_rendered_value() {
    let mut vm = Vm::default();
    define(&mut vm, "main", 0, 0, |b| {
        b.int(Opcode::NewStruct, 0).op(Opcode::Dup).push_str("bad").str(Opcode::SetField, "reason");
        b.op(Opcode::Throw);
    });
    let err = run_err(&mut vm, "main");
    match VmError::of(&err) {
        Some(VmError::Uncaught(text)) => assert_eq!(text, r#"{reason: "bad"}"#),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(vm.heap.live(), 0);
}

#[test]
fn runtime_errors_are_catchable() {
    let mut vm = Vm::default();
    define(&mut vm, "main", 0, 0, |b| {
        b.trap(
            |body| {
                body.int(Opcode::NewStruct, 0).push_int(1).op(Opcode::Add).op(Opcode::Pop);
            },
            |handler| {
                handler.int(Opcode::Return, 1);
            },
        );
    });
    let values = run(&mut vm, "main", Vec::new());
    assert!(values[0].as_str().unwrap().starts_with("type mismatch"));
    assert_eq!(vm.heap.live(), 0);
}

#[test]
fn fatal_skips_traps() {
    let mut vm = Vm::default();
    define(&mut vm, "main", 0, 0, |b| {
        b.trap(
            |body| {
                body.str(Opcode::Fatal, "stop");
            },
            |handler| {
                handler.int(Opcode::Return, 1);
            },
        );
    });
    let err = run_err(&mut vm, "main");
    assert!(matches!(VmError::of(&err), Some(VmError::Fatal(m)) if m == "stop"));
}

/// Arms the blocks in `armed`, then runs `body`. Block `k` records itself
/// in global `defer.k`.
fn define_deferring(vm: &mut Vm, name: &str, armed: &[i64], body: impl FnOnce(&mut CodeBuilder)) {
    define(vm, name, 0, 0, |b| {
        for k in armed {
            b.int(Opcode::DeferArm, *k);
        }
        body(b);
        for k in 0..2 {
            b.deferred(k, |d| {
                d.push_str("ran").str(Opcode::StoreGlobal, &format!("defer.{}", k));
            });
        }
        b.op(Opcode::DeferEnd);
    });
}

#[test]
fn armed_defers_run_before_return() {
    let mut vm = Vm::default();
    define_deferring(&mut vm, "main", &[1], |b| {
        b.push_int(5).int(Opcode::Return, 1);
    });
    assert_eq!(run_int(&mut vm, "main", Vec::new()), 5);
    assert_eq!(global_str(&vm, "defer.0"), None);
    assert_eq!(global_str(&vm, "defer.1").as_deref(), Some("ran"));
}

#[test]
fn double_arming_runs_a_block_once() {
    let mut vm = Vm::default();
    define_deferring(&mut vm, "main", &[0, 0, 1], |b| {
        b.int(Opcode::Return, 0);
    });
    assert!(run(&mut vm, "main", Vec::new()).is_empty());
    assert_eq!(global_str(&vm, "defer.0").as_deref(), Some("ran"));
    assert_eq!(global_str(&vm, "defer.1").as_deref(), Some("ran"));
}

#[test]
fn defers_run_on_error_then_rethrow() {
    let mut vm = Vm::default();
    define_deferring(&mut vm, "main", &[0], |b| {
        b.push_str("oops").op(Opcode::Throw);
    });
    let err = run_err(&mut vm, "main");
    assert!(matches!(VmError::of(&err), Some(VmError::Uncaught(m)) if m == "oops"));
    assert_eq!(global_str(&vm, "defer.0").as_deref(), Some("ran"));
}

#[test]
fn callers_trap_sees_error_after_callee_defers() {
    let mut vm = Vm::default();
    define_deferring(&mut vm, "risky", &[0], |b| {
        b.push_str("oops").op(Opcode::Throw);
    });
    define(&mut vm, "main", 0, 0, |b| {
        b.trap(
            |body| {
                body.str_int(Opcode::CallDirect, "risky", 0).op(Opcode::Pop);
            },
            |handler| {
                handler.int(Opcode::Return, 1);
            },
        );
    });
    let values = run(&mut vm, "main", Vec::new());
    assert_eq!(values[0].as_str(), Some("oops"));
    assert_eq!(global_str(&vm, "defer.0").as_deref(), Some("ran"));
}

#[test]
fn fatal_skips_defers() {
    let mut vm = Vm::default();
    define_deferring(&mut vm, "main", &[0], |b| {
        b.str(Opcode::Fatal, "halt");
    });
    let err = run_err(&mut vm, "main");
    assert!(VmError::is_fatal(&err));
    assert_eq!(global_str(&vm, "defer.0"), None);
}

#[test]
fn error_hook_turns_failures_into_aborts() {
    let mut vm = Vm::default();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    vm.set_error_hook(move |err| sink.borrow_mut().push(err.to_string()));
    define(&mut vm, "main", 0, 0, |b| {
        b.push_str("nope").op(Opcode::Throw);
    });
    assert!(matches!(vm.call("main", Vec::new()).unwrap(), Outcome::Aborted));
    assert_eq!(seen.borrow().as_slice(), ["uncaught throw: nope"]);

    vm.clear_error_hook();
    assert!(vm.call("main", Vec::new()).is_err());
    assert_eq!(seen.borrow().len(), 1);
}

#[test]
fn readonly_globals_refuse_stores() {
    let mut vm = Vm::default();
    let value = Value::int(1).with_flags(crate::val::ValueFlags::IS_READONLY);
    vm.globals.define(&mut vm.heap, "limits.max", value, false).unwrap();
    define(&mut vm, "main", 0, 0, |b| {
        b.push_int(2).str(Opcode::StoreGlobal, "limits.max");
    });
    let err = run_err(&mut vm, "main");
    assert!(matches!(VmError::of(&err), Some(VmError::Readonly(p)) if p == "limits.max"));
    assert_eq!(vm.globals.get("limits.max").unwrap().as_int().unwrap(), 1);
}

#[test]
fn released_values_become_stale() {
    let mut vm = Vm::default();
    define(&mut vm, "main", 0, 1, |b| {
        b.int(Opcode::NewStruct, 0).store(0);
        b.int(Opcode::MoveLocal, 0).op(Opcode::Dup).op(Opcode::Swap).op(Opcode::Release);
        b.op(Opcode::Length).int(Opcode::Return, 1);
    });
    let err = run_err(&mut vm, "main");
    assert!(matches!(VmError::of(&err), Some(VmError::StalePointer { .. })));
    assert_eq!(vm.heap.live(), 0);
}

#[test]
fn releasing_a_pointer_is_refused() {
    let mut vm = Vm::default();
    define(&mut vm, "main", 0, 1, |b| {
        b.int(Opcode::NewStruct, 0).store(0);
        b.load(0).op(Opcode::Release);
    });
    let err = run_err(&mut vm, "main");
    assert!(matches!(VmError::of(&err), Some(VmError::UnownedRelease)));
    assert_eq!(vm.heap.live(), 0);
}
