use super::*;

fn define_add(vm: &mut Vm) {
    define(vm, "add", 2, 2, |b| {
        b.load(0).load(1).op(Opcode::Add).int(Opcode::Return, 1);
    });
}

#[test]
fn direct_call_returns_to_caller_stack() {
    let mut vm = Vm::default();
    define_add(&mut vm);
    define(&mut vm, "main", 0, 0, |b| {
        b.push_int(2).push_int(3).str_int(Opcode::CallDirect, "add", 2);
        b.push_int(10).op(Opcode::Mul).int(Opcode::Return, 1);
    });
    assert_eq!(run_int(&mut vm, "main", Vec::new()), 50);
}

#[test]
fn host_entry_arguments_bind_to_params() {
    let mut vm = Vm::default();
    define_add(&mut vm);
    assert_eq!(run_int(&mut vm, "add", vec![Value::int(40), Value::int(2)]), 42);
}

#[test]
fn empty_return_pushes_null() {
    let mut vm = Vm::default();
    define(&mut vm, "nothing", 0, 0, |b| {
        b.int(Opcode::Return, 0);
    });
    define(&mut vm, "main", 0, 0, |b| {
        b.str_int(Opcode::CallDirect, "nothing", 0).int(Opcode::Return, 1);
    });
    let values = run(&mut vm, "main", Vec::new());
    assert_eq!(values.len(), 1);
    assert!(values[0].is_null());
}

#[test]
fn multiple_return_values_arrive_in_order() {
    let mut vm = Vm::default();
    define(&mut vm, "pair", 0, 0, |b| {
        b.push_int(10).push_int(3).int(Opcode::Return, 2);
    });
    define(&mut vm, "main", 0, 0, |b| {
        b.str_int(Opcode::CallDirect, "pair", 0).op(Opcode::Sub).int(Opcode::Return, 1);
    });
    assert_eq!(run_int(&mut vm, "main", Vec::new()), 7);
    let values = run(&mut vm, "pair", Vec::new());
    assert_eq!(values.iter().map(|v| v.as_int().unwrap()).collect::<Vec<_>>(), vec![10, 3]);
}

#[test]
fn wrong_argument_count_is_reported() {
    let mut vm = Vm::default();
    define_add(&mut vm);
    define(&mut vm, "main", 0, 0, |b| {
        b.push_int(1).str_int(Opcode::CallDirect, "add", 1).int(Opcode::Return, 1);
    });
    let err = run_err(&mut vm, "main");
    match VmError::of(&err) {
        Some(VmError::ParameterCount { callee, expected, got }) => {
            assert_eq!((callee.as_str(), *expected, *got), ("add", 2, 1));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(vm.heap.live(), 0);
}

#[test]
fn variadic_tail_collects_surplus_arguments() {
    let mut vm = Vm::default();
    // first + length(rest)
    define_def(
        &mut vm,
        FunctionDef::new(
            "count_rest",
            2,
            2,
            code(|b| {
                b.load(1).op(Opcode::Length).load(0).op(Opcode::Add).int(Opcode::Return, 1);
            }),
        )
        .variadic(),
    );
    define(&mut vm, "main", 0, 0, |b| {
        b.push_int(100).push_int(1).push_int(2).push_int(3);
        b.str_int(Opcode::CallDirect, "count_rest", 4).int(Opcode::Return, 1);
    });
    assert_eq!(run_int(&mut vm, "main", Vec::new()), 103);
    assert_eq!(run_int(&mut vm, "count_rest", vec![Value::int(5)]), 5);
    assert_eq!(vm.heap.live(), 0);

    let err = vm.call("count_rest", Vec::new()).unwrap_err();
    assert!(matches!(VmError::of(&err), Some(VmError::ParameterCount { expected: 1, got: 0, .. })));
}

#[test]
fn closures_read_their_captures() {
    let mut vm = Vm::default();
    define(&mut vm, "adder", 1, 1, |b| {
        b.int(Opcode::LoadCapture, 0).load(0).op(Opcode::Add).int(Opcode::Return, 1);
    });
    define(&mut vm, "main", 0, 1, |b| {
        b.push_int(10).str_int(Opcode::MakeClosure, "adder", 1).store(0);
        b.load(0).push_int(5).int(Opcode::Call, 1);
        b.load(0).push_int(7).int(Opcode::Call, 1);
        b.op(Opcode::Add).int(Opcode::Return, 1);
    });
    assert_eq!(run_int(&mut vm, "main", Vec::new()), 32);
    assert_eq!(vm.heap.live(), 0);
}

#[test]
fn methods_receive_their_receiver() {
    let mut vm = Vm::default();
    define(&mut vm, "get_x", 0, 0, |b| {
        b.op(Opcode::LoadThis).str(Opcode::GetField, "x").int(Opcode::Return, 1);
    });
    define(&mut vm, "main", 0, 1, |b| {
        b.int(Opcode::NewStruct, 0).store(0);
        b.load(0).push_int(7).str(Opcode::SetField, "x");
        b.load(0).str_int(Opcode::MakeClosure, "get_x", 0).str(Opcode::SetField, "get");
        b.load(0).str_int(Opcode::CallMethod, "get", 0).int(Opcode::Return, 1);
    });
    assert_eq!(run_int(&mut vm, "main", Vec::new()), 7);
    assert_eq!(vm.heap.live(), 0);
}

#[test]
fn missing_method_is_a_type_mismatch() {
    let mut vm = Vm::default();
    define(&mut vm, "main", 0, 0, |b| {
        b.int(Opcode::NewStruct, 0).str_int(Opcode::CallMethod, "nope", 0).int(Opcode::Return, 1);
    });
    let err = run_err(&mut vm, "main");
    assert!(matches!(VmError::of(&err), Some(VmError::TypeMismatch(_))));
    assert_eq!(vm.heap.live(), 0);
}

fn define_depth(vm: &mut Vm) {
    // depth(n) = n <= 0 ? 0 : depth(n - 1) + 1
    define(vm, "depth", 1, 1, |b| {
        b.load(0).push_int(0).op(Opcode::Le);
        b.if_else(
            |t| {
                t.push_int(0).int(Opcode::Return, 1);
            },
            |e| {
                e.load(0).push_int(1).op(Opcode::Sub).str_int(Opcode::CallDirect, "depth", 1);
                e.push_int(1).op(Opcode::Add).int(Opcode::Return, 1);
            },
        );
    });
}

#[test]
fn recursion_unwinds_in_order() {
    let mut vm = Vm::default();
    define_depth(&mut vm);
    assert_eq!(run_int(&mut vm, "depth", vec![Value::int(200)]), 200);
}

#[test]
fn frame_limit_is_fatal() {
    let mut vm = Vm::new(EngineConfig {
        max_frames: 16,
        ..EngineConfig::default()
    });
    define_depth(&mut vm);
    assert_eq!(run_int(&mut vm, "depth", vec![Value::int(10)]), 10);

    let err = vm.call("depth", vec![Value::int(100)]).unwrap_err();
    assert!(VmError::is_fatal(&err), "{:#}", err);
    assert_eq!(vm.heap.live(), 0);
}

#[test]
fn unknown_entry_point_is_rejected() {
    let mut vm = Vm::default();
    let err = vm.call("nowhere", vec![Value::string("arg")]).unwrap_err();
    assert!(matches!(VmError::of(&err), Some(VmError::TypeMismatch(_))));
}

#[test]
fn finalize_discards_pending_values() {
    let mut vm = Vm::default();
    define(&mut vm, "main", 0, 0, |b| {
        b.push_int(1).op(Opcode::Finalize);
    });
    assert!(run(&mut vm, "main", Vec::new()).is_empty());
}

#[test]
fn return_locals_hands_back_selected_slots() {
    let mut vm = Vm::default();
    define(&mut vm, "main", 0, 3, |b| {
        b.push_int(1).store(0).push_int(2).store(1).push_int(3).store(2);
        b.int(Opcode::ReturnLocals, 0b101);
    });
    let values = run(&mut vm, "main", Vec::new());
    assert_eq!(values.iter().map(|v| v.as_int().unwrap()).collect::<Vec<_>>(), vec![1, 3]);
}

#[test]
fn shadowed_locals_are_restored() {
    let mut vm = Vm::default();
    define(&mut vm, "main", 0, 1, |b| {
        b.push_int(1).store(0);
        b.int(Opcode::ShadowSave, 0);
        b.push_int(99).store(0);
        b.int(Opcode::ShadowRestore, 0);
        b.load(0).int(Opcode::Return, 1);
    });
    assert_eq!(run_int(&mut vm, "main", Vec::new()), 1);
}

#[test]
fn globals_are_shared_between_calls() {
    let mut vm = Vm::default();
    define(&mut vm, "bump", 0, 0, |b| {
        b.str(Opcode::LoadGlobal, "counter").push_int(1).op(Opcode::Add);
        b.str(Opcode::StoreGlobal, "counter");
    });
    vm.globals.define(&mut vm.heap, "counter", Value::int(0), true).unwrap();
    for _ in 0..3 {
        run(&mut vm, "bump", Vec::new());
    }
    assert_eq!(vm.globals.get("counter").unwrap().as_int().unwrap(), 3);
}

#[test]
fn variadic_without_params_drops_surplus_arguments() {
    let mut vm = Vm::default();
    define_def(
        &mut vm,
        FunctionDef::new(
            "ignore",
            0,
            0,
            code(|b| {
                b.push_int(1).int(Opcode::Return, 1);
            }),
        )
        .variadic(),
    );
    let arg = vm.heap.alloc_struct(0);
    assert_eq!(run_int(&mut vm, "ignore", vec![arg, Value::string("x")]), 1);
    assert_eq!(vm.heap.live(), 0);

    define(&mut vm, "main", 0, 0, |b| {
        b.int(Opcode::NewStruct, 0).int(Opcode::NewStruct, 0);
        b.str_int(Opcode::CallDirect, "ignore", 2).int(Opcode::Return, 1);
    });
    assert_eq!(run_int(&mut vm, "main", Vec::new()), 1);
    assert_eq!(vm.heap.live(), 0);
}

#[test]
fn oversized_capacity_hints_still_allocate() {
    let mut vm = Vm::default();
    define(&mut vm, "main", 0, 0, |b| {
        b.int(Opcode::NewStruct, i64::MAX).op(Opcode::Length);
        b.int(Opcode::NewQueue, i64::MAX).op(Opcode::Length);
        b.op(Opcode::Add).int(Opcode::Return, 1);
    });
    assert_eq!(run_int(&mut vm, "main", Vec::new()), 0);
    assert_eq!(vm.heap.live(), 0);
}
