use super::*;

/// Builds a list of 5, 6, 7 in local 2 and folds it into local 0 with
/// `fold`, which sees the iterator in local 1.
fn define_list_fold(vm: &mut Vm, name: &str, fold: impl FnOnce(&mut CodeBuilder)) {
    define(vm, name, 0, 3, |b| {
        b.int(Opcode::NewStruct, 0).store(2);
        for v in [5, 6, 7] {
            b.load(2).push_int(v).op(Opcode::Append);
        }
        b.push_int(0).store(0);
        b.load(2);
        b.for_each(1, fold);
        b.load(0).int(Opcode::Return, 1);
    });
}

#[test]
fn walk_visits_values_in_order() {
    let mut vm = Vm::default();
    define_list_fold(&mut vm, "sum", |c| {
        c.load(1).op(Opcode::IterValue).load(0).op(Opcode::Add).store(0);
    });
    assert_eq!(run_int(&mut vm, "sum", Vec::new()), 18);

    // (((0 * 10 + 5) * 10 + 6) * 10 + 7)
    define_list_fold(&mut vm, "digits", |c| {
        c.load(0).push_int(10).op(Opcode::Mul).load(1).op(Opcode::IterValue).op(Opcode::Add).store(0);
    });
    assert_eq!(run_int(&mut vm, "digits", Vec::new()), 567);
    assert_eq!(vm.heap.live(), 0);
}

#[test]
fn walk_keys_follow_positions() {
    let mut vm = Vm::default();
    define_list_fold(&mut vm, "keys", |c| {
        c.load(1).op(Opcode::IterKey).load(0).op(Opcode::Add).store(0);
    });
    assert_eq!(run_int(&mut vm, "keys", Vec::new()), 3);
}

#[test]
fn empty_walk_skips_the_body() {
    let mut vm = Vm::default();
    define(&mut vm, "main", 0, 2, |b| {
        b.push_int(1).store(0);
        b.int(Opcode::NewStruct, 0);
        b.for_each(1, |c| {
            c.push_int(100).store(0);
        });
        b.load(0).int(Opcode::Return, 1);
    });
    assert_eq!(run_int(&mut vm, "main", Vec::new()), 1);
    assert_eq!(vm.heap.live(), 0);
}

#[test]
fn iterating_a_number_is_a_type_mismatch() {
    let mut vm = Vm::default();
    define(&mut vm, "main", 0, 1, |b| {
        b.push_int(3);
        b.for_each(0, |_| {});
    });
    let err = run_err(&mut vm, "main");
    assert!(matches!(VmError::of(&err), Some(VmError::TypeMismatch(_))));
}

#[test]
fn host_walks_a_structure() {
    let mut vm = Vm::default();
    let list = vm.heap.alloc_struct(0);
    for s in ["a", "b"] {
        vm.heap.append(&list, Value::string(s), false).unwrap();
    }
    let it = crate::vm::iter::open(&mut vm.heap, list).unwrap();
    let mut seen = Vec::new();
    while let Some(v) = vm.next_value(&it).unwrap() {
        seen.push(v.as_str().unwrap().to_string());
    }
    assert_eq!(seen, vec!["a", "b"]);
    assert!(vm.next_value(&it).unwrap().is_none());
    vm.heap.dispose(it);
    assert_eq!(vm.heap.live(), 0);
}

#[test]
fn generator_feeds_a_loop() {
    let mut vm = Vm::default();
    define_counter(&mut vm, "count");
    define(&mut vm, "main", 0, 2, |b| {
        b.push_int(0).store(0);
        b.push_int(4).str_int(Opcode::CallDirect, "count", 1);
        b.for_each(1, |c| {
            c.load(1).op(Opcode::IterValue).load(0).op(Opcode::Add).store(0);
        });
        b.load(0).int(Opcode::Return, 1);
    });
    assert_eq!(run_int(&mut vm, "main", Vec::new()), 6);
    assert_eq!(vm.heap.live(), 0);
}

#[test]
fn generator_keys_count_yields() {
    let mut vm = Vm::default();
    define_def(
        &mut vm,
        FunctionDef::new(
            "letters",
            0,
            0,
            code(|b| {
                for s in ["x", "y", "z"] {
                    b.push_str(s).int(Opcode::Yield, 1);
                }
            }),
        )
        .generator(),
    );
    define(&mut vm, "main", 0, 3, |b| {
        b.push_int(0).store(0).push_str("").store(2);
        b.str_int(Opcode::CallDirect, "letters", 0);
        b.for_each(1, |c| {
            c.load(1).op(Opcode::IterKey).load(0).op(Opcode::Add).store(0);
            c.load(2).load(1).op(Opcode::IterValue).op(Opcode::Add).store(2);
        });
        b.load(0).load(2).int(Opcode::Return, 2);
    });
    let values = run(&mut vm, "main", Vec::new());
    assert_eq!(values[0].as_int().unwrap(), 3);
    assert_eq!(values[1].as_str(), Some("xyz"));
}

#[test]
fn host_drives_a_generator_to_exhaustion() {
    let mut vm = Vm::default();
    define_counter(&mut vm, "count");
    let it = run(&mut vm, "count", vec![Value::int(3)]).remove(0);
    assert_eq!(vm.heap.iterator(it.heap_ref().unwrap().1).unwrap().state(), IterState::Created);

    let mut seen = Vec::new();
    while let Some(v) = vm.next_value(&it).unwrap() {
        seen.push(v.as_int().unwrap());
    }
    assert_eq!(seen, vec![0, 1, 2]);
    let handle = it.heap_ref().unwrap().1;
    assert_eq!(vm.heap.iterator(handle).unwrap().state(), IterState::Exhausted);
    assert!(vm.next_value(&it).unwrap().is_none());

    vm.heap.dispose(it);
    assert_eq!(vm.heap.live(), 0);
}

#[test]
fn exhausted_generator_never_reenters_script_code() {
    let mut vm = Vm::default();
    // counts its resumptions in `gen.runs`
    define_def(
        &mut vm,
        FunctionDef::new(
            "once",
            0,
            0,
            code(|b| {
                b.str(Opcode::LoadGlobal, "gen.runs").push_int(1).op(Opcode::Add);
                b.str(Opcode::StoreGlobal, "gen.runs");
                b.push_int(1).int(Opcode::Yield, 1);
            }),
        )
        .generator(),
    );
    define(&mut vm, "drain", 1, 3, |b| {
        b.push_int(0).store(1);
        b.load(0);
        b.for_each(2, |c| {
            c.load(1).push_int(1).op(Opcode::Add).store(1);
        });
        b.load(1).int(Opcode::Return, 1);
    });
    vm.globals.define(&mut vm.heap, "gen.runs", Value::int(0), true).unwrap();

    let it = run(&mut vm, "once", Vec::new()).remove(0);
    assert_eq!(run_int(&mut vm, "drain", vec![it.share()]), 1);
    assert_eq!(vm.globals.get("gen.runs").unwrap().as_int().unwrap(), 1);

    for _ in 0..3 {
        assert_eq!(run_int(&mut vm, "drain", vec![it.share()]), 0);
        assert!(vm.next_value(&it).unwrap().is_none());
    }
    assert_eq!(vm.globals.get("gen.runs").unwrap().as_int().unwrap(), 1);
    vm.heap.dispose(it);
}

#[test]
fn generator_error_exhausts_it() {
    let mut vm = Vm::default();
    define_def(
        &mut vm,
        FunctionDef::new(
            "faulty",
            0,
            0,
            code(|b| {
                b.push_int(1).int(Opcode::Yield, 1);
                b.push_str("broken").op(Opcode::Throw);
            }),
        )
        .generator(),
    );
    let it = run(&mut vm, "faulty", Vec::new()).remove(0);
    assert_eq!(vm.next_value(&it).unwrap().unwrap().as_int().unwrap(), 1);

    let err = vm.next_value(&it).unwrap_err();
    assert!(matches!(VmError::of(&err), Some(VmError::Uncaught(m)) if m == "broken"));
    let handle = it.heap_ref().unwrap().1;
    assert_eq!(vm.heap.iterator(handle).unwrap().state(), IterState::Exhausted);
    assert!(vm.next_value(&it).unwrap().is_none());
    vm.heap.dispose(it);
    assert_eq!(vm.heap.live(), 0);
}

#[test]
fn caller_trap_catches_generator_error() {
    let mut vm = Vm::default();
    define_def(
        &mut vm,
        FunctionDef::new(
            "faulty",
            0,
            0,
            code(|b| {
                b.push_str("broken").op(Opcode::Throw);
            }),
        )
        .generator(),
    );
    define(&mut vm, "main", 0, 1, |b| {
        b.trap(
            |body| {
                body.str_int(Opcode::CallDirect, "faulty", 0);
                body.for_each(0, |_| {});
                body.push_str("finished").int(Opcode::Return, 1);
            },
            |handler| {
                handler.int(Opcode::Return, 1);
            },
        );
    });
    let values = run(&mut vm, "main", Vec::new());
    assert_eq!(values[0].as_str(), Some("broken"));
    assert_eq!(vm.heap.live(), 0);
}

#[test]
fn yield_outside_a_generator_is_malformed() {
    let mut vm = Vm::default();
    define(&mut vm, "main", 0, 0, |b| {
        b.push_int(1).int(Opcode::Yield, 1);
    });
    let err = run_err(&mut vm, "main");
    assert!(matches!(VmError::of(&err), Some(VmError::Malformed { .. })));
}
