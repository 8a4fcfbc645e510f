use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use futures::channel::oneshot;

use super::*;
use crate::vm::{HostTask, Scheduler};

fn register_math(vm: &mut Vm) {
    vm.register_host(
        "math.add",
        HostFunction::sync(|call: &mut HostCall<'_>| {
            call.expect_args(2)?;
            let a = call.arg().as_int()?;
            let b = call.arg().as_int()?;
            call.ret(Value::int(a + b));
            Ok(())
        }),
        false,
    )
    .unwrap();
}

#[test]
fn sync_host_functions_return_through_the_channel() {
    let mut vm = Vm::default();
    register_math(&mut vm);
    define(&mut vm, "main", 0, 0, |b| {
        b.push_int(2).push_int(40).str_int(Opcode::CallName, "math.add", 2).int(Opcode::Return, 1);
    });
    assert_eq!(run_int(&mut vm, "main", Vec::new()), 42);
    // bound paths are callable from the host as well
    assert_eq!(run_int(&mut vm, "math.add", vec![Value::int(1), Value::int(2)]), 3);
}

#[test]
fn host_argument_errors_are_catchable() {
    let mut vm = Vm::default();
    register_math(&mut vm);
    define(&mut vm, "main", 0, 0, |b| {
        b.trap(
            |body| {
                body.push_int(1).str_int(Opcode::CallName, "math.add", 1).op(Opcode::Pop);
            },
            |handler| {
                handler.int(Opcode::Return, 1);
            },
        );
    });
    let values = run(&mut vm, "main", Vec::new());
    assert_eq!(values[0].as_str(), Some("math.add expects 2 argument(s), got 1"));
}

#[test]
fn host_values_and_receivers() {
    let mut vm = Vm::default();
    vm.register_host(
        "io.silent",
        HostFunction::sync(|call: &mut HostCall<'_>| {
            let _ = call.rest();
            Ok(())
        }),
        false,
    )
    .unwrap();
    vm.register_host(
        "obj.describe",
        HostFunction::sync(|call: &mut HostCall<'_>| {
            let text = format!("{} via {}", call.render(call.this()), call.path());
            call.ret(Value::string(text));
            Ok(())
        }),
        false,
    )
    .unwrap();
    define(&mut vm, "silent", 0, 0, |b| {
        b.push_int(1).push_int(2).str_int(Opcode::CallName, "io.silent", 2).int(Opcode::Return, 1);
    });
    let values = run(&mut vm, "silent", Vec::new());
    assert!(values[0].is_null());

    define(&mut vm, "method", 0, 1, |b| {
        b.int(Opcode::NewStruct, 0).store(0);
        b.load(0).push_int(3).str(Opcode::SetField, "n");
        b.load(0).str(Opcode::LoadGlobal, "obj.describe").str(Opcode::SetField, "describe");
        b.load(0).str_int(Opcode::CallMethod, "describe", 0).int(Opcode::Return, 1);
    });
    let values = run(&mut vm, "method", Vec::new());
    let text = values[0].as_str().unwrap();
    assert!(text.starts_with("{describe: <&callable @"), "{}", text);
    assert!(text.ends_with(", n: 3} via obj.describe"), "{}", text);
}

#[test]
fn duplicate_host_bindings() {
    let mut vm = Vm::default();
    register_math(&mut vm);
    let dup = vm.register_host("math.add", HostFunction::sync(|_: &mut HostCall<'_>| Ok(())), false);
    assert!(matches!(VmError::of(&dup.unwrap_err()), Some(VmError::DuplicateBinding(_))));

    let noop = || HostFunction::sync(|_: &mut HostCall<'_>| Ok(()));
    vm.register_host("io.flush", noop(), true).unwrap();
    vm.register_host("io.flush", noop(), true).unwrap();
    assert_eq!(vm.globals.len(), 2);
    assert_eq!(vm.heap.live(), 2);
}

fn define_loop(vm: &mut Vm, name: &str, limit: i64) {
    define(vm, name, 0, 1, |b| {
        b.push_int(0).store(0);
        b.while_loop(
            |c| {
                c.load(0).push_int(limit).op(Opcode::Lt);
            },
            |c| {
                c.load(0).push_int(1).op(Opcode::Add).store(0);
            },
        );
        b.load(0).int(Opcode::Return, 1);
    });
}

#[test]
fn bounded_runs_halt_and_resume() {
    let mut vm = Vm::default();
    define_loop(&mut vm, "main", 50);
    let mut job = Job::new();
    job.call(&mut vm, "main", Vec::new()).unwrap();
    let mut halts = 0;
    let values = loop {
        match job.run_bounded(&mut vm, 8).unwrap() {
            Outcome::Halted => halts += 1,
            Outcome::Completed(values) => break values,
            Outcome::Aborted => panic!("aborted"),
        }
    };
    assert_eq!(values[0].as_int().unwrap(), 50);
    assert!(halts > 5, "only {} halts", halts);
    assert!(job.is_idle());
}

#[test]
fn scheduler_interleaves_jobs() {
    let mut vm = Vm::default();
    define_loop(&mut vm, "short", 3);
    define_loop(&mut vm, "long", 40);
    define(&mut vm, "broken", 0, 0, |b| {
        b.push_str("no").op(Opcode::Throw);
    });

    let mut scheduler = Scheduler::new(6);
    for name in ["long", "broken", "short"] {
        let mut job = Job::new();
        job.call(&mut vm, name, Vec::new()).unwrap();
        scheduler.spawn(job);
    }
    assert_eq!(scheduler.pending(), 3);
    let reports = scheduler.run(&mut vm);
    assert_eq!(scheduler.pending(), 0);

    let order: Vec<usize> = reports.iter().map(|r| r.id).collect();
    assert_eq!(order, vec![1, 2, 0]);
    assert!(reports[0].outcome.is_err());
    let long = reports.iter().find(|r| r.id == 0).unwrap();
    assert!(long.slices > 1);
    match &long.outcome {
        Ok(Outcome::Completed(values)) => assert_eq!(values[0].as_int().unwrap(), 40),
        other => panic!("unexpected {:?}", other),
    }
}

fn register_double(vm: &mut Vm) {
    vm.register_host(
        "async.double",
        HostFunction::asynchronous(|call: &mut HostCall<'_>| {
            let x = call.arg().as_int()?;
            let task: HostTask = Box::pin(async move { Ok::<_, anyhow::Error>(vec![Value::int(x * 2)]) });
            Ok(task)
        }),
        false,
    )
    .unwrap();
}

#[test]
fn blocking_run_waits_for_host_tasks() {
    let mut vm = Vm::default();
    register_double(&mut vm);
    define(&mut vm, "main", 0, 0, |b| {
        b.push_int(21).str_int(Opcode::CallName, "async.double", 1);
        b.push_int(1).op(Opcode::Add).int(Opcode::Return, 1);
    });
    assert_eq!(run_int(&mut vm, "main", Vec::new()), 43);
}

#[test]
fn bounded_run_halts_while_a_task_is_pending() {
    let mut vm = Vm::default();
    let sender: Rc<RefCell<Option<oneshot::Sender<i64>>>> = Rc::new(RefCell::new(None));
    let slot = sender.clone();
    vm.register_host(
        "wait.value",
        HostFunction::asynchronous(move |_: &mut HostCall<'_>| {
            let (tx, rx) = oneshot::channel();
            *slot.borrow_mut() = Some(tx);
            let task: HostTask = Box::pin(async move { Ok::<_, anyhow::Error>(vec![Value::int(rx.await?)]) });
            Ok(task)
        }),
        false,
    )
    .unwrap();
    define(&mut vm, "main", 0, 0, |b| {
        b.str_int(Opcode::CallName, "wait.value", 0).int(Opcode::Return, 1);
    });

    let mut job = Job::new();
    job.call(&mut vm, "main", Vec::new()).unwrap();
    assert!(matches!(job.run_bounded(&mut vm, 100).unwrap(), Outcome::Halted));
    assert!(job.is_waiting());
    assert!(matches!(job.run_bounded(&mut vm, 100).unwrap(), Outcome::Halted));

    sender.borrow_mut().take().unwrap().send(9).unwrap();
    let values = job.run_bounded(&mut vm, 100).unwrap().into_values();
    assert_eq!(values[0].as_int().unwrap(), 9);
}

#[test]
fn failed_host_task_raises_in_the_caller() {
    let mut vm = Vm::default();
    vm.register_host(
        "net.fetch",
        HostFunction::asynchronous(|_: &mut HostCall<'_>| {
            let task: HostTask = Box::pin(async { Err::<Vec<Value>, _>(anyhow::anyhow!("connection refused")) });
            Ok(task)
        }),
        false,
    )
    .unwrap();
    define(&mut vm, "main", 0, 0, |b| {
        b.trap(
            |body| {
                body.str_int(Opcode::CallName, "net.fetch", 0).op(Opcode::Pop);
            },
            |handler| {
                handler.int(Opcode::Return, 1);
            },
        );
    });
    let values = run(&mut vm, "main", Vec::new());
    assert_eq!(values[0].as_str(), Some("connection refused"));
}

#[tokio::test]
async fn async_run_awaits_runtime_tasks() {
    let mut vm = Vm::new(EngineConfig {
        yield_interval: 4,
        ..EngineConfig::default()
    });
    vm.register_host(
        "time.nap",
        HostFunction::asynchronous(|call: &mut HostCall<'_>| {
            let ms = call.arg().as_int()?;
            let task: HostTask = Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(ms as u64)).await;
                Ok::<_, anyhow::Error>(vec![Value::int(ms)])
            });
            Ok(task)
        }),
        false,
    )
    .unwrap();
    define_loop(&mut vm, "spin", 30);
    define(&mut vm, "main", 0, 0, |b| {
        b.push_int(2).str_int(Opcode::CallName, "time.nap", 1);
        b.str_int(Opcode::CallDirect, "spin", 0);
        b.op(Opcode::Add).int(Opcode::Return, 1);
    });

    let mut job = Job::new();
    job.call(&mut vm, "main", Vec::new()).unwrap();
    let values = job.run_async(&mut vm).await.unwrap().into_values();
    assert_eq!(values[0].as_int().unwrap(), 32);
}

#[tokio::test(flavor = "current_thread")]
async fn async_run_lets_sibling_tasks_progress() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let mut vm = Vm::new(EngineConfig {
        yield_interval: 8,
        ..EngineConfig::default()
    });
    define_loop(&mut vm, "spin", 2_000);

    let ticks = Arc::new(AtomicUsize::new(0));
    let sibling = tokio::spawn({
        let ticks = ticks.clone();
        async move {
            loop {
                ticks.fetch_add(1, Ordering::Relaxed);
                tokio::task::yield_now().await;
            }
        }
    });

    let mut job = Job::new();
    job.call(&mut vm, "spin", Vec::new()).unwrap();
    let values = job.run_async(&mut vm).await.unwrap().into_values();
    assert_eq!(values[0].as_int().unwrap(), 2_000);
    assert!(ticks.load(Ordering::Relaxed) > 1, "sibling never ran while the job spun");
    sibling.abort();
    assert_eq!(vm.heap.live(), 0);
}
