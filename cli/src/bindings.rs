//! Host functions the runner binds before loading a program.

use std::io::Write;
use std::time::Duration;

use anyhow::Context;
use ember_core::Vm;
use ember_core::vm::{HostCall, HostFunction, HostTask};
use ember_core::Value;

pub(crate) fn register(vm: &mut Vm) -> anyhow::Result<()> {
    vm.register_host("io.print", HostFunction::sync(|call: &mut HostCall<'_>| print(call, false)), true)?;
    vm.register_host("io.println", HostFunction::sync(|call: &mut HostCall<'_>| print(call, true)), true)?;
    vm.register_host("time.sleep", HostFunction::asynchronous(sleep), true)?;
    Ok(())
}

/// Arguments rendered and joined by single spaces.
pub(crate) fn join_args(call: &mut HostCall<'_>) -> String {
    let args = call.rest();
    let line = args.iter().map(|v| call.render(v)).collect::<Vec<_>>().join(" ");
    call.heap().dispose_all(args);
    line
}

fn print(call: &mut HostCall<'_>, newline: bool) -> anyhow::Result<()> {
    let line = join_args(call);
    let mut out = std::io::stdout().lock();
    out.write_all(line.as_bytes())?;
    if newline {
        out.write_all(b"\n")?;
    } else {
        out.flush()?;
    }
    Ok(())
}

/// `time.sleep(ms)` suspends the job on a tokio timer and returns `ms`.
fn sleep(call: &mut HostCall<'_>) -> anyhow::Result<HostTask> {
    call.expect_args(1)?;
    let ms = call.arg().as_int().context("time.sleep expects milliseconds")?;
    if ms < 0 {
        anyhow::bail!("time.sleep expects a non-negative duration, got {}", ms);
    }
    let task: HostTask = Box::pin(async move {
        tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        Ok::<_, anyhow::Error>(vec![Value::int(ms)])
    });
    Ok(task)
}
