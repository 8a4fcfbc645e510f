//! Calling convention for functions provided by the embedding program.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;

use super::channel::Channel;
use crate::error::VmError;
use crate::pool::Heap;
use crate::val::Value;

/// Pending work of an async host function; resolves to the returned values.
pub type HostTask = Pin<Box<dyn Future<Output = Result<Vec<Value>>>>>;

pub type SyncHostFn = dyn Fn(&mut HostCall<'_>) -> Result<()>;
pub type AsyncHostFn = dyn Fn(&mut HostCall<'_>) -> Result<HostTask>;

#[derive(Clone)]
pub enum HostFunction {
    Sync(Arc<SyncHostFn>),
    /// Reads its arguments up front and hands back a task the engine awaits.
    Async(Arc<AsyncHostFn>),
}

impl HostFunction {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&mut HostCall<'_>) -> Result<()> + 'static,
    {
        HostFunction::Sync(Arc::new(f))
    }

    pub fn asynchronous<F>(f: F) -> Self
    where
        F: Fn(&mut HostCall<'_>) -> Result<HostTask> + 'static,
    {
        HostFunction::Async(Arc::new(f))
    }
}

impl std::fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostFunction::Sync(_) => f.write_str("HostFunction::Sync"),
            HostFunction::Async(_) => f.write_str("HostFunction::Async"),
        }
    }
}

/// One invocation of a host function.
///
/// Arguments arrive through the transfer channel and are read in order;
/// returned values are pushed back into it.
pub struct HostCall<'a> {
    path: &'a str,
    cursor: usize,
    this: Value,
    args: std::vec::IntoIter<Value>,
    heap: &'a mut Heap,
    channel: &'a mut Channel,
}

impl<'a> HostCall<'a> {
    pub(crate) fn new(
        path: &'a str,
        cursor: usize,
        this: Value,
        args: Vec<Value>,
        heap: &'a mut Heap,
        channel: &'a mut Channel,
    ) -> Self {
        Self {
            path,
            cursor,
            this,
            args: args.into_iter(),
            heap,
            channel,
        }
    }

    pub fn path(&self) -> &str {
        self.path
    }

    /// Position of the calling instruction's successor in the caller.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn this(&self) -> &Value {
        &self.this
    }

    /// Next argument; `Null` once they run out.
    pub fn arg(&mut self) -> Value {
        self.args.next().unwrap_or_default()
    }

    /// Every argument not read yet.
    pub fn rest(&mut self) -> Vec<Value> {
        self.args.by_ref().collect()
    }

    pub fn remaining(&self) -> usize {
        self.args.len()
    }

    /// Fail unless exactly `n` arguments remain unread.
    pub fn expect_args(&self, n: usize) -> Result<()> {
        let got = self.args.len();
        if got != n {
            return Err(VmError::ParameterCount {
                callee: self.path.to_string(),
                expected: n,
                got,
            }
            .into());
        }
        Ok(())
    }

    pub fn ret(&mut self, value: Value) {
        self.channel.push(value);
    }

    pub fn heap(&mut self) -> &mut Heap {
        self.heap
    }

    /// Text form of a value, following structures.
    pub fn render(&self, value: &Value) -> String {
        self.heap.render(value)
    }

    /// Dispose whatever the host left unread.
    pub(crate) fn finish(self) {
        let HostCall { this, args, heap, .. } = self;
        heap.dispose_all(args);
        heap.dispose(this);
    }
}
