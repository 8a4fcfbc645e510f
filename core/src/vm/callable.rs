use std::sync::Arc;

use super::dispatch::CompiledUnit;
use super::host::HostFunction;
use crate::pool::Pool;
use crate::val::Value;

/// Heap payload behind a callable value.
pub enum Callable {
    /// Script unit plus the values it captured when the closure was made.
    Script { unit: Arc<CompiledUnit>, captures: Vec<Value> },
    Host { path: Arc<str>, function: HostFunction },
}

impl Callable {
    pub fn script(unit: Arc<CompiledUnit>) -> Self {
        Callable::Script {
            unit,
            captures: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Callable::Script { unit, .. } => &unit.name,
            Callable::Host { path, .. } => path,
        }
    }

    pub(crate) fn recycle(self, values: &mut Pool<Vec<Value>>, sink: &mut Vec<Value>) {
        if let Callable::Script { captures, .. } = self {
            values.checkin(captures, sink);
        }
    }
}
