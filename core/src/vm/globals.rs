use std::sync::Arc;

use anyhow::Result;
use tracing::trace;

use crate::error::VmError;
use crate::pool::Heap;
use crate::util::fast_map::{FastHashMap, fast_hash_map_new};
use crate::val::{Value, ValueFlags};

struct Global {
    value: Value,
    overwritable: bool,
}

/// Global namespace keyed by dotted path.
pub struct Globals {
    entries: FastHashMap<Arc<str>, Global>,
}

impl Default for Globals {
    fn default() -> Self {
        Self::new()
    }
}

impl Globals {
    pub fn new() -> Self {
        Self {
            entries: fast_hash_map_new(),
        }
    }

    /// Bind `path`. Fails with `DuplicateBinding` when an entry exists and
    /// was not marked overwritable.
    pub fn define(&mut self, heap: &mut Heap, path: &str, value: Value, overwritable: bool) -> Result<()> {
        if let Some(existing) = self.entries.get(path)
            && !existing.overwritable
        {
            heap.dispose(value);
            return Err(VmError::DuplicateBinding(path.to_string()).into());
        }
        trace!(target: "ember::vm::globals", path, overwritable, "define");
        let value = value.with_flags(ValueFlags::IS_GLOBAL);
        if let Some(old) = self.entries.insert(Arc::from(path), Global { value, overwritable }) {
            heap.dispose(old.value);
        }
        Ok(())
    }

    /// A share of the bound value, or `Null`.
    pub fn load(&self, path: &str) -> Value {
        self.entries.get(path).map_or_else(Value::null, |g| g.value.share())
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.entries.get(path).map(|g| &g.value)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Script-level assignment. Readonly bindings refuse it.
    pub fn store(&mut self, heap: &mut Heap, path: &str, value: Value) -> Result<()> {
        let value = value.with_flags(ValueFlags::IS_GLOBAL);
        match self.entries.get_mut(path) {
            Some(existing) if existing.value.has_flag(ValueFlags::IS_READONLY) => {
                heap.dispose(value);
                Err(VmError::Readonly(path.to_string()).into())
            }
            Some(existing) => {
                let old = std::mem::replace(&mut existing.value, value);
                heap.dispose(old);
                Ok(())
            }
            None => {
                self.entries.insert(
                    Arc::from(path),
                    Global {
                        value,
                        overwritable: true,
                    },
                );
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bound paths, sorted.
    pub fn paths(&self) -> Vec<Arc<str>> {
        let mut paths: Vec<_> = self.entries.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Drop every binding, disposing owned values.
    pub fn clear(&mut self, heap: &mut Heap) {
        heap.dispose_all(self.entries.drain().map(|(_, g)| g.value));
    }
}
