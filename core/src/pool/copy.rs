use anyhow::Result;

use super::heap::{Heap, HeapObject};
use crate::error::VmError;
use crate::val::{HeapKind, Value};
use crate::vm::callable::Callable;

const EQUAL_DEPTH: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Depth {
    Deep,
    Shallow,
}

impl Heap {
    /// Structurally identical copy sharing no owned content with the source.
    /// Pointers held inside are copied as pointers.
    pub fn deep_copy(&mut self, value: &Value) -> Result<Value> {
        self.copy_value(value, Depth::Deep)
    }

    /// New top-level object whose children alias the source's children.
    pub fn shallow_copy(&mut self, value: &Value) -> Result<Value> {
        self.copy_value(value, Depth::Shallow)
    }

    fn copy_value(&mut self, value: &Value, depth: Depth) -> Result<Value> {
        let Some((kind, handle)) = value.heap_ref() else {
            return Ok(value.share());
        };
        match kind {
            HeapKind::Iterator | HeapKind::External => {
                return Err(VmError::TypeMismatch(format!("cannot copy a value of kind {}", kind.name())).into());
            }
            HeapKind::Struct | HeapKind::Callable => {}
        }
        // the source leaves its slot while its children are copied; owned
        // children form a tree, so recursion never meets it again
        let object = self.borrow_out(handle)?;
        let copied = self.copy_object(&object, depth);
        self.restore(handle, object);
        copied
    }

    fn copy_children<'a>(&mut self, children: impl Iterator<Item = &'a Value>, depth: Depth) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        for child in children {
            let copy = if depth == Depth::Deep && child.owns_heap() {
                self.copy_value(child, Depth::Deep)
            } else {
                Ok(child.share())
            };
            match copy {
                Ok(v) => out.push(v),
                Err(err) => {
                    self.dispose_all(out);
                    return Err(err);
                }
            }
        }
        Ok(out)
    }

    fn copy_object(&mut self, object: &HeapObject, depth: Depth) -> Result<Value> {
        match object {
            HeapObject::Struct(s) => {
                let values = self.copy_children(s.values().into_iter(), depth)?;
                let copy = s.rebuild_like(&mut self.pools.structs, values);
                Ok(self.alloc(HeapObject::Struct(copy)))
            }
            HeapObject::Callable(Callable::Script { unit, captures }) => {
                let copied = self.copy_children(captures.iter(), depth)?;
                let mut pooled = self.pools.values.checkout(copied.len());
                pooled.extend(copied);
                Ok(self.alloc(HeapObject::Callable(Callable::Script {
                    unit: unit.clone(),
                    captures: pooled,
                })))
            }
            HeapObject::Callable(Callable::Host { path, function }) => Ok(self.alloc(HeapObject::Callable(
                Callable::Host {
                    path: path.clone(),
                    function: function.clone(),
                },
            ))),
            HeapObject::Iterator(_) | HeapObject::External(_) => {
                Err(VmError::TypeMismatch(format!("cannot copy a value of kind {}", object.kind().name())).into())
            }
        }
    }

    /// Same keys, recursively equal children. Non-structures compare with
    /// [`Value::contents_equal`]. Past [`EQUAL_DEPTH`] levels structures only
    /// compare by identity.
    pub fn structurally_equal(&self, a: &Value, b: &Value) -> Result<bool> {
        self.equal_at(a, b, 0)
    }

    fn equal_at(&self, a: &Value, b: &Value, depth: usize) -> Result<bool> {
        let (Ok(sa), Ok(sb)) = (self.structure(a), self.structure(b)) else {
            for v in [a, b] {
                if v.heap_ref().is_some() {
                    self.resolve(v)?;
                }
            }
            return Ok(a.contents_equal(b));
        };
        if a.heap_ref() == b.heap_ref() {
            return Ok(true);
        }
        if depth >= EQUAL_DEPTH {
            return Ok(false);
        }
        if sa.len() != sb.len() {
            return Ok(false);
        }
        for ((ka, va), (kb, vb)) in sa.sorted_entries().into_iter().zip(sb.sorted_entries()) {
            if ka != kb || !self.equal_at(va, vb, depth + 1)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
