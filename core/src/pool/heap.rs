use std::any::Any;
use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::trace;

use super::{Pool, PoolStats};
use crate::error::VmError;
use crate::structure::{DynStruct, Layout, StructPools};
use crate::val::{Data, Handle, HeapKind, Key, Value};
use crate::vm::callable::Callable;
use crate::vm::frame::Frame;
use crate::vm::iter::IterObject;

/// Host-defined payload carried by an `External` value.
pub struct External {
    pub type_name: Arc<str>,
    pub payload: Box<dyn Any>,
}

impl External {
    pub fn new<T: Any>(type_name: &str, payload: T) -> Self {
        Self {
            type_name: Arc::from(type_name),
            payload: Box::new(payload),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }
}

pub enum HeapObject {
    Struct(DynStruct),
    Callable(Callable),
    Iterator(IterObject),
    External(External),
}

impl HeapObject {
    pub fn kind(&self) -> HeapKind {
        match self {
            HeapObject::Struct(_) => HeapKind::Struct,
            HeapObject::Callable(_) => HeapKind::Callable,
            HeapObject::Iterator(_) => HeapKind::Iterator,
            HeapObject::External(_) => HeapKind::External,
        }
    }
}

struct Slot {
    generation: u32,
    object: Option<HeapObject>,
}

/// Every pool the VM recycles through.
pub struct Pools {
    pub structs: StructPools,
    pub values: Pool<Vec<Value>>,
    pub frames: Pool<Frame>,
}

impl Default for Pools {
    fn default() -> Self {
        Self {
            structs: StructPools::default(),
            values: Pool::new("values"),
            frames: Pool::new("frames"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub live: usize,
    pub slots: usize,
    pub retired: usize,
    pub frames: PoolStats,
    pub dense: PoolStats,
}

/// Handle table. Releasing a slot bumps its generation, which invalidates
/// every pointer taken before.
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    retired: usize,
    live: usize,
    pub pools: Pools,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

const RENDER_DEPTH: usize = 16;

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            retired: 0,
            live: 0,
            pools: Pools::default(),
        }
    }

    pub fn alloc(&mut self, object: HeapObject) -> Value {
        let kind = object.kind();
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    object: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.object = Some(object);
        self.live += 1;
        Value::owned(kind, Handle::new(index, slot.generation))
    }

    pub fn alloc_struct(&mut self, capacity: usize) -> Value {
        let s = DynStruct::new(&mut self.pools.structs, capacity);
        self.alloc(HeapObject::Struct(s))
    }

    pub fn alloc_queue(&mut self, limit: usize) -> Value {
        let s = DynStruct::queue(&mut self.pools.structs, limit);
        self.alloc(HeapObject::Struct(s))
    }

    pub fn alloc_external(&mut self, external: External) -> Value {
        self.alloc(HeapObject::External(external))
    }

    fn stale(&self, handle: Handle) -> anyhow::Error {
        let current = self.slots.get(handle.index as usize).map_or(0, |s| s.generation);
        VmError::StalePointer {
            index: handle.index,
            observed: handle.generation,
            current,
        }
        .into()
    }

    fn slot(&self, handle: Handle) -> Result<&HeapObject> {
        match self.slots.get(handle.index as usize) {
            Some(Slot {
                generation,
                object: Some(object),
            }) if *generation == handle.generation => Ok(object),
            _ => Err(self.stale(handle)),
        }
    }

    fn slot_mut(&mut self, handle: Handle) -> Result<&mut HeapObject> {
        let ok = matches!(
            self.slots.get(handle.index as usize),
            Some(Slot { generation, object: Some(_) }) if *generation == handle.generation
        );
        if !ok {
            return Err(self.stale(handle));
        }
        self.slots[handle.index as usize]
            .object
            .as_mut()
            .ok_or_else(|| anyhow!("heap slot {} emptied during access", handle.index))
    }

    /// Whether a reference still points at the object it was taken from.
    pub fn is_live(&self, value: &Value) -> bool {
        value.heap_ref().is_some_and(|(_, h)| self.slot(h).is_ok())
    }

    pub fn resolve(&self, value: &Value) -> Result<&HeapObject> {
        let (_, handle) = value.heap_ref().ok_or_else(|| VmError::type_mismatch("reference", value))?;
        self.slot(handle)
    }

    fn expect_ref(value: &Value, kind: HeapKind) -> Result<Handle> {
        match value.heap_ref() {
            Some((k, handle)) if k == kind => Ok(handle),
            _ => Err(VmError::type_mismatch(kind.name(), value)),
        }
    }

    pub fn structure(&self, value: &Value) -> Result<&DynStruct> {
        match self.slot(Self::expect_ref(value, HeapKind::Struct)?)? {
            HeapObject::Struct(s) => Ok(s),
            _ => Err(VmError::type_mismatch("struct", value)),
        }
    }

    pub fn structure_mut(&mut self, value: &Value) -> Result<&mut DynStruct> {
        Ok(self.struct_parts(value)?.0)
    }

    /// The structure plus the pools its migrations draw from.
    pub fn struct_parts(&mut self, value: &Value) -> Result<(&mut DynStruct, &mut StructPools)> {
        let handle = Self::expect_ref(value, HeapKind::Struct)?;
        if self.slot(handle).is_err() {
            return Err(self.stale(handle));
        }
        match self.slots[handle.index as usize].object.as_mut() {
            Some(HeapObject::Struct(s)) => Ok((s, &mut self.pools.structs)),
            _ => Err(VmError::type_mismatch("struct", value)),
        }
    }

    pub fn callable(&self, value: &Value) -> Result<&Callable> {
        match self.slot(Self::expect_ref(value, HeapKind::Callable)?)? {
            HeapObject::Callable(c) => Ok(c),
            _ => Err(VmError::type_mismatch("callable", value)),
        }
    }

    pub fn iterator(&self, handle: Handle) -> Result<&IterObject> {
        match self.slot(handle)? {
            HeapObject::Iterator(it) => Ok(it),
            _ => Err(VmError::TypeMismatch("expected iterator".to_string()).into()),
        }
    }

    pub fn iterator_mut(&mut self, handle: Handle) -> Result<&mut IterObject> {
        match self.slot_mut(handle)? {
            HeapObject::Iterator(it) => Ok(it),
            _ => Err(VmError::TypeMismatch("expected iterator".to_string()).into()),
        }
    }

    pub fn external(&self, value: &Value) -> Result<&External> {
        match self.slot(Self::expect_ref(value, HeapKind::External)?)? {
            HeapObject::External(e) => Ok(e),
            _ => Err(VmError::type_mismatch("external", value)),
        }
    }

    /// Store `value` under `key`; displaced values are disposed. On failure the
    /// incoming value is disposed too, so ownership never leaks.
    pub fn set_child(&mut self, target: &Value, key: &Value, value: Value) -> Result<()> {
        let key = match Key::from_value(key) {
            Ok(key) => key,
            Err(err) => {
                self.dispose(value);
                return Err(err);
            }
        };
        self.set_child_key(target, key, value)
    }

    pub fn set_child_key(&mut self, target: &Value, key: Key, value: Value) -> Result<()> {
        if value.owns_heap() && value.heap_ref() == target.heap_ref() {
            self.dispose(value);
            return Err(VmError::TypeMismatch("a structure cannot own itself".to_string()).into());
        }
        let displaced = match self.struct_parts(target) {
            Ok((s, pools)) => s.set_child(pools, key, value),
            Err(err) => {
                self.dispose(value);
                return Err(err);
            }
        };
        if let Some(old) = displaced {
            self.dispose(old);
        }
        Ok(())
    }

    /// Missing keys, and keys no structure can hold, read as `Null`.
    pub fn get_child(&self, target: &Value, key: &Value) -> Result<Value> {
        let s = self.structure(target)?;
        Ok(match Key::from_value(key) {
            Ok(key) => s.get_child(&key).map_or_else(Value::null, Value::share),
            Err(_) => Value::null(),
        })
    }

    pub fn has_child(&self, target: &Value, key: &Value) -> Result<bool> {
        let s = self.structure(target)?;
        Ok(Key::from_value(key).is_ok_and(|k| s.has_child(&k)))
    }

    /// Detach an entry; the caller becomes its owner.
    pub fn delete_child(&mut self, target: &Value, key: &Value) -> Result<Value> {
        let s = self.structure_mut(target)?;
        Ok(match Key::from_value(key) {
            Ok(key) => s.delete_child(&key).unwrap_or_default(),
            Err(_) => Value::null(),
        })
    }

    pub fn append(&mut self, target: &Value, value: Value, front: bool) -> Result<()> {
        let key = match self.structure_mut(target) {
            Ok(s) if front => s.prepend_key(),
            Ok(s) => s.append_key(),
            Err(err) => {
                self.dispose(value);
                return Err(err);
            }
        };
        self.set_child_key(target, key, value)
    }

    pub fn length(&self, value: &Value) -> Result<usize> {
        match value.data() {
            Data::Str(s) => Ok(s.chars().count()),
            _ => Ok(self.structure(value)?.len()),
        }
    }

    pub fn layout(&self, value: &Value) -> Result<Layout> {
        Ok(self.structure(value)?.layout())
    }

    /// Dispose an owning value and everything it transitively owns.
    /// Pointers and primitives are dropped without effect.
    pub fn dispose(&mut self, value: Value) {
        if !value.owns_heap() {
            return;
        }
        let mut work = vec![value];
        while let Some(next) = work.pop() {
            let Some((_, handle)) = next.heap_ref().filter(|_| next.owns_heap()) else {
                continue;
            };
            match self.free_slot(handle) {
                Some(object) => self.recycle(object, &mut work),
                None => {
                    trace!(target: "ember::vm::pool", index = handle.index, "dispose of stale owner ignored")
                }
            }
        }
    }

    pub fn dispose_all(&mut self, values: impl IntoIterator<Item = Value>) {
        for value in values {
            self.dispose(value);
        }
    }

    /// Explicit release: only owners may release, and only once.
    pub fn release(&mut self, value: Value) -> Result<()> {
        match (value.heap_ref(), value.owns_heap()) {
            (Some(_), false) => Err(VmError::UnownedRelease.into()),
            (Some((_, handle)), true) => {
                if self.slot(handle).is_err() {
                    return Err(self.stale(handle));
                }
                self.dispose(value);
                Ok(())
            }
            (None, _) => Ok(()),
        }
    }

    fn free_slot(&mut self, handle: Handle) -> Option<HeapObject> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let object = slot.object.take()?;
        self.live -= 1;
        match slot.generation.checked_add(1) {
            Some(next) => {
                slot.generation = next;
                self.free.push(handle.index);
            }
            // generations never wrap; an exhausted slot is retired for good
            None => self.retired += 1,
        }
        trace!(target: "ember::vm::pool", index = handle.index, generation = slot.generation, "released");
        Some(object)
    }

    fn recycle(&mut self, object: HeapObject, sink: &mut Vec<Value>) {
        match object {
            HeapObject::Struct(s) => s.recycle(&mut self.pools.structs, sink),
            HeapObject::Callable(c) => c.recycle(&mut self.pools.values, sink),
            HeapObject::Iterator(it) => it.recycle(&mut self.pools, sink),
            HeapObject::External(e) => {
                trace!(target: "ember::vm::pool", type_name = %e.type_name, "external dropped");
            }
        }
    }

    /// Move an object out of its slot without freeing it. Pair with
    /// [`Heap::restore`].
    pub(crate) fn borrow_out(&mut self, handle: Handle) -> Result<HeapObject> {
        if self.slot(handle).is_err() {
            return Err(self.stale(handle));
        }
        self.slots[handle.index as usize]
            .object
            .take()
            .ok_or_else(|| anyhow!("heap slot {} is already borrowed", handle.index))
    }

    pub(crate) fn restore(&mut self, handle: Handle, object: HeapObject) {
        if let Some(slot) = self.slots.get_mut(handle.index as usize)
            && slot.generation == handle.generation
        {
            slot.object = Some(object);
        }
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live: self.live,
            slots: self.slots.len(),
            retired: self.retired,
            frames: self.pools.frames.stats(),
            dense: self.pools.structs.dense.stats(),
        }
    }

    /// Display form that follows structures.
    pub fn render(&self, value: &Value) -> String {
        let mut out = String::new();
        self.render_into(value, &mut out, 0, false);
        out
    }

    fn render_into(&self, value: &Value, out: &mut String, depth: usize, nested: bool) {
        match value.data() {
            Data::Str(s) if nested => {
                let _ = write!(out, "{:?}", s);
            }
            Data::Owned(HeapKind::Struct, _) | Data::Pointer(HeapKind::Struct, _) => {
                let Ok(s) = self.structure(value) else {
                    out.push_str("<freed>");
                    return;
                };
                if depth >= RENDER_DEPTH {
                    out.push_str("...");
                    return;
                }
                let sequential = matches!(s.layout(), Layout::Dense | Layout::Ring);
                out.push(if sequential { '[' } else { '{' });
                for (i, (key, child)) in s.sorted_entries().into_iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    if !sequential {
                        match &key {
                            Key::Str(k) => out.push_str(k),
                            other => {
                                let _ = write!(out, "{}", other);
                            }
                        }
                        out.push_str(": ");
                    }
                    self.render_into(child, out, depth + 1, true);
                }
                out.push(if sequential { ']' } else { '}' });
            }
            Data::Owned(..) | Data::Pointer(..) if !self.is_live(value) => out.push_str("<freed>"),
            _ => {
                let _ = write!(out, "{}", value);
            }
        }
    }
}
