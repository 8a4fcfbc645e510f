use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::error::VmError;

mod convert;
pub mod key;
mod ops;


pub use convert::{Num, parse_number};
pub use key::Key;
pub use ops::{ArithOp, CmpOp, arith, compare_op, negate};

/// Slot index plus the generation observed when the reference was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    pub index: u32,
    pub generation: u32,
}

impl Handle {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// What a heap handle points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeapKind {
    Struct,
    Callable,
    Iterator,
    External,
}

impl HeapKind {
    pub fn name(self) -> &'static str {
        match self {
            HeapKind::Struct => "struct",
            HeapKind::Callable => "callable",
            HeapKind::Iterator => "iterator",
            HeapKind::External => "external",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Disposed,
    Null,
    Int,
    Float,
    String,
    Struct,
    Callable,
    Iterator,
    Pointer,
    Bool,
    Enum,
    External,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Disposed => "disposed",
            ValueKind::Null => "null",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::String => "string",
            ValueKind::Struct => "struct",
            ValueKind::Callable => "callable",
            ValueKind::Iterator => "iterator",
            ValueKind::Pointer => "pointer",
            ValueKind::Bool => "bool",
            ValueKind::Enum => "enum",
            ValueKind::External => "external",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ValueFlags(u8);

impl ValueFlags {
    pub const NONE: ValueFlags = ValueFlags(0);
    /// Stored inside a structure.
    pub const IS_CHILD: ValueFlags = ValueFlags(1);
    pub const IS_GLOBAL: ValueFlags = ValueFlags(2);
    pub const IS_READONLY: ValueFlags = ValueFlags(4);
    pub const CAN_AUTO_CONVERT: ValueFlags = ValueFlags(8);

    /// Flags that survive `share()`.
    const SHARED: ValueFlags = ValueFlags(4 | 8);

    #[inline]
    pub const fn contains(self, other: ValueFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: ValueFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: ValueFlags) {
        self.0 &= !other.0;
    }

    #[inline]
    pub const fn union(self, other: ValueFlags) -> ValueFlags {
        ValueFlags(self.0 | other.0)
    }

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }
}

/// Payload of a [`Value`].
#[derive(Debug)]
pub enum Data {
    Disposed,
    Null,
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Bool(bool),
    Enum(i64),
    /// Sole owner of a heap object.
    Owned(HeapKind, Handle),
    /// Non-owning alias, valid while the generation still matches.
    Pointer(HeapKind, Handle),
}

/// Tagged VM value.
///
/// Deliberately not `Clone`: an owning value has exactly one holder. Use
/// [`Value::share`] to get a pointer alias or a copy of a primitive.
#[derive(Debug)]
pub struct Value {
    data: Data,
    flags: ValueFlags,
}

impl Default for Value {
    fn default() -> Self {
        Value::null()
    }
}

impl Value {
    #[inline]
    pub const fn from_data(data: Data) -> Self {
        Self {
            data,
            flags: ValueFlags::NONE,
        }
    }

    #[inline]
    pub const fn null() -> Self {
        Self::from_data(Data::Null)
    }

    #[inline]
    pub const fn disposed() -> Self {
        Self::from_data(Data::Disposed)
    }

    #[inline]
    pub const fn int(v: i64) -> Self {
        Self::from_data(Data::Int(v))
    }

    #[inline]
    pub const fn float(v: f64) -> Self {
        Self::from_data(Data::Float(v))
    }

    #[inline]
    pub const fn bool(v: bool) -> Self {
        Self::from_data(Data::Bool(v))
    }

    #[inline]
    pub const fn enumeration(ordinal: i64) -> Self {
        Self::from_data(Data::Enum(ordinal))
    }

    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Self::from_data(Data::Str(s.into()))
    }

    #[inline]
    pub const fn owned(kind: HeapKind, handle: Handle) -> Self {
        Self::from_data(Data::Owned(kind, handle))
    }

    #[inline]
    pub const fn pointer(kind: HeapKind, handle: Handle) -> Self {
        Self::from_data(Data::Pointer(kind, handle))
    }

    #[inline]
    pub fn data(&self) -> &Data {
        &self.data
    }

    #[inline]
    pub fn flags(&self) -> ValueFlags {
        self.flags
    }

    #[inline]
    pub fn has_flag(&self, flag: ValueFlags) -> bool {
        self.flags.contains(flag)
    }

    #[inline]
    pub fn set_flag(&mut self, flag: ValueFlags) {
        self.flags.insert(flag);
    }

    #[inline]
    pub fn clear_flag(&mut self, flag: ValueFlags) {
        self.flags.remove(flag);
    }

    pub fn with_flags(mut self, flags: ValueFlags) -> Self {
        self.flags.insert(flags);
        self
    }

    pub fn kind(&self) -> ValueKind {
        match &self.data {
            Data::Disposed => ValueKind::Disposed,
            Data::Null => ValueKind::Null,
            Data::Int(_) => ValueKind::Int,
            Data::Float(_) => ValueKind::Float,
            Data::Str(_) => ValueKind::String,
            Data::Bool(_) => ValueKind::Bool,
            Data::Enum(_) => ValueKind::Enum,
            Data::Owned(HeapKind::Struct, _) => ValueKind::Struct,
            Data::Owned(HeapKind::Callable, _) => ValueKind::Callable,
            Data::Owned(HeapKind::Iterator, _) => ValueKind::Iterator,
            Data::Owned(HeapKind::External, _) => ValueKind::External,
            Data::Pointer(..) => ValueKind::Pointer,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self.data, Data::Null)
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        matches!(self.data, Data::Disposed)
    }

    /// True when this value is the single owner of heap content.
    #[inline]
    pub fn owns_heap(&self) -> bool {
        matches!(self.data, Data::Owned(..))
    }

    /// Heap target of an owning value or a pointer.
    #[inline]
    pub fn heap_ref(&self) -> Option<(HeapKind, Handle)> {
        match self.data {
            Data::Owned(kind, handle) | Data::Pointer(kind, handle) => Some((kind, handle)),
            _ => None,
        }
    }

    /// Move the value out, leaving `Null` behind.
    #[inline]
    pub fn take(&mut self) -> Value {
        std::mem::take(self)
    }

    /// Copy a primitive, or alias heap content through a pointer.
    pub fn share(&self) -> Value {
        let data = match &self.data {
            Data::Disposed => Data::Disposed,
            Data::Null => Data::Null,
            Data::Int(v) => Data::Int(*v),
            Data::Float(v) => Data::Float(*v),
            Data::Str(s) => Data::Str(s.clone()),
            Data::Bool(v) => Data::Bool(*v),
            Data::Enum(v) => Data::Enum(*v),
            Data::Owned(kind, handle) | Data::Pointer(kind, handle) => Data::Pointer(*kind, *handle),
        };
        Value {
            data,
            flags: ValueFlags(self.flags.0 & ValueFlags::SHARED.0),
        }
    }

    /// Copy of a value that owns nothing; `None` for owning values.
    pub fn try_copy(&self) -> Option<Value> {
        if self.owns_heap() { None } else { Some(self.share()) }
    }

    #[inline]
    fn auto(&self) -> bool {
        self.flags.contains(ValueFlags::CAN_AUTO_CONVERT)
    }

    pub fn as_int(&self) -> Result<i64> {
        match &self.data {
            Data::Int(v) => Ok(*v),
            Data::Float(f) if self.auto() => convert::integral_float(*f)
                .ok_or_else(|| VmError::TypeMismatch(format!("cannot convert {} to int without loss", f)).into()),
            Data::Bool(b) if self.auto() => Ok(*b as i64),
            Data::Str(s) if self.auto() => match parse_number(s) {
                Some(Num::Int(v)) => Ok(v),
                Some(Num::Float(f)) => convert::integral_float(f)
                    .ok_or_else(|| VmError::TypeMismatch(format!("cannot convert '{}' to int", s)).into()),
                None => Err(VmError::TypeMismatch(format!("cannot convert '{}' to int", s)).into()),
            },
            _ => Err(VmError::type_mismatch("int", self)),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match &self.data {
            Data::Float(v) => Ok(*v),
            Data::Int(v) if self.auto() => Ok(*v as f64),
            Data::Bool(b) if self.auto() => Ok(if *b { 1.0 } else { 0.0 }),
            Data::Str(s) if self.auto() => match parse_number(s) {
                Some(n) => Ok(n.to_f64()),
                None => Err(VmError::TypeMismatch(format!("cannot convert '{}' to float", s)).into()),
            },
            _ => Err(VmError::type_mismatch("float", self)),
        }
    }

    /// Int or float without requiring the conversion flag.
    pub fn as_number(&self) -> Result<Num> {
        match &self.data {
            Data::Int(v) => Ok(Num::Int(*v)),
            Data::Float(v) => Ok(Num::Float(*v)),
            Data::Bool(b) if self.auto() => Ok(Num::Int(*b as i64)),
            Data::Str(s) if self.auto() => parse_number(s)
                .ok_or_else(|| VmError::TypeMismatch(format!("cannot convert '{}' to a number", s)).into()),
            _ => Err(VmError::type_mismatch("number", self)),
        }
    }

    pub fn as_string(&self) -> Result<Arc<str>> {
        match &self.data {
            Data::Str(s) => Ok(s.clone()),
            Data::Int(_) | Data::Float(_) | Data::Bool(_) if self.auto() => Ok(Arc::from(self.to_string())),
            _ => Err(VmError::type_mismatch("string", self)),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.data {
            Data::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match &self.data {
            Data::Bool(b) => Ok(*b),
            Data::Int(v) if self.auto() => Ok(*v != 0),
            Data::Float(v) if self.auto() => Ok(*v != 0.0),
            Data::Null if self.auto() => Ok(false),
            Data::Str(s) if self.auto() => match s.trim() {
                "true" => Ok(true),
                "false" | "" => Ok(false),
                other => Err(VmError::TypeMismatch(format!("cannot convert '{}' to bool", other)).into()),
            },
            _ => Err(VmError::type_mismatch("bool", self)),
        }
    }

    pub fn as_enum(&self) -> Result<i64> {
        match &self.data {
            Data::Enum(v) => Ok(*v),
            _ => Err(VmError::type_mismatch("enum", self)),
        }
    }

    /// Condition test used by branches and logic opcodes. `Null` reads as false.
    pub fn truthy(&self) -> Result<bool> {
        match &self.data {
            Data::Bool(b) => Ok(*b),
            Data::Null => Ok(false),
            _ => self.as_bool(),
        }
    }

    fn rank(&self) -> u8 {
        match &self.data {
            Data::Disposed => 0,
            Data::Null => 1,
            Data::Bool(_) => 2,
            Data::Enum(_) => 3,
            Data::Int(_) | Data::Float(_) => 4,
            Data::Str(_) => 5,
            Data::Owned(..) | Data::Pointer(..) => 6,
        }
    }

    /// Total order: by kind rank first, then within the kind.
    pub fn compare(&self, other: &Value) -> std::cmp::Ordering {
        match (&self.data, &other.data) {
            (Data::Int(a), Data::Int(b)) => a.cmp(b),
            (Data::Float(a), Data::Float(b)) => a.total_cmp(b),
            (Data::Int(a), Data::Float(b)) => (*a as f64).total_cmp(b),
            (Data::Float(a), Data::Int(b)) => a.total_cmp(&(*b as f64)),
            (Data::Str(a), Data::Str(b)) => a.cmp(b),
            (Data::Bool(a), Data::Bool(b)) => a.cmp(b),
            (Data::Enum(a), Data::Enum(b)) => a.cmp(b),
            (Data::Owned(ka, ha) | Data::Pointer(ka, ha), Data::Owned(kb, hb) | Data::Pointer(kb, hb)) => {
                (ka, ha).cmp(&(kb, hb))
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Value equality for primitives, identity for heap references.
    pub fn contents_equal(&self, other: &Value) -> bool {
        match (&self.data, &other.data) {
            (Data::Null, Data::Null) => true,
            (Data::Int(a), Data::Int(b)) => a == b,
            (Data::Float(a), Data::Float(b)) => a == b,
            (Data::Int(a), Data::Float(b)) | (Data::Float(b), Data::Int(a)) => (*a as f64) == *b,
            (Data::Str(a), Data::Str(b)) => a == b,
            (Data::Bool(a), Data::Bool(b)) => a == b,
            (Data::Enum(a), Data::Enum(b)) => a == b,
            (Data::Owned(ka, ha) | Data::Pointer(ka, ha), Data::Owned(kb, hb) | Data::Pointer(kb, hb)) => {
                ka == kb && ha == hb
            }
            _ if self.auto() || other.auto() => self.coerced_equal(other),
            _ => false,
        }
    }

    fn coerced_equal(&self, other: &Value) -> bool {
        match (&self.data, &other.data) {
            (Data::Bool(_), _) | (_, Data::Bool(_)) => {
                matches!((self.with_auto().as_bool(), other.with_auto().as_bool()), (Ok(a), Ok(b)) if a == b)
            }
            (Data::Str(_), Data::Int(_) | Data::Float(_)) | (Data::Int(_) | Data::Float(_), Data::Str(_)) => {
                match (self.with_auto().as_number(), other.with_auto().as_number()) {
                    (Ok(a), Ok(b)) => a.to_f64() == b.to_f64(),
                    _ => false,
                }
            }
            _ => false,
        }
    }

    fn with_auto(&self) -> Value {
        self.share().with_flags(ValueFlags::CAN_AUTO_CONVERT)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            Data::Disposed => f.write_str("<disposed>"),
            Data::Null => f.write_str("null"),
            Data::Int(v) => f.write_str(itoa::Buffer::new().format(*v)),
            Data::Float(v) => f.write_str(ryu::Buffer::new().format(*v)),
            Data::Str(s) => f.write_str(s),
            Data::Bool(b) => f.write_str(if *b { "true" } else { "false" }),
            Data::Enum(v) => write!(f, "enum#{}", v),
            Data::Owned(kind, handle) => write!(f, "<{} @{}>", kind.name(), handle.index),
            Data::Pointer(kind, handle) => write!(f, "<&{} @{}>", kind.name(), handle.index),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::string(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::string(v)
    }
}
