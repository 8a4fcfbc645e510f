use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use super::convert::integral_float;
use super::{Data, Handle, HeapKind, Value};
use crate::error::VmError;

/// Normalized structure key.
///
/// Integral floats collapse to `Int`, so `1` and `1.0` address the same
/// entry. `Float` only ever holds the bits of a finite non-integral value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(Arc<str>),
    Ref(HeapKind, Handle),
}

impl Key {
    pub fn from_value(value: &Value) -> Result<Key> {
        match value.data() {
            Data::Int(v) | Data::Enum(v) => Ok(Key::Int(*v)),
            Data::Float(f) => match integral_float(*f) {
                Some(i) => Ok(Key::Int(i)),
                None if f.is_finite() => Ok(Key::Float(f.to_bits())),
                None => Err(VmError::IncompatibleKey(value.to_string()).into()),
            },
            Data::Str(s) if !s.is_empty() => Ok(Key::Str(s.clone())),
            Data::Bool(b) => Ok(Key::Bool(*b)),
            Data::Owned(kind, handle) | Data::Pointer(kind, handle) => Ok(Key::Ref(*kind, *handle)),
            Data::Str(_) => Err(VmError::IncompatibleKey("\"\"".to_string()).into()),
            Data::Null | Data::Disposed => Err(VmError::IncompatibleKey(value.to_string()).into()),
        }
    }

    pub fn str(s: &str) -> Key {
        Key::Str(Arc::from(s))
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Bool(b) => Value::bool(*b),
            Key::Int(v) => Value::int(*v),
            Key::Float(bits) => Value::float(f64::from_bits(*bits)),
            Key::Str(s) => Value::from_data(Data::Str(s.clone())),
            Key::Ref(kind, handle) => Value::pointer(*kind, *handle),
        }
    }

    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Key::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&Arc<str>> {
        match self {
            Key::Str(s) => Some(s),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Key::Bool(_) => 0,
            Key::Int(_) | Key::Float(_) => 1,
            Key::Str(_) => 2,
            Key::Ref(..) => 3,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Bool(a), Key::Bool(b)) => a.cmp(b),
            (Key::Int(a), Key::Int(b)) => a.cmp(b),
            (Key::Float(a), Key::Float(b)) => f64::from_bits(*a).total_cmp(&f64::from_bits(*b)),
            // never equal: the float side is non-integral
            (Key::Int(a), Key::Float(b)) => (*a as f64).total_cmp(&f64::from_bits(*b)).then(Ordering::Less),
            (Key::Float(a), Key::Int(b)) => f64::from_bits(*a).total_cmp(&(*b as f64)).then(Ordering::Greater),
            (Key::Str(a), Key::Str(b)) => a.cmp(b),
            (Key::Ref(ka, ha), Key::Ref(kb, hb)) => (ka, ha).cmp(&(kb, hb)),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Bool(b) => write!(f, "{}", b),
            Key::Int(v) => f.write_str(itoa::Buffer::new().format(*v)),
            Key::Float(bits) => f.write_str(ryu::Buffer::new().format(f64::from_bits(*bits))),
            Key::Str(s) => f.write_str(s),
            Key::Ref(kind, handle) => write!(f, "<{} @{}>", kind.name(), handle.index),
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Int(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::str(v)
    }
}
