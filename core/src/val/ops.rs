use std::cmp::Ordering;
use std::fmt;

use anyhow::Result;

use super::convert::Num;
use super::{Data, Value, ValueFlags};
use crate::error::VmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl fmt::Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    #[inline]
    fn accepts(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }
}

fn operand(value: &Value, op: ArithOp, side: &Value) -> Result<Num> {
    value.as_number().map_err(|_| {
        VmError::TypeMismatch(format!(
            "cannot apply '{}' to {} and {}",
            op,
            value.kind().name(),
            side.kind().name()
        ))
        .into()
    })
}

/// Binary arithmetic shared by the plain handlers and every fused fast path.
pub fn arith(op: ArithOp, lhs: &Value, rhs: &Value) -> Result<Value> {
    if op == ArithOp::Add {
        if let (Data::Int(a), Data::Int(b)) = (lhs.data(), rhs.data()) {
            return Ok(a.checked_add(*b).map_or_else(|| Value::float(*a as f64 + *b as f64), Value::int));
        }
        if matches!(lhs.data(), Data::Str(_)) || matches!(rhs.data(), Data::Str(_)) {
            if lhs.is_disposed() || rhs.is_disposed() {
                return Err(VmError::TypeMismatch("cannot concatenate a disposed value".to_string()).into());
            }
            let mut out = String::new();
            use std::fmt::Write as _;
            let _ = write!(out, "{}{}", lhs, rhs);
            return Ok(Value::string(out));
        }
    }

    let a = operand(lhs, op, rhs)?;
    let b = operand(rhs, op, lhs)?;
    match (a, b) {
        (Num::Int(a), Num::Int(b)) => int_arith(op, a, b),
        (a, b) => Ok(Value::float(float_arith(op, a.to_f64(), b.to_f64()))),
    }
}

fn int_arith(op: ArithOp, a: i64, b: i64) -> Result<Value> {
    let promoted = || Value::float(float_arith(op, a as f64, b as f64));
    Ok(match op {
        ArithOp::Add => a.checked_add(b).map_or_else(promoted, Value::int),
        ArithOp::Sub => a.checked_sub(b).map_or_else(promoted, Value::int),
        ArithOp::Mul => a.checked_mul(b).map_or_else(promoted, Value::int),
        ArithOp::Div => {
            if b == 0 {
                return Err(VmError::TypeMismatch("division by zero".to_string()).into());
            }
            match (a.checked_rem(b), a.checked_div(b)) {
                (Some(0), Some(q)) => Value::int(q),
                _ => promoted(),
            }
        }
        ArithOp::Mod => {
            if b == 0 {
                return Err(VmError::TypeMismatch("division by zero".to_string()).into());
            }
            Value::int(a.wrapping_rem(b))
        }
    })
}

#[inline]
fn float_arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => a % b,
    }
}

pub fn negate(value: &Value) -> Result<Value> {
    match value.as_number()? {
        Num::Int(v) => Ok(v.checked_neg().map_or_else(|| Value::float(-(v as f64)), Value::int)),
        Num::Float(v) => Ok(Value::float(-v)),
    }
}

/// Comparison opcode semantics. Ordering across a string and a number
/// coerces when either side carries `CAN_AUTO_CONVERT`.
pub fn compare_op(op: CmpOp, lhs: &Value, rhs: &Value) -> bool {
    match op {
        CmpOp::Eq => lhs.contents_equal(rhs),
        CmpOp::Ne => !lhs.contents_equal(rhs),
        _ => {
            let auto = lhs.has_flag(ValueFlags::CAN_AUTO_CONVERT) || rhs.has_flag(ValueFlags::CAN_AUTO_CONVERT);
            let mixed = matches!(
                (lhs.data(), rhs.data()),
                (Data::Str(_), Data::Int(_) | Data::Float(_)) | (Data::Int(_) | Data::Float(_), Data::Str(_))
            );
            if auto && mixed {
                let coerce = |v: &Value| v.share().with_flags(ValueFlags::CAN_AUTO_CONVERT).as_number();
                if let (Ok(a), Ok(b)) = (coerce(lhs), coerce(rhs)) {
                    return op.accepts(a.to_f64().total_cmp(&b.to_f64()));
                }
            }
            op.accepts(lhs.compare(rhs))
        }
    }
}
