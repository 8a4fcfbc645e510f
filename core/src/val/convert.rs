/// Numeric view of a value after coercion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    #[inline]
    pub fn to_f64(self) -> f64 {
        match self {
            Num::Int(v) => v as f64,
            Num::Float(v) => v,
        }
    }
}

/// Locale-invariant parse: integers first, then finite floats.
pub fn parse_number(raw: &str) -> Option<Num> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = trimmed.parse::<i64>() {
        return Some(Num::Int(v));
    }
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(Num::Float(v)),
        _ => None,
    }
}

/// Integral floats inside the `i64` range convert exactly.
pub(crate) fn integral_float(v: f64) -> Option<i64> {
    if v.is_finite() && v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}
