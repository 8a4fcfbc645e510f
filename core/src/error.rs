use thiserror::Error;

use crate::val::Value;

/// Failure kinds raised by the VM.
///
/// They travel inside `anyhow::Error`; use [`VmError::of`] to classify a
/// propagated error.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("access to freed object (slot {index}, generation {observed}, now {current})")]
    StalePointer { index: u32, observed: u32, current: u32 },
    #[error("cannot release a non-owning reference")]
    UnownedRelease,
    #[error("key {0} can never be stored in a structure")]
    IncompatibleKey(String),
    #[error("uncaught throw: {0}")]
    Uncaught(String),
    #[error("{callee} expects {expected} argument(s), got {got}")]
    ParameterCount { callee: String, expected: usize, got: usize },
    #[error("fatal: {0}")]
    Fatal(String),
    /// A script-level `throw`; converted back into its payload when a trap catches it.
    #[error("thrown value {0}")]
    Thrown(Value),
    #[error("'{0}' is already bound and not overwritable")]
    DuplicateBinding(String),
    #[error("'{0}' is readonly")]
    Readonly(String),
    #[error("malformed code unit '{unit}': {reason}")]
    Malformed { unit: String, reason: String },
}

impl VmError {
    pub fn type_mismatch(expected: &str, found: &Value) -> anyhow::Error {
        VmError::TypeMismatch(format!("expected {}, found {}", expected, found.kind().name())).into()
    }

    pub fn malformed(unit: &str, reason: impl Into<String>) -> anyhow::Error {
        VmError::Malformed {
            unit: unit.to_string(),
            reason: reason.into(),
        }
        .into()
    }

    /// Classify a propagated error, if it carries a VM error kind.
    pub fn of(err: &anyhow::Error) -> Option<&VmError> {
        err.downcast_ref::<VmError>()
    }

    /// Fatal errors skip traps and deferred cleanup.
    pub fn is_fatal(err: &anyhow::Error) -> bool {
        matches!(Self::of(err), Some(VmError::Fatal(_)))
    }
}
