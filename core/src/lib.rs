//! Execution core of the Ember scripting language: values, pooled heap,
//! adaptive structures and the bytecode engine.

pub mod error;
pub mod pool;
pub mod structure;
pub mod util;
pub mod val;
pub mod vm;

pub use error::VmError;
pub use val::Value;
pub use vm::{EngineConfig, Job, Outcome, Vm};
