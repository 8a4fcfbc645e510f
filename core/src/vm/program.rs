//! Program format produced by the assembler and the staged loader.
//!
//! Loading runs in five stages, each over every module before the next
//! starts: function definitions, static initializers, data globals, enum
//! registration, then each module's `init` function.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Vm;
use super::bytecode::{Instruction, Opcode};
use super::callable::Callable;
use super::engine::{Job, Outcome};
use crate::error::VmError;
use crate::pool::{Heap, HeapObject};
use crate::val::{Key, Value, ValueFlags};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub modules: Vec<ModuleDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleDef {
    pub name: String,
    #[serde(default)]
    pub functions: Vec<FunctionDef>,
    #[serde(default)]
    pub statics: Vec<StaticDef>,
    #[serde(default)]
    pub data: Vec<DataDef>,
    #[serde(default)]
    pub enums: Vec<EnumDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<FunctionDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    /// Dotted path the function is bound at.
    pub name: String,
    #[serde(default)]
    pub params: usize,
    #[serde(default)]
    pub locals: usize,
    /// The last parameter collects surplus arguments into a structure.
    #[serde(default)]
    pub variadic: bool,
    /// Calls return an iterator over the values it yields.
    #[serde(default)]
    pub generator: bool,
    #[serde(default)]
    pub code: Vec<Instruction>,
}

impl FunctionDef {
    pub fn new(name: &str, params: usize, locals: usize, code: Vec<Instruction>) -> Self {
        Self {
            name: name.to_string(),
            params,
            locals,
            code,
            ..Default::default()
        }
    }

    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    pub fn generator(mut self) -> Self {
        self.generator = true;
        self
    }
}

/// Global initialized from the first value its function returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticDef {
    pub path: String,
    pub init: FunctionDef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDef {
    pub path: String,
    pub value: Literal,
    #[serde(default)]
    pub readonly: bool,
}

/// Registers `path.Variant` as `Enum(ordinal)` for each variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumDef {
    pub path: String,
    pub variants: Vec<String>,
}

/// Constant data as written in a program file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Literal>),
    Map(BTreeMap<String, Literal>),
}

impl Literal {
    /// Build the value, allocating structures for lists and maps.
    pub fn materialize(&self, heap: &mut Heap) -> Result<Value> {
        Ok(match self {
            Literal::Null => Value::null(),
            Literal::Bool(b) => Value::bool(*b),
            Literal::Int(i) => Value::int(*i),
            Literal::Float(f) => Value::float(*f),
            Literal::Str(s) => Value::string(s.as_str()),
            Literal::List(items) => {
                let target = heap.alloc_struct(items.len());
                let filled = items
                    .iter()
                    .enumerate()
                    .try_for_each(|(i, item)| fill(heap, &target, Key::Int(i as i64), item));
                keep_filled(heap, target, filled)?
            }
            Literal::Map(entries) => {
                let target = heap.alloc_struct(entries.len());
                let filled = entries
                    .iter()
                    .try_for_each(|(k, item)| fill(heap, &target, Key::str(k), item));
                keep_filled(heap, target, filled)?
            }
        })
    }
}

fn fill(heap: &mut Heap, target: &Value, key: Key, item: &Literal) -> Result<()> {
    let child = item.materialize(heap)?;
    heap.set_child_key(target, key, child)
}

fn keep_filled(heap: &mut Heap, target: Value, filled: Result<()>) -> Result<Value> {
    match filled {
        Ok(()) => Ok(target),
        Err(err) => {
            heap.dispose(target);
            Err(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
    Toml,
}

impl Format {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(Format::Json),
            Some("yaml" | "yml") => Ok(Format::Yaml),
            Some("toml") => Ok(Format::Toml),
            _ => Err(anyhow!(
                "unsupported program file '{}': expected .json, .yaml, .yml or .toml",
                path.display()
            )),
        }
    }
}

impl Program {
    pub fn parse(text: &str, format: Format) -> Result<Self> {
        match format {
            Format::Json => serde_json::from_str(text).context("invalid JSON program"),
            Format::Yaml => serde_yaml::from_str(text).context("invalid YAML program"),
            Format::Toml => toml::from_str(text).context("invalid TOML program"),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let format = Format::from_path(path)?;
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text, format).with_context(|| format!("in {}", path.display()))
    }
}

fn first_value(vm: &mut Vm, outcome: Outcome, what: &str) -> Result<Value> {
    match outcome {
        Outcome::Completed(values) => {
            let mut values = values.into_iter();
            let first = values.next().unwrap_or_default();
            vm.heap.dispose_all(values);
            Ok(first)
        }
        Outcome::Halted | Outcome::Aborted => Err(anyhow!("{} did not complete", what)),
    }
}

impl Vm {
    /// Load modules in stages. Scripted bindings are not overwritable.
    pub fn load(&mut self, modules: &[ModuleDef]) -> Result<()> {
        for module in modules {
            for def in &module.functions {
                let unit = self
                    .compile_unit(def)
                    .with_context(|| format!("compiling {} in module {}", def.name, module.name))?;
                let callable = self.heap.alloc(HeapObject::Callable(Callable::script(unit)));
                self.globals.define(&mut self.heap, &def.name, callable, false)?;
            }
            debug!(target: "ember::vm::globals", module = %module.name, functions = module.functions.len(), "functions defined");
        }
        self.check_references()?;

        for module in modules {
            for def in &module.statics {
                let value = self
                    .run_unbound(&def.init)
                    .with_context(|| format!("initializing static {}", def.path))?;
                self.globals.define(&mut self.heap, &def.path, value, false)?;
            }
        }

        for module in modules {
            for def in &module.data {
                let mut value = def.value.materialize(&mut self.heap)?;
                if def.readonly {
                    value.set_flag(ValueFlags::IS_READONLY);
                }
                self.globals.define(&mut self.heap, &def.path, value, false)?;
            }
        }

        for module in modules {
            for def in &module.enums {
                for (ordinal, variant) in def.variants.iter().enumerate() {
                    let value = Value::enumeration(ordinal as i64).with_flags(ValueFlags::IS_READONLY);
                    let path = format!("{}.{}", def.path, variant);
                    self.globals.define(&mut self.heap, &path, value, false)?;
                }
            }
            debug!(
                target: "ember::vm::globals",
                module = %module.name,
                statics = module.statics.len(),
                data = module.data.len(),
                enums = module.enums.len(),
                "globals registered"
            );
        }

        for module in modules {
            if let Some(init) = &module.init {
                let value = self
                    .run_unbound(init)
                    .with_context(|| format!("running init of module {}", module.name))?;
                self.heap.dispose(value);
                debug!(target: "ember::vm::globals", module = %module.name, "init done");
            }
        }
        Ok(())
    }

    /// Every unit named by a direct call or closure must exist once all
    /// functions are defined.
    fn check_references(&self) -> Result<()> {
        for unit in self.units.values() {
            for (at, ins) in unit.code.iter().enumerate() {
                if !matches!(ins.op, Opcode::CallDirect | Opcode::MakeClosure) {
                    continue;
                }
                let name = ins.str.as_deref().unwrap_or("");
                if !self.units.contains_key(name) {
                    return Err(VmError::malformed(
                        &unit.name,
                        format!("{} at {} names unknown unit '{}'", ins.op, at, name),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Compile and run a function that is not bound anywhere; yields the
    /// first returned value.
    fn run_unbound(&mut self, def: &FunctionDef) -> Result<Value> {
        let unit = Arc::new(super::dispatch::compile(def, self.config.fusion)?);
        let mut job = Job::new();
        job.call_unit(self, unit, Vec::new())?;
        let outcome = job.run(self)?;
        first_value(self, outcome, &def.name)
    }
}
