use std::path::Path;

use super::*;
use crate::vm::{Format, ModuleDef, Program};

const APP_JSON: &str = r#"{
  "modules": [
    {
      "name": "app",
      "functions": [
        {
          "name": "app.main",
          "code": [
            { "op": "LoadGlobal", "str": "app.base" },
            { "op": "PushInt", "int": 1 },
            { "op": "Add" },
            { "op": "Return", "int": 1 }
          ]
        },
        {
          "name": "app.twice",
          "params": 1,
          "locals": 1,
          "code": [
            { "op": "LoadLocal" },
            { "op": "LoadLocal" },
            { "op": "CallName", "str": "app.add", "int": 2 },
            { "op": "Return", "int": 1 }
          ]
        },
        {
          "name": "app.add",
          "params": 2,
          "locals": 2,
          "code": [
            { "op": "LoadLocal" },
            { "op": "LoadLocal", "int": 1 },
            { "op": "Add" },
            { "op": "Return", "int": 1 }
          ]
        }
      ],
      "statics": [
        {
          "path": "app.base",
          "init": {
            "name": "app.base.init",
            "code": [{ "op": "PushInt", "int": 41 }, { "op": "Return", "int": 1 }]
          }
        }
      ],
      "data": [
        { "path": "app.config", "value": { "name": "ember", "sizes": [1, 2, 3], "debug": null }, "readonly": true },
        { "path": "app.ratio", "value": 0.5 }
      ],
      "enums": [{ "path": "app.Color", "variants": ["Red", "Green", "Blue"] }],
      "init": {
        "name": "app.init",
        "code": [
          { "op": "CallName", "str": "app.main" },
          { "op": "StoreGlobal", "str": "app.ready" }
        ]
      }
    }
  ]
}"#;

fn load_app(vm: &mut Vm) {
    let program = Program::parse(APP_JSON, Format::Json).unwrap();
    vm.load(&program.modules).unwrap();
}

#[test]
fn staged_load_runs_statics_before_init() {
    let mut vm = Vm::default();
    load_app(&mut vm);
    assert_eq!(vm.globals.get("app.base").unwrap().as_int().unwrap(), 41);
    assert_eq!(vm.globals.get("app.ready").unwrap().as_int().unwrap(), 42);
    assert_eq!(run_int(&mut vm, "app.main", Vec::new()), 42);
    assert_eq!(run_int(&mut vm, "app.twice", vec![Value::int(8)]), 16);
}

#[test]
fn data_and_enums_become_globals() {
    let mut vm = Vm::default();
    load_app(&mut vm);
    let config = vm.globals.get("app.config").unwrap();
    assert_eq!(vm.render(config), r#"{debug: null, name: "ember", sizes: [1, 2, 3]}"#);
    assert_eq!(vm.globals.get("app.ratio").unwrap().as_float().unwrap(), 0.5);

    for (ordinal, variant) in ["Red", "Green", "Blue"].iter().enumerate() {
        let v = vm.globals.get(&format!("app.Color.{}", variant)).unwrap();
        assert_eq!(v.as_enum().unwrap(), ordinal as i64);
    }
    assert!(!vm.globals.contains("app.Color"));
}

#[test]
fn loaded_readonly_data_refuses_stores() {
    let mut vm = Vm::default();
    load_app(&mut vm);
    define(&mut vm, "clobber", 0, 0, |b| {
        b.push_int(0).str(Opcode::StoreGlobal, "app.config");
    });
    let err = run_err(&mut vm, "clobber");
    assert!(matches!(VmError::of(&err), Some(VmError::Readonly(_))));

    define(&mut vm, "recolor", 0, 0, |b| {
        b.push_int(0).str(Opcode::StoreGlobal, "app.Color.Red");
    });
    assert!(vm.call("recolor", Vec::new()).is_err());
}

#[test]
fn loading_twice_is_a_duplicate_binding() {
    let mut vm = Vm::default();
    load_app(&mut vm);
    let program = Program::parse(APP_JSON, Format::Json).unwrap();
    let err = vm.load(&program.modules).unwrap_err();
    assert!(matches!(VmError::of(&err), Some(VmError::DuplicateBinding(_))), "{:#}", err);
}

#[test]
fn unknown_direct_call_fails_the_load() {
    let mut vm = Vm::default();
    let module = ModuleDef {
        name: "broken".to_string(),
        functions: vec![FunctionDef::new(
            "broken.main",
            0,
            0,
            code(|b| {
                b.str_int(Opcode::CallDirect, "broken.missing", 0);
            }),
        )],
        ..Default::default()
    };
    let err = vm.load(&[module]).unwrap_err();
    assert!(matches!(VmError::of(&err), Some(VmError::Malformed { .. })));
}

#[test]
fn failing_static_initializer_stops_the_load() {
    let mut vm = Vm::default();
    let module = ModuleDef {
        name: "m".to_string(),
        statics: vec![crate::vm::StaticDef {
            path: "m.value".to_string(),
            init: FunctionDef::new(
                "m.value.init",
                0,
                0,
                code(|b| {
                    b.push_str("no config").op(Opcode::Throw);
                }),
            ),
        }],
        ..Default::default()
    };
    let err = vm.load(&[module]).unwrap_err();
    assert!(format!("{:#}", err).contains("initializing static m.value"));
    assert!(!vm.globals.contains("m.value"));
}

const APP_YAML: &str = r#"
modules:
  - name: calc
    functions:
      - name: calc.square
        params: 1
        locals: 1
        code:
          - { op: LoadLocal }
          - { op: LoadLocal }
          - { op: Mul }
          - { op: Return, int: 1 }
    data:
      - path: calc.limits
        value: [10, 20]
"#;

const APP_TOML: &str = r#"
[[modules]]
name = "calc"

[[modules.functions]]
name = "calc.square"
params = 1
locals = 1
code = [
  { op = "LoadLocal" },
  { op = "LoadLocal" },
  { op = "Mul" },
  { op = "Return", int = 1 },
]

[[modules.data]]
path = "calc.limits"
value = [10, 20]
"#;

#[test]
fn yaml_and_toml_programs_match() {
    let yaml = Program::parse(APP_YAML, Format::Yaml).unwrap();
    let toml = Program::parse(APP_TOML, Format::Toml).unwrap();
    assert_eq!(yaml, toml);

    let mut vm = Vm::default();
    vm.load(&yaml.modules).unwrap();
    assert_eq!(run_int(&mut vm, "calc.square", vec![Value::int(12)]), 144);
    let limits = vm.globals.get("calc.limits").unwrap();
    assert_eq!(vm.render(limits), "[10, 20]");
}

#[test]
fn program_files_are_read_by_extension() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.yml");
    std::fs::write(&path, APP_YAML).unwrap();
    let program = Program::from_file(&path).unwrap();
    assert_eq!(program.modules[0].name, "calc");

    assert_eq!(Format::from_path(Path::new("x.json")).unwrap(), Format::Json);
    assert_eq!(Format::from_path(Path::new("x.toml")).unwrap(), Format::Toml);
    assert!(Format::from_path(Path::new("x.txt")).is_err());

    let bad = dir.path().join("bad.json");
    std::fs::write(&bad, "{ modules: ").unwrap();
    let err = Program::from_file(&bad).unwrap_err();
    assert!(format!("{:#}", err).contains("invalid JSON program"));
}

#[test]
fn shutdown_releases_globals() {
    let mut vm = Vm::default();
    load_app(&mut vm);
    assert!(vm.heap.live() > 0);
    vm.shutdown();
    assert!(vm.globals.is_empty());
    assert_eq!(vm.heap.live(), 0);
    // units survive for a later load
    assert!(vm.unit("app.main").is_some());
}

#[test]
fn engine_config_from_toml() {
    let config = EngineConfig::from_toml_str("fusion = false\nmax_frames = 8").unwrap();
    assert!(!config.fusion);
    assert_eq!(config.max_frames, 8);
    assert_eq!(config.yield_interval, EngineConfig::default().yield_interval);
    assert!(EngineConfig::from_toml_str("max_frames = \"many\"").is_err());
}

#[test]
fn fused_and_plain_loads_agree() {
    for fusion in [true, false] {
        let mut vm = Vm::new(EngineConfig {
            fusion,
            ..EngineConfig::default()
        });
        load_app(&mut vm);
        assert_eq!(run_int(&mut vm, "app.twice", vec![Value::int(21)]), 42);
    }
}
