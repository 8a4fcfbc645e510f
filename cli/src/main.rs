use std::path::{Component, Path, PathBuf};
use std::sync::Once;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use ember_core::vm::Program;
use ember_core::{EngineConfig, Job, Outcome, Value, Vm};

mod bindings;

static TRACE_INIT: Once = Once::new();
const DEFAULT_TRACE_FILTER: &str = "ember::vm::engine=debug,ember::vm::globals=debug,ember::vm::fuse=info,ember_cli=info";

#[derive(Debug, Parser)]
#[command(name = "ember", author, version, about = "Runner for Ember programs", long_about = None)]
struct CliArgs {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load a program file and call its entry function
    Run {
        #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
        file: PathBuf,

        /// How the entry job is driven
        #[arg(long, value_enum)]
        mode: Option<RunMode>,

        /// Instructions per slice in bounded mode
        #[arg(long)]
        budget: Option<u64>,

        /// Engine config (TOML)
        #[arg(long, value_name = "FILE", value_parser = parse_sanitized_path)]
        config: Option<PathBuf>,

        /// Compile every instruction on its own
        #[arg(long)]
        no_fuse: bool,

        /// Function path to call after loading
        #[arg(long, default_value = "main")]
        entry: String,
    },
    /// Print the fused step layout of every function in a program file
    Fuse {
        #[arg(value_name = "FILE", value_parser = parse_sanitized_path)]
        file: PathBuf,

        /// Show the unfused layout instead
        #[arg(long)]
        no_fuse: bool,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum RunMode {
    #[default]
    Sync,
    Bounded,
    Async,
}

fn sanitize_path(raw: &str) -> anyhow::Result<PathBuf> {
    let p = Path::new(raw);

    for comp in p.components() {
        if matches!(comp, Component::ParentDir) {
            return Err(anyhow::anyhow!(
                "Parent directory components ('..') are not allowed in file paths."
            ));
        }
    }

    Ok(p.to_path_buf())
}

fn parse_sanitized_path(raw: &str) -> Result<PathBuf, String> {
    sanitize_path(raw).map_err(|e| e.to_string())
}

fn env_toggle_enabled(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return false;
    }
    !(trimmed.eq_ignore_ascii_case("0") || trimmed.eq_ignore_ascii_case("false") || trimmed.eq_ignore_ascii_case("off"))
}

fn filter_expr_from(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("1")
        || trimmed.eq_ignore_ascii_case("true")
        || trimmed.eq_ignore_ascii_case("on")
    {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn maybe_init_tracing() {
    let raw = match std::env::var("EMBER_TRACE") {
        Ok(value) => value,
        Err(_) => return,
    };

    if !env_toggle_enabled(&raw) {
        return;
    }

    TRACE_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::fmt;

        let filter_expr = filter_expr_from(&raw).or_else(|| std::env::var("RUST_LOG").ok());

        let builder = fmt().with_writer(std::io::stderr);

        let builder = match filter_expr.and_then(|expr| EnvFilter::try_new(expr).ok()) {
            Some(filter) => builder.with_env_filter(filter),
            None => builder.with_env_filter(DEFAULT_TRACE_FILTER),
        };

        let _ = builder.try_init();
    });
}

/// Merge the config file with command line overrides.
fn engine_config(config: Option<&Path>, budget: Option<u64>, no_fuse: bool) -> anyhow::Result<EngineConfig> {
    let mut engine = match config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(budget) = budget {
        if budget == 0 {
            anyhow::bail!("--budget must be at least 1");
        }
        engine.default_budget = budget;
    }
    if no_fuse {
        engine.fusion = false;
    }
    Ok(engine)
}

fn load_vm(file: &Path, engine: EngineConfig) -> anyhow::Result<Vm> {
    let program = Program::from_file(file)?;
    let mut vm = Vm::new(engine);
    bindings::register(&mut vm)?;
    vm.load(&program.modules)
        .with_context(|| format!("loading {}", file.display()))?;
    tracing::debug!(target: "ember_cli", modules = program.modules.len(), units = vm.units().len(), "program loaded");
    Ok(vm)
}

fn drive(rt: &tokio::runtime::Runtime, vm: &mut Vm, job: &mut Job, mode: RunMode) -> anyhow::Result<Outcome> {
    match mode {
        RunMode::Sync => {
            let _guard = rt.enter();
            job.run(vm)
        }
        RunMode::Bounded => {
            let _guard = rt.enter();
            let budget = vm.config.default_budget;
            let mut slices = 0u64;
            loop {
                match job.run_bounded(vm, budget)? {
                    Outcome::Halted => {
                        slices += 1;
                        if job.is_waiting() {
                            std::thread::yield_now();
                        }
                    }
                    done => {
                        tracing::debug!(target: "ember_cli", slices, "bounded run finished");
                        return Ok(done);
                    }
                }
            }
        }
        RunMode::Async => rt.block_on(job.run_async(vm)),
    }
}

fn print_values(vm: &mut Vm, values: Vec<Value>) {
    for value in &values {
        println!("{}", vm.render(value));
    }
    vm.heap.dispose_all(values);
}

fn run_file(
    file: &Path,
    mode: RunMode,
    budget: Option<u64>,
    config: Option<&Path>,
    no_fuse: bool,
    entry: &str,
) -> anyhow::Result<()> {
    let engine = engine_config(config, budget, no_fuse)?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;

    let mut vm = {
        let _guard = rt.enter();
        load_vm(file, engine)?
    };

    let mut job = Job::new();
    job.call(&mut vm, entry, Vec::new())?;
    let result = drive(&rt, &mut vm, &mut job, mode);
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            job.teardown(&mut vm);
            vm.shutdown();
            return Err(err.context(format!("running {}", entry)));
        }
    };

    if let Outcome::Completed(values) = outcome {
        print_values(&mut vm, values);
    }
    vm.shutdown();
    Ok(())
}

fn fuse_file(file: &Path, no_fuse: bool) -> anyhow::Result<()> {
    let program = Program::from_file(file)?;
    let mut vm = Vm::new(EngineConfig {
        fusion: !no_fuse,
        ..EngineConfig::default()
    });
    for module in &program.modules {
        let defs = module
            .functions
            .iter()
            .chain(module.statics.iter().map(|s| &s.init))
            .chain(module.init.iter());
        for def in defs {
            vm.compile_unit(def)?;
        }
    }
    for unit in vm.units() {
        print!("{}", unit.describe());
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    maybe_init_tracing();

    let CliArgs { command } = CliArgs::parse();

    match command {
        Commands::Run {
            file,
            mode,
            budget,
            config,
            no_fuse,
            entry,
        } => run_file(
            &file,
            mode.unwrap_or_default(),
            budget,
            config.as_deref(),
            no_fuse,
            &entry,
        ),
        Commands::Fuse { file, no_fuse } => fuse_file(&file, no_fuse),
    }
}
