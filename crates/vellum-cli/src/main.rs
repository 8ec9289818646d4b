//! Command-line entry point (§4.K, §6): run a script file or drop into an
//! interactive REPL. Exit codes follow the BSD `sysexits.h` convention the
//! original implementation also used: `0` success, `64` usage error, `65`
//! compile error, `70` runtime error.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use vellum_core::{disasm, Obj};
use vellum_vm::{Vm, VmConfig};

mod repl;

const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;

/// Run a Vellum script, or start the REPL when no file is given.
#[derive(Parser)]
#[command(name = "vellum", version, about = "The Vellum bytecode interpreter", long_about = None)]
struct Cli {
    /// Script file to execute. Omitted: start the REPL.
    path: Option<PathBuf>,

    /// Log every executed instruction and the value stack before it runs.
    #[arg(long)]
    trace_execution: bool,

    /// Force a garbage collection cycle before every allocation.
    #[arg(long)]
    stress_gc: bool,

    /// Print the compiled chunk's disassembly before running it.
    #[arg(long)]
    dump: bool,

    /// Raise the log level (repeatable: -v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    if let Err(e) = color_eyre::install() {
        eprintln!("vellum: failed to install error handler: {e}");
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EX_USAGE);
        }
    };
    init_logging(cli.verbose, cli.trace_execution);

    let config = VmConfig { trace_execution: cli.trace_execution, stress_gc: cli.stress_gc };

    match cli.path {
        Some(path) => run_file(&path, config, cli.dump),
        None => repl::run(config),
    }
}

fn init_logging(verbose: u8, trace_execution: bool) {
    let filter = if let Ok(from_env) = EnvFilter::try_from_env("VELLUM_LOG") {
        from_env
    } else {
        let base = match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        let filter = EnvFilter::new(base);
        if trace_execution {
            filter.add_directive("vellum_vm=trace".parse().expect("static directive parses"))
        } else {
            filter
        }
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).without_time().init();
}

fn run_file(path: &Path, config: VmConfig, dump: bool) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("vellum: can't read '{}': {e}", path.display());
            return ExitCode::from(EX_USAGE);
        }
    };

    let mut vm = Vm::new(config);
    let script = match vellum_compiler::compile(&source, vm.heap_mut()) {
        Ok(script) => script,
        Err(diagnostics) => {
            for d in &diagnostics {
                eprintln!("{d}");
            }
            return ExitCode::from(EX_DATAERR);
        }
    };

    if dump {
        if let Obj::Function { chunk, .. } = vm.heap().get(script) {
            print!("{}", disasm::disassemble_chunk(chunk, vm.heap(), &path.display().to_string()));
        }
    }

    let stdout = std::io::stdout();
    match vm.run(script, &mut stdout.lock()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            for frame in &err.trace {
                eprintln!("{frame}");
            }
            ExitCode::from(EX_SOFTWARE)
        }
    }
}
