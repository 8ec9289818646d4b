//! Line-by-line REPL (§4.K): one [`vellum_vm::Vm`] persists for the whole
//! session so globals and classes defined on one line stay visible to the
//! next, matching the original implementation's `repl()` loop.

use std::process::ExitCode;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use vellum_vm::{Vm, VmConfig};

pub fn run(config: VmConfig) -> ExitCode {
    println!("vellum {} — ctrl-d to exit", env!("CARGO_PKG_VERSION"));
    let mut vm = Vm::new(config);
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("vellum: can't start line editor: {e}");
            return ExitCode::FAILURE;
        }
    };

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                eval_line(&mut vm, &line);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("vellum: read error: {e}");
                break;
            }
        }
    }
    ExitCode::SUCCESS
}

fn eval_line(vm: &mut Vm, line: &str) {
    let script = match vellum_compiler::compile(line, vm.heap_mut()) {
        Ok(script) => script,
        Err(diagnostics) => {
            for d in &diagnostics {
                eprintln!("{d}");
            }
            return;
        }
    };

    let stdout = std::io::stdout();
    if let Err(err) = vm.run(script, &mut stdout.lock()) {
        eprintln!("{err}");
        for frame in &err.trace {
            eprintln!("{frame}");
        }
    }
}
