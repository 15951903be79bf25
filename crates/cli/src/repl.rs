//! Interactive read-eval-print loop.
//!
//! Each line is compiled into the persistent top-level script chunk and
//! the interpreter re-enters it where it left off, so definitions from
//! earlier lines stay live. Errors of either kind are reported and the
//! next prompt is issued. Dot-commands inspect the session: `.exit`,
//! `.stack`, `.globals`, `.help`.

use std::path::PathBuf;

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::debug;

use skiff_compiler::ReplCompiler;
use skiff_runtime::{RuntimeOptions, Vm};

pub fn repl(options: RuntimeOptions) -> Result<(), std::io::Error> {
    let mut editor = DefaultEditor::new()
        .map_err(|e| std::io::Error::other(format!("could not start line editor: {e}")))?;
    let history = history_path();
    if let Some(path) = &history {
        // A missing history file is normal on first run.
        let _ = editor.load_history(path);
    }

    let mut vm = Vm::new(options);
    let mut compiler = ReplCompiler::new();
    let function = compiler.ensure_function(&mut vm.heap);
    let closure = vm.install_script(function);

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                if let Some(command) = line.strip_prefix('.') {
                    if run_command(command, &vm) {
                        break;
                    }
                    continue;
                }
                if compiler.compile_line(line, &mut vm.heap).is_err() {
                    // Diagnostics already went to stderr; the failed line
                    // was rolled back.
                    continue;
                }
                if let Err(error) = vm.run(true) {
                    eprintln!("{error}");
                    vm.repl_recover(closure);
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("input error: {e}");
                break;
            }
        }
    }

    if let Some(path) = &history {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = editor.save_history(path) {
            debug!("could not save history: {e}");
        }
    }
    Ok(())
}

/// Returns true when the session should end.
fn run_command(command: &str, vm: &Vm) -> bool {
    match command {
        "exit" => true,
        "stack" => {
            println!("Stack:");
            for value in vm.stack_snapshot() {
                println!("  {value}");
            }
            false
        }
        "globals" => {
            println!("Globals:");
            for (name, value) in vm.globals_snapshot() {
                println!("  {name} = {value}");
            }
            false
        }
        "help" => {
            println!(".exit     end the session");
            println!(".stack    print the value stack");
            println!(".globals  print the globals table");
            println!(".help     this text");
            false
        }
        other => {
            println!("Unknown command .{other}");
            false
        }
    }
}

fn history_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("skiff").join("history.txt"))
}
