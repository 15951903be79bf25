//! Skiff CLI library: compile-and-run plumbing shared by the `skiff`
//! binary and the integration tests.

pub mod repl;

use std::io::Write;
use std::path::Path;

use skiff_compiler::CompileError;
use skiff_runtime::{RuntimeError, RuntimeOptions, Vm, disassemble_chunk};

/// Everything that can go wrong running a program, mapped by the binary to
/// the conventional exit codes (74 / 65 / 70).
#[derive(Debug)]
pub enum RunError {
    Io(std::io::Error),
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Io(e) => write!(f, "{e}"),
            RunError::Compile(e) => write!(f, "{e}"),
            RunError::Runtime(e) => write!(f, "{e}"),
        }
    }
}

/// Compile and run a source file.
pub fn run_file(path: &Path, options: RuntimeOptions) -> Result<(), RunError> {
    let source = std::fs::read_to_string(path).map_err(RunError::Io)?;
    run_source(&source, options)
}

/// Compile and run source text with `print` going to stdout.
pub fn run_source(source: &str, options: RuntimeOptions) -> Result<(), RunError> {
    let mut vm = Vm::new(options);
    run_in_vm(&mut vm, source, options)
}

/// Compile and run source text in a VM whose output sink the caller
/// controls; the tests capture program output this way.
pub fn run_source_with_output(
    source: &str,
    options: RuntimeOptions,
    out: Box<dyn Write>,
) -> Result<(), RunError> {
    let mut vm = Vm::with_output(options, out);
    run_in_vm(&mut vm, source, options)
}

fn run_in_vm(vm: &mut Vm, source: &str, options: RuntimeOptions) -> Result<(), RunError> {
    let function = skiff_compiler::compile(source, &mut vm.heap).map_err(RunError::Compile)?;
    if options.print_code {
        let chunk = unsafe { &(*function).function().chunk };
        let mut err = std::io::stderr().lock();
        let _ = disassemble_chunk(chunk, "script", &mut err);
    }
    vm.run_function(function).map_err(RunError::Runtime)
}
