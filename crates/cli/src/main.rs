//! Skiff CLI
//!
//! One binary: with no arguments it starts the REPL; with a script path it
//! compiles and runs the file. Exit codes follow the usual convention:
//! 0 success, 65 compile error, 70 runtime error, 74 I/O error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::warn;

use skiff_cli::{RunError, repl, run_file};
use skiff_runtime::RuntimeOptions;

#[derive(Parser)]
#[command(name = "skiff")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Skiff interpreter - run .skf scripts or start a REPL", long_about = None)]
struct Cli {
    /// Script to run; omit to start the interactive REPL
    script: Option<PathBuf>,

    /// Bytecode output path (reserved for a future bytecode file format)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print each instruction and the stack while executing
    #[arg(long)]
    trace: bool,

    /// Disassemble compiled code before running it
    #[arg(long)]
    print_code: bool,

    /// Run a garbage collection on every allocation
    #[arg(long)]
    stress_gc: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("skiff=warn".parse().expect("static directive parses")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options =
        RuntimeOptions::from_env().with_flags(cli.stress_gc, cli.trace, cli.print_code);

    if cli.output.is_some() {
        warn!("bytecode output is not implemented yet; ignoring -o/--output");
    }

    match cli.script {
        None => match repl::repl(options) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{e}");
                ExitCode::from(74)
            }
        },
        Some(path) => match run_file(&path, options) {
            Ok(()) => ExitCode::SUCCESS,
            Err(RunError::Io(e)) => {
                eprintln!("Could not read {}: {e}", path.display());
                ExitCode::from(74)
            }
            // Compile diagnostics were already printed as they were found.
            Err(RunError::Compile(_)) => ExitCode::from(65),
            Err(RunError::Runtime(e)) => {
                eprintln!("{e}");
                ExitCode::from(70)
            }
        },
    }
}
