//! File-mode behavior: reading scripts from disk and the error mapping
//! the binary turns into exit codes.

use std::io::Write as _;

use skiff_cli::{RunError, run_file};
use skiff_runtime::RuntimeOptions;

#[test]
fn test_runs_a_script_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("demo.skf");
    std::fs::write(&path, "var greeting = \"hello\"; print(len(greeting));").unwrap();

    // Output goes to real stdout here; success is what is under test.
    run_file(&path, RuntimeOptions::default()).unwrap();
}

#[test]
fn test_missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("no-such-script.skf");
    match run_file(&path, RuntimeOptions::default()) {
        Err(RunError::Io(_)) => {}
        other => panic!("expected an I/O error, got {other:?}"),
    }
}

#[test]
fn test_compile_error_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.skf");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "fun () {{}}").unwrap();
    drop(file);

    match run_file(&path, RuntimeOptions::default()) {
        Err(RunError::Compile(_)) => {}
        other => panic!("expected a compile error, got {other:?}"),
    }
}

#[test]
fn test_runtime_error_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("explodes.skf");
    std::fs::write(&path, "print(1); nope();").unwrap();

    match run_file(&path, RuntimeOptions::default()) {
        Err(RunError::Runtime(e)) => {
            assert_eq!(e.message, "Can only call functions and coroutines.");
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
}
