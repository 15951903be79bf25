//! REPL session behavior, driven through the library pieces the
//! interactive loop is built from: a persistent `ReplCompiler`, one VM,
//! and error recovery that keeps the session alive.

mod common;

use common::SharedBuf;
use skiff_compiler::ReplCompiler;
use skiff_runtime::{RuntimeOptions, Vm};

struct Session {
    vm: Vm,
    compiler: ReplCompiler,
    closure: skiff_core::object::RawObj,
    buf: SharedBuf,
}

impl Session {
    fn new() -> Session {
        let buf = SharedBuf::default();
        let mut vm = Vm::with_output(RuntimeOptions::default(), Box::new(buf.clone()));
        let mut compiler = ReplCompiler::new();
        let function = compiler.ensure_function(&mut vm.heap);
        let closure = vm.install_script(function);
        Session {
            vm,
            compiler,
            closure,
            buf,
        }
    }

    /// Feed one line; returns what it printed, or the error message.
    fn line(&mut self, text: &str) -> Result<String, String> {
        let before = self.buf.contents().len();
        if let Err(e) = self.compiler.compile_line(text, &mut self.vm.heap) {
            return Err(e.diagnostics.join("\n"));
        }
        if let Err(e) = self.vm.run(true) {
            self.vm.repl_recover(self.closure);
            return Err(e.message);
        }
        Ok(self.buf.contents()[before..].to_string())
    }
}

#[test]
fn test_definitions_persist_across_lines() {
    let mut session = Session::new();
    assert_eq!(session.line("var a = 40;").unwrap(), "");
    assert_eq!(session.line("fun add2(n) { return n + 2; }").unwrap(), "");
    assert_eq!(session.line("print(add2(a));").unwrap(), "42\n");
}

#[test]
fn test_compile_error_does_not_poison_the_session() {
    let mut session = Session::new();
    assert_eq!(session.line("var a = 1;").unwrap(), "");
    let err = session.line("var = ;").unwrap_err();
    assert!(err.contains("Expect variable name."));
    assert_eq!(session.line("print(a);").unwrap(), "1\n");
}

#[test]
fn test_runtime_error_recovers_and_globals_survive() {
    let mut session = Session::new();
    assert_eq!(session.line("var a = 7;").unwrap(), "");
    let err = session.line("missing();").unwrap_err();
    assert_eq!(err, "Can only call functions and coroutines.");
    // Globals live in the globals table, not on the discarded stack.
    assert_eq!(session.line("print(a);").unwrap(), "7\n");
}

#[test]
fn test_stack_snapshot_shows_script_closure() {
    let session = Session::new();
    // Slot 0 of the main frame holds the script closure.
    let stack = session.vm.stack_snapshot();
    assert_eq!(stack.len(), 1);
    assert_eq!(stack[0].to_string(), "<script>");
}

#[test]
fn test_globals_snapshot_lists_natives_and_definitions() {
    let mut session = Session::new();
    session.line("var answer = 42;").unwrap();
    let names: Vec<String> = session
        .vm
        .globals_snapshot()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert!(names.contains(&"answer".to_string()));
    assert!(names.contains(&"print".to_string()));
    assert!(names.contains(&"clock".to_string()));
}
