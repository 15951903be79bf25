//! Incremental compilation for the REPL.
//!
//! The REPL keeps one top-level compiler state alive for the whole
//! session; each input line is compiled into the already-running script
//! function's chunk, so earlier definitions stay visible. A line that
//! fails to compile is rolled back so the chunk never contains half a
//! statement.

use skiff_core::heap::Heap;
use skiff_core::object::{FunctionObj, Obj, RawObj};
use skiff_core::value::Value;

use crate::compiler::{Compiler, CompilerState, FunctionKind};
use crate::error::CompileError;
use crate::scanner::TokenKind;

pub struct ReplCompiler {
    state: Option<Box<CompilerState>>,
}

impl Default for ReplCompiler {
    fn default() -> Self {
        ReplCompiler::new()
    }
}

impl ReplCompiler {
    pub fn new() -> ReplCompiler {
        ReplCompiler { state: None }
    }

    /// The persistent script function, creating it on first use. It stays
    /// on the heap's protect stack for the life of the session.
    pub fn ensure_function(&mut self, heap: &mut Heap) -> RawObj {
        if self.state.is_none() {
            let function = heap.allocate(Obj::Function(FunctionObj::new(std::ptr::null_mut())));
            heap.protect(Value::Obj(function));
            self.state = Some(Box::new(CompilerState::new(function, FunctionKind::Script)));
        }
        self.state.as_ref().expect("state just ensured").function
    }

    /// Compile one input line into the persistent chunk. On error, the
    /// chunk is restored to its previous length.
    pub fn compile_line(&mut self, line: &str, heap: &mut Heap) -> Result<(), CompileError> {
        let function = self.ensure_function(heap);
        let saved = unsafe { (*function).function().chunk.code.len() };

        let state = self.state.take().expect("state just ensured");
        let mut compiler = Compiler::with_state(line, heap, state);
        compiler.advance();
        while !compiler.match_token(TokenKind::Eof) {
            compiler.declaration();
        }
        let (state, result) = compiler.into_state();
        self.state = Some(state);

        if let Err(error) = result {
            unsafe { (*function).function_mut().chunk.truncate(saved) };
            return Err(error);
        }
        Ok(())
    }
}
