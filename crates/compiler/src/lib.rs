//! Skiff Compiler: source text to bytecode.
//!
//! A single-pass pipeline: the scanner produces tokens on demand and the
//! Pratt compiler emits bytecode as it parses, resolving every name to a
//! local slot, an upvalue, or a global along the way. Functions are
//! allocated on the shared heap (`skiff-core`), so compilation cooperates
//! with the garbage collector.
//!
//! # Modules
//!
//! - `scanner`: the tokenizer
//! - `compiler`: the Pratt parser / bytecode emitter
//! - `repl`: persistent line-by-line compilation for the REPL
//! - `error`: compile-error type

pub mod compiler;
pub mod error;
pub mod repl;
pub mod scanner;

pub use compiler::compile;
pub use error::CompileError;
pub use repl::ReplCompiler;
pub use scanner::{Scanner, Token, TokenKind};
