//! Skiff Runtime: the bytecode interpreter.
//!
//! Executes chunks produced by `skiff-compiler` against the shared
//! `skiff-core` heap: a stack machine with per-coroutine value and call
//! stacks, upvalue capture and close, asymmetric coroutine transfer, and
//! a set of host natives.
//!
//! # Modules
//!
//! - `vm`: the fetch-decode-execute loop and coroutine runtime
//! - `natives`: `clock`, `print`, `type`, `is`, `reset`, `len`
//! - `debug`: the bytecode disassembler
//! - `options`: runtime toggles (tracing, stress GC, code printing)
//! - `error`: runtime-error type with stack traces

pub mod debug;
pub mod error;
mod natives;
pub mod options;
pub mod vm;

pub use debug::{disassemble_chunk, disassemble_instruction};
pub use error::RuntimeError;
pub use options::RuntimeOptions;
pub use vm::{Vm, FRAMES_MAX};
