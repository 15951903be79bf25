//! Skiff Core: the shared foundation of the Skiff virtual machine.
//!
//! This crate holds everything the compiler and the interpreter both need:
//! runtime values, heap objects, the garbage-collected heap, the
//! string-keyed hash table, and bytecode chunks. It depends on neither of
//! them, so the compiler can allocate functions and interned strings
//! through the same heap the interpreter later mutates.
//!
//! # Modules
//!
//! - `value`: the `Value` tagged union (nil, boolean, number, object)
//! - `object`: heap object payloads and the `GcBox` header
//! - `table`: open-addressed string-keyed hash table
//! - `chunk`: opcodes, chunks, and the run-length line table
//! - `heap`: allocation, interning, and mark-sweep collection

pub mod chunk;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, LineInfo, OpCode, LONG_INDEX_MAX, SHORT_INDEX_MAX};
pub use heap::Heap;
pub use object::{
    CallFrame, ClosureObj, CoroutineObj, CoroutineState, DictObj, FunctionObj, GcBox, ListObj,
    NativeCtx, NativeFn, NativeObj, Obj, ObjKind, RawObj, StrObj, UpvalueObj, UpvalueState,
};
pub use table::Table;
pub use value::Value;
