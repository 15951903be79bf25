//! Heap object representation.
//!
//! Every garbage-collected object is a `GcBox`: a header (allocation-list
//! link, mark bit, size) plus an `Obj` payload. The heap hands out raw
//! `*mut GcBox` pointers; the collector owns their lifetime. Objects never
//! move, so a pointer stays valid until the object becomes unreachable and
//! a sweep reclaims it.
//!
//! Open upvalues record their owning coroutine and an absolute slot index
//! rather than an interior pointer, because coroutine value stacks grow
//! geometrically and may reallocate.

use std::io::Write;
use std::time::Instant;

use crate::chunk::Chunk;
use crate::heap::Heap;
use crate::table::Table;
use crate::value::Value;

pub type RawObj = *mut GcBox;

/// FNV-1a, the hash used for string interning and dictionary keys.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    Str,
    Function,
    Closure,
    Upvalue,
    Native,
    List,
    Dict,
    Coroutine,
}

pub struct GcBox {
    /// Next object in the heap's allocation list.
    pub(crate) next: RawObj,
    /// Compared against the heap's flipping current-mark value; equal means
    /// reachable this cycle.
    pub(crate) marked: bool,
    /// Allocation-time footprint, credited back at sweep.
    pub(crate) size: usize,
    pub obj: Obj,
}

pub enum Obj {
    Str(StrObj),
    Function(FunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Native(NativeObj),
    List(ListObj),
    Dict(DictObj),
    Coroutine(CoroutineObj),
}

impl GcBox {
    pub fn kind(&self) -> ObjKind {
        match self.obj {
            Obj::Str(_) => ObjKind::Str,
            Obj::Function(_) => ObjKind::Function,
            Obj::Closure(_) => ObjKind::Closure,
            Obj::Upvalue(_) => ObjKind::Upvalue,
            Obj::Native(_) => ObjKind::Native,
            Obj::List(_) => ObjKind::List,
            Obj::Dict(_) => ObjKind::Dict,
            Obj::Coroutine(_) => ObjKind::Coroutine,
        }
    }

    /// Runtime type name; closures report `function` because that is what
    /// the language-level user created.
    pub fn type_name(&self) -> &'static str {
        match self.obj {
            Obj::Str(_) => "string",
            Obj::Function(_) | Obj::Closure(_) => "function",
            Obj::Upvalue(_) => "upvalue",
            Obj::Native(_) => "native",
            Obj::List(_) => "list",
            Obj::Dict(_) => "dict",
            Obj::Coroutine(_) => "coroutine",
        }
    }

    pub fn string(&self) -> &StrObj {
        match &self.obj {
            Obj::Str(s) => s,
            _ => unreachable!("expected string object"),
        }
    }

    pub fn function(&self) -> &FunctionObj {
        match &self.obj {
            Obj::Function(f) => f,
            _ => unreachable!("expected function object"),
        }
    }

    pub fn function_mut(&mut self) -> &mut FunctionObj {
        match &mut self.obj {
            Obj::Function(f) => f,
            _ => unreachable!("expected function object"),
        }
    }

    pub fn closure(&self) -> &ClosureObj {
        match &self.obj {
            Obj::Closure(c) => c,
            _ => unreachable!("expected closure object"),
        }
    }

    pub fn closure_mut(&mut self) -> &mut ClosureObj {
        match &mut self.obj {
            Obj::Closure(c) => c,
            _ => unreachable!("expected closure object"),
        }
    }

    pub fn upvalue(&self) -> &UpvalueObj {
        match &self.obj {
            Obj::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    pub fn upvalue_mut(&mut self) -> &mut UpvalueObj {
        match &mut self.obj {
            Obj::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    pub fn native(&self) -> &NativeObj {
        match &self.obj {
            Obj::Native(n) => n,
            _ => unreachable!("expected native object"),
        }
    }

    pub fn list(&self) -> &ListObj {
        match &self.obj {
            Obj::List(l) => l,
            _ => unreachable!("expected list object"),
        }
    }

    pub fn list_mut(&mut self) -> &mut ListObj {
        match &mut self.obj {
            Obj::List(l) => l,
            _ => unreachable!("expected list object"),
        }
    }

    pub fn dict(&self) -> &DictObj {
        match &self.obj {
            Obj::Dict(d) => d,
            _ => unreachable!("expected dict object"),
        }
    }

    pub fn dict_mut(&mut self) -> &mut DictObj {
        match &mut self.obj {
            Obj::Dict(d) => d,
            _ => unreachable!("expected dict object"),
        }
    }

    pub fn coroutine(&self) -> &CoroutineObj {
        match &self.obj {
            Obj::Coroutine(c) => c,
            _ => unreachable!("expected coroutine object"),
        }
    }

    pub fn coroutine_mut(&mut self) -> &mut CoroutineObj {
        match &mut self.obj {
            Obj::Coroutine(c) => c,
            _ => unreachable!("expected coroutine object"),
        }
    }
}

impl Obj {
    /// Payload footprint beyond the `GcBox` itself, used for the
    /// allocation-pressure heuristic. Post-allocation growth of interior
    /// vectors is deliberately not re-measured.
    pub(crate) fn heap_size(&self) -> usize {
        use std::mem::size_of;
        match self {
            Obj::Str(s) => s.as_str().len(),
            Obj::Function(f) => {
                f.chunk.code.capacity()
                    + f.chunk.constants.capacity() * size_of::<Value>()
                    + f.chunk.lines.byte_size()
            }
            Obj::Closure(c) => c.upvalues.capacity() * size_of::<RawObj>(),
            Obj::Upvalue(_) => 0,
            Obj::Native(_) => 0,
            Obj::List(l) => l.items.capacity() * size_of::<Value>(),
            Obj::Dict(d) => d.entries.byte_size(),
            Obj::Coroutine(c) => {
                c.stack.capacity() * size_of::<Value>()
                    + c.frames.capacity() * size_of::<CallFrame>()
            }
        }
    }
}

/// An immutable, interned string. The buffer is either owned by the object
/// or borrowed from host static data (native names and similar).
pub struct StrObj {
    pub hash: u32,
    buf: StrBuf,
}

enum StrBuf {
    Owned(Box<str>),
    Static(&'static str),
}

impl StrObj {
    pub fn owned(text: &str) -> StrObj {
        StrObj {
            hash: hash_bytes(text.as_bytes()),
            buf: StrBuf::Owned(Box::from(text)),
        }
    }

    pub fn borrowed(text: &'static str) -> StrObj {
        StrObj {
            hash: hash_bytes(text.as_bytes()),
            buf: StrBuf::Static(text),
        }
    }

    pub fn as_str(&self) -> &str {
        match &self.buf {
            StrBuf::Owned(s) => s,
            StrBuf::Static(s) => s,
        }
    }

    pub fn len(&self) -> usize {
        self.as_str().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }
}

/// A compiled function body. Produced by the compiler, never mutated after
/// compilation finishes.
pub struct FunctionObj {
    pub arity: u8,
    pub upvalue_count: u8,
    /// Interned name string, or null for the top-level script.
    pub name: RawObj,
    pub chunk: Chunk,
}

impl FunctionObj {
    pub fn new(name: RawObj) -> FunctionObj {
        FunctionObj {
            arity: 0,
            upvalue_count: 0,
            name,
            chunk: Chunk::new(),
        }
    }
}

/// A function plus its captured upvalues. Every call target the interpreter
/// invokes is a closure, even when the function captures nothing.
pub struct ClosureObj {
    pub function: RawObj,
    pub upvalues: Vec<RawObj>,
}

/// A captured variable. Open while the owning stack slot is live; closed
/// once the slot leaves scope, at which point the value moves inline.
pub struct UpvalueObj {
    pub state: UpvalueState,
    /// Next entry in the owning coroutine's open-upvalue list (sorted by
    /// strictly descending slot). Null when closed or at the tail.
    pub next: RawObj,
}

pub enum UpvalueState {
    Open { owner: RawObj, slot: usize },
    Closed(Value),
}

impl UpvalueObj {
    /// Slot index while open; closed upvalues are past the end of any list
    /// walk, so this is only meaningful for open ones.
    pub fn open_slot(&self) -> Option<usize> {
        match self.state {
            UpvalueState::Open { slot, .. } => Some(slot),
            UpvalueState::Closed(_) => None,
        }
    }
}

/// Context handed to native functions. Natives run synchronously on the
/// invoking coroutine and may not suspend.
pub struct NativeCtx<'a> {
    pub heap: &'a mut Heap,
    pub out: &'a mut dyn Write,
    /// Interpreter start time, for `clock()`.
    pub started: Instant,
}

pub type NativeFn = fn(&mut NativeCtx<'_>, u8, &[Value]) -> Result<Value, String>;

pub struct NativeObj {
    pub name: &'static str,
    pub arity: u8,
    pub function: NativeFn,
}

pub struct ListObj {
    pub items: Vec<Value>,
}

pub struct DictObj {
    pub entries: Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineState {
    Ready,
    Running,
    Paused,
    Complete,
    Error,
}

impl CoroutineState {
    pub fn describe(self) -> &'static str {
        match self {
            CoroutineState::Ready => "ready",
            CoroutineState::Running => "running",
            CoroutineState::Paused => "paused",
            CoroutineState::Complete => "completed",
            CoroutineState::Error => "errored",
        }
    }
}

/// One frame of a coroutine's call stack.
#[derive(Clone, Copy)]
pub struct CallFrame {
    pub closure: RawObj,
    /// Instruction offset into the closure's chunk.
    pub ip: usize,
    /// Base index into the owning coroutine's value stack. Slot 0 of every
    /// frame holds the callee itself.
    pub base: usize,
}

/// An independently stackful unit of execution.
pub struct CoroutineObj {
    pub closure: RawObj,
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    /// The coroutine that last resumed this one; null for the main
    /// coroutine.
    pub parent: RawObj,
    pub state: CoroutineState,
    /// Head of the open-upvalue list, sorted by descending slot.
    pub open_upvalues: RawObj,
}

impl CoroutineObj {
    pub fn new(closure: RawObj) -> CoroutineObj {
        CoroutineObj {
            closure,
            stack: Vec::new(),
            frames: Vec::new(),
            parent: std::ptr::null_mut(),
            state: CoroutineState::Ready,
            open_upvalues: std::ptr::null_mut(),
        }
    }

    /// Back to READY with empty stacks, as the `reset()` native requires.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.parent = std::ptr::null_mut();
        self.open_upvalues = std::ptr::null_mut();
        self.state = CoroutineState::Ready;
    }
}
