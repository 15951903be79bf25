//! The bytecode interpreter.
//!
//! All execution state lives in one owned `Vm` value: the heap, the
//! globals table object, and the running/main coroutine pointers. There
//! are no process-wide singletons; the interpreter threads `&mut self`
//! through everything.
//!
//! Execution state is per-coroutine. Every `push`/`pop`/`peek` targets the
//! running coroutine's value stack, and the fetch loop reads through its
//! top call frame. Coroutine transfer (resume via `OP_CALL`, suspend via
//! `OP_YIELD`) just swaps which coroutine is running.
//!
//! ## Raw-pointer discipline
//!
//! Heap objects are reached through raw pointers. The collector never
//! moves objects and never frees anything reachable from the roots, so a
//! pointer to a rooted object stays valid across allocation. Borrows
//! derived from those pointers, however, are dropped before any call that
//! can allocate, and multi-step constructions keep their intermediates on
//! the (rooted) value stack or the heap's protect stack.

use std::io::{self, Write};
use std::time::Instant;

use tracing::trace;

use skiff_core::chunk::OpCode;
use skiff_core::heap::Heap;
use skiff_core::object::{
    CallFrame, ClosureObj, CoroutineObj, CoroutineState, DictObj, FunctionObj, ListObj, NativeCtx,
    NativeFn, NativeObj, Obj, ObjKind, RawObj, UpvalueObj, UpvalueState,
};
use skiff_core::table::Table;
use skiff_core::value::Value;

use crate::debug::disassemble_instruction;
use crate::error::RuntimeError;
use crate::natives;
use crate::options::RuntimeOptions;

/// Call-frame cap per coroutine; exceeding it is a stack-overflow error.
pub const FRAMES_MAX: usize = 256;

enum Flow {
    Continue,
    Done,
}

pub struct Vm {
    pub heap: Heap,
    options: RuntimeOptions,
    out: Box<dyn Write>,
    started: Instant,
    globals: RawObj,
    main: RawObj,
    running: RawObj,
}

unsafe fn coroutine_mut<'a>(co: RawObj) -> &'a mut CoroutineObj {
    unsafe { (*co).coroutine_mut() }
}

unsafe fn closure_function<'a>(closure: RawObj) -> &'a FunctionObj {
    unsafe { (*(*closure).closure().function).function() }
}

unsafe fn value_str<'a>(value: Value) -> Option<&'a str> {
    match value {
        Value::Obj(ptr) if unsafe { (*ptr).kind() } == ObjKind::Str => {
            Some(unsafe { (*ptr).string().as_str() })
        }
        _ => None,
    }
}

impl Vm {
    pub fn new(options: RuntimeOptions) -> Vm {
        Vm::with_output(options, Box::new(io::stdout()))
    }

    /// Build a VM whose `print()` output goes to `out` instead of stdout.
    pub fn with_output(options: RuntimeOptions, out: Box<dyn Write>) -> Vm {
        let mut heap = Heap::new(options.stress_gc);
        let globals = heap.allocate(Obj::Dict(DictObj {
            entries: Table::new(),
        }));
        heap.set_globals(globals);
        let mut vm = Vm {
            heap,
            options,
            out,
            started: Instant::now(),
            globals,
            main: std::ptr::null_mut(),
            running: std::ptr::null_mut(),
        };
        natives::install(&mut vm);
        vm
    }

    pub(crate) fn define_native(&mut self, name: &'static str, arity: u8, function: NativeFn) {
        let name_obj = self.heap.intern_static(name);
        self.heap.protect(Value::Obj(name_obj));
        let native = self.heap.allocate(Obj::Native(NativeObj {
            name,
            arity,
            function,
        }));
        unsafe {
            (*self.globals)
                .dict_mut()
                .entries
                .set(name_obj, Value::Obj(native));
        }
        self.heap.unprotect();
    }

    /// Wrap `function` in a closure and a main coroutine, ready to run.
    /// Returns the closure so a REPL can re-enter it after errors.
    pub fn install_script(&mut self, function: RawObj) -> RawObj {
        self.heap.protect(Value::Obj(function));
        let closure = self.heap.allocate(Obj::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        }));
        self.heap.unprotect();
        self.heap.protect(Value::Obj(closure));
        let main = self.heap.allocate(Obj::Coroutine(CoroutineObj::new(closure)));
        self.heap.unprotect();
        unsafe {
            let co = coroutine_mut(main);
            co.state = CoroutineState::Running;
            co.stack.push(Value::Obj(closure));
            co.frames.push(CallFrame {
                closure,
                ip: 0,
                base: 0,
            });
        }
        self.main = main;
        self.running = main;
        self.heap.set_running(Value::Obj(main));
        closure
    }

    /// Compile-and-run entry point for file mode.
    pub fn run_function(&mut self, function: RawObj) -> Result<(), RuntimeError> {
        self.install_script(function);
        self.run(false)
    }

    /// Put the main coroutine back at the end of the script chunk after a
    /// runtime error, so a REPL session can continue.
    pub fn repl_recover(&mut self, closure: RawObj) {
        unsafe {
            let co = coroutine_mut(self.main);
            co.stack.clear();
            co.frames.clear();
            co.open_upvalues = std::ptr::null_mut();
            co.parent = std::ptr::null_mut();
            co.state = CoroutineState::Running;
            co.stack.push(Value::Obj(closure));
            let end = closure_function(closure).chunk.code.len();
            co.frames.push(CallFrame {
                closure,
                ip: end,
                base: 0,
            });
        }
        self.running = self.main;
        self.heap.set_running(Value::Obj(self.main));
    }

    /// Values currently on the running coroutine's stack (REPL `.stack`).
    pub fn stack_snapshot(&self) -> Vec<Value> {
        if self.running.is_null() {
            return Vec::new();
        }
        unsafe { coroutine_mut(self.running).stack.clone() }
    }

    /// Name/value pairs in the globals table (REPL `.globals`).
    pub fn globals_snapshot(&self) -> Vec<(String, Value)> {
        let mut entries: Vec<(String, Value)> = unsafe {
            (*self.globals)
                .dict()
                .entries
                .iter()
                .map(|(key, value)| ((*key).string().as_str().to_string(), value))
                .collect()
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    // ------------------------------------------------------------------
    // Stack and fetch helpers
    // ------------------------------------------------------------------

    fn push(&mut self, value: Value) {
        unsafe { coroutine_mut(self.running).stack.push(value) }
    }

    fn pop(&mut self) -> Value {
        unsafe {
            coroutine_mut(self.running)
                .stack
                .pop()
                .expect("value stack underflow")
        }
    }

    fn peek(&self, distance: usize) -> Value {
        unsafe {
            let stack = &coroutine_mut(self.running).stack;
            stack[stack.len() - 1 - distance]
        }
    }

    fn read_byte(&mut self) -> u8 {
        unsafe {
            let co = coroutine_mut(self.running);
            let frame = co.frames.last_mut().expect("no active call frame");
            let byte = closure_function(frame.closure).chunk.code[frame.ip];
            frame.ip += 1;
            byte
        }
    }

    /// 24-bit little-endian operand.
    fn read_u24(&mut self) -> usize {
        let a = self.read_byte() as usize;
        let b = self.read_byte() as usize;
        let c = self.read_byte() as usize;
        a | b << 8 | c << 16
    }

    /// 4-byte big-endian signed jump displacement.
    fn read_i32(&mut self) -> i32 {
        let bytes = [
            self.read_byte(),
            self.read_byte(),
            self.read_byte(),
            self.read_byte(),
        ];
        i32::from_be_bytes(bytes)
    }

    fn read_index(&mut self, long: bool) -> usize {
        if long {
            self.read_u24()
        } else {
            self.read_byte() as usize
        }
    }

    fn read_constant(&mut self, long: bool) -> Value {
        let index = self.read_index(long);
        unsafe {
            let co = coroutine_mut(self.running);
            let frame = co.frames.last().expect("no active call frame");
            closure_function(frame.closure).chunk.constants[index]
        }
    }

    /// Name constants are always interned strings; the compiler guarantees
    /// it.
    fn read_string_constant(&mut self, long: bool) -> RawObj {
        self.read_constant(long)
            .as_obj()
            .expect("name constant is a string")
    }

    fn current_frame(&self) -> CallFrame {
        unsafe {
            *coroutine_mut(self.running)
                .frames
                .last()
                .expect("no active call frame")
        }
    }

    fn adjust_ip(&mut self, offset: i64) {
        unsafe {
            let co = coroutine_mut(self.running);
            let frame = co.frames.last_mut().expect("no active call frame");
            frame.ip = (frame.ip as i64 + offset) as usize;
        }
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    /// Build a runtime error with a stack trace, then reset the running
    /// coroutine to the ERROR state.
    fn error(&mut self, message: impl Into<String>) -> RuntimeError {
        let trace = self.capture_trace();
        unsafe {
            let co = coroutine_mut(self.running);
            co.state = CoroutineState::Error;
            co.stack.clear();
            co.frames.clear();
            co.open_upvalues = std::ptr::null_mut();
        }
        RuntimeError {
            message: message.into(),
            trace,
        }
    }

    fn capture_trace(&self) -> Vec<String> {
        let mut trace = Vec::new();
        unsafe {
            let co = coroutine_mut(self.running);
            for frame in &co.frames {
                let function = closure_function(frame.closure);
                let line = function.chunk.lines.line_at(frame.ip.saturating_sub(1));
                if function.name.is_null() {
                    trace.push(format!("[line {line}] in script"));
                } else {
                    let name = (*function.name).string().as_str();
                    trace.push(format!("[line {line}] in {name}()"));
                }
            }
        }
        trace
    }

    // ------------------------------------------------------------------
    // The interpreter loop
    // ------------------------------------------------------------------

    /// Fetch-decode-execute until the main coroutine returns. With
    /// `stop_at_end`, executing off the end of the bottom frame's chunk is
    /// a clean stop instead of an error; the REPL uses this to run a chunk
    /// that grows between calls.
    pub fn run(&mut self, stop_at_end: bool) -> Result<(), RuntimeError> {
        loop {
            if stop_at_end && self.running == self.main {
                let frame_count = unsafe { coroutine_mut(self.running).frames.len() };
                if frame_count == 1 {
                    let frame = self.current_frame();
                    let len = unsafe { closure_function(frame.closure).chunk.code.len() };
                    if frame.ip >= len {
                        return Ok(());
                    }
                }
            }
            if self.options.trace_execution {
                self.trace_instruction();
            }

            let byte = self.read_byte();
            let op = match OpCode::try_from(byte) {
                Ok(op) => op,
                Err(_) => return Err(self.error(format!("Unknown opcode {byte}."))),
            };
            match op {
                OpCode::Constant => {
                    let value = self.read_constant(false);
                    self.push(value);
                }
                OpCode::ConstantLong => {
                    let value = self.read_constant(true);
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal | OpCode::GetLocalLong => {
                    let slot = self.read_index(op == OpCode::GetLocalLong);
                    let base = self.current_frame().base;
                    let value = unsafe { coroutine_mut(self.running).stack[base + slot] };
                    self.push(value);
                }
                OpCode::SetLocal | OpCode::SetLocalLong => {
                    let slot = self.read_index(op == OpCode::SetLocalLong);
                    let base = self.current_frame().base;
                    let value = self.peek(0);
                    unsafe { coroutine_mut(self.running).stack[base + slot] = value };
                }
                OpCode::GetGlobal | OpCode::GetGlobalLong => {
                    let name = self.read_string_constant(op == OpCode::GetGlobalLong);
                    // An undefined global reads as nil rather than raising.
                    let value = unsafe { (*self.globals).dict().entries.get(name) }
                        .unwrap_or(Value::Nil);
                    self.push(value);
                }
                OpCode::SetGlobal | OpCode::SetGlobalLong => {
                    let name = self.read_string_constant(op == OpCode::SetGlobalLong);
                    let value = self.peek(0);
                    let is_new =
                        unsafe { (*self.globals).dict_mut().entries.set(name, value) };
                    if is_new {
                        unsafe { (*self.globals).dict_mut().entries.delete(name) };
                        let text = unsafe { (*name).string().as_str() };
                        return Err(self.error(format!("Undefined variable '{text}'.")));
                    }
                }
                OpCode::DefineGlobal | OpCode::DefineGlobalLong => {
                    let name = self.read_string_constant(op == OpCode::DefineGlobalLong);
                    let value = self.peek(0);
                    unsafe { (*self.globals).dict_mut().entries.set(name, value) };
                    self.pop();
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = unsafe {
                        let frame = self.current_frame();
                        let upvalue = (*frame.closure).closure().upvalues[index];
                        self.read_upvalue(upvalue)
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let value = self.peek(0);
                    unsafe {
                        let frame = self.current_frame();
                        let upvalue = (*frame.closure).closure().upvalues[index];
                        self.write_upvalue(upvalue, value);
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = unsafe { coroutine_mut(self.running).stack.len() - 1 };
                    self.close_upvalues(self.running, top);
                    self.pop();
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(Value::equal(a, b)));
                }
                OpCode::Greater | OpCode::Less => self.binary_compare(op)?,
                OpCode::Add => self.op_add()?,
                OpCode::Subtract | OpCode::Multiply | OpCode::Divide => {
                    self.binary_arithmetic(op)?
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsy()));
                }
                OpCode::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        return Err(self.error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }
                OpCode::Jump => {
                    let offset = self.read_i32();
                    self.adjust_ip(offset as i64);
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_i32();
                    if self.peek(0).is_falsy() {
                        self.adjust_ip(offset as i64);
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_i32();
                    self.adjust_ip(-(offset as i64));
                }
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                OpCode::Closure | OpCode::ClosureLong => {
                    self.op_closure(op == OpCode::ClosureLong)?;
                }
                OpCode::Return => {
                    if let Flow::Done = self.op_return()? {
                        return Ok(());
                    }
                }
                OpCode::List | OpCode::ListLong => {
                    let count = self.read_index(op == OpCode::ListLong);
                    self.op_list(count);
                }
                OpCode::Dict | OpCode::DictLong => {
                    let count = self.read_index(op == OpCode::DictLong);
                    self.op_dict(count)?;
                }
                OpCode::GetField => self.op_get_field()?,
                OpCode::SetField => self.op_set_field()?,
                OpCode::Coroutine => {
                    let closure = self.peek(0);
                    if !closure.is_obj_kind(ObjKind::Closure) {
                        return Err(self.error("Operand of 'coroutine' must be a function."));
                    }
                    let wrapped = self.heap.allocate(Obj::Coroutine(CoroutineObj::new(
                        closure.as_obj().expect("kind checked above"),
                    )));
                    self.pop();
                    self.push(Value::Obj(wrapped));
                }
                OpCode::Yield => self.op_yield()?,
                OpCode::Await => {
                    return Err(self.error("'await' is reserved."));
                }
            }
        }
    }

    fn trace_instruction(&self) {
        let mut err = io::stderr().lock();
        unsafe {
            let co = coroutine_mut(self.running);
            let _ = write!(err, "stack:  ");
            for value in &co.stack {
                let _ = write!(err, "[ {value} ]");
            }
            let _ = writeln!(err);
            if let Some(frame) = co.frames.last() {
                let chunk = &closure_function(frame.closure).chunk;
                if frame.ip < chunk.code.len() {
                    let _ = disassemble_instruction(chunk, frame.ip, &mut err);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Arithmetic
    // ------------------------------------------------------------------

    fn binary_compare(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
            return Err(self.error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        let result = match op {
            OpCode::Greater => a > b,
            OpCode::Less => a < b,
            _ => unreachable!("comparison dispatch"),
        };
        self.push(Value::Bool(result));
        Ok(())
    }

    fn binary_arithmetic(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1), self.peek(0)) else {
            return Err(self.error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        let result = match op {
            OpCode::Subtract => a - b,
            OpCode::Multiply => a * b,
            OpCode::Divide => a / b,
            _ => unreachable!("arithmetic dispatch"),
        };
        self.push(Value::Number(result));
        Ok(())
    }

    /// Polymorphic ADD. The operands stay on the stack across the
    /// concatenation's interning (which may collect), and both are
    /// re-checked as the kinds they were matched as.
    fn op_add(&mut self) -> Result<(), RuntimeError> {
        let a = self.peek(1);
        let b = self.peek(0);
        let concatenated = unsafe {
            match (value_str(a), value_str(b)) {
                (Some(left), Some(right)) => {
                    let mut text = String::with_capacity(left.len() + right.len());
                    text.push_str(left);
                    text.push_str(right);
                    Some(text)
                }
                _ => None,
            }
        };
        if let Some(text) = concatenated {
            let result = self.heap.intern(&text);
            self.pop();
            self.pop();
            self.push(Value::Obj(result));
            return Ok(());
        }
        if let (Value::Number(a), Value::Number(b)) = (a, b) {
            self.pop();
            self.pop();
            self.push(Value::Number(a + b));
            return Ok(());
        }
        Err(self.error("Operands must be two numbers or two strings."))
    }

    // ------------------------------------------------------------------
    // Calls and returns
    // ------------------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        match callee.obj_kind() {
            Some(ObjKind::Closure) => {
                self.call_closure(callee.as_obj().expect("kind checked"), argc)
            }
            Some(ObjKind::Native) => self.call_native(callee.as_obj().expect("kind checked"), argc),
            Some(ObjKind::Coroutine) => self.resume(callee.as_obj().expect("kind checked"), argc),
            _ => Err(self.error("Can only call functions and coroutines.")),
        }
    }

    fn call_closure(&mut self, closure: RawObj, argc: usize) -> Result<(), RuntimeError> {
        let arity = unsafe { closure_function(closure).arity } as usize;
        if argc != arity {
            return Err(self.error(format!("Expected {arity} arguments but got {argc}.")));
        }
        unsafe {
            let co = coroutine_mut(self.running);
            if co.frames.len() >= FRAMES_MAX {
                return Err(self.error("Stack overflow."));
            }
            let base = co.stack.len() - argc - 1;
            co.frames.push(CallFrame {
                closure,
                ip: 0,
                base,
            });
        }
        Ok(())
    }

    fn call_native(&mut self, native: RawObj, argc: usize) -> Result<(), RuntimeError> {
        let (arity, function) = unsafe {
            let n = (*native).native();
            (n.arity as usize, n.function)
        };
        if argc != arity {
            return Err(self.error(format!("Expected {arity} arguments but got {argc}.")));
        }
        // Copy the arguments out; the originals stay on the stack as GC
        // roots while the native runs.
        let args: Vec<Value> = unsafe {
            let stack = &coroutine_mut(self.running).stack;
            stack[stack.len() - argc..].to_vec()
        };
        let result = {
            let mut ctx = NativeCtx {
                heap: &mut self.heap,
                out: &mut *self.out,
                started: self.started,
            };
            function(&mut ctx, argc as u8, &args)
        };
        match result {
            Ok(value) => {
                unsafe {
                    let co = coroutine_mut(self.running);
                    let len = co.stack.len();
                    co.stack.truncate(len - argc - 1);
                }
                self.push(value);
                Ok(())
            }
            Err(message) => Err(self.error(message)),
        }
    }

    fn op_return(&mut self) -> Result<Flow, RuntimeError> {
        let result = self.pop();
        let frame = unsafe {
            coroutine_mut(self.running)
                .frames
                .pop()
                .expect("no frame to return from")
        };
        self.close_upvalues(self.running, frame.base);
        unsafe {
            let co = coroutine_mut(self.running);
            if co.frames.is_empty() {
                co.state = CoroutineState::Complete;
                co.stack.clear();
                let parent = co.parent;
                if parent.is_null() {
                    return Ok(Flow::Done);
                }
                self.switch_to(parent);
                self.push(result);
            } else {
                co.stack.truncate(frame.base);
                self.push(result);
            }
        }
        Ok(Flow::Continue)
    }

    // ------------------------------------------------------------------
    // Closures and upvalues
    // ------------------------------------------------------------------

    fn op_closure(&mut self, long: bool) -> Result<(), RuntimeError> {
        let function = self
            .read_constant(long)
            .as_obj()
            .expect("closure constant is a function");
        let upvalue_count = unsafe { (*function).function().upvalue_count } as usize;
        // The closure goes straight onto the stack so the upvalue
        // allocations below can collect safely.
        let closure = self.heap.allocate(Obj::Closure(ClosureObj {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }));
        self.push(Value::Obj(closure));
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            let upvalue = if is_local {
                let base = self.current_frame().base;
                self.capture_upvalue(self.running, base + index)
            } else {
                let frame = self.current_frame();
                unsafe { (*frame.closure).closure().upvalues[index] }
            };
            unsafe { (*closure).closure_mut().upvalues.push(upvalue) };
        }
        Ok(())
    }

    /// Find or create the open upvalue for `slot` on `co`, keeping the
    /// open list sorted by strictly descending slot with at most one
    /// upvalue per slot.
    fn capture_upvalue(&mut self, co: RawObj, slot: usize) -> RawObj {
        unsafe {
            let mut prev: RawObj = std::ptr::null_mut();
            let mut cursor = coroutine_mut(co).open_upvalues;
            while !cursor.is_null() {
                let current_slot = (*cursor)
                    .upvalue()
                    .open_slot()
                    .expect("open list holds only open upvalues");
                if current_slot <= slot {
                    break;
                }
                prev = cursor;
                cursor = (*cursor).upvalue().next;
            }
            if !cursor.is_null() {
                if let Some(existing) = (*cursor).upvalue().open_slot() {
                    if existing == slot {
                        return cursor;
                    }
                }
            }
            // The list is reachable from the coroutine, so this allocation
            // may collect without losing `prev`/`cursor`.
            let created = self.heap.allocate(Obj::Upvalue(UpvalueObj {
                state: UpvalueState::Open { owner: co, slot },
                next: cursor,
            }));
            if prev.is_null() {
                coroutine_mut(co).open_upvalues = created;
            } else {
                (*prev).upvalue_mut().next = created;
            }
            created
        }
    }

    /// Close every open upvalue of `co` at or above `threshold`: copy the
    /// stack slot inline and unlink from the list.
    fn close_upvalues(&mut self, co: RawObj, threshold: usize) {
        unsafe {
            let mut head = coroutine_mut(co).open_upvalues;
            while !head.is_null() {
                let slot = (*head)
                    .upvalue()
                    .open_slot()
                    .expect("open list holds only open upvalues");
                if slot < threshold {
                    break;
                }
                let value = coroutine_mut(co).stack[slot];
                let next = (*head).upvalue_mut().next;
                (*head).upvalue_mut().state = UpvalueState::Closed(value);
                (*head).upvalue_mut().next = std::ptr::null_mut();
                head = next;
            }
            coroutine_mut(co).open_upvalues = head;
        }
    }

    unsafe fn read_upvalue(&self, upvalue: RawObj) -> Value {
        match unsafe { &(*upvalue).upvalue().state } {
            UpvalueState::Open { owner, slot } => unsafe { coroutine_mut(*owner).stack[*slot] },
            UpvalueState::Closed(value) => *value,
        }
    }

    unsafe fn write_upvalue(&self, upvalue: RawObj, value: Value) {
        unsafe {
            match (*upvalue).upvalue().state {
                UpvalueState::Open { owner, slot } => coroutine_mut(owner).stack[slot] = value,
                UpvalueState::Closed(_) => {
                    (*upvalue).upvalue_mut().state = UpvalueState::Closed(value);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Coroutines
    // ------------------------------------------------------------------

    fn switch_to(&mut self, co: RawObj) {
        trace!(from = ?self.running, to = ?co, "coroutine transfer");
        self.running = co;
        self.heap.set_running(Value::Obj(co));
    }

    /// Calling a coroutine resumes it. READY coroutines get the arguments
    /// as their closure's parameters; PAUSED ones receive the first
    /// argument (or nil) as the value of their pending `yield`.
    fn resume(&mut self, target: RawObj, argc: usize) -> Result<(), RuntimeError> {
        let state = unsafe { coroutine_mut(target).state };
        match state {
            CoroutineState::Ready => {
                let closure = unsafe { coroutine_mut(target).closure };
                let arity = unsafe { closure_function(closure).arity } as usize;
                if argc != arity {
                    return Err(self.error(format!("Expected {arity} arguments but got {argc}.")));
                }
                unsafe {
                    let caller = coroutine_mut(self.running);
                    let args_start = caller.stack.len() - argc;
                    let fresh = coroutine_mut(target);
                    fresh.stack.push(Value::Obj(closure));
                    fresh.stack.extend_from_slice(&caller.stack[args_start..]);
                    // Drop the arguments and the coroutine itself from the
                    // caller.
                    caller.stack.truncate(args_start - 1);
                    fresh.frames.push(CallFrame {
                        closure,
                        ip: 0,
                        base: 0,
                    });
                    fresh.parent = self.running;
                    fresh.state = CoroutineState::Running;
                }
                self.switch_to(target);
                Ok(())
            }
            CoroutineState::Paused => {
                unsafe {
                    let caller = coroutine_mut(self.running);
                    let args_start = caller.stack.len() - argc;
                    let resumed_with = if argc > 0 {
                        caller.stack[args_start]
                    } else {
                        Value::Nil
                    };
                    caller.stack.truncate(args_start - 1);
                    let paused = coroutine_mut(target);
                    // Delivered as the result of the pending `yield`.
                    paused.stack.push(resumed_with);
                    paused.parent = self.running;
                    paused.state = CoroutineState::Running;
                }
                self.switch_to(target);
                Ok(())
            }
            CoroutineState::Running | CoroutineState::Complete | CoroutineState::Error => {
                Err(self.error(format!(
                    "Cannot resume a {} coroutine.",
                    state.describe()
                )))
            }
        }
    }

    fn op_yield(&mut self) -> Result<(), RuntimeError> {
        let parent = unsafe { coroutine_mut(self.running).parent };
        if parent.is_null() {
            return Err(self.error("Cannot yield from the main coroutine."));
        }
        let value = self.pop();
        unsafe { coroutine_mut(self.running).state = CoroutineState::Paused };
        self.switch_to(parent);
        self.push(value);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Containers
    // ------------------------------------------------------------------

    fn op_list(&mut self, count: usize) {
        let items = unsafe {
            let stack = &coroutine_mut(self.running).stack;
            stack[stack.len() - count..].to_vec()
        };
        // The elements are still on the stack while this allocates.
        let list = self.heap.allocate(Obj::List(ListObj { items }));
        unsafe {
            let co = coroutine_mut(self.running);
            let len = co.stack.len();
            co.stack.truncate(len - count);
        }
        self.push(Value::Obj(list));
    }

    fn op_dict(&mut self, count: usize) -> Result<(), RuntimeError> {
        let mut entries = Table::new();
        unsafe {
            let stack = &coroutine_mut(self.running).stack;
            let start = stack.len() - count * 2;
            for pair in 0..count {
                let key = stack[start + pair * 2];
                let value = stack[start + pair * 2 + 1];
                let Some(key) = key.as_obj().filter(|&k| (*k).kind() == ObjKind::Str) else {
                    return Err(self.error("Dict key must be a string."));
                };
                entries.set(key, value);
            }
        }
        // Keys and values are still on the stack while this allocates.
        let dict = self.heap.allocate(Obj::Dict(DictObj { entries }));
        unsafe {
            let co = coroutine_mut(self.running);
            let len = co.stack.len();
            co.stack.truncate(len - count * 2);
        }
        self.push(Value::Obj(dict));
        Ok(())
    }

    /// Validated list index, or an error message.
    fn list_index(&self, key: Value, len: usize) -> Result<usize, String> {
        let Value::Number(n) = key else {
            return Err("List index must be a number.".to_string());
        };
        if n.fract() != 0.0 {
            return Err("List index must be an integer.".to_string());
        }
        if n < 0.0 || n >= len as f64 {
            return Err("List index out of range.".to_string());
        }
        Ok(n as usize)
    }

    fn op_get_field(&mut self) -> Result<(), RuntimeError> {
        let key = self.peek(0);
        let container = self.peek(1);
        let value = match container.obj_kind() {
            Some(ObjKind::List) => {
                let list = unsafe { &(*container.as_obj().expect("kind checked")).list().items };
                match self.list_index(key, list.len()) {
                    Ok(index) => list[index],
                    Err(message) => return Err(self.error(message)),
                }
            }
            Some(ObjKind::Dict) => {
                let Some(key) = key.as_obj().filter(|&k| unsafe { (*k).kind() } == ObjKind::Str)
                else {
                    return Err(self.error("Dict key must be a string."));
                };
                // A missing key reads as nil, like an undefined global.
                unsafe {
                    (*container.as_obj().expect("kind checked"))
                        .dict()
                        .entries
                        .get(key)
                        .unwrap_or(Value::Nil)
                }
            }
            _ => return Err(self.error("Only lists and dicts support indexing.")),
        };
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn op_set_field(&mut self) -> Result<(), RuntimeError> {
        let value = self.peek(0);
        let key = self.peek(1);
        let container = self.peek(2);
        match container.obj_kind() {
            Some(ObjKind::List) => {
                let list =
                    unsafe { &mut (*container.as_obj().expect("kind checked")).list_mut().items };
                match self.list_index(key, list.len()) {
                    Ok(index) => list[index] = value,
                    Err(message) => return Err(self.error(message)),
                }
            }
            Some(ObjKind::Dict) => {
                let Some(key) = key.as_obj().filter(|&k| unsafe { (*k).kind() } == ObjKind::Str)
                else {
                    return Err(self.error("Dict key must be a string."));
                };
                unsafe {
                    (*container.as_obj().expect("kind checked"))
                        .dict_mut()
                        .entries
                        .set(key, value)
                };
            }
            _ => return Err(self.error("Only lists and dicts support indexing.")),
        }
        // An assignment expression evaluates to the assigned value.
        self.pop();
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }
}
