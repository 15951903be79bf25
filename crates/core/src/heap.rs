//! The garbage-collected object heap.
//!
//! Tricolor, single-threaded, non-moving mark-and-sweep with a gray
//! worklist. Mark bits are compared against a flipping current-mark value,
//! so survivors need no unmark pass: after a sweep the mark sense inverts
//! and everything is white again.
//!
//! Objects live in a singly-linked allocation list threaded through their
//! headers. The intern table holds its strings weakly; between tracing and
//! sweeping, entries whose key did not get marked are dropped.
//!
//! ## Roots
//!
//! The heap itself drives collection from allocation pressure, so every
//! root must be registered here:
//!
//! - the globals table object,
//! - the running coroutine (its parent chain reaches the main coroutine),
//! - the protect stack, a small explicit stack for values that exist but
//!   are not yet reachable from anywhere else (in-progress compiler
//!   functions, REPL-retained values, allocation intermediates).
//!
//! Routines that allocate several objects before binding the result to a
//! root must keep the intermediates on the protect stack or on a rooted
//! coroutine stack across each allocation.

use tracing::debug;

use crate::object::{GcBox, Obj, RawObj, StrObj, UpvalueState};
use crate::table::Table;
use crate::value::Value;

/// First collection threshold; doubles after any cycle that frees memory.
const FIRST_GC: usize = 1024 * 1024;

pub struct Heap {
    /// Head of the allocation list.
    objects: RawObj,
    /// Interned strings, held weakly.
    strings: Table,
    gray: Vec<RawObj>,
    bytes_allocated: usize,
    next_gc: usize,
    /// The flipping mark sense: `marked == current_mark` means reachable
    /// this cycle.
    current_mark: bool,
    /// Collect on every allocation (test mode).
    pub stress: bool,
    globals: Value,
    running: Value,
    protect: Vec<Value>,
}

impl Heap {
    pub fn new(stress: bool) -> Heap {
        Heap {
            objects: std::ptr::null_mut(),
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC,
            current_mark: true,
            stress,
            globals: Value::Nil,
            running: Value::Nil,
            protect: Vec::new(),
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Register the globals table object as a permanent root.
    pub fn set_globals(&mut self, globals: RawObj) {
        self.globals = Value::Obj(globals);
    }

    /// Update the running-coroutine root. Paused siblings stay alive
    /// through whatever value still references them.
    pub fn set_running(&mut self, running: Value) {
        self.running = running;
    }

    /// Push a value onto the protect stack so a collection triggered by a
    /// later allocation cannot reclaim it.
    pub fn protect(&mut self, value: Value) {
        self.protect.push(value);
    }

    pub fn unprotect(&mut self) {
        self.protect.pop();
    }

    pub fn allocate(&mut self, obj: Obj) -> RawObj {
        if self.stress || self.bytes_allocated > self.next_gc {
            self.collect();
        }
        let size = std::mem::size_of::<GcBox>() + obj.heap_size();
        self.bytes_allocated += size;
        let boxed = Box::into_raw(Box::new(GcBox {
            next: self.objects,
            marked: !self.current_mark,
            size,
            obj,
        }));
        self.objects = boxed;
        boxed
    }

    /// Canonical string object for `text`. Equal byte sequences always
    /// return the same pointer.
    pub fn intern(&mut self, text: &str) -> RawObj {
        let hash = crate::object::hash_bytes(text.as_bytes());
        if let Some(existing) = self.strings.find_string(text, hash) {
            return existing;
        }
        // The allocation below may collect, but the new string does not
        // exist yet and `text` is host memory, so nothing can be lost.
        let obj = self.allocate(Obj::Str(StrObj::owned(text)));
        self.strings.set(obj, Value::Nil);
        obj
    }

    /// Intern a string whose bytes live in host static data.
    pub fn intern_static(&mut self, text: &'static str) -> RawObj {
        let hash = crate::object::hash_bytes(text.as_bytes());
        if let Some(existing) = self.strings.find_string(text, hash) {
            return existing;
        }
        let obj = self.allocate(Obj::Str(StrObj::borrowed(text)));
        self.strings.set(obj, Value::Nil);
        obj
    }

    /// Run a full collection cycle.
    pub fn collect(&mut self) {
        let before = self.bytes_allocated;
        self.mark_roots();
        self.trace_references();
        self.strings.remove_unmarked(self.current_mark);
        self.sweep();
        let freed = before - self.bytes_allocated;
        if freed > 0 {
            self.next_gc = self.bytes_allocated * 2;
        }
        self.current_mark = !self.current_mark;
        debug!(
            freed,
            live = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc cycle"
        );
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(ptr) = value {
            self.mark_object(ptr);
        }
    }

    pub fn mark_object(&mut self, ptr: RawObj) {
        if ptr.is_null() {
            return;
        }
        unsafe {
            if (*ptr).marked == self.current_mark {
                return;
            }
            (*ptr).marked = self.current_mark;
        }
        self.gray.push(ptr);
    }

    fn mark_roots(&mut self) {
        self.mark_value(self.globals);
        self.mark_value(self.running);
        for i in 0..self.protect.len() {
            self.mark_value(self.protect[i]);
        }
    }

    fn trace_references(&mut self) {
        while let Some(ptr) = self.gray.pop() {
            self.blacken(ptr);
        }
    }

    /// Mark everything `ptr` references. An object reaching itself is fine:
    /// it already carries the current mark, so `mark_object` returns before
    /// touching it again.
    fn blacken(&mut self, ptr: RawObj) {
        let obj = unsafe { &(*ptr).obj };
        match obj {
            Obj::Str(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                self.mark_object(f.name);
                for i in 0..f.chunk.constants.len() {
                    self.mark_value(f.chunk.constants[i]);
                }
            }
            Obj::Closure(c) => {
                self.mark_object(c.function);
                for &upvalue in &c.upvalues {
                    self.mark_object(upvalue);
                }
            }
            Obj::Upvalue(u) => match u.state {
                UpvalueState::Open { owner, .. } => self.mark_object(owner),
                UpvalueState::Closed(value) => self.mark_value(value),
            },
            Obj::List(l) => {
                for &item in &l.items {
                    self.mark_value(item);
                }
            }
            Obj::Dict(d) => {
                for (key, value) in d.entries.iter() {
                    self.mark_object(key);
                    self.mark_value(value);
                }
            }
            Obj::Coroutine(co) => {
                self.mark_object(co.closure);
                self.mark_object(co.parent);
                for &slot in &co.stack {
                    self.mark_value(slot);
                }
                for frame in &co.frames {
                    self.mark_object(frame.closure);
                }
                let mut upvalue = co.open_upvalues;
                while !upvalue.is_null() {
                    self.mark_object(upvalue);
                    upvalue = unsafe { (*upvalue).upvalue().next };
                }
            }
        }
    }

    fn sweep(&mut self) {
        let mut prev: RawObj = std::ptr::null_mut();
        let mut cursor = self.objects;
        while !cursor.is_null() {
            unsafe {
                if (*cursor).marked == self.current_mark {
                    prev = cursor;
                    cursor = (*cursor).next;
                } else {
                    let dead = cursor;
                    cursor = (*cursor).next;
                    if prev.is_null() {
                        self.objects = cursor;
                    } else {
                        (*prev).next = cursor;
                    }
                    self.bytes_allocated -= (*dead).size;
                    drop(Box::from_raw(dead));
                }
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut cursor = self.objects;
        while !cursor.is_null() {
            unsafe {
                let next = (*cursor).next;
                drop(Box::from_raw(cursor));
                cursor = next;
            }
        }
        self.objects = std::ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ListObj, ObjKind};

    fn count_objects(heap: &Heap) -> usize {
        let mut n = 0;
        let mut cursor = heap.objects;
        while !cursor.is_null() {
            n += 1;
            cursor = unsafe { (*cursor).next };
        }
        n
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let mut heap = Heap::new(false);
        heap.allocate(Obj::List(ListObj { items: Vec::new() }));
        heap.allocate(Obj::List(ListObj { items: Vec::new() }));
        assert_eq!(count_objects(&heap), 2);
        heap.collect();
        assert_eq!(count_objects(&heap), 0);
        assert_eq!(heap.bytes_allocated(), 0);
    }

    #[test]
    fn test_protect_stack_keeps_values_alive() {
        let mut heap = Heap::new(false);
        let kept = heap.allocate(Obj::List(ListObj { items: Vec::new() }));
        heap.protect(Value::Obj(kept));
        heap.allocate(Obj::List(ListObj { items: Vec::new() }));
        heap.collect();
        assert_eq!(count_objects(&heap), 1);
        assert_eq!(unsafe { (*kept).kind() }, ObjKind::List);
        heap.unprotect();
        heap.collect();
        assert_eq!(count_objects(&heap), 0);
    }

    #[test]
    fn test_reachability_is_transitive() {
        let mut heap = Heap::new(false);
        let inner = heap.allocate(Obj::List(ListObj { items: Vec::new() }));
        let outer = heap.allocate(Obj::List(ListObj {
            items: vec![Value::Obj(inner)],
        }));
        heap.protect(Value::Obj(outer));
        heap.collect();
        assert_eq!(count_objects(&heap), 2);
    }

    #[test]
    fn test_unreferenced_strings_leave_the_intern_table() {
        let mut heap = Heap::new(false);
        let kept = heap.intern("kept");
        heap.intern("dropped");
        heap.protect(Value::Obj(kept));
        heap.collect();
        assert_eq!(count_objects(&heap), 1);
        // Re-interning the surviving text still dedups.
        assert_eq!(heap.intern("kept"), kept);
        assert_eq!(count_objects(&heap), 1);
    }

    #[test]
    fn test_survivors_live_through_consecutive_cycles() {
        // The flipping mark sense must keep survivors valid across many
        // collections without an unmark pass.
        let mut heap = Heap::new(false);
        let s = heap.intern("stable");
        heap.protect(Value::Obj(s));
        for _ in 0..4 {
            heap.collect();
            assert_eq!(unsafe { (*s).string().as_str() }, "stable");
        }
    }

    #[test]
    fn test_self_referential_list_does_not_loop_the_marker() {
        let mut heap = Heap::new(false);
        let list = heap.allocate(Obj::List(ListObj { items: Vec::new() }));
        unsafe {
            (*list).list_mut().items.push(Value::Obj(list));
        }
        heap.protect(Value::Obj(list));
        heap.collect();
        assert_eq!(count_objects(&heap), 1);
    }

    #[test]
    fn test_stress_mode_collects_on_every_allocation() {
        let mut heap = Heap::new(true);
        heap.allocate(Obj::List(ListObj { items: Vec::new() }));
        // The second allocation collects and reclaims the first, which is
        // unrooted.
        heap.allocate(Obj::List(ListObj { items: Vec::new() }));
        assert_eq!(count_objects(&heap), 1);
    }
}
