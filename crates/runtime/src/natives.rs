//! Host-provided native functions.
//!
//! Natives run synchronously on the invoking coroutine's stack and may not
//! suspend. Each declares an arity the interpreter checks before the call;
//! a returned `Err` becomes a runtime error at the call site.

use std::io::Write;

use skiff_core::object::{CoroutineState, NativeCtx, ObjKind};
use skiff_core::value::Value;

use crate::vm::Vm;

pub(crate) fn install(vm: &mut Vm) {
    vm.define_native("clock", 0, clock_native);
    vm.define_native("print", 1, print_native);
    vm.define_native("type", 1, type_native);
    vm.define_native("is", 2, is_native);
    vm.define_native("reset", 1, reset_native);
    vm.define_native("len", 1, len_native);
}

/// Seconds since the interpreter started.
fn clock_native(ctx: &mut NativeCtx<'_>, _argc: u8, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(ctx.started.elapsed().as_secs_f64()))
}

fn print_native(ctx: &mut NativeCtx<'_>, _argc: u8, args: &[Value]) -> Result<Value, String> {
    writeln!(ctx.out, "{}", args[0]).map_err(|e| format!("Could not write output: {e}."))?;
    Ok(Value::Nil)
}

fn type_native(ctx: &mut NativeCtx<'_>, _argc: u8, args: &[Value]) -> Result<Value, String> {
    let name = ctx.heap.intern_static(args[0].type_name());
    Ok(Value::Obj(name))
}

fn is_native(_ctx: &mut NativeCtx<'_>, _argc: u8, args: &[Value]) -> Result<Value, String> {
    let Some(expected) = args[1]
        .as_obj()
        .filter(|&ptr| unsafe { (*ptr).kind() } == ObjKind::Str)
    else {
        return Err("is() expects a type name string.".to_string());
    };
    let expected = unsafe { (*expected).string().as_str() };
    Ok(Value::Bool(args[0].type_name() == expected))
}

/// Put a coroutine back in the READY state with empty stacks.
fn reset_native(_ctx: &mut NativeCtx<'_>, _argc: u8, args: &[Value]) -> Result<Value, String> {
    let Some(co) = args[0]
        .as_obj()
        .filter(|&ptr| unsafe { (*ptr).kind() } == ObjKind::Coroutine)
    else {
        return Err("reset() expects a coroutine.".to_string());
    };
    unsafe {
        let co = (*co).coroutine_mut();
        if co.state == CoroutineState::Running {
            return Err("Cannot reset a running coroutine.".to_string());
        }
        co.reset();
    }
    Ok(Value::Nil)
}

fn len_native(_ctx: &mut NativeCtx<'_>, _argc: u8, args: &[Value]) -> Result<Value, String> {
    let length = match args[0].obj_kind() {
        Some(ObjKind::Str) => unsafe {
            (*args[0].as_obj().expect("kind checked")).string().len()
        },
        Some(ObjKind::List) => unsafe {
            (*args[0].as_obj().expect("kind checked")).list().items.len()
        },
        Some(ObjKind::Dict) => unsafe {
            (*args[0].as_obj().expect("kind checked")).dict().entries.len()
        },
        _ => return Err("len() expects a string, list, or dict.".to_string()),
    };
    Ok(Value::Number(length as f64))
}
