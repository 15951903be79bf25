//! Bytecode disassembler.
//!
//! Used by `--print-code`, `--trace`, and tests. The output format: a
//! 4-digit byte offset, the source line (or `|` when unchanged from the
//! previous instruction), the opcode name, and decoded operands.

use std::io::{self, Write};

use skiff_core::chunk::{Chunk, OpCode};

pub fn disassemble_chunk(chunk: &Chunk, name: &str, out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "== {name} ==")?;
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(chunk, offset, out)?;
    }
    Ok(())
}

pub fn disassemble_instruction(
    chunk: &Chunk,
    offset: usize,
    out: &mut dyn Write,
) -> io::Result<usize> {
    write!(out, "{offset:04} ")?;
    let line = chunk.lines.line_at(offset);
    if offset > 0 && line == chunk.lines.line_at(offset - 1) {
        write!(out, "   | ")?;
    } else {
        write!(out, "{line:4} ")?;
    }

    let Ok(op) = OpCode::try_from(chunk.code[offset]) else {
        writeln!(out, "Unknown opcode {}", chunk.code[offset])?;
        return Ok(offset + 1);
    };
    match op {
        OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Pop
        | OpCode::GetField
        | OpCode::SetField
        | OpCode::Equal
        | OpCode::Greater
        | OpCode::Less
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::Not
        | OpCode::Negate
        | OpCode::CloseUpvalue
        | OpCode::Coroutine
        | OpCode::Yield
        | OpCode::Await
        | OpCode::Return => simple_instruction(op, offset, out),
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::DefineGlobal => constant_instruction(op, chunk, offset, false, out),
        OpCode::ConstantLong
        | OpCode::GetGlobalLong
        | OpCode::SetGlobalLong
        | OpCode::DefineGlobalLong => constant_instruction(op, chunk, offset, true, out),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call
        | OpCode::List
        | OpCode::Dict => byte_instruction(op, chunk, offset, out),
        OpCode::GetLocalLong | OpCode::SetLocalLong | OpCode::ListLong | OpCode::DictLong => {
            long_instruction(op, chunk, offset, out)
        }
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(op, 1, chunk, offset, out),
        OpCode::Loop => jump_instruction(op, -1, chunk, offset, out),
        OpCode::Closure => closure_instruction(op, chunk, offset, false, out),
        OpCode::ClosureLong => closure_instruction(op, chunk, offset, true, out),
    }
}

fn opcode_name(op: OpCode) -> &'static str {
    match op {
        OpCode::Constant => "OP_CONSTANT",
        OpCode::ConstantLong => "OP_CONSTANT_LONG",
        OpCode::Nil => "OP_NIL",
        OpCode::True => "OP_TRUE",
        OpCode::False => "OP_FALSE",
        OpCode::Pop => "OP_POP",
        OpCode::GetLocal => "OP_GET_LOCAL",
        OpCode::GetLocalLong => "OP_GET_LOCAL_LONG",
        OpCode::SetLocal => "OP_SET_LOCAL",
        OpCode::SetLocalLong => "OP_SET_LOCAL_LONG",
        OpCode::GetGlobal => "OP_GET_GLOBAL",
        OpCode::GetGlobalLong => "OP_GET_GLOBAL_LONG",
        OpCode::SetGlobal => "OP_SET_GLOBAL",
        OpCode::SetGlobalLong => "OP_SET_GLOBAL_LONG",
        OpCode::DefineGlobal => "OP_DEFINE_GLOBAL",
        OpCode::DefineGlobalLong => "OP_DEFINE_GLOBAL_LONG",
        OpCode::GetUpvalue => "OP_GET_UPVALUE",
        OpCode::SetUpvalue => "OP_SET_UPVALUE",
        OpCode::CloseUpvalue => "OP_CLOSE_UPVALUE",
        OpCode::Equal => "OP_EQUAL",
        OpCode::Greater => "OP_GREATER",
        OpCode::Less => "OP_LESS",
        OpCode::Add => "OP_ADD",
        OpCode::Subtract => "OP_SUBTRACT",
        OpCode::Multiply => "OP_MULTIPLY",
        OpCode::Divide => "OP_DIVIDE",
        OpCode::Not => "OP_NOT",
        OpCode::Negate => "OP_NEGATE",
        OpCode::Jump => "OP_JUMP",
        OpCode::JumpIfFalse => "OP_JUMP_IF_FALSE",
        OpCode::Loop => "OP_LOOP",
        OpCode::Call => "OP_CALL",
        OpCode::Closure => "OP_CLOSURE",
        OpCode::ClosureLong => "OP_CLOSURE_LONG",
        OpCode::Return => "OP_RETURN",
        OpCode::List => "OP_LIST",
        OpCode::ListLong => "OP_LIST_LONG",
        OpCode::Dict => "OP_DICT",
        OpCode::DictLong => "OP_DICT_LONG",
        OpCode::GetField => "OP_GET_FIELD",
        OpCode::SetField => "OP_SET_FIELD",
        OpCode::Coroutine => "OP_COROUTINE",
        OpCode::Yield => "OP_YIELD",
        OpCode::Await => "OP_AWAIT",
    }
}

fn read_u24(chunk: &Chunk, offset: usize) -> usize {
    chunk.code[offset] as usize
        | (chunk.code[offset + 1] as usize) << 8
        | (chunk.code[offset + 2] as usize) << 16
}

fn simple_instruction(op: OpCode, offset: usize, out: &mut dyn Write) -> io::Result<usize> {
    writeln!(out, "{}", opcode_name(op))?;
    Ok(offset + 1)
}

fn byte_instruction(
    op: OpCode,
    chunk: &Chunk,
    offset: usize,
    out: &mut dyn Write,
) -> io::Result<usize> {
    let operand = chunk.code[offset + 1];
    writeln!(out, "{:<18} {operand:4}", opcode_name(op))?;
    Ok(offset + 2)
}

fn long_instruction(
    op: OpCode,
    chunk: &Chunk,
    offset: usize,
    out: &mut dyn Write,
) -> io::Result<usize> {
    let operand = read_u24(chunk, offset + 1);
    writeln!(out, "{:<18} {operand:4}", opcode_name(op))?;
    Ok(offset + 4)
}

fn constant_instruction(
    op: OpCode,
    chunk: &Chunk,
    offset: usize,
    long: bool,
    out: &mut dyn Write,
) -> io::Result<usize> {
    let (index, next) = if long {
        (read_u24(chunk, offset + 1), offset + 4)
    } else {
        (chunk.code[offset + 1] as usize, offset + 2)
    };
    writeln!(
        out,
        "{:<18} {index:4} '{}'",
        opcode_name(op),
        chunk.constants[index]
    )?;
    Ok(next)
}

fn jump_instruction(
    op: OpCode,
    sign: i64,
    chunk: &Chunk,
    offset: usize,
    out: &mut dyn Write,
) -> io::Result<usize> {
    let distance = i32::from_be_bytes([
        chunk.code[offset + 1],
        chunk.code[offset + 2],
        chunk.code[offset + 3],
        chunk.code[offset + 4],
    ]);
    let target = offset as i64 + 5 + sign * distance as i64;
    writeln!(out, "{:<18} {offset:4} -> {target}", opcode_name(op))?;
    Ok(offset + 5)
}

fn closure_instruction(
    op: OpCode,
    chunk: &Chunk,
    offset: usize,
    long: bool,
    out: &mut dyn Write,
) -> io::Result<usize> {
    let (index, mut next) = if long {
        (read_u24(chunk, offset + 1), offset + 4)
    } else {
        (chunk.code[offset + 1] as usize, offset + 2)
    };
    let function = chunk.constants[index];
    writeln!(out, "{:<18} {index:4} {function}", opcode_name(op))?;

    let upvalue_count = function
        .as_obj()
        .map(|ptr| unsafe { (*ptr).function().upvalue_count })
        .unwrap_or(0);
    for _ in 0..upvalue_count {
        let is_local = chunk.code[next] != 0;
        let slot = chunk.code[next + 1];
        writeln!(
            out,
            "{next:04}      |                     {} {slot}",
            if is_local { "local" } else { "upvalue" }
        )?;
        next += 2;
    }
    Ok(next)
}
