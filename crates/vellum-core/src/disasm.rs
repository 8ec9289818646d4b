//! A textual dump of a [`Chunk`] (§4.J), used by the `--dump` CLI flag and
//! the VM's trace-execution mode.

use std::fmt::Write as _;

use crate::chunk::Chunk;
use crate::heap::Heap;
use crate::opcode::OpCode;

/// Disassembles every instruction in `chunk` into human-readable lines.
#[must_use]
pub fn disassemble_chunk(chunk: &Chunk, heap: &Heap, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    let mut prev_line: Option<u32> = None;
    while offset < chunk.code.len() {
        let (line, next) = disassemble_instruction(chunk, heap, offset, prev_line, &mut out);
        prev_line = Some(line);
        offset = next;
    }
    out
}

/// Disassembles one instruction at `offset`, returning `(line, next_offset)`.
pub fn disassemble_instruction(
    chunk: &Chunk,
    heap: &Heap,
    offset: usize,
    prev_line: Option<u32>,
    out: &mut String,
) -> (u32, usize) {
    let line = chunk.get_line(offset);
    let _ = write!(out, "{offset:04} ");
    if prev_line == Some(line) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{line:4} ");
    }

    let byte = chunk.code[offset];
    let Some(op) = OpCode::from_u8(byte) else {
        let _ = writeln!(out, "UNKNOWN {byte:02x}");
        return (line, offset + 1);
    };

    let next = match op {
        OpCode::Constant | OpCode::GetGlobal | OpCode::SetGlobal | OpCode::DefineGlobal
        | OpCode::GetProperty | OpCode::SetProperty | OpCode::GetSuper | OpCode::Class | OpCode::Method => {
            const_instruction(chunk, heap, op, offset, out)
        }
        OpCode::ConstantLong | OpCode::GetGlobalLong | OpCode::SetGlobalLong | OpCode::DefineGlobalLong => {
            const_long_instruction(chunk, heap, op, offset, out)
        }
        OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue | OpCode::Call => {
            byte_instruction(chunk, op, offset, out)
        }
        OpCode::GetLocalLong | OpCode::SetLocalLong => u24_instruction(chunk, op, offset, out),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(chunk, op, offset, 1, out),
        OpCode::Loop => jump_instruction(chunk, op, offset, -1, out),
        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(chunk, heap, op, offset, out),
        OpCode::Closure => closure_instruction(chunk, heap, offset, out),
        _ => {
            let _ = writeln!(out, "{}", op.mnemonic());
            offset + 1
        }
    };
    (line, next)
}

fn const_instruction(chunk: &Chunk, heap: &Heap, op: OpCode, offset: usize, out: &mut String) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let value = chunk.constants.get(idx).map(|v| format_const(v, heap));
    let _ = writeln!(out, "{:-16} {idx:4} '{}'", op.mnemonic(), value.unwrap_or_default());
    offset + 2
}

fn const_long_instruction(chunk: &Chunk, heap: &Heap, op: OpCode, offset: usize, out: &mut String) -> usize {
    let idx = u32::from_be_bytes([0, chunk.code[offset + 1], chunk.code[offset + 2], chunk.code[offset + 3]]);
    let value = chunk.constants.get(idx as usize).map(|v| format_const(v, heap));
    let _ = writeln!(out, "{:-16} {idx:4} '{}'", op.mnemonic(), value.unwrap_or_default());
    offset + 4
}

fn format_const(v: &crate::value::Value, heap: &Heap) -> String {
    match v {
        crate::value::Value::Obj(r) => match heap.get(*r) {
            crate::heap::Obj::String { bytes, .. } => bytes.to_string(),
            _ => v.to_string(),
        },
        other => other.to_string(),
    }
}

fn byte_instruction(chunk: &Chunk, op: OpCode, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code[offset + 1];
    let _ = writeln!(out, "{:-16} {slot:4}", op.mnemonic());
    offset + 2
}

fn u24_instruction(chunk: &Chunk, op: OpCode, offset: usize, out: &mut String) -> usize {
    let slot = u32::from_be_bytes([0, chunk.code[offset + 1], chunk.code[offset + 2], chunk.code[offset + 3]]);
    let _ = writeln!(out, "{:-16} {slot:4}", op.mnemonic());
    offset + 4
}

fn jump_instruction(chunk: &Chunk, op: OpCode, offset: usize, sign: i32, out: &mut String) -> usize {
    let ofs = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
    let target = offset as i32 + 3 + sign * i32::from(ofs);
    let _ = writeln!(out, "{:-16} {offset:4} -> {target}", op.mnemonic());
    offset + 3
}

fn invoke_instruction(chunk: &Chunk, heap: &Heap, op: OpCode, offset: usize, out: &mut String) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let argc = chunk.code[offset + 2];
    let name = chunk.constants.get(idx).map(|v| format_const(v, heap)).unwrap_or_default();
    let _ = writeln!(out, "{:-16} ({argc} args) {idx:4} '{name}'", op.mnemonic());
    offset + 3
}

fn closure_instruction(chunk: &Chunk, heap: &Heap, offset: usize, out: &mut String) -> usize {
    let idx = chunk.code[offset + 1] as usize;
    let name = chunk.constants.get(idx).map(|v| format_const(v, heap)).unwrap_or_default();
    let _ = writeln!(out, "{:-16} {idx:4} '{name}'", OpCode::Closure.mnemonic());
    let mut next = offset + 2;
    if let Some(crate::value::Value::Obj(fref)) = chunk.constants.get(idx) {
        if let crate::heap::Obj::Function { upvalue_count, .. } = heap.get(*fref) {
            for _ in 0..*upvalue_count {
                let is_local = chunk.code[next];
                let index = chunk.code[next + 1];
                let _ = writeln!(
                    out,
                    "{next:04}      |                     {} {index}",
                    if is_local != 0 { "local" } else { "upvalue" }
                );
                next += 2;
            }
        }
    }
    next
}
