use crate::chunk::Chunk;
use crate::object::Heap;
use crate::opcode::OpCode;

pub fn disassemble(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = instruction(heap, chunk, offset);
        out.push_str(&text);
        out.push('\n');
        offset = next;
    }
    out
}

/// Renders one instruction and returns the offset of the next one.
pub fn instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut out = format!("{:04} ", offset);
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        out.push_str("    | ");
    } else {
        out.push_str(&format!("{:3}:{:<2}", chunk.line_at(offset), chunk.column_at(offset)));
    }
    out.push(' ');

    let byte = chunk.code[offset];
    let Some(op) = OpCode::from_u8(byte) else {
        out.push_str(&format!("bad opcode {}", byte));
        return (out, offset + 1);
    };

    use OpCode::*;
    match op {
        Constant | DefineGlobal | GetGlobal | SetGlobal | GetField | SetField => {
            let idx = chunk.code[offset + 1] as usize;
            out.push_str(&format!("{:<16?} {:4} '{}'", op, idx, constant(heap, chunk, idx)));
            (out, offset + 2)
        }
        ConstantLong | DefineGlobalLong | GetGlobalLong | SetGlobalLong => {
            let idx = chunk.read_u16(offset + 1) as usize;
            out.push_str(&format!("{:<16?} {:4} '{}'", op, idx, constant(heap, chunk, idx)));
            (out, offset + 3)
        }
        GetLocal | SetLocal | Call | Print | BuildMap => {
            let operand = chunk.code[offset + 1];
            out.push_str(&format!("{:<16?} {:4}", op, operand));
            (out, offset + 2)
        }
        Jump | JumpIfFalse => {
            let jump = chunk.read_u16(offset + 1) as usize;
            out.push_str(&format!("{:<16?} {:4} -> {}", op, offset, offset + 3 + jump));
            (out, offset + 3)
        }
        Loop => {
            let jump = chunk.read_u16(offset + 1) as usize;
            out.push_str(&format!("{:<16?} {:4} -> {}", op, offset, offset + 3 - jump));
            (out, offset + 3)
        }
        _ => {
            out.push_str(&format!("{:?}", op));
            (out, offset + 1)
        }
    }
}

fn constant(heap: &Heap, chunk: &Chunk, idx: usize) -> String {
    match chunk.constants.get(idx) {
        Some(v) => heap.value_to_string(*v),
        None => "INVALID".to_string(),
    }
}
