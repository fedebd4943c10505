//! Structural checks on compiled chunks: debug tables stay parallel to the
//! code, every operand read lands inside the chunk, and jumps stay in range.

use std::rc::Rc;

use skiff::chunk::Chunk;
use skiff::compiler;
use skiff::dis;
use skiff::object::{Heap, Obj};
use skiff::opcode::OpCode;
use skiff::value::Value;
use skiff::Source;

fn compile(src: &str) -> (Heap, Rc<Chunk>) {
    let source = Rc::new(Source::new("test", src));
    let mut heap = Heap::new();
    let script = compiler::compile(&source, &mut heap).expect("compile");
    let chunk = match &heap[script] {
        Obj::Fun(f) => Rc::clone(&f.chunk),
        _ => panic!("script is not a function"),
    };
    (heap, chunk)
}

fn check_chunk(heap: &Heap, chunk: &Chunk) {
    assert_eq!(chunk.code.len(), chunk.lines.len());

    let mut offset = 0;
    while offset < chunk.code.len() {
        let op = OpCode::from_u8(chunk.code[offset]).expect("valid opcode");
        match op {
            OpCode::Constant => {
                let idx = chunk.code[offset + 1] as usize;
                assert!(idx < chunk.constants.len());
            }
            OpCode::ConstantLong => {
                let idx = chunk.read_u16(offset + 1) as usize;
                assert!(idx < chunk.constants.len());
            }
            OpCode::Jump | OpCode::JumpIfFalse => {
                let target = offset + 3 + chunk.read_u16(offset + 1) as usize;
                assert!(target <= chunk.code.len(), "forward jump past the end");
            }
            OpCode::Loop => {
                let back = chunk.read_u16(offset + 1) as usize;
                assert!(back <= offset + 3, "backward jump before the start");
            }
            _ => {}
        }

        let (_, next) = dis::instruction(heap, chunk, offset);
        assert!(next > offset);
        assert!(next <= chunk.code.len(), "operand read past the end");
        offset = next;
    }
    assert_eq!(offset, chunk.code.len(), "instruction stream ends cleanly");
}

fn check_recursively(heap: &Heap, chunk: &Chunk) {
    check_chunk(heap, chunk);
    for constant in &chunk.constants {
        if let Value::Obj(r) = constant {
            if let Obj::Fun(f) = &heap[*r] {
                check_recursively(heap, &f.chunk);
            }
        }
    }
}

#[test]
fn a_representative_program_produces_well_formed_chunks() {
    let (heap, chunk) = compile(
        r#"
        var total = 0;
        fun weigh(m) {
            if (m.heavy) return m[0] * 2;
            return m[0];
        }
        for (var i = 0; i < 5; i = i + 1) {
            var m = [i, i + 1];
            m.heavy = i > 2;
            total = total + weigh(m);
        }
        while (total > 100) total = total - 100;
        print "total:", total;
        "#,
    );
    check_recursively(&heap, &chunk);
}

#[test]
fn scripts_end_with_an_implicit_return() {
    let (_, chunk) = compile("print 1;");
    let len = chunk.code.len();
    assert_eq!(chunk.code[len - 1], OpCode::Return as u8);
    assert_eq!(chunk.code[len - 2], OpCode::Nil as u8);
}

#[test]
fn long_constants_appear_past_256_pool_entries() {
    let mut src = String::new();
    for i in 0..300 {
        src.push_str(&format!("print {}.5;\n", i));
    }
    let (heap, chunk) = compile(&src);
    assert!(chunk.constants.len() >= 300);
    assert!(chunk.code.contains(&(OpCode::ConstantLong as u8)));
    check_chunk(&heap, &chunk);
}

#[test]
fn identifier_constants_dedup_in_the_pool() {
    let (_, chunk) = compile("var a = 1; a = 2; print a; print a;");
    let strings = chunk
        .constants
        .iter()
        .filter(|c| matches!(c, Value::Obj(_)))
        .count();
    assert_eq!(strings, 1, "one pool entry for the repeated name");
}

#[test]
fn jump_operands_are_big_endian() {
    // The `if` body is long enough to push the offset past one byte.
    let mut src = String::from("if (true) { ");
    for i in 0..200 {
        src.push_str(&format!("print {};", i));
    }
    src.push('}');
    let (_, chunk) = compile(&src);

    let mut offset = 0;
    let mut seen = false;
    while offset < chunk.code.len() {
        let op = OpCode::from_u8(chunk.code[offset]).unwrap();
        if op == OpCode::JumpIfFalse {
            let operand = chunk.read_u16(offset + 1);
            assert_eq!(
                operand as usize,
                (chunk.code[offset + 1] as usize) << 8 | chunk.code[offset + 2] as usize
            );
            assert!(operand > u8::MAX as u16, "offset needs both bytes");
            seen = true;
        }
        offset = match op {
            OpCode::Constant
            | OpCode::DefineGlobal
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::GetField
            | OpCode::SetField
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::Call
            | OpCode::Print
            | OpCode::BuildMap => offset + 2,
            OpCode::ConstantLong
            | OpCode::DefineGlobalLong
            | OpCode::GetGlobalLong
            | OpCode::SetGlobalLong
            | OpCode::Jump
            | OpCode::JumpIfFalse
            | OpCode::Loop => offset + 3,
            _ => offset + 1,
        };
    }
    assert!(seen, "program compiles a JumpIfFalse");
}
