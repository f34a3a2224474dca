// File: src/debug.rs
//
// Bytecode disassembler. Feeds the execution tracer (LOX_TRACE_EXECUTION)
// and the compiler's chunk dump (LOX_PRINT_CODE).

use crate::bytecode::{Chunk, OpCode};
use crate::heap::Heap;
use crate::value::Value;

/// Render a whole chunk with a header line.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = disassemble_instruction(heap, chunk, offset);
        out.push_str(&text);
        out.push('\n');
        offset = next;
    }
    out
}

/// Render one instruction; returns the text and the next offset.
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut text = format!("{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        text.push_str("   | ");
    } else {
        text.push_str(&format!("{:4} ", chunk.lines[offset]));
    }

    let Some(op) = OpCode::from_byte(chunk.code[offset]) else {
        text.push_str(&format!("Unknown opcode {}", chunk.code[offset]));
        return (text, offset + 1);
    };

    use OpCode::*;
    match op {
        Constant | DefineGlobal | GetGlobal | SetGlobal => {
            let index = chunk.code[offset + 1];
            text.push_str(&format!(
                "{:<16} {:4} '{}'",
                op_name(op),
                index,
                constant_text(heap, chunk, index)
            ));
            (text, offset + 2)
        }
        GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call => {
            let operand = chunk.code[offset + 1];
            text.push_str(&format!("{:<16} {:4}", op_name(op), operand));
            (text, offset + 2)
        }
        Jump | JumpIfFalse | Loop => {
            let jump =
                u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]) as usize;
            let target = if op == Loop { offset + 3 - jump } else { offset + 3 + jump };
            text.push_str(&format!("{:<16} {:4} -> {}", op_name(op), offset, target));
            (text, offset + 3)
        }
        Closure => {
            let index = chunk.code[offset + 1];
            text.push_str(&format!(
                "{:<16} {:4} {}",
                op_name(op),
                index,
                constant_text(heap, chunk, index)
            ));
            let mut next = offset + 2;
            if let Value::Obj(function) = chunk.constants[index as usize] {
                for _ in 0..heap.function(function).upvalue_count {
                    let is_local = chunk.code[next];
                    let slot = chunk.code[next + 1];
                    text.push_str(&format!(
                        "\n{:04}    | {:<22}{} {}",
                        next,
                        "",
                        if is_local == 1 { "local" } else { "upvalue" },
                        slot
                    ));
                    next += 2;
                }
            }
            (text, next)
        }
        _ => {
            text.push_str(op_name(op));
            (text, offset + 1)
        }
    }
}

fn constant_text(heap: &Heap, chunk: &Chunk, index: u8) -> String {
    match chunk.constants.get(index as usize) {
        Some(value) => value.display(heap),
        None => "??".to_string(),
    }
}

fn op_name(op: OpCode) -> &'static str {
    use OpCode::*;
    match op {
        Constant => "CONSTANT",
        Nil => "NIL",
        True => "TRUE",
        False => "FALSE",
        Pop => "POP",
        GetLocal => "GET_LOCAL",
        SetLocal => "SET_LOCAL",
        GetGlobal => "GET_GLOBAL",
        DefineGlobal => "DEFINE_GLOBAL",
        SetGlobal => "SET_GLOBAL",
        GetUpvalue => "GET_UPVALUE",
        SetUpvalue => "SET_UPVALUE",
        Equal => "EQUAL",
        Greater => "GREATER",
        Less => "LESS",
        Add => "ADD",
        Subtract => "SUBTRACT",
        Multiply => "MULTIPLY",
        Divide => "DIVIDE",
        Not => "NOT",
        Negate => "NEGATE",
        Print => "PRINT",
        Jump => "JUMP",
        JumpIfFalse => "JUMP_IF_FALSE",
        Loop => "LOOP",
        Call => "CALL",
        Closure => "CLOSURE",
        CloseUpvalue => "CLOSE_UPVALUE",
        Return => "RETURN",
    }
}
