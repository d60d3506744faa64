//! Bytecode disassembler, used by the trace-level dispatch logger and by
//! tests that want to inspect emitted code.

use crux_core::heap::{Heap, ObjRef};
use crux_core::object::Object;
use crux_core::opcode::OpCode;
use crux_core::{Value, display_value};

/// Renders every instruction of a function's chunk.
pub fn disassemble_chunk(heap: &Heap, function: ObjRef, name: &str) -> String {
    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    let code_len = heap.function(function).chunk.code.len();
    while offset < code_len {
        let (text, next) = instruction_at(heap, function, offset);
        out.push_str(&text);
        out.push('\n');
        offset = next;
    }
    out
}

/// Renders the single instruction at `offset`.
pub fn disassemble_instruction(heap: &Heap, function: ObjRef, offset: usize) -> String {
    instruction_at(heap, function, offset).0
}

fn instruction_at(heap: &Heap, function: ObjRef, offset: usize) -> (String, usize) {
    let chunk = &heap.function(function).chunk;
    let line = chunk.line_at(offset);
    let prefix = format!("{:04} {:>4} ", offset, line);

    let Some(op) = OpCode::from_byte(chunk.code[offset]) else {
        return (format!("{}<bad opcode {}>", prefix, chunk.code[offset]), offset + 1);
    };

    let byte_at = |at: usize| chunk.code.get(at).copied().unwrap_or(0) as usize;
    let short_at = |at: usize| (byte_at(at) << 8) | byte_at(at + 1);
    let constant_text = |index: usize| match chunk.constants.get(index) {
        Some(&value) => display_value(heap, value, true),
        None => "<bad constant>".to_string(),
    };

    match op {
        // Single-byte instructions.
        OpCode::Return
        | OpCode::NilReturn
        | OpCode::Nil
        | OpCode::True
        | OpCode::False
        | OpCode::Negate
        | OpCode::Equal
        | OpCode::NotEqual
        | OpCode::Greater
        | OpCode::GreaterEqual
        | OpCode::Less
        | OpCode::LessEqual
        | OpCode::Add
        | OpCode::Subtract
        | OpCode::Multiply
        | OpCode::Divide
        | OpCode::IntDivide
        | OpCode::Modulus
        | OpCode::Power
        | OpCode::LeftShift
        | OpCode::RightShift
        | OpCode::Not
        | OpCode::Pop
        | OpCode::CloseUpvalue
        | OpCode::Pub
        | OpCode::Match
        | OpCode::MatchEnd
        | OpCode::Give
        | OpCode::Typeof
        | OpCode::Unwrap
        | OpCode::GetCollection
        | OpCode::SetCollection
        | OpCode::StructInstanceStart
        | OpCode::StructInstanceEnd => (format!("{}{}", prefix, op.name()), offset + 1),

        // One-byte slot operand.
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call
        | OpCode::ResultBind
        | OpCode::SetLocalPlus
        | OpCode::SetLocalMinus
        | OpCode::SetLocalStar
        | OpCode::SetLocalSlash
        | OpCode::SetLocalIntDivide
        | OpCode::SetLocalModulus
        | OpCode::SetUpvaluePlus
        | OpCode::SetUpvalueMinus
        | OpCode::SetUpvalueStar
        | OpCode::SetUpvalueSlash
        | OpCode::SetUpvalueIntDivide
        | OpCode::SetUpvalueModulus => (
            format!("{}{} {}", prefix, op.name(), byte_at(offset + 1)),
            offset + 2,
        ),

        // One-byte constant operand.
        OpCode::Constant
        | OpCode::DefineGlobal
        | OpCode::GetGlobal
        | OpCode::SetGlobal
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::Struct
        | OpCode::StructNamedField
        | OpCode::UseModule
        | OpCode::SetGlobalPlus
        | OpCode::SetGlobalMinus
        | OpCode::SetGlobalStar
        | OpCode::SetGlobalSlash
        | OpCode::SetGlobalIntDivide
        | OpCode::SetGlobalModulus => {
            let index = byte_at(offset + 1);
            (
                format!("{}{} {} ({})", prefix, op.name(), index, constant_text(index)),
                offset + 2,
            )
        }

        // Two-byte constant operand.
        OpCode::Constant16
        | OpCode::DefineGlobal16
        | OpCode::GetGlobal16
        | OpCode::SetGlobal16
        | OpCode::GetProperty16
        | OpCode::SetProperty16
        | OpCode::Struct16
        | OpCode::StructNamedField16 => {
            let index = short_at(offset + 1);
            (
                format!("{}{} {} ({})", prefix, op.name(), index, constant_text(index)),
                offset + 3,
            )
        }

        // Two-byte jump or count operand.
        OpCode::Jump
        | OpCode::JumpIfFalse
        | OpCode::Loop
        | OpCode::MatchJump
        | OpCode::ResultMatchOk
        | OpCode::ResultMatchErr
        | OpCode::Array
        | OpCode::Table
        | OpCode::StaticArray
        | OpCode::StaticTable => (
            format!("{}{} {}", prefix, op.name(), short_at(offset + 1)),
            offset + 3,
        ),

        OpCode::Invoke => {
            let index = byte_at(offset + 1);
            let args = byte_at(offset + 2);
            (
                format!(
                    "{}{} {} ({}) args={}",
                    prefix,
                    op.name(),
                    index,
                    constant_text(index),
                    args
                ),
                offset + 3,
            )
        }
        OpCode::Invoke16 => {
            let index = short_at(offset + 1);
            let args = byte_at(offset + 3);
            (
                format!(
                    "{}{} {} ({}) args={}",
                    prefix,
                    op.name(),
                    index,
                    constant_text(index),
                    args
                ),
                offset + 4,
            )
        }

        OpCode::Closure | OpCode::AnonFunction | OpCode::AnonFunction16 => {
            let wide = op == OpCode::AnonFunction16;
            let index = if wide {
                short_at(offset + 1)
            } else {
                byte_at(offset + 1)
            };
            let mut at = offset + if wide { 3 } else { 2 };
            let mut text = format!("{}{} {} ({})", prefix, op.name(), index, constant_text(index));
            if let Some(Value::Obj(f)) = chunk.constants.get(index) {
                if let Object::Function(function) = heap.get(*f) {
                    for _ in 0..function.upvalue_count {
                        let is_local = byte_at(at) != 0;
                        let slot = byte_at(at + 1);
                        text.push_str(&format!(
                            " | {} {}",
                            if is_local { "local" } else { "upvalue" },
                            slot
                        ));
                        at += 2;
                    }
                }
            }
            (text, at)
        }

        OpCode::UseNative => {
            let count = byte_at(offset + 1);
            let module_index = byte_at(offset + 2 + 2 * count);
            (
                format!(
                    "{}{} {} names from ({})",
                    prefix,
                    op.name(),
                    count,
                    constant_text(module_index)
                ),
                offset + 3 + 2 * count,
            )
        }
        OpCode::FinishUse => {
            let count = byte_at(offset + 1);
            (
                format!("{}{} {} names", prefix, op.name(), count),
                offset + 2 + 2 * count,
            )
        }
    }
}
