//! The interpreter dispatch loop.
//!
//! One big `match` over [`OpCode`] in a hot loop. Each handler decodes its
//! operands, performs the operation against the current module's stack, and
//! loops; a failing handler reports through `runtime_panic` and unwinds.
//!
//! Arithmetic follows the promotion rules: `Int op Int` stays `Int` while
//! the mathematically exact result fits in 32 bits, `/` and `**` always
//! produce floats, `\` and `%` stay integral (with the `INT32_MIN` special
//! cases), and shifts demand integer operands with counts in `[0, 32)`.

use crux_core::object::{Array, Closure, ErrorKind, Object, ResultObj, StaticArray};
use crux_core::opcode::OpCode;
use crux_core::value::{Value, values_equal};
use crux_core::{ObjRef, Table};

use crate::vm::{InterpretError, InterpretResult, MatchState, Vm};

#[derive(Debug, Clone, Copy)]
enum Compound {
    Plus,
    Minus,
    Star,
    Slash,
    IntDivide,
    Modulus,
}

impl Vm {
    // --- instruction decoding ----------------------------------------------

    fn current_function_and_ip(&self) -> (ObjRef, usize) {
        let frame = self
            .heap
            .module(self.current_module)
            .frames
            .last()
            .expect("dispatch requires an active frame");
        (frame.function, frame.ip)
    }

    fn read_byte(&mut self) -> u8 {
        let module = self.current_module;
        let (function, ip) = self.current_function_and_ip();
        let byte = self.heap.function(function).chunk.code[ip];
        self.heap
            .module_mut(module)
            .frames
            .last_mut()
            .expect("dispatch requires an active frame")
            .ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        (u16::from(high) << 8) | u16::from(low)
    }

    fn read_constant(&mut self, wide: bool) -> Value {
        let index = if wide {
            self.read_u16() as usize
        } else {
            self.read_byte() as usize
        };
        let (function, _) = self.current_function_and_ip();
        self.heap.function(function).chunk.constants[index]
    }

    fn read_string(&mut self, wide: bool) -> Result<ObjRef, InterpretError> {
        match self.read_constant(wide) {
            Value::Obj(r) if matches!(self.heap.get(r), Object::String(_)) => Ok(r),
            _ => Err(self.runtime_panic(ErrorKind::Runtime, "Malformed name constant.")),
        }
    }

    fn jump(&mut self, offset: usize) {
        let module = self.current_module;
        self.heap
            .module_mut(module)
            .frames
            .last_mut()
            .expect("dispatch requires an active frame")
            .ip += offset;
    }

    fn loop_back(&mut self, offset: usize) {
        let module = self.current_module;
        self.heap
            .module_mut(module)
            .frames
            .last_mut()
            .expect("dispatch requires an active frame")
            .ip -= offset;
    }

    fn frame_slots(&self) -> usize {
        self.heap
            .module(self.current_module)
            .frames
            .last()
            .expect("dispatch requires an active frame")
            .slots
    }

    /// The module whose globals the running function reads and writes: its
    /// owning module. A closure imported from another module keeps seeing
    /// the globals of the file that defined it.
    fn globals_module(&self) -> ObjRef {
        let (function, _) = self.current_function_and_ip();
        self.heap
            .function(function)
            .module
            .unwrap_or(self.current_module)
    }

    // --- the loop ----------------------------------------------------------

    /// Runs until the current module's top frame returns. With
    /// `anonymous_frame` set, the loop returns as soon as the frame it was
    /// entered on returns, leaving the result on the stack (used by hosts
    /// calling back into user closures).
    pub(crate) fn run(&mut self, anonymous_frame: bool) -> InterpretResult {
        loop {
            if tracing::enabled!(tracing::Level::TRACE) {
                let (function, ip) = self.current_function_and_ip();
                let text = crate::debug::disassemble_instruction(&self.heap, function, ip);
                tracing::trace!(target: "crux::dispatch", "{}", text.trim_end());
            }
            let op_byte = self.read_byte();
            let Some(op) = OpCode::from_byte(op_byte) else {
                return Err(self.runtime_panic(ErrorKind::Runtime, "Unknown opcode."));
            };

            match op {
                OpCode::Return => {
                    if self.op_return(false)? {
                        return Ok(());
                    }
                    if anonymous_frame {
                        return Ok(());
                    }
                }
                OpCode::NilReturn => {
                    if self.op_return(true)? {
                        return Ok(());
                    }
                    if anonymous_frame {
                        return Ok(());
                    }
                }

                OpCode::Constant => {
                    let value = self.read_constant(false);
                    self.push(value)?;
                }
                OpCode::Constant16 => {
                    let value = self.read_constant(true);
                    self.push(value)?;
                }
                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,

                OpCode::Negate => self.op_negate()?,
                OpCode::Not => {
                    let value = self.pop()?;
                    self.push(Value::Bool(value.is_falsy()))?;
                }
                OpCode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Bool(values_equal(a, b)))?;
                }
                OpCode::NotEqual => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Bool(!values_equal(a, b)))?;
                }
                OpCode::Add => {
                    let either_string = self.is_string(self.peek(0)) || self.is_string(self.peek(1));
                    if either_string {
                        self.concatenate()?;
                    } else {
                        self.binary_op(OpCode::Add)?;
                    }
                }
                OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide
                | OpCode::IntDivide
                | OpCode::Modulus
                | OpCode::Power
                | OpCode::LeftShift
                | OpCode::RightShift
                | OpCode::Less
                | OpCode::LessEqual
                | OpCode::Greater
                | OpCode::GreaterEqual => self.binary_op(op)?,

                OpCode::Pop => {
                    self.pop()?;
                }

                OpCode::DefineGlobal => self.op_define_global(false)?,
                OpCode::DefineGlobal16 => self.op_define_global(true)?,
                OpCode::GetGlobal => self.op_get_global(false)?,
                OpCode::GetGlobal16 => self.op_get_global(true)?,
                OpCode::SetGlobal => self.op_set_global(false)?,
                OpCode::SetGlobal16 => self.op_set_global(true)?,

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame_slots();
                    let value = self.heap.module(self.current_module).stack[base + slot];
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame_slots();
                    let value = self.peek(0);
                    let module = self.current_module;
                    self.heap.module_mut(module).stack[base + slot] = value;
                }

                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsy() {
                        self.jump(offset);
                    }
                }
                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.jump(offset);
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.loop_back(offset);
                }

                OpCode::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string(false)?;
                    let arg_count = self.read_byte();
                    self.invoke(name, arg_count)?;
                }
                OpCode::Invoke16 => {
                    let name = self.read_string(true)?;
                    let arg_count = self.read_byte();
                    self.invoke(name, arg_count)?;
                }

                OpCode::Closure | OpCode::AnonFunction => self.op_closure(false)?,
                OpCode::AnonFunction16 => self.op_closure(true)?,

                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.current_closure_upvalue(slot);
                    let value = self.upvalue_get(upvalue);
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.current_closure_upvalue(slot);
                    let value = self.peek(0);
                    self.upvalue_set(upvalue, value);
                }
                OpCode::CloseUpvalue => {
                    let top = self.heap.module(self.current_module).stack.len();
                    self.close_upvalues(top - 1);
                    self.pop()?;
                }

                OpCode::GetProperty => self.op_get_property(false)?,
                OpCode::GetProperty16 => self.op_get_property(true)?,
                OpCode::SetProperty => self.op_set_property(false)?,
                OpCode::SetProperty16 => self.op_set_property(true)?,

                OpCode::Array => self.op_array(false)?,
                OpCode::StaticArray => self.op_array(true)?,
                OpCode::Table => self.op_table(false)?,
                OpCode::StaticTable => self.op_table(true)?,
                OpCode::GetCollection => self.op_get_collection()?,
                OpCode::SetCollection => self.op_set_collection()?,

                OpCode::SetLocalPlus => self.op_compound_local(Compound::Plus)?,
                OpCode::SetLocalMinus => self.op_compound_local(Compound::Minus)?,
                OpCode::SetLocalStar => self.op_compound_local(Compound::Star)?,
                OpCode::SetLocalSlash => self.op_compound_local(Compound::Slash)?,
                OpCode::SetLocalIntDivide => self.op_compound_local(Compound::IntDivide)?,
                OpCode::SetLocalModulus => self.op_compound_local(Compound::Modulus)?,

                OpCode::SetUpvaluePlus => self.op_compound_upvalue(Compound::Plus)?,
                OpCode::SetUpvalueMinus => self.op_compound_upvalue(Compound::Minus)?,
                OpCode::SetUpvalueStar => self.op_compound_upvalue(Compound::Star)?,
                OpCode::SetUpvalueSlash => self.op_compound_upvalue(Compound::Slash)?,
                OpCode::SetUpvalueIntDivide => self.op_compound_upvalue(Compound::IntDivide)?,
                OpCode::SetUpvalueModulus => self.op_compound_upvalue(Compound::Modulus)?,

                OpCode::SetGlobalPlus => self.op_compound_global(Compound::Plus)?,
                OpCode::SetGlobalMinus => self.op_compound_global(Compound::Minus)?,
                OpCode::SetGlobalStar => self.op_compound_global(Compound::Star)?,
                OpCode::SetGlobalSlash => self.op_compound_global(Compound::Slash)?,
                OpCode::SetGlobalIntDivide => self.op_compound_global(Compound::IntDivide)?,
                OpCode::SetGlobalModulus => self.op_compound_global(Compound::Modulus)?,

                OpCode::Pub => {
                    self.pub_pending = true;
                }

                OpCode::Match => {
                    let target = self.pop()?;
                    self.match_stack.push(MatchState {
                        target,
                        bind: Value::Nil,
                        give: None,
                    });
                }
                OpCode::MatchJump => {
                    let offset = self.read_u16() as usize;
                    let pattern = self.pop()?;
                    let target = self.match_target()?;
                    if !values_equal(pattern, target) {
                        self.jump(offset);
                    }
                }
                OpCode::ResultMatchOk => {
                    let offset = self.read_u16() as usize;
                    let target = self.match_target()?;
                    match self.as_result(target) {
                        Some(ResultObj::Ok(value)) => self.push(value)?,
                        _ => self.jump(offset),
                    }
                }
                OpCode::ResultMatchErr => {
                    let offset = self.read_u16() as usize;
                    let target = self.match_target()?;
                    match self.as_result(target) {
                        Some(ResultObj::Err(error)) => self.push(Value::Obj(error))?,
                        _ => self.jump(offset),
                    }
                }
                OpCode::ResultBind => {
                    let slot = self.read_byte() as usize;
                    let bind = self.peek(0);
                    match self.match_stack.last_mut() {
                        Some(state) => state.bind = bind,
                        None => {
                            return Err(
                                self.runtime_panic(ErrorKind::Runtime, "No active match.")
                            );
                        }
                    }
                    let base = self.frame_slots();
                    let module = self.current_module;
                    self.heap.module_mut(module).stack[base + slot] = bind;
                }
                OpCode::Give => {
                    let value = self.pop()?;
                    match self.match_stack.last_mut() {
                        Some(state) => state.give = Some(value),
                        None => {
                            return Err(
                                self.runtime_panic(ErrorKind::Runtime, "No active match.")
                            );
                        }
                    }
                }
                OpCode::MatchEnd => {
                    let Some(state) = self.match_stack.pop() else {
                        return Err(self.runtime_panic(ErrorKind::Runtime, "No active match."));
                    };
                    self.push(state.give.unwrap_or(state.target))?;
                }

                OpCode::UseNative => self.op_use_native()?,
                OpCode::UseModule => {
                    let path = self.read_string(false)?;
                    self.use_module(path)?;
                }
                OpCode::FinishUse => self.op_finish_use()?,

                OpCode::Typeof => {
                    let value = self.peek(0);
                    let name = self.type_name_of(value);
                    let string = self.intern(name);
                    let module = self.current_module;
                    self.heap.module_mut(module).replace_top(Value::Obj(string));
                }
                OpCode::Unwrap => {
                    let value = self.pop()?;
                    match self.as_result(value) {
                        Some(ResultObj::Ok(inner)) => self.push(inner)?,
                        Some(ResultObj::Err(error)) => self.push(Value::Obj(error))?,
                        None => {
                            return Err(self.runtime_panic(
                                ErrorKind::Type,
                                "Only the 'result' type supports unwrapping.",
                            ));
                        }
                    }
                }

                OpCode::Struct => {
                    let value = self.read_constant(false);
                    self.push(value)?;
                }
                OpCode::Struct16 => {
                    let value = self.read_constant(true);
                    self.push(value)?;
                }
                OpCode::StructInstanceStart => self.op_struct_instance_start()?,
                OpCode::StructNamedField => self.op_struct_named_field(false)?,
                OpCode::StructNamedField16 => self.op_struct_named_field(true)?,
                OpCode::StructInstanceEnd => {
                    let Some(instance) = self.struct_stack.pop() else {
                        return Err(self.runtime_panic(
                            ErrorKind::Runtime,
                            "Failed to pop struct from stack.",
                        ));
                    };
                    self.push(Value::Obj(instance))?;
                }
            }
        }
    }

    // --- handlers ----------------------------------------------------------

    /// Returns `Ok(true)` when the module's last frame returned.
    fn op_return(&mut self, nil_return: bool) -> Result<bool, InterpretError> {
        let module = self.current_module;
        let frame = *self
            .heap
            .module(module)
            .frames
            .last()
            .expect("return requires an active frame");
        let result = if nil_return { Value::Nil } else { self.pop()? };
        self.close_upvalues(frame.slots);
        self.heap.module_mut(module).frames.pop();
        let m = self.heap.module_mut(module);
        m.stack.truncate(frame.slots);
        if m.frames.is_empty() {
            return Ok(true);
        }
        self.push(result)?;
        Ok(false)
    }

    fn op_negate(&mut self) -> InterpretResult {
        let operand = self.peek(0);
        let module = self.current_module;
        match operand {
            Value::Int(i) => {
                let negated = if i == i32::MIN {
                    Value::Float(-(f64::from(i32::MIN)))
                } else {
                    Value::Int(-i)
                };
                self.heap.module_mut(module).replace_top(negated);
                Ok(())
            }
            Value::Float(f) => {
                self.heap.module_mut(module).replace_top(Value::Float(-f));
                Ok(())
            }
            other => {
                let message = self.type_error_message(other, "'int' | 'float'");
                Err(self.runtime_panic(ErrorKind::Type, &message))
            }
        }
    }

    fn is_string(&self, value: Value) -> bool {
        matches!(value, Value::Obj(r) if matches!(self.heap.get(r), Object::String(_)))
    }

    fn as_result(&self, value: Value) -> Option<ResultObj> {
        match value {
            Value::Obj(r) => match self.heap.get(r) {
                Object::Result(result) => Some(*result),
                _ => None,
            },
            _ => None,
        }
    }

    fn match_target(&mut self) -> Result<Value, InterpretError> {
        match self.match_stack.last() {
            Some(state) => Ok(state.target),
            None => Err(self.runtime_panic(ErrorKind::Runtime, "No active match.")),
        }
    }

    fn current_closure_upvalue(&self, slot: usize) -> ObjRef {
        let frame = self
            .heap
            .module(self.current_module)
            .frames
            .last()
            .expect("dispatch requires an active frame");
        self.heap.closure(frame.closure).upvalues[slot]
    }

    /// `+ - * compare …` on the top two stack values, with int→float
    /// promotion on 32-bit overflow.
    fn binary_op(&mut self, op: OpCode) -> InterpretResult {
        let b = self.peek(0);
        let a = self.peek(1);

        if !a.is_number() || !b.is_number() {
            let offender = if a.is_number() { b } else { a };
            let message = self.type_error_message(offender, "'int' or 'float'");
            return Err(self.runtime_panic(ErrorKind::Type, &message));
        }

        let result = if let (Value::Int(x), Value::Int(y)) = (a, b) {
            self.int_binary(op, x, y)?
        } else {
            let x = a.as_f64().expect("checked numeric");
            let y = b.as_f64().expect("checked numeric");
            self.float_binary(op, x, y)?
        };

        self.pop()?;
        self.pop()?;
        self.push(result)
    }

    fn int_binary(&mut self, op: OpCode, a: i32, b: i32) -> Result<Value, InterpretError> {
        let promote = |wide: i64| {
            if wide >= i64::from(i32::MIN) && wide <= i64::from(i32::MAX) {
                Value::Int(wide as i32)
            } else {
                Value::Float(wide as f64)
            }
        };
        Ok(match op {
            OpCode::Add => promote(i64::from(a) + i64::from(b)),
            OpCode::Subtract => promote(i64::from(a) - i64::from(b)),
            OpCode::Multiply => promote(i64::from(a) * i64::from(b)),
            OpCode::Divide => {
                if b == 0 {
                    return Err(self.runtime_panic(ErrorKind::Math, "Division by zero."));
                }
                Value::Float(f64::from(a) / f64::from(b))
            }
            OpCode::IntDivide => {
                if b == 0 {
                    return Err(
                        self.runtime_panic(ErrorKind::Math, "Integer division by zero.")
                    );
                }
                if a == i32::MIN && b == -1 {
                    Value::Float(-(f64::from(i32::MIN)))
                } else {
                    Value::Int(a / b)
                }
            }
            OpCode::Modulus => {
                if b == 0 {
                    return Err(self.runtime_panic(ErrorKind::Math, "Modulo by zero."));
                }
                if a == i32::MIN && b == -1 {
                    Value::Int(0)
                } else {
                    Value::Int(a % b)
                }
            }
            OpCode::LeftShift | OpCode::RightShift => {
                if !(0..32).contains(&b) {
                    let symbol = if op == OpCode::LeftShift { "<<" } else { ">>" };
                    let message = format!("Invalid shift amount ({}) for {}.", b, symbol);
                    return Err(self.runtime_panic(ErrorKind::Runtime, &message));
                }
                if op == OpCode::LeftShift {
                    Value::Int(a.wrapping_shl(b as u32))
                } else {
                    Value::Int(a >> b)
                }
            }
            OpCode::Power => Value::Float(f64::from(a).powf(f64::from(b))),
            OpCode::Less => Value::Bool(a < b),
            OpCode::LessEqual => Value::Bool(a <= b),
            OpCode::Greater => Value::Bool(a > b),
            OpCode::GreaterEqual => Value::Bool(a >= b),
            _ => {
                return Err(
                    self.runtime_panic(ErrorKind::Runtime, "Unknown binary operation.")
                );
            }
        })
    }

    fn float_binary(&mut self, op: OpCode, a: f64, b: f64) -> Result<Value, InterpretError> {
        Ok(match op {
            OpCode::Add => Value::Float(a + b),
            OpCode::Subtract => Value::Float(a - b),
            OpCode::Multiply => Value::Float(a * b),
            OpCode::Divide => {
                if b == 0.0 {
                    return Err(self.runtime_panic(ErrorKind::Math, "Division by zero."));
                }
                Value::Float(a / b)
            }
            OpCode::Power => Value::Float(a.powf(b)),
            OpCode::Less => Value::Bool(a < b),
            OpCode::LessEqual => Value::Bool(a <= b),
            OpCode::Greater => Value::Bool(a > b),
            OpCode::GreaterEqual => Value::Bool(a >= b),
            OpCode::IntDivide | OpCode::Modulus | OpCode::LeftShift | OpCode::RightShift => {
                return Err(self.runtime_panic(
                    ErrorKind::Type,
                    "Operands for integer operation must both be integers.",
                ));
            }
            _ => {
                return Err(
                    self.runtime_panic(ErrorKind::Runtime, "Unknown binary operation.")
                );
            }
        })
    }

    /// `+` with at least one string operand: stringify the other side and
    /// concatenate.
    fn concatenate(&mut self) -> InterpretResult {
        let b = self.peek(0);
        let a = self.peek(1);
        let mut text = self.to_display_string(a);
        text.push_str(&self.to_display_string(b));
        self.maybe_collect(); // a and b are still stack-rooted here
        let string = self.heap.intern_owned(text);
        self.pop()?;
        self.pop()?;
        self.push(Value::Obj(string))
    }

    fn compound_result(
        &mut self,
        current: Value,
        operand: Value,
        op: Compound,
        context: &str,
    ) -> Result<Value, InterpretError> {
        if !current.is_number() || !operand.is_number() {
            let message = format!("Operands for '{}' must be numbers.", context);
            return Err(self.runtime_panic(ErrorKind::Type, &message));
        }
        if let (Value::Int(a), Value::Int(b)) = (current, operand) {
            let promote = |wide: i64| {
                if wide >= i64::from(i32::MIN) && wide <= i64::from(i32::MAX) {
                    Value::Int(wide as i32)
                } else {
                    Value::Float(wide as f64)
                }
            };
            return Ok(match op {
                Compound::Plus => promote(i64::from(a) + i64::from(b)),
                Compound::Minus => promote(i64::from(a) - i64::from(b)),
                Compound::Star => promote(i64::from(a) * i64::from(b)),
                Compound::Slash => {
                    if b == 0 {
                        return Err(self.runtime_panic(
                            ErrorKind::Math,
                            &format!("Division by zero in '{}'.", context),
                        ));
                    }
                    Value::Float(f64::from(a) / f64::from(b))
                }
                Compound::IntDivide => {
                    if b == 0 {
                        return Err(self.runtime_panic(
                            ErrorKind::Math,
                            &format!("Integer division by zero in '{}'.", context),
                        ));
                    }
                    if a == i32::MIN && b == -1 {
                        Value::Float(-(f64::from(i32::MIN)))
                    } else {
                        Value::Int(a / b)
                    }
                }
                Compound::Modulus => {
                    if b == 0 {
                        return Err(self.runtime_panic(
                            ErrorKind::Math,
                            &format!("Modulo by zero in '{}'.", context),
                        ));
                    }
                    if a == i32::MIN && b == -1 {
                        Value::Int(0)
                    } else {
                        Value::Int(a % b)
                    }
                }
            });
        }

        let a = current.as_f64().expect("checked numeric");
        let b = operand.as_f64().expect("checked numeric");
        Ok(match op {
            Compound::Plus => Value::Float(a + b),
            Compound::Minus => Value::Float(a - b),
            Compound::Star => Value::Float(a * b),
            Compound::Slash => {
                if b == 0.0 {
                    return Err(self.runtime_panic(
                        ErrorKind::Math,
                        &format!("Division by zero in '{}'.", context),
                    ));
                }
                Value::Float(a / b)
            }
            Compound::IntDivide | Compound::Modulus => {
                return Err(self.runtime_panic(
                    ErrorKind::Type,
                    &format!(
                        "Operands for integer compound assignment '{}' must both be integers.",
                        context
                    ),
                ));
            }
        })
    }

    fn op_compound_local(&mut self, op: Compound) -> InterpretResult {
        let slot = self.read_byte() as usize;
        let base = self.frame_slots();
        let current = self.heap.module(self.current_module).stack[base + slot];
        let operand = self.peek(0);
        let result = self.compound_result(current, operand, op, compound_symbol(op))?;
        let module = self.current_module;
        self.heap.module_mut(module).stack[base + slot] = result;
        Ok(())
    }

    fn op_compound_upvalue(&mut self, op: Compound) -> InterpretResult {
        let slot = self.read_byte() as usize;
        let upvalue = self.current_closure_upvalue(slot);
        let current = self.upvalue_get(upvalue);
        let operand = self.peek(0);
        let result = self.compound_result(current, operand, op, compound_symbol(op))?;
        self.upvalue_set(upvalue, result);
        Ok(())
    }

    fn op_compound_global(&mut self, op: Compound) -> InterpretResult {
        let name = self.read_string(false)?;
        let hash = self.heap.string(name).hash;
        let module = self.globals_module();
        let Some(current) = self
            .heap
            .module(module)
            .globals
            .get(hash, Value::Obj(name))
        else {
            let message = format!(
                "Undefined variable '{}' for compound assignment.",
                self.heap.string_chars(name)
            );
            return Err(self.runtime_panic(ErrorKind::Name, &message));
        };
        let operand = self.peek(0);
        let result = self.compound_result(current, operand, op, compound_symbol(op))?;
        self.heap
            .module_mut(module)
            .globals
            .set(hash, Value::Obj(name), result);
        Ok(())
    }

    fn op_define_global(&mut self, wide: bool) -> InterpretResult {
        let name = self.read_string(wide)?;
        let is_pub = std::mem::take(&mut self.pub_pending);
        let hash = self.heap.string(name).hash;
        let value = self.peek(0);
        let module = self.globals_module();
        let is_repl = self.heap.module(module).is_repl;
        let exists = self
            .heap
            .module(module)
            .globals
            .contains_key(hash, Value::Obj(name));
        if exists && !is_repl {
            let message = format!(
                "Cannot define '{}' because it is already defined.",
                self.heap.string_chars(name)
            );
            return Err(self.runtime_panic(ErrorKind::Name, &message));
        }
        self.heap
            .module_mut(module)
            .globals
            .set(hash, Value::Obj(name), value);
        if is_pub {
            self.heap
                .module_mut(module)
                .publics
                .set(hash, Value::Obj(name), value);
        }
        self.pop()?;
        Ok(())
    }

    fn op_get_global(&mut self, wide: bool) -> InterpretResult {
        let name = self.read_string(wide)?;
        let hash = self.heap.string(name).hash;
        let module = self.globals_module();
        match self.heap.module(module).globals.get(hash, Value::Obj(name)) {
            Some(value) => self.push(value),
            None => {
                let message =
                    format!("Undefined variable '{}'.", self.heap.string_chars(name));
                Err(self.runtime_panic(ErrorKind::Name, &message))
            }
        }
    }

    fn op_set_global(&mut self, wide: bool) -> InterpretResult {
        let name = self.read_string(wide)?;
        let hash = self.heap.string(name).hash;
        let module = self.globals_module();
        let exists = self
            .heap
            .module(module)
            .globals
            .contains_key(hash, Value::Obj(name));
        if !exists {
            let message = format!(
                "Cannot give variable '{}' a value because it has not been defined. Did you forget 'let'?",
                self.heap.string_chars(name)
            );
            return Err(self.runtime_panic(ErrorKind::Name, &message));
        }
        let value = self.peek(0);
        self.heap
            .module_mut(module)
            .globals
            .set(hash, Value::Obj(name), value);
        Ok(())
    }

    fn op_closure(&mut self, wide: bool) -> InterpretResult {
        let function = match self.read_constant(wide) {
            Value::Obj(r) if matches!(self.heap.get(r), Object::Function(_)) => r,
            _ => {
                return Err(
                    self.runtime_panic(ErrorKind::Runtime, "Malformed function constant.")
                );
            }
        };
        let upvalue_count = self.heap.function(function).upvalue_count as usize;
        let closure = self.alloc(Object::Closure(Closure {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }));
        self.push(Value::Obj(closure))?;

        let base = self.frame_slots();
        let enclosing = self
            .heap
            .module(self.current_module)
            .frames
            .last()
            .expect("dispatch requires an active frame")
            .closure;
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() != 0;
            let index = self.read_byte() as usize;
            let upvalue = if is_local {
                self.capture_upvalue(base + index)
            } else {
                self.heap.closure(enclosing).upvalues[index]
            };
            match self.heap.get_mut(closure) {
                Object::Closure(c) => c.upvalues.push(upvalue),
                _ => unreachable!("closure allocated above"),
            }
        }
        Ok(())
    }

    fn op_get_property(&mut self, wide: bool) -> InterpretResult {
        let name = self.read_string(wide)?;
        let receiver = self.pop()?;
        let Some((instance, struct_type)) = self.as_struct_instance(receiver) else {
            return Err(self.runtime_panic(
                ErrorKind::Type,
                "Cannot get property on non 'struct instance' type.",
            ));
        };
        let index = self.struct_field_index(struct_type, name)?;
        let value = match self.heap.get(instance) {
            Object::StructInstance(i) => i.fields[index],
            _ => Value::Nil,
        };
        self.push(value)
    }

    fn op_set_property(&mut self, wide: bool) -> InterpretResult {
        let name = self.read_string(wide)?;
        let value = self.pop()?;
        let receiver = self.pop()?;
        let Some((instance, struct_type)) = self.as_struct_instance(receiver) else {
            let message = format!(
                "Cannot set property '{}' on non struct instance value. {}",
                self.heap.string_chars(name),
                self.type_error_message(receiver, "'struct instance'")
            );
            return Err(self.runtime_panic(ErrorKind::Type, &message));
        };
        let index = self.struct_field_index(struct_type, name)?;
        match self.heap.get_mut(instance) {
            Object::StructInstance(i) => i.fields[index] = value,
            _ => {}
        }
        self.push(value)
    }

    fn as_struct_instance(&self, value: Value) -> Option<(ObjRef, ObjRef)> {
        match value {
            Value::Obj(r) => match self.heap.get(r) {
                Object::StructInstance(i) => Some((r, i.struct_type)),
                _ => None,
            },
            _ => None,
        }
    }

    fn struct_field_index(
        &mut self,
        struct_type: ObjRef,
        name: ObjRef,
    ) -> Result<usize, InterpretError> {
        let hash = self.heap.string(name).hash;
        let entry = match self.heap.get(struct_type) {
            Object::Struct(s) => s.fields.get(hash, Value::Obj(name)),
            _ => None,
        };
        match entry {
            Some(Value::Int(index)) => Ok(index as usize),
            _ => {
                let struct_name = match self.heap.get(struct_type) {
                    Object::Struct(s) => self.heap.string_chars(s.name).to_string(),
                    _ => "?".to_string(),
                };
                let message = format!(
                    "Property '{}' does not exist on struct '{}'.",
                    self.heap.string_chars(name),
                    struct_name
                );
                Err(self.runtime_panic(ErrorKind::Name, &message))
            }
        }
    }

    fn op_array(&mut self, frozen: bool) -> InterpretResult {
        let count = self.read_u16() as usize;
        self.maybe_collect(); // elements are still stack-rooted
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.pop()?);
        }
        values.reverse();
        let array = if frozen {
            self.heap.allocate(Object::StaticArray(StaticArray {
                values: values.into_boxed_slice(),
            }))
        } else {
            self.heap.allocate(Object::Array(Array { values }))
        };
        self.push(Value::Obj(array))
    }

    fn op_table(&mut self, frozen: bool) -> InterpretResult {
        let count = self.read_u16() as usize;
        self.maybe_collect(); // entries are still stack-rooted
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count {
            let value = self.pop()?;
            let key = self.pop()?;
            pairs.push((key, value));
        }
        // Popped last-pair-first; insert in source order so later duplicate
        // keys overwrite earlier ones.
        pairs.reverse();
        let mut table = Table::new();
        for (key, value) in pairs {
            let Some(hash) = self.heap.hash_value(key) else {
                return Err(self.runtime_panic(ErrorKind::Type, "Key cannot be hashed."));
            };
            table.set(hash, key, value);
        }
        let object = if frozen {
            self.heap.allocate(Object::StaticTable(table))
        } else {
            self.heap.allocate(Object::Table(table))
        };
        self.push(Value::Obj(object))
    }

    fn op_get_collection(&mut self) -> InterpretResult {
        let index = self.pop()?;
        let collection = self.peek(0);
        let Some(r) = collection.as_obj() else {
            return Err(
                self.runtime_panic(ErrorKind::Type, "Cannot get from a non-collection type.")
            );
        };
        enum Kind {
            Table,
            Array,
            StaticArray,
            String,
        }
        let kind = match self.heap.get(r) {
            Object::Table(_) | Object::StaticTable(_) => Kind::Table,
            Object::Array(_) => Kind::Array,
            Object::StaticArray(_) => Kind::StaticArray,
            Object::String(_) => Kind::String,
            _ => {
                return Err(self.runtime_panic(
                    ErrorKind::Type,
                    "Cannot get from a non-collection type.",
                ));
            }
        };
        let module = self.current_module;
        match kind {
            Kind::Table => {
                let Some(hash) = self.heap.hash_value(index) else {
                    return Err(self.runtime_panic(ErrorKind::Type, "Key cannot be hashed."));
                };
                let entry = match self.heap.get(r) {
                    Object::Table(t) | Object::StaticTable(t) => t.get(hash, index),
                    _ => None,
                };
                match entry {
                    Some(value) => {
                        self.heap.module_mut(module).replace_top(value);
                        Ok(())
                    }
                    None => Err(self.runtime_panic(
                        ErrorKind::CollectionGet,
                        "Failed to get value from table.",
                    )),
                }
            }
            Kind::Array | Kind::StaticArray => {
                let Value::Int(i) = index else {
                    return Err(
                        self.runtime_panic(ErrorKind::Type, "Index must be of type 'int'.")
                    );
                };
                let values_len = match self.heap.get(r) {
                    Object::Array(a) => a.values.len(),
                    Object::StaticArray(a) => a.values.len(),
                    _ => 0,
                };
                if i < 0 || i as usize >= values_len {
                    return Err(self.runtime_panic(ErrorKind::Bounds, "Index out of bounds."));
                }
                let value = match self.heap.get(r) {
                    Object::Array(a) => a.values[i as usize],
                    Object::StaticArray(a) => a.values[i as usize],
                    _ => Value::Nil,
                };
                self.heap.module_mut(module).replace_top(value);
                Ok(())
            }
            Kind::String => {
                let Value::Int(i) = index else {
                    return Err(
                        self.runtime_panic(ErrorKind::Type, "Index must be of type 'int'.")
                    );
                };
                let chars = self.heap.string_chars(r);
                if i < 0 || i as usize >= chars.len() {
                    return Err(self.runtime_panic(ErrorKind::Bounds, "Index out of bounds."));
                }
                let byte = chars.as_bytes()[i as usize];
                let single = (byte as char).to_string();
                let string = self.intern(&single);
                self.heap.module_mut(module).replace_top(Value::Obj(string));
                Ok(())
            }
        }
    }

    fn op_set_collection(&mut self) -> InterpretResult {
        let value = self.pop()?;
        let index = self.peek(0);
        let collection = self.peek(1);
        let Some(r) = collection.as_obj() else {
            return Err(self.runtime_panic(
                ErrorKind::Type,
                "Value is not a mutable collection type.",
            ));
        };
        enum Kind {
            Table,
            Array,
            StaticArray,
            StaticTable,
            Other,
        }
        let kind = match self.heap.get(r) {
            Object::Table(_) => Kind::Table,
            Object::Array(_) => Kind::Array,
            Object::StaticArray(_) => Kind::StaticArray,
            Object::StaticTable(_) => Kind::StaticTable,
            _ => Kind::Other,
        };
        match kind {
            Kind::Table => {
                let Some(hash) = self.heap.hash_value(index) else {
                    return Err(self.runtime_panic(ErrorKind::Type, "Key cannot be hashed."));
                };
                if let Object::Table(t) = self.heap.get_mut(r) {
                    t.set(hash, index, value);
                }
            }
            Kind::Array => {
                let Value::Int(i) = index else {
                    return Err(
                        self.runtime_panic(ErrorKind::Type, "Index must be of type 'int'.")
                    );
                };
                let len = match self.heap.get(r) {
                    Object::Array(a) => a.values.len(),
                    _ => 0,
                };
                if i < 0 || i as usize >= len {
                    return Err(self.runtime_panic(ErrorKind::Bounds, "Index out of bounds."));
                }
                if let Object::Array(a) = self.heap.get_mut(r) {
                    a.values[i as usize] = value;
                }
            }
            Kind::StaticArray => {
                return Err(self.runtime_panic(
                    ErrorKind::CollectionSet,
                    "'static array' does not support value updates. Use 'array' instead.",
                ));
            }
            Kind::StaticTable => {
                return Err(self.runtime_panic(
                    ErrorKind::CollectionSet,
                    "'static table' does not support value updates. Use 'table' instead.",
                ));
            }
            Kind::Other => {
                return Err(self.runtime_panic(
                    ErrorKind::Type,
                    "Value is not a mutable collection type.",
                ));
            }
        }
        self.pop()?; // index
        self.pop()?; // collection
        self.push(value)
    }

    fn op_struct_instance_start(&mut self) -> InterpretResult {
        let value = self.peek(0);
        let struct_type = match value.as_obj() {
            Some(r) if matches!(self.heap.get(r), Object::Struct(_)) => r,
            _ => {
                return Err(self.runtime_panic(
                    ErrorKind::Type,
                    "Only 'struct' types can be instantiated.",
                ));
            }
        };
        let field_count = match self.heap.get(struct_type) {
            Object::Struct(s) => s.fields.len(),
            _ => 0,
        };
        self.maybe_collect(); // the struct type is still stack-rooted
        let instance = self
            .heap
            .allocate(Object::StructInstance(crux_core::object::StructInstance {
                struct_type,
                fields: vec![Value::Nil; field_count],
            }));
        self.pop()?;
        if self.struct_stack.len() >= crate::vm::STRUCT_INSTANCE_DEPTH {
            return Err(
                self.runtime_panic(ErrorKind::Runtime, "Failed to push struct onto stack.")
            );
        }
        self.struct_stack.push(instance);
        Ok(())
    }

    fn op_struct_named_field(&mut self, wide: bool) -> InterpretResult {
        let name = self.read_string(wide)?;
        let Some(&instance) = self.struct_stack.last() else {
            return Err(
                self.runtime_panic(ErrorKind::Runtime, "Failed to get struct from stack.")
            );
        };
        let struct_type = match self.heap.get(instance) {
            Object::StructInstance(i) => i.struct_type,
            _ => {
                return Err(
                    self.runtime_panic(ErrorKind::Runtime, "Failed to get struct from stack.")
                );
            }
        };
        let index = self.struct_field_index(struct_type, name)?;
        let value = self.pop()?;
        match self.heap.get_mut(instance) {
            Object::StructInstance(i) => i.fields[index] = value,
            _ => {}
        }
        Ok(())
    }

    fn op_use_native(&mut self) -> InterpretResult {
        let count = self.read_byte() as usize;
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            names.push(self.read_string(false)?);
        }
        let mut aliases = Vec::with_capacity(count);
        for _ in 0..count {
            aliases.push(self.read_string(false)?);
        }
        let module_name = self.read_string(false)?;

        let Some(found) = self
            .native_modules
            .iter()
            .position(|m| m.name == module_name)
        else {
            let message = format!(
                "Module '{}' not found.",
                self.heap.string_chars(module_name)
            );
            return Err(self.runtime_panic(ErrorKind::Import, &message));
        };

        for (name, alias) in names.into_iter().zip(aliases) {
            let hash = self.heap.string(name).hash;
            let Some(value) = self.native_modules[found].table.get(hash, Value::Obj(name))
            else {
                let message = format!(
                    "Failed to import '{}' from '{}'.",
                    self.heap.string_chars(name),
                    self.heap.string_chars(module_name)
                );
                return Err(self.runtime_panic(ErrorKind::Import, &message));
            };
            let alias_hash = self.heap.string(alias).hash;
            let module = self.current_module;
            let exists = self
                .heap
                .module(module)
                .globals
                .contains_key(alias_hash, Value::Obj(alias));
            if exists {
                let message = format!(
                    "Failed to import '{}' from '{}'.",
                    self.heap.string_chars(name),
                    self.heap.string_chars(module_name)
                );
                return Err(self.runtime_panic(ErrorKind::Import, &message));
            }
            self.heap
                .module_mut(module)
                .globals
                .set(alias_hash, Value::Obj(alias), value);
        }
        Ok(())
    }

    fn op_finish_use(&mut self) -> InterpretResult {
        let count = self.read_byte() as usize;
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            names.push(self.read_string(false)?);
        }
        let mut aliases = Vec::with_capacity(count);
        for _ in 0..count {
            aliases.push(self.read_string(false)?);
        }

        let top = self.peek(0);
        let imported = match top.as_obj() {
            Some(r) if matches!(self.heap.get(r), Object::Module(_)) => r,
            _ => {
                return Err(self.runtime_panic(
                    ErrorKind::Runtime,
                    "Module record creation could not be completed.",
                ));
            }
        };
        self.pop()?;

        if self.heap.module(imported).state == crux_core::ModuleState::Error {
            let path = match self.heap.module(imported).path {
                Some(p) => self.heap.string_chars(p).to_string(),
                None => "<unknown>".to_string(),
            };
            let message = format!("Failed to import module from {}.", path);
            return Err(self.runtime_panic(ErrorKind::Import, &message));
        }

        for (name, alias) in names.into_iter().zip(aliases) {
            let hash = self.heap.string(name).hash;
            let Some(value) = self
                .heap
                .module(imported)
                .publics
                .get(hash, Value::Obj(name))
            else {
                let message = format!(
                    "'{}' is not an exported name.",
                    self.heap.string_chars(name)
                );
                return Err(self.runtime_panic(ErrorKind::Import, &message));
            };
            let alias_hash = self.heap.string(alias).hash;
            let module = self.current_module;
            let exists = self
                .heap
                .module(module)
                .globals
                .contains_key(alias_hash, Value::Obj(alias));
            if exists {
                let message = format!(
                    "Failed to import '{}'. This name may already be in use in this scope.",
                    self.heap.string_chars(name)
                );
                return Err(self.runtime_panic(ErrorKind::Import, &message));
            }
            self.heap
                .module_mut(module)
                .globals
                .set(alias_hash, Value::Obj(alias), value);
        }
        self.import_count = self.import_count.saturating_sub(1);
        Ok(())
    }
}

fn compound_symbol(op: Compound) -> &'static str {
    match op {
        Compound::Plus => "+=",
        Compound::Minus => "-=",
        Compound::Star => "*=",
        Compound::Slash => "/=",
        Compound::IntDivide => "\\=",
        Compound::Modulus => "%=",
    }
}
