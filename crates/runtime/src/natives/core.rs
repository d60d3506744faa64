//! Core natives installed into every module's globals.

use crux_core::object::{Array, ErrorKind, Object};
use crux_core::{Table, Value};

use super::{Variant, define, number_arg, string_arg};
use crate::vm::Vm;

pub(crate) fn build(vm: &mut Vm, table: &mut Table) {
    define(vm, table, Variant::InfallibleFunction, "println", 1, println);
    define(vm, table, Variant::InfallibleFunction, "print", 1, print);
    define(vm, table, Variant::InfallibleFunction, "args", 0, args);
    define(vm, table, Variant::Function, "len", 1, len);
    define(vm, table, Variant::Function, "panic", 1, panic_native);
    define(vm, table, Variant::Function, "assert", 2, assert_native);
    define(vm, table, Variant::Function, "ok", 1, ok);
    define(vm, table, Variant::Function, "err", 1, err);
    define(vm, table, Variant::Function, "error", 1, error_native);
    define(vm, table, Variant::Function, "int", 1, to_int);
    define(vm, table, Variant::Function, "float", 1, to_float);
}

fn println(vm: &mut Vm, args: &[Value]) -> Value {
    let mut text = vm.to_display_string(args[0]);
    text.push('\n');
    vm.write_out(&text);
    Value::Nil
}

fn print(vm: &mut Vm, args: &[Value]) -> Value {
    let text = vm.to_display_string(args[0]);
    vm.write_out(&text);
    Value::Nil
}

fn args(vm: &mut Vm, _args: &[Value]) -> Value {
    vm.maybe_collect();
    let mut values = Vec::with_capacity(vm.args.len());
    let arg_texts = vm.args.clone();
    for text in &arg_texts {
        values.push(Value::Obj(vm.heap.intern(text)));
    }
    Value::Obj(vm.heap.allocate(Object::Array(Array { values })))
}

fn len(vm: &mut Vm, args: &[Value]) -> Value {
    let length = match args[0] {
        Value::Obj(r) => match vm.heap.get(r) {
            Object::String(s) => Some(s.len()),
            Object::Array(a) => Some(a.values.len()),
            Object::StaticArray(a) => Some(a.values.len()),
            Object::Table(t) | Object::StaticTable(t) => Some(t.len()),
            _ => None,
        },
        _ => None,
    };
    match length {
        Some(n) => vm.ok_result(Value::Int(n as i32)),
        None => vm.err_result(
            ErrorKind::Type,
            "Expected either a collection type ('string', 'array', 'table').",
        ),
    }
}

fn panic_native(vm: &mut Vm, args: &[Value]) -> Value {
    let message = vm.to_display_string(args[0]);
    vm.panic_result(ErrorKind::Runtime, &message)
}

fn assert_native(vm: &mut Vm, args: &[Value]) -> Value {
    if args[0].is_falsy() {
        let message = vm.to_display_string(args[1]);
        vm.panic_result(ErrorKind::Assert, &message)
    } else {
        vm.ok_result(Value::Nil)
    }
}

fn ok(vm: &mut Vm, args: &[Value]) -> Value {
    vm.ok_result(args[0])
}

fn err(vm: &mut Vm, args: &[Value]) -> Value {
    let message = vm.to_display_string(args[0]);
    vm.err_result(ErrorKind::Runtime, &message)
}

/// Builds a bare error value without failing the call.
fn error_native(vm: &mut Vm, args: &[Value]) -> Value {
    let message = vm.to_display_string(args[0]);
    let error = vm.make_error(ErrorKind::Runtime, &message, false);
    vm.ok_result(Value::Obj(error))
}

fn to_int(vm: &mut Vm, args: &[Value]) -> Value {
    match args[0] {
        Value::Int(i) => vm.ok_result(Value::Int(i)),
        Value::Float(f) => {
            let truncated = f.trunc();
            if truncated >= f64::from(i32::MIN) && truncated <= f64::from(i32::MAX) {
                vm.ok_result(Value::Int(truncated as i32))
            } else {
                vm.err_result(ErrorKind::Value, "Float is out of the 32-bit integer range.")
            }
        }
        Value::Bool(b) => vm.ok_result(Value::Int(i32::from(b))),
        value => match string_arg(vm, value) {
            Some(text) => match text.trim().parse::<i32>() {
                Ok(i) => vm.ok_result(Value::Int(i)),
                Err(_) => vm.err_result(ErrorKind::Value, "Cannot parse string as 'int'."),
            },
            None => {
                let message = vm.type_error_message(value, "'int', 'float', 'bool' or 'string'");
                vm.err_result(ErrorKind::Type, &message)
            }
        },
    }
}

fn to_float(vm: &mut Vm, args: &[Value]) -> Value {
    match args[0] {
        value if number_arg(value).is_some() => {
            let f = number_arg(value).expect("checked numeric");
            vm.ok_result(Value::Float(f))
        }
        Value::Bool(b) => vm.ok_result(Value::Float(if b { 1.0 } else { 0.0 })),
        value => match string_arg(vm, value) {
            Some(text) => match text.trim().parse::<f64>() {
                Ok(f) => vm.ok_result(Value::Float(f)),
                Err(_) => vm.err_result(ErrorKind::Value, "Cannot parse string as 'float'."),
            },
            None => {
                let message = vm.type_error_message(value, "'int', 'float', 'bool' or 'string'");
                vm.err_result(ErrorKind::Type, &message)
            }
        },
    }
}
