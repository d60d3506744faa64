//! `crux:io` natives.

use std::io::BufRead;

use crux_core::object::ErrorKind;
use crux_core::{Table, Value};

use super::{Variant, define, string_arg};
use crate::vm::Vm;

pub(crate) fn build(vm: &mut Vm, table: &mut Table) {
    define(vm, table, Variant::Function, "print_to", 2, print_to);
    define(vm, table, Variant::Function, "scanln", 0, scanln);
}

fn print_to(vm: &mut Vm, args: &[Value]) -> Value {
    let Some(stream) = string_arg(vm, args[0]) else {
        return vm.err_result(ErrorKind::Type, "Stream name must be a string.");
    };
    let text = vm.to_display_string(args[1]);
    match stream.as_str() {
        "stdout" => {
            vm.write_out(&text);
            vm.ok_result(Value::Nil)
        }
        "stderr" => {
            eprint!("{}", text);
            vm.ok_result(Value::Nil)
        }
        _ => vm.err_result(ErrorKind::Value, "Stream must be 'stdout' or 'stderr'."),
    }
}

fn scanln(vm: &mut Vm, _args: &[Value]) -> Value {
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            vm.maybe_collect();
            let string = vm.heap.intern_owned(line);
            let ok = vm
                .heap
                .allocate(crux_core::Object::Result(crux_core::object::ResultObj::Ok(
                    Value::Obj(string),
                )));
            Value::Obj(ok)
        }
        Err(e) => {
            let message = format!("Failed to read from stdin: {}.", e);
            vm.err_result(ErrorKind::Io, &message)
        }
    }
}
