//! `crux:sys` natives.

use crux_core::object::{Array, ErrorKind, Object};
use crux_core::{Table, Value};

use super::{Variant, define};
use crate::vm::Vm;

pub(crate) fn build(vm: &mut Vm, table: &mut Table) {
    define(vm, table, Variant::InfallibleFunction, "args", 0, args);
    define(vm, table, Variant::InfallibleFunction, "platform", 0, platform);
    define(vm, table, Variant::Function, "exit", 1, exit);
}

fn args(vm: &mut Vm, _args: &[Value]) -> Value {
    vm.maybe_collect();
    let arg_texts = vm.args.clone();
    let mut values = Vec::with_capacity(arg_texts.len());
    for text in &arg_texts {
        values.push(Value::Obj(vm.heap.intern(text)));
    }
    Value::Obj(vm.heap.allocate(Object::Array(Array { values })))
}

fn platform(vm: &mut Vm, _args: &[Value]) -> Value {
    let name = std::env::consts::OS;
    let string = vm.intern(name);
    Value::Obj(string)
}

fn exit(vm: &mut Vm, args: &[Value]) -> Value {
    match args[0] {
        Value::Int(code) => std::process::exit(code),
        _ => vm.err_result(ErrorKind::Type, "Exit code must be an 'int'."),
    }
}
