//! Error and result method tables.

use crux_core::object::{ErrorKind, Object, ResultObj};
use crux_core::{Table, Value};

use super::{Variant, define};
use crate::vm::Vm;

pub(crate) fn build_error_methods(vm: &mut Vm, table: &mut Table) {
    define(vm, table, Variant::Method, "message", 1, message);
    define(vm, table, Variant::Method, "kind", 1, kind);
}

pub(crate) fn build_result_methods(vm: &mut Vm, table: &mut Table) {
    define(vm, table, Variant::InfallibleMethod, "is_ok", 1, is_ok);
    define(vm, table, Variant::InfallibleMethod, "is_err", 1, is_err);
}

fn message(vm: &mut Vm, args: &[Value]) -> Value {
    let message = match args[0].as_obj().map(|r| vm.heap.get(r)) {
        Some(Object::Error(e)) => Some(e.message),
        _ => None,
    };
    match message {
        Some(message) => vm.ok_result(Value::Obj(message)),
        None => vm.err_result(ErrorKind::Type, "Receiver must be an 'error'."),
    }
}

fn kind(vm: &mut Vm, args: &[Value]) -> Value {
    let kind = match args[0].as_obj().map(|r| vm.heap.get(r)) {
        Some(Object::Error(e)) => Some(e.kind),
        _ => None,
    };
    match kind {
        Some(kind) => {
            let name = vm.intern(kind.display_name());
            vm.ok_result(Value::Obj(name))
        }
        None => vm.err_result(ErrorKind::Type, "Receiver must be an 'error'."),
    }
}

fn is_ok(vm: &mut Vm, args: &[Value]) -> Value {
    match args[0].as_obj().map(|r| vm.heap.get(r)) {
        Some(Object::Result(ResultObj::Ok(_))) => Value::Bool(true),
        Some(Object::Result(ResultObj::Err(_))) => Value::Bool(false),
        _ => Value::Nil,
    }
}

fn is_err(vm: &mut Vm, args: &[Value]) -> Value {
    match args[0].as_obj().map(|r| vm.heap.get(r)) {
        Some(Object::Result(ResultObj::Ok(_))) => Value::Bool(false),
        Some(Object::Result(ResultObj::Err(_))) => Value::Bool(true),
        _ => Value::Nil,
    }
}
