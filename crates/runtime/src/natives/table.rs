//! Table method table. The receiver arrives as the first argument.

use crux_core::object::{Array, ErrorKind, Object};
use crux_core::{ObjRef, Table, Value};

use super::{Variant, define};
use crate::vm::Vm;

pub(crate) fn build_methods(vm: &mut Vm, table: &mut Table) {
    define(vm, table, Variant::Method, "keys", 1, keys);
    define(vm, table, Variant::Method, "values", 1, values);
    define(vm, table, Variant::Method, "pairs", 1, pairs);
    define(vm, table, Variant::InfallibleMethod, "has_key", 2, has_key);
    define(vm, table, Variant::Method, "remove", 2, remove);
}

fn receiver(vm: &mut Vm, value: Value) -> Result<ObjRef, Value> {
    match value.as_obj() {
        Some(r) if matches!(vm.heap.get(r), Object::Table(_) | Object::StaticTable(_)) => Ok(r),
        _ => Err(vm.err_result(ErrorKind::Type, "Receiver must be a 'table'.")),
    }
}

fn entries_of(vm: &Vm, table: ObjRef) -> Vec<(Value, Value)> {
    match vm.heap.get(table) {
        Object::Table(t) | Object::StaticTable(t) => t.iter().collect(),
        _ => Vec::new(),
    }
}

fn ok_array(vm: &mut Vm, values: Vec<Value>) -> Value {
    vm.maybe_collect();
    let array = vm.heap.allocate(Object::Array(Array { values }));
    let ok = vm
        .heap
        .allocate(Object::Result(crux_core::object::ResultObj::Ok(Value::Obj(
            array,
        ))));
    Value::Obj(ok)
}

fn keys(vm: &mut Vm, args: &[Value]) -> Value {
    let table = match receiver(vm, args[0]) {
        Ok(table) => table,
        Err(result) => return result,
    };
    let keys: Vec<Value> = entries_of(vm, table).into_iter().map(|(k, _)| k).collect();
    ok_array(vm, keys)
}

fn values(vm: &mut Vm, args: &[Value]) -> Value {
    let table = match receiver(vm, args[0]) {
        Ok(table) => table,
        Err(result) => return result,
    };
    let values: Vec<Value> = entries_of(vm, table).into_iter().map(|(_, v)| v).collect();
    ok_array(vm, values)
}

fn pairs(vm: &mut Vm, args: &[Value]) -> Value {
    let table = match receiver(vm, args[0]) {
        Ok(table) => table,
        Err(result) => return result,
    };
    let entries = entries_of(vm, table);
    // One safepoint for the whole nest of allocations; the inner pair
    // arrays are unreachable until the outer array exists.
    vm.maybe_collect();
    let mut values = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let pair = vm.heap.allocate(Object::Array(Array {
            values: vec![key, value],
        }));
        values.push(Value::Obj(pair));
    }
    let array = vm.heap.allocate(Object::Array(Array { values }));
    let ok = vm
        .heap
        .allocate(Object::Result(crux_core::object::ResultObj::Ok(Value::Obj(
            array,
        ))));
    Value::Obj(ok)
}

fn has_key(vm: &mut Vm, args: &[Value]) -> Value {
    let Some(hash) = vm.heap.hash_value(args[1]) else {
        return Value::Bool(false);
    };
    let found = match args[0].as_obj().map(|r| vm.heap.get(r)) {
        Some(Object::Table(t)) | Some(Object::StaticTable(t)) => t.contains_key(hash, args[1]),
        _ => false,
    };
    Value::Bool(found)
}

fn remove(vm: &mut Vm, args: &[Value]) -> Value {
    let table = match receiver(vm, args[0]) {
        Ok(table) => table,
        Err(result) => return result,
    };
    if matches!(vm.heap.get(table), Object::StaticTable(_)) {
        return vm.err_result(
            ErrorKind::CollectionSet,
            "'static table' does not support value updates. Use 'table' instead.",
        );
    }
    let Some(hash) = vm.heap.hash_value(args[1]) else {
        return vm.err_result(ErrorKind::Type, "Key cannot be hashed.");
    };
    let removed = match vm.heap.get_mut(table) {
        Object::Table(t) => t.delete(hash, args[1]),
        _ => false,
    };
    if removed {
        vm.ok_result(Value::Nil)
    } else {
        vm.err_result(ErrorKind::Value, "Key not found in table.")
    }
}
