//! Array method table. The receiver arrives as the first argument.

use crux_core::object::{Array, ErrorKind, Object};
use crux_core::value::values_equal;
use crux_core::{ObjRef, Table, Value};

use super::{Variant, define};
use crate::vm::Vm;

pub(crate) fn build_methods(vm: &mut Vm, table: &mut Table) {
    define(vm, table, Variant::Method, "push", 2, push);
    define(vm, table, Variant::Method, "pop", 1, pop);
    define(vm, table, Variant::Method, "insert", 3, insert);
    define(vm, table, Variant::Method, "remove_at", 2, remove_at);
    define(vm, table, Variant::Method, "concat", 2, concat);
    define(vm, table, Variant::Method, "slice", 3, slice);
    define(vm, table, Variant::Method, "reverse", 1, reverse);
    define(vm, table, Variant::Method, "index_of", 2, index_of);
    define(vm, table, Variant::InfallibleMethod, "contains", 2, contains);
    define(vm, table, Variant::InfallibleMethod, "clear", 1, clear);
}

fn receiver(vm: &mut Vm, value: Value) -> Result<ObjRef, Value> {
    match value.as_obj() {
        Some(r) if matches!(vm.heap.get(r), Object::Array(_)) => Ok(r),
        _ => Err(vm.err_result(ErrorKind::Type, "Receiver must be an 'array'.")),
    }
}

fn with_array<T>(vm: &mut Vm, array: ObjRef, f: impl FnOnce(&mut Array) -> T) -> T {
    match vm.heap.get_mut(array) {
        Object::Array(a) => f(a),
        _ => unreachable!("receiver checked as array"),
    }
}

fn push(vm: &mut Vm, args: &[Value]) -> Value {
    let array = match receiver(vm, args[0]) {
        Ok(array) => array,
        Err(result) => return result,
    };
    let value = args[1];
    with_array(vm, array, |a| a.values.push(value));
    vm.ok_result(Value::Nil)
}

fn pop(vm: &mut Vm, args: &[Value]) -> Value {
    let array = match receiver(vm, args[0]) {
        Ok(array) => array,
        Err(result) => return result,
    };
    match with_array(vm, array, |a| a.values.pop()) {
        Some(value) => vm.ok_result(value),
        None => vm.err_result(ErrorKind::Bounds, "Array is empty."),
    }
}

fn insert(vm: &mut Vm, args: &[Value]) -> Value {
    let array = match receiver(vm, args[0]) {
        Ok(array) => array,
        Err(result) => return result,
    };
    let Value::Int(index) = args[1] else {
        return vm.err_result(ErrorKind::Type, "Index must be of type 'int'.");
    };
    let value = args[2];
    let len = with_array(vm, array, |a| a.values.len());
    if index < 0 || index as usize > len {
        return vm.err_result(ErrorKind::Bounds, "Index out of bounds.");
    }
    with_array(vm, array, |a| a.values.insert(index as usize, value));
    vm.ok_result(Value::Nil)
}

fn remove_at(vm: &mut Vm, args: &[Value]) -> Value {
    let array = match receiver(vm, args[0]) {
        Ok(array) => array,
        Err(result) => return result,
    };
    let Value::Int(index) = args[1] else {
        return vm.err_result(ErrorKind::Type, "Index must be of type 'int'.");
    };
    let len = with_array(vm, array, |a| a.values.len());
    if index < 0 || index as usize >= len {
        return vm.err_result(ErrorKind::Bounds, "Index out of bounds.");
    }
    let removed = with_array(vm, array, |a| a.values.remove(index as usize));
    vm.ok_result(removed)
}

fn concat(vm: &mut Vm, args: &[Value]) -> Value {
    let array = match receiver(vm, args[0]) {
        Ok(array) => array,
        Err(result) => return result,
    };
    let other_values = match args[1].as_obj().map(|r| vm.heap.get(r)) {
        Some(Object::Array(a)) => a.values.clone(),
        Some(Object::StaticArray(a)) => a.values.to_vec(),
        _ => return vm.err_result(ErrorKind::Type, "Argument must be an 'array'."),
    };
    let mut combined = with_array(vm, array, |a| a.values.clone());
    combined.extend(other_values);
    vm.maybe_collect();
    let result = vm.heap.allocate(Object::Array(Array { values: combined }));
    let ok = vm
        .heap
        .allocate(Object::Result(crux_core::object::ResultObj::Ok(Value::Obj(
            result,
        ))));
    Value::Obj(ok)
}

fn slice(vm: &mut Vm, args: &[Value]) -> Value {
    let array = match receiver(vm, args[0]) {
        Ok(array) => array,
        Err(result) => return result,
    };
    let (Value::Int(start), Value::Int(end)) = (args[1], args[2]) else {
        return vm.err_result(ErrorKind::Type, "Bounds must be of type 'int'.");
    };
    let len = with_array(vm, array, |a| a.values.len());
    if start < 0 || end < start || end as usize > len {
        return vm.err_result(ErrorKind::Bounds, "Slice bounds out of range.");
    }
    let values = with_array(vm, array, |a| {
        a.values[start as usize..end as usize].to_vec()
    });
    vm.maybe_collect();
    let result = vm.heap.allocate(Object::Array(Array { values }));
    let ok = vm
        .heap
        .allocate(Object::Result(crux_core::object::ResultObj::Ok(Value::Obj(
            result,
        ))));
    Value::Obj(ok)
}

fn reverse(vm: &mut Vm, args: &[Value]) -> Value {
    let array = match receiver(vm, args[0]) {
        Ok(array) => array,
        Err(result) => return result,
    };
    with_array(vm, array, |a| a.values.reverse());
    vm.ok_result(Value::Nil)
}

fn index_of(vm: &mut Vm, args: &[Value]) -> Value {
    let array = match receiver(vm, args[0]) {
        Ok(array) => array,
        Err(result) => return result,
    };
    let needle = args[1];
    let found = with_array(vm, array, |a| {
        a.values.iter().position(|&v| values_equal(v, needle))
    });
    match found {
        Some(index) => vm.ok_result(Value::Int(index as i32)),
        None => vm.err_result(ErrorKind::Value, "Value not found in array."),
    }
}

fn contains(vm: &mut Vm, args: &[Value]) -> Value {
    let needle = args[1];
    let found = match args[0].as_obj().map(|r| vm.heap.get(r)) {
        Some(Object::Array(a)) => a.values.iter().any(|&v| values_equal(v, needle)),
        Some(Object::StaticArray(a)) => a.values.iter().any(|&v| values_equal(v, needle)),
        _ => false,
    };
    Value::Bool(found)
}

fn clear(vm: &mut Vm, args: &[Value]) -> Value {
    if let Some(r) = args[0].as_obj() {
        if let Object::Array(a) = vm.heap.get_mut(r) {
            a.values.clear();
        }
    }
    Value::Nil
}
