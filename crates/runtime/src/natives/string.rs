//! String method table. The receiver arrives as the first argument.

use crux_core::object::{Array, ErrorKind, Object};
use crux_core::{Table, Value};

use super::{Variant, define, string_arg};
use crate::vm::Vm;

pub(crate) fn build_methods(vm: &mut Vm, table: &mut Table) {
    define(vm, table, Variant::Method, "first", 1, first);
    define(vm, table, Variant::Method, "last", 1, last);
    define(vm, table, Variant::Method, "get", 2, get);
    define(vm, table, Variant::Method, "upper", 1, upper);
    define(vm, table, Variant::Method, "lower", 1, lower);
    define(vm, table, Variant::Method, "strip", 1, strip);
    define(vm, table, Variant::Method, "starts_with", 2, starts_with);
    define(vm, table, Variant::Method, "ends_with", 2, ends_with);
    define(vm, table, Variant::Method, "contains", 2, contains);
    define(vm, table, Variant::Method, "replace", 3, replace);
    define(vm, table, Variant::Method, "split", 2, split);
    define(vm, table, Variant::Method, "substring", 3, substring);
}

fn receiver(vm: &mut Vm, value: Value) -> Result<String, Value> {
    match string_arg(vm, value) {
        Some(text) => Ok(text),
        None => Err(vm.err_result(ErrorKind::Type, "Receiver must be a 'string'.")),
    }
}

fn ok_string(vm: &mut Vm, text: String) -> Value {
    vm.maybe_collect();
    let string = vm.heap.intern_owned(text);
    let ok = vm
        .heap
        .allocate(Object::Result(crux_core::object::ResultObj::Ok(Value::Obj(
            string,
        ))));
    Value::Obj(ok)
}

fn first(vm: &mut Vm, args: &[Value]) -> Value {
    let text = match receiver(vm, args[0]) {
        Ok(text) => text,
        Err(result) => return result,
    };
    match text.chars().next() {
        Some(c) => ok_string(vm, c.to_string()),
        None => vm.err_result(ErrorKind::Bounds, "String is empty."),
    }
}

fn last(vm: &mut Vm, args: &[Value]) -> Value {
    let text = match receiver(vm, args[0]) {
        Ok(text) => text,
        Err(result) => return result,
    };
    match text.chars().last() {
        Some(c) => ok_string(vm, c.to_string()),
        None => vm.err_result(ErrorKind::Bounds, "String is empty."),
    }
}

fn get(vm: &mut Vm, args: &[Value]) -> Value {
    let text = match receiver(vm, args[0]) {
        Ok(text) => text,
        Err(result) => return result,
    };
    let Value::Int(index) = args[1] else {
        return vm.err_result(ErrorKind::Type, "Index must be of type 'int'.");
    };
    if index < 0 || index as usize >= text.len() {
        return vm.err_result(ErrorKind::Bounds, "Index out of bounds.");
    }
    let byte = text.as_bytes()[index as usize];
    ok_string(vm, (byte as char).to_string())
}

fn upper(vm: &mut Vm, args: &[Value]) -> Value {
    let text = match receiver(vm, args[0]) {
        Ok(text) => text,
        Err(result) => return result,
    };
    ok_string(vm, text.to_uppercase())
}

fn lower(vm: &mut Vm, args: &[Value]) -> Value {
    let text = match receiver(vm, args[0]) {
        Ok(text) => text,
        Err(result) => return result,
    };
    ok_string(vm, text.to_lowercase())
}

fn strip(vm: &mut Vm, args: &[Value]) -> Value {
    let text = match receiver(vm, args[0]) {
        Ok(text) => text,
        Err(result) => return result,
    };
    ok_string(vm, text.trim().to_string())
}

fn binary_text(
    vm: &mut Vm,
    args: &[Value],
    test: fn(&str, &str) -> bool,
) -> Value {
    let text = match receiver(vm, args[0]) {
        Ok(text) => text,
        Err(result) => return result,
    };
    let Some(other) = string_arg(vm, args[1]) else {
        return vm.err_result(ErrorKind::Type, "Argument must be a 'string'.");
    };
    vm.ok_result(Value::Bool(test(&text, &other)))
}

fn starts_with(vm: &mut Vm, args: &[Value]) -> Value {
    binary_text(vm, args, |text, prefix| text.starts_with(prefix))
}

fn ends_with(vm: &mut Vm, args: &[Value]) -> Value {
    binary_text(vm, args, |text, suffix| text.ends_with(suffix))
}

fn contains(vm: &mut Vm, args: &[Value]) -> Value {
    binary_text(vm, args, |text, needle| text.contains(needle))
}

fn replace(vm: &mut Vm, args: &[Value]) -> Value {
    let text = match receiver(vm, args[0]) {
        Ok(text) => text,
        Err(result) => return result,
    };
    let (Some(from), Some(to)) = (string_arg(vm, args[1]), string_arg(vm, args[2])) else {
        return vm.err_result(ErrorKind::Type, "Arguments must be of type 'string'.");
    };
    ok_string(vm, text.replace(&from, &to))
}

fn split(vm: &mut Vm, args: &[Value]) -> Value {
    let text = match receiver(vm, args[0]) {
        Ok(text) => text,
        Err(result) => return result,
    };
    let Some(separator) = string_arg(vm, args[1]) else {
        return vm.err_result(ErrorKind::Type, "Separator must be a 'string'.");
    };
    let parts: Vec<String> = if separator.is_empty() {
        text.chars().map(|c| c.to_string()).collect()
    } else {
        text.split(&separator).map(str::to_string).collect()
    };

    // One safepoint, then raw allocation: the intermediate strings are not
    // yet reachable from any root, so no collection may run among them.
    vm.maybe_collect();
    let mut values = Vec::with_capacity(parts.len());
    for part in parts {
        values.push(Value::Obj(vm.heap.intern_owned(part)));
    }
    let array = vm.heap.allocate(Object::Array(Array { values }));
    let ok = vm
        .heap
        .allocate(Object::Result(crux_core::object::ResultObj::Ok(Value::Obj(
            array,
        ))));
    Value::Obj(ok)
}

fn substring(vm: &mut Vm, args: &[Value]) -> Value {
    let text = match receiver(vm, args[0]) {
        Ok(text) => text,
        Err(result) => return result,
    };
    let (Value::Int(start), Value::Int(end)) = (args[1], args[2]) else {
        return vm.err_result(ErrorKind::Type, "Bounds must be of type 'int'.");
    };
    if start < 0 || end < start || end as usize > text.len() {
        return vm.err_result(ErrorKind::Bounds, "Substring bounds out of range.");
    }
    match text.get(start as usize..end as usize) {
        Some(slice) => ok_string(vm, slice.to_string()),
        None => vm.err_result(ErrorKind::Bounds, "Substring bounds out of range."),
    }
}
