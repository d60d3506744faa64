//! The standard-library glue: native functions, native modules, and the
//! per-type method tables.
//!
//! Core functions land in every module's globals; the named modules
//! (`math io fs time random sys vectors`) are importable through
//! `use … from "crux:NAME";`. Methods take their receiver as the first
//! argument, so a method's arity counts the receiver.
//!
//! Installation uses the heap directly (never the collecting allocation
//! path): half-built tables are not yet reachable from any root, and the
//! direct path cannot trigger a sweep.

pub mod array;
pub mod core;
pub mod error;
pub mod fs;
pub mod io;
pub mod math;
pub mod random;
pub mod string;
pub mod sys;
pub mod table;
pub mod time;
pub mod vectors;

use crux_core::object::{Native, Object};
use crux_core::{ObjRef, Table, Value};

use crate::vm::{NativeFn, NativeModule, TypeMethods, Vm};

#[derive(Debug, Clone, Copy)]
pub(crate) enum Variant {
    Function,
    Method,
    InfallibleFunction,
    InfallibleMethod,
}

/// Registers one native under `name` in `table`.
pub(crate) fn define(
    vm: &mut Vm,
    table: &mut Table,
    variant: Variant,
    name: &str,
    arity: u8,
    func: NativeFn,
) {
    let name_ref = vm.heap.intern(name);
    let id = vm.natives.add(func);
    let native = Native {
        name: name_ref,
        arity,
        id,
    };
    let object = vm.heap.allocate(match variant {
        Variant::Function => Object::NativeFunction(native),
        Variant::Method => Object::NativeMethod(native),
        Variant::InfallibleFunction => Object::NativeInfallibleFunction(native),
        Variant::InfallibleMethod => Object::NativeInfallibleMethod(native),
    });
    let hash = vm.heap.string(name_ref).hash;
    table.set(hash, Value::Obj(name_ref), Value::Obj(object));
}

fn native_module(vm: &mut Vm, name: &str, build: fn(&mut Vm, &mut Table)) -> NativeModule {
    let name_ref = vm.heap.intern(name);
    let mut table = Table::new();
    build(vm, &mut table);
    NativeModule {
        name: name_ref,
        table,
    }
}

/// Builds the VM-wide registries: native modules and type method tables.
pub(crate) fn install(vm: &mut Vm) {
    let modules = vec![
        native_module(vm, "math", math::build),
        native_module(vm, "io", io::build),
        native_module(vm, "fs", fs::build),
        native_module(vm, "time", time::build),
        native_module(vm, "random", random::build),
        native_module(vm, "sys", sys::build),
        native_module(vm, "vectors", vectors::build),
    ];
    vm.native_modules = modules;

    let mut methods = TypeMethods::default();
    string::build_methods(vm, &mut methods.string);
    array::build_methods(vm, &mut methods.array);
    table::build_methods(vm, &mut methods.table);
    error::build_error_methods(vm, &mut methods.error);
    error::build_result_methods(vm, &mut methods.result);
    random::build_methods(vm, &mut methods.random);
    fs::build_file_methods(vm, &mut methods.file);
    vectors::build_vec2_methods(vm, &mut methods.vec2);
    vectors::build_vec3_methods(vm, &mut methods.vec3);
    vm.methods = methods;
}

/// Installs the core functions into one module's globals. Runs once per
/// module, before its top-level code.
pub(crate) fn install_core(vm: &mut Vm, module: ObjRef) {
    let mut table = Table::new();
    core::build(vm, &mut table);
    for (key, value) in collect_entries(&table) {
        let hash = vm
            .heap
            .hash_value(key)
            .expect("native names are strings");
        vm.heap.module_mut(module).globals.set(hash, key, value);
    }
}

fn collect_entries(table: &Table) -> Vec<(Value, Value)> {
    table.iter().collect()
}

// --- shared argument helpers -----------------------------------------------

/// Numeric view of an argument, for natives that accept int or float.
pub(crate) fn number_arg(value: Value) -> Option<f64> {
    value.as_f64()
}

pub(crate) fn string_arg(vm: &Vm, value: Value) -> Option<String> {
    match value {
        Value::Obj(r) => match vm.heap.get(r) {
            Object::String(s) => Some(s.chars.to_string()),
            _ => None,
        },
        _ => None,
    }
}

/// Int result when the float is exactly representable, float otherwise.
pub(crate) fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f >= f64::from(i32::MIN) && f <= f64::from(i32::MAX) {
        Value::Int(f as i32)
    } else {
        Value::Float(f)
    }
}
