//! `crux:fs` natives and the file method table.

use std::fs::OpenOptions;
use std::io::{Read, Write};

use crux_core::object::{ErrorKind, FileObj, Object};
use crux_core::{ObjRef, Table, Value};

use super::{Variant, define, string_arg};
use crate::vm::Vm;

pub(crate) fn build(vm: &mut Vm, table: &mut Table) {
    define(vm, table, Variant::Function, "open_file", 2, open_file);
    define(vm, table, Variant::Function, "read_to_string", 1, read_to_string);
    define(vm, table, Variant::Function, "write_string", 2, write_string);
    define(vm, table, Variant::InfallibleFunction, "exists", 1, exists);
}

pub(crate) fn build_file_methods(vm: &mut Vm, table: &mut Table) {
    define(vm, table, Variant::Method, "readln", 1, file_readln);
    define(vm, table, Variant::Method, "read_all", 1, file_read_all);
    define(vm, table, Variant::Method, "write", 2, file_write);
    define(vm, table, Variant::Method, "writeln", 2, file_writeln);
    define(vm, table, Variant::Method, "close", 1, file_close);
}

fn open_file(vm: &mut Vm, args: &[Value]) -> Value {
    let Some(path) = string_arg(vm, args[0]) else {
        return vm.err_result(ErrorKind::Type, "File path must be a string.");
    };
    let Some(mode) = string_arg(vm, args[1]) else {
        return vm.err_result(ErrorKind::Type, "File mode must be a string.");
    };

    let mut options = OpenOptions::new();
    match mode.as_str() {
        "r" => options.read(true),
        "w" => options.write(true).create(true).truncate(true),
        "a" => options.append(true).create(true),
        "rw" => options.read(true).write(true).create(true),
        _ => {
            return vm.err_result(
                ErrorKind::Value,
                "File mode must be 'r', 'w', 'a' or 'rw'.",
            );
        }
    };

    match options.open(&path) {
        Ok(handle) => {
            vm.maybe_collect();
            let path = vm.heap.intern(&path);
            let mode = vm.heap.intern(&mode);
            let file = vm.heap.allocate(Object::File(FileObj {
                path,
                mode,
                handle: Some(handle),
                is_open: true,
                position: 0,
            }));
            let ok = vm
                .heap
                .allocate(Object::Result(crux_core::object::ResultObj::Ok(Value::Obj(
                    file,
                ))));
            Value::Obj(ok)
        }
        Err(e) => {
            let message = format!("Could not open \"{}\": {}.", path, e);
            vm.err_result(ErrorKind::Io, &message)
        }
    }
}

fn read_to_string(vm: &mut Vm, args: &[Value]) -> Value {
    let Some(path) = string_arg(vm, args[0]) else {
        return vm.err_result(ErrorKind::Type, "File path must be a string.");
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            vm.maybe_collect();
            let string = vm.heap.intern_owned(contents);
            let ok = vm
                .heap
                .allocate(Object::Result(crux_core::object::ResultObj::Ok(Value::Obj(
                    string,
                ))));
            Value::Obj(ok)
        }
        Err(e) => {
            let message = format!("Could not read \"{}\": {}.", path, e);
            vm.err_result(ErrorKind::Io, &message)
        }
    }
}

fn write_string(vm: &mut Vm, args: &[Value]) -> Value {
    let Some(path) = string_arg(vm, args[0]) else {
        return vm.err_result(ErrorKind::Type, "File path must be a string.");
    };
    let text = vm.to_display_string(args[1]);
    match std::fs::write(&path, text) {
        Ok(()) => vm.ok_result(Value::Nil),
        Err(e) => {
            let message = format!("Could not write \"{}\": {}.", path, e);
            vm.err_result(ErrorKind::Io, &message)
        }
    }
}

fn exists(vm: &mut Vm, args: &[Value]) -> Value {
    match string_arg(vm, args[0]) {
        Some(path) => Value::Bool(std::path::Path::new(&path).exists()),
        None => Value::Bool(false),
    }
}

// --- file methods -----------------------------------------------------------

fn file_receiver(vm: &mut Vm, value: Value) -> Result<ObjRef, Value> {
    match value.as_obj() {
        Some(r) if matches!(vm.heap.get(r), Object::File(_)) => Ok(r),
        _ => Err(vm.err_result(ErrorKind::Type, "Receiver must be a 'file'.")),
    }
}

/// Borrows the OS handle out of the file object for the duration of an I/O
/// operation. Returns an error result value if the file is closed.
fn take_handle(vm: &mut Vm, file: ObjRef) -> Result<std::fs::File, Value> {
    let handle = match vm.heap.get_mut(file) {
        Object::File(f) if f.is_open => f.handle.take(),
        _ => None,
    };
    match handle {
        Some(handle) => Ok(handle),
        None => Err(vm.err_result(ErrorKind::Io, "File is not open.")),
    }
}

fn restore_handle(vm: &mut Vm, file: ObjRef, handle: std::fs::File, position: u64) {
    if let Object::File(f) = vm.heap.get_mut(file) {
        f.handle = Some(handle);
        f.position = position;
    }
}

fn file_readln(vm: &mut Vm, args: &[Value]) -> Value {
    let file = match file_receiver(vm, args[0]) {
        Ok(file) => file,
        Err(result) => return result,
    };
    let mut handle = match take_handle(vm, file) {
        Ok(handle) => handle,
        Err(result) => return result,
    };
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    let mut read_any = false;
    let outcome = loop {
        match handle.read(&mut byte) {
            Ok(0) => break Ok(read_any),
            Ok(_) => {
                read_any = true;
                if byte[0] == b'\n' {
                    break Ok(true);
                }
                line.push(byte[0]);
            }
            Err(e) => break Err(e),
        }
    };
    let position = position_of(&mut handle);
    restore_handle(vm, file, handle, position);

    match outcome {
        Ok(true) => {
            let text = String::from_utf8_lossy(&line).into_owned();
            vm.maybe_collect();
            let string = vm.heap.intern_owned(text);
            let ok = vm
                .heap
                .allocate(Object::Result(crux_core::object::ResultObj::Ok(Value::Obj(
                    string,
                ))));
            Value::Obj(ok)
        }
        Ok(false) => vm.err_result(ErrorKind::Io, "End of file."),
        Err(e) => {
            let message = format!("Read failed: {}.", e);
            vm.err_result(ErrorKind::Io, &message)
        }
    }
}

fn file_read_all(vm: &mut Vm, args: &[Value]) -> Value {
    let file = match file_receiver(vm, args[0]) {
        Ok(file) => file,
        Err(result) => return result,
    };
    let mut handle = match take_handle(vm, file) {
        Ok(handle) => handle,
        Err(result) => return result,
    };
    let mut contents = String::new();
    let outcome = handle.read_to_string(&mut contents);
    let position = position_of(&mut handle);
    restore_handle(vm, file, handle, position);

    match outcome {
        Ok(_) => {
            vm.maybe_collect();
            let string = vm.heap.intern_owned(contents);
            let ok = vm
                .heap
                .allocate(Object::Result(crux_core::object::ResultObj::Ok(Value::Obj(
                    string,
                ))));
            Value::Obj(ok)
        }
        Err(e) => {
            let message = format!("Read failed: {}.", e);
            vm.err_result(ErrorKind::Io, &message)
        }
    }
}

fn write_impl(vm: &mut Vm, args: &[Value], newline: bool) -> Value {
    let file = match file_receiver(vm, args[0]) {
        Ok(file) => file,
        Err(result) => return result,
    };
    let mut text = vm.to_display_string(args[1]);
    if newline {
        text.push('\n');
    }
    let mut handle = match take_handle(vm, file) {
        Ok(handle) => handle,
        Err(result) => return result,
    };
    let outcome = handle.write_all(text.as_bytes());
    let position = position_of(&mut handle);
    restore_handle(vm, file, handle, position);

    match outcome {
        Ok(()) => vm.ok_result(Value::Int(text.len() as i32)),
        Err(e) => {
            let message = format!("Write failed: {}.", e);
            vm.err_result(ErrorKind::Io, &message)
        }
    }
}

fn file_write(vm: &mut Vm, args: &[Value]) -> Value {
    write_impl(vm, args, false)
}

fn file_writeln(vm: &mut Vm, args: &[Value]) -> Value {
    write_impl(vm, args, true)
}

fn file_close(vm: &mut Vm, args: &[Value]) -> Value {
    let file = match file_receiver(vm, args[0]) {
        Ok(file) => file,
        Err(result) => return result,
    };
    let was_open = match vm.heap.get_mut(file) {
        Object::File(f) => {
            let was_open = f.is_open;
            f.handle = None; // dropping the handle closes it
            f.is_open = false;
            was_open
        }
        _ => false,
    };
    if was_open {
        vm.ok_result(Value::Nil)
    } else {
        vm.err_result(ErrorKind::Io, "File already closed.")
    }
}

fn position_of(handle: &mut std::fs::File) -> u64 {
    use std::io::Seek;
    handle.stream_position().unwrap_or(0)
}
