//! `crux:time` natives.

use std::time::{SystemTime, UNIX_EPOCH};

use crux_core::object::ErrorKind;
use crux_core::{Table, Value};

use super::{Variant, define, number_arg};
use crate::vm::Vm;

pub(crate) fn build(vm: &mut Vm, table: &mut Table) {
    define(vm, table, Variant::InfallibleFunction, "now_s", 0, now_s);
    define(vm, table, Variant::InfallibleFunction, "now_ms", 0, now_ms);
    define(vm, table, Variant::Function, "sleep_ms", 1, sleep_ms);
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn now_s(_vm: &mut Vm, _args: &[Value]) -> Value {
    Value::Float(epoch_seconds())
}

fn now_ms(_vm: &mut Vm, _args: &[Value]) -> Value {
    Value::Float(epoch_seconds() * 1000.0)
}

fn sleep_ms(vm: &mut Vm, args: &[Value]) -> Value {
    match number_arg(args[0]) {
        Some(ms) if ms >= 0.0 => {
            std::thread::sleep(std::time::Duration::from_millis(ms as u64));
            vm.ok_result(Value::Nil)
        }
        Some(_) => vm.err_result(ErrorKind::Value, "Sleep duration cannot be negative."),
        None => vm.err_result(ErrorKind::Type, "Sleep duration must be a number."),
    }
}
