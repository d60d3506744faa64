//! `crux:math` natives.

use crux_core::object::ErrorKind;
use crux_core::{Table, Value};

use super::{Variant, define, number_arg, number_value};
use crate::vm::Vm;

pub(crate) fn build(vm: &mut Vm, table: &mut Table) {
    define(vm, table, Variant::Function, "pow", 2, pow);
    define(vm, table, Variant::Function, "sqrt", 1, sqrt);
    define(vm, table, Variant::Function, "abs", 1, abs);
    define(vm, table, Variant::Function, "floor", 1, floor);
    define(vm, table, Variant::Function, "ceil", 1, ceil);
    define(vm, table, Variant::Function, "round", 1, round);
    define(vm, table, Variant::Function, "sin", 1, sin);
    define(vm, table, Variant::Function, "cos", 1, cos);
    define(vm, table, Variant::Function, "tan", 1, tan);
    define(vm, table, Variant::Function, "asin", 1, asin);
    define(vm, table, Variant::Function, "acos", 1, acos);
    define(vm, table, Variant::Function, "atan", 1, atan);
    define(vm, table, Variant::Function, "exp", 1, exp);
    define(vm, table, Variant::Function, "ln", 1, ln);
    define(vm, table, Variant::Function, "log", 1, log10);
    define(vm, table, Variant::Function, "min", 2, min);
    define(vm, table, Variant::Function, "max", 2, max);
    define(vm, table, Variant::InfallibleFunction, "pi", 0, pi);
    define(vm, table, Variant::InfallibleFunction, "e", 0, e);
}

fn unary(vm: &mut Vm, args: &[Value], f: fn(f64) -> f64) -> Value {
    match number_arg(args[0]) {
        Some(x) => vm.ok_result(Value::Float(f(x))),
        None => {
            let message = vm.type_error_message(args[0], "'int' or 'float'");
            vm.err_result(ErrorKind::Type, &message)
        }
    }
}

fn pow(vm: &mut Vm, args: &[Value]) -> Value {
    match (number_arg(args[0]), number_arg(args[1])) {
        (Some(base), Some(exponent)) => vm.ok_result(Value::Float(base.powf(exponent))),
        _ => vm.err_result(ErrorKind::Type, "Both arguments must be numbers."),
    }
}

fn sqrt(vm: &mut Vm, args: &[Value]) -> Value {
    match number_arg(args[0]) {
        Some(x) if x < 0.0 => vm.err_result(
            ErrorKind::Math,
            "Cannot take the square root of a negative number.",
        ),
        Some(x) => vm.ok_result(Value::Float(x.sqrt())),
        None => {
            let message = vm.type_error_message(args[0], "'int' or 'float'");
            vm.err_result(ErrorKind::Type, &message)
        }
    }
}

fn abs(vm: &mut Vm, args: &[Value]) -> Value {
    match args[0] {
        Value::Int(i) => {
            if i == i32::MIN {
                vm.ok_result(Value::Float(-(f64::from(i32::MIN))))
            } else {
                vm.ok_result(Value::Int(i.abs()))
            }
        }
        Value::Float(f) => vm.ok_result(Value::Float(f.abs())),
        other => {
            let message = vm.type_error_message(other, "'int' or 'float'");
            vm.err_result(ErrorKind::Type, &message)
        }
    }
}

fn rounding(vm: &mut Vm, args: &[Value], f: fn(f64) -> f64) -> Value {
    match number_arg(args[0]) {
        Some(x) => vm.ok_result(number_value(f(x))),
        None => {
            let message = vm.type_error_message(args[0], "'int' or 'float'");
            vm.err_result(ErrorKind::Type, &message)
        }
    }
}

fn floor(vm: &mut Vm, args: &[Value]) -> Value {
    rounding(vm, args, f64::floor)
}

fn ceil(vm: &mut Vm, args: &[Value]) -> Value {
    rounding(vm, args, f64::ceil)
}

fn round(vm: &mut Vm, args: &[Value]) -> Value {
    rounding(vm, args, f64::round)
}

fn sin(vm: &mut Vm, args: &[Value]) -> Value {
    unary(vm, args, f64::sin)
}

fn cos(vm: &mut Vm, args: &[Value]) -> Value {
    unary(vm, args, f64::cos)
}

fn tan(vm: &mut Vm, args: &[Value]) -> Value {
    unary(vm, args, f64::tan)
}

fn asin(vm: &mut Vm, args: &[Value]) -> Value {
    unary(vm, args, f64::asin)
}

fn acos(vm: &mut Vm, args: &[Value]) -> Value {
    unary(vm, args, f64::acos)
}

fn atan(vm: &mut Vm, args: &[Value]) -> Value {
    unary(vm, args, f64::atan)
}

fn exp(vm: &mut Vm, args: &[Value]) -> Value {
    unary(vm, args, f64::exp)
}

fn ln(vm: &mut Vm, args: &[Value]) -> Value {
    match number_arg(args[0]) {
        Some(x) if x <= 0.0 => {
            vm.err_result(ErrorKind::Math, "Logarithm argument must be positive.")
        }
        Some(x) => vm.ok_result(Value::Float(x.ln())),
        None => {
            let message = vm.type_error_message(args[0], "'int' or 'float'");
            vm.err_result(ErrorKind::Type, &message)
        }
    }
}

fn log10(vm: &mut Vm, args: &[Value]) -> Value {
    match number_arg(args[0]) {
        Some(x) if x <= 0.0 => {
            vm.err_result(ErrorKind::Math, "Logarithm argument must be positive.")
        }
        Some(x) => vm.ok_result(Value::Float(x.log10())),
        None => {
            let message = vm.type_error_message(args[0], "'int' or 'float'");
            vm.err_result(ErrorKind::Type, &message)
        }
    }
}

fn min(vm: &mut Vm, args: &[Value]) -> Value {
    match (number_arg(args[0]), number_arg(args[1])) {
        (Some(a), Some(b)) => {
            let keep = if a <= b { args[0] } else { args[1] };
            vm.ok_result(keep)
        }
        _ => vm.err_result(ErrorKind::Type, "Both arguments must be numbers."),
    }
}

fn max(vm: &mut Vm, args: &[Value]) -> Value {
    match (number_arg(args[0]), number_arg(args[1])) {
        (Some(a), Some(b)) => {
            let keep = if a >= b { args[0] } else { args[1] };
            vm.ok_result(keep)
        }
        _ => vm.err_result(ErrorKind::Type, "Both arguments must be numbers."),
    }
}

fn pi(_vm: &mut Vm, _args: &[Value]) -> Value {
    Value::Float(std::f64::consts::PI)
}

fn e(_vm: &mut Vm, _args: &[Value]) -> Value {
    Value::Float(std::f64::consts::E)
}
