//! `crux:vectors` natives and the vec2/vec3 method tables.
//!
//! Scalar and vector arguments accept int or float. Operations that divide
//! by a magnitude (`divide`, `normalize`, `angle_between`, `reflect`) fail
//! with a `MATH` error when the divisor is within `EPSILON` of zero, and
//! `equals` compares componentwise within the same tolerance.

use crux_core::object::{ErrorKind, Object, Vec2, Vec3};
use crux_core::{Table, Value};

use super::{Variant, define, number_arg};
use crate::vm::Vm;

const EPSILON: f64 = 1e-10;

pub(crate) fn build(vm: &mut Vm, table: &mut Table) {
    define(vm, table, Variant::Function, "vec2", 2, vec2_new);
    define(vm, table, Variant::Function, "vec3", 3, vec3_new);
}

pub(crate) fn build_vec2_methods(vm: &mut Vm, table: &mut Table) {
    define(vm, table, Variant::InfallibleMethod, "x", 1, vec_x);
    define(vm, table, Variant::InfallibleMethod, "y", 1, vec_y);
    define(vm, table, Variant::InfallibleMethod, "length", 1, vec_length);
    define(vm, table, Variant::Method, "angle", 1, vec2_angle);
    define(vm, table, Variant::Method, "normalize", 1, vec_normalize);
    define(vm, table, Variant::Method, "equals", 2, vec_equals);
    define(vm, table, Variant::Method, "dot", 2, vec_dot);
    define(vm, table, Variant::Method, "add", 2, vec_add);
    define(vm, table, Variant::Method, "sub", 2, vec_sub);
    define(vm, table, Variant::Method, "multiply", 2, vec_multiply);
    define(vm, table, Variant::Method, "divide", 2, vec_divide);
    define(vm, table, Variant::Method, "distance", 2, vec_distance);
    define(vm, table, Variant::Method, "angle_between", 2, vec_angle_between);
    define(vm, table, Variant::Method, "rotate", 2, vec2_rotate);
    define(vm, table, Variant::Method, "reflect", 2, vec_reflect);
    define(vm, table, Variant::Method, "lerp", 3, vec_lerp);
}

pub(crate) fn build_vec3_methods(vm: &mut Vm, table: &mut Table) {
    define(vm, table, Variant::InfallibleMethod, "x", 1, vec_x);
    define(vm, table, Variant::InfallibleMethod, "y", 1, vec_y);
    define(vm, table, Variant::InfallibleMethod, "z", 1, vec_z);
    define(vm, table, Variant::InfallibleMethod, "length", 1, vec_length);
    define(vm, table, Variant::Method, "normalize", 1, vec_normalize);
    define(vm, table, Variant::Method, "equals", 2, vec_equals);
    define(vm, table, Variant::Method, "dot", 2, vec_dot);
    define(vm, table, Variant::Method, "add", 2, vec_add);
    define(vm, table, Variant::Method, "sub", 2, vec_sub);
    define(vm, table, Variant::Method, "multiply", 2, vec_multiply);
    define(vm, table, Variant::Method, "divide", 2, vec_divide);
    define(vm, table, Variant::Method, "distance", 2, vec_distance);
    define(vm, table, Variant::Method, "cross", 2, vec3_cross);
    define(vm, table, Variant::Method, "angle_between", 2, vec_angle_between);
    define(vm, table, Variant::Method, "reflect", 2, vec_reflect);
    define(vm, table, Variant::Method, "lerp", 3, vec_lerp);
}

#[derive(Debug, Clone, Copy)]
enum Vec23 {
    Two(Vec2),
    Three(Vec3),
}

impl Vec23 {
    fn length(self) -> f64 {
        match self {
            Vec23::Two(v) => (v.x * v.x + v.y * v.y).sqrt(),
            Vec23::Three(v) => (v.x * v.x + v.y * v.y + v.z * v.z).sqrt(),
        }
    }
}

fn vec_of(vm: &Vm, value: Value) -> Option<Vec23> {
    match value.as_obj().map(|r| vm.heap.get(r)) {
        Some(Object::Vec2(v)) => Some(Vec23::Two(*v)),
        Some(Object::Vec3(v)) => Some(Vec23::Three(*v)),
        _ => None,
    }
}

/// Wraps a freshly built vector in `Ok(...)`; one safepoint covers both
/// allocations.
fn ok_vec2(vm: &mut Vm, x: f64, y: f64) -> Value {
    vm.maybe_collect();
    let vec = vm.heap.allocate(Object::Vec2(Vec2 { x, y }));
    let ok = vm
        .heap
        .allocate(Object::Result(crux_core::object::ResultObj::Ok(Value::Obj(
            vec,
        ))));
    Value::Obj(ok)
}

fn ok_vec3(vm: &mut Vm, x: f64, y: f64, z: f64) -> Value {
    vm.maybe_collect();
    let vec = vm.heap.allocate(Object::Vec3(Vec3 { x, y, z }));
    let ok = vm
        .heap
        .allocate(Object::Result(crux_core::object::ResultObj::Ok(Value::Obj(
            vec,
        ))));
    Value::Obj(ok)
}

fn vec2_new(vm: &mut Vm, args: &[Value]) -> Value {
    match (number_arg(args[0]), number_arg(args[1])) {
        (Some(x), Some(y)) => ok_vec2(vm, x, y),
        _ => vm.err_result(ErrorKind::Type, "Vector components must be numbers."),
    }
}

fn vec3_new(vm: &mut Vm, args: &[Value]) -> Value {
    match (
        number_arg(args[0]),
        number_arg(args[1]),
        number_arg(args[2]),
    ) {
        (Some(x), Some(y), Some(z)) => ok_vec3(vm, x, y, z),
        _ => vm.err_result(ErrorKind::Type, "Vector components must be numbers."),
    }
}

fn vec_x(vm: &mut Vm, args: &[Value]) -> Value {
    match vec_of(vm, args[0]) {
        Some(Vec23::Two(v)) => Value::Float(v.x),
        Some(Vec23::Three(v)) => Value::Float(v.x),
        None => Value::Nil,
    }
}

fn vec_y(vm: &mut Vm, args: &[Value]) -> Value {
    match vec_of(vm, args[0]) {
        Some(Vec23::Two(v)) => Value::Float(v.y),
        Some(Vec23::Three(v)) => Value::Float(v.y),
        None => Value::Nil,
    }
}

fn vec_z(vm: &mut Vm, args: &[Value]) -> Value {
    match vec_of(vm, args[0]) {
        Some(Vec23::Three(v)) => Value::Float(v.z),
        _ => Value::Nil,
    }
}

fn vec_length(vm: &mut Vm, args: &[Value]) -> Value {
    match vec_of(vm, args[0]) {
        Some(vec) => Value::Float(vec.length()),
        None => Value::Nil,
    }
}

/// The direction of a vec2 as atan2(y, x).
fn vec2_angle(vm: &mut Vm, args: &[Value]) -> Value {
    match vec_of(vm, args[0]) {
        Some(Vec23::Two(v)) => vm.ok_result(Value::Float(v.y.atan2(v.x))),
        _ => vm.err_result(ErrorKind::Type, "Receiver must be a 'vec2'."),
    }
}

fn vec_normalize(vm: &mut Vm, args: &[Value]) -> Value {
    let Some(vec) = vec_of(vm, args[0]) else {
        return vm.err_result(ErrorKind::Type, "Receiver must be a vector.");
    };
    let magnitude = vec.length();
    if magnitude.abs() < EPSILON {
        return vm.err_result(ErrorKind::Math, "Cannot normalize a zero vector.");
    }
    match vec {
        Vec23::Two(v) => ok_vec2(vm, v.x / magnitude, v.y / magnitude),
        Vec23::Three(v) => ok_vec3(vm, v.x / magnitude, v.y / magnitude, v.z / magnitude),
    }
}

fn vec_equals(vm: &mut Vm, args: &[Value]) -> Value {
    match (vec_of(vm, args[0]), vec_of(vm, args[1])) {
        (Some(Vec23::Two(a)), Some(Vec23::Two(b))) => {
            let equal = (a.x - b.x).abs() < EPSILON && (a.y - b.y).abs() < EPSILON;
            vm.ok_result(Value::Bool(equal))
        }
        (Some(Vec23::Three(a)), Some(Vec23::Three(b))) => {
            let equal = (a.x - b.x).abs() < EPSILON
                && (a.y - b.y).abs() < EPSILON
                && (a.z - b.z).abs() < EPSILON;
            vm.ok_result(Value::Bool(equal))
        }
        _ => vm.err_result(ErrorKind::Type, "Expected two vectors of the same size."),
    }
}

fn vec_dot(vm: &mut Vm, args: &[Value]) -> Value {
    match (vec_of(vm, args[0]), vec_of(vm, args[1])) {
        (Some(Vec23::Two(a)), Some(Vec23::Two(b))) => {
            vm.ok_result(Value::Float(a.x * b.x + a.y * b.y))
        }
        (Some(Vec23::Three(a)), Some(Vec23::Three(b))) => {
            vm.ok_result(Value::Float(a.x * b.x + a.y * b.y + a.z * b.z))
        }
        _ => vm.err_result(ErrorKind::Type, "Dot product requires two vectors of the same size."),
    }
}

fn vec_combine(vm: &mut Vm, args: &[Value], sign: f64) -> Value {
    match (vec_of(vm, args[0]), vec_of(vm, args[1])) {
        (Some(Vec23::Two(a)), Some(Vec23::Two(b))) => {
            ok_vec2(vm, a.x + sign * b.x, a.y + sign * b.y)
        }
        (Some(Vec23::Three(a)), Some(Vec23::Three(b))) => {
            ok_vec3(vm, a.x + sign * b.x, a.y + sign * b.y, a.z + sign * b.z)
        }
        _ => vm.err_result(ErrorKind::Type, "Expected two vectors of the same size."),
    }
}

fn vec_add(vm: &mut Vm, args: &[Value]) -> Value {
    vec_combine(vm, args, 1.0)
}

fn vec_sub(vm: &mut Vm, args: &[Value]) -> Value {
    vec_combine(vm, args, -1.0)
}

fn vec_multiply(vm: &mut Vm, args: &[Value]) -> Value {
    let Some(scalar) = number_arg(args[1]) else {
        return vm.err_result(ErrorKind::Type, "Scalar must be a number.");
    };
    match vec_of(vm, args[0]) {
        Some(Vec23::Two(v)) => ok_vec2(vm, v.x * scalar, v.y * scalar),
        Some(Vec23::Three(v)) => ok_vec3(vm, v.x * scalar, v.y * scalar, v.z * scalar),
        None => vm.err_result(ErrorKind::Type, "Receiver must be a vector."),
    }
}

fn vec_divide(vm: &mut Vm, args: &[Value]) -> Value {
    let Some(scalar) = number_arg(args[1]) else {
        return vm.err_result(ErrorKind::Type, "Scalar must be a number.");
    };
    if scalar.abs() < EPSILON {
        return vm.err_result(ErrorKind::Math, "Cannot divide by zero.");
    }
    match vec_of(vm, args[0]) {
        Some(Vec23::Two(v)) => ok_vec2(vm, v.x / scalar, v.y / scalar),
        Some(Vec23::Three(v)) => ok_vec3(vm, v.x / scalar, v.y / scalar, v.z / scalar),
        None => vm.err_result(ErrorKind::Type, "Receiver must be a vector."),
    }
}

fn vec_distance(vm: &mut Vm, args: &[Value]) -> Value {
    match (vec_of(vm, args[0]), vec_of(vm, args[1])) {
        (Some(Vec23::Two(a)), Some(Vec23::Two(b))) => {
            let dx = a.x - b.x;
            let dy = a.y - b.y;
            vm.ok_result(Value::Float((dx * dx + dy * dy).sqrt()))
        }
        (Some(Vec23::Three(a)), Some(Vec23::Three(b))) => {
            let dx = a.x - b.x;
            let dy = a.y - b.y;
            let dz = a.z - b.z;
            vm.ok_result(Value::Float((dx * dx + dy * dy + dz * dz).sqrt()))
        }
        _ => vm.err_result(ErrorKind::Type, "Expected two vectors of the same size."),
    }
}

fn vec_angle_between(vm: &mut Vm, args: &[Value]) -> Value {
    let (dot, mag1, mag2) = match (vec_of(vm, args[0]), vec_of(vm, args[1])) {
        (Some(a @ Vec23::Two(v1)), Some(b @ Vec23::Two(v2))) => {
            (v1.x * v2.x + v1.y * v2.y, a.length(), b.length())
        }
        (Some(a @ Vec23::Three(v1)), Some(b @ Vec23::Three(v2))) => (
            v1.x * v2.x + v1.y * v2.y + v1.z * v2.z,
            a.length(),
            b.length(),
        ),
        _ => {
            return vm.err_result(
                ErrorKind::Type,
                "Expected two vectors of the same size.",
            );
        }
    };
    if mag1.abs() < EPSILON || mag2.abs() < EPSILON {
        return vm.err_result(ErrorKind::Math, "Cannot calculate angle with zero vector.");
    }
    // Clamp to [-1, 1] before acos; rounding can push the cosine outside.
    let cos_theta = (dot / (mag1 * mag2)).clamp(-1.0, 1.0);
    vm.ok_result(Value::Float(cos_theta.acos()))
}

/// Rotates a vec2 by an angle in radians.
fn vec2_rotate(vm: &mut Vm, args: &[Value]) -> Value {
    let Some(angle) = number_arg(args[1]) else {
        return vm.err_result(ErrorKind::Type, "Rotation angle must be a number.");
    };
    match vec_of(vm, args[0]) {
        Some(Vec23::Two(v)) => {
            let (sin, cos) = angle.sin_cos();
            ok_vec2(vm, v.x * cos - v.y * sin, v.x * sin + v.y * cos)
        }
        _ => vm.err_result(ErrorKind::Type, "Receiver must be a 'vec2'."),
    }
}

/// Reflects the receiver about `normal`: i - 2(i·n̂)n̂.
fn vec_reflect(vm: &mut Vm, args: &[Value]) -> Value {
    match (vec_of(vm, args[0]), vec_of(vm, args[1])) {
        (Some(Vec23::Two(incident)), Some(normal @ Vec23::Two(n))) => {
            let magnitude = normal.length();
            if magnitude.abs() < EPSILON {
                return vm
                    .err_result(ErrorKind::Math, "Cannot reflect with zero normal vector.");
            }
            let nx = n.x / magnitude;
            let ny = n.y / magnitude;
            let dot = incident.x * nx + incident.y * ny;
            ok_vec2(vm, incident.x - 2.0 * dot * nx, incident.y - 2.0 * dot * ny)
        }
        (Some(Vec23::Three(incident)), Some(normal @ Vec23::Three(n))) => {
            let magnitude = normal.length();
            if magnitude.abs() < EPSILON {
                return vm
                    .err_result(ErrorKind::Math, "Cannot reflect with zero normal vector.");
            }
            let nx = n.x / magnitude;
            let ny = n.y / magnitude;
            let nz = n.z / magnitude;
            let dot = incident.x * nx + incident.y * ny + incident.z * nz;
            ok_vec3(
                vm,
                incident.x - 2.0 * dot * nx,
                incident.y - 2.0 * dot * ny,
                incident.z - 2.0 * dot * nz,
            )
        }
        _ => vm.err_result(ErrorKind::Type, "Expected two vectors of the same size."),
    }
}

/// Componentwise interpolation from the receiver towards `other` by `t`.
fn vec_lerp(vm: &mut Vm, args: &[Value]) -> Value {
    let Some(t) = number_arg(args[2]) else {
        return vm.err_result(
            ErrorKind::Type,
            "Interpolation factor must be a number.",
        );
    };
    match (vec_of(vm, args[0]), vec_of(vm, args[1])) {
        (Some(Vec23::Two(a)), Some(Vec23::Two(b))) => {
            ok_vec2(vm, a.x + t * (b.x - a.x), a.y + t * (b.y - a.y))
        }
        (Some(Vec23::Three(a)), Some(Vec23::Three(b))) => ok_vec3(
            vm,
            a.x + t * (b.x - a.x),
            a.y + t * (b.y - a.y),
            a.z + t * (b.z - a.z),
        ),
        _ => vm.err_result(ErrorKind::Type, "Expected two vectors of the same size."),
    }
}

fn vec3_cross(vm: &mut Vm, args: &[Value]) -> Value {
    match (vec_of(vm, args[0]), vec_of(vm, args[1])) {
        (Some(Vec23::Three(a)), Some(Vec23::Three(b))) => ok_vec3(
            vm,
            a.y * b.z - a.z * b.y,
            a.z * b.x - a.x * b.z,
            a.x * b.y - a.y * b.x,
        ),
        _ => vm.err_result(
            ErrorKind::Type,
            "Cross product requires two 'vec3' values.",
        ),
    }
}
