//! Human-readable rendering of values.
//!
//! `println` and string conversion both funnel through [`display_value`].
//! Strings print raw at the top level and quoted inside collections.

use crate::heap::{Heap, ObjRef};
use crate::object::{Object, ResultObj};
use crate::value::Value;

/// Collections are rendered recursively; self-referential structures are
/// cut off rather than looping.
const MAX_RENDER_DEPTH: usize = 16;

pub fn display_value(heap: &Heap, value: Value, in_collection: bool) -> String {
    render(heap, value, in_collection, 0)
}

fn render(heap: &Heap, value: Value, in_collection: bool, depth: usize) -> String {
    if depth > MAX_RENDER_DEPTH {
        return "...".to_string();
    }
    match value {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Obj(r) => render_object(heap, r, in_collection, depth),
    }
}

fn render_object(heap: &Heap, r: ObjRef, in_collection: bool, depth: usize) -> String {
    match heap.get(r) {
        Object::String(s) => {
            if in_collection {
                format!("\"{}\"", s.chars)
            } else {
                s.chars.to_string()
            }
        }
        Object::Function(f) => match f.name {
            Some(name) => format!("<fn {}>", heap.string_chars(name)),
            None => "<script>".to_string(),
        },
        Object::Closure(c) => render_object(heap, c.function, in_collection, depth),
        Object::Upvalue(_) => "<upvalue>".to_string(),
        Object::NativeFunction(n)
        | Object::NativeMethod(n)
        | Object::NativeInfallibleFunction(n)
        | Object::NativeInfallibleMethod(n) => {
            format!("<native fn {}>", heap.string_chars(n.name))
        }
        Object::Array(a) => {
            let items: Vec<String> = a
                .values
                .iter()
                .map(|&v| render(heap, v, true, depth + 1))
                .collect();
            format!("[{}]", items.join(", "))
        }
        Object::StaticArray(a) => {
            let items: Vec<String> = a
                .values
                .iter()
                .map(|&v| render(heap, v, true, depth + 1))
                .collect();
            format!("[{}]", items.join(", "))
        }
        Object::Table(t) | Object::StaticTable(t) => {
            let items: Vec<String> = t
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}: {}",
                        render(heap, k, true, depth + 1),
                        render(heap, v, true, depth + 1)
                    )
                })
                .collect();
            format!("{{{}}}", items.join(", "))
        }
        Object::Struct(s) => format!("<struct {}>", heap.string_chars(s.name)),
        Object::StructInstance(i) => {
            let name = match heap.get(i.struct_type) {
                Object::Struct(s) => heap.string_chars(s.name).to_string(),
                _ => "?".to_string(),
            };
            let fields: Vec<String> = i
                .fields
                .iter()
                .map(|&v| render(heap, v, true, depth + 1))
                .collect();
            format!("{} {{{}}}", name, fields.join(", "))
        }
        Object::Error(e) => format!("<error: {}>", heap.string_chars(e.message)),
        Object::Result(res) => match res {
            ResultObj::Ok(v) => format!("Ok({})", render(heap, *v, true, depth + 1)),
            ResultObj::Err(e) => format!("Err({})", render_object(heap, *e, true, depth + 1)),
        },
        Object::Random(_) => "<random>".to_string(),
        Object::File(f) => format!("<file {}>", heap.string_chars(f.path)),
        Object::Module(m) => match m.path {
            Some(path) => format!("<module {}>", heap.string_chars(path)),
            None => "<module>".to_string(),
        },
        Object::Vec2(v) => format!("vec2({}, {})", v.x, v.y),
        Object::Vec3(v) => format!("vec3({}, {}, {})", v.x, v.y, v.z),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Array;

    #[test]
    fn test_primitives() {
        let heap = Heap::new();
        assert_eq!(display_value(&heap, Value::Nil, false), "nil");
        assert_eq!(display_value(&heap, Value::Bool(true), false), "true");
        assert_eq!(display_value(&heap, Value::Int(-3), false), "-3");
        assert_eq!(display_value(&heap, Value::Float(1.5), false), "1.5");
    }

    #[test]
    fn test_strings_quote_only_inside_collections() {
        let mut heap = Heap::new();
        let s = heap.intern("hi");
        assert_eq!(display_value(&heap, Value::Obj(s), false), "hi");
        let array = heap.allocate(Object::Array(Array {
            values: vec![Value::Obj(s), Value::Int(1)],
        }));
        assert_eq!(display_value(&heap, Value::Obj(array), false), "[\"hi\", 1]");
    }
}
