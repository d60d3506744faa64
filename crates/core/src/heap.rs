//! The garbage-collected heap.
//!
//! A slot arena owns every runtime object; [`ObjRef`] handles are indices
//! into it. Collection is mark-sweep with an explicit gray worklist and is
//! precise: [`Heap::trace_references`] knows the layout of every variant.
//!
//! The heap does not decide *when* to collect — only the VM can see the full
//! root set (module chain, caches, method tables, match state), so it owns
//! the trigger and the root-marking pass. The heap provides the mechanism:
//! `mark_*`, `trace_references`, `sweep_interned`, `sweep`.
//!
//! Strings are interned: at most one live string object per distinct
//! content. The intern map shares the character buffer with the object
//! (`Rc<str>`), and is swept weakly before each sweep so it never keeps a
//! string alive on its own.

use std::collections::HashMap;
use std::rc::Rc;

use crate::object::{Object, StringObj, UpvalueSlot};
use crate::table::Table;
use crate::value::Value;

/// Handle to a heap object. Plain index; never dangles while the object is
/// reachable from a root, which is the collector's invariant to maintain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

impl ObjRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
enum Slot {
    Free { next: Option<u32> },
    Occupied { marked: bool, object: Object },
}

const FNV_OFFSET_BASIS: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

/// FNV-1a over a byte string.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Hash for numeric keys. Ints hash through their f64 image so that `1` and
/// `1.0` (which compare equal) land in the same bucket.
pub fn hash_f64_bits(f: f64) -> u32 {
    let f = if f == 0.0 { 0.0 } else { f }; // fold -0.0 into 0.0
    fnv1a(&f.to_bits().to_le_bytes())
}

const INITIAL_NEXT_GC: usize = 1024 * 1024;
const GC_HEAP_GROW_NUM: usize = 3;
const GC_HEAP_GROW_DEN: usize = 2; // 1.5

#[derive(Debug)]
pub struct Heap {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    /// Content → string object. Weak: swept before each collection sweep.
    strings: HashMap<Rc<str>, ObjRef>,
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Values kept alive across multi-step constructions (natives building
    /// several objects before any becomes stack-reachable).
    temp_roots: Vec<Value>,
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            slots: Vec::new(),
            free_head: None,
            strings: HashMap::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            temp_roots: Vec::new(),
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    pub fn live_objects(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Occupied { .. }))
            .count()
    }

    /// Places an object in a slot. Never collects; collection is driven by
    /// the VM, which knows the roots.
    pub fn allocate(&mut self, object: Object) -> ObjRef {
        self.bytes_allocated += object.size_estimate();
        match self.free_head {
            Some(index) => {
                let next = match self.slots[index as usize] {
                    Slot::Free { next } => next,
                    Slot::Occupied { .. } => None,
                };
                self.free_head = next;
                self.slots[index as usize] = Slot::Occupied {
                    marked: false,
                    object,
                };
                ObjRef(index)
            }
            None => {
                self.slots.push(Slot::Occupied {
                    marked: false,
                    object,
                });
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    // --- interning ---------------------------------------------------------

    /// Interns a copy of `chars`, returning the canonical string object.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        if let Some(&existing) = self.strings.get(chars) {
            return existing;
        }
        let rc: Rc<str> = Rc::from(chars);
        self.intern_rc(rc)
    }

    /// Interns an owned buffer, reusing it when no equal string exists.
    pub fn intern_owned(&mut self, chars: String) -> ObjRef {
        if let Some(&existing) = self.strings.get(chars.as_str()) {
            return existing;
        }
        let rc: Rc<str> = Rc::from(chars);
        self.intern_rc(rc)
    }

    fn intern_rc(&mut self, rc: Rc<str>) -> ObjRef {
        let hash = fnv1a(rc.as_bytes());
        let obj = self.allocate(Object::String(StringObj {
            chars: Rc::clone(&rc),
            hash,
        }));
        self.strings.insert(rc, obj);
        obj
    }

    pub fn interned_count(&self) -> usize {
        self.strings.len()
    }

    // --- accessors ---------------------------------------------------------

    pub fn get(&self, r: ObjRef) -> &Object {
        match &self.slots[r.index()] {
            Slot::Occupied { object, .. } => object,
            Slot::Free { .. } => panic!("use of freed heap slot {}", r.index()),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Object {
        match &mut self.slots[r.index()] {
            Slot::Occupied { object, .. } => object,
            Slot::Free { .. } => panic!("use of freed heap slot {}", r.index()),
        }
    }

    pub fn string(&self, r: ObjRef) -> &StringObj {
        match self.get(r) {
            Object::String(s) => s,
            other => panic!("expected string, found {}", other.type_name()),
        }
    }

    pub fn string_chars(&self, r: ObjRef) -> &str {
        &self.string(r).chars
    }

    pub fn function(&self, r: ObjRef) -> &crate::object::Function {
        match self.get(r) {
            Object::Function(f) => f,
            other => panic!("expected function, found {}", other.type_name()),
        }
    }

    pub fn function_mut(&mut self, r: ObjRef) -> &mut crate::object::Function {
        match self.get_mut(r) {
            Object::Function(f) => f,
            other => panic!("expected function, found {}", other.type_name()),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &crate::object::Closure {
        match self.get(r) {
            Object::Closure(c) => c,
            other => panic!("expected closure, found {}", other.type_name()),
        }
    }

    pub fn module(&self, r: ObjRef) -> &crate::object::ModuleRecord {
        match self.get(r) {
            Object::Module(m) => m,
            other => panic!("expected module record, found {}", other.type_name()),
        }
    }

    pub fn module_mut(&mut self, r: ObjRef) -> &mut crate::object::ModuleRecord {
        match self.get_mut(r) {
            Object::Module(m) => m,
            other => panic!("expected module record, found {}", other.type_name()),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &crate::object::Upvalue {
        match self.get(r) {
            Object::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.type_name()),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut crate::object::Upvalue {
        match self.get_mut(r) {
            Object::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.type_name()),
        }
    }

    // --- hashing -----------------------------------------------------------

    /// Hash for table keys. `None` means the value is not hashable
    /// (only nil, bools, numbers and strings are).
    pub fn hash_value(&self, value: Value) -> Option<u32> {
        match value {
            Value::Nil => Some(fnv1a(b"nil")),
            Value::Bool(true) => Some(fnv1a(b"true")),
            Value::Bool(false) => Some(fnv1a(b"false")),
            Value::Int(i) => Some(hash_f64_bits(f64::from(i))),
            Value::Float(f) => Some(hash_f64_bits(f)),
            Value::Obj(r) => match self.get(r) {
                Object::String(s) => Some(s.hash),
                _ => None,
            },
        }
    }

    // --- temp roots --------------------------------------------------------

    pub fn push_temp_root(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub fn pop_temp_root(&mut self) {
        self.temp_roots.pop();
    }

    // --- marking -----------------------------------------------------------

    pub fn is_marked(&self, r: ObjRef) -> bool {
        matches!(self.slots[r.index()], Slot::Occupied { marked: true, .. })
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        if let Slot::Occupied { marked, .. } = &mut self.slots[r.index()] {
            if !*marked {
                *marked = true;
                self.gray.push(r);
            }
        }
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_value(key);
            self.mark_value(value);
        }
    }

    pub fn mark_temp_roots(&mut self) {
        let roots: Vec<Value> = self.temp_roots.clone();
        for value in roots {
            self.mark_value(value);
        }
    }

    /// Drains the gray worklist, blackening each object by marking every
    /// object it references.
    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            let children = self.collect_refs(r);
            for child in children {
                self.mark_object(child);
            }
        }
    }

    fn collect_refs(&self, r: ObjRef) -> Vec<ObjRef> {
        let mut out = Vec::new();
        let mut push_value = |out: &mut Vec<ObjRef>, v: Value| {
            if let Value::Obj(child) = v {
                out.push(child);
            }
        };
        match self.get(r) {
            Object::String(_) | Object::Random(_) | Object::Vec2(_) | Object::Vec3(_) => {}
            Object::Function(f) => {
                if let Some(name) = f.name {
                    out.push(name);
                }
                if let Some(module) = f.module {
                    out.push(module);
                }
                for &constant in &f.chunk.constants {
                    push_value(&mut out, constant);
                }
            }
            Object::Closure(c) => {
                out.push(c.function);
                out.extend(c.upvalues.iter().copied());
            }
            Object::Upvalue(u) => {
                out.push(u.owner);
                if let UpvalueSlot::Closed(value) = u.slot {
                    push_value(&mut out, value);
                }
            }
            Object::NativeFunction(n)
            | Object::NativeMethod(n)
            | Object::NativeInfallibleFunction(n)
            | Object::NativeInfallibleMethod(n) => out.push(n.name),
            Object::Array(a) => {
                for &v in &a.values {
                    push_value(&mut out, v);
                }
            }
            Object::StaticArray(a) => {
                for &v in a.values.iter() {
                    push_value(&mut out, v);
                }
            }
            Object::Table(t) | Object::StaticTable(t) => {
                for (k, v) in t.iter() {
                    push_value(&mut out, k);
                    push_value(&mut out, v);
                }
            }
            Object::Struct(s) => {
                out.push(s.name);
                for (k, v) in s.fields.iter() {
                    push_value(&mut out, k);
                    push_value(&mut out, v);
                }
            }
            Object::StructInstance(i) => {
                out.push(i.struct_type);
                for &v in &i.fields {
                    push_value(&mut out, v);
                }
            }
            Object::Error(e) => out.push(e.message),
            Object::Result(res) => match res {
                crate::object::ResultObj::Ok(v) => push_value(&mut out, *v),
                crate::object::ResultObj::Err(e) => out.push(*e),
            },
            Object::File(f) => {
                out.push(f.path);
                out.push(f.mode);
            }
            Object::Module(m) => {
                if let Some(path) = m.path {
                    out.push(path);
                }
                if let Some(closure) = m.module_closure {
                    out.push(closure);
                }
                if let Some(enclosing) = m.enclosing_module {
                    out.push(enclosing);
                }
                for (k, v) in m.globals.iter().chain(m.publics.iter()) {
                    push_value(&mut out, k);
                    push_value(&mut out, v);
                }
                for &v in &m.stack {
                    push_value(&mut out, v);
                }
                for frame in &m.frames {
                    out.push(frame.closure);
                    out.push(frame.function);
                }
                let mut upvalue = m.open_upvalues;
                while let Some(u) = upvalue {
                    out.push(u);
                    upvalue = self.upvalue(u).next;
                }
            }
        }
        out
    }

    // --- sweeping ----------------------------------------------------------

    /// Drops unmarked strings from the intern map so interning alone never
    /// keeps a string alive. Must run after tracing, before `sweep`.
    pub fn sweep_interned(&mut self) {
        let slots = &self.slots;
        self.strings.retain(|_, r| {
            matches!(slots[r.index()], Slot::Occupied { marked: true, .. })
        });
    }

    /// Frees every unmarked object and clears marks on survivors.
    /// Returns (objects freed, bytes released).
    pub fn sweep(&mut self) -> (usize, usize) {
        let mut freed = 0usize;
        let mut freed_bytes = 0usize;
        for index in 0..self.slots.len() {
            let dead_size = match &mut self.slots[index] {
                Slot::Occupied { marked, object } => {
                    if *marked {
                        *marked = false;
                        None
                    } else {
                        Some(object.size_estimate())
                    }
                }
                Slot::Free { .. } => None,
            };
            if let Some(size) = dead_size {
                freed_bytes += size;
                freed += 1;
                self.slots[index] = Slot::Free {
                    next: self.free_head,
                };
                self.free_head = Some(index as u32);
            }
        }
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed_bytes);
        self.next_gc = (self.bytes_allocated * GC_HEAP_GROW_NUM / GC_HEAP_GROW_DEN)
            .max(INITIAL_NEXT_GC);
        (freed, freed_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Array;

    #[test]
    fn test_interning_deduplicates() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern_owned("hello".to_string());
        assert_eq!(a, b);
        assert_eq!(a, c);
        let d = heap.intern("world");
        assert_ne!(a, d);
        assert_eq!(heap.interned_count(), 2);
    }

    #[test]
    fn test_string_hash_is_fnv1a() {
        let mut heap = Heap::new();
        let s = heap.intern("ab");
        assert_eq!(heap.string(s).hash, fnv1a(b"ab"));
    }

    #[test]
    fn test_collect_frees_unreachable_and_reuses_slots() {
        let mut heap = Heap::new();
        let kept = heap.allocate(Object::Array(Array { values: vec![] }));
        let _dead = heap.allocate(Object::Array(Array { values: vec![] }));
        heap.mark_object(kept);
        heap.trace_references();
        heap.sweep_interned();
        let (freed, _) = heap.sweep();
        assert_eq!(freed, 1);
        assert_eq!(heap.live_objects(), 1);
        // The freed slot is recycled.
        let reused = heap.allocate(Object::Array(Array { values: vec![] }));
        assert_eq!(heap.live_objects(), 2);
        let _ = reused;
    }

    #[test]
    fn test_tracing_reaches_array_elements() {
        let mut heap = Heap::new();
        let inner = heap.intern("element");
        let array = heap.allocate(Object::Array(Array {
            values: vec![Value::Obj(inner)],
        }));
        heap.mark_object(array);
        heap.trace_references();
        heap.sweep_interned();
        heap.sweep();
        assert!(!heap.is_marked(array)); // marks cleared after sweep
        assert_eq!(heap.live_objects(), 2);
        assert_eq!(heap.string_chars(inner), "element");
    }

    #[test]
    fn test_unreachable_string_leaves_intern_table() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept");
        let _dead = heap.intern("dead");
        assert_eq!(heap.interned_count(), 2);
        heap.mark_object(kept);
        heap.trace_references();
        heap.sweep_interned();
        heap.sweep();
        assert_eq!(heap.interned_count(), 1);
        // Re-interning the dead content allocates a fresh object.
        let again = heap.intern("dead");
        assert_eq!(heap.string_chars(again), "dead");
    }

    #[test]
    fn test_temp_roots_are_markable() {
        let mut heap = Heap::new();
        let s = heap.intern("temp");
        heap.push_temp_root(Value::Obj(s));
        heap.mark_temp_roots();
        heap.trace_references();
        heap.sweep_interned();
        heap.sweep();
        assert_eq!(heap.live_objects(), 1);
        heap.pop_temp_root();
    }
}
