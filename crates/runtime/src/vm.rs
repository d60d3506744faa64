//! The Crux virtual machine.
//!
//! One `Vm` owns the heap, the module graph, the native registry and the
//! per-type method tables. Execution state (value stack, call frames, open
//! upvalues) lives inside each module record; the VM points at the module
//! currently running.
//!
//! The VM is also the garbage collector's driver: it owns the trigger
//! (`maybe_collect`) and the root set. Allocation helpers here collect
//! *before* building a group of objects, so a multi-object construction is
//! never interrupted by a sweep.

use std::io::Write;

use crux_core::heap::{Heap, ObjRef};
use crux_core::object::{
    CallFrame, Closure, ErrorObj, ErrorKind, ModuleRecord, ModuleState, Native, NativeId, Object,
    ResultObj, StackFault, UpvalueSlot,
};
use crux_core::value::Value;
use crux_core::{Table, display_value};

use crate::natives;

/// How an interpretation attempt failed. Compile failures are reported
/// before execution begins; runtime failures unwind the current module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretError {
    Compile,
    Runtime,
}

pub type InterpretResult = Result<(), InterpretError>;

/// Host callable. Fallible natives return a `result` value for user code to
/// match on; infallible ones return their value directly. Which contract a
/// given native follows is recorded by its heap object variant.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Value;

/// The fixed registry of host-provided callables. Heap objects reference
/// entries by [`NativeId`] so the object model stays independent of the VM.
#[derive(Default)]
pub struct NativeRegistry {
    funcs: Vec<NativeFn>,
}

impl NativeRegistry {
    pub fn add(&mut self, func: NativeFn) -> NativeId {
        self.funcs.push(func);
        NativeId((self.funcs.len() - 1) as u32)
    }

    pub fn get(&self, id: NativeId) -> NativeFn {
        self.funcs[id.0 as usize]
    }
}

/// A `crux:` importable module of natives.
pub struct NativeModule {
    pub name: ObjRef,
    pub table: Table,
}

/// State of one in-flight `match` expression. A stack of these survives
/// user calls made from inside match arms.
#[derive(Debug, Clone, Copy)]
pub struct MatchState {
    pub target: Value,
    pub bind: Value,
    pub give: Option<Value>,
}

/// Where user-visible output goes. The REPL and CLI print to stdout;
/// tests capture.
enum OutputSink {
    Stdout,
    Capture(String),
}

/// Per-type native method tables.
#[derive(Default)]
pub struct TypeMethods {
    pub string: Table,
    pub array: Table,
    pub table: Table,
    pub error: Table,
    pub result: Table,
    pub random: Table,
    pub file: Table,
    pub vec2: Table,
    pub vec3: Table,
}

pub(crate) const STRUCT_INSTANCE_DEPTH: usize = 256;

pub struct Vm {
    pub heap: Heap,
    pub(crate) current_module: ObjRef,
    pub(crate) module_cache: Table,
    pub(crate) import_stack: Vec<ObjRef>,
    pub(crate) import_count: usize,
    pub(crate) natives: NativeRegistry,
    pub(crate) native_modules: Vec<NativeModule>,
    pub(crate) methods: TypeMethods,
    pub(crate) match_stack: Vec<MatchState>,
    pub(crate) struct_stack: Vec<ObjRef>,
    pub(crate) pub_pending: bool,
    pub(crate) args: Vec<String>,
    gc_stress: bool,
    out: OutputSink,
}

impl Vm {
    pub fn new(args: Vec<String>) -> Vm {
        let is_repl = args.is_empty();
        let mut heap = Heap::new();

        let path_text = args.first().cloned().unwrap_or_else(|| "./".to_string());
        let path = heap.intern(&path_text);
        let mut record = ModuleRecord::new(Some(path), is_repl, true);
        record.state = ModuleState::Loading;
        let main_module = heap.allocate(Object::Module(record));

        let mut vm = Vm {
            heap,
            current_module: main_module,
            module_cache: Table::new(),
            import_stack: Vec::new(),
            import_count: 0,
            natives: NativeRegistry::default(),
            native_modules: Vec::new(),
            methods: TypeMethods::default(),
            match_stack: Vec::new(),
            struct_stack: Vec::new(),
            pub_pending: false,
            args,
            gc_stress: false,
            out: OutputSink::Stdout,
        };

        natives::install(&mut vm);
        natives::install_core(&mut vm, main_module);

        let path_hash = vm.heap.string(path).hash;
        vm.module_cache
            .set(path_hash, Value::Obj(path), Value::Obj(main_module));
        vm
    }

    pub fn current_module(&self) -> ObjRef {
        self.current_module
    }

    /// Forces a collection before every allocation; used by GC tests.
    pub fn set_gc_stress(&mut self, enabled: bool) {
        self.gc_stress = enabled;
    }

    // --- output ------------------------------------------------------------

    /// Redirects `print`/`println` into an in-memory buffer.
    pub fn capture_output(&mut self) {
        self.out = OutputSink::Capture(String::new());
    }

    /// Returns and clears everything captured so far.
    pub fn take_output(&mut self) -> String {
        match &mut self.out {
            OutputSink::Capture(buffer) => std::mem::take(buffer),
            OutputSink::Stdout => String::new(),
        }
    }

    pub(crate) fn write_out(&mut self, text: &str) {
        match &mut self.out {
            OutputSink::Stdout => {
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            }
            OutputSink::Capture(buffer) => buffer.push_str(text),
        }
    }

    // --- allocation and collection -----------------------------------------

    /// Collection safepoint. Every live value must be reachable from a root
    /// when this is called; allocation helpers call it before building.
    pub(crate) fn maybe_collect(&mut self) {
        if self.gc_stress || self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    pub(crate) fn alloc(&mut self, object: Object) -> ObjRef {
        self.maybe_collect();
        self.heap.allocate(object)
    }

    pub(crate) fn intern(&mut self, text: &str) -> ObjRef {
        self.maybe_collect();
        self.heap.intern(text)
    }

    pub fn collect_garbage(&mut self) {
        let before = self.heap.bytes_allocated();

        // Roots: the module chain from the current record (the record's
        // trace covers globals, publics, stack, frames and open upvalues),
        // the caches and registries, construction stacks, and match state.
        self.heap.mark_object(self.current_module);
        let cache = std::mem::take(&mut self.module_cache);
        self.heap.mark_table(&cache);
        self.module_cache = cache;
        for &path in &self.import_stack {
            self.heap.mark_object(path);
        }
        let modules = std::mem::take(&mut self.native_modules);
        for module in &modules {
            self.heap.mark_object(module.name);
            self.heap.mark_table(&module.table);
        }
        self.native_modules = modules;
        let methods = std::mem::take(&mut self.methods);
        for table in [
            &methods.string,
            &methods.array,
            &methods.table,
            &methods.error,
            &methods.result,
            &methods.random,
            &methods.file,
            &methods.vec2,
            &methods.vec3,
        ] {
            self.heap.mark_table(table);
        }
        self.methods = methods;
        let match_states = self.match_stack.clone();
        for state in &match_states {
            self.heap.mark_value(state.target);
            self.heap.mark_value(state.bind);
            if let Some(give) = state.give {
                self.heap.mark_value(give);
            }
        }
        let instances = self.struct_stack.clone();
        for instance in instances {
            self.heap.mark_object(instance);
        }
        self.heap.mark_temp_roots();

        self.heap.trace_references();
        self.heap.sweep_interned();
        let (freed, freed_bytes) = self.heap.sweep();

        tracing::debug!(
            freed,
            freed_bytes,
            before,
            after = self.heap.bytes_allocated(),
            next_gc = self.heap.next_gc(),
            "gc cycle"
        );
    }

    // --- object construction helpers ---------------------------------------

    pub(crate) fn make_error(&mut self, kind: ErrorKind, message: &str, is_panic: bool) -> ObjRef {
        self.maybe_collect();
        let message = self.heap.intern(message);
        self.heap.allocate(Object::Error(ErrorObj {
            message,
            kind,
            is_panic,
        }))
    }

    /// Builds `Ok(value)`. The payload is temp-rooted across the safepoint,
    /// so a value just detached from its owner (an array pop, say) survives
    /// a collection triggered here.
    pub(crate) fn ok_result(&mut self, value: Value) -> Value {
        self.heap.push_temp_root(value);
        self.maybe_collect();
        let result = self.heap.allocate(Object::Result(ResultObj::Ok(value)));
        self.heap.pop_temp_root();
        Value::Obj(result)
    }

    pub(crate) fn err_result(&mut self, kind: ErrorKind, message: &str) -> Value {
        self.make_err_result(kind, message, false)
    }

    pub(crate) fn panic_result(&mut self, kind: ErrorKind, message: &str) -> Value {
        self.make_err_result(kind, message, true)
    }

    fn make_err_result(&mut self, kind: ErrorKind, message: &str, is_panic: bool) -> Value {
        self.maybe_collect();
        let message = self.heap.intern(message);
        let error = self.heap.allocate(Object::Error(ErrorObj {
            message,
            kind,
            is_panic,
        }));
        let result = self.heap.allocate(Object::Result(ResultObj::Err(error)));
        Value::Obj(result)
    }

    pub(crate) fn type_error_message(&self, value: Value, expected: &str) -> String {
        format!(
            "Expected type {}, but got '{}'.",
            expected,
            self.type_name_of(value)
        )
    }

    pub(crate) fn type_name_of(&self, value: Value) -> &'static str {
        match value {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Obj(r) => match self.heap.get(r) {
                // A closed upvalue reports its payload's type.
                Object::Upvalue(u) => match u.slot {
                    UpvalueSlot::Closed(inner) => self.type_name_of(inner),
                    UpvalueSlot::Open(_) => "upvalue",
                },
                other => other.type_name(),
            },
        }
    }

    pub(crate) fn to_display_string(&self, value: Value) -> String {
        display_value(&self.heap, value, false)
    }

    // --- stack plumbing ----------------------------------------------------

    pub(crate) fn push(&mut self, value: Value) -> InterpretResult {
        let module = self.current_module;
        match self.heap.module_mut(module).push(value) {
            Ok(()) => Ok(()),
            Err(StackFault::Overflow) => {
                Err(self.runtime_panic(ErrorKind::StackOverflow, "Stack overflow."))
            }
            Err(StackFault::Underflow) => unreachable!("push cannot underflow"),
        }
    }

    pub(crate) fn pop(&mut self) -> Result<Value, InterpretError> {
        let module = self.current_module;
        match self.heap.module_mut(module).pop() {
            Ok(value) => Ok(value),
            Err(_) => Err(self.runtime_panic(ErrorKind::Runtime, "Stack underflow.")),
        }
    }

    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.heap.module(self.current_module).peek(distance)
    }

    /// Looks up a global of the current module by name. Used by embedders
    /// and tests to observe results.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let module = self.heap.module(self.current_module);
        for (key, value) in module.globals.iter() {
            if let Value::Obj(r) = key {
                if let Object::String(s) = self.heap.get(r) {
                    if &*s.chars == name {
                        return Some(value);
                    }
                }
            }
        }
        None
    }

    // --- upvalues ----------------------------------------------------------

    pub(crate) fn upvalue_get(&self, upvalue: ObjRef) -> Value {
        match self.heap.upvalue(upvalue).slot {
            UpvalueSlot::Open(slot) => {
                let owner = self.heap.upvalue(upvalue).owner;
                self.heap.module(owner).stack[slot]
            }
            UpvalueSlot::Closed(value) => value,
        }
    }

    pub(crate) fn upvalue_set(&mut self, upvalue: ObjRef, value: Value) {
        match self.heap.upvalue(upvalue).slot {
            UpvalueSlot::Open(slot) => {
                let owner = self.heap.upvalue(upvalue).owner;
                self.heap.module_mut(owner).stack[slot] = value;
            }
            UpvalueSlot::Closed(_) => {
                self.heap.upvalue_mut(upvalue).slot = UpvalueSlot::Closed(value);
            }
        }
    }

    /// Captures the local at `slot` of the current module's stack,
    /// deduplicating against the module's open-upvalue list (kept in
    /// descending slot order).
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let module = self.current_module;
        let mut prev: Option<ObjRef> = None;
        let mut current = self.heap.module(module).open_upvalues;
        while let Some(u) = current {
            match self.heap.upvalue(u).slot {
                UpvalueSlot::Open(s) if s > slot => {
                    prev = Some(u);
                    current = self.heap.upvalue(u).next;
                }
                UpvalueSlot::Open(s) if s == slot => return u,
                _ => break,
            }
        }

        let created = self.alloc(Object::Upvalue(crux_core::object::Upvalue {
            slot: UpvalueSlot::Open(slot),
            next: current,
            owner: module,
        }));
        match prev {
            None => self.heap.module_mut(module).open_upvalues = Some(created),
            Some(p) => self.heap.upvalue_mut(p).next = Some(created),
        }
        created
    }

    /// Closes every open upvalue at or above `last` on the current module's
    /// stack: the value moves into the upvalue's own storage.
    pub(crate) fn close_upvalues(&mut self, last: usize) {
        let module = self.current_module;
        loop {
            let Some(head) = self.heap.module(module).open_upvalues else {
                return;
            };
            let UpvalueSlot::Open(slot) = self.heap.upvalue(head).slot else {
                return;
            };
            if slot < last {
                return;
            }
            let value = self.heap.module(module).stack[slot];
            let next = self.heap.upvalue(head).next;
            let upvalue = self.heap.upvalue_mut(head);
            upvalue.slot = UpvalueSlot::Closed(value);
            upvalue.next = None;
            self.heap.module_mut(module).open_upvalues = next;
        }
    }

    // --- calls -------------------------------------------------------------

    pub(crate) fn call_closure(&mut self, closure: ObjRef, arg_count: u8) -> InterpretResult {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if arg_count != arity {
            let message = format!("Expected {} argument(s), got {}.", arity, arg_count);
            return Err(self.runtime_panic(ErrorKind::ArgumentMismatch, &message));
        }
        let module = self.current_module;
        if self.heap.module(module).frames_full() {
            return Err(self.runtime_panic(ErrorKind::StackOverflow, "Stack overflow."));
        }
        let slots = self.heap.module(module).stack.len() - arg_count as usize - 1;
        self.heap.module_mut(module).frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            slots,
        });
        Ok(())
    }

    /// Calls any callable with `arg_count` arguments already on the stack
    /// and the callee just below them.
    pub(crate) fn call_value(&mut self, callee: Value, arg_count: u8) -> InterpretResult {
        let Some(r) = callee.as_obj() else {
            return Err(self.runtime_panic(ErrorKind::Type, "Only functions can be called."));
        };
        enum Kind {
            Closure,
            Fallible(Native),
            Infallible(Native),
        }
        let kind = match self.heap.get(r) {
            Object::Closure(_) => Kind::Closure,
            Object::NativeFunction(n) | Object::NativeMethod(n) => Kind::Fallible(n.clone()),
            Object::NativeInfallibleFunction(n) | Object::NativeInfallibleMethod(n) => {
                Kind::Infallible(n.clone())
            }
            _ => {
                return Err(self.runtime_panic(ErrorKind::Type, "Only functions can be called."));
            }
        };
        match kind {
            Kind::Closure => self.call_closure(r, arg_count),
            Kind::Fallible(native) => {
                self.check_native_arity(&native, arg_count)?;
                let result = self.run_fallible_native(&native, arg_count as usize, true)?;
                self.push(result)
            }
            Kind::Infallible(native) => {
                self.check_native_arity(&native, arg_count)?;
                let args = self.stack_args(arg_count as usize);
                let func = self.natives.get(native.id);
                let result = func(self, &args);
                self.drop_stack_slots(arg_count as usize + 1);
                self.push(result)
            }
        }
    }

    fn check_native_arity(&mut self, native: &Native, arg_count: u8) -> InterpretResult {
        if arg_count != native.arity {
            let message = format!(
                "Expected {} argument(s), got {}.",
                native.arity, arg_count
            );
            return Err(self.runtime_panic(ErrorKind::ArgumentMismatch, &message));
        }
        Ok(())
    }

    /// Runs a fallible native whose arguments (and optionally the callee
    /// slot) sit on top of the stack; pops them and returns the result
    /// value, escalating panic-flagged errors.
    fn run_fallible_native(
        &mut self,
        native: &Native,
        arg_count: usize,
        callee_on_stack: bool,
    ) -> Result<Value, InterpretError> {
        let args = self.stack_args(arg_count);
        let func = self.natives.get(native.id);
        let result = func(self, &args);
        self.drop_stack_slots(arg_count + usize::from(callee_on_stack));

        if let Value::Obj(r) = result {
            if let Object::Result(ResultObj::Err(error)) = self.heap.get(r) {
                let error = *error;
                let (kind, is_panic, message) = match self.heap.get(error) {
                    Object::Error(e) => (
                        e.kind,
                        e.is_panic,
                        self.heap.string_chars(e.message).to_string(),
                    ),
                    _ => (ErrorKind::Runtime, false, String::new()),
                };
                if is_panic {
                    return Err(self.runtime_panic(kind, &message));
                }
            }
        }
        Ok(result)
    }

    fn stack_args(&self, count: usize) -> Vec<Value> {
        let stack = &self.heap.module(self.current_module).stack;
        stack[stack.len() - count..].to_vec()
    }

    fn drop_stack_slots(&mut self, count: usize) {
        let module = self.current_module;
        let m = self.heap.module_mut(module);
        let len = m.stack.len();
        m.stack.truncate(len.saturating_sub(count));
    }

    // --- method invocation -------------------------------------------------

    /// `receiver.name(args…)` — the receiver sits at `peek(arg_count)`.
    pub(crate) fn invoke(&mut self, name: ObjRef, arg_count: u8) -> InterpretResult {
        let receiver = self.peek(arg_count as usize);
        let Some(r) = receiver.as_obj() else {
            return Err(self.runtime_panic(
                ErrorKind::Type,
                &format!(
                    "Values of type '{}' do not have methods.",
                    self.type_name_of(receiver)
                ),
            ));
        };

        // Struct instances dispatch to a field holding a callable.
        if let Object::StructInstance(instance) = self.heap.get(r) {
            let struct_type = instance.struct_type;
            let name_hash = self.heap.string(name).hash;
            let field = match self.heap.get(struct_type) {
                Object::Struct(s) => s.fields.get(name_hash, Value::Obj(name)),
                _ => None,
            };
            let Some(Value::Int(index)) = field else {
                return Err(self.undefined_method(name));
            };
            let callee = match self.heap.get(r) {
                Object::StructInstance(i) => i.fields[index as usize],
                _ => Value::Nil,
            };
            return self.call_value(callee, arg_count);
        }

        enum TableKind {
            String,
            Array,
            Table,
            Error,
            Result,
            Random,
            File,
            Vec2,
            Vec3,
        }
        let kind = match self.heap.get(r) {
            Object::String(_) => TableKind::String,
            Object::Array(_) => TableKind::Array,
            Object::Table(_) | Object::StaticTable(_) => TableKind::Table,
            Object::Error(_) => TableKind::Error,
            Object::Result(_) => TableKind::Result,
            Object::Random(_) => TableKind::Random,
            Object::File(_) => TableKind::File,
            Object::Vec2(_) => TableKind::Vec2,
            Object::Vec3(_) => TableKind::Vec3,
            _ => {
                return Err(self.runtime_panic(
                    ErrorKind::Type,
                    &format!(
                        "Values of type '{}' do not have methods.",
                        self.type_name_of(receiver)
                    ),
                ));
            }
        };
        let name_hash = self.heap.string(name).hash;
        let method = {
            let table = match kind {
                TableKind::String => &self.methods.string,
                TableKind::Array => &self.methods.array,
                TableKind::Table => &self.methods.table,
                TableKind::Error => &self.methods.error,
                TableKind::Result => &self.methods.result,
                TableKind::Random => &self.methods.random,
                TableKind::File => &self.methods.file,
                TableKind::Vec2 => &self.methods.vec2,
                TableKind::Vec3 => &self.methods.vec3,
            };
            table.get(name_hash, Value::Obj(name))
        };
        let Some(method) = method else {
            return Err(self.undefined_method(name));
        };

        // The receiver becomes the method's first argument; the callee is
        // not on the stack for an invoke.
        let total_args = arg_count as usize + 1;
        let native = match method.as_obj().map(|m| self.heap.get(m)) {
            Some(Object::NativeMethod(n)) | Some(Object::NativeFunction(n)) => {
                let native = n.clone();
                self.check_native_arity(&native, total_args as u8)?;
                let result = self.run_fallible_native(&native, total_args, false)?;
                return self.push(result);
            }
            Some(Object::NativeInfallibleMethod(n)) | Some(Object::NativeInfallibleFunction(n)) => {
                n.clone()
            }
            _ => return Err(self.undefined_method(name)),
        };
        self.check_native_arity(&native, total_args as u8)?;
        let args = self.stack_args(total_args);
        let func = self.natives.get(native.id);
        let result = func(self, &args);
        self.drop_stack_slots(total_args);
        self.push(result)
    }

    fn undefined_method(&mut self, name: ObjRef) -> InterpretError {
        let text = format!("Undefined method '{}'.", self.heap.string_chars(name));
        self.runtime_panic(ErrorKind::Name, &text)
    }

    // --- entry points ------------------------------------------------------

    /// Compiles and runs `source` in the current module. The VM stays
    /// usable after either kind of failure, which is what the REPL relies
    /// on.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let module = self.current_module;
        let function = match cruxc::compile(&mut self.heap, source, module) {
            Ok(function) => function,
            Err(errors) => {
                for error in &errors {
                    eprint!("{}", cruxc::render(source, error));
                }
                return Err(InterpretError::Compile);
            }
        };

        // No collection may run between compile and rooting the closure.
        let closure = self.heap.allocate(Object::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.heap.module_mut(module).module_closure = Some(closure);
        self.push(Value::Obj(closure))?;
        self.call_closure(closure, 0)?;
        let result = self.run(false);
        match result {
            Ok(()) => {
                self.heap.module_mut(module).state = ModuleState::Loaded;
            }
            Err(_) => {
                // A failure inside an imported module unwinds that module's
                // stack but can leave frames here; clear them so the next
                // interpret starts clean (the REPL relies on this).
                self.heap.module_mut(module).reset_stack();
            }
        }
        result
    }

    /// Calls a user closure from native/host code and returns its result.
    pub fn call_function(
        &mut self,
        closure: ObjRef,
        args: &[Value],
    ) -> Result<Value, InterpretError> {
        let module = self.current_module;
        let frame_count = self.heap.module(module).frames.len();
        self.push(Value::Obj(closure))?;
        for &arg in args {
            self.push(arg)?;
        }
        self.call_closure(closure, args.len() as u8)?;
        let result = self.run(true);
        self.heap.module_mut(module).frames.truncate(frame_count);
        match result {
            Ok(()) => self.pop(),
            Err(e) => Err(e),
        }
    }
}
