//! The module loader.
//!
//! `use … from "path"` resolves the path against the importing module's
//! directory, canonicalises it, and loads each file at most once per VM.
//! A module in the `Loading` state is mid-execution; importing it again is
//! a circular import. Each loaded module runs its top level on its own
//! stack with its own globals, then is cached under the canonical path.

use std::fs;
use std::path::{Path, PathBuf};

use crux_core::object::{Closure, ErrorKind, ModuleRecord, ModuleState, Object};
use crux_core::{IMPORT_MAX, ObjRef, Value};

use crate::natives;
use crate::vm::{InterpretError, InterpretResult, Vm};

impl Vm {
    /// Implements `OP_USE_MODULE`: loads (or reuses) the module at `path`
    /// and leaves its record on the importing module's stack for
    /// `OP_FINISH_USE`.
    pub(crate) fn use_module(&mut self, path: ObjRef) -> InterpretResult {
        let resolved_text = self.resolve_import_path(path)?;
        // One safepoint for the whole load: the resolved-path string and the
        // fresh module record are unreachable from roots until both exist.
        self.maybe_collect();
        let resolved = self.heap.intern(&resolved_text);
        let resolved_hash = self.heap.string(resolved).hash;

        if self.is_in_import_stack(resolved) {
            let message = format!(
                "Circular dependency detected when importing: {}",
                self.heap.string_chars(path)
            );
            self.heap.module_mut(self.current_module).state = ModuleState::Error;
            return Err(self.runtime_panic(ErrorKind::Import, &message));
        }

        if let Some(cached) = self.module_cache.get(resolved_hash, Value::Obj(resolved)) {
            let record = match cached.as_obj() {
                Some(r) if matches!(self.heap.get(r), Object::Module(_)) => r,
                _ => {
                    return Err(
                        self.runtime_panic(ErrorKind::Import, "Corrupt module cache entry.")
                    );
                }
            };
            // A cached record still loading means the import chain bit its
            // own tail through the cache.
            if self.heap.module(record).state == ModuleState::Loading {
                let message = format!(
                    "Circular dependency detected when importing: {}",
                    self.heap.string_chars(path)
                );
                return Err(self.runtime_panic(ErrorKind::Import, &message));
            }
            return self.push(cached);
        }

        if self.import_count + 1 > IMPORT_MAX {
            return Err(self.runtime_panic(ErrorKind::Import, "Import limit reached."));
        }
        self.import_count += 1;

        let source = match fs::read_to_string(&resolved_text) {
            Ok(source) => source,
            Err(e) => {
                let message = format!("Could not read \"{}\": {}.", resolved_text, e);
                return Err(self.runtime_panic(ErrorKind::Io, &message));
            }
        };

        tracing::debug!(path = %resolved_text, "loading module");

        let mut record = ModuleRecord::new(Some(resolved), false, false);
        record.enclosing_module = Some(self.current_module);
        let module = self.heap.allocate(Object::Module(record));

        self.import_stack.push(resolved);
        let previous = self.current_module;
        self.current_module = module;
        natives::install_core(self, module);

        let function = match cruxc::compile(&mut self.heap, &source, module) {
            Ok(function) => function,
            Err(errors) => {
                for error in &errors {
                    eprint!("{}", cruxc::render(&source, error));
                }
                self.heap.module_mut(module).state = ModuleState::Error;
                self.import_stack.pop();
                self.current_module = previous;
                self.push(Value::Obj(module))?;
                return Err(InterpretError::Compile);
            }
        };

        // No collection may run between compile and rooting the closure.
        let closure = self.heap.allocate(Object::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.heap.module_mut(module).module_closure = Some(closure);
        self.module_cache
            .set(resolved_hash, Value::Obj(resolved), Value::Obj(module));

        let run_result = self.exec_module_top_level(closure);

        self.import_stack.pop();
        self.current_module = previous;

        match run_result {
            Ok(()) => {
                self.heap.module_mut(module).state = ModuleState::Loaded;
                tracing::debug!(path = %resolved_text, "module loaded");
                self.push(Value::Obj(module))
            }
            Err(e) => {
                self.heap.module_mut(module).state = ModuleState::Error;
                self.push(Value::Obj(module))?;
                Err(e)
            }
        }
    }

    fn exec_module_top_level(&mut self, closure: ObjRef) -> InterpretResult {
        self.push(Value::Obj(closure))?;
        self.call_closure(closure, 0)?;
        self.run(false)
    }

    fn is_in_import_stack(&self, path: ObjRef) -> bool {
        // Paths are interned, so handle equality is content equality.
        self.import_stack.contains(&path)
    }

    /// Resolves `path` relative to the importing module's file and
    /// canonicalises it. The canonical absolute path is the cache key.
    fn resolve_import_path(&mut self, path: ObjRef) -> Result<String, InterpretError> {
        let relative = self.heap.string_chars(path).to_string();
        let base = match self.heap.module(self.current_module).path {
            Some(p) => self.heap.string_chars(p).to_string(),
            None => "./".to_string(),
        };
        let base_dir = Path::new(&base)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let joined = base_dir.join(&relative);
        let resolved = fs::canonicalize(&joined).unwrap_or(joined);
        match resolved.to_str() {
            Some(text) => Ok(text.to_string()),
            None => Err(self.runtime_panic(ErrorKind::Import, "Failed to resolve import path.")),
        }
    }
}
