//! Runtime panic reporting.
//!
//! A runtime panic prints a banner with the error kind and message, a
//! frame-by-frame stack trace of the current module (line numbers come from
//! each frame's ip through the chunk line table), and a hint for the kind.
//! The module's execution state is then reset so a hosting REPL can keep
//! accepting input.

use crux_core::object::ErrorKind;

use crate::vm::{InterpretError, Vm};

const BANNER: &str = "==================================================";

impl Vm {
    /// Reports a runtime error and unwinds the current module. Returns the
    /// `Runtime` marker so handlers can `return Err(self.runtime_panic(…))`.
    pub(crate) fn runtime_panic(&mut self, kind: ErrorKind, message: &str) -> InterpretError {
        let mut report = String::new();
        report.push_str(BANNER);
        report.push('\n');
        report.push_str(&format!("{}: {}\n", kind.display_name(), message));

        let module = self.heap.module(self.current_module);
        if !module.frames.is_empty() {
            report.push_str("\nStack trace:\n");
            for (depth, frame) in module.frames.iter().rev().enumerate() {
                let function = self.heap.function(frame.function);
                let line = function.chunk.line_at(frame.ip.saturating_sub(1));
                let name = match function.name {
                    Some(name) => format!("{}()", self.heap.string_chars(name)),
                    None => "<script>".to_string(),
                };
                report.push_str(&format!(
                    "[frame {}] [line {}] in {}\n",
                    depth + 1,
                    line,
                    name
                ));
            }
        }

        report.push_str(&format!("\nSuggestion: {}\n", kind.hint()));
        report.push_str(BANNER);
        eprintln!("{}", report);

        // Unwind: nothing resumes after a panic, so in-flight match and
        // struct-construction state goes with the stack.
        self.heap.module_mut(self.current_module).reset_stack();
        self.match_stack.clear();
        self.struct_stack.clear();
        InterpretError::Runtime
    }
}
