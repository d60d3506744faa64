//! Crux runtime: the virtual machine, module loader, garbage-collection
//! driver, native registry and standard-library glue.
//!
//! # Embedding
//!
//! ```rust
//! use crux_runtime::Vm;
//!
//! let mut vm = Vm::new(vec![]);
//! vm.capture_output();
//! vm.interpret("let a = 2; let b = 3; println(a + b);").unwrap();
//! assert_eq!(vm.take_output(), "5\n");
//! ```
//!
//! A `Vm` survives both compile and runtime failures, which is what the
//! REPL builds on: keep calling [`Vm::interpret`] with new input.

pub mod debug;
pub mod modules;
pub mod natives;
pub mod panic;
pub mod run;
pub mod vm;

pub use vm::{InterpretError, InterpretResult, Vm};

pub use crux_core::{Heap, ObjRef, Value};
