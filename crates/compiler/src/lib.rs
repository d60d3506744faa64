//! Crux compiler: source text to bytecode.
//!
//! The pipeline is scanner → single-pass Pratt parser → per-function chunk
//! emission; there is no intermediate tree. Functions, interned strings and
//! struct types are allocated directly into the shared [`Heap`], so the
//! returned handle is ready for the VM to wrap in a closure and execute.
//!
//! ```rust
//! use crux_core::{Heap, Object, object::ModuleRecord};
//!
//! let mut heap = Heap::new();
//! let module = heap.allocate(Object::Module(ModuleRecord::new(None, false, true)));
//! let function = cruxc::compile(&mut heap, "let x = 1 + 2;", module).unwrap();
//! assert!(!heap.function(function).chunk.code.is_empty());
//! ```
//!
//! [`Heap`]: crux_core::Heap

pub mod compiler;
pub mod error;
pub mod scanner;

pub use compiler::compile;
pub use error::{CompileError, render};
pub use scanner::{Scanner, Token, TokenKind};
