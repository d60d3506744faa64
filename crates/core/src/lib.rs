//! Crux core: the shared object model for the Crux compiler and VM.
//!
//! This crate holds everything both halves of the pipeline need to agree
//! on: the [`Value`] representation, the heap object variants, the
//! garbage-collected [`Heap`] arena, the open-addressed [`Table`], and the
//! bytecode [`Chunk`]/[`OpCode`] encoding.
//!
//! The compiler allocates functions, strings and struct types directly into
//! the heap; the VM executes chunks against the same heap and owns the
//! collection trigger and root set.
//!
//! [`Value`]: value::Value
//! [`Heap`]: heap::Heap
//! [`Table`]: table::Table
//! [`Chunk`]: chunk::Chunk
//! [`OpCode`]: opcode::OpCode

pub mod chunk;
pub mod heap;
pub mod object;
pub mod opcode;
pub mod print;
pub mod table;
pub mod value;

/// 2^8 slot indices per frame: locals, upvalues and call arguments are all
/// byte-indexed.
pub const UINT8_COUNT: usize = 256;

/// Maximum call depth per module.
pub const FRAMES_MAX: usize = 128;

/// Maximum value-stack depth per module.
pub const STACK_MAX: usize = FRAMES_MAX * UINT8_COUNT * 8;

/// Maximum module import depth.
pub const IMPORT_MAX: usize = FRAMES_MAX / 2;

pub use chunk::Chunk;
pub use heap::{Heap, ObjRef, fnv1a};
pub use object::{
    CallFrame, ErrorKind, FunctionKind, ModuleRecord, ModuleState, Object, StackFault,
};
pub use opcode::OpCode;
pub use print::display_value;
pub use table::Table;
pub use value::{Value, values_equal};
