//! Kiln input IR
//!
//! A small MLIR-flavored intermediate representation consumed by the JIT
//! runtime:
//! - **Lexer/parser**: textual modules to an op tree (`parse_module`)
//! - **IR**: modules, functions, tree-structured ops with nested regions
//! - **Types/attributes**: shaped types with dynamic dims, typed attributes
//! - **Passes**: the `Pass`/`PassManager` framework plus the built-in
//!   lowering passes (canonicalize, bufferize, expand-transpose,
//!   aligned-alloc)
//!
//! The surface syntax follows MLIR closely enough that programs from the
//! runtime's test suites read naturally, but only the ops the runtime
//! compiles are accepted.

#![warn(rust_2018_idioms)]

mod attr;
mod display;
mod ir;
mod lexer;
mod parser;
mod pass;
mod types;

pub mod passes;

pub use attr::{AttrMap, Attribute};
pub use ir::{BinOp, Function, Module, Op, Param, Region, Value, Visibility};
pub use parser::{parse_module, DialectRegistry, ParseError};
pub use pass::{Pass, PassError, PassManager};
pub use types::IrType;
