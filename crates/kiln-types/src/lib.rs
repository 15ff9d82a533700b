//! Kiln runtime type system
//!
//! Types that describe values crossing the boundary between the host and
//! JIT-compiled code:
//! - **DType**: scalar element types with total byte sizes
//! - **Type**: the runtime view of an IR type, with argument/result ABI queries
//! - **FunctionType**: input/result signature of a compiled entrypoint
//!
//! The canonical types are a closed enum; clients plug user-defined types in
//! through the [`ExtType`] trait without reopening the hierarchy.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod dtype;
mod types;

pub use dtype::DType;
pub use types::{
    ArgumentAbi, ExtType, FunctionType, ResultAbi, Type, DYNAMIC_DIM, POINTER_SIZE,
};
