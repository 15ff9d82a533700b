//! Kiln JIT runtime
//!
//! Compiles IR modules to native code and dispatches calls into them:
//! - **Arguments / call frames**: packing host operands into the flat
//!   `void**` frame the generated code expects (`arguments`, `executable`)
//! - **Executables**: compiled entrypoints with pre-computed result
//!   layouts and object-file round-tripping (`executable`, `obj_file`)
//! - **Compilation**: single-use contexts that parse, specialize, lower,
//!   and codegen (`compiler`, `codegen`)
//! - **Specialization cache**: `JitExecutable`, memoizing executables per
//!   operand fingerprint with at-most-one-entry-per-fingerprint semantics
//! - **Custom calls**: host intrinsics invoked from generated code with
//!   typed argument/attribute decoding (`custom_call`)
//! - **Async runtime binding**: thread-local runtime installed around
//!   every entry into generated code (`async_rt`)
//!
//! ```rust,ignore
//! let jit = JitExecutable::instantiate(source, "compute", options)?;
//! let mut args = Arguments::new(2);
//! args.push(MemrefDesc::new(DType::F32, input.as_mut_ptr().cast(), 0, &[2, 2], &[2, 1]));
//! let executable = jit.get_executable((&args).into())?;
//!
//! let mut converter = ResultConverter::new(executable.num_results());
//! converter.add_conversion(return_memref_as_host_buffer);
//! executable.execute((&args).into(), &converter, &ExecuteOpts::default())?;
//! ```

#![warn(rust_2018_idioms)]

mod abi;
mod arguments;
mod async_rt;
mod buffer;
mod codegen;
mod compiler;
mod custom_call;
mod engine;
mod error;
mod executable;
mod jit_executable;
mod obj_file;
mod types_conv;

pub use abi::{
    runtime_symbol_map, EntryFn, HelperTable, KernelContext, SymbolMap, TypeCode,
};
pub use arguments::{ArgValue, Argument, Arguments, ArgumentsRef, MemrefDesc, OpaqueArg};
pub use async_rt::{AsyncRuntime, AsyncToken, AsyncValue, OwnedMemref};
pub use buffer::{Deleter, HostBuffer};
pub use codegen::OptLevel;
pub use compiler::{
    default_calling_convention, CallingConvention, CompilationOptions, CompilationPipelineFn,
    JitCompilationContext, RegisterDialectsFn, Specialization,
};
pub use custom_call::{
    add_static_custom_call_registration, register_static_custom_calls, CallContext, CustomCall,
    CustomCallArg, CustomCallAttr, CustomCallBuilder, CustomCallRegistry, FlatMemrefView,
    MemrefView, UserData,
};
pub use engine::{ExecutionEngine, JitEngine};
pub use error::{Error, Result};
pub use executable::{
    return_async_token, return_async_value_as_host_buffer, return_memref_as_host_buffer,
    AsyncBuffer, CallFrame, ExecuteOpts, Executable, ResultConverter, ResultsMemoryLayout,
    ReturnedResults, ReturnedValue,
};
pub use jit_executable::{CachedExecutable, JitExecutable};
pub use obj_file::ObjectFile;
pub use types_conv::TypeConverter;
