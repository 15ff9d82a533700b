//! Runtime types and their argument/result ABIs
//!
//! A [`Type`] mirrors an IR type at runtime and answers two questions:
//! how many pointer-sized slots it occupies when passed as an argument
//! ([`Type::as_argument`]), and how many bytes of result storage the callee
//! writes when it is returned ([`Type::as_result`]). A type usable on a
//! signature must answer at least one of them in the role it occupies.

use std::fmt;
use std::mem;
use std::sync::Arc;

use crate::dtype::DType;

/// Marker for a dynamic (unknown until runtime) dimension.
pub const DYNAMIC_DIM: i64 = -1;

/// Size of a machine pointer on the host.
pub const POINTER_SIZE: usize = mem::size_of::<*const ()>();

/// Argument ABI: how many pointer-sized slots the packed form occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgumentAbi {
    /// Number of `void*` slots written by `Argument::pack`.
    pub num_slots: usize,
}

/// Result ABI: byte size of the storage cell the callee writes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultAbi {
    /// Size of the result cell in bytes.
    pub size_bytes: usize,
}

/// A user-defined runtime type.
///
/// Registered through `Type::Ext`; the canonical types stay a closed enum
/// while clients keep the hierarchy open at this seam.
pub trait ExtType: fmt::Debug + Send + Sync {
    /// Name used for printing and diagnostics, e.g. `!testlib.custom_arg`.
    fn name(&self) -> &str;

    /// Argument ABI, if values of this type can be passed as inputs.
    fn as_argument(&self) -> Option<ArgumentAbi> {
        None
    }

    /// Result ABI, if values of this type can be returned.
    fn as_result(&self) -> Option<ResultAbi> {
        None
    }
}

/// Runtime view of an IR type.
#[derive(Debug, Clone)]
pub enum Type {
    /// Opaque pointer; passed as a single slot.
    Opaque,
    /// Ranked tensor. No runtime representation of its own: signatures are
    /// bufferized before execution, so tensors appear only in user-facing
    /// signatures.
    RankedTensor {
        /// Dimensions; [`DYNAMIC_DIM`] marks dynamic ones.
        dims: Vec<i64>,
        /// Element type.
        dtype: DType,
    },
    /// Tensor of unknown rank.
    UnrankedTensor {
        /// Element type.
        dtype: DType,
    },
    /// Ranked strided memory reference.
    Memref {
        /// Dimensions; [`DYNAMIC_DIM`] marks dynamic ones.
        dims: Vec<i64>,
        /// Element type.
        dtype: DType,
    },
    /// Memref of unknown rank. Not supported at the ABI boundary.
    UnrankedMemref {
        /// Element type.
        dtype: DType,
    },
    /// Async completion token.
    AsyncToken,
    /// Async value wrapping an inner payload type.
    AsyncValue(Box<Type>),
    /// The runtime kernel-context operand prepended by the calling
    /// convention; passed as a single opaque slot.
    KernelContext,
    /// Client-registered type.
    Ext(Arc<dyn ExtType>),
}

impl Type {
    /// Argument ABI of this type, or `None` when it cannot be an input.
    pub fn as_argument(&self) -> Option<ArgumentAbi> {
        match self {
            Type::Opaque | Type::KernelContext => Some(ArgumentAbi { num_slots: 1 }),
            // Memref unrolled as: base, data, offset, sizes[rank], strides[rank].
            Type::Memref { dims, .. } => Some(ArgumentAbi {
                num_slots: 3 + 2 * dims.len(),
            }),
            Type::Ext(ext) => ext.as_argument(),
            _ => None,
        }
    }

    /// Result ABI of this type, or `None` when it cannot be a result.
    pub fn as_result(&self) -> Option<ResultAbi> {
        match self {
            // Async handles are returned as a single runtime-owned pointer.
            Type::AsyncToken | Type::AsyncValue(_) => Some(ResultAbi {
                size_bytes: POINTER_SIZE,
            }),
            // Inlined strided descriptor: basePtr, data, offset, sizes, strides.
            Type::Memref { dims, .. } => Some(ResultAbi {
                size_bytes: 2 * POINTER_SIZE + 8 + 2 * dims.len() * 8,
            }),
            Type::Ext(ext) => ext.as_result(),
            _ => None,
        }
    }

    /// Rank of a ranked shaped type.
    pub fn rank(&self) -> Option<usize> {
        match self {
            Type::Memref { dims, .. } | Type::RankedTensor { dims, .. } => Some(dims.len()),
            _ => None,
        }
    }

    /// Element type of a shaped type.
    pub fn dtype(&self) -> Option<DType> {
        match self {
            Type::Memref { dtype, .. }
            | Type::RankedTensor { dtype, .. }
            | Type::UnrankedMemref { dtype }
            | Type::UnrankedTensor { dtype } => Some(*dtype),
            _ => None,
        }
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Type::Opaque, Type::Opaque) => true,
            (Type::KernelContext, Type::KernelContext) => true,
            (Type::AsyncToken, Type::AsyncToken) => true,
            (Type::AsyncValue(a), Type::AsyncValue(b)) => a == b,
            (
                Type::RankedTensor { dims: d1, dtype: t1 },
                Type::RankedTensor { dims: d2, dtype: t2 },
            ) => d1 == d2 && t1 == t2,
            (Type::Memref { dims: d1, dtype: t1 }, Type::Memref { dims: d2, dtype: t2 }) => {
                d1 == d2 && t1 == t2
            }
            (Type::UnrankedTensor { dtype: t1 }, Type::UnrankedTensor { dtype: t2 }) => t1 == t2,
            (Type::UnrankedMemref { dtype: t1 }, Type::UnrankedMemref { dtype: t2 }) => t1 == t2,
            // Extension types compare by identity.
            (Type::Ext(a), Type::Ext(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn write_dims(f: &mut fmt::Formatter<'_>, dims: &[i64]) -> fmt::Result {
    for d in dims {
        if *d == DYNAMIC_DIM {
            write!(f, "?x")?;
        } else {
            write!(f, "{}x", d)?;
        }
    }
    Ok(())
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Opaque => write!(f, "!rt.opaque"),
            Type::KernelContext => write!(f, "!rt.kernel_context"),
            Type::AsyncToken => write!(f, "!async.token"),
            Type::AsyncValue(inner) => write!(f, "!async.value<{}>", inner),
            Type::RankedTensor { dims, dtype } => {
                write!(f, "tensor<")?;
                write_dims(f, dims)?;
                write!(f, "{}>", dtype)
            }
            Type::UnrankedTensor { dtype } => write!(f, "tensor<*x{}>", dtype),
            Type::Memref { dims, dtype } => {
                write!(f, "memref<")?;
                write_dims(f, dims)?;
                write!(f, "{}>", dtype)
            }
            Type::UnrankedMemref { dtype } => write!(f, "memref<*x{}>", dtype),
            Type::Ext(ext) => f.write_str(ext.name()),
        }
    }
}

/// Signature of a compiled entrypoint: ordered inputs and results.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionType {
    inputs: Vec<Type>,
    results: Vec<Type>,
}

impl FunctionType {
    /// Create a signature from owned input and result types.
    pub fn new(inputs: Vec<Type>, results: Vec<Type>) -> Self {
        FunctionType { inputs, results }
    }

    /// Input types in order.
    pub fn inputs(&self) -> &[Type] {
        &self.inputs
    }

    /// Result types in order.
    pub fn results(&self) -> &[Type] {
        &self.results
    }

    /// Number of inputs.
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Number of results.
    pub fn num_results(&self) -> usize {
        self.results.len()
    }

    /// Input type at `index`.
    pub fn input(&self, index: usize) -> &Type {
        &self.inputs[index]
    }

    /// Result type at `index`.
    pub fn result(&self, index: usize) -> &Type {
        &self.results[index]
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, ty) in self.inputs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", ty)?;
        }
        write!(f, ") -> (")?;
        for (i, ty) in self.results.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", ty)?;
        }
        write!(f, ")")
    }
}
