//! IR-level types.
//!
//! These are the compiler-side types; the runtime mirrors the subset that
//! crosses the ABI boundary as `kiln_types::Type` via the type converter.

use kiln_types::{DType, DYNAMIC_DIM};

/// Type of an SSA value or function parameter/result in the IR.
#[derive(Debug, Clone, PartialEq)]
pub enum IrType {
    /// Pointer-sized index type used for dims and loop bounds.
    Index,
    /// Scalar of a runtime element type.
    Scalar(DType),
    /// Ranked tensor; dims use [`DYNAMIC_DIM`] for `?`.
    Tensor { dims: Vec<i64>, dtype: DType },
    /// Tensor of unknown rank.
    UnrankedTensor { dtype: DType },
    /// Ranked memref.
    Memref { dims: Vec<i64>, dtype: DType },
    /// Memref of unknown rank.
    UnrankedMemref { dtype: DType },
    /// Async completion token.
    AsyncToken,
    /// Async value with a payload type.
    AsyncValue(Box<IrType>),
    /// The runtime kernel-context operand.
    KernelContext,
    /// Dialect type owned by the client, e.g. `testlib.custom_arg`.
    Custom(String),
}

impl IrType {
    /// Rank of a ranked shaped type.
    pub fn rank(&self) -> Option<usize> {
        match self {
            IrType::Tensor { dims, .. } | IrType::Memref { dims, .. } => Some(dims.len()),
            _ => None,
        }
    }

    /// Element type of a shaped type.
    pub fn dtype(&self) -> Option<DType> {
        match self {
            IrType::Tensor { dtype, .. }
            | IrType::Memref { dtype, .. }
            | IrType::UnrankedTensor { dtype }
            | IrType::UnrankedMemref { dtype } => Some(*dtype),
            IrType::Scalar(dtype) => Some(*dtype),
            _ => None,
        }
    }

    /// Dims of a ranked shaped type.
    pub fn dims(&self) -> Option<&[i64]> {
        match self {
            IrType::Tensor { dims, .. } | IrType::Memref { dims, .. } => Some(dims),
            _ => None,
        }
    }

    /// Whether any dimension is dynamic.
    pub fn has_dynamic_dims(&self) -> bool {
        self.dims()
            .map(|dims| dims.iter().any(|d| *d == DYNAMIC_DIM))
            .unwrap_or(false)
    }

    /// Tensor with the same shape rewritten as a memref, other types
    /// unchanged. Used by the bufferization pass.
    pub fn bufferized(&self) -> IrType {
        match self {
            IrType::Tensor { dims, dtype } => IrType::Memref {
                dims: dims.clone(),
                dtype: *dtype,
            },
            IrType::UnrankedTensor { dtype } => IrType::UnrankedMemref { dtype: *dtype },
            IrType::AsyncValue(inner) => IrType::AsyncValue(Box::new(inner.bufferized())),
            other => other.clone(),
        }
    }

    /// Parse an element-type name like `f32` or `ui8`.
    pub fn parse_dtype(name: &str) -> Option<DType> {
        Some(match name {
            "i1" => DType::I1,
            "i8" => DType::I8,
            "i16" => DType::I16,
            "i32" => DType::I32,
            "i64" => DType::I64,
            "ui8" => DType::UI8,
            "ui16" => DType::UI16,
            "ui32" => DType::UI32,
            "ui64" => DType::UI64,
            "f32" => DType::F32,
            "f64" => DType::F64,
            "complex64" => DType::Complex64,
            "complex128" => DType::Complex128,
            _ => return None,
        })
    }
}
