//! Scalar element types supported at the runtime boundary

use std::fmt;

/// Element type of a tensor or memref, as seen by the runtime.
///
/// Signed and unsigned integers are distinct because they encode differently
/// at custom-call boundaries; complex types are stored as two adjacent
/// floats of the component width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 1-bit boolean, stored as one byte
    I1,
    /// 8-bit signed integer
    I8,
    /// 16-bit signed integer
    I16,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 8-bit unsigned integer
    UI8,
    /// 16-bit unsigned integer
    UI16,
    /// 32-bit unsigned integer
    UI32,
    /// 64-bit unsigned integer
    UI64,
    /// 32-bit IEEE float
    F32,
    /// 64-bit IEEE float
    F64,
    /// Complex number of two f32 components
    Complex64,
    /// Complex number of two f64 components
    Complex128,
}

impl DType {
    /// Size of a single element in bytes. Total over all variants.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 | DType::I8 | DType::UI8 => 1,
            DType::I16 | DType::UI16 => 2,
            DType::I32 | DType::UI32 | DType::F32 => 4,
            DType::I64 | DType::UI64 | DType::F64 => 8,
            DType::Complex64 => 8,
            DType::Complex128 => 16,
        }
    }

    /// Whether this is a (signed or unsigned) integer type.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DType::I1
                | DType::I8
                | DType::I16
                | DType::I32
                | DType::I64
                | DType::UI8
                | DType::UI16
                | DType::UI32
                | DType::UI64
        )
    }

    /// Whether this is a floating-point type (complex excluded).
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::I1 => "i1",
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::UI8 => "ui8",
            DType::UI16 => "ui16",
            DType::UI32 => "ui32",
            DType::UI64 => "ui64",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::Complex64 => "complex64",
            DType::Complex128 => "complex128",
        };
        f.write_str(s)
    }
}
