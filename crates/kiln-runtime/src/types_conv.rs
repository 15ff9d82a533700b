//! Conversion from IR types to runtime types.
//!
//! Canonical conversions are built in; clients register additional
//! callbacks for their own dialect types through the compilation options.

use std::sync::Arc;

use kiln_ir::IrType;
use kiln_types::{FunctionType, Type};

use crate::error::{Error, Result};

/// A registered conversion callback for non-canonical types.
pub type ConversionFn = Arc<dyn Fn(&IrType) -> Option<Type> + Send + Sync>;

/// Maps compiler-level IR types to runtime [`Type`]s.
#[derive(Clone, Default)]
pub struct TypeConverter {
    conversions: Vec<ConversionFn>,
}

impl TypeConverter {
    /// Converter with only the canonical conversions.
    pub fn new() -> Self {
        TypeConverter::default()
    }

    /// Register a conversion for user-defined IR types. Callbacks are
    /// consulted in registration order after the canonical conversions.
    pub fn add_conversion(
        &mut self,
        conversion: impl Fn(&IrType) -> Option<Type> + Send + Sync + 'static,
    ) {
        self.conversions.push(Arc::new(conversion));
    }

    fn convert_canonical(&self, ty: &IrType) -> Option<Type> {
        Some(match ty {
            IrType::KernelContext => Type::KernelContext,
            IrType::AsyncToken => Type::AsyncToken,
            IrType::AsyncValue(inner) => Type::AsyncValue(Box::new(self.convert(inner).ok()?)),
            IrType::Tensor { dims, dtype } => Type::RankedTensor {
                dims: dims.clone(),
                dtype: *dtype,
            },
            IrType::UnrankedTensor { dtype } => Type::UnrankedTensor { dtype: *dtype },
            IrType::Memref { dims, dtype } => Type::Memref {
                dims: dims.clone(),
                dtype: *dtype,
            },
            IrType::UnrankedMemref { dtype } => Type::UnrankedMemref { dtype: *dtype },
            _ => return None,
        })
    }

    /// Convert one IR type to its runtime counterpart.
    pub fn convert(&self, ty: &IrType) -> Result<Type> {
        if let Some(converted) = self.convert_canonical(ty) {
            return Ok(converted);
        }
        for conversion in &self.conversions {
            if let Some(converted) = conversion(ty) {
                return Ok(converted);
            }
        }
        Err(Error::UnsupportedType(format!(
            "cannot convert {} to a runtime type",
            ty
        )))
    }

    /// Convert a full signature. Every input and result must convert.
    pub fn convert_signature(
        &self,
        inputs: &[IrType],
        results: &[IrType],
    ) -> Result<FunctionType> {
        let mut converted_inputs = Vec::with_capacity(inputs.len());
        for (i, ty) in inputs.iter().enumerate() {
            converted_inputs.push(self.convert(ty).map_err(|_| {
                Error::UnsupportedType(format!("cannot convert input #{} type {}", i, ty))
            })?);
        }
        let mut converted_results = Vec::with_capacity(results.len());
        for (i, ty) in results.iter().enumerate() {
            converted_results.push(self.convert(ty).map_err(|_| {
                Error::UnsupportedType(format!("cannot convert result #{} type {}", i, ty))
            })?);
        }
        Ok(FunctionType::new(converted_inputs, converted_results))
    }
}
