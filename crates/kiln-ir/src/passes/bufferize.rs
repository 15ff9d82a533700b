//! The default calling convention.
//!
//! Tensors have no runtime representation, so signatures and value types are
//! rewritten to memrefs, and every public function gains a leading
//! `!rt.kernel_context` operand. The signature after this pass is the
//! runtime signature the executable stores and verifies against.

use crate::ir::{Module, Param, Value, Visibility};
use crate::pass::{Pass, PassError};
use crate::types::IrType;

/// Tensor-to-memref rewrite plus kernel-context prepending.
pub struct Bufferize;

impl Pass for Bufferize {
    fn name(&self) -> &str {
        "bufferize"
    }

    fn run(&self, module: &mut Module) -> Result<(), PassError> {
        for func in &mut module.functions {
            // Rewrite every SSA value type.
            for v in 0..func.num_values() {
                let value = Value(v as u32);
                let ty = func.value_type(value).bufferized();
                func.set_value_type(value, ty);
            }
            for param in &mut func.params {
                param.ty = param.ty.bufferized();
            }
            for result in &mut func.results {
                *result = result.bufferized();
            }

            // Rewrite op-carried types.
            if let Some(mut body) = func.body.take() {
                rewrite_region(&mut body);
                func.body = Some(body);
            }

            // Prepend the kernel context to public functions with a body,
            // unless an earlier run already did.
            let needs_context = func.visibility == Visibility::Public
                && func.body.is_some()
                && func
                    .params
                    .first()
                    .map(|p| p.ty != IrType::KernelContext)
                    .unwrap_or(true);
            if needs_context {
                let value = func.new_value(IrType::KernelContext);
                func.params.insert(
                    0,
                    Param {
                        value,
                        ty: IrType::KernelContext,
                        attrs: Default::default(),
                    },
                );
            }
        }
        Ok(())
    }
}

fn rewrite_region(region: &mut crate::ir::Region) {
    use crate::ir::Op;
    for op in &mut region.ops {
        match op {
            Op::Alloc { ty, .. }
            | Op::Transpose { ty, .. }
            | Op::ConstDense { ty, .. }
            | Op::ReadyValue { ty, .. } => *ty = ty.bufferized(),
            Op::CustomCall { result_tys, .. } => {
                for ty in result_tys {
                    *ty = ty.bufferized();
                }
            }
            _ => {}
        }
        for nested in op.regions_mut() {
            rewrite_region(nested);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_module, DialectRegistry};
    use kiln_types::{DType, DYNAMIC_DIM};

    #[test]
    fn test_bufferize_signature() {
        let mut module = parse_module(
            r#"
            func @compute(%x: tensor<?x?xf32>) -> tensor<?x?xf32> {
              func.return %x : tensor<?x?xf32>
            }
            "#,
            &DialectRegistry::new(),
        )
        .unwrap();
        Bufferize.run(&mut module).unwrap();

        let func = module.lookup("compute").unwrap();
        assert_eq!(func.params.len(), 2);
        assert_eq!(func.params[0].ty, IrType::KernelContext);
        assert_eq!(
            func.params[1].ty,
            IrType::Memref {
                dims: vec![DYNAMIC_DIM, DYNAMIC_DIM],
                dtype: DType::F32
            }
        );
        assert_eq!(
            func.results[0],
            IrType::Memref {
                dims: vec![DYNAMIC_DIM, DYNAMIC_DIM],
                dtype: DType::F32
            }
        );
    }

    #[test]
    fn test_bufferize_idempotent() {
        let mut module = parse_module(
            "func @f(%x: tensor<2xi32>) { func.return }",
            &DialectRegistry::new(),
        )
        .unwrap();
        Bufferize.run(&mut module).unwrap();
        Bufferize.run(&mut module).unwrap();
        let func = module.lookup("f").unwrap();
        // Only one kernel context even after two runs.
        assert_eq!(func.params.len(), 2);
        assert_eq!(func.params[0].ty, IrType::KernelContext);
    }

    #[test]
    fn test_declarations_keep_no_context() {
        let mut dialects = DialectRegistry::new();
        dialects.register("testlib");
        let mut module = parse_module(
            r#"
            func private @decl(%a: !testlib.custom_arg) attributes { rt.custom_call = "decl" }
            func @f() { func.return }
            "#,
            &dialects,
        )
        .unwrap();
        Bufferize.run(&mut module).unwrap();
        assert_eq!(module.lookup("decl").unwrap().params.len(), 1);
    }
}
