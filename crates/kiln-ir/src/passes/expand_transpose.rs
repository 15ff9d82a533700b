//! Expansion of `rt.transpose` into allocation plus a loop nest.
//!
//! The permutation operand must resolve to an `rt.constant` dense literal,
//! which is what value specialization produces. A transpose whose
//! permutation is still a runtime value cannot be lowered and fails the
//! pass.

use rustc_hash::FxHashMap;

use crate::ir::{Function, Module, Op, Region, Value};
use crate::pass::{Pass, PassError};
use crate::types::IrType;
use kiln_types::DYNAMIC_DIM;

/// Rewrites `rt.transpose` ops into `memref.alloc` + `scf.for` nests.
pub struct ExpandTranspose;

impl Pass for ExpandTranspose {
    fn name(&self) -> &str {
        "expand-transpose"
    }

    fn run(&self, module: &mut Module) -> Result<(), PassError> {
        for func in &mut module.functions {
            if func.body.is_none() {
                continue;
            }
            // Dense constants visible anywhere in the function; value
            // specialization inserts them ahead of all uses.
            let mut dense: FxHashMap<Value, Vec<i64>> = FxHashMap::default();
            func.walk_ops(&mut |op| {
                if let Op::ConstDense { result, values, .. } = op {
                    dense.insert(*result, values.clone());
                }
            });

            let mut body = func.body.take().expect("checked above");
            let result = expand_region(&mut body, func, &dense);
            func.body = Some(body);
            result?;
        }
        Ok(())
    }
}

fn expand_region(
    region: &mut Region,
    func: &mut Function,
    dense: &FxHashMap<Value, Vec<i64>>,
) -> Result<(), PassError> {
    let mut ops = Vec::with_capacity(region.ops.len());
    for mut op in region.ops.drain(..) {
        for nested in op.regions_mut() {
            expand_region(nested, func, dense)?;
        }
        match op {
            Op::Transpose { result, input, perm, ty } => {
                let perm = dense.get(&perm).ok_or_else(|| {
                    PassError::new(
                        "expand-transpose",
                        "transpose permutation is not a compile-time constant; \
                         the operand requires value specialization",
                    )
                })?;
                expand_one(&mut ops, func, result, input, perm, &ty)?;
            }
            other => ops.push(other),
        }
    }
    region.ops = ops;
    Ok(())
}

/// Emit: per-dimension sizes, the output allocation (reusing the transpose
/// result value), and a rank-deep loop nest copying elements.
///
/// Semantics: `out.dims[j] == in.dims[perm[j]]` and
/// `out[i_0, .., i_{r-1}] == in[j_0, .., j_{r-1}]` with `j_{perm[k]} = i_k`.
fn expand_one(
    ops: &mut Vec<Op>,
    func: &mut Function,
    result: Value,
    input: Value,
    perm: &[i64],
    ty: &IrType,
) -> Result<(), PassError> {
    let dims = ty
        .dims()
        .ok_or_else(|| PassError::new("expand-transpose", "transpose result must be shaped"))?
        .to_vec();
    let rank = dims.len();

    if perm.len() != rank {
        return Err(PassError::new(
            "expand-transpose",
            format!("permutation rank {} does not match input rank {}", perm.len(), rank),
        ));
    }
    let mut seen = vec![false; rank];
    for &p in perm {
        if p < 0 || p as usize >= rank || seen[p as usize] {
            return Err(PassError::new(
                "expand-transpose",
                format!("invalid permutation {:?} for rank {}", perm, rank),
            ));
        }
        seen[p as usize] = true;
    }

    // Output extent per dimension: size of the permuted input dimension.
    let mut extents = Vec::with_capacity(rank);
    for j in 0..rank {
        let extent = func.new_value(IrType::Index);
        ops.push(Op::Dim {
            result: extent,
            source: input,
            index: perm[j] as usize,
        });
        extents.push(extent);
    }

    // Dynamic alloc sizes in dimension order.
    let dyn_sizes: Vec<Value> = dims
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == DYNAMIC_DIM)
        .map(|(j, _)| extents[j])
        .collect();
    ops.push(Op::Alloc {
        result,
        dyn_sizes,
        ty: ty.clone(),
        alignment: None,
    });

    let zero = func.new_value(IrType::Index);
    ops.push(Op::ConstInt {
        result: zero,
        value: 0,
        ty: IrType::Index,
    });

    // Induction variables, outermost first.
    let ivs: Vec<Value> = (0..rank).map(|_| func.new_value(IrType::Index)).collect();

    // Input index at position perm[k] is the output index k.
    let mut in_indices = vec![Value(0); rank];
    for (k, &p) in perm.iter().enumerate() {
        in_indices[p as usize] = ivs[k];
    }

    let loaded = func.new_value(IrType::Scalar(ty.dtype().expect("shaped type")));
    let mut innermost = Region {
        ops: vec![
            Op::Load {
                result: loaded,
                source: input,
                indices: in_indices,
            },
            Op::Store {
                value: loaded,
                dest: result,
                indices: ivs.clone(),
            },
        ],
    };

    // Wrap loops from the innermost dimension outwards.
    for j in (0..rank).rev() {
        innermost = Region {
            ops: vec![Op::For {
                iv: ivs[j],
                lower: zero,
                upper: extents[j],
                body: innermost,
            }],
        };
    }
    ops.extend(innermost.ops);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_module, DialectRegistry};
    use crate::passes::Bufferize;

    #[test]
    fn test_expand_with_constant_perm() {
        let mut module = parse_module(
            r#"
            func @f(%x: tensor<?x?xf32>) -> tensor<?x?xf32> {
              %p = rt.constant dense<[1, 0]> : tensor<2xi32>
              %t = rt.transpose %x, %p : tensor<?x?xf32>
              func.return %t : tensor<?x?xf32>
            }
            "#,
            &DialectRegistry::new(),
        )
        .unwrap();
        Bufferize.run(&mut module).unwrap();
        ExpandTranspose.run(&mut module).unwrap();

        let func = module.lookup("f").unwrap();
        let mut allocs = 0;
        let mut fors = 0;
        let mut transposes = 0;
        func.walk_ops(&mut |op| match op {
            Op::Alloc { .. } => allocs += 1,
            Op::For { .. } => fors += 1,
            Op::Transpose { .. } => transposes += 1,
            _ => {}
        });
        assert_eq!(allocs, 1);
        assert_eq!(fors, 2);
        assert_eq!(transposes, 0);
    }

    #[test]
    fn test_expand_requires_constant_perm() {
        let mut module = parse_module(
            r#"
            func @f(%x: tensor<?x?xf32>, %p: tensor<2xi32>) -> tensor<?x?xf32> {
              %t = rt.transpose %x, %p : tensor<?x?xf32>
              func.return %t : tensor<?x?xf32>
            }
            "#,
            &DialectRegistry::new(),
        )
        .unwrap();
        let err = ExpandTranspose.run(&mut module).unwrap_err();
        assert!(err.message.contains("value specialization"));
    }

    #[test]
    fn test_invalid_permutation_rejected() {
        let mut module = parse_module(
            r#"
            func @f(%x: tensor<?x?xf32>) -> tensor<?x?xf32> {
              %p = rt.constant dense<[1, 1]> : tensor<2xi32>
              %t = rt.transpose %x, %p : tensor<?x?xf32>
              func.return %t : tensor<?x?xf32>
            }
            "#,
            &DialectRegistry::new(),
        )
        .unwrap();
        let err = ExpandTranspose.run(&mut module).unwrap_err();
        assert!(err.message.contains("invalid permutation"));
    }
}
