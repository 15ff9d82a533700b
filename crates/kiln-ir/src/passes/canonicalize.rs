//! Constant folding and dead value cleanup.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::{BinOp, Function, Module, Op, Region, Value};
use crate::pass::{Pass, PassError};
use crate::types::IrType;
use kiln_types::DYNAMIC_DIM;

/// Folds integer/index arithmetic over constants, resolves `memref.dim` of
/// static dimensions, and drops unused pure ops. Iterates to a fixpoint.
pub struct Canonicalize;

impl Pass for Canonicalize {
    fn name(&self) -> &str {
        "canonicalize"
    }

    fn run(&self, module: &mut Module) -> Result<(), PassError> {
        for func in &mut module.functions {
            if func.body.is_none() {
                continue;
            }
            // Bounded fixpoint; each iteration either changes the function
            // or stops the loop.
            for _ in 0..8 {
                let folded = fold_constants(func);
                let removed = remove_dead_ops(func);
                if !folded && !removed {
                    break;
                }
            }
        }
        Ok(())
    }
}

fn collect_int_consts(region: &Region, consts: &mut FxHashMap<Value, i64>) {
    for op in &region.ops {
        if let Op::ConstInt { result, value, .. } = op {
            consts.insert(*result, *value);
        }
        for nested in op.regions() {
            collect_int_consts(nested, consts);
        }
    }
}

fn fold_constants(func: &mut Function) -> bool {
    let mut consts = FxHashMap::default();
    if let Some(body) = &func.body {
        collect_int_consts(body, &mut consts);
    }

    // Static dims of shaped values come from the value's type.
    let mut static_dims: FxHashMap<(Value, usize), i64> = FxHashMap::default();
    for v in 0..func.num_values() {
        let value = Value(v as u32);
        if let Some(dims) = func.value_type(value).dims() {
            for (i, d) in dims.iter().enumerate() {
                if *d != DYNAMIC_DIM {
                    static_dims.insert((value, i), *d);
                }
            }
        }
    }

    let mut body = match func.body.take() {
        Some(body) => body,
        None => return false,
    };
    let changed = fold_region(&mut body, &consts, &static_dims);
    func.body = Some(body);
    changed
}

fn fold_region(
    region: &mut Region,
    consts: &FxHashMap<Value, i64>,
    static_dims: &FxHashMap<(Value, usize), i64>,
) -> bool {
    let mut changed = false;
    for op in &mut region.ops {
        let replacement = match op {
            Op::Binary { result, op: bin, lhs, rhs, ty }
                if matches!(bin, BinOp::AddI | BinOp::SubI | BinOp::MulI) =>
            {
                match (consts.get(lhs), consts.get(rhs)) {
                    (Some(a), Some(b)) => {
                        let value = match bin {
                            BinOp::AddI => a.wrapping_add(*b),
                            BinOp::SubI => a.wrapping_sub(*b),
                            _ => a.wrapping_mul(*b),
                        };
                        Some(Op::ConstInt { result: *result, value, ty: ty.clone() })
                    }
                    _ => None,
                }
            }
            Op::Dim { result, source, index } => static_dims
                .get(&(*source, *index))
                .map(|d| Op::ConstInt { result: *result, value: *d, ty: IrType::Index }),
            _ => None,
        };
        if let Some(new_op) = replacement {
            *op = new_op;
            changed = true;
        }
        for nested in op.regions_mut() {
            changed |= fold_region(nested, consts, static_dims);
        }
    }
    changed
}

fn collect_used(region: &Region, used: &mut FxHashSet<Value>) {
    for op in &region.ops {
        for v in op.operands() {
            used.insert(v);
        }
        for nested in op.regions() {
            collect_used(nested, used);
        }
    }
}

fn is_pure_def(op: &Op) -> bool {
    matches!(
        op,
        Op::ConstInt { .. } | Op::ConstFloat { .. } | Op::ConstDense { .. } | Op::Dim { .. } | Op::Binary { .. }
    )
}

fn remove_dead_ops(func: &mut Function) -> bool {
    let mut used = FxHashSet::default();
    if let Some(body) = &func.body {
        collect_used(body, &mut used);
    }
    let mut body = match func.body.take() {
        Some(body) => body,
        None => return false,
    };
    let removed = remove_in_region(&mut body, &used);
    func.body = Some(body);
    removed
}

fn remove_in_region(region: &mut Region, used: &FxHashSet<Value>) -> bool {
    let before = region.ops.len();
    region.ops.retain(|op| {
        if !is_pure_def(op) {
            return true;
        }
        op.results().iter().any(|r| used.contains(r))
    });
    let mut removed = region.ops.len() != before;
    for op in &mut region.ops {
        for nested in op.regions_mut() {
            removed |= remove_in_region(nested, used);
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{parse_module, DialectRegistry};

    fn run(source: &str) -> Module {
        let mut module = parse_module(source, &DialectRegistry::new()).unwrap();
        Canonicalize.run(&mut module).unwrap();
        module
    }

    #[test]
    fn test_folds_integer_arithmetic() {
        let module = run(
            r#"
            func @f(%m: memref<?xf32>) {
              %a = arith.constant 3 : index
              %b = arith.constant 5 : index
              %c = arith.addi %a, %b : index
              %v = memref.load %m[%c] : memref<?xf32>
              memref.store %v, %m[%c] : memref<?xf32>
              func.return
            }
            "#,
        );
        let func = module.lookup("f").unwrap();
        let folded = func.body.as_ref().unwrap().ops.iter().any(
            |op| matches!(op, Op::ConstInt { value: 8, .. }),
        );
        assert!(folded, "expected addi to fold to 8");
    }

    #[test]
    fn test_folds_static_dim() {
        let module = run(
            r#"
            func @f(%m: memref<4xf32>) {
              %d = memref.dim %m, 0
              %v = memref.load %m[%d] : memref<4xf32>
              memref.store %v, %m[%d] : memref<4xf32>
              func.return
            }
            "#,
        );
        let func = module.lookup("f").unwrap();
        let folded = func.body.as_ref().unwrap().ops.iter().any(
            |op| matches!(op, Op::ConstInt { value: 4, .. }),
        );
        assert!(folded, "expected dim of static memref to fold");
    }

    #[test]
    fn test_removes_dead_constants() {
        let module = run(
            r#"
            func @f() {
              %dead = arith.constant 1 : index
              func.return
            }
            "#,
        );
        let func = module.lookup("f").unwrap();
        assert_eq!(func.body.as_ref().unwrap().ops.len(), 1);
    }

    #[test]
    fn test_keeps_dynamic_dim() {
        let module = run(
            r#"
            func @f(%m: memref<?xf32>) {
              %d = memref.dim %m, 0
              %v = memref.load %m[%d] : memref<?xf32>
              memref.store %v, %m[%d] : memref<?xf32>
              func.return
            }
            "#,
        );
        let func = module.lookup("f").unwrap();
        let has_dim = func
            .body
            .as_ref()
            .unwrap()
            .ops
            .iter()
            .any(|op| matches!(op, Op::Dim { .. }));
        assert!(has_dim, "dynamic dim must not fold");
    }
}
