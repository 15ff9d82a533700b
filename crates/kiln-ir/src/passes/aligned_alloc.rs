//! Alignment enforcement for dynamic allocations.

use crate::ir::{Module, Op, Region};
use crate::pass::{Pass, PassError};

/// Stamps a minimum alignment onto every `memref.alloc`. Allocations that
/// already request a larger alignment keep it.
pub struct AlignedAlloc {
    alignment: u64,
}

impl AlignedAlloc {
    /// Create the pass with the configured minimum alignment. Zero disables
    /// the rewrite.
    pub fn new(alignment: u64) -> Self {
        AlignedAlloc { alignment }
    }
}

impl Pass for AlignedAlloc {
    fn name(&self) -> &str {
        "aligned-alloc"
    }

    fn run(&self, module: &mut Module) -> Result<(), PassError> {
        if self.alignment == 0 {
            return Ok(());
        }
        for func in &mut module.functions {
            if let Some(body) = &mut func.body {
                visit(body, self.alignment);
            }
        }
        Ok(())
    }
}

fn visit(region: &mut Region, alignment: u64) {
    for op in &mut region.ops {
        if let Op::Alloc { alignment: a, .. } = op {
            let current = a.unwrap_or(0);
            if current < alignment {
                *a = Some(alignment);
            }
        }
        for nested in op.regions_mut() {
            visit(nested, alignment);
        }
    }
}
