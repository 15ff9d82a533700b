//! Built-in passes.
//!
//! The compilation pipeline a client registers runs first and lowers its own
//! abstractions; these passes cover the common tail:
//! - [`Bufferize`]: the default calling convention (tensors become memrefs,
//!   the kernel-context operand is prepended)
//! - [`Canonicalize`]: constant folding and dead value cleanup
//! - [`ExpandTranspose`]: rewrites `rt.transpose` into loops, requiring a
//!   compile-time-constant permutation
//! - [`AlignedAlloc`]: enforces a minimum alignment on all allocations

mod aligned_alloc;
mod bufferize;
mod canonicalize;
mod expand_transpose;

pub use aligned_alloc::AlignedAlloc;
pub use bufferize::Bufferize;
pub use canonicalize::Canonicalize;
pub use expand_transpose::ExpandTranspose;

use crate::pass::PassManager;

/// Register the default compilation pipeline: lowers user-facing signatures
/// to the runtime calling convention. Clients with their own dialects add
/// passes in front of this.
pub fn register_default_pipeline(pm: &mut PassManager) {
    pm.add_pass(Bufferize);
}
