//! Host-side argument objects.
//!
//! Every argument knows how to verify itself against a runtime type and how
//! to pack itself into the flat `void**` argument array. Packing writes
//! pointers to storage owned by the argument, so the caller must keep the
//! argument (and any buffers it references) alive for the duration of the
//! call, including async tasks the call spawns.

use std::ffi::c_void;
use std::fmt;

use smallvec::SmallVec;

use crate::error::{Error, Result};
use kiln_types::{DType, Type, DYNAMIC_DIM};

/// A value passed to a compiled entrypoint.
pub trait Argument: fmt::Debug {
    /// Check that this argument matches the expected runtime type.
    fn verify(&self, ty: &Type) -> Result<()>;

    /// Pack pointers into `slots` starting at `offset`; returns the offset
    /// just past the written slots. Writes exactly
    /// `ty.as_argument().num_slots` pointers.
    fn pack(&self, slots: &mut [*mut c_void], offset: usize) -> usize;
}

// ---------------------------------------------------------------------------
// OpaqueArg
// ---------------------------------------------------------------------------

/// A raw pointer argument, packed as a single slot holding a pointer to the
/// stored pointer.
#[derive(Debug)]
pub struct OpaqueArg {
    ptr: *mut c_void,
}

impl OpaqueArg {
    /// Wrap a raw pointer.
    pub fn new(ptr: *mut c_void) -> Self {
        OpaqueArg { ptr }
    }

    /// The wrapped pointer.
    pub fn ptr(&self) -> *mut c_void {
        self.ptr
    }
}

impl Argument for OpaqueArg {
    fn verify(&self, ty: &Type) -> Result<()> {
        match ty {
            Type::Opaque | Type::KernelContext | Type::Ext(_) => Ok(()),
            other => Err(Error::Signature(format!(
                "expected opaque-compatible type, got {}",
                other
            ))),
        }
    }

    fn pack(&self, slots: &mut [*mut c_void], offset: usize) -> usize {
        slots[offset] = &self.ptr as *const *mut c_void as *mut c_void;
        offset + 1
    }
}

// ---------------------------------------------------------------------------
// MemrefDesc
// ---------------------------------------------------------------------------

/// A strided memref argument: dtype, base pointer, offset, sizes, strides.
///
/// Sizes and strides live in one inline buffer so common ranks stay free of
/// heap allocation.
#[derive(Debug)]
pub struct MemrefDesc {
    rank: usize,
    dtype: DType,
    data: *mut c_void,
    offset: i64,
    sizes_and_strides: SmallVec<[i64; 8]>,
}

impl MemrefDesc {
    /// Create a descriptor; `sizes` and `strides` must have equal length.
    pub fn new(
        dtype: DType,
        data: *mut c_void,
        offset: i64,
        sizes: &[i64],
        strides: &[i64],
    ) -> Self {
        debug_assert_eq!(sizes.len(), strides.len(), "invalid sizes/strides pair");
        let mut sizes_and_strides = SmallVec::with_capacity(2 * sizes.len());
        sizes_and_strides.extend_from_slice(sizes);
        sizes_and_strides.extend_from_slice(strides);
        MemrefDesc {
            rank: sizes.len(),
            dtype,
            data,
            offset,
            sizes_and_strides,
        }
    }

    /// Memref rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Base data pointer.
    pub fn data(&self) -> *mut c_void {
        self.data
    }

    /// Element offset from the data pointer.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Sizes per dimension.
    pub fn sizes(&self) -> &[i64] {
        &self.sizes_and_strides[..self.rank]
    }

    /// Strides per dimension.
    pub fn strides(&self) -> &[i64] {
        &self.sizes_and_strides[self.rank..]
    }
}

impl Argument for MemrefDesc {
    fn verify(&self, ty: &Type) -> Result<()> {
        let (dims, dtype) = match ty {
            Type::Memref { dims, dtype } | Type::RankedTensor { dims, dtype } => (dims, dtype),
            other => {
                return Err(Error::Signature(format!(
                    "expected memref-compatible type, got {}",
                    other
                )))
            }
        };
        if self.rank != dims.len() {
            return Err(Error::Signature(format!(
                "operand rank does not match expected input rank: {} vs {}",
                self.rank,
                dims.len()
            )));
        }
        for (d, (&operand_dim, &expected_dim)) in
            self.sizes().iter().zip(dims.iter()).enumerate()
        {
            if expected_dim != DYNAMIC_DIM && operand_dim != expected_dim {
                return Err(Error::Signature(format!(
                    "operand dimension #{} does not match expected input dimension: {} vs {}",
                    d, operand_dim, expected_dim
                )));
            }
        }
        if self.dtype != *dtype {
            return Err(Error::Signature(format!(
                "operand element type does not match expected input element type: {} vs {}",
                self.dtype, dtype
            )));
        }
        Ok(())
    }

    // Layout: base, aligned data, offset, sizes[rank], strides[rank]. Each
    // slot points at the field's storage inside this descriptor.
    fn pack(&self, slots: &mut [*mut c_void], offset: usize) -> usize {
        let mut at = offset;
        let mut push = |p: *const i64| {
            slots[at] = p as *mut c_void;
            at += 1;
        };
        push(&self.data as *const *mut c_void as *const i64);
        push(&self.data as *const *mut c_void as *const i64);
        push(&self.offset);
        for size in self.sizes() {
            push(size);
        }
        for stride in self.strides() {
            push(stride);
        }
        at
    }
}

// ---------------------------------------------------------------------------
// Arguments container and view
// ---------------------------------------------------------------------------

/// One stored argument. The canonical kinds are inline; extension arguments
/// fall back to a boxed trait object.
#[derive(Debug)]
pub enum ArgValue {
    Opaque(OpaqueArg),
    Memref(MemrefDesc),
    Ext(Box<dyn Argument>),
}

impl ArgValue {
    fn as_argument(&self) -> &dyn Argument {
        match self {
            ArgValue::Opaque(arg) => arg,
            ArgValue::Memref(arg) => arg,
            ArgValue::Ext(arg) => arg.as_ref(),
        }
    }
}

impl From<OpaqueArg> for ArgValue {
    fn from(arg: OpaqueArg) -> Self {
        ArgValue::Opaque(arg)
    }
}

impl From<MemrefDesc> for ArgValue {
    fn from(arg: MemrefDesc) -> Self {
        ArgValue::Memref(arg)
    }
}

/// An owning, contiguous container of heterogeneous arguments.
#[derive(Debug, Default)]
pub struct Arguments {
    storage: Vec<ArgValue>,
}

impl Arguments {
    /// Create a container sized for `num_args` arguments.
    pub fn new(num_args: usize) -> Self {
        Arguments {
            storage: Vec::with_capacity(num_args),
        }
    }

    /// Append a canonical argument.
    pub fn push(&mut self, arg: impl Into<ArgValue>) {
        self.storage.push(arg.into());
    }

    /// Append an extension argument.
    pub fn push_ext(&mut self, arg: impl Argument + 'static) {
        self.storage.push(ArgValue::Ext(Box::new(arg)));
    }

    /// Number of stored arguments.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Whether the container is empty.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// The argument at `index`.
    pub fn get(&self, index: usize) -> &dyn Argument {
        self.storage[index].as_argument()
    }
}

/// A non-owning view over any argument container, giving uniform random
/// access to `&dyn Argument`.
#[derive(Clone, Copy)]
pub struct ArgumentsRef<'a> {
    inner: RefInner<'a>,
}

#[derive(Clone, Copy)]
enum RefInner<'a> {
    Values(&'a [ArgValue]),
    Memrefs(&'a [MemrefDesc]),
}

impl<'a> ArgumentsRef<'a> {
    /// Number of arguments in the view.
    pub fn len(&self) -> usize {
        match self.inner {
            RefInner::Values(values) => values.len(),
            RefInner::Memrefs(memrefs) => memrefs.len(),
        }
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The argument at `index`.
    pub fn get(&self, index: usize) -> &'a dyn Argument {
        match self.inner {
            RefInner::Values(values) => values[index].as_argument(),
            RefInner::Memrefs(memrefs) => &memrefs[index],
        }
    }

    /// Iterate over arguments in order.
    pub fn iter(&self) -> impl Iterator<Item = &'a dyn Argument> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    /// Memref descriptor at `index`, if the view is memref-backed or the
    /// stored argument is a memref. Used by shape fingerprinting and
    /// specialization.
    pub fn memref(&self, index: usize) -> Option<&'a MemrefDesc> {
        match self.inner {
            RefInner::Memrefs(memrefs) => memrefs.get(index),
            RefInner::Values(values) => match values.get(index) {
                Some(ArgValue::Memref(desc)) => Some(desc),
                _ => None,
            },
        }
    }
}

impl<'a> From<&'a Arguments> for ArgumentsRef<'a> {
    fn from(args: &'a Arguments) -> Self {
        ArgumentsRef {
            inner: RefInner::Values(&args.storage),
        }
    }
}

impl<'a> From<&'a [MemrefDesc]> for ArgumentsRef<'a> {
    fn from(memrefs: &'a [MemrefDesc]) -> Self {
        ArgumentsRef {
            inner: RefInner::Memrefs(memrefs),
        }
    }
}

impl<'a> From<&'a Vec<MemrefDesc>> for ArgumentsRef<'a> {
    fn from(memrefs: &'a Vec<MemrefDesc>) -> Self {
        ArgumentsRef::from(memrefs.as_slice())
    }
}
