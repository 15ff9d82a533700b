//! The C ABI between the host runtime and JIT-compiled code.
//!
//! Compiled entrypoints have the signature `void f(void** args)`: `args`
//! holds one pointer per packed input slot followed by one pointer per
//! result cell. Generated code calls back into the host through a small set
//! of `extern "C"` hooks resolved by name from a [`SymbolMap`]; the same map
//! is registered for fresh compiles and for executables reloaded from
//! object files.

use std::ffi::c_void;

use rustc_hash::FxHashMap;

use crate::error::Error;
use kiln_types::DType;

/// Signature of a compiled entrypoint.
pub type EntryFn = unsafe extern "C" fn(args: *mut *mut c_void);

// Names of the runtime hooks the generated code links against.
pub const SYM_ALIGNED_ALLOC: &str = "kiln_rt_aligned_alloc";
pub const SYM_CUSTOM_CALL: &str = "kiln_rt_custom_call";
pub const SYM_ASYNC_READY_TOKEN: &str = "kiln_rt_async_ready_token";
pub const SYM_ASYNC_READY_VALUE: &str = "kiln_rt_async_ready_value";

/// Function-pointer table through which generated code reaches the host.
///
/// Calls from JIT code are indirect loads from this table rather than
/// relocated direct calls, so compiled code needs no call relocations and
/// object files replay against whatever symbol map the loader supplies.
/// Entries are raw addresses resolved from a [`SymbolMap`]; field order is
/// the ABI (see [`helper_offsets`]).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HelperTable {
    /// `kiln_rt_aligned_alloc(size, align) -> ptr`
    pub aligned_alloc: usize,
    /// `kiln_rt_custom_call(ctx, callee, args, attrs) -> bool`
    pub custom_call: usize,
    /// `kiln_rt_async_ready_token() -> handle`
    pub async_ready_token: usize,
    /// `kiln_rt_async_ready_value(descriptor, rank, dtype_code) -> handle`
    pub async_ready_value: usize,
}

/// Byte offsets of [`HelperTable`] entries inside [`KernelContext`], used
/// by the code generator.
pub(crate) mod helper_offsets {
    pub const ALIGNED_ALLOC: i32 = 0;
    pub const CUSTOM_CALL: i32 = 8;
    pub const ASYNC_READY_TOKEN: i32 = 16;
    pub const ASYNC_READY_VALUE: i32 = 24;
}

impl HelperTable {
    /// Resolve the table from a symbol map; every hook must be present.
    pub fn from_symbol_map(symbols: &SymbolMap) -> crate::error::Result<HelperTable> {
        let resolve = |name: &str| {
            symbols
                .get(name)
                .map(|p| p as usize)
                .ok_or_else(|| Error::Execution(format!("runtime symbol `{}` not registered", name)))
        };
        Ok(HelperTable {
            aligned_alloc: resolve(SYM_ALIGNED_ALLOC)?,
            custom_call: resolve(SYM_CUSTOM_CALL)?,
            async_ready_token: resolve(SYM_ASYNC_READY_TOKEN)?,
            async_ready_value: resolve(SYM_ASYNC_READY_VALUE)?,
        })
    }
}

/// Per-call state passed to the generated code as its leading
/// `!rt.kernel_context` operand.
///
/// The helper table sits at offset zero so generated code can load hook
/// addresses at fixed offsets; everything after it is host-only state.
#[repr(C)]
pub struct KernelContext {
    /// Hook addresses, read by generated code.
    pub(crate) helpers: HelperTable,
    /// First failure reported by a custom call, if any.
    pub(crate) error: Option<String>,
    /// Caller-provided `UserData` map, type-erased; null when none.
    pub(crate) user_data: *const (),
    /// `CustomCallRegistry` for this invocation, type-erased; null when
    /// none.
    pub(crate) registry: *const (),
}

impl KernelContext {
    pub(crate) fn new(
        helpers: HelperTable,
        user_data: Option<&crate::custom_call::UserData<'_>>,
        registry: Option<&crate::custom_call::CustomCallRegistry>,
    ) -> Self {
        KernelContext {
            helpers,
            error: None,
            user_data: user_data.map_or(std::ptr::null(), |u| u as *const _ as *const ()),
            registry: registry.map_or(std::ptr::null(), |r| r as *const _ as *const ()),
        }
    }
}

// ---------------------------------------------------------------------------
// Type codes
// ---------------------------------------------------------------------------

/// Stable `u64` codes identifying host types in the custom-call encoding.
///
/// Rust `TypeId` has no stable ABI representation the generated code could
/// embed, so the wire format uses these codes; decoders map them back to
/// host types. Codes below [`TypeCode::CUSTOM_BASE`] are fixed; custom
/// types hash their registered name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeCode(pub u64);

impl TypeCode {
    pub const I1: TypeCode = TypeCode(1);
    pub const I8: TypeCode = TypeCode(2);
    pub const I16: TypeCode = TypeCode(3);
    pub const I32: TypeCode = TypeCode(4);
    pub const I64: TypeCode = TypeCode(5);
    pub const UI8: TypeCode = TypeCode(6);
    pub const UI16: TypeCode = TypeCode(7);
    pub const UI32: TypeCode = TypeCode(8);
    pub const UI64: TypeCode = TypeCode(9);
    pub const F32: TypeCode = TypeCode(10);
    pub const F64: TypeCode = TypeCode(11);
    pub const STRING: TypeCode = TypeCode(12);
    /// A strided memref encoded as [`EncodedMemref`].
    pub const MEMREF: TypeCode = TypeCode(64);

    /// First code available to custom types.
    pub const CUSTOM_BASE: u64 = 1 << 32;

    /// Code of a scalar element type.
    pub fn of_dtype(dtype: DType) -> TypeCode {
        match dtype {
            DType::I1 => TypeCode::I1,
            DType::I8 => TypeCode::I8,
            DType::I16 => TypeCode::I16,
            DType::I32 => TypeCode::I32,
            DType::I64 => TypeCode::I64,
            DType::UI8 => TypeCode::UI8,
            DType::UI16 => TypeCode::UI16,
            DType::UI32 => TypeCode::UI32,
            DType::UI64 => TypeCode::UI64,
            DType::F32 => TypeCode::F32,
            DType::F64 => TypeCode::F64,
            // Complex scalars do not cross the custom-call boundary.
            DType::Complex64 => TypeCode(13),
            DType::Complex128 => TypeCode(14),
        }
    }

    /// Element type for a scalar code.
    pub fn to_dtype(self) -> Option<DType> {
        Some(match self {
            TypeCode::I1 => DType::I1,
            TypeCode::I8 => DType::I8,
            TypeCode::I16 => DType::I16,
            TypeCode::I32 => DType::I32,
            TypeCode::I64 => DType::I64,
            TypeCode::UI8 => DType::UI8,
            TypeCode::UI16 => DType::UI16,
            TypeCode::UI32 => DType::UI32,
            TypeCode::UI64 => DType::UI64,
            TypeCode::F32 => DType::F32,
            TypeCode::F64 => DType::F64,
            TypeCode(13) => DType::Complex64,
            TypeCode(14) => DType::Complex128,
            _ => return None,
        })
    }

    /// Deterministic code for a named custom type (FNV-1a over the name,
    /// offset into the custom range). Stable across processes so encoded
    /// attributes survive the object-file round-trip.
    pub fn of_custom(name: &str) -> TypeCode {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in name.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x100_0000_01b3);
        }
        TypeCode(TypeCode::CUSTOM_BASE | (hash >> 1))
    }
}

/// Encoded strided memref, the `value` payload of a [`TypeCode::MEMREF`]
/// custom-call argument. `descriptor` points at the standard inline
/// descriptor `{base, data, offset: i64, sizes: [i64; rank],
/// strides: [i64; rank]}`.
#[repr(C)]
pub struct EncodedMemref {
    /// Scalar code of the element type.
    pub element_type: u64,
    /// Memref rank.
    pub rank: i64,
    /// Pointer to the strided descriptor.
    pub descriptor: *mut c_void,
}

// ---------------------------------------------------------------------------
// Runtime symbol map
// ---------------------------------------------------------------------------

/// Name → address map used to resolve host symbols when code is placed in
/// executable memory.
#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    entries: FxHashMap<String, usize>,
}

impl SymbolMap {
    /// Create an empty map.
    pub fn new() -> Self {
        SymbolMap::default()
    }

    /// Register a symbol address.
    pub fn insert(&mut self, name: impl Into<String>, addr: *const u8) {
        self.entries.insert(name.into(), addr as usize);
    }

    /// Resolve a symbol.
    pub fn get(&self, name: &str) -> Option<*const u8> {
        self.entries.get(name).map(|a| *a as *const u8)
    }

    /// Merge `other` into `self`, overriding duplicates.
    pub fn extend(&mut self, other: &SymbolMap) {
        for (name, addr) in &other.entries {
            self.entries.insert(name.clone(), *addr);
        }
    }
}

/// The hooks every executable links against: allocation, custom-call
/// dispatch, and the async runtime API.
pub fn runtime_symbol_map() -> SymbolMap {
    let mut map = SymbolMap::new();
    map.insert(SYM_ALIGNED_ALLOC, kiln_rt_aligned_alloc as *const u8);
    map.insert(
        SYM_CUSTOM_CALL,
        crate::custom_call::kiln_rt_custom_call as *const u8,
    );
    map.insert(
        SYM_ASYNC_READY_TOKEN,
        crate::async_rt::kiln_rt_async_ready_token as *const u8,
    );
    map.insert(
        SYM_ASYNC_READY_VALUE,
        crate::async_rt::kiln_rt_async_ready_value as *const u8,
    );
    map
}

// ---------------------------------------------------------------------------
// Allocation hooks
// ---------------------------------------------------------------------------

/// Allocate `size` bytes with at least `align` alignment. Returned memory is
/// released with `libc::free`, which is also the deleter installed on host
/// buffers that adopt callee-allocated memrefs.
pub(crate) unsafe extern "C" fn kiln_rt_aligned_alloc(size: u64, align: u64) -> *mut c_void {
    let size = size.max(1) as usize;
    if align <= std::mem::size_of::<*const ()>() as u64 {
        return libc::malloc(size);
    }
    let mut ptr: *mut c_void = std::ptr::null_mut();
    // posix_memalign requires a power-of-two multiple of the pointer size.
    let align = (align as usize).next_power_of_two();
    if libc::posix_memalign(&mut ptr, align, size) != 0 {
        return std::ptr::null_mut();
    }
    ptr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_codes_roundtrip() {
        for dtype in [
            DType::I1,
            DType::I32,
            DType::UI64,
            DType::F32,
            DType::F64,
            DType::Complex128,
        ] {
            assert_eq!(TypeCode::of_dtype(dtype).to_dtype(), Some(dtype));
        }
        assert_eq!(TypeCode::MEMREF.to_dtype(), None);
    }

    #[test]
    fn test_custom_codes_stable_and_distinct() {
        let a = TypeCode::of_custom("testlib.custom_arg");
        let b = TypeCode::of_custom("testlib.custom_arg");
        let c = TypeCode::of_custom("testlib.other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.0 >= TypeCode::CUSTOM_BASE);
    }

    #[test]
    fn test_aligned_alloc() {
        unsafe {
            let p = kiln_rt_aligned_alloc(64, 64);
            assert!(!p.is_null());
            assert_eq!(p as usize % 64, 0);
            libc::free(p);

            let q = kiln_rt_aligned_alloc(16, 0);
            assert!(!q.is_null());
            libc::free(q);
        }
    }

    #[test]
    fn test_symbol_map() {
        let map = runtime_symbol_map();
        assert!(map.get(SYM_ALIGNED_ALLOC).is_some());
        assert!(map.get(SYM_CUSTOM_CALL).is_some());
        assert!(map.get("nope").is_none());
    }

    #[test]
    fn test_helper_table_resolution() {
        let table = HelperTable::from_symbol_map(&runtime_symbol_map()).unwrap();
        assert_ne!(table.custom_call, 0);

        let incomplete = SymbolMap::new();
        assert!(HelperTable::from_symbol_map(&incomplete).is_err());
    }

    #[test]
    fn test_helper_table_leads_kernel_context() {
        // Generated code loads hooks at fixed offsets from the context
        // pointer; the table must sit at offset zero.
        assert_eq!(std::mem::offset_of!(KernelContext, helpers), 0);
        assert_eq!(
            std::mem::offset_of!(HelperTable, custom_call),
            helper_offsets::CUSTOM_CALL as usize
        );
        assert_eq!(
            std::mem::offset_of!(HelperTable, async_ready_value),
            helper_offsets::ASYNC_READY_VALUE as usize
        );
    }
}
