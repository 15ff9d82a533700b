//! Custom-call registry and dispatch.
//!
//! Compiled code calls host "intrinsics" by name through a single
//! `extern "C"` dispatcher. Each registered handler declares its expected
//! user data, an ordered argument list, and a set of named attributes; the
//! dispatcher walks that descriptor, type-checks the packed
//! `(type_code, value)` pairs the generated code built, and invokes the
//! handler with typed accessors.
//!
//! Wire format built by the code generator:
//! - arguments: `[count: u64][(type_code: u64, value: ptr); count]`
//! - attributes: `[count: u64][(name: *const c_char, type_code: u64,
//!   value: ptr); count]`, attribute payloads and names in rodata

use std::any::{Any, TypeId};
use std::ffi::{c_char, c_void, CStr};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::abi::{EncodedMemref, KernelContext, TypeCode};
use crate::error::{Error, Result};
use kiln_types::DType;

// ---------------------------------------------------------------------------
// User data
// ---------------------------------------------------------------------------

/// Host-side context structs made available to handlers for one invocation,
/// keyed by type.
#[derive(Default)]
pub struct UserData<'a> {
    map: FxHashMap<TypeId, &'a (dyn Any + Send + Sync)>,
}

impl<'a> UserData<'a> {
    /// Create an empty map.
    pub fn new() -> Self {
        UserData::default()
    }

    /// Insert a context struct; replaces any previous value of the same
    /// type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: &'a T) {
        self.map.insert(TypeId::of::<T>(), value);
    }

    /// Look up a context struct by type.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&'a T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|v| <dyn Any>::downcast_ref(*v))
    }
}

// ---------------------------------------------------------------------------
// Decoded views
// ---------------------------------------------------------------------------

/// A strided memref as seen by a custom-call handler.
#[derive(Debug, Clone)]
pub struct MemrefView {
    pub dtype: DType,
    pub data: *mut c_void,
    pub offset: i64,
    pub sizes: Vec<i64>,
    pub strides: Vec<i64>,
}

/// A memref collapsed to its total byte size; shape detail is dropped
/// eagerly.
#[derive(Debug, Clone)]
pub struct FlatMemrefView {
    pub dtype: DType,
    pub data: *mut c_void,
    pub size_in_bytes: usize,
}

unsafe fn decode_encoded_memref(value: *mut c_void) -> Result<MemrefView> {
    let encoded = &*(value as *const EncodedMemref);
    let dtype = TypeCode(encoded.element_type).to_dtype().ok_or_else(|| {
        Error::CustomCallArgMismatch(format!(
            "invalid memref element type code {}",
            encoded.element_type
        ))
    })?;
    let rank = encoded.rank.max(0) as usize;
    let words = encoded.descriptor as *const u64;
    let data = *words.add(1) as *mut c_void;
    let offset = *words.add(2) as i64;
    let mut sizes = Vec::with_capacity(rank);
    let mut strides = Vec::with_capacity(rank);
    for d in 0..rank {
        sizes.push(*words.add(3 + d) as i64);
        strides.push(*words.add(3 + rank + d) as i64);
    }
    Ok(MemrefView {
        dtype,
        data,
        offset,
        sizes,
        strides,
    })
}

// ---------------------------------------------------------------------------
// Typed decoding
// ---------------------------------------------------------------------------

/// A type decodable from a custom-call argument slot.
pub trait CustomCallArg: Sized {
    /// Whether the encoded type code matches this host type.
    fn matches(code: TypeCode) -> bool;

    /// Decode the value.
    ///
    /// # Safety
    /// `value` must be the payload the generated code packed for a slot
    /// whose code passed [`CustomCallArg::matches`].
    unsafe fn decode(code: TypeCode, value: *mut c_void) -> Result<Self>;
}

macro_rules! scalar_arg {
    ($ty:ty, $code:expr, $read:ty) => {
        impl CustomCallArg for $ty {
            fn matches(code: TypeCode) -> bool {
                code == $code
            }
            unsafe fn decode(_code: TypeCode, value: *mut c_void) -> Result<Self> {
                Ok(*(value as *const $read) as $ty)
            }
        }
    };
}

// Integer scalars are spilled as 8-byte cells; floats keep their width.
scalar_arg!(i32, TypeCode::I32, i64);
scalar_arg!(i64, TypeCode::I64, i64);
scalar_arg!(u32, TypeCode::UI32, i64);
scalar_arg!(u64, TypeCode::UI64, u64);
scalar_arg!(f32, TypeCode::F32, f32);
scalar_arg!(f64, TypeCode::F64, f64);

impl CustomCallArg for MemrefView {
    fn matches(code: TypeCode) -> bool {
        code == TypeCode::MEMREF
    }
    unsafe fn decode(_code: TypeCode, value: *mut c_void) -> Result<Self> {
        decode_encoded_memref(value)
    }
}

impl CustomCallArg for FlatMemrefView {
    fn matches(code: TypeCode) -> bool {
        code == TypeCode::MEMREF
    }
    unsafe fn decode(code: TypeCode, value: *mut c_void) -> Result<Self> {
        let view = MemrefView::decode(code, value)?;
        let num_elements: i64 = view.sizes.iter().product();
        Ok(FlatMemrefView {
            dtype: view.dtype,
            data: view.data,
            size_in_bytes: num_elements.max(0) as usize * view.dtype.size_in_bytes(),
        })
    }
}

/// A type decodable from a custom-call attribute payload.
pub trait CustomCallAttr: Sized {
    /// Whether the encoded type code matches this host type.
    fn matches(code: TypeCode) -> bool;

    /// Decode the payload.
    ///
    /// # Safety
    /// `value` must be the rodata payload encoded for an attribute whose
    /// code passed [`CustomCallAttr::matches`].
    unsafe fn decode(code: TypeCode, value: *const c_void) -> Result<Self>;
}

macro_rules! scalar_attr {
    ($ty:ty, $code:expr, $read:ty) => {
        impl CustomCallAttr for $ty {
            fn matches(code: TypeCode) -> bool {
                code == $code
            }
            unsafe fn decode(_code: TypeCode, value: *const c_void) -> Result<Self> {
                Ok(*(value as *const $read) as $ty)
            }
        }
    };
}

scalar_attr!(i32, TypeCode::I32, i64);
scalar_attr!(i64, TypeCode::I64, i64);
scalar_attr!(u32, TypeCode::UI32, i64);
scalar_attr!(u64, TypeCode::UI64, u64);
scalar_attr!(f32, TypeCode::F32, f32);
scalar_attr!(f64, TypeCode::F64, f64);

impl CustomCallAttr for String {
    fn matches(code: TypeCode) -> bool {
        code == TypeCode::STRING
    }
    unsafe fn decode(_code: TypeCode, value: *const c_void) -> Result<Self> {
        // Payload: {len: u64, bytes...}
        let len = *(value as *const u64) as usize;
        let bytes = std::slice::from_raw_parts((value as *const u8).add(8), len);
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::CustomCallAttrMismatch("attribute is not UTF-8".into()))
    }
}

// ---------------------------------------------------------------------------
// Call context
// ---------------------------------------------------------------------------

/// Typed access to one dispatched call: user data, arguments, attributes.
pub struct CallContext<'a> {
    user_data: Option<&'a UserData<'a>>,
    args: &'a [(TypeCode, *mut c_void)],
    attrs: &'a [(&'a str, TypeCode, *const c_void)],
}

impl<'a> CallContext<'a> {
    /// Resolve a user-data struct declared by the handler.
    pub fn user_data<T: Any + Send + Sync>(&self) -> Result<&'a T> {
        self.user_data
            .and_then(UserData::get::<T>)
            .ok_or_else(|| {
                Error::CustomCallArgMismatch(format!(
                    "user data of type {} not provided",
                    std::any::type_name::<T>()
                ))
            })
    }

    /// Number of packed arguments.
    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// Decode argument `index` as `T`.
    pub fn arg<T: CustomCallArg>(&self, index: usize) -> Result<T> {
        let (code, value) = *self.args.get(index).ok_or_else(|| {
            Error::CustomCallArgMismatch(format!("argument #{} out of range", index))
        })?;
        if !T::matches(code) {
            return Err(Error::CustomCallArgMismatch(format!(
                "argument #{} has type code {}, incompatible with {}",
                index,
                code.0,
                std::any::type_name::<T>()
            )));
        }
        // Safety: the code matched the expected host type.
        unsafe { T::decode(code, value) }
    }

    /// Decode attribute `name` as `T`.
    pub fn attr<T: CustomCallAttr>(&self, name: &str) -> Result<T> {
        let (_, code, value) = self
            .attrs
            .iter()
            .find(|(n, _, _)| *n == name)
            .copied()
            .ok_or_else(|| {
                Error::CustomCallAttrMismatch(format!("attribute `{}` not present", name))
            })?;
        if !T::matches(code) {
            return Err(Error::CustomCallAttrMismatch(format!(
                "attribute `{}` has type code {}, incompatible with {}",
                name,
                code.0,
                std::any::type_name::<T>()
            )));
        }
        // Safety: the code matched the expected host type.
        unsafe { T::decode(code, value) }
    }
}

// ---------------------------------------------------------------------------
// Handler descriptor and builder
// ---------------------------------------------------------------------------

type Handler = Arc<dyn Fn(&CallContext<'_>) -> std::result::Result<(), String> + Send + Sync>;
type CodeCheck = fn(TypeCode) -> bool;
type UserDataCheck = fn(&UserData<'_>) -> bool;

/// A registered custom call: the declared shape of the call plus the
/// type-erased handler the dispatcher invokes.
pub struct CustomCall {
    name: String,
    arg_checks: Vec<CodeCheck>,
    attr_checks: Vec<(String, CodeCheck)>,
    user_data_checks: Vec<(&'static str, UserDataCheck)>,
    handler: Handler,
}

impl CustomCall {
    /// Start declaring a handler for `name`.
    pub fn bind(name: impl Into<String>) -> CustomCallBuilder {
        CustomCallBuilder {
            name: name.into(),
            arg_checks: Vec::new(),
            attr_checks: Vec::new(),
            user_data_checks: Vec::new(),
        }
    }

    /// Registered callee name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Builder collecting the declared user data, arguments, and attributes of
/// a custom call.
pub struct CustomCallBuilder {
    name: String,
    arg_checks: Vec<CodeCheck>,
    attr_checks: Vec<(String, CodeCheck)>,
    user_data_checks: Vec<(&'static str, UserDataCheck)>,
}

impl CustomCallBuilder {
    /// Declare a required user-data dependency.
    pub fn user_data<T: Any + Send + Sync>(mut self) -> Self {
        self.user_data_checks
            .push((std::any::type_name::<T>(), |ud| ud.get::<T>().is_some()));
        self
    }

    /// Declare the next expected argument.
    pub fn arg<T: CustomCallArg>(mut self) -> Self {
        self.arg_checks.push(T::matches);
        self
    }

    /// Declare an expected attribute.
    pub fn attr<T: CustomCallAttr>(mut self, name: impl Into<String>) -> Self {
        self.attr_checks.push((name.into(), T::matches));
        self
    }

    /// Attach the receiver and finish the descriptor.
    pub fn to(
        self,
        handler: impl Fn(&CallContext<'_>) -> std::result::Result<(), String>
            + Send
            + Sync
            + 'static,
    ) -> CustomCall {
        CustomCall {
            name: self.name,
            arg_checks: self.arg_checks,
            attr_checks: self.attr_checks,
            user_data_checks: self.user_data_checks,
            handler: Arc::new(handler),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name → handler map consulted by the dispatcher.
#[derive(Default)]
pub struct CustomCallRegistry {
    handlers: FxHashMap<String, Arc<CustomCall>>,
}

impl CustomCallRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        CustomCallRegistry::default()
    }

    /// Register a handler. Duplicate registration is a programming error.
    pub fn register(&mut self, custom_call: CustomCall) -> Result<()> {
        let name = custom_call.name.clone();
        if self.handlers.contains_key(&name) {
            return Err(Error::CustomCallArgMismatch(format!(
                "duplicate custom call registration: {}",
                name
            )));
        }
        self.handlers.insert(name, Arc::new(custom_call));
        Ok(())
    }

    /// Find a handler by callee name.
    pub fn find(&self, callee: &str) -> Option<Arc<CustomCall>> {
        self.handlers.get(callee).cloned()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A function contributing handlers to a registry.
pub type RegistrationFn = fn(&mut CustomCallRegistry);

static STATIC_REGISTRATIONS: Mutex<Vec<RegistrationFn>> = Mutex::new(Vec::new());

/// Publish a registration function from module setup code; collected later
/// by [`register_static_custom_calls`].
pub fn add_static_custom_call_registration(registration: RegistrationFn) {
    STATIC_REGISTRATIONS.lock().push(registration);
}

/// Run all statically-published registrations against a registry.
pub fn register_static_custom_calls(registry: &mut CustomCallRegistry) {
    for registration in STATIC_REGISTRATIONS.lock().iter() {
        registration(registry);
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

unsafe fn decode_arg_array(args: *const c_void) -> Vec<(TypeCode, *mut c_void)> {
    if args.is_null() {
        return Vec::new();
    }
    let words = args as *const u64;
    let count = *words as usize;
    let mut decoded = Vec::with_capacity(count);
    for i in 0..count {
        let code = TypeCode(*words.add(1 + 2 * i));
        let value = *words.add(2 + 2 * i) as *mut c_void;
        decoded.push((code, value));
    }
    decoded
}

unsafe fn decode_attr_array<'a>(attrs: *const c_void) -> Vec<(&'a str, TypeCode, *const c_void)> {
    if attrs.is_null() {
        return Vec::new();
    }
    let words = attrs as *const u64;
    let count = *words as usize;
    let mut decoded = Vec::with_capacity(count);
    for i in 0..count {
        let name_ptr = *words.add(1 + 3 * i) as *const c_char;
        let code = TypeCode(*words.add(2 + 3 * i));
        let value = *words.add(3 + 3 * i) as *const c_void;
        let name = CStr::from_ptr(name_ptr).to_str().unwrap_or("");
        decoded.push((name, code, value));
    }
    decoded
}

fn dispatch(
    ctx: &mut KernelContext,
    callee: &str,
    args: &[(TypeCode, *mut c_void)],
    attrs: &[(&str, TypeCode, *const c_void)],
) -> Result<()> {
    let registry = ctx.registry as *const CustomCallRegistry;
    if registry.is_null() {
        return Err(Error::UnknownCustomCall(format!(
            "{} (no registry provided)",
            callee
        )));
    }
    // Safety: the executable keeps the registry alive for the whole call.
    let registry = unsafe { &*registry };
    let handler = registry
        .find(callee)
        .ok_or_else(|| Error::UnknownCustomCall(callee.to_string()))?;

    if args.len() != handler.arg_checks.len() {
        return Err(Error::CustomCallArgMismatch(format!(
            "{}: expected {} arguments, got {}",
            callee,
            handler.arg_checks.len(),
            args.len()
        )));
    }
    for (i, (check, (code, _))) in handler.arg_checks.iter().zip(args).enumerate() {
        if !check(*code) {
            return Err(Error::CustomCallArgMismatch(format!(
                "{}: argument #{} has unexpected type code {}",
                callee, i, code.0
            )));
        }
    }
    for (name, check) in &handler.attr_checks {
        let found = attrs.iter().find(|(n, _, _)| n == name);
        match found {
            None => {
                return Err(Error::CustomCallAttrMismatch(format!(
                    "{}: missing attribute `{}`",
                    callee, name
                )))
            }
            Some((_, code, _)) if !check(*code) => {
                return Err(Error::CustomCallAttrMismatch(format!(
                    "{}: attribute `{}` has unexpected type code {}",
                    callee, name, code.0
                )))
            }
            _ => {}
        }
    }

    let user_data = ctx.user_data as *const UserData<'_>;
    // Safety: the executable keeps the user data alive for the whole call.
    let user_data = if user_data.is_null() {
        None
    } else {
        Some(unsafe { &*user_data })
    };
    for (type_name, check) in &handler.user_data_checks {
        let present = user_data.map(|ud| check(ud)).unwrap_or(false);
        if !present {
            return Err(Error::CustomCallArgMismatch(format!(
                "{}: user data of type {} not provided",
                callee, type_name
            )));
        }
    }

    let call_ctx = CallContext {
        user_data,
        args,
        attrs,
    };
    (handler.handler)(&call_ctx).map_err(Error::Execution)
}

/// The dispatcher entry generated code calls. Returns `true` on success;
/// on failure the error is recorded in the kernel context and the generated
/// code returns early.
pub(crate) unsafe extern "C" fn kiln_rt_custom_call(
    ctx: *mut KernelContext,
    callee: *const c_char,
    args: *const c_void,
    attrs: *const c_void,
) -> bool {
    let ctx = &mut *ctx;
    let callee = match CStr::from_ptr(callee).to_str() {
        Ok(name) => name,
        Err(_) => {
            ctx.error = Some("custom call callee name is not UTF-8".to_string());
            return false;
        }
    };
    let args = decode_arg_array(args);
    let attrs = decode_attr_array(attrs);
    match dispatch(ctx, callee, &args, &attrs) {
        Ok(()) => true,
        Err(err) => {
            ctx.error = Some(err.to_string());
            false
        }
    }
}
