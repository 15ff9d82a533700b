//! Async runtime binding.
//!
//! Compiled code that produces async results calls into the hooks below,
//! which expect an ambient [`AsyncRuntime`] installed in a thread-local cell
//! before every entry into generated code on that thread. The executable
//! installs the binding around the raw call; the host work queue behind the
//! runtime stays abstract.

use std::cell::Cell;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::abi::TypeCode;
use crate::error::{Error, Result};
use kiln_types::DType;

// ---------------------------------------------------------------------------
// Async handles
// ---------------------------------------------------------------------------

/// A memref whose backing buffer is owned by an async value until the host
/// adopts it.
#[derive(Debug)]
pub struct OwnedMemref {
    pub dtype: DType,
    pub base: *mut c_void,
    pub data: *mut c_void,
    pub offset: i64,
    pub sizes: Vec<i64>,
    pub strides: Vec<i64>,
}

// Safety: the buffer behind `base`/`data` is exclusively owned by the
// OwnedMemref once the callee has returned it; nothing else aliases it.
unsafe impl Send for OwnedMemref {}

#[derive(Debug)]
enum TokenState {
    Pending,
    Available,
    Error(String),
}

/// An async completion token produced by compiled code.
#[derive(Debug)]
pub struct AsyncToken {
    state: Mutex<TokenState>,
    cv: Condvar,
}

impl AsyncToken {
    pub(crate) fn new() -> Self {
        AsyncToken {
            state: Mutex::new(TokenState::Pending),
            cv: Condvar::new(),
        }
    }

    /// Block until the token completes.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                TokenState::Available => return Ok(()),
                TokenState::Error(msg) => return Err(Error::Execution(msg.clone())),
                TokenState::Pending => self.cv.wait(&mut state),
            }
        }
    }

    /// Whether the token has completed successfully.
    pub fn is_available(&self) -> bool {
        matches!(&*self.state.lock(), TokenState::Available)
    }

    pub(crate) fn set_available(&self) {
        *self.state.lock() = TokenState::Available;
        self.cv.notify_all();
    }

    pub(crate) fn set_error(&self, message: impl Into<String>) {
        let mut state = self.state.lock();
        if matches!(&*state, TokenState::Pending) {
            *state = TokenState::Error(message.into());
            self.cv.notify_all();
        }
    }
}

#[derive(Debug)]
enum ValueState {
    Pending,
    // Payload taken exactly once by the converter.
    Available(Option<OwnedMemref>),
    Error(String),
}

/// An async value holding a memref payload.
#[derive(Debug)]
pub struct AsyncValue {
    state: Mutex<ValueState>,
    cv: Condvar,
}

impl AsyncValue {
    pub(crate) fn new() -> Self {
        AsyncValue {
            state: Mutex::new(ValueState::Pending),
            cv: Condvar::new(),
        }
    }

    /// Block until the value resolves and take its payload.
    pub fn wait_take(&self) -> Result<OwnedMemref> {
        let mut state = self.state.lock();
        loop {
            match &mut *state {
                ValueState::Available(payload) => {
                    return payload.take().ok_or_else(|| {
                        Error::Execution("async value payload already taken".to_string())
                    });
                }
                ValueState::Error(msg) => return Err(Error::Execution(msg.clone())),
                ValueState::Pending => self.cv.wait(&mut state),
            }
        }
    }

    pub(crate) fn emplace(&self, payload: OwnedMemref) {
        *self.state.lock() = ValueState::Available(Some(payload));
        self.cv.notify_all();
    }

    pub(crate) fn set_error(&self, message: impl Into<String>) {
        let mut state = self.state.lock();
        if matches!(&*state, ValueState::Pending) {
            *state = ValueState::Error(message.into());
            self.cv.notify_all();
        }
    }
}

impl Drop for AsyncValue {
    fn drop(&mut self) {
        // A payload nobody adopted still owns its buffer.
        if let ValueState::Available(Some(memref)) = &*self.state.lock() {
            if !memref.base.is_null() {
                unsafe { libc::free(memref.base) };
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Thread-local runtime binding
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RuntimeState {
    handles_created: AtomicUsize,
}

/// Handle to the async runtime the compiled code binds to.
///
/// The runtime must be installed on the calling thread for the duration of
/// every entry into generated code; [`crate::executable::Executable`] does
/// this around the raw call.
#[derive(Debug, Clone, Default)]
pub struct AsyncRuntime {
    state: Arc<RuntimeState>,
}

impl AsyncRuntime {
    /// Create a runtime handle.
    pub fn new() -> Self {
        AsyncRuntime::default()
    }

    /// Number of async handles compiled code has created under this
    /// runtime.
    pub fn handles_created(&self) -> usize {
        self.state.handles_created.load(Ordering::Relaxed)
    }
}

thread_local! {
    static CURRENT_RUNTIME: Cell<*const RuntimeState> = const { Cell::new(std::ptr::null()) };
}

/// Installs the async runtime binding for the current thread, restoring the
/// previous binding on drop.
pub(crate) struct AsyncRuntimeGuard {
    prev: *const RuntimeState,
    // Keeps the state alive while installed.
    _hold: Option<Arc<RuntimeState>>,
}

impl AsyncRuntimeGuard {
    pub(crate) fn install(runtime: Option<&AsyncRuntime>) -> Self {
        let hold = runtime.map(|r| r.state.clone());
        let next = hold
            .as_ref()
            .map_or(std::ptr::null(), |s| Arc::as_ptr(s));
        let prev = CURRENT_RUNTIME.with(|cell| cell.replace(next));
        AsyncRuntimeGuard { prev, _hold: hold }
    }
}

impl Drop for AsyncRuntimeGuard {
    fn drop(&mut self) {
        CURRENT_RUNTIME.with(|cell| cell.set(self.prev));
    }
}

fn note_handle_created() {
    CURRENT_RUNTIME.with(|cell| {
        let ptr = cell.get();
        if !ptr.is_null() {
            // Safety: the guard holds an Arc for as long as the pointer is
            // installed.
            unsafe { (*ptr).handles_created.fetch_add(1, Ordering::Relaxed) };
        }
    });
}

// ---------------------------------------------------------------------------
// Hooks called from generated code
// ---------------------------------------------------------------------------

/// Create an already-completed async token and hand ownership to the
/// caller's result cell.
pub(crate) extern "C" fn kiln_rt_async_ready_token() -> *mut c_void {
    note_handle_created();
    let token = Arc::new(AsyncToken::new());
    token.set_available();
    Arc::into_raw(token) as *mut c_void
}

/// Wrap a strided memref descriptor into an already-completed async value.
///
/// `descriptor` points at `{base, data, offset: i64, sizes: [i64; rank],
/// strides: [i64; rank]}`; the buffer's ownership transfers to the async
/// value.
pub(crate) unsafe extern "C" fn kiln_rt_async_ready_value(
    descriptor: *const c_void,
    rank: i64,
    dtype_code: u64,
) -> *mut c_void {
    note_handle_created();
    let value = Arc::new(AsyncValue::new());
    let dtype = match TypeCode(dtype_code).to_dtype() {
        Some(dtype) => dtype,
        None => {
            value.set_error(format!("invalid element type code {}", dtype_code));
            return Arc::into_raw(value) as *mut c_void;
        }
    };
    let rank = rank.max(0) as usize;
    let words = descriptor as *const u64;
    let base = *words as *mut c_void;
    let data = *words.add(1) as *mut c_void;
    let offset = *words.add(2) as i64;
    let mut sizes = Vec::with_capacity(rank);
    let mut strides = Vec::with_capacity(rank);
    for d in 0..rank {
        sizes.push(*words.add(3 + d) as i64);
        strides.push(*words.add(3 + rank + d) as i64);
    }
    value.emplace(OwnedMemref {
        dtype,
        base,
        data,
        offset,
        sizes,
        strides,
    });
    Arc::into_raw(value) as *mut c_void
}

/// Re-adopt a token handle written into a result cell.
///
/// # Safety
/// `ptr` must come from [`kiln_rt_async_ready_token`] and be adopted at most
/// once.
pub(crate) unsafe fn token_from_raw(ptr: *mut c_void) -> Arc<AsyncToken> {
    Arc::from_raw(ptr as *const AsyncToken)
}

/// Re-adopt a value handle written into a result cell.
///
/// # Safety
/// `ptr` must come from [`kiln_rt_async_ready_value`] and be adopted at most
/// once.
pub(crate) unsafe fn value_from_raw(ptr: *mut c_void) -> Arc<AsyncValue> {
    Arc::from_raw(ptr as *const AsyncValue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_wait() {
        let token = Arc::new(AsyncToken::new());
        let t = token.clone();
        let handle = std::thread::spawn(move || {
            t.set_available();
        });
        token.wait().unwrap();
        handle.join().unwrap();
        assert!(token.is_available());
    }

    #[test]
    fn test_token_error() {
        let token = AsyncToken::new();
        token.set_error("boom");
        assert!(matches!(token.wait(), Err(Error::Execution(_))));
    }

    #[test]
    fn test_value_take_once() {
        let value = AsyncValue::new();
        value.emplace(OwnedMemref {
            dtype: DType::F32,
            base: std::ptr::null_mut(),
            data: std::ptr::null_mut(),
            offset: 0,
            sizes: vec![2],
            strides: vec![1],
        });
        let first = value.wait_take().unwrap();
        assert_eq!(first.sizes, vec![2]);
        assert!(value.wait_take().is_err());
    }

    #[test]
    fn test_ready_token_hook_counts_handles() {
        let runtime = AsyncRuntime::new();
        let _guard = AsyncRuntimeGuard::install(Some(&runtime));
        let ptr = kiln_rt_async_ready_token();
        let token = unsafe { token_from_raw(ptr) };
        assert!(token.is_available());
        assert_eq!(runtime.handles_created(), 1);
    }

    #[test]
    fn test_guard_restores_previous_binding() {
        let runtime = AsyncRuntime::new();
        {
            let _guard = AsyncRuntimeGuard::install(Some(&runtime));
            let ptr = kiln_rt_async_ready_token();
            unsafe { drop(token_from_raw(ptr)) };
        }
        // Binding removed: new handles are not attributed.
        let ptr = kiln_rt_async_ready_token();
        unsafe { drop(token_from_raw(ptr)) };
        assert_eq!(runtime.handles_created(), 1);
    }

    #[test]
    fn test_ready_value_hook_decodes_descriptor() {
        // descriptor: base, data, offset, sizes[1], strides[1]
        let buffer = unsafe { libc::malloc(8) };
        let desc: [u64; 5] = [buffer as u64, buffer as u64, 0, 2, 1];
        let ptr = unsafe {
            kiln_rt_async_ready_value(
                desc.as_ptr() as *const c_void,
                1,
                TypeCode::of_dtype(DType::F32).0,
            )
        };
        let value = unsafe { value_from_raw(ptr) };
        let memref = value.wait_take().unwrap();
        assert_eq!(memref.dtype, DType::F32);
        assert_eq!(memref.sizes, vec![2]);
        unsafe { libc::free(memref.base) };
    }
}
