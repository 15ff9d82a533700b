//! Executables, call frames, and result conversion.
//!
//! An [`Executable`] owns the engine holding its emitted code, the runtime
//! signature (after calling-convention rewriting), the entrypoint name, and
//! the pre-computed result memory layout. It is immutable after
//! construction; call frames are per-invocation values built on the
//! caller's stack.

use std::cell::RefCell;
use std::ffi::c_void;
use std::sync::Arc;

use tracing::debug;

use kiln_types::{FunctionType, Type};

use crate::abi::{EntryFn, HelperTable, KernelContext, SymbolMap};
use crate::arguments::ArgumentsRef;
use crate::async_rt::{token_from_raw, value_from_raw, AsyncRuntimeGuard, AsyncToken, AsyncValue};
use crate::buffer::{Deleter, HostBuffer};
use crate::engine::{ExecutionEngine, JitEngine};
use crate::error::{Error, Result};
use crate::obj_file::ObjectFile;

// ---------------------------------------------------------------------------
// Call frame
// ---------------------------------------------------------------------------

/// The flat argument/result storage for one invocation.
///
/// `args` holds one `void*` per packed input slot followed by one pointer
/// per result cell; `results` is the raw block the callee writes results
/// into. Frames are single-use and never shared across calls.
#[derive(Debug)]
pub struct CallFrame {
    pub(crate) args: Vec<*mut c_void>,
    pub(crate) results: Vec<u8>,
    // Heap cell backing the packed kernel-context slot, so the pointer
    // stays valid even if the frame itself moves after initialization.
    ctx_cell: Box<*mut c_void>,
}

impl Default for CallFrame {
    fn default() -> Self {
        CallFrame {
            args: Vec::new(),
            results: Vec::new(),
            ctx_cell: Box::new(std::ptr::null_mut()),
        }
    }
}

impl CallFrame {
    /// Create an empty frame.
    pub fn new() -> Self {
        CallFrame::default()
    }

    /// Number of argument slots (inputs plus result pointers).
    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// Size of the result block in bytes.
    pub fn results_size(&self) -> usize {
        self.results.len()
    }
}

// ---------------------------------------------------------------------------
// Results memory layout
// ---------------------------------------------------------------------------

/// Byte layout of the result block, computed once per executable from the
/// runtime signature's result types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultsMemoryLayout {
    /// Whether any result is an async handle.
    pub has_async_results: bool,
    /// Total size of the result block.
    pub size: usize,
    /// Byte offset of each result cell.
    pub offsets: Vec<usize>,
}

impl ResultsMemoryLayout {
    /// Compute the layout; every result type must have a result ABI.
    pub fn compute(results: &[Type]) -> Result<ResultsMemoryLayout> {
        let mut has_async_results = false;
        let mut size = 0;
        let mut offsets = Vec::with_capacity(results.len());
        for (i, ty) in results.iter().enumerate() {
            let abi = ty.as_result().ok_or_else(|| {
                Error::UnsupportedType(format!("result #{} type {} cannot be returned", i, ty))
            })?;
            has_async_results |= matches!(ty, Type::AsyncToken | Type::AsyncValue(_));
            offsets.push(size);
            size += abi.size_bytes;
        }
        Ok(ResultsMemoryLayout {
            has_async_results,
            size,
            offsets,
        })
    }
}

// ---------------------------------------------------------------------------
// Returned values and the conversion sink
// ---------------------------------------------------------------------------

/// An async memref result; resolves to a [`HostBuffer`] when awaited.
#[derive(Debug)]
pub struct AsyncBuffer {
    value: Arc<AsyncValue>,
}

impl AsyncBuffer {
    /// Block until the value resolves and adopt its buffer.
    pub fn wait(self) -> Result<HostBuffer> {
        let memref = self.value.wait_take()?;
        let data = unsafe {
            (memref.data as *mut u8).add(memref.offset as usize * memref.dtype.size_in_bytes())
        };
        // Safety: the async value exclusively owned the buffer and hands it
        // over exactly once; the callee allocated it through the runtime
        // allocator, so libc::free releases it.
        unsafe {
            HostBuffer::adopt(
                memref.dtype,
                memref.sizes,
                memref.base,
                data,
                Some(libc::free as Deleter),
            )
        }
    }
}

/// One converted result delivered to the caller.
#[derive(Debug)]
pub enum ReturnedValue {
    /// A synchronous memref adopted into a host buffer.
    Buffer(HostBuffer),
    /// An async completion token.
    Token(Arc<AsyncToken>),
    /// An async memref value.
    AsyncBuffer(AsyncBuffer),
}

/// The ordered result sink conversion callbacks write into.
#[derive(Debug, Default)]
pub struct ReturnedResults {
    slots: Vec<Option<Result<ReturnedValue>>>,
}

impl ReturnedResults {
    /// Create a sink with `num_results` empty slots.
    pub fn new(num_results: usize) -> Self {
        let mut slots = Vec::with_capacity(num_results);
        slots.resize_with(num_results, || None);
        ReturnedResults { slots }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the sink has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Store the outcome for result `index`.
    pub fn set(&mut self, index: usize, value: Result<ReturnedValue>) {
        self.slots[index] = Some(value);
    }

    /// Take the outcome of result `index`.
    pub fn take(&mut self, index: usize) -> Option<Result<ReturnedValue>> {
        self.slots.get_mut(index).and_then(Option::take)
    }

    /// Shared view of the outcome of result `index`.
    pub fn get(&self, index: usize) -> Option<&Result<ReturnedValue>> {
        self.slots.get(index).and_then(Option::as_ref)
    }
}

/// A conversion callback: returns `true` when it handled the result.
pub type ConversionFn =
    Box<dyn Fn(&mut ReturnedResults, usize, &Type, *const u8) -> bool + Send>;

/// Decodes result cells into host values.
///
/// Callbacks run in reverse registration order per result until one
/// succeeds; an unhandled result records a conversion error in its slot and
/// the remaining results still convert.
pub struct ResultConverter {
    sink: RefCell<ReturnedResults>,
    conversions: Vec<ConversionFn>,
}

impl ResultConverter {
    /// Create a converter with an empty sink for `num_results` results.
    pub fn new(num_results: usize) -> Self {
        ResultConverter {
            sink: RefCell::new(ReturnedResults::new(num_results)),
            conversions: Vec::new(),
        }
    }

    /// Register a conversion; later registrations win.
    pub fn add_conversion(
        &mut self,
        conversion: impl Fn(&mut ReturnedResults, usize, &Type, *const u8) -> bool + Send + 'static,
    ) {
        self.conversions.push(Box::new(conversion));
    }

    pub(crate) fn return_value(&self, index: usize, ty: &Type, ptr: *const u8) -> bool {
        let mut sink = self.sink.borrow_mut();
        for conversion in self.conversions.iter().rev() {
            if conversion(&mut sink, index, ty, ptr) {
                return true;
            }
        }
        sink.set(
            index,
            Err(Error::ResultConversion {
                index,
                message: format!("unsupported return type: {}", ty),
            }),
        );
        false
    }

    /// Record `message` as the outcome of every slot that has no
    /// synchronous value yet.
    pub(crate) fn emit_errors(&self, message: &str) {
        let mut sink = self.sink.borrow_mut();
        for index in 0..sink.len() {
            if sink.get(index).is_none() {
                sink.set(index, Err(Error::Execution(message.to_string())));
            }
        }
    }

    /// Consume the converter and hand back the sink.
    pub fn into_results(self) -> ReturnedResults {
        self.sink.into_inner()
    }
}

// Standard conversions -------------------------------------------------------

/// Unpack a synchronous memref result into a [`HostBuffer`] that adopts the
/// callee-allocated buffer.
pub fn return_memref_as_host_buffer(
    results: &mut ReturnedResults,
    index: usize,
    ty: &Type,
    ptr: *const u8,
) -> bool {
    let (dims, dtype) = match ty {
        Type::Memref { dims, dtype } => (dims, *dtype),
        _ => return false,
    };
    let rank = dims.len();
    // Safety: the cell holds the inlined strided descriptor the callee
    // wrote: {base, data, offset, sizes[rank], strides[rank]}.
    let outcome = unsafe {
        let words = ptr as *const u64;
        let base = *words as *mut c_void;
        let data = *words.add(1) as *mut u8;
        let offset = *words.add(2) as i64;
        let sizes: Vec<i64> = (0..rank).map(|d| *words.add(3 + d) as i64).collect();
        let data = data.add(offset as usize * dtype.size_in_bytes());
        HostBuffer::adopt(dtype, sizes, base, data, Some(libc::free as Deleter))
    };
    results.set(index, outcome.map(ReturnedValue::Buffer));
    true
}

/// Adopt an async token handle into the sink.
pub fn return_async_token(
    results: &mut ReturnedResults,
    index: usize,
    ty: &Type,
    ptr: *const u8,
) -> bool {
    if !matches!(ty, Type::AsyncToken) {
        return false;
    }
    // Safety: the cell holds the handle pointer the callee stored; the
    // runtime created it via the ready-token hook.
    let token = unsafe {
        let handle = *(ptr as *const *mut c_void);
        token_from_raw(handle)
    };
    results.set(index, Ok(ReturnedValue::Token(token)));
    true
}

/// Adopt an async memref value handle; the buffer is unpacked when the
/// caller awaits it.
pub fn return_async_value_as_host_buffer(
    results: &mut ReturnedResults,
    index: usize,
    ty: &Type,
    ptr: *const u8,
) -> bool {
    match ty {
        Type::AsyncValue(inner) if matches!(**inner, Type::Memref { .. }) => {}
        _ => return false,
    }
    // Safety: as for tokens; the handle came from the ready-value hook.
    let value = unsafe {
        let handle = *(ptr as *const *mut c_void);
        value_from_raw(handle)
    };
    results.set(index, Ok(ReturnedValue::AsyncBuffer(AsyncBuffer { value })));
    true
}

// ---------------------------------------------------------------------------
// Executable
// ---------------------------------------------------------------------------

/// Per-invocation options: the custom-call environment and the async
/// runtime binding.
#[derive(Default)]
pub struct ExecuteOpts<'a> {
    /// Registry consulted by the custom-call dispatcher.
    pub custom_call_registry: Option<&'a crate::custom_call::CustomCallRegistry>,
    /// User data resolved for custom-call handlers.
    pub custom_call_data: Option<&'a crate::custom_call::UserData<'a>>,
    /// Async runtime installed around the entry into generated code.
    pub async_runtime: Option<&'a crate::async_rt::AsyncRuntime>,
}

/// A compiled entrypoint ready to execute.
pub struct Executable {
    engine: Box<dyn ExecutionEngine>,
    fptr: EntryFn,
    signature: FunctionType,
    runtime_signature: FunctionType,
    entrypoint: String,
    layout: ResultsMemoryLayout,
    helpers: HelperTable,
}

impl std::fmt::Debug for Executable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executable")
            .field("entrypoint", &self.entrypoint)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

impl Executable {
    pub(crate) fn new(
        engine: Box<dyn ExecutionEngine>,
        signature: FunctionType,
        runtime_signature: FunctionType,
        entrypoint: String,
        helpers: HelperTable,
    ) -> Result<Executable> {
        let layout = ResultsMemoryLayout::compute(runtime_signature.results())?;
        let addr = engine.lookup(&entrypoint).ok_or_else(|| {
            Error::Compilation(format!("entrypoint `{}` not found in engine", entrypoint))
        })?;
        // Safety: the engine produced `addr` for a function emitted with
        // the `void f(void**)` ABI.
        let fptr: EntryFn = unsafe { std::mem::transmute::<*const u8, EntryFn>(addr) };
        Ok(Executable {
            engine,
            fptr,
            signature,
            runtime_signature,
            entrypoint,
            layout,
            helpers,
        })
    }

    /// The user-facing signature this executable was compiled from.
    pub fn signature(&self) -> &FunctionType {
        &self.signature
    }

    /// The signature after calling-convention rewriting; this is what call
    /// frames are verified against.
    pub fn runtime_signature(&self) -> &FunctionType {
        &self.runtime_signature
    }

    /// Entrypoint symbol name.
    pub fn entrypoint(&self) -> &str {
        &self.entrypoint
    }

    /// Number of results.
    pub fn num_results(&self) -> usize {
        self.runtime_signature.num_results()
    }

    /// The result block layout.
    pub fn results_memory_layout(&self) -> &ResultsMemoryLayout {
        &self.layout
    }

    fn has_kernel_context(&self) -> bool {
        matches!(
            self.runtime_signature.inputs().first(),
            Some(Type::KernelContext)
        )
    }

    /// Build the flat argument array and result block for one invocation.
    ///
    /// Operands are matched against the runtime signature; the leading
    /// kernel-context operand, when present, is packed by the runtime and
    /// not counted against the caller's operands.
    pub fn initialize_call_frame(
        &self,
        operands: ArgumentsRef<'_>,
        frame: &mut CallFrame,
        verify: bool,
    ) -> Result<()> {
        let inputs = self.runtime_signature.inputs();
        let implicit = usize::from(self.has_kernel_context());
        if operands.len() != inputs.len() - implicit {
            return Err(Error::arity(inputs.len() - implicit, operands.len()));
        }
        if verify {
            for i in 0..operands.len() {
                operands.get(i).verify(&inputs[i + implicit])?;
            }
        }

        let mut num_slots = 0;
        for (i, ty) in inputs.iter().enumerate() {
            num_slots += ty
                .as_argument()
                .ok_or_else(|| {
                    Error::UnsupportedType(format!(
                        "input #{} type {} cannot be passed as an argument",
                        i, ty
                    ))
                })?
                .num_slots;
        }

        frame.args.clear();
        frame
            .args
            .resize(num_slots + self.layout.offsets.len(), std::ptr::null_mut());

        let mut offset = 0;
        if implicit == 1 {
            frame.args[0] = &mut *frame.ctx_cell as *mut *mut c_void as *mut c_void;
            offset = 1;
        }
        for i in 0..operands.len() {
            offset = operands.get(i).pack(&mut frame.args, offset);
        }
        debug_assert_eq!(offset, num_slots, "argument packing slot mismatch");

        frame.results.clear();
        frame.results.resize(self.layout.size, 0);
        for (i, result_offset) in self.layout.offsets.iter().enumerate() {
            frame.args[num_slots + i] =
                unsafe { frame.results.as_mut_ptr().add(*result_offset) } as *mut c_void;
        }
        Ok(())
    }

    /// Execute with the given operands, converting results through
    /// `converter`. Frame-initialization failures are surfaced into the
    /// sink before returning.
    pub fn execute(
        &self,
        operands: ArgumentsRef<'_>,
        converter: &ResultConverter,
        opts: &ExecuteOpts<'_>,
    ) -> Result<()> {
        let mut frame = CallFrame::new();
        if let Err(err) = self.initialize_call_frame(operands, &mut frame, true) {
            converter.emit_errors(&err.to_string());
            return Err(err);
        }

        let mut ctx =
            KernelContext::new(self.helpers, opts.custom_call_data, opts.custom_call_registry);
        if self.has_kernel_context() {
            *frame.ctx_cell = &mut ctx as *mut KernelContext as *mut c_void;
        }

        {
            // The generated code expects an ambient async runtime for any
            // handles it creates; install it for the duration of the call.
            let _guard = AsyncRuntimeGuard::install(opts.async_runtime);
            // Safety: the frame was initialized against this executable's
            // runtime signature, and the caller guarantees operand buffers
            // stay valid for the whole call.
            unsafe { (self.fptr)(frame.args.as_mut_ptr()) };
        }

        if let Some(message) = ctx.error.take() {
            let err = Error::Execution(message);
            converter.emit_errors(&err.to_string());
            return Err(err);
        }
        self.return_results(converter, &frame)
    }

    fn return_results(&self, converter: &ResultConverter, frame: &CallFrame) -> Result<()> {
        let mut failed = 0usize;
        for (i, ty) in self.runtime_signature.results().iter().enumerate() {
            // Safety: offsets are in range of the result block by layout
            // construction.
            let ptr = unsafe { frame.results.as_ptr().add(self.layout.offsets[i]) };
            if !converter.return_value(i, ty, ptr) {
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(Error::Execution(format!(
                "failed to convert {} returned value(s)",
                failed
            )));
        }
        Ok(())
    }

    /// The captured object file, if the engine preserved it.
    pub fn obj_file(&self) -> Option<&ObjectFile> {
        self.engine.obj_file()
    }

    /// Instantiate an executable from a previously captured object file.
    ///
    /// The loader registers the same runtime symbol map a fresh compile
    /// would (async runtime hooks, custom-call dispatcher, allocator),
    /// extended with `symbol_map`.
    pub fn load_from_obj_file(
        name: &str,
        obj: ObjectFile,
        entrypoint: &str,
        signature: FunctionType,
        runtime_signature: FunctionType,
        symbol_map: &SymbolMap,
        memory_region_name: &str,
    ) -> Result<Executable> {
        debug!(name, memory_region_name, "loading executable from object file");
        let (module, _stored_entrypoint) = obj.decode()?;

        let host_triple = cranelift_native::builder()
            .map(|b| b.triple().to_string())
            .map_err(|e| Error::Compilation(format!("failed to detect host: {}", e)))?;
        if module.target_triple != host_triple {
            return Err(Error::Compilation(format!(
                "object file was compiled for {}, host is {}",
                module.target_triple, host_triple
            )));
        }
        if !module.functions.iter().any(|f| f.name == entrypoint) {
            return Err(Error::Compilation(format!(
                "entrypoint `{}` not present in object file",
                entrypoint
            )));
        }

        let mut symbols = crate::abi::runtime_symbol_map();
        symbols.extend(symbol_map);
        let helpers = HelperTable::from_symbol_map(&symbols)?;
        let engine = JitEngine::new(module, &symbols, Some(obj))?;
        Executable::new(
            Box::new(engine),
            signature,
            runtime_signature,
            entrypoint.to_string(),
            helpers,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::runtime_symbol_map;
    use crate::arguments::{Arguments, MemrefDesc, OpaqueArg};
    use kiln_types::{DType, DYNAMIC_DIM};

    unsafe extern "C" fn nop_entry(_args: *mut *mut c_void) {}

    struct NopEngine;

    impl ExecutionEngine for NopEngine {
        fn lookup(&self, _name: &str) -> Option<*const u8> {
            Some(nop_entry as *const u8)
        }
    }

    fn test_executable(inputs: Vec<Type>, results: Vec<Type>) -> Executable {
        let helpers = HelperTable::from_symbol_map(&runtime_symbol_map()).unwrap();
        let signature = FunctionType::new(inputs.clone(), results.clone());
        Executable::new(
            Box::new(NopEngine),
            signature.clone(),
            signature,
            "compute".to_string(),
            helpers,
        )
        .unwrap()
    }

    fn dyn_memref_ty() -> Type {
        Type::Memref {
            dims: vec![DYNAMIC_DIM, DYNAMIC_DIM],
            dtype: DType::F32,
        }
    }

    #[test]
    fn test_results_memory_layout() {
        let layout = ResultsMemoryLayout::compute(&[
            Type::AsyncToken,
            Type::Memref {
                dims: vec![2, 2],
                dtype: DType::F32,
            },
            Type::AsyncValue(Box::new(dyn_memref_ty())),
        ])
        .unwrap();
        assert!(layout.has_async_results);
        // token (8) + memref (2*8 + 8 + 4*8) + value (8)
        assert_eq!(layout.offsets, vec![0, 8, 8 + 56]);
        assert_eq!(layout.size, 8 + 56 + 8);
    }

    #[test]
    fn test_layout_rejects_unsupported_result() {
        let err = ResultsMemoryLayout::compute(&[Type::Opaque]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(_)));
    }

    #[test]
    fn test_call_frame_slot_totals() {
        let exe = test_executable(
            vec![Type::KernelContext, dyn_memref_ty()],
            vec![Type::AsyncToken],
        );
        let mut data = [1.0f32; 4];
        let mut args = Arguments::new(1);
        args.push(MemrefDesc::new(
            DType::F32,
            data.as_mut_ptr() as *mut c_void,
            0,
            &[2, 2],
            &[2, 1],
        ));
        let mut frame = CallFrame::new();
        exe.initialize_call_frame((&args).into(), &mut frame, true)
            .unwrap();
        // 1 (context) + 7 (rank-2 memref) input slots + 1 result pointer.
        assert_eq!(frame.num_args(), 9);
        assert_eq!(frame.results_size(), 8);
        // The result pointer points into the result block.
        let result_ptr = frame.args[8] as usize;
        let block = frame.results.as_ptr() as usize;
        assert_eq!(result_ptr, block);
    }

    #[test]
    fn test_arity_mismatch() {
        let exe = test_executable(vec![Type::KernelContext, dyn_memref_ty()], vec![]);
        let args = Arguments::new(0);
        let mut frame = CallFrame::new();
        let err = exe
            .initialize_call_frame((&args).into(), &mut frame, true)
            .unwrap_err();
        assert!(err.to_string().contains("number of operands"));
    }

    #[test]
    fn test_rank_mismatch_detected_by_verify() {
        let exe = test_executable(vec![Type::KernelContext, dyn_memref_ty()], vec![]);
        let mut data = [0.0f32; 4];
        let mut args = Arguments::new(1);
        // Rank 1 against a rank-2 input.
        args.push(MemrefDesc::new(
            DType::F32,
            data.as_mut_ptr() as *mut c_void,
            0,
            &[4],
            &[1],
        ));
        let mut frame = CallFrame::new();
        let err = exe
            .initialize_call_frame((&args).into(), &mut frame, true)
            .unwrap_err();
        assert!(err.to_string().contains("rank"));
    }

    #[test]
    fn test_execute_runs_converter() {
        let exe = test_executable(vec![Type::KernelContext, Type::Opaque], vec![]);
        let mut payload = 3u64;
        let mut args = Arguments::new(1);
        args.push(OpaqueArg::new(&mut payload as *mut u64 as *mut c_void));
        let converter = ResultConverter::new(0);
        exe.execute((&args).into(), &converter, &ExecuteOpts::default())
            .unwrap();
    }

    #[test]
    fn test_unhandled_result_records_error() {
        let converter = ResultConverter::new(1);
        let cell = [0u8; 8];
        assert!(!converter.return_value(0, &Type::AsyncToken, cell.as_ptr()));
        let mut results = converter.into_results();
        match results.take(0).unwrap() {
            Err(Error::ResultConversion { index: 0, .. }) => {}
            other => panic!("expected conversion error, got {:?}", other),
        }
    }

    #[test]
    fn test_last_registered_conversion_wins() {
        let converter = {
            let mut c = ResultConverter::new(1);
            c.add_conversion(|results, index, _, _| {
                results.set(
                    index,
                    Err(Error::ResultConversion {
                        index,
                        message: "first".into(),
                    }),
                );
                true
            });
            c.add_conversion(|results, index, _, _| {
                results.set(
                    index,
                    Err(Error::ResultConversion {
                        index,
                        message: "second".into(),
                    }),
                );
                true
            });
            c
        };
        let cell = [0u8; 8];
        assert!(converter.return_value(0, &Type::AsyncToken, cell.as_ptr()));
        let mut results = converter.into_results();
        match results.take(0).unwrap() {
            Err(Error::ResultConversion { message, .. }) => assert_eq!(message, "second"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
