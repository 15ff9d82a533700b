//! End-to-end tests: compile IR modules and execute them through the full
//! runtime, including custom arguments, custom calls, and value
//! specialization.

use std::ffi::c_void;
use std::sync::{Arc, Mutex};

use kiln_ir::IrType;
use kiln_runtime::{
    return_memref_as_host_buffer, Argument, Arguments, CompilationOptions, CustomCall,
    CustomCallArg, CustomCallRegistry, Error, ExecuteOpts, JitExecutable, MemrefDesc, MemrefView,
    ResultConverter, ReturnedValue, Specialization, TypeCode, UserData,
};
use kiln_types::{ArgumentAbi, DType, ExtType, Type};

// ---------------------------------------------------------------------------
// A user-defined argument type: `!testlib.custom_arg`
// ---------------------------------------------------------------------------

/// Runtime type for `!testlib.custom_arg`: passed as one opaque pointer.
#[derive(Debug)]
struct CustomArgType;

impl ExtType for CustomArgType {
    fn name(&self) -> &str {
        "!testlib.custom_arg"
    }
    fn as_argument(&self) -> Option<ArgumentAbi> {
        Some(ArgumentAbi { num_slots: 1 })
    }
}

/// Host-side argument value. The compiled function receives a pointer to
/// the string, so the packed slot holds a pointer to that pointer.
#[derive(Debug)]
struct CustomArgument {
    message: Box<String>,
    ptr: *const String,
}

impl CustomArgument {
    fn new(message: &str) -> Self {
        let message = Box::new(message.to_string());
        let ptr = &*message as *const String;
        CustomArgument { message, ptr }
    }
}

impl Argument for CustomArgument {
    fn verify(&self, ty: &Type) -> kiln_runtime::Result<()> {
        match ty {
            Type::Ext(ext) if ext.name() == "!testlib.custom_arg" => Ok(()),
            other => Err(Error::Signature(format!(
                "expected !testlib.custom_arg, got {}",
                other
            ))),
        }
    }

    fn pack(&self, slots: &mut [*mut c_void], offset: usize) -> usize {
        slots[offset] = &self.ptr as *const *const String as *mut c_void;
        offset + 1
    }
}

/// The custom argument as the custom-call handler sees it.
struct CustomArg {
    message: *const String,
}

impl CustomCallArg for CustomArg {
    fn matches(code: TypeCode) -> bool {
        code == TypeCode::of_custom("testlib.custom_arg")
    }
    unsafe fn decode(_code: TypeCode, value: *mut c_void) -> kiln_runtime::Result<Self> {
        Ok(CustomArg {
            message: value as *const String,
        })
    }
}

/// Context shared with the intrinsic handlers.
struct MyRuntimeContext {
    custom_args: Mutex<Vec<String>>,
}

fn register_my_intrinsics(registry: &mut CustomCallRegistry) {
    registry
        .register(
            CustomCall::bind("my.intrinsic")
                .user_data::<MyRuntimeContext>()
                .arg::<CustomArg>()
                .attr::<i32>("api_version")
                .to(|ctx| {
                    let state = ctx.user_data::<MyRuntimeContext>().map_err(|e| e.to_string())?;
                    let arg: CustomArg = ctx.arg(0).map_err(|e| e.to_string())?;
                    let api_version: i32 = ctx.attr("api_version").map_err(|e| e.to_string())?;
                    if api_version != 1 {
                        return Err(format!("unsupported api version {}", api_version));
                    }
                    // Safety: the caller keeps the argument alive for the
                    // duration of the call.
                    let message = unsafe { (*arg.message).clone() };
                    state.custom_args.lock().unwrap().push(message);
                    Ok(())
                }),
        )
        .unwrap();
}

// ---------------------------------------------------------------------------
// S1/S2: custom arg + custom call + value-specialized transpose
// ---------------------------------------------------------------------------

const TRANSPOSE_MODULE: &str = r#"
    module {
      // Host "runtime intrinsic" declared in the compiled module.
      func private @my.intrinsic(%arg: !testlib.custom_arg)
        attributes { rt.custom_call = "my.intrinsic" }

      // The permutation must be sunk into the body as a constant before
      // the transpose can be lowered.
      func @compute(
          %arg: !testlib.custom_arg,
          %input: tensor<?x?xf32>,
          %perm: tensor<2xi32> { specialize.value = "required" }
      ) -> tensor<?x?xf32> {
        rt.call @my.intrinsic(%arg) { api_version = 1 : i32 } : (!testlib.custom_arg) -> ()
        %t = rt.transpose %input, %perm : tensor<?x?xf32>
        func.return %t : tensor<?x?xf32>
      }
    }
"#;

fn transpose_options() -> CompilationOptions {
    let custom_type: Arc<dyn ExtType> = Arc::new(CustomArgType);
    let mut opts = CompilationOptions {
        specialization: Specialization::Enabled,
        ..CompilationOptions::default()
    };
    opts.register_dialects = Some(Arc::new(|dialects| {
        dialects.register("testlib");
    }));
    opts.type_converter.add_conversion(move |ty| match ty {
        IrType::Custom(name) if name == "testlib.custom_arg" => {
            Some(Type::Ext(custom_type.clone()))
        }
        _ => None,
    });
    opts
}

#[test]
fn test_compile_and_execute_with_custom_call() {
    let jit = JitExecutable::instantiate(TRANSPOSE_MODULE, "compute", transpose_options()).unwrap();

    // The program requires value specialization, so there is no default
    // executable.
    assert!(jit.default_executable().is_err());

    let mut input: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
    let mut perm: Vec<i32> = vec![1, 0];

    let mut args = Arguments::new(3);
    args.push_ext(CustomArgument::new("hello from the other side"));
    args.push(MemrefDesc::new(
        DType::F32,
        input.as_mut_ptr() as *mut c_void,
        0,
        &[2, 2],
        &[2, 1],
    ));
    args.push(MemrefDesc::new(
        DType::I32,
        perm.as_mut_ptr() as *mut c_void,
        0,
        &[2],
        &[1],
    ));

    let executable = jit.get_executable((&args).into()).unwrap();
    assert_eq!(executable.num_results(), 1);

    let mut registry = CustomCallRegistry::new();
    register_my_intrinsics(&mut registry);
    let context = MyRuntimeContext {
        custom_args: Mutex::new(Vec::new()),
    };
    let mut user_data = UserData::new();
    user_data.insert(&context);

    let mut converter = ResultConverter::new(executable.num_results());
    converter.add_conversion(return_memref_as_host_buffer);

    let opts = ExecuteOpts {
        custom_call_registry: Some(&registry),
        custom_call_data: Some(&user_data),
        async_runtime: None,
    };
    executable.execute((&args).into(), &converter, &opts).unwrap();

    let mut results = converter.into_results();
    match results.take(0).unwrap().unwrap() {
        ReturnedValue::Buffer(buffer) => {
            assert_eq!(buffer.dtype(), DType::F32);
            assert_eq!(buffer.sizes(), &[2, 2]);
            let data = unsafe { buffer.as_slice::<f32>() };
            assert_eq!(data, &[1.0, 3.0, 2.0, 4.0]);
        }
        other => panic!("expected a buffer result, got {:?}", other),
    }

    // The custom argument reached the intrinsic exactly once.
    let seen = context.custom_args.lock().unwrap();
    assert_eq!(seen.as_slice(), &["hello from the other side".to_string()]);
}

#[test]
fn test_specialized_executables_are_cached_per_value() {
    let jit = JitExecutable::instantiate(TRANSPOSE_MODULE, "compute", transpose_options()).unwrap();

    let mut input: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
    let mut perm: Vec<i32> = vec![1, 0];
    let mut args = Arguments::new(3);
    args.push_ext(CustomArgument::new("x"));
    args.push(MemrefDesc::new(
        DType::F32,
        input.as_mut_ptr() as *mut c_void,
        0,
        &[2, 2],
        &[2, 1],
    ));
    args.push(MemrefDesc::new(
        DType::I32,
        perm.as_mut_ptr() as *mut c_void,
        0,
        &[2],
        &[1],
    ));

    let first = jit.get_executable((&args).into()).unwrap();
    let second = jit.get_executable((&args).into()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(jit.num_specializations(), 1);

    // A different permutation value is a different specialization.
    let mut other_perm: Vec<i32> = vec![0, 1];
    let mut args2 = Arguments::new(3);
    args2.push_ext(CustomArgument::new("x"));
    args2.push(MemrefDesc::new(
        DType::F32,
        input.as_mut_ptr() as *mut c_void,
        0,
        &[2, 2],
        &[2, 1],
    ));
    args2.push(MemrefDesc::new(
        DType::I32,
        other_perm.as_mut_ptr() as *mut c_void,
        0,
        &[2],
        &[1],
    ));
    let third = jit.get_executable((&args2).into()).unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(jit.num_specializations(), 2);
}

// ---------------------------------------------------------------------------
// S6: memref views and attributes in custom calls
// ---------------------------------------------------------------------------

const MEMREF_VIEW_MODULE: &str = r#"
    module {
      func private @observe(%m: tensor<3x4xf32>)
        attributes { rt.custom_call = "test.observe" }

      func @compute(%x: tensor<3x4xf32>) {
        rt.call @observe(%x) { axis = 2 : i32 } : (tensor<3x4xf32>) -> ()
        func.return
      }
    }
"#;

#[derive(Debug, Default)]
struct Observed {
    views: Mutex<Vec<(DType, Vec<i64>, i32)>>,
}

#[test]
fn test_custom_call_memref_view_decoding() {
    let jit = JitExecutable::instantiate(
        MEMREF_VIEW_MODULE,
        "compute",
        CompilationOptions::default(),
    )
    .unwrap();
    let executable = jit.default_executable().unwrap();

    let mut registry = CustomCallRegistry::new();
    registry
        .register(
            CustomCall::bind("test.observe")
                .user_data::<Observed>()
                .arg::<MemrefView>()
                .attr::<i32>("axis")
                .to(|ctx| {
                    let state = ctx.user_data::<Observed>().map_err(|e| e.to_string())?;
                    let view: MemrefView = ctx.arg(0).map_err(|e| e.to_string())?;
                    let axis: i32 = ctx.attr("axis").map_err(|e| e.to_string())?;
                    state
                        .views
                        .lock()
                        .unwrap()
                        .push((view.dtype, view.sizes.clone(), axis));
                    Ok(())
                }),
        )
        .unwrap();

    let observed = Observed::default();
    let mut user_data = UserData::new();
    user_data.insert(&observed);

    let mut data = vec![0.0f32; 12];
    let mut args = Arguments::new(1);
    args.push(MemrefDesc::new(
        DType::F32,
        data.as_mut_ptr() as *mut c_void,
        0,
        &[3, 4],
        &[4, 1],
    ));

    let converter = ResultConverter::new(0);
    let opts = ExecuteOpts {
        custom_call_registry: Some(&registry),
        custom_call_data: Some(&user_data),
        async_runtime: None,
    };
    executable.execute((&args).into(), &converter, &opts).unwrap();

    let views = observed.views.lock().unwrap();
    assert_eq!(views.len(), 1);
    let (dtype, sizes, axis) = &views[0];
    assert_eq!(*dtype, DType::F32);
    assert_eq!(sizes, &vec![3, 4]);
    assert_eq!(*axis, 2);
}

// ---------------------------------------------------------------------------
// Async results
// ---------------------------------------------------------------------------

const ASYNC_MODULE: &str = r#"
    func @compute(%x: memref<?xf32>) -> (!async.token, !async.value<memref<?xf32>>) {
      %c0 = arith.constant 0 : index
      %d = memref.dim %x, 0
      %m = memref.alloc(%d) : memref<?xf32>
      scf.for %i = %c0 to %d {
        %v = memref.load %x[%i] : memref<?xf32>
        memref.store %v, %m[%i] : memref<?xf32>
      }
      %t = async.ready_token
      %av = async.ready_value %m : !async.value<memref<?xf32>>
      func.return %t, %av : !async.token, !async.value<memref<?xf32>>
    }
"#;

#[test]
fn test_async_token_and_value_results() {
    use kiln_runtime::{return_async_token, return_async_value_as_host_buffer, AsyncRuntime};

    let jit =
        JitExecutable::instantiate(ASYNC_MODULE, "compute", CompilationOptions::default()).unwrap();
    let executable = jit.default_executable().unwrap();
    assert_eq!(executable.num_results(), 2);

    let mut input: Vec<f32> = vec![5.0, 6.0, 7.0];
    let mut args = Arguments::new(1);
    args.push(MemrefDesc::new(
        DType::F32,
        input.as_mut_ptr() as *mut c_void,
        0,
        &[3],
        &[1],
    ));

    let mut converter = ResultConverter::new(executable.num_results());
    converter.add_conversion(return_memref_as_host_buffer);
    converter.add_conversion(return_async_token);
    converter.add_conversion(return_async_value_as_host_buffer);

    let runtime = AsyncRuntime::new();
    let opts = ExecuteOpts {
        custom_call_registry: None,
        custom_call_data: None,
        async_runtime: Some(&runtime),
    };
    executable.execute((&args).into(), &converter, &opts).unwrap();

    // Both async handles were created under the installed runtime binding.
    assert_eq!(runtime.handles_created(), 2);

    let mut results = converter.into_results();
    match results.take(0).unwrap().unwrap() {
        ReturnedValue::Token(token) => token.wait().unwrap(),
        other => panic!("expected a token, got {:?}", other),
    }
    match results.take(1).unwrap().unwrap() {
        ReturnedValue::AsyncBuffer(pending) => {
            let buffer = pending.wait().unwrap();
            assert_eq!(buffer.sizes(), &[3]);
            assert_eq!(unsafe { buffer.as_slice::<f32>() }, &[5.0, 6.0, 7.0]);
        }
        other => panic!("expected an async buffer, got {:?}", other),
    }
}

#[test]
fn test_unknown_custom_call_fails_execution() {
    let jit = JitExecutable::instantiate(
        MEMREF_VIEW_MODULE,
        "compute",
        CompilationOptions::default(),
    )
    .unwrap();
    let executable = jit.default_executable().unwrap();

    let mut data = vec![0.0f32; 12];
    let mut args = Arguments::new(1);
    args.push(MemrefDesc::new(
        DType::F32,
        data.as_mut_ptr() as *mut c_void,
        0,
        &[3, 4],
        &[4, 1],
    ));

    // Empty registry: the dispatcher reports an unknown custom call and
    // execution fails.
    let registry = CustomCallRegistry::new();
    let converter = ResultConverter::new(0);
    let opts = ExecuteOpts {
        custom_call_registry: Some(&registry),
        custom_call_data: None,
        async_runtime: None,
    };
    let err = executable
        .execute((&args).into(), &converter, &opts)
        .unwrap_err();
    assert!(err.to_string().contains("unknown custom call"));
}
