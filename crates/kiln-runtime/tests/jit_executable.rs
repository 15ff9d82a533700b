//! Specialization-cache behavior: operand verification, compile-once
//! memoization, and concurrent `get_executable` correctness.

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kiln_ir::passes::register_default_pipeline;
use kiln_runtime::{
    Arguments, CompilationOptions, ExecuteOpts, JitExecutable, MemrefDesc, ResultConverter,
    Specialization,
};
use kiln_types::DType;

const TWO_INPUT_MODULE: &str = r#"
    func @compute(%a: memref<?x?xf32>, %b: memref<?x?xf32>) {
      func.return
    }
"#;

fn memref_2d(data: *mut c_void, rows: i64, cols: i64) -> MemrefDesc {
    MemrefDesc::new(DType::F32, data, 0, &[rows, cols], &[cols, 1])
}

/// Options whose pipeline callback counts how many compilations ran.
fn counting_options(counter: Arc<AtomicUsize>) -> CompilationOptions {
    let mut opts = CompilationOptions {
        specialization: Specialization::Always,
        ..CompilationOptions::default()
    };
    opts.create_compilation_pipeline = Some(Arc::new(move |pm| {
        counter.fetch_add(1, Ordering::SeqCst);
        register_default_pipeline(pm);
    }));
    opts
}

#[test]
fn test_arity_and_rank_verification() {
    let opts = CompilationOptions {
        specialization: Specialization::Disabled,
        ..CompilationOptions::default()
    };
    let jit = JitExecutable::instantiate(TWO_INPUT_MODULE, "compute", opts).unwrap();
    let executable = jit.default_executable().unwrap();

    let mut data = vec![0.0f32; 4];
    let ptr = data.as_mut_ptr() as *mut c_void;

    // Three operands against a two-input signature.
    let mut args = Arguments::new(3);
    args.push(memref_2d(ptr, 2, 2));
    args.push(memref_2d(ptr, 2, 2));
    args.push(memref_2d(ptr, 2, 2));
    let converter = ResultConverter::new(0);
    let err = executable
        .execute((&args).into(), &converter, &ExecuteOpts::default())
        .unwrap_err();
    assert!(err.to_string().contains("number of operands"));

    // A rank-1 operand against a rank-2 input.
    let mut args = Arguments::new(2);
    args.push(MemrefDesc::new(DType::F32, ptr, 0, &[4], &[1]));
    args.push(memref_2d(ptr, 2, 2));
    let converter = ResultConverter::new(0);
    let err = executable
        .execute((&args).into(), &converter, &ExecuteOpts::default())
        .unwrap_err();
    assert!(err.to_string().contains("rank"));
}

#[test]
fn test_cache_hit_compiles_once() {
    let counter = Arc::new(AtomicUsize::new(0));
    let jit = JitExecutable::instantiate(
        TWO_INPUT_MODULE,
        "compute",
        counting_options(counter.clone()),
    )
    .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    let mut data = vec![0.0f32; 4];
    let ptr = data.as_mut_ptr() as *mut c_void;

    let first = {
        let mut args = Arguments::new(2);
        args.push(memref_2d(ptr, 2, 2));
        args.push(memref_2d(ptr, 2, 2));
        jit.get_executable((&args).into()).unwrap()
    };
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // Repeated lookups with the same shapes never recompile, regardless of
    // where the buffers live.
    let mut other = vec![0.0f32; 4];
    for _ in 0..1000 {
        let mut args = Arguments::new(2);
        args.push(memref_2d(other.as_mut_ptr() as *mut c_void, 2, 2));
        args.push(memref_2d(ptr, 2, 2));
        let executable = jit.get_executable((&args).into()).unwrap();
        assert!(Arc::ptr_eq(&first, &executable));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(jit.num_specializations(), 1);

    // A new shape is a new specialization.
    let mut bigger = vec![0.0f32; 12];
    let mut args = Arguments::new(2);
    args.push(memref_2d(bigger.as_mut_ptr() as *mut c_void, 3, 4));
    args.push(memref_2d(bigger.as_mut_ptr() as *mut c_void, 3, 4));
    jit.get_executable((&args).into()).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(jit.num_specializations(), 2);
}

#[test]
fn test_concurrent_get_executable_installs_one_entry() {
    let counter = Arc::new(AtomicUsize::new(0));
    let jit = Arc::new(
        JitExecutable::instantiate(
            TWO_INPUT_MODULE,
            "compute",
            counting_options(counter.clone()),
        )
        .unwrap(),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let jit = jit.clone();
        handles.push(std::thread::spawn(move || {
            // Each thread owns its buffers; fingerprints depend only on
            // shapes and dtypes, so all threads race on one cache entry.
            let mut data = vec![0.0f32; 4];
            let ptr = data.as_mut_ptr() as *mut c_void;
            let mut args = Arguments::new(2);
            args.push(memref_2d(ptr, 2, 2));
            args.push(memref_2d(ptr, 2, 2));
            let executable = jit.get_executable((&args).into()).unwrap();
            Arc::as_ptr(&executable) as usize
        }));
    }
    let addresses: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Racing threads may compile redundantly, but exactly one entry is
    // observable and every thread got the same executable.
    assert_eq!(jit.num_specializations(), 1);
    assert!(addresses.windows(2).all(|w| w[0] == w[1]));
    assert!(counter.load(Ordering::SeqCst) >= 1);
}
