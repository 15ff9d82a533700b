//! JIT compilation contexts.
//!
//! A [`JitCompilationContext`] owns the parsed module for one compilation
//! attempt: parse → (optionally) specialize to concrete operands → run the
//! registered pipeline and the lowering passes → codegen → [`Executable`].
//! Contexts are single-use; [`JitCompilationContext::compile`] consumes the
//! context. Diagnostics produced along the way are captured per context
//! and attached to every error it reports.

use std::sync::Arc;

use tracing::debug;

use kiln_ir::passes::{AlignedAlloc, Canonicalize, ExpandTranspose};
use kiln_ir::{
    parse_module, DialectRegistry, Function as IrFunction, IrType, Module as IrModule, Op,
    PassManager, Region, Value,
};
use kiln_types::{DType, FunctionType, Type};

use crate::abi::{runtime_symbol_map, HelperTable};
use crate::arguments::{ArgumentsRef, MemrefDesc};
use crate::codegen::backend::{CompiledModule, CraneliftBackend, RodataBuilder};
use crate::codegen::lower::FunctionLowering;
use crate::codegen::OptLevel;
use crate::engine::JitEngine;
use crate::error::{Error, Result};
use crate::executable::Executable;
use crate::obj_file::ObjectFile;
use crate::types_conv::TypeConverter;

/// Operand specialization policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Specialization {
    /// Only the default executable is ever compiled; modules that require
    /// specialization fail to instantiate.
    Disabled,
    /// Compile a default executable when possible, specialize on demand.
    #[default]
    Enabled,
    /// Always specialize; no default executable even when one would
    /// compile.
    Always,
}

/// Callback populating the compilation pipeline that lowers client
/// dialects down to the runtime's core ops.
pub type CompilationPipelineFn = Arc<dyn Fn(&mut PassManager) + Send + Sync>;

/// Callback seeding the dialect registry for parsing.
pub type RegisterDialectsFn = Arc<dyn Fn(&mut DialectRegistry) + Send + Sync>;

/// Rewrites a user-facing signature into the runtime signature the
/// compiled entrypoint will actually have.
pub type CallingConvention = Arc<dyn Fn(&FunctionType) -> Option<FunctionType> + Send + Sync>;

/// The default calling convention: tensors become memrefs and the kernel
/// context is prepended. Matches what [`kiln_ir::passes::Bufferize`] does
/// to the module.
pub fn default_calling_convention() -> CallingConvention {
    fn bufferize(ty: &Type) -> Type {
        match ty {
            Type::RankedTensor { dims, dtype } => Type::Memref {
                dims: dims.clone(),
                dtype: *dtype,
            },
            Type::UnrankedTensor { dtype } => Type::UnrankedMemref { dtype: *dtype },
            Type::AsyncValue(inner) => Type::AsyncValue(Box::new(bufferize(inner))),
            other => other.clone(),
        }
    }
    Arc::new(|signature| {
        let mut inputs = Vec::with_capacity(signature.num_inputs() + 1);
        inputs.push(Type::KernelContext);
        inputs.extend(signature.inputs().iter().map(bufferize));
        let results = signature.results().iter().map(bufferize).collect();
        Some(FunctionType::new(inputs, results))
    })
}

/// Options controlling compilation of a module.
#[derive(Clone)]
pub struct CompilationOptions {
    /// Specialization policy (see [`Specialization`]).
    pub specialization: Specialization,
    /// Seeds the dialect registry before parsing.
    pub register_dialects: Option<RegisterDialectsFn>,
    /// Populates the pipeline run before the built-in lowering passes.
    pub create_compilation_pipeline: Option<CompilationPipelineFn>,
    /// Expected user→runtime signature rewrite; checked against the
    /// pipeline's actual output when present.
    pub calling_convention: Option<CallingConvention>,
    /// Conversions from IR types to runtime types.
    pub type_converter: TypeConverter,
    /// Minimum alignment forced onto dynamic allocations; zero disables.
    pub alignment: u64,
    /// Optimization level handed to the JIT backend.
    pub jit_code_opt_level: OptLevel,
    /// Target parallelism for async-expansion passes.
    pub num_worker_threads: usize,
}

impl Default for CompilationOptions {
    fn default() -> Self {
        CompilationOptions {
            specialization: Specialization::default(),
            register_dialects: None,
            create_compilation_pipeline: None,
            calling_convention: Some(default_calling_convention()),
            type_converter: TypeConverter::new(),
            alignment: 0,
            jit_code_opt_level: OptLevel::default(),
            num_worker_threads: 0,
        }
    }
}

/// Single-use compilation state: the parsed module plus captured
/// diagnostics.
pub struct JitCompilationContext {
    opts: CompilationOptions,
    module: IrModule,
    diagnostics: String,
}

impl std::fmt::Debug for JitCompilationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitCompilationContext")
            .field("diagnostics", &self.diagnostics)
            .finish_non_exhaustive()
    }
}

impl JitCompilationContext {
    /// Parse `source` into a fresh compilation context.
    pub fn instantiate(opts: CompilationOptions, source: &str) -> Result<JitCompilationContext> {
        let mut dialects = DialectRegistry::new();
        if let Some(register) = &opts.register_dialects {
            register(&mut dialects);
        }
        let module = parse_module(source, &dialects)
            .map_err(|err| Error::Parse(err.to_string()))?;
        Ok(JitCompilationContext {
            opts,
            module,
            diagnostics: String::new(),
        })
    }

    /// The parsed module.
    pub fn module(&self) -> &IrModule {
        &self.module
    }

    fn note(&mut self, message: impl AsRef<str>) {
        if !self.diagnostics.is_empty() {
            self.diagnostics.push('\n');
        }
        self.diagnostics.push_str(message.as_ref());
    }

    fn compilation_error(&self, message: impl Into<String>) -> Error {
        let mut message = message.into();
        if !self.diagnostics.is_empty() {
            message.push_str(":\n");
            message.push_str(&self.diagnostics);
        }
        Error::Compilation(message)
    }

    /// Specialize the entrypoint to concrete operands: dynamic dimensions
    /// are replaced with the operands' sizes, and operands marked
    /// `specialize.value = "required"` are sunk into the function body as
    /// constants.
    pub fn specialize(&mut self, operands: ArgumentsRef<'_>, entrypoint: &str) -> Result<()> {
        let func = self
            .module
            .lookup_mut(entrypoint)
            .ok_or_else(|| Error::Specialization(format!("entrypoint `{}` not found", entrypoint)))?;
        if operands.len() != func.params.len() {
            return Err(Error::Specialization(format!(
                "expected {} operands, got {}",
                func.params.len(),
                operands.len()
            )));
        }

        let mut sunk = Vec::new();
        for i in 0..func.params.len() {
            let (shaped, needs_value) = {
                let param = &func.params[i];
                (
                    matches!(param.ty, IrType::Tensor { .. } | IrType::Memref { .. }),
                    param.attrs.str_is("specialize.value", "required"),
                )
            };
            if !shaped {
                continue;
            }
            let memref = operands.memref(i).ok_or_else(|| {
                Error::Specialization(format!("operand #{} must be a memref descriptor", i))
            })?;

            // Replace dynamic dimensions with the operand's sizes.
            let param = &mut func.params[i];
            let new_ty = match &param.ty {
                IrType::Tensor { dims, dtype } => {
                    check_specialized_shape(i, dims, memref)?;
                    IrType::Tensor {
                        dims: memref.sizes().to_vec(),
                        dtype: *dtype,
                    }
                }
                IrType::Memref { dims, dtype } => {
                    check_specialized_shape(i, dims, memref)?;
                    IrType::Memref {
                        dims: memref.sizes().to_vec(),
                        dtype: *dtype,
                    }
                }
                _ => unreachable!("checked shaped above"),
            };
            param.ty = new_ty.clone();
            let value = param.value;
            func.set_value_type(value, new_ty.clone());

            if needs_value {
                let contents = read_operand_contents(i, memref)?;
                sunk.push((value, contents, new_ty));
            }
        }

        // Sink value-specialized operands as dense constants ahead of all
        // uses, redirecting every use of the original block argument.
        for (old_value, values, ty) in sunk {
            let constant = func.new_value(ty.clone());
            if let Some(body) = &mut func.body {
                replace_uses(body, old_value, constant);
                body.ops.insert(
                    0,
                    Op::ConstDense {
                        result: constant,
                        values,
                        ty,
                    },
                );
            }
        }
        Ok(())
    }

    /// Lower the module and produce an executable. Consumes the context.
    pub fn compile(mut self, entrypoint: &str) -> Result<Executable> {
        // User-facing signature, captured before any pipeline rewrites it.
        let user_func = self
            .module
            .lookup(entrypoint)
            .ok_or_else(|| self.compilation_error("entrypoint function not found"))?;
        let user_inputs: Vec<IrType> = user_func.params.iter().map(|p| p.ty.clone()).collect();
        let user_results = user_func.results.clone();
        let signature = self
            .opts
            .type_converter
            .convert_signature(&user_inputs, &user_results)?;

        // Client pipeline lowers its dialects to the runtime's core ops;
        // without one, the default pipeline applies the runtime calling
        // convention.
        let mut pipeline = PassManager::new();
        match &self.opts.create_compilation_pipeline {
            Some(create) => create(&mut pipeline),
            None => kiln_ir::passes::register_default_pipeline(&mut pipeline),
        }
        if let Err(err) = pipeline.run(&mut self.module) {
            self.note(err.to_string());
            return Err(self.compilation_error("failed to run compilation pipeline"));
        }

        // Built-in lowering: fold, expand high-level ops, enforce
        // allocation alignment, clean up.
        let mut lowering = PassManager::new();
        lowering.add_pass(Canonicalize);
        lowering.add_pass(ExpandTranspose);
        lowering.add_pass(AlignedAlloc::new(self.opts.alignment));
        lowering.add_pass(Canonicalize);
        if let Err(err) = lowering.run(&mut self.module) {
            self.note(err.to_string());
            return Err(self.compilation_error("failed to lower module"));
        }

        // Resolve the runtime entry function, honoring redirection.
        let entry = resolve_entrypoint(&self.module, entrypoint)
            .map_err(|err| self.compilation_error(err.to_string()))?;
        let entry_name = entry.name.clone();
        let entry_inputs: Vec<IrType> = entry.params.iter().map(|p| p.ty.clone()).collect();
        let entry_results = entry.results.clone();
        let runtime_signature = self
            .opts
            .type_converter
            .convert_signature(&entry_inputs, &entry_results)?;

        if let Some(convention) = &self.opts.calling_convention {
            if let Some(expected) = convention(&signature) {
                if expected != runtime_signature {
                    return Err(self.compilation_error(format!(
                        "pipeline produced runtime signature {}, but the calling \
                         convention expects {}",
                        runtime_signature, expected
                    )));
                }
            }
        }

        debug!(entrypoint = %entry_name, signature = %runtime_signature, "compiling module");

        // Codegen.
        let backend = CraneliftBackend::host(self.opts.jit_code_opt_level)?;
        let call_targets = self.module.custom_call_targets();
        let entry = self
            .module
            .lookup(&entry_name)
            .expect("entry resolved above");
        let mut rodata = RodataBuilder::new();
        let clif_ctx = FunctionLowering::lower(&backend, entry, &call_targets, &mut rodata)
            .map_err(|err| self.compilation_error(err.to_string()))?;
        let function = backend
            .compile_function(clif_ctx, &entry_name)
            .map_err(|err| self.compilation_error(err.to_string()))?;
        let (rodata, rodata_relocs) = rodata.finish();
        let compiled = CompiledModule {
            target_triple: backend.triple(),
            functions: vec![function],
            rodata,
            rodata_relocs,
        };

        // Preserve the object file for AOT replay, register the runtime
        // symbol map, and place the code.
        let obj = ObjectFile::encode(&compiled, &entry_name);
        let symbols = runtime_symbol_map();
        let helpers = HelperTable::from_symbol_map(&symbols)?;
        let engine = JitEngine::new(compiled, &symbols, Some(obj))?;
        Executable::new(
            Box::new(engine),
            signature,
            runtime_signature,
            entry_name,
            helpers,
        )
    }
}

/// Resolve the entrypoint, following an `rt.entrypoint = @symbol`
/// redirection attribute when present.
pub(crate) fn resolve_entrypoint<'a>(
    module: &'a IrModule,
    entrypoint: &str,
) -> Result<&'a IrFunction> {
    let func = module
        .lookup(entrypoint)
        .ok_or_else(|| Error::Compilation("entrypoint function not found".to_string()))?;
    if let Some(redirect) = func.attrs.get("rt.entrypoint").and_then(|a| a.as_symbol()) {
        return module.lookup(redirect).ok_or_else(|| {
            Error::Compilation(format!(
                "runtime entrypoint `@{}` referenced by `@{}` not found",
                redirect, entrypoint
            ))
        });
    }
    Ok(func)
}

fn check_specialized_shape(index: usize, dims: &[i64], memref: &MemrefDesc) -> Result<()> {
    if memref.rank() != dims.len() {
        return Err(Error::Specialization(format!(
            "operand #{} rank {} does not match input rank {}",
            index,
            memref.rank(),
            dims.len()
        )));
    }
    for (d, (&operand_dim, &expected)) in memref.sizes().iter().zip(dims).enumerate() {
        if expected != kiln_types::DYNAMIC_DIM && operand_dim != expected {
            return Err(Error::Specialization(format!(
                "operand #{} dimension #{} is {}, expected {}",
                index, d, operand_dim, expected
            )));
        }
    }
    Ok(())
}

/// Read an integer operand's contents for value specialization.
pub(crate) fn read_operand_contents(index: usize, memref: &MemrefDesc) -> Result<Vec<i64>> {
    if memref.data().is_null() {
        return Err(Error::Specialization(format!(
            "operand #{} requires value specialization but has no data",
            index
        )));
    }
    let dtype = memref.dtype();
    if !dtype.is_integer() {
        return Err(Error::Specialization(format!(
            "operand #{} requires value specialization but has non-integer type {}",
            index, dtype
        )));
    }

    let rank = memref.rank();
    let sizes = memref.sizes();
    let strides = memref.strides();
    let count = sizes.iter().product::<i64>().max(0) as usize;
    let mut values = Vec::with_capacity(count);
    let mut idx = vec![0i64; rank];
    for _ in 0..count {
        let linear: i64 =
            memref.offset() + idx.iter().zip(strides).map(|(i, s)| i * s).sum::<i64>();
        // Safety: the caller guarantees the operand buffer covers its
        // declared sizes/strides for the duration of the call.
        let value = unsafe {
            let base = memref.data() as *const u8;
            let ptr = base.add(linear as usize * dtype.size_in_bytes());
            match dtype {
                DType::I1 | DType::I8 => i64::from(*(ptr as *const i8)),
                DType::UI8 => i64::from(*ptr),
                DType::I16 => i64::from(*(ptr as *const i16)),
                DType::UI16 => i64::from(*(ptr as *const u16)),
                DType::I32 => i64::from(*(ptr as *const i32)),
                DType::UI32 => i64::from(*(ptr as *const u32)),
                DType::I64 | DType::UI64 => *(ptr as *const i64),
                _ => unreachable!("checked integer above"),
            }
        };
        values.push(value);
        // Row-major odometer.
        for d in (0..rank).rev() {
            idx[d] += 1;
            if idx[d] < sizes[d] {
                break;
            }
            idx[d] = 0;
        }
    }
    Ok(values)
}

fn replace_uses(region: &mut Region, from: Value, to: Value) {
    for op in &mut region.ops {
        op.map_operands(&mut |v| if v == from { to } else { v });
        for nested in op.regions_mut() {
            replace_uses(nested, from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::c_void;

    const COPY_MODULE: &str = r#"
        func @compute(%arg0: memref<?xf32>, %arg1: memref<?xf32>) {
          %c0 = arith.constant 0 : index
          %v = memref.load %arg0[%c0] : memref<?xf32>
          memref.store %v, %arg1[%c0] : memref<?xf32>
          func.return
        }
    "#;

    #[test]
    fn test_instantiate_and_parse_error() {
        let ctx =
            JitCompilationContext::instantiate(CompilationOptions::default(), COPY_MODULE).unwrap();
        assert!(ctx.module().lookup("compute").is_some());

        let err = JitCompilationContext::instantiate(
            CompilationOptions::default(),
            "func @broken( {",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_specialize_updates_shapes() {
        let mut ctx =
            JitCompilationContext::instantiate(CompilationOptions::default(), COPY_MODULE).unwrap();
        let mut a = [1.0f32; 4];
        let mut b = [0.0f32; 4];
        let memrefs = vec![
            MemrefDesc::new(
                kiln_types::DType::F32,
                a.as_mut_ptr() as *mut c_void,
                0,
                &[4],
                &[1],
            ),
            MemrefDesc::new(
                kiln_types::DType::F32,
                b.as_mut_ptr() as *mut c_void,
                0,
                &[4],
                &[1],
            ),
        ];
        ctx.specialize((&memrefs).into(), "compute").unwrap();
        let func = ctx.module().lookup("compute").unwrap();
        assert_eq!(
            func.params[0].ty,
            IrType::Memref {
                dims: vec![4],
                dtype: kiln_types::DType::F32
            }
        );
    }

    #[test]
    fn test_specialize_value_sinks_constant() {
        let source = r#"
            func @compute(%p: memref<2xi32> { specialize.value = "required" }) {
              func.return
            }
        "#;
        let mut ctx =
            JitCompilationContext::instantiate(CompilationOptions::default(), source).unwrap();
        let mut perm = [1i32, 0];
        let memrefs = vec![MemrefDesc::new(
            kiln_types::DType::I32,
            perm.as_mut_ptr() as *mut c_void,
            0,
            &[2],
            &[1],
        )];
        ctx.specialize((&memrefs).into(), "compute").unwrap();
        let func = ctx.module().lookup("compute").unwrap();
        match &func.body.as_ref().unwrap().ops[0] {
            Op::ConstDense { values, .. } => assert_eq!(values, &vec![1, 0]),
            other => panic!("expected sunk constant, got {:?}", other),
        }
    }

    #[test]
    fn test_specialize_value_requires_data() {
        let source = r#"
            func @compute(%p: memref<2xi32> { specialize.value = "required" }) {
              func.return
            }
        "#;
        let mut ctx =
            JitCompilationContext::instantiate(CompilationOptions::default(), source).unwrap();
        let memrefs = vec![MemrefDesc::new(
            kiln_types::DType::I32,
            std::ptr::null_mut(),
            0,
            &[2],
            &[1],
        )];
        let err = ctx.specialize((&memrefs).into(), "compute").unwrap_err();
        assert!(matches!(err, Error::Specialization(_)));
        assert!(err.to_string().contains("no data"));
    }

    #[test]
    fn test_entrypoint_redirection() {
        let source = r#"
            func @compute() attributes { rt.entrypoint = @compute_rt } {
              func.return
            }
            func @compute_rt() {
              func.return
            }
        "#;
        let ctx =
            JitCompilationContext::instantiate(CompilationOptions::default(), source).unwrap();
        let entry = resolve_entrypoint(ctx.module(), "compute").unwrap();
        assert_eq!(entry.name, "compute_rt");
    }
}
