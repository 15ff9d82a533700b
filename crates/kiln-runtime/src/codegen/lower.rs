//! IR → Cranelift lowering.
//!
//! The entry function receives a single `void**` argument array. Inputs are
//! unpacked eagerly in the entry block; results are written into the cells
//! the call frame appended after the input slots.
//!
//! Host hooks (allocation, custom-call dispatch, async handles) are called
//! indirectly through the helper table at the head of the kernel-context
//! operand, so generated code carries no call relocations. The only
//! relocations are absolute references into the module's rodata blob
//! (custom-call names and attribute tables).

use cranelift_codegen::ir::{
    self, condcodes::IntCC, immediates::Imm64, types, AbiParam, BlockArg, ExternalName,
    GlobalValueData, InstBuilder, MemFlags, Signature, StackSlotData, StackSlotKind,
    UserExternalName, UserFuncName,
};
use cranelift_codegen::isa::CallConv;
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use rustc_hash::FxHashMap;

use kiln_ir::{Attribute, BinOp, Function as IrFunction, Op, Region, Value};
use kiln_ir::IrType;
use kiln_types::DType;

use crate::abi::{helper_offsets, TypeCode};
use crate::codegen::backend::{CraneliftBackend, RodataBuilder, NS_RODATA};
use crate::error::{Error, Result};

/// Lowered form of one SSA value.
#[derive(Clone)]
enum Lowered {
    Scalar(ir::Value),
    Memref(MemrefVal),
    Handle(ir::Value),
    Context(ir::Value),
}

/// A memref value as individual cranelift values.
#[derive(Clone)]
struct MemrefVal {
    base: ir::Value,
    data: ir::Value,
    offset: ir::Value,
    sizes: Vec<ir::Value>,
    strides: Vec<ir::Value>,
    dtype: DType,
}

/// Cranelift type of a scalar element.
fn clif_type(dtype: DType) -> Result<ir::Type> {
    Ok(match dtype {
        DType::I1 | DType::I8 | DType::UI8 => types::I8,
        DType::I16 | DType::UI16 => types::I16,
        DType::I32 | DType::UI32 => types::I32,
        DType::I64 | DType::UI64 => types::I64,
        DType::F32 => types::F32,
        DType::F64 => types::F64,
        other => {
            return Err(Error::Compilation(format!(
                "element type {} is not supported in generated code",
                other
            )))
        }
    })
}

/// Number of packed argument slots for one runtime-signature input.
fn param_slots(ty: &IrType) -> Result<usize> {
    Ok(match ty {
        IrType::KernelContext | IrType::Custom(_) => 1,
        IrType::Memref { dims, .. } => 3 + 2 * dims.len(),
        other => {
            return Err(Error::Compilation(format!(
                "type {} is not supported as a compiled function input",
                other
            )))
        }
    })
}

pub(crate) struct FunctionLowering<'a> {
    func: &'a IrFunction,
    call_targets: &'a FxHashMap<String, String>,
    rodata: &'a mut RodataBuilder,
    ptr_ty: ir::Type,
    call_conv: CallConv,
    values: FxHashMap<Value, Lowered>,
    callee_names: FxHashMap<String, u64>,
    args_ptr: ir::Value,
    ctx_ptr: Option<ir::Value>,
    fail_block: Option<ir::Block>,
    num_input_slots: usize,
}

impl<'a> FunctionLowering<'a> {
    /// Lower `func` into a ready-to-compile cranelift context.
    ///
    /// `call_targets` maps callee symbols to their registered custom-call
    /// names; `rodata` accumulates the module's read-only data.
    pub(crate) fn lower(
        backend: &CraneliftBackend,
        func: &'a IrFunction,
        call_targets: &'a FxHashMap<String, String>,
        rodata: &'a mut RodataBuilder,
    ) -> Result<Context> {
        let isa = backend.isa();
        let ptr_ty = isa.pointer_type();
        if ptr_ty != types::I64 {
            return Err(Error::Compilation(
                "only 64-bit targets are supported".to_string(),
            ));
        }
        let call_conv = isa.default_call_conv();

        let mut sig = Signature::new(call_conv);
        sig.params.push(AbiParam::new(ptr_ty));

        let (mut ctx, mut fb_ctx) = backend.new_context();
        ctx.func = ir::Function::with_name_signature(UserFuncName::user(0, 0), sig);

        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fb_ctx);
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);
        let args_ptr = builder.block_params(entry)[0];

        let mut lowering = FunctionLowering {
            func,
            call_targets,
            rodata,
            ptr_ty,
            call_conv,
            values: FxHashMap::default(),
            callee_names: FxHashMap::default(),
            args_ptr,
            ctx_ptr: None,
            fail_block: None,
            num_input_slots: 0,
        };
        lowering.unpack_params(&mut builder)?;

        let body = func
            .body
            .as_ref()
            .ok_or_else(|| Error::Compilation("cannot compile a function declaration".into()))?;
        lowering.lower_region(&mut builder, body, true)?;

        // The failure path returns early; result cells are left unwritten
        // and the kernel context carries the error.
        if let Some(fail) = lowering.fail_block {
            builder.switch_to_block(fail);
            builder.seal_block(fail);
            builder.ins().return_(&[]);
        }
        builder.finalize();
        Ok(ctx)
    }

    // ---- Argument unpacking ----

    /// Pointer stored in args[k].
    fn arg_slot(&self, builder: &mut FunctionBuilder<'_>, k: usize) -> ir::Value {
        builder
            .ins()
            .load(self.ptr_ty, MemFlags::trusted(), self.args_ptr, (k * 8) as i32)
    }

    /// Value of the field args[k] points at.
    fn load_field(&self, builder: &mut FunctionBuilder<'_>, k: usize, ty: ir::Type) -> ir::Value {
        let slot = self.arg_slot(builder, k);
        builder.ins().load(ty, MemFlags::trusted(), slot, 0)
    }

    fn unpack_params(&mut self, builder: &mut FunctionBuilder<'_>) -> Result<()> {
        let mut slot = 0usize;
        for param in &self.func.params {
            match &param.ty {
                IrType::KernelContext => {
                    let ptr = self.load_field(builder, slot, self.ptr_ty);
                    self.ctx_ptr = Some(ptr);
                    self.values.insert(param.value, Lowered::Context(ptr));
                }
                IrType::Custom(_) => {
                    let ptr = self.load_field(builder, slot, self.ptr_ty);
                    self.values.insert(param.value, Lowered::Scalar(ptr));
                }
                IrType::Memref { dims, dtype } => {
                    let rank = dims.len();
                    let base = self.load_field(builder, slot, self.ptr_ty);
                    let data = self.load_field(builder, slot + 1, self.ptr_ty);
                    let offset = self.load_field(builder, slot + 2, types::I64);
                    let mut sizes = Vec::with_capacity(rank);
                    let mut strides = Vec::with_capacity(rank);
                    for d in 0..rank {
                        sizes.push(self.load_field(builder, slot + 3 + d, types::I64));
                    }
                    for d in 0..rank {
                        strides.push(self.load_field(builder, slot + 3 + rank + d, types::I64));
                    }
                    self.values.insert(
                        param.value,
                        Lowered::Memref(MemrefVal {
                            base,
                            data,
                            offset,
                            sizes,
                            strides,
                            dtype: *dtype,
                        }),
                    );
                }
                other => {
                    return Err(Error::Compilation(format!(
                        "type {} is not supported as a compiled function input",
                        other
                    )))
                }
            }
            slot += param_slots(&param.ty)?;
        }
        self.num_input_slots = slot;
        Ok(())
    }

    // ---- Value access ----

    fn scalar(&self, value: Value) -> Result<ir::Value> {
        match self.values.get(&value) {
            Some(Lowered::Scalar(v)) => Ok(*v),
            Some(_) => Err(Error::Compilation(format!(
                "{} is not a scalar value",
                value
            ))),
            None => Err(Error::Compilation(format!(
                "{} has no runtime representation",
                value
            ))),
        }
    }

    fn memref(&self, value: Value) -> Result<MemrefVal> {
        match self.values.get(&value) {
            Some(Lowered::Memref(m)) => Ok(m.clone()),
            _ => Err(Error::Compilation(format!("{} is not a memref value", value))),
        }
    }

    fn require_ctx(&self) -> Result<ir::Value> {
        self.ctx_ptr.ok_or_else(|| {
            Error::Compilation(
                "this operation requires the runtime calling convention \
                 (leading !rt.kernel_context operand)"
                    .to_string(),
            )
        })
    }

    // ---- Host hooks ----

    /// Load a hook address from the kernel context's helper table and call
    /// it indirectly.
    fn call_helper(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        table_offset: i32,
        sig: Signature,
        args: &[ir::Value],
    ) -> Result<ir::Inst> {
        let ctx = self.require_ctx()?;
        let fn_ptr = builder
            .ins()
            .load(self.ptr_ty, MemFlags::trusted(), ctx, table_offset);
        let sig_ref = builder.import_signature(sig);
        Ok(builder.ins().call_indirect(sig_ref, fn_ptr, args))
    }

    /// Absolute address of a rodata offset, resolved by a load-time
    /// relocation.
    fn rodata_addr(&mut self, builder: &mut FunctionBuilder<'_>, offset: u64) -> ir::Value {
        let name_ref = builder
            .func
            .declare_imported_user_function(UserExternalName::new(NS_RODATA, 0));
        let gv = builder.func.create_global_value(GlobalValueData::Symbol {
            name: ExternalName::User(name_ref),
            offset: Imm64::new(offset as i64),
            colocated: false,
            tls: false,
        });
        builder.ins().symbol_value(self.ptr_ty, gv)
    }

    // ---- Region and op lowering ----

    fn lower_region(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        region: &Region,
        top_level: bool,
    ) -> Result<()> {
        for (i, op) in region.ops.iter().enumerate() {
            if matches!(op, Op::Return { .. }) && (!top_level || i + 1 != region.ops.len()) {
                return Err(Error::Compilation(
                    "func.return is only supported as the final operation".to_string(),
                ));
            }
            self.lower_op(builder, op)?;
        }
        Ok(())
    }

    fn lower_op(&mut self, builder: &mut FunctionBuilder<'_>, op: &Op) -> Result<()> {
        match op {
            Op::ConstInt { result, value, ty } => {
                let clif_ty = match ty {
                    IrType::Index => types::I64,
                    IrType::Scalar(dtype) => clif_type(*dtype)?,
                    other => {
                        return Err(Error::Compilation(format!(
                            "invalid constant type {}",
                            other
                        )))
                    }
                };
                let v = builder.ins().iconst(clif_ty, *value);
                self.values.insert(*result, Lowered::Scalar(v));
            }
            Op::ConstFloat { result, value, ty } => {
                let v = match ty {
                    IrType::Scalar(DType::F32) => builder.ins().f32const(*value as f32),
                    IrType::Scalar(DType::F64) => builder.ins().f64const(*value),
                    other => {
                        return Err(Error::Compilation(format!(
                            "invalid float constant type {}",
                            other
                        )))
                    }
                };
                self.values.insert(*result, Lowered::Scalar(v));
            }
            // Dense constants exist only for the compile-time passes; any
            // surviving use cannot be lowered and is reported at the use
            // site through the missing-value error.
            Op::ConstDense { .. } => {}
            Op::Dim { result, source, index } => {
                let memref = self.memref(*source)?;
                let size = *memref.sizes.get(*index).ok_or_else(|| {
                    Error::Compilation(format!(
                        "dimension index {} out of range for rank {}",
                        index,
                        memref.sizes.len()
                    ))
                })?;
                self.values.insert(*result, Lowered::Scalar(size));
            }
            Op::Load { result, source, indices } => {
                let memref = self.memref(*source)?;
                let addr = self.element_addr(builder, &memref, indices)?;
                let ty = clif_type(memref.dtype)?;
                let v = builder.ins().load(ty, MemFlags::trusted(), addr, 0);
                self.values.insert(*result, Lowered::Scalar(v));
            }
            Op::Store { value, dest, indices } => {
                let memref = self.memref(*dest)?;
                let addr = self.element_addr(builder, &memref, indices)?;
                let v = self.scalar(*value)?;
                builder.ins().store(MemFlags::trusted(), v, addr, 0);
            }
            Op::Alloc { result, dyn_sizes, ty, alignment } => {
                let lowered = self.lower_alloc(builder, dyn_sizes, ty, *alignment)?;
                self.values.insert(*result, Lowered::Memref(lowered));
            }
            Op::Binary { result, op, lhs, rhs, .. } => {
                let a = self.scalar(*lhs)?;
                let b = self.scalar(*rhs)?;
                let v = match op {
                    BinOp::AddI => builder.ins().iadd(a, b),
                    BinOp::SubI => builder.ins().isub(a, b),
                    BinOp::MulI => builder.ins().imul(a, b),
                    BinOp::AddF => builder.ins().fadd(a, b),
                    BinOp::SubF => builder.ins().fsub(a, b),
                    BinOp::MulF => builder.ins().fmul(a, b),
                };
                self.values.insert(*result, Lowered::Scalar(v));
            }
            Op::For { iv, lower, upper, body } => {
                self.lower_for(builder, *iv, *lower, *upper, body)?;
            }
            Op::Transpose { .. } => {
                return Err(Error::Compilation(
                    "rt.transpose must be expanded before code generation".to_string(),
                ))
            }
            Op::CustomCall { results, callee, operands, attrs, .. } => {
                if !results.is_empty() {
                    return Err(Error::Compilation(
                        "custom calls with SSA results are not supported; \
                         return values through memref operands"
                            .to_string(),
                    ));
                }
                self.lower_custom_call(builder, callee, operands, attrs)?;
            }
            Op::ReadyToken { result } => {
                let mut sig = Signature::new(self.call_conv);
                sig.returns.push(AbiParam::new(self.ptr_ty));
                let inst =
                    self.call_helper(builder, helper_offsets::ASYNC_READY_TOKEN, sig, &[])?;
                let handle = builder.inst_results(inst)[0];
                self.values.insert(*result, Lowered::Handle(handle));
            }
            Op::ReadyValue { result, source, .. } => {
                let memref = self.memref(*source)?;
                let descriptor = self.spill_descriptor(builder, &memref);
                let rank = builder.ins().iconst(types::I64, memref.sizes.len() as i64);
                let dtype_code = builder
                    .ins()
                    .iconst(types::I64, TypeCode::of_dtype(memref.dtype).0 as i64);
                let mut sig = Signature::new(self.call_conv);
                sig.params.push(AbiParam::new(self.ptr_ty));
                sig.params.push(AbiParam::new(types::I64));
                sig.params.push(AbiParam::new(types::I64));
                sig.returns.push(AbiParam::new(self.ptr_ty));
                let inst = self.call_helper(
                    builder,
                    helper_offsets::ASYNC_READY_VALUE,
                    sig,
                    &[descriptor, rank, dtype_code],
                )?;
                let handle = builder.inst_results(inst)[0];
                self.values.insert(*result, Lowered::Handle(handle));
            }
            Op::Return { operands } => {
                self.lower_return(builder, operands)?;
            }
        }
        Ok(())
    }

    /// Address of `memref[indices]`:
    /// `data + (offset + Σ index_i * stride_i) * element_size`.
    fn element_addr(
        &self,
        builder: &mut FunctionBuilder<'_>,
        memref: &MemrefVal,
        indices: &[Value],
    ) -> Result<ir::Value> {
        if indices.len() != memref.sizes.len() {
            return Err(Error::Compilation(format!(
                "expected {} indices, got {}",
                memref.sizes.len(),
                indices.len()
            )));
        }
        let mut linear = memref.offset;
        for (index, stride) in indices.iter().zip(&memref.strides) {
            let index = self.scalar(*index)?;
            let scaled = builder.ins().imul(index, *stride);
            linear = builder.ins().iadd(linear, scaled);
        }
        let elem_size = builder
            .ins()
            .iconst(types::I64, memref.dtype.size_in_bytes() as i64);
        let byte_offset = builder.ins().imul(linear, elem_size);
        Ok(builder.ins().iadd(memref.data, byte_offset))
    }

    fn lower_alloc(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        dyn_sizes: &[Value],
        ty: &IrType,
        alignment: Option<u64>,
    ) -> Result<MemrefVal> {
        let (dims, dtype) = match ty {
            IrType::Memref { dims, dtype } => (dims, *dtype),
            other => {
                return Err(Error::Compilation(format!(
                    "memref.alloc result must be a memref, got {}",
                    other
                )))
            }
        };
        let mut dyn_iter = dyn_sizes.iter();
        let mut sizes = Vec::with_capacity(dims.len());
        for dim in dims {
            if *dim == kiln_types::DYNAMIC_DIM {
                let value = dyn_iter.next().ok_or_else(|| {
                    Error::Compilation("memref.alloc missing dynamic size operand".into())
                })?;
                sizes.push(self.scalar(*value)?);
            } else {
                sizes.push(builder.ins().iconst(types::I64, *dim));
            }
        }
        if dyn_iter.next().is_some() {
            return Err(Error::Compilation(
                "memref.alloc has more dynamic sizes than dynamic dims".into(),
            ));
        }

        // Row-major strides, innermost dimension contiguous.
        let mut strides = vec![builder.ins().iconst(types::I64, 1); dims.len()];
        let mut running = builder.ins().iconst(types::I64, 1);
        for d in (0..dims.len()).rev() {
            strides[d] = running;
            running = builder.ins().imul(running, sizes[d]);
        }
        // `running` is now the element count.
        let elem_size = builder
            .ins()
            .iconst(types::I64, dtype.size_in_bytes() as i64);
        let bytes = builder.ins().imul(running, elem_size);
        let align = builder
            .ins()
            .iconst(types::I64, alignment.unwrap_or(16) as i64);

        let mut sig = Signature::new(self.call_conv);
        sig.params.push(AbiParam::new(types::I64));
        sig.params.push(AbiParam::new(types::I64));
        sig.returns.push(AbiParam::new(self.ptr_ty));
        let inst =
            self.call_helper(builder, helper_offsets::ALIGNED_ALLOC, sig, &[bytes, align])?;
        let data = builder.inst_results(inst)[0];
        let offset = builder.ins().iconst(types::I64, 0);
        Ok(MemrefVal {
            base: data,
            data,
            offset,
            sizes,
            strides,
            dtype,
        })
    }

    fn lower_for(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        iv: Value,
        lower: Value,
        upper: Value,
        body: &Region,
    ) -> Result<()> {
        let lower_v = self.scalar(lower)?;
        let upper_v = self.scalar(upper)?;

        let header = builder.create_block();
        let body_block = builder.create_block();
        let exit = builder.create_block();
        let iv_param = builder.append_block_param(header, types::I64);

        builder.ins().jump(header, &[BlockArg::from(lower_v)]);

        builder.switch_to_block(header);
        let cond = builder.ins().icmp(IntCC::SignedLessThan, iv_param, upper_v);
        builder.ins().brif(cond, body_block, &[], exit, &[]);
        builder.seal_block(body_block);

        builder.switch_to_block(body_block);
        self.values.insert(iv, Lowered::Scalar(iv_param));
        self.lower_region(builder, body, false)?;
        let one = builder.ins().iconst(types::I64, 1);
        let next = builder.ins().iadd(iv_param, one);
        builder.ins().jump(header, &[BlockArg::from(next)]);

        // All back-edges are in place.
        builder.seal_block(header);
        builder.seal_block(exit);
        builder.switch_to_block(exit);
        Ok(())
    }

    /// Spill a memref into a stack-allocated strided descriptor and return
    /// its address.
    fn spill_descriptor(
        &self,
        builder: &mut FunctionBuilder<'_>,
        memref: &MemrefVal,
    ) -> ir::Value {
        let rank = memref.sizes.len();
        let size = ((3 + 2 * rank) * 8) as u32;
        let slot = builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            size,
            3,
        ));
        builder.ins().stack_store(memref.base, slot, 0);
        builder.ins().stack_store(memref.data, slot, 8);
        builder.ins().stack_store(memref.offset, slot, 16);
        for (d, s) in memref.sizes.iter().enumerate() {
            builder.ins().stack_store(*s, slot, (24 + 8 * d) as i32);
        }
        for (d, s) in memref.strides.iter().enumerate() {
            builder
                .ins()
                .stack_store(*s, slot, (24 + 8 * (rank + d)) as i32);
        }
        builder.ins().stack_addr(self.ptr_ty, slot, 0)
    }

    /// Encode the attributes of a custom call into rodata; returns the
    /// offset of the `[count][(name, code, value)]` table.
    fn encode_attrs(&mut self, attrs: &kiln_ir::AttrMap) -> Result<u64> {
        let mut entries = Vec::with_capacity(attrs.len());
        for (name, attr) in attrs.iter() {
            let name_off = self.rodata.push_cstr(name);
            let (code, value_off) = match attr {
                Attribute::Int { value, ty } => {
                    let code = match ty {
                        IrType::Index => TypeCode::I64,
                        IrType::Scalar(dtype) => TypeCode::of_dtype(*dtype),
                        other => {
                            return Err(Error::Compilation(format!(
                                "unsupported attribute type {}",
                                other
                            )))
                        }
                    };
                    (code, self.rodata.push_u64(*value as u64))
                }
                Attribute::Float { value, ty } => match ty {
                    IrType::Scalar(DType::F32) => (
                        TypeCode::F32,
                        self.rodata.push_u64(u64::from((*value as f32).to_bits())),
                    ),
                    _ => (TypeCode::F64, self.rodata.push_u64(value.to_bits())),
                },
                Attribute::Str(s) => {
                    self.rodata.align_to(8);
                    let off = self.rodata.push_u64(s.len() as u64);
                    self.rodata.push_bytes(s.as_bytes());
                    (TypeCode::STRING, off)
                }
                other => {
                    return Err(Error::Compilation(format!(
                        "attribute `{}` = {} cannot cross the custom-call boundary",
                        name, other
                    )))
                }
            };
            entries.push((name_off, code, value_off));
        }
        let table = self.rodata.push_u64(entries.len() as u64);
        for (name_off, code, value_off) in entries {
            self.rodata.push_ptr_to(name_off);
            self.rodata.push_u64(code.0);
            self.rodata.push_ptr_to(value_off);
        }
        Ok(table)
    }

    fn lower_custom_call(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        callee: &str,
        operands: &[Value],
        attrs: &kiln_ir::AttrMap,
    ) -> Result<()> {
        let registered = self.call_targets.get(callee).ok_or_else(|| {
            Error::Compilation(format!(
                "callee @{} is not declared with an rt.custom_call attribute",
                callee
            ))
        })?;
        let name_off = match self.callee_names.get(registered) {
            Some(off) => *off,
            None => {
                let off = self.rodata.push_cstr(registered);
                self.callee_names.insert(registered.clone(), off);
                off
            }
        };
        let attrs_off = self.encode_attrs(attrs)?;

        // Pack arguments: [count][(type_code, value_ptr); count].
        let n = operands.len();
        let args_slot = builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            ((1 + 2 * n) * 8) as u32,
            3,
        ));
        let count = builder.ins().iconst(types::I64, n as i64);
        builder.ins().stack_store(count, args_slot, 0);

        for (i, operand) in operands.iter().enumerate() {
            let (code, value_ptr) = match self.func.value_type(*operand) {
                IrType::Custom(name) => {
                    (TypeCode::of_custom(name), self.scalar(*operand)?)
                }
                IrType::Memref { .. } => {
                    let memref = self.memref(*operand)?;
                    let descriptor = self.spill_descriptor(builder, &memref);
                    // EncodedMemref { element_type, rank, descriptor }
                    let encoded = builder.create_sized_stack_slot(StackSlotData::new(
                        StackSlotKind::ExplicitSlot,
                        24,
                        3,
                    ));
                    let elem = builder
                        .ins()
                        .iconst(types::I64, TypeCode::of_dtype(memref.dtype).0 as i64);
                    let rank = builder.ins().iconst(types::I64, memref.sizes.len() as i64);
                    builder.ins().stack_store(elem, encoded, 0);
                    builder.ins().stack_store(rank, encoded, 8);
                    builder.ins().stack_store(descriptor, encoded, 16);
                    (TypeCode::MEMREF, builder.ins().stack_addr(self.ptr_ty, encoded, 0))
                }
                IrType::Index => {
                    let spill = builder.create_sized_stack_slot(StackSlotData::new(
                        StackSlotKind::ExplicitSlot,
                        8,
                        3,
                    ));
                    let v = self.scalar(*operand)?;
                    builder.ins().stack_store(v, spill, 0);
                    (TypeCode::I64, builder.ins().stack_addr(self.ptr_ty, spill, 0))
                }
                IrType::Scalar(dtype) => {
                    let dtype = *dtype;
                    let spill = builder.create_sized_stack_slot(StackSlotData::new(
                        StackSlotKind::ExplicitSlot,
                        8,
                        3,
                    ));
                    let mut v = self.scalar(*operand)?;
                    // Integer scalars are decoded from 8-byte cells.
                    if dtype.is_integer() && clif_type(dtype)? != types::I64 {
                        v = builder.ins().sextend(types::I64, v);
                    }
                    builder.ins().stack_store(v, spill, 0);
                    (
                        TypeCode::of_dtype(dtype),
                        builder.ins().stack_addr(self.ptr_ty, spill, 0),
                    )
                }
                other => {
                    return Err(Error::Compilation(format!(
                        "type {} cannot be passed to a custom call",
                        other
                    )))
                }
            };
            let code_v = builder.ins().iconst(types::I64, code.0 as i64);
            builder
                .ins()
                .stack_store(code_v, args_slot, ((1 + 2 * i) * 8) as i32);
            builder
                .ins()
                .stack_store(value_ptr, args_slot, ((2 + 2 * i) * 8) as i32);
        }

        let ctx = self.require_ctx()?;
        let name_ptr = self.rodata_addr(builder, name_off);
        let args_ptr = builder.ins().stack_addr(self.ptr_ty, args_slot, 0);
        let attrs_ptr = self.rodata_addr(builder, attrs_off);

        let mut sig = Signature::new(self.call_conv);
        sig.params.push(AbiParam::new(self.ptr_ty));
        sig.params.push(AbiParam::new(self.ptr_ty));
        sig.params.push(AbiParam::new(self.ptr_ty));
        sig.params.push(AbiParam::new(self.ptr_ty));
        sig.returns.push(AbiParam::new(types::I8));
        let inst = self.call_helper(
            builder,
            helper_offsets::CUSTOM_CALL,
            sig,
            &[ctx, name_ptr, args_ptr, attrs_ptr],
        )?;
        let ok = builder.inst_results(inst)[0];

        // A failed custom call aborts the whole invocation.
        let fail = *self.fail_block.get_or_insert_with(|| builder.create_block());
        let cont = builder.create_block();
        builder.ins().brif(ok, cont, &[], fail, &[]);
        builder.seal_block(cont);
        builder.switch_to_block(cont);
        Ok(())
    }

    fn lower_return(
        &mut self,
        builder: &mut FunctionBuilder<'_>,
        operands: &[Value],
    ) -> Result<()> {
        if operands.len() != self.func.results.len() {
            return Err(Error::Compilation(format!(
                "func.return has {} operands but the signature declares {} results",
                operands.len(),
                self.func.results.len()
            )));
        }
        for (i, operand) in operands.iter().enumerate() {
            let cell = self.arg_slot(builder, self.num_input_slots + i);
            match self.values.get(operand) {
                Some(Lowered::Memref(memref)) => {
                    let memref = memref.clone();
                    let rank = memref.sizes.len();
                    builder.ins().store(MemFlags::trusted(), memref.base, cell, 0);
                    builder.ins().store(MemFlags::trusted(), memref.data, cell, 8);
                    builder
                        .ins()
                        .store(MemFlags::trusted(), memref.offset, cell, 16);
                    for (d, s) in memref.sizes.iter().enumerate() {
                        builder
                            .ins()
                            .store(MemFlags::trusted(), *s, cell, (24 + 8 * d) as i32);
                    }
                    for (d, s) in memref.strides.iter().enumerate() {
                        builder.ins().store(
                            MemFlags::trusted(),
                            *s,
                            cell,
                            (24 + 8 * (rank + d)) as i32,
                        );
                    }
                }
                Some(Lowered::Handle(handle)) => {
                    builder.ins().store(MemFlags::trusted(), *handle, cell, 0);
                }
                _ => {
                    return Err(Error::Compilation(format!(
                        "result #{} cannot be returned across the ABI",
                        i
                    )))
                }
            }
        }
        builder.ins().return_(&[]);
        Ok(())
    }
}
