//! Backend-independent compiled-code types and the cranelift backend.
//!
//! Compilation produces position-independent artifacts: raw machine code
//! per function plus symbolic relocations against host symbols and the
//! module's rodata blob. Placement and patching happen later in
//! [`crate::codegen::memory::CodeMemory`], for fresh JIT compiles and
//! object-file reloads alike.

use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::entity::EntityRef;
use cranelift_codegen::ir::{ExternalName, UserExternalName};
use cranelift_codegen::isa::{OwnedTargetIsa, TargetIsa};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::{binemit, Context, FinalizedMachReloc, FinalizedRelocTarget};
use cranelift_frontend::FunctionBuilderContext;

use crate::error::{Error, Result};

/// External-name namespace for the module rodata blob (the relocation
/// addend carries the offset).
pub(crate) const NS_RODATA: u32 = 1;

/// JIT backend optimization level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    /// No optimization; fastest compilation.
    None,
    /// Optimize for execution speed.
    #[default]
    Speed,
    /// Optimize for speed and code size.
    SpeedAndSize,
}

impl OptLevel {
    fn flag(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

/// Relocation kinds the loader knows how to patch.
///
/// Host calls are indirect through the kernel context's helper table, so
/// compiled code never carries call relocations; the only references left
/// are absolute addresses of rodata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// Absolute 8-byte address.
    Abs8,
}

/// What a relocation resolves against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocTarget {
    /// A named host symbol from the runtime symbol map.
    Symbol(String),
    /// The module rodata blob; the addend is the byte offset.
    Rodata,
}

/// One patch site in a function's code.
#[derive(Debug, Clone)]
pub struct Relocation {
    /// Byte offset of the patch site within the function's code.
    pub offset: u64,
    pub kind: RelocKind,
    pub target: RelocTarget,
    pub addend: i64,
}

/// A compiled function: raw code plus its relocations.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    pub name: String,
    pub code: Vec<u8>,
    pub relocs: Vec<Relocation>,
}

/// A pointer stored inside rodata pointing back into rodata (attribute
/// tables referencing their name strings and payloads).
#[derive(Debug, Clone, Copy)]
pub struct RodataReloc {
    /// Offset of the pointer cell.
    pub at: u64,
    /// Rodata offset the cell must point at after placement.
    pub to: u64,
}

/// The complete position-independent output of one module compilation.
#[derive(Debug, Clone, Default)]
pub struct CompiledModule {
    pub target_triple: String,
    pub functions: Vec<CompiledFunction>,
    pub rodata: Vec<u8>,
    pub rodata_relocs: Vec<RodataReloc>,
}

// ---------------------------------------------------------------------------
// Rodata builder
// ---------------------------------------------------------------------------

/// Accumulates the module's read-only data: callee name strings, attribute
/// payloads, and attribute tables.
#[derive(Debug, Default)]
pub(crate) struct RodataBuilder {
    data: Vec<u8>,
    relocs: Vec<RodataReloc>,
}

impl RodataBuilder {
    pub(crate) fn new() -> Self {
        RodataBuilder::default()
    }

    pub(crate) fn align_to(&mut self, align: usize) {
        while self.data.len() % align != 0 {
            self.data.push(0);
        }
    }

    /// Append raw bytes; returns their offset.
    pub(crate) fn push_bytes(&mut self, bytes: &[u8]) -> u64 {
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(bytes);
        offset
    }

    /// Append a NUL-terminated string; returns its offset.
    pub(crate) fn push_cstr(&mut self, s: &str) -> u64 {
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        offset
    }

    /// Append a u64 cell; returns its offset.
    pub(crate) fn push_u64(&mut self, value: u64) -> u64 {
        self.align_to(8);
        self.push_bytes(&value.to_le_bytes())
    }

    /// Append a pointer cell that will point at rodata offset `to` once the
    /// blob is placed.
    pub(crate) fn push_ptr_to(&mut self, to: u64) -> u64 {
        self.align_to(8);
        let at = self.push_bytes(&0u64.to_le_bytes());
        self.relocs.push(RodataReloc { at, to });
        at
    }

    pub(crate) fn finish(self) -> (Vec<u8>, Vec<RodataReloc>) {
        (self.data, self.relocs)
    }
}

// ---------------------------------------------------------------------------
// Cranelift backend
// ---------------------------------------------------------------------------

/// Cranelift-based code generator targeting the host.
pub struct CraneliftBackend {
    isa: OwnedTargetIsa,
}

impl CraneliftBackend {
    /// Detect the host target and build an ISA at the given optimization
    /// level.
    pub fn host(opt_level: OptLevel) -> Result<Self> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", opt_level.flag())
            .map_err(|e| Error::Compilation(format!("failed to set opt_level: {}", e)))?;
        // Code is patched with absolute host addresses; PIC is unnecessary.
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| Error::Compilation(format!("failed to set is_pic: {}", e)))?;
        let flags = settings::Flags::new(flag_builder);

        let isa = cranelift_native::builder()
            .map_err(|e| Error::Compilation(format!("failed to create native ISA: {}", e)))?
            .finish(flags)
            .map_err(|e| Error::Compilation(format!("failed to finish ISA: {}", e)))?;
        Ok(CraneliftBackend { isa })
    }

    /// The target ISA.
    pub fn isa(&self) -> &dyn TargetIsa {
        self.isa.as_ref()
    }

    /// Target triple string for object-file compatibility checks.
    pub fn triple(&self) -> String {
        self.isa.triple().to_string()
    }

    /// Compile one lowered cranelift function and extract its code and
    /// symbolic relocations.
    pub(crate) fn compile_function(
        &self,
        mut ctx: Context,
        name: &str,
    ) -> Result<CompiledFunction> {
        // Snapshot the declared external names; index order matches the
        // UserExternalNameRef indices the relocations carry.
        let name_table: Vec<UserExternalName> =
            ctx.func.params.user_named_funcs().values().cloned().collect();

        let mut ctrl_plane = ControlPlane::default();
        if let Err(err) = ctx.compile(self.isa.as_ref(), &mut ctrl_plane) {
            return Err(Error::Compilation(format!(
                "code generation for `{}` failed: {:?}",
                name, err.inner
            )));
        }
        let compiled = ctx
            .compiled_code()
            .expect("compile succeeded but no compiled code");

        let code = compiled.code_buffer().to_vec();
        let mut relocs = Vec::new();
        for reloc in compiled.buffer.relocs() {
            relocs.push(convert_reloc(reloc, &name_table)?);
        }
        Ok(CompiledFunction {
            name: name.to_string(),
            code,
            relocs,
        })
    }

    /// Fresh cranelift contexts for lowering.
    pub(crate) fn new_context(&self) -> (Context, FunctionBuilderContext) {
        (Context::new(), FunctionBuilderContext::new())
    }
}

fn convert_reloc(
    reloc: &FinalizedMachReloc,
    name_table: &[UserExternalName],
) -> Result<Relocation> {
    let kind = match reloc.kind {
        binemit::Reloc::Abs8 => RelocKind::Abs8,
        other => {
            return Err(Error::Compilation(format!(
                "unsupported relocation kind {:?}",
                other
            )))
        }
    };
    let name = match &reloc.target {
        FinalizedRelocTarget::ExternalName(ExternalName::User(name_ref)) => name_table
            .get(name_ref.index())
            .ok_or_else(|| Error::Compilation("dangling external name".to_string()))?,
        other => {
            return Err(Error::Compilation(format!(
                "unsupported relocation target {:?}",
                other
            )))
        }
    };
    let target = match name.namespace {
        NS_RODATA => RelocTarget::Rodata,
        other => {
            return Err(Error::Compilation(format!(
                "unknown external-name namespace {}",
                other
            )))
        }
    };
    Ok(Relocation {
        offset: u64::from(reloc.offset),
        kind,
        target,
        addend: reloc.addend,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rodata_builder_layout() {
        let mut rodata = RodataBuilder::new();
        let name = rodata.push_cstr("axis");
        assert_eq!(name, 0);
        let value = rodata.push_u64(2);
        assert_eq!(value % 8, 0);
        let ptr = rodata.push_ptr_to(name);
        let (data, relocs) = rodata.finish();
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].at, ptr);
        assert_eq!(relocs[0].to, name);
        assert_eq!(&data[..4], b"axis");
    }

    #[test]
    fn test_host_backend_builds() {
        let backend = CraneliftBackend::host(OptLevel::Speed).unwrap();
        assert!(!backend.triple().is_empty());
    }
}
