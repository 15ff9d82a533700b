//! Execution engines.
//!
//! An [`ExecutionEngine`] owns executable code and resolves entrypoints by
//! name. The one implementation, [`JitEngine`], serves both fresh compiles
//! and object-file reloads; the only difference between the two paths is
//! where the [`crate::codegen::backend::CompiledModule`] came from and
//! which symbol map resolved it.

use crate::abi::SymbolMap;
use crate::codegen::backend::CompiledModule;
use crate::codegen::memory::CodeMemory;
use crate::error::Result;
use crate::obj_file::ObjectFile;

/// Owner of executable code; looked up by symbol name.
pub trait ExecutionEngine: Send + Sync {
    /// Address of a compiled function.
    fn lookup(&self, name: &str) -> Option<*const u8>;

    /// The serialized form of this engine's code, if it was preserved.
    fn obj_file(&self) -> Option<&ObjectFile> {
        None
    }
}

/// Engine backed by a mapped [`CodeMemory`] region.
pub struct JitEngine {
    memory: CodeMemory,
    obj: Option<ObjectFile>,
}

impl JitEngine {
    /// Place a compiled module into executable memory.
    ///
    /// `symbols` must contain every host symbol the module references.
    /// When `keep_obj` is set the serialized module is retained for AOT
    /// replay.
    pub(crate) fn new(
        module: CompiledModule,
        symbols: &SymbolMap,
        keep_obj: Option<ObjectFile>,
    ) -> Result<JitEngine> {
        let memory = CodeMemory::map(&module, symbols)?;
        Ok(JitEngine {
            memory,
            obj: keep_obj,
        })
    }
}

impl ExecutionEngine for JitEngine {
    fn lookup(&self, name: &str) -> Option<*const u8> {
        self.memory.lookup(name)
    }

    fn obj_file(&self) -> Option<&ObjectFile> {
        self.obj.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::backend::CompiledFunction;

    #[test]
    fn test_lookup_and_obj_file() {
        let module = CompiledModule {
            target_triple: "test".into(),
            functions: vec![CompiledFunction {
                name: "compute".into(),
                code: vec![0xC3; 16],
                relocs: vec![],
            }],
            rodata: vec![],
            rodata_relocs: vec![],
        };
        let obj = ObjectFile::encode(&module, "compute");
        let engine = JitEngine::new(module, &SymbolMap::new(), Some(obj)).unwrap();
        assert!(engine.lookup("compute").is_some());
        assert!(engine.lookup("other").is_none());
        assert!(engine.obj_file().is_some());
    }
}
