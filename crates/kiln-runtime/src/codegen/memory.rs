//! Executable memory management.
//!
//! Places a [`CompiledModule`] into anonymous mapped memory, patches its
//! relocations, and flips the region to read+execute (W^X). The same path
//! serves fresh JIT compiles and object files reloaded later; only the
//! symbol map differs.

use std::ffi::c_void;

use rustc_hash::FxHashMap;

use crate::abi::SymbolMap;
use crate::codegen::backend::{CompiledModule, RelocKind, RelocTarget};
use crate::error::{Error, Result};

const FUNC_ALIGN: usize = 16;

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// A mapped, patched, executable code region.
pub struct CodeMemory {
    base: *mut u8,
    size: usize,
    /// Function name → offset of its entry within the region.
    symbols: FxHashMap<String, usize>,
}

// Safety: after `map` returns the region is immutable (PROT_READ|PROT_EXEC)
// until it is unmapped on drop.
unsafe impl Send for CodeMemory {}
unsafe impl Sync for CodeMemory {}

impl CodeMemory {
    /// Map a compiled module into executable memory, resolving relocations
    /// against `symbols`.
    pub fn map(module: &CompiledModule, symbols: &SymbolMap) -> Result<CodeMemory> {
        // Layout: functions (16-byte aligned), then rodata.
        let mut offsets = Vec::with_capacity(module.functions.len());
        let mut cursor = 0usize;
        for function in &module.functions {
            cursor = align_up(cursor, FUNC_ALIGN);
            offsets.push(cursor);
            cursor += function.code.len();
        }
        cursor = align_up(cursor, FUNC_ALIGN);
        let rodata_offset = cursor;
        cursor += module.rodata.len();
        let size = cursor.max(1);

        // Safety: anonymous private mapping of a computed size; checked for
        // MAP_FAILED below.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::Compilation("failed to map executable memory".into()));
        }
        let base = base as *mut u8;

        let mut table = FxHashMap::default();
        // Safety: all writes below stay inside the fresh RW mapping.
        unsafe {
            for (function, offset) in module.functions.iter().zip(&offsets) {
                std::ptr::copy_nonoverlapping(
                    function.code.as_ptr(),
                    base.add(*offset),
                    function.code.len(),
                );
                table.insert(function.name.clone(), *offset);
            }
            std::ptr::copy_nonoverlapping(
                module.rodata.as_ptr(),
                base.add(rodata_offset),
                module.rodata.len(),
            );

            let rodata_base = base.add(rodata_offset) as usize;

            // Code relocations.
            for (function, offset) in module.functions.iter().zip(&offsets) {
                for reloc in &function.relocs {
                    let target = match &reloc.target {
                        RelocTarget::Rodata => (rodata_base as i64 + reloc.addend) as u64,
                        RelocTarget::Symbol(name) => match symbols.get(name) {
                            Some(addr) => (addr as i64 + reloc.addend) as u64,
                            None => {
                                libc::munmap(base as *mut c_void, size);
                                return Err(Error::Compilation(format!(
                                    "undefined symbol `{}` while loading code",
                                    name
                                )));
                            }
                        },
                    };
                    let site = base.add(*offset + reloc.offset as usize);
                    match reloc.kind {
                        RelocKind::Abs8 => {
                            std::ptr::copy_nonoverlapping(
                                target.to_le_bytes().as_ptr(),
                                site,
                                8,
                            );
                        }
                    }
                }
            }

            // Rodata-internal pointers (attribute tables → names/payloads).
            for reloc in &module.rodata_relocs {
                let value = (rodata_base as u64 + reloc.to) as u64;
                std::ptr::copy_nonoverlapping(
                    value.to_le_bytes().as_ptr(),
                    base.add(rodata_offset + reloc.at as usize),
                    8,
                );
            }

            // W^X: drop write, add execute.
            if libc::mprotect(
                base as *mut c_void,
                size,
                libc::PROT_READ | libc::PROT_EXEC,
            ) != 0
            {
                libc::munmap(base as *mut c_void, size);
                return Err(Error::Compilation(
                    "failed to make code memory executable".into(),
                ));
            }
        }

        Ok(CodeMemory {
            base,
            size,
            symbols: table,
        })
    }

    /// Entry address of a compiled function.
    pub fn lookup(&self, name: &str) -> Option<*const u8> {
        self.symbols
            .get(name)
            // Safety: offsets were produced by `map` and are in bounds.
            .map(|offset| unsafe { self.base.add(*offset) as *const u8 })
    }

    /// Size of the mapped region.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for CodeMemory {
    fn drop(&mut self) {
        if !self.base.is_null() && self.size > 0 {
            // Safety: base/size come from the mmap in `map`.
            unsafe { libc::munmap(self.base as *mut c_void, self.size) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::backend::{CompiledFunction, Relocation, RodataReloc};

    #[test]
    fn test_map_and_lookup() {
        // A function body of RET instructions; never executed.
        let module = CompiledModule {
            target_triple: "test".into(),
            functions: vec![CompiledFunction {
                name: "f".into(),
                code: vec![0xC3; 32],
                relocs: vec![],
            }],
            rodata: b"hello\0".to_vec(),
            rodata_relocs: vec![],
        };
        let memory = CodeMemory::map(&module, &SymbolMap::new()).unwrap();
        assert!(memory.lookup("f").is_some());
        assert!(memory.lookup("g").is_none());
        assert!(memory.size() >= 38);
    }

    #[test]
    fn test_rodata_reloc_patched() {
        // rodata: [pointer cell][bytes "hi"]; the cell must point at the
        // bytes after placement.
        let mut rodata = vec![0u8; 8];
        rodata.extend_from_slice(b"hi");
        let module = CompiledModule {
            target_triple: "test".into(),
            functions: vec![],
            rodata,
            rodata_relocs: vec![RodataReloc { at: 0, to: 8 }],
        };
        let memory = CodeMemory::map(&module, &SymbolMap::new()).unwrap();
        // The pointer cell is at the start of rodata, which is offset 0 of
        // the mapping since there are no functions.
        let cell = unsafe { *(memory.base as *const u64) };
        assert_eq!(cell as usize, memory.base as usize + 8);
        let bytes = unsafe { std::slice::from_raw_parts(cell as *const u8, 2) };
        assert_eq!(bytes, b"hi");
    }

    #[test]
    fn test_abs8_symbol_reloc() {
        let mut symbols = SymbolMap::new();
        symbols.insert("target", 0xDEAD_B000 as *const u8);
        let module = CompiledModule {
            target_triple: "test".into(),
            functions: vec![CompiledFunction {
                name: "f".into(),
                code: vec![0u8; 16],
                relocs: vec![Relocation {
                    offset: 4,
                    kind: RelocKind::Abs8,
                    target: RelocTarget::Symbol("target".into()),
                    addend: 8,
                }],
            }],
            rodata: vec![],
            rodata_relocs: vec![],
        };
        let memory = CodeMemory::map(&module, &SymbolMap::new());
        assert!(memory.is_err(), "undefined symbol must fail the load");

        let memory = CodeMemory::map(&module, &symbols).unwrap();
        let patched =
            unsafe { std::ptr::read_unaligned(memory.lookup("f").unwrap().add(4) as *const u64) };
        assert_eq!(patched, 0xDEAD_B008);
    }
}
