//! The specialization cache.
//!
//! A [`JitExecutable`] is the client entry point: it owns the IR text, the
//! compilation options, an optional default (unspecialized) executable, and
//! a concurrent cache of executables specialized to operand fingerprints.
//! Cache entries (including compilation errors) are permanent for the
//! lifetime of the `JitExecutable`.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};
use tracing::debug;

use crate::arguments::ArgumentsRef;
use crate::compiler::{
    read_operand_contents, resolve_entrypoint, CompilationOptions, JitCompilationContext,
    Specialization,
};
use crate::error::{Error, Result};
use crate::executable::Executable;

/// A cached compilation outcome: a shared executable or the permanent
/// error produced when compiling it.
pub type CachedExecutable = std::result::Result<Arc<Executable>, Arc<Error>>;

/// An IR module plus everything needed to (re)compile it, with a cache of
/// operand-specialized executables.
pub struct JitExecutable {
    source: String,
    entrypoint: String,
    opts: CompilationOptions,
    /// Which entrypoint inputs carry a value-specialization marker; their
    /// contents participate in the fingerprint.
    value_specialized: Vec<bool>,
    default_executable: CachedExecutable,
    specializations: Mutex<FxHashMap<u64, CachedExecutable>>,
}

impl std::fmt::Debug for JitExecutable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitExecutable")
            .field("entrypoint", &self.entrypoint)
            .finish_non_exhaustive()
    }
}

impl JitExecutable {
    /// Instantiate from IR text. Depending on the specialization policy
    /// this may eagerly compile the default executable.
    pub fn instantiate(
        source: &str,
        entrypoint: &str,
        opts: CompilationOptions,
    ) -> Result<JitExecutable> {
        let ctx = JitCompilationContext::instantiate(opts.clone(), source)?;
        let entry = resolve_entrypoint(ctx.module(), entrypoint)?;
        let requires_specialization = entry.requires_specialization();
        let value_specialized: Vec<bool> = entry
            .params
            .iter()
            .map(|p| p.attrs.str_is("specialize.value", "required"))
            .collect();

        if requires_specialization && opts.specialization == Specialization::Disabled {
            return Err(Error::Compilation(
                "compilation options disabled specialization, but the module requires it"
                    .to_string(),
            ));
        }

        let default_executable = if requires_specialization
            || opts.specialization == Specialization::Always
        {
            Err(Arc::new(Error::Compilation(
                "default executable is not available: the entrypoint requires operand \
                 specialization"
                    .to_string(),
            )))
        } else {
            ctx.compile(entrypoint).map(Arc::new).map_err(Arc::new)
        };

        Ok(JitExecutable {
            source: source.to_string(),
            entrypoint: entrypoint.to_string(),
            opts,
            value_specialized,
            default_executable,
            specializations: Mutex::new(FxHashMap::default()),
        })
    }

    /// The executable compiled without specialization, or the error
    /// explaining why none exists. There is no automatic fallback: callers
    /// choose between this and [`JitExecutable::get_executable`].
    pub fn default_executable(&self) -> CachedExecutable {
        self.default_executable.clone()
    }

    /// Number of specialized entries (executables and errors) in the
    /// cache.
    pub fn num_specializations(&self) -> usize {
        self.specializations.lock().len()
    }

    /// Get an executable specialized to the given operands, compiling at
    /// most once per operand fingerprint.
    ///
    /// Compilation runs outside the cache lock; when two threads race on
    /// the same fingerprint, the loser discards its compile and returns the
    /// installed entry.
    pub fn get_executable(&self, operands: ArgumentsRef<'_>) -> CachedExecutable {
        if self.opts.specialization == Specialization::Disabled {
            return self.default_executable();
        }
        let fingerprint = self.fingerprint(&operands);

        {
            let cache = self.specializations.lock();
            if let Some(entry) = cache.get(&fingerprint) {
                return entry.clone();
            }
        }

        debug!(fingerprint, "compiling specialized executable");
        let compiled: CachedExecutable = (|| {
            let mut ctx = JitCompilationContext::instantiate(self.opts.clone(), &self.source)
                .map_err(Arc::new)?;
            ctx.specialize(operands, &self.entrypoint).map_err(Arc::new)?;
            ctx.compile(&self.entrypoint).map(Arc::new).map_err(Arc::new)
        })();

        let mut cache = self.specializations.lock();
        if let Some(existing) = cache.get(&fingerprint) {
            // Another thread compiled the same specialization first; drop
            // ours and return the installed entry.
            return existing.clone();
        }
        cache.insert(fingerprint, compiled.clone());
        compiled
    }

    /// Hash the operand properties a specialization depends on: per
    /// operand, rank, sizes, and dtype. Data pointers and strides never
    /// participate; the contents of value-specialized operands do.
    fn fingerprint(&self, operands: &ArgumentsRef<'_>) -> u64 {
        let mut hasher = FxHasher::default();
        operands.len().hash(&mut hasher);
        for i in 0..operands.len() {
            match operands.memref(i) {
                Some(memref) => {
                    1u8.hash(&mut hasher);
                    memref.rank().hash(&mut hasher);
                    for size in memref.sizes() {
                        size.hash(&mut hasher);
                    }
                    memref.dtype().hash(&mut hasher);
                    if self.value_specialized.get(i).copied().unwrap_or(false) {
                        if let Ok(values) = read_operand_contents(i, memref) {
                            2u8.hash(&mut hasher);
                            values.hash(&mut hasher);
                        }
                    }
                }
                None => 0u8.hash(&mut hasher),
            }
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arguments::MemrefDesc;
    use kiln_types::DType;
    use std::ffi::c_void;

    // Requires value specialization, so instantiation never compiles and
    // the tests stay independent of the codegen backend.
    const SPECIALIZED_MODULE: &str = r#"
        func @compute(%p: memref<2xi32> { specialize.value = "required" }) {
          func.return
        }
    "#;

    fn jit_executable() -> JitExecutable {
        JitExecutable::instantiate(
            SPECIALIZED_MODULE,
            "compute",
            CompilationOptions::default(),
        )
        .unwrap()
    }

    fn memref(data: *mut c_void, sizes: &[i64], strides: &[i64]) -> MemrefDesc {
        MemrefDesc::new(DType::F32, data, 0, sizes, strides)
    }

    #[test]
    fn test_default_executable_unavailable_when_specialization_required() {
        let jit = jit_executable();
        let err = jit.default_executable().unwrap_err();
        assert!(err.to_string().contains("requires operand specialization"));
    }

    #[test]
    fn test_disabled_policy_rejects_required_specialization() {
        let opts = CompilationOptions {
            specialization: Specialization::Disabled,
            ..CompilationOptions::default()
        };
        let err = JitExecutable::instantiate(SPECIALIZED_MODULE, "compute", opts).unwrap_err();
        assert!(err.to_string().contains("specialization"));
    }

    #[test]
    fn test_fingerprint_ignores_pointers_and_strides() {
        let jit = jit_executable();
        let mut a = [0.0f32; 6];
        let mut b = [0.0f32; 6];
        let args1 = vec![memref(a.as_mut_ptr() as *mut c_void, &[2, 3], &[3, 1])];
        let args2 = vec![memref(b.as_mut_ptr() as *mut c_void, &[2, 3], &[1, 2])];
        assert_eq!(
            jit.fingerprint(&(&args1).into()),
            jit.fingerprint(&(&args2).into())
        );
    }

    #[test]
    fn test_fingerprint_varies_with_shape_and_dtype() {
        let jit = jit_executable();
        let shape_a = vec![memref(std::ptr::null_mut(), &[2, 3], &[3, 1])];
        let shape_b = vec![memref(std::ptr::null_mut(), &[3, 2], &[2, 1])];
        assert_ne!(
            jit.fingerprint(&(&shape_a).into()),
            jit.fingerprint(&(&shape_b).into())
        );

        let int = vec![MemrefDesc::new(
            DType::I32,
            std::ptr::null_mut(),
            0,
            &[2, 3],
            &[3, 1],
        )];
        assert_ne!(
            jit.fingerprint(&(&shape_a).into()),
            jit.fingerprint(&(&int).into())
        );
    }

    #[test]
    fn test_fingerprint_includes_specialized_values() {
        let jit = jit_executable();
        let mut p1 = [1i32, 0];
        let mut p2 = [0i32, 1];
        let args1 = vec![MemrefDesc::new(
            DType::I32,
            p1.as_mut_ptr() as *mut c_void,
            0,
            &[2],
            &[1],
        )];
        let args2 = vec![MemrefDesc::new(
            DType::I32,
            p2.as_mut_ptr() as *mut c_void,
            0,
            &[2],
            &[1],
        )];
        assert_ne!(
            jit.fingerprint(&(&args1).into()),
            jit.fingerprint(&(&args2).into())
        );
    }

    #[test]
    fn test_cached_error_is_permanent() {
        let jit = jit_executable();
        // Null data with a value-specialized operand: specialization fails
        // and the error is cached for this fingerprint.
        let args = vec![MemrefDesc::new(
            DType::I32,
            std::ptr::null_mut(),
            0,
            &[2],
            &[1],
        )];
        let first = jit.get_executable((&args).into()).unwrap_err();
        assert_eq!(jit.num_specializations(), 1);
        let second = jit.get_executable((&args).into()).unwrap_err();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
