//! Pass framework: a `Pass` rewrites a module in place, a `PassManager`
//! chains passes and stops at the first failure.

use thiserror::Error;
use tracing::debug;

use crate::ir::Module;

/// Failure of a single pass, carrying the pass name for diagnostics.
#[derive(Debug, Clone, Error)]
#[error("pass `{pass}` failed: {message}")]
pub struct PassError {
    pub pass: String,
    pub message: String,
}

impl PassError {
    /// Create an error for the named pass.
    pub fn new(pass: impl Into<String>, message: impl Into<String>) -> Self {
        PassError {
            pass: pass.into(),
            message: message.into(),
        }
    }
}

/// A module-level rewrite.
pub trait Pass {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Rewrite the module in place.
    fn run(&self, module: &mut Module) -> Result<(), PassError>;
}

/// An ordered list of passes run in sequence.
#[derive(Default)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl PassManager {
    /// Create an empty pass manager.
    pub fn new() -> Self {
        PassManager::default()
    }

    /// Append a pass.
    pub fn add_pass(&mut self, pass: impl Pass + 'static) {
        self.passes.push(Box::new(pass));
    }

    /// Number of registered passes.
    pub fn len(&self) -> usize {
        self.passes.len()
    }

    /// Whether no passes are registered.
    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Run all passes in order, stopping at the first failure.
    pub fn run(&self, module: &mut Module) -> Result<(), PassError> {
        for pass in &self.passes {
            debug!(pass = pass.name(), "running pass");
            pass.run(module)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingPass {
        fail: bool,
    }

    impl Pass for CountingPass {
        fn name(&self) -> &str {
            "counting"
        }
        fn run(&self, _module: &mut Module) -> Result<(), PassError> {
            if self.fail {
                Err(PassError::new("counting", "boom"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_run_all() {
        let mut pm = PassManager::new();
        pm.add_pass(CountingPass { fail: false });
        pm.add_pass(CountingPass { fail: false });
        assert_eq!(pm.len(), 2);
        pm.run(&mut Module::new()).unwrap();
    }

    #[test]
    fn test_stops_on_failure() {
        let mut pm = PassManager::new();
        pm.add_pass(CountingPass { fail: true });
        let err = pm.run(&mut Module::new()).unwrap_err();
        assert_eq!(err.pass, "counting");
        assert!(err.to_string().contains("boom"));
    }
}
