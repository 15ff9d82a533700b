//! Runtime error type.
//!
//! One public error enum covers the whole crate; compilation-adjacent
//! variants carry the diagnostics captured during the owning compilation
//! context's lifetime. Errors are surfaced, never recovered; the
//! specialization cache stores them permanently behind an `Arc`.

use thiserror::Error;

/// Errors produced by the Kiln runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// The IR text did not parse; includes captured diagnostics.
    #[error("failed to parse IR module: {0}")]
    Parse(String),

    /// A signature type has no runtime representation.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// Operand count, rank, dtype, or dynamic-dim constraint violated.
    #[error("{0}")]
    Signature(String),

    /// Operand specialization failed.
    #[error("failed to specialize: {0}")]
    Specialization(String),

    /// A pass or codegen failure in the lowering pipeline.
    #[error("compilation failed: {0}")]
    Compilation(String),

    /// The compiled code signaled failure.
    #[error("execution failed: {0}")]
    Execution(String),

    /// No converter handled a returned value.
    #[error("failed to convert result #{index}: {message}")]
    ResultConversion {
        /// Result position in signature order.
        index: usize,
        /// Human-readable reason.
        message: String,
    },

    /// The callee name is not present in the custom-call registry.
    #[error("unknown custom call: {0}")]
    UnknownCustomCall(String),

    /// A custom-call argument did not decode as the declared type.
    #[error("custom call argument mismatch: {0}")]
    CustomCallArgMismatch(String),

    /// A custom-call attribute was missing or of the wrong type.
    #[error("custom call attribute mismatch: {0}")]
    CustomCallAttrMismatch(String),
}

impl Error {
    /// Signature error for an operand count mismatch.
    pub(crate) fn arity(expected: usize, actual: usize) -> Error {
        Error::Signature(format!(
            "number of operands must match the number of inputs: {} vs {}",
            actual, expected
        ))
    }
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
