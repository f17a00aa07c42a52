//! Error taxonomy for the clamp pass.
//!
//! Every error is fatal: the pass either completes or aborts, and after an
//! abort the module state is undefined and must be discarded by the host.

use thiserror::Error;

/// Errors that can abort the clamp pass.
#[derive(Debug, Error)]
pub enum ClampError {
    /// An IR construct the pass does not handle: variadic functions,
    /// pointer/array returns, fences, va_arg, atomic RMW/CAS instructions,
    /// or a global with an initializer referencing other globals.
    #[error("unsupported construct: {0}")]
    UnsupportedConstruct(String),

    /// Strict mode found a call to an external declaration that is not a
    /// recognized builtin.
    #[error("call to unresolved external function `{0}` in strict mode")]
    UnresolvedExternal(String),

    /// A call to one of the half-precision vector load/store builtins.
    #[error("call to forbidden builtin `{0}`")]
    ForbiddenBuiltin(String),

    /// Dataflow reached a single value with two unequal bounds intervals.
    #[error(
        "assigning pointers from different ranges to the same variable ({0}); \
         a value can respect only one bounds interval"
    )]
    AmbiguousBounds(String),

    /// No bounds interval is known for a pointer that needs one.
    #[error("no bounds known for pointer operand in `{0}`")]
    MissingBounds(String),

    /// A check site saw more than one candidate interval; the check
    /// generator supports exactly one.
    #[error("{count} candidate bounds intervals at a check site; only one is supported")]
    MultiIntervalCheck { count: usize },
}

pub type Result<T> = std::result::Result<T, ClampError>;
