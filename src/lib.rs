//! Memory-access clamping for GPU compute kernels.
//!
//! This crate implements a whole-module transformation over a typed SSA IR
//! that confines every pointer dereference of an untrusted kernel to an
//! allocation the kernel is permitted to touch:
//!
//! - static allocations are consolidated into one aggregate per address
//!   space, so each space has closed, statically known bounds;
//! - every function signature carrying pointers is rewritten to pass
//!   `{current, low, high}` fat pointers, and bodies, calls, and builtin
//!   calls are rewired to match;
//! - each kernel gets an exported wrapper taking `(pointer, element count)`
//!   pairs from the host and materializing fat pointers plus per-invocation
//!   bounds;
//! - a dataflow analysis binds pointer values to bounds intervals, and every
//!   load or store that cannot be proven safe is guarded by a
//!   compare-and-branch clamp (out-of-bounds loads produce zero,
//!   out-of-bounds stores are skipped).
//!
//! Parsing and serializing the IR, and the command-line driver, live
//! elsewhere; this crate exposes the in-memory [`ir`] model and the
//! [`clamp_module`] entry point. The pass is single-threaded, runs each
//! phase exactly once, and either succeeds or aborts with a [`ClampError`],
//! in which case the module state is undefined.

pub mod cfg;
pub mod context;
pub mod error;
pub mod ir;
pub mod mangle;
pub mod passes;
pub mod target;

pub use context::ClampConfig;
pub use error::{ClampError, Result};

use ir::Module;

/// Runs the clamp pipeline over `module` in place.
pub fn clamp_module(module: &mut Module, config: &ClampConfig) -> Result<()> {
    passes::run_pipeline(module, config.clone())
}
