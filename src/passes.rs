//! The clamp pipeline.
//!
//! One linear run over the module; each phase reads the state its
//! predecessors left in the `PassContext` and no phase runs twice:
//!
//! consolidate → rewrite signatures → move bodies → wrap kernels →
//! analyze bounds → prove safety → inject checks → rewrite calls →
//! retarget builtins → cleanup
//!
//! The module is mutated in place. On error the module state is undefined
//! and the caller must discard it.

use std::collections::HashSet;

use tracing::debug;

use crate::context::{ClampConfig, PassContext, Phase};
use crate::error::Result;
use crate::ir::{FunctionId, Inst, Module};

mod body_move;
mod bounds;
mod builtins;
mod calls;
mod checks;
mod consolidate;
mod kernel_wrap;
mod safety;
mod signatures;

pub use body_move::BodyMover;
pub use bounds::BoundsAnalyzer;
pub use builtins::BuiltinRetargeter;
pub use calls::CallSiteRewriter;
pub use checks::CheckInjector;
pub use consolidate::StaticMemoryConsolidator;
pub use kernel_wrap::KernelWrapperBuilder;
pub use safety::SafetyProver;
pub use signatures::SignatureRewriter;

/// One phase of the clamp pipeline.
pub trait ClampPhase {
    /// Name of the phase for logging.
    fn name(&self) -> &'static str;

    /// The phase the module must be in when this component starts.
    fn starts_from(&self) -> Phase;

    /// The phase the module is in once this component finishes.
    fn produces(&self) -> Phase;

    /// Run the phase. Aborting leaves the module undefined.
    fn run(&self, module: &mut Module, cx: &mut PassContext) -> Result<()>;
}

/// Runs the whole pipeline over `module`.
pub fn run_pipeline(module: &mut Module, config: ClampConfig) -> Result<()> {
    let mut cx = PassContext::new(config);
    let phases: Vec<Box<dyn ClampPhase>> = vec![
        Box::new(StaticMemoryConsolidator),
        Box::new(SignatureRewriter),
        Box::new(BodyMover),
        Box::new(KernelWrapperBuilder),
        Box::new(BoundsAnalyzer),
        Box::new(SafetyProver),
        Box::new(CheckInjector),
        Box::new(CallSiteRewriter),
        Box::new(BuiltinRetargeter),
    ];
    for phase in &phases {
        debug_assert_eq!(
            cx.phase,
            phase.starts_from(),
            "phase `{}` ran out of order",
            phase.name()
        );
        debug!(phase = phase.name(), "running");
        phase.run(module, &mut cx)?;
        cx.phase = phase.produces();
    }
    purge_replaced(module, &cx);
    cx.phase = Phase::Done;
    Ok(())
}

/// Drops the emptied originals and any builtin declarations nothing calls
/// anymore. Only unreferenced functions are touched.
fn purge_replaced(module: &mut Module, cx: &PassContext) {
    let mut referenced: HashSet<FunctionId> = module.kernels.iter().copied().collect();
    for func in &module.functions {
        for block in &func.blocks {
            for inst in block.insts.iter().chain(Some(&block.terminator)) {
                if let Inst::Call { callee, .. } = inst {
                    referenced.insert(*callee);
                }
            }
        }
    }

    let mut dead: HashSet<FunctionId> = HashSet::new();
    for old in cx.rewritten.keys() {
        if !referenced.contains(old) {
            dead.insert(*old);
        }
    }
    for unsafe_decl in cx.safe_builtins.keys() {
        if !referenced.contains(unsafe_decl) {
            dead.insert(*unsafe_decl);
        }
    }
    if !dead.is_empty() {
        debug!(count = dead.len(), "purging replaced functions");
        module.purge_functions(&dead);
    }
}
