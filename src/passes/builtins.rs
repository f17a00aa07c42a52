//! Builtin call retargeting.
//!
//! Calls to the unsafe builtins (the pointer-taking math functions, vector
//! bulk loads/stores, work-group async copies, the atomics, and the debug
//! printf) are repointed at safe twins that take fat pointers. A twin is
//! found by name: the demangled builtin name gains the `__safe__`
//! discriminator and keeps the original Itanium parameter suffix. A
//! manually supplied implementation (already folded to fat-pointer form by
//! the signature rewriter) is used when present; otherwise an external
//! declaration with the derived signature is synthesized and expected to be
//! linked in from the safe builtin library.
//!
//! Half-precision vector variants have no safe counterpart and abort.
//! Unrecognized external calls abort in strict mode and warn in permissive
//! mode.

use tracing::{debug, warn};

use crate::context::{ArgLowering, PassContext, Phase};
use crate::error::{ClampError, Result};
use crate::ir::{
    fat_pointer_type, BlockId, Function, FunctionId, Inst, Module, Parameter, Type, Value,
};
use crate::mangle::{self, SAFE_DISCRIMINATOR};
use crate::passes::calls::{caller_context_value, convert_arguments};
use crate::passes::ClampPhase;

/// Builtins taking raw pointers that must be retargeted to safe twins.
const UNSAFE_BUILTINS: &[&str] = &[
    "fract",
    "frexp",
    "lgamma_r",
    "modf",
    "remquo",
    "sincos",
    "vload2",
    "vload3",
    "vload4",
    "vload8",
    "vload16",
    "vstore2",
    "vstore3",
    "vstore4",
    "vstore8",
    "vstore16",
    "async_work_group_copy",
    "async_work_group_strided_copy",
    "wait_group_events",
    "atomic_add",
    "atomic_sub",
    "atomic_xchg",
    "atomic_inc",
    "atomic_dec",
    "atomic_cmpxchg",
    "atomic_min",
    "atomic_max",
    "atomic_and",
    "atomic_or",
    "atomic_xor",
    "printf",
];

/// Builtins with no safe counterpart; any remaining call aborts the pass.
const FORBIDDEN_BUILTINS: &[&str] = &[
    "vload_half",
    "vload_half2",
    "vload_half3",
    "vload_half4",
    "vload_half8",
    "vload_half16",
    "vloada_half2",
    "vloada_half3",
    "vloada_half4",
    "vloada_half8",
    "vloada_half16",
    "vstore_half",
    "vstore_half2",
    "vstore_half3",
    "vstore_half4",
    "vstore_half8",
    "vstore_half16",
    "vstore_half_rte",
    "vstore_half2_rte",
    "vstore_half3_rte",
    "vstore_half4_rte",
    "vstore_half8_rte",
    "vstore_half16_rte",
    "vstore_half_rtz",
    "vstore_half2_rtz",
    "vstore_half3_rtz",
    "vstore_half4_rtz",
    "vstore_half8_rtz",
    "vstore_half16_rtz",
    "vstore_half_rtp",
    "vstore_half2_rtp",
    "vstore_half3_rtp",
    "vstore_half4_rtp",
    "vstore_half8_rtp",
    "vstore_half16_rtp",
    "vstore_half_rtn",
    "vstore_half2_rtn",
    "vstore_half3_rtn",
    "vstore_half4_rtn",
    "vstore_half8_rtn",
    "vstore_half16_rtn",
    "vstorea_half2",
    "vstorea_half3",
    "vstorea_half4",
    "vstorea_half8",
    "vstorea_half16",
    "vstorea_half2_rte",
    "vstorea_half3_rte",
    "vstorea_half4_rte",
    "vstorea_half8_rte",
    "vstorea_half16_rte",
    "vstorea_half2_rtz",
    "vstorea_half3_rtz",
    "vstorea_half4_rtz",
    "vstorea_half8_rtz",
    "vstorea_half16_rtz",
    "vstorea_half2_rtp",
    "vstorea_half3_rtp",
    "vstorea_half4_rtp",
    "vstorea_half8_rtp",
    "vstorea_half16_rtp",
    "vstorea_half2_rtn",
    "vstorea_half3_rtn",
    "vstorea_half4_rtn",
    "vstorea_half8_rtn",
    "vstorea_half16_rtn",
];

/// Pointer-free builtins that stay callable with their original signatures.
const KNOWN_SAFE_BUILTINS: &[&str] = &[
    "get_global_id",
    "get_local_id",
    "get_group_id",
    "get_global_size",
    "get_local_size",
    "get_num_groups",
    "get_global_offset",
    "get_work_dim",
    "barrier",
    "mem_fence",
    "read_mem_fence",
    "write_mem_fence",
];

pub struct BuiltinRetargeter;

impl ClampPhase for BuiltinRetargeter {
    fn name(&self) -> &'static str {
        "retarget-builtins"
    }

    fn starts_from(&self) -> Phase {
        Phase::CallsRewritten
    }

    fn produces(&self) -> Phase {
        Phase::BuiltinsRetargeted
    }

    fn run(&self, module: &mut Module, cx: &mut PassContext) -> Result<()> {
        for fid in module.function_ids().collect::<Vec<_>>() {
            if module.function(fid).is_declaration() || cx.trusted.contains(&fid) {
                continue;
            }
            retarget_calls_in(module, cx, fid)?;
        }
        Ok(())
    }
}

fn retarget_calls_in(module: &mut Module, cx: &mut PassContext, fid: FunctionId) -> Result<()> {
    let caller_ctx = caller_context_value(cx, fid);
    let block_ids: Vec<BlockId> = module.function(fid).blocks.iter().map(|b| b.id).collect();

    for block in block_ids {
        let mut idx = 0;
        loop {
            // Find the next external call; the callee set changes as twins
            // are synthesized, so resolve lazily.
            let callee = {
                let func = module.function(fid);
                if idx >= func.block(block).insts.len() {
                    break;
                }
                match &func.block(block).insts[idx] {
                    Inst::Call { callee, .. } => *callee,
                    _ => {
                        idx += 1;
                        continue;
                    }
                }
            };
            let decl = module.function(callee);
            if !decl.is_declaration() || cx.rewritten.contains_key(&callee) {
                idx += 1;
                continue;
            }
            let name = decl.name.clone();
            let demangled = mangle::demangle(&name)?;

            if FORBIDDEN_BUILTINS.contains(&demangled.as_str()) {
                return Err(ClampError::ForbiddenBuiltin(name));
            }
            if UNSAFE_BUILTINS.contains(&demangled.as_str()) {
                let target = ensure_safe_twin(module, cx, callee, &name, &demangled)?;
                idx = retarget_call(module, cx, fid, block, idx, callee, target, &caller_ctx)?;
                continue;
            }
            if is_recognized_builtin(&name, &demangled) {
                idx += 1;
                continue;
            }
            if !cx.config.permissive {
                return Err(ClampError::UnresolvedExternal(name));
            }
            warn!(callee = %name, "call to external function whose safety cannot be guaranteed");
            idx += 1;
        }
    }
    Ok(())
}

/// External declarations the pass accepts without conversion: overloaded
/// (mangled) builtins without unsafe pointers, already-safe twins from the
/// builtin library, and the unmangled whitelist.
fn is_recognized_builtin(name: &str, demangled: &str) -> bool {
    name.starts_with("_Z")
        || mangle::is_safe_impl_name(name)
        || KNOWN_SAFE_BUILTINS.contains(&demangled)
}

/// Finds or synthesizes the safe twin of an unsafe builtin declaration.
fn ensure_safe_twin(
    module: &mut Module,
    cx: &mut PassContext,
    unsafe_decl: FunctionId,
    name: &str,
    demangled: &str,
) -> Result<FunctionId> {
    if let Some(target) = cx.safe_builtins.get(&unsafe_decl) {
        return Ok(*target);
    }
    let derived = mangle::custom_mangle(name, &format!("{demangled}{SAFE_DISCRIMINATOR}"))?;
    let expected = lifted_signature(module.function(unsafe_decl));

    let target = if let Some(manual) = module.function_by_name(&derived) {
        // A manually supplied implementation went through the signature
        // rewriter already; its twin carries the folded fat-pointer form.
        let twin = cx
            .rewritten
            .get(&manual)
            .map(|info| info.new_id)
            .unwrap_or(manual);
        let actual: Vec<Type> = module
            .function(twin)
            .params
            .iter()
            .map(|p| p.ty.clone())
            .collect();
        if actual != expected {
            return Err(ClampError::UnsupportedConstruct(format!(
                "safe builtin `{derived}` does not match the derived signature"
            )));
        }
        debug!(builtin = name, twin = %module.function(twin).name, "matched manual safe twin");
        twin
    } else {
        let params: Vec<Parameter> = expected
            .iter()
            .enumerate()
            .map(|(i, ty)| {
                if i == 0 {
                    Parameter::new("program_allocations", ty.clone())
                } else {
                    Parameter::new(format!("a{}", i - 1), ty.clone())
                }
            })
            .collect();
        let ret = module.function(unsafe_decl).ret.clone();
        let id = module.add_function(Function::declaration(derived.clone(), params, ret));
        debug!(builtin = name, twin = %derived, "synthesized safe twin declaration");
        id
    };
    cx.safe_builtins.insert(unsafe_decl, target);
    Ok(target)
}

/// The fat-pointerized parameter type list of a builtin, including the
/// leading program-allocations parameter.
fn lifted_signature(decl: &Function) -> Vec<Type> {
    let mut types = vec![Type::I32];
    for param in &decl.params {
        if param.ty.is_pointer() {
            types.push(fat_pointer_type(&param.ty));
        } else {
            types.push(param.ty.clone());
        }
    }
    types
}

/// Rewrites one builtin call to the safe twin; returns the instruction
/// index just past the rewritten call.
#[allow(clippy::too_many_arguments)]
fn retarget_call(
    module: &mut Module,
    cx: &mut PassContext,
    fid: FunctionId,
    block: BlockId,
    idx: usize,
    unsafe_decl: FunctionId,
    target: FunctionId,
    caller_ctx: &Value,
) -> Result<usize> {
    // Builtin declarations carry one raw pointer per fat parameter, so the
    // lowering is positional.
    let lowerings: Vec<ArgLowering> = module
        .function(unsafe_decl)
        .params
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let new_index = i as u32 + 1;
            if p.ty.is_pointer() {
                ArgLowering::Fat { new_index }
            } else {
                ArgLowering::Same { new_index }
            }
        })
        .collect();
    let callee_name = module.function(unsafe_decl).name.clone();

    let mut func = std::mem::replace(
        module.function_mut(fid),
        Function::new("", vec![], Type::Void),
    );
    let result = (|| -> Result<usize> {
        let (old_args, old_attrs) = {
            let Inst::Call { args, arg_attrs, .. } = &func.block(block).insts[idx] else {
                return Ok(idx + 1);
            };
            (args.clone(), arg_attrs.clone())
        };
        let converted = convert_arguments(
            &mut func,
            module,
            cx,
            fid,
            &callee_name,
            &old_args,
            &old_attrs,
            &lowerings,
            Some(caller_ctx.clone()),
        )?;

        let entry = func.entry;
        let mut idx = idx;
        let entry_count = converted.entry_insts.len();
        func.block_mut(entry)
            .insts
            .splice(0..0, converted.entry_insts);
        if block == entry {
            idx += entry_count;
        }
        let prelude_count = converted.prelude.len();
        func.block_mut(block)
            .insts
            .splice(idx..idx, converted.prelude);
        idx += prelude_count;

        if let Inst::Call {
            callee,
            args,
            arg_attrs,
            ..
        } = &mut func.block_mut(block).insts[idx]
        {
            *callee = target;
            *args = converted.args;
            *arg_attrs = converted.arg_attrs;
        }
        Ok(idx + 1)
    })();
    *module.function_mut(fid) = func;
    result
}
