//! Call-site rewriting for the fat-pointer calling convention.
//!
//! Every call to a rewritten function is repointed at the twin: the
//! program-allocations argument is threaded through (a caller with the
//! parameter forwards its own, everything else passes zero), and each
//! pointer operand becomes a fat pointer. A pointer that is itself the
//! extracted working field of a fat pointer forwards the whole aggregate;
//! anything else is materialized from its proven bounds through an
//! entry-block stack slot. Indirect bounds are loaded at the call site, and
//! the by-value attribute is stripped from converted operands.
//!
//! In strict mode a pointer operand without known bounds aborts; permissive
//! mode warns and passes null bounds.

use tracing::{debug, warn};

use crate::context::{ArgLowering, PassContext, Phase};
use crate::error::{ClampError, Result};
use crate::ir::{
    fat_pointer_type, AddressSpace, BlockId, Constant, Function, FunctionId, Inst, Module,
    ParamAttrs, Type, Value, ValueId, FAT_CURRENT,
};
use crate::passes::ClampPhase;
use crate::target::MemoryRegion;

pub struct CallSiteRewriter;

impl ClampPhase for CallSiteRewriter {
    fn name(&self) -> &'static str {
        "rewrite-calls"
    }

    fn starts_from(&self) -> Phase {
        Phase::ChecksInjected
    }

    fn produces(&self) -> Phase {
        Phase::CallsRewritten
    }

    fn run(&self, module: &mut Module, cx: &mut PassContext) -> Result<()> {
        for fid in module.function_ids().collect::<Vec<_>>() {
            if module.function(fid).is_declaration() || cx.trusted.contains(&fid) {
                continue;
            }
            let caller_ctx = caller_context_value(cx, fid);
            let mut func = std::mem::replace(
                module.function_mut(fid),
                Function::new("", vec![], Type::Void),
            );
            let result = rewrite_function_calls(&mut func, module, cx, fid, &caller_ctx);
            *module.function_mut(fid) = func;
            result?;
        }
        Ok(())
    }
}

/// The program-allocations value this caller can thread into callees: its
/// own leading parameter when it has one, zero otherwise.
pub(super) fn caller_context_value(cx: &PassContext, fid: FunctionId) -> Value {
    let has_ctx_param = cx
        .twin_of
        .get(&fid)
        .and_then(|old| cx.rewritten.get(old))
        .map(|info| info.has_ctx_param())
        .unwrap_or(false);
    if has_ctx_param {
        Value::Arg(0)
    } else {
        Value::Const(Constant::i32(0))
    }
}

fn rewrite_function_calls(
    func: &mut Function,
    module: &Module,
    cx: &PassContext,
    fid: FunctionId,
    caller_ctx: &Value,
) -> Result<()> {
    let block_ids: Vec<BlockId> = func.blocks.iter().map(|b| b.id).collect();
    for block in block_ids {
        let mut idx = 0;
        while idx < func.block(block).insts.len() {
            let Inst::Call { callee, args, arg_attrs, .. } = &func.block(block).insts[idx] else {
                idx += 1;
                continue;
            };
            let Some(info) = cx.rewritten.get(callee).cloned() else {
                idx += 1;
                continue;
            };
            let callee_name = module.function(*callee).name.clone();
            let (old_args, old_attrs) = (args.clone(), arg_attrs.clone());
            debug!(caller = %func.name, callee = %callee_name, "rewriting call");

            let ctx_arg = info.has_ctx_param().then(|| caller_ctx.clone());
            let converted = convert_arguments(
                func,
                module,
                cx,
                fid,
                &callee_name,
                &old_args,
                &old_attrs,
                &info.args,
                ctx_arg,
            )?;

            let entry = func.entry;
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

            let Inst::Call { callee, args, arg_attrs, .. } = &mut func.block_mut(block).insts[idx]
            else {
                continue;
            };
            *callee = info.new_id;
            *args = converted.args;
            *arg_attrs = converted.arg_attrs;
            idx += 1;
        }
    }
    Ok(())
}

/// A materialized fat pointer: the entry-block slot plus the stores and the
/// reload that produce it as a value.
pub(super) struct FatPointerBuild {
    pub alloca: Inst,
    pub insts: Vec<Inst>,
    pub result: ValueId,
}

/// Builds `{current, low, high}` through a stack aggregate and reloads it,
/// the shape every fat pointer takes when crossing a call boundary.
pub(super) fn build_fat_pointer(
    func: &mut Function,
    ptr_ty: &Type,
    slot_space: AddressSpace,
    current: Value,
    low: Value,
    high: Value,
) -> FatPointerBuild {
    let fat_ty = fat_pointer_type(ptr_ty);
    let slot = func.new_value(fat_ty.clone().ptr_to(slot_space));
    let alloca = Inst::Alloca {
        dst: slot,
        allocated: fat_ty.clone(),
        space: slot_space,
    };
    let field_ptr_ty = ptr_ty.clone().ptr_to(slot_space);
    let mut insts = Vec::with_capacity(7);
    for (field, value) in [(0i64, current), (1, low), (2, high)] {
        let field_ptr = func.new_value(field_ptr_ty.clone());
        insts.push(Inst::Gep {
            dst: field_ptr,
            base: Value::Inst(slot),
            indices: vec![
                Value::Const(Constant::i32(0)),
                Value::Const(Constant::i32(field)),
            ],
            inbounds: true,
        });
        insts.push(Inst::Store {
            ptr: Value::Inst(field_ptr),
            value,
            ty: ptr_ty.clone(),
        });
    }
    let result = func.new_value(fat_ty.clone());
    insts.push(Inst::Load {
        dst: result,
        ptr: Value::Inst(slot),
        ty: fat_ty,
    });
    FatPointerBuild {
        alloca,
        insts,
        result,
    }
}

/// The converted argument vector of one call, plus the instructions that
/// have to surround it.
pub(super) struct ConvertedCall {
    pub args: Vec<Value>,
    pub arg_attrs: Vec<ParamAttrs>,
    /// Stack slots to splice at the caller's entry.
    pub entry_insts: Vec<Inst>,
    /// Instructions to insert immediately before the call.
    pub prelude: Vec<Inst>,
}

/// Converts one call's arguments to the rewritten parameter shape.
#[allow(clippy::too_many_arguments)]
pub(super) fn convert_arguments(
    func: &mut Function,
    module: &Module,
    cx: &PassContext,
    caller: FunctionId,
    callee_name: &str,
    old_args: &[Value],
    old_attrs: &[ParamAttrs],
    lowerings: &[ArgLowering],
    ctx_arg: Option<Value>,
) -> Result<ConvertedCall> {
    let private_space = cx.config.address_spaces.space(MemoryRegion::Private);
    let defs = func.def_sites();

    let mut args = Vec::with_capacity(lowerings.len() + 1);
    let mut arg_attrs = Vec::with_capacity(lowerings.len() + 1);
    let mut entry_insts = Vec::new();
    let mut prelude = Vec::new();
    if let Some(ctx) = ctx_arg {
        args.push(ctx);
        arg_attrs.push(ParamAttrs::default());
    }

    let mut i = 0;
    while i < lowerings.len() {
        let operand = old_args.get(i).cloned().ok_or_else(|| {
            ClampError::UnsupportedConstruct(format!(
                "call to `{callee_name}` has too few arguments"
            ))
        })?;
        match lowerings[i] {
            ArgLowering::Same { .. } => {
                args.push(operand);
                arg_attrs.push(old_attrs.get(i).copied().unwrap_or_default());
                i += 1;
            }
            ArgLowering::Fat { .. } => {
                let ptr_ty = func.value_ty(module, &operand);
                // A pointer that is itself the working field of a fat
                // pointer forwards the whole aggregate.
                if let Some(agg) = forwarded_aggregate(func, module, &defs, &operand, &ptr_ty) {
                    args.push(agg);
                } else {
                    let (low, high) =
                        operand_limits(func, module, cx, caller, callee_name, &operand, &ptr_ty, &mut prelude)?;
                    let build = build_fat_pointer(
                        func,
                        &ptr_ty,
                        private_space,
                        operand,
                        low,
                        high,
                    );
                    entry_insts.push(build.alloca);
                    prelude.extend(build.insts);
                    args.push(Value::Inst(build.result));
                }
                arg_attrs.push(ParamAttrs::default()); // by-value drops with the conversion
                i += 1;
            }
            ArgLowering::FatField { field: 0, .. } => {
                // A manual safe-builtin triple: the three operands are the
                // fat pointer's fields already.
                let current = operand;
                let low = old_args.get(i + 1).cloned();
                let high = old_args.get(i + 2).cloned();
                let (Some(low), Some(high)) = (low, high) else {
                    return Err(ClampError::UnsupportedConstruct(format!(
                        "call to `{callee_name}` truncates a safe-pointer triple"
                    )));
                };
                let ptr_ty = func.value_ty(module, &current);
                let build =
                    build_fat_pointer(func, &ptr_ty, private_space, current, low, high);
                entry_insts.push(build.alloca);
                prelude.extend(build.insts);
                args.push(Value::Inst(build.result));
                arg_attrs.push(ParamAttrs::default());
                i += 3;
            }
            ArgLowering::FatField { .. } => {
                return Err(ClampError::UnsupportedConstruct(format!(
                    "misaligned safe-pointer triple in call to `{callee_name}`"
                )));
            }
        }
    }

    Ok(ConvertedCall {
        args,
        arg_attrs,
        entry_insts,
        prelude,
    })
}

/// If `operand` extracts the working field out of a fat-pointer aggregate,
/// returns that aggregate.
fn forwarded_aggregate(
    func: &Function,
    module: &Module,
    defs: &std::collections::HashMap<ValueId, (BlockId, usize)>,
    operand: &Value,
    ptr_ty: &Type,
) -> Option<Value> {
    let Value::Inst(id) = operand else {
        return None;
    };
    let (block, idx) = *defs.get(id)?;
    let Inst::ExtractValue { agg, indices, .. } = &func.block(block).insts[idx] else {
        return None;
    };
    if *indices != [FAT_CURRENT] {
        return None;
    }
    (func.value_ty(module, agg) == fat_pointer_type(ptr_ty)).then(|| agg.clone())
}

/// The low/high values to seed a materialized fat pointer with, loading
/// indirect bounds at the call site.
#[allow(clippy::too_many_arguments)]
fn operand_limits(
    func: &mut Function,
    module: &Module,
    cx: &PassContext,
    caller: FunctionId,
    callee_name: &str,
    operand: &Value,
    ptr_ty: &Type,
    prelude: &mut Vec<Inst>,
) -> Result<(Value, Value)> {
    let interval = match operand {
        Value::Inst(id) => cx.value_bounds.get(&(caller, *id)).cloned(),
        Value::Const(c) => cx.constant_interval(c),
        Value::Arg(_) => None,
    }
    .or_else(|| {
        let space = ptr_ty.address_space()?;
        let candidates = cx.interval_candidates(caller, space.0);
        (candidates.len() == 1).then(|| candidates.into_iter().next())?
    });

    let Some(interval) = interval else {
        if !cx.config.permissive {
            return Err(ClampError::MissingBounds(format!(
                "argument of call to `{callee_name}` in `{}`",
                func.name
            )));
        }
        warn!(
            callee = callee_name,
            caller = %func.name,
            "no bounds for call argument; passing null limits"
        );
        return Ok((
            Value::Const(Constant::Null(ptr_ty.clone())),
            Value::Const(Constant::Null(ptr_ty.clone())),
        ));
    };

    let mut low = interval.low;
    let mut high = interval.high;
    if interval.indirect {
        for limit in [&mut low, &mut high] {
            let slot_ty = func.value_ty(module, limit);
            let loaded_ty = slot_ty.pointee().cloned().ok_or_else(|| {
                ClampError::UnsupportedConstruct(format!(
                    "indirect bounds slot of non-pointer type in `{}`",
                    func.name
                ))
            })?;
            let dst = func.new_value(loaded_ty.clone());
            prelude.push(Inst::Load {
                dst,
                ptr: limit.clone(),
                ty: loaded_ty,
            });
            *limit = Value::Inst(dst);
        }
    }
    // The interval may come from a differently typed allocation; line the
    // limits up with the operand's type.
    for limit in [&mut low, &mut high] {
        let limit_ty = func.value_ty(module, limit);
        if &limit_ty != ptr_ty && limit_ty.is_pointer() {
            let dst = func.new_value(ptr_ty.clone());
            prelude.push(Inst::Cast {
                dst,
                kind: crate::ir::CastKind::Bitcast,
                value: limit.clone(),
                ty: ptr_ty.clone(),
            });
            *limit = Value::Inst(dst);
        }
    }
    Ok((low, high))
}

#[cfg(test)]
mod tests;
