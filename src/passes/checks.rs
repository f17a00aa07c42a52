//! Boundary-check injection.
//!
//! For every load or store whose pointer is not proven safe, splices a
//! compare-and-branch guard around the operation:
//!
//! ```text
//! start:                              ; ... %p computed
//!   %last  = &((T*)high)[-1]          ; last valid address for T
//!   %hi    = icmp ugt T* %p, %last
//!   br i1 %hi, label %fail, label %check.low
//! check.low:
//!   %first = (T*)low + 0              ; first valid address for T
//!   %lo    = icmp ult T* %p, %first
//!   br i1 %lo, label %fail, label %body
//! body:
//!   <the operation>
//!   br label %end
//! fail:
//!   br label %end
//! end:
//!   %v = phi [ body: result, fail: zero ]   ; loads only
//! ```
//!
//! `high` is the first invalid address, so the last valid address rewinds
//! one element after casting to the access type. Indirect intervals load
//! their bounds at the check site first. On the failing path a load yields a
//! zero of its type and a store is simply skipped. Exactly one candidate
//! interval per site is supported.

use std::collections::HashSet;

use tracing::debug;

use crate::context::{BoundsInterval, PassContext, Phase};
use crate::error::{ClampError, Result};
use crate::ir::{
    BasicBlock, BlockId, Constant, Function, FunctionId, ICmpOp, Inst, Module, Type, Value,
    ValueId,
};
use crate::passes::safety::constant_projection_is_safe;
use crate::passes::ClampPhase;

pub struct CheckInjector;

impl ClampPhase for CheckInjector {
    fn name(&self) -> &'static str {
        "inject-checks"
    }

    fn starts_from(&self) -> Phase {
        Phase::SafetyProven
    }

    fn produces(&self) -> Phase {
        Phase::ChecksInjected
    }

    fn run(&self, module: &mut Module, cx: &mut PassContext) -> Result<()> {
        for fid in module.function_ids().collect::<Vec<_>>() {
            if module.function(fid).is_declaration() || cx.trusted.contains(&fid) {
                continue;
            }
            let mut func = std::mem::replace(
                module.function_mut(fid),
                Function::new("", vec![], Type::Void),
            );
            let result = guard_function(&mut func, module, cx, fid);
            *module.function_mut(fid) = func;
            result?;
        }
        Ok(())
    }
}

fn guard_function(
    func: &mut Function,
    module: &Module,
    cx: &PassContext,
    fid: FunctionId,
) -> Result<()> {
    let mut guarded: HashSet<BlockId> = HashSet::new();
    let mut pos = 0;
    while pos < func.blocks.len() {
        let block_id = func.blocks[pos].id;
        if guarded.contains(&block_id) {
            pos += 1;
            continue;
        }
        let target = find_checkable(func, module, cx, fid, pos);
        let Some((idx, ptr, load)) = target else {
            pos += 1;
            continue;
        };
        let interval = site_interval(func, module, cx, fid, &ptr)?;
        let body = inject_guard(func, module, block_id, idx, &ptr, load, &interval)?;
        guarded.insert(body);
        pos += 1;
    }
    Ok(())
}

/// First load or store in the block that still needs a guard.
fn find_checkable(
    func: &Function,
    module: &Module,
    cx: &PassContext,
    fid: FunctionId,
    pos: usize,
) -> Option<(usize, Value, Option<(ValueId, Type)>)> {
    for (idx, inst) in func.blocks[pos].insts.iter().enumerate() {
        let (ptr, load) = match inst {
            Inst::Load { dst, ptr, ty } => (ptr, Some((*dst, ty.clone()))),
            Inst::Store { ptr, .. } => (ptr, None),
            _ => continue,
        };
        if cx.is_safe_exception(fid, ptr) {
            continue;
        }
        if let Value::Const(c) = ptr {
            if constant_projection_is_safe(module, c) {
                continue;
            }
        }
        return Some((idx, ptr.clone(), load));
    }
    None
}

/// The one interval this site checks against: the operand's own bounds if
/// the analysis proved them, the address space's single interval otherwise.
fn site_interval(
    func: &Function,
    module: &Module,
    cx: &PassContext,
    fid: FunctionId,
    ptr: &Value,
) -> Result<BoundsInterval> {
    let direct = match ptr {
        Value::Inst(id) => cx.value_bounds.get(&(fid, *id)).cloned(),
        Value::Const(c) => cx.constant_interval(c),
        Value::Arg(_) => None,
    };
    if let Some(interval) = direct {
        return Ok(interval);
    }
    let space = func
        .value_ty(module, ptr)
        .address_space()
        .ok_or_else(|| {
            ClampError::UnsupportedConstruct(format!(
                "memory access through non-pointer operand in `{}`",
                func.name
            ))
        })?;
    let candidates = cx.interval_candidates(fid, space.0);
    match candidates.len() {
        1 => Ok(candidates.into_iter().next().unwrap_or_else(|| unreachable!())),
        0 => Err(ClampError::MissingBounds(format!(
            "{ptr} in `{}` (address space {} has no allocations)",
            func.name, space.0
        ))),
        count => Err(ClampError::MultiIntervalCheck { count }),
    }
}

/// Splices the five-block guard around the operation at `(block, idx)` and
/// returns the block now holding the operation.
fn inject_guard(
    func: &mut Function,
    module: &Module,
    block: BlockId,
    idx: usize,
    ptr: &Value,
    load: Option<(ValueId, Type)>,
    interval: &BoundsInterval,
) -> Result<BlockId> {
    let ptr_ty = func.value_ty(module, ptr);

    // Carve the operation out: `body` keeps just the operation, `end` the
    // rest of the original block and its terminator.
    let body = func.split_block_at(block, idx);
    let end = func.split_block_at(body, 1);
    let check_low = func.alloc_block();
    let fail = func.alloc_block();

    // Emit blocks in textual order: start, check.low, body, fail, end.
    let at = func.blocks.len() - 4;
    let mut tail: Vec<Option<BasicBlock>> =
        func.blocks.split_off(at).into_iter().map(Some).collect();
    for slot in [2usize, 0, 3, 1] {
        if let Some(b) = tail[slot].take() {
            func.blocks.push(b);
        }
    }

    // Materialize the limits in the start block. Indirect intervals hold
    // slot addresses and are dereferenced first.
    let mut low = interval.low.clone();
    let mut high = interval.high.clone();
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
            func.block_mut(block).insts.push(Inst::Load {
                dst,
                ptr: limit.clone(),
                ty: loaded_ty,
            });
            *limit = Value::Inst(dst);
        }
    }
    let last = valid_address(func, module, block, &ptr_ty, high, -1);
    let first = valid_address(func, module, block, &ptr_ty, low, 0);

    let hi_cmp = func.new_value(Type::I1);
    func.block_mut(block).insts.push(Inst::ICmp {
        dst: hi_cmp,
        op: ICmpOp::Ugt,
        lhs: ptr.clone(),
        rhs: last,
    });
    func.block_mut(block).terminator = Inst::CondBr {
        cond: Value::Inst(hi_cmp),
        if_true: fail,
        if_false: check_low,
    };

    let lo_cmp = func.new_value(Type::I1);
    func.block_mut(check_low).insts.push(Inst::ICmp {
        dst: lo_cmp,
        op: ICmpOp::Ult,
        lhs: ptr.clone(),
        rhs: first,
    });
    func.block_mut(check_low).terminator = Inst::CondBr {
        cond: Value::Inst(lo_cmp),
        if_true: fail,
        if_false: body,
    };

    func.block_mut(body).terminator = Inst::Br { target: end };
    func.block_mut(fail).terminator = Inst::Br { target: end };

    // A guarded load merges with a zero of its type; the phi takes over
    // every downstream use. A guarded store is simply skipped.
    if let Some((load_dst, load_ty)) = load {
        let phi = func.new_value(load_ty.clone());
        func.replace_uses(&Value::Inst(load_dst), &Value::Inst(phi));
        func.block_mut(end).insts.insert(
            0,
            Inst::Phi {
                dst: phi,
                ty: load_ty.clone(),
                incoming: vec![
                    (body, Value::Inst(load_dst)),
                    (fail, Value::Const(Constant::Zero(load_ty))),
                ],
            },
        );
    }
    debug!(%block, op = %body, "guarded memory operation");
    Ok(body)
}

/// `(T*)limit + offset`, emitted into `block`. The cast is skipped when the
/// limit already has the access type; the offset rewinds one element for the
/// high limit because it holds the first invalid address.
fn valid_address(
    func: &mut Function,
    module: &Module,
    block: BlockId,
    ptr_ty: &Type,
    limit: Value,
    offset: i64,
) -> Value {
    let limit_ty = func.value_ty(module, &limit);
    let typed = if &limit_ty == ptr_ty {
        limit
    } else {
        let dst = func.new_value(ptr_ty.clone());
        func.block_mut(block).insts.push(Inst::Cast {
            dst,
            kind: crate::ir::CastKind::Bitcast,
            value: limit,
            ty: ptr_ty.clone(),
        });
        Value::Inst(dst)
    };
    let dst = func.new_value(ptr_ty.clone());
    func.block_mut(block).insts.push(Inst::Gep {
        dst,
        base: typed,
        indices: vec![Value::Const(Constant::i32(offset))],
        inbounds: false,
    });
    Value::Inst(dst)
}
