//! Bounds analysis.
//!
//! Populates the value-bounds map: for every pointer-typed value feeding a
//! memory operation, the single interval it may respect, whenever one can be
//! proven. Three sources combine:
//!
//! 1. consolidated allocations: every named global contributes the direct
//!    interval `[&g, &g + 1)` to its address space, and every frame
//!    aggregate contributes its per-function interval;
//! 2. fat-pointer arguments: `low`/`high` are extracted at function entry
//!    and bound to the extracted working pointer;
//! 3. dataflow: forward across address arithmetic, same-space pointer
//!    casts, loads and stores (a stored pointer's bounds flow to the
//!    location and back out of later loads), and backward along producer
//!    chains until a bound ancestor is found.
//!
//! The representation allows one interval per value: merging two unequal
//! intervals into the same value aborts the pass. Backward resolution
//! memoizes visited values, so use-def cycles through phis terminate.

use std::collections::HashSet;

use tracing::debug;

use crate::context::{BoundsInterval, PassContext, Phase};
use crate::error::{ClampError, Result};
use crate::ir::{
    CastKind, Constant, Function, FunctionId, Inst, Module, Type, Value, ValueId, FAT_HIGH,
    FAT_LOW,
};
use crate::passes::ClampPhase;

pub struct BoundsAnalyzer;

impl ClampPhase for BoundsAnalyzer {
    fn name(&self) -> &'static str {
        "analyze-bounds"
    }

    fn starts_from(&self) -> Phase {
        Phase::KernelsWrapped
    }

    fn produces(&self) -> Phase {
        Phase::BoundsAnalyzed
    }

    fn run(&self, module: &mut Module, cx: &mut PassContext) -> Result<()> {
        discover_global_intervals(module, cx);

        let mut twins: Vec<FunctionId> = cx.twin_of.keys().copied().collect();
        twins.sort_by_key(|id| id.0);
        for fid in &twins {
            if module.function(*fid).is_declaration() {
                continue;
            }
            introduce_argument_bounds(module, cx, *fid)?;
        }
        for fid in &twins {
            if module.function(*fid).is_declaration() {
                continue;
            }
            resolve_memory_operands(module, cx, *fid);
        }
        Ok(())
    }
}

/// Every named global allocation bounds its own address space with the
/// direct interval `[&g, &g + 1)`.
fn discover_global_intervals(module: &Module, cx: &mut PassContext) {
    for gid in module.global_ids() {
        let global = module.global(gid);
        if global.name.is_empty() || global.unnamed_addr || global.is_declaration() {
            continue;
        }
        let interval = BoundsInterval::direct(
            Value::Const(Constant::gep(Constant::Global(gid), vec![0])),
            Value::Const(Constant::gep(Constant::Global(gid), vec![1])),
        );
        cx.add_space_bound(global.space.0, interval.clone());
        cx.global_bounds.insert(gid, interval);
        debug!(global = %global.name, space = global.space.0, "registered interval");
    }
}

/// Extracts `low`/`high` from every fat-pointer argument at function entry,
/// binds the interval to the extracted working pointer, and propagates it
/// forward.
fn introduce_argument_bounds(module: &mut Module, cx: &mut PassContext, fid: FunctionId) -> Result<()> {
    let mut fat_args: Vec<(u32, crate::context::FatArgIntro)> = cx
        .fat_args
        .iter()
        .filter(|((f, _), _)| *f == fid)
        .map(|((_, arg), intro)| (*arg, *intro))
        .collect();
    fat_args.sort_by_key(|(arg, _)| *arg);

    let func = module.function_mut(fid);
    let mut intros: Vec<Inst> = Vec::new();
    let mut bound_roots: Vec<ValueId> = Vec::new();
    for (arg, intro) in &mut fat_args {
        let Some(current) = intro.current else {
            continue;
        };
        let ptr_ty = func.value_type(current).clone();
        let low = *intro.low.get_or_insert_with(|| {
            let dst = func.new_value(ptr_ty.clone());
            intros.push(Inst::ExtractValue {
                dst,
                agg: Value::Arg(*arg),
                indices: vec![FAT_LOW],
            });
            dst
        });
        let high = *intro.high.get_or_insert_with(|| {
            let dst = func.new_value(ptr_ty.clone());
            intros.push(Inst::ExtractValue {
                dst,
                agg: Value::Arg(*arg),
                indices: vec![FAT_HIGH],
            });
            dst
        });
        cx.value_bounds.insert(
            (fid, current),
            BoundsInterval::direct(Value::Inst(low), Value::Inst(high)),
        );
        bound_roots.push(current);
        cx.fat_args.insert((fid, *arg), *intro);
    }
    let entry = func.entry;
    func.block_mut(entry).insts.splice(0..0, intros);

    let func = module.function(fid);
    for root in bound_roots {
        propagate_forward(func, module, cx, fid, Value::Inst(root))?;
    }
    Ok(())
}

fn same_space_pointers(a: &Type, b: &Type) -> bool {
    a.is_pointer() && b.is_pointer() && a.address_space() == b.address_space()
}

fn bounds_of(cx: &PassContext, fid: FunctionId, value: &Value) -> Option<BoundsInterval> {
    match value {
        Value::Inst(id) => cx.value_bounds.get(&(fid, *id)).cloned(),
        _ => None,
    }
}

/// Follows uses of a bound value and derives bounds for everything its
/// address can flow into. Stops whenever a value already carries the same
/// interval, which also terminates cycles.
fn propagate_forward(
    func: &Function,
    module: &Module,
    cx: &mut PassContext,
    fid: FunctionId,
    start: Value,
) -> Result<()> {
    let mut worklist = vec![start];
    while let Some(v) = worklist.pop() {
        let Some(vb) = bounds_of(cx, fid, &v) else {
            continue;
        };
        for block in &func.blocks {
            for inst in block.insts.iter().chain(Some(&block.terminator)) {
                match inst {
                    Inst::Gep { dst, base, .. } if *base == v => {
                        try_bind(func, cx, fid, *dst, &vb, &mut worklist)?;
                    }
                    // A location's bounds flow out through loads of it.
                    Inst::Load { dst, ptr, .. } if *ptr == v => {
                        try_bind(func, cx, fid, *dst, &vb, &mut worklist)?;
                    }
                    Inst::Cast {
                        dst,
                        kind: CastKind::Bitcast,
                        value,
                        ty,
                    } if *value == v && same_space_pointers(ty, &func.value_ty(module, &v)) => {
                        try_bind(func, cx, fid, *dst, &vb, &mut worklist)?;
                    }
                    // A stored pointer's bounds flow into the location.
                    Inst::Store { ptr, value, .. } if *value == v => {
                        let Value::Inst(loc) = ptr else {
                            continue;
                        };
                        try_bind(func, cx, fid, *loc, &vb, &mut worklist)?;
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

fn try_bind(
    func: &Function,
    cx: &mut PassContext,
    fid: FunctionId,
    target: ValueId,
    interval: &BoundsInterval,
    worklist: &mut Vec<Value>,
) -> Result<()> {
    match cx.value_bounds.get(&(fid, target)) {
        Some(existing) if existing == interval => Ok(()),
        Some(_) => Err(ClampError::AmbiguousBounds(format!(
            "{target} in `{}`",
            func.name
        ))),
        None => {
            cx.value_bounds.insert((fid, target), interval.clone());
            worklist.push(Value::Inst(target));
            Ok(())
        }
    }
}

/// For every memory-operation pointer operand without direct bounds, walk
/// the producer chain backward to a bound ancestor, then fall back to the
/// single-interval-address-space rule.
fn resolve_memory_operands(module: &mut Module, cx: &mut PassContext, fid: FunctionId) {
    let func = module.function(fid);
    let defs = func.def_sites();
    let mut operands: Vec<Value> = Vec::new();
    for block in &func.blocks {
        for inst in &block.insts {
            if let Some(ptr) = inst.memory_pointer() {
                operands.push(ptr.clone());
            }
        }
    }

    for operand in operands {
        let mut visited = HashSet::new();
        resolve_backward(func, module, cx, fid, &defs, &operand, &mut visited);
        if bounds_of(cx, fid, &operand).is_some() {
            continue;
        }
        let Value::Inst(id) = &operand else {
            continue;
        };
        let Some(space) = func.value_ty(module, &operand).address_space() else {
            continue;
        };
        let candidates = cx.interval_candidates(fid, space.0);
        if candidates.len() == 1 {
            debug!(value = %id, space = space.0, "bound by single-interval address space");
            cx.value_bounds.insert((fid, *id), candidates[0].clone());
        }
    }
}

fn resolve_backward(
    func: &Function,
    module: &Module,
    cx: &mut PassContext,
    fid: FunctionId,
    defs: &std::collections::HashMap<ValueId, (crate::ir::BlockId, usize)>,
    value: &Value,
    visited: &mut HashSet<ValueId>,
) -> Option<BoundsInterval> {
    match value {
        Value::Inst(id) => {
            if let Some(found) = cx.value_bounds.get(&(fid, *id)) {
                return Some(found.clone());
            }
            if !visited.insert(*id) {
                return None;
            }
            let (block, idx) = *defs.get(id)?;
            let parent = match &func.block(block).insts[idx] {
                Inst::Gep { base, .. } => base.clone(),
                Inst::Load { ptr, .. } => ptr.clone(),
                Inst::Cast {
                    kind: CastKind::Bitcast,
                    value: src,
                    ty,
                    dst: _,
                } if same_space_pointers(ty, &func.value_ty(module, src)) => src.clone(),
                _ => return None,
            };
            let interval = resolve_backward(func, module, cx, fid, defs, &parent, visited)?;
            // Propagate forward along the chain that led here.
            cx.value_bounds.insert((fid, *id), interval.clone());
            Some(interval)
        }
        Value::Const(c) => cx.constant_interval(c),
        Value::Arg(_) => None,
    }
}
