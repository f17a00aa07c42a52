//! Safe-exception proving.
//!
//! Collects pointer values that provably never leave their allocation, so
//! the check injector can leave them unguarded:
//!
//! - constant-indexed, statically in-bounds projections of named internal
//!   allocations (the consolidated aggregates and per-function frames);
//! - in permissive mode, everything reachable from the entry function's
//!   argument vector. The entry function is named by configuration (with
//!   `main` as the fallback rule); its twin takes the original name back
//!   here, and the exemption follows geps, loads, and stores into private
//!   frame slots.
//!
//! Wrapper bodies are synthesized by the pass itself and trusted wholesale;
//! the injector skips them without entries in the exception set.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::context::{PassContext, Phase};
use crate::error::Result;
use crate::ir::{
    BlockId, Constant, Function, FunctionId, Inst, Linkage, Module, Type, Value, ValueId,
};
use crate::passes::ClampPhase;

pub struct SafetyProver;

impl ClampPhase for SafetyProver {
    fn name(&self) -> &'static str {
        "prove-safety"
    }

    fn starts_from(&self) -> Phase {
        Phase::BoundsAnalyzed
    }

    fn produces(&self) -> Phase {
        Phase::SafetyProven
    }

    fn run(&self, module: &mut Module, cx: &mut PassContext) -> Result<()> {
        let mut twins: Vec<FunctionId> = cx.twin_of.keys().copied().collect();
        twins.sort_by_key(|id| id.0);
        for fid in twins {
            if module.function(fid).is_declaration() {
                continue;
            }
            prove_projections(module, cx, fid);
        }
        if cx.config.permissive {
            exempt_entry_arguments(module, cx);
        }
        Ok(())
    }
}

/// Walks a constant index path; returns the projected-to type when the path
/// starts at the allocation itself and stays inside it.
fn project(allocated: &Type, indices: &[i64]) -> Option<Type> {
    if indices.first() != Some(&0) {
        return None;
    }
    let mut cur = allocated.clone();
    for &idx in &indices[1..] {
        cur = match cur {
            Type::Struct { fields } => fields.get(usize::try_from(idx).ok()?)?.clone(),
            Type::Array { elem, len } => {
                if idx < 0 || idx as u64 >= len {
                    return None;
                }
                *elem
            }
            Type::Vector { elem, len } => {
                if idx < 0 || idx as u64 >= u64::from(len) {
                    return None;
                }
                *elem
            }
            _ => return None,
        };
    }
    Some(cur)
}

/// The type a constant address points into, provided every projection level
/// down to a named internal global is statically in bounds.
fn safe_constant_pointee(module: &Module, c: &Constant) -> Option<Type> {
    match c {
        Constant::Global(gid) => {
            let global = module.global(*gid);
            let named = !global.name.is_empty() && !global.unnamed_addr;
            (named && matches!(global.linkage, Linkage::Internal | Linkage::Private))
                .then(|| global.ty.clone())
        }
        Constant::Gep { base, indices } => {
            let allocated = safe_constant_pointee(module, base)?;
            project(&allocated, indices)
        }
        _ => None,
    }
}

/// Safe constant addresses: in-bounds constant projections of named internal
/// globals (possibly through a consolidated-aggregate projection). Judged
/// structurally, also used by the check injector for constant operands.
pub(crate) fn constant_projection_is_safe(module: &Module, c: &Constant) -> bool {
    matches!(c, Constant::Gep { .. }) && safe_constant_pointee(module, c).is_some()
}

fn const_indices(indices: &[Value]) -> Option<Vec<i64>> {
    indices
        .iter()
        .map(|idx| match idx {
            Value::Const(Constant::Int { value, .. }) => Some(*value),
            _ => None,
        })
        .collect()
}

/// Marks in-bounds constant-indexed projections of named allocations.
fn prove_projections(module: &Module, cx: &mut PassContext, fid: FunctionId) {
    let func = module.function(fid);
    let defs = func.def_sites();
    let frames: HashSet<ValueId> = cx
        .frame_aggregates
        .get(&fid)
        .map(|v| v.iter().copied().collect())
        .unwrap_or_default();

    let mut proven: Vec<Value> = Vec::new();
    for block in &func.blocks {
        for inst in &block.insts {
            let Some(ptr) = inst.memory_pointer() else {
                continue;
            };
            if let Value::Inst(id) = ptr {
                if gep_projection_is_safe(func, module, &defs, &frames, *id) {
                    proven.push(ptr.clone());
                }
            }
        }
    }
    for value in proven {
        if cx.mark_safe(fid, &value) {
            debug!(func = %func.name, %value, "proved projection safe");
        }
    }
}

fn gep_projection_is_safe(
    func: &Function,
    module: &Module,
    defs: &HashMap<ValueId, (BlockId, usize)>,
    frames: &HashSet<ValueId>,
    id: ValueId,
) -> bool {
    let Some((block, idx)) = defs.get(&id) else {
        return false;
    };
    let Inst::Gep { base, indices, .. } = &func.block(*block).insts[*idx] else {
        return false;
    };
    let Some(indices) = const_indices(indices) else {
        return false;
    };
    match base {
        Value::Inst(frame) if frames.contains(frame) => {
            let frame_ty = func.value_type(*frame);
            frame_ty
                .pointee()
                .is_some_and(|allocated| project(allocated, &indices).is_some())
        }
        Value::Const(c) => safe_constant_pointee(module, c)
            .is_some_and(|allocated| project(&allocated, &indices).is_some()),
        _ => false,
    }
}

/// Permissive mode: the entry function keeps its host-visible shape, takes
/// its name back, and its argument-vector uses are exempt from checks.
fn exempt_entry_arguments(module: &mut Module, cx: &mut PassContext) {
    let entry_name = cx.config.entry_name().to_string();
    let Some(old_id) = module.function_by_name(&entry_name) else {
        return;
    };
    let Some(info) = cx.rewritten.get(&old_id).cloned() else {
        return;
    };

    module.function_mut(old_id).name = format!("{entry_name}.orig");
    module.function_mut(info.new_id).name = entry_name.clone();
    debug!(entry = %entry_name, "entry twin took the original name back");

    let func = module.function(info.new_id);
    let argv_params: Vec<u32> = func
        .params
        .iter()
        .enumerate()
        .filter(|(_, p)| p.name == "argv" && p.ty.is_pointer())
        .map(|(i, _)| i as u32)
        .collect();
    for arg in argv_params {
        exempt_reachable_uses(module, cx, info.new_id, Value::Arg(arg));
    }
}

/// Follows uses of an exempt value: projections and loads stay exempt, and
/// a store of an exempt value into a private frame slot exempts the slot.
fn exempt_reachable_uses(module: &Module, cx: &mut PassContext, fid: FunctionId, start: Value) {
    let func = module.function(fid);
    let defs = func.def_sites();
    let frames: HashSet<ValueId> = cx
        .frame_aggregates
        .get(&fid)
        .map(|v| v.iter().copied().collect())
        .unwrap_or_default();

    cx.mark_safe(fid, &start);
    let mut worklist = vec![start];
    while let Some(v) = worklist.pop() {
        for block in &func.blocks {
            for inst in &block.insts {
                match inst {
                    Inst::Gep { dst, base, .. } if *base == v => {
                        if cx.mark_safe(fid, &Value::Inst(*dst)) {
                            worklist.push(Value::Inst(*dst));
                        }
                    }
                    Inst::Load { dst, ptr, .. } if *ptr == v => {
                        if cx.mark_safe(fid, &Value::Inst(*dst)) {
                            worklist.push(Value::Inst(*dst));
                        }
                    }
                    Inst::Store { ptr, value, .. } if *value == v => {
                        let Value::Inst(slot) = ptr else {
                            continue;
                        };
                        let is_frame_slot = defs.get(slot).is_some_and(|(b, i)| {
                            matches!(
                                &func.block(*b).insts[*i],
                                Inst::Gep { base: Value::Inst(frame), .. }
                                    if frames.contains(frame)
                            )
                        });
                        if is_frame_slot && cx.mark_safe(fid, ptr) {
                            worklist.push(ptr.clone());
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}
