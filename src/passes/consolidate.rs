//! Static memory consolidation.
//!
//! Fuses every static allocation into one aggregate per address space so the
//! bounds of each space become a closed interval:
//!
//! - named module globals with simple initializers merge, per address space,
//!   into a single internal aggregate global with the merged initializer;
//! - entry-block stack allocations of each function merge into one
//!   function-local frame aggregate alloca;
//! - every use of an original allocation is rewritten to a field projection
//!   on its aggregate, and the originals are removed.
//!
//! Bulk memory intrinsics lose their alignment argument to a conservative 1,
//! since merging can change the effective alignment of an allocation.

use std::collections::HashSet;

use tracing::debug;

use crate::context::{BoundsInterval, PassContext, Phase};
use crate::error::{ClampError, Result};
use crate::ir::{
    AddressSpace, Constant, FunctionId, GlobalId, GlobalVariable, Inst, Linkage, Module, Type,
    Value, ValueId,
};
use crate::passes::ClampPhase;

pub struct StaticMemoryConsolidator;

impl ClampPhase for StaticMemoryConsolidator {
    fn name(&self) -> &'static str {
        "consolidate-static-memory"
    }

    fn starts_from(&self) -> Phase {
        Phase::Parsed
    }

    fn produces(&self) -> Phase {
        Phase::Consolidated
    }

    fn run(&self, module: &mut Module, cx: &mut PassContext) -> Result<()> {
        consolidate_globals(module)?;
        for fid in module.function_ids().collect::<Vec<_>>() {
            consolidate_frame(module, cx, fid);
        }
        clamp_intrinsic_alignment(module);
        Ok(())
    }
}

/// A global participates in consolidation when its address is observable and
/// its contents are fully known here.
fn is_consolidatable(global: &GlobalVariable) -> Result<bool> {
    if global.name.is_empty() || global.unnamed_addr || global.is_declaration() {
        return Ok(false);
    }
    if let Some(init) = &global.init {
        if !init.is_simple() {
            return Err(ClampError::UnsupportedConstruct(format!(
                "global `{}` has an initializer referencing other globals",
                global.name
            )));
        }
    }
    Ok(true)
}

fn consolidate_globals(module: &mut Module) -> Result<()> {
    // Group by address space in discovery order.
    let mut spaces: Vec<AddressSpace> = Vec::new();
    let mut groups: Vec<Vec<GlobalId>> = Vec::new();
    for gid in module.global_ids().collect::<Vec<_>>() {
        let global = module.global(gid);
        if !is_consolidatable(global)? {
            continue;
        }
        match spaces.iter().position(|s| *s == global.space) {
            Some(pos) => groups[pos].push(gid),
            None => {
                spaces.push(global.space);
                groups.push(vec![gid]);
            }
        }
    }

    let mut dead: HashSet<GlobalId> = HashSet::new();
    for (space, members) in spaces.into_iter().zip(groups) {
        let mut field_types = Vec::with_capacity(members.len());
        let mut field_inits = Vec::with_capacity(members.len());
        for gid in &members {
            let global = module.global(*gid);
            field_types.push(global.ty.clone());
            field_inits.push(
                global
                    .init
                    .clone()
                    .unwrap_or_else(|| Constant::Zero(global.ty.clone())),
            );
        }
        let agg_ty = Type::Struct {
            fields: field_types,
        };
        let agg = module.add_global(GlobalVariable {
            name: format!("addr_space{}_static_data", space.0),
            ty: agg_ty,
            space,
            init: Some(Constant::Struct {
                fields: field_inits,
            }),
            linkage: Linkage::Internal,
            unnamed_addr: false,
        });
        debug!(space = space.0, members = members.len(), "merged address space");

        for (field, gid) in members.iter().enumerate() {
            let projection = Constant::gep(Constant::Global(agg), vec![0, field as i64]);
            for func in &mut module.functions {
                func.visit_values_mut(|value| {
                    if let Value::Const(c) = value {
                        c.replace_global(*gid, &projection);
                    }
                });
            }
            for global in &mut module.globals {
                if let Some(init) = &mut global.init {
                    init.replace_global(*gid, &projection);
                }
            }
            dead.insert(*gid);
        }
    }
    module.purge_globals(&dead);
    Ok(())
}

/// Merges the entry-block allocas of `fid` into one frame aggregate per
/// address space and records its interval for the bounds analysis.
fn consolidate_frame(module: &mut Module, cx: &mut PassContext, fid: FunctionId) {
    let func = module.function_mut(fid);
    if func.is_declaration() {
        return;
    }
    let entry = func.entry;

    // Collect entry-block allocas, grouped by address space in discovery
    // order.
    let mut spaces: Vec<AddressSpace> = Vec::new();
    let mut groups: Vec<Vec<(ValueId, Type)>> = Vec::new();
    for inst in &func.block(entry).insts {
        if let Inst::Alloca {
            dst,
            allocated,
            space,
        } = inst
        {
            match spaces.iter().position(|s| s == space) {
                Some(pos) => groups[pos].push((*dst, allocated.clone())),
                None => {
                    spaces.push(*space);
                    groups.push(vec![(*dst, allocated.clone())]);
                }
            }
        }
    }
    if spaces.is_empty() {
        return;
    }

    let mut removed: HashSet<ValueId> = HashSet::new();
    let mut prelude: Vec<Inst> = Vec::new();
    for (space, members) in spaces.into_iter().zip(groups) {
        let frame_ty = Type::Struct {
            fields: members.iter().map(|(_, ty)| ty.clone()).collect(),
        };
        let frame = func.new_value(frame_ty.clone().ptr_to(space));
        prelude.push(Inst::Alloca {
            dst: frame,
            allocated: frame_ty.clone(),
            space,
        });
        // One-past-the-end marker for the frame's interval.
        let frame_end = func.new_value(frame_ty.ptr_to(space));
        prelude.push(Inst::Gep {
            dst: frame_end,
            base: Value::Inst(frame),
            indices: vec![Value::Const(Constant::i32(1))],
            inbounds: false,
        });

        for (field, (old, allocated)) in members.iter().enumerate() {
            let projection = func.new_value(allocated.clone().ptr_to(space));
            prelude.push(Inst::Gep {
                dst: projection,
                base: Value::Inst(frame),
                indices: vec![
                    Value::Const(Constant::i32(0)),
                    Value::Const(Constant::i32(field as i64)),
                ],
                inbounds: true,
            });
            func.replace_uses(&Value::Inst(*old), &Value::Inst(projection));
            removed.insert(*old);
        }

        let interval = BoundsInterval::direct(Value::Inst(frame), Value::Inst(frame_end));
        cx.frame_bounds
            .entry(fid)
            .or_default()
            .push((space.0, interval.clone()));
        cx.frame_aggregates.entry(fid).or_default().push(frame);
        // The frame pointer itself carries its interval so derived accesses
        // resolve even when the address space holds other allocations.
        cx.value_bounds.insert((fid, frame), interval);
    }

    let entry_block = func.block_mut(entry);
    entry_block
        .insts
        .retain(|inst| !matches!(inst, Inst::Alloca { dst, .. } if removed.contains(dst)));
    entry_block.insts.splice(0..0, prelude);
    debug!(func = %module.function(fid).name, allocas = removed.len(), "consolidated frame");
}

fn clamp_intrinsic_alignment(module: &mut Module) {
    for func in &mut module.functions {
        for block in &mut func.blocks {
            for inst in &mut block.insts {
                if let Inst::MemIntrinsic { align, .. } = inst {
                    *align = 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
