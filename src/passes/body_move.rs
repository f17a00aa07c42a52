//! Body transplantation from original functions into their twins.
//!
//! Moves every basic block (and the SSA value table) from a rewritten
//! function into its twin, then rewires argument uses in one simultaneous
//! remap: preserved arguments point at their new indices, converted pointer
//! arguments at an entry-block extraction of the fat pointer's working
//! field, and folded builtin triples at extractions of fields 0, 1, and 2.
//!
//! After this phase the module is executable again: call sites still name
//! the old functions, which `CallSiteRewriter` patches later.

use std::collections::HashMap;

use tracing::debug;

use crate::context::{ArgLowering, FatArgIntro, PassContext, Phase};
use crate::error::Result;
use crate::ir::{Inst, Module, Value, FAT_CURRENT, FAT_HIGH, FAT_LOW};
use crate::passes::ClampPhase;

pub struct BodyMover;

impl ClampPhase for BodyMover {
    fn name(&self) -> &'static str {
        "move-bodies"
    }

    fn starts_from(&self) -> Phase {
        Phase::SignaturesRewritten
    }

    fn produces(&self) -> Phase {
        Phase::BodiesMoved
    }

    fn run(&self, module: &mut Module, cx: &mut PassContext) -> Result<()> {
        let mut originals: Vec<_> = cx.rewritten.keys().copied().collect();
        originals.sort_by_key(|id| id.0);

        for old_id in originals {
            let info = cx.rewritten[&old_id].clone();
            let old_params = module.function(old_id).params.clone();
            let (blocks, entry, types) = module.function_mut(old_id).take_body();

            let twin = module.function_mut(info.new_id);
            twin.install_body(blocks, entry, types);

            // Build the simultaneous argument remap. Extractions get their
            // SSA names up front but are only spliced in after the remap, so
            // their own (new-index) argument operands are never remapped.
            let mut remap: HashMap<u32, Value> = HashMap::new();
            let mut intros: Vec<Inst> = Vec::new();
            for (old_index, lowering) in info.args.iter().enumerate() {
                match *lowering {
                    ArgLowering::Same { new_index } => {
                        remap.insert(old_index as u32, Value::Arg(new_index));
                    }
                    ArgLowering::Fat { new_index } => {
                        let current = twin.new_value(old_params[old_index].ty.clone());
                        intros.push(Inst::ExtractValue {
                            dst: current,
                            agg: Value::Arg(new_index),
                            indices: vec![FAT_CURRENT],
                        });
                        remap.insert(old_index as u32, Value::Inst(current));
                        cx.fat_args
                            .entry((info.new_id, new_index))
                            .or_insert_with(FatArgIntro::default)
                            .current = Some(current);
                    }
                    ArgLowering::FatField { new_index, field } => {
                        let extracted = twin.new_value(old_params[old_index].ty.clone());
                        intros.push(Inst::ExtractValue {
                            dst: extracted,
                            agg: Value::Arg(new_index),
                            indices: vec![field],
                        });
                        remap.insert(old_index as u32, Value::Inst(extracted));
                        let intro = cx
                            .fat_args
                            .entry((info.new_id, new_index))
                            .or_insert_with(FatArgIntro::default);
                        match field {
                            FAT_CURRENT => intro.current = Some(extracted),
                            FAT_LOW => intro.low = Some(extracted),
                            FAT_HIGH => intro.high = Some(extracted),
                            _ => {}
                        }
                    }
                }
            }

            twin.visit_values_mut(|value| {
                if let Value::Arg(i) = value {
                    if let Some(replacement) = remap.get(i) {
                        *value = replacement.clone();
                    }
                }
            });
            let entry = twin.entry;
            twin.block_mut(entry).insts.splice(0..0, intros);

            cx.migrate_body_state(old_id, info.new_id);
            debug!(twin = %module.function(info.new_id).name, "moved body");
        }
        Ok(())
    }
}
