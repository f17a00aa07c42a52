//! Kernel entry-point synthesis.
//!
//! For each kernel in the module's kernel metadata, builds the externally
//! visible wrapper the host actually calls. The wrapper takes every original
//! parameter plus, after each pointer, a 32-bit element count; it computes
//! `high = p + count`, records the pair in two fresh private globals (the
//! per-invocation indirect bounds for that address space), materializes the
//! `{p, p, high}` fat pointer, and calls the rewritten kernel. The metadata
//! entry is repointed at the wrapper and the inner kernel goes internal so
//! the optimizer may inline it.

use tracing::debug;

use crate::context::{BoundsInterval, PassContext, Phase};
use crate::error::{ClampError, Result};
use crate::ir::{
    Constant, Function, GlobalVariable, Inst, Linkage, Module, ParamAttrs, Parameter, Type, Value,
};
use crate::passes::calls::build_fat_pointer;
use crate::passes::ClampPhase;
use crate::target::MemoryRegion;

pub struct KernelWrapperBuilder;

impl ClampPhase for KernelWrapperBuilder {
    fn name(&self) -> &'static str {
        "wrap-kernels"
    }

    fn starts_from(&self) -> Phase {
        Phase::BodiesMoved
    }

    fn produces(&self) -> Phase {
        Phase::KernelsWrapped
    }

    fn run(&self, module: &mut Module, cx: &mut PassContext) -> Result<()> {
        for entry in 0..module.kernels.len() {
            let kernel_id = module.kernels[entry];
            let Some(info) = cx.rewritten.get(&kernel_id).cloned() else {
                continue;
            };
            let twin_id = info.new_id;
            let orig = module.function(kernel_id);
            if orig.ret != Type::Void {
                return Err(ClampError::UnsupportedConstruct(format!(
                    "kernel `{}` must return void",
                    orig.name
                )));
            }

            let kernel_name = orig.name.clone();
            let orig_params = orig.params.clone();
            let private_space = cx.config.address_spaces.space(MemoryRegion::Private);

            // Host-visible parameter list: each pointer gains an element
            // count immediately after it.
            let mut params = Vec::new();
            for param in &orig_params {
                params.push(Parameter::new(param.name.clone(), param.ty.clone()));
                if param.ty.is_pointer() {
                    params.push(Parameter::new(format!("{}.size", param.name), Type::I32));
                }
            }

            let mut wrapper = Function::new(kernel_name.clone(), params, Type::Void);
            wrapper.linkage = Linkage::External;
            let block = wrapper.alloc_block();
            wrapper.entry = block;

            let mut args: Vec<Value> = Vec::new();
            if info.has_ctx_param() {
                args.push(Value::Const(Constant::i32(0)));
            }

            let mut w = 0u32;
            for param in &orig_params {
                if !param.ty.is_pointer() {
                    args.push(Value::Arg(w));
                    w += 1;
                    continue;
                }
                let ptr = Value::Arg(w);
                let count = Value::Arg(w + 1);
                let space = param
                    .ty
                    .address_space()
                    .unwrap_or(private_space);

                // high = p + count (the first invalid address)
                let high = wrapper.new_value(param.ty.clone());
                wrapper.block_mut(block).insts.push(Inst::Gep {
                    dst: high,
                    base: ptr.clone(),
                    indices: vec![count],
                    inbounds: false,
                });

                // Per-invocation bounds live in two private globals; the
                // interval is indirect since the checks must load them.
                let slot_min = module.add_global(bound_slot(
                    format!("{}.{}.min", kernel_name, param.name),
                    param.ty.clone(),
                    private_space,
                ));
                let slot_max = module.add_global(bound_slot(
                    format!("{}.{}.max", kernel_name, param.name),
                    param.ty.clone(),
                    private_space,
                ));
                wrapper.block_mut(block).insts.push(Inst::Store {
                    ptr: Value::Const(Constant::Global(slot_min)),
                    value: ptr.clone(),
                    ty: param.ty.clone(),
                });
                wrapper.block_mut(block).insts.push(Inst::Store {
                    ptr: Value::Const(Constant::Global(slot_max)),
                    value: Value::Inst(high),
                    ty: param.ty.clone(),
                });
                cx.add_space_bound(
                    space.0,
                    BoundsInterval::indirect(
                        Value::Const(Constant::Global(slot_min)),
                        Value::Const(Constant::Global(slot_max)),
                    ),
                );

                let fat = build_fat_pointer(
                    &mut wrapper,
                    &param.ty,
                    private_space,
                    ptr.clone(),
                    ptr,
                    Value::Inst(high),
                );
                wrapper.block_mut(block).insts.push(fat.alloca);
                wrapper.block_mut(block).insts.extend(fat.insts);
                args.push(Value::Inst(fat.result));
                w += 2;
            }

            let attrs = vec![ParamAttrs::default(); args.len()];
            wrapper.block_mut(block).insts.push(Inst::Call {
                dst: None,
                callee: twin_id,
                args,
                arg_attrs: attrs,
            });
            wrapper.block_mut(block).terminator = Inst::Ret { value: None };

            module.function_mut(kernel_id).name = format!("{kernel_name}.orig");
            let wrapper_id = module.add_function(wrapper);
            module.kernels[entry] = wrapper_id;
            module.function_mut(twin_id).linkage = Linkage::Internal;
            cx.trusted.insert(wrapper_id);
            debug!(kernel = %kernel_name, "synthesized host wrapper");
        }
        Ok(())
    }
}

fn bound_slot(name: String, ty: Type, space: crate::ir::AddressSpace) -> GlobalVariable {
    GlobalVariable {
        name,
        init: Some(Constant::Null(ty.clone())),
        ty,
        space,
        linkage: Linkage::Private,
        unnamed_addr: true,
    }
}
