//! Signature rewriting for the fat-pointer calling convention.
//!
//! Every defined function gets a twin whose pointer parameters are replaced
//! by `{current, low, high}` fat-pointer aggregates, preceded by an implicit
//! program-allocations parameter (a 32-bit integer; plumbed through the call
//! graph, reserved for per-invocation context). Twins start with an empty
//! body; `BodyMover` transplants the implementation.
//!
//! Manually written safe builtin implementations spell a fat pointer as
//! three consecutive same-type pointer parameters; those triples fold back
//! into a single fat-pointer parameter here.

use tracing::debug;

use crate::context::{ArgLowering, PassContext, Phase, RewrittenFunction};
use crate::error::{ClampError, Result};
use crate::ir::{fat_pointer_type, Function, Module, ParamAttrs, Parameter, Type};
use crate::mangle;
use crate::passes::ClampPhase;

pub struct SignatureRewriter;

impl ClampPhase for SignatureRewriter {
    fn name(&self) -> &'static str {
        "rewrite-signatures"
    }

    fn starts_from(&self) -> Phase {
        Phase::Consolidated
    }

    fn produces(&self) -> Phase {
        Phase::SignaturesRewritten
    }

    fn run(&self, module: &mut Module, cx: &mut PassContext) -> Result<()> {
        for fid in module.function_ids().collect::<Vec<_>>() {
            let func = module.function(fid);
            if func.is_declaration() {
                continue;
            }
            validate(func)?;

            let untouched =
                cx.config.permissive && func.name == cx.config.entry_name();
            let (params, lowerings) = if untouched {
                preserve_params(func)
            } else if mangle::is_safe_impl_name(&func.name) {
                fold_safe_impl_params(func)
            } else {
                convert_params(func)
            };

            let mut twin = Function::new(format!("{}__fat_ptrs__", func.name), params, func.ret.clone());
            twin.linkage = func.linkage;
            debug!(from = %func.name, to = %twin.name, "created twin signature");

            let new_id = module.add_function(twin);
            cx.rewritten.insert(
                fid,
                RewrittenFunction {
                    new_id,
                    args: lowerings,
                    untouched,
                },
            );
            cx.twin_of.insert(new_id, fid);
        }
        Ok(())
    }
}

fn validate(func: &Function) -> Result<()> {
    if func.is_vararg {
        return Err(ClampError::UnsupportedConstruct(format!(
            "variadic function `{}`",
            func.name
        )));
    }
    if func.ret.is_pointer() {
        return Err(ClampError::UnsupportedConstruct(format!(
            "function `{}` returns a pointer",
            func.name
        )));
    }
    if matches!(func.ret, Type::Array { .. }) {
        return Err(ClampError::UnsupportedConstruct(format!(
            "function `{}` returns an array",
            func.name
        )));
    }
    for block in &func.blocks {
        for inst in &block.insts {
            if let crate::ir::Inst::Unsupported { kind } = inst {
                return Err(ClampError::UnsupportedConstruct(format!(
                    "{kind} instruction in `{}`",
                    func.name
                )));
            }
        }
    }
    Ok(())
}

/// The implicit leading parameter carrying per-invocation context.
fn program_allocations_param() -> Parameter {
    Parameter::new("program_allocations", Type::I32)
}

/// Permissive-mode entry function: argument shape preserved verbatim.
fn preserve_params(func: &Function) -> (Vec<Parameter>, Vec<ArgLowering>) {
    let params = func.params.clone();
    let lowerings = (0..params.len() as u32)
        .map(|new_index| ArgLowering::Same { new_index })
        .collect();
    (params, lowerings)
}

fn convert_params(func: &Function) -> (Vec<Parameter>, Vec<ArgLowering>) {
    let mut params = vec![program_allocations_param()];
    let mut lowerings = Vec::with_capacity(func.params.len());
    for param in &func.params {
        let new_index = params.len() as u32;
        if param.ty.is_pointer() {
            params.push(Parameter {
                name: format!("{}.fat", param.name),
                ty: fat_pointer_type(&param.ty),
                // by-value and no-capture both drop with the conversion
                attrs: ParamAttrs::default(),
            });
            lowerings.push(ArgLowering::Fat { new_index });
        } else {
            params.push(Parameter {
                name: param.name.clone(),
                ty: param.ty.clone(),
                attrs: ParamAttrs {
                    by_value: param.attrs.by_value,
                    no_capture: false,
                },
            });
            lowerings.push(ArgLowering::Same { new_index });
        }
    }
    (params, lowerings)
}

/// Folds each run of three consecutive same-type pointer parameters of a
/// manual safe builtin back into one fat-pointer parameter.
fn fold_safe_impl_params(func: &Function) -> (Vec<Parameter>, Vec<ArgLowering>) {
    let mut params = vec![program_allocations_param()];
    let mut lowerings = Vec::with_capacity(func.params.len());
    let mut i = 0;
    while i < func.params.len() {
        let param = &func.params[i];
        let new_index = params.len() as u32;
        let triple = param.ty.is_pointer()
            && func
                .params
                .get(i + 1)
                .is_some_and(|p| p.ty == param.ty)
            && func
                .params
                .get(i + 2)
                .is_some_and(|p| p.ty == param.ty);
        if triple {
            params.push(Parameter {
                name: format!("{}.fat", param.name),
                ty: fat_pointer_type(&param.ty),
                attrs: ParamAttrs::default(),
            });
            for field in 0..3 {
                lowerings.push(ArgLowering::FatField { new_index, field });
            }
            i += 3;
        } else if param.ty.is_pointer() {
            params.push(Parameter {
                name: format!("{}.fat", param.name),
                ty: fat_pointer_type(&param.ty),
                attrs: ParamAttrs::default(),
            });
            lowerings.push(ArgLowering::Fat { new_index });
            i += 1;
        } else {
            params.push(Parameter {
                name: param.name.clone(),
                ty: param.ty.clone(),
                attrs: ParamAttrs {
                    by_value: param.attrs.by_value,
                    no_capture: false,
                },
            });
            lowerings.push(ArgLowering::Same { new_index });
            i += 1;
        }
    }
    (params, lowerings)
}
