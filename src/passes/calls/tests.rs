use super::*;
use crate::context::ClampConfig;
use crate::ir::{AddressSpace, GlobalVariable, Linkage, Parameter};
use crate::passes::{
    BodyMover, BoundsAnalyzer, CheckInjector, KernelWrapperBuilder, SafetyProver,
    SignatureRewriter, StaticMemoryConsolidator,
};

fn ptr(space: u32) -> Type {
    Type::I32.ptr_to(AddressSpace(space))
}

fn run_through_calls(module: &mut Module, config: ClampConfig) -> (PassContext, Result<()>) {
    let mut cx = PassContext::new(config);
    let result = StaticMemoryConsolidator
        .run(module, &mut cx)
        .and_then(|()| SignatureRewriter.run(module, &mut cx))
        .and_then(|()| BodyMover.run(module, &mut cx))
        .and_then(|()| KernelWrapperBuilder.run(module, &mut cx))
        .and_then(|()| BoundsAnalyzer.run(module, &mut cx))
        .and_then(|()| SafetyProver.run(module, &mut cx))
        .and_then(|()| CheckInjector.run(module, &mut cx))
        .and_then(|()| CallSiteRewriter.run(module, &mut cx));
    (cx, result)
}

/// void helper(i32* p) {}  and  void caller(i32* p) { helper(p); }
fn make_forwarding_module() -> (Module, FunctionId, FunctionId) {
    let mut module = Module::new("m");
    let mut helper = Function::new("helper", vec![Parameter::new("p", ptr(1))], Type::Void);
    let entry = helper.alloc_block();
    helper.entry = entry;
    helper.block_mut(entry).terminator = Inst::Ret { value: None };
    let helper_id = module.add_function(helper);

    let mut caller = Function::new("caller", vec![Parameter::new("p", ptr(1))], Type::Void);
    let entry = caller.alloc_block();
    caller.entry = entry;
    caller.block_mut(entry).insts.push(Inst::Call {
        dst: None,
        callee: helper_id,
        args: vec![Value::Arg(0)],
        arg_attrs: vec![ParamAttrs {
            by_value: true,
            no_capture: false,
        }],
    });
    caller.block_mut(entry).terminator = Inst::Ret { value: None };
    let caller_id = module.add_function(caller);
    (module, helper_id, caller_id)
}

#[test]
fn extracted_pointers_forward_the_whole_aggregate() {
    let (mut module, helper_id, caller_id) = make_forwarding_module();
    let (cx, result) = run_through_calls(&mut module, ClampConfig::default());
    result.unwrap();

    let caller_twin = module.function(cx.rewritten[&caller_id].new_id);
    let call = caller_twin
        .blocks
        .iter()
        .flat_map(|b| &b.insts)
        .find_map(|i| match i {
            Inst::Call { callee, args, arg_attrs, .. } => {
                Some((*callee, args.clone(), arg_attrs.clone()))
            }
            _ => None,
        })
        .expect("call survives");
    let (callee, args, arg_attrs) = call;

    assert_eq!(callee, cx.rewritten[&helper_id].new_id);
    // program-allocations threads through from the caller's own parameter;
    // the pointer argument forwards the caller's whole fat-pointer arg.
    assert_eq!(args, vec![Value::Arg(0), Value::Arg(1)]);
    // by-value dropped with the conversion
    assert!(!arg_attrs[1].by_value);
}

#[test]
fn unextracted_pointers_materialize_from_known_bounds() {
    // void helper(i32* p) {} called with a projection of an internal global.
    let mut module = Module::new("m");
    let arr = Type::Array {
        elem: Box::new(Type::I32),
        len: 4,
    };
    let table = module.add_global(GlobalVariable {
        name: "table".into(),
        ty: arr.clone(),
        space: AddressSpace(1),
        init: Some(Constant::Zero(arr)),
        linkage: Linkage::Internal,
        unnamed_addr: false,
    });

    let mut helper = Function::new("helper", vec![Parameter::new("p", ptr(1))], Type::Void);
    let entry = helper.alloc_block();
    helper.entry = entry;
    helper.block_mut(entry).terminator = Inst::Ret { value: None };
    let helper_id = module.add_function(helper);

    let mut caller = Function::new("caller", vec![], Type::Void);
    let entry = caller.alloc_block();
    caller.entry = entry;
    caller.block_mut(entry).insts.push(Inst::Call {
        dst: None,
        callee: helper_id,
        args: vec![Value::Const(Constant::gep(
            Constant::Global(table),
            vec![0, 0],
        ))],
        arg_attrs: vec![ParamAttrs::default()],
    });
    caller.block_mut(entry).terminator = Inst::Ret { value: None };
    let caller_id = module.add_function(caller);

    let (cx, result) = run_through_calls(&mut module, ClampConfig::default());
    result.unwrap();

    let caller_twin = module.function(cx.rewritten[&caller_id].new_id);
    let insts = &caller_twin.blocks[0].insts;

    // Entry gains the slot alloca; the call is preceded by the three field
    // stores and the aggregate reload.
    assert!(matches!(insts[0], Inst::Alloca { .. }));
    let stores = insts
        .iter()
        .filter(|i| matches!(i, Inst::Store { .. }))
        .count();
    assert_eq!(stores, 3);
    let (reload, call_arg) = {
        let Some(Inst::Call { args, .. }) = insts.last() else {
            panic!("expected call last");
        };
        let Value::Inst(fat) = &args[1] else {
            panic!("expected materialized fat pointer");
        };
        let reload = insts
            .iter()
            .find_map(|i| match i {
                Inst::Load { dst, .. } => Some(*dst),
                _ => None,
            })
            .expect("aggregate reload");
        (reload, *fat)
    };
    assert_eq!(reload, call_arg);
    assert_eq!(
        *caller_twin.value_type(call_arg),
        fat_pointer_type(&ptr(1))
    );
}

#[test]
fn strict_mode_aborts_on_boundless_arguments() {
    // A pointer conjured from an integer has no bounds anywhere.
    let (mut module, _, _) = make_boundless_module();
    let (_, result) = run_through_calls(&mut module, ClampConfig::default());
    assert!(matches!(result, Err(ClampError::MissingBounds(_))));
}

#[test]
fn permissive_mode_passes_null_limits_instead() {
    let (mut module, helper_id, caller_id) = make_boundless_module();
    let config = ClampConfig {
        permissive: true,
        ..ClampConfig::default()
    };
    let (cx, result) = run_through_calls(&mut module, config);
    result.unwrap();

    let caller_twin = module.function(cx.rewritten[&caller_id].new_id);
    let null_stores = caller_twin
        .blocks
        .iter()
        .flat_map(|b| &b.insts)
        .filter(|i| {
            matches!(
                i,
                Inst::Store {
                    value: Value::Const(Constant::Null(_)),
                    ..
                }
            )
        })
        .count();
    assert_eq!(null_stores, 2, "low and high fields hold null");
    let _ = helper_id;
}

fn make_boundless_module() -> (Module, FunctionId, FunctionId) {
    let mut module = Module::new("m");
    let mut helper = Function::new("helper", vec![Parameter::new("p", ptr(1))], Type::Void);
    let entry = helper.alloc_block();
    helper.entry = entry;
    helper.block_mut(entry).terminator = Inst::Ret { value: None };
    let helper_id = module.add_function(helper);

    let mut caller = Function::new("caller", vec![Parameter::new("raw", Type::I64)], Type::Void);
    let entry = caller.alloc_block();
    caller.entry = entry;
    let conjured = caller.new_value(ptr(1));
    caller.block_mut(entry).insts.push(Inst::Cast {
        dst: conjured,
        kind: crate::ir::CastKind::IntToPtr,
        value: Value::Arg(0),
        ty: ptr(1),
    });
    caller.block_mut(entry).insts.push(Inst::Call {
        dst: None,
        callee: helper_id,
        args: vec![Value::Inst(conjured)],
        arg_attrs: vec![ParamAttrs::default()],
    });
    caller.block_mut(entry).terminator = Inst::Ret { value: None };
    let caller_id = module.add_function(caller);
    (module, helper_id, caller_id)
}
