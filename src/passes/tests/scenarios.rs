//! End-to-end scenarios for the whole pipeline.

use super::*;
use crate::cfg::CFG;
use crate::error::ClampError;
use crate::ir::{GlobalVariable, ICmpOp, Linkage};

/// Walks every load and store of a function and asserts the guard chain the
/// check injector promises: the operation sits alone in its block, reached
/// through a low comparison which is reached through a high comparison.
fn assert_fully_guarded(func: &Function) {
    let cfg = CFG::build(func);
    for block in &func.blocks {
        for inst in &block.insts {
            if !matches!(inst, Inst::Load { .. } | Inst::Store { .. }) {
                continue;
            }
            assert_eq!(
                block.insts.len(),
                1,
                "a guarded operation sits alone in its block in `{}`",
                func.name
            );
            let low_block = match cfg.predecessors[&block.id].as_slice() {
                [single] => func.block(*single),
                other => panic!("guard body has predecessors {other:?}"),
            };
            assert!(
                matches!(low_block.insts.last(), Some(Inst::ICmp { op: ICmpOp::Ult, .. })),
                "low comparison precedes the operation"
            );
            let start_block = match cfg.predecessors[&low_block.id].as_slice() {
                [single] => func.block(*single),
                other => panic!("low check has predecessors {other:?}"),
            };
            assert!(
                matches!(start_block.insts.last(), Some(Inst::ICmp { op: ICmpOp::Ugt, .. })),
                "high comparison precedes the low comparison"
            );
        }
    }
}

#[test]
fn scenario_a_out_of_bounds_stores_are_guarded() {
    let mut module = make_store_kernel();
    run_pipeline(&mut module, ClampConfig::default()).unwrap();

    let wrapper_id = module.kernels[0];
    let wrapper = module.function(wrapper_id);
    // Host shape: (a, a.size, i).
    let tys: Vec<Type> = wrapper.params.iter().map(|p| p.ty.clone()).collect();
    assert_eq!(tys, vec![global_ptr(), Type::I32, Type::I32]);

    // Every memory operation outside the wrapper is guarded.
    for id in module.function_ids() {
        if id == wrapper_id {
            continue;
        }
        assert_fully_guarded(module.function(id));
    }
}

#[test]
fn scenario_b_same_space_globals_share_one_aggregate() {
    let mut module = Module::new("m");
    module.add_global(GlobalVariable {
        name: "small".into(),
        ty: Type::I32,
        space: AddressSpace(1),
        init: Some(Constant::i32(1)),
        linkage: Linkage::Internal,
        unnamed_addr: false,
    });
    module.add_global(GlobalVariable {
        name: "large".into(),
        ty: Type::I64,
        space: AddressSpace(1),
        init: Some(Constant::Int {
            ty: Type::I64,
            value: 2,
        }),
        linkage: Linkage::Internal,
        unnamed_addr: false,
    });
    run_pipeline(&mut module, ClampConfig::default()).unwrap();

    assert_eq!(module.globals.len(), 1);
    let agg = &module.globals[0];
    assert_eq!(agg.ty.size(), 4 + 8);
    assert_eq!(
        agg.ty,
        Type::Struct {
            fields: vec![Type::I32, Type::I64],
        }
    );
}

#[test]
fn scenario_c_unsafe_builtin_declarations_disappear_after_retargeting() {
    let mut module = Module::new("m");
    let decl = module.add_function(Function::declaration(
        "_Z7vstore4Dv4_fjPU3AS1f",
        vec![
            Parameter::new(
                "data",
                Type::Vector {
                    elem: Box::new(Type::F32),
                    len: 4,
                },
            ),
            Parameter::new("offset", Type::I32),
            Parameter::new("p", Type::F32.ptr_to(AddressSpace(1))),
        ],
        Type::Void,
    ));
    let mut k = Function::new(
        "k",
        vec![Parameter::new("out", Type::F32.ptr_to(AddressSpace(1)))],
        Type::Void,
    );
    let entry = k.alloc_block();
    k.entry = entry;
    k.block_mut(entry).insts.push(Inst::Call {
        dst: None,
        callee: decl,
        args: vec![
            Value::Const(Constant::Zero(Type::Vector {
                elem: Box::new(Type::F32),
                len: 4,
            })),
            Value::Const(Constant::i32(0)),
            Value::Arg(0),
        ],
        arg_attrs: vec![Default::default(); 3],
    });
    k.block_mut(entry).terminator = Inst::Ret { value: None };
    let kid = module.add_function(k);
    module.kernels.push(kid);

    run_pipeline(&mut module, ClampConfig::default()).unwrap();

    // The unsafe declaration is gone; the safe twin remains and is called
    // with a fat pointer.
    assert!(module.function_by_name("_Z7vstore4Dv4_fjPU3AS1f").is_none());
    let twin = module
        .function_by_name("vstore4__safe__Dv4_fjPU3AS1f")
        .expect("safe twin");
    assert!(module.function(twin).params[3].ty.is_aggregate());
}

#[test]
fn scenario_d_two_ranges_into_one_variable_abort() {
    let mut module = Module::new("m");
    let ptr_ty = global_ptr();
    let mut func = Function::new(
        "f",
        vec![
            Parameter::new("p", ptr_ty.clone()),
            Parameter::new("q", ptr_ty.clone()),
        ],
        Type::Void,
    );
    let entry = func.alloc_block();
    func.entry = entry;
    let slot = func.new_value(ptr_ty.clone().ptr_to(AddressSpace(0)));
    func.block_mut(entry).insts.push(Inst::Alloca {
        dst: slot,
        allocated: ptr_ty.clone(),
        space: AddressSpace(0),
    });
    for arg in [0, 1] {
        func.block_mut(entry).insts.push(Inst::Store {
            ptr: Value::Inst(slot),
            value: Value::Arg(arg),
            ty: ptr_ty.clone(),
        });
    }
    func.block_mut(entry).terminator = Inst::Ret { value: None };
    module.add_function(func);

    let result = run_pipeline(&mut module, ClampConfig::default());
    assert!(matches!(result, Err(ClampError::AmbiguousBounds(_))));
}

#[test]
fn scenario_e_permissive_entry_keeps_its_shape_and_other_ops_stay_checked() {
    let mut module = Module::new("m");
    let arr = Type::Array {
        elem: Box::new(Type::I32),
        len: 4,
    };
    module.add_global(GlobalVariable {
        name: "table".into(),
        ty: arr.clone(),
        space: AddressSpace(1),
        init: Some(Constant::Zero(arr)),
        linkage: Linkage::Internal,
        unnamed_addr: false,
    });

    let char_ptr = Type::I8.ptr_to(AddressSpace(0));
    let argv_ty = char_ptr.clone().ptr_to(AddressSpace(0));
    let mut main = Function::new(
        "main",
        vec![
            Parameter::new("argc", Type::I32),
            Parameter::new("argv", argv_ty.clone()),
        ],
        Type::I32,
    );
    let entry = main.alloc_block();
    main.entry = entry;
    // char* first = *argv; (argv-derived: exempt)
    let first = main.new_value(char_ptr);
    main.block_mut(entry).insts.push(Inst::Load {
        dst: first,
        ptr: Value::Arg(1),
        ty: Type::I8.ptr_to(AddressSpace(0)),
    });
    // table[argc] = 0; (still checked)
    let elem = main.new_value(Type::I32.ptr_to(AddressSpace(1)));
    main.block_mut(entry).insts.push(Inst::Gep {
        dst: elem,
        base: Value::Const(Constant::gep(Constant::Global(crate::ir::GlobalId(0)), vec![0, 0])),
        indices: vec![Value::Arg(0)],
        inbounds: false,
    });
    main.block_mut(entry).insts.push(Inst::Store {
        ptr: Value::Inst(elem),
        value: Value::Const(Constant::i32(0)),
        ty: Type::I32,
    });
    main.block_mut(entry).terminator = Inst::Ret {
        value: Some(Value::Const(Constant::i32(0))),
    };
    module.add_function(main);

    let config = ClampConfig {
        permissive: true,
        ..ClampConfig::default()
    };
    run_pipeline(&mut module, config).unwrap();

    let main_id = module.function_by_name("main").expect("main survives");
    let main = module.function(main_id);
    // Signature preserved: no context parameter, no fat pointers.
    let tys: Vec<Type> = main.params.iter().map(|p| p.ty.clone()).collect();
    assert_eq!(tys, vec![Type::I32, argv_ty]);

    // The argv load is unguarded; the table store gained a guard, so the
    // function has guard blocks.
    assert!(main.blocks.len() > 1, "the table store is still checked");
    let guarded_stores = main
        .blocks
        .iter()
        .filter(|b| b.insts.len() == 1 && matches!(b.insts[0], Inst::Store { .. }))
        .count();
    assert_eq!(guarded_stores, 1);
    // The argv load stayed in the entry block, unguarded.
    assert!(main
        .blocks[0]
        .insts
        .iter()
        .any(|i| matches!(i, Inst::Load { ptr: Value::Arg(1), .. })));
}

#[test]
fn scenario_f_constant_projections_need_no_check() {
    let mut module = Module::new("m");
    let agg_ty = Type::Struct {
        fields: vec![Type::I32, Type::I32],
    };
    module.add_global(GlobalVariable {
        name: "state".into(),
        ty: agg_ty.clone(),
        space: AddressSpace(1),
        init: Some(Constant::Zero(agg_ty)),
        linkage: Linkage::Internal,
        unnamed_addr: false,
    });
    let mut func = Function::new("f", vec![], Type::I32);
    let entry = func.alloc_block();
    func.entry = entry;
    let loaded = func.new_value(Type::I32);
    func.block_mut(entry).insts.push(Inst::Load {
        dst: loaded,
        ptr: Value::Const(Constant::gep(Constant::Global(crate::ir::GlobalId(0)), vec![0, 1])),
        ty: Type::I32,
    });
    func.block_mut(entry).terminator = Inst::Ret {
        value: Some(Value::Inst(loaded)),
    };
    module.add_function(func);

    run_pipeline(&mut module, ClampConfig::default()).unwrap();

    let twin = module
        .function_by_name("f__fat_ptrs__")
        .expect("twin survives");
    assert_eq!(module.function(twin).blocks.len(), 1, "no guard inserted");
}
