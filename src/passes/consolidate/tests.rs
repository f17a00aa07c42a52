use super::*;
use crate::context::ClampConfig;
use crate::ir::{Function, MemIntrinsicKind, Parameter};

fn internal_global(name: &str, ty: Type, space: u32, init: Constant) -> GlobalVariable {
    GlobalVariable {
        name: name.into(),
        ty,
        space: AddressSpace(space),
        init: Some(init),
        linkage: Linkage::Internal,
        unnamed_addr: false,
    }
}

fn run(module: &mut Module) -> (PassContext, Result<()>) {
    let mut cx = PassContext::new(ClampConfig::default());
    let result = StaticMemoryConsolidator.run(module, &mut cx);
    (cx, result)
}

#[test]
fn two_globals_fuse_into_one_aggregate() {
    let mut module = Module::new("m");
    let ga = module.add_global(internal_global("ga", Type::I32, 2, Constant::i32(1)));
    let _gb = module.add_global(internal_global(
        "gb",
        Type::I64,
        2,
        Constant::Int {
            ty: Type::I64,
            value: 2,
        },
    ));

    let mut func = Function::new("f", vec![], Type::I32);
    let entry = func.alloc_block();
    func.entry = entry;
    let v0 = func.new_value(Type::I32);
    func.block_mut(entry).insts.push(Inst::Load {
        dst: v0,
        ptr: Value::Const(Constant::Global(ga)),
        ty: Type::I32,
    });
    func.block_mut(entry).terminator = Inst::Ret {
        value: Some(Value::Inst(v0)),
    };
    module.add_function(func);

    let (_, result) = run(&mut module);
    result.unwrap();

    // Exactly one aggregate remains, with both fields in discovery order.
    assert_eq!(module.globals.len(), 1);
    let agg = &module.globals[0];
    assert_eq!(agg.name, "addr_space2_static_data");
    assert_eq!(agg.space, AddressSpace(2));
    assert_eq!(agg.linkage, Linkage::Internal);
    assert_eq!(
        agg.ty,
        Type::Struct {
            fields: vec![Type::I32, Type::I64],
        }
    );
    assert_eq!(agg.ty.size(), 12);
    assert_eq!(
        agg.init,
        Some(Constant::Struct {
            fields: vec![
                Constant::i32(1),
                Constant::Int {
                    ty: Type::I64,
                    value: 2,
                },
            ],
        })
    );

    // The load now goes through field 0 of the aggregate.
    let Inst::Load { ptr, .. } = &module.functions[0].blocks[0].insts[0] else {
        panic!("expected load");
    };
    assert_eq!(
        *ptr,
        Value::Const(Constant::gep(Constant::Global(GlobalId(0)), vec![0, 0]))
    );
}

#[test]
fn entry_allocas_fuse_into_a_frame_aggregate() {
    let mut module = Module::new("m");
    let mut func = Function::new("f", vec![], Type::Void);
    let entry = func.alloc_block();
    func.entry = entry;
    let a = func.new_value(Type::I32.ptr_to(AddressSpace(0)));
    let b = func.new_value(Type::I64.ptr_to(AddressSpace(0)));
    func.block_mut(entry).insts.push(Inst::Alloca {
        dst: a,
        allocated: Type::I32,
        space: AddressSpace(0),
    });
    func.block_mut(entry).insts.push(Inst::Alloca {
        dst: b,
        allocated: Type::I64,
        space: AddressSpace(0),
    });
    func.block_mut(entry).insts.push(Inst::Store {
        ptr: Value::Inst(a),
        value: Value::Const(Constant::i32(7)),
        ty: Type::I32,
    });
    func.block_mut(entry).terminator = Inst::Ret { value: None };
    let fid = module.add_function(func);

    let (cx, result) = run(&mut module);
    result.unwrap();

    let func = module.function(fid);
    let insts = &func.blocks[0].insts;
    // frame alloca, end marker, one projection per original alloca
    let Inst::Alloca { dst: frame, allocated, .. } = &insts[0] else {
        panic!("expected frame alloca first, got {:?}", insts[0]);
    };
    assert_eq!(
        *allocated,
        Type::Struct {
            fields: vec![Type::I32, Type::I64],
        }
    );
    assert!(matches!(&insts[1], Inst::Gep { base: Value::Inst(f), .. } if f == frame));
    let Inst::Gep { dst: proj_a, base, indices, .. } = &insts[2] else {
        panic!("expected projection");
    };
    assert_eq!(*base, Value::Inst(*frame));
    assert_eq!(
        *indices,
        vec![Value::Const(Constant::i32(0)), Value::Const(Constant::i32(0))]
    );
    // No original allocas survive and the store uses the projection.
    assert_eq!(
        insts
            .iter()
            .filter(|i| matches!(i, Inst::Alloca { .. }))
            .count(),
        1
    );
    let Inst::Store { ptr, .. } = insts.last().unwrap() else {
        panic!("expected store last");
    };
    assert_eq!(*ptr, Value::Inst(*proj_a));

    // Context carries the frame interval and the frame's own bounds.
    assert_eq!(cx.frame_bounds[&fid].len(), 1);
    assert_eq!(cx.frame_bounds[&fid][0].0, 0);
    assert!(cx.value_bounds.contains_key(&(fid, *frame)));
}

#[test]
fn initializer_referencing_globals_aborts() {
    let mut module = Module::new("m");
    let ga = module.add_global(internal_global("ga", Type::I32, 2, Constant::i32(0)));
    module.add_global(internal_global(
        "gb",
        Type::I32.ptr_to(AddressSpace(2)),
        2,
        Constant::Global(ga),
    ));

    let (_, result) = run(&mut module);
    assert!(matches!(result, Err(ClampError::UnsupportedConstruct(_))));
}

#[test]
fn unnamed_and_external_globals_are_left_alone() {
    let mut module = Module::new("m");
    module.add_global(GlobalVariable {
        name: "anon".into(),
        ty: Type::I32,
        space: AddressSpace(1),
        init: Some(Constant::i32(0)),
        linkage: Linkage::Private,
        unnamed_addr: true,
    });
    module.add_global(GlobalVariable {
        name: "ext".into(),
        ty: Type::I32,
        space: AddressSpace(1),
        init: None,
        linkage: Linkage::External,
        unnamed_addr: false,
    });

    let (_, result) = run(&mut module);
    result.unwrap();
    assert_eq!(module.globals.len(), 2);
    assert_eq!(module.globals[0].name, "anon");
    assert_eq!(module.globals[1].name, "ext");
}

#[test]
fn bulk_memory_intrinsics_lose_their_alignment() {
    let mut module = Module::new("m");
    let ptr_ty = Type::I8.ptr_to(AddressSpace(1));
    let mut func = Function::new(
        "f",
        vec![
            Parameter::new("d", ptr_ty.clone()),
            Parameter::new("s", ptr_ty),
        ],
        Type::Void,
    );
    let entry = func.alloc_block();
    func.entry = entry;
    func.block_mut(entry).insts.push(Inst::MemIntrinsic {
        kind: MemIntrinsicKind::Copy,
        dst: Value::Arg(0),
        src: Value::Arg(1),
        len: Value::Const(Constant::i32(16)),
        align: 16,
    });
    func.block_mut(entry).terminator = Inst::Ret { value: None };
    module.add_function(func);

    let (_, result) = run(&mut module);
    result.unwrap();
    let Inst::MemIntrinsic { align, .. } = &module.functions[0].blocks[0].insts[0] else {
        panic!("expected intrinsic");
    };
    assert_eq!(*align, 1);
}
