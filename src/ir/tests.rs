use super::*;

fn int_ptr(space: u32) -> Type {
    Type::I32.ptr_to(AddressSpace(space))
}

#[test]
fn fat_pointer_is_three_same_pointers() {
    let ptr = int_ptr(1);
    let fat = fat_pointer_type(&ptr);
    match &fat {
        Type::Struct { fields } => {
            assert_eq!(fields.len(), 3);
            assert!(fields.iter().all(|f| *f == ptr));
        }
        other => panic!("expected struct, got {other:?}"),
    }
}

#[test]
fn constant_gep_typing_descends_aggregates() {
    let module = Module::new("t");
    let agg = Type::Struct {
        fields: vec![Type::I32, Type::I64],
    };
    let base = Constant::Null(agg.ptr_to(AddressSpace(2)));
    let field1 = Constant::gep(base, vec![0, 1]);
    assert_eq!(field1.ty(&module), Type::I64.ptr_to(AddressSpace(2)));
}

#[test]
fn gep_typing_requires_constant_struct_indices() {
    let agg = Type::Struct {
        fields: vec![Type::I32, Type::I64],
    };
    let base_ty = agg.ptr_to(AddressSpace(0));
    let ok = gep_type(
        &base_ty,
        &[
            Value::Const(Constant::i32(0)),
            Value::Const(Constant::i32(1)),
        ],
    );
    assert_eq!(ok, Some(Type::I64.ptr_to(AddressSpace(0))));
    let bad = gep_type(&base_ty, &[Value::Const(Constant::i32(0)), Value::Arg(0)]);
    assert_eq!(bad, None);
}

#[test]
fn simple_constants_exclude_global_references() {
    assert!(Constant::i32(3).is_simple());
    assert!(Constant::Struct {
        fields: vec![Constant::i32(1), Constant::Zero(Type::I64)],
    }
    .is_simple());
    assert!(!Constant::Global(GlobalId(0)).is_simple());
    assert!(!Constant::gep(Constant::Global(GlobalId(0)), vec![0, 1]).is_simple());
}

#[test]
fn replace_global_rewrites_nested_references() {
    let mut c = Constant::gep(Constant::Global(GlobalId(3)), vec![0, 2]);
    let with = Constant::gep(Constant::Global(GlobalId(7)), vec![0, 0]);
    c.replace_global(GlobalId(3), &with);
    assert!(c.references_global(GlobalId(7)));
    assert!(!c.references_global(GlobalId(3)));
}

fn make_branchy_function() -> Function {
    // entry: v0 = a0 < 4; condbr v0, left, right
    // left:  br join
    // right: br join
    // join:  v1 = phi [left: 1, right: 2]; ret v1
    let mut func = Function::new("branchy", vec![Parameter::new("x", Type::I32)], Type::I32);
    let entry = func.alloc_block();
    let left = func.alloc_block();
    let right = func.alloc_block();
    let join = func.alloc_block();
    func.entry = entry;

    let v0 = func.new_value(Type::I1);
    func.block_mut(entry).insts.push(Inst::ICmp {
        dst: v0,
        op: ICmpOp::Slt,
        lhs: Value::Arg(0),
        rhs: Value::Const(Constant::i32(4)),
    });
    func.block_mut(entry).terminator = Inst::CondBr {
        cond: Value::Inst(v0),
        if_true: left,
        if_false: right,
    };
    func.block_mut(left).terminator = Inst::Br { target: join };
    func.block_mut(right).terminator = Inst::Br { target: join };
    let v1 = func.new_value(Type::I32);
    func.block_mut(join).insts.push(Inst::Phi {
        dst: v1,
        ty: Type::I32,
        incoming: vec![
            (left, Value::Const(Constant::i32(1))),
            (right, Value::Const(Constant::i32(2))),
        ],
    });
    func.block_mut(join).terminator = Inst::Ret {
        value: Some(Value::Inst(v1)),
    };
    func
}

#[test]
fn split_block_rewires_phi_predecessors() {
    let mut func = make_branchy_function();
    let left = BlockId(1);
    let join = BlockId(3);

    let tail = func.split_block_at(left, 0);
    assert!(matches!(func.block(left).terminator, Inst::Placeholder));
    assert!(matches!(func.block(tail).terminator, Inst::Br { target } if target == join));

    let Inst::Phi { incoming, .. } = &func.block(join).insts[0] else {
        panic!("expected phi");
    };
    assert!(incoming.iter().any(|(pred, _)| *pred == tail));
    assert!(incoming.iter().all(|(pred, _)| *pred != left));
}

#[test]
fn replace_uses_covers_terminators() {
    let mut func = make_branchy_function();
    func.replace_uses(&Value::Arg(0), &Value::Const(Constant::i32(9)));
    let Inst::ICmp { lhs, .. } = &func.block(BlockId(0)).insts[0] else {
        panic!("expected icmp");
    };
    assert_eq!(*lhs, Value::Const(Constant::i32(9)));
}

#[test]
fn purge_globals_compacts_and_remaps() {
    let mut module = Module::new("t");
    let dead = module.add_global(GlobalVariable {
        name: "dead".into(),
        ty: Type::I32,
        space: AddressSpace(1),
        init: Some(Constant::Zero(Type::I32)),
        linkage: Linkage::Internal,
        unnamed_addr: false,
    });
    let live = module.add_global(GlobalVariable {
        name: "live".into(),
        ty: Type::I64,
        space: AddressSpace(1),
        init: Some(Constant::Zero(Type::I64)),
        linkage: Linkage::Internal,
        unnamed_addr: false,
    });

    let mut func = Function::new("f", vec![], Type::Void);
    let entry = func.alloc_block();
    func.entry = entry;
    let v0 = func.new_value(Type::I64);
    func.block_mut(entry).insts.push(Inst::Load {
        dst: v0,
        ptr: Value::Const(Constant::Global(live)),
        ty: Type::I64,
    });
    func.block_mut(entry).terminator = Inst::Ret { value: None };
    module.add_function(func);

    module.purge_globals(&std::collections::HashSet::from([dead]));

    assert_eq!(module.globals.len(), 1);
    assert_eq!(module.globals[0].name, "live");
    let Inst::Load { ptr, .. } = &module.functions[0].blocks[0].insts[0] else {
        panic!("expected load");
    };
    assert_eq!(*ptr, Value::Const(Constant::Global(GlobalId(0))));
}

#[test]
fn purge_functions_remaps_calls_and_kernels() {
    let mut module = Module::new("t");
    let husk = module.add_function(Function::new("husk", vec![], Type::Void));
    let mut caller = Function::new("caller", vec![], Type::Void);
    let entry = caller.alloc_block();
    caller.entry = entry;
    let callee = Function::new("callee", vec![], Type::Void);

    let callee_id = FunctionId(2);
    caller.block_mut(entry).insts.push(Inst::Call {
        dst: None,
        callee: callee_id,
        args: vec![],
        arg_attrs: vec![],
    });
    caller.block_mut(entry).terminator = Inst::Ret { value: None };
    let caller_id = module.add_function(caller);
    module.add_function(callee);
    module.kernels.push(caller_id);

    module.purge_functions(&std::collections::HashSet::from([husk]));

    assert_eq!(module.functions.len(), 2);
    let Inst::Call { callee, .. } = &module.functions[0].blocks[0].insts[0] else {
        panic!("expected call");
    };
    assert_eq!(*callee, FunctionId(1));
    assert_eq!(module.kernels, vec![FunctionId(0)]);
}
