//! Typed SSA intermediate representation.
//!
//! The IR mirrors what the external parser produces: a module owning global
//! variables and functions, functions owning basic blocks of instructions,
//! and a structural type system in which pointer types carry their pointee
//! and an address-space number. Instructions form a tagged sum so that every
//! pass dispatches by exhaustive matching; constructs the pass cannot handle
//! are still representable (`Inst::Unsupported`) and rejected at run time.
//!
//! Values are SSA names: every value-producing instruction writes a fresh
//! `ValueId`, and operands refer to instruction results, function arguments,
//! or constants. The module owns everything; passes hold ids.

use std::fmt;

mod function_impl;
mod inst_impl;

/// SSA name for an instruction result. Function-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Basic block identifier. Function-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Function identifier within a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn{}", self.0)
    }
}

/// Global variable identifier within a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalId(pub u32);

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Raw address-space number carried by pointer types.
///
/// The meaning of each number is a target convention; see
/// [`crate::target::AddressSpaceMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressSpace(pub u32);

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as{}", self.0)
    }
}

/// Structural types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    I1,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Vector { elem: Box<Type>, len: u32 },
    Array { elem: Box<Type>, len: u64 },
    Struct { fields: Vec<Type> },
    Ptr { pointee: Box<Type>, space: AddressSpace },
}

impl Type {
    /// Wraps `self` in a pointer type of the given address space.
    pub fn ptr_to(self, space: AddressSpace) -> Type {
        Type::Ptr {
            pointee: Box::new(self),
            space,
        }
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Ptr { .. })
    }

    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Ptr { pointee, .. } => Some(pointee),
            _ => None,
        }
    }

    pub fn address_space(&self) -> Option<AddressSpace> {
        match self {
            Type::Ptr { space, .. } => Some(*space),
            _ => None,
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Type::Struct { .. } | Type::Array { .. })
    }

    /// Size in bytes, without struct padding. Pointers are 8 bytes.
    pub fn size(&self) -> u64 {
        match self {
            Type::Void => 0,
            Type::I1 | Type::I8 => 1,
            Type::I16 => 2,
            Type::I32 | Type::F32 => 4,
            Type::I64 | Type::F64 | Type::Ptr { .. } => 8,
            Type::Vector { elem, len } => elem.size() * u64::from(*len),
            Type::Array { elem, len } => elem.size() * len,
            Type::Struct { fields } => fields.iter().map(Type::size).sum(),
        }
    }
}

/// The by-value fat-pointer aggregate used wherever a pointer crosses a
/// function boundary: `{ current, low, high }`, three pointers of the same
/// pointee type. `high` is the first invalid address.
pub fn fat_pointer_type(ptr: &Type) -> Type {
    debug_assert!(ptr.is_pointer(), "fat pointers wrap pointer types");
    Type::Struct {
        fields: vec![ptr.clone(), ptr.clone(), ptr.clone()],
    }
}

/// Field index of the working pointer inside a fat pointer.
pub const FAT_CURRENT: u32 = 0;
/// Field index of the first valid address inside a fat pointer.
pub const FAT_LOW: u32 = 1;
/// Field index of the first invalid address inside a fat pointer.
pub const FAT_HIGH: u32 = 2;

/// Result type of address arithmetic with constant indices, or `None` if the
/// index path does not fit `base`.
pub fn const_gep_type(base: &Type, indices: &[i64]) -> Option<Type> {
    let Type::Ptr { pointee, space } = base else {
        return None;
    };
    if indices.is_empty() {
        return None;
    }
    let mut cur = pointee.as_ref().clone();
    for &idx in &indices[1..] {
        cur = match cur {
            Type::Struct { fields } => fields.get(usize::try_from(idx).ok()?)?.clone(),
            Type::Array { elem, .. } => *elem,
            Type::Vector { elem, .. } => *elem,
            _ => return None,
        };
    }
    Some(cur.ptr_to(*space))
}

/// Result type of an address-arithmetic instruction, or `None` if the index
/// path does not fit `base`. Struct descent requires constant indices.
pub fn gep_type(base: &Type, indices: &[Value]) -> Option<Type> {
    let Type::Ptr { pointee, space } = base else {
        return None;
    };
    if indices.is_empty() {
        return None;
    }
    let mut cur = pointee.as_ref().clone();
    for idx in &indices[1..] {
        cur = match cur {
            Type::Struct { fields } => {
                let Value::Const(Constant::Int { value, .. }) = idx else {
                    return None;
                };
                fields.get(usize::try_from(*value).ok()?)?.clone()
            }
            Type::Array { elem, .. } => *elem,
            Type::Vector { elem, .. } => *elem,
            _ => return None,
        };
    }
    Some(cur.ptr_to(*space))
}

/// Constants, including constant address projections.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// Null pointer of the given pointer type.
    Null(Type),
    Int { ty: Type, value: i64 },
    Float { ty: Type, value: f64 },
    /// Zero initializer of any type.
    Zero(Type),
    Struct { fields: Vec<Constant> },
    Array { elem: Type, elems: Vec<Constant> },
    /// Address of a global variable.
    Global(GlobalId),
    /// Constant in-bounds projection of another constant address.
    Gep { base: Box<Constant>, indices: Vec<i64> },
}

impl Constant {
    pub fn i32(value: i64) -> Constant {
        Constant::Int {
            ty: Type::I32,
            value,
        }
    }

    /// Constant field projection `&base[idx0].idx1...`.
    pub fn gep(base: Constant, indices: Vec<i64>) -> Constant {
        Constant::Gep {
            base: Box::new(base),
            indices,
        }
    }

    pub fn ty(&self, module: &Module) -> Type {
        match self {
            Constant::Null(ty) | Constant::Zero(ty) => ty.clone(),
            Constant::Int { ty, .. } | Constant::Float { ty, .. } => ty.clone(),
            Constant::Struct { fields } => Type::Struct {
                fields: fields.iter().map(|c| c.ty(module)).collect(),
            },
            Constant::Array { elem, elems } => Type::Array {
                elem: Box::new(elem.clone()),
                len: elems.len() as u64,
            },
            Constant::Global(id) => module.global(*id).ptr_ty(),
            Constant::Gep { base, indices } => {
                let base_ty = base.ty(module);
                const_gep_type(&base_ty, indices)
                    .unwrap_or_else(|| panic!("malformed constant gep over {base_ty:?}"))
            }
        }
    }

    /// "Simple" constants contain no global references: null, integers,
    /// floats, zero initializers, and aggregates thereof.
    pub fn is_simple(&self) -> bool {
        match self {
            Constant::Null(_)
            | Constant::Int { .. }
            | Constant::Float { .. }
            | Constant::Zero(_) => true,
            Constant::Struct { fields } => fields.iter().all(Constant::is_simple),
            Constant::Array { elems, .. } => elems.iter().all(Constant::is_simple),
            Constant::Global(_) | Constant::Gep { .. } => false,
        }
    }

    /// Visits every global reference inside this constant.
    pub fn visit_globals_mut(&mut self, f: &mut impl FnMut(&mut GlobalId)) {
        match self {
            Constant::Global(id) => f(id),
            Constant::Gep { base, .. } => base.visit_globals_mut(f),
            Constant::Struct { fields } => {
                for field in fields {
                    field.visit_globals_mut(f);
                }
            }
            Constant::Array { elems, .. } => {
                for elem in elems {
                    elem.visit_globals_mut(f);
                }
            }
            _ => {}
        }
    }

    /// Replaces every reference to `target` with a copy of `with`.
    pub fn replace_global(&mut self, target: GlobalId, with: &Constant) {
        match self {
            Constant::Global(id) if *id == target => *self = with.clone(),
            Constant::Gep { base, .. } => base.replace_global(target, with),
            Constant::Struct { fields } => {
                for field in fields {
                    field.replace_global(target, with);
                }
            }
            Constant::Array { elems, .. } => {
                for elem in elems {
                    elem.replace_global(target, with);
                }
            }
            _ => {}
        }
    }

    pub fn references_global(&self, target: GlobalId) -> bool {
        match self {
            Constant::Global(id) => *id == target,
            Constant::Gep { base, .. } => base.references_global(target),
            Constant::Struct { fields } => fields.iter().any(|c| c.references_global(target)),
            Constant::Array { elems, .. } => elems.iter().any(|c| c.references_global(target)),
            _ => false,
        }
    }
}

/// Instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Function argument by index.
    Arg(u32),
    /// Result of an instruction.
    Inst(ValueId),
    Const(Constant),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Arg(i) => write!(f, "a{i}"),
            Value::Inst(id) => write!(f, "{id}"),
            Value::Const(_) => write!(f, "const"),
        }
    }
}

/// Integer comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ICmpOp {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

/// Float comparison predicates (ordered subset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FCmpOp {
    Oeq,
    One,
    Olt,
    Ole,
    Ogt,
    Oge,
}

/// Binary operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    FAdd,
    FSub,
    FMul,
    FDiv,
}

/// Cast kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastKind {
    Bitcast,
    AddrSpaceCast,
    Trunc,
    ZExt,
    SExt,
    PtrToInt,
    IntToPtr,
}

/// Bulk memory intrinsic kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemIntrinsicKind {
    Copy,
    Move,
    Set,
}

/// Instructions the pass refuses to transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnsupportedKind {
    Fence,
    VaArg,
    AtomicRmw,
    AtomicCmpXchg,
}

impl fmt::Display for UnsupportedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnsupportedKind::Fence => "fence",
            UnsupportedKind::VaArg => "va_arg",
            UnsupportedKind::AtomicRmw => "atomic rmw",
            UnsupportedKind::AtomicCmpXchg => "atomic cmpxchg",
        };
        write!(f, "{s}")
    }
}

/// An instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    /// Stack allocation. Must appear in the entry block.
    Alloca {
        dst: ValueId,
        allocated: Type,
        space: AddressSpace,
    },

    Load {
        dst: ValueId,
        ptr: Value,
        ty: Type,
    },

    Store {
        ptr: Value,
        value: Value,
        ty: Type,
    },

    /// Address arithmetic (get-element-pointer).
    Gep {
        dst: ValueId,
        base: Value,
        indices: Vec<Value>,
        inbounds: bool,
    },

    ExtractValue {
        dst: ValueId,
        agg: Value,
        indices: Vec<u32>,
    },

    InsertValue {
        dst: ValueId,
        agg: Value,
        value: Value,
        indices: Vec<u32>,
    },

    Cast {
        dst: ValueId,
        kind: CastKind,
        value: Value,
        ty: Type,
    },

    BinOp {
        dst: ValueId,
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },

    ICmp {
        dst: ValueId,
        op: ICmpOp,
        lhs: Value,
        rhs: Value,
    },

    FCmp {
        dst: ValueId,
        op: FCmpOp,
        lhs: Value,
        rhs: Value,
    },

    /// SSA merge. Must appear before any non-phi instruction in its block.
    Phi {
        dst: ValueId,
        ty: Type,
        incoming: Vec<(BlockId, Value)>,
    },

    Call {
        dst: Option<ValueId>,
        callee: FunctionId,
        args: Vec<Value>,
        /// Call-site parameter attributes, one per argument.
        arg_attrs: Vec<ParamAttrs>,
    },

    /// Bulk copy/set intrinsic.
    MemIntrinsic {
        kind: MemIntrinsicKind,
        dst: Value,
        src: Value,
        len: Value,
        align: u32,
    },

    /// Construct the pass aborts on.
    Unsupported { kind: UnsupportedKind },

    // -- Terminators --
    Br { target: BlockId },

    CondBr {
        cond: Value,
        if_true: BlockId,
        if_false: BlockId,
    },

    Ret { value: Option<Value> },

    /// Stand-in terminator during block surgery. Never valid in a finished
    /// module.
    Placeholder,
}

/// A basic block: straight-line instructions plus one terminator.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    pub id: BlockId,
    pub insts: Vec<Inst>,
    pub terminator: Inst,
}

/// Parameter attributes relevant to the pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParamAttrs {
    /// The argument is a pointer to a by-value-copied aggregate.
    pub by_value: bool,
    /// The callee does not capture the pointer.
    pub no_capture: bool,
}

/// A function parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub ty: Type,
    pub attrs: ParamAttrs,
}

impl Parameter {
    pub fn new(name: impl Into<String>, ty: Type) -> Parameter {
        Parameter {
            name: name.into(),
            ty,
            attrs: ParamAttrs::default(),
        }
    }
}

/// Linkage kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Linkage {
    External,
    Internal,
    Private,
}

/// A function definition or declaration (no blocks).
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Parameter>,
    pub ret: Type,
    pub is_vararg: bool,
    pub linkage: Linkage,
    /// Basic blocks; empty for declarations. The entry block is `entry`.
    pub blocks: Vec<BasicBlock>,
    pub entry: BlockId,
    /// Types of instruction results, indexed by `ValueId`.
    pub(crate) value_types: Vec<Type>,
}

/// A global variable: a named allocation in some address space.
#[derive(Debug, Clone)]
pub struct GlobalVariable {
    pub name: String,
    /// Type of the allocated value (not the pointer).
    pub ty: Type,
    pub space: AddressSpace,
    pub init: Option<Constant>,
    pub linkage: Linkage,
    /// The address of the global is never observed; such globals cannot be
    /// referenced relatively and are left alone by consolidation.
    pub unnamed_addr: bool,
}

impl GlobalVariable {
    pub fn is_declaration(&self) -> bool {
        self.init.is_none() && self.linkage == Linkage::External
    }

    /// Type of the global's address.
    pub fn ptr_ty(&self) -> Type {
        self.ty.clone().ptr_to(self.space)
    }
}

/// Top-level IR container. Owns all globals and functions.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    pub globals: Vec<GlobalVariable>,
    pub functions: Vec<Function>,
    /// Kernel entry points, in metadata order (the `opencl.kernels` named
    /// metadata node, operand 0 of each entry).
    pub kernels: Vec<FunctionId>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Module {
        Module {
            name: name.into(),
            ..Module::default()
        }
    }

    pub fn add_function(&mut self, func: Function) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(func);
        id
    }

    pub fn add_global(&mut self, global: GlobalVariable) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(global);
        id
    }

    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn function_mut(&mut self, id: FunctionId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn global(&self, id: GlobalId) -> &GlobalVariable {
        &self.globals[id.0 as usize]
    }

    pub fn global_mut(&mut self, id: GlobalId) -> &mut GlobalVariable {
        &mut self.globals[id.0 as usize]
    }

    pub fn function_ids(&self) -> impl Iterator<Item = FunctionId> {
        (0..self.functions.len() as u32).map(FunctionId)
    }

    pub fn global_ids(&self) -> impl Iterator<Item = GlobalId> {
        (0..self.globals.len() as u32).map(GlobalId)
    }

    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.function_ids().find(|id| self.function(*id).name == name)
    }

    /// Drops the globals in `dead` and compacts ids, rewriting every
    /// remaining reference. Callers must have rewritten all uses of the dead
    /// globals first.
    pub fn purge_globals(&mut self, dead: &std::collections::HashSet<GlobalId>) {
        let mut remap = Vec::with_capacity(self.globals.len());
        let mut next = 0u32;
        for id in 0..self.globals.len() as u32 {
            if dead.contains(&GlobalId(id)) {
                remap.push(None);
            } else {
                remap.push(Some(GlobalId(next)));
                next += 1;
            }
        }
        let mut idx = 0;
        self.globals.retain(|_| {
            let keep = remap[idx].is_some();
            idx += 1;
            keep
        });
        let mut rewrite = |id: &mut GlobalId| {
            let new = remap[id.0 as usize]
                .unwrap_or_else(|| panic!("purged global {} is still referenced", id.0));
            *id = new;
        };
        for global in &mut self.globals {
            if let Some(init) = &mut global.init {
                init.visit_globals_mut(&mut rewrite);
            }
        }
        for func in &mut self.functions {
            func.visit_values_mut(|value| {
                if let Value::Const(c) = value {
                    c.visit_globals_mut(&mut rewrite);
                }
            });
        }
    }

    /// Drops the functions in `dead` and compacts ids, rewriting call sites
    /// and the kernel metadata list.
    pub fn purge_functions(&mut self, dead: &std::collections::HashSet<FunctionId>) {
        let mut remap = Vec::with_capacity(self.functions.len());
        let mut next = 0u32;
        for id in 0..self.functions.len() as u32 {
            if dead.contains(&FunctionId(id)) {
                remap.push(None);
            } else {
                remap.push(Some(FunctionId(next)));
                next += 1;
            }
        }
        let mut idx = 0;
        self.functions.retain(|_| {
            let keep = remap[idx].is_some();
            idx += 1;
            keep
        });
        let rewrite = |id: FunctionId| {
            remap[id.0 as usize]
                .unwrap_or_else(|| panic!("purged function {id} is still referenced"))
        };
        for func in &mut self.functions {
            for block in &mut func.blocks {
                for inst in block.insts.iter_mut().chain(Some(&mut block.terminator)) {
                    if let Inst::Call { callee, .. } = inst {
                        *callee = rewrite(*callee);
                    }
                }
            }
        }
        for kernel in &mut self.kernels {
            *kernel = rewrite(*kernel);
        }
    }
}

#[cfg(test)]
mod tests;
