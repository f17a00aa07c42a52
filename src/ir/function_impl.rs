use super::*;

impl BasicBlock {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            insts: Vec::new(),
            terminator: Inst::Placeholder, // must be replaced with a real terminator
        }
    }
}

impl Function {
    /// Create a function definition with no blocks yet.
    pub fn new(name: impl Into<String>, params: Vec<Parameter>, ret: Type) -> Self {
        Self {
            name: name.into(),
            params,
            ret,
            is_vararg: false,
            linkage: Linkage::External,
            blocks: Vec::new(),
            entry: BlockId(0),
            value_types: Vec::new(),
        }
    }

    /// Create an external declaration.
    pub fn declaration(name: impl Into<String>, params: Vec<Parameter>, ret: Type) -> Self {
        Self::new(name, params, ret)
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Allocate a fresh SSA name of the given result type.
    pub fn new_value(&mut self, ty: Type) -> ValueId {
        let id = ValueId(self.value_types.len() as u32);
        self.value_types.push(ty);
        id
    }

    /// Result type of an instruction value.
    pub fn value_type(&self, id: ValueId) -> &Type {
        &self.value_types[id.0 as usize]
    }

    /// Type of any operand.
    pub fn value_ty(&self, module: &Module, value: &Value) -> Type {
        match value {
            Value::Arg(i) => self.params[*i as usize].ty.clone(),
            Value::Inst(id) => self.value_type(*id).clone(),
            Value::Const(c) => c.ty(module),
        }
    }

    /// Allocate a new basic block.
    pub fn alloc_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(id));
        id
    }

    /// Get a reference to a block.
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        let idx = id.0 as usize;
        if let Some(block) = self.blocks.get(idx) {
            if block.id == id {
                return block;
            }
        }
        self.blocks
            .iter()
            .find(|b| b.id == id)
            .unwrap_or_else(|| panic!("block {id} not found in `{}`", self.name))
    }

    /// Get a mutable reference to a block.
    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        let idx = id.0 as usize;
        let fast_path = self.blocks.get(idx).is_some_and(|b| b.id == id);
        if fast_path {
            return &mut self.blocks[idx];
        }
        let name = self.name.clone();
        self.blocks
            .iter_mut()
            .find(|b| b.id == id)
            .unwrap_or_else(|| panic!("block {id} not found in `{name}`"))
    }

    pub fn has_block(&self, id: BlockId) -> bool {
        self.blocks.iter().any(|b| b.id == id)
    }

    /// Visit every operand of every instruction, terminators included.
    pub fn visit_values_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        for block in &mut self.blocks {
            for inst in block.insts.iter_mut().chain(Some(&mut block.terminator)) {
                inst.visit_values_mut(&mut f);
            }
        }
    }

    /// Replace every use of `from` with `to` across the whole body.
    pub fn replace_uses(&mut self, from: &Value, to: &Value) {
        self.visit_values_mut(|value| {
            if value == from {
                *value = to.clone();
            }
        });
    }

    /// Map of every SSA name to the block and instruction index defining it.
    pub fn def_sites(&self) -> std::collections::HashMap<ValueId, (BlockId, usize)> {
        let mut defs = std::collections::HashMap::new();
        for block in &self.blocks {
            for (idx, inst) in block.insts.iter().enumerate() {
                if let Some(dst) = inst.def() {
                    defs.insert(dst, (block.id, idx));
                }
            }
        }
        defs
    }

    /// Split `block` before instruction `at`: the tail `[at..]` and the
    /// terminator move to a fresh block, `block` is left with a placeholder
    /// terminator, and phi predecessors in the moved terminator's successors
    /// are rewired to the new block.
    pub fn split_block_at(&mut self, block: BlockId, at: usize) -> BlockId {
        let (old_term, tail) = {
            let b = self.block_mut(block);
            let tail = b.insts.split_off(at);
            let term = std::mem::replace(&mut b.terminator, Inst::Placeholder);
            (term, tail)
        };
        let successors = old_term.successors();
        let cont = self.alloc_block();
        {
            let cont_block = self.block_mut(cont);
            cont_block.insts = tail;
            cont_block.terminator = old_term;
        }
        for succ in successors {
            let succ_block = self.block_mut(succ);
            for inst in &mut succ_block.insts {
                if let Inst::Phi { incoming, .. } = inst {
                    for (pred, _) in incoming {
                        if *pred == block {
                            *pred = cont;
                        }
                    }
                }
            }
        }
        cont
    }

    /// Transplant the body (blocks and the SSA value table) out of this
    /// function, leaving a declaration behind.
    pub fn take_body(&mut self) -> (Vec<BasicBlock>, BlockId, Vec<Type>) {
        let blocks = std::mem::take(&mut self.blocks);
        let types = std::mem::take(&mut self.value_types);
        (blocks, self.entry, types)
    }

    /// Install a transplanted body.
    pub fn install_body(&mut self, blocks: Vec<BasicBlock>, entry: BlockId, types: Vec<Type>) {
        debug_assert!(self.blocks.is_empty(), "installing a body over an existing one");
        self.blocks = blocks;
        self.entry = entry;
        self.value_types = types;
    }
}
