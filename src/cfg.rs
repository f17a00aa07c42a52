//! Control-flow graph construction.
//!
//! A thin predecessor/successor view over a function, rebuilt on demand.
//! The pass pipeline itself only splices straight-line guards, but the test
//! suite uses the CFG to verify that every guard is wired the way the check
//! generator promises.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::ir::{BlockId, Function};

/// Control-flow graph of a single function.
#[derive(Debug)]
pub struct CFG {
    pub entry: BlockId,
    /// Predecessors for each block.
    pub predecessors: HashMap<BlockId, Vec<BlockId>>,
    /// Successors for each block, computed from terminators.
    pub successors: HashMap<BlockId, Vec<BlockId>>,
}

impl CFG {
    pub fn build(func: &Function) -> CFG {
        let mut predecessors: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        let mut successors: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        for block in &func.blocks {
            predecessors.entry(block.id).or_default();
            let succs = block.terminator.successors();
            for succ in &succs {
                predecessors.entry(*succ).or_default().push(block.id);
            }
            successors.insert(block.id, succs);
        }
        CFG {
            entry: func.entry,
            predecessors,
            successors,
        }
    }

    /// Blocks reachable from the entry.
    pub fn reachable(&self) -> HashSet<BlockId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([self.entry]);
        while let Some(block) = queue.pop_front() {
            if !seen.insert(block) {
                continue;
            }
            if let Some(succs) = self.successors.get(&block) {
                queue.extend(succs.iter().copied());
            }
        }
        seen
    }
}
