//! Pass configuration and the shared context threaded through every phase.
//!
//! All bookkeeping the phases exchange lives here: function and argument
//! mappings, bounds intervals, and the safe-exception set, so no phase needs
//! process-global state.

use std::collections::{HashMap, HashSet};

use crate::ir::{Constant, FunctionId, GlobalId, Value, ValueId};
use crate::target::AddressSpaceMap;

/// Pass options. The (out-of-scope) driver maps its command line onto this.
#[derive(Debug, Clone)]
pub struct ClampConfig {
    /// Permissive mode (`--allow-unsafe-exceptions`): external calls warn
    /// instead of aborting, the entry function keeps its signature, and its
    /// argument-vector uses are exempt from checking.
    pub permissive: bool,
    /// Name of the host entry function exempted in permissive mode. When
    /// unset, the `main` name rule applies as a fallback.
    pub entry_function: Option<String>,
    /// Active address-space numbering table.
    pub address_spaces: AddressSpaceMap,
}

impl Default for ClampConfig {
    fn default() -> Self {
        Self {
            permissive: false,
            entry_function: None,
            address_spaces: AddressSpaceMap::SPIR,
        }
    }
}

impl ClampConfig {
    /// The entry function name permissive mode preserves.
    pub fn entry_name(&self) -> &str {
        self.entry_function.as_deref().unwrap_or("main")
    }
}

/// Phase progression of the module under transformation. Transitions are
/// unidirectional; no phase runs twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Parsed,
    Consolidated,
    SignaturesRewritten,
    BodiesMoved,
    KernelsWrapped,
    BoundsAnalyzed,
    SafetyProven,
    ChecksInjected,
    CallsRewritten,
    BuiltinsRetargeted,
    Done,
}

/// A legal memory range a pointer may respect.
///
/// When `indirect` is set, `low`/`high` are not the bounds themselves but
/// addresses of slots holding them; a check site must load through them
/// first.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundsInterval {
    /// First valid address.
    pub low: Value,
    /// First invalid address.
    pub high: Value,
    pub indirect: bool,
}

impl BoundsInterval {
    pub fn direct(low: Value, high: Value) -> Self {
        Self {
            low,
            high,
            indirect: false,
        }
    }

    pub fn indirect(low: Value, high: Value) -> Self {
        Self {
            low,
            high,
            indirect: true,
        }
    }
}

/// How one original argument lowers into the rewritten signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLowering {
    /// Type unchanged; forwarded directly.
    Same { new_index: u32 },
    /// Pointer converted to a fat-pointer aggregate.
    Fat { new_index: u32 },
    /// One of three manual safe-builtin pointers folded into field `field`
    /// of the fat-pointer parameter at `new_index`.
    FatField { new_index: u32, field: u32 },
}

impl ArgLowering {
    pub fn new_index(&self) -> u32 {
        match self {
            ArgLowering::Same { new_index }
            | ArgLowering::Fat { new_index }
            | ArgLowering::FatField { new_index, .. } => *new_index,
        }
    }
}

/// Bookkeeping for one rewritten function.
#[derive(Debug, Clone)]
pub struct RewrittenFunction {
    pub new_id: FunctionId,
    /// Lowering of each original argument, by original index.
    pub args: Vec<ArgLowering>,
    /// Permissive-mode entry function: the argument shape was preserved and
    /// no leading context parameter was added.
    pub untouched: bool,
}

impl RewrittenFunction {
    /// Whether the twin carries the leading program-allocations parameter.
    pub fn has_ctx_param(&self) -> bool {
        !self.untouched
    }
}

/// Entry-block introductions for one fat-pointer parameter of a twin.
#[derive(Debug, Clone, Copy, Default)]
pub struct FatArgIntro {
    /// Extraction of the working pointer (field 0).
    pub current: Option<ValueId>,
    /// Extraction of the first valid address (field 1).
    pub low: Option<ValueId>,
    /// Extraction of the first invalid address (field 2).
    pub high: Option<ValueId>,
}

/// SSA keys admissible in the safe-exception set. Constant projections are
/// judged structurally at the check site instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafeKey {
    Arg(u32),
    Inst(ValueId),
}

impl SafeKey {
    /// The set key for an operand, if it is an SSA name.
    pub fn of(value: &Value) -> Option<SafeKey> {
        match value {
            Value::Arg(i) => Some(SafeKey::Arg(*i)),
            Value::Inst(id) => Some(SafeKey::Inst(*id)),
            Value::Const(_) => None,
        }
    }
}

/// All state shared between phases.
#[derive(Debug)]
pub struct PassContext {
    pub config: ClampConfig,
    pub phase: Phase,

    /// Old function → its rewritten twin. Frozen after signature rewriting.
    pub rewritten: HashMap<FunctionId, RewrittenFunction>,
    /// Twin → original, for reverse lookups.
    pub twin_of: HashMap<FunctionId, FunctionId>,

    /// Module-lifetime bounds intervals per address-space number.
    pub space_bounds: HashMap<u32, Vec<BoundsInterval>>,
    /// Per-function frame aggregates: (address-space number, interval).
    /// Keyed by the function currently owning the body.
    pub frame_bounds: HashMap<FunctionId, Vec<(u32, BoundsInterval)>>,
    /// Per-function frame aggregate allocations, for safety proofs.
    pub frame_aggregates: HashMap<FunctionId, Vec<ValueId>>,
    /// Direct interval of each named global allocation.
    pub global_bounds: HashMap<GlobalId, BoundsInterval>,
    /// Bounds proven for individual SSA values.
    pub value_bounds: HashMap<(FunctionId, ValueId), BoundsInterval>,

    /// Entry-block fat-pointer argument introductions per (twin, new arg).
    pub fat_args: HashMap<(FunctionId, u32), FatArgIntro>,

    /// Pointer values exempt from checking.
    pub safe_exceptions: HashSet<(FunctionId, SafeKey)>,
    /// Functions synthesized by the pass whose bodies are trusted.
    pub trusted: HashSet<FunctionId>,

    /// Unsafe builtin declaration → safe twin.
    pub safe_builtins: HashMap<FunctionId, FunctionId>,
}

impl PassContext {
    pub fn new(config: ClampConfig) -> Self {
        Self {
            config,
            phase: Phase::Parsed,
            rewritten: HashMap::new(),
            twin_of: HashMap::new(),
            space_bounds: HashMap::new(),
            frame_bounds: HashMap::new(),
            frame_aggregates: HashMap::new(),
            global_bounds: HashMap::new(),
            value_bounds: HashMap::new(),
            fat_args: HashMap::new(),
            safe_exceptions: HashSet::new(),
            trusted: HashSet::new(),
            safe_builtins: HashMap::new(),
        }
    }

    /// Re-keys per-body state from `old` to `new` when a body transplants
    /// between functions. SSA names survive the move unchanged, so only the
    /// function key changes.
    pub fn migrate_body_state(&mut self, old: FunctionId, new: FunctionId) {
        if let Some(frame) = self.frame_bounds.remove(&old) {
            self.frame_bounds.insert(new, frame);
        }
        if let Some(agg) = self.frame_aggregates.remove(&old) {
            self.frame_aggregates.insert(new, agg);
        }
        let moved: Vec<(ValueId, BoundsInterval)> = self
            .value_bounds
            .iter()
            .filter(|((f, _), _)| *f == old)
            .map(|((_, v), b)| (*v, b.clone()))
            .collect();
        for (value, interval) in moved {
            self.value_bounds.remove(&(old, value));
            self.value_bounds.insert((new, value), interval);
        }
    }

    /// All candidate intervals for a pointer of `space` inside `func`:
    /// module-lifetime intervals plus the function's own frame interval.
    pub fn interval_candidates(&self, func: FunctionId, space: u32) -> Vec<BoundsInterval> {
        let mut candidates: Vec<BoundsInterval> = self
            .space_bounds
            .get(&space)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        if let Some(frames) = self.frame_bounds.get(&func) {
            for (frame_space, interval) in frames {
                if *frame_space == space {
                    candidates.push(interval.clone());
                }
            }
        }
        candidates
    }

    pub fn add_space_bound(&mut self, space: u32, interval: BoundsInterval) {
        self.space_bounds.entry(space).or_default().push(interval);
    }

    /// Interval of a constant address, resolved through the allocation it
    /// projects from.
    pub fn constant_interval(&self, c: &Constant) -> Option<BoundsInterval> {
        match c {
            Constant::Global(g) => self.global_bounds.get(g).cloned(),
            Constant::Gep { base, .. } => self.constant_interval(base),
            _ => None,
        }
    }

    pub fn is_safe_exception(&self, func: FunctionId, value: &Value) -> bool {
        SafeKey::of(value)
            .map(|key| self.safe_exceptions.contains(&(func, key)))
            .unwrap_or(false)
    }

    pub fn mark_safe(&mut self, func: FunctionId, value: &Value) -> bool {
        match SafeKey::of(value) {
            Some(key) => self.safe_exceptions.insert((func, key)),
            None => false,
        }
    }
}
