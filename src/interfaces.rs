//! External interfaces the core consumes (§6): the program representation,
//! the type oracle, and the class hierarchy. The core is generic/dyn over
//! these traits — it never parses a Dex container or decompiles an
//! instruction itself; a surrounding loader hands it a closed, already
//! resolved view.

use crate::interning::{FieldId, MethodId};
use std::collections::HashMap;

/// One opcode-tagged instruction inside a method's control-flow graph
/// (§4.6). `id` is unique within the enclosing method and is what the
/// memory model mints `MemoryLocation::Instruction(id)` from.
#[derive(Clone, Debug)]
pub struct Instruction {
    pub id: u32,
    pub op: Opcode,
}

/// The per-instruction transfer functions in §4.6 dispatch on this.
/// Registers are small dense integers local to one method, consistent
/// with how a Dex method's register file is addressed.
#[derive(Clone, Debug)]
pub enum Opcode {
    LoadParam { register: u32, parameter: u32 },
    Move { dest: u32, src: u32 },
    MoveResult { dest: u32 },
    CheckCast { dest: u32, src: u32, target_type: String },
    IGet { dest: u32, receiver: u32, field: FieldId },
    SGet { dest: u32, field: FieldId },
    IPut { src: u32, receiver: u32, field: FieldId },
    SPut { src: u32, field: FieldId },
    NewArray { dest: u32, size_register: Option<u32> },
    FilledNewArray { dest: u32, elements: Vec<u32> },
    AGet { dest: u32, array: u32, index: u32 },
    APut { src: u32, array: u32, index: u32 },
    Invoke {
        callee: MethodId,
        is_static: bool,
        /// Argument registers in declared parameter order; for an
        /// instance call, index 0 is the receiver.
        arguments: Vec<u32>,
        /// Register the result is later read from via `MoveResult`, if any.
        result_register: Option<u32>,
    },
    Return { register: Option<u32> },
    /// Control-flow-only instruction; the transfer functions skip it, it
    /// exists so a loader can represent an explicit branch/goto/switch
    /// target without inventing a synthetic data instruction for it.
    Nop,
}

/// One basic block: a straight-line run of instructions with no internal
/// control flow. Blocks are connected by [`ControlFlowGraph::edges`].
#[derive(Clone, Debug, Default)]
pub struct BasicBlock {
    pub instructions: Vec<Instruction>,
}

/// A method body as a graph of basic blocks (§6 `get_code() -> optional
/// CFG`). Block indices are positions into `blocks`.
#[derive(Clone, Debug, Default)]
pub struct ControlFlowGraph {
    pub blocks: Vec<BasicBlock>,
    pub edges: Vec<(usize, usize)>,
    pub entry: usize,
    pub exits: Vec<usize>,
}

impl ControlFlowGraph {
    pub fn successors(&self, block: usize) -> impl Iterator<Item = usize> + '_ {
        self.edges.iter().filter(move |(from, _)| *from == block).map(|(_, to)| *to)
    }

    pub fn predecessors(&self, block: usize) -> impl Iterator<Item = usize> + '_ {
        self.edges.iter().filter(move |(_, to)| *to == block).map(|(from, _)| *from)
    }

    /// Blocks in reverse-postorder, a traversal order under which every
    /// block (loop headers aside) is visited after all of its non-back-edge
    /// predecessors — the standard iteration order for a forward dataflow
    /// fixpoint over a CFG.
    pub fn reverse_postorder(&self) -> Vec<usize> {
        let mut visited = vec![false; self.blocks.len()];
        let mut postorder = Vec::with_capacity(self.blocks.len());
        let mut stack = vec![(self.entry, false)];
        while let Some((block, expanded)) = stack.pop() {
            if expanded {
                postorder.push(block);
                continue;
            }
            if visited[block] {
                continue;
            }
            visited[block] = true;
            stack.push((block, true));
            for succ in self.successors(block) {
                if !visited[succ] {
                    stack.push((succ, false));
                }
            }
        }
        postorder.reverse();
        postorder
    }
}

/// The frozen program representation the core is built against (§6).
/// Implemented by whatever Dex/bytecode loader sits in front of the core;
/// the core only ever reads through this trait.
pub trait ProgramView: Send + Sync {
    fn parameter_type(&self, method: MethodId, index: u32) -> Option<String>;
    fn get_class(&self, method: MethodId) -> Option<String>;
    fn signature(&self, method: MethodId) -> String;
    fn returns_void(&self, method: MethodId) -> bool;
    fn get_code(&self, method: MethodId) -> Option<&ControlFlowGraph>;
    fn is_static(&self, method: MethodId) -> bool;
    fn is_constructor(&self, method: MethodId) -> bool;
    fn is_native(&self, method: MethodId) -> bool;
    fn parameter_count(&self, method: MethodId) -> u32;
    /// Every method the callgraph/fixpoint should consider reachable.
    /// Ambient addition: the distilled spec takes "for every reachable
    /// method" as given; a standalone crate needs a way to enumerate them.
    fn methods(&self) -> Vec<MethodId>;
}

/// A caller-local snapshot of register types, used only by the call graph
/// to specialize a virtual callsite or detect an anonymous-class argument
/// (§4.5, §6). Opaque to the fixpoint.
pub type TypeEnvironment = HashMap<u32, String>;

/// The whole-program type-inference oracle the call graph consults to
/// resolve virtual dispatch (§6). The fixpoint itself never calls this —
/// only [`crate::callgraph::CallGraph::build`] does.
pub trait TypeOracle: Send + Sync {
    fn receiver_type(&self, caller: MethodId, instruction: u32) -> Option<String>;
    fn register_type(&self, caller: MethodId, instruction: u32, register: u32) -> Option<String>;
    fn register_const_class_type(&self, caller: MethodId, instruction: u32, register: u32) -> Option<String>;
    fn environment(&self, caller: MethodId, instruction: u32) -> TypeEnvironment;
}

/// `extends(type) -> set<type>` (§6): every type that extends or
/// implements `type`, used to filter an override set down to what a
/// receiver's static type can actually reach.
pub trait ClassHierarchy: Send + Sync {
    fn extends(&self, class: &str) -> std::collections::HashSet<String>;

    /// Direct overrides of `method` declared on any subclass of its
    /// declaring class. The call graph intersects this with `extends` at
    /// each callsite's receiver type.
    fn overrides(&self, method: MethodId) -> Vec<MethodId>;
}

/// The fixpoint's view of wherever per-method [`crate::model::Model`]s are
/// kept (§4.6, §6). A `dashmap`-backed default lives in
/// [`crate::fixpoint::DefaultModelRegistry`]; this trait exists so the
/// scheduler isn't hard-wired to one storage strategy.
pub trait ModelRegistry: Send + Sync {
    fn get(&self, method: MethodId) -> crate::model::Model;

    /// Joins `updates` into the stored model for `method`. Returns whether
    /// anything actually grew, which the scheduler uses to decide whether
    /// `method`'s callers need to be rescheduled.
    fn join_with(&self, method: MethodId, updates: crate::model::Model) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(instructions: Vec<Instruction>) -> BasicBlock {
        BasicBlock { instructions }
    }

    #[test]
    fn reverse_postorder_visits_entry_first() {
        let cfg = ControlFlowGraph {
            blocks: vec![block(vec![]), block(vec![]), block(vec![])],
            edges: vec![(0, 1), (1, 2)],
            entry: 0,
            exits: vec![2],
        };
        let order = cfg.reverse_postorder();
        assert_eq!(order.first(), Some(&0));
        assert_eq!(order.last(), Some(&2));
    }

    #[test]
    fn reverse_postorder_handles_a_loop_back_edge() {
        let cfg = ControlFlowGraph {
            blocks: vec![block(vec![]), block(vec![]), block(vec![])],
            edges: vec![(0, 1), (1, 2), (2, 1)],
            entry: 0,
            exits: vec![2],
        };
        let order = cfg.reverse_postorder();
        assert_eq!(order.len(), 3);
        assert_eq!(order[0], 0);
    }
}
