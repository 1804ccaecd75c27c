/// Module for recovering the Control Flow Graph (CFG) of EVM bytecode.
///
/// The CFG partitions the instruction stream into basic blocks and connects them with edges
/// that are keyed by function: the dispatcher and the functions it selects share physical
/// blocks, so the same block can have different successors depending on which function is
/// being analysed. Indirect jump targets are resolved per function by the stack value
/// analysis in [`value_analysis`].
///
/// The same graph is later rewritten in place by the patcher; every instruction keeps its
/// decoded address in [`Pc::original`](crate::decoder::Pc) so blocks can still be found after
/// their current addresses have moved.
use crate::decoder::Instruction;
use crate::opcode::Opcode;
use bitvec::vec::BitVec;
use indexmap::IndexMap;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

pub use self::builder::build_cfg;
pub use self::value_analysis::StackValueAnalysis;

mod builder;
mod edges;
pub mod known_hashes;
pub mod value_analysis;

/// Knobs of the CFG recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Bound abstract value sets by the number of JUMPDESTs and drop non-JUMPDEST values.
    pub optimization: bool,
    /// Fall back to a syntactic replay of the jump block when the lattice loses the target.
    pub symbolic_stack_analysis: bool,
    /// Maximum number of worklist explorations per function.
    pub max_iterations: usize,
    /// Maximum number of times a single block is re-analysed.
    pub max_exploration: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            optimization: true,
            symbolic_stack_analysis: true,
            max_iterations: 1000,
            max_exploration: 100,
        }
    }
}

/// Identifies the function an edge or reachability mark belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FunctionKey {
    /// The selector-matching prologue starting at pc 0.
    Dispatcher,
    /// The function entered when calldata is shorter than a selector.
    Fallback,
    /// A function selected by its 4-byte selector. `occurrence` tells apart several entry
    /// points guarded by the same selector.
    Selector {
        /// The 4-byte selector.
        selector: u32,
        /// How many functions with the same selector were discovered before this one.
        occurrence: u32,
    },
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatcher => f.write_str("_dispatcher"),
            Self::Fallback => f.write_str("_fallback"),
            Self::Selector {
                selector,
                occurrence: 0,
            } => write!(f, "0x{selector:08x}"),
            Self::Selector {
                selector,
                occurrence,
            } => write!(f, "0x{selector:08x}#{occurrence}"),
        }
    }
}

/// Represents the type of edge connecting blocks in the CFG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Sequential execution into the JUMPDEST that follows a non-terminating block.
    Fallthrough,
    /// Resolved target of a `JUMP`.
    Jump,
    /// Resolved target of a `JUMPI`.
    BranchTrue,
    /// The instruction after a `JUMPI`.
    BranchFalse,
}

/// An edge of the CFG, valid for one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Function the edge was discovered for.
    pub key: FunctionKey,
    /// How control reaches the target.
    pub kind: EdgeKind,
}

/// A maximal straight-line instruction sequence.
///
/// Blocks start at pc 0, at every `JUMPDEST`, and after every terminator. A block is never
/// empty and holds at most one terminator, always last.
#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    /// The instructions of the block, in address order.
    pub instructions: Vec<Instruction>,
    /// Functions whose analysis reached this block.
    pub reachable: Vec<FunctionKey>,
}

impl BasicBlock {
    /// Current PC of the first instruction.
    pub fn start_pc(&self) -> usize {
        self.instructions.first().map_or(0, |ins| ins.pc.current)
    }

    /// Current PC of the last instruction.
    pub fn end_pc(&self) -> usize {
        self.instructions.last().map_or(0, |ins| ins.pc.current)
    }

    /// The last instruction.
    pub fn end(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    /// Opcode of the last instruction.
    pub fn end_opcode(&self) -> Option<Opcode> {
        self.end().map(|ins| ins.opcode)
    }

    /// Returns `true` if the block ends with `opcode`.
    pub fn ends_with(&self, opcode: Opcode) -> bool {
        self.end_opcode() == Some(opcode)
    }

    /// Returns `true` if the block ends with `JUMP` or `JUMPI`.
    pub fn ends_with_jump(&self) -> bool {
        self.end_opcode().is_some_and(|op| op.is_jump())
    }

    /// Returns `true` if any instruction of the block is `opcode`.
    pub fn contains(&self, opcode: Opcode) -> bool {
        self.instructions.iter().any(|ins| ins.opcode == opcode)
    }

    /// Lowest and highest decoded PC in the block, ignoring inserted instructions.
    pub fn original_range(&self) -> Option<(usize, usize)> {
        let mut originals = self.instructions.iter().filter_map(Instruction::original_pc);
        let first = originals.next()?;
        Some(originals.fold((first, first), |(lo, hi), pc| (lo.min(pc), hi.max(pc))))
    }

    /// Returns `true` if `pc` lies within [`original_range`](Self::original_range).
    pub fn contains_original(&self, pc: usize) -> bool {
        self.original_range()
            .is_some_and(|(start, end)| start <= pc && pc <= end)
    }

    /// Size of the block in bytes.
    pub fn byte_size(&self) -> usize {
        self.instructions.iter().map(Instruction::byte_size).sum()
    }
}

/// Predicates derived from the opcodes a function can execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionAttributes {
    /// The entry block does not check `CALLVALUE`.
    pub payable: bool,
    /// No reachable instruction modifies state.
    pub view: bool,
    /// View, and no reachable instruction reads environment or storage.
    pub pure: bool,
}

/// A function recovered from the dispatcher.
#[derive(Debug, Clone)]
pub struct Function {
    /// Key under which the function's edges are stored.
    pub key: FunctionKey,
    /// Canonical signature for well-known selectors, otherwise the key's display form.
    pub name: String,
    /// PC of the entry block.
    pub start: usize,
    /// The entry block.
    pub entry: NodeIndex,
    /// Blocks explored by the function's stack value analysis, in discovery order.
    pub blocks: Vec<NodeIndex>,
    /// Payable / view / pure predicates. Not computed for the dispatcher.
    pub attributes: FunctionAttributes,
}

/// The recovered control flow graph of one bytecode buffer.
#[derive(Debug, Clone)]
pub struct Cfg {
    /// Graph representing the CFG with blocks as nodes and per-function edges.
    pub graph: DiGraph<BasicBlock, Edge>,
    /// Block lookup by the start and end PC each block had when the CFG was built.
    pub pc_to_block: HashMap<usize, NodeIndex>,
    /// Functions by entry PC, in discovery order. The dispatcher comes last.
    pub functions: IndexMap<usize, Function>,
    /// Bit `pc` is set if a JUMPDEST was decoded at `pc`.
    jumpdests: BitVec,
    /// Recovery settings the CFG was built with.
    config: AnalysisConfig,
}

impl Cfg {
    /// Recovery settings the CFG was built with.
    pub const fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Returns the block at `node`.
    pub fn block(&self, node: NodeIndex) -> &BasicBlock {
        &self.graph[node]
    }

    /// Returns the block at `node` for modification.
    pub fn block_mut(&mut self, node: NodeIndex) -> &mut BasicBlock {
        &mut self.graph[node]
    }

    /// All blocks ordered by their lowest decoded PC.
    pub fn blocks_in_order(&self) -> Vec<NodeIndex> {
        let mut nodes: Vec<_> = self.graph.node_indices().collect();
        nodes.sort_by_key(|&node| {
            self.graph[node]
                .original_range()
                .map_or(usize::MAX, |(start, _)| start)
        });
        nodes
    }

    /// Block whose build-time start or end PC is `pc`.
    pub fn block_at(&self, pc: usize) -> Option<NodeIndex> {
        self.pc_to_block.get(&pc).copied()
    }

    /// Block whose first instruction was decoded at `pc`.
    pub fn block_starting_at(&self, pc: usize) -> Option<NodeIndex> {
        self.block_at(pc)
            .filter(|&node| self.graph[node].instructions.first().and_then(Instruction::original_pc) == Some(pc))
    }

    /// Block whose decoded PC range contains `pc`.
    pub fn block_containing(&self, pc: usize) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .find(|&node| self.graph[node].contains_original(pc))
    }

    /// The instruction decoded at `pc`.
    pub fn instruction_at(&self, pc: usize) -> Option<&Instruction> {
        let node = self.block_containing(pc)?;
        self.graph[node]
            .instructions
            .iter()
            .find(|ins| ins.original_pc() == Some(pc))
    }

    /// Returns `true` if a JUMPDEST was decoded at `pc`.
    pub fn is_jumpdest(&self, pc: usize) -> bool {
        self.jumpdests.get(pc).is_some_and(|bit| *bit)
    }

    /// Number of JUMPDESTs in the decoded program.
    pub fn jumpdest_count(&self) -> usize {
        self.jumpdests.count_ones()
    }

    /// The entry block at pc 0.
    pub fn entry(&self) -> Option<NodeIndex> {
        self.block_starting_at(0)
    }

    /// Function whose analysis explored a block containing `pc`.
    pub fn function_containing(&self, pc: usize) -> Option<&Function> {
        self.functions.values().find(|function| {
            function
                .blocks
                .iter()
                .any(|&node| self.graph[node].contains_original(pc))
        })
    }

    /// Adds an edge for `key` unless one already connects `from` to `to` for that key.
    ///
    /// Returns `true` if an edge was added.
    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex, key: FunctionKey, kind: EdgeKind) -> bool {
        let exists = self
            .graph
            .edges_connecting(from, to)
            .any(|edge| edge.weight().key == key);
        if !exists {
            self.graph.add_edge(from, to, Edge { key, kind });
        }
        !exists
    }

    /// Successors of `node` for `key`, ordered by start PC.
    pub fn outgoing(&self, node: NodeIndex, key: FunctionKey) -> Vec<NodeIndex> {
        self.neighbors(node, Direction::Outgoing, Some(key))
    }

    /// Predecessors of `node` for `key`, ordered by start PC.
    pub fn incoming(&self, node: NodeIndex, key: FunctionKey) -> Vec<NodeIndex> {
        self.neighbors(node, Direction::Incoming, Some(key))
    }

    /// Successors of `node` for any function, ordered by start PC.
    pub fn all_outgoing(&self, node: NodeIndex) -> Vec<NodeIndex> {
        self.neighbors(node, Direction::Outgoing, None)
    }

    /// Predecessors of `node` for any function, ordered by start PC.
    pub fn all_incoming(&self, node: NodeIndex) -> Vec<NodeIndex> {
        self.neighbors(node, Direction::Incoming, None)
    }

    fn neighbors(&self, node: NodeIndex, dir: Direction, key: Option<FunctionKey>) -> Vec<NodeIndex> {
        let mut found: BTreeSet<(usize, NodeIndex)> = BTreeSet::new();
        for edge in self.graph.edges_directed(node, dir) {
            if key.is_some_and(|key| edge.weight().key != key) {
                continue;
            }
            let other = match dir {
                Direction::Outgoing => edge.target(),
                Direction::Incoming => edge.source(),
            };
            found.insert((self.graph[other].start_pc(), other));
        }
        found.into_iter().map(|(_, node)| node).collect()
    }

    /// Edges of `key`.
    pub fn edges_of(&self, key: FunctionKey) -> Vec<EdgeIndex> {
        self.graph
            .edge_references()
            .filter(|edge| edge.weight().key == key)
            .map(|edge| edge.id())
            .collect()
    }

    /// Runs the stack value analysis for the function starting at `start` again and returns
    /// the start PCs of the blocks it explored.
    pub fn analyze_function(&mut self, start: usize) -> Result<Vec<usize>, salve_utils::errors::CfgError> {
        let function = self
            .functions
            .get(&start)
            .ok_or(salve_utils::errors::CfgError::UnknownFunction(start))?;
        let (entry, key) = (function.entry, function.key);
        let explored = StackValueAnalysis::new(self, entry, key).analyze();
        Ok(explored
            .into_iter()
            .map(|node| self.graph[node].start_pc())
            .collect())
    }
}
