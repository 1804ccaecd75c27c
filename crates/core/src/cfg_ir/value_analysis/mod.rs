//! Stack value analysis: resolves `JUMP`/`JUMPI` targets of one function by abstract
//! interpretation over [`AbstractStack`]s, adding the discovered edges to the CFG.
//!
//! Each block's transfer function replays its instructions: `PUSH` pushes its literal,
//! `DUP`/`SWAP` move elements, `AND` intersects values and every other opcode pops and
//! pushes unknowns according to its arity. The stack before a block's final jump gives the
//! candidate targets. The worklist only re-triggers on newly discovered targets, and every
//! block is re-analysed at most `max_exploration` times.

mod stack;

pub use self::stack::{symbolic_replay, AbsStackElem, AbstractStack, Lattice};

use super::{Cfg, EdgeKind, FunctionKey};
use crate::decoder::Instruction;
use crate::opcode::Opcode;
use petgraph::graph::NodeIndex;
use revm::primitives::U256;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::debug;

/// Per-function fixpoint over abstract stacks.
pub struct StackValueAnalysis<'a> {
    cfg: &'a mut Cfg,
    entry: NodeIndex,
    key: FunctionKey,
    lattice: Lattice,
    /// Stack right before each block's last instruction.
    stacks_in: HashMap<NodeIndex, AbstractStack>,
    /// Stack after each block's last instruction.
    stacks_out: HashMap<NodeIndex, AbstractStack>,
    block_counter: HashMap<NodeIndex, usize>,
    /// Targets found since the last exploration, by jumping block.
    last_discovered: BTreeMap<NodeIndex, BTreeSet<usize>>,
    all_discovered: HashMap<NodeIndex, BTreeSet<usize>>,
    explored: Vec<NodeIndex>,
    to_explore: BTreeSet<NodeIndex>,
    outgoing: VecDeque<NodeIndex>,
    iterations: usize,
}

impl<'a> StackValueAnalysis<'a> {
    /// Prepares the analysis of the function `key` entered at `entry`.
    pub fn new(cfg: &'a mut Cfg, entry: NodeIndex, key: FunctionKey) -> Self {
        let lattice = if cfg.config.optimization {
            Lattice::restricted(cfg.jumpdests.iter_ones().map(U256::from).collect())
        } else {
            Lattice::unrestricted()
        };
        Self {
            cfg,
            entry,
            key,
            lattice,
            stacks_in: HashMap::new(),
            stacks_out: HashMap::new(),
            block_counter: HashMap::new(),
            last_discovered: BTreeMap::new(),
            all_discovered: HashMap::new(),
            explored: Vec::new(),
            to_explore: BTreeSet::from([entry]),
            outgoing: VecDeque::new(),
            iterations: 0,
        }
    }

    /// Runs the analysis to completion and returns the blocks it explored.
    ///
    /// Simple edges are added first; edges of blocks the function cannot reach are pruned at
    /// the end, and every reached block is marked with the function key.
    pub fn analyze(mut self) -> Vec<NodeIndex> {
        self.cfg.compute_simple_edges(self.key);
        while !self.to_explore.is_empty() {
            if self.iterations >= self.cfg.config.max_iterations {
                debug!(
                    "Stopping analysis of {} after {} iterations",
                    self.key, self.iterations
                );
                break;
            }
            self.iterations += 1;
            self.explore();
        }
        self.cfg.compute_reachability(self.entry, self.key);
        debug!(
            "Analysed {}: {} blocks explored in {} iterations",
            self.key,
            self.explored.len(),
            self.iterations
        );
        self.explored
    }

    fn explore(&mut self) {
        if let Some(node) = self.to_explore.pop_first() {
            if self.cfg.config.symbolic_stack_analysis {
                self.add_symbolic_edges(node);
            }
            self.transfer_block(node);
        }

        while let Some(node) = self.outgoing.pop_back() {
            self.transfer_block(node);
        }

        let discovered = std::mem::take(&mut self.last_discovered);
        for (from, targets) in discovered {
            let kind = self.branch_kind(from);
            for target in targets {
                if let Some(to) = self.jump_target(target) {
                    self.cfg.add_edge(from, to, self.key, kind);
                    self.to_explore.insert(to);
                }
            }
        }
    }

    /// Adds the edges a syntactic replay of `node` can resolve on its own.
    fn add_symbolic_edges(&mut self, node: NodeIndex) {
        let block = self.cfg.block(node);
        if !block.ends_with_jump() {
            return;
        }
        let is_jumpi = block.ends_with(Opcode::JUMPI);
        let end_pc = block.end_pc();
        let Some(target) = symbolic_replay(&block.instructions).last().copied().flatten() else {
            return;
        };
        let Some(to) = self.jump_target_value(target) else {
            return;
        };

        let before = self.cfg.all_outgoing(node);
        let kind = if is_jumpi { EdgeKind::BranchTrue } else { EdgeKind::Jump };
        self.cfg.add_edge(node, to, self.key, kind);
        let mut targets = vec![to];
        if is_jumpi {
            if let Some(next) = self.cfg.block_at(end_pc + 1) {
                self.cfg.add_edge(node, next, self.key, EdgeKind::BranchFalse);
                targets.push(next);
            }
        }
        if self.cfg.all_outgoing(node) != before {
            self.to_explore.extend(targets);
        }
    }

    fn transfer_block(&mut self, node: NodeIndex) {
        if self.key == FunctionKey::Dispatcher && !self.cfg.block(node).reachable.is_empty() {
            return;
        }

        let counter = self.block_counter.entry(node).or_default();
        *counter += 1;
        if *counter > self.cfg.config.max_exploration {
            debug!(
                "Block 0x{:x} reached the exploration bound for {}",
                self.cfg.block(node).start_pc(),
                self.key
            );
            return;
        }

        let previous = self.stacks_out.get(&node).cloned();

        // Merge only predecessors that were already analysed
        let mut stack: Option<AbstractStack> = None;
        for pred in self.cfg.incoming(node, self.key) {
            if let Some(out) = self.stacks_out.get(&pred) {
                stack = Some(match stack {
                    Some(acc) => acc.merge(out, &self.lattice),
                    None => out.clone(),
                });
            }
        }
        self.explore_block(node, stack.unwrap_or_default());

        if self.cfg.block(node).ends_with_jump() {
            self.resolve_jump(node);
        }

        if previous.as_ref() != self.stacks_out.get(&node) {
            for succ in self.cfg.outgoing(node, self.key).into_iter().rev() {
                self.outgoing.push_front(succ);
            }
        }
    }

    fn explore_block(&mut self, node: NodeIndex, mut stack: AbstractStack) {
        if !self.explored.contains(&node) {
            self.explored.push(node);
        }
        let block = &self.cfg.graph[node];
        let Some((last, body)) = block.instructions.split_last() else {
            return;
        };
        for ins in body {
            transfer_instruction(ins, &mut stack, &self.lattice);
        }
        let before_last = stack.clone();
        transfer_instruction(last, &mut stack, &self.lattice);
        self.stacks_in.insert(node, before_last);
        self.stacks_out.insert(node, stack);
    }

    /// Records the targets of the jump ending `node`.
    fn resolve_jump(&mut self, node: NodeIndex) {
        let unknown = AbsStackElem::single(None, &self.lattice);
        let destination = self
            .stacks_in
            .get(&node)
            .and_then(AbstractStack::peek)
            .unwrap_or(&unknown);

        let mut targets: Vec<usize> = destination
            .values()
            .into_iter()
            .flatten()
            .filter_map(|value| value.and_then(|v| self.jumpdest_pc(v)))
            .collect();

        if targets.is_empty() && self.cfg.config.symbolic_stack_analysis {
            let block = self.cfg.block(node);
            if let Some(target) = symbolic_replay(&block.instructions).last().copied().flatten() {
                targets.extend(self.jumpdest_pc(target));
            }
        }
        self.add_branches(node, targets);
    }

    fn add_branches(&mut self, from: NodeIndex, targets: Vec<usize>) {
        let all = self.all_discovered.entry(from).or_default();
        for target in targets {
            if all.insert(target) {
                self.last_discovered.entry(from).or_default().insert(target);
            }
        }
    }

    /// The PC `value` denotes, if it is a non-zero JUMPDEST.
    fn jumpdest_pc(&self, value: U256) -> Option<usize> {
        let pc = usize::try_from(value).ok()?;
        (pc != 0 && self.cfg.is_jumpdest(pc)).then_some(pc)
    }

    fn jump_target_value(&self, value: U256) -> Option<NodeIndex> {
        self.jump_target(self.jumpdest_pc(value)?)
    }

    fn jump_target(&self, pc: usize) -> Option<NodeIndex> {
        self.cfg.block_starting_at(pc)
    }

    fn branch_kind(&self, node: NodeIndex) -> EdgeKind {
        if self.cfg.block(node).ends_with(Opcode::JUMPI) {
            EdgeKind::BranchTrue
        } else {
            EdgeKind::Jump
        }
    }
}

/// Abstract transfer function of a single instruction.
fn transfer_instruction(ins: &Instruction, stack: &mut AbstractStack, lattice: &Lattice) {
    match ins.opcode {
        Opcode::PUSH0 | Opcode::PUSH(_) => stack.push_value(ins.push_value(), lattice),
        Opcode::SWAP(n) => stack.swap(n as usize, lattice),
        Opcode::DUP(n) => stack.dup(n as usize, lattice),
        Opcode::AND => {
            let a = stack.pop(lattice);
            let b = stack.pop(lattice);
            stack.push(a.and(&b, lattice));
        }
        op => {
            let (pops, pushes) = op.stack_arity();
            for _ in 0..pops {
                stack.pop(lattice);
            }
            for _ in 0..pushes {
                stack.push_value(None, lattice);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg_ir::{build_cfg, AnalysisConfig};

    fn build(hex_code: &str, config: AnalysisConfig) -> Cfg {
        build_cfg(&hex::decode(hex_code).unwrap(), &config).unwrap()
    }

    // 00: PUSH1 0x08 PUSH1 0x0c JUMP        (call helper, return to 0x08)
    // 05: INVALID INVALID INVALID
    // 08: JUMPDEST STOP
    // 0a: INVALID INVALID
    // 0c: JUMPDEST JUMP                     (helper returns through the stack)
    const HELPER_CALL: &str = "6008600c56fefefe5b00fefe5b56";

    #[test]
    fn return_address_on_stack_is_resolved() {
        let cfg = build(HELPER_CALL, AnalysisConfig::default());
        let helper = cfg.block_starting_at(0x0c).unwrap();
        let ret = cfg.block_starting_at(0x08).unwrap();
        assert_eq!(cfg.outgoing(helper, FunctionKey::Dispatcher), vec![ret]);
    }

    #[test]
    fn non_jumpdest_targets_are_dropped() {
        // PUSH1 0x03 JUMP INVALID JUMPDEST STOP: 0x03 is INVALID, not a JUMPDEST
        let cfg = build("600356fe5b00", AnalysisConfig::default());
        let entry = cfg.entry().unwrap();
        assert!(cfg.outgoing(entry, FunctionKey::Dispatcher).is_empty());
    }

    #[test]
    fn masked_target_is_resolved_without_optimization() {
        // PUSH1 0x09 PUSH2 0xffff AND JUMP INVALID INVALID JUMPDEST STOP
        let config = AnalysisConfig {
            optimization: false,
            symbolic_stack_analysis: false,
            ..AnalysisConfig::default()
        };
        let cfg = build("600961ffff1656fefe5b00", config);
        let entry = cfg.entry().unwrap();
        let target = cfg.block_starting_at(0x09).unwrap();
        assert_eq!(cfg.outgoing(entry, FunctionKey::Dispatcher), vec![target]);
    }

    #[test]
    fn rerunning_the_analysis_adds_no_edges() {
        let mut cfg = build(HELPER_CALL, AnalysisConfig::default());
        let before = cfg.graph.edge_count();
        let starts: Vec<_> = cfg.functions.keys().copied().collect();
        for start in starts {
            cfg.analyze_function(start).unwrap();
        }
        assert_eq!(cfg.graph.edge_count(), before);
    }
}
