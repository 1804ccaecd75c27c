//! Core CFG construction logic

use super::{
    known_hashes, AnalysisConfig, BasicBlock, Cfg, Function, FunctionAttributes, FunctionKey,
    StackValueAnalysis,
};
use crate::decoder::{decode_bytes, Instruction};
use crate::opcode::Opcode;
use bitvec::vec::BitVec;
use indexmap::IndexMap;
use petgraph::graph::{DiGraph, NodeIndex};
use salve_utils::errors::CfgError;
use std::collections::HashMap;
use tracing::debug;

/// Builds the CFG of a runtime bytecode buffer.
///
/// Decodes the buffer, splits it into basic blocks, recovers the functions from the dispatcher
/// and runs the stack value analysis for each of them.
///
/// # Arguments
/// * `bytecode` - Raw runtime bytecode.
/// * `config` - Recovery settings.
///
/// # Returns
/// The recovered [`Cfg`], or a [`CfgError`] if the bytecode cannot be decoded.
///
/// # Examples
/// ```rust,ignore
/// let bytecode = hex::decode("6001600155").unwrap();
/// let cfg = build_cfg(&bytecode, &AnalysisConfig::default()).unwrap();
/// assert_eq!(cfg.graph.node_count(), 1);
/// ```
pub fn build_cfg(bytecode: &[u8], config: &AnalysisConfig) -> Result<Cfg, CfgError> {
    let instructions = decode_bytes(bytecode)?;
    Cfg::from_instructions(instructions, config)
}

impl Cfg {
    /// Builds the CFG from an already decoded instruction stream.
    pub fn from_instructions(
        instructions: Vec<Instruction>,
        config: &AnalysisConfig,
    ) -> Result<Self, CfgError> {
        debug!(
            "Starting CFG construction with {} instructions",
            instructions.len()
        );

        let code_len = instructions
            .last()
            .map_or(0, |ins| ins.pc.current + ins.byte_size());
        let mut jumpdests = BitVec::repeat(false, code_len);
        for ins in instructions.iter().filter(|ins| ins.opcode == Opcode::JUMPDEST) {
            jumpdests.set(ins.pc.current, true);
        }

        // Step 1: Block splitter
        let blocks = split_blocks(instructions);
        if blocks.is_empty() {
            return Err(CfgError::NoBlocks);
        }
        debug!("Split into {} blocks", blocks.len());

        let mut graph = DiGraph::new();
        let mut pc_to_block = HashMap::new();
        for block in blocks {
            let (start, end) = (block.start_pc(), block.end_pc());
            let node = graph.add_node(block);
            pc_to_block.insert(start, node);
            pc_to_block.insert(end, node);
        }

        let mut cfg = Self {
            graph,
            pc_to_block,
            functions: IndexMap::new(),
            jumpdests,
            config: *config,
        };

        // Step 2: Function recovery
        cfg.compute_functions();
        debug!("Recovered {} functions", cfg.functions.len());

        // Step 3: Per-function value analysis
        cfg.create_cfgs();
        debug!(
            "Built CFG with {} blocks and {} edges",
            cfg.graph.node_count(),
            cfg.graph.edge_count()
        );
        Ok(cfg)
    }

    /// Walks the dispatcher's comparison chain and registers one [`Function`] per selector,
    /// followed by the dispatcher itself.
    fn compute_functions(&mut self) {
        let Some(entry) = self.entry() else {
            return;
        };

        let mut node = entry;
        let mut is_entry = true;
        loop {
            let block = &self.graph[node];

            // A CALLVALUE guard in the entry block: the dispatcher starts on its true branch
            if is_entry && block.ends_with(Opcode::JUMPI) && block.contains(Opcode::CALLVALUE) {
                let destination = block
                    .instructions
                    .len()
                    .checked_sub(2)
                    .and_then(|i| block.instructions[i].push_value());
                match destination.and_then(|d| usize::try_from(d).ok()).and_then(|d| self.block_at(d)) {
                    Some(next) => {
                        node = next;
                        is_entry = false;
                        continue;
                    }
                    None => {
                        debug!("CALLVALUE guard at 0x{:x} has no resolvable target", block.start_pc());
                        break;
                    }
                }
            }
            is_entry = false;

            let Some((start, key)) = jump_to_function(block) else {
                break;
            };
            let key = match key {
                FunctionKey::Selector { selector, .. } if self.config.symbolic_stack_analysis => {
                    let occurrence = self
                        .functions
                        .values()
                        .filter(|f| matches!(f.key, FunctionKey::Selector { selector: s, .. } if s == selector))
                        .count();
                    FunctionKey::Selector {
                        selector,
                        occurrence: u32::try_from(occurrence).unwrap_or(u32::MAX),
                    }
                }
                key => key,
            };
            let Some(function_entry) = self.block_starting_at(start) else {
                break;
            };

            let next = block
                .ends_with(Opcode::JUMPI)
                .then(|| self.block_at(block.end_pc() + 1))
                .flatten();

            self.functions.insert(
                start,
                Function {
                    key,
                    name: function_name(key),
                    start,
                    entry: function_entry,
                    blocks: Vec::new(),
                    attributes: FunctionAttributes::default(),
                },
            );
            debug!("Found function {} at 0x{:x}", function_name(key), start);

            match next {
                Some(next) => node = next,
                None => break,
            }
        }

        self.functions.insert(
            0,
            Function {
                key: FunctionKey::Dispatcher,
                name: function_name(FunctionKey::Dispatcher),
                start: 0,
                entry,
                blocks: Vec::new(),
                attributes: FunctionAttributes::default(),
            },
        );
    }

    /// Runs the stack value analysis of every function, dispatcher last.
    fn create_cfgs(&mut self) {
        let starts: Vec<usize> = self.functions.keys().copied().collect();
        for start in starts {
            let Some(function) = self.functions.get(&start) else {
                continue;
            };
            let (entry, key) = (function.entry, function.key);
            let blocks = StackValueAnalysis::new(self, entry, key).analyze();
            let attributes = if key == FunctionKey::Dispatcher {
                FunctionAttributes::default()
            } else {
                self.attributes_of(entry, &blocks)
            };
            if let Some(function) = self.functions.get_mut(&start) {
                function.blocks = blocks;
                function.attributes = attributes;
            }
        }
    }

    fn attributes_of(&self, entry: NodeIndex, blocks: &[NodeIndex]) -> FunctionAttributes {
        let opcodes = || {
            blocks
                .iter()
                .flat_map(|&node| self.graph[node].instructions.iter().map(|ins| ins.opcode))
        };
        let view = !opcodes().any(|op| op.modifies_state());
        FunctionAttributes {
            payable: !self.graph[entry].contains(Opcode::CALLVALUE),
            view,
            pure: view && !opcodes().any(|op| op.reads_environment()),
        }
    }
}

/// Splits the instruction stream into basic blocks.
///
/// A `JUMPDEST` starts a new block; a terminator ends the current one.
fn split_blocks(instructions: Vec<Instruction>) -> Vec<BasicBlock> {
    let mut blocks = Vec::new();
    let mut current = BasicBlock::default();
    for ins in instructions {
        if ins.opcode == Opcode::JUMPDEST && !current.instructions.is_empty() {
            blocks.push(std::mem::take(&mut current));
        }
        let terminates = ins.opcode.is_terminator();
        current.instructions.push(ins);
        if terminates {
            blocks.push(std::mem::take(&mut current));
        }
    }
    if !current.instructions.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// Recognises a dispatcher block jumping into a function.
///
/// A `JUMPI` block reading `CALLDATASIZE` jumps to the fallback; a `JUMPI` block whose
/// second-to-last `PUSH` is a non-zero 4-byte value jumps to the function with that selector.
/// The target is the last pushed value.
fn jump_to_function(block: &BasicBlock) -> Option<(usize, FunctionKey)> {
    if !block.ends_with(Opcode::JUMPI) {
        return None;
    }
    let mut pushes = block.instructions.iter().filter_map(Instruction::push_value).rev();
    let last = pushes.next()?;
    let previous = pushes.next();
    let start = usize::try_from(last).ok().filter(|&start| start != 0)?;

    if block.contains(Opcode::CALLDATASIZE) {
        return Some((start, FunctionKey::Fallback));
    }
    let selector = u32::try_from(previous?).ok().filter(|&s| s != 0)?;
    Some((
        start,
        FunctionKey::Selector {
            selector,
            occurrence: 0,
        },
    ))
}

fn function_name(key: FunctionKey) -> String {
    match key {
        FunctionKey::Selector {
            selector,
            occurrence: 0,
        } => known_hashes::lookup(selector).map_or_else(|| key.to_string(), str::to_owned),
        _ => key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Three-selector dispatcher:
    // 00: PUSH1 0 CALLDATALOAD PUSH1 0xe0 SHR
    // 06: DUP1 PUSH4 0x11111111 EQ PUSH1 0x28 JUMPI
    // 10: DUP1 PUSH4 0x22222222 EQ PUSH1 0x2a JUMPI
    // 1a: DUP1 PUSH4 0x33333333 EQ PUSH1 0x2c JUMPI
    // 24: PUSH1 0 DUP1 REVERT
    // 28, 2a, 2c: JUMPDEST STOP
    pub(crate) const DISPATCHER: &str = concat!(
        "600035",
        "60e01c",
        "80631111111114602857",
        "80632222222214602a57",
        "80633333333314602c57",
        "600080fd",
        "5b00",
        "5b00",
        "5b00"
    );

    #[test]
    fn recovers_dispatcher_functions() {
        let cfg = build_cfg(&hex::decode(DISPATCHER).unwrap(), &AnalysisConfig::default()).unwrap();
        let selectors: Vec<_> = cfg.functions.values().map(|f| f.key).collect();
        assert_eq!(
            selectors,
            vec![
                FunctionKey::Selector { selector: 0x11111111, occurrence: 0 },
                FunctionKey::Selector { selector: 0x22222222, occurrence: 0 },
                FunctionKey::Selector { selector: 0x33333333, occurrence: 0 },
                FunctionKey::Dispatcher,
            ]
        );
        assert_eq!(cfg.functions[&0x28].name, "0x11111111");
        assert_eq!(cfg.functions[&0].name, "_dispatcher");
        let function = &cfg.functions[&0x28];
        assert!(function.attributes.payable);
        assert!(function.attributes.view);
        assert!(function.attributes.pure);
    }

    #[test]
    fn every_dispatcher_branch_has_edges() {
        let cfg = build_cfg(&hex::decode(DISPATCHER).unwrap(), &AnalysisConfig::default()).unwrap();
        for target in [0x28, 0x2a, 0x2c] {
            let node = cfg.block_starting_at(target).unwrap();
            assert_eq!(cfg.incoming(node, FunctionKey::Dispatcher).len(), 1);
        }
        let revert = cfg.block_containing(0x27).unwrap();
        assert!(cfg.block(revert).ends_with(Opcode::REVERT));
        assert_eq!(cfg.all_incoming(revert).len(), 1);
    }

    #[test]
    fn callvalue_guard_is_skipped() {
        // CALLVALUE DUP1 ISZERO PUSH1 0x0a JUMPI PUSH1 0 DUP1 REVERT
        // 0a: JUMPDEST POP PUSH1 4 CALLDATASIZE LT PUSH1 0x14 JUMPI STOP
        // 14: JUMPDEST STOP
        let code = "348015600a57600080fd5b5060043610601457005b00";
        let cfg = build_cfg(&hex::decode(code).unwrap(), &AnalysisConfig::default()).unwrap();
        assert_eq!(cfg.functions[&0x14].key, FunctionKey::Fallback);
        assert_eq!(cfg.functions[&0x14].name, "_fallback");
    }

    #[test]
    fn empty_bytecode_is_an_error() {
        assert!(build_cfg(&[], &AnalysisConfig::default()).is_err());
    }
}
