//! Jump target bookkeeping while code moves.
//!
//! Two kinds of `PUSH` encode jump targets:
//! - decoded `PUSH`es whose value is the decoded pc of a decoded `JUMPDEST`;
//! - inserted `PUSH`es directly followed by `JUMP`/`JUMPI`, whose value is the current pc of an
//!   inserted `JUMPDEST`.
//!
//! Inserted references are kept up to date after every patch. Decoded references keep their
//! decoded values until [`relinearize`] rewrites them once all patches are in.

use petgraph::graph::NodeIndex;
use salve_core::cfg_ir::Cfg;
use salve_core::decoder::Instruction;
use salve_core::encoder::push_width;
use salve_core::opcode::Opcode;
use salve_core::U256;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Position of an instruction: its block and its index within the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Loc {
    /// Block holding the instruction.
    pub node: NodeIndex,
    /// Index in the block's instruction list.
    pub index: usize,
}

/// A `PUSH` and the `JUMPDEST` whose address it encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    /// The `PUSH`.
    pub push: Loc,
    /// The `JUMPDEST`.
    pub target: Loc,
}

/// Jump references of a CFG, with the ones that could not be tied to a single `JUMPDEST`.
#[derive(Debug, Clone, Default)]
pub struct RelocationTable {
    /// Resolved references.
    pub references: Vec<Reference>,
    /// Addresses claimed by more than one inserted `JUMPDEST`.
    pub conflicts: Vec<usize>,
    /// Explanations for references left as they are.
    pub unresolved: Vec<String>,
}

impl RelocationTable {
    /// References held by inserted `PUSH`es.
    pub fn inserted(cfg: &Cfg) -> Self {
        let mut destinations: HashMap<usize, Vec<Loc>> = HashMap::new();
        for (loc, ins) in instructions(cfg) {
            if ins.opcode == Opcode::JUMPDEST && ins.pc.is_inserted() {
                destinations.entry(ins.pc.current).or_default().push(loc);
            }
        }

        let mut conflicts: Vec<usize> = destinations
            .iter()
            .filter(|(_, locs)| locs.len() > 1)
            .map(|(&pc, _)| pc)
            .collect();
        conflicts.sort_unstable();
        let mut table = Self {
            conflicts,
            ..Self::default()
        };

        for node in cfg.graph.node_indices() {
            let block = &cfg.block(node).instructions;
            for (index, pair) in block.windows(2).enumerate() {
                let [push, jump] = pair else { continue };
                if !(push.pc.is_inserted() && push.opcode.is_push() && jump.opcode.is_jump()) {
                    continue;
                }
                let Some(value) = push.push_value().and_then(to_usize) else {
                    continue;
                };
                match destinations.get(&value).map(Vec::as_slice) {
                    Some([target]) => table.references.push(Reference {
                        push: Loc { node, index },
                        target: *target,
                    }),
                    Some(_) => table.unresolved.push(format!(
                        "inserted jump at 0x{:x} is ambiguous: several inserted JUMPDESTs share 0x{value:x}",
                        push.pc.current
                    )),
                    None => table.unresolved.push(format!(
                        "inserted jump at 0x{:x} targets 0x{value:x}, which is not an inserted JUMPDEST",
                        push.pc.current
                    )),
                }
            }
        }
        table
    }

    /// Inserted references plus decoded `PUSH`es whose value is a decoded `JUMPDEST`.
    pub fn full(cfg: &Cfg) -> Self {
        let mut table = Self::inserted(cfg);
        let destinations: HashMap<usize, Loc> = instructions(cfg)
            .filter(|(_, ins)| ins.opcode == Opcode::JUMPDEST)
            .filter_map(|(loc, ins)| Some((ins.original_pc()?, loc)))
            .collect();

        for (loc, ins) in instructions(cfg) {
            if ins.pc.is_inserted() {
                continue;
            }
            if let Some(&target) = ins
                .push_value()
                .and_then(to_usize)
                .and_then(|value| destinations.get(&value))
            {
                table.references.push(Reference { push: loc, target });
            }
        }
        table
    }

    /// Shifts the locations of one block after `deleted` instructions at `start` were
    /// replaced by `inserted` ones. References touching a deleted instruction are dropped.
    pub fn splice(&mut self, node: NodeIndex, start: usize, deleted: usize, inserted: usize) {
        let shift = |loc: Loc| -> Option<Loc> {
            if loc.node != node || loc.index < start {
                Some(loc)
            } else if loc.index < start + deleted {
                None
            } else {
                Some(Loc {
                    node,
                    index: loc.index - deleted + inserted,
                })
            }
        };
        self.references.retain_mut(|reference| match (shift(reference.push), shift(reference.target)) {
            (Some(push), Some(target)) => {
                *reference = Reference { push, target };
                true
            }
            _ => false,
        });
    }
}

fn to_usize(value: U256) -> Option<usize> {
    usize::try_from(value).ok()
}

fn instructions(cfg: &Cfg) -> impl Iterator<Item = (Loc, &Instruction)> {
    cfg.graph.node_indices().flat_map(move |node| {
        cfg.block(node)
            .instructions
            .iter()
            .enumerate()
            .map(move |(index, ins)| (Loc { node, index }, ins))
    })
}

fn instruction(cfg: &Cfg, loc: Loc) -> Option<&Instruction> {
    cfg.graph.node_weight(loc.node)?.instructions.get(loc.index)
}

/// Assigns sequential current pcs to every instruction, blocks in decoded order.
pub fn layout(cfg: &mut Cfg) {
    let mut pc = 0;
    for node in cfg.blocks_in_order() {
        for ins in &mut cfg.block_mut(node).instructions {
            ins.pc.current = pc;
            pc += ins.byte_size();
        }
    }
}

/// Lays out the code and points every reference at its target's current pc.
///
/// A `PUSH` too narrow for its new value is widened, which moves the code after it, so the
/// layout is repeated until no `PUSH` grows. `PUSH`es never shrink.
pub fn resolve(cfg: &mut Cfg, references: &[Reference]) {
    loop {
        layout(cfg);
        let mut widened = false;
        for reference in references {
            let Some(dest) = instruction(cfg, reference.target).map(|ins| ins.pc.current) else {
                debug!("Dropping stale reference {reference:?}");
                continue;
            };
            let Some(push) = cfg
                .graph
                .node_weight_mut(reference.push.node)
                .and_then(|block| block.instructions.get_mut(reference.push.index))
            else {
                continue;
            };
            let value = U256::from(dest);
            let width = match push.opcode {
                Opcode::PUSH(n) => n,
                _ => 0,
            };
            let needed = push_width(value);
            if needed > width {
                if dest == 0 && push.opcode == Opcode::PUSH0 {
                    continue;
                }
                push.opcode = Opcode::PUSH(needed);
                push.imm = Some(value);
                widened = true;
            } else if width > 0 {
                push.imm = Some(value);
            }
        }
        if !widened {
            return;
        }
        debug!("Jump references widened, laying out again");
    }
}

/// Final relocation pass: rewrites every jump reference to its target's current address.
///
/// Returns diagnostics for references that were left untouched.
pub fn relinearize(cfg: &mut Cfg) -> Vec<String> {
    let table = RelocationTable::full(cfg);
    debug!(
        "Relocating {} jump references, {} conflicting addresses",
        table.references.len(),
        table.conflicts.len()
    );
    resolve(cfg, &table.references);

    let mut diagnostics = table.unresolved;
    diagnostics.extend(
        table
            .conflicts
            .iter()
            .map(|pc| format!("several inserted JUMPDESTs claim address 0x{pc:x}")),
    );
    for message in &diagnostics {
        warn!("{message}");
    }
    diagnostics
}
