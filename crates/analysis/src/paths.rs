//! Enumeration of entry-to-leaf execution paths over the CFG.

use petgraph::graph::NodeIndex;
use salve_core::cfg_ir::Cfg;
use salve_core::decoder::Instruction;
use salve_core::opcode::Opcode;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// Deepest block, counting the entry as depth 0, whose branches each get their own visited
/// set. Branches of deeper blocks share the set of their parent, so loops are unrolled at
/// most this far.
pub const MAX_UNROLL_DEPTH: usize = 7;

/// Which paths [`execution_paths`] keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSelection {
    /// Every path.
    All,
    /// Paths containing an `SLOAD` or `SSTORE`, one per distinct set of storage accesses.
    AccessingStorage,
}

struct Frame {
    node: NodeIndex,
    path: Vec<NodeIndex>,
    visited: usize,
}

/// Enumerates the paths from `entry` to the blocks without successors, following the edges
/// of every function.
///
/// Branches of blocks at depth [`MAX_UNROLL_DEPTH`] or less explore with a private copy of the
/// visited set; deeper branches share it. Paths that end in an already visited block are not
/// reported.
pub fn execution_paths(cfg: &Cfg, entry: NodeIndex, selection: PathSelection) -> Vec<Vec<NodeIndex>> {
    let mut visited_sets: Vec<HashSet<NodeIndex>> = vec![HashSet::new()];
    let mut stack = vec![Frame {
        node: entry,
        path: Vec::new(),
        visited: 0,
    }];
    let mut paths = Vec::new();
    let mut signatures = HashSet::new();

    while let Some(Frame {
        node,
        mut path,
        visited,
    }) = stack.pop()
    {
        visited_sets[visited].insert(node);
        path.push(node);

        let successors = cfg.all_outgoing(node);
        if successors.is_empty() {
            if keep(cfg, &path, selection, &mut signatures) {
                paths.push(path);
            }
            continue;
        }

        // The entry is at depth 0
        let depth = path.len() - 1;
        for succ in successors.into_iter().rev() {
            if visited_sets[visited].contains(&succ) {
                continue;
            }
            let visited = if depth <= MAX_UNROLL_DEPTH {
                visited_sets.push(visited_sets[visited].clone());
                visited_sets.len() - 1
            } else {
                visited
            };
            stack.push(Frame {
                node: succ,
                path: path.clone(),
                visited,
            });
        }
    }

    debug!(
        "Enumerated {} paths from block 0x{:x}",
        paths.len(),
        cfg.block(entry).start_pc()
    );
    paths
}

/// Instructions along `path`, in execution order.
pub fn path_instructions<'a>(cfg: &'a Cfg, path: &[NodeIndex]) -> Vec<&'a Instruction> {
    path.iter()
        .flat_map(|&node| &cfg.block(node).instructions)
        .collect()
}

fn keep(
    cfg: &Cfg,
    path: &[NodeIndex],
    selection: PathSelection,
    signatures: &mut HashSet<BTreeSet<usize>>,
) -> bool {
    match selection {
        PathSelection::All => true,
        PathSelection::AccessingStorage => {
            let signature: BTreeSet<usize> = path_instructions(cfg, path)
                .into_iter()
                .filter(|ins| matches!(ins.opcode, Opcode::SLOAD | Opcode::SSTORE))
                .map(|ins| ins.pc.current)
                .collect();
            !signature.is_empty() && signatures.insert(signature)
        }
    }
}
