//! Edges that need no value analysis, and per-function reachability.

use super::{Cfg, EdgeKind, FunctionKey};
use crate::opcode::Opcode;
use petgraph::graph::NodeIndex;
use std::collections::HashSet;

impl Cfg {
    /// Adds `JUMPI` false-branch edges and fallthrough edges into a following `JUMPDEST`
    /// block, for every block of the program, under `key`.
    ///
    /// Edges out of blocks `key` never reaches are removed again by
    /// [`compute_reachability`](Self::compute_reachability).
    pub(super) fn compute_simple_edges(&mut self, key: FunctionKey) {
        let nodes: Vec<NodeIndex> = self.graph.node_indices().collect();
        for node in nodes {
            let Some((end_pc, opcode, size)) = self.graph[node]
                .end()
                .map(|end| (end.pc.current, end.opcode, end.byte_size()))
            else {
                continue;
            };

            if opcode == Opcode::JUMPI {
                if let Some(next) = self.block_at(end_pc + 1) {
                    self.add_edge(node, next, key, EdgeKind::BranchFalse);
                }
            } else if !opcode.is_terminator() {
                if let Some(next) = self.block_at(end_pc + size) {
                    self.add_edge(node, next, key, EdgeKind::Fallthrough);
                }
            }
        }
    }

    /// Marks every block reachable from `entry` along `key` edges and drops the `key` edges
    /// leaving unreached blocks.
    pub(super) fn compute_reachability(&mut self, entry: NodeIndex, key: FunctionKey) {
        let mut seen = HashSet::from([entry]);
        let mut to_explore = vec![entry];
        while let Some(node) = to_explore.pop() {
            for succ in self.outgoing(node, key) {
                if seen.insert(succ) {
                    to_explore.push(succ);
                }
            }
        }

        for &node in &seen {
            let reachable = &mut self.graph[node].reachable;
            if !reachable.contains(&key) {
                reachable.push(key);
            }
        }

        self.graph.retain_edges(|graph, edge| {
            graph[edge].key != key
                || graph
                    .edge_endpoints(edge)
                    .is_some_and(|(source, _)| seen.contains(&source))
        });
    }
}
