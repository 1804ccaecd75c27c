/// Module for measuring how much of a contract's control flow the CFG recovery resolved.
///
/// A block is dead when the analysis attached neither incoming nor outgoing edges to it, for
/// any function. Blocks made of a single `STOP` or `INVALID` are padding emitted by the
/// compiler and are never counted as dead.
///
/// # Usage
/// ```rust,ignore
/// let cfg = cfg_ir::build_cfg(&hex::decode("6080604052...").unwrap(), &AnalysisConfig::default()).unwrap();
/// let metrics = metrics::recovery(&cfg);
/// println!("Recovered {} of the control-flow graph", metrics.percentage_label());
/// ```
use salve_core::cfg_ir::{BasicBlock, Cfg};
use salve_core::opcode::Opcode;
use serde::{Deserialize, Serialize};

/// CFG recovery statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryMetrics {
    /// Number of basic blocks.
    pub total_blocks: usize,
    /// Blocks with no edges that are not bare `STOP`/`INVALID` padding.
    pub dead_blocks: usize,
    /// Number of edges, over all functions.
    pub edges: usize,
    /// Number of recovered functions, the dispatcher included.
    pub functions: usize,
    /// Share of live blocks, in percent.
    pub recovered_percentage: f64,
}

impl RecoveryMetrics {
    /// Rounded percentage as reported, e.g. `"100%"`.
    pub fn percentage_label(&self) -> String {
        format!("{}%", self.recovered_percentage.round())
    }
}

/// Computes the recovery statistics of a CFG.
///
/// # Arguments
/// * `cfg` - The CFG from `cfg_ir::build_cfg`.
///
/// # Returns
/// A `RecoveryMetrics` with `recovered_percentage = (total - dead) / total * 100`, or 0 for a
/// CFG without blocks.
pub fn recovery(cfg: &Cfg) -> RecoveryMetrics {
    let total_blocks = cfg.graph.node_count();
    let dead_blocks = cfg
        .graph
        .node_indices()
        .filter(|&node| {
            cfg.all_incoming(node).is_empty()
                && cfg.all_outgoing(node).is_empty()
                && !is_padding(cfg.block(node))
        })
        .count();

    let recovered_percentage = if total_blocks == 0 {
        0.0
    } else {
        (total_blocks - dead_blocks) as f64 / total_blocks as f64 * 100.0
    };

    RecoveryMetrics {
        total_blocks,
        dead_blocks,
        edges: cfg.graph.edge_count(),
        functions: cfg.functions.len(),
        recovered_percentage,
    }
}

fn is_padding(block: &BasicBlock) -> bool {
    matches!(
        block.instructions.as_slice(),
        [ins] if matches!(ins.opcode, Opcode::STOP | Opcode::INVALID)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use salve_core::cfg_ir::{build_cfg, AnalysisConfig};

    fn metrics(code: &str) -> RecoveryMetrics {
        let cfg = build_cfg(&hex::decode(code).unwrap(), &AnalysisConfig::default()).unwrap();
        recovery(&cfg)
    }

    #[test]
    fn dispatcher_is_fully_recovered() {
        // Three selectors, each jumping to its own JUMPDEST STOP body
        let code = concat!(
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
        let metrics = metrics(code);
        assert_eq!(metrics.dead_blocks, 0);
        assert_eq!(metrics.functions, 4);
        assert_eq!(metrics.percentage_label(), "100%");
    }

    #[test]
    fn orphan_invalid_block_is_not_dead() {
        // PUSH1 0 CALLDATALOAD PUSH1 0x08 JUMPI | STOP | INVALID | JUMPDEST STOP
        let metrics = metrics("60003560085700fe5b00");
        assert_eq!(metrics.total_blocks, 4);
        assert_eq!(metrics.dead_blocks, 0);
        assert_eq!(metrics.recovered_percentage, 100.0);
    }

    #[test]
    fn unreachable_code_is_dead() {
        // PUSH1 0 CALLDATALOAD PUSH1 0x0a JUMPI | STOP | PUSH1 1 INVALID | JUMPDEST STOP
        let metrics = metrics("600035600a57006001fe5b00");
        assert_eq!(metrics.total_blocks, 4);
        assert_eq!(metrics.dead_blocks, 1);
        assert_eq!(metrics.percentage_label(), "75%");
    }
}
