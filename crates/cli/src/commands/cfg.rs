use async_trait::async_trait;
use clap::Args;
use petgraph::visit::EdgeRef;
use salve_analysis::recovery;
use salve_core::cfg_ir::{build_cfg, AnalysisConfig, Cfg, EdgeKind};
use salve_core::decoder::input_to_bytes;
use salve_core::sections::split_sections;
use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct CfgArgs {
    /// Output file for Graphviz .dot (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Resolve jumps with the lattice analysis only
    #[arg(long)]
    no_symbolic: bool,
}

#[async_trait]
impl super::Command for CfgArgs {
    async fn execute(self, input: &str) -> Result<(), Box<dyn Error>> {
        let bytes = input_to_bytes(&super::read_input(input)?, false)?;
        let sections = split_sections(&bytes);
        let config = AnalysisConfig {
            symbolic_stack_analysis: !self.no_symbolic,
            ..AnalysisConfig::default()
        };
        let cfg = build_cfg(&sections.runtime, &config)?;
        let metrics = recovery(&cfg);
        info!(
            "{} blocks, {} edges, {} functions, {} recovered",
            metrics.total_blocks,
            metrics.edges,
            metrics.functions,
            metrics.percentage_label()
        );

        super::emit(&generate_dot(&cfg), self.output.as_deref())
    }
}

fn generate_dot(cfg: &Cfg) -> String {
    let mut entries: HashMap<_, Vec<&str>> = HashMap::new();
    for function in cfg.functions.values() {
        entries.entry(function.entry).or_default().push(&function.name);
    }

    let mut dot = String::from("digraph CFG {\n    node [shape=box, fontname=monospace];\n");

    // Add nodes
    for node in cfg.blocks_in_order() {
        let block = cfg.block(node);
        let mut lines: Vec<String> = entries
            .get(&node)
            .map(|names| names.iter().map(|name| format!("[{name}]")).collect())
            .unwrap_or_default();
        lines.push(format!("Block_0x{:x}", block.start_pc()));
        lines.extend(block.instructions.iter().map(ToString::to_string));
        dot.push_str(&format!(
            "    {} [label=\"{}\\l\"];\n",
            node.index(),
            escape(&lines.join("\\l"))
        ));
    }

    // Add edges, once per kind even when several functions share them
    let edges: BTreeSet<_> = cfg
        .graph
        .edge_references()
        .map(|edge| (edge.source().index(), edge.target().index(), label(edge.weight().kind)))
        .collect();
    for (src, dst, label) in edges {
        dot.push_str(&format!("    {src} -> {dst} [label=\"{label}\"];\n"));
    }

    dot.push_str("}\n");
    dot
}

const fn label(kind: EdgeKind) -> &'static str {
    match kind {
        EdgeKind::Fallthrough => "Fallthrough",
        EdgeKind::Jump => "Jump",
        EdgeKind::BranchTrue => "BranchTrue",
        EdgeKind::BranchFalse => "BranchFalse",
    }
}

fn escape(label: &str) -> String {
    label.replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_lists_blocks_and_branches() {
        // PUSH1 0 CALLDATALOAD PUSH1 8 JUMPI STOP JUMPDEST STOP
        let code = hex::decode("6000356008570000 5b00".replace(' ', "")).unwrap();
        let cfg = build_cfg(&code, &AnalysisConfig::default()).unwrap();
        let dot = generate_dot(&cfg);

        assert!(dot.starts_with("digraph CFG {"));
        assert!(dot.contains("Block_0x0"));
        assert!(dot.contains("Block_0x8"));
        assert!(dot.contains("[label=\"BranchTrue\"]"));
        assert!(dot.contains("[label=\"BranchFalse\"]"));
        assert!(dot.trim_end().ends_with('}'));
    }
}
