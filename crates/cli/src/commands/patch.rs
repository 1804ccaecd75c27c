use super::detect::DetectorArgs;
use async_trait::async_trait;
use clap::Args;
use salve_core::cfg_ir::AnalysisConfig;
use salve_detectors::read_bugs;
use salve_patch::{patch_bytecode, PatchConfig};
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// Arguments for the `patch` subcommand.
#[derive(Args)]
pub struct PatchArgs {
    /// JSON bug list to patch
    #[arg(short, long, conflicts_with = "detect")]
    bugs: Option<PathBuf>,

    /// Run the detectors to find the bugs
    #[arg(long)]
    detect: bool,

    #[command(flatten)]
    detectors: DetectorArgs,

    /// Reuse the contract's own revert sequences in inserted checks
    #[arg(long)]
    error_handling_inference: bool,

    /// Directory with template overrides (<template>.jsonl)
    #[arg(long)]
    templates: Option<PathBuf>,

    /// Resolve jumps with the lattice analysis only
    #[arg(long)]
    no_symbolic: bool,

    /// Output file for the patched bytecode (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output file for the JSON patch report
    #[arg(long)]
    report: Option<PathBuf>,
}

#[async_trait]
impl super::Command for PatchArgs {
    async fn execute(self, input: &str) -> Result<(), Box<dyn Error>> {
        let bytecode = super::read_input(input)?;
        let bugs = match (&self.bugs, self.detect) {
            (Some(path), _) => read_bugs(path)?,
            (None, true) => self.detectors.run(&bytecode).await?,
            (None, false) => {
                warn!("No bug list given, bytecode is passed through");
                Vec::new()
            }
        };

        let config = PatchConfig {
            analysis: AnalysisConfig {
                symbolic_stack_analysis: !self.no_symbolic,
                ..AnalysisConfig::default()
            },
            error_handling_inference: self.error_handling_inference,
            templates_dir: self.templates,
        };
        let outcome = patch_bytecode(&bytecode, bugs, &config)?;

        for diagnostic in &outcome.report.diagnostics {
            warn!("{diagnostic}");
        }
        info!(
            "{} patch(es), runtime {} -> {}, {:.3}s",
            outcome.report.patches.len(),
            outcome.report.original_size,
            outcome.report.patched_size,
            outcome.report.execution_time
        );
        if let Some(path) = &self.report {
            fs::write(path, serde_json::to_string_pretty(&outcome.report)?)?;
        }
        super::emit(&outcome.patched_bytecode, self.output.as_deref())
    }
}
