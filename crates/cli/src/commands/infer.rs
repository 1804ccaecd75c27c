use async_trait::async_trait;
use clap::Args;
use salve_patch::{infer, PatchConfig};
use std::error::Error;

/// Arguments for the `infer` subcommand.
#[derive(Args)]
pub struct InferArgs {
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[async_trait]
impl super::Command for InferArgs {
    async fn execute(self, input: &str) -> Result<(), Box<dyn Error>> {
        let report = infer(&super::read_input(input)?, &PatchConfig::default())?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        println!(
            "CFG recovery: {} ({} without symbolic execution)",
            report.recovery.percentage_label(),
            report.recovery_without_symbolic.percentage_label()
        );
        println!("Functions: {}", report.functions.len());
        for function in &report.functions {
            let attributes = function.attributes;
            let mut tags = Vec::new();
            if attributes.payable {
                tags.push("payable");
            }
            if attributes.view {
                tags.push("view");
            }
            if attributes.pure {
                tags.push("pure");
            }
            println!(
                "  0x{:06x}  {} ({} blocks) {}",
                function.start,
                function.name,
                function.blocks,
                tags.join(" ")
            );
        }
        let used: Vec<String> = report.used_storage_slots.iter().map(|slot| format!("0x{slot:x}")).collect();
        println!("Used storage slots: [{}]", used.join(", "));
        println!("Free storage slot: 0x{:x}", report.free_storage_slot);
        println!("Execution time: {:.3}s", report.execution_time);
        Ok(())
    }
}
