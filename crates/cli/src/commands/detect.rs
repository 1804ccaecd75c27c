use async_trait::async_trait;
use clap::Args;
use salve_core::bug::Bug;
use salve_core::decoder::input_to_bytes;
use salve_core::sections::split_sections;
use salve_detectors::{detectors_from_names, run_all, write_bugs, DetectorConfig};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Detector selection and limits, shared by `detect` and `patch --detect`.
#[derive(Args)]
pub struct DetectorArgs {
    /// Comma-separated detectors to run
    #[arg(short, long, default_value = "Osiris,Oyente,Mythril")]
    detectors: String,

    /// Per-detector timeout in seconds
    #[arg(long, default_value_t = 1800)]
    timeout: u64,

    /// Attempts after a timeout or a failed start
    #[arg(long, default_value_t = 1)]
    retries: u32,

    /// Docker executable
    #[arg(long, default_value = "docker")]
    docker: String,
}

impl DetectorArgs {
    fn config(&self) -> DetectorConfig {
        DetectorConfig {
            timeout: Duration::from_secs(self.timeout),
            retries: self.retries,
            docker: self.docker.clone(),
        }
    }

    /// Runs the selected detectors on the runtime part of `bytecode`.
    pub(crate) async fn run(&self, bytecode: &str) -> Result<Vec<Bug>, Box<dyn Error>> {
        let detectors = detectors_from_names(&self.detectors, &self.config())?;
        let runtime = hex::encode(split_sections(&input_to_bytes(bytecode, false)?).runtime);
        let bugs = run_all(detectors, &runtime).await;
        info!("Detectors reported {} bug(s)", bugs.len());
        Ok(bugs)
    }
}

/// Arguments for the `detect` subcommand.
#[derive(Args)]
pub struct DetectArgs {
    #[command(flatten)]
    detectors: DetectorArgs,

    /// Output file for the bug list (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[async_trait]
impl super::Command for DetectArgs {
    async fn execute(self, input: &str) -> Result<(), Box<dyn Error>> {
        let bytecode = super::read_input(input)?;
        let bugs = self.detectors.run(&bytecode).await?;
        match &self.output {
            Some(path) => write_bugs(path, &bugs)?,
            None => println!("{}", serde_json::to_string_pretty(&bugs)?),
        }
        Ok(())
    }
}
