/// Entry point for the salve CLI, an EVM bytecode patcher.
///
/// This module parses command-line arguments, initializes logging and dispatches to the
/// subcommands for decoding, CFG export, inference, detection and patching.
use clap::Parser;
use salve_cli::commands::{Cmd, Command};
use tracing_subscriber::EnvFilter;

/// Command-line interface for salve.
///
/// Salve recovers the control-flow graph of deployed EVM bytecode and patches the bugs
/// reported by external detectors directly into it.
#[derive(Parser)]
#[command(name = "salve")]
#[command(about = "Salve: bytecode-level patching of EVM smart contracts")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Input bytecode as a hex string (0x...) or file path prefixed with @
    input: String,

    /// More logging (-v debug, -vv trace). RUST_LOG takes precedence
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Runs the salve CLI with the provided arguments.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    cli.command.execute(&cli.input).await
}
