use async_trait::async_trait;
use clap::Subcommand;
use std::error::Error;
use std::fs;

pub mod cfg;
pub mod decode;
pub mod detect;
pub mod infer;
pub mod patch;

#[derive(Subcommand)]
pub enum Cmd {
    /// Decode bytecode to annotated assembly
    Decode(decode::DecodeArgs),

    /// Write the runtime CFG as Graphviz DOT to stdout or a file
    Cfg(cfg::CfgArgs),

    /// Report recovered functions, storage usage and CFG recovery
    Infer(infer::InferArgs),

    /// Run the docker detectors on the runtime
    Detect(detect::DetectArgs),

    /// Patch detected or listed bugs into the bytecode
    Patch(patch::PatchArgs),
}

#[async_trait]
pub trait Command {
    async fn execute(self, input: &str) -> Result<(), Box<dyn Error>>;
}

#[async_trait]
impl Command for Cmd {
    async fn execute(self, input: &str) -> Result<(), Box<dyn Error>> {
        match self {
            Cmd::Decode(args) => args.execute(input).await,
            Cmd::Cfg(args) => args.execute(input).await,
            Cmd::Infer(args) => args.execute(input).await,
            Cmd::Detect(args) => args.execute(input).await,
            Cmd::Patch(args) => args.execute(input).await,
        }
    }
}

/// Bytecode text of `input`, read from the file when it is prefixed with `@`.
pub(crate) fn read_input(input: &str) -> Result<String, Box<dyn Error>> {
    Ok(match input.strip_prefix('@') {
        Some(path) => fs::read_to_string(path)?,
        None => input.to_string(),
    })
}

/// Writes `text` to `path`, or prints it when no path is given.
pub(crate) fn emit(text: &str, path: Option<&std::path::Path>) -> Result<(), Box<dyn Error>> {
    match path {
        Some(path) => fs::write(path, text)?,
        None => println!("{text}"),
    }
    Ok(())
}
