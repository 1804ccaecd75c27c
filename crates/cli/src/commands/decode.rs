/// Module for the `decode` subcommand, which prints EVM bytecode as annotated assembly.
use async_trait::async_trait;
use salve_core::decoder::decode_bytecode;
use clap::Args;
use std::error::Error;

/// Arguments for the `decode` subcommand.
#[derive(Args)]
pub struct DecodeArgs;

/// Executes the `decode` subcommand.
///
/// # Arguments
/// * `input` - A hex string (0x...) or file path (@...) containing EVM bytecode.
#[async_trait]
impl super::Command for DecodeArgs {
    async fn execute(self, input: &str) -> Result<(), Box<dyn Error>> {
        let (instructions, info, _) = match input.strip_prefix('@') {
            Some(path) => decode_bytecode(path, true)?,
            None => decode_bytecode(input, false)?,
        };
        println!(
            "; {} bytes, keccak256 0x{}",
            info.byte_length,
            hex::encode(info.keccak_hash)
        );
        for instr in instructions {
            println!("{instr}");
        }
        Ok(())
    }
}
