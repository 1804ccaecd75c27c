use clap::Parser;
use salve_cli::commands::{Cmd, Command};
use serde_json::Value;
use std::fs;
use tempfile::TempDir;

#[derive(Parser)]
struct TestCli {
    #[command(subcommand)]
    command: Cmd,
}

async fn run(args: &[&str], input: &str) {
    let cli = TestCli::try_parse_from(std::iter::once("salve").chain(args.iter().copied())).unwrap();
    cli.command.execute(input).await.unwrap();
}

#[tokio::test]
async fn patch_writes_bytecode_and_report() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("runtime.hex");
    let bugs = tmp.path().join("bugs.json");
    let output = tmp.path().join("patched.hex");
    let report = tmp.path().join("report.json");

    // PUSH1 1 PUSH1 0 SUB STOP
    fs::write(&input, "0x600160000300").unwrap();
    fs::write(&bugs, r#"[{"pc": 4, "type": "underflow", "tool": "Osiris"}]"#).unwrap();

    run(
        &[
            "patch",
            "--bugs",
            bugs.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "--report",
            report.to_str().unwrap(),
        ],
        &format!("@{}", input.display()),
    )
    .await;

    assert_eq!(fs::read_to_string(&output).unwrap(), "600160008181101560 0f57600080fd5b0300".replace(' ', ""));
    let report: Value = serde_json::from_str(&fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(report["patches"][0]["bug_type"], "integer_underflow");
    assert_eq!(report["original_size"], "6 bytes");
    assert_eq!(report["patched_size"], "18 bytes");
}

#[tokio::test]
async fn patch_without_bugs_passes_the_input_through() {
    let tmp = TempDir::new().unwrap();
    let output = tmp.path().join("patched.hex");
    run(&["patch", "-o", output.to_str().unwrap()], "0x33ff").await;
    assert_eq!(fs::read_to_string(&output).unwrap(), "33ff");
}

#[tokio::test]
async fn cfg_is_written_as_dot() {
    let tmp = TempDir::new().unwrap();
    let output = tmp.path().join("cfg.dot");
    run(&["cfg", "-o", output.to_str().unwrap()], "0x6000356008570000 5b00").await;
    let dot = fs::read_to_string(&output).unwrap();
    assert!(dot.starts_with("digraph CFG {"));
    assert!(dot.contains("BranchTrue"));
}

#[test]
fn patch_rejects_two_bug_sources() {
    assert!(TestCli::try_parse_from(["salve", "patch", "--bugs", "bugs.json", "--detect"]).is_err());
}
