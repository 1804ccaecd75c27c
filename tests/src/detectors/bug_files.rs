//! Bug lists written by the detectors drive the patcher.

use crate::evm::{call, two_words};
use salve_core::bug::BugType;
use salve_detectors::{read_bugs, write_bugs, Tool};
use salve_patch::{patch_bytecode, PatchConfig};

#[test]
fn osiris_log_to_patched_bytecode() {
    // PUSH1 0 CALLDATALOAD PUSH1 0x20 CALLDATALOAD SUB PUSH1 0 SSTORE STOP
    let runtime = "60003560203503600055 00".replace(' ', "");
    let log = "INFO:symExec:\t  EVM code coverage: \t 100.0%
Number of arithmetic errors: 1
{'pc': 6, 'type': 'Underflow'}
{\"opcode\": \"SUB\"}";
    let bugs = Tool::Osiris.parse(log).unwrap();
    assert_eq!(bugs.len(), 1);
    assert_eq!(bugs[0].kind, BugType::Underflow);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bugs.json");
    write_bugs(&path, &bugs).unwrap();
    let bugs = read_bugs(&path).unwrap();

    let outcome = patch_bytecode(&runtime, bugs, &PatchConfig::default()).unwrap();
    assert_eq!(outcome.report.patches[0].bug_type, "integer_underflow");
    assert!(call(&outcome.patched_bytecode, &[], &two_words(3, 2)).reverted());
    assert!(call(&outcome.patched_bytecode, &[], &two_words(2, 3)).succeeded());
}

#[test]
fn mythril_findings_are_patched() {
    let log = r#"{"error": null, "issues": [{"address": 1, "swc-id": "106"}, {"address": 0, "swc-id": "107"}], "success": true}"#;
    let bugs = Tool::Mythril.parse(log).unwrap();
    assert_eq!(bugs.len(), 1);
    assert_eq!(bugs[0].kind, BugType::Suicidal);

    // CALLER SELFDESTRUCT, runtime only: the owner slot is never written
    let outcome = patch_bytecode("33ff", bugs, &PatchConfig::default()).unwrap();
    assert_eq!(outcome.report.patches.len(), 1);
    assert!(outcome.report.diagnostics[0].contains("never initialised"));
    assert!(call(&outcome.patched_bytecode, &[], &[]).reverted());
}
