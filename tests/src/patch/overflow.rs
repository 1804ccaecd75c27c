//! Overflow and underflow checks, executed.

use crate::evm::{call, init_tracing, two_words};
use revm::primitives::U256;
use salve_core::bug::{Bug, BugType};
use salve_patch::{patch_bytecode, PatchConfig};

// 00: PUSH1 0 CALLDATALOAD PUSH1 0xff AND
// 06: PUSH1 0x20 CALLDATALOAD PUSH1 0xff AND
// 0c: ADD PUSH1 0 SSTORE STOP
const UINT8_ADD: &str = "60003560ff16602035 60ff16016000 5500";

fn runtime() -> String {
    UINT8_ADD.replace(' ', "")
}

#[test]
fn uint8_addition_reverts_on_overflow() {
    init_tracing();
    let outcome = patch_bytecode(&runtime(), vec![Bug::new(0x0c, BugType::Overflow)], &PatchConfig::default()).unwrap();
    assert_eq!(outcome.report.patches.len(), 1);
    assert!(outcome.report.diagnostics.is_empty());

    let unpatched = call(&runtime(), &[], &two_words(0xff, 1));
    assert!(unpatched.succeeded());

    let overflow = call(&outcome.patched_bytecode, &[], &two_words(0xff, 1));
    assert!(overflow.reverted());

    let fine = call(&outcome.patched_bytecode, &[], &two_words(0x10, 0x20));
    assert!(fine.succeeded());
    assert_eq!(fine.storage.get(&U256::ZERO).copied(), Some(U256::from(0x30)));
}

#[test]
fn subtraction_below_zero_reverts() {
    init_tracing();
    // PUSH1 0 CALLDATALOAD PUSH1 0x20 CALLDATALOAD SUB PUSH1 0 SSTORE STOP
    let runtime = "600035602035036000 5500".replace(' ', "");
    let outcome = patch_bytecode(&runtime, vec![Bug::new(6, BugType::Underflow)], &PatchConfig::default()).unwrap();

    // the second word minus the first
    assert!(call(&outcome.patched_bytecode, &[], &two_words(2, 1)).reverted());
    let fine = call(&outcome.patched_bytecode, &[], &two_words(1, 3));
    assert!(fine.succeeded());
    assert_eq!(fine.storage.get(&U256::ZERO).copied(), Some(U256::from(2)));
}
