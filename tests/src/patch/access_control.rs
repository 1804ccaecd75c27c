//! Owner checks, executed.

use crate::evm::{call, init_tracing, CALLER};
use revm::primitives::U256;
use salve_core::bug::{Bug, BugType};
use salve_patch::{patch_bytecode, PatchConfig};

fn owner_word() -> U256 {
    U256::from_be_slice(CALLER.as_slice())
}

#[test]
fn selfdestruct_requires_the_owner() {
    init_tracing();
    // CALLER SELFDESTRUCT
    let outcome = patch_bytecode("33ff", vec![Bug::new(1, BugType::Suicidal)], &PatchConfig::default()).unwrap();
    assert!(call("33ff", &[], &[]).succeeded());

    assert!(call(&outcome.patched_bytecode, &[], &[]).reverted());
    assert!(call(&outcome.patched_bytecode, &[(U256::ZERO, owner_word())], &[]).succeeded());
}

#[test]
fn origin_check_becomes_a_caller_check() {
    // ORIGIN POP ORIGIN POP STOP, the second ORIGIN reported
    let outcome = patch_bytecode("3250325000", vec![Bug::new(2, BugType::TransactionOrigin)], &PatchConfig::default()).unwrap();
    assert_eq!(outcome.patched_bytecode, "3250335000");
    assert!(call(&outcome.patched_bytecode, &[], &[]).succeeded());
}
