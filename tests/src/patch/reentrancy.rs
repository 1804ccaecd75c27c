//! Reentrancy locks, executed.

use crate::evm::{call, init_tracing};
use revm::primitives::U256;
use salve_core::bug::{Bug, BugType};
use salve_patch::{patch_bytecode, PatchConfig};

// PUSH1 0 DUP1 x6 CALL POP STOP
const CALLS_OUT: &str = "6000808080808080f15000";

#[test]
fn lock_is_released_after_the_call() {
    init_tracing();
    let outcome = patch_bytecode(CALLS_OUT, vec![Bug::new(8, BugType::Reentrancy)], &PatchConfig::default()).unwrap();

    let first = call(&outcome.patched_bytecode, &[], &[]);
    assert!(first.succeeded());
    assert_eq!(first.storage.get(&U256::ZERO).copied().unwrap_or_default(), U256::ZERO);
}

#[test]
fn held_lock_rejects_reentry() {
    let outcome = patch_bytecode(CALLS_OUT, vec![Bug::new(8, BugType::Reentrancy)], &PatchConfig::default()).unwrap();
    let locked = call(&outcome.patched_bytecode, &[(U256::ZERO, U256::from(1))], &[]);
    assert!(locked.reverted());
}

#[test]
fn lock_slot_avoids_used_storage() {
    // PUSH1 1 PUSH1 0 SSTORE, then the call
    let runtime = format!("6001600055{CALLS_OUT}");
    let outcome = patch_bytecode(&runtime, vec![Bug::new(13, BugType::Reentrancy)], &PatchConfig::default()).unwrap();
    assert!(outcome.report.patches[0].patch[0].insert.starts_with("PUSH1 0x1 SLOAD"));

    let run = call(&outcome.patched_bytecode, &[], &[]);
    assert!(run.succeeded());
    assert_eq!(run.storage.get(&U256::ZERO).copied(), Some(U256::from(1)));
}

// 00: PUSH1 0 CALLDATALOAD PUSH1 0xe0 SHR
// 06: DUP1 PUSH4 0xaaaaaaaa EQ PUSH1 0x1e JUMPI
// 10: DUP1 PUSH4 0xbbbbbbbb EQ PUSH1 0x34 JUMPI
// 1a: PUSH1 0 DUP1 REVERT
// 1e: JUMPDEST PUSH1 1 PUSH1 0 SSTORE PUSH1 0 DUP1 x6 CALL POP PUSH1 0x10 PUSH1 3 SSTORE STOP
// 34: JUMPDEST PUSH1 0x20 PUSH1 3 SSTORE STOP
const SHARED_SLOT: &str = concat!(
    "60003560e01c",
    "8063aaaaaaaa14601e57",
    "8063bbbbbbbb14603457",
    "600080fd",
    "5b6001600055",
    "6000808080808080f150",
    "601060035500",
    "5b602060035500"
);

#[test]
fn functions_writing_the_same_slot_share_the_lock() {
    init_tracing();
    let outcome = patch_bytecode(SHARED_SLOT, vec![Bug::new(0x2c, BugType::Reentrancy)], &PatchConfig::default()).unwrap();

    let pcs: Vec<_> = outcome.report.patches.iter().map(|entry| entry.pc).collect();
    assert_eq!(pcs, vec![0x2c, 0x39]);
    for entry in &outcome.report.patches {
        assert_eq!(entry.patch.len(), 2);
        assert!(entry.patch[0].insert.starts_with("PUSH1 0x4 SLOAD"), "{}", entry.patch[0].insert);
    }

    let lock = U256::from(4);
    let a = call(&outcome.patched_bytecode, &[], &[0xaa; 4]);
    assert!(a.succeeded());
    assert_eq!(a.storage.get(&U256::from(3)).copied(), Some(U256::from(0x10)));
    assert_eq!(a.storage.get(&lock).copied().unwrap_or_default(), U256::ZERO);

    let b = call(&outcome.patched_bytecode, &[], &[0xbb; 4]);
    assert!(b.succeeded());
    assert_eq!(b.storage.get(&U256::from(3)).copied(), Some(U256::from(0x20)));

    assert!(call(&outcome.patched_bytecode, &[(lock, U256::from(1))], &[0xbb; 4]).reverted());
}
