//! Jumps keep their targets after code is inserted in front of them.

use crate::evm::{call, init_tracing, two_words};
use revm::primitives::U256;
use salve_core::bug::{Bug, BugType};
use salve_core::decoder::decode_bytes;
use salve_core::opcode::Opcode;
use salve_patch::{patch_bytecode, PatchConfig};

// 00: PUSH1 0 CALLDATALOAD PUSH1 0x20 CALLDATALOAD SUB
// 07: PUSH1 0x0f JUMP STOP STOP STOP STOP INVALID
// 0f: JUMPDEST PUSH1 0 SSTORE PUSH1 0x17 JUMP STOP
// 17: JUMPDEST STOP
const JUMPS_AFTER_SUB: &str = "60003560203503 600f5600000000fe 5b60005560175600 5b00";

/// Every `PUSH` feeding a `JUMP`/`JUMPI` directly names a `JUMPDEST`.
fn assert_jumps_resolve(code_hex: &str) {
    let instructions = decode_bytes(&hex::decode(code_hex).unwrap()).unwrap();
    let jumpdests: Vec<_> = instructions
        .iter()
        .filter(|ins| ins.opcode == Opcode::JUMPDEST)
        .map(|ins| U256::from(ins.pc.current))
        .collect();
    for pair in instructions.windows(2) {
        if matches!(pair[1].opcode, Opcode::JUMP | Opcode::JUMPI) {
            if let Some(target) = pair[0].push_value() {
                assert!(jumpdests.contains(&target), "jump at 0x{:x} to 0x{target:x}", pair[1].pc.current);
            }
        }
    }
}

#[test]
fn forward_jumps_land_on_their_blocks() {
    init_tracing();
    let runtime = JUMPS_AFTER_SUB.replace(' ', "");
    assert!(call(&runtime, &[], &two_words(1, 4)).succeeded());

    let outcome = patch_bytecode(&runtime, vec![Bug::new(6, BugType::Underflow)], &PatchConfig::default()).unwrap();
    assert!(outcome.report.diagnostics.is_empty(), "{:?}", outcome.report.diagnostics);
    assert_ne!(outcome.patched_bytecode, runtime);

    let fine = call(&outcome.patched_bytecode, &[], &two_words(1, 4));
    assert!(fine.succeeded());
    assert_eq!(fine.storage.get(&U256::ZERO).copied(), Some(U256::from(3)));
    assert!(call(&outcome.patched_bytecode, &[], &two_words(4, 1)).reverted());
}

#[test]
fn patches_in_two_places_shift_each_other() {
    // 00: PUSH1 0 CALLDATALOAD PUSH1 0x20 CALLDATALOAD SUB     ; word1 - word0
    // 07: PUSH1 0x0d JUMP STOP STOP INVALID
    // 0d: JUMPDEST PUSH1 0xff AND PUSH1 1 ADD PUSH1 0 SSTORE STOP
    let runtime = "60003560203503 600d560000fe 5b60ff16600101 60005500".replace(' ', "");
    let bugs = vec![Bug::new(0x13, BugType::Overflow), Bug::new(6, BugType::Underflow)];
    let outcome = patch_bytecode(&runtime, bugs, &PatchConfig::default()).unwrap();
    assert_eq!(outcome.report.patches.len(), 2);

    let fine = call(&outcome.patched_bytecode, &[], &two_words(1, 5));
    assert!(fine.succeeded());
    assert_eq!(fine.storage.get(&U256::ZERO).copied(), Some(U256::from(5)));
    assert!(call(&outcome.patched_bytecode, &[], &two_words(5, 1)).reverted());
}

#[test]
fn patched_code_only_grows_and_keeps_its_jumps() {
    let runtime = JUMPS_AFTER_SUB.replace(' ', "");
    let bug_sets = [
        Vec::new(),
        vec![Bug::new(6, BugType::Underflow)],
        vec![Bug::new(6, BugType::Underflow), Bug::new(0x12, BugType::TransactionOrigin)],
    ];
    for bugs in bug_sets {
        let outcome = patch_bytecode(&runtime, bugs, &PatchConfig::default()).unwrap();
        assert!(outcome.patched_bytecode.len() >= runtime.len());
        assert_jumps_resolve(&outcome.patched_bytecode);
    }
}
