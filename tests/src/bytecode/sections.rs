//! Creation bytecode with a metadata trailer, through decoding and CFG recovery.

use salve_analysis::{free_storage_slot, recovery};
use salve_core::cfg_ir::{build_cfg, AnalysisConfig};
use salve_core::decoder::{decode_bytecode, decode_bytes};
use salve_core::sections::split_sections;
use salve_core::U256;

// Constructor copying 0x0d runtime bytes from 0x0c:
//   PUSH1 0x0d DUP1 PUSH1 0x0c PUSH1 0 CODECOPY PUSH1 0 RETURN STOP
// Runtime: PUSH1 1 PUSH1 0 SSTORE PUSH1 0x0b JUMP STOP STOP INVALID JUMPDEST STOP
// Trailer: CBOR metadata a1 65 'bzzr0' ... 0x0029 (shortened)
fn creation_code() -> String {
    format!(
        "600d80600c6000396000f300{}{}",
        "6001600055600b560000fe5b00", "a165627a7a72305820deadbeef0029"
    )
}

#[test]
fn sections_split_at_the_runtime_copy() {
    let bytes = hex::decode(creation_code()).unwrap();
    let sections = split_sections(&bytes);
    assert_eq!(sections.deployment.as_deref().map(<[u8]>::len), Some(12));
    assert_eq!(hex::encode(&sections.runtime), "6001600055600b560000fe5b00");
    assert_eq!(hex::encode(&sections.trailer), "a165627a7a72305820deadbeef0029");
}

#[test]
fn runtime_cfg_resolves_its_jump() {
    let bytes = hex::decode(creation_code()).unwrap();
    let runtime = split_sections(&bytes).runtime;
    let cfg = build_cfg(&runtime, &AnalysisConfig::default()).unwrap();

    let entry = cfg.entry().unwrap();
    let target = cfg.block_starting_at(0x0b).unwrap();
    assert_eq!(cfg.all_outgoing(entry), vec![target]);

    let metrics = recovery(&cfg);
    assert_eq!(metrics.dead_blocks, 0);
    assert_eq!(free_storage_slot(&cfg).free, U256::from(1));
    assert_eq!(decode_bytes(&runtime).unwrap().len(), 10);
}

#[test]
fn file_input_is_decoded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("creation.hex");
    std::fs::write(&path, format!("0x{}\n", creation_code())).unwrap();

    let (instructions, info, bytes) = decode_bytecode(path.to_str().unwrap(), true).unwrap();
    assert_eq!(bytes, hex::decode(creation_code()).unwrap());
    assert_eq!(info.byte_length, bytes.len());
    assert_eq!(instructions[0].to_string(), "000000  PUSH1    0xd");
}
