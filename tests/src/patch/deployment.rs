//! Patching full creation bytecode: constructor, runtime copy and trailer.

use crate::evm::{deploy_and_call, init_tracing};
use revm::context::result::ExecutionResult;
use salve_core::bug::{Bug, BugType};
use salve_core::sections::split_sections;
use salve_patch::{patch_bytecode, PatchConfig};

// Constructor: PUSH1 2 DUP1 PUSH1 0xc PUSH1 0 CODECOPY PUSH1 0 RETURN STOP
// Runtime:     CALLER SELFDESTRUCT
const DEPLOYED: &str = "600280600c6000396000f30033ff";

#[test]
fn deployer_becomes_the_owner() {
    init_tracing();
    let outcome = patch_bytecode(DEPLOYED, vec![Bug::new(1, BugType::Suicidal)], &PatchConfig::default()).unwrap();
    assert_eq!(outcome.report.patched_deployment_size.as_deref(), Some("16 bytes"));

    let patched = hex::decode(&outcome.patched_bytecode).unwrap();
    let sections = split_sections(&patched);
    let (runtime, result) = deploy_and_call(&outcome.patched_bytecode, &[]);
    assert_eq!(runtime, sections.runtime);
    assert!(matches!(result, ExecutionResult::Success { .. }), "{result:?}");
}

#[test]
fn unpatched_creation_code_is_returned_as_is() {
    let outcome = patch_bytecode(&format!("0x{DEPLOYED}"), Vec::new(), &PatchConfig::default()).unwrap();
    assert_eq!(outcome.patched_bytecode, DEPLOYED);
    assert_eq!(outcome.report.original_size, outcome.report.patched_size);

    let (runtime, _) = deploy_and_call(&outcome.patched_bytecode, &[]);
    assert_eq!(hex::encode(runtime), "33ff");
}
