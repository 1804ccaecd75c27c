//! Minimal revm harness.

use revm::bytecode::Bytecode;
use revm::context::result::{ExecutionResult, Output};
use revm::context::TxEnv;
use revm::database::InMemoryDB;
use revm::primitives::{Address, Bytes, TxKind, U256};
use revm::state::AccountInfo;
use revm::{Context, ExecuteCommitEvm, ExecuteEvm, MainBuilder, MainContext};
use std::collections::HashMap;

pub(crate) const CALLER: Address = Address::new([0x42; 20]);
pub(crate) const CONTRACT: Address = Address::new([0xc0; 20]);

/// Result of one call, with the contract storage it left behind.
pub(crate) struct Call {
    pub(crate) result: ExecutionResult,
    pub(crate) storage: HashMap<U256, U256>,
}

impl Call {
    pub(crate) fn succeeded(&self) -> bool {
        matches!(self.result, ExecutionResult::Success { .. })
    }

    pub(crate) fn reverted(&self) -> bool {
        matches!(self.result, ExecutionResult::Revert { .. })
    }
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Calls `runtime_hex` installed at [`CONTRACT`], with `storage` preset, from [`CALLER`].
pub(crate) fn call(runtime_hex: &str, storage: &[(U256, U256)], calldata: &[u8]) -> Call {
    let code = hex::decode(runtime_hex).unwrap();
    let mut db = InMemoryDB::default();
    db.insert_account_info(
        CONTRACT,
        AccountInfo::from_bytecode(Bytecode::new_raw(Bytes::from(code))),
    );
    for &(slot, value) in storage {
        db.insert_account_storage(CONTRACT, slot, value).unwrap();
    }

    let mut evm = Context::mainnet().with_db(db).build_mainnet();
    let tx = TxEnv {
        caller: CALLER,
        gas_limit: 1_000_000,
        kind: TxKind::Call(CONTRACT),
        data: Bytes::copy_from_slice(calldata),
        value: U256::ZERO,
        ..Default::default()
    };
    let outcome = evm.transact(tx).unwrap();
    let storage = outcome
        .state
        .get(&CONTRACT)
        .map(|account| {
            account
                .storage
                .iter()
                .map(|(slot, value)| (*slot, value.present_value))
                .collect()
        })
        .unwrap_or_default();
    Call {
        result: outcome.result,
        storage,
    }
}

/// Deploys `init_hex` from [`CALLER`], then calls the new contract once from the same account.
///
/// Returns the deployed runtime and the call result.
pub(crate) fn deploy_and_call(init_hex: &str, calldata: &[u8]) -> (Vec<u8>, ExecutionResult) {
    let mut evm = Context::mainnet()
        .with_db(InMemoryDB::default())
        .build_mainnet();

    let create = TxEnv {
        caller: CALLER,
        gas_limit: 30_000_000,
        kind: TxKind::Create,
        data: Bytes::from(hex::decode(init_hex).unwrap()),
        value: U256::ZERO,
        ..Default::default()
    };
    let (runtime, address) = match evm.transact_commit(create).unwrap() {
        ExecutionResult::Success {
            output: Output::Create(bytes, Some(address)),
            ..
        } => (bytes.to_vec(), address),
        other => panic!("deployment failed: {other:?}"),
    };

    let call = TxEnv {
        caller: CALLER,
        gas_limit: 1_000_000,
        kind: TxKind::Call(address),
        data: Bytes::copy_from_slice(calldata),
        value: U256::ZERO,
        nonce: 1,
        ..Default::default()
    };
    (runtime, evm.transact_commit(call).unwrap())
}

/// Two calldata words whose low bytes are `a` and `b`.
pub(crate) fn two_words(a: u8, b: u8) -> Vec<u8> {
    let mut data = vec![0u8; 64];
    data[31] = a;
    data[63] = b;
    data
}
