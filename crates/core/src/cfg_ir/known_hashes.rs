//! Canonical signatures of widely deployed functions, keyed by selector.

use std::collections::HashMap;
use std::sync::OnceLock;
use tiny_keccak::{Hasher, Keccak};

const SIGNATURES: &[&str] = &[
    // ERC-20
    "totalSupply()",
    "balanceOf(address)",
    "transfer(address,uint256)",
    "transferFrom(address,address,uint256)",
    "approve(address,uint256)",
    "allowance(address,address)",
    "name()",
    "symbol()",
    "decimals()",
    "increaseAllowance(address,uint256)",
    "decreaseAllowance(address,uint256)",
    "mint(address,uint256)",
    "burn(uint256)",
    "burnFrom(address,uint256)",
    // ERC-721
    "ownerOf(uint256)",
    "safeTransferFrom(address,address,uint256)",
    "safeTransferFrom(address,address,uint256,bytes)",
    "setApprovalForAll(address,bool)",
    "getApproved(uint256)",
    "isApprovedForAll(address,address)",
    "tokenURI(uint256)",
    "supportsInterface(bytes4)",
    // Ownable / Pausable
    "owner()",
    "transferOwnership(address)",
    "renounceOwnership()",
    "pause()",
    "unpause()",
    "paused()",
    // Wallets, crowdsales, misc
    "deposit()",
    "withdraw()",
    "withdraw(uint256)",
    "withdrawAll()",
    "kill()",
    "destroy()",
    "buyTokens(address)",
    "finalize()",
    "getBalance()",
    "setOwner(address)",
    "changeOwner(address)",
    "initWallet(address[],uint256,uint256)",
    "execute(address,uint256,bytes)",
];

/// Computes the 4-byte selector of a canonical function signature.
pub fn selector(signature: &str) -> u32 {
    let mut keccak = Keccak::v256();
    keccak.update(signature.as_bytes());
    let mut hash = [0u8; 32];
    keccak.finalize(&mut hash);
    u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]])
}

/// Canonical signature of a well-known selector.
pub fn lookup(selector_value: u32) -> Option<&'static str> {
    static TABLE: OnceLock<HashMap<u32, &'static str>> = OnceLock::new();
    TABLE
        .get_or_init(|| SIGNATURES.iter().map(|sig| (selector(sig), *sig)).collect())
        .get(&selector_value)
        .copied()
}
