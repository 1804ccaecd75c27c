//! Cross-crate tests: patched bytecode is executed in revm.
#![cfg(test)]

mod bytecode;
mod detectors;
mod evm;
mod patch;
