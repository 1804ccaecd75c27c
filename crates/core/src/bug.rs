//! Vulnerability reports exchanged between the detectors and the patcher.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Category of a reported vulnerability.
///
/// Serialized with the names the detectors emit (`"overflow"`, `"unhandled exception"`, ...).
/// Names salve has no patch for are kept verbatim in [`BugType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BugType {
    /// Integer overflow in `ADD` or `MUL`.
    Overflow,
    /// Integer underflow in `SUB`.
    Underflow,
    /// State written after an external call.
    Reentrancy,
    /// Return value of an external call is ignored.
    UnhandledException,
    /// Anyone can withdraw ether.
    LeakingEther,
    /// Anyone can self-destruct the contract.
    Suicidal,
    /// Delegatecall to a caller-controlled address.
    UnsafeDelegatecall,
    /// Authorization through `tx.origin`.
    TransactionOrigin,
    /// Any other detector finding.
    Other(String),
}

impl BugType {
    /// Detector-facing name of the category.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Overflow => "overflow",
            Self::Underflow => "underflow",
            Self::Reentrancy => "reentrancy",
            Self::UnhandledException => "unhandled exception",
            Self::LeakingEther => "leaking ether",
            Self::Suicidal => "suicidal",
            Self::UnsafeDelegatecall => "unsafe delegatecall",
            Self::TransactionOrigin => "transaction origin",
            Self::Other(name) => name,
        }
    }

    /// Name used for this category in patch reports.
    pub fn report_name(&self) -> String {
        match self {
            Self::Overflow => "integer_overflow".into(),
            Self::Underflow => "integer_underflow".into(),
            other => other.as_str().replace(' ', "_"),
        }
    }
}

impl From<String> for BugType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "overflow" => Self::Overflow,
            "underflow" => Self::Underflow,
            "reentrancy" => Self::Reentrancy,
            "unhandled exception" => Self::UnhandledException,
            "leaking ether" => Self::LeakingEther,
            "suicidal" => Self::Suicidal,
            "unsafe delegatecall" => Self::UnsafeDelegatecall,
            "transaction origin" => Self::TransactionOrigin,
            _ => Self::Other(name),
        }
    }
}

impl From<BugType> for String {
    fn from(kind: BugType) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for BugType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vulnerability reported by an external detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bug {
    /// Percentage of code the detector covered.
    #[serde(default)]
    pub code_coverage: f64,
    /// Detector run time in seconds.
    #[serde(default)]
    pub execution_time: f64,
    /// Name of the reporting detector.
    #[serde(default)]
    pub tool: String,
    /// Runtime PC of the vulnerable instruction.
    pub pc: usize,
    /// Vulnerability category.
    #[serde(rename = "type")]
    pub kind: BugType,
    /// Mnemonic of the vulnerable instruction, when the detector reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opcode: Option<String>,
}

impl Bug {
    /// A bug with no detector metadata.
    pub fn new(pc: usize, kind: BugType) -> Self {
        Self {
            code_coverage: 0.0,
            execution_time: 0.0,
            tool: String::new(),
            pc,
            kind,
            opcode: None,
        }
    }

    /// Sets the reported opcode.
    pub fn with_opcode(mut self, opcode: impl Into<String>) -> Self {
        self.opcode = Some(opcode.into());
        self
    }
}

/// Drops bugs reported twice for the same `(pc, type)` and orders the rest by pc.
///
/// The first report of a duplicate wins; the sort is stable so reports at the same pc keep
/// their input order.
pub fn dedup_and_sort(bugs: Vec<Bug>) -> Vec<Bug> {
    let mut seen = HashSet::new();
    let mut unique: Vec<Bug> = bugs
        .into_iter()
        .filter(|bug| seen.insert((bug.pc, bug.kind.clone())))
        .collect();
    unique.sort_by_key(|bug| bug.pc);
    unique
}
