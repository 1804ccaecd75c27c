use crate::template::InsertMode;
use salve_analysis::RecoveryMetrics;
use salve_core::cfg_ir::FunctionAttributes;
use salve_core::U256;
use serde::{Deserialize, Serialize};

/// One rewrite as it was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    /// Removed instructions, as assembly.
    pub delete: String,
    /// Inserted instructions, as assembly, with jump targets filled in.
    pub insert: String,
    /// Placement of the insertion.
    pub insert_mode: InsertMode,
    /// Whether the deployment code was rewritten.
    pub constructor: bool,
}

/// The rewrites made for one bug at one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchEntry {
    /// Bug category, e.g. `integer_overflow`.
    pub bug_type: String,
    /// Decoded pc the rewrites were anchored at.
    pub pc: usize,
    /// Applied rewrites, in order.
    pub patch: Vec<PatchRecord>,
}

/// Summary of a patch run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchReport {
    /// Applied rewrites.
    pub patches: Vec<PatchEntry>,
    /// Bugs or rewrites that were skipped, and why.
    pub diagnostics: Vec<String>,
    /// Runtime size before patching, e.g. `"1024 bytes"`.
    pub original_size: String,
    /// Runtime size after patching.
    pub patched_size: String,
    /// Deployment code size before patching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_deployment_size: Option<String>,
    /// Deployment code size after patching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patched_deployment_size: Option<String>,
    /// Share of the runtime CFG recovered, e.g. `"100%"`.
    pub control_flow_graph_recovery: String,
    /// Seconds spent recovering the runtime CFG.
    pub control_flow_graph_recovery_time: f64,
    /// Seconds spent in the whole run.
    pub execution_time: f64,
    /// RFC 3339 time the run finished.
    pub timestamp: String,
}

/// A function as reported by inference mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionReport {
    /// Signature or selector.
    pub name: String,
    /// Pc of the entry block.
    pub start: usize,
    /// Number of blocks the function reaches.
    pub blocks: usize,
    /// Payable / view / pure.
    pub attributes: FunctionAttributes,
}

/// What inference mode learned about a contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceReport {
    /// Recovery with the lattice analysis only.
    pub recovery_without_symbolic: RecoveryMetrics,
    /// Recovery with the symbolic fallback enabled.
    pub recovery: RecoveryMetrics,
    /// Recovered functions, dispatcher excluded.
    pub functions: Vec<FunctionReport>,
    /// Storage slots the contract uses.
    pub used_storage_slots: Vec<U256>,
    /// First slot a patch would allocate.
    pub free_storage_slot: U256,
    /// Seconds spent in the whole run.
    pub execution_time: f64,
}

/// `"<n> bytes"`.
pub(crate) fn size_label(bytes: usize) -> String {
    format!("{bytes} bytes")
}
