//! Dataflow analyses over a recovered [`Cfg`](salve_core::cfg_ir::Cfg): the taint runner,
//! execution path enumeration, storage layout inference, the backtrace-driven inferences the
//! patch handlers rely on, and CFG recovery metrics.

pub mod inference;
pub mod metrics;
pub mod paths;
pub mod storage;
pub mod taint;

pub use inference::{
    access_control, backtrace, codecopy_sites, error_handler, error_sequence, infer_integer_type,
    AccessControl, IntegerType,
};
pub use metrics::{recovery, RecoveryMetrics};
pub use paths::{execution_paths, path_instructions, PathSelection};
pub use storage::{free_storage_slot, StorageLayout};
pub use taint::{Tainted, TaintRecord, TaintRunner};
