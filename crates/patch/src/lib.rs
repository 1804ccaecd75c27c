//! Bytecode patching: templates, in-place CFG rewriting, jump relocation, the per-bug
//! handlers and the end-to-end pipeline.

pub mod handlers;
pub mod patcher;
pub mod pipeline;
pub mod relocation;
pub mod report;
pub mod template;

pub use handlers::{default_handlers, BugHandler, PatchContext};
pub use pipeline::{infer, patch_bytecode, PatchOutcome};
pub use report::{InferenceReport, PatchEntry, PatchRecord, PatchReport};
pub use template::{InsertMode, PatchTemplate, RenderedPatch, TemplateKind, TemplateParams};

use salve_core::cfg_ir::AnalysisConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration of a patch run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchConfig {
    /// CFG recovery settings, used for both the runtime and the deployment code
    pub analysis: AnalysisConfig,
    /// Reuse the contract's own error handlers in inserted checks
    pub error_handling_inference: bool,
    /// Directory whose `<template>.jsonl` files replace the built-in templates
    pub templates_dir: Option<PathBuf>,
}
