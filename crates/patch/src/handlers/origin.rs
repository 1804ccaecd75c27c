use super::{BugHandler, PatchContext};
use crate::report::PatchEntry;
use crate::template::{TemplateKind, TemplateParams};
use salve_core::bug::{Bug, BugType};
use salve_utils::errors::PatchError;

/// Replaces `ORIGIN` with `CALLER`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionOriginHandler;

impl BugHandler for TransactionOriginHandler {
    fn name(&self) -> &'static str {
        "transaction_origin"
    }

    fn handles(&self, kind: &BugType) -> bool {
        *kind == BugType::TransactionOrigin
    }

    fn apply(&self, ctx: &mut PatchContext, bugs: &[Bug]) -> Result<Vec<PatchEntry>, PatchError> {
        let mut entries = Vec::new();
        for bug in bugs {
            if ctx.buggy_block(bug).is_none() {
                continue;
            }
            if let Some(entry) = ctx.apply_template(
                TemplateKind::TransactionOrigin,
                &TemplateParams::new(),
                bug.kind.report_name(),
                bug.pc,
            )? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}
