use super::{BugHandler, PatchContext};
use crate::report::PatchEntry;
use crate::template::{Param, TemplateKind, TemplateParams};
use salve_core::bug::{Bug, BugType};
use salve_utils::errors::PatchError;

/// Reverts when an external call reports failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnhandledExceptionHandler;

impl BugHandler for UnhandledExceptionHandler {
    fn name(&self) -> &'static str {
        "unhandled_exception"
    }

    fn handles(&self, kind: &BugType) -> bool {
        *kind == BugType::UnhandledException
    }

    fn apply(&self, ctx: &mut PatchContext, bugs: &[Bug]) -> Result<Vec<PatchEntry>, PatchError> {
        let mut entries = Vec::new();
        for bug in bugs {
            let Some(node) = ctx.buggy_block(bug) else {
                continue;
            };
            let params = TemplateParams::new().with(Param::ErrorHandlingSequence, ctx.error_sequence(node));
            if let Some(entry) = ctx.apply_template(
                TemplateKind::UnhandledException,
                &params,
                bug.kind.report_name(),
                bug.pc,
            )? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}
