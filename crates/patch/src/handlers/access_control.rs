use super::{is_push, lowest_constant, BugHandler, PatchContext};
use crate::report::PatchEntry;
use crate::template::{Param, RenderedPatch, TemplateKind, TemplateParams};
use salve_analysis::{access_control, backtrace, execution_paths, path_instructions, PathSelection, TaintRunner};
use salve_core::bug::{Bug, BugType};
use salve_core::cfg_ir::Cfg;
use salve_core::encoder::push;
use salve_core::opcode::Opcode;
use salve_core::U256;
use salve_utils::errors::PatchError;
use std::collections::HashMap;
use tracing::debug;

/// Restricts a sensitive instruction to an owner recorded at deployment.
///
/// The deployment code stores `CALLER` in a fresh slot, and the runtime reverts unless the
/// caller matches it. When the function is already guarded by an owner check, the writes that
/// can change that owner without a check are guarded instead.
#[derive(Debug, Clone)]
pub struct AccessControlHandler {
    kind: BugType,
}

impl AccessControlHandler {
    /// Handler for bugs of `kind`.
    pub const fn new(kind: BugType) -> Self {
        Self { kind }
    }
}

impl BugHandler for AccessControlHandler {
    fn name(&self) -> &'static str {
        match self.kind {
            BugType::LeakingEther => "leaking_ether",
            BugType::Suicidal => "suicidal",
            BugType::UnsafeDelegatecall => "unsafe_delegatecall",
            _ => "access_control",
        }
    }

    fn handles(&self, kind: &BugType) -> bool {
        *kind == self.kind
    }

    fn apply(&self, ctx: &mut PatchContext, bugs: &[Bug]) -> Result<Vec<PatchEntry>, PatchError> {
        let mut entries = Vec::new();
        for bug in bugs {
            let Some(node) = ctx.buggy_block(bug) else {
                continue;
            };

            let guard = access_control(&backtrace(&ctx.runtime, node, bug.pc));
            let targets = if guard.is_complete() {
                let owner = guard.owner_slot_value();
                debug!("pc 0x{:x} is guarded by the owner in slot {owner:?}", bug.pc);
                unprotected_writes(&ctx.runtime, owner)
            } else {
                vec![bug.pc]
            };
            if targets.is_empty() {
                ctx.skip(format!(
                    "{} at pc 0x{:x}: every write to the owner slot is already guarded",
                    bug.kind, bug.pc
                ));
                continue;
            }

            let slot = ctx.storage.allocate();
            let params = TemplateParams::new()
                .with(Param::FreeStorageLocation, vec![push(slot)])
                .with(Param::ErrorHandlingSequence, ctx.error_sequence(node));
            let (constructor, runtime): (Vec<RenderedPatch>, Vec<RenderedPatch>) = ctx
                .render(TemplateKind::AccessControl, &params)?
                .into_iter()
                .partition(|patch| patch.constructor);

            match ctx.constructor.as_ref().map(|constructor| constructor.codecopy.pc) {
                Some(codecopy) => {
                    let patch = constructor
                        .iter()
                        .filter_map(|patch| ctx.apply_constructor(patch))
                        .collect::<Vec<_>>();
                    if !patch.is_empty() {
                        entries.push(PatchEntry {
                            bug_type: bug.kind.report_name(),
                            pc: codecopy,
                            patch,
                        });
                    }
                }
                None => ctx.skip(format!(
                    "{} at pc 0x{:x}: no deployment code, owner slot 0x{slot:x} is never initialised",
                    bug.kind, bug.pc
                )),
            }

            for target in targets {
                let patch = runtime
                    .iter()
                    .filter_map(|patch| ctx.apply_runtime(patch, target))
                    .collect::<Vec<_>>();
                if !patch.is_empty() {
                    entries.push(PatchEntry {
                        bug_type: bug.kind.report_name(),
                        pc: target,
                        patch,
                    });
                }
            }
        }
        Ok(entries)
    }
}

/// Pcs of the `SSTORE`s to `owner` that no owner check guards, on any path from the entry.
fn unprotected_writes(cfg: &Cfg, owner: Option<U256>) -> Vec<usize> {
    let Some(entry) = cfg.entry() else {
        return Vec::new();
    };
    let mut guarded: HashMap<usize, bool> = HashMap::new();
    let mut targets = Vec::new();

    for path in execution_paths(cfg, entry, PathSelection::All) {
        let mut runner = TaintRunner::new();
        for ins in path_instructions(cfg, &path) {
            if is_push(ins) {
                runner.introduce_taint(ins, ins);
                continue;
            }
            if ins.opcode == Opcode::SSTORE && lowest_constant(&runner, ins) == owner {
                if let Some(pc) = ins.original_pc() {
                    let is_guarded = *guarded.entry(pc).or_insert_with(|| {
                        cfg.block_containing(pc)
                            .is_some_and(|node| access_control(&backtrace(cfg, node, pc)).is_complete())
                    });
                    if !is_guarded {
                        targets.push(pc);
                    }
                }
            }
            runner.propagate_taint(ins);
        }
    }
    targets.sort_unstable();
    targets.dedup();
    targets
}
