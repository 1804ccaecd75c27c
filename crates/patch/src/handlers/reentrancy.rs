//! Reentrancy locks.
//!
//! Bugs are grouped by the function they were reported in. Each group gets one lock slot:
//! the reported calls take the lock before running and release it afterwards, and every
//! other function writing a slot the origin function writes takes the same lock around its
//! writes.

use super::{is_push, lowest_constant, BugHandler, PatchContext};
use crate::report::PatchEntry;
use crate::template::{InsertMode, Param, RenderedPatch, TemplateKind, TemplateParams};
use petgraph::graph::NodeIndex;
use salve_analysis::{execution_paths, path_instructions, PathSelection, TaintRunner};
use salve_core::bug::{Bug, BugType};
use salve_core::cfg_ir::{Cfg, FunctionKey};
use salve_core::encoder::push;
use salve_core::opcode::Opcode;
use salve_core::U256;
use salve_utils::errors::PatchError;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Wraps reentrant calls, and the writes they can race with, in a storage lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReentrancyHandler;

impl BugHandler for ReentrancyHandler {
    fn name(&self) -> &'static str {
        "reentrancy"
    }

    fn handles(&self, kind: &BugType) -> bool {
        *kind == BugType::Reentrancy
    }

    fn apply(&self, ctx: &mut PatchContext, bugs: &[Bug]) -> Result<Vec<PatchEntry>, PatchError> {
        let writes = function_writes(&ctx.runtime);

        let mut groups: BTreeMap<Option<usize>, Vec<(&Bug, NodeIndex)>> = BTreeMap::new();
        for bug in bugs {
            let Some(node) = ctx.buggy_block(bug) else {
                continue;
            };
            let origin = ctx
                .runtime
                .function_containing(bug.pc)
                .filter(|function| is_selected(function.key))
                .map(|function| function.start);
            groups.entry(origin).or_default().push((bug, node));
        }

        let mut entries = Vec::new();
        for (origin, group) in groups {
            let Some(&(_, node)) = group.first() else {
                continue;
            };
            let slot = ctx.storage.allocate();
            let params = TemplateParams::new()
                .with(Param::FreeStorageLocation, vec![push(slot)])
                .with(Param::ErrorHandlingSequence, ctx.error_sequence(node));
            let patches = ctx.render(TemplateKind::Reentrancy, &params)?;

            let mut planned: BTreeMap<usize, Vec<RenderedPatch>> = BTreeMap::new();
            let mut plan = |address: usize, patch: &RenderedPatch| {
                let at = planned.entry(address).or_default();
                if !at.contains(patch) {
                    at.push(patch.clone());
                }
            };

            if let Some(origin) = origin {
                for (first, last) in cross_function_writes(&writes, origin) {
                    for patch in &patches {
                        match patch.insert_mode {
                            InsertMode::Before => plan(first, patch),
                            InsertMode::After => plan(last, patch),
                        }
                    }
                }
            }
            for (bug, _) in &group {
                for patch in &patches {
                    plan(bug.pc, patch);
                }
            }
            debug!(
                "Reentrancy lock in slot 0x{slot:x} for {} bug(s) at {} address(es)",
                group.len(),
                planned.len()
            );

            for (address, patches) in planned {
                let mut entry = PatchEntry {
                    bug_type: BugType::Reentrancy.report_name(),
                    pc: address,
                    patch: Vec::new(),
                };
                for patch in &patches {
                    if let Some(record) = ctx.apply_runtime(patch, address) {
                        entry.patch.push(record);
                    }
                }
                if !entry.patch.is_empty() {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }
}

const fn is_selected(key: FunctionKey) -> bool {
    matches!(key, FunctionKey::Selector { .. })
}

/// `(slot, SSTORE pc)` pairs written by every selected function, keyed by function start.
fn function_writes(cfg: &Cfg) -> BTreeMap<usize, Vec<(U256, usize)>> {
    cfg.functions
        .values()
        .filter(|function| is_selected(function.key))
        .map(|function| (function.start, storage_writes(cfg, function.entry)))
        .collect()
}

/// Storage writes on every path from `entry`. The slot of an `SSTORE` is the smallest `PUSH`
/// constant its operands depend on.
fn storage_writes(cfg: &Cfg, entry: NodeIndex) -> Vec<(U256, usize)> {
    let mut writes = Vec::new();
    for path in execution_paths(cfg, entry, PathSelection::All) {
        let mut runner = TaintRunner::new();
        for ins in path_instructions(cfg, &path) {
            if is_push(ins) {
                runner.introduce_taint(ins, ins);
                continue;
            }
            if ins.opcode == Opcode::SSTORE {
                if let (Some(slot), Some(pc)) = (lowest_constant(&runner, ins), ins.original_pc()) {
                    if !writes.contains(&(slot, pc)) {
                        writes.push((slot, pc));
                    }
                }
            }
            runner.propagate_taint(ins);
        }
    }
    writes
}

/// For every function other than `origin` that writes a slot `origin` writes, the first and
/// last pc of those writes.
fn cross_function_writes(writes: &BTreeMap<usize, Vec<(U256, usize)>>, origin: usize) -> Vec<(usize, usize)> {
    let origin_slots: BTreeSet<U256> = writes
        .get(&origin)
        .map(|writes| writes.iter().map(|&(slot, _)| slot).collect())
        .unwrap_or_default();

    writes
        .iter()
        .filter(|&(&start, _)| start != origin)
        .filter_map(|(_, writes)| {
            let pcs = writes
                .iter()
                .filter(|(slot, _)| origin_slots.contains(slot))
                .map(|&(_, pc)| pc);
            let first = pcs.clone().min()?;
            let last = pcs.max()?;
            Some((first, last))
        })
        .collect()
}
