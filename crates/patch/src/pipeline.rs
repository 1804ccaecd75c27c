//! End-to-end patch run: split the blob, recover the CFGs, apply the handlers, relocate and
//! reassemble.

use crate::handlers::{default_handlers, is_push, CodeCopy, Constructor, PatchContext};
use crate::patcher::asm;
use crate::relocation::{relinearize, resolve, RelocationTable};
use crate::report::{size_label, FunctionReport, InferenceReport, PatchEntry, PatchRecord, PatchReport};
use crate::template::InsertMode;
use crate::PatchConfig;
use salve_analysis::{free_storage_slot, recovery};
use salve_core::bug::{dedup_and_sort, Bug};
use salve_core::cfg_ir::{build_cfg, AnalysisConfig, BasicBlock, Cfg, FunctionKey};
use salve_core::decoder::{input_to_bytes, Instruction};
use salve_core::encoder::{encode, push_width};
use salve_core::opcode::Opcode;
use salve_core::sections::split_sections;
use salve_core::U256;
use salve_utils::errors::PatchError;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

/// Patched bytecode with the report describing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchOutcome {
    /// Deployment code, runtime and trailer, hex encoded without prefix.
    pub patched_bytecode: String,
    /// What was changed and what was skipped.
    pub report: PatchReport,
}

/// Patches every bug in `bugs` into the bytecode `input` (hex, optionally `0x` prefixed).
///
/// Duplicate bugs are dropped. Without bugs the bytecode is returned unchanged.
///
/// # Errors
/// Undecodable input, a runtime without basic blocks, deployment code without the runtime
/// copy, or a broken template override.
pub fn patch_bytecode(input: &str, bugs: Vec<Bug>, config: &PatchConfig) -> Result<PatchOutcome, PatchError> {
    let started = Instant::now();
    let bytes = input_to_bytes(input, false)?;
    let sections = split_sections(&bytes);

    let cfg_started = Instant::now();
    let runtime = build_cfg(&sections.runtime, &config.analysis)?;
    let cfg_time = cfg_started.elapsed().as_secs_f64();
    let metrics = recovery(&runtime);
    info!(
        "Recovered {} of the control-flow graph in {cfg_time:.3}s",
        metrics.percentage_label()
    );

    let mut report = PatchReport {
        original_size: size_label(sections.runtime.len()),
        original_deployment_size: sections.deployment.as_ref().map(|code| size_label(code.len())),
        control_flow_graph_recovery: metrics.percentage_label(),
        control_flow_graph_recovery_time: cfg_time,
        ..PatchReport::default()
    };

    let bugs = dedup_and_sort(bugs);
    if bugs.is_empty() {
        info!("No bugs to patch, bytecode left unchanged");
        report.patched_size = report.original_size.clone();
        report.patched_deployment_size = report.original_deployment_size.clone();
        return Ok(finish(hex::encode(&bytes), report, started));
    }

    let constructor = match &sections.deployment {
        Some(code) => {
            let cfg = build_cfg(code, &config.analysis)?;
            let codecopy = CodeCopy::locate(&cfg)?;
            debug!("Runtime copied by CODECOPY at pc 0x{:x}", codecopy.pc);
            Some(Constructor { cfg, codecopy })
        }
        None => None,
    };

    let storage = free_storage_slot(&runtime);
    debug!("Storage slots in use: {:?}, first free: 0x{:x}", storage.used, storage.free);
    let mut ctx = PatchContext::new(runtime, constructor, storage);
    ctx.error_handling_inference = config.error_handling_inference;
    ctx.templates_dir = config.templates_dir.clone();

    let handlers = default_handlers();
    for handler in &handlers {
        let selected: Vec<Bug> = bugs
            .iter()
            .filter(|bug| handler.handles(&bug.kind))
            .cloned()
            .collect();
        if selected.is_empty() {
            continue;
        }
        info!("Patching {} {} bug(s)", selected.len(), handler.name());
        let entries = handler.apply(&mut ctx, &selected)?;
        report.patches.extend(entries);
    }
    for bug in &bugs {
        if !handlers.iter().any(|handler| handler.handles(&bug.kind)) {
            ctx.skip(format!("bug type '{}' at pc 0x{:x} is not supported", bug.kind, bug.pc));
        }
    }

    let diagnostics = relinearize(&mut ctx.runtime);
    ctx.diagnostics.extend(diagnostics);
    let patched_runtime = encode(&linear(&ctx.runtime))?;
    report.patched_size = size_label(patched_runtime.len());

    let mut patched = Vec::with_capacity(bytes.len());
    if let Some(mut constructor) = ctx.constructor.take() {
        let (record, diagnostics) = retarget_codecopy(&mut constructor, patched_runtime.len() + sections.trailer.len())?;
        ctx.diagnostics.extend(diagnostics);
        if record.delete != record.insert {
            report.patches.push(PatchEntry {
                bug_type: "codecopy".into(),
                pc: constructor.codecopy.pc,
                patch: vec![record],
            });
        }
        let deployment = encode(&linear(&constructor.cfg))?;
        report.patched_deployment_size = Some(size_label(deployment.len()));
        patched.extend(deployment);
    }
    patched.extend(patched_runtime);
    patched.extend(&sections.trailer);

    report.diagnostics = ctx.diagnostics;
    info!(
        "Applied {} patch(es), runtime {} -> {}",
        report.patches.len(),
        report.original_size,
        report.patched_size
    );
    Ok(finish(hex::encode(patched), report, started))
}

/// Reports what the analyses recover from `input` without patching it.
///
/// # Errors
/// Undecodable input or a runtime without basic blocks.
pub fn infer(input: &str, config: &PatchConfig) -> Result<InferenceReport, PatchError> {
    let started = Instant::now();
    let bytes = input_to_bytes(input, false)?;
    let sections = split_sections(&bytes);

    let lattice_only = AnalysisConfig {
        symbolic_stack_analysis: false,
        ..config.analysis
    };
    let recovery_without_symbolic = recovery(&build_cfg(&sections.runtime, &lattice_only)?);
    let with_symbolic = AnalysisConfig {
        symbolic_stack_analysis: true,
        ..config.analysis
    };
    let cfg = build_cfg(&sections.runtime, &with_symbolic)?;
    let metrics = recovery(&cfg);
    info!(
        "Recovered {} of the control-flow graph ({} without symbolic execution)",
        metrics.percentage_label(),
        recovery_without_symbolic.percentage_label()
    );

    let functions = cfg
        .functions
        .values()
        .filter(|function| function.key != FunctionKey::Dispatcher)
        .map(|function| FunctionReport {
            name: function.name.clone(),
            start: function.start,
            blocks: function.blocks.len(),
            attributes: function.attributes,
        })
        .collect();
    let storage = free_storage_slot(&cfg);

    Ok(InferenceReport {
        recovery_without_symbolic,
        recovery: metrics,
        functions,
        used_storage_slots: storage.used.into_iter().collect(),
        free_storage_slot: storage.free,
        execution_time: started.elapsed().as_secs_f64(),
    })
}

fn finish(patched_bytecode: String, mut report: PatchReport, started: Instant) -> PatchOutcome {
    report.execution_time = started.elapsed().as_secs_f64();
    report.timestamp = chrono::Utc::now().to_rfc3339();
    PatchOutcome {
        patched_bytecode,
        report,
    }
}

fn linear(cfg: &Cfg) -> Vec<Instruction> {
    cfg.blocks_in_order()
        .into_iter()
        .flat_map(|node| cfg.block(node).instructions.iter().cloned())
        .collect()
}

/// Relocates the deployment code and rewrites `PUSH len DUP1 PUSH offset PUSH 0 CODECOPY` so
/// it copies `copied_len` bytes starting right after the deployment code.
///
/// The offset is the deployment code's own size, which grows when a `PUSH` has to widen, so
/// the layout is repeated until both operands are stable.
fn retarget_codecopy(constructor: &mut Constructor, copied_len: usize) -> Result<(PatchRecord, Vec<String>), PatchError> {
    let cfg = &mut constructor.cfg;
    let pc = constructor.codecopy.pc;
    let node = cfg.block_containing(pc).ok_or(PatchError::MissingCodeCopy)?;
    let index = cfg
        .block(node)
        .instructions
        .iter()
        .position(|ins| ins.original_pc() == Some(pc))
        .ok_or(PatchError::MissingCodeCopy)?;
    let run = index.checked_sub(4).ok_or(PatchError::MissingCodeCopy)?;
    {
        let block = &cfg.block(node).instructions;
        if !(is_push(&block[run]) && block[run + 1].opcode == Opcode::DUP(1) && is_push(&block[run + 2])) {
            return Err(PatchError::MissingCodeCopy);
        }
    }

    let mut table = RelocationTable::full(cfg);
    table
        .references
        .retain(|reference| reference.push.node != node || (reference.push.index != run && reference.push.index != run + 2));
    let before = asm(&cfg.block(node).instructions[run..=index]);

    loop {
        resolve(cfg, &table.references);
        let deployment_len: usize = cfg.graph.node_weights().map(BasicBlock::byte_size).sum();
        let block = &mut cfg.block_mut(node).instructions;
        let len_changed = set_operand(&mut block[run], copied_len);
        let offset_changed = set_operand(&mut block[run + 2], deployment_len);
        if !(len_changed || offset_changed) {
            break;
        }
    }

    let after = asm(&cfg.block(node).instructions[run..=index]);
    debug!("Runtime copy: [{before}] -> [{after}]");
    let mut diagnostics = table.unresolved;
    diagnostics.extend(
        table
            .conflicts
            .iter()
            .map(|pc| format!("several inserted JUMPDESTs claim constructor address 0x{pc:x}")),
    );
    let record = PatchRecord {
        delete: before,
        insert: after,
        insert_mode: InsertMode::Before,
        constructor: true,
    };
    Ok((record, diagnostics))
}

/// Sets the value of `push`, widening it when needed. Returns whether it changed.
fn set_operand(push: &mut Instruction, value: usize) -> bool {
    let value = U256::from(value);
    if push.push_value() == Some(value) {
        return false;
    }
    let width = match push.opcode {
        Opcode::PUSH(n) => n,
        _ => 0,
    };
    push.opcode = Opcode::PUSH(width.max(push_width(value)));
    push.imm = Some(value);
    true
}
