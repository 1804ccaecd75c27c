//! In-place application of a rendered patch to a CFG.

use crate::relocation::{resolve, Loc, Reference, RelocationTable};
use crate::template::{InsertMode, PatchOp, RenderedPatch};
use salve_core::cfg_ir::Cfg;
use salve_core::decoder::Instruction;
use salve_core::opcode::Opcode;
use salve_core::U256;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Outcome of [`apply_patch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Application {
    /// The patch was spliced in; these are the inserted instructions at their final place.
    Applied {
        /// Inserted instructions, jump labels resolved.
        inserted: Vec<Instruction>,
    },
    /// Nothing matched; the CFG is unchanged.
    NotApplied,
}

/// Applies `patch` at the instruction decoded at `target_pc`.
///
/// The block whose decoded range holds `target_pc` is searched for the delete pattern,
/// preferring a match that covers `target_pc`. With an empty delete pattern the insertion goes
/// right before or after the instruction at `target_pc`. Afterwards every instruction gets its
/// new current pc and every inserted jump, old or new, points at its label again.
///
/// A missing block, instruction or delete match leaves the CFG untouched.
pub fn apply_patch(cfg: &mut Cfg, patch: &RenderedPatch, target_pc: usize) -> Application {
    let Some(node) = cfg.block_containing(target_pc) else {
        warn!("No basic block contains pc 0x{target_pc:x}, patch not applied");
        return Application::NotApplied;
    };
    let Some((start, deleted)) = splice_point(&cfg.block(node).instructions, patch, target_pc) else {
        warn!(
            "Delete pattern [{}] not found at pc 0x{target_pc:x}, patch not applied",
            asm(&patch.delete)
        );
        return Application::NotApplied;
    };

    let mut table = RelocationTable::inserted(cfg);
    let (insert, labels) = materialize(&patch.insert);
    let inserted = insert.len();

    cfg.block_mut(node)
        .instructions
        .splice(start..start + deleted, insert);
    table.splice(node, start, deleted, inserted);
    table
        .references
        .extend(labels.into_iter().map(|(push, target)| Reference {
            push: Loc {
                node,
                index: start + push,
            },
            target: Loc {
                node,
                index: start + target,
            },
        }));
    resolve(cfg, &table.references);

    let inserted = cfg.block(node).instructions[start..start + inserted].to_vec();
    debug!(
        "Patched pc 0x{target_pc:x}: -[{}] +[{}]",
        asm(&patch.delete),
        asm(&inserted)
    );
    Application::Applied { inserted }
}

fn splice_point(block: &[Instruction], patch: &RenderedPatch, target_pc: usize) -> Option<(usize, usize)> {
    let anchor = block
        .iter()
        .position(|ins| ins.original_pc() == Some(target_pc));

    if patch.delete.is_empty() {
        let anchor = anchor?;
        return Some(match patch.insert_mode {
            InsertMode::Before => (anchor, 0),
            InsertMode::After => (anchor + 1, 0),
        });
    }

    let len = patch.delete.len();
    let runs = matching_runs(block, &patch.delete);
    let start = anchor
        .and_then(|anchor| {
            runs.iter()
                .copied()
                .find(|&run| run <= anchor && anchor < run + len)
        })
        .or_else(|| runs.first().copied())?;
    Some((start, len))
}

/// Start indices of every run of `block` equal to `pattern`, found with a two-pointer scan
/// that restarts one past the start of a failed partial match.
fn matching_runs(block: &[Instruction], pattern: &[Instruction]) -> Vec<usize> {
    let mut runs = Vec::new();
    if pattern.is_empty() {
        return runs;
    }
    let (mut i, mut j) = (0, 0);
    while i < block.len() {
        if same_instruction(&block[i], &pattern[j]) {
            i += 1;
            j += 1;
            if j == pattern.len() {
                runs.push(i - j);
                i = i - j + 1;
                j = 0;
            }
        } else {
            i = i - j + 1;
            j = 0;
        }
    }
    runs
}

fn same_instruction(ins: &Instruction, pattern: &Instruction) -> bool {
    ins.opcode == pattern.opcode && (pattern.imm.is_none() || ins.push_value() == pattern.push_value())
}

/// Turns rendered ops into instructions. Returns the `(push, jumpdest)` index pairs of the
/// label references, relative to the start of the insertion.
fn materialize(ops: &[PatchOp]) -> (Vec<Instruction>, Vec<(usize, usize)>) {
    let mut instructions = Vec::with_capacity(ops.len());
    let mut jumps: Vec<(usize, &str)> = Vec::new();
    let mut labels: HashMap<&str, usize> = HashMap::new();

    for op in ops {
        match op {
            PatchOp::Instruction(ins) => instructions.push(Instruction::new(ins.opcode, ins.imm)),
            PatchOp::JumpRef(id) => {
                jumps.push((instructions.len(), id));
                instructions.push(Instruction::new(Opcode::PUSH(1), Some(U256::ZERO)));
            }
            PatchOp::Label(id) => {
                labels.insert(id, instructions.len());
                instructions.push(Instruction::new(Opcode::JUMPDEST, None));
            }
        }
    }

    let references = jumps
        .into_iter()
        .filter_map(|(push, id)| Some((push, *labels.get(id)?)))
        .collect();
    (instructions, references)
}

/// Space separated assembly of `instructions`.
pub fn asm(instructions: &[Instruction]) -> String {
    instructions
        .iter()
        .map(Instruction::asm)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relocation::relinearize;
    use crate::template::{parse_templates, TemplateParams};
    use salve_core::cfg_ir::{build_cfg, AnalysisConfig};
    use salve_core::encoder::encode;

    fn build(code: &str) -> Cfg {
        build_cfg(&hex::decode(code).unwrap(), &AnalysisConfig::default()).unwrap()
    }

    fn bytes(cfg: &Cfg) -> String {
        let instructions: Vec<Instruction> = cfg
            .blocks_in_order()
            .into_iter()
            .flat_map(|node| cfg.block(node).instructions.clone())
            .collect();
        hex::encode(encode(&instructions).unwrap())
    }

    fn patch(record: &str) -> RenderedPatch {
        parse_templates(record).unwrap()[0]
            .render(&TemplateParams::new())
            .unwrap()
    }

    // 00: PUSH1 1 | 02: PUSH1 2 | 04: ADD | 05: STOP
    const ADD: &str = "600160020100";

    #[test]
    fn insertion_with_label_before_target() {
        let mut cfg = build(ADD);
        let outcome = apply_patch(
            &mut cfg,
            &patch(r#"{"insert": "PUSH_jump_loc1 JUMP JUMPDEST_jump_loc1"}"#),
            4,
        );
        let Application::Applied { inserted } = outcome else {
            panic!("patch not applied");
        };
        assert_eq!(asm(&inserted), "PUSH1 0x7 JUMP JUMPDEST");
        assert_eq!(bytes(&cfg), "600160026007565b0100");
    }

    #[test]
    fn insertion_after_target() {
        let mut cfg = build(ADD);
        apply_patch(
            &mut cfg,
            &patch(r#"{"insert": "CALLER POP", "insert_mode": "after"}"#),
            4,
        );
        assert_eq!(bytes(&cfg), "6001600201335000");
    }

    #[test]
    fn delete_prefers_the_run_at_the_target() {
        // ORIGIN POP ORIGIN POP STOP
        let mut cfg = build("3250325000");
        apply_patch(&mut cfg, &patch(r#"{"delete": "ORIGIN", "insert": "CALLER"}"#), 2);
        assert_eq!(bytes(&cfg), "3250335000");
    }

    #[test]
    fn unmatched_delete_is_not_applied() {
        let mut cfg = build(ADD);
        let outcome = apply_patch(&mut cfg, &patch(r#"{"delete": "CALLVALUE", "insert": "CALLER"}"#), 4);
        assert_eq!(outcome, Application::NotApplied);
        assert_eq!(bytes(&cfg), ADD);

        let outcome = apply_patch(&mut cfg, &patch(r#"{"insert": "CALLER"}"#), 0x40);
        assert_eq!(outcome, Application::NotApplied);
    }

    #[test]
    fn two_pointer_scan_restarts_after_false_start() {
        let ops = |code: &str| -> Vec<Instruction> {
            salve_core::decoder::decode_bytes(&hex::decode(code).unwrap()).unwrap()
        };
        // DUP1 DUP1 DUP2 against DUP1 DUP2
        assert_eq!(matching_runs(&ops("808081"), &ops("8081")), vec![1]);
        assert_eq!(matching_runs(&ops("80818081"), &ops("8081")), vec![0, 2]);
        assert!(matching_runs(&ops("8080"), &ops("8081")).is_empty());
    }

    #[test]
    fn earlier_labels_move_with_later_patches() {
        let mut cfg = build(ADD);
        apply_patch(
            &mut cfg,
            &patch(r#"{"insert": "PUSH_jump_loc1 JUMP JUMPDEST_jump_loc1"}"#),
            4,
        );
        apply_patch(&mut cfg, &patch(r#"{"insert": "CALLER POP"}"#), 2);
        assert_eq!(bytes(&cfg), "6001335060026009565b0100");
    }

    #[test]
    fn decoded_jumps_are_fixed_by_relinearization() {
        // PUSH1 1 PUSH1 2 ADD PUSH1 0x09 JUMP | INVALID | JUMPDEST STOP
        let mut cfg = build("6001600201600956fe5b00");
        apply_patch(&mut cfg, &patch(r#"{"insert": "CALLER POP"}"#), 4);
        assert!(relinearize(&mut cfg).is_empty());
        assert_eq!(bytes(&cfg), "60016002335001600b56fe5b00");
    }
}
