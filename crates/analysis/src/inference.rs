//! Backtrace-driven inferences used when choosing and parameterising a patch.

use crate::taint::TaintRunner;
use petgraph::graph::NodeIndex;
use salve_core::cfg_ir::Cfg;
use salve_core::decoder::Instruction;
use salve_core::opcode::Opcode;
use salve_core::U256;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Width and signedness of the integer an arithmetic instruction operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegerType {
    /// Unsigned integer with the given largest value.
    Unsigned {
        /// Largest representable value.
        max: U256,
    },
    /// Two's complement integer of the given width.
    Signed {
        /// Width in bits.
        bits: u32,
    },
}

impl Default for IntegerType {
    fn default() -> Self {
        Self::Unsigned { max: U256::MAX }
    }
}

/// Whether `mask` keeps exactly the low bytes of a word: nonzero, `2^n - 1`, `n % 8 == 0`.
fn is_byte_mask(mask: U256) -> bool {
    !mask.is_zero()
        && (mask & mask.wrapping_add(U256::from(1u8))).is_zero()
        && mask.bit_len() % 8 == 0
}

/// Parts of a `msg.sender == owner` check observed in a `JUMPI` condition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessControl {
    /// `PUSH` of the storage slot holding the owner.
    pub owner_slot: Option<Instruction>,
    /// `PUSH20 0xff..ff` masking the stored address.
    pub address_mask: Option<Instruction>,
    /// `SLOAD` of the owner slot.
    pub sload: Option<Instruction>,
    /// `CALLER` compared against the owner.
    pub caller: Option<Instruction>,
}

impl AccessControl {
    /// Whether every part of the check was observed.
    pub const fn is_complete(&self) -> bool {
        self.owner_slot.is_some()
            && self.address_mask.is_some()
            && self.sload.is_some()
            && self.caller.is_some()
    }

    /// Slot holding the owner, when known.
    pub fn owner_slot_value(&self) -> Option<U256> {
        self.owner_slot.as_ref().and_then(Instruction::push_value)
    }
}

/// Instructions that can execute before `pc` is reached from `node`: the instructions of
/// `node` and of its transitive predecessors whose original pc is at most `pc`.
///
/// Blocks are prepended in visiting order, so the earliest visited block comes last. Inserted
/// instructions are always kept.
pub fn backtrace(cfg: &Cfg, node: NodeIndex, pc: usize) -> Vec<Instruction> {
    let mut visited = HashSet::new();
    let mut to_visit = vec![node];
    let mut trace = Vec::new();
    while let Some(node) = to_visit.pop() {
        if !visited.insert(node) {
            continue;
        }
        let mut kept: Vec<Instruction> = cfg
            .block(node)
            .instructions
            .iter()
            .filter(|ins| ins.original_pc().map_or(true, |original| original <= pc))
            .cloned()
            .collect();
        kept.append(&mut trace);
        trace = kept;
        to_visit.extend(cfg.all_incoming(node).into_iter().rev());
    }
    trace
}

/// Infers the integer type of the arithmetic instruction at original `pc` from the masks and
/// sign extensions its operands went through.
///
/// A `SIGNEXTEND` on the operands' taint path makes the type signed, with the width given by
/// the `SIGNEXTEND` byte index. Otherwise the constant an `AND` masks with gives an unsigned
/// bound, provided it has the form `2^n - 1` with `n` a multiple of 8. Without either, the type
/// is a full 256-bit unsigned word.
pub fn infer_integer_type(cfg: &Cfg, pc: usize) -> IntegerType {
    let Some(node) = cfg.block_containing(pc) else {
        return IntegerType::default();
    };
    let trace = backtrace(cfg, node, pc);

    let mut runner = TaintRunner::new();
    let mut signextend_widths: HashMap<usize, U256> = HashMap::new();
    let mut and_masks: HashMap<usize, U256> = HashMap::new();
    for ins in &trace {
        match ins.opcode {
            Opcode::PUSH0 | Opcode::PUSH(_) => runner.introduce_taint(ins, ins),
            Opcode::AND => {
                let mask = runner
                    .check_taint(ins)
                    .iter()
                    .filter(|operand| {
                        operand
                            .tags()
                            .iter()
                            .any(|t| t.opcode.is_push() && t.push_value() == operand.value)
                    })
                    .filter_map(|operand| operand.value)
                    .filter(|mask| is_byte_mask(*mask))
                    .max();
                if let Some(mask) = mask {
                    and_masks.insert(ins.pc.current, mask);
                }
                runner.introduce_taint(ins, ins);
            }
            Opcode::SIGNEXTEND => {
                let tags: Vec<Instruction> = runner
                    .check_taint(ins)
                    .iter()
                    .flat_map(|operand| operand.tags().to_vec())
                    .collect();
                if let Some(width) = tags.iter().find_map(Instruction::push_value) {
                    signextend_widths.insert(ins.pc.current, width);
                }
                match tags.iter().find(|t| t.opcode == Opcode::SIGNEXTEND) {
                    Some(first) => runner.introduce_taint(first, ins),
                    None => runner.introduce_taint(ins, ins),
                }
            }
            _ if ins.original_pc() == Some(pc) => {
                let operands = runner.check_taint(ins);
                let tags: Vec<&Instruction> = operands.iter().flat_map(|o| o.tags()).collect();

                let signed_bits = tags
                    .iter()
                    .filter(|t| t.opcode == Opcode::SIGNEXTEND)
                    .filter_map(|t| signextend_widths.get(&t.pc.current))
                    .filter_map(|byte| u32::try_from(*byte).ok())
                    .filter(|&byte| byte < 32)
                    .map(|byte| 8 * (byte + 1))
                    .max();
                if let Some(bits) = signed_bits {
                    debug!("Operands of 0x{pc:x} are signed {bits}-bit integers");
                    return IntegerType::Signed { bits };
                }

                let mask = tags
                    .iter()
                    .filter(|t| t.opcode == Opcode::AND)
                    .filter_map(|t| and_masks.get(&t.pc.current))
                    .max();
                if let Some(&max) = mask {
                    debug!("Operands of 0x{pc:x} are unsigned integers bounded by {max:#x}");
                    return IntegerType::Unsigned { max };
                }
                return IntegerType::default();
            }
            _ => runner.propagate_taint(ins),
        }
    }
    IntegerType::default()
}

/// Looks for a `CALLER == owner` check in the `JUMPI` conditions of `instructions`.
///
/// The owner slot is the single `PUSH` an `SLOAD` key depends on. A `JUMPI` whose operands
/// carry more than three taint tags is inspected for the address mask, one of those `SLOAD`s,
/// and `CALLER`.
pub fn access_control(instructions: &[Instruction]) -> AccessControl {
    let mut runner = TaintRunner::new();
    let mut result = AccessControl::default();
    let mut sloads = Vec::new();
    let mask = U256::MAX >> 96;

    for ins in instructions {
        match ins.opcode {
            Opcode::PUSH0 | Opcode::PUSH(_) | Opcode::CALLER => runner.introduce_taint(ins, ins),
            Opcode::SLOAD => {
                if let [tag] = runner
                    .check_taint(ins)
                    .first()
                    .map(|key| key.tags().to_vec())
                    .unwrap_or_default()
                    .as_slice()
                {
                    result.owner_slot = Some(tag.clone());
                    sloads.push(ins.clone());
                }
                runner.introduce_taint(ins, ins);
            }
            Opcode::JUMPI => {
                let mut tags: Vec<Instruction> = Vec::new();
                for operand in runner.check_taint(ins) {
                    for tag in operand.tags() {
                        if !tags.contains(tag) {
                            tags.push(tag.clone());
                        }
                    }
                }
                if tags.len() > 3 {
                    for tag in tags {
                        match tag.opcode {
                            Opcode::PUSH(20) if tag.push_value() == Some(mask) => {
                                result.address_mask = Some(tag);
                            }
                            Opcode::SLOAD if sloads.contains(&tag) => result.sload = Some(tag),
                            Opcode::CALLER => result.caller = Some(tag),
                            _ => {}
                        }
                    }
                }
            }
            _ => runner.propagate_taint(ins),
        }
    }
    result
}

/// The contract's own error handler near `node`: walking up the predecessors, the first
/// sibling branch that ends in `REVERT`, `INVALID` or `RETURN`.
pub fn error_handler(cfg: &Cfg, node: NodeIndex) -> Option<Vec<Instruction>> {
    let mut visited = HashSet::new();
    let mut to_visit: Vec<(NodeIndex, Option<NodeIndex>)> = vec![(node, None)];
    while let Some((node, previous)) = to_visit.pop() {
        if !visited.insert(node) {
            continue;
        }
        if let Some(previous) = previous {
            for succ in cfg.all_outgoing(node) {
                let handler = cfg.block(succ);
                if succ != previous
                    && handler.end_opcode().is_some_and(|op| {
                        matches!(op, Opcode::REVERT | Opcode::INVALID | Opcode::RETURN)
                    })
                {
                    return Some(handler.instructions.clone());
                }
            }
        }
        to_visit.extend(
            cfg.all_incoming(node)
                .into_iter()
                .rev()
                .map(|pred| (pred, Some(node))),
        );
    }
    None
}

/// Instructions a patch executes when its check fails.
///
/// With `inference` enabled, the contract's own error handler near `node` is reused (without
/// its `JUMPDEST` when it reverts). Otherwise, or when none is found, `PUSH1 0x0 DUP1 REVERT`.
pub fn error_sequence(cfg: &Cfg, node: NodeIndex, inference: bool) -> Vec<Instruction> {
    if inference {
        if let Some(handler) = error_handler(cfg, node) {
            let reverts = handler.last().is_some_and(|ins| ins.opcode == Opcode::REVERT);
            return handler
                .iter()
                .filter(|ins| !(reverts && ins.opcode == Opcode::JUMPDEST))
                .map(|ins| Instruction::new(ins.opcode, ins.imm))
                .collect();
        }
    }
    vec![
        Instruction::new(Opcode::PUSH(1), Some(U256::ZERO)),
        Instruction::new(Opcode::DUP(1), None),
        Instruction::new(Opcode::REVERT, None),
    ]
}

/// Every `CODECOPY` reachable from the entry of a constructor CFG, in depth-first order. The
/// last one copies the runtime code.
pub fn codecopy_sites(cfg: &Cfg) -> Vec<Instruction> {
    let Some(entry) = cfg.entry() else {
        return Vec::new();
    };
    let mut visited = HashSet::new();
    let mut to_visit = vec![entry];
    let mut sites = Vec::new();
    while let Some(node) = to_visit.pop() {
        if !visited.insert(node) {
            continue;
        }
        sites.extend(
            cfg.block(node)
                .instructions
                .iter()
                .filter(|ins| ins.opcode == Opcode::CODECOPY)
                .cloned(),
        );
        to_visit.extend(cfg.all_outgoing(node).into_iter().rev());
    }
    sites
}

#[cfg(test)]
mod tests {
    use super::*;
    use salve_core::cfg_ir::{build_cfg, AnalysisConfig};
    use salve_core::decoder::decode_bytes;

    fn build(code: &str) -> Cfg {
        build_cfg(&hex::decode(code).unwrap(), &AnalysisConfig::default()).unwrap()
    }

    fn asm(instructions: &[Instruction]) -> Vec<String> {
        instructions.iter().map(Instruction::asm).collect()
    }

    #[test]
    fn backtrace_follows_predecessors_up_to_pc() {
        // 00: PUSH1 0 CALLDATALOAD PUSH1 0x0a JUMPI
        // 06: PUSH1 1 SLOAD STOP
        // 0a: JUMPDEST PUSH1 1 PUSH1 2 SSTORE STOP
        let cfg = build("600035600a57600154005b600160025500");
        let node = cfg.block_starting_at(0x0a).unwrap();
        let trace = backtrace(&cfg, node, 0x0f);
        assert_eq!(
            asm(&trace),
            vec![
                "PUSH1 0x0", "CALLDATALOAD", "PUSH1 0xa", "JUMPI", "JUMPDEST", "PUSH1 0x1",
                "PUSH1 0x2", "SSTORE"
            ]
        );
    }

    #[test]
    fn masked_operand_is_unsigned_with_bound() {
        // PUSH1 2 PUSH1 0 CALLDATALOAD PUSH1 0xff AND ADD STOP
        let cfg = build("600260003560ff160100");
        assert_eq!(
            infer_integer_type(&cfg, 8),
            IntegerType::Unsigned { max: U256::from(0xffu8) }
        );
    }

    #[test]
    fn bound_comes_from_the_mask_not_the_other_addend() {
        // PUSH2 0x0117 PUSH1 0 CALLDATALOAD PUSH1 0xff AND ADD STOP
        let cfg = build("61011760003560ff160100");
        assert_eq!(
            infer_integer_type(&cfg, 9),
            IntegerType::Unsigned { max: U256::from(0xffu8) }
        );
    }

    #[test]
    fn mask_that_is_not_whole_bytes_gives_no_bound() {
        // PUSH1 2 PUSH1 0 CALLDATALOAD PUSH1 0x7f AND ADD STOP
        let cfg = build("6002600035607f160100");
        assert_eq!(infer_integer_type(&cfg, 8), IntegerType::default());
        assert!(is_byte_mask(U256::from(0xffffu32)));
        assert!(!is_byte_mask(U256::from(0x0fu8)));
        assert!(!is_byte_mask(U256::ZERO));
        assert!(is_byte_mask(U256::MAX));
    }

    #[test]
    fn sign_extended_operand_is_signed() {
        // PUSH1 2 PUSH1 0 CALLDATALOAD PUSH1 0 SIGNEXTEND ADD STOP
        let cfg = build("600260003560000b0100");
        assert_eq!(infer_integer_type(&cfg, 8), IntegerType::Signed { bits: 8 });
    }

    #[test]
    fn unmasked_operands_default_to_full_word() {
        // PUSH1 1 PUSH1 2 ADD STOP
        let cfg = build("600160020100");
        assert_eq!(infer_integer_type(&cfg, 4), IntegerType::default());
    }

    #[test]
    fn owner_check_is_complete() {
        // PUSH1 0 SLOAD PUSH20 0xff..ff AND CALLER EQ PUSH1 0x1f JUMPI INVALID JUMPDEST STOP
        let code = format!("60005473{}163314601f57fe5b00", "ff".repeat(20));
        let instructions = decode_bytes(&hex::decode(code).unwrap()).unwrap();
        let check = access_control(&instructions);
        assert!(check.is_complete());
        assert_eq!(check.owner_slot_value(), Some(U256::ZERO));
        assert_eq!(check.sload.unwrap().pc.current, 2);
    }

    #[test]
    fn unmasked_owner_check_is_incomplete() {
        // PUSH1 0 SLOAD CALLER EQ PUSH1 0x09 JUMPI INVALID JUMPDEST STOP
        let instructions = decode_bytes(&hex::decode("6000543314600957fe5b00").unwrap()).unwrap();
        let check = access_control(&instructions);
        assert!(!check.is_complete());
        assert!(check.caller.is_some());
        assert!(check.sload.is_some());
        assert!(check.address_mask.is_none());
    }

    #[test]
    fn error_handler_is_reused_when_inferred() {
        // 00: PUSH1 0 CALLDATALOAD PUSH1 0x0b JUMPI
        // 06: PUSH1 0x20 PUSH1 0 REVERT
        // 0b: JUMPDEST PUSH1 1 ADD STOP
        let cfg = build("600035600b5760206000fd5b60010100");
        let node = cfg.block_starting_at(0x0b).unwrap();
        assert_eq!(
            asm(&error_sequence(&cfg, node, true)),
            vec!["PUSH1 0x20", "PUSH1 0x0", "REVERT"]
        );
        assert_eq!(
            asm(&error_sequence(&cfg, node, false)),
            vec!["PUSH1 0x0", "DUP1", "REVERT"]
        );
    }

    #[test]
    fn constructor_codecopy_is_found() {
        // PUSH1 0x0a DUP1 PUSH1 0x0c PUSH1 0 CODECOPY PUSH1 0 RETURN INVALID
        let cfg = build("600a80600c6000396000f3fe");
        let sites = codecopy_sites(&cfg);
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].pc.current, 7);
    }
}
