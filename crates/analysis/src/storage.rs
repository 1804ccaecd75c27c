//! Storage layout inference: which slots the contract already uses, and the first free one.

use crate::paths::{execution_paths, path_instructions, PathSelection};
use crate::taint::{TaintRunner, Tainted};
use regex::Regex;
use salve_core::cfg_ir::Cfg;
use salve_core::opcode::Opcode;
use salve_core::U256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use tracing::debug;

/// Largest distance from the highest known slot at which a newly seen slot is still
/// considered part of the layout.
pub const SLOT_WINDOW: u64 = 32;

/// Storage slots in use and the first slot past them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLayout {
    /// Slots the contract reads or writes.
    pub used: BTreeSet<U256>,
    /// First slot above every used one, `0` when no layout could be anchored at slot 0.
    pub free: U256,
}

impl StorageLayout {
    /// Hands out the next free slot.
    pub fn allocate(&mut self) -> U256 {
        let slot = self.free;
        self.free = self.free.saturating_add(U256::from(1u8));
        slot
    }
}

/// Replays every storage-accessing path from the program entry and collects the slots that
/// `SLOAD`/`SSTORE` address through constants.
///
/// A slot is only accepted when its index can be traced to `PUSH` constants alone. The first
/// accepted slot must be slot 0, and every further slot must lie within [`SLOT_WINDOW`] of the
/// highest one so far. Fixed-size array accesses also reserve the array's last slot. When slot
/// 0 is never seen, the layout is considered unknown and the free slot is 0.
pub fn free_storage_slot(cfg: &Cfg) -> StorageLayout {
    let Some(entry) = cfg.entry() else {
        return StorageLayout::default();
    };
    let paths = execution_paths(cfg, entry, PathSelection::AccessingStorage);
    debug!("{} execution paths access storage", paths.len());

    let mut used = BTreeSet::new();
    for path in &paths {
        let mut runner = TaintRunner::new();
        let mut sequence = String::new();
        for ins in path_instructions(cfg, path) {
            sequence.push_str(&ins.asm());
            sequence.push(' ');
            match ins.opcode {
                Opcode::PUSH0 | Opcode::PUSH(_) => runner.introduce_taint(ins, ins),
                Opcode::SLOAD | Opcode::SSTORE => {
                    if let Some(slot) = runner.check_taint(ins).first().and_then(constant_slot) {
                        accept(&mut used, slot, fixed_array_size(&sequence));
                    }
                    sequence.clear();
                    runner.propagate_taint(ins);
                }
                _ => runner.propagate_taint(ins),
            }
        }
    }

    if !used.contains(&U256::ZERO) {
        used.clear();
    }
    let free = used
        .last()
        .map_or(U256::ZERO, |max| max.saturating_add(U256::from(1u8)));
    debug!("Used storage slots {:?}, free slot {}", used, free);
    StorageLayout { used, free }
}

/// Slot index of an `SLOAD`/`SSTORE` key derived from `PUSH` constants only: the key itself
/// when it is known, else the largest constant it depends on.
fn constant_slot(key: &Tainted) -> Option<U256> {
    let tags = key.tags();
    if tags.is_empty() || !tags.iter().all(|t| t.opcode.is_push()) {
        return None;
    }
    key.value
        .or_else(|| tags.iter().filter_map(|t| t.push_value()).max())
}

fn accept(used: &mut BTreeSet<U256>, slot: U256, array_size: Option<U256>) {
    let anchored = match used.last() {
        None => slot.is_zero(),
        Some(&max) => {
            let distance = if max > slot { max - slot } else { slot - max };
            distance <= U256::from(SLOT_WINDOW)
        }
    };
    if !anchored {
        return;
    }
    used.insert(slot);
    if let Some(size) = array_size.filter(|s| !s.is_zero()) {
        used.insert(slot.saturating_add(size) - U256::from(1u8));
    }
}

/// Length of a fixed-size array whose bounds check precedes the storage access that ends
/// `sequence`.
fn fixed_array_size(sequence: &str) -> Option<U256> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"PUSH[0-9]+ (0x[A-Fa-f0-9]+) DUP[0-9]+ LT PUSH[0-9]+ 0x[A-Fa-f0-9]+ JUMPI JUMPDEST ADD .*?(?:SLOAD|SSTORE)",
            r"PUSH[0-9]+ (0x[A-Fa-f0-9]+) DUP[0-9]+ LT ISZERO PUSH[0-9]+ 0x[A-Fa-f0-9]+ JUMPI ADD PUSH[0-9]+ 0x[A-Fa-f0-9]+ JUMPDEST POP .*?(?:SLOAD|SSTORE)",
        ]
        .into_iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    });
    patterns
        .iter()
        .find_map(|re| re.captures(sequence))
        .and_then(|caps| caps.get(1))
        .and_then(|size| U256::from_str_radix(size.as_str().trim_start_matches("0x"), 16).ok())
}
