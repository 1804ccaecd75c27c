//! Taint runner: an abstract EVM interpreter that carries, next to every concrete-or-unknown
//! value, the set of instructions that influenced it.
//!
//! The runner is driven by its caller one instruction at a time along a straight-line path.
//! [`TaintRunner::introduce_taint`] executes an instruction and tags its results,
//! [`TaintRunner::propagate_taint`] executes it while only carrying existing tags forward, and
//! [`TaintRunner::check_taint`] reads the operands an instruction is about to consume.
//!
//! Values are `Option<U256>`: `None` is an unknown value. Memory and storage are keyed by
//! possibly unknown addresses; an unknown address is its own key.

use salve_core::decoder::Instruction;
use salve_core::opcode::{ArityTable, Opcode, ARITY};
use salve_core::U256;
use salve_utils::errors::TaintError;
use std::collections::BTreeMap;
use tracing::debug;

/// A value together with the instructions it depends on.
///
/// `taints` is `None` for an untainted value; a tainted value always carries at least one tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tainted {
    /// Concrete value, `None` when unknown.
    pub value: Option<U256>,
    /// Instructions the value depends on.
    pub taints: Option<Vec<Instruction>>,
}

impl Tainted {
    /// An unknown, untainted value.
    pub const fn unknown() -> Self {
        Self {
            value: None,
            taints: None,
        }
    }

    /// Tags of this value, empty when untainted.
    pub fn tags(&self) -> &[Instruction] {
        self.taints.as_deref().unwrap_or_default()
    }
}

/// Snapshot of the abstract machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaintRecord {
    /// Stack, top last.
    pub stack: Vec<Tainted>,
    /// Memory words by offset.
    pub memory: BTreeMap<Option<U256>, Tainted>,
    /// Storage words by slot.
    pub storage: BTreeMap<Option<U256>, Tainted>,
}

impl TaintRecord {
    fn pop(&mut self, ins: &Instruction) -> Result<Tainted, TaintError> {
        self.stack.pop().ok_or_else(|| TaintError::StackUnderflow {
            opcode: ins.opcode.to_string(),
            pc: ins.pc.current,
        })
    }

    fn pop_n(&mut self, ins: &Instruction, n: usize) -> Result<Vec<Tainted>, TaintError> {
        (0..n).map(|_| self.pop(ins)).collect()
    }

    /// Union of the memory taints in `[offset, offset + size)`, or of all memory when the
    /// range is not concrete.
    fn memory_taints(&self, offset: Option<U256>, size: Option<U256>) -> Option<Vec<Instruction>> {
        let mut taints = Vec::new();
        match memory_range(offset, size) {
            Some((start, end)) => {
                for word in self.memory.range(Some(start)..Some(end)).map(|(_, w)| w) {
                    union_into(&mut taints, word.tags());
                }
            }
            None => {
                for word in self.memory.values() {
                    union_into(&mut taints, word.tags());
                }
            }
        }
        (!taints.is_empty()).then_some(taints)
    }

    /// Forgets the memory written in `[offset, offset + size)`, or all memory when the range
    /// is not concrete.
    fn invalidate_memory(&mut self, offset: Option<U256>, size: Option<U256>) {
        match memory_range(offset, size) {
            Some((start, end)) => {
                let written: Vec<_> = self
                    .memory
                    .range(Some(start)..Some(end))
                    .map(|(k, _)| *k)
                    .collect();
                for key in written {
                    self.memory.remove(&key);
                }
            }
            None => self.memory.clear(),
        }
    }
}

fn memory_range(offset: Option<U256>, size: Option<U256>) -> Option<(U256, U256)> {
    let (offset, size) = (offset?, size?);
    Some((offset, offset.saturating_add(size)))
}

fn union_into(taints: &mut Vec<Instruction>, tags: &[Instruction]) {
    for tag in tags {
        if !taints.contains(tag) {
            taints.push(tag.clone());
        }
    }
}

/// Drives a [`TaintRecord`] through a sequence of instructions.
#[derive(Debug, Clone)]
pub struct TaintRunner {
    arity: &'static ArityTable,
    record: TaintRecord,
}

impl Default for TaintRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TaintRunner {
    /// Runner over an empty record using the process-wide arity table.
    pub fn new() -> Self {
        Self::with_arity(&ARITY)
    }

    /// Runner over an empty record using `arity` for every opcode.
    pub fn with_arity(arity: &'static ArityTable) -> Self {
        Self {
            arity,
            record: TaintRecord::default(),
        }
    }

    /// Current state of the abstract machine.
    pub const fn record(&self) -> &TaintRecord {
        &self.record
    }

    /// Executes `ins` and tags every value it pushes with `tag`, on top of the taints of the
    /// operands it consumed.
    ///
    /// A `PUSH` pushes its literal tagged with `tag` alone. Any other instruction pushes the
    /// only concrete operand it consumed when there is exactly one, and an unknown otherwise.
    /// The pushed value is then an approximation, not the result of `ins`: for `x & 0xff` with
    /// `x` unknown it is `0xff`, the constant the result is bounded by. Callers that need the
    /// constant an instruction was fed should read it from the operand's `PUSH` tag instead.
    pub fn introduce_taint(&mut self, tag: &Instruction, ins: &Instruction) {
        if let Some(value) = ins.push_value() {
            self.record.stack.push(Tainted {
                value: Some(value),
                taints: Some(vec![tag.clone()]),
            });
            return;
        }

        let (pops, pushes) = self.arity.get(ins.opcode);
        let mut taints = Vec::new();
        let mut concrete = Vec::new();
        for _ in 0..pops {
            let Some(operand) = self.record.stack.pop() else {
                break;
            };
            union_into(&mut taints, operand.tags());
            concrete.extend(operand.value);
        }
        union_into(&mut taints, std::slice::from_ref(tag));

        let value = match concrete.as_slice() {
            [single] => Some(*single),
            _ => None,
        };
        for _ in 0..pushes {
            self.record.stack.push(Tainted {
                value,
                taints: Some(taints.clone()),
            });
        }
    }

    /// Executes `ins`, carrying the taints of its operands over to its results.
    ///
    /// A failing step (an underflow in an opcode with memory or storage effects) leaves the
    /// record untouched.
    pub fn propagate_taint(&mut self, ins: &Instruction) {
        let mut next = self.record.clone();
        match self.step(&mut next, ins) {
            Ok(()) => self.record = next,
            Err(e) => debug!("Taint step skipped: {e}"),
        }
    }

    /// Operands `ins` is about to consume, top of the stack first.
    ///
    /// Operands missing from the stack are left out.
    pub fn check_taint(&self, ins: &Instruction) -> Vec<Tainted> {
        let (pops, _) = self.arity.get(ins.opcode);
        self.record.stack.iter().rev().take(pops).cloned().collect()
    }

    fn step(&self, record: &mut TaintRecord, ins: &Instruction) -> Result<(), TaintError> {
        match ins.opcode {
            Opcode::PUSH0 | Opcode::PUSH(_) => record.stack.push(Tainted {
                value: ins.push_value(),
                taints: None,
            }),
            Opcode::DUP(n) => {
                let n = n as usize;
                while record.stack.len() < n {
                    record.stack.insert(0, Tainted::unknown());
                }
                let copy = record.stack[record.stack.len() - n].clone();
                record.stack.push(copy);
            }
            Opcode::SWAP(n) => {
                let n = n as usize;
                while record.stack.len() < n + 1 {
                    record.stack.insert(0, Tainted::unknown());
                }
                let top = record.stack.len() - 1;
                record.stack.swap(top, top - n);
            }
            Opcode::MLOAD | Opcode::SLOAD => {
                let key = record.pop(ins)?.value;
                let map = if ins.opcode == Opcode::MLOAD {
                    &record.memory
                } else {
                    &record.storage
                };
                let loaded = map.get(&key).cloned().unwrap_or_default();
                record.stack.push(loaded);
            }
            Opcode::MSTORE | Opcode::MSTORE8 | Opcode::SSTORE => {
                let key = record.pop(ins)?.value;
                let word = record.pop(ins)?;
                let map = if ins.opcode == Opcode::SSTORE {
                    &mut record.storage
                } else {
                    &mut record.memory
                };
                map.insert(key, word);
            }
            Opcode::KECCAK256 => {
                let offset = record.pop(ins)?.value;
                let size = record.pop(ins)?.value;
                let taints = record.memory_taints(offset, size);
                record.stack.push(Tainted { value: None, taints });
            }
            Opcode::CALLVALUE => record.stack.push(Tainted::unknown()),
            Opcode::CALLDATALOAD => {
                record.pop(ins)?;
                record.stack.push(Tainted::unknown());
            }
            Opcode::CALLDATACOPY
            | Opcode::CODECOPY
            | Opcode::RETURNDATACOPY
            | Opcode::MCOPY
            | Opcode::EXTCODECOPY => {
                if ins.opcode == Opcode::EXTCODECOPY {
                    record.pop(ins)?;
                }
                let dest = record.pop(ins)?.value;
                record.pop(ins)?;
                let size = record.pop(ins)?.value;
                record.invalidate_memory(dest, size);
            }
            Opcode::CALL | Opcode::CALLCODE | Opcode::DELEGATECALL | Opcode::STATICCALL => {
                let pops = if matches!(ins.opcode, Opcode::CALL | Opcode::CALLCODE) {
                    7
                } else {
                    6
                };
                let operands = record.pop_n(ins, pops)?;
                let ret_offset = operands[pops - 2].value;
                let ret_size = operands[pops - 1].value;
                record.invalidate_memory(ret_offset, ret_size);
                record.stack.push(Tainted::unknown());
            }
            Opcode::CREATE | Opcode::CREATE2 => {
                let pops = if ins.opcode == Opcode::CREATE { 3 } else { 4 };
                let operands = record.pop_n(ins, pops)?;
                let mut taints = record
                    .memory_taints(operands[1].value, operands[2].value)
                    .unwrap_or_default();
                for operand in &operands {
                    union_into(&mut taints, operand.tags());
                }
                record.stack.push(Tainted {
                    value: None,
                    taints: (!taints.is_empty()).then_some(taints),
                });
            }
            op => self.mutate_stack(record, op),
        }
        Ok(())
    }

    /// Generic transfer: pops the declared operands, unions their taints, and pushes the
    /// exact result when every operand is concrete.
    ///
    /// When some operands are unknown and exactly one is concrete, that operand's value is
    /// pushed in place of the result. This keeps constants such as a mask, a memory offset or
    /// a slot number visible through the instructions that consume them, so later reads of
    /// memory and storage can still be keyed. The value is not the instruction's result and
    /// must not be treated as one: `ADD(x, 1)` with `x` unknown yields `1`. Two or more
    /// concrete operands next to an unknown one, or a stack underflow, yield an unknown.
    fn mutate_stack(&self, record: &mut TaintRecord, op: Opcode) {
        let (pops, pushes) = self.arity.get(op);
        let mut operands = Vec::with_capacity(pops);
        let mut underflow = false;
        for _ in 0..pops {
            match record.stack.pop() {
                Some(operand) => operands.push(operand),
                None => underflow = true,
            }
        }

        let mut taints = Vec::new();
        for operand in &operands {
            union_into(&mut taints, operand.tags());
        }
        let taints = (!taints.is_empty()).then_some(taints);

        let value = if underflow || operands.is_empty() {
            None
        } else if operands.iter().any(|o| o.value.is_none()) {
            match operands.iter().filter_map(|o| o.value).collect::<Vec<_>>().as_slice() {
                [single] => Some(*single),
                _ => None,
            }
        } else {
            let args: Vec<U256> = operands.iter().filter_map(|o| o.value).collect();
            evaluate(op, &args)
        };

        for _ in 0..pushes {
            record.stack.push(Tainted {
                value,
                taints: taints.clone(),
            });
        }
    }
}

/// Exact EVM semantics of the pure arithmetic, comparison and bitwise opcodes.
///
/// `args[0]` is the top of the stack. Returns `None` for any other opcode.
pub fn evaluate(op: Opcode, args: &[U256]) -> Option<U256> {
    let arg = |i: usize| args.get(i).copied();
    let flag = |b: bool| if b { U256::from(1u8) } else { U256::ZERO };
    let (a, b) = (arg(0)?, arg(1).unwrap_or_default());
    Some(match op {
        Opcode::ADD => a.wrapping_add(b),
        Opcode::MUL => a.wrapping_mul(b),
        Opcode::SUB => a.wrapping_sub(b),
        Opcode::DIV => a.checked_div(b).unwrap_or_default(),
        Opcode::MOD => a.checked_rem(b).unwrap_or_default(),
        Opcode::SDIV => sdiv(a, b),
        Opcode::SMOD => smod(a, b),
        Opcode::ADDMOD => a.add_mod(b, arg(2)?),
        Opcode::MULMOD => a.mul_mod(b, arg(2)?),
        Opcode::EXP => a.wrapping_pow(b),
        Opcode::SIGNEXTEND => signextend(a, b),
        Opcode::LT => flag(a < b),
        Opcode::GT => flag(a > b),
        Opcode::SLT => flag(signed_lt(a, b)),
        Opcode::SGT => flag(signed_lt(b, a)),
        Opcode::EQ => flag(a == b),
        Opcode::ISZERO => flag(a.is_zero()),
        Opcode::AND => a & b,
        Opcode::OR => a | b,
        Opcode::XOR => a ^ b,
        Opcode::NOT => !a,
        Opcode::BYTE => match usize::try_from(a) {
            Ok(i) if i < 32 => (b >> (8 * (31 - i))) & U256::from(0xffu8),
            _ => U256::ZERO,
        },
        Opcode::SHL => match usize::try_from(a) {
            Ok(shift) if shift < 256 => b << shift,
            _ => U256::ZERO,
        },
        Opcode::SHR => match usize::try_from(a) {
            Ok(shift) if shift < 256 => b >> shift,
            _ => U256::ZERO,
        },
        Opcode::SAR => {
            let negative = is_negative(b);
            match usize::try_from(a) {
                Ok(shift) if shift < 256 => {
                    if negative {
                        !((!b) >> shift)
                    } else {
                        b >> shift
                    }
                }
                _ if negative => U256::MAX,
                _ => U256::ZERO,
            }
        }
        _ => return None,
    })
}

fn is_negative(x: U256) -> bool {
    x.bit(255)
}

fn abs(x: U256) -> U256 {
    if is_negative(x) {
        x.wrapping_neg()
    } else {
        x
    }
}

fn sdiv(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::ZERO;
    }
    let quotient = abs(a) / abs(b);
    if is_negative(a) != is_negative(b) {
        quotient.wrapping_neg()
    } else {
        quotient
    }
}

fn smod(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::ZERO;
    }
    let rem = abs(a) % abs(b);
    if is_negative(a) {
        rem.wrapping_neg()
    } else {
        rem
    }
}

fn signed_lt(a: U256, b: U256) -> bool {
    match (is_negative(a), is_negative(b)) {
        (true, false) => true,
        (false, true) => false,
        _ => a < b,
    }
}

fn signextend(byte: U256, x: U256) -> U256 {
    let Ok(byte) = usize::try_from(byte) else {
        return x;
    };
    if byte >= 31 {
        return x;
    }
    let bit = byte * 8 + 7;
    let mask = (U256::from(1u8) << (bit + 1)) - U256::from(1u8);
    if x.bit(bit) {
        x | !mask
    } else {
        x & mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use salve_core::decoder::decode_bytes;

    fn run(code: &str) -> TaintRunner {
        let mut runner = TaintRunner::new();
        for ins in decode_bytes(&hex::decode(code).unwrap()).unwrap() {
            runner.propagate_taint(&ins);
        }
        runner
    }

    fn top(runner: &TaintRunner) -> Option<U256> {
        runner.record().stack.last().unwrap().value
    }

    #[test]
    fn add_wraps_around() {
        // PUSH1 1 PUSH32 0xff..ff ADD
        let code = format!("60017f{}01", "ff".repeat(32));
        assert_eq!(top(&run(&code)), Some(U256::ZERO));
    }

    #[test]
    fn sdiv_of_min_by_minus_one_is_min() {
        let min = U256::from(1u8) << 255;
        assert_eq!(evaluate(Opcode::SDIV, &[min, U256::MAX]), Some(min));
        let minus_seven = U256::MAX.wrapping_sub(U256::from(6u8));
        assert_eq!(
            evaluate(Opcode::SMOD, &[minus_seven, U256::from(3u8)]),
            Some(U256::MAX)
        );
    }

    #[test]
    fn signed_comparisons_and_shifts() {
        let minus_one = U256::MAX;
        let one = U256::from(1u8);
        assert_eq!(evaluate(Opcode::SLT, &[minus_one, one]), Some(one));
        assert_eq!(evaluate(Opcode::SGT, &[minus_one, one]), Some(U256::ZERO));
        assert_eq!(evaluate(Opcode::SAR, &[U256::from(4u8), minus_one]), Some(minus_one));
        assert_eq!(evaluate(Opcode::SAR, &[U256::from(300u16), minus_one]), Some(minus_one));
        assert_eq!(evaluate(Opcode::SHL, &[U256::from(256u16), one]), Some(U256::ZERO));
        assert_eq!(evaluate(Opcode::SIGNEXTEND, &[U256::ZERO, U256::from(0xffu8)]), Some(minus_one));
        assert_eq!(evaluate(Opcode::SIGNEXTEND, &[U256::ZERO, U256::from(0x7fu8)]), Some(U256::from(0x7fu8)));
        assert_eq!(evaluate(Opcode::BYTE, &[U256::from(31u8), U256::from(0xabu8)]), Some(U256::from(0xabu8)));
        assert_eq!(evaluate(Opcode::DIV, &[one, U256::ZERO]), Some(U256::ZERO));
    }

    #[test]
    fn single_concrete_operand_stands_in_for_the_result() {
        // PUSH1 0 CALLDATALOAD PUSH1 1 ADD
        assert_eq!(top(&run("600035600101")), Some(U256::from(1u8)));
        // PUSH1 0 CALLDATALOAD PUSH1 1 PUSH1 2 ADDMOD
        assert_eq!(top(&run("6000356001600208")), None);
    }

    #[test]
    fn introduced_taint_reaches_the_result() {
        // PUSH1 0x02 PUSH1 0x03 ADD
        let instructions = decode_bytes(&hex::decode("6002600301").unwrap()).unwrap();
        let mut runner = TaintRunner::new();
        runner.introduce_taint(&instructions[0], &instructions[0]);
        runner.propagate_taint(&instructions[1]);
        let operands = runner.check_taint(&instructions[2]);
        assert_eq!(operands.len(), 2);
        assert_eq!(operands[0].value, Some(U256::from(3u8)));
        assert!(operands[0].taints.is_none());
        assert_eq!(operands[1].tags(), &instructions[..1]);

        runner.propagate_taint(&instructions[2]);
        let result = runner.record().stack.last().unwrap();
        assert_eq!(result.value, Some(U256::from(5u8)));
        assert_eq!(result.tags(), &instructions[..1]);
    }

    #[test]
    fn single_known_operand_passes_through() {
        // CALLVALUE PUSH1 0xff AND: the mask survives as the value
        let instructions = decode_bytes(&hex::decode("3460ff16").unwrap()).unwrap();
        let mut runner = TaintRunner::new();
        runner.propagate_taint(&instructions[0]);
        runner.introduce_taint(&instructions[1], &instructions[1]);
        runner.introduce_taint(&instructions[2], &instructions[2]);
        let result = runner.record().stack.last().unwrap();
        assert_eq!(result.value, Some(U256::from(0xffu8)));
        assert_eq!(result.tags(), &instructions[1..3]);
    }

    #[test]
    fn storage_and_memory_carry_taints() {
        // PUSH1 0x2a PUSH1 0x03 SSTORE PUSH1 0x03 SLOAD
        let instructions = decode_bytes(&hex::decode("602a600355600354").unwrap()).unwrap();
        let mut runner = TaintRunner::new();
        runner.introduce_taint(&instructions[0], &instructions[0]);
        for ins in &instructions[1..] {
            runner.propagate_taint(ins);
        }
        let loaded = runner.record().stack.last().unwrap();
        assert_eq!(loaded.value, Some(U256::from(0x2au8)));
        assert_eq!(loaded.tags(), &instructions[..1]);
    }

    #[test]
    fn keccak_reads_memory_range_taints() {
        // PUSH1 0x07 PUSH1 0x00 MSTORE PUSH1 0x20 PUSH1 0x00 KECCAK256
        let instructions = decode_bytes(&hex::decode("60076000526020600020").unwrap()).unwrap();
        let mut runner = TaintRunner::new();
        runner.introduce_taint(&instructions[0], &instructions[0]);
        for ins in &instructions[1..] {
            runner.propagate_taint(ins);
        }
        let hash = runner.record().stack.last().unwrap();
        assert_eq!(hash.value, None);
        assert_eq!(hash.tags(), &instructions[..1]);
    }

    #[test]
    fn underflowing_store_leaves_record_unchanged() {
        let instructions = decode_bytes(&hex::decode("600155").unwrap()).unwrap();
        let mut runner = TaintRunner::new();
        runner.propagate_taint(&instructions[0]);
        let before = runner.record().clone();
        runner.propagate_taint(&instructions[1]);
        assert_eq!(runner.record(), &before);
    }

    #[test]
    fn dup_and_swap_pad_unknowns() {
        let runner = run("8190");
        assert_eq!(runner.record().stack.len(), 3);
        assert!(runner.record().stack.iter().all(|t| t.value.is_none()));
    }
}
