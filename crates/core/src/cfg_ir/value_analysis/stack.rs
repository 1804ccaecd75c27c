//! Abstract stack domain of the value analysis.

use revm::primitives::U256;
use std::collections::BTreeSet;
use std::fmt;

/// Default cardinality cap of an abstract element when no JUMPDEST set bounds it.
pub const DEFAULT_MAX_VALUES: usize = 100;

/// Parameters shared by every element of one analysis run.
#[derive(Debug, Clone, Default)]
pub struct Lattice {
    /// When set, only these values are tracked precisely; any other value becomes unknown.
    authorized: Option<BTreeSet<U256>>,
    cap: usize,
}

impl Lattice {
    /// A lattice that tracks every value, widening to ⊤ past [`DEFAULT_MAX_VALUES`].
    pub fn unrestricted() -> Self {
        Self {
            authorized: None,
            cap: DEFAULT_MAX_VALUES,
        }
    }

    /// A lattice restricted to `authorized` values, with the cap set to their count.
    ///
    /// An empty set disables the restriction.
    pub fn restricted(authorized: BTreeSet<U256>) -> Self {
        if authorized.is_empty() {
            return Self::unrestricted();
        }
        Self {
            cap: authorized.len(),
            authorized: Some(authorized),
        }
    }

    /// Maximum number of values an element holds before widening to ⊤.
    pub const fn cap(&self) -> usize {
        self.cap
    }
}

/// One abstract stack slot: a bounded set of possible values, or ⊤.
///
/// `None` inside the set is a value known to exist but not known concretely; `vals == None`
/// is ⊤. The empty set means the slot has not been observed yet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AbsStackElem {
    vals: Option<BTreeSet<Option<U256>>>,
}

impl AbsStackElem {
    /// The ⊤ element.
    pub const fn top() -> Self {
        Self { vals: None }
    }

    /// An element holding the single value `value`.
    pub fn single(value: Option<U256>, lattice: &Lattice) -> Self {
        let mut elem = Self {
            vals: Some(BTreeSet::new()),
        };
        elem.append(value, lattice);
        elem
    }

    /// Possible values, `None` for ⊤.
    pub const fn values(&self) -> Option<&BTreeSet<Option<U256>>> {
        self.vals.as_ref()
    }

    /// Returns `true` if the element is ⊤.
    pub const fn is_top(&self) -> bool {
        self.vals.is_none()
    }

    /// Adds a possible value. Values outside the authorized set are recorded as unknown.
    pub fn append(&mut self, value: Option<U256>, lattice: &Lattice) {
        let Some(vals) = self.vals.as_mut() else {
            return;
        };
        match (&lattice.authorized, value) {
            (Some(authorized), Some(v)) if !authorized.contains(&v) => {
                vals.insert(None);
            }
            _ => {
                vals.insert(value);
            }
        }
    }

    /// Join of two elements. Widens to ⊤ once the union exceeds the cap.
    pub fn merge(&self, other: &Self, lattice: &Lattice) -> Self {
        match (&self.vals, &other.vals) {
            (Some(a), Some(b)) => {
                let union: BTreeSet<_> = a.union(b).copied().collect();
                if union.len() > lattice.cap {
                    Self::top()
                } else {
                    Self { vals: Some(union) }
                }
            }
            _ => Self::top(),
        }
    }

    /// Bitwise AND over the cross product of possible values.
    pub fn and(&self, other: &Self, lattice: &Lattice) -> Self {
        let (Some(a), Some(b)) = (&self.vals, &other.vals) else {
            return Self::top();
        };
        let mut result = Self {
            vals: Some(BTreeSet::new()),
        };
        for x in a {
            for y in b {
                let value = match (x, y) {
                    (Some(x), Some(y)) => Some(*x & *y),
                    _ => None,
                };
                result.append(value, lattice);
            }
        }
        result
    }
}

impl fmt::Display for AbsStackElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(vals) = &self.vals else {
            return f.write_str("⊤");
        };
        f.write_str("{")?;
        for (i, v) in vals.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match v {
                Some(v) => write!(f, "0x{v:x}")?,
                None => f.write_str("?")?,
            }
        }
        f.write_str("}")
    }
}

/// Stack of abstract elements, top last.
///
/// Popping an empty stack yields an unknown value and reaching below the bottom with
/// `DUP`/`SWAP` pads with unknowns, since a block is usually analysed without its callers'
/// full stack.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AbstractStack {
    elems: Vec<AbsStackElem>,
}

impl AbstractStack {
    /// Creates an empty stack.
    pub const fn new() -> Self {
        Self { elems: Vec::new() }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    /// Returns `true` if the stack holds no elements.
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// Pushes an abstract element.
    pub fn push(&mut self, elem: AbsStackElem) {
        self.elems.push(elem);
    }

    /// Pushes a single value.
    pub fn push_value(&mut self, value: Option<U256>, lattice: &Lattice) {
        self.elems.push(AbsStackElem::single(value, lattice));
    }

    /// Pops the top element, or an unknown value if the stack is empty.
    pub fn pop(&mut self, lattice: &Lattice) -> AbsStackElem {
        self.elems
            .pop()
            .unwrap_or_else(|| AbsStackElem::single(None, lattice))
    }

    /// The top element without popping it.
    pub fn peek(&self) -> Option<&AbsStackElem> {
        self.elems.last()
    }

    /// `DUPn`: duplicates the n-th element, or pushes an unknown value if it is missing.
    pub fn dup(&mut self, n: usize, lattice: &Lattice) {
        let elem = match n {
            0 => None,
            _ => self.elems.len().checked_sub(n).and_then(|i| self.elems.get(i)).cloned(),
        };
        match elem {
            Some(elem) => self.elems.push(elem),
            None => self.push_value(None, lattice),
        }
    }

    /// `SWAPn`: exchanges the top with the (n+1)-th element, padding the bottom with unknown
    /// values when the stack is too short.
    pub fn swap(&mut self, n: usize, lattice: &Lattice) {
        if self.elems.is_empty() {
            self.push_value(None, lattice);
        }
        if self.elems.len() < n + 1 {
            let missing = n + 1 - self.elems.len();
            let padding = std::iter::repeat_with(|| AbsStackElem::single(None, lattice)).take(missing);
            self.elems.splice(0..0, padding);
        }
        let top = self.elems.len() - 1;
        self.elems.swap(top, top - n);
    }

    /// Element-wise join from the top. Excess elements of the longer stack pass through.
    pub fn merge(&self, other: &Self, lattice: &Lattice) -> Self {
        let (long, short) = if other.elems.len() <= self.elems.len() {
            (self, other)
        } else {
            (other, self)
        };
        let mut elems = long.elems.clone();
        let offset = long.elems.len() - short.elems.len();
        for (i, elem) in short.elems.iter().enumerate() {
            elems[offset + i] = elems[offset + i].merge(elem, lattice);
        }
        Self { elems }
    }

    /// Elements, bottom first.
    pub fn elems(&self) -> &[AbsStackElem] {
        &self.elems
    }
}

/// Purely syntactic replay of a single block, used when the lattice loses a jump target.
///
/// Tracks `PUSH`, `DUP`, `SWAP` and `AND` concretely and treats every other opcode as
/// producing unknown values. Like [`AbstractStack`], `DUP` and `SWAP` reaching below the bottom
/// pad with unknowns. Stops at the block's `JUMP`/`JUMPI` and returns the stack as it
/// was right before it, top last.
pub fn symbolic_replay(instructions: &[crate::decoder::Instruction]) -> Vec<Option<U256>> {
    use crate::opcode::Opcode;

    let mut stack: Vec<Option<U256>> = Vec::new();
    for ins in instructions {
        match ins.opcode {
            Opcode::PUSH0 | Opcode::PUSH(_) => stack.push(ins.push_value()),
            Opcode::DUP(n) => {
                let n = n as usize;
                let value = stack
                    .len()
                    .checked_sub(n)
                    .and_then(|i| stack.get(i))
                    .copied()
                    .flatten();
                stack.push(value);
            }
            Opcode::SWAP(n) => {
                let n = n as usize;
                if stack.len() < n + 1 {
                    let missing = n + 1 - stack.len();
                    stack.splice(0..0, std::iter::repeat(None).take(missing));
                }
                let top = stack.len() - 1;
                stack.swap(top, top - n);
            }
            Opcode::AND => {
                let a = stack.pop().flatten();
                let b = stack.pop().flatten();
                stack.push(a.zip(b).map(|(a, b)| a & b));
            }
            Opcode::JUMP | Opcode::JUMPI => return stack,
            op => {
                let (pops, pushes) = op.stack_arity();
                for _ in 0..pops {
                    stack.pop();
                }
                stack.extend(std::iter::repeat(None).take(pushes));
            }
        }
    }
    stack
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_bytes;

    fn u(v: u64) -> Option<U256> {
        Some(U256::from(v))
    }

    #[test]
    fn restricted_lattice_maps_foreign_values_to_unknown() {
        let lattice = Lattice::restricted([U256::from(8)].into_iter().collect());
        let elem = AbsStackElem::single(u(3), &lattice);
        assert_eq!(elem.values().unwrap().iter().copied().collect::<Vec<_>>(), vec![None]);
        let elem = AbsStackElem::single(u(8), &lattice);
        assert!(elem.values().unwrap().contains(&u(8)));
    }

    #[test]
    fn merge_widens_past_cap() {
        let lattice = Lattice::restricted([U256::from(1), U256::from(2)].into_iter().collect());
        let a = AbsStackElem::single(u(1), &lattice);
        let b = AbsStackElem::single(u(2), &lattice);
        let ab = a.merge(&b, &lattice);
        assert_eq!(ab.values().unwrap().len(), 2);
        let unknown = AbsStackElem::single(None, &lattice);
        assert!(ab.merge(&unknown, &lattice).is_top());
        assert!(a.merge(&AbsStackElem::top(), &lattice).is_top());
    }

    #[test]
    fn and_is_cross_product() {
        let lattice = Lattice::unrestricted();
        let mut a = AbsStackElem::single(u(0xff), &lattice);
        a.append(u(0x0f), &lattice);
        let b = AbsStackElem::single(u(0x3c), &lattice);
        let vals: Vec<_> = a.and(&b, &lattice).values().unwrap().iter().copied().collect();
        assert_eq!(vals, vec![u(0x0c), u(0x3c)]);
        assert!(a.and(&AbsStackElem::top(), &lattice).is_top());
    }

    #[test]
    fn stack_merges_from_top() {
        let lattice = Lattice::unrestricted();
        let mut long = AbstractStack::new();
        long.push_value(u(1), &lattice);
        long.push_value(u(2), &lattice);
        let mut short = AbstractStack::new();
        short.push_value(u(3), &lattice);
        let merged = long.merge(&short, &lattice);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.elems()[0], AbsStackElem::single(u(1), &lattice));
        assert_eq!(merged.elems()[1].values().unwrap().len(), 2);
    }

    #[test]
    fn swap_and_dup_pad_missing_elements() {
        let lattice = Lattice::unrestricted();
        let mut stack = AbstractStack::new();
        stack.push_value(u(7), &lattice);
        stack.swap(2, &lattice);
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.elems()[0], AbsStackElem::single(u(7), &lattice));
        stack.dup(5, &lattice);
        assert_eq!(stack.peek(), Some(&AbsStackElem::single(None, &lattice)));
        assert_eq!(stack.pop(&lattice), AbsStackElem::single(None, &lattice));
    }

    #[test]
    fn replay_pads_swap_below_the_bottom() {
        // SWAP1 PUSH1 0x0c JUMP: the swap touches two caller elements
        let instructions = decode_bytes(&hex::decode("90600c56").unwrap()).unwrap();
        assert_eq!(symbolic_replay(&instructions), vec![None, None, u(0x0c)]);

        // SWAP1 SWAP1 PUSH1 0x0c DUP3 JUMP
        let instructions = decode_bytes(&hex::decode("9090600c8256").unwrap()).unwrap();
        assert_eq!(symbolic_replay(&instructions), vec![None, None, u(0x0c), None]);
    }

    #[test]
    fn replay_recovers_masked_trampoline_target() {
        // PUSH1 0x2a PUSH2 0xffff AND JUMP
        let instructions = decode_bytes(&hex::decode("602a61ffff1656").unwrap()).unwrap();
        assert_eq!(symbolic_replay(&instructions).last().copied().flatten(), u(0x2a));
    }
}
