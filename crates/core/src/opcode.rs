/// Module defining the EVM opcode enumeration and related functionality.
///
/// This module provides the `Opcode` enum covering the full Cancun instruction set, which is
/// used for decoding, encoding, basic-block splitting and both abstract interpreters. Byte
/// values, mnemonics, immediate sizes and `(pops, pushes)` stack arities come from revm's
/// opcode table; the enum only gives them a shape to match on. Arities are exposed through
/// [`Opcode::stack_arity`] and the process-wide [`ARITY`] table.
use revm::bytecode::opcode::{self as op, OpCode, OpCodeInfo};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Enumeration of EVM opcodes with their byte values and immediate data sizes.
///
/// Variable-length stack operations (`PUSH(n)`, `DUP(n)`, `SWAP(n)`, `LOG(n)`) carry their
/// index; bytes without an assigned instruction decode to `Unknown(u8)` and behave like
/// `INVALID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Opcode {
    // 0x range - stop & arithmetic
    STOP,       // 0x00
    ADD,        // 0x01
    MUL,        // 0x02
    SUB,        // 0x03
    DIV,        // 0x04
    SDIV,       // 0x05
    MOD,        // 0x06
    SMOD,       // 0x07
    ADDMOD,     // 0x08
    MULMOD,     // 0x09
    EXP,        // 0x0a
    SIGNEXTEND, // 0x0b
    // 10x range - comparison & bitwise logic
    LT,     // 0x10
    GT,     // 0x11
    SLT,    // 0x12
    SGT,    // 0x13
    EQ,     // 0x14
    ISZERO, // 0x15
    AND,    // 0x16
    OR,     // 0x17
    XOR,    // 0x18
    NOT,    // 0x19
    BYTE,   // 0x1a
    SHL,    // 0x1b
    SHR,    // 0x1c
    SAR,    // 0x1d
    // 20x range - hashing
    KECCAK256, // 0x20
    // 30x range - environment
    ADDRESS,        // 0x30
    BALANCE,        // 0x31
    ORIGIN,         // 0x32
    CALLER,         // 0x33
    CALLVALUE,      // 0x34
    CALLDATALOAD,   // 0x35
    CALLDATASIZE,   // 0x36
    CALLDATACOPY,   // 0x37
    CODESIZE,       // 0x38
    CODECOPY,       // 0x39
    GASPRICE,       // 0x3a
    EXTCODESIZE,    // 0x3b
    EXTCODECOPY,    // 0x3c
    RETURNDATASIZE, // 0x3d
    RETURNDATACOPY, // 0x3e
    EXTCODEHASH,    // 0x3f
    // 40x range - block information
    BLOCKHASH,   // 0x40
    COINBASE,    // 0x41
    TIMESTAMP,   // 0x42
    NUMBER,      // 0x43
    PREVRANDAO,  // 0x44
    GASLIMIT,    // 0x45
    CHAINID,     // 0x46
    SELFBALANCE, // 0x47
    BASEFEE,     // 0x48
    BLOBHASH,    // 0x49
    BLOBBASEFEE, // 0x4a
    // 50x range - stack, memory, storage & flow
    POP,      // 0x50
    MLOAD,    // 0x51
    MSTORE,   // 0x52
    MSTORE8,  // 0x53
    SLOAD,    // 0x54
    SSTORE,   // 0x55
    JUMP,     // 0x56
    JUMPI,    // 0x57
    PC,       // 0x58
    MSIZE,    // 0x59
    GAS,      // 0x5a
    JUMPDEST, // 0x5b
    TLOAD,    // 0x5c
    TSTORE,   // 0x5d
    MCOPY,    // 0x5e
    PUSH0,    // 0x5f
    // 60x-a0x range - variable-length stack ops and logging
    PUSH(u8), // 0x60–0x7f (PUSH1 to PUSH32)
    DUP(u8),  // 0x80–0x8f (DUP1 to DUP16)
    SWAP(u8), // 0x90–0x9f (SWAP1 to SWAP16)
    LOG(u8),  // 0xa0–0xa4 (LOG0 to LOG4)
    // f0x range - system operations
    CREATE,       // 0xf0
    CALL,         // 0xf1
    CALLCODE,     // 0xf2
    RETURN,       // 0xf3
    DELEGATECALL, // 0xf4
    CREATE2,      // 0xf5
    STATICCALL,   // 0xfa
    REVERT,       // 0xfd
    INVALID,      // 0xfe
    SELFDESTRUCT, // 0xff
    // Catch-all for unassigned bytes
    Unknown(u8),
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(byte) => write!(f, "UNKNOWN_0x{byte:02x}"),
            // revm keeps the pre-merge name
            Self::PREVRANDAO => f.write_str("PREVRANDAO"),
            opcode => f.write_str(OpCode::name_by_op(opcode.to_byte())),
        }
    }
}

impl FromStr for Opcode {
    type Err = String;

    /// Parses a mnemonic, accepting the legacy names `SHA3`, `DIFFICULTY`, `SUICIDE` and
    /// `ASSERTFAIL`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let canonical = match upper.as_str() {
            "SHA3" => "KECCAK256",
            "PREVRANDAO" => "DIFFICULTY",
            "SUICIDE" => "SELFDESTRUCT",
            "ASSERTFAIL" => "INVALID",
            other => other,
        };
        (0u8..=255)
            .filter(|&byte| OpCode::new(byte).is_some_and(|op| op.as_str() == canonical))
            .map(|byte| Self::parse(byte).0)
            .find(|op| !matches!(op, Self::Unknown(_)))
            .ok_or_else(|| format!("unknown opcode mnemonic: {s}"))
    }
}

impl Opcode {
    /// Parses a raw byte into an `Opcode` and its immediate data size.
    ///
    /// # Arguments
    /// * `byte` - The raw byte representing the opcode.
    ///
    /// # Returns
    /// A tuple containing the `Opcode` variant and the number of immediate bytes to follow
    /// (e.g., 1 for `PUSH1`, 32 for `PUSH32`, 0 for others).
    ///
    /// # Examples
    /// ```rust,ignore
    /// let (opcode, imm_size) = Opcode::parse(0x60);
    /// assert_eq!(opcode, Opcode::PUSH(1));
    /// assert_eq!(imm_size, 1);
    /// ```
    pub fn parse(byte: u8) -> (Self, usize) {
        use Opcode::*;

        let opcode = match byte {
            op::STOP => STOP,
            op::ADD => ADD,
            op::MUL => MUL,
            op::SUB => SUB,
            op::DIV => DIV,
            op::SDIV => SDIV,
            op::MOD => MOD,
            op::SMOD => SMOD,
            op::ADDMOD => ADDMOD,
            op::MULMOD => MULMOD,
            op::EXP => EXP,
            op::SIGNEXTEND => SIGNEXTEND,
            op::LT => LT,
            op::GT => GT,
            op::SLT => SLT,
            op::SGT => SGT,
            op::EQ => EQ,
            op::ISZERO => ISZERO,
            op::AND => AND,
            op::OR => OR,
            op::XOR => XOR,
            op::NOT => NOT,
            op::BYTE => BYTE,
            op::SHL => SHL,
            op::SHR => SHR,
            op::SAR => SAR,
            op::KECCAK256 => KECCAK256,
            op::ADDRESS => ADDRESS,
            op::BALANCE => BALANCE,
            op::ORIGIN => ORIGIN,
            op::CALLER => CALLER,
            op::CALLVALUE => CALLVALUE,
            op::CALLDATALOAD => CALLDATALOAD,
            op::CALLDATASIZE => CALLDATASIZE,
            op::CALLDATACOPY => CALLDATACOPY,
            op::CODESIZE => CODESIZE,
            op::CODECOPY => CODECOPY,
            op::GASPRICE => GASPRICE,
            op::EXTCODESIZE => EXTCODESIZE,
            op::EXTCODECOPY => EXTCODECOPY,
            op::RETURNDATASIZE => RETURNDATASIZE,
            op::RETURNDATACOPY => RETURNDATACOPY,
            op::EXTCODEHASH => EXTCODEHASH,
            op::BLOCKHASH => BLOCKHASH,
            op::COINBASE => COINBASE,
            op::TIMESTAMP => TIMESTAMP,
            op::NUMBER => NUMBER,
            op::DIFFICULTY => PREVRANDAO,
            op::GASLIMIT => GASLIMIT,
            op::CHAINID => CHAINID,
            op::SELFBALANCE => SELFBALANCE,
            op::BASEFEE => BASEFEE,
            op::BLOBHASH => BLOBHASH,
            op::BLOBBASEFEE => BLOBBASEFEE,
            op::POP => POP,
            op::MLOAD => MLOAD,
            op::MSTORE => MSTORE,
            op::MSTORE8 => MSTORE8,
            op::SLOAD => SLOAD,
            op::SSTORE => SSTORE,
            op::JUMP => JUMP,
            op::JUMPI => JUMPI,
            op::PC => PC,
            op::MSIZE => MSIZE,
            op::GAS => GAS,
            op::JUMPDEST => JUMPDEST,
            op::TLOAD => TLOAD,
            op::TSTORE => TSTORE,
            op::MCOPY => MCOPY,
            op::PUSH0 => PUSH0,
            op::CREATE => CREATE,
            op::CALL => CALL,
            op::CALLCODE => CALLCODE,
            op::RETURN => RETURN,
            op::DELEGATECALL => DELEGATECALL,
            op::CREATE2 => CREATE2,
            op::STATICCALL => STATICCALL,
            op::REVERT => REVERT,
            op::INVALID => INVALID,
            op::SELFDESTRUCT => SELFDESTRUCT,
            op::PUSH1..=op::PUSH32 => PUSH(byte - op::PUSH0),
            op::DUP1..=op::DUP16 => DUP(byte - op::DUP1 + 1),
            op::SWAP1..=op::SWAP16 => SWAP(byte - op::SWAP1 + 1),
            op::LOG0..=op::LOG4 => LOG(byte - op::LOG0),
            other => Unknown(other),
        };
        (opcode, opcode.immediate_size())
    }

    /// Converts the opcode to its byte representation.
    pub const fn to_byte(&self) -> u8 {
        use Opcode::*;

        match self {
            STOP => op::STOP,
            ADD => op::ADD,
            MUL => op::MUL,
            SUB => op::SUB,
            DIV => op::DIV,
            SDIV => op::SDIV,
            MOD => op::MOD,
            SMOD => op::SMOD,
            ADDMOD => op::ADDMOD,
            MULMOD => op::MULMOD,
            EXP => op::EXP,
            SIGNEXTEND => op::SIGNEXTEND,
            LT => op::LT,
            GT => op::GT,
            SLT => op::SLT,
            SGT => op::SGT,
            EQ => op::EQ,
            ISZERO => op::ISZERO,
            AND => op::AND,
            OR => op::OR,
            XOR => op::XOR,
            NOT => op::NOT,
            BYTE => op::BYTE,
            SHL => op::SHL,
            SHR => op::SHR,
            SAR => op::SAR,
            KECCAK256 => op::KECCAK256,
            ADDRESS => op::ADDRESS,
            BALANCE => op::BALANCE,
            ORIGIN => op::ORIGIN,
            CALLER => op::CALLER,
            CALLVALUE => op::CALLVALUE,
            CALLDATALOAD => op::CALLDATALOAD,
            CALLDATASIZE => op::CALLDATASIZE,
            CALLDATACOPY => op::CALLDATACOPY,
            CODESIZE => op::CODESIZE,
            CODECOPY => op::CODECOPY,
            GASPRICE => op::GASPRICE,
            EXTCODESIZE => op::EXTCODESIZE,
            EXTCODECOPY => op::EXTCODECOPY,
            RETURNDATASIZE => op::RETURNDATASIZE,
            RETURNDATACOPY => op::RETURNDATACOPY,
            EXTCODEHASH => op::EXTCODEHASH,
            BLOCKHASH => op::BLOCKHASH,
            COINBASE => op::COINBASE,
            TIMESTAMP => op::TIMESTAMP,
            NUMBER => op::NUMBER,
            PREVRANDAO => op::DIFFICULTY,
            GASLIMIT => op::GASLIMIT,
            CHAINID => op::CHAINID,
            SELFBALANCE => op::SELFBALANCE,
            BASEFEE => op::BASEFEE,
            BLOBHASH => op::BLOBHASH,
            BLOBBASEFEE => op::BLOBBASEFEE,
            POP => op::POP,
            MLOAD => op::MLOAD,
            MSTORE => op::MSTORE,
            MSTORE8 => op::MSTORE8,
            SLOAD => op::SLOAD,
            SSTORE => op::SSTORE,
            JUMP => op::JUMP,
            JUMPI => op::JUMPI,
            PC => op::PC,
            MSIZE => op::MSIZE,
            GAS => op::GAS,
            JUMPDEST => op::JUMPDEST,
            TLOAD => op::TLOAD,
            TSTORE => op::TSTORE,
            MCOPY => op::MCOPY,
            PUSH0 => op::PUSH0,
            PUSH(n) => op::PUSH0 + *n,
            DUP(n) => op::DUP1 + *n - 1,
            SWAP(n) => op::SWAP1 + *n - 1,
            LOG(n) => op::LOG0 + *n,
            CREATE => op::CREATE,
            CALL => op::CALL,
            CALLCODE => op::CALLCODE,
            RETURN => op::RETURN,
            DELEGATECALL => op::DELEGATECALL,
            CREATE2 => op::CREATE2,
            STATICCALL => op::STATICCALL,
            REVERT => op::REVERT,
            INVALID => op::INVALID,
            SELFDESTRUCT => op::SELFDESTRUCT,
            Unknown(byte) => *byte,
        }
    }

    /// revm's metadata for the opcode, `None` for unassigned bytes.
    pub fn info(&self) -> Option<OpCodeInfo> {
        match self {
            Self::Unknown(_) => None,
            opcode => OpCode::info_by_op(opcode.to_byte()),
        }
    }

    /// Number of immediate bytes following the opcode byte.
    pub fn immediate_size(&self) -> usize {
        self.info().map_or(0, |info| usize::from(info.immediate_size()))
    }

    /// Returns `true` for `PUSH0` and `PUSH1`..`PUSH32`.
    pub const fn is_push(&self) -> bool {
        matches!(self, Self::PUSH0 | Self::PUSH(_))
    }

    /// Returns `true` for the opcodes that end a basic block.
    ///
    /// Unassigned bytes halt execution like `INVALID` and are treated the same way.
    pub const fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::STOP
                | Self::JUMP
                | Self::JUMPI
                | Self::RETURN
                | Self::REVERT
                | Self::INVALID
                | Self::SELFDESTRUCT
                | Self::Unknown(_)
        )
    }

    /// Returns `true` for `JUMP` and `JUMPI`.
    pub const fn is_jump(&self) -> bool {
        matches!(self, Self::JUMP | Self::JUMPI)
    }

    /// Returns `true` for opcodes a `view` function may not execute.
    pub const fn modifies_state(&self) -> bool {
        matches!(
            self,
            Self::CREATE
                | Self::CREATE2
                | Self::CALL
                | Self::CALLCODE
                | Self::DELEGATECALL
                | Self::SELFDESTRUCT
                | Self::SSTORE
                | Self::TSTORE
                | Self::LOG(_)
        )
    }

    /// Returns `true` for opcodes that read the environment, storage or block context.
    pub const fn reads_environment(&self) -> bool {
        matches!(
            self,
            Self::ADDRESS
                | Self::BALANCE
                | Self::ORIGIN
                | Self::CALLER
                | Self::CALLVALUE
                | Self::CALLDATALOAD
                | Self::CALLDATASIZE
                | Self::CALLDATACOPY
                | Self::CODESIZE
                | Self::CODECOPY
                | Self::GASPRICE
                | Self::EXTCODESIZE
                | Self::EXTCODECOPY
                | Self::RETURNDATASIZE
                | Self::RETURNDATACOPY
                | Self::EXTCODEHASH
                | Self::BLOCKHASH
                | Self::COINBASE
                | Self::TIMESTAMP
                | Self::NUMBER
                | Self::PREVRANDAO
                | Self::GASLIMIT
                | Self::CHAINID
                | Self::SELFBALANCE
                | Self::BASEFEE
                | Self::BLOBHASH
                | Self::BLOBBASEFEE
                | Self::SLOAD
                | Self::TLOAD
                | Self::STATICCALL
        )
    }

    /// Returns the `(pops, pushes)` stack arity of the opcode. Unassigned bytes halt and
    /// touch nothing.
    pub fn stack_arity(&self) -> (usize, usize) {
        self.info().map_or((0, 0), |info| {
            (usize::from(info.inputs()), usize::from(info.outputs()))
        })
    }
}

/// Process-wide `(pops, pushes)` lookup indexed by opcode byte.
#[derive(Debug)]
pub struct ArityTable([(u8, u8); 256]);

impl ArityTable {
    /// Builds the table from [`Opcode::stack_arity`].
    pub fn evm() -> Self {
        let mut table = [(0u8, 0u8); 256];
        for (byte, entry) in (0u8..=255).zip(table.iter_mut()) {
            let (opcode, _) = Opcode::parse(byte);
            *entry = opcode.info().map_or((0, 0), |info| (info.inputs(), info.outputs()));
        }
        Self(table)
    }

    /// Returns the arity of `opcode`.
    pub const fn get(&self, opcode: Opcode) -> (usize, usize) {
        let (pops, pushes) = self.0[opcode.to_byte() as usize];
        (pops as usize, pushes as usize)
    }
}

/// The arity table shared by every analysis.
pub static ARITY: LazyLock<ArityTable> = LazyLock::new(ArityTable::evm);
