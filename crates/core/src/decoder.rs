//! salve's single entry-point for turning byte-sequences into instruction streams.
//!
//! Decoding is a plain linear sweep: every byte starts an instruction unless it is the
//! immediate of a preceding `PUSH`. Unassigned bytes decode to [`Opcode::Unknown`]; a `PUSH`
//! whose immediate runs past the end of the buffer is an error.

use crate::opcode::Opcode;
use crate::sections::replace_library_placeholders;
use revm::primitives::U256;
use salve_utils::errors::DecodeError;
use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::Path};
use tiny_keccak::{Hasher, Keccak};

/// Program counter of an instruction, tracking where it was decoded from.
///
/// `current` is the byte offset in the program as it stands now; `original` is the offset the
/// instruction was decoded at, or `None` for instructions inserted by a patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pc {
    /// Offset in the current layout.
    pub current: usize,
    /// Offset in the decoded input, if the instruction came from it.
    pub original: Option<usize>,
}

impl Pc {
    /// PC of an instruction decoded at `pc`.
    pub const fn decoded(pc: usize) -> Self {
        Self {
            current: pc,
            original: Some(pc),
        }
    }

    /// PC of an instruction inserted at `pc`.
    pub const fn inserted(pc: usize) -> Self {
        Self {
            current: pc,
            original: None,
        }
    }

    /// Returns `true` if the instruction was inserted by a patch.
    pub const fn is_inserted(&self) -> bool {
        self.original.is_none()
    }
}

/// Represents a single disassembled instruction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Instruction {
    /// the instruction's program counter (in bytes)
    pub pc: Pc,
    /// the decoded opcode
    pub opcode: Opcode,
    /// the PUSH immediate, if present
    pub imm: Option<U256>,
}

/// Metadata about the decoded bytecode blob.
#[derive(Debug)]
pub struct DecodeInfo {
    /// number of bytes
    pub byte_length: usize,
    /// a 32-byte Keccak-256 hash of the raw bytes
    pub keccak_hash: [u8; 32],
    /// input from the variants of SourceType
    pub source: SourceType,
}

/// Source type of the bytecode input.
#[derive(Debug, PartialEq, Eq)]
pub enum SourceType {
    /// Hex string given on the command line.
    HexString,
    /// Hex text read from a file.
    File,
}

/// Normalizes hex strings by removing whitespace, 0x prefix, and ensuring even length
pub fn normalize_hex_string(input: &str) -> Result<String, DecodeError> {
    let compact = input.replace(['\n', '\r', ' ', '\t'], "");
    let clean = compact.strip_prefix("0x").unwrap_or(&compact);

    // Validate hex characters
    if let Some((index, c)) = clean.char_indices().find(|(_, c)| !c.is_ascii_hexdigit()) {
        return Err(DecodeError::HexDecode(
            hex::FromHexError::InvalidHexCharacter { c, index },
        ));
    }

    // Ensure even length by padding with leading zero if necessary
    Ok(if clean.len() % 2 == 1 {
        format!("0{}", clean.to_ascii_lowercase())
    } else {
        clean.to_ascii_lowercase()
    })
}

/// Normalizes input into a byte vector from hex string or file.
///
/// Unlinked library placeholders are replaced before the hex is parsed.
pub fn input_to_bytes(input: &str, is_file: bool) -> Result<Vec<u8>, DecodeError> {
    let text = if is_file {
        let path = Path::new(input);
        fs::read_to_string(path).map_err(|e| DecodeError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?
    } else {
        input.to_string()
    };
    let normalized = normalize_hex_string(&replace_library_placeholders(&text))?;
    Ok(hex::decode(normalized)?)
}

/// Decodes raw EVM bytecode into an instruction stream.
///
/// # Arguments
/// * `bytes` - The raw EVM bytecode bytes to decode.
///
/// # Returns
/// The instructions in address order, or an error if the buffer is empty or ends inside a
/// `PUSH` immediate.
pub fn decode_bytes(bytes: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    let mut instructions = Vec::with_capacity(bytes.len());
    let mut pc = 0;
    while pc < bytes.len() {
        let (opcode, imm_len) = Opcode::parse(bytes[pc]);
        let imm = if imm_len > 0 {
            let data = bytes
                .get(pc + 1..pc + 1 + imm_len)
                .ok_or_else(|| DecodeError::TruncatedPush {
                    pc,
                    opcode: opcode.to_string(),
                    needed: imm_len,
                    available: bytes.len() - pc - 1,
                })?;
            Some(U256::from_be_slice(data))
        } else {
            None
        };
        instructions.push(Instruction {
            pc: Pc::decoded(pc),
            opcode,
            imm,
        });
        pc += 1 + imm_len;
    }

    tracing::debug!(
        "Decoded {} instructions from {} bytes",
        instructions.len(),
        bytes.len()
    );
    Ok(instructions)
}

/// Decodes raw EVM bytecode into an instruction stream with metadata.
///
/// This is a convenience wrapper around `decode_bytes` that handles input normalization from
/// hex strings or file paths.
///
/// # Arguments
/// * `input` - A hex string or file path representing the EVM bytecode.
/// * `is_file` - Flag indicating if the input is a file path (false for hex string).
///
/// # Returns
/// A tuple of (instructions, DecodeInfo, raw bytes), or an error if decoding fails.
pub fn decode_bytecode(
    input: &str,
    is_file: bool,
) -> Result<(Vec<Instruction>, DecodeInfo, Vec<u8>), DecodeError> {
    // 1. Normalize input to bytes
    let bytes = input_to_bytes(input, is_file)?;

    // 2. Compute metadata
    let mut keccak = Keccak::v256();
    keccak.update(&bytes);
    let mut hash = [0u8; 32];
    keccak.finalize(&mut hash);

    let info = DecodeInfo {
        byte_length: bytes.len(),
        keccak_hash: hash,
        source: if is_file {
            SourceType::File
        } else {
            SourceType::HexString
        },
    };

    // 3. Sweep
    let instructions = decode_bytes(&bytes)?;
    Ok((instructions, info, bytes))
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // pc: six-digit hex, opcode left-padded to 8 chars, then optional imm
        let mnemonic = self.opcode.to_string();
        match &self.imm {
            Some(imm) => write!(f, "{:06x}  {mnemonic:<8} 0x{imm:x}", self.pc.current),
            None => write!(f, "{:06x}  {mnemonic}", self.pc.current),
        }
    }
}

impl Instruction {
    /// Creates an inserted instruction with no PC assigned yet.
    pub const fn new(opcode: Opcode, imm: Option<U256>) -> Self {
        Self {
            pc: Pc::inserted(0),
            opcode,
            imm,
        }
    }

    /// Returns the number of bytes this instruction occupies in bytecode.
    #[inline]
    pub fn byte_size(&self) -> usize {
        1 + self.opcode.immediate_size()
    }

    /// Value pushed by a `PUSH0`..`PUSH32`, `None` for other opcodes.
    pub fn push_value(&self) -> Option<U256> {
        match self.opcode {
            Opcode::PUSH0 => Some(U256::ZERO),
            Opcode::PUSH(_) => Some(self.imm.unwrap_or_default()),
            _ => None,
        }
    }

    /// Original PC, `None` for inserted instructions.
    pub const fn original_pc(&self) -> Option<usize> {
        self.pc.original
    }

    /// Assembly text without the PC, e.g. `PUSH1 0x3` or `JUMPI`.
    pub fn asm(&self) -> String {
        match &self.imm {
            Some(imm) => format!("{} 0x{imm:x}", self.opcode),
            None => self.opcode.to_string(),
        }
    }
}
