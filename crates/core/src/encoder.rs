use crate::decoder::Instruction;
use crate::opcode::Opcode;
use revm::primitives::U256;
use salve_utils::errors::EncodeError;

/// Serializes an instruction sequence back into bytecode.
pub fn encode(instructions: &[Instruction]) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::with_capacity(instructions.len() * 3);
    for ins in instructions {
        bytes.push(ins.opcode.to_byte());

        // Handle immediate data for PUSH opcodes
        if let Opcode::PUSH(n) = ins.opcode {
            let imm = ins
                .imm
                .ok_or_else(|| EncodeError::MissingImmediate(ins.opcode.to_string()))?;
            let width = n as usize;
            if imm.bit_len() > width * 8 {
                return Err(EncodeError::ImmediateTooWide {
                    opcode: ins.opcode.to_string(),
                    value: format!("0x{imm:x}"),
                });
            }
            let word = imm.to_be_bytes::<32>();
            bytes.extend_from_slice(&word[32 - width..]);
        }
    }
    Ok(bytes)
}

/// Minimal number of bytes needed to push `value` (at least one).
pub fn push_width(value: U256) -> u8 {
    value.byte_len().max(1) as u8
}

/// A `PUSHn` of `value` using the minimal width.
pub fn push(value: U256) -> Instruction {
    Instruction::new(Opcode::PUSH(push_width(value)), Some(value))
}

/// A `PUSHn` of `value` using at least `width` bytes.
pub fn push_with_width(value: U256, width: u8) -> Instruction {
    Instruction::new(
        Opcode::PUSH(push_width(value).max(width).min(32)),
        Some(value),
    )
}
