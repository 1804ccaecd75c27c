pub mod bug;
pub mod cfg_ir;
pub mod decoder;
pub mod encoder;
pub mod opcode;
pub mod sections;

pub use opcode::Opcode;
pub use revm::primitives::U256;
