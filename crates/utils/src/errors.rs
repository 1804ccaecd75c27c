use thiserror::Error;

/// Custom error type for decoding operations.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The input is not valid hexadecimal.
    #[error("hex decode failed: {0}")]
    HexDecode(#[from] hex::FromHexError),

    /// The bytecode file could not be read.
    #[error("could not read file '{path}': {source}")]
    FileRead {
        /// Path that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// There is nothing to decode.
    #[error("empty bytecode")]
    Empty,

    /// A PUSH immediate runs past the end of the buffer.
    #[error("truncated {opcode} at pc={pc:#x}: needs {needed} immediate bytes, {available} available")]
    TruncatedPush {
        /// PC of the truncated PUSH.
        pc: usize,
        /// Mnemonic of the PUSH.
        opcode: String,
        /// Immediate bytes the opcode declares.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },
}

/// Errors that can occur during the encoding process.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// A PUSH immediate does not fit the declared opcode width.
    #[error("immediate {value} does not fit in {opcode}")]
    ImmediateTooWide {
        /// Mnemonic of the PUSH.
        opcode: String,
        /// The offending value, hex encoded.
        value: String,
    },
    /// A PUSH carries no immediate.
    #[error("missing immediate for {0}")]
    MissingImmediate(String),
}

/// Error type for CFG construction and stack value analysis.
#[derive(Debug, Error)]
pub enum CfgError {
    /// No basic block could be recovered.
    #[error("no basic blocks recovered")]
    NoBlocks,
    /// No block starts at the given pc.
    #[error("no basic block at pc={0:#x}")]
    MissingBlock(usize),
    /// No function starts at the given pc.
    #[error("no function starting at pc={0:#x}")]
    UnknownFunction(usize),
    /// Decoding error from the `decoder` module.
    #[error("decoding error: {0}")]
    Decode(#[from] DecodeError),
}

/// Error type for the taint runner.
#[derive(Debug, Error)]
pub enum TaintError {
    /// An instruction popped more values than the abstract stack holds.
    #[error("stack underflow executing {opcode} at pc={pc:#x}")]
    StackUnderflow {
        /// Mnemonic of the instruction.
        opcode: String,
        /// Current pc of the instruction.
        pc: usize,
    },
}

/// Error type for patch template parsing and rendering.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// A template record is not valid JSON.
    #[error("template line {line}: {source}")]
    Json {
        /// 1-based line number in the template file.
        line: usize,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// A token is neither a mnemonic, a label, nor a parameter.
    #[error("unknown template token `{0}`")]
    UnknownToken(String),
    /// A template references a parameter the caller did not provide.
    #[error("template parameter `{0}` was not provided")]
    MissingParameter(String),
    /// A label is referenced but never defined.
    #[error("jump label `{0}` is never defined")]
    UndefinedLabel(String),
    /// The template file could not be read.
    #[error("could not read template '{path}': {source}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the patch pipeline.
#[derive(Debug, Error)]
pub enum PatchError {
    /// The bytecode could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    /// No CFG could be recovered.
    #[error("cfg error: {0}")]
    Cfg(#[from] CfgError),
    /// Re-encoding the patched program failed.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    /// A template could not be loaded or rendered.
    #[error("template error: {0}")]
    Template(#[from] TemplateError),
    /// The constructor copies no runtime code.
    #[error("no CODECOPY found in constructor")]
    MissingCodeCopy,
    /// Serializing the report failed.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors raised while running external vulnerability detectors.
#[derive(Debug, Error)]
pub enum DetectorError {
    /// The detector process could not be started.
    #[error("failed to start {tool}: {source}")]
    Spawn {
        /// Detector name.
        tool: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The detector did not finish in time.
    #[error("{tool} timed out after {secs}s")]
    Timeout {
        /// Detector name.
        tool: String,
        /// Timeout in seconds.
        secs: u64,
    },
    /// The detector output could not be understood.
    #[error("could not parse {tool} output: {msg}")]
    Parse {
        /// Detector name.
        tool: String,
        /// What went wrong.
        msg: String,
    },
    /// No detector goes by this name.
    #[error("unknown detector: {0}")]
    UnknownTool(String),
    /// Reading or writing a bug file failed.
    #[error("could not access '{path}': {source}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The bytecode handed to a detector is not valid hex.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// A bug list is not valid JSON.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
