//! Patch templates.
//!
//! A template file holds one JSON record per line:
//!
//! ```text
//! {"delete": "ORIGIN", "insert": "CALLER", "insert_mode": "before", "constructor": false}
//! ```
//!
//! `delete` and `insert` are space separated token lists. A token is a mnemonic (`DUP1`), a
//! push literal (`PUSH1_0x0`), a forward jump to a label (`PUSH_jump_loc1`), the label itself
//! (`JUMPDEST_jump_loc1`), or a parameter such as `error_handling_sequence`. Tokens are parsed
//! into [`TemplateOp`]s once; parameters are bound to instructions by [`PatchTemplate::render`].

use salve_core::decoder::Instruction;
use salve_core::opcode::Opcode;
use salve_core::U256;
use salve_utils::errors::TemplateError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// A value the caller supplies when rendering a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Param {
    /// Largest value of an unsigned integer type, as a `PUSH`.
    IntegerBounds,
    /// Instructions executed when a check fails.
    ErrorHandlingSequence,
    /// `PUSH` of a storage slot allocated by the patch.
    FreeStorageLocation,
    /// Largest value of a signed integer type.
    PushIntMax,
    /// Smallest value of a signed integer type.
    PushIntMin,
}

impl Param {
    const ALL: [Self; 5] = [
        Self::IntegerBounds,
        Self::ErrorHandlingSequence,
        Self::FreeStorageLocation,
        Self::PushIntMax,
        Self::PushIntMin,
    ];

    /// Token naming the parameter in template files.
    pub const fn name(self) -> &'static str {
        match self {
            Self::IntegerBounds => "integer_bounds",
            Self::ErrorHandlingSequence => "error_handling_sequence",
            Self::FreeStorageLocation => "free_storage_location",
            Self::PushIntMax => "push_int_max",
            Self::PushIntMin => "push_int_min",
        }
    }

    fn from_name(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|param| param.name() == token)
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One parsed template token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateOp {
    /// A fixed instruction.
    Literal(Instruction),
    /// `PUSH` of the address of the label with this id.
    ForwardJumpLabel(String),
    /// `JUMPDEST` carrying the label with this id.
    LabelDef(String),
    /// Instructions supplied at render time.
    ParameterSlot(Param),
}

impl FromStr for TemplateOp {
    type Err = TemplateError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        if let Some(id) = token.strip_prefix("PUSH_jump_loc") {
            return Ok(Self::ForwardJumpLabel(id.to_string()));
        }
        if let Some(id) = token.strip_prefix("JUMPDEST_jump_loc") {
            return Ok(Self::LabelDef(id.to_string()));
        }
        if let Some(param) = Param::from_name(token) {
            return Ok(Self::ParameterSlot(param));
        }

        let unknown = || TemplateError::UnknownToken(token.to_string());
        if let Some((mnemonic, literal)) = token.split_once('_') {
            let Ok(opcode @ Opcode::PUSH(width)) = Opcode::from_str(mnemonic) else {
                return Err(unknown());
            };
            let digits = literal.strip_prefix("0x").ok_or_else(unknown)?;
            let value = U256::from_str_radix(digits, 16).map_err(|_| unknown())?;
            if value.byte_len() > width as usize {
                return Err(unknown());
            }
            return Ok(Self::Literal(Instruction::new(opcode, Some(value))));
        }

        match Opcode::from_str(token) {
            Ok(Opcode::PUSH(_) | Opcode::Unknown(_)) | Err(_) => Err(unknown()),
            Ok(opcode) => Ok(Self::Literal(Instruction::new(opcode, None))),
        }
    }
}

/// Where `insert` goes relative to the anchor instruction when nothing is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertMode {
    /// Before the instruction at the target pc.
    #[default]
    Before,
    /// After the instruction at the target pc.
    After,
}

#[derive(Deserialize)]
struct RawRecord {
    #[serde(default)]
    delete: String,
    insert: String,
    #[serde(default)]
    insert_mode: InsertMode,
    #[serde(default)]
    constructor: bool,
}

/// A single delete/insert rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchTemplate {
    /// Instruction run to remove; empty to only insert.
    pub delete: Vec<TemplateOp>,
    /// Instructions to insert.
    pub insert: Vec<TemplateOp>,
    /// Placement of the insertion.
    pub insert_mode: InsertMode,
    /// Whether the rewrite applies to the deployment code.
    pub constructor: bool,
}

/// An instruction of a rendered patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOp {
    /// Inserted as is.
    Instruction(Instruction),
    /// `PUSH` of the address of the label.
    JumpRef(String),
    /// `JUMPDEST` defining the label.
    Label(String),
}

/// A template with every parameter bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPatch {
    /// Instruction run to remove.
    pub delete: Vec<Instruction>,
    /// Instructions to insert.
    pub insert: Vec<PatchOp>,
    /// Placement of the insertion.
    pub insert_mode: InsertMode,
    /// Whether the rewrite applies to the deployment code.
    pub constructor: bool,
}

impl RenderedPatch {
    /// A literal rewrite without labels.
    pub fn literal(delete: Vec<Instruction>, insert: Vec<Instruction>, insert_mode: InsertMode) -> Self {
        Self {
            delete,
            insert: insert.into_iter().map(PatchOp::Instruction).collect(),
            insert_mode,
            constructor: false,
        }
    }
}

/// Instructions bound to each parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateParams(BTreeMap<Param, Vec<Instruction>>);

impl TemplateParams {
    /// No parameters bound.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `param` to `instructions`.
    pub fn with(mut self, param: Param, instructions: Vec<Instruction>) -> Self {
        self.0.insert(param, instructions);
        self
    }

    /// Instructions bound to `param`.
    pub fn get(&self, param: Param) -> Option<&[Instruction]> {
        self.0.get(&param).map(Vec::as_slice)
    }
}

impl PatchTemplate {
    /// Binds every parameter slot.
    ///
    /// # Errors
    /// `MissingParameter` for an unbound slot, `UndefinedLabel` for a jump to a label the
    /// insertion never defines, `UnknownToken` for a label in the delete pattern.
    pub fn render(&self, params: &TemplateParams) -> Result<RenderedPatch, TemplateError> {
        let mut delete = Vec::new();
        for op in render_ops(&self.delete, params)? {
            match op {
                PatchOp::Instruction(ins) => delete.push(ins),
                PatchOp::JumpRef(id) => return Err(TemplateError::UnknownToken(format!("PUSH_jump_loc{id}"))),
                PatchOp::Label(id) => return Err(TemplateError::UnknownToken(format!("JUMPDEST_jump_loc{id}"))),
            }
        }

        let insert = render_ops(&self.insert, params)?;
        let defined: BTreeSet<&String> = insert
            .iter()
            .filter_map(|op| match op {
                PatchOp::Label(id) => Some(id),
                _ => None,
            })
            .collect();
        if let Some(id) = insert.iter().find_map(|op| match op {
            PatchOp::JumpRef(id) if !defined.contains(id) => Some(id),
            _ => None,
        }) {
            return Err(TemplateError::UndefinedLabel(id.clone()));
        }

        Ok(RenderedPatch {
            delete,
            insert,
            insert_mode: self.insert_mode,
            constructor: self.constructor,
        })
    }
}

fn render_ops(ops: &[TemplateOp], params: &TemplateParams) -> Result<Vec<PatchOp>, TemplateError> {
    let mut rendered = Vec::with_capacity(ops.len());
    for op in ops {
        match op {
            TemplateOp::Literal(ins) => rendered.push(PatchOp::Instruction(ins.clone())),
            TemplateOp::ForwardJumpLabel(id) => rendered.push(PatchOp::JumpRef(id.clone())),
            TemplateOp::LabelDef(id) => rendered.push(PatchOp::Label(id.clone())),
            TemplateOp::ParameterSlot(param) => {
                let bound = params
                    .get(*param)
                    .ok_or_else(|| TemplateError::MissingParameter(param.name().to_string()))?;
                rendered.extend(bound.iter().cloned().map(PatchOp::Instruction));
            }
        }
    }
    Ok(rendered)
}

fn parse_ops(tokens: &str) -> Result<Vec<TemplateOp>, TemplateError> {
    tokens.split_whitespace().map(TemplateOp::from_str).collect()
}

/// The built-in templates, one per patch shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    /// Bound check before an unsigned `ADD`.
    UnsignedOverflowAddition,
    /// Range check before a signed `ADD`.
    SignedOverflowAddition,
    /// Division check before an unsigned `MUL` of a narrow type.
    UnsignedOverflowMultiplication,
    /// Product check before a 256-bit `MUL`.
    UnsignedOverflowMultiplication256,
    /// `a >= b` check before `SUB`.
    IntegerUnderflow,
    /// Lock around a call and the writes it may race with.
    Reentrancy,
    /// Success check after a call.
    UnhandledException,
    /// Owner check guarding a sensitive instruction.
    AccessControl,
    /// `ORIGIN` replaced by `CALLER`.
    TransactionOrigin,
}

impl TemplateKind {
    /// File name of the template, also looked up in a template override directory.
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::UnsignedOverflowAddition => "unsigned_integer_overflow_addition.jsonl",
            Self::SignedOverflowAddition => "signed_integer_overflow_addition.jsonl",
            Self::UnsignedOverflowMultiplication => "unsigned_integer_overflow_multiplication.jsonl",
            Self::UnsignedOverflowMultiplication256 => {
                "unsigned_integer_overflow_multiplication_256_bit.jsonl"
            }
            Self::IntegerUnderflow => "integer_underflow.jsonl",
            Self::Reentrancy => "reentrancy.jsonl",
            Self::UnhandledException => "unhandled_exception.jsonl",
            Self::AccessControl => "access_control.jsonl",
            Self::TransactionOrigin => "transaction_origin.jsonl",
        }
    }

    const fn builtin(self) -> &'static str {
        match self {
            Self::UnsignedOverflowAddition => include_str!("../templates/unsigned_integer_overflow_addition.jsonl"),
            Self::SignedOverflowAddition => include_str!("../templates/signed_integer_overflow_addition.jsonl"),
            Self::UnsignedOverflowMultiplication => {
                include_str!("../templates/unsigned_integer_overflow_multiplication.jsonl")
            }
            Self::UnsignedOverflowMultiplication256 => {
                include_str!("../templates/unsigned_integer_overflow_multiplication_256_bit.jsonl")
            }
            Self::IntegerUnderflow => include_str!("../templates/integer_underflow.jsonl"),
            Self::Reentrancy => include_str!("../templates/reentrancy.jsonl"),
            Self::UnhandledException => include_str!("../templates/unhandled_exception.jsonl"),
            Self::AccessControl => include_str!("../templates/access_control.jsonl"),
            Self::TransactionOrigin => include_str!("../templates/transaction_origin.jsonl"),
        }
    }
}

/// Parses newline-delimited template records. Blank lines are skipped.
pub fn parse_templates(text: &str) -> Result<Vec<PatchTemplate>, TemplateError> {
    let mut templates = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let raw: RawRecord = serde_json::from_str(line).map_err(|source| TemplateError::Json {
            line: index + 1,
            source,
        })?;
        templates.push(PatchTemplate {
            delete: parse_ops(&raw.delete)?,
            insert: parse_ops(&raw.insert)?,
            insert_mode: raw.insert_mode,
            constructor: raw.constructor,
        });
    }
    Ok(templates)
}

/// Loads the records of `kind`, preferring `<dir>/<file_name>` when `dir` holds one.
pub fn load_templates(kind: TemplateKind, dir: Option<&Path>) -> Result<Vec<PatchTemplate>, TemplateError> {
    if let Some(path) = dir.map(|dir| dir.join(kind.file_name())).filter(|path| path.is_file()) {
        tracing::debug!("Loading template override {}", path.display());
        let text = std::fs::read_to_string(&path).map_err(|source| TemplateError::Io {
            path: path.display().to_string(),
            source,
        })?;
        return parse_templates(&text);
    }
    parse_templates(kind.builtin())
}
