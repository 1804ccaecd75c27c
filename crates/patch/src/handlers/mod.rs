//! Bug handlers: each turns the bugs of one category into rewrites of the CFG.

mod access_control;
mod arithmetic;
mod exception;
mod origin;
mod reentrancy;

pub use access_control::AccessControlHandler;
pub use arithmetic::{OverflowHandler, UnderflowHandler};
pub use exception::UnhandledExceptionHandler;
pub use origin::TransactionOriginHandler;
pub use reentrancy::ReentrancyHandler;

use crate::patcher::{apply_patch, asm, Application};
use crate::report::{PatchEntry, PatchRecord};
use crate::template::{load_templates, RenderedPatch, TemplateKind, TemplateParams};
use petgraph::graph::NodeIndex;
use salve_analysis::{codecopy_sites, error_sequence, StorageLayout};
use salve_core::bug::{Bug, BugType};
use salve_core::cfg_ir::Cfg;
use salve_core::decoder::Instruction;
use salve_core::opcode::Opcode;
use salve_utils::errors::PatchError;
use std::path::PathBuf;
use tracing::warn;

/// Patches the bugs of one category.
pub trait BugHandler: Send + Sync {
    /// Returns the handler's name for logging.
    fn name(&self) -> &'static str;
    /// Whether the handler patches bugs of `kind`.
    fn handles(&self, kind: &BugType) -> bool;
    /// Patches `bugs`, all of a kind the handler accepts, in ascending pc order.
    ///
    /// Returns one entry per address that was rewritten. Bugs that cannot be patched are
    /// recorded in the context's diagnostics.
    fn apply(&self, ctx: &mut PatchContext, bugs: &[Bug]) -> Result<Vec<PatchEntry>, PatchError>;
}

/// Handlers for every supported category, in the order they run.
pub fn default_handlers() -> Vec<Box<dyn BugHandler>> {
    vec![
        Box::new(OverflowHandler),
        Box::new(UnderflowHandler),
        Box::new(ReentrancyHandler),
        Box::new(UnhandledExceptionHandler),
        Box::new(AccessControlHandler::new(BugType::LeakingEther)),
        Box::new(AccessControlHandler::new(BugType::Suicidal)),
        Box::new(AccessControlHandler::new(BugType::UnsafeDelegatecall)),
        Box::new(TransactionOriginHandler),
    ]
}

/// The `CODECOPY` that copies the runtime out of the deployment code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeCopy {
    /// Decoded pc of the `CODECOPY`.
    pub pc: usize,
    /// Decoded pc of the first instruction of `PUSH len DUP1 PUSH offset PUSH 0 CODECOPY`.
    pub anchor: usize,
}

impl CodeCopy {
    /// The last `CODECOPY` reachable from the constructor entry.
    ///
    /// # Errors
    /// `MissingCodeCopy` when there is none.
    pub fn locate(cfg: &Cfg) -> Result<Self, PatchError> {
        let pc = codecopy_sites(cfg)
            .last()
            .and_then(Instruction::original_pc)
            .ok_or(PatchError::MissingCodeCopy)?;
        let anchor = cfg
            .block_containing(pc)
            .and_then(|node| {
                let block = &cfg.block(node).instructions;
                let index = block.iter().position(|ins| ins.original_pc() == Some(pc))?;
                block[index.saturating_sub(4)].original_pc()
            })
            .unwrap_or(pc);
        Ok(Self { pc, anchor })
    }
}

/// Deployment code being patched.
#[derive(Debug, Clone)]
pub struct Constructor {
    /// CFG of the deployment code.
    pub cfg: Cfg,
    /// The runtime copy.
    pub codecopy: CodeCopy,
}

/// Everything a handler reads and rewrites.
#[derive(Debug)]
pub struct PatchContext {
    /// Runtime CFG, rewritten in place.
    pub runtime: Cfg,
    /// Deployment code, when the input has any.
    pub constructor: Option<Constructor>,
    /// Storage layout; patches allocate their slots from it.
    pub storage: StorageLayout,
    /// Reuse the contract's own error handlers instead of `PUSH1 0x0 DUP1 REVERT`.
    pub error_handling_inference: bool,
    /// Directory with template overrides.
    pub templates_dir: Option<PathBuf>,
    /// Bugs or rewrites that were skipped.
    pub diagnostics: Vec<String>,
}

impl PatchContext {
    /// Context for patching `runtime`.
    pub fn new(runtime: Cfg, constructor: Option<Constructor>, storage: StorageLayout) -> Self {
        Self {
            runtime,
            constructor,
            storage,
            error_handling_inference: false,
            templates_dir: None,
            diagnostics: Vec::new(),
        }
    }

    /// Records a skipped bug or rewrite.
    pub fn skip(&mut self, message: String) {
        warn!("{message}");
        self.diagnostics.push(message);
    }

    /// Runtime block holding the instruction decoded at `pc`, recording a diagnostic when
    /// there is none.
    pub fn buggy_block(&mut self, bug: &Bug) -> Option<NodeIndex> {
        let node = self.runtime.block_containing(bug.pc);
        if node.is_none() {
            self.skip(format!("{} at pc 0x{:x}: no basic block contains this pc", bug.kind, bug.pc));
        }
        node
    }

    /// Error sequence for a check inserted in `node`.
    pub fn error_sequence(&self, node: NodeIndex) -> Vec<Instruction> {
        error_sequence(&self.runtime, node, self.error_handling_inference)
    }

    /// Renders every record of `kind` with `params`.
    pub fn render(&self, kind: TemplateKind, params: &TemplateParams) -> Result<Vec<RenderedPatch>, PatchError> {
        load_templates(kind, self.templates_dir.as_deref())?
            .iter()
            .map(|template| template.render(params).map_err(PatchError::from))
            .collect()
    }

    /// Applies `patch` to the runtime at `pc`.
    pub fn apply_runtime(&mut self, patch: &RenderedPatch, pc: usize) -> Option<PatchRecord> {
        match apply_patch(&mut self.runtime, patch, pc) {
            Application::Applied { inserted } => Some(record(patch, &inserted)),
            Application::NotApplied => {
                self.skip(format!("rewrite at pc 0x{pc:x} not applied"));
                None
            }
        }
    }

    /// Applies `patch` to the deployment code, right before the runtime copy.
    pub fn apply_constructor(&mut self, patch: &RenderedPatch) -> Option<PatchRecord> {
        let constructor = self.constructor.as_mut()?;
        let anchor = constructor.codecopy.anchor;
        match apply_patch(&mut constructor.cfg, patch, anchor) {
            Application::Applied { inserted } => Some(record(patch, &inserted)),
            Application::NotApplied => {
                self.skip(format!("constructor rewrite at pc 0x{anchor:x} not applied"));
                None
            }
        }
    }

    /// Renders the records of `kind` and applies them to the runtime at `pc`.
    pub fn apply_template(
        &mut self,
        kind: TemplateKind,
        params: &TemplateParams,
        bug_type: String,
        pc: usize,
    ) -> Result<Option<PatchEntry>, PatchError> {
        let mut entry = PatchEntry {
            bug_type,
            pc,
            patch: Vec::new(),
        };
        for patch in self.render(kind, params)? {
            if let Some(record) = self.apply_runtime(&patch, pc) {
                entry.patch.push(record);
            }
        }
        Ok((!entry.patch.is_empty()).then_some(entry))
    }
}

fn record(patch: &RenderedPatch, inserted: &[Instruction]) -> PatchRecord {
    PatchRecord {
        delete: asm(&patch.delete),
        insert: asm(inserted),
        insert_mode: patch.insert_mode,
        constructor: patch.constructor,
    }
}

/// Smallest value among the `PUSH` constants the operands of `ins` depend on, ignoring the
/// `PUSH` at pc 0 (the free memory pointer setup).
pub(crate) fn lowest_constant(runner: &salve_analysis::TaintRunner, ins: &Instruction) -> Option<salve_core::U256> {
    runner
        .check_taint(ins)
        .iter()
        .flat_map(|operand| operand.tags())
        .filter(|tag| tag.original_pc().is_some_and(|pc| pc != 0))
        .filter_map(Instruction::push_value)
        .min()
}

/// Whether `ins` is a `PUSH0`..`PUSH32`.
pub(crate) const fn is_push(ins: &Instruction) -> bool {
    matches!(ins.opcode, Opcode::PUSH0 | Opcode::PUSH(_))
}
