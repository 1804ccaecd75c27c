use super::{BugHandler, PatchContext};
use crate::report::PatchEntry;
use crate::template::{Param, TemplateKind, TemplateParams};
use salve_analysis::{infer_integer_type, IntegerType};
use salve_core::bug::{Bug, BugType};
use salve_core::decoder::Instruction;
use salve_core::encoder::push;
use salve_core::opcode::Opcode;
use salve_core::U256;
use salve_utils::errors::PatchError;
use tracing::debug;

/// Guards `ADD` and `MUL` with a check against the operands' integer type.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverflowHandler;

impl BugHandler for OverflowHandler {
    fn name(&self) -> &'static str {
        "integer_overflow"
    }

    fn handles(&self, kind: &BugType) -> bool {
        *kind == BugType::Overflow
    }

    fn apply(&self, ctx: &mut PatchContext, bugs: &[Bug]) -> Result<Vec<PatchEntry>, PatchError> {
        let mut entries = Vec::new();
        for bug in bugs {
            let Some(node) = ctx.buggy_block(bug) else {
                continue;
            };
            let Some(opcode) = ctx.runtime.instruction_at(bug.pc).map(|ins| ins.opcode) else {
                ctx.skip(format!("overflow at pc 0x{:x}: no instruction at this pc", bug.pc));
                continue;
            };

            let integer_type = infer_integer_type(&ctx.runtime, bug.pc);
            debug!("Overflow in {opcode} at pc 0x{:x} on {integer_type:?}", bug.pc);
            let params = TemplateParams::new().with(Param::ErrorHandlingSequence, ctx.error_sequence(node));
            let (kind, params) = match (opcode, integer_type) {
                (Opcode::ADD, IntegerType::Unsigned { max }) => (
                    TemplateKind::UnsignedOverflowAddition,
                    params.with(Param::IntegerBounds, vec![push(max)]),
                ),
                (Opcode::ADD, IntegerType::Signed { bits }) => {
                    let int_max = (U256::from(1u8) << (bits as usize - 1)) - U256::from(1u8);
                    (
                        TemplateKind::SignedOverflowAddition,
                        params
                            .with(Param::PushIntMax, vec![push(int_max)])
                            .with(
                                Param::PushIntMin,
                                vec![push(int_max), Instruction::new(Opcode::NOT, None)],
                            ),
                    )
                }
                (Opcode::MUL, IntegerType::Unsigned { max }) if max == U256::MAX => {
                    (TemplateKind::UnsignedOverflowMultiplication256, params)
                }
                (Opcode::MUL, IntegerType::Unsigned { max }) => (
                    TemplateKind::UnsignedOverflowMultiplication,
                    params.with(Param::IntegerBounds, vec![push(max)]),
                ),
                (Opcode::MUL, IntegerType::Signed { bits }) => {
                    ctx.skip(format!(
                        "overflow at pc 0x{:x}: signed {bits}-bit multiplication is not supported",
                        bug.pc
                    ));
                    continue;
                }
                (other, _) => {
                    ctx.skip(format!("overflow at pc 0x{:x}: {other} is not supported", bug.pc));
                    continue;
                }
            };

            if let Some(entry) = ctx.apply_template(kind, &params, bug.kind.report_name(), bug.pc)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

/// Reverts a `SUB` whose result would wrap below zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnderflowHandler;

impl BugHandler for UnderflowHandler {
    fn name(&self) -> &'static str {
        "integer_underflow"
    }

    fn handles(&self, kind: &BugType) -> bool {
        *kind == BugType::Underflow
    }

    fn apply(&self, ctx: &mut PatchContext, bugs: &[Bug]) -> Result<Vec<PatchEntry>, PatchError> {
        let mut entries = Vec::new();
        for bug in bugs {
            let Some(node) = ctx.buggy_block(bug) else {
                continue;
            };
            let params = TemplateParams::new().with(Param::ErrorHandlingSequence, ctx.error_sequence(node));
            if let Some(entry) = ctx.apply_template(
                TemplateKind::IntegerUnderflow,
                &params,
                bug.kind.report_name(),
                bug.pc,
            )? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_utils::{context, runtime_hex};

    #[test]
    fn masked_addition_gets_a_bound_check() {
        // PUSH1 2 PUSH1 0 CALLDATALOAD PUSH1 0xff AND ADD STOP
        let mut ctx = context("600260003560ff160100");
        let entries = OverflowHandler
            .apply(&mut ctx, &[Bug::new(8, BugType::Overflow)])
            .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].bug_type, "integer_overflow");
        assert_eq!(
            entries[0].patch[0].insert,
            "DUP1 PUSH1 0xff SUB DUP3 GT ISZERO PUSH1 0x16 JUMPI PUSH1 0x0 DUP1 REVERT JUMPDEST"
        );
        assert_eq!(
            runtime_hex(&ctx),
            "600260003560ff16 8060ff03821115601657600080fd5b 0100".replace(' ', "")
        );
    }

    #[test]
    fn full_width_multiplication_uses_the_product_check() {
        // PUSH1 0 CALLDATALOAD PUSH1 0x20 CALLDATALOAD MUL STOP
        let mut ctx = context("6000356020350200");
        let entries = OverflowHandler
            .apply(&mut ctx, &[Bug::new(6, BugType::Overflow)])
            .unwrap();
        assert_eq!(
            entries[0].patch[0].insert,
            "DUP1 ISZERO PUSH1 0x1a JUMPI DUP2 DUP2 MUL DUP2 SWAP1 DIV DUP3 EQ PUSH1 0x1a JUMPI \
             PUSH1 0x0 DUP1 REVERT JUMPDEST"
        );
    }

    #[test]
    fn signed_addition_checks_both_bounds() {
        // PUSH1 2 PUSH1 0 CALLDATALOAD PUSH1 0 SIGNEXTEND ADD STOP
        let mut ctx = context("600260003560000b0100");
        let entries = OverflowHandler
            .apply(&mut ctx, &[Bug::new(8, BugType::Overflow)])
            .unwrap();
        let insert = &entries[0].patch[0].insert;
        assert!(insert.starts_with("PUSH1 0x0 DUP3 SGT DUP3 PUSH1 0x7f SUB DUP3 SGT AND"));
        assert!(insert.contains("PUSH1 0x7f NOT DUP5 SWAP1 SUB"));
    }

    #[test]
    fn unsupported_overflows_are_diagnosed() {
        // PUSH1 2 PUSH1 0 CALLDATALOAD PUSH1 0 SIGNEXTEND MUL STOP
        let mut ctx = context("600260003560000b0200");
        let entries = OverflowHandler
            .apply(
                &mut ctx,
                &[Bug::new(8, BugType::Overflow), Bug::new(0, BugType::Overflow)],
            )
            .unwrap();
        assert!(entries.is_empty());
        assert_eq!(ctx.diagnostics.len(), 2);
        assert!(ctx.diagnostics[0].contains("signed 8-bit multiplication"));
        assert_eq!(runtime_hex(&ctx), "600260003560000b0200");
    }

    #[test]
    fn subtraction_is_checked_before_it_runs() {
        // PUSH1 1 PUSH1 0 SUB STOP
        let mut ctx = context("600160000300");
        let entries = UnderflowHandler
            .apply(&mut ctx, &[Bug::new(4, BugType::Underflow)])
            .unwrap();
        assert_eq!(entries[0].bug_type, "integer_underflow");
        assert_eq!(runtime_hex(&ctx), "600160008181101560 0f57600080fd5b0300".replace(' ', ""));
    }
}
