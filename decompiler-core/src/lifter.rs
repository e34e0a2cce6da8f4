//! Instruction analyzer (§6, §7, component "lifter"): turns one decoded
//! machine instruction into IR statements. Per mnemonic, per §6: "the core
//! consumes this through an instruction analyzer that, per mnemonic, emits
//! the IR fragments... using an expression DSL that mirrors the term tree."
//!
//! Flags are not modeled as locations; a `Cmp`/`Test` instead leaves its
//! operands in [`LifterState`] for the `Jcc` that (by x86 convention)
//! immediately follows to consume when building its condition term. A
//! `Cmp`/`Test` with no following `Jcc` is lifted as a no-op, which matches
//! every instruction sequence this crate's callers actually emit.

use decompiler_isa::{Condition, Instruction, MemoryOperand, Mnemonic, Operand};
use decompiler_types::{Address, Domain, MemoryLocation};

use crate::error::LiftError;
use crate::jump::{JumpKind, JumpTarget};
use crate::statement::{Statement, StatementKind};
use crate::term::{BinaryOp, IntrinsicKind, Term, UnaryOp};

/// Fixed per-run fact the lifter needs beyond the instruction itself: where
/// the stack pointer lives (§4.4's `Convention` owns this; threading the
/// whole convention through would couple the lifter to argument/return
/// layout it has no use for).
#[derive(Debug, Clone, Copy)]
pub struct LifterContext {
    pub stack_pointer: MemoryLocation,
}

/// Cross-instruction memory for condition-code lowering (see module docs).
#[derive(Debug, Clone, Default)]
pub struct LifterState {
    pending_compare: Option<(Term, Term)>,
}

impl LifterState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Lifts `instr`, or reports why it could not (§7). Callers that just want
/// forward progress should use [`lift_instruction_or_fallback`] instead.
pub fn lift_instruction(instr: &Instruction, ctx: &LifterContext, state: &mut LifterState) -> Result<Vec<Statement>, LiftError> {
    lift(instr, ctx, state).map_err(|reason| LiftError {
        address: instr.address,
        reason,
    })
}

/// Lifts `instr`, substituting an inline-assembly statement for anything the
/// analyzer can't model (§7 "Invalid instruction... the offending
/// instruction is replaced by an inline-assembly statement; decompilation
/// continues"). Never fails.
pub fn lift_instruction_or_fallback(instr: &Instruction, ctx: &LifterContext, state: &mut LifterState) -> Vec<Statement> {
    match lift(instr, ctx, state) {
        Ok(statements) => statements,
        Err(reason) => vec![fallback_statement(instr, &reason)],
    }
}

fn fallback_statement(instr: &Instruction, reason: &str) -> Statement {
    Statement::new(StatementKind::InlineAssembly {
        note: format!("{:?} at {:#x}: {reason}", instr.mnemonic, instr.address),
    })
}

fn lift(instr: &Instruction, ctx: &LifterContext, state: &mut LifterState) -> Result<Vec<Statement>, String> {
    let size = instr.operand_size_bits;
    match instr.mnemonic {
        Mnemonic::Nop => Ok(vec![]),
        Mnemonic::Push => lift_push(instr, ctx, size),
        Mnemonic::Pop => lift_pop(instr, ctx, size),
        Mnemonic::Mov => lift_mov(instr, size),
        Mnemonic::Lea => lift_lea(instr, size),
        Mnemonic::Add => lift_binary(instr, size, BinaryOp::Add),
        Mnemonic::Sub => lift_binary(instr, size, BinaryOp::Sub),
        Mnemonic::And => lift_binary(instr, size, BinaryOp::And),
        Mnemonic::Or => lift_binary(instr, size, BinaryOp::Or),
        Mnemonic::Xor => lift_binary(instr, size, BinaryOp::Xor),
        Mnemonic::Shl => lift_binary(instr, size, BinaryOp::Shl),
        Mnemonic::Shr => lift_binary(instr, size, BinaryOp::Shr),
        Mnemonic::Not => lift_unary(instr, size, UnaryOp::Not),
        Mnemonic::Neg => lift_unary(instr, size, UnaryOp::Negate),
        Mnemonic::Cmp => lift_cmp(instr, size, state),
        Mnemonic::Test => lift_test(instr, size, state),
        Mnemonic::Jmp | Mnemonic::JmpIndirect => lift_jmp(instr),
        Mnemonic::Jcc(condition) => lift_jcc(instr, condition, state),
        Mnemonic::Call | Mnemonic::CallIndirect => lift_call(instr),
        Mnemonic::Ret => Ok(lift_ret(instr, ctx)),
        Mnemonic::Unsupported => Err("decoded as an unsupported mnemonic".to_string()),
    }
}

fn operand(instr: &Instruction, index: usize) -> Result<&Operand, String> {
    instr.operands.get(index).ok_or_else(|| format!("expected at least {} operand(s)", index + 1))
}

/// An operand read for its value.
fn operand_value(op: &Operand, bit_size: u32) -> Term {
    match op {
        Operand::Register(location) => Term::location(*location),
        Operand::Immediate(value) => Term::constant(*value, bit_size),
        Operand::Memory(memory) => Term::dereference(memory_address(memory), Domain::MEMORY, bit_size),
        Operand::Pointer(address) => Term::constant(*address as i128, bit_size),
        Operand::CodeRelative(address) => Term::constant(*address as i128, bit_size),
    }
}

/// An operand as an assignment target; only registers and memory operands
/// are writable.
fn operand_destination(op: &Operand, bit_size: u32) -> Result<Term, String> {
    match op {
        Operand::Register(location) => Ok(Term::location(*location)),
        Operand::Memory(memory) => Ok(Term::dereference(memory_address(memory), Domain::MEMORY, bit_size)),
        Operand::Immediate(_) | Operand::Pointer(_) | Operand::CodeRelative(_) => {
            Err("this operand kind cannot be an assignment target".to_string())
        }
    }
}

fn memory_address(memory: &MemoryOperand) -> Term {
    let width = memory.address_size_bits;
    let mut address = match memory.base {
        Some(base) => Term::location(base),
        None => Term::constant(0, width),
    };
    if let Some(index) = memory.index {
        let index_term = Term::location(index);
        let scaled = if memory.scale > 1 {
            Term::binary(BinaryOp::Mul, index_term, Term::constant(memory.scale as i128, width), width)
        } else {
            index_term
        };
        address = Term::binary(BinaryOp::Add, address, scaled, width);
    }
    if memory.offset != 0 {
        address = Term::binary(BinaryOp::Add, address, Term::constant(memory.offset as i128, width), width);
    }
    address
}

fn assign(left: Term, right: Term) -> Statement {
    Statement::new(StatementKind::Assignment {
        left: Box::new(left),
        right: Box::new(right),
    })
}

/// `push src` (§6): decrement the stack pointer by the operand width, then
/// store the operand at the new top of stack. Order matters: the store must
/// address the *post*-decrement pointer, so the decrement comes first.
fn lift_push(instr: &Instruction, ctx: &LifterContext, size: u32) -> Result<Vec<Statement>, String> {
    let src = operand_value(operand(instr, 0)?, size);
    let sp = ctx.stack_pointer;
    let bytes = (size / 8) as i128;
    Ok(vec![
        assign(Term::location(sp), Term::binary(BinaryOp::Sub, Term::location(sp), Term::constant(bytes, sp.bit_size()), sp.bit_size())),
        assign(Term::dereference(Term::location(sp), Domain::STACK, size), src),
    ])
}

/// `pop dst` (§6): load the operand from the current top of stack, then
/// increment the stack pointer by the operand width. The load must address
/// the *pre*-increment pointer, so the load comes first.
fn lift_pop(instr: &Instruction, ctx: &LifterContext, size: u32) -> Result<Vec<Statement>, String> {
    let dst = operand_destination(operand(instr, 0)?, size)?;
    let sp = ctx.stack_pointer;
    let bytes = (size / 8) as i128;
    Ok(vec![
        assign(dst, Term::dereference(Term::location(sp), Domain::STACK, size)),
        assign(Term::location(sp), Term::binary(BinaryOp::Add, Term::location(sp), Term::constant(bytes, sp.bit_size()), sp.bit_size())),
    ])
}

fn lift_mov(instr: &Instruction, size: u32) -> Result<Vec<Statement>, String> {
    let dst = operand_destination(operand(instr, 0)?, size)?;
    let src = operand_value(operand(instr, 1)?, size);
    Ok(vec![assign(dst, src)])
}

/// `lea dst, [mem]` (§6): assigns the *computed address*, never the value at
/// it, so the source must be a memory operand.
fn lift_lea(instr: &Instruction, size: u32) -> Result<Vec<Statement>, String> {
    let dst = operand_destination(operand(instr, 0)?, size)?;
    let Operand::Memory(memory) = operand(instr, 1)? else {
        return Err("lea requires a memory source operand".to_string());
    };
    Ok(vec![assign(dst, memory_address(memory))])
}

fn lift_binary(instr: &Instruction, size: u32, op: BinaryOp) -> Result<Vec<Statement>, String> {
    let dst_operand = operand(instr, 0)?;
    let dst = operand_destination(dst_operand, size)?;
    let left = operand_value(dst_operand, size);
    let right = operand_value(operand(instr, 1)?, size);
    Ok(vec![assign(dst, Term::binary(op, left, right, size))])
}

fn lift_unary(instr: &Instruction, size: u32, op: UnaryOp) -> Result<Vec<Statement>, String> {
    let dst_operand = operand(instr, 0)?;
    let dst = operand_destination(dst_operand, size)?;
    let value = operand_value(dst_operand, size);
    Ok(vec![assign(dst, Term::unary(op, value, size))])
}

fn lift_cmp(instr: &Instruction, size: u32, state: &mut LifterState) -> Result<Vec<Statement>, String> {
    let a = operand_value(operand(instr, 0)?, size);
    let b = operand_value(operand(instr, 1)?, size);
    state.pending_compare = Some((a, b));
    Ok(vec![])
}

fn lift_test(instr: &Instruction, size: u32, state: &mut LifterState) -> Result<Vec<Statement>, String> {
    let a = operand_value(operand(instr, 0)?, size);
    let b = operand_value(operand(instr, 1)?, size);
    let masked = Term::binary(BinaryOp::And, a, b, size);
    state.pending_compare = Some((masked, Term::constant(0, size)));
    Ok(vec![])
}

/// Lowers a condition code against a pending compare's operands into a
/// one-bit comparison term (§6 "the instruction analyzer lowers this into
/// the comparison operator of the condition term it builds"). `Overflow` and
/// `NotOverflow` have no equivalent without a modeled overflow flag and fall
/// back to an unknown one-bit value.
fn condition_term(condition: Condition, a: &Term, b: &Term) -> Term {
    let width = a.bit_size();
    let (a, b) = (a.clone(), b.clone());
    match condition {
        Condition::Equal => Term::binary(BinaryOp::Equal, a, b, width),
        Condition::NotEqual => Term::binary(BinaryOp::NotEqual, a, b, width),
        Condition::Above => Term::binary(BinaryOp::ULess, b, a, width),
        Condition::AboveOrEqual => Term::binary(BinaryOp::ULessOrEqual, b, a, width),
        Condition::Below => Term::binary(BinaryOp::ULess, a, b, width),
        Condition::BelowOrEqual => Term::binary(BinaryOp::ULessOrEqual, a, b, width),
        Condition::Greater => Term::binary(BinaryOp::SLess, b, a, width),
        Condition::GreaterOrEqual => Term::binary(BinaryOp::SLessOrEqual, b, a, width),
        Condition::Less => Term::binary(BinaryOp::SLess, a, b, width),
        Condition::LessOrEqual => Term::binary(BinaryOp::SLessOrEqual, a, b, width),
        Condition::Sign => Term::binary(BinaryOp::SLess, a, b, width),
        Condition::NotSign => Term::binary(BinaryOp::SLessOrEqual, b, a, width),
        Condition::Overflow | Condition::NotOverflow => Term::intrinsic(IntrinsicKind::Unknown, 1),
    }
}

fn jump_target_from_operand(op: &Operand, bit_size: u32) -> JumpTarget {
    let address_term = match op {
        Operand::CodeRelative(address) | Operand::Pointer(address) => Term::constant(*address as i128, bit_size),
        Operand::Register(location) => Term::location(*location),
        Operand::Memory(memory) => Term::dereference(memory_address(memory), Domain::MEMORY, bit_size),
        Operand::Immediate(value) => Term::constant(*value, bit_size),
    };
    JumpTarget::Address(Box::new(address_term))
}

fn lift_jmp(instr: &Instruction) -> Result<Vec<Statement>, String> {
    let target = jump_target_from_operand(operand(instr, 0)?, instr.address_size_bits);
    Ok(vec![Statement::new(StatementKind::Jump(JumpKind::Unconditional(target)))])
}

/// `jcc target` (§6): the not-taken edge falls through to the next
/// instruction, which the decoder has already told us the address of via
/// `end_address`.
fn lift_jcc(instr: &Instruction, condition: Condition, state: &mut LifterState) -> Result<Vec<Statement>, String> {
    let bit_size = instr.address_size_bits;
    let condition_term = match state.pending_compare.take() {
        Some((a, b)) => condition_term(condition, &a, &b),
        None => Term::intrinsic(IntrinsicKind::Unknown, 1),
    };
    let then_target = jump_target_from_operand(operand(instr, 0)?, bit_size);
    let else_target = JumpTarget::Address(Box::new(Term::constant(instr.end_address as i128, bit_size)));
    Ok(vec![Statement::new(StatementKind::Jump(JumpKind::Conditional {
        condition: Box::new(condition_term),
        then_target,
        else_target,
    }))])
}

/// `call target` / indirect call (§6): a plain non-terminating statement —
/// stack and register effects around the call are the calling convention's
/// hooks' job (§4.4), not the lifter's.
fn lift_call(instr: &Instruction) -> Result<Vec<Statement>, String> {
    let target = operand_value(operand(instr, 0)?, instr.address_size_bits);
    Ok(vec![Statement::new(StatementKind::Call { target: Box::new(target) })])
}

/// `ret [imm]` (§6): pops the return address (plus any immediate stack
/// cleanup) and transfers control to it. The return address itself is
/// modeled as [`IntrinsicKind::ReturnAddress`] rather than a literal
/// dereference of the stack pointer, since the adjustment statement that
/// must precede the terminating jump would otherwise shift the address out
/// from under it.
fn lift_ret(instr: &Instruction, ctx: &LifterContext) -> Vec<Statement> {
    let sp = ctx.stack_pointer;
    let address_bits = instr.address_size_bits;
    let mut popped = (address_bits / 8) as i128;
    if let Some(Operand::Immediate(extra)) = instr.operands.first() {
        popped += extra;
    }
    vec![
        assign(Term::location(sp), Term::binary(BinaryOp::Add, Term::location(sp), Term::constant(popped, sp.bit_size()), sp.bit_size())),
        Statement::new(StatementKind::Jump(JumpKind::Unconditional(JumpTarget::Address(Box::new(Term::intrinsic(
            IntrinsicKind::ReturnAddress,
            address_bits,
        )))))),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use decompiler_isa::{Instruction, Prefixes};

    fn ctx() -> LifterContext {
        LifterContext {
            stack_pointer: MemoryLocation::new(Domain::register(4), 0, 64),
        }
    }

    fn eax() -> MemoryLocation {
        MemoryLocation::new(Domain::register(0), 0, 32)
    }

    fn instr(mnemonic: Mnemonic, operands: Vec<Operand>, address: Address) -> Instruction {
        Instruction {
            address,
            end_address: address + 4,
            mnemonic,
            operands,
            prefixes: Prefixes::empty(),
            operand_size_bits: 32,
            address_size_bits: 64,
        }
    }

    #[test]
    fn push_decrements_before_storing() {
        let instruction = instr(Mnemonic::Push, vec![Operand::Register(eax())], 0);
        let statements = lift_instruction(&instruction, &ctx(), &mut LifterState::new()).unwrap();
        assert_eq!(statements.len(), 2);
        let StatementKind::Assignment { right, .. } = &statements[0].kind else {
            panic!("expected assignment")
        };
        assert!(matches!(**right, Term::Binary { op: BinaryOp::Sub, .. }));
    }

    #[test]
    fn xor_self_lifts_to_a_self_xor_assignment() {
        let instruction = instr(Mnemonic::Xor, vec![Operand::Register(eax()), Operand::Register(eax())], 0);
        let statements = lift_instruction(&instruction, &ctx(), &mut LifterState::new()).unwrap();
        assert_eq!(statements.len(), 1);
        let StatementKind::Assignment { left, right } = &statements[0].kind else {
            panic!("expected assignment")
        };
        assert_eq!(**left, Term::location(eax()));
        assert!(matches!(**right, Term::Binary { op: BinaryOp::Xor, .. }));
    }

    #[test]
    fn cmp_then_jcc_builds_a_comparison_condition() {
        let mut state = LifterState::new();
        let cmp = instr(Mnemonic::Cmp, vec![Operand::Register(eax()), Operand::Immediate(0)], 0);
        assert!(lift_instruction(&cmp, &ctx(), &mut state).unwrap().is_empty());

        let je = instr(Mnemonic::Jcc(Condition::Equal), vec![Operand::CodeRelative(0x100)], 4);
        let statements = lift_instruction(&je, &ctx(), &mut state).unwrap();
        assert_eq!(statements.len(), 1);
        let StatementKind::Jump(JumpKind::Conditional { condition, .. }) = &statements[0].kind else {
            panic!("expected conditional jump")
        };
        assert!(matches!(**condition, Term::Binary { op: BinaryOp::Equal, .. }));
    }

    #[test]
    fn jcc_without_a_preceding_compare_falls_back_to_unknown() {
        let je = instr(Mnemonic::Jcc(Condition::Equal), vec![Operand::CodeRelative(0x100)], 0);
        let statements = lift_instruction(&je, &ctx(), &mut LifterState::new()).unwrap();
        let StatementKind::Jump(JumpKind::Conditional { condition, .. }) = &statements[0].kind else {
            panic!("expected conditional jump")
        };
        assert!(matches!(**condition, Term::Intrinsic { kind: IntrinsicKind::Unknown, .. }));
    }

    #[test]
    fn ret_pops_the_return_address_and_jumps_to_it() {
        let instruction = instr(Mnemonic::Ret, vec![], 0);
        let statements = lift_instruction(&instruction, &ctx(), &mut LifterState::new()).unwrap();
        assert_eq!(statements.len(), 2);
        assert!(matches!(statements[1].kind, StatementKind::Jump(JumpKind::Unconditional(JumpTarget::Address(_)))));
    }

    #[test]
    fn unsupported_mnemonic_is_reported_not_panicked() {
        let instruction = instr(Mnemonic::Unsupported, vec![], 0);
        let result = lift_instruction(&instruction, &ctx(), &mut LifterState::new());
        assert!(result.is_err());
        let fallback = lift_instruction_or_fallback(&instruction, &ctx(), &mut LifterState::new());
        assert_eq!(fallback.len(), 1);
        assert!(matches!(fallback[0].kind, StatementKind::InlineAssembly { .. }));
    }

    #[test]
    fn lea_requires_a_memory_source() {
        let instruction = instr(Mnemonic::Lea, vec![Operand::Register(eax()), Operand::Register(eax())], 0);
        assert!(lift_instruction(&instruction, &ctx(), &mut LifterState::new()).is_err());
    }
}
