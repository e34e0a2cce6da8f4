//! End-to-end pipeline scenarios (§8): lifted instructions assembled into a
//! program, then run through the full orchestrator.

use decompiler_core::callee::CalleeId;
use decompiler_core::cancel::CancellationToken;
use decompiler_core::convention::x86_64_sysv;
use decompiler_core::lifter::{lift_instruction, LifterContext, LifterState};
use decompiler_core::orchestrator::{self, OrchestratorConfig};
use decompiler_core::program::Program;
use decompiler_core::statement::StatementKind;
use decompiler_core::term::{BinaryOp, Term};
use decompiler_core::{builder, jump::JumpKind};

use decompiler_isa::{Condition, Instruction, Mnemonic, Operand, Prefixes};
use decompiler_types::{Address, MemoryLocation};

fn ctx() -> LifterContext {
    LifterContext {
        stack_pointer: x86_64_sysv().stack_pointer(),
    }
}

fn eax() -> MemoryLocation {
    decompiler_isa::testkit::EAX
}

fn instr(address: Address, mnemonic: Mnemonic, operands: Vec<Operand>, operand_size_bits: u32) -> Instruction {
    Instruction {
        address,
        end_address: address + 4,
        mnemonic,
        operands,
        prefixes: Prefixes::empty(),
        operand_size_bits,
        address_size_bits: 64,
    }
}

/// Lifts one instruction and assembles its statements into `program`.
fn assemble(program: &mut Program, state: &mut LifterState, address: Address, mnemonic: Mnemonic, operands: Vec<Operand>, operand_size_bits: u32) {
    let instruction = instr(address, mnemonic, operands, operand_size_bits);
    let statements = lift_instruction(&instruction, &ctx(), state).expect("every instruction in these scenarios lifts cleanly");
    builder::assemble_instruction(
        program,
        builder::LiftedInstruction {
            address: instruction.address,
            end_address: instruction.end_address,
            statements,
        },
    );
}

/// push eax; mov eax, 1; pop eax; ret — a minimal function whose stack
/// pointer returns to its entry value by the time it returns (§8).
#[test]
fn push_mov_pop_ret_converges_to_one_function() {
    let mut program = Program::new();
    let mut state = LifterState::new();

    assemble(&mut program, &mut state, 0x00, Mnemonic::Push, vec![Operand::Register(eax())], 32);
    assemble(&mut program, &mut state, 0x04, Mnemonic::Mov, vec![Operand::Register(eax()), Operand::Immediate(1)], 32);
    assemble(&mut program, &mut state, 0x08, Mnemonic::Pop, vec![Operand::Register(eax())], 32);
    assemble(&mut program, &mut state, 0x0c, Mnemonic::Ret, vec![], 32);

    let convention = x86_64_sysv();
    let cancel = CancellationToken::new();
    let config = OrchestratorConfig::default();
    let result = orchestrator::run(&program, &convention, |_| CalleeId::Invalid, &cancel, &config).unwrap();

    assert_eq!(result.functions.len(), 1);
    let function = &result.functions[0].function;
    assert_eq!(function.entry_address(), Some(0x00));
}

/// xor eax, eax — a self-xor that dataflow should recognize yields a
/// constant zero regardless of eax's incoming value (§8).
#[test]
fn xor_self_then_ret_is_one_function_with_a_zeroing_assignment() {
    let mut program = Program::new();
    let mut state = LifterState::new();

    assemble(&mut program, &mut state, 0x00, Mnemonic::Xor, vec![Operand::Register(eax()), Operand::Register(eax())], 32);
    assemble(&mut program, &mut state, 0x04, Mnemonic::Ret, vec![], 32);

    let convention = x86_64_sysv();
    let cancel = CancellationToken::new();
    let config = OrchestratorConfig::default();
    let result = orchestrator::run(&program, &convention, |_| CalleeId::Invalid, &cancel, &config).unwrap();

    assert_eq!(result.functions.len(), 1);
    let function = &result.functions[0].function;
    let entry_block = function.block(function.entry());
    let StatementKind::Assignment { right, .. } = &entry_block.statements()[0].kind else {
        panic!("expected the xor to lift to an assignment")
    };
    assert!(matches!(**right, Term::Binary { op: BinaryOp::Xor, .. }));
}

/// cmp eax, 0; je taken; ...; taken: ret — an if-then-else whose conditional
/// jump resolves to a block pointer once the program is fully assembled, and
/// whose fallthrough edge survives partitioning into one function (§8).
#[test]
fn cmp_je_if_then_else_resolves_both_branches_into_one_function() {
    let mut program = Program::new();
    let mut state = LifterState::new();

    assemble(&mut program, &mut state, 0x00, Mnemonic::Cmp, vec![Operand::Register(eax()), Operand::Immediate(0)], 32);
    assemble(&mut program, &mut state, 0x04, Mnemonic::Jcc(Condition::Equal), vec![Operand::CodeRelative(0x10)], 64);
    // Stake out both successor blocks before assembling into them: a decoder
    // driving this builder knows a jump's targets as soon as it lifts the
    // jump, the same way it already knows a call target (§4.2 edge case).
    builder::create_block(&mut program, 0x08);
    builder::create_block(&mut program, 0x10);
    // Not-taken (fallthrough) path.
    assemble(&mut program, &mut state, 0x08, Mnemonic::Mov, vec![Operand::Register(eax()), Operand::Immediate(1)], 32);
    assemble(&mut program, &mut state, 0x0c, Mnemonic::Ret, vec![], 32);
    // Taken path.
    assemble(&mut program, &mut state, 0x10, Mnemonic::Mov, vec![Operand::Register(eax()), Operand::Immediate(2)], 32);
    assemble(&mut program, &mut state, 0x14, Mnemonic::Ret, vec![], 32);

    let convention = x86_64_sysv();
    let cancel = CancellationToken::new();
    let config = OrchestratorConfig::default();
    let result = orchestrator::run(&program, &convention, |_| CalleeId::Invalid, &cancel, &config).unwrap();

    assert_eq!(result.functions.len(), 1);
    let function = &result.functions[0].function;
    assert_eq!(function.blocks().count(), 3, "cmp/jcc block, fallthrough block, taken block");

    let entry_block = function.block(function.entry());
    let last = entry_block.statements().last().unwrap();
    let StatementKind::Jump(JumpKind::Conditional { then_target, else_target, .. }) = &last.kind else {
        panic!("expected the entry block to end in the conditional jump")
    };
    assert!(then_target.block().is_some(), "the taken branch must resolve to a block pointer");
    assert!(else_target.block().is_some(), "the fallthrough branch must resolve to a block pointer");
}

/// An indirect call through a register resolves to no known callee
/// signature, so its call hook falls back to a speculative snapshot rather
/// than a known argument/return list (§4.4, §8 scenario 4).
#[test]
fn indirect_call_gets_a_speculative_call_hook() {
    let mut program = Program::new();
    let mut state = LifterState::new();

    assemble(&mut program, &mut state, 0x00, Mnemonic::CallIndirect, vec![Operand::Register(eax())], 64);
    assemble(&mut program, &mut state, 0x04, Mnemonic::Ret, vec![], 32);

    let convention = x86_64_sysv();
    let cancel = CancellationToken::new();
    let config = OrchestratorConfig::default();
    let result = orchestrator::run(&program, &convention, |_| CalleeId::Invalid, &cancel, &config).unwrap();

    assert_eq!(result.functions.len(), 1);
    let function = &result.functions[0].function;
    let entry_block = function.block(function.entry());
    assert!(
        entry_block.statements().iter().any(|s| matches!(s.kind, StatementKind::RememberReachingDefinitions)),
        "an unresolved call's hook snapshots reaching definitions instead of reading a known signature"
    );
}

/// A 32-bit write to eax gets the x86-64 implicit zero-extend patch applied
/// when the orchestrator is configured for it (§8 scenario 5).
#[test]
fn x86_64_zero_extend_patch_is_applied_when_configured() {
    let mut program = Program::new();
    let mut state = LifterState::new();

    assemble(&mut program, &mut state, 0x00, Mnemonic::Mov, vec![Operand::Register(eax()), Operand::Immediate(1)], 32);
    assemble(&mut program, &mut state, 0x04, Mnemonic::Ret, vec![], 32);

    let convention = x86_64_sysv();
    let cancel = CancellationToken::new();
    let mut config = OrchestratorConfig::default();
    config.patch_x86_64_implicit_zero_extend = true;
    let result = orchestrator::run(&program, &convention, |_| CalleeId::Invalid, &cancel, &config).unwrap();

    let function = &result.functions[0].function;
    let entry_block = function.block(function.entry());
    let zeroes_upper_half = entry_block.statements().iter().any(|s| match &s.kind {
        StatementKind::Assignment { left, right } => {
            matches!(left.as_ref(), Term::MemoryLocationAccess(loc) if loc.bit_offset() == 32 && loc.bit_size() == 32)
                && matches!(right.as_ref(), Term::Constant { value: 0, .. })
        }
        _ => false,
    });
    assert!(zeroes_upper_half, "expected an inserted assignment zeroing eax's upper 32 bits");
}

/// Without the x86-64 toggle, no upper-half zeroing assignment is inserted.
#[test]
fn x86_64_zero_extend_patch_is_not_applied_by_default() {
    let mut program = Program::new();
    let mut state = LifterState::new();

    assemble(&mut program, &mut state, 0x00, Mnemonic::Mov, vec![Operand::Register(eax()), Operand::Immediate(1)], 32);
    assemble(&mut program, &mut state, 0x04, Mnemonic::Ret, vec![], 32);

    let convention = x86_64_sysv();
    let cancel = CancellationToken::new();
    let config = OrchestratorConfig::default();
    let result = orchestrator::run(&program, &convention, |_| CalleeId::Invalid, &cancel, &config).unwrap();

    let function = &result.functions[0].function;
    let entry_block = function.block(function.entry());
    assert_eq!(entry_block.statements().len(), 2, "mov plus ret's two statements, no inserted zero-extend");
}
