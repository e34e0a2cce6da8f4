//! Program builder (§4.2, component B): assembles a program from lifted
//! per-instruction IR fragments arriving in arbitrary address order.

use decompiler_types::Address;

use crate::block::{BasicBlock, BlockId};
use crate::jump::JumpTarget;
use crate::program::Program;
use crate::statement::{Statement, StatementKind};
use crate::term::Term;

/// One instruction's lifted IR plus its addressing, as handed to the builder
/// by the orchestrator after the external decoder + instruction analyzer run
/// (§6 "instruction analyzer").
pub struct LiftedInstruction {
    pub address: Address,
    pub end_address: Address,
    pub statements: Vec<Statement>,
}

/// Returns the block `instr`'s statements should be appended to, creating
/// one if needed, and refreshes its `successor_address` (§4.2).
pub fn get_block_for_instruction(program: &mut Program, instr: &LiftedInstruction) -> BlockId {
    let id = if let Some(id) = program.lookup_start(instr.address) {
        id
    } else if let Some(id) = program.lookup_covering(instr.address.wrapping_sub(1)) {
        id
    } else {
        program.add_block(BasicBlock::new(Some(instr.address)))
    };

    program.block_mut(id).set_successor_address(Some(instr.end_address));
    program.reindex(id);
    id
}

/// Returns the block starting exactly at `address`, splitting an existing
/// block if `address` lies strictly inside it (§4.2).
pub fn create_block(program: &mut Program, address: Address) -> BlockId {
    if let Some(id) = program.lookup_start(address) {
        return id;
    }

    let Some(covering) = program.lookup_covering(address) else {
        return program.add_block(BasicBlock::new(Some(address)));
    };

    let split_index = program
        .block(covering)
        .statements()
        .iter()
        .position(|s| s.instruction().is_some_and(|addr| addr >= address))
        .unwrap_or(program.block(covering).statements().len());

    let suffix = program.block_mut(covering).split_at(split_index);
    program.reindex(covering);

    let mut suffix = suffix;
    suffix.set_entry_address(Some(address));
    program.add_block(suffix)
}

/// Appends a lifted instruction's statements to its block, splitting on
/// overlap with any already-assembled instruction boundary is the
/// responsibility of the orchestrator calling `create_block` first for known
/// call targets (§4.2 edge case).
pub fn assemble_instruction(program: &mut Program, instr: LiftedInstruction) -> BlockId {
    let id = get_block_for_instruction(program, &instr);
    let block = program.block_mut(id);
    for statement in instr.statements {
        let statement = match statement.instruction() {
            Some(_) => statement,
            None => Statement::from_instruction(statement.kind, instr.address),
        };
        // A block-terminating statement (jump/halt) ends assembly for this
        // block; pushing past it would be a lifter bug, not a builder one,
        // so we propagate by simply stopping here.
        if block.push_back(statement).is_err() {
            break;
        }
    }
    id
}

/// Resolves every still-address-typed jump target (and jump-table cell)
/// against the block start-address index, once the full instruction stream
/// has been assembled and every block is in its final position (§3:
/// "[a jump table entry's block is] absent until [this]"). A target whose
/// address term isn't a statically known constant, or doesn't land exactly
/// on a block start, is left unresolved — an indirect jump, a jump-table
/// cell computed at runtime, or a target outside the assembled program.
pub fn resolve_jump_targets(program: &mut Program) {
    let starts: std::collections::HashMap<Address, BlockId> = program
        .block_ids()
        .filter_map(|id| program.block(id).entry_address().map(|addr| (addr, id)))
        .collect();

    for id in program.block_ids().collect::<Vec<_>>() {
        let block = program.block_mut(id);
        for statement in block.statements_mut() {
            let StatementKind::Jump(kind) = &mut statement.kind else { continue };
            for target in kind.targets_mut() {
                resolve_target(target, &starts);
            }
        }
    }
}

fn resolve_target(target: &mut JumpTarget, starts: &std::collections::HashMap<Address, BlockId>) {
    match target {
        JumpTarget::Address(term) => {
            if let Term::Constant { value, .. } = term.as_ref() {
                if let Some(&id) = starts.get(&(*value as Address)) {
                    *target = JumpTarget::Block(id);
                }
            }
        }
        JumpTarget::Table(entries) => {
            for entry in entries {
                if entry.block.is_none() {
                    entry.block = starts.get(&entry.address).copied();
                }
            }
        }
        JumpTarget::Block(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::StatementKind;

    #[test]
    fn address_zero_assembles_into_a_new_block() {
        let mut program = Program::new();
        let instr = LiftedInstruction {
            address: 0,
            end_address: 4,
            statements: vec![Statement::new(StatementKind::RememberReachingDefinitions)],
        };
        let id = assemble_instruction(&mut program, instr);
        assert_eq!(program.block(id).entry_address(), Some(0));
        assert_eq!(program.block(id).successor_address(), Some(4));
    }

    #[test]
    fn second_instruction_extends_the_same_block() {
        let mut program = Program::new();
        assemble_instruction(
            &mut program,
            LiftedInstruction {
                address: 0,
                end_address: 4,
                statements: vec![Statement::new(StatementKind::RememberReachingDefinitions)],
            },
        );
        let id = assemble_instruction(
            &mut program,
            LiftedInstruction {
                address: 4,
                end_address: 8,
                statements: vec![Statement::new(StatementKind::RememberReachingDefinitions)],
            },
        );
        assert_eq!(program.block(id).entry_address(), Some(0));
        assert_eq!(program.block(id).successor_address(), Some(8));
        assert_eq!(program.block(id).statements().len(), 2);
    }

    #[test]
    fn create_block_splits_existing_block_at_call_target() {
        let mut program = Program::new();
        assemble_instruction(
            &mut program,
            LiftedInstruction {
                address: 0,
                end_address: 4,
                statements: vec![Statement::new(StatementKind::RememberReachingDefinitions)],
            },
        );
        assemble_instruction(
            &mut program,
            LiftedInstruction {
                address: 4,
                end_address: 8,
                statements: vec![Statement::from_instruction(StatementKind::RememberReachingDefinitions, 4)],
            },
        );

        let suffix_id = create_block(&mut program, 4);
        assert_eq!(program.block(suffix_id).entry_address(), Some(4));
        assert_eq!(program.lookup_start(4), Some(suffix_id));
    }

    #[test]
    fn resolve_jump_targets_rewrites_a_constant_address_to_its_block() {
        use crate::jump::{JumpKind, JumpTarget};
        use crate::term::Term;

        let mut program = Program::new();
        assemble_instruction(
            &mut program,
            LiftedInstruction {
                address: 0,
                end_address: 4,
                statements: vec![Statement::new(StatementKind::Jump(JumpKind::Unconditional(JumpTarget::Address(Box::new(
                    Term::constant(0x100, 64),
                )))))],
            },
        );
        assemble_instruction(
            &mut program,
            LiftedInstruction {
                address: 0x100,
                end_address: 0x104,
                statements: vec![Statement::new(StatementKind::Halt)],
            },
        );

        resolve_jump_targets(&mut program);

        let target_block = program.lookup_start(0x100).unwrap();
        let StatementKind::Jump(JumpKind::Unconditional(target)) = &program.block(BlockId(0)).statements()[0].kind else {
            panic!("expected the jump statement to survive resolution")
        };
        assert_eq!(target.block(), Some(target_block));
    }

    #[test]
    fn resolve_jump_targets_leaves_an_unknown_address_unresolved() {
        use crate::jump::{JumpKind, JumpTarget};
        use crate::term::Term;

        let mut program = Program::new();
        assemble_instruction(
            &mut program,
            LiftedInstruction {
                address: 0,
                end_address: 4,
                statements: vec![Statement::new(StatementKind::Jump(JumpKind::Unconditional(JumpTarget::Address(Box::new(
                    Term::constant(0xdead, 64),
                )))))],
            },
        );

        resolve_jump_targets(&mut program);

        let StatementKind::Jump(JumpKind::Unconditional(target)) = &program.block(BlockId(0)).statements()[0].kind else {
            panic!("expected the jump statement to survive resolution")
        };
        assert!(matches!(target, JumpTarget::Address(_)));
    }
}
