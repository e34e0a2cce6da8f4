//! Function partitioner (§4.3, component C): splits the program graph into
//! functions via reachability and call-target discovery.

use std::collections::{HashMap, HashSet};

use crate::block::BlockId;
use crate::function::Function;
use crate::jump::{JumpKind, JumpTarget};
use crate::program::Program;
use crate::statement::StatementKind;

/// Runs the three-pass partitioner and returns one [`Function`] per emitted
/// entry, in emission order.
pub fn partition(program: &Program) -> Vec<Function> {
    let mut covered: HashSet<BlockId> = HashSet::new();
    let mut functions = Vec::new();

    // Pass 1: every block whose address was observed as a call target.
    let mut called_blocks: Vec<BlockId> = program
        .called_addresses()
        .filter_map(|addr| program.lookup_start(addr).or_else(|| program.lookup_covering(addr)))
        .collect();
    called_blocks.sort_by_key(|id| id.0);
    called_blocks.dedup();
    for entry in called_blocks {
        if covered.contains(&entry) {
            continue;
        }
        functions.push(emit_function(program, entry, &mut covered));
    }

    // Pass 2: not-yet-covered blocks with no predecessors and a known address.
    let predecessor_count = count_predecessors(program);
    let mut no_predecessor_blocks: Vec<BlockId> = program
        .block_ids()
        .filter(|id| !covered.contains(id))
        .filter(|id| program.block(*id).entry_address().is_some())
        .filter(|id| predecessor_count.get(id).copied().unwrap_or(0) == 0)
        .collect();
    no_predecessor_blocks.sort_by_key(|id| id.0);
    for entry in no_predecessor_blocks {
        if covered.contains(&entry) {
            continue;
        }
        functions.push(emit_function(program, entry, &mut covered));
    }

    // Pass 3: whatever remains.
    let remaining: Vec<BlockId> = program.block_ids().filter(|id| !covered.contains(id)).collect();
    for entry in remaining {
        if covered.contains(&entry) {
            continue;
        }
        functions.push(emit_function(program, entry, &mut covered));
    }

    functions
}

fn count_predecessors(program: &Program) -> HashMap<BlockId, usize> {
    let mut counts = HashMap::new();
    for (_, block) in program.blocks() {
        for statement in block.statements() {
            if let StatementKind::Jump(kind) = &statement.kind {
                for target in kind.targets() {
                    if let Some(target_id) = target.block() {
                        *counts.entry(target_id).or_insert(0) += 1;
                    }
                }
            }
        }
    }
    counts
}

/// DFS from `entry`, cloning every reached block into a fresh [`Function`]
/// and rewriting jump-target block pointers to point into the clones.
fn emit_function(program: &Program, entry: BlockId, covered: &mut HashSet<BlockId>) -> Function {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![entry];
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        order.push(id);
        for statement in program.block(id).statements() {
            if let StatementKind::Jump(kind) = &statement.kind {
                for target in kind.targets() {
                    if let Some(target_id) = target.block() {
                        if !seen.contains(&target_id) {
                            stack.push(target_id);
                        }
                    }
                }
            }
        }
    }

    let entry_address = advanced_entry_address(program, entry);

    let mut source_to_clone: HashMap<BlockId, BlockId> = HashMap::new();
    let entry_clone = program.block(entry).deep_clone();
    let mut function = Function::new(format!("sub_{:x}", entry_address.unwrap_or(entry.0 as u64)), entry_address, entry_clone);
    source_to_clone.insert(entry, function.entry());

    for &id in &order {
        if id == entry {
            continue;
        }
        let clone = program.block(id).deep_clone();
        let clone_id = function.push_block(clone);
        source_to_clone.insert(id, clone_id);
    }

    for &id in &order {
        covered.insert(id);
        let clone_id = source_to_clone[&id];
        rewrite_jump_targets(function.block_mut(clone_id), &source_to_clone);
    }

    function
}

/// §4.3: when the entry's first statement's instruction address strictly
/// exceeds the block's declared address and that exact address was never a
/// call target, advance the entry address to elide leading no-ops.
fn advanced_entry_address(program: &Program, entry: BlockId) -> Option<decompiler_types::Address> {
    let block = program.block(entry);
    let declared = block.entry_address()?;
    let first_instruction = block.statements().iter().find_map(|s| s.instruction())?;
    if first_instruction > declared && !program.is_called_address(declared) {
        Some(first_instruction)
    } else {
        Some(declared)
    }
}

/// Rewrites a cloned block's jump targets to point at sibling clones,
/// dropping an unconditional jump whose target was never cloned (§4.3: "An
/// unconditional jump whose target was not cloned becomes dead and is
/// dropped").
fn rewrite_jump_targets(block: &mut crate::block::BasicBlock, source_to_clone: &HashMap<BlockId, BlockId>) {
    let mut drop_index = None;
    for (index, statement) in block.statements_mut().iter_mut().enumerate() {
        let StatementKind::Jump(kind) = &mut statement.kind else {
            continue;
        };
        match kind {
            JumpKind::Unconditional(target) => match target {
                JumpTarget::Block(id) => {
                    if let Some(&clone_id) = source_to_clone.get(id) {
                        *id = clone_id;
                    } else {
                        drop_index = Some(index);
                    }
                }
                JumpTarget::Table(entries) => {
                    for entry in entries {
                        if let Some(id) = entry.block {
                            if let Some(&clone_id) = source_to_clone.get(&id) {
                                entry.block = Some(clone_id);
                            }
                        }
                    }
                }
                JumpTarget::Address(_) => {}
            },
            JumpKind::Conditional {
                then_target, else_target, ..
            } => {
                for target in [then_target, else_target] {
                    if let JumpTarget::Block(id) = target {
                        if let Some(&clone_id) = source_to_clone.get(id) {
                            *id = clone_id;
                        }
                    }
                }
            }
        }
    }
    if let Some(index) = drop_index {
        block.erase(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BasicBlock;
    use crate::jump::JumpKind;
    use crate::statement::Statement;

    #[test]
    fn empty_program_partitions_to_nothing() {
        let program = Program::new();
        assert!(partition(&program).is_empty());
    }

    #[test]
    fn single_halting_block_becomes_one_function() {
        let mut program = Program::new();
        let mut block = BasicBlock::new(Some(0x100));
        block.push_back(Statement::from_instruction(StatementKind::Halt, 0x100)).unwrap();
        program.add_block(block);

        let functions = partition(&program);
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].entry_address(), Some(0x100));
    }

    #[test]
    fn called_address_block_is_emitted_in_pass_one() {
        let mut program = Program::new();
        let mut caller = BasicBlock::new(Some(0));
        caller
            .push_back(Statement::from_instruction(
                StatementKind::Jump(JumpKind::Unconditional(JumpTarget::Block(BlockId(1)))),
                0,
            ))
            .unwrap();
        program.add_block(caller);

        let mut callee = BasicBlock::new(Some(0x200));
        callee.push_back(Statement::from_instruction(StatementKind::Halt, 0x200)).unwrap();
        program.add_block(callee);
        program.add_called_address(0x200);

        let functions = partition(&program);
        assert!(functions.iter().any(|f| f.entry_address() == Some(0x200)));
    }
}
