//! Jump targets (§3) and the `Jump` statement shape they attach to.

use decompiler_types::Address;

use crate::block::BlockId;
use crate::term::Term;

/// One entry of a jump table: the address the table cell holds, and the
/// block it resolves to once the program builder has split blocks at every
/// entry (absent until then).
#[derive(Debug, Clone, PartialEq)]
pub struct JumpTableEntry {
    pub address: Address,
    pub block: Option<BlockId>,
}

/// Where control transfers to: a computed address, a direct block reference,
/// or a jump table (§3).
#[derive(Debug, Clone, PartialEq)]
pub enum JumpTarget {
    Address(Box<Term>),
    Block(BlockId),
    Table(Vec<JumpTableEntry>),
}

impl JumpTarget {
    pub fn block(&self) -> Option<BlockId> {
        match self {
            JumpTarget::Block(id) => Some(*id),
            _ => None,
        }
    }
}

/// An unconditional jump carries one target; a conditional jump carries two
/// and a condition term (§3).
#[derive(Debug, Clone, PartialEq)]
pub enum JumpKind {
    Unconditional(JumpTarget),
    Conditional {
        condition: Box<Term>,
        then_target: JumpTarget,
        else_target: JumpTarget,
    },
}

impl JumpKind {
    pub fn targets(&self) -> Vec<&JumpTarget> {
        match self {
            JumpKind::Unconditional(t) => vec![t],
            JumpKind::Conditional {
                then_target, else_target, ..
            } => vec![then_target, else_target],
        }
    }

    pub fn targets_mut(&mut self) -> Vec<&mut JumpTarget> {
        match self {
            JumpKind::Unconditional(t) => vec![t],
            JumpKind::Conditional {
                then_target, else_target, ..
            } => vec![then_target, else_target],
        }
    }
}
