//! Basic block: an ordered list of statements plus addressing metadata
//! (§3, §4.1).

use thiserror::Error;

use decompiler_types::Address;

use crate::function::FunctionId;
use crate::statement::Statement;

/// Index of a block in the arena owning it ([`crate::program::Program`] or,
/// after partitioning, [`crate::function::Function`]). Design Notes §9:
/// blocks are arena-owned and referenced by index, not by pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

#[derive(Debug, Error)]
#[error("cannot push a statement onto a block that is already terminated")]
pub struct BlockTerminatedError;

/// An ordered list of statements (§3).
#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    statements: Vec<Statement>,
    /// Absent for synthetic blocks with no corresponding image address.
    entry_address: Option<Address>,
    /// The byte following the last instruction folded into this block; used
    /// by the program builder to splice adjacent blocks. Absent for
    /// synthetic blocks.
    successor_address: Option<Address>,
    function: Option<FunctionId>,
}

impl BasicBlock {
    pub fn new(entry_address: Option<Address>) -> Self {
        Self {
            statements: Vec::new(),
            entry_address,
            successor_address: None,
            function: None,
        }
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn statements_mut(&mut self) -> &mut [Statement] {
        &mut self.statements
    }

    pub fn entry_address(&self) -> Option<Address> {
        self.entry_address
    }

    pub fn set_entry_address(&mut self, address: Option<Address>) {
        self.entry_address = address;
    }

    pub fn successor_address(&self) -> Option<Address> {
        self.successor_address
    }

    pub fn set_successor_address(&mut self, address: Option<Address>) {
        self.successor_address = address;
    }

    /// Whether this block is "memory-bound": it has both ends of its address
    /// range and therefore belongs in the program's range index (§3
    /// invariant).
    pub fn is_memory_bound(&self) -> bool {
        self.entry_address.is_some() && self.successor_address.is_some()
    }

    pub fn function(&self) -> Option<FunctionId> {
        self.function
    }

    pub fn set_function(&mut self, function: Option<FunctionId>) {
        self.function = function;
    }

    /// A block is terminated iff its last statement is a jump or halt (§3).
    pub fn is_terminated(&self) -> bool {
        self.statements.last().is_some_and(Statement::is_terminator)
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn push_front(&mut self, statement: Statement) {
        self.statements.insert(0, statement);
    }

    pub fn push_back(&mut self, statement: Statement) -> Result<(), BlockTerminatedError> {
        if self.is_terminated() {
            return Err(BlockTerminatedError);
        }
        self.statements.push(statement);
        Ok(())
    }

    pub fn insert_before(&mut self, index: usize, statement: Statement) {
        self.statements.insert(index, statement);
    }

    pub fn insert_after(&mut self, index: usize, statement: Statement) {
        self.statements.insert(index + 1, statement);
    }

    pub fn erase(&mut self, index: usize) -> Statement {
        self.statements.remove(index)
    }

    /// Splits this block at statement index `at`: `self` keeps
    /// `statements[..at]`, and a new block (not yet addressed or indexed) is
    /// returned holding `statements[at..]`. If `self` was terminated, the
    /// terminating statement moves to the suffix, so the suffix is
    /// terminated exactly when `self` was, and `self` is not.
    pub fn split_at(&mut self, at: usize) -> BasicBlock {
        let suffix_statements = self.statements.split_off(at);
        BasicBlock {
            statements: suffix_statements,
            entry_address: None,
            successor_address: self.successor_address.take(),
            function: self.function,
        }
    }

    /// Deep-copies every statement (and, transitively, every term); never
    /// copies the `function` back-pointer (§4.1).
    pub fn deep_clone(&self) -> Self {
        Self {
            statements: self.statements.iter().map(Statement::deep_clone).collect(),
            entry_address: self.entry_address,
            successor_address: self.successor_address,
            function: None,
        }
    }
}
