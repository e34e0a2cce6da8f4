//! Statement: one executable unit of IR, owned in order inside a
//! [`crate::block::BasicBlock`] (§3, §4.1).

use decompiler_types::Address;

use crate::jump::JumpKind;
use crate::term::{AccessRole, Term};

/// Indexes into a per-function registry of re-instrumentation closures
/// (Design Notes §9: "model callback statements as a tagged variant
/// `Statement::Callback(CallbackId)`"). Kept as a bare index so the IR stays
/// plain data; the closures themselves live in
/// [`crate::hooks::CallbackRegistry`], owned by the function being analyzed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub usize);

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    /// Opaque fallback for an instruction the lifter could not model (§7).
    InlineAssembly { note: String },
    /// `left := right`; both terms share a size (§3 invariant).
    Assignment { left: Box<Term>, right: Box<Term> },
    /// A term consumed purely for its effect on analyses.
    Touch { term: Box<Term>, role: AccessRole },
    /// A call to `target`, read for its value.
    Call { target: Box<Term> },
    /// Transfers control; conditional or unconditional (§3 "Jump target").
    Jump(JumpKind),
    Halt,
    /// Re-instrumentation point; invoked by the dataflow analyzer on every
    /// execution of this statement (§4.4, §4.5).
    Callback(CallbackId),
    /// Snapshot marker consumed by signature analysis (§4.5, §4.6).
    RememberReachingDefinitions,
}

/// One statement, with its back-pointer to the machine instruction it was
/// lifted from, if any (absent for hook-inserted or synthetic statements).
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    instruction: Option<Address>,
}

impl Statement {
    pub fn new(kind: StatementKind) -> Self {
        Self { kind, instruction: None }
    }

    pub fn from_instruction(kind: StatementKind, instruction: Address) -> Self {
        Self {
            kind,
            instruction: Some(instruction),
        }
    }

    pub fn instruction(&self) -> Option<Address> {
        self.instruction
    }

    /// Attaches the originating instruction address. Panics if one is
    /// already attached (§7 "an attempt to set a statement's
    /// enclosing-instruction twice" is an internal-consistency violation).
    pub fn set_instruction(&mut self, instruction: Address) {
        assert!(
            self.instruction.is_none(),
            "statement already has an enclosing instruction address"
        );
        self.instruction = Some(instruction);
    }

    /// Whether this statement ends a basic block (§3: "terminated").
    pub fn is_terminator(&self) -> bool {
        matches!(self.kind, StatementKind::Halt | StatementKind::Jump(_))
    }

    /// Deep-copies this statement's term tree and instruction back-pointer;
    /// never copies block/function back-pointers (§4.1: "Clone must not copy
    /// block/parent back-pointers" — there are none to copy, since those
    /// live on the owning container, not on `Statement`).
    pub fn deep_clone(&self) -> Self {
        self.clone()
    }

    /// Visits every top-level term this statement directly references,
    /// together with its access role, and recursively visits each one's
    /// descendants as reads (§3: "access role in that statement").
    pub fn visit_term_roles<'a>(&'a self, mut f: impl FnMut(&'a Term, AccessRole)) {
        fn visit_reads<'a>(term: &'a Term, f: &mut impl FnMut(&'a Term, AccessRole)) {
            f(term, AccessRole::Read);
            term.visit_child_terms(|child| visit_reads(child, f));
        }

        match &self.kind {
            StatementKind::InlineAssembly { .. } | StatementKind::Halt | StatementKind::Callback(_) => {}
            StatementKind::Assignment { left, right } => {
                // The address computation inside a dereferenced write target
                // is itself a read; only the outermost term is the write.
                f(left, AccessRole::Write);
                left.visit_child_terms(|child| visit_reads(child, &mut f));
                visit_reads(right, &mut f);
            }
            StatementKind::Touch { term, role } => {
                // As with `Assignment`'s left side: a compound term's own
                // address computation is a read regardless of the root
                // term's role.
                f(term, *role);
                term.visit_child_terms(|child| visit_reads(child, &mut f));
            }
            StatementKind::Call { target } => visit_reads(target, &mut f),
            StatementKind::Jump(kind) => match kind {
                JumpKind::Unconditional(target) => {
                    if let crate::jump::JumpTarget::Address(addr) = target {
                        visit_reads(addr, &mut f);
                    }
                }
                JumpKind::Conditional {
                    condition,
                    then_target,
                    else_target,
                } => {
                    visit_reads(condition, &mut f);
                    for target in [then_target, else_target] {
                        if let crate::jump::JumpTarget::Address(addr) = target {
                            visit_reads(addr, &mut f);
                        }
                    }
                }
            },
            StatementKind::RememberReachingDefinitions => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::Term;
    use decompiler_types::{Domain, MemoryLocation};

    fn eax() -> MemoryLocation {
        MemoryLocation::new(Domain::register(0), 0, 32)
    }

    #[test]
    fn touch_write_of_a_dereference_still_visits_its_address_as_a_read() {
        let statement = Statement::new(StatementKind::Touch {
            term: Box::new(Term::dereference(Term::location(eax()), Domain::MEMORY, 32)),
            role: AccessRole::Write,
        });

        let mut roles = Vec::new();
        statement.visit_term_roles(|term, role| roles.push((term.declared_location(), role)));

        assert_eq!(roles[0].1, AccessRole::Write, "the dereference itself is the write");
        assert!(
            roles.iter().any(|(loc, role)| *loc == Some(eax()) && *role == AccessRole::Read),
            "the dereferenced address's own register must still be visited as a read"
        );
    }
}
