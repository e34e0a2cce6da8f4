//! Calling-convention hooks: entry/call/return instrumentation patches
//! (§4.4, component D).

use std::collections::HashMap;
use std::rc::Rc;

use decompiler_types::Address;

use crate::block::BasicBlock;
use crate::callee::CalleeId;
use crate::convention::Convention;
use crate::signature::{CallSignature, FunctionSignature};
use crate::statement::{CallbackId, Statement, StatementKind};
use crate::term::{AccessRole, IntrinsicKind, Term};

/// Which anchor kind a patch instruments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Entry,
    Call,
    Return,
}

/// A cached, revocable statement-list patch (§4.4).
///
/// `insert_after` and `remove` are the only ways a patch touches a block;
/// once built, a `Patch`'s own statement list is never mutated, so identical
/// patches (same kind, same key) can be shared from the
/// [`HookCache`] instead of rebuilt.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    kind: HookKind,
    statements: Vec<Statement>,
    /// Index of the first inserted statement once spliced in, for `remove`.
    inserted_at: Option<usize>,
}

impl Patch {
    pub fn new(kind: HookKind, statements: Vec<Statement>) -> Self {
        Self {
            kind,
            statements,
            inserted_at: None,
        }
    }

    pub fn kind(&self) -> HookKind {
        self.kind
    }

    pub fn is_installed(&self) -> bool {
        self.inserted_at.is_some()
    }

    /// Splices this patch's statements into `block` immediately after
    /// `anchor`. Idempotent: a no-op if already installed.
    pub fn insert_after(&mut self, block: &mut BasicBlock, anchor: usize) {
        if self.is_installed() {
            return;
        }
        for (offset, statement) in self.statements.iter().cloned().enumerate() {
            block.insert_after(anchor + offset, statement);
        }
        self.inserted_at = Some(anchor + 1);
    }

    /// Unsplices this patch's statements from `block`. Idempotent: a no-op
    /// if not installed. Restores the block's statement list exactly to
    /// what it was before `insert_after` (§8 round-trip property).
    pub fn remove(&mut self, block: &mut BasicBlock) {
        let Some(at) = self.inserted_at.take() else {
            return;
        };
        for _ in 0..self.statements.len() {
            block.erase(at);
        }
    }
}

/// Indexes into a per-function registry of re-instrumentation closures
/// (Design Notes §9). Each entry decides, given the current convention,
/// signature, and stack-argument size, which hook (if any) belongs at its
/// site.
pub struct CallbackRegistry {
    closures: Vec<Box<dyn Fn(&HookContext) -> Option<Patch>>>,
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry").field("len", &self.closures.len()).finish()
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self { closures: Vec::new() }
    }

    pub fn register(&mut self, closure: impl Fn(&HookContext) -> Option<Patch> + 'static) -> CallbackId {
        let id = CallbackId(self.closures.len());
        self.closures.push(Box::new(closure));
        id
    }

    pub fn evaluate(&self, id: CallbackId, context: &HookContext) -> Option<Patch> {
        (self.closures[id.0])(context)
    }
}

/// What a callback closure sees when deciding which hook belongs at its site
/// (§4.4: "based on current convention, current signature, current computed
/// stack-argument size, and ... whether the jump is currently classified as
/// a return").
pub struct HookContext<'a> {
    pub kind: HookKind,
    pub convention: &'a Convention,
    pub callee: CalleeId,
    pub signature: Option<&'a FunctionSignature>,
    pub call_signature: Option<&'a CallSignature>,
    pub stack_argument_size: Option<u32>,
    pub is_classified_as_return: bool,
}

/// Caches hooks by `(kind, callee)` so identical-key hooks are reused rather
/// than rebuilt (§4.4).
#[derive(Debug, Default)]
pub struct HookCache {
    entries: HashMap<(HookKind, CalleeId), Rc<Patch>>,
}

impl HookCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_insert_with(&mut self, kind: HookKind, callee: CalleeId, build: impl FnOnce() -> Patch) -> Rc<Patch> {
        self.entries.entry((kind, callee)).or_insert_with(|| Rc::new(build())).clone()
    }
}

fn undefined(bit_size: u32) -> Term {
    Term::intrinsic(IntrinsicKind::Undefined, bit_size)
}

/// Builds the entry hook (§4.4): zeroes the stack pointer's offset, runs the
/// convention's entry statements, and writes `undefined` to each argument.
pub fn build_entry_hook(convention: &Convention, signature: Option<&FunctionSignature>) -> Patch {
    let mut statements = Vec::new();

    statements.push(Statement::new(StatementKind::Assignment {
        left: Box::new(Term::location(convention.stack_pointer())),
        right: Box::new(Term::intrinsic(IntrinsicKind::ZeroStackOffset, convention.stack_pointer().bit_size())),
    }));

    for entry_statement in convention.entry_statements() {
        statements.push(entry_statement.deep_clone());
    }

    if let Some(signature) = signature {
        for argument in &signature.arguments {
            statements.push(Statement::new(StatementKind::Touch {
                term: Box::new((**argument).clone()),
                role: AccessRole::Write,
            }));
        }
    }

    Patch::new(HookKind::Entry, statements)
}

/// Builds the call hook (§4.4): reads the stack pointer; with a known
/// signature, reads each argument and writes `undefined` to the return
/// value; without one, snapshots reaching definitions and speculatively
/// writes `undefined` to every candidate return location. Adjusts the stack
/// pointer for callee-cleanup conventions with a known argument size.
pub fn build_call_hook(convention: &Convention, call_signature: Option<&CallSignature>, stack_argument_size: Option<u32>) -> Patch {
    let mut statements = Vec::new();

    statements.push(Statement::new(StatementKind::Touch {
        term: Box::new(Term::location(convention.stack_pointer())),
        role: AccessRole::Read,
    }));

    match call_signature {
        Some(signature) => {
            for argument in signature.all_arguments() {
                statements.push(Statement::new(StatementKind::Touch {
                    term: Box::new((**argument).clone()),
                    role: AccessRole::Read,
                }));
            }
            if let Some(return_value) = &signature.return_value {
                statements.push(Statement::new(StatementKind::Touch {
                    term: Box::new((**return_value).clone()),
                    role: AccessRole::Write,
                }));
            }
        }
        None => {
            statements.push(Statement::new(StatementKind::RememberReachingDefinitions));
            for candidate in convention.return_values() {
                statements.push(Statement::new(StatementKind::Assignment {
                    left: Box::new((**candidate).clone()),
                    right: Box::new(undefined(candidate.bit_size())),
                }));
            }
        }
    }

    if convention.callee_cleanup() {
        if let Some(size) = stack_argument_size {
            let sp = convention.stack_pointer();
            statements.push(Statement::new(StatementKind::Assignment {
                left: Box::new(Term::location(sp)),
                right: Box::new(Term::binary(
                    crate::term::BinaryOp::Add,
                    Term::location(sp),
                    Term::constant(size as i128, sp.bit_size()),
                    sp.bit_size(),
                )),
            }));
        }
    }

    Patch::new(HookKind::Call, statements)
}

/// Builds the return hook (§4.4): reads the signature's return value, or —
/// absent a signature — every convention-candidate return location.
pub fn build_return_hook(convention: &Convention, signature: Option<&FunctionSignature>) -> Patch {
    let mut statements = Vec::new();

    match signature.and_then(|s| s.return_value.as_ref()) {
        Some(return_value) => statements.push(Statement::new(StatementKind::Touch {
            term: Box::new((**return_value).clone()),
            role: AccessRole::Read,
        })),
        None => {
            for candidate in convention.return_values() {
                statements.push(Statement::new(StatementKind::Touch {
                    term: Box::new((**candidate).clone()),
                    role: AccessRole::Read,
                }));
            }
        }
    }

    Patch::new(HookKind::Return, statements)
}

/// A handle an entry hook leaves behind: which local (cloned) term stands in
/// for each formal argument, for the code generator to consume (§4.4).
#[derive(Debug, Default)]
pub struct ArgumentLocalMap {
    by_argument_identity: HashMap<usize, Rc<Term>>,
}

impl ArgumentLocalMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, signature_argument: &Rc<Term>, local: Rc<Term>) {
        self.by_argument_identity.insert(Rc::as_ptr(signature_argument) as usize, local);
    }

    pub fn local_for(&self, signature_argument: &Rc<Term>) -> Option<&Rc<Term>> {
        self.by_argument_identity.get(&(Rc::as_ptr(signature_argument) as usize))
    }
}

/// The containing-instruction address a return jump was lifted from, used by
/// `HookContext::is_classified_as_return` callers to key cached decisions.
pub type ReturnSiteKey = Address;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BasicBlock;
    use crate::statement::StatementKind;

    #[test]
    fn install_then_remove_restores_block_exactly() {
        let mut block = BasicBlock::new(Some(0));
        block.push_back(Statement::new(StatementKind::RememberReachingDefinitions)).unwrap();
        let before = block.statements().to_vec();

        let convention = crate::convention::x86_64_sysv();
        let mut patch = build_entry_hook(&convention, None);
        patch.insert_after(&mut block, 0);
        assert!(block.statements().len() > before.len());

        patch.remove(&mut block);
        assert_eq!(block.statements(), before.as_slice());
    }

    #[test]
    fn call_hook_without_signature_snapshots_and_writes_candidates() {
        let convention = crate::convention::cdecl_32();
        let patch = build_call_hook(&convention, None, None);
        assert!(patch
            .statements
            .iter()
            .any(|s| matches!(s.kind, StatementKind::RememberReachingDefinitions)));
    }
}
