//! Function and call signatures (§3, §4.6).

use std::collections::HashMap;
use std::rc::Rc;

use crate::block::BlockId;
use crate::callee::CalleeId;
use crate::function::FunctionId;
use crate::term::Term;

/// Identifies one call statement, for keying per-call signatures and
/// call-site-local analysis results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSiteId {
    pub function: FunctionId,
    pub block: BlockId,
    pub statement_index: usize,
}

/// A callee's formal argument list and optional return value (§3).
///
/// Argument and return-value terms are reference-counted so that a callee's
/// signature and every call site referring to it see the very same term
/// instances — mutating one (e.g. the entry hook rewriting an argument's
/// width) is visible everywhere it's shared, matching "signatures are shared
/// by reference" (§3).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionSignature {
    pub arguments: Vec<Rc<Term>>,
    pub variadic: bool,
    pub return_value: Option<Rc<Term>>,
}

/// A call's view of a signature: the callee's formal arguments plus this
/// call's own extra arguments (discovered when a call supplies more
/// arguments than its callee's formal list accounts for, §4.6 step 3), and a
/// return value mirroring the callee's.
#[derive(Debug, Clone, Default)]
pub struct CallSignature {
    pub arguments: Vec<Rc<Term>>,
    pub extra_arguments: Vec<Rc<Term>>,
    pub return_value: Option<Rc<Term>>,
}

impl CallSignature {
    /// Builds a call signature that mirrors `callee`, appending `extra_arguments`.
    pub fn from_callee(callee: &FunctionSignature, extra_arguments: Vec<Rc<Term>>) -> Self {
        Self {
            arguments: callee.arguments.clone(),
            extra_arguments,
            return_value: callee.return_value.clone(),
        }
    }

    /// All arguments in canonical calling order: formals then extras.
    pub fn all_arguments(&self) -> impl Iterator<Item = &Rc<Term>> {
        self.arguments.iter().chain(self.extra_arguments.iter())
    }
}

/// The mutable output of signature analysis (§4.6): a map keyed by callee id
/// and, for each call site, the call's own view of the signature.
#[derive(Debug, Clone, Default)]
pub struct Signatures {
    by_callee: HashMap<CalleeId, Rc<FunctionSignature>>,
    by_call: HashMap<CallSiteId, Rc<CallSignature>>,
    /// Callee ids discovered to be variadic (§4.6 step 3).
    variadic: std::collections::HashSet<CalleeId>,
}

impl Signatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signature_of(&self, callee: CalleeId) -> Option<&Rc<FunctionSignature>> {
        self.by_callee.get(&callee)
    }

    pub fn set_signature(&mut self, callee: CalleeId, signature: FunctionSignature) {
        self.by_callee.insert(callee, Rc::new(signature));
    }

    pub fn call_signature(&self, call: CallSiteId) -> Option<&Rc<CallSignature>> {
        self.by_call.get(&call)
    }

    pub fn set_call_signature(&mut self, call: CallSiteId, signature: CallSignature) {
        self.by_call.insert(call, Rc::new(signature));
    }

    pub fn mark_variadic(&mut self, callee: CalleeId) {
        self.variadic.insert(callee);
    }

    pub fn is_variadic(&self, callee: CalleeId) -> bool {
        self.variadic.contains(&callee)
    }

    pub fn callees(&self) -> impl Iterator<Item = CalleeId> + '_ {
        self.by_callee.keys().copied()
    }
}
