//! Term: a pure expression node (§3, §4.1).

use decompiler_types::{Domain, MemoryLocation};

/// How a term is used within the statement that owns it.
///
/// Rather than storing this as a mutable back-pointer on `Term` (the
/// original's approach), it is computed by traversal: a statement's shape
/// alone determines which of its direct terms are read, written, or killed,
/// and every subterm reached while computing an address or an operator's
/// operands is, by construction, a read. `Statement::visit_term_roles`
/// produces exactly the `(term, role)` pairs §3 describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessRole {
    Read,
    Write,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Negate,
    SignExtend,
    ZeroExtend,
    Truncate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    Equal,
    NotEqual,
    ULess,
    SLess,
    ULessOrEqual,
    SLessOrEqual,
}

impl BinaryOp {
    /// Compare operators always yield a 1-bit result (§3 invariant); every
    /// other binary operator yields an operand-width result.
    pub const fn is_compare(self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::ULess
                | BinaryOp::SLess
                | BinaryOp::ULessOrEqual
                | BinaryOp::SLessOrEqual
        )
    }
}

/// An opaque, kinded placeholder value (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntrinsicKind {
    /// A value about which nothing is known or assumed.
    Unknown,
    /// A value explicitly marked as not yet defined (written by hooks when
    /// instrumenting arguments/return values, §4.4).
    Undefined,
    /// The address a call will return to.
    ReturnAddress,
    /// The stack pointer's value at function entry, used as the origin for
    /// all stack-relative addressing (§4.4 entry hook).
    ZeroStackOffset,
}

/// A pure expression node (§3).
///
/// Every subtree is owned exclusively by the statement that roots it; all
/// child terms are boxed so that moving the owning statement never moves the
/// term data itself (its address stays stable for the lifetime of the IR,
/// which is what `TermId` identity, used to key dataflow results, relies on).
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Constant {
        value: i128,
        bit_size: u32,
    },
    Intrinsic {
        kind: IntrinsicKind,
        bit_size: u32,
    },
    MemoryLocationAccess(MemoryLocation),
    Dereference {
        address: Box<Term>,
        pointee_domain: Domain,
        bit_size: u32,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Term>,
        bit_size: u32,
    },
    Binary {
        op: BinaryOp,
        left: Box<Term>,
        right: Box<Term>,
        bit_size: u32,
    },
    /// Emits `preferred` if some definition reaches it, else `default`; both
    /// must share `bit_size`.
    Choice {
        preferred: Box<Term>,
        default: Box<Term>,
        bit_size: u32,
    },
}

/// Opaque identity for a term, stable for as long as the term is not moved
/// or dropped. Used to key dataflow results (§3, §4.5); becomes stale the
/// instant the IR is mutated, matching the spec's own staleness invariant.
pub type TermId = usize;

impl Term {
    pub fn constant(value: i128, bit_size: u32) -> Self {
        Term::Constant { value, bit_size }
    }

    pub fn intrinsic(kind: IntrinsicKind, bit_size: u32) -> Self {
        Term::Intrinsic { kind, bit_size }
    }

    pub fn location(location: MemoryLocation) -> Self {
        Term::MemoryLocationAccess(location)
    }

    pub fn dereference(address: Term, pointee_domain: Domain, bit_size: u32) -> Self {
        Term::Dereference {
            address: Box::new(address),
            pointee_domain,
            bit_size,
        }
    }

    pub fn unary(op: UnaryOp, operand: Term, bit_size: u32) -> Self {
        Term::Unary {
            op,
            operand: Box::new(operand),
            bit_size,
        }
    }

    pub fn binary(op: BinaryOp, left: Term, right: Term, bit_size: u32) -> Self {
        debug_assert_eq!(
            left.bit_size(),
            right.bit_size(),
            "binary operator operands must share a width"
        );
        let bit_size = if op.is_compare() { 1 } else { bit_size };
        Term::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
            bit_size,
        }
    }

    pub fn choice(preferred: Term, default: Term) -> Self {
        debug_assert_eq!(preferred.bit_size(), default.bit_size(), "choice arms must share a width");
        let bit_size = preferred.bit_size();
        Term::Choice {
            preferred: Box::new(preferred),
            default: Box::new(default),
            bit_size,
        }
    }

    /// The declared bit size of this term (§3 invariant: must match the
    /// declared size of the enclosing operator).
    pub fn bit_size(&self) -> u32 {
        match self {
            Term::Constant { bit_size, .. }
            | Term::Intrinsic { bit_size, .. }
            | Term::Dereference { bit_size, .. }
            | Term::Unary { bit_size, .. }
            | Term::Binary { bit_size, .. }
            | Term::Choice { bit_size, .. } => *bit_size,
            Term::MemoryLocationAccess(loc) => loc.bit_size(),
        }
    }

    /// The memory location this term denotes, if any (§4.5 "memory-location
    /// resolution for a term" — the parts that don't require knowing an
    /// abstract value; [`crate::dataflow`] resolves the dereference case
    /// fully using the current abstract state).
    pub fn declared_location(&self) -> Option<MemoryLocation> {
        match self {
            Term::MemoryLocationAccess(loc) => Some(*loc),
            _ => None,
        }
    }

    /// A stable identity for this term, valid until the IR is mutated.
    pub fn id(&self) -> TermId {
        self as *const Term as TermId
    }

    /// Visits every immediate child term, without any access-role
    /// information — the uniform composite-visitor named in §4.1.
    pub fn visit_child_terms<'a>(&'a self, mut f: impl FnMut(&'a Term)) {
        match self {
            Term::Constant { .. } | Term::Intrinsic { .. } | Term::MemoryLocationAccess(_) => {}
            Term::Dereference { address, .. } => f(address),
            Term::Unary { operand, .. } => f(operand),
            Term::Binary { left, right, .. } => {
                f(left);
                f(right);
            }
            Term::Choice { preferred, default, .. } => {
                f(preferred);
                f(default);
            }
        }
    }

    /// Depth-first, pre-order visit of `self` and all descendants.
    pub fn visit_all<'a>(&'a self, f: &mut impl FnMut(&'a Term)) {
        f(self);
        self.visit_child_terms(|child| child.visit_all(f));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_operator_forces_width_one() {
        let a = Term::constant(1, 32);
        let b = Term::constant(2, 32);
        let cmp = Term::binary(BinaryOp::Equal, a, b, 32);
        assert_eq!(cmp.bit_size(), 1);
    }

    #[test]
    fn visit_all_reaches_every_node() {
        let leaf_a = Term::constant(1, 8);
        let leaf_b = Term::constant(2, 8);
        let add = Term::binary(BinaryOp::Add, leaf_a, leaf_b, 8);
        let mut count = 0;
        add.visit_all(&mut |_| count += 1);
        assert_eq!(count, 3);
    }

    #[test]
    fn id_is_stable_across_reads() {
        let t = Term::constant(1, 8);
        assert_eq!(t.id(), t.id());
    }
}
