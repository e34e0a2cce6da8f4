//! Type inference (§4.9, component I): unification over type variables
//! attached to terms, with a lattice of bit-size, signedness, pointer-ness,
//! float-ness, and a struct-recovery offset map.
//!
//! The union-find is the same shape as [`crate::variables`]'s (path
//! compression on find, union-by-rank), grown dynamically as new terms are
//! seen rather than sized up front, since the term population isn't known
//! until the walk runs.

use std::collections::{BTreeMap, HashMap};

use decompiler_types::MemoryLocation;

use crate::function::Function;
use crate::statement::StatementKind;
use crate::term::{BinaryOp, Term, TermId, UnaryOp};

pub type TypeVar = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signedness {
    Signed,
    Unsigned,
}

/// Everything unification has settled about one type variable's equivalence
/// class so far. `None`/`false` mean "not yet constrained", not "known to be
/// absent" — the lattice only ever gains information.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeAttributes {
    pub bit_size: Option<u32>,
    pub signedness: Option<Signedness>,
    /// Set when some dereference or pointer-arithmetic site treats this
    /// variable's value as an address; points at the pointee's own variable.
    pub pointee: Option<TypeVar>,
    pub is_float: bool,
    /// Byte offsets into the pointee known to be accessed, each naming the
    /// type variable observed at that offset (§4.9 "later struct recovery").
    pub offsets: BTreeMap<i64, TypeVar>,
}

impl TypeAttributes {
    fn merge(mut self, other: Self) -> Self {
        self.bit_size = self.bit_size.or(other.bit_size);
        self.signedness = self.signedness.or(other.signedness);
        self.pointee = self.pointee.or(other.pointee);
        self.is_float = self.is_float || other.is_float;
        for (offset, var) in other.offsets {
            self.offsets.entry(offset).or_insert(var);
        }
        self
    }
}

/// Growable union-find; see [`crate::variables::UnionFind`] for the
/// fixed-size sibling this is grounded on.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new() -> Self {
        Self { parent: Vec::new(), rank: Vec::new() }
    }

    fn push(&mut self) -> usize {
        let id = self.parent.len();
        self.parent.push(id);
        self.rank.push(0);
        id
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }

    /// Returns the surviving root.
    fn union(&mut self, a: usize, b: usize) -> usize {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return ra;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => {
                self.parent[ra] = rb;
                rb
            }
            std::cmp::Ordering::Greater => {
                self.parent[rb] = ra;
                ra
            }
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
                ra
            }
        }
    }
}

/// The result of running inference over a function: every term's type
/// variable, queryable by term identity or by the underlying memory
/// location (so every occurrence of the same register shares one variable).
pub struct TermTypes {
    union_find: UnionFind,
    attributes: Vec<TypeAttributes>,
    by_term: HashMap<TermId, TypeVar>,
    by_location: HashMap<MemoryLocation, TypeVar>,
}

impl TermTypes {
    fn new() -> Self {
        Self {
            union_find: UnionFind::new(),
            attributes: Vec::new(),
            by_term: HashMap::new(),
            by_location: HashMap::new(),
        }
    }

    fn alloc(&mut self) -> TypeVar {
        let var = self.union_find.push();
        self.attributes.push(TypeAttributes::default());
        var
    }

    fn root(&mut self, var: TypeVar) -> TypeVar {
        self.union_find.find(var)
    }

    /// The type variable for `term`; terms that denote the same memory
    /// location (e.g. the same register read in two different statements)
    /// share a variable, since they describe the same storage. Every other
    /// term shape gets its own variable, keyed by node identity.
    fn var_for(&mut self, term: &Term) -> TypeVar {
        if let Some(location) = term.declared_location() {
            if let Some(&var) = self.by_location.get(&location) {
                return var;
            }
            let var = self.alloc();
            self.by_location.insert(location, var);
            self.set_bit_size(var, location.bit_size());
            return var;
        }
        let id = term.id();
        if let Some(&var) = self.by_term.get(&id) {
            return var;
        }
        let var = self.alloc();
        self.by_term.insert(id, var);
        self.set_bit_size(var, term.bit_size());
        var
    }

    fn set_bit_size(&mut self, var: TypeVar, bit_size: u32) {
        let root = self.root(var);
        self.attributes[root].bit_size.get_or_insert(bit_size);
    }

    fn set_signedness(&mut self, var: TypeVar, signedness: Signedness) {
        let root = self.root(var);
        self.attributes[root].signedness.get_or_insert(signedness);
    }

    fn unify(&mut self, a: TypeVar, b: TypeVar) -> TypeVar {
        let (ra, rb) = (self.root(a), self.root(b));
        if ra == rb {
            return ra;
        }
        let merged = self.attributes[ra].clone().merge(self.attributes[rb].clone());
        let root = self.union_find.union(ra, rb);
        self.attributes[root] = merged;
        root
    }

    /// Marks `var`'s value as a pointer to `pointee`; if `var` was already
    /// known to point somewhere else, the two pointee candidates unify.
    fn mark_pointer(&mut self, var: TypeVar, pointee: TypeVar) {
        let root = self.root(var);
        let pointee_root = self.root(pointee);
        match self.attributes[root].pointee {
            Some(existing) => {
                self.unify(existing, pointee_root);
            }
            None => self.attributes[root].pointee = Some(pointee_root),
        }
    }

    /// Allocates (or returns, if already recorded) the field variable at
    /// `offset` bytes into `pointee`'s offset map.
    fn record_offset(&mut self, pointee: TypeVar, offset: i64) -> TypeVar {
        let root = self.root(pointee);
        if let Some(&var) = self.attributes[root].offsets.get(&offset) {
            return var;
        }
        let var = self.alloc();
        self.attributes[root].offsets.insert(offset, var);
        var
    }

    /// The settled attributes for `term`'s equivalence class.
    pub fn type_of(&mut self, term: &Term) -> TypeAttributes {
        let var = self.var_for(term);
        let root = self.root(var);
        self.attributes[root].clone()
    }
}

/// Runs inference over every statement in `function` (§4.9).
///
/// Two passes: the first walks every statement generating the
/// assignment/compare/extend/dereference constraints, which may mark a
/// variable as a pointer; the second revisits every `Add` to apply the
/// pointer-plus-small-integer offset rule, which needs pointer-ness already
/// settled regardless of which statement discovered it.
pub fn infer(function: &Function) -> TermTypes {
    let mut types = TermTypes::new();

    for (_, block) in function.blocks() {
        for statement in block.statements() {
            if let StatementKind::Assignment { left, right } = &statement.kind {
                let left_var = types.var_for(left);
                let right_var = types.var_for(right);
                types.unify(left_var, right_var);
            }
            statement.visit_term_roles(|term, _role| generate_term_constraints(&mut types, term));
        }
    }

    for (_, block) in function.blocks() {
        for statement in block.statements() {
            statement.visit_term_roles(|term, _role| record_pointer_arithmetic(&mut types, term));
        }
    }

    types
}

fn generate_term_constraints(types: &mut TermTypes, term: &Term) {
    match term {
        Term::Binary { op, left, right, .. } if op.is_compare() => {
            let left_var = types.var_for(left);
            let right_var = types.var_for(right);
            types.unify(left_var, right_var);
            match op {
                BinaryOp::SLess | BinaryOp::SLessOrEqual => {
                    types.set_signedness(left_var, Signedness::Signed);
                    types.set_signedness(right_var, Signedness::Signed);
                }
                BinaryOp::ULess | BinaryOp::ULessOrEqual => {
                    types.set_signedness(left_var, Signedness::Unsigned);
                    types.set_signedness(right_var, Signedness::Unsigned);
                }
                _ => {}
            }
        }
        Term::Unary { op, operand, .. } => match op {
            UnaryOp::SignExtend => {
                let var = types.var_for(operand);
                types.set_signedness(var, Signedness::Signed);
            }
            UnaryOp::ZeroExtend => {
                let var = types.var_for(operand);
                types.set_signedness(var, Signedness::Unsigned);
            }
            UnaryOp::Not | UnaryOp::Negate => {
                let self_var = types.var_for(term);
                let operand_var = types.var_for(operand);
                types.unify(self_var, operand_var);
            }
            UnaryOp::Truncate => {}
        },
        Term::Dereference { address, .. } => {
            let address_var = types.var_for(address);
            let target_var = types.var_for(term);
            types.mark_pointer(address_var, target_var);
        }
        _ => {}
    }
}

fn record_pointer_arithmetic(types: &mut TermTypes, term: &Term) {
    let Term::Binary { op: BinaryOp::Add, left, right, .. } = term else {
        return;
    };
    if let Some((pointer_operand, integer_operand)) = pointer_and_small_integer(left, right) {
        apply_pointer_offset(types, term, pointer_operand, integer_operand);
    }
}

fn pointer_and_small_integer<'a>(left: &'a Term, right: &'a Term) -> Option<(&'a Term, i128)> {
    match (left, right) {
        (_, Term::Constant { value, .. }) => Some((left, *value)),
        (Term::Constant { value, .. }, _) => Some((right, *value)),
        _ => None,
    }
}

fn apply_pointer_offset(types: &mut TermTypes, result: &Term, pointer_operand: &Term, offset: i128) {
    let pointer_var = types.var_for(pointer_operand);
    let root = types.root(pointer_var);
    let Some(pointee) = types.attributes[root].pointee else {
        return;
    };
    types.record_offset(pointee, offset as i64);
    let result_var = types.var_for(result);
    types.unify(result_var, pointer_var);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BasicBlock;
    use crate::function::Function;
    use crate::statement::Statement;
    use decompiler_types::Domain;

    fn reg(offset: u32, bit_size: u32) -> MemoryLocation {
        MemoryLocation::new(Domain::register(offset), 0, bit_size)
    }

    #[test]
    fn compare_unifies_both_operands_signedness() {
        let mut block = BasicBlock::new(Some(0));
        let condition = Term::binary(BinaryOp::SLess, Term::location(reg(0, 32)), Term::location(reg(1, 32)), 32);
        block
            .push_back(Statement::from_instruction(
                StatementKind::Jump(crate::jump::JumpKind::Conditional {
                    condition: Box::new(condition),
                    then_target: crate::jump::JumpTarget::Block(crate::block::BlockId(0)),
                    else_target: crate::jump::JumpTarget::Block(crate::block::BlockId(0)),
                }),
                0,
            ))
            .unwrap();
        let function = Function::new("f".into(), Some(0), block);

        let mut types = infer(&function);
        let a = types.type_of(&Term::location(reg(0, 32)));
        let b = types.type_of(&Term::location(reg(1, 32)));
        assert_eq!(a.signedness, Some(Signedness::Signed));
        assert_eq!(b.signedness, Some(Signedness::Signed));
    }

    #[test]
    fn dereference_then_offset_add_records_a_field() {
        let mut block = BasicBlock::new(Some(0));
        let base = Term::location(reg(0, 64));
        let load = Term::dereference(base.clone(), Domain::MEMORY, 32);
        block
            .push_back(Statement::from_instruction(
                StatementKind::Assignment {
                    left: Box::new(Term::location(reg(1, 32))),
                    right: Box::new(load),
                },
                0,
            ))
            .unwrap();
        let offset_address = Term::binary(BinaryOp::Add, base.clone(), Term::constant(8, 64), 64);
        let second_load = Term::dereference(offset_address, Domain::MEMORY, 32);
        block
            .push_back(Statement::from_instruction(
                StatementKind::Assignment {
                    left: Box::new(Term::location(reg(2, 32))),
                    right: Box::new(second_load),
                },
                4,
            ))
            .unwrap();
        let function = Function::new("f".into(), Some(0), block);

        let mut types = infer(&function);
        let base_var = types.var_for(&base);
        let base_root = types.root(base_var);
        let pointee = types.attributes[base_root].pointee.expect("base was dereferenced");
        let pointee_root = types.root(pointee);
        assert!(types.attributes[pointee_root].offsets.contains_key(&8));
    }
}
