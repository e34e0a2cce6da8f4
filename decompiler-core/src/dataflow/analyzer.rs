//! The per-function dataflow fixpoint (§4.5, component E): a worklist over
//! basic blocks computing, for every term, an abstract value and (where
//! applicable) a memory location, plus reaching definitions per location.

use std::collections::{HashMap, VecDeque};

use decompiler_types::{Domain, MemoryLocation};

use crate::block::BlockId;
use crate::cancel::CancellationToken;
use crate::function::Function;
use crate::jump::{JumpKind, JumpTarget};
use crate::statement::{CallbackId, StatementKind};
use crate::term::{AccessRole, BinaryOp, IntrinsicKind, Term, TermId, UnaryOp};

use super::reaching::{Definition, ReachingDefinitions};
use super::value::AbstractValue;

/// A location's last-known abstract value within a block's running state.
type Environment = HashMap<MemoryLocation, AbstractValue>;

fn join_environments(states: impl IntoIterator<Item = Environment>) -> Environment {
    let states: Vec<Environment> = states.into_iter().collect();
    let total = states.len();
    let mut result: Environment = HashMap::new();
    let mut seen_count: HashMap<MemoryLocation, usize> = HashMap::new();

    for state in &states {
        for (loc, value) in state {
            *seen_count.entry(*loc).or_insert(0) += 1;
            match result.remove(loc) {
                Some(existing) => {
                    result.insert(*loc, existing.meet(value));
                }
                None => {
                    result.insert(*loc, value.clone());
                }
            }
        }
    }

    // A location not present in every predecessor's state is unconstrained
    // at the join point (§4.5), not whatever value the predecessors that did
    // define it happened to carry.
    result.retain(|loc, _| seen_count.get(loc) == Some(&total));
    result
}

/// The full result of running dataflow to fixpoint over one function (§4.5).
#[derive(Debug, Clone, Default)]
pub struct DataflowResult {
    values: HashMap<TermId, AbstractValue>,
    locations: HashMap<TermId, Option<MemoryLocation>>,
    reaching_at_entry: HashMap<BlockId, ReachingDefinitions>,
    reaching_at_exit: HashMap<BlockId, ReachingDefinitions>,
    /// Reaching definitions at the point a `remember-reaching-definitions`
    /// statement executed, keyed by its `(block, statement_index)` (§4.5,
    /// consumed by signature analysis, §4.6).
    pub snapshots: HashMap<(BlockId, usize), ReachingDefinitions>,
    /// Reads whose location had no reaching definition inside the function —
    /// "undefined uses" (§4.6 step 1), keyed by the reading term.
    pub undefined_uses: HashMap<TermId, MemoryLocation>,
}

impl DataflowResult {
    pub fn value_of(&self, term: &Term) -> Option<&AbstractValue> {
        self.values.get(&term.id())
    }

    pub fn location_of(&self, term: &Term) -> Option<MemoryLocation> {
        self.locations.get(&term.id()).copied().flatten()
    }

    pub fn reaching_at_entry(&self, block: BlockId) -> Option<&ReachingDefinitions> {
        self.reaching_at_entry.get(&block)
    }

    pub fn reaching_at_exit(&self, block: BlockId) -> Option<&ReachingDefinitions> {
        self.reaching_at_exit.get(&block)
    }
}

/// Lets a callback statement request the analyzer re-traverse the function
/// after mutating it (§4.4, §4.5). The handler receives the pre-state
/// reaching definitions and returns whether re-instrumentation happened.
pub trait CallbackHandler {
    fn handle(&mut self, id: CallbackId, pre_state: &ReachingDefinitions) -> bool;
}

impl<F: FnMut(CallbackId, &ReachingDefinitions) -> bool> CallbackHandler for F {
    fn handle(&mut self, id: CallbackId, pre_state: &ReachingDefinitions) -> bool {
        self(id, pre_state)
    }
}

struct NoopCallbackHandler;
impl CallbackHandler for NoopCallbackHandler {
    fn handle(&mut self, _id: CallbackId, _pre_state: &ReachingDefinitions) -> bool {
        false
    }
}

/// Runs dataflow to fixpoint over `function`, polling `cancel` between
/// rounds (§5 "between basic blocks in dataflow").
pub fn analyze(function: &Function, cancel: &CancellationToken) -> Result<DataflowResult, crate::error::DecompilerError> {
    analyze_with_callbacks(function, cancel, &mut NoopCallbackHandler)
}

pub fn analyze_with_callbacks(
    function: &Function,
    cancel: &CancellationToken,
    callbacks: &mut dyn CallbackHandler,
) -> Result<DataflowResult, crate::error::DecompilerError> {
    let successors = successor_map(function);
    let predecessors = predecessor_map(function, &successors);

    let mut result = DataflowResult::default();
    let mut exit_reaching: HashMap<BlockId, ReachingDefinitions> = HashMap::new();
    let mut exit_env: HashMap<BlockId, Environment> = HashMap::new();

    let mut worklist: VecDeque<BlockId> = function.block_ids().collect();
    let mut in_queue: std::collections::HashSet<BlockId> = worklist.iter().copied().collect();

    while let Some(block_id) = worklist.pop_front() {
        in_queue.remove(&block_id);
        cancel.poll()?;

        let preds = predecessors.get(&block_id).cloned().unwrap_or_default();
        let entry_reaching = ReachingDefinitions::join(preds.iter().filter_map(|p| exit_reaching.get(p).cloned()));
        let entry_env = join_environments(preds.iter().filter_map(|p| exit_env.get(p).cloned()));

        let mut reaching = entry_reaching.clone();
        let mut env = entry_env;

        for (index, statement) in function.block(block_id).statements().iter().enumerate() {
            execute_statement(block_id, index, statement, &mut reaching, &mut env, &mut result, callbacks);
        }

        result.reaching_at_entry.insert(block_id, entry_reaching);
        let changed = exit_reaching.get(&block_id) != Some(&reaching) || exit_env.get(&block_id) != Some(&env);
        exit_reaching.insert(block_id, reaching.clone());
        exit_env.insert(block_id, env);
        result.reaching_at_exit.insert(block_id, reaching);

        if changed {
            for &succ in successors.get(&block_id).into_iter().flatten() {
                if in_queue.insert(succ) {
                    worklist.push_back(succ);
                }
            }
        }
    }

    Ok(result)
}

fn successor_map(function: &Function) -> HashMap<BlockId, Vec<BlockId>> {
    let mut map = HashMap::new();
    for (id, block) in function.blocks() {
        let mut succs = Vec::new();
        for statement in block.statements() {
            if let StatementKind::Jump(kind) = &statement.kind {
                for target in kind.targets() {
                    if let Some(target_id) = target.block() {
                        succs.push(target_id);
                    }
                }
            }
        }
        map.insert(id, succs);
    }
    map
}

fn predecessor_map(function: &Function, successors: &HashMap<BlockId, Vec<BlockId>>) -> HashMap<BlockId, Vec<BlockId>> {
    let mut map: HashMap<BlockId, Vec<BlockId>> = function.block_ids().map(|id| (id, Vec::new())).collect();
    for (&from, succs) in successors {
        for &to in succs {
            map.entry(to).or_default().push(from);
        }
    }
    map
}

#[allow(clippy::too_many_arguments)]
fn execute_statement(
    block_id: BlockId,
    index: usize,
    statement: &crate::statement::Statement,
    reaching: &mut ReachingDefinitions,
    env: &mut Environment,
    result: &mut DataflowResult,
    callbacks: &mut dyn CallbackHandler,
) {
    match &statement.kind {
        StatementKind::Assignment { left, right } => {
            let right_value = evaluate(right, env, reaching, result);
            let location = resolve_location(left, env, reaching, result);
            result.values.insert(left.id(), right_value.clone());
            result.locations.insert(left.id(), location);
            if let Some(loc) = location {
                reaching.install(loc, left.id());
                env.insert(loc, right_value.resized(loc.bit_size()));
            }
        }
        StatementKind::Touch { term, role } => {
            let value = evaluate(term, env, reaching, result);
            let location = resolve_location(term, env, reaching, result);
            match role {
                AccessRole::Write => {
                    if let Some(loc) = location {
                        reaching.install(loc, term.id());
                        env.insert(loc, value);
                    }
                }
                AccessRole::Read => {
                    if let Some(loc) = location {
                        if reaching.project(loc).is_empty() {
                            result.undefined_uses.insert(term.id(), loc);
                        }
                    }
                }
                AccessRole::Kill => {
                    if let Some(loc) = location {
                        reaching.kill(loc);
                        env.remove(&loc);
                    }
                }
            }
        }
        StatementKind::Call { target } => {
            evaluate(target, env, reaching, result);
        }
        StatementKind::Jump(kind) => match kind {
            JumpKind::Unconditional(target) => {
                if let JumpTarget::Address(addr) = target {
                    evaluate(addr, env, reaching, result);
                }
            }
            JumpKind::Conditional {
                condition,
                then_target,
                else_target,
            } => {
                evaluate(condition, env, reaching, result);
                for target in [then_target, else_target] {
                    if let JumpTarget::Address(addr) = target {
                        evaluate(addr, env, reaching, result);
                    }
                }
            }
        },
        StatementKind::Halt | StatementKind::InlineAssembly { .. } => {}
        StatementKind::Callback(id) => {
            callbacks.handle(*id, reaching);
        }
        StatementKind::RememberReachingDefinitions => {
            result.snapshots.insert((block_id, index), reaching.clone());
        }
    }
}

fn evaluate(term: &Term, env: &Environment, reaching: &ReachingDefinitions, result: &mut DataflowResult) -> AbstractValue {
    let value = match term {
        Term::Constant { value, bit_size } => AbstractValue::constant(*value, *bit_size),
        Term::Intrinsic { kind, bit_size } => match kind {
            IntrinsicKind::ZeroStackOffset => AbstractValue::stack_offset(0, *bit_size),
            IntrinsicKind::Unknown | IntrinsicKind::Undefined | IntrinsicKind::ReturnAddress => AbstractValue::top(*bit_size),
        },
        Term::MemoryLocationAccess(loc) => {
            let value = env.get(loc).cloned().unwrap_or_else(|| AbstractValue::top(loc.bit_size()));
            if reaching.project(*loc).is_empty() {
                result.undefined_uses.insert(term.id(), *loc);
            }
            value
        }
        Term::Dereference {
            address,
            pointee_domain,
            bit_size,
        } => {
            let address_value = evaluate(address, env, reaching, result);
            let location = dereference_location(&address_value, *pointee_domain, *bit_size);
            match location {
                Some(loc) => env.get(&loc).cloned().unwrap_or_else(|| AbstractValue::top(*bit_size)),
                None => AbstractValue::top(*bit_size),
            }
        }
        Term::Unary { op, operand, bit_size } => {
            let operand_value = evaluate(operand, env, reaching, result);
            apply_unary(*op, &operand_value, *bit_size)
        }
        Term::Binary { op, left, right, bit_size } => {
            let left_value = evaluate(left, env, reaching, result);
            let right_value = evaluate(right, env, reaching, result);
            apply_binary(*op, &left_value, &right_value, *bit_size)
        }
        Term::Choice { preferred, default, .. } => {
            let preferred_value = evaluate(preferred, env, reaching, result);
            let default_value = evaluate(default, env, reaching, result);
            preferred_value.meet(&default_value)
        }
    };
    result.values.insert(term.id(), value.clone());
    value
}

/// Memory-location resolution for a term (§4.5): the parts that don't
/// require mutating state; dereferences resolve via the address's abstract
/// value computed by [`evaluate`].
fn resolve_location(term: &Term, env: &Environment, reaching: &ReachingDefinitions, result: &mut DataflowResult) -> Option<MemoryLocation> {
    let location = match term {
        Term::MemoryLocationAccess(loc) => Some(*loc),
        Term::Dereference {
            address,
            pointee_domain,
            bit_size,
        } => {
            let address_value = evaluate(address, env, reaching, result);
            dereference_location(&address_value, *pointee_domain, *bit_size)
        }
        Term::Choice { preferred, default, .. } => {
            let a = resolve_location(preferred, env, reaching, result);
            let b = resolve_location(default, env, reaching, result);
            if a == b {
                a
            } else {
                None
            }
        }
        _ => None,
    };
    result.locations.insert(term.id(), location);
    location
}

/// A dereference whose address has a known stack-offset yields a stack
/// location; a concrete address yields a main-memory location (using the
/// address's value directly as a bit offset); otherwise none (§4.5).
fn dereference_location(address_value: &AbstractValue, pointee_domain: Domain, bit_size: u32) -> Option<MemoryLocation> {
    if let Some(offset) = address_value.stack_offset_value() {
        return Some(MemoryLocation::new(Domain::STACK, offset, bit_size));
    }
    if let Some(concrete) = address_value.as_concrete() {
        let domain = if pointee_domain == Domain::STACK { Domain::MEMORY } else { pointee_domain };
        return Some(MemoryLocation::new(domain, concrete as i64, bit_size));
    }
    None
}

fn apply_unary(op: UnaryOp, operand: &AbstractValue, bit_size: u32) -> AbstractValue {
    match operand.as_concrete() {
        Some(value) => {
            let operand_bits = operand.bit_size();
            let result = match op {
                UnaryOp::Not => !value,
                UnaryOp::Negate => value.wrapping_neg(),
                UnaryOp::ZeroExtend => value & ((1i128 << operand_bits) - 1),
                UnaryOp::SignExtend => sign_extend(value, operand_bits),
                UnaryOp::Truncate => value,
            };
            AbstractValue::constant(result, bit_size)
        }
        None => AbstractValue::top(bit_size),
    }
}

fn apply_binary(op: BinaryOp, left: &AbstractValue, right: &AbstractValue, bit_size: u32) -> AbstractValue {
    let result_bits = if op.is_compare() { 1 } else { bit_size };

    // Stack-relative pointer arithmetic: `stack_ptr + constant` (or the
    // reverse) stays a stack offset — needed for `sp := sp + size` in the
    // callee-cleanup call hook and frame-pointer-relative addressing.
    if matches!(op, BinaryOp::Add | BinaryOp::Sub) {
        if let (Some(offset), Some(delta)) = (left.stack_offset_value(), right.as_concrete()) {
            let delta = if op == BinaryOp::Sub { -delta } else { delta };
            return AbstractValue::stack_offset(offset + delta as i64, result_bits);
        }
        if op == BinaryOp::Add {
            if let (Some(delta), Some(offset)) = (left.as_concrete(), right.stack_offset_value()) {
                return AbstractValue::stack_offset(offset + delta as i64, result_bits);
            }
        }
    }

    match (left.as_concrete(), right.as_concrete()) {
        (Some(a), Some(b)) => {
            let value = match op {
                BinaryOp::And => a & b,
                BinaryOp::Or => a | b,
                BinaryOp::Xor => a ^ b,
                BinaryOp::Shl => a.wrapping_shl(b as u32),
                BinaryOp::Shr => ((a as u128) >> (b as u32)) as i128,
                BinaryOp::Sar => a.wrapping_shr(b as u32),
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::UDiv => {
                    if b == 0 {
                        return AbstractValue::top(result_bits);
                    }
                    ((a as u128) / (b as u128)) as i128
                }
                BinaryOp::SDiv => {
                    if b == 0 {
                        return AbstractValue::top(result_bits);
                    }
                    a.wrapping_div(b)
                }
                BinaryOp::Equal => (a == b) as i128,
                BinaryOp::NotEqual => (a != b) as i128,
                BinaryOp::ULess => ((a as u128) < (b as u128)) as i128,
                BinaryOp::SLess => (a < b) as i128,
                BinaryOp::ULessOrEqual => ((a as u128) <= (b as u128)) as i128,
                BinaryOp::SLessOrEqual => (a <= b) as i128,
            };
            AbstractValue::constant(value, result_bits)
        }
        _ => AbstractValue::top(result_bits),
    }
}

fn sign_extend(value: i128, from_bits: u32) -> i128 {
    let shift = 128 - from_bits;
    (value << shift) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BasicBlock;
    use crate::statement::Statement;
    use decompiler_types::Domain;

    fn eax() -> MemoryLocation {
        MemoryLocation::new(Domain::register(0), 0, 32)
    }

    #[test]
    fn xor_eax_eax_yields_concrete_zero() {
        let block = {
            let mut b = BasicBlock::new(Some(0));
            b.push_back(Statement::from_instruction(
                StatementKind::Assignment {
                    left: Box::new(Term::location(eax())),
                    right: Box::new(Term::binary(BinaryOp::Xor, Term::location(eax()), Term::location(eax()), 32)),
                },
                0,
            ))
            .unwrap();
            b.push_back(Statement::from_instruction(
                StatementKind::Jump(JumpKind::Unconditional(JumpTarget::Address(Box::new(Term::intrinsic(
                    IntrinsicKind::ReturnAddress,
                    32,
                ))))),
                4,
            ))
            .unwrap();
            b
        };
        let function = Function::new("f".into(), Some(0), block);
        let cancel = CancellationToken::new();
        let result = analyze(&function, &cancel).unwrap();

        let assignment_right_value = result
            .values
            .values()
            .find(|v| v.as_concrete() == Some(0))
            .expect("xor of equal operands must be concretely zero");
        assert_eq!(assignment_right_value.as_concrete(), Some(0));
    }

    #[test]
    fn join_drops_a_location_absent_from_any_predecessor() {
        let mut defined_in_both = Environment::new();
        defined_in_both.insert(eax(), AbstractValue::constant(1, 32));
        let mut defined_in_one = Environment::new();
        defined_in_one.insert(eax(), AbstractValue::constant(1, 32));
        let ecx = MemoryLocation::new(Domain::register(1), 0, 32);
        defined_in_one.insert(ecx, AbstractValue::constant(2, 32));

        let joined = join_environments([defined_in_both, defined_in_one]);

        assert_eq!(joined.get(&eax()), Some(&AbstractValue::constant(1, 32)));
        assert!(joined.get(&ecx).is_none(), "a location only some predecessors define must not survive the join");
    }

    #[test]
    fn running_dataflow_twice_is_idempotent() {
        let mut block = BasicBlock::new(Some(0));
        block
            .push_back(Statement::from_instruction(
                StatementKind::Assignment {
                    left: Box::new(Term::location(eax())),
                    right: Box::new(Term::constant(7, 32)),
                },
                0,
            ))
            .unwrap();
        block.push_back(Statement::new(StatementKind::Halt)).unwrap();
        let function = Function::new("f".into(), Some(0), block);
        let cancel = CancellationToken::new();

        let first = analyze(&function, &cancel).unwrap();
        let second = analyze(&function, &cancel).unwrap();
        assert_eq!(first.reaching_at_exit(function.entry()), second.reaching_at_exit(function.entry()));
    }
}
