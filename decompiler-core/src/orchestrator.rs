//! Pipeline orchestrator (§4.10, component J): sequences partitioning,
//! hook installation, per-function dataflow, signature analysis, and
//! structural/variable recovery, re-running affected functions as
//! signatures firm up.
//!
//! Design Notes §9 calls for callback-based hooks reconsidered on every
//! dataflow execution (`Statement::Callback`, `hooks::CallbackRegistry`).
//! This orchestrator instead reinstalls hooks directly between rounds: a
//! function's entry/call/return patches are fully removed and rebuilt from
//! the latest [`Signatures`] each time signature analysis changes them, then
//! dataflow re-runs. `CallbackRegistry` remains available to a caller that
//! wants hooks to react mid-analysis; nothing here requires it, since a
//! round boundary is a cheaper, equally correct place to re-decide them for
//! this crate's bounded-iteration pipeline (recorded as an Open Question
//! resolution).

use std::collections::HashMap;
use std::rc::Rc;

use decompiler_types::{Address, Domain, MemoryLocation};

use rayon::prelude::*;

use crate::block::BlockId;
use crate::builder;
use crate::callee::CalleeId;
use crate::convention::Convention;
use crate::dataflow::{self, DataflowResult};
use crate::cancel::CancellationToken;
use crate::error::DecompilerError;
use crate::function::{Function, FunctionId};
use crate::hooks::{build_call_hook, build_entry_hook, build_return_hook, Patch};
use crate::jump::{JumpKind, JumpTarget};
use crate::partition;
use crate::program::Program;
use crate::regions::{self, RegionTree};
use crate::signature::{CallSignature, CallSiteId, FunctionSignature, Signatures};
use crate::signature_analysis;
use crate::statement::StatementKind;
use crate::term::{IntrinsicKind, Term};
use crate::variables::{self, TermObservation, Variable};

/// Tunables for one orchestrator run (§9 Design Notes).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Ceiling on outer rounds (hook reinstall + dataflow + signature
    /// analysis); exceeding it without converging is reported, not panicked
    /// (§7 "Fixpoint non-termination").
    pub max_rounds: u32,
    /// Ceiling signature analysis itself is allowed per round (§4.6).
    pub max_signature_iterations: u32,
    /// x86-64: append an explicit zero of a GPR's upper 32 bits after every
    /// 32-bit write to it, matching hardware's implicit behavior (§8
    /// scenario 5).
    pub patch_x86_64_implicit_zero_extend: bool,
    /// Size of the `rayon` thread pool used for per-function dataflow; `None`
    /// uses the global pool.
    pub thread_pool_size: Option<usize>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_rounds: 8,
            max_signature_iterations: 8,
            patch_x86_64_implicit_zero_extend: false,
            thread_pool_size: None,
        }
    }
}

/// One function's finished analysis results.
pub struct DecompiledFunction {
    pub id: FunctionId,
    pub function: Function,
    pub dataflow: DataflowResult,
    pub regions: RegionTree,
    pub variables: Vec<Variable>,
}

/// The orchestrator's output: every function plus the converged signature set.
pub struct DecompiledProgram {
    pub functions: Vec<DecompiledFunction>,
    pub signatures: Signatures,
}

/// Runs the full pipeline over an already-built [`Program`] (§4.10 steps
/// 2-8; step 1, program construction from a decoder stream, is the caller's
/// job via [`crate::builder`]).
pub fn run(
    program: &Program,
    convention: &Convention,
    resolve_callee: impl Fn(&Term) -> CalleeId + Sync,
    cancel: &CancellationToken,
    config: &OrchestratorConfig,
) -> Result<DecompiledProgram, DecompilerError> {
    // Jump targets arrive from the lifter as computed addresses; resolve the
    // statically known ones to block pointers before partitioning, which
    // only follows block-typed targets (§4.3, §3 jump-target invariant).
    let mut program = program.clone();
    builder::resolve_jump_targets(&mut program);

    // §8 boundary: an empty function is dropped rather than carried through
    // the rest of the pipeline.
    let mut functions: Vec<Function> = partition::partition(&program).into_iter().filter(|f| !f.is_empty()).collect();

    if config.patch_x86_64_implicit_zero_extend {
        for function in &mut functions {
            apply_x86_64_zero_extend_patch(function);
        }
    }

    let mut installed: Vec<HashMap<BlockId, Vec<Patch>>> = functions.iter().map(|_| HashMap::new()).collect();
    let mut signatures = Signatures::new();

    let pool = config
        .thread_pool_size
        .map(|size| rayon::ThreadPoolBuilder::new().num_threads(size).build().expect("thread pool builds"));

    let run_dataflows = |functions: &[Function]| -> Result<HashMap<FunctionId, DataflowResult>, DecompilerError> {
        let compute = || -> Result<Vec<(FunctionId, DataflowResult)>, DecompilerError> {
            functions
                .par_iter()
                .enumerate()
                .map(|(index, function)| {
                    cancel.poll()?;
                    Ok((FunctionId(index), dataflow::analyze(function, cancel)?))
                })
                .collect()
        };
        let results = match &pool {
            Some(pool) => pool.install(compute),
            None => compute(),
        }?;
        Ok(results.into_iter().collect())
    };

    for index in 0..functions.len() {
        reinstall_hooks(&mut functions[index], &mut installed[index], FunctionId(index), convention, &signatures);
    }
    let mut dataflows = run_dataflows(&functions)?;

    let mut round = 0;
    loop {
        cancel.poll()?;
        if round >= config.max_rounds {
            return Err(DecompilerError::SignatureFixpointExceeded { iterations: round });
        }
        round += 1;

        let refs: Vec<(FunctionId, &Function)> = functions.iter().enumerate().map(|(i, f)| (FunctionId(i), f)).collect();
        let new_signatures = signature_analysis::analyze(&refs, &dataflows, convention, &resolve_callee, config.max_signature_iterations)?;

        let callees: Vec<CalleeId> = signatures.callees().chain(new_signatures.callees()).collect();
        let converged = callees
            .iter()
            .all(|&callee| signature_as_ref(&signatures, callee) == signature_as_ref(&new_signatures, callee));
        signatures = new_signatures;

        if converged {
            break;
        }

        for index in 0..functions.len() {
            reinstall_hooks(&mut functions[index], &mut installed[index], FunctionId(index), convention, &signatures);
        }
        dataflows = run_dataflows(&functions)?;
    }

    let mut results = Vec::with_capacity(functions.len());
    for (index, function) in functions.into_iter().enumerate() {
        let id = FunctionId(index);
        let dataflow = dataflows.remove(&id).unwrap_or_default();
        let regions = regions::reduce(&function);
        let variables = recover_function_variables(id, &function, &dataflow);
        results.push(DecompiledFunction {
            id,
            function,
            dataflow,
            regions,
            variables,
        });
    }

    Ok(DecompiledProgram { functions: results, signatures })
}

fn signature_as_ref(signatures: &Signatures, callee: CalleeId) -> Option<&FunctionSignature> {
    signatures.signature_of(callee).map(|rc| rc.as_ref())
}

/// A hook site discovered in a pristine (not-yet-patched) block.
enum Site {
    Call { index: usize, instruction: Option<Address> },
    Return { index: usize },
    Entry,
}

impl Site {
    /// The index a patch for this site is spliced in after.
    fn anchor(&self) -> usize {
        match self {
            Site::Call { index, .. } => *index,
            Site::Return { index } => index.saturating_sub(1),
            Site::Entry => 0,
        }
    }
}

/// Removes every previously installed patch from `function`'s blocks (in
/// exact reverse installation order, so each removal un-shifts the next —
/// see the module docs), then rebuilds entry/call/return patches from
/// `signatures` and reinstalls them (descending-anchor order, so each
/// installation never invalidates an anchor not yet processed).
///
/// A call site's [`CallSiteId`] is keyed by its live statement index, which
/// shifts every time a patch is installed or removed — `signature_analysis`
/// computed its `CallSiteId`s against the block layout this function had
/// *before* this round's patches are removed below. So the lookup into
/// `signatures` happens first, against that still-installed layout, and is
/// then carried across the remove/rebuild by the call statement's own
/// instruction address, which hook patches never disturb.
fn reinstall_hooks(
    function: &mut Function,
    installed: &mut HashMap<BlockId, Vec<Patch>>,
    function_id: FunctionId,
    convention: &Convention,
    signatures: &Signatures,
) {
    let mut call_signatures_by_address: HashMap<Address, Rc<CallSignature>> = HashMap::new();
    for (block_id, block) in function.blocks() {
        for (index, statement) in block.statements().iter().enumerate() {
            let (StatementKind::Call { .. }, Some(instruction)) = (&statement.kind, statement.instruction()) else {
                continue;
            };
            let call_site = CallSiteId {
                function: function_id,
                block: block_id,
                statement_index: index,
            };
            if let Some(signature) = signatures.call_signature(call_site) {
                call_signatures_by_address.insert(instruction, signature.clone());
            }
        }
    }

    for (block_id, patches) in installed.iter_mut() {
        for patch in patches.iter_mut().rev() {
            patch.remove(function.block_mut(*block_id));
        }
    }
    installed.clear();

    let own_callee = function.entry_address().map(CalleeId::EntryAddress).unwrap_or(CalleeId::Invalid);
    let own_signature = signature_as_ref(signatures, own_callee);

    let block_ids: Vec<BlockId> = function.block_ids().collect();
    for block_id in block_ids {
        let mut sites: Vec<Site> = function
            .block(block_id)
            .statements()
            .iter()
            .enumerate()
            .filter_map(|(index, statement)| match &statement.kind {
                StatementKind::Call { .. } => Some(Site::Call {
                    index,
                    instruction: statement.instruction(),
                }),
                StatementKind::Jump(JumpKind::Unconditional(JumpTarget::Address(address))) if is_return_address(address) => {
                    Some(Site::Return { index })
                }
                _ => None,
            })
            .collect();
        sites.sort_by_key(|site| std::cmp::Reverse(site.anchor()));
        if block_id == function.entry() {
            sites.push(Site::Entry);
        }

        let mut block_patches = Vec::new();
        for site in sites {
            let anchor = site.anchor();
            let mut patch = match site {
                Site::Entry => build_entry_hook(convention, own_signature),
                Site::Return { .. } => build_return_hook(convention, own_signature),
                Site::Call { instruction, .. } => {
                    let call_signature = instruction.and_then(|address| call_signatures_by_address.get(&address));
                    let stack_argument_size = call_signature.and_then(|s| stack_argument_size_of(convention, s));
                    build_call_hook(convention, call_signature.map(|rc| rc.as_ref()), stack_argument_size)
                }
            };
            patch.insert_after(function.block_mut(block_id), anchor);
            block_patches.push(patch);
        }
        if !block_patches.is_empty() {
            installed.insert(block_id, block_patches);
        }
    }
}

/// Whether `term` is the return-address placeholder [`lifter::lift_ret`]
/// emits — the only signal available for "this jump is a return" without a
/// modeled flags/frame state (§4.4 `is_classified_as_return`).
fn is_return_address(term: &Term) -> bool {
    matches!(term, Term::Intrinsic { kind: IntrinsicKind::ReturnAddress, .. })
}

/// Total stack-passed argument span, in bytes, for a call hook's
/// callee-cleanup adjustment (§4.4).
fn stack_argument_size_of(convention: &Convention, call_signature: &CallSignature) -> Option<u32> {
    let first_offset = convention.first_argument_offset();
    let mut max_end = first_offset;
    let mut any = false;
    for argument in call_signature.all_arguments() {
        if let Some(location) = argument.declared_location() {
            if location.domain() == Domain::STACK {
                any = true;
                max_end = max_end.max(location.end_offset());
            }
        }
    }
    any.then(|| ((max_end - first_offset) / 8) as u32)
}

fn recover_function_variables(id: FunctionId, function: &Function, dataflow: &DataflowResult) -> Vec<Variable> {
    let mut observations: Vec<TermObservation> = Vec::new();
    for (_, block) in function.blocks() {
        for statement in block.statements() {
            statement.visit_term_roles(|term, _role| {
                if let Some(location) = dataflow.location_of(term) {
                    observations.push(TermObservation {
                        term: term.id(),
                        location,
                        function: Some(id),
                    });
                }
            });
        }
    }
    variables::recover_variables(&observations)
}

/// x86-64 implicit zero-extend patch (§8 scenario 5): a 32-bit write to a
/// GPR's low half also zeroes its upper 32 bits on real hardware; this crate
/// doesn't model that implicitly, so the patch appends an explicit
/// assignment after every matching write.
fn apply_x86_64_zero_extend_patch(function: &mut Function) {
    for block_id in function.block_ids().collect::<Vec<_>>() {
        let mut insertions: Vec<usize> = function
            .block(block_id)
            .statements()
            .iter()
            .enumerate()
            .filter_map(|(index, statement)| match &statement.kind {
                StatementKind::Assignment { left, .. } if is_32_bit_gpr_write(left) => Some(index),
                _ => None,
            })
            .collect();
        insertions.sort_unstable_by(|a, b| b.cmp(a));
        for index in insertions {
            let block = function.block_mut(block_id);
            let StatementKind::Assignment { left, .. } = &block.statements()[index].kind else {
                unreachable!("index was filtered for an Assignment above");
            };
            let Term::MemoryLocationAccess(location) = left.as_ref() else {
                unreachable!("index was filtered by is_32_bit_gpr_write, which only matches this shape");
            };
            let upper = MemoryLocation::new(location.domain(), location.bit_offset() + 32, 32);
            let zero = crate::statement::Statement::new(StatementKind::Assignment {
                left: Box::new(Term::location(upper)),
                right: Box::new(Term::constant(0, 32)),
            });
            block.insert_after(index, zero);
        }
    }
}

fn is_32_bit_gpr_write(left: &Term) -> bool {
    let Term::MemoryLocationAccess(location) = left else { return false };
    let gpr_range = Domain::FIRST_REGISTER.0..=(Domain::FIRST_REGISTER.0 + 15);
    gpr_range.contains(&location.domain().0) && location.bit_offset() == 0 && location.bit_size() == 32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BasicBlock;
    use crate::convention::x86_64_sysv;
    use crate::statement::Statement;
    use decompiler_types::Domain;

    fn eax() -> MemoryLocation {
        MemoryLocation::new(Domain::register(0), 0, 32)
    }

    #[test]
    fn zero_extend_patch_appends_upper_half_clear() {
        let mut block = BasicBlock::new(Some(0));
        block
            .push_back(Statement::from_instruction(
                StatementKind::Assignment {
                    left: Box::new(Term::location(eax())),
                    right: Box::new(Term::constant(1, 32)),
                },
                0,
            ))
            .unwrap();
        block.push_back(Statement::new(StatementKind::Halt)).unwrap();
        let mut function = Function::new("f".into(), Some(0), block);

        apply_x86_64_zero_extend_patch(&mut function);

        let statements = function.block(function.entry()).statements();
        assert_eq!(statements.len(), 3);
        let StatementKind::Assignment { left, right } = &statements[1].kind else {
            panic!("expected the inserted zero-upper assignment")
        };
        assert_eq!(**left, Term::location(MemoryLocation::new(Domain::register(0), 32, 32)));
        assert_eq!(**right, Term::constant(0, 32));
    }

    #[test]
    fn run_on_a_single_block_function_converges_and_recovers_it() {
        let mut block = BasicBlock::new(Some(0x100));
        block.push_back(Statement::from_instruction(StatementKind::Halt, 0x100)).unwrap();
        let mut program = Program::new();
        program.add_block(block);

        let convention = x86_64_sysv();
        let cancel = CancellationToken::new();
        let config = OrchestratorConfig::default();
        let result = run(&program, &convention, |_| CalleeId::Invalid, &cancel, &config).unwrap();

        assert_eq!(result.functions.len(), 1);
    }
}
