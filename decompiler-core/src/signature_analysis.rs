//! Signature analyzer (§4.6, component F): cross-function argument and
//! return-value inference, iterated to fixpoint over callee ids.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use decompiler_types::MemoryLocation;

use crate::callee::CalleeId;
use crate::convention::Convention;
use crate::dataflow::DataflowResult;
use crate::function::{Function, FunctionId};
use crate::jump::{JumpKind, JumpTarget};
use crate::signature::{CallSignature, CallSiteId, FunctionSignature, Signatures};
use crate::statement::StatementKind;
use crate::term::{AccessRole, IntrinsicKind, Term};

/// One referring function's evidence for a callee id: its own undefined uses
/// restricted to argument-candidate locations (§4.6 step 1), and, per call
/// site targeting that callee, the locations read by the call hook with no
/// definition surviving to the snapshot (§4.6 step 1/2 simplified: this
/// crate's call hook always installs a snapshot, so "live at call entry but
/// not defined after" reduces to "undefined at the call site itself").
///
/// `return_votes` and `own_return_votes` are the two pools §4.6's
/// return-value poll draws from: the former is every call site's own
/// consumption of a convention return-value candidate after the call
/// (weighted by the bits actually read); the latter, populated only for a
/// function's own callee id, is that function's return jumps' reaching
/// definitions of each candidate (the fallback pool, polled when no caller
/// consumes anything).
struct Evidence {
    function_undefined_uses: HashSet<MemoryLocation>,
    call_site_candidates: Vec<(CallSiteId, HashSet<MemoryLocation>)>,
    return_votes: HashMap<MemoryLocation, u32>,
    own_return_votes: HashMap<MemoryLocation, u32>,
}

impl Evidence {
    fn empty() -> Self {
        Self {
            function_undefined_uses: HashSet::new(),
            call_site_candidates: Vec::new(),
            return_votes: HashMap::new(),
            own_return_votes: HashMap::new(),
        }
    }
}

fn merge_votes(into: &mut HashMap<MemoryLocation, u32>, from: HashMap<MemoryLocation, u32>) {
    for (loc, weight) in from {
        *into.entry(loc).or_insert(0) += weight;
    }
}

/// Votes cast by reads following one call, up to (not including) the next
/// call in the same block: each read of a location covered by a
/// convention-candidate return location is a vote for that candidate,
/// weighted by the bits the read actually consumes.
fn call_return_votes(convention: &Convention, block: &crate::block::BasicBlock, call_index: usize) -> HashMap<MemoryLocation, u32> {
    let mut votes = HashMap::new();
    for statement in block.statements().iter().skip(call_index + 1) {
        if matches!(statement.kind, StatementKind::Call { .. }) {
            break;
        }
        statement.visit_term_roles(|term, role| {
            if role != AccessRole::Read {
                return;
            }
            let Some(loc) = term.declared_location() else { return };
            for candidate in convention.return_values() {
                if let Some(candidate_loc) = candidate.declared_location() {
                    if candidate_loc.covers(&loc) {
                        *votes.entry(candidate_loc).or_insert(0) += loc.bit_size();
                    }
                }
            }
        });
    }
    votes
}

/// Fallback votes for a function's own return value: for every block ending
/// in a return jump, whether each convention-candidate return location has a
/// reaching definition at that point — "this function wrote it before
/// returning," even though no caller was found to consume it.
fn own_return_votes(function: &Function, dataflow: &DataflowResult, convention: &Convention) -> HashMap<MemoryLocation, u32> {
    let mut votes = HashMap::new();
    for (block_id, block) in function.blocks() {
        let Some(last) = block.statements().last() else { continue };
        let StatementKind::Jump(JumpKind::Unconditional(JumpTarget::Address(target))) = &last.kind else {
            continue;
        };
        if !matches!(**target, Term::Intrinsic { kind: IntrinsicKind::ReturnAddress, .. }) {
            continue;
        }
        let Some(reaching) = dataflow.reaching_at_exit(block_id) else { continue };
        for candidate in convention.return_values() {
            if let Some(loc) = candidate.declared_location() {
                if !reaching.project(loc).is_empty() {
                    *votes.entry(loc).or_insert(0) += loc.bit_size();
                }
            }
        }
    }
    votes
}

/// §4.6's return-value poll: the highest-voted candidate wins; ties favor
/// whichever candidate `convention.return_values()` declares first.
fn classify_return_value(convention: &Convention, votes: &HashMap<MemoryLocation, u32>) -> Option<Rc<Term>> {
    let mut best: Option<(u32, &Rc<Term>)> = None;
    for candidate in convention.return_values() {
        let Some(loc) = candidate.declared_location() else { continue };
        let Some(&weight) = votes.get(&loc) else { continue };
        if weight == 0 {
            continue;
        }
        if best.map(|(best_weight, _)| weight > best_weight).unwrap_or(true) {
            best = Some((weight, candidate));
        }
    }
    best.map(|(_, candidate)| candidate.clone())
}

fn collect_evidence(
    functions: &[(FunctionId, &Function)],
    dataflows: &HashMap<FunctionId, DataflowResult>,
    convention: &Convention,
    resolve_callee: impl Fn(&Term) -> CalleeId,
) -> HashMap<CalleeId, Evidence> {
    let mut by_callee: HashMap<CalleeId, Evidence> = HashMap::new();

    for &(function_id, function) in functions {
        let Some(dataflow) = dataflows.get(&function_id) else { continue };

        // This function's own undefined uses become evidence for *its own*
        // callee id (it is itself a referrer of its own signature via every
        // caller that targets it — §4.6 "defining functions (by entry
        // address)").
        let own_callee = function.entry_address().map(CalleeId::EntryAddress).unwrap_or(CalleeId::Invalid);
        let own_candidates: HashSet<MemoryLocation> = dataflow
            .undefined_uses
            .values()
            .filter_map(|loc| convention.get_argument_location_covering(*loc))
            .collect();
        let own_votes = own_return_votes(function, dataflow, convention);
        let own_evidence = by_callee.entry(own_callee).or_insert_with(Evidence::empty);
        own_evidence.function_undefined_uses.extend(own_candidates);
        merge_votes(&mut own_evidence.own_return_votes, own_votes);

        for (block_id, block) in function.blocks() {
            for (index, statement) in block.statements().iter().enumerate() {
                let StatementKind::Call { target } = &statement.kind else { continue };
                let callee = resolve_callee(target);
                let call_site = CallSiteId {
                    function: function_id,
                    block: block_id,
                    statement_index: index,
                };

                // Locations the call hook read (the callee's candidate
                // argument registers/stack slots) that had no reaching
                // definition at the call: this call's evidence for the
                // callee's formal argument list.
                let mut candidates = HashSet::new();
                if let Some(snapshot) = dataflow.snapshots.get(&(block_id, index)) {
                    for group in convention.argument_groups() {
                        for argument in group.arguments() {
                            let loc = argument.canonical();
                            if snapshot.project(loc).is_empty() {
                                candidates.insert(loc);
                            }
                        }
                    }
                }

                let votes = call_return_votes(convention, block, index);
                let call_evidence = by_callee.entry(callee).or_insert_with(Evidence::empty);
                call_evidence.call_site_candidates.push((call_site, candidates));
                merge_votes(&mut call_evidence.return_votes, votes);
            }
        }
    }

    by_callee
}

/// §4.6 step 3: classify this callee's argument locations from the
/// aggregated evidence, returning the agreed locations and, per call site,
/// any extra (non-formal) argument locations it supplies beyond them.
fn classify_arguments(evidence: &Evidence) -> (Vec<MemoryLocation>, HashMap<CallSiteId, Vec<MemoryLocation>>) {
    if !evidence.function_undefined_uses.is_empty() {
        let formal: HashSet<MemoryLocation> = evidence.function_undefined_uses.clone();
        let extras = extra_arguments_by_site(evidence, &formal);
        return (formal.into_iter().collect(), extras);
    }

    // No function body evidence (e.g. an unresolved or external callee):
    // an argument is formal iff every call site agrees on it.
    if evidence.call_site_candidates.is_empty() {
        return (Vec::new(), HashMap::new());
    }
    let mut common: Option<HashSet<MemoryLocation>> = None;
    for (_, candidates) in &evidence.call_site_candidates {
        common = Some(match common {
            Some(existing) => existing.intersection(candidates).copied().collect(),
            None => candidates.clone(),
        });
    }
    let formal = common.unwrap_or_default();
    let extras = extra_arguments_by_site(evidence, &formal);

    (formal.into_iter().collect(), extras)
}

/// Per call site, the candidate locations it supplies that aren't in
/// `formal` — evidence of a variadic call (§4.6 step 3) and the raw material
/// for that call's `extra_arguments`.
fn extra_arguments_by_site(evidence: &Evidence, formal: &HashSet<MemoryLocation>) -> HashMap<CallSiteId, Vec<MemoryLocation>> {
    let mut extras = HashMap::new();
    for (site, candidates) in &evidence.call_site_candidates {
        let mut extra: Vec<MemoryLocation> = candidates.iter().filter(|c| !formal.contains(c)).copied().collect();
        if !extra.is_empty() {
            extra.sort();
            extras.insert(*site, extra);
        }
    }
    extras
}

/// Runs signature analysis to fixpoint (§4.6), capped at `max_iterations`
/// full passes (§4.6: "A bounded iteration ceiling (≥ 3 passes)").
pub fn analyze(
    functions: &[(FunctionId, &Function)],
    dataflows: &HashMap<FunctionId, DataflowResult>,
    convention: &Convention,
    resolve_callee: impl Fn(&Term) -> CalleeId,
    max_iterations: u32,
) -> Result<Signatures, crate::error::DecompilerError> {
    let mut signatures = Signatures::new();
    let mut iterations = 0;

    loop {
        if iterations >= max_iterations {
            return Err(crate::error::DecompilerError::SignatureFixpointExceeded { iterations });
        }
        iterations += 1;

        let evidence = collect_evidence(functions, dataflows, convention, &resolve_callee);
        let mut changed = false;

        for (callee, ev) in &evidence {
            let (mut locations, extra_by_site) = classify_arguments(ev);
            locations = convention.sort_arguments(&locations);

            let arguments: Vec<Rc<Term>> = locations.into_iter().map(|loc| Rc::new(Term::location(loc))).collect();
            let is_variadic = !extra_by_site.is_empty();

            // §4.6 step 4: poll callers' consumption of a return-value
            // candidate first; if nothing used it, fall back to polling this
            // function's own return jumps for an unused write.
            let return_value =
                classify_return_value(convention, &ev.return_votes).or_else(|| classify_return_value(convention, &ev.own_return_votes));

            let previous = signatures.signature_of(*callee).cloned();
            let new_signature = FunctionSignature {
                arguments: arguments.clone(),
                variadic: is_variadic,
                return_value: return_value.clone(),
            };

            if previous.as_deref() != Some(&new_signature) {
                changed = true;
            }
            signatures.set_signature(*callee, new_signature);
            if is_variadic {
                signatures.mark_variadic(*callee);
            }

            for (site, _) in &ev.call_site_candidates {
                let extra_arguments = extra_by_site
                    .get(site)
                    .map(|locs| locs.iter().map(|loc| Rc::new(Term::location(*loc))).collect())
                    .unwrap_or_default();
                let call_signature = CallSignature {
                    arguments: arguments.clone(),
                    extra_arguments,
                    return_value: return_value.clone(),
                };
                signatures.set_call_signature(*site, call_signature);
            }
        }

        if !changed {
            return Ok(signatures);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BasicBlock;
    use crate::convention::x86_64_sysv;
    use crate::dataflow;
    use crate::statement::Statement;
    use decompiler_types::Domain;

    fn rdi() -> MemoryLocation {
        MemoryLocation::new(Domain::register(crate::convention::x86_register_index::RDI), 0, 64)
    }

    #[test]
    fn function_reading_undefined_rdi_infers_it_as_argument() {
        let convention = x86_64_sysv();
        let mut block = BasicBlock::new(Some(0x100));
        block
            .push_back(Statement::from_instruction(
                StatementKind::Touch {
                    term: Box::new(Term::location(rdi())),
                    role: crate::term::AccessRole::Read,
                },
                0x100,
            ))
            .unwrap();
        block.push_back(Statement::new(StatementKind::Halt)).unwrap();
        let function = Function::new("f".into(), Some(0x100), block);
        let cancel = crate::cancel::CancellationToken::new();
        let dataflow_result = dataflow::analyze(&function, &cancel).unwrap();

        let mut dataflows = HashMap::new();
        dataflows.insert(FunctionId(0), dataflow_result);
        let functions = vec![(FunctionId(0), &function)];

        let signatures = analyze(&functions, &dataflows, &convention, |_| CalleeId::Invalid, 4).unwrap();
        let signature = signatures.signature_of(CalleeId::EntryAddress(0x100)).expect("signature inferred");
        assert_eq!(signature.arguments.len(), 1);
        assert_eq!(signature.arguments[0].declared_location(), Some(rdi()));
    }

    fn rax64() -> MemoryLocation {
        MemoryLocation::new(Domain::register(crate::convention::x86_register_index::RAX), 0, 64)
    }

    #[test]
    fn call_consuming_rax_infers_it_as_the_callees_return_value() {
        let convention = x86_64_sysv();
        let mut block = BasicBlock::new(Some(0x100));
        block
            .push_back(Statement::from_instruction(
                StatementKind::Call {
                    target: Box::new(Term::constant(0x200, 64)),
                },
                0x100,
            ))
            .unwrap();
        block
            .push_back(Statement::from_instruction(
                StatementKind::Touch {
                    term: Box::new(Term::location(rax64())),
                    role: AccessRole::Read,
                },
                0x104,
            ))
            .unwrap();
        block.push_back(Statement::new(StatementKind::Halt)).unwrap();
        let function = Function::new("caller".into(), Some(0x100), block);
        let cancel = crate::cancel::CancellationToken::new();
        let dataflow_result = dataflow::analyze(&function, &cancel).unwrap();

        let mut dataflows = HashMap::new();
        dataflows.insert(FunctionId(0), dataflow_result);
        let functions = vec![(FunctionId(0), &function)];

        let callee = CalleeId::EntryAddress(0x200);
        let signatures = analyze(&functions, &dataflows, &convention, move |_| callee, 4).unwrap();

        let signature = signatures.signature_of(callee).expect("callee signature inferred");
        assert_eq!(signature.return_value.as_ref().and_then(|t| t.declared_location()), Some(rax64()));

        let call_site = CallSiteId {
            function: FunctionId(0),
            block: function.block_ids().next().unwrap(),
            statement_index: 0,
        };
        let call_signature = signatures.call_signature(call_site).expect("call signature recorded");
        assert_eq!(
            call_signature.return_value.as_ref().and_then(|t| t.declared_location()),
            Some(rax64()),
            "a call's return value mirrors its callee's"
        );
    }

    #[test]
    fn classify_arguments_reports_a_call_sites_extra_argument() {
        let rsi = MemoryLocation::new(Domain::register(crate::convention::x86_register_index::RSI), 0, 64);
        let agreeing_site = CallSiteId {
            function: FunctionId(0),
            block: crate::block::BlockId(0),
            statement_index: 1,
        };
        let extra_site = CallSiteId {
            function: FunctionId(1),
            block: crate::block::BlockId(0),
            statement_index: 2,
        };

        let evidence = Evidence {
            function_undefined_uses: HashSet::new(),
            call_site_candidates: vec![
                (agreeing_site, HashSet::from([rdi()])),
                (extra_site, HashSet::from([rdi(), rsi])),
            ],
            return_votes: HashMap::new(),
            own_return_votes: HashMap::new(),
        };

        let (formal, extra_by_site) = classify_arguments(&evidence);
        assert_eq!(formal, vec![rdi()], "only rdi is common to every call site");
        assert!(extra_by_site.get(&agreeing_site).is_none(), "the agreeing call has no extra");
        assert_eq!(extra_by_site.get(&extra_site), Some(&vec![rsi]));
    }
}
