//! CFG structural analyzer (§4.8, component H): reduces a function's control
//! flow into a tree of regions for structured emission.

use std::collections::{HashMap, HashSet};

use crate::block::BlockId;
use crate::function::Function;
use crate::jump::{JumpKind, JumpTarget};
use crate::statement::StatementKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub usize);

/// How two sub-conditions of a compound condition combine (§4.8: "inspect
/// the first sub-condition's successors ... AND if the shared exit is the
/// else-branch, OR otherwise").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionKind {
    /// A single, unreduced basic block.
    Basic(BlockId),
    /// Heterogeneous leftovers, emitted via DFS preordering with gotos.
    Unknown(Vec<RegionId>),
    /// A straight-line sequence.
    Block(Vec<RegionId>),
    CompoundCondition { left: RegionId, right: RegionId, op: BoolOp },
    IfThen { condition: RegionId, body: RegionId },
    IfThenElse { condition: RegionId, then_branch: RegionId, else_branch: RegionId },
    /// An endless loop (no recognizable pre/post test).
    Loop { body: RegionId },
    /// Pre-test loop: condition, then body, with an external exit.
    While { condition: RegionId, body: RegionId },
    /// Post-test loop: body, then condition.
    DoWhile { body: RegionId, condition: RegionId },
    Switch {
        bound_check: RegionId,
        dispatch: RegionId,
        cases: Vec<(u64, RegionId)>,
        default: Option<RegionId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub kind: RegionKind,
}

/// The reduced region tree for one function: an arena plus the id of the
/// single remaining root region once reduction halts.
#[derive(Debug, Clone)]
pub struct RegionTree {
    /// Indexed directly by `RegionId`; entries consumed by a composite
    /// parent during reduction are never removed (their slot would shift
    /// every other id), merely no longer reachable except through that
    /// parent's own fields.
    regions: Vec<Option<Region>>,
    pub root: RegionId,
}

impl RegionTree {
    pub fn region(&self, id: RegionId) -> &Region {
        self.regions[id.0].as_ref().expect("region id still present in the tree")
    }
}

struct Graph {
    regions: Vec<Option<Region>>,
    successors: HashMap<RegionId, Vec<RegionId>>,
    predecessors: HashMap<RegionId, Vec<RegionId>>,
    /// Nodes still participating in the reduction graph. A region absorbed
    /// into a composite parent via [`store_kind`] stays in `regions` (the
    /// tree still references it by id) but drops out of `top_level`, so it
    /// no longer counts toward "fully reduced" or gets visited as a graph
    /// node in its own right.
    top_level: HashSet<RegionId>,
}

impl Graph {
    fn push(&mut self, kind: RegionKind) -> RegionId {
        let id = RegionId(self.regions.len());
        self.regions.push(Some(Region { kind }));
        self.successors.insert(id, Vec::new());
        self.predecessors.insert(id, Vec::new());
        self.top_level.insert(id);
        id
    }

    fn remove(&mut self, id: RegionId) {
        self.regions[id.0] = None;
        self.top_level.remove(&id);
        for old_succ in self.successors.remove(&id).into_iter().flatten() {
            if let Some(preds) = self.predecessors.get_mut(&old_succ) {
                preds.retain(|&p| p != id);
            }
        }
        for (_, preds) in self.predecessors.iter_mut() {
            preds.retain(|&p| p != id);
        }
    }

    fn live_ids(&self) -> Vec<RegionId> {
        let mut ids: Vec<RegionId> = self.top_level.iter().copied().collect();
        ids.sort_by_key(|id| id.0);
        ids
    }

    fn successors_of(&self, id: RegionId) -> &[RegionId] {
        self.successors.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn predecessors_of(&self, id: RegionId) -> &[RegionId] {
        self.predecessors.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Reduces `function`'s CFG into a [`RegionTree`] (§4.8).
pub fn reduce(function: &Function) -> RegionTree {
    let mut graph = Graph {
        regions: Vec::new(),
        successors: HashMap::new(),
        predecessors: HashMap::new(),
        top_level: HashSet::new(),
    };

    let mut block_to_region: HashMap<BlockId, RegionId> = HashMap::new();
    for (block_id, _) in function.blocks() {
        let id = graph.push(RegionKind::Basic(block_id));
        block_to_region.insert(block_id, id);
    }
    for (block_id, block) in function.blocks() {
        let from = block_to_region[&block_id];
        let mut succs = Vec::new();
        for statement in block.statements() {
            if let StatementKind::Jump(kind) = &statement.kind {
                for target in kind.targets() {
                    if let Some(target_block) = target.block() {
                        succs.push(block_to_region[&target_block]);
                    }
                }
            }
        }
        graph.successors.insert(from, succs.clone());
        for succ in succs {
            graph.predecessors.entry(succ).or_default().push(from);
        }
    }

    let entry_region = block_to_region[&function.entry()];

    loop {
        if try_reduce_switch(&mut graph, function) {
            continue;
        }
        if try_reduce_sequence(&mut graph) {
            continue;
        }
        if try_reduce_while(&mut graph) {
            continue;
        }
        if try_reduce_compound_condition(&mut graph) {
            continue;
        }
        if try_reduce_conditional(&mut graph) {
            continue;
        }
        if try_reduce_loop(&mut graph) {
            continue;
        }
        break;
    }

    let live = graph.live_ids();
    let root = if live.len() == 1 {
        live[0]
    } else {
        // Un-reducible leftovers: fold into one UNKNOWN region, DFS-ordered
        // from the entry (§4.8).
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![entry_region];
        while let Some(id) = stack.pop() {
            if graph.regions[id.0].is_none() || !seen.insert(id) {
                continue;
            }
            order.push(id);
            stack.extend(graph.successors_of(id).iter().rev().copied());
        }
        for &id in &live {
            if !order.contains(&id) {
                order.push(id);
            }
        }
        graph.push(RegionKind::Unknown(order))
    };

    RegionTree {
        regions: graph.regions,
        root,
    }
}

/// Sequence reduction: `a -> b` where `a` has exactly one successor `b` and
/// `b` has exactly one predecessor `a` (and `b != a`, ruling out self-loops).
fn try_reduce_sequence(graph: &mut Graph) -> bool {
    for id in graph.live_ids() {
        let succs = graph.successors_of(id).to_vec();
        if succs.len() != 1 {
            continue;
        }
        let succ = succs[0];
        if succ == id {
            continue;
        }
        if graph.predecessors_of(succ) != [id] {
            continue;
        }
        // `succ` jumping straight back to `id` is a loop back edge, not a
        // straight-line sequence — leave it for try_reduce_while/try_reduce_loop.
        if graph.successors_of(succ).contains(&id) {
            continue;
        }
        let a_kind = graph.regions[id.0].take().unwrap().kind;
        let b_kind = graph.regions[succ.0].take().unwrap().kind;
        let mut members = match a_kind {
            RegionKind::Block(members) => members,
            other => vec![store_kind(graph, other)],
        };
        match b_kind {
            RegionKind::Block(more) => members.extend(more),
            other => members.push(store_kind(graph, other)),
        }
        let new_successors = graph.successors.remove(&succ).unwrap_or_default();
        graph.regions[id.0] = Some(Region { kind: RegionKind::Block(members) });
        graph.successors.insert(id, new_successors.clone());
        for s in &new_successors {
            graph.predecessors.entry(*s).or_default().push(id);
        }
        graph.remove(succ);
        return true;
    }
    false
}

/// Compound-condition reduction (§4.8): a two-way branch whose then- or
/// else-arm is itself a two-way branch sharing an exit with the outer one,
/// short-circuit style. `then` carries the inner test forward when the
/// outer's else-target is already the shared exit: `id && inner` (AND).
/// Symmetrically, the inner test sits behind the outer's else-arm when the
/// outer's then-target is the shared exit: `id || inner` (OR). Successor
/// order is `[then, else]`, preserved from how the CFG was built from each
/// block's `JumpKind::targets()`.
fn try_reduce_compound_condition(graph: &mut Graph) -> bool {
    for id in graph.live_ids() {
        let succs = graph.successors_of(id).to_vec();
        if succs.len() != 2 {
            continue;
        }
        let (then_branch, else_branch) = (succs[0], succs[1]);

        let attempt = if graph.predecessors_of(then_branch) == [id] {
            let inner_succs = graph.successors_of(then_branch).to_vec();
            (inner_succs.len() == 2 && inner_succs.contains(&else_branch))
                .then_some((then_branch, else_branch, BoolOp::And))
        } else {
            None
        }
        .or_else(|| {
            if graph.predecessors_of(else_branch) == [id] {
                let inner_succs = graph.successors_of(else_branch).to_vec();
                (inner_succs.len() == 2 && inner_succs.contains(&then_branch)).then_some((else_branch, then_branch, BoolOp::Or))
            } else {
                None
            }
        });

        let Some((inner, shared_exit, op)) = attempt else { continue };

        let new_successors: Vec<RegionId> = graph
            .successors_of(inner)
            .iter()
            .copied()
            .filter(|s| *s != shared_exit)
            .chain([shared_exit])
            .collect();
        let left_id = nest_header(graph, id);
        let right_id = nest_header(graph, inner);
        finish_conditional_merge(
            graph,
            id,
            RegionKind::CompoundCondition { left: left_id, right: right_id, op },
            new_successors,
            inner,
        );
        return true;
    }
    false
}

/// IF_THEN / IF_THEN_ELSE reduction: a region with two successors where both
/// branches converge at a common block, or one branch immediately is the
/// other's successor.
fn try_reduce_conditional(graph: &mut Graph) -> bool {
    for id in graph.live_ids() {
        let succs = graph.successors_of(id).to_vec();
        if succs.len() != 2 {
            continue;
        }
        let (then_branch, else_branch) = (succs[0], succs[1]);

        let then_succs = graph.successors_of(then_branch).to_vec();
        let else_succs = graph.successors_of(else_branch).to_vec();

        // IF_THEN: the else branch is itself the then branch's only successor.
        if then_succs == [else_branch] && graph.predecessors_of(then_branch) == [id] && !graph.predecessors_of(else_branch).is_empty() {
            let condition_id = nest_header(graph, id);
            let then_id = nest_header(graph, then_branch);
            finish_conditional_merge(graph, id, RegionKind::IfThen { condition: condition_id, body: then_id }, vec![else_branch], then_branch);
            return true;
        }
        if else_succs == [then_branch] && graph.predecessors_of(else_branch) == [id] {
            let condition_id = nest_header(graph, id);
            let else_id = nest_header(graph, else_branch);
            finish_conditional_merge(graph, id, RegionKind::IfThen { condition: condition_id, body: else_id }, vec![then_branch], else_branch);
            return true;
        }

        // IF_THEN_ELSE: both branches have exactly one predecessor (this
        // node) and converge at the same single successor.
        if graph.predecessors_of(then_branch) == [id]
            && graph.predecessors_of(else_branch) == [id]
            && then_succs.len() <= 1
            && else_succs.len() <= 1
            && then_succs == else_succs
        {
            let merge = then_succs.first().copied();
            let condition_id = nest_header(graph, id);
            let then_id = nest_header(graph, then_branch);
            let else_id = nest_header(graph, else_branch);
            let exits = merge.into_iter().collect();
            finish_conditional_merge(
                graph,
                id,
                RegionKind::IfThenElse {
                    condition: condition_id,
                    then_branch: then_id,
                    else_branch: else_id,
                },
                exits,
                then_branch,
            );
            graph.remove(else_branch);
            return true;
        }
    }
    false
}

fn store_kind(graph: &mut Graph, kind: RegionKind) -> RegionId {
    let id = RegionId(graph.regions.len());
    graph.regions.push(Some(Region { kind }));
    id
}

/// Moves a still-live region's current content into a fresh, non-top-level
/// slot and returns that slot's id — used when a node's own prior content
/// (its "header"/condition) becomes a child of the composite about to take
/// its place, so the composite never refers to its own region id.
fn nest_header(graph: &mut Graph, id: RegionId) -> RegionId {
    let kind = graph.regions[id.0].take().unwrap().kind;
    store_kind(graph, kind)
}

fn finish_conditional_merge(graph: &mut Graph, id: RegionId, new_kind: RegionKind, new_successors: Vec<RegionId>, consumed: RegionId) {
    graph.regions[id.0] = Some(Region { kind: new_kind });
    graph.successors.remove(&id);
    graph.successors.insert(id, new_successors.clone());
    for s in &new_successors {
        let preds = graph.predecessors.entry(*s).or_default();
        preds.retain(|&p| p != consumed);
        if !preds.contains(&id) {
            preds.push(id);
        }
    }
    graph.remove(consumed);
}

/// Loop reduction: a region that is its own ancestor with the back edge and
/// the test collapsed into a single node — post-test (DO_WHILE) when an
/// external exit survives, an endless LOOP otherwise. The pre-test (WHILE)
/// shape, with a distinct header and body, is recognized separately by
/// [`try_reduce_while`].
fn try_reduce_loop(graph: &mut Graph) -> bool {
    for id in graph.live_ids() {
        let succs = graph.successors_of(id).to_vec();
        if !succs.contains(&id) {
            continue;
        }
        let external_exits: Vec<RegionId> = succs.iter().copied().filter(|&s| s != id).collect();
        let body_kind = graph.regions[id.0].take().unwrap().kind;
        let body_id = store_kind(graph, body_kind);

        let new_kind = if external_exits.is_empty() {
            RegionKind::Loop { body: body_id }
        } else {
            RegionKind::DoWhile { body: body_id, condition: body_id }
        };

        graph.regions[id.0] = Some(Region { kind: new_kind });
        graph.successors.insert(id, external_exits.clone());
        for s in &external_exits {
            let preds = graph.predecessors.entry(*s).or_default();
            if !preds.contains(&id) {
                preds.push(id);
            }
        }
        return true;
    }
    false
}

/// Pre-test (WHILE) reduction: a header with two successors, one of which
/// (`body`) has no other predecessor and jumps back to the header
/// unconditionally, the other being the loop's exit.
fn try_reduce_while(graph: &mut Graph) -> bool {
    for id in graph.live_ids() {
        let succs = graph.successors_of(id).to_vec();
        if succs.len() != 2 {
            continue;
        }
        for (body, exit) in [(succs[0], succs[1]), (succs[1], succs[0])] {
            if body == id {
                continue;
            }
            if graph.successors_of(body) == [id] && graph.predecessors_of(body) == [id] {
                let condition_id = nest_header(graph, id);
                let body_id = nest_header(graph, body);
                finish_conditional_merge(
                    graph,
                    id,
                    RegionKind::While { condition: condition_id, body: body_id },
                    vec![exit],
                    body,
                );
                return true;
            }
        }
    }
    false
}

/// SWITCH recognition (§4.8): a conditional jump bounding an index
/// (`cmp`/`ja`-style) immediately followed by an unconditional jump carrying
/// a jump table.
fn try_reduce_switch(graph: &mut Graph, function: &Function) -> bool {
    for id in graph.live_ids() {
        let RegionKind::Basic(block_id) = graph.regions[id.0].as_ref().unwrap().kind.clone() else {
            continue;
        };
        let block = function.block(block_id);
        let Some(dispatch_statement) = block.statements().last() else { continue };
        let StatementKind::Jump(JumpKind::Unconditional(JumpTarget::Table(entries))) = &dispatch_statement.kind else {
            continue;
        };

        let succs = graph.successors_of(id).to_vec();
        let targets: Vec<(u64, BlockId)> = entries.iter().filter_map(|e| e.block.map(|b| (e.address, b))).collect();
        if targets.is_empty() {
            continue;
        }
        let Some(cases): Option<Vec<(u64, RegionId)>> = targets
            .iter()
            .map(|&(address, block)| block_to_region_in(graph, block).map(|region| (address, region)))
            .collect()
        else {
            // A case target isn't a standalone top-level region anymore
            // (already folded into another composite); leave this dispatch
            // block alone rather than wire a switch to a stale id.
            continue;
        };

        let default = succs.iter().copied().find(|s| !cases.iter().any(|(_, c)| c == s));

        // Each case body's own successors (after it's absorbed here) become
        // this switch's successors: where control goes once a case finishes.
        let case_ids: Vec<RegionId> = cases.iter().map(|(_, c)| *c).chain(default).collect();
        let mut new_successors = Vec::new();
        for &case_id in &case_ids {
            for succ in graph.successors_of(case_id) {
                if !case_ids.contains(succ) && !new_successors.contains(succ) {
                    new_successors.push(*succ);
                }
            }
        }

        let bound_check_id = store_kind(graph, RegionKind::Basic(block_id));
        let dispatch_id = store_kind(graph, RegionKind::Basic(block_id));
        for &case_id in &case_ids {
            graph.remove(case_id);
        }
        graph.regions[id.0] = Some(Region {
            kind: RegionKind::Switch {
                bound_check: bound_check_id,
                dispatch: dispatch_id,
                cases,
                default,
            },
        });
        graph.successors.insert(id, new_successors.clone());
        for s in &new_successors {
            let preds = graph.predecessors.entry(*s).or_default();
            preds.retain(|p| !case_ids.contains(p));
            if !preds.contains(&id) {
                preds.push(id);
            }
        }
        return true;
    }
    false
}

fn block_to_region_in(graph: &Graph, block: BlockId) -> Option<RegionId> {
    graph
        .live_ids()
        .into_iter()
        .find(|&id| matches!(&graph.regions[id.0], Some(r) if r.kind == RegionKind::Basic(block)))
}
