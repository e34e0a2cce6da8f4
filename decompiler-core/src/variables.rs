//! Variable recovery (§4.7, component G): partitions memory-location-bearing
//! terms into variables via union-find.

use std::collections::HashMap;

use decompiler_types::MemoryLocation;

use crate::function::FunctionId;
use crate::term::TermId;

/// One recovered variable: its merged location, owning function, and the
/// terms aliased to it.
#[derive(Debug, Clone)]
pub struct Variable {
    pub location: MemoryLocation,
    pub function: Option<FunctionId>,
    pub terms: Vec<TermId>,
}

/// Hand-rolled union-find keyed by memory location; no crate in the pack
/// ships one. Path compression on find; union merges the smaller-rank tree
/// into the larger.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// One term observation for variable recovery: the term's identity, its
/// resolved location (if any), and the function it was found in.
pub struct TermObservation {
    pub term: TermId,
    pub location: MemoryLocation,
    pub function: Option<FunctionId>,
}

/// §4.7: "Two terms belong to the same variable iff their locations overlap
/// and at least one writes or reads a domain the variable already covers."
/// In practice every observed term with a known location is eligible to
/// merge with any existing variable whose location overlaps it — the access
/// role has already been filtered out by the caller (global-memory
/// observations are expected to be pre-restricted to one domain-consistent
/// set per §4.7 "re-keyed across functions via address").
pub fn recover_variables(observations: &[TermObservation]) -> Vec<Variable> {
    let mut union_find = UnionFind::new(observations.len());

    for i in 0..observations.len() {
        for j in (i + 1)..observations.len() {
            if observations[i].location.overlaps(&observations[j].location) {
                union_find.union(i, j);
            }
        }
    }

    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..observations.len() {
        let root = union_find.find(i);
        groups.entry(root).or_default().push(i);
    }

    groups
        .into_values()
        .map(|members| {
            let merged = members
                .iter()
                .map(|&i| observations[i].location)
                .reduce(decompiler_types::MemoryLocation::merge)
                .expect("a group has at least one member");
            let function = observations[members[0]].function;
            Variable {
                location: merged,
                function,
                terms: members.into_iter().map(|i| observations[i].term).collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use decompiler_types::Domain;

    fn loc(offset: i64, size: u32) -> MemoryLocation {
        MemoryLocation::new(Domain::MEMORY, offset, size)
    }

    #[test]
    fn overlapping_locations_merge_into_one_variable() {
        let observations = vec![
            TermObservation {
                term: 1,
                location: loc(0, 32),
                function: Some(FunctionId(0)),
            },
            TermObservation {
                term: 2,
                location: loc(16, 32),
                function: Some(FunctionId(0)),
            },
        ];
        let variables = recover_variables(&observations);
        assert_eq!(variables.len(), 1);
        assert_eq!(variables[0].location, loc(0, 48));
        assert_eq!(variables[0].terms.len(), 2);
    }

    #[test]
    fn disjoint_locations_stay_separate() {
        let observations = vec![
            TermObservation {
                term: 1,
                location: loc(0, 32),
                function: Some(FunctionId(0)),
            },
            TermObservation {
                term: 2,
                location: loc(128, 32),
                function: Some(FunctionId(0)),
            },
        ];
        let variables = recover_variables(&observations);
        assert_eq!(variables.len(), 2);
    }
}
