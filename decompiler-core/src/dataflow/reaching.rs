//! Reaching definitions (§4.5): a map from memory location to the set of
//! terms that may have most recently written it.

use std::collections::HashMap;

use decompiler_types::MemoryLocation;

use crate::term::TermId;

/// One entry: the exact location written, and the identity of the writing
/// term (§3 invariant: "every term in the chunk is a WRITE").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Definition {
    pub location: MemoryLocation,
    pub writer: TermId,
}

/// The reaching-definitions state at one program point: a set of
/// definitions, unindexed beyond linear scan — function-local state is
/// small enough that this stays cheap, and `project`/`kill` are the only
/// hot operations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReachingDefinitions {
    definitions: Vec<Definition>,
}

impl ReachingDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn definitions(&self) -> &[Definition] {
        &self.definitions
    }

    /// Definitions whose location overlaps `loc`.
    pub fn project(&self, loc: MemoryLocation) -> Vec<&Definition> {
        self.definitions.iter().filter(|d| d.location.overlaps(&loc)).collect()
    }

    /// Removes every definition covered by `loc` — the write it describes is
    /// now entirely superseded.
    pub fn kill(&mut self, loc: MemoryLocation) {
        self.definitions.retain(|d| !loc.covers(&d.location));
    }

    /// Kills any definition covered by `location`, then installs `writer` as
    /// the sole fresh definition of it (§4.5 "Assignment").
    pub fn install(&mut self, location: MemoryLocation, writer: TermId) {
        self.kill(location);
        self.definitions.push(Definition { location, writer });
    }

    /// Pointwise-union join across predecessors (§4.5).
    pub fn join(states: impl IntoIterator<Item = Self>) -> Self {
        let mut result = ReachingDefinitions::new();
        for state in states {
            for definition in state.definitions {
                if !result.definitions.contains(&definition) {
                    result.definitions.push(definition);
                }
            }
        }
        result
    }
}
