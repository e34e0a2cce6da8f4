use decompiler_types::MemoryLocation;

/// Maps architectural storage to human-readable names.
///
/// Used only for recognizing standard locations when building calling
/// conventions and, downstream of this crate, for naming in code generation
/// (out of scope here).
#[derive(Debug, Clone, Default)]
pub struct RegisterTable {
    entries: Vec<(MemoryLocation, &'static str)>,
}

impl RegisterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, location: MemoryLocation, name: &'static str) -> &mut Self {
        self.entries.push((location, name));
        self
    }

    /// The name of the register whose location exactly equals `location`, if
    /// any is registered.
    pub fn name_of(&self, location: MemoryLocation) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(loc, _)| *loc == location)
            .map(|(_, name)| *name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(MemoryLocation, &'static str)> {
        self.entries.iter()
    }
}
