//! Program: the global block arena plus the address indices the builder and
//! partitioner query (§3).

use std::collections::{BTreeMap, HashSet};

use decompiler_types::Address;

use crate::block::{BasicBlock, BlockId};

/// Owns every block produced by the program builder before partitioning,
/// plus the indices needed to find them by address.
///
/// The range index is conceptually the original's `ToTheLeft`-ordered set of
/// half-open `[addr, successor_addr)` ranges ("`[a,b) < [c,d)` iff `b ≤ c`").
/// A `BTreeMap` keyed by the range's start, queried with `range(..=x).next_back()`
/// and a successor-address check, gives the same "find the unique block
/// covering byte x" lookup without hand-rolling a custom comparator.
#[derive(Debug, Clone, Default)]
pub struct Program {
    blocks: Vec<BasicBlock>,
    by_start_address: BTreeMap<Address, BlockId>,
    called_addresses: HashSet<Address>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.0]
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &BasicBlock)> {
        self.blocks.iter().enumerate().map(|(i, b)| (BlockId(i), b))
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len()).map(BlockId)
    }

    /// Inserts a new block and indexes it by its current addressing. Callers
    /// must call [`Program::reindex`] after later mutating a block's
    /// addresses (e.g. after a split).
    pub fn add_block(&mut self, block: BasicBlock) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(block);
        self.reindex(id);
        id
    }

    /// Refreshes the address indices for `id` from the block's current
    /// `entry_address`/`successor_address` (§3 invariant: "Block address
    /// index and range index are mutually consistent").
    pub fn reindex(&mut self, id: BlockId) {
        self.by_start_address.retain(|_, v| *v != id);
        if let Some(addr) = self.blocks[id.0].entry_address() {
            self.by_start_address.insert(addr, id);
        }
    }

    /// The block starting exactly at `address`, if any.
    pub fn lookup_start(&self, address: Address) -> Option<BlockId> {
        self.by_start_address.get(&address).copied()
    }

    /// The unique memory-bound block whose half-open `[addr, successor)`
    /// range contains byte `x`, if any.
    pub fn lookup_covering(&self, x: Address) -> Option<BlockId> {
        let (_, &id) = self.by_start_address.range(..=x).next_back()?;
        let block = &self.blocks[id.0];
        if block.is_memory_bound() && block.entry_address().unwrap() <= x && x < block.successor_address().unwrap() {
            Some(id)
        } else {
            None
        }
    }

    pub fn add_called_address(&mut self, address: Address) {
        self.called_addresses.insert(address);
    }

    pub fn is_called_address(&self, address: Address) -> bool {
        self.called_addresses.contains(&address)
    }

    pub fn called_addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.called_addresses.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_covering_finds_unique_containing_block() {
        let mut program = Program::new();
        let mut block = BasicBlock::new(Some(0x100));
        block.set_successor_address(Some(0x110));
        program.add_block(block);

        assert_eq!(program.lookup_covering(0x100), Some(BlockId(0)));
        assert_eq!(program.lookup_covering(0x108), Some(BlockId(0)));
        assert_eq!(program.lookup_covering(0x110), None);
        assert_eq!(program.lookup_covering(0x0FF), None);
    }

    #[test]
    fn address_zero_is_a_valid_block_start() {
        let mut program = Program::new();
        let mut block = BasicBlock::new(Some(0));
        block.set_successor_address(Some(4));
        program.add_block(block);
        assert_eq!(program.lookup_start(0), Some(BlockId(0)));
    }
}
