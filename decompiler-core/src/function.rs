//! Function: an entry block plus the blocks it owns (§3).

use decompiler_types::Address;

use crate::block::{BasicBlock, BlockId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub usize);

/// A function: an entry block and the intrusive list of blocks it owns.
///
/// Functions own their blocks outright (cloned out of the program's arena by
/// the partitioner, §4.3) rather than sharing them with the program or with
/// other functions, so "a block belongs to at most one function" holds by
/// construction.
#[derive(Debug, Clone)]
pub struct Function {
    /// A human-readable name: symbol-name cleanup, else address-derived,
    /// else pointer-derived (§4.10 step 2).
    pub name: String,
    entry_address: Option<Address>,
    entry: BlockId,
    blocks: Vec<BasicBlock>,
}

impl Function {
    pub fn new(name: String, entry_address: Option<Address>, entry_block: BasicBlock) -> Self {
        let mut function = Self {
            name,
            entry_address,
            entry: BlockId(0),
            blocks: Vec::new(),
        };
        function.entry = function.push_block(entry_block);
        function
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn entry_address(&self) -> Option<Address> {
        self.entry_address
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

    pub fn push_block(&mut self, mut block: BasicBlock) -> BlockId {
        let id = BlockId(self.blocks.len());
        block.set_function(None);
        self.blocks.push(block);
        id
    }

    /// True iff no block in this function holds a single statement (§3:
    /// `is_empty`).
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(BasicBlock::is_empty)
    }
}
