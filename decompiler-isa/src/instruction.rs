use decompiler_types::Address;

use crate::mnemonic::Mnemonic;
use crate::operand::Operand;

bitflags::bitflags! {
    /// Prefix bytes that modify an instruction's semantics without changing
    /// its mnemonic (§6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prefixes: u8 {
        const LOCK   = 0b0001;
        const REP    = 0b0010;
        const REPZ   = 0b0100;
        const REPNZ  = 0b1000;
    }
}

/// A single decoded machine instruction, as handed to the core's instruction
/// analyzer (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: Address,
    pub end_address: Address,
    pub mnemonic: Mnemonic,
    pub operands: Vec<Operand>,
    pub prefixes: Prefixes,
    pub operand_size_bits: u32,
    pub address_size_bits: u32,
}

impl Instruction {
    pub fn size(&self) -> u64 {
        self.end_address - self.address
    }
}
