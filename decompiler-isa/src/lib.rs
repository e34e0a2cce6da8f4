//! External-interface vocabulary the decompiler core consumes (§6):
//! instructions, operands, the decoder contract, and register tables. None
//! of this crate decodes real machine code — that is a Non-goal of the core
//! and is left to an external disassembler bridge.

mod decoder;
mod instruction;
mod mnemonic;
mod operand;
mod registers;

#[cfg(feature = "testkit")]
pub mod testkit;

pub use decoder::Decoder;
pub use instruction::{Instruction, Prefixes};
pub use mnemonic::{Condition, Mnemonic};
pub use operand::{MemoryOperand, Operand};
pub use registers::RegisterTable;
