//! Primitive vocabulary shared across the decompiler core: sized machine
//! words, the abstract-address `Domain`, and the `MemoryLocation` algebra
//! that every later analysis speaks in terms of.

mod location;

pub use location::{Domain, MemoryLocation};

/// A machine address, as produced by the external image loader / disassembler.
///
/// Address `0` is a valid, meaningful address (e.g. a statically linked
/// executable with no base relocation) and must never be treated as a sentinel.
pub type Address = u64;

/// A native machine word. Abstract values (`decompiler-core::dataflow`) track
/// this many bits per term at most; wider accesses are modeled as multiple
/// terms by the instruction analyzer.
pub type Word = u64;

/// Number of bits in a [`Word`].
pub const WORD_BITS: u32 = Word::BITS;
