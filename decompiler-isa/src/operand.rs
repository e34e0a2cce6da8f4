use decompiler_types::{Address, MemoryLocation};

/// A memory operand in base+index*scale+offset form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOperand {
    pub base: Option<MemoryLocation>,
    pub index: Option<MemoryLocation>,
    pub scale: u8,
    pub offset: i64,
    /// Width, in bits, of the computed address.
    pub address_size_bits: u32,
}

/// One operand of a decoded [`crate::Instruction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register(MemoryLocation),
    Immediate(i128),
    Memory(MemoryOperand),
    Pointer(Address),
    /// A code-relative jump displacement, already resolved to an absolute
    /// address by the decoder.
    CodeRelative(Address),
}
