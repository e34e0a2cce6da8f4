use decompiler_types::Address;

use crate::instruction::Instruction;

/// The external instruction decoder (§6, consumed).
///
/// Implementations live outside this specification's scope; the core only
/// relies on this contract to pull instructions off an in-memory image.
pub trait Decoder {
    /// Attempts to decode a single instruction starting at `pc`.
    ///
    /// `bytes` is a window into the image starting at `pc`; `size` is its
    /// length, mirrored as an explicit parameter because some decoders
    /// validate it separately from `bytes.len()` (e.g. when `bytes` is a
    /// bounded prefetch window larger than the true remaining image size).
    /// Returns `None` on decode failure (§7: "decoder failure" — the caller
    /// represents the covered range as an empty block and continues).
    fn decode(&self, pc: Address, bytes: &[u8], size: usize) -> Option<Instruction>;
}
