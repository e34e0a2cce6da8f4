//! A tiny, made-up "x86-like" register set used to drive decompiler-core's
//! own pipeline tests. This is test tooling, not a production decoder or
//! register table (§1 Non-goals: "architecture-specific register tables").

use decompiler_types::{Domain, MemoryLocation};

use crate::registers::RegisterTable;

pub const EAX: MemoryLocation = MemoryLocation::new(Domain::register(0), 0, 32);
pub const ECX: MemoryLocation = MemoryLocation::new(Domain::register(1), 0, 32);
pub const EDX: MemoryLocation = MemoryLocation::new(Domain::register(2), 0, 32);
pub const EBX: MemoryLocation = MemoryLocation::new(Domain::register(3), 0, 32);
pub const ESP: MemoryLocation = MemoryLocation::new(Domain::register(4), 0, 32);
pub const EBP: MemoryLocation = MemoryLocation::new(Domain::register(5), 0, 32);

/// A plausible "flags" pseudo-register, in the user-extensible domain range.
pub const FLAGS: MemoryLocation = MemoryLocation::new(Domain::USER, 0, 32);

pub fn register_table() -> RegisterTable {
    let mut table = RegisterTable::new();
    table
        .register(EAX, "eax")
        .register(ECX, "ecx")
        .register(EDX, "edx")
        .register(EBX, "ebx")
        .register(ESP, "esp")
        .register(EBP, "ebp")
        .register(FLAGS, "flags");
    table
}
