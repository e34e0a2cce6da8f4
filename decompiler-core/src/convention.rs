//! Calling-convention registry (§4.4, component D).
//!
//! A [`Convention`] is an immutable value describing one ABI: where the
//! stack pointer lives, where arguments and return values may be found, and
//! what a function must do on entry regardless of its body. The concrete
//! catalog at the bottom of this file (cdecl, stdcall, System V AMD64,
//! Microsoft x64) is grounded on `CallingConventions.cpp` in the original
//! this pipeline was distilled from, adapted to this crate's
//! architecture-agnostic register model: a register is named by a `Domain`
//! index, and its narrower aliases (`ax` inside `eax`, say) are the same
//! location resized to fewer bits, sharing `bit_offset`.

use std::rc::Rc;

use decompiler_types::{Domain, MemoryLocation};

use crate::statement::{Statement, StatementKind};
use crate::term::Term;

/// One argument position: the set of locations (widest first) where that
/// argument may be materialized. E.g. on System V AMD64 the third integer
/// argument is `rdx`, `edx`, `dx`, or `dl` — four aliases of one location.
#[derive(Debug, Clone)]
pub struct Argument {
    locations: Vec<MemoryLocation>,
}

impl Argument {
    pub fn new(locations: Vec<MemoryLocation>) -> Self {
        assert!(!locations.is_empty(), "an argument must name at least one location");
        Self { locations }
    }

    pub fn locations(&self) -> &[MemoryLocation] {
        &self.locations
    }

    /// The widest (canonical) location naming this argument.
    pub fn canonical(&self) -> MemoryLocation {
        self.locations[0]
    }

    /// Whether any of this argument's aliases covers `loc`.
    pub fn covers(&self, loc: MemoryLocation) -> bool {
        self.locations.iter().any(|candidate| candidate.covers(&loc))
    }

    /// Whether `loc` covers any of this argument's aliases — used by
    /// [`Convention::sort_arguments`], which asks "is some *input* location
    /// wide enough to have produced this candidate".
    pub fn covered_by(&self, loc: MemoryLocation) -> bool {
        self.locations.iter().any(|candidate| loc.covers(candidate))
    }
}

/// A group of argument positions filled in order (e.g. "integer arguments"
/// vs. "floating-point arguments").
#[derive(Debug, Clone)]
pub struct ArgumentGroup {
    pub name: String,
    arguments: Vec<Argument>,
}

impl ArgumentGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Vec::new(),
        }
    }

    pub fn with_argument(mut self, argument: Argument) -> Self {
        self.arguments.push(argument);
        self
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }
}

/// An immutable ABI description (§4.4). Carries tables and flags only; every
/// operation on it is a pure query, so there is no need for the original's
/// per-architecture subclassing — one struct plus a constructor function per
/// architecture/convention pair suffices (§ REDESIGN FLAGS).
#[derive(Debug, Clone)]
pub struct Convention {
    pub name: String,
    stack_pointer: MemoryLocation,
    first_argument_offset: i64,
    argument_alignment: u32,
    argument_groups: Vec<ArgumentGroup>,
    return_values: Vec<Rc<Term>>,
    callee_cleanup: bool,
    entry_statements: Vec<Statement>,
}

impl Convention {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        stack_pointer: MemoryLocation,
        first_argument_offset: i64,
        argument_alignment: u32,
        argument_groups: Vec<ArgumentGroup>,
        return_values: Vec<Rc<Term>>,
        callee_cleanup: bool,
        entry_statements: Vec<Statement>,
    ) -> Self {
        Self {
            name: name.into(),
            stack_pointer,
            first_argument_offset,
            argument_alignment,
            argument_groups,
            return_values,
            callee_cleanup,
            entry_statements,
        }
    }

    pub fn stack_pointer(&self) -> MemoryLocation {
        self.stack_pointer
    }

    pub fn first_argument_offset(&self) -> i64 {
        self.first_argument_offset
    }

    pub fn argument_alignment(&self) -> u32 {
        self.argument_alignment
    }

    pub fn argument_groups(&self) -> &[ArgumentGroup] {
        &self.argument_groups
    }

    pub fn return_values(&self) -> &[Rc<Term>] {
        &self.return_values
    }

    pub fn callee_cleanup(&self) -> bool {
        self.callee_cleanup
    }

    pub fn entry_statements(&self) -> &[Statement] {
        &self.entry_statements
    }

    /// §4.4: classify `loc` as an argument-candidate location.
    ///
    /// A stack location at or past `first_argument_offset` is always a
    /// candidate, rounded to the alignment grid; otherwise the first
    /// register candidate (in declared order) that covers `loc` wins.
    pub fn get_argument_location_covering(&self, loc: MemoryLocation) -> Option<MemoryLocation> {
        if loc.domain() == Domain::STACK && loc.bit_offset() >= self.first_argument_offset {
            let alignment = self.argument_alignment.max(1) as i64;
            let aligned_start = floor_to(loc.bit_offset(), alignment);
            let aligned_end = ceil_to(loc.end_offset(), alignment);
            return Some(MemoryLocation::new(loc.domain(), aligned_start, (aligned_end - aligned_start) as u32));
        }
        for group in &self.argument_groups {
            for argument in group.arguments() {
                for candidate in argument.locations() {
                    if candidate.covers(&loc) {
                        return Some(*candidate);
                    }
                }
            }
        }
        None
    }

    /// §4.4 `sort_arguments`: reorders a set of discovered argument locations
    /// into canonical calling order.
    ///
    /// Walks groups in declared order; within a group, appends the candidate
    /// for each argument position so long as some input location is wide
    /// enough to have produced it, stopping at the first unmatched position.
    /// If at least one group filled completely (every position matched, or
    /// there are no groups at all), stack arguments follow, sorted by
    /// address, stopping at the first gap wider than `argument_alignment`.
    /// A group that stops partway through never unlocks stack evidence,
    /// even though its own matched prefix still lands in the result.
    pub fn sort_arguments(&self, locations: &[MemoryLocation]) -> Vec<MemoryLocation> {
        let mut result = Vec::new();
        let mut any_group_matched = self.argument_groups.is_empty();

        for group in &self.argument_groups {
            let mut group_is_filled = true;
            for argument in group.arguments() {
                let matched = locations.iter().any(|loc| argument.covered_by(*loc));
                if !matched {
                    group_is_filled = false;
                    break;
                }
                result.push(argument.canonical());
            }
            any_group_matched = any_group_matched || group_is_filled;
        }

        if any_group_matched {
            let mut stack_locations: Vec<MemoryLocation> = locations
                .iter()
                .copied()
                .filter(|loc| loc.domain() == Domain::STACK && loc.bit_offset() >= self.first_argument_offset)
                .collect();
            stack_locations.sort();

            let mut previous_end: Option<i64> = None;
            for loc in stack_locations {
                if let Some(end) = previous_end {
                    if loc.bit_offset() - end != self.argument_alignment as i64 {
                        break;
                    }
                }
                previous_end = Some(loc.bit_offset() + self.argument_alignment as i64);
                result.push(loc);
            }
        }

        result
    }
}

fn floor_to(value: i64, alignment: i64) -> i64 {
    value.div_euclid(alignment) * alignment
}

fn ceil_to(value: i64, alignment: i64) -> i64 {
    floor_to(value + alignment - 1, alignment)
}

/// Builds the common "set the direction flag on entry" statement every Intel
/// calling convention in the original carries (`CallingConventions.cpp`).
fn zero_flag_entry_statement(flag: MemoryLocation) -> Statement {
    Statement::new(StatementKind::Assignment {
        left: Box::new(Term::location(flag)),
        right: Box::new(Term::constant(0, flag.bit_size())),
    })
}

fn register(index: u32, bits: u32) -> MemoryLocation {
    MemoryLocation::new(Domain::register(index), 0, bits)
}

/// x86-64 GPR numbering shared by every Intel-family convention below
/// (ModRM register-field encoding: rax=0 .. rdi=7, r8=8 .. r15=15).
pub mod x86_register_index {
    pub const RAX: u32 = 0;
    pub const RCX: u32 = 1;
    pub const RDX: u32 = 2;
    pub const RBX: u32 = 3;
    pub const RSP: u32 = 4;
    pub const RBP: u32 = 5;
    pub const RSI: u32 = 6;
    pub const RDI: u32 = 7;
    pub const R8: u32 = 8;
    pub const R9: u32 = 9;
    /// First XMM register's index, in the same register-index space as the
    /// GPRs above (the two families never overlap).
    pub const XMM0: u32 = 100;
    /// Carries the Intel direction flag; not a GPR, placed well clear of the
    /// XMM range.
    pub const DIRECTION_FLAG: u32 = 200;
}

fn integer_argument(index: u32) -> Argument {
    Argument::new(vec![register(index, 64), register(index, 32), register(index, 16), register(index, 8)])
}

fn xmm_argument(offset: u32) -> Argument {
    Argument::new(vec![register(x86_register_index::XMM0 + offset, 128)])
}

/// System V AMD64 ABI: integer args in rdi,rsi,rdx,rcx,r8,r9; floating-point
/// args in xmm0..xmm7; return value in rax (aliases) or xmm0.
pub fn x86_64_sysv() -> Convention {
    use x86_register_index::*;

    let integer_group = ArgumentGroup::new("Integer Arguments")
        .with_argument(integer_argument(RDI))
        .with_argument(integer_argument(RSI))
        .with_argument(integer_argument(RDX))
        .with_argument(integer_argument(RCX))
        .with_argument(integer_argument(R8))
        .with_argument(integer_argument(R9));

    let float_group = (0..8).fold(ArgumentGroup::new("Floating-point Arguments"), |group, i| {
        group.with_argument(xmm_argument(i))
    });

    let return_values = vec![
        Rc::new(Term::location(register(RAX, 64))),
        Rc::new(Term::location(register(RAX, 32))),
        Rc::new(Term::location(register(RAX, 16))),
        Rc::new(Term::location(register(RAX, 8))),
        Rc::new(Term::location(register(XMM0, 128))),
    ];

    Convention::new(
        "x86-64 SysV",
        register(RSP, 64),
        64,
        64,
        vec![integer_group, float_group],
        return_values,
        false,
        vec![zero_flag_entry_statement(register(DIRECTION_FLAG, 1))],
    )
}

/// Microsoft x64 ABI: integer args in rcx,rdx,r8,r9; floating-point args in
/// xmm0..xmm3; return value in rax (aliases) or xmm0; caller cleans up.
pub fn x86_64_ms() -> Convention {
    use x86_register_index::*;

    let integer_group = ArgumentGroup::new("Integer Arguments")
        .with_argument(integer_argument(RCX))
        .with_argument(integer_argument(RDX))
        .with_argument(integer_argument(R8))
        .with_argument(integer_argument(R9));

    let float_group = (0..4).fold(ArgumentGroup::new("Floating-point Arguments"), |group, i| {
        group.with_argument(xmm_argument(i))
    });

    let return_values = vec![
        Rc::new(Term::location(register(RAX, 64))),
        Rc::new(Term::location(register(RAX, 32))),
        Rc::new(Term::location(register(RAX, 16))),
        Rc::new(Term::location(register(RAX, 8))),
        Rc::new(Term::location(register(XMM0, 128))),
    ];

    Convention::new(
        "Microsoft x64",
        register(RSP, 64),
        64,
        64,
        vec![integer_group, float_group],
        return_values,
        false,
        vec![zero_flag_entry_statement(register(DIRECTION_FLAG, 1))],
    )
}

/// 32-bit cdecl: no register arguments, caller cleans up the stack.
pub fn cdecl_32() -> Convention {
    use x86_register_index::*;

    let return_values = vec![
        Rc::new(Term::location(register(RAX, 32))),
        Rc::new(Term::location(register(RAX, 16))),
        Rc::new(Term::location(register(RAX, 8))),
    ];

    Convention::new(
        "cdecl",
        register(RSP, 32),
        32,
        32,
        Vec::new(),
        return_values,
        false,
        vec![zero_flag_entry_statement(register(DIRECTION_FLAG, 1))],
    )
}

/// 32-bit stdcall: identical to cdecl except the callee cleans up the stack.
pub fn stdcall_32() -> Convention {
    let mut convention = cdecl_32();
    convention.name = "stdcall".to_string();
    convention.callee_cleanup = true;
    convention
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_argument_at_first_offset_is_a_candidate() {
        let convention = x86_64_sysv();
        let at_offset = MemoryLocation::new(Domain::STACK, 64, 64);
        let covering = convention.get_argument_location_covering(at_offset);
        assert_eq!(covering, Some(MemoryLocation::new(Domain::STACK, 64, 64)));

        let before_offset = MemoryLocation::new(Domain::STACK, 0, 64);
        assert_eq!(convention.get_argument_location_covering(before_offset), None);
    }

    #[test]
    fn register_alias_resolves_to_full_width_candidate() {
        let convention = x86_64_sysv();
        let edi = register(x86_register_index::RDI, 32);
        assert_eq!(convention.get_argument_location_covering(edi), Some(register(x86_register_index::RDI, 64)));
    }

    #[test]
    fn sort_arguments_orders_registers_before_stack_and_stops_at_gap() {
        let convention = x86_64_sysv();
        let rdx = register(x86_register_index::RDX, 64);
        let rdi = register(x86_register_index::RDI, 64);
        let stack_first = MemoryLocation::new(Domain::STACK, 64, 64);
        let stack_second = MemoryLocation::new(Domain::STACK, 128, 64);

        let sorted = convention.sort_arguments(&[stack_second, rdx, stack_first, rdi]);
        assert_eq!(sorted[0], register(x86_register_index::RDI, 64));
        assert_eq!(sorted[1], register(x86_register_index::RDX, 64));
        assert_eq!(sorted[2], stack_first);
        assert_eq!(sorted[3], stack_second);
    }

    #[test]
    fn sort_arguments_stops_at_first_unmatched_integer_slot() {
        let convention = x86_64_sysv();
        let rdi = register(x86_register_index::RDI, 64);
        let r9 = register(x86_register_index::R9, 64);
        let sorted = convention.sort_arguments(&[rdi, r9]);
        assert_eq!(sorted, vec![rdi]);
    }

    #[test]
    fn sort_arguments_does_not_accept_stack_evidence_from_a_partially_filled_group() {
        let convention = x86_64_sysv();
        let rdi = register(x86_register_index::RDI, 64);
        let stack_at_offset = MemoryLocation::new(Domain::STACK, 64, 64);

        let sorted = convention.sort_arguments(&[rdi, stack_at_offset]);
        assert_eq!(
            sorted,
            vec![rdi],
            "the integer group only matched 1 of its slots, so it never fills and stack evidence must be ignored"
        );
    }

    #[test]
    fn stdcall_is_callee_cleanup_cdecl_is_not() {
        assert!(!cdecl_32().callee_cleanup());
        assert!(stdcall_32().callee_cleanup());
    }
}
