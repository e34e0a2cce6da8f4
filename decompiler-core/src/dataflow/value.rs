//! Abstract value lattice (§4.5): a per-bit tri-valued vector plus a
//! stack-offset scalar.

/// One bit's abstract state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bit {
    Zero,
    One,
    Top,
}

impl Bit {
    fn meet(self, other: Bit) -> Bit {
        if self == other {
            self
        } else {
            Bit::Top
        }
    }
}

/// Whether a value is known to be an offset from the function's entry stack
/// pointer; `None` means "not known to be a stack offset" (the meet of any
/// two differing offsets, or of a known offset and a non-offset).
pub type StackOffset = Option<i64>;

fn meet_stack_offset(a: StackOffset, b: StackOffset) -> StackOffset {
    match (a, b) {
        (Some(x), Some(y)) if x == y => Some(x),
        _ => None,
    }
}

/// A value tracked per-bit as {0, 1, ⊤}, with a parallel stack-offset
/// annotation (§4.5). Bit vectors are stored low-bit first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbstractValue {
    bits: Vec<Bit>,
    stack_offset: StackOffset,
}

impl AbstractValue {
    /// The least-informative value of `bit_size` bits: every bit unknown,
    /// no stack-offset knowledge.
    pub fn top(bit_size: u32) -> Self {
        Self {
            bits: vec![Bit::Top; bit_size as usize],
            stack_offset: None,
        }
    }

    /// A concrete integer constant.
    pub fn constant(value: i128, bit_size: u32) -> Self {
        let bits = (0..bit_size).map(|i| if (value >> i) & 1 == 1 { Bit::One } else { Bit::Zero }).collect();
        Self { bits, stack_offset: None }
    }

    /// A value known to be `offset` bits past the function's entry stack
    /// pointer; bits are otherwise unconstrained.
    pub fn stack_offset(offset: i64, bit_size: u32) -> Self {
        Self {
            bits: vec![Bit::Top; bit_size as usize],
            stack_offset: Some(offset),
        }
    }

    pub fn bit_size(&self) -> u32 {
        self.bits.len() as u32
    }

    pub fn stack_offset_value(&self) -> StackOffset {
        self.stack_offset
    }

    /// A value is concrete iff every bit is 0 or 1.
    pub fn is_concrete(&self) -> bool {
        self.bits.iter().all(|b| *b != Bit::Top)
    }

    /// The concrete integer this value denotes, if fully known.
    pub fn as_concrete(&self) -> Option<i128> {
        self.is_concrete().then(|| {
            self.bits
                .iter()
                .enumerate()
                .fold(0i128, |acc, (i, b)| if *b == Bit::One { acc | (1 << i) } else { acc })
        })
    }

    /// Pointwise bitwise meet, plus either-agrees meet on the stack-offset
    /// component (§4.5).
    pub fn meet(&self, other: &Self) -> Self {
        debug_assert_eq!(self.bit_size(), other.bit_size(), "meet of values with differing widths");
        let bits = self.bits.iter().zip(&other.bits).map(|(a, b)| a.meet(*b)).collect();
        Self {
            bits,
            stack_offset: meet_stack_offset(self.stack_offset, other.stack_offset),
        }
    }

    pub fn resized(&self, bit_size: u32) -> Self {
        let mut bits = self.bits.clone();
        bits.resize(bit_size as usize, Bit::Top);
        Self {
            bits,
            // A resize can change which bits are visible; stack-offset
            // knowledge about the *pointer value* still holds for the low
            // bits, so it is retained unconditionally — consumers that
            // truncate below pointer width must re-derive location from
            // `as_concrete`/`stack_offset_value` as appropriate.
            stack_offset: self.stack_offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_round_trips_through_as_concrete() {
        let v = AbstractValue::constant(42, 32);
        assert_eq!(v.as_concrete(), Some(42));
    }

    #[test]
    fn meet_of_differing_constants_is_top() {
        let a = AbstractValue::constant(0, 8);
        let b = AbstractValue::constant(1, 8);
        let m = a.meet(&b);
        assert!(!m.is_concrete());
    }

    #[test]
    fn meet_of_equal_stack_offsets_preserves_offset() {
        let a = AbstractValue::stack_offset(8, 32);
        let b = AbstractValue::stack_offset(8, 32);
        assert_eq!(a.meet(&b).stack_offset_value(), Some(8));
    }

    #[test]
    fn meet_of_differing_stack_offsets_is_unknown() {
        let a = AbstractValue::stack_offset(8, 32);
        let b = AbstractValue::stack_offset(16, 32);
        assert_eq!(a.meet(&b).stack_offset_value(), None);
    }
}
