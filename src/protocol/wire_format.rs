//! Wire format constants and the cyclic sequence identifier.
//!
//! ```text
//! ┌────────┬──────────┬──────────────────┬─────────────────┬──────┐
//! │ Header │ Sequence │ Core body        │ Extension       │ Tail │
//! │ 0x23   │ '1'..'9' │ 16 bytes, XOR'd  │ 0..N bytes      │ 0x21 │
//! └────────┴──────────┴──────────────────┴─────────────────┴──────┘
//! ```
//!
//! The sequence identifier travels as an ASCII digit.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Header marker (`#`).
pub const HEADER_MARKER: u8 = 0x23;

/// Tail marker (`!`).
pub const TAIL_MARKER: u8 = 0x21;

/// Encrypted core body length in bytes (fixed, exactly 16).
pub const BODY_SIZE: usize = 16;

/// Offset of the first body byte.
pub const BODY_OFFSET: usize = 2;

/// Offset of the first extension byte.
pub const EXTENSION_OFFSET: usize = BODY_OFFSET + BODY_SIZE;

/// Smallest complete frame: header, sequence, body, tail.
pub const MIN_FRAME_SIZE: usize = EXTENSION_OFFSET + 1;

/// Default maximum frame length before an open frame is abandoned.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024;

/// Extension carried by crafted frames (six zero bytes under the filler key).
pub const CRAFTED_EXTENSION: [u8; 6] = [0x3C; 6];

/// Lowest sequence identifier.
pub const SEQUENCE_MIN: u8 = 1;

/// Highest sequence identifier.
pub const SEQUENCE_MAX: u8 = 9;

/// Cyclic sequence identifier carried at frame offset 1 (always 1..=9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Sequence(u8);

impl Sequence {
    /// Create a sequence identifier. Returns `None` outside 1..=9.
    pub fn new(value: u8) -> Option<Self> {
        (SEQUENCE_MIN..=SEQUENCE_MAX)
            .contains(&value)
            .then_some(Self(value))
    }

    /// Parse the ASCII digit found on the wire.
    pub fn from_wire(byte: u8) -> Option<Self> {
        byte.checked_sub(b'0').and_then(Self::new)
    }

    /// Encode as the ASCII digit sent on the wire.
    #[inline]
    pub fn to_wire(self) -> u8 {
        b'0' + self.0
    }

    /// Numeric value (1..=9).
    #[inline]
    pub fn get(self) -> u8 {
        self.0
    }

    /// Next identifier in the cycle (9 wraps to 1).
    pub fn next(self) -> Self {
        if self.0 == SEQUENCE_MAX {
            Self(SEQUENCE_MIN)
        } else {
            Self(self.0 + 1)
        }
    }

    /// Distance between two identifiers around the 1..9 cycle.
    pub fn cyclic_distance(self, other: Self) -> u8 {
        let span = SEQUENCE_MAX - SEQUENCE_MIN + 1;
        let forward = (other.0 + span - self.0) % span;
        forward.min(span - forward)
    }

    /// All identifiers in cycle order.
    pub fn all() -> impl Iterator<Item = Self> {
        (SEQUENCE_MIN..=SEQUENCE_MAX).map(Self)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for Sequence {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("sequence {value} outside 1..=9"))
    }
}

impl From<Sequence> for u8 {
    fn from(sequence: Sequence) -> Self {
        sequence.0
    }
}

/// Hands out sequence identifiers for crafted sends, cycling 1..9.
#[derive(Debug, Clone)]
pub struct SequenceCounter {
    next: Sequence,
}

impl SequenceCounter {
    /// Start the cycle at 1.
    pub fn new() -> Self {
        Self {
            next: Sequence(SEQUENCE_MIN),
        }
    }

    /// Start the cycle at a given identifier.
    pub fn starting_at(sequence: Sequence) -> Self {
        Self { next: sequence }
    }

    /// Take the current identifier and advance.
    pub fn advance(&mut self) -> Sequence {
        let current = self.next;
        self.next = current.next();
        current
    }

    /// Identifier the next call to `advance` returns.
    pub fn peek(&self) -> Sequence {
        self.next
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(BODY_OFFSET, 2);
        assert_eq!(EXTENSION_OFFSET, 18);
        assert_eq!(MIN_FRAME_SIZE, 19);
    }

    #[test]
    fn test_sequence_range() {
        assert!(Sequence::new(0).is_none());
        assert!(Sequence::new(10).is_none());
        for n in 1..=9 {
            assert_eq!(Sequence::new(n).unwrap().get(), n);
        }
    }

    #[test]
    fn test_sequence_wire_digit() {
        let seq = Sequence::from_wire(b'3').unwrap();
        assert_eq!(seq.get(), 3);
        assert_eq!(seq.to_wire(), 0x33);

        assert!(Sequence::from_wire(b'0').is_none());
        assert!(Sequence::from_wire(0x03).is_none());
        assert!(Sequence::from_wire(b':').is_none());
        assert!(Sequence::from_wire(0x00).is_none());
    }

    #[test]
    fn test_sequence_wraps() {
        assert_eq!(Sequence::new(9).unwrap().next(), Sequence::new(1).unwrap());
        assert_eq!(Sequence::new(4).unwrap().next(), Sequence::new(5).unwrap());
    }

    #[test]
    fn test_cyclic_distance() {
        let one = Sequence::new(1).unwrap();
        let nine = Sequence::new(9).unwrap();
        let five = Sequence::new(5).unwrap();
        assert_eq!(one.cyclic_distance(nine), 1);
        assert_eq!(nine.cyclic_distance(one), 1);
        assert_eq!(one.cyclic_distance(five), 4);
        assert_eq!(five.cyclic_distance(five), 0);
    }

    #[test]
    fn test_counter_cycles_one_to_nine() {
        let mut counter = SequenceCounter::new();
        let seen: Vec<u8> = (0..10).map(|_| counter.advance().get()).collect();
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 1]);
        assert_eq!(counter.peek().get(), 2);
    }

    #[test]
    fn test_sequence_serde_rejects_out_of_range() {
        let ok: Sequence = serde_json::from_str("7").unwrap();
        assert_eq!(ok.get(), 7);
        assert!(serde_json::from_str::<Sequence>("0").is_err());
    }
}
