//! 128-bit ring identifiers.
//!
//! An [`Id`] names a node or a routable key on the overlay's keyspace.
//! 128 bits is larger than most applications need, so IDs can be projected
//! onto smaller bit-sizes and decomposed into digits of a power-of-two base
//! (up to hexadecimal) for prefix routing.
//!
//! [`Generator`] derives stable IDs from input strings by hashing. The MD5
//! family is the canonical one here; the published test vectors below are
//! tied to it.

use std::fmt;
use std::str::FromStr;

use md5::{Digest, Md5};

/// An unsigned 128-bit number identifying nodes and assigning ownership of
/// keys. Ordered numerically; no wraparound.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id(pub u128);

/// The lowest ID.
pub const ZERO: Id = Id(0);

/// The highest ID.
pub const MAX: Id = Id(u128::MAX);

impl Id {
    /// Splits the ID into its big-endian 64-bit halves, the layout used on
    /// the wire.
    #[inline]
    pub fn to_parts(self) -> (u64, u64) {
        ((self.0 >> 64) as u64, self.0 as u64)
    }

    /// Rebuilds an ID from its big-endian 64-bit halves.
    #[inline]
    pub fn from_parts(high: u64, low: u64) -> Self {
        Id(((high as u128) << 64) | low as u128)
    }

    /// Absolute distance `|self - other|` in the linear keyspace.
    #[inline]
    pub fn distance(self, other: Id) -> Id {
        Id(self.0.abs_diff(other.0))
    }

    /// Converts the ID into individual digits of a power-of-two base, up
    /// to 16. `size` allows representing the 128-bit ID at a smaller bit
    /// width.
    ///
    /// Returns `None` if the ID is too big for `size`. Panics on a size or
    /// base outside the supported sets; those are compile-time choices, not
    /// data.
    pub fn digits(self, size: u32, base: u32) -> Option<Digits> {
        let exp = log2(base);
        if self > max_for_size(size) {
            return None;
        }

        // Round the bit width down to a whole number of digits; the
        // partial leading digit keeps its high bits zero.
        let bits = (size + exp - 1) - (size + exp - 1) % exp;
        let count = (bits / exp) as usize;

        let mask = (1u128 << exp) - 1;
        let mut buf = vec![0u8; count];
        for (i, digit) in buf.iter_mut().enumerate() {
            let shift = bits - exp * (i as u32 + 1);
            *digit = ((self.0 >> shift) & mask) as u8;
        }
        Some(Digits(buf))
    }

    /// Parses a base-10 string. Rejects empty input, non-digit characters,
    /// and values past 2^128 - 1.
    pub fn parse(s: &str) -> Result<Id, ParseIdError> {
        if s.is_empty() {
            return Err(ParseIdError::Empty);
        }
        let mut value: u128 = 0;
        for c in s.bytes() {
            if !c.is_ascii_digit() {
                return Err(ParseIdError::UnexpectedChar(c as char));
            }
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add((c - b'0') as u128))
                .ok_or(ParseIdError::Overflow)?;
        }
        Ok(Id(value))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.0)
    }
}

impl FromStr for Id {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Id::parse(s)
    }
}

impl From<u128> for Id {
    fn from(v: u128) -> Self {
        Id(v)
    }
}

/// Failure to parse a base-10 ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseIdError {
    /// The input was empty.
    #[error("empty id")]
    Empty,
    /// The input held something other than a decimal digit.
    #[error("unexpected character {0:?} in id")]
    UnexpectedChar(char),
    /// The value exceeds 2^128 - 1.
    #[error("id overflow")]
    Overflow,
}

/// The max ID representable in `size` bits. `size` must be one of
/// 8, 16, 32, 64, 128.
pub fn max_for_size(size: u32) -> Id {
    match size {
        8 => Id(u8::MAX as u128),
        16 => Id(u16::MAX as u128),
        32 => Id(u32::MAX as u128),
        64 => Id(u64::MAX as u128),
        128 => MAX,
        _ => panic!("invalid id size {size}"),
    }
}

/// Number of digits an ID of bit-width `size` has in base `base`.
pub fn digit_count(size: u32, base: u32) -> usize {
    let exp = log2(base);
    let bits = (size + exp - 1) - (size + exp - 1) % exp;
    (bits / exp) as usize
}

fn log2(base: u32) -> u32 {
    match base {
        2 => 1,
        4 => 2,
        8 => 3,
        16 => 4,
        _ => panic!("invalid routing base {base}"),
    }
}

/// Digit decomposition of an [`Id`], most significant digit first. Each
/// digit is in `[0, base)`.
#[derive(Clone, PartialEq, Eq)]
pub struct Digits(Vec<u8>);

impl Digits {
    /// Number of digits.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there are no digits. Never the case for a supported
    /// size/base pair.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The digit at `index`.
    pub fn at(&self, index: usize) -> u8 {
        self.0[index]
    }

    /// Digits as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Digits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in &self.0 {
            write!(f, "{d:x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digits({self})")
    }
}

/// Count of leading equal digits of two decompositions of the same length.
/// Returns the full length when they are equal.
pub fn prefix(a: &Digits, b: &Digits) -> usize {
    debug_assert_eq!(a.len(), b.len(), "prefix over mismatched digit widths");
    a.0.iter().zip(b.0.iter()).take_while(|(x, y)| x == y).count()
}

/// Derives IDs of a fixed bit-width from input strings.
///
/// All digest bytes participate in the result: for widths below 128 the
/// big-endian halves of the MD5 digest are folded together with XOR before
/// reduction, so no entropy is discarded.
#[derive(Clone, Copy, Debug)]
pub struct Generator {
    size: u32,
}

impl Generator {
    /// Creates a generator for IDs of `size` bits. `size` must be one of
    /// 8, 16, 32, 64, 128.
    pub fn new(size: u32) -> Self {
        // Validate eagerly so a bad width fails at construction.
        let _ = max_for_size(size);
        Generator { size }
    }

    /// Hashes `input` into an ID that fits in the generator's bit-width.
    pub fn get(&self, input: &str) -> Id {
        let sum: [u8; 16] = Md5::digest(input.as_bytes()).into();
        let (high, low) = Id(u128::from_be_bytes(sum)).to_parts();

        match self.size {
            8 | 16 | 32 => {
                let max = max_for_size(self.size).0 as u64;
                Id(((high ^ low) % max) as u128)
            }
            64 => Id((high ^ low) as u128),
            128 => Id::from_parts(high, low),
            _ => unreachable!("size validated at construction"),
        }
    }
}
