// SPDX-License-Identifier: MPL-2.0

//! Finite field arithmetic.
//!
//! Value shares and DPF payloads live in `GF(p)` for the 64-bit prime
//! `p = 2^64 - 2^32 + 1`. Sums of many 16-bit contributions stay far below `p`, so
//! reconstructed totals never wrap.

use rand_core::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt::{self, Display, Formatter},
    iter::Sum,
    ops::{Add, AddAssign, Neg, Sub, SubAssign},
};
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};

/// Possible errors from finite field operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FieldError {
    /// Returned when converting an integer larger than or equal to the field modulus.
    #[error("integer exceeds modulus")]
    ModulusOverflow,
    /// Returned when decoding a field element from a short byte string.
    #[error("short read from bytes")]
    ShortRead,
}

/// An element of the prime field `GF(2^64 - 2^32 + 1)`.
///
/// The inner integer is always the canonical representative in `[0, p)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Field64(u64);

impl Field64 {
    /// The field modulus.
    pub const MODULUS: u64 = 0xffff_ffff_0000_0001;

    /// Size in bytes of an encoded element.
    pub const ENCODED_SIZE: usize = 8;

    /// The additive identity.
    pub const ZERO: Self = Self(0);

    /// The multiplicative identity.
    pub const ONE: Self = Self(1);

    /// Returns the canonical integer representative of this element.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Maps a signed integer into the field, sending negative values to `p - |v|`.
    pub fn from_signed(value: i64) -> Self {
        let magnitude = Self::from(value.unsigned_abs());
        if value < 0 {
            -magnitude
        } else {
            magnitude
        }
    }

    /// Interprets the element as a signed integer: representatives above `(p - 1) / 2` are
    /// read as negative.
    pub fn to_signed(self) -> i64 {
        if self.0 > Self::MODULUS / 2 {
            // MODULUS - self.0 <= MODULUS / 2 < i64::MAX
            -((Self::MODULUS - self.0) as i64)
        } else {
            self.0 as i64
        }
    }

    /// Samples a uniformly random element by rejection sampling 8-byte little-endian words from
    /// `rng`.
    pub fn generate<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut buf = [0; Self::ENCODED_SIZE];
        loop {
            rng.fill_bytes(&mut buf);
            let candidate = u64::from_le_bytes(buf);
            if candidate < Self::MODULUS {
                return Self(candidate);
            }
        }
    }

    /// Like `From<u64>`, but rejects values that are not canonical representatives.
    fn try_from_u64(value: u64) -> Result<Self, FieldError> {
        if value >= Self::MODULUS {
            return Err(FieldError::ModulusOverflow);
        }
        Ok(Self(value))
    }

    /// Encodes the element as 8 little-endian bytes.
    pub fn to_le_bytes(self) -> [u8; Self::ENCODED_SIZE] {
        self.0.to_le_bytes()
    }

    /// Decodes an element from 8 little-endian bytes, rejecting non-canonical encodings.
    pub fn try_from_le_bytes(bytes: &[u8]) -> Result<Self, FieldError> {
        let bytes: [u8; Self::ENCODED_SIZE] = bytes
            .get(..Self::ENCODED_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(FieldError::ShortRead)?;
        Self::try_from_u64(u64::from_le_bytes(bytes))
    }
}

impl From<u64> for Field64 {
    /// Reduces `value` modulo `p`.
    fn from(value: u64) -> Self {
        // A u64 is less than 2p, so one conditional subtraction suffices.
        if value >= Self::MODULUS {
            Self(value - Self::MODULUS)
        } else {
            Self(value)
        }
    }
}

impl Add for Field64 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        let sum = u128::from(self.0) + u128::from(rhs.0);
        // sum < 2p, so the reduced value fits in a u64.
        Self((sum % u128::from(Self::MODULUS)) as u64)
    }
}

impl AddAssign for Field64 {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Field64 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self + (-rhs)
    }
}

impl SubAssign for Field64 {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Neg for Field64 {
    type Output = Self;

    fn neg(self) -> Self {
        -&self
    }
}

impl Neg for &Field64 {
    type Output = Field64;

    fn neg(self) -> Field64 {
        if self.0 == 0 {
            Field64::ZERO
        } else {
            Field64(Field64::MODULUS - self.0)
        }
    }
}

impl Sum for Field64 {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl ConstantTimeEq for Field64 {
    fn ct_eq(&self, other: &Self) -> Choice {
        self.0.ct_eq(&other.0)
    }
}

impl ConditionallySelectable for Field64 {
    fn conditional_select(a: &Self, b: &Self, choice: Choice) -> Self {
        Self(u64::conditional_select(&a.0, &b.0, choice))
    }
}

impl Display for Field64 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Field64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for Field64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u64::deserialize(deserializer)?;
        Self::try_from_u64(value).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rand::{rngs::StdRng, SeedableRng};
    use subtle::ConditionallyNegatable;

    #[test]
    fn arithmetic_wraps_at_modulus() {
        let max = Field64::from(Field64::MODULUS - 1);
        assert_eq!(max + Field64::ONE, Field64::ZERO);
        assert_eq!(Field64::ZERO - Field64::ONE, max);
        assert_eq!(-Field64::ZERO, Field64::ZERO);
        assert_eq!(max + max, Field64::from(Field64::MODULUS - 2));
        assert_eq!(Field64::from(Field64::MODULUS), Field64::ZERO);
        assert_eq!(Field64::from(u64::MAX), Field64::from(u64::MAX - Field64::MODULUS));
    }

    #[test]
    fn signed_conversion() {
        for v in [0, 1, -1, 42, -42, i64::from(u16::MAX) * 1000, -(1 << 40)] {
            assert_eq!(Field64::from_signed(v).to_signed(), v);
        }
        assert_eq!(Field64::from(3) - Field64::from(5), Field64::from_signed(-2));
    }

    #[test]
    fn conditional_negate() {
        let mut x = Field64::from(7);
        x.conditional_negate(Choice::from(0));
        assert_eq!(x, Field64::from(7));
        x.conditional_negate(Choice::from(1));
        assert_eq!(x, Field64::from_signed(-7));
    }

    #[test]
    fn byte_encoding() {
        let x = Field64::from(0x0102_0304_0506_0708);
        assert_eq!(Field64::try_from_le_bytes(&x.to_le_bytes()).unwrap(), x);
        assert_matches!(
            Field64::try_from_le_bytes(&[1, 2, 3]),
            Err(FieldError::ShortRead)
        );
        assert_matches!(
            Field64::try_from_le_bytes(&u64::MAX.to_le_bytes()),
            Err(FieldError::ModulusOverflow)
        );
    }

    #[test]
    fn serde_rejects_non_canonical() {
        let x = Field64::from(1234);
        let json = serde_json::to_string(&x).unwrap();
        assert_eq!(json, "1234");
        assert_eq!(serde_json::from_str::<Field64>(&json).unwrap(), x);
        assert!(serde_json::from_str::<Field64>(&u64::MAX.to_string()).is_err());
    }

    #[test]
    fn generate_is_canonical() {
        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..1000 {
            assert!(Field64::generate(&mut rng).as_u64() < Field64::MODULUS);
        }
    }
}
