// SPDX-License-Identifier: MPL-2.0

//! Two-party secret sharing of byte strings (XOR) and integers (additive modulo `m`).
//!
//! Every split draws fresh randomness, so splitting the same input twice yields unrelated share
//! pairs.

use rand::{CryptoRng, Rng, RngCore};

/// Errors propagated by methods in this module.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SecretShareError {
    /// The two byte shares have different lengths.
    #[error("share lengths differ: {left} != {right}")]
    LengthMismatch {
        /// Length of the first share.
        left: usize,
        /// Length of the second share.
        right: usize,
    },

    /// Integer shares require a non-zero modulus.
    #[error("modulus must be non-zero")]
    InvalidModulus,

    /// The value to split is not reduced modulo the modulus.
    #[error("value {value} is not less than modulus {modulus}")]
    ValueOutOfRange {
        /// Value passed to the split.
        value: u64,
        /// Modulus passed to the split.
        modulus: u64,
    },

    /// The random source failed.
    #[error("random source failure: {0}")]
    Rng(#[from] rand::Error),
}

/// Split `data` into two XOR shares using the thread-local CSPRNG.
pub fn split_bytes(data: &[u8]) -> Result<(Vec<u8>, Vec<u8>), SecretShareError> {
    split_bytes_with_rng(data, &mut rand::thread_rng())
}

/// Split `data` into two XOR shares: the first is uniformly random, the second is `data` XOR the
/// first.
pub fn split_bytes_with_rng<R: RngCore + CryptoRng + ?Sized>(
    data: &[u8],
    rng: &mut R,
) -> Result<(Vec<u8>, Vec<u8>), SecretShareError> {
    let mut share1 = vec![0; data.len()];
    rng.try_fill_bytes(&mut share1)?;
    let share2 = data.iter().zip(&share1).map(|(d, s)| d ^ s).collect();
    Ok((share1, share2))
}

/// Reconstruct a byte string from its two XOR shares.
pub fn combine_bytes(share1: &[u8], share2: &[u8]) -> Result<Vec<u8>, SecretShareError> {
    if share1.len() != share2.len() {
        return Err(SecretShareError::LengthMismatch {
            left: share1.len(),
            right: share2.len(),
        });
    }
    Ok(share1.iter().zip(share2).map(|(a, b)| a ^ b).collect())
}

/// Split `value` into two additive shares modulo `modulus` using the thread-local CSPRNG.
pub fn split_int(value: u64, modulus: u64) -> Result<(u64, u64), SecretShareError> {
    split_int_with_rng(value, modulus, &mut rand::thread_rng())
}

/// Split `value` into two additive shares modulo `modulus`: the first is uniform in
/// `[0, modulus)`, the second is `(value - share1) mod modulus`.
pub fn split_int_with_rng<R: RngCore + CryptoRng + ?Sized>(
    value: u64,
    modulus: u64,
    rng: &mut R,
) -> Result<(u64, u64), SecretShareError> {
    if modulus == 0 {
        return Err(SecretShareError::InvalidModulus);
    }
    if value >= modulus {
        return Err(SecretShareError::ValueOutOfRange { value, modulus });
    }
    let share1 = rng.gen_range(0..modulus);
    let share2 = if value >= share1 {
        value - share1
    } else {
        modulus - (share1 - value)
    };
    Ok((share1, share2))
}

/// Reconstruct an integer from its two additive shares modulo `modulus`.
pub fn combine_int(share1: u64, share2: u64, modulus: u64) -> Result<u64, SecretShareError> {
    if modulus == 0 {
        return Err(SecretShareError::InvalidModulus);
    }
    let sum = (u128::from(share1) + u128::from(share2)) % u128::from(modulus);
    // sum < modulus <= u64::MAX
    Ok(sum as u64)
}
