// SPDX-License-Identifier: MPL-2.0

//! ElGamal encryption over the Ristretto group and commutative re-keying.
//!
//! The group is written additively, so "raising to the secret exponent `s`" is the scalar
//! multiplication `s·P`. Multiplying by `s1` and then `s2` gives `s1·s2·P` in either order, which
//! is what lets two helpers agree on a blinded bucket identifier without either one seeing the
//! bucket key.

use curve25519_dalek::{
    constants::RISTRETTO_BASEPOINT_POINT,
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
};
use rand::{CryptoRng, RngCore};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};
use std::fmt::{self, Debug, Formatter};

const HASH_TO_GROUP_DST: &[u8] = b"conversion-aggregation bucket key to group";

/// Errors propagated by methods in this module.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ElGamalError {
    /// The input is not the canonical encoding of a Ristretto point.
    #[error("invalid group element encoding")]
    InvalidGroupElement,

    /// The input is not the canonical encoding of a scalar.
    #[error("invalid scalar encoding")]
    InvalidScalar,
}

fn decompress(bytes: &[u8; 32]) -> Result<RistrettoPoint, ElGamalError> {
    CompressedRistretto(*bytes)
        .decompress()
        .ok_or(ElGamalError::InvalidGroupElement)
}

fn scalar_from_bytes(bytes: [u8; 32]) -> Result<Scalar, ElGamalError> {
    Option::from(Scalar::from_canonical_bytes(bytes)).ok_or(ElGamalError::InvalidScalar)
}

/// Hash an arbitrary byte string onto the group.
pub fn hash_to_group(message: &[u8]) -> RistrettoPoint {
    RistrettoPoint::from_hash(Sha512::new().chain_update(HASH_TO_GROUP_DST).chain_update(message))
}

/// ElGamal public (encryption) key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ElGamalPublicKey(RistrettoPoint);

impl ElGamalPublicKey {
    /// Encrypt the group element `message`.
    pub fn encrypt<R: RngCore + CryptoRng>(
        &self,
        message: &RistrettoPoint,
        rng: &mut R,
    ) -> ElGamalCiphertext {
        let r = Scalar::random(rng);
        ElGamalCiphertext::from_points(&(r * RISTRETTO_BASEPOINT_POINT), &(message + r * self.0))
    }

    /// Canonical 32-byte encoding.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.compress().to_bytes()
    }

    /// Decode a public key, rejecting invalid encodings.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, ElGamalError> {
        decompress(bytes).map(Self)
    }
}

impl Debug for ElGamalPublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("ElGamalPublicKey ")?;
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

/// ElGamal private (decryption) key.
#[derive(Clone)]
pub struct ElGamalPrivateKey(Scalar);

impl ElGamalPrivateKey {
    /// The matching public key.
    pub fn public_key(&self) -> ElGamalPublicKey {
        ElGamalPublicKey(self.0 * RISTRETTO_BASEPOINT_POINT)
    }

    /// Decrypt a ciphertext to the group element it encrypts.
    pub fn decrypt(&self, ciphertext: &ElGamalCiphertext) -> Result<RistrettoPoint, ElGamalError> {
        let (c1, c2) = ciphertext.to_points()?;
        Ok(c2 - self.0 * c1)
    }

    /// Canonical 32-byte encoding.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Decode a private key, rejecting non-canonical scalars.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, ElGamalError> {
        scalar_from_bytes(bytes).map(Self)
    }
}

impl Debug for ElGamalPrivateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("ElGamalPrivateKey(redacted)")
    }
}

/// Generate an ElGamal key pair.
pub fn generate_key_pair<R: RngCore + CryptoRng>(
    rng: &mut R,
) -> (ElGamalPrivateKey, ElGamalPublicKey) {
    let private_key = ElGamalPrivateKey(Scalar::random(rng));
    let public_key = private_key.public_key();
    (private_key, public_key)
}

/// A helper's private re-keying exponent.
#[derive(Clone)]
pub struct ExponentSecret(Scalar);

impl ExponentSecret {
    /// Canonical 32-byte encoding.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Decode a secret, rejecting non-canonical or zero scalars.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, ElGamalError> {
        let scalar = scalar_from_bytes(bytes)?;
        if scalar == Scalar::ZERO {
            return Err(ElGamalError::InvalidScalar);
        }
        Ok(Self(scalar))
    }

    /// Multiply a group element by this secret.
    pub fn exponentiate_point(&self, point: &RistrettoPoint) -> RistrettoPoint {
        self.0 * point
    }
}

impl Debug for ExponentSecret {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("ExponentSecret(redacted)")
    }
}

/// Generate a fresh non-zero re-keying exponent.
pub fn generate_secret<R: RngCore + CryptoRng>(rng: &mut R) -> ExponentSecret {
    loop {
        let scalar = Scalar::random(rng);
        if scalar != Scalar::ZERO {
            return ExponentSecret(scalar);
        }
    }
}

/// ElGamal ciphertext `(r·G, M + r·Y)`, stored in compressed form as received on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElGamalCiphertext {
    #[serde(with = "hex::serde")]
    c1: [u8; 32],
    #[serde(with = "hex::serde")]
    c2: [u8; 32],
}

impl ElGamalCiphertext {
    fn from_points(c1: &RistrettoPoint, c2: &RistrettoPoint) -> Self {
        Self {
            c1: c1.compress().to_bytes(),
            c2: c2.compress().to_bytes(),
        }
    }

    fn to_points(self) -> Result<(RistrettoPoint, RistrettoPoint), ElGamalError> {
        Ok((decompress(&self.c1)?, decompress(&self.c2)?))
    }

    /// Build a ciphertext from its two encoded components without validating them.
    pub fn from_bytes(c1: [u8; 32], c2: [u8; 32]) -> Self {
        Self { c1, c2 }
    }
}

/// Multiply both components of `ciphertext` by `secret`, so that it decrypts to `secret·M`.
///
/// Applying two secrets in either order yields the same plaintext.
pub fn exponentiate(
    ciphertext: &ElGamalCiphertext,
    secret: &ExponentSecret,
) -> Result<ElGamalCiphertext, ElGamalError> {
    let (c1, c2) = ciphertext.to_points()?;
    Ok(ElGamalCiphertext::from_points(
        &secret.exponentiate_point(&c1),
        &secret.exponentiate_point(&c2),
    ))
}

/// Exponentiate `ciphertext` and re-randomize it under `public_key`, the key it is encrypted
/// under, so the result cannot be linked to the input ciphertext.
pub fn exponentiate_and_rerandomize<R: RngCore + CryptoRng>(
    ciphertext: &ElGamalCiphertext,
    secret: &ExponentSecret,
    public_key: &ElGamalPublicKey,
    rng: &mut R,
) -> Result<ElGamalCiphertext, ElGamalError> {
    let (c1, c2) = exponentiate(ciphertext, secret)?.to_points()?;
    let r = Scalar::random(rng);
    Ok(ElGamalCiphertext::from_points(
        &(c1 + r * RISTRETTO_BASEPOINT_POINT),
        &(c2 + r * public_key.0),
    ))
}

impl Serialize for ElGamalPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        hex::serde::serialize(self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for ElGamalPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: [u8; 32] = hex::serde::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(de::Error::custom)
    }
}

impl Serialize for ElGamalPrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        hex::serde::serialize(self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for ElGamalPrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: [u8; 32] = hex::serde::deserialize(deserializer)?;
        Self::from_bytes(bytes).map_err(de::Error::custom)
    }
}

impl Serialize for ExponentSecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        hex::serde::serialize(self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for ExponentSecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: [u8; 32] = hex::serde::deserialize(deserializer)?;
        Self::from_bytes(bytes).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn encrypt_decrypt() {
        let mut rng = rand::thread_rng();
        let (sk, pk) = generate_key_pair(&mut rng);
        let m = hash_to_group(b"foo");
        let ct = pk.encrypt(&m, &mut rng);
        assert_eq!(sk.decrypt(&ct).unwrap(), m);

        let (other_sk, _) = generate_key_pair(&mut rng);
        assert_ne!(other_sk.decrypt(&ct).unwrap(), m);
    }

    #[test]
    fn hash_to_group_is_deterministic() {
        assert_eq!(hash_to_group(b"foo"), hash_to_group(b"foo"));
        assert_ne!(hash_to_group(b"foo"), hash_to_group(b"bar"));
    }

    #[test]
    fn exponentiation_commutes() {
        let mut rng = rand::thread_rng();
        let (sk, pk) = generate_key_pair(&mut rng);
        let s1 = generate_secret(&mut rng);
        let s2 = generate_secret(&mut rng);
        let m = hash_to_group(b"bucket");
        let ct = pk.encrypt(&m, &mut rng);

        let a = exponentiate(&exponentiate(&ct, &s1).unwrap(), &s2).unwrap();
        let b = exponentiate_and_rerandomize(
            &exponentiate(&ct, &s2).unwrap(),
            &s1,
            &pk,
            &mut rng,
        )
        .unwrap();
        assert_ne!(a, b);
        assert_eq!(sk.decrypt(&a).unwrap(), sk.decrypt(&b).unwrap());
        assert_eq!(
            sk.decrypt(&a).unwrap(),
            s1.exponentiate_point(&s2.exponentiate_point(&m))
        );
    }

    #[test]
    fn invalid_group_element() {
        let secret = generate_secret(&mut rand::thread_rng());
        let ct = ElGamalCiphertext::from_bytes([0xff; 32], [0xff; 32]);
        assert_matches!(
            exponentiate(&ct, &secret),
            Err(ElGamalError::InvalidGroupElement)
        );
        assert_matches!(
            ElGamalPublicKey::from_bytes(&[0xff; 32]),
            Err(ElGamalError::InvalidGroupElement)
        );
    }

    #[test]
    fn zero_secret_rejected() {
        assert_matches!(
            ExponentSecret::from_bytes([0; 32]),
            Err(ElGamalError::InvalidScalar)
        );
    }

    #[test]
    fn keys_serde() {
        let mut rng = rand::thread_rng();
        let (sk, pk) = generate_key_pair(&mut rng);
        let sk2: ElGamalPrivateKey =
            serde_json::from_str(&serde_json::to_string(&sk).unwrap()).unwrap();
        let pk2: ElGamalPublicKey =
            serde_json::from_str(&serde_json::to_string(&pk).unwrap()).unwrap();
        assert_eq!(sk2.public_key(), pk);
        assert_eq!(pk2, pk);
    }
}
