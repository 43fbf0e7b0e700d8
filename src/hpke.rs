// SPDX-License-Identifier: MPL-2.0

//! Transport-layer public key encryption with [HPKE] (base mode, X25519 / HKDF-SHA256 /
//! AES-128-GCM).
//!
//! Partial reports are sealed to the helper that owns them, and DPF key halves are sealed to the
//! peer helper that will evaluate them. The `info` string binds each ciphertext to its purpose and
//! report.
//!
//! [HPKE]: https://datatracker.ietf.org/doc/html/rfc9180

use hpke::{
    aead::AeadTag, single_shot_open_in_place_detached, single_shot_seal_in_place_detached,
    Deserializable, Kem as _, OpModeR, OpModeS, Serializable,
};
use rand::{CryptoRng, RngCore};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Debug, Formatter};

type Kem = hpke::kem::X25519HkdfSha256;
type Aead = hpke::aead::AesGcm128;
type Kdf = hpke::kdf::HkdfSha256;

type EncappedKey = <Kem as hpke::Kem>::EncappedKey;

/// Errors propagated by methods in this module.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The ciphertext could not be opened: wrong key, wrong context or tampered bytes.
    #[error("failed to decrypt ciphertext")]
    DecryptionError,

    /// Sealing failed.
    #[error("failed to encrypt plaintext")]
    EncryptionError,

    /// A key could not be decoded.
    #[error("invalid transport key encoding")]
    InvalidKey,
}

/// HPKE public key of a helper.
#[derive(Clone)]
pub struct TransportPublicKey(<Kem as hpke::Kem>::PublicKey);

impl PartialEq for TransportPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bytes() == other.0.to_bytes()
    }
}

impl Eq for TransportPublicKey {}

impl TransportPublicKey {
    /// Encoded key bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    /// Decode a public key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        <Kem as hpke::Kem>::PublicKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| TransportError::InvalidKey)
    }
}

impl Debug for TransportPublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("TransportPublicKey ")?;
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

/// HPKE private key of a helper.
#[derive(Clone)]
pub struct TransportPrivateKey(<Kem as hpke::Kem>::PrivateKey);

impl TransportPrivateKey {
    /// Encoded key bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    /// Decode a private key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        <Kem as hpke::Kem>::PrivateKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| TransportError::InvalidKey)
    }

    /// The matching public key.
    pub fn public_key(&self) -> TransportPublicKey {
        TransportPublicKey(Kem::sk_to_pk(&self.0))
    }
}

impl Debug for TransportPrivateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("TransportPrivateKey(redacted)")
    }
}

/// Generate an HPKE key pair.
pub fn generate_key_pair<R: RngCore + CryptoRng>(
    rng: &mut R,
) -> (TransportPrivateKey, TransportPublicKey) {
    let (sk, pk) = Kem::gen_keypair(rng);
    (TransportPrivateKey(sk), TransportPublicKey(pk))
}

/// A sealed message: the encapsulated key and the AEAD ciphertext with its tag appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpkeCiphertext {
    /// Encapsulated ephemeral key.
    #[serde(with = "hex::serde")]
    pub encapsulated_key: Vec<u8>,
    /// Ciphertext followed by the authentication tag.
    #[serde(with = "hex::serde")]
    pub payload: Vec<u8>,
}

/// Seal `plaintext` to `public_key` under the context string `info`.
pub fn seal<R: RngCore + CryptoRng>(
    public_key: &TransportPublicKey,
    info: &[u8],
    plaintext: &[u8],
    rng: &mut R,
) -> Result<HpkeCiphertext, TransportError> {
    let mut payload = plaintext.to_vec();
    let (encapsulated_key, tag) = single_shot_seal_in_place_detached::<Aead, Kdf, Kem, _>(
        &OpModeS::Base,
        &public_key.0,
        info,
        &mut payload,
        &[],
        rng,
    )
    .map_err(|_| TransportError::EncryptionError)?;
    payload.extend_from_slice(&tag.to_bytes());
    Ok(HpkeCiphertext {
        encapsulated_key: encapsulated_key.to_bytes().to_vec(),
        payload,
    })
}

/// Open a ciphertext sealed to `private_key` under the context string `info`.
pub fn open(
    private_key: &TransportPrivateKey,
    info: &[u8],
    ciphertext: &HpkeCiphertext,
) -> Result<Vec<u8>, TransportError> {
    let encapsulated_key = EncappedKey::from_bytes(&ciphertext.encapsulated_key)
        .map_err(|_| TransportError::DecryptionError)?;
    let tag_len = AeadTag::<Aead>::size();
    let ct_len = ciphertext
        .payload
        .len()
        .checked_sub(tag_len)
        .ok_or(TransportError::DecryptionError)?;
    let mut plaintext = ciphertext.payload[..ct_len].to_vec();
    let tag = AeadTag::<Aead>::from_bytes(&ciphertext.payload[ct_len..])
        .map_err(|_| TransportError::DecryptionError)?;

    single_shot_open_in_place_detached::<_, Kdf, Kem>(
        &OpModeR::Base,
        &private_key.0,
        &encapsulated_key,
        info,
        &mut plaintext,
        &[],
        &tag,
    )
    .map_err(|_| TransportError::DecryptionError)?;
    Ok(plaintext)
}

impl Serialize for TransportPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        hex::serde::serialize(self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for TransportPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = hex::serde::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(de::Error::custom)
    }
}

impl Serialize for TransportPrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        hex::serde::serialize(self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for TransportPrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = hex::serde::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(de::Error::custom)
    }
}
