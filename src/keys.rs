// SPDX-License-Identifier: MPL-2.0

//! Helper key material.
//!
//! A helper owns an ElGamal key pair (the peer encrypts blinded bucket keys to it), a commutative
//! re-keying secret and an HPKE key pair for transport encryption. Only the public half is ever
//! handed to clients or to the peer helper.

use crate::{
    elgamal::{self, ElGamalPrivateKey, ElGamalPublicKey, ExponentSecret},
    hpke::{self, TransportPrivateKey, TransportPublicKey},
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

/// The private key collection of one helper.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerKeyMaterial {
    /// Decrypts bucket keys that clients and the peer encrypted to this helper.
    pub elgamal_private_key: ElGamalPrivateKey,
    /// Re-keying exponent used in the private join.
    pub secret: ExponentSecret,
    /// Opens partial reports and DPF key halves sealed to this helper.
    pub transport_private_key: TransportPrivateKey,
}

impl ServerKeyMaterial {
    /// Generate fresh key material for a helper.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let (elgamal_private_key, _) = elgamal::generate_key_pair(rng);
        let (transport_private_key, _) = hpke::generate_key_pair(rng);
        Self {
            elgamal_private_key,
            secret: elgamal::generate_secret(rng),
            transport_private_key,
        }
    }

    /// The public information clients and the peer helper need.
    pub fn public_info(&self) -> ServerPublicInfo {
        ServerPublicInfo {
            elgamal_public_key: self.elgamal_private_key.public_key(),
            transport_public_key: self.transport_private_key.public_key(),
        }
    }
}

/// The public keys of one helper.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPublicInfo {
    /// ElGamal encryption key.
    pub elgamal_public_key: ElGamalPublicKey,
    /// HPKE public key.
    pub transport_public_key: TransportPublicKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_key_collection_round_trip() {
        let keys = ServerKeyMaterial::generate(&mut rand::thread_rng());
        let json = serde_json::to_string(&keys).unwrap();
        let decoded: ServerKeyMaterial = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.public_info(), keys.public_info());
        assert_eq!(decoded.secret.to_bytes(), keys.secret.to_bytes());
    }

    #[test]
    fn helpers_get_distinct_keys() {
        let mut rng = rand::thread_rng();
        let a = ServerKeyMaterial::generate(&mut rng);
        let b = ServerKeyMaterial::generate(&mut rng);
        assert_ne!(a.public_info(), b.public_info());
    }
}
