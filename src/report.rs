// SPDX-License-Identifier: MPL-2.0

//! Client reports: splitting a raw conversion into one partial report per helper, and opening a
//! helper's own partial report.
//!
//! Each partial report carries, sealed to its helper's transport key:
//!
//! - the bucket key hashed onto the group and ElGamal-encrypted to the *peer* helper, which is the
//!   input to the private join;
//! - this helper's XOR share of the bucket key, used to label the released bucket;
//! - this helper's additive share of the value in [`Field64`].

use crate::{
    elgamal::{hash_to_group, ElGamalCiphertext},
    field::Field64,
    hpke::{self, HpkeCiphertext, TransportError, TransportPrivateKey},
    keys::ServerPublicInfo,
    secret_share::{split_bytes_with_rng, split_int_with_rng, SecretShareError},
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

const PARTIAL_REPORT_INFO: &[u8] = b"conversion-aggregation partial report";

/// Errors propagated by methods in this module.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReportError {
    /// Sealing or opening the transport layer failed.
    #[error("transport encryption error: {0}")]
    Transport(#[from] TransportError),

    /// Secret sharing failed.
    #[error("secret sharing error: {0}")]
    SecretShare(#[from] SecretShareError),

    /// The decrypted payload is malformed.
    #[error("malformed report payload: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A raw conversion line could not be parsed.
    #[error("invalid raw conversion: {0}")]
    InvalidConversion(String),
}

/// Random identifier shared by the two halves of one report.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(#[serde(with = "hex::serde")] [u8; 16]);

impl ReportId {
    /// Draw a fresh random identifier.
    pub fn generate<R: RngCore + CryptoRng + ?Sized>(rng: &mut R) -> Self {
        let mut id = [0; 16];
        rng.fill_bytes(&mut id);
        Self(id)
    }

    /// Raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for ReportId {
    fn from(id: [u8; 16]) -> Self {
        Self(id)
    }
}

impl Display for ReportId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Debug for ReportId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ReportId({self})")
    }
}

/// A client conversion event before any cryptography is applied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawConversion {
    /// The bucket key the conversion is attributed to.
    #[serde(with = "hex::serde")]
    pub bucket_key: Vec<u8>,
    /// The conversion value.
    pub value: u16,
}

impl RawConversion {
    /// Construct a conversion for a UTF-8 bucket key.
    pub fn new(bucket_key: impl Into<Vec<u8>>, value: u16) -> Self {
        Self {
            bucket_key: bucket_key.into(),
            value,
        }
    }
}

impl FromStr for RawConversion {
    type Err = ReportError;

    /// Parse a `bucket_key,value` line.
    fn from_str(line: &str) -> Result<Self, ReportError> {
        let (key, value) = line
            .trim()
            .rsplit_once(',')
            .ok_or_else(|| ReportError::InvalidConversion(format!("missing comma in {line:?}")))?;
        let value = value
            .trim()
            .parse::<u16>()
            .map_err(|e| ReportError::InvalidConversion(format!("bad value in {line:?}: {e}")))?;
        Ok(Self::new(key, value))
    }
}

/// One helper's encrypted half of a raw conversion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialReport {
    /// Identifier shared with the other half.
    pub report_id: ReportId,
    /// Payload sealed to the owning helper.
    pub encrypted_payload: HpkeCiphertext,
}

#[derive(Serialize, Deserialize)]
struct PartialReportPayload {
    encrypted_key: ElGamalCiphertext,
    #[serde(with = "hex::serde")]
    key_share: Vec<u8>,
    value_share: Field64,
}

/// A partial report after the transport layer has been removed. The bucket key is still
/// ElGamal-encrypted to the peer helper.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedReport {
    /// Identifier shared with the other half.
    pub report_id: ReportId,
    /// Hashed bucket key, encrypted to the peer helper's ElGamal key.
    pub encrypted_key: ElGamalCiphertext,
    /// This helper's XOR share of the bucket key.
    #[serde(with = "hex::serde")]
    pub key_share: Vec<u8>,
    /// This helper's share of the value.
    pub value_share: Field64,
}

fn report_info(report_id: &ReportId) -> Vec<u8> {
    [PARTIAL_REPORT_INFO, report_id.as_bytes()].concat()
}

/// Split `conversion` into the partial reports for helper 1 and helper 2. Either both halves are
/// produced or an error is returned.
pub fn split_conversion<R: RngCore + CryptoRng>(
    conversion: &RawConversion,
    helper1: &ServerPublicInfo,
    helper2: &ServerPublicInfo,
    rng: &mut R,
) -> Result<[PartialReport; 2], ReportError> {
    let report_id = ReportId::generate(rng);
    let info = report_info(&report_id);
    let point = hash_to_group(&conversion.bucket_key);
    let (key_share1, key_share2) = split_bytes_with_rng(&conversion.bucket_key, rng)?;
    let (value_share1, value_share2) =
        split_int_with_rng(u64::from(conversion.value), Field64::MODULUS, rng)?;

    let mut seal_for = |owner: &ServerPublicInfo,
                        peer: &ServerPublicInfo,
                        key_share: Vec<u8>,
                        value_share: u64|
     -> Result<PartialReport, ReportError> {
        let payload = PartialReportPayload {
            encrypted_key: peer.elgamal_public_key.encrypt(&point, rng),
            key_share,
            value_share: Field64::from(value_share),
        };
        let plaintext = serde_json::to_vec(&payload)?;
        Ok(PartialReport {
            report_id,
            encrypted_payload: hpke::seal(&owner.transport_public_key, &info, &plaintext, rng)?,
        })
    };

    let report1 = seal_for(helper1, helper2, key_share1, value_share1)?;
    let report2 = seal_for(helper2, helper1, key_share2, value_share2)?;
    Ok([report1, report2])
}

/// Remove the transport layer of a helper's own partial report.
pub fn decrypt_partial_report(
    report: &PartialReport,
    transport_private_key: &TransportPrivateKey,
) -> Result<DecryptedReport, ReportError> {
    let plaintext = hpke::open(
        transport_private_key,
        &report_info(&report.report_id),
        &report.encrypted_payload,
    )?;
    let payload: PartialReportPayload = serde_json::from_slice(&plaintext)?;
    Ok(DecryptedReport {
        report_id: report.report_id,
        encrypted_key: payload.encrypted_key,
        key_share: payload.key_share,
        value_share: payload.value_share,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{keys::ServerKeyMaterial, secret_share::combine_bytes};
    use assert_matches::assert_matches;

    #[test]
    fn split_then_decrypt_reproduces_conversion() {
        let mut rng = rand::thread_rng();
        let helper1 = ServerKeyMaterial::generate(&mut rng);
        let helper2 = ServerKeyMaterial::generate(&mut rng);
        let conversion = RawConversion::new("foo", 1234);

        let [report1, report2] = split_conversion(
            &conversion,
            &helper1.public_info(),
            &helper2.public_info(),
            &mut rng,
        )
        .unwrap();
        assert_eq!(report1.report_id, report2.report_id);

        let decrypted1 = decrypt_partial_report(&report1, &helper1.transport_private_key).unwrap();
        let decrypted2 = decrypt_partial_report(&report2, &helper2.transport_private_key).unwrap();

        assert_eq!(
            combine_bytes(&decrypted1.key_share, &decrypted2.key_share).unwrap(),
            b"foo"
        );
        assert_eq!(
            decrypted1.value_share + decrypted2.value_share,
            Field64::from(1234)
        );

        // Each half carries the bucket key encrypted to the other helper.
        let point = hash_to_group(b"foo");
        assert_eq!(
            helper2
                .elgamal_private_key
                .decrypt(&decrypted1.encrypted_key)
                .unwrap(),
            point
        );
        assert_eq!(
            helper1
                .elgamal_private_key
                .decrypt(&decrypted2.encrypted_key)
                .unwrap(),
            point
        );
    }

    #[test]
    fn report_ids_are_unique() {
        let mut rng = rand::thread_rng();
        let helper1 = ServerKeyMaterial::generate(&mut rng).public_info();
        let helper2 = ServerKeyMaterial::generate(&mut rng).public_info();
        let conversion = RawConversion::new("bar", 2);
        let mut ids = std::collections::HashSet::new();
        for _ in 0..20 {
            let [report, _] = split_conversion(&conversion, &helper1, &helper2, &mut rng).unwrap();
            assert!(ids.insert(report.report_id));
        }
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let mut rng = rand::thread_rng();
        let helper1 = ServerKeyMaterial::generate(&mut rng);
        let helper2 = ServerKeyMaterial::generate(&mut rng);
        let [report1, _] = split_conversion(
            &RawConversion::new("foo", 1),
            &helper1.public_info(),
            &helper2.public_info(),
            &mut rng,
        )
        .unwrap();

        assert_matches!(
            decrypt_partial_report(&report1, &helper2.transport_private_key),
            Err(ReportError::Transport(TransportError::DecryptionError))
        );

        // The report id is bound into the ciphertext.
        let mut relabelled = report1.clone();
        relabelled.report_id = ReportId::generate(&mut rng);
        assert_matches!(
            decrypt_partial_report(&relabelled, &helper1.transport_private_key),
            Err(ReportError::Transport(TransportError::DecryptionError))
        );
    }

    #[test]
    fn parse_raw_conversion() {
        assert_eq!(
            "foo,1".parse::<RawConversion>().unwrap(),
            RawConversion::new("foo", 1)
        );
        assert_eq!(
            "a,b, 65535\n".parse::<RawConversion>().unwrap(),
            RawConversion::new("a,b", u16::MAX)
        );
        assert_matches!(
            "foo".parse::<RawConversion>(),
            Err(ReportError::InvalidConversion(_))
        );
        assert_matches!(
            "foo,65536".parse::<RawConversion>(),
            Err(ReportError::InvalidConversion(_))
        );
    }
}
