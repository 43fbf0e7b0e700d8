// SPDX-License-Identifier: MPL-2.0

//! Private join of bucket keys between the two helpers.
//!
//! Helper `h` holds `Enc_peer(P)` where `P` is the hashed bucket key. The join runs in two rounds:
//!
//! 1. [`exponentiate_key`]: `h` multiplies the ciphertext by its secret `s_h`, re-randomizes it and
//!    sends `Enc_peer(s_h·P)` to the peer.
//! 2. [`rekey_by_aggregation_id`]: on receiving `Enc_h(s_peer·P)`, `h` decrypts it and multiplies by
//!    `s_h`, obtaining `s_1·s_2·P`, which it hashes into its [`AggregationIdShare`].
//!
//! Both helpers end up with the same value for a report, and two reports get the same value iff
//! their bucket keys were equal. Neither helper sees `P` or `s_1·s_2·P` for a key it could test on
//! its own, because the other helper's secret is required.

use crate::{
    elgamal::{
        self, ElGamalCiphertext, ElGamalError, ElGamalPrivateKey, ElGamalPublicKey,
        ExponentSecret,
    },
    field::Field64,
    report::{DecryptedReport, ReportId},
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

const AGGREGATION_ID_DST: &[u8] = b"conversion-aggregation aggregation id";

/// Errors propagated by methods in this module.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum JoinError {
    /// An exponentiation or decryption failed.
    #[error("group operation failed: {0}")]
    ElGamal(#[from] ElGamalError),

    /// A message or share refers to a different report than the one it is combined with.
    #[error("report id mismatch: expected {expected}, got {got}")]
    ReportIdMismatch {
        /// Report the local state belongs to.
        expected: ReportId,
        /// Report named by the incoming value.
        got: ReportId,
    },

    /// A transition was attempted from the wrong state.
    #[error("report {report_id}: cannot {action} in state {state}")]
    UnexpectedState {
        /// Report whose state machine was misused.
        report_id: ReportId,
        /// The attempted transition.
        action: &'static str,
        /// The current state.
        state: &'static str,
    },

    /// The requested bucket bit length is outside `1..=64`.
    #[error("invalid bucket bit length {0}")]
    InvalidBitLength(u32),
}

/// The blinded key a helper sends to its peer in the first join round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExponentiatedKey {
    /// Report the key belongs to.
    pub report_id: ReportId,
    /// `Enc_peer(s_h·P)`.
    pub ciphertext: ElGamalCiphertext,
}

/// A helper's share of the aggregation identifier of one report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationIdShare {
    /// Report the share belongs to.
    pub report_id: ReportId,
    /// Hash of the doubly-blinded bucket key.
    #[serde(with = "hex::serde")]
    pub value: [u8; 32],
}

impl AggregationIdShare {
    /// Combine the two helpers' shares of one report into the aggregation identifier. Returns
    /// `None` if the shares disagree.
    pub fn combine(&self, other: &AggregationIdShare) -> Result<Option<[u8; 32]>, JoinError> {
        if self.report_id != other.report_id {
            return Err(JoinError::ReportIdMismatch {
                expected: self.report_id,
                got: other.report_id,
            });
        }
        Ok((self.value == other.value).then_some(self.value))
    }

    /// The `bit_length`-bit bucket identifier, taken from the leading bits of the share.
    pub fn bucket_id(&self, bit_length: u32) -> Result<u64, JoinError> {
        if !(1..=64).contains(&bit_length) {
            return Err(JoinError::InvalidBitLength(bit_length));
        }
        let mut prefix = [0; 8];
        prefix.copy_from_slice(&self.value[..8]);
        Ok(u64::from_be_bytes(prefix) >> (64 - bit_length))
    }
}

/// What a helper carries from a joined report into DPF key generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationPayload {
    /// Report the payload belongs to.
    pub report_id: ReportId,
    /// This helper's share of the value.
    pub value_share: Field64,
    /// This helper's XOR share of the bucket key.
    #[serde(with = "hex::serde")]
    pub key_share: Vec<u8>,
}

/// First join round: blind the locally held encrypted key with `own_secret` and re-randomize it
/// under `peer_public_key`.
pub fn exponentiate_key<R: RngCore + CryptoRng>(
    report: &DecryptedReport,
    own_secret: &ExponentSecret,
    peer_public_key: &ElGamalPublicKey,
    rng: &mut R,
) -> Result<ExponentiatedKey, JoinError> {
    Ok(ExponentiatedKey {
        report_id: report.report_id,
        ciphertext: elgamal::exponentiate_and_rerandomize(
            &report.encrypted_key,
            own_secret,
            peer_public_key,
            rng,
        )?,
    })
}

/// Second join round: unwrap the peer's blinded key and derive this helper's aggregation id share.
pub fn rekey_by_aggregation_id(
    peer_key: &ExponentiatedKey,
    report: &DecryptedReport,
    own_private_key: &ElGamalPrivateKey,
    own_secret: &ExponentSecret,
) -> Result<(AggregationIdShare, AggregationPayload), JoinError> {
    if peer_key.report_id != report.report_id {
        return Err(JoinError::ReportIdMismatch {
            expected: report.report_id,
            got: peer_key.report_id,
        });
    }
    let peer_blinded = own_private_key.decrypt(&peer_key.ciphertext)?;
    let blinded = own_secret.exponentiate_point(&peer_blinded);
    let value = Sha3_256::new()
        .chain_update(AGGREGATION_ID_DST)
        .chain_update(blinded.compress().as_bytes())
        .finalize()
        .into();

    Ok((
        AggregationIdShare {
            report_id: report.report_id,
            value,
        },
        AggregationPayload {
            report_id: report.report_id,
            value_share: report.value_share,
            key_share: report.key_share.clone(),
        },
    ))
}

/// Join progress of one report at one helper.
#[derive(Clone, Debug)]
pub enum JoinState {
    /// The partial report has been decrypted.
    Decrypted(DecryptedReport),
    /// The blinded key has been sent to the peer.
    Exponentiated(DecryptedReport),
    /// The peer's blinded key has arrived.
    ReceivedPeerExponentiated {
        /// The local report.
        report: DecryptedReport,
        /// The peer's first-round message.
        peer_key: ExponentiatedKey,
    },
    /// The aggregation id share has been derived.
    Rekeyed(AggregationIdShare),
}

impl JoinState {
    fn name(&self) -> &'static str {
        match self {
            JoinState::Decrypted(_) => "Decrypted",
            JoinState::Exponentiated(_) => "Exponentiated",
            JoinState::ReceivedPeerExponentiated { .. } => "ReceivedPeerExponentiated",
            JoinState::Rekeyed(_) => "Rekeyed",
        }
    }

    fn report_id(&self) -> ReportId {
        match self {
            JoinState::Decrypted(report)
            | JoinState::Exponentiated(report)
            | JoinState::ReceivedPeerExponentiated { report, .. } => report.report_id,
            JoinState::Rekeyed(share) => share.report_id,
        }
    }

    fn unexpected(&self, action: &'static str) -> JoinError {
        JoinError::UnexpectedState {
            report_id: self.report_id(),
            action,
            state: self.name(),
        }
    }

    /// `Decrypted → Exponentiated`, producing the message for the peer.
    pub fn exponentiate<R: RngCore + CryptoRng>(
        self,
        own_secret: &ExponentSecret,
        peer_public_key: &ElGamalPublicKey,
        rng: &mut R,
    ) -> Result<(JoinState, ExponentiatedKey), JoinError> {
        match self {
            JoinState::Decrypted(report) => {
                let message = exponentiate_key(&report, own_secret, peer_public_key, rng)?;
                Ok((JoinState::Exponentiated(report), message))
            }
            other => Err(other.unexpected("exponentiate")),
        }
    }

    /// `Exponentiated → ReceivedPeerExponentiated`.
    pub fn receive_peer(self, peer_key: ExponentiatedKey) -> Result<JoinState, JoinError> {
        match self {
            JoinState::Exponentiated(report) => {
                if peer_key.report_id != report.report_id {
                    return Err(JoinError::ReportIdMismatch {
                        expected: report.report_id,
                        got: peer_key.report_id,
                    });
                }
                Ok(JoinState::ReceivedPeerExponentiated { report, peer_key })
            }
            other => Err(other.unexpected("receive peer key")),
        }
    }

    /// `ReceivedPeerExponentiated → Rekeyed`.
    pub fn rekey(
        self,
        own_private_key: &ElGamalPrivateKey,
        own_secret: &ExponentSecret,
    ) -> Result<(JoinState, AggregationIdShare, AggregationPayload), JoinError> {
        match self {
            JoinState::ReceivedPeerExponentiated { report, peer_key } => {
                let (share, payload) =
                    rekey_by_aggregation_id(&peer_key, &report, own_private_key, own_secret)?;
                Ok((JoinState::Rekeyed(share.clone()), share, payload))
            }
            other => Err(other.unexpected("rekey")),
        }
    }

    /// Whether the peer's first-round message is still outstanding.
    pub fn awaiting_peer(&self) -> bool {
        matches!(self, JoinState::Exponentiated(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        keys::ServerKeyMaterial,
        report::{decrypt_partial_report, split_conversion, RawConversion},
    };
    use assert_matches::assert_matches;

    struct Helpers {
        one: ServerKeyMaterial,
        two: ServerKeyMaterial,
    }

    impl Helpers {
        fn new() -> Self {
            let mut rng = rand::thread_rng();
            Self {
                one: ServerKeyMaterial::generate(&mut rng),
                two: ServerKeyMaterial::generate(&mut rng),
            }
        }

        /// Runs both join rounds for one conversion and returns the two helpers' shares.
        fn join(&self, bucket_key: &str) -> [AggregationIdShare; 2] {
            let mut rng = rand::thread_rng();
            let [report1, report2] = split_conversion(
                &RawConversion::new(bucket_key, 1),
                &self.one.public_info(),
                &self.two.public_info(),
                &mut rng,
            )
            .unwrap();
            let d1 = decrypt_partial_report(&report1, &self.one.transport_private_key).unwrap();
            let d2 = decrypt_partial_report(&report2, &self.two.transport_private_key).unwrap();

            let e1 = exponentiate_key(
                &d1,
                &self.one.secret,
                &self.two.public_info().elgamal_public_key,
                &mut rng,
            )
            .unwrap();
            let e2 = exponentiate_key(
                &d2,
                &self.two.secret,
                &self.one.public_info().elgamal_public_key,
                &mut rng,
            )
            .unwrap();

            let (share1, payload1) =
                rekey_by_aggregation_id(&e2, &d1, &self.one.elgamal_private_key, &self.one.secret)
                    .unwrap();
            let (share2, _) =
                rekey_by_aggregation_id(&e1, &d2, &self.two.elgamal_private_key, &self.two.secret)
                    .unwrap();
            assert_eq!(payload1.value_share, d1.value_share);
            [share1, share2]
        }
    }

    #[test]
    fn join_is_equal_iff_keys_equal() {
        let helpers = Helpers::new();
        let keys = ["foo", "bar", "foo", "baz", "bar"];
        let ids: Vec<[u8; 32]> = keys
            .iter()
            .map(|key| {
                let [a, b] = helpers.join(key);
                a.combine(&b).unwrap().expect("helpers disagree")
            })
            .collect();

        for (i, key_i) in keys.iter().enumerate() {
            for (j, key_j) in keys.iter().enumerate() {
                assert_eq!(ids[i] == ids[j], key_i == key_j, "{key_i} vs {key_j}");
            }
        }
    }

    #[test]
    fn join_depends_on_both_secrets() {
        let a = Helpers::new();
        let b = Helpers::new();
        let [share_a, _] = a.join("foo");
        let [share_b, _] = b.join("foo");
        assert_ne!(share_a.value, share_b.value);
    }

    #[test]
    fn combine_rejects_different_reports() {
        let helpers = Helpers::new();
        let [a, _] = helpers.join("foo");
        let [b, _] = helpers.join("foo");
        assert_matches!(a.combine(&b), Err(JoinError::ReportIdMismatch { .. }));
    }

    #[test]
    fn bucket_id_truncates() {
        let share = AggregationIdShare {
            report_id: ReportId::from([0; 16]),
            value: [0xab; 32],
        };
        assert_eq!(share.bucket_id(8).unwrap(), 0xab);
        assert_eq!(share.bucket_id(12).unwrap(), 0xaba);
        assert_eq!(share.bucket_id(64).unwrap(), 0xabab_abab_abab_abab);
        assert_matches!(share.bucket_id(0), Err(JoinError::InvalidBitLength(0)));
        assert_matches!(share.bucket_id(65), Err(JoinError::InvalidBitLength(65)));
    }

    #[test]
    fn state_machine_order() {
        let mut rng = rand::thread_rng();
        let one = ServerKeyMaterial::generate(&mut rng);
        let two = ServerKeyMaterial::generate(&mut rng);
        let [report1, report2] = split_conversion(
            &RawConversion::new("foo", 3),
            &one.public_info(),
            &two.public_info(),
            &mut rng,
        )
        .unwrap();
        let d1 = decrypt_partial_report(&report1, &one.transport_private_key).unwrap();
        let d2 = decrypt_partial_report(&report2, &two.transport_private_key).unwrap();

        let state = JoinState::Decrypted(d1.clone());
        assert_matches!(
            state.clone().rekey(&one.elgamal_private_key, &one.secret),
            Err(JoinError::UnexpectedState { state: "Decrypted", .. })
        );

        let (state, _) = state
            .exponentiate(&one.secret, &two.public_info().elgamal_public_key, &mut rng)
            .unwrap();
        assert!(state.awaiting_peer());

        let peer_key = exponentiate_key(
            &d2,
            &two.secret,
            &one.public_info().elgamal_public_key,
            &mut rng,
        )
        .unwrap();
        let mut wrong_peer_key = peer_key.clone();
        wrong_peer_key.report_id = ReportId::from([9; 16]);
        assert_matches!(
            state.clone().receive_peer(wrong_peer_key),
            Err(JoinError::ReportIdMismatch { .. })
        );

        let state = state.receive_peer(peer_key).unwrap();
        let (state, share, payload) = state.rekey(&one.elgamal_private_key, &one.secret).unwrap();
        assert_eq!(payload.report_id, d1.report_id);
        assert_matches!(state, JoinState::Rekeyed(ref s) if *s == share);
        assert_matches!(
            state.exponentiate(&one.secret, &two.public_info().elgamal_public_key, &mut rng),
            Err(JoinError::UnexpectedState { state: "Rekeyed", .. })
        );
    }
}
