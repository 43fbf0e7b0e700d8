// SPDX-License-Identifier: MPL-2.0

//! Crate-level error taxonomy.
//!
//! Module errors are sorted into four categories. Failures of decryption or of a group operation
//! are [`Error::Crypto`], an identifier outside the DPF domain or two bucket keys sharing one DPF
//! bucket is [`Error::Domain`], invalid privacy parameters are [`Error::PrivacyConfig`], and everything else that is wrong with a report,
//! message, parameter or key is [`Error::Input`]. None of them are retried.

use crate::{
    aggregator::AggregationError,
    dp::DpError,
    dpf::DpfError,
    elgamal::ElGamalError,
    hpke::TransportError,
    join::JoinError,
    message::MessageError,
    report::{ReportError, ReportId},
    secret_share::SecretShareError,
};

/// Errors returned by the helper pipeline.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed or missing report, message, parameter or key.
    #[error("input error: {0}")]
    Input(#[from] InputError),

    /// Decryption or exponentiation failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// An aggregation identifier does not fit the configured domain.
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),

    /// Invalid epsilon or sensitivity.
    #[error("privacy configuration error: {0}")]
    PrivacyConfig(#[from] DpError),
}

/// Input errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum InputError {
    /// The same report was submitted twice.
    #[error("duplicate report {0}")]
    DuplicateReport(ReportId),

    /// A message names a report this helper never received.
    #[error("unknown report {0}")]
    UnknownReport(ReportId),

    /// The peer's join message for a report never arrived.
    #[error("no peer message for report {0}")]
    MissingPeerMessage(ReportId),

    /// A sealed DPF key decrypted to a record for a different report.
    #[error("DPF key for report {got} delivered as report {expected}")]
    KeyReportMismatch {
        /// Report named by the envelope.
        expected: ReportId,
        /// Report named by the record.
        got: ReportId,
    },

    /// Malformed report.
    #[error(transparent)]
    Report(ReportError),

    /// Join state machine misuse or malformed share.
    #[error(transparent)]
    Join(JoinError),

    /// Malformed parameters or keys.
    #[error(transparent)]
    Dpf(DpfError),

    /// Histograms or contexts that cannot be combined.
    #[error(transparent)]
    Aggregation(AggregationError),

    /// Malformed peer message.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// Malformed shares.
    #[error(transparent)]
    SecretShare(#[from] SecretShareError),

    /// Malformed JSON.
    #[error(transparent)]
    Encoding(#[from] serde_json::Error),
}

/// The DPF domain cannot represent the aggregation identifiers.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DomainError {
    /// An identifier lies outside the domain.
    #[error("aggregation id {id} exceeds bit length {bit_length}")]
    OutOfRange {
        /// The identifier.
        id: u64,
        /// Bit length of the domain.
        bit_length: u32,
    },

    /// Distinct bucket keys truncate to the same bucket. The bit length is too small for the
    /// number of keys.
    #[error("distinct bucket keys collide in bucket {bucket}")]
    BucketCollision {
        /// The bucket.
        bucket: u64,
    },
}

/// Cryptographic failures.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CryptoError {
    /// Group operation or ElGamal decryption failed.
    #[error(transparent)]
    ElGamal(#[from] ElGamalError),

    /// Transport encryption failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<ElGamalError> for Error {
    fn from(e: ElGamalError) -> Self {
        Error::Crypto(e.into())
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Crypto(e.into())
    }
}

impl From<ReportError> for Error {
    fn from(e: ReportError) -> Self {
        match e {
            ReportError::Transport(e) => e.into(),
            other => Error::Input(InputError::Report(other)),
        }
    }
}

impl From<JoinError> for Error {
    fn from(e: JoinError) -> Self {
        match e {
            JoinError::ElGamal(e) => e.into(),
            other => Error::Input(InputError::Join(other)),
        }
    }
}

impl From<DpfError> for Error {
    fn from(e: DpfError) -> Self {
        match e {
            DpfError::InvalidDomain { id, bit_length } => {
                DomainError::OutOfRange { id, bit_length }.into()
            }
            other => Error::Input(InputError::Dpf(other)),
        }
    }
}

impl From<AggregationError> for Error {
    fn from(e: AggregationError) -> Self {
        match e {
            AggregationError::Dpf(e) => e.into(),
            AggregationError::Join(e) => e.into(),
            AggregationError::Privacy(e) => e.into(),
            AggregationError::SecretShare(e) => Error::Input(e.into()),
            AggregationError::BucketCollision { bucket } => {
                DomainError::BucketCollision { bucket }.into()
            }
            other => Error::Input(InputError::Aggregation(other)),
        }
    }
}

impl From<MessageError> for Error {
    fn from(e: MessageError) -> Self {
        Error::Input(e.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Input(e.into())
    }
}
