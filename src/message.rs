// SPDX-License-Identifier: MPL-2.0

//! Messages exchanged between the two helpers. Helpers never share memory: everything one helper
//! learns from the other arrives as bytes produced by [`encode`].

use crate::{aggregator::EncryptedDpfKey, join::ExponentiatedKey};
use serde::{Deserialize, Serialize};

/// Errors propagated by methods in this module.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MessageError {
    /// The message could not be encoded or decoded.
    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A message of a different kind arrived.
    #[error("expected a {expected} message, got {got}")]
    UnexpectedMessage {
        /// The kind the receiver was waiting for.
        expected: &'static str,
        /// The kind that arrived.
        got: &'static str,
    },
}

/// A helper-to-helper message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum PeerMessage {
    /// First join round: the sender's blinded keys, one per report.
    ExponentiatedKeys(Vec<ExponentiatedKey>),
    /// The receiver's DPF key halves, sealed to it.
    DpfKeys(Vec<EncryptedDpfKey>),
}

impl PeerMessage {
    fn kind(&self) -> &'static str {
        match self {
            PeerMessage::ExponentiatedKeys(_) => "exponentiated keys",
            PeerMessage::DpfKeys(_) => "DPF keys",
        }
    }

    /// The blinded keys, or an error if this is another kind of message.
    pub fn into_exponentiated_keys(self) -> Result<Vec<ExponentiatedKey>, MessageError> {
        match self {
            PeerMessage::ExponentiatedKeys(keys) => Ok(keys),
            other => Err(MessageError::UnexpectedMessage {
                expected: "exponentiated keys",
                got: other.kind(),
            }),
        }
    }

    /// The sealed key halves, or an error if this is another kind of message.
    pub fn into_dpf_keys(self) -> Result<Vec<EncryptedDpfKey>, MessageError> {
        match self {
            PeerMessage::DpfKeys(keys) => Ok(keys),
            other => Err(MessageError::UnexpectedMessage {
                expected: "DPF keys",
                got: other.kind(),
            }),
        }
    }
}

/// Serialize a message for the peer.
pub fn encode(message: &PeerMessage) -> Result<Vec<u8>, MessageError> {
    Ok(serde_json::to_vec(message)?)
}

/// Deserialize a message from the peer.
pub fn decode(bytes: &[u8]) -> Result<PeerMessage, MessageError> {
    Ok(serde_json::from_slice(bytes)?)
}
