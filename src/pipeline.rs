// SPDX-License-Identifier: MPL-2.0

//! The helper pipeline.
//!
//! A [`Helper`] owns one helper's key material and per-report state, and talks to its peer only
//! through encoded [`PeerMessage`]s:
//!
//! 1. [`Helper::process_partial_reports`] decrypts the helper's partial reports and returns the
//!    first join message.
//! 2. [`Helper::process_peer_exponentiated_keys`] finishes the join, generates a DPF key pair per
//!    report, keeps one half sealed to itself and returns the other halves sealed to the peer.
//! 3. [`Helper::process_peer_dpf_keys`] stores the peer's halves.
//! 4. [`Helper::aggregate`] expands all halves into a [`PartialHistogram`], keeping the evaluation
//!    context for later hierarchical rounds.
//!
//! [`aggregate_partial_report`] is the batch entry point behind step 4, also used by the
//! `dpf_aggregate_partial_report` binary.

use crate::{
    aggregator::{
        aggregate_data_share, generate_dpf_keys, merge_aggregation, merge_prefix_histogram,
        next_level_prefixes, CombineParams, CompleteResult, DpfKeyRecord, EncryptedDpfKey,
        EvaluationContext, PartialHistogram,
    },
    dpf::{Dpf, DpfError, DpfParameters, ExpandParameters},
    error::{Error, InputError},
    hpke::{self, TransportPrivateKey, TransportPublicKey},
    join::JoinState,
    keys::{ServerKeyMaterial, ServerPublicInfo},
    message::{self, PeerMessage},
    report::{decrypt_partial_report, PartialReport, ReportId},
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

const DPF_KEY_INFO: &[u8] = b"conversion-aggregation dpf key";

/// Which of the two helpers this is. Helper one is the leader, which encodes the report counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelperId {
    /// The leader.
    One,
    /// The other helper.
    Two,
}

fn dpf_key_info(report_id: &ReportId) -> Vec<u8> {
    [DPF_KEY_INFO, report_id.as_bytes()].concat()
}

/// Seal a key record to the helper that will evaluate it.
pub fn seal_dpf_key<R: RngCore + CryptoRng>(
    record: &DpfKeyRecord,
    recipient: &TransportPublicKey,
    rng: &mut R,
) -> Result<EncryptedDpfKey, Error> {
    let plaintext = serde_json::to_vec(record)?;
    Ok(EncryptedDpfKey {
        report_id: record.report_id,
        ciphertext: hpke::seal(
            recipient,
            &dpf_key_info(&record.report_id),
            &plaintext,
            rng,
        )?,
    })
}

/// Open a key record sealed to this helper.
pub fn open_dpf_key(
    key: &EncryptedDpfKey,
    private_key: &TransportPrivateKey,
) -> Result<DpfKeyRecord, Error> {
    let plaintext = hpke::open(private_key, &dpf_key_info(&key.report_id), &key.ciphertext)?;
    let record: DpfKeyRecord = serde_json::from_slice(&plaintext)?;
    if record.report_id != key.report_id {
        return Err(InputError::KeyReportMismatch {
            expected: key.report_id,
            got: record.report_id,
        }
        .into());
    }
    Ok(record)
}

/// Parameters of one [`aggregate_partial_report`] run.
#[derive(Clone, Copy, Debug)]
pub struct AggregatePartialReportParams<'a> {
    /// Hierarchy of the DPF keys.
    pub dpf_parameters: &'a DpfParameters,
    /// This helper's private keys.
    pub private_keys: &'a ServerKeyMaterial,
    /// Which levels and prefixes to expand.
    pub expand_parameters: &'a ExpandParameters,
    /// Combine and privacy configuration.
    pub combine: &'a CombineParams,
    /// Skip noise. For exact verification runs only.
    pub ignore_privacy: bool,
    /// Return the evaluation context for later rounds.
    pub return_evaluation_context: bool,
}

/// Input of one [`aggregate_partial_report`] run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialReportInput {
    /// Sealed key halves, decrypted on this run.
    EncryptedDpfKeys(Vec<EncryptedDpfKey>),
    /// Key halves decrypted and partly expanded by an earlier run.
    EvaluationContext(EvaluationContext),
}

/// Output of one [`aggregate_partial_report`] run.
#[derive(Clone, Debug)]
pub struct AggregatePartialReportOutput {
    /// This helper's share of the histogram.
    pub histogram: PartialHistogram,
    /// The advanced evaluation context, if requested.
    pub evaluation_context: Option<EvaluationContext>,
}

/// Expand one helper's DPF key halves into its partial histogram.
pub fn aggregate_partial_report(
    params: &AggregatePartialReportParams<'_>,
    input: PartialReportInput,
) -> Result<AggregatePartialReportOutput, Error> {
    let mut context = match input {
        PartialReportInput::EncryptedDpfKeys(keys) => {
            open_context(&keys, &params.private_keys.transport_private_key)?
        }
        PartialReportInput::EvaluationContext(context) => context,
    };
    let histogram = aggregate_context(params, &mut context)?;
    Ok(AggregatePartialReportOutput {
        histogram,
        evaluation_context: params.return_evaluation_context.then_some(context),
    })
}

fn open_context(
    keys: &[EncryptedDpfKey],
    private_key: &TransportPrivateKey,
) -> Result<EvaluationContext, Error> {
    let records = keys
        .iter()
        .map(|key| open_dpf_key(key, private_key))
        .collect::<Result<Vec<_>, _>>()?;
    debug!(keys = records.len(), "decrypted DPF keys");
    Ok(EvaluationContext::new(records))
}

/// Advances `context` only if the round succeeds.
fn aggregate_context(
    params: &AggregatePartialReportParams<'_>,
    context: &mut EvaluationContext,
) -> Result<PartialHistogram, Error> {
    let mut noise = params
        .combine
        .privacy_params()
        .noise_source(params.ignore_privacy)?;
    let dpf = Dpf::new(params.dpf_parameters.clone())?;
    let histogram = aggregate_data_share(
        &dpf,
        context,
        params.expand_parameters,
        params.combine,
        noise.as_mut(),
    )?;
    info!(
        keys = context.records.len(),
        prefix_bits = histogram.prefix_bits,
        noised = histogram.privacy.is_some(),
        "aggregated partial report"
    );
    Ok(histogram)
}

/// One helper: its keys, the peer's public keys and the state of every report it holds.
#[derive(Debug)]
pub struct Helper {
    id: HelperId,
    keys: ServerKeyMaterial,
    peer: ServerPublicInfo,
    dpf: Dpf,
    joins: BTreeMap<ReportId, JoinState>,
    dpf_keys: Vec<EncryptedDpfKey>,
    context: Option<EvaluationContext>,
}

impl Helper {
    /// Create helper `id` with its key material, the peer's public keys and the DPF hierarchy.
    pub fn new(
        id: HelperId,
        keys: ServerKeyMaterial,
        peer: ServerPublicInfo,
        dpf_parameters: DpfParameters,
    ) -> Result<Self, Error> {
        Ok(Self {
            id,
            keys,
            peer,
            dpf: Dpf::new(dpf_parameters)?,
            joins: BTreeMap::new(),
            dpf_keys: Vec::new(),
            context: None,
        })
    }

    /// Which helper this is.
    pub fn id(&self) -> HelperId {
        self.id
    }

    /// This helper's public keys.
    pub fn public_info(&self) -> ServerPublicInfo {
        self.keys.public_info()
    }

    /// Decrypt this helper's partial reports and blind their keys for the peer.
    pub fn process_partial_reports(&mut self, reports: &[PartialReport]) -> Result<Vec<u8>, Error> {
        let mut rng = rand::thread_rng();
        let mut messages = Vec::with_capacity(reports.len());
        for report in reports {
            if self.joins.contains_key(&report.report_id) {
                return Err(InputError::DuplicateReport(report.report_id).into());
            }
            let decrypted = decrypt_partial_report(report, &self.keys.transport_private_key)?;
            let (state, message) = JoinState::Decrypted(decrypted).exponentiate(
                &self.keys.secret,
                &self.peer.elgamal_public_key,
                &mut rng,
            )?;
            self.joins.insert(report.report_id, state);
            messages.push(message);
        }
        info!(helper = ?self.id, reports = reports.len(), "exponentiated keys");
        Ok(message::encode(&PeerMessage::ExponentiatedKeys(messages))?)
    }

    /// Finish the join with the peer's blinded keys, generate a DPF key pair per report and return
    /// the peer's halves. The message must cover every report still waiting for the peer. On error
    /// no report changes state, so the message can be resent.
    pub fn process_peer_exponentiated_keys(&mut self, message: &[u8]) -> Result<Vec<u8>, Error> {
        let peer_keys = message::decode(message)?.into_exponentiated_keys()?;
        let mut rng = rand::thread_rng();
        let mut staged: BTreeMap<ReportId, JoinState> = BTreeMap::new();
        let mut own_keys = Vec::with_capacity(peer_keys.len());
        let mut peer_halves = Vec::with_capacity(peer_keys.len());

        for peer_key in peer_keys {
            let report_id = peer_key.report_id;
            let state = staged
                .get(&report_id)
                .or_else(|| self.joins.get(&report_id))
                .cloned()
                .ok_or(InputError::UnknownReport(report_id))?;
            let (state, share, payload) = state
                .receive_peer(peer_key)?
                .rekey(&self.keys.elgamal_private_key, &self.keys.secret)?;
            staged.insert(report_id, state);

            let [own, peer] = generate_dpf_keys(
                &self.dpf,
                &share,
                &payload,
                self.id == HelperId::One,
                &mut rng,
            )?;
            own_keys.push(seal_dpf_key(
                &own,
                &self.keys.transport_private_key.public_key(),
                &mut rng,
            )?);
            peer_halves.push(seal_dpf_key(
                &peer,
                &self.peer.transport_public_key,
                &mut rng,
            )?);
        }

        if let Some(report_id) = self.joins.iter().find_map(|(id, state)| {
            (state.awaiting_peer() && !staged.contains_key(id)).then_some(*id)
        }) {
            return Err(InputError::MissingPeerMessage(report_id).into());
        }

        info!(helper = ?self.id, keys = own_keys.len(), "generated DPF keys");
        self.joins.extend(staged);
        self.dpf_keys.extend(own_keys);
        Ok(message::encode(&PeerMessage::DpfKeys(peer_halves))?)
    }

    /// Store the DPF key halves the peer generated for this helper.
    pub fn process_peer_dpf_keys(&mut self, message: &[u8]) -> Result<(), Error> {
        let keys = message::decode(message)?.into_dpf_keys()?;
        info!(helper = ?self.id, keys = keys.len(), "received peer DPF keys");
        self.dpf_keys.extend(keys);
        Ok(())
    }

    /// Sealed key halves held by this helper: its own, then the peer's.
    pub fn dpf_keys(&self) -> &[EncryptedDpfKey] {
        &self.dpf_keys
    }

    /// Expand all key halves held by this helper. The first call decrypts them; later calls
    /// continue from the evaluation context the previous successful call left behind.
    pub fn aggregate(
        &mut self,
        expand: &ExpandParameters,
        combine: &CombineParams,
        ignore_privacy: bool,
    ) -> Result<PartialHistogram, Error> {
        let mut context = match self.context.take() {
            Some(context) => context,
            None => open_context(&self.dpf_keys, &self.keys.transport_private_key)?,
        };
        let histogram = aggregate_context(
            &AggregatePartialReportParams {
                dpf_parameters: self.dpf.parameters(),
                private_keys: &self.keys,
                expand_parameters: expand,
                combine,
                ignore_privacy,
                return_evaluation_context: true,
            },
            &mut context,
        );
        self.context = Some(context);
        histogram
    }
}

/// Drive both helpers through the hierarchy levels `levels`, refining at each intermediate level
/// only the prefixes with more than `threshold` reports, and merge the final level.
pub fn aggregate_hierarchically(
    helper1: &mut Helper,
    helper2: &mut Helper,
    levels: &[usize],
    combine: &CombineParams,
    ignore_privacy: bool,
    threshold: u64,
) -> Result<Vec<CompleteResult>, Error> {
    let (&last, intermediate) = levels
        .split_last()
        .ok_or_else(|| DpfError::InvalidParameters("no levels to aggregate".into()))?;

    let mut previous_level = None;
    let mut prefixes = Vec::new();
    for &level in intermediate {
        let expand = ExpandParameters {
            levels: vec![level],
            prefixes: vec![prefixes],
            previous_level,
        };
        let histogram1 = helper1.aggregate(&expand, combine, ignore_privacy)?;
        let histogram2 = helper2.aggregate(&expand, combine, ignore_privacy)?;
        let results = merge_prefix_histogram(&histogram1, &histogram2)?;
        prefixes = next_level_prefixes(&results, threshold);
        debug!(level, selected = prefixes.len(), "selected prefixes");
        if prefixes.is_empty() {
            return Ok(Vec::new());
        }
        previous_level = Some(level);
    }

    let expand = ExpandParameters {
        levels: vec![last],
        prefixes: vec![prefixes],
        previous_level,
    };
    let histogram1 = helper1.aggregate(&expand, combine, ignore_privacy)?;
    let histogram2 = helper2.aggregate(&expand, combine, ignore_privacy)?;
    Ok(merge_aggregation(&histogram1, &histogram2)?)
}
