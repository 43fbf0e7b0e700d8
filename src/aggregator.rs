// SPDX-License-Identifier: MPL-2.0

//! DPF key generation from joined reports, per-helper expansion into partial histograms, and the
//! final merge of the two helpers' histograms.
//!
//! For every joined report each helper generates one DPF key pair over [`BucketShare`]: the point
//! is the report's bucket identifier and the payload is the helper's value share, plus a count of
//! one if the helper is the leader. The helper keeps the first half, labelled with its key share of
//! the bucket key, and hands the second half to its peer. Summing the expansions of every half both
//! helpers hold therefore yields, per bucket, the sum of the values and the number of reports.

use crate::{
    dp::{DpError, NoiseSource, PrivacyParams},
    dpf::{Dpf, DpfError, DpfKey, DpfValue, ExpandParameters, ExpansionPlan, HashMapCache},
    field::Field64,
    hpke::HpkeCiphertext,
    join::{AggregationIdShare, AggregationPayload, JoinError},
    report::ReportId,
    secret_share::{combine_bytes, SecretShareError},
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    ops::{Add, AddAssign, Neg, Range, Sub},
};
use subtle::{Choice, ConditionallySelectable};
use tracing::{debug, info};

/// Errors propagated by methods in this module.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AggregationError {
    /// DPF generation or evaluation failed.
    #[error("DPF error: {0}")]
    Dpf(#[from] DpfError),

    /// An aggregation id share does not fit the DPF domain or the report it is paired with.
    #[error("join error: {0}")]
    Join(#[from] JoinError),

    /// Bucket key shares could not be combined.
    #[error("secret sharing error: {0}")]
    SecretShare(#[from] SecretShareError),

    /// Privacy parameters are invalid.
    #[error("privacy error: {0}")]
    Privacy(#[from] DpError),

    /// The evaluation context is internally inconsistent.
    #[error("invalid evaluation context: {0}")]
    InvalidContext(String),

    /// Two histograms cannot be combined.
    #[error("incompatible histograms: {0}")]
    IncompatibleHistograms(String),

    /// Only one helper labelled a bucket.
    #[error("bucket {bucket} is labelled by only one helper")]
    MissingLabel {
        /// The bucket.
        bucket: u64,
    },

    /// Reports with different aggregation ids landed in the same bucket.
    #[error("distinct aggregation ids collide in bucket {bucket}")]
    BucketCollision {
        /// The bucket.
        bucket: u64,
    },

    /// The helpers labelled a bucket with different reports.
    #[error("helpers disagree on the label of bucket {bucket}")]
    LabelMismatch {
        /// The bucket.
        bucket: u64,
    },

    /// A histogram cannot be split into zero shards.
    #[error("shard count must be positive")]
    InvalidShardCount,
}

/// Per-bucket payload of a DPF key: a share of the value sum and a share of the report count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketShare {
    /// Share of the sum of values.
    pub sum: Field64,
    /// Share of the number of contributing reports.
    pub count: Field64,
}

impl Add for BucketShare {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            sum: self.sum + rhs.sum,
            count: self.count + rhs.count,
        }
    }
}

impl AddAssign for BucketShare {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for BucketShare {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            sum: self.sum - rhs.sum,
            count: self.count - rhs.count,
        }
    }
}

impl Neg for &BucketShare {
    type Output = BucketShare;

    fn neg(self) -> BucketShare {
        BucketShare {
            sum: -self.sum,
            count: -self.count,
        }
    }
}

impl ConditionallySelectable for BucketShare {
    fn conditional_select(a: &Self, b: &Self, choice: Choice) -> Self {
        Self {
            sum: Field64::conditional_select(&a.sum, &b.sum, choice),
            count: Field64::conditional_select(&a.count, &b.count, choice),
        }
    }
}

impl DpfValue for BucketShare {
    fn zero() -> Self {
        Self::default()
    }

    fn generate<S: RngCore>(seed_stream: &mut S) -> Self {
        let sum = Field64::generate(seed_stream);
        let count = Field64::generate(seed_stream);
        Self { sum, count }
    }
}

/// How a helper sums its expanded key halves, and the privacy parameters of the release.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombineParams {
    /// Sum every expansion into one vector instead of segment by segment.
    pub direct_combine: bool,
    /// Number of buckets per segment when `direct_combine` is off.
    pub segment_length: usize,
    /// Privacy budget per helper. Zero disables noise.
    pub epsilon: f64,
    /// Largest contribution of one report to a bucket sum.
    pub l1_sensitivity: u64,
}

impl Default for CombineParams {
    fn default() -> Self {
        Self {
            direct_combine: true,
            segment_length: 32768,
            epsilon: 0.0,
            l1_sensitivity: 1 << 16,
        }
    }
}

impl CombineParams {
    /// The privacy part of the configuration.
    pub fn privacy_params(&self) -> PrivacyParams {
        PrivacyParams {
            epsilon: self.epsilon,
            l1_sensitivity: self.l1_sensitivity,
        }
    }

    /// Check the segment length and privacy parameters.
    pub fn validate(&self) -> Result<(), AggregationError> {
        if !self.direct_combine && self.segment_length == 0 {
            return Err(DpfError::InvalidSegmentLength.into());
        }
        self.privacy_params().validate()?;
        Ok(())
    }
}

/// Ties a bucket to one of the reports in it, so the bucket key can be rebuilt at release.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketLabel {
    /// Full-length bucket identifier.
    pub bucket_id: u64,
    /// Aggregation identifier the bucket was derived from.
    #[serde(with = "hex::serde")]
    pub aggregation_id: [u8; 32],
    /// The labelling report.
    pub report_id: ReportId,
    /// This helper's XOR share of the report's bucket key.
    #[serde(with = "hex::serde")]
    pub key_share: Vec<u8>,
}

/// A DPF key half held by a helper, with the label of the report if the helper generated the pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DpfKeyRecord {
    /// Report the key was generated for.
    pub report_id: ReportId,
    /// The key half.
    pub key: DpfKey<BucketShare>,
    /// Present on halves the holding helper generated itself.
    pub label: Option<BucketLabel>,
}

/// A [`DpfKeyRecord`] sealed to the helper that will evaluate it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedDpfKey {
    /// Report the key was generated for.
    pub report_id: ReportId,
    /// The sealed record.
    pub ciphertext: HpkeCiphertext,
}

/// Decrypted key halves of one helper together with per-key node caches and the expansion
/// progress, so that later hierarchical rounds neither re-decrypt nor re-walk the tree.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    /// Key halves.
    pub records: Vec<DpfKeyRecord>,
    /// Node cache of each key half, aligned with `records`.
    pub caches: Vec<HashMapCache>,
    /// Hierarchy level expanded by the last round.
    pub previous_level: Option<usize>,
    /// Buckets expanded by the last round, sorted.
    pub expanded_prefixes: Vec<u64>,
}

impl EvaluationContext {
    /// A fresh context holding `records`.
    pub fn new(records: Vec<DpfKeyRecord>) -> Self {
        let caches = vec![HashMapCache::new(); records.len()];
        Self {
            records,
            caches,
            previous_level: None,
            expanded_prefixes: Vec::new(),
        }
    }

    fn previous(&self) -> Option<(usize, &[u64])> {
        self.previous_level
            .map(|level| (level, self.expanded_prefixes.as_slice()))
    }
}

/// A helper's share of the histogram over the buckets of one expansion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartialHistogram {
    /// Bit length of the bucket prefixes.
    pub prefix_bits: u32,
    /// Bit length of the full bucket identifiers.
    pub bit_length: u32,
    /// Bucket prefix to share of (sum, count).
    pub buckets: BTreeMap<u64, BucketShare>,
    /// Full bucket identifier to the label of its smallest report.
    pub labels: BTreeMap<u64, BucketLabel>,
    /// First bucket index of each combine segment.
    pub segment_boundaries: Vec<usize>,
    /// Parameters of the noise added to the sums, if any.
    pub privacy: Option<PrivacyParams>,
}

impl PartialHistogram {
    fn check_compatible(&self, other: &PartialHistogram) -> Result<(), AggregationError> {
        if self.prefix_bits != other.prefix_bits || self.bit_length != other.bit_length {
            return Err(AggregationError::IncompatibleHistograms(format!(
                "{}/{}-bit prefixes vs {}/{}-bit prefixes",
                self.prefix_bits, self.bit_length, other.prefix_bits, other.bit_length
            )));
        }
        Ok(())
    }

    fn share(&self, bucket: u64) -> BucketShare {
        self.buckets.get(&bucket).copied().unwrap_or_default()
    }

    /// Fold in the histogram a worker computed over a disjoint subset of this helper's keys.
    pub fn accumulate(&mut self, other: &PartialHistogram) -> Result<(), AggregationError> {
        self.check_compatible(other)?;
        if self.privacy != other.privacy {
            return Err(AggregationError::IncompatibleHistograms(
                "different privacy parameters".into(),
            ));
        }
        for (bucket, share) in &other.buckets {
            *self.buckets.entry(*bucket).or_default() += *share;
        }
        for (bucket, label) in &other.labels {
            insert_label(&mut self.labels, *bucket, label)?;
        }
        self.segment_boundaries
            .extend_from_slice(&other.segment_boundaries);
        self.segment_boundaries.sort_unstable();
        self.segment_boundaries.dedup();
        Ok(())
    }

    /// Split into `shards` histograms over disjoint buckets, assigning each bucket prefix to shard
    /// `prefix % shards`. Accumulating the shards gives back this histogram.
    pub fn into_shards(self, shards: usize) -> Result<Vec<PartialHistogram>, AggregationError> {
        if shards == 0 {
            return Err(AggregationError::InvalidShardCount);
        }
        let shift = self.bit_length.checked_sub(self.prefix_bits).ok_or_else(|| {
            AggregationError::IncompatibleHistograms(format!(
                "{}-bit prefixes of {}-bit buckets",
                self.prefix_bits, self.bit_length
            ))
        })?;
        let shard_of = |prefix: u64| (prefix % shards as u64) as usize;

        let mut out: Vec<PartialHistogram> = (0..shards)
            .map(|_| PartialHistogram {
                prefix_bits: self.prefix_bits,
                bit_length: self.bit_length,
                buckets: BTreeMap::new(),
                labels: BTreeMap::new(),
                segment_boundaries: self.segment_boundaries.clone(),
                privacy: self.privacy,
            })
            .collect();
        for (prefix, share) in self.buckets {
            out[shard_of(prefix)].buckets.insert(prefix, share);
        }
        for (bucket, label) in self.labels {
            let prefix = bucket.checked_shr(shift).unwrap_or(0);
            out[shard_of(prefix)].labels.insert(bucket, label);
        }
        Ok(out)
    }
}

/// Keep the label with the smallest report id. Labels of one bucket must agree on the aggregation
/// id, otherwise the bucket would silently merge distinct bucket keys.
fn insert_label(
    labels: &mut BTreeMap<u64, BucketLabel>,
    bucket: u64,
    label: &BucketLabel,
) -> Result<(), AggregationError> {
    match labels.get(&bucket) {
        Some(existing) if existing.aggregation_id != label.aggregation_id => {
            Err(AggregationError::BucketCollision { bucket })
        }
        Some(existing) if existing.report_id <= label.report_id => Ok(()),
        _ => {
            labels.insert(bucket, label.clone());
            Ok(())
        }
    }
}

/// Generate the DPF key pair for one joined report. The first record, labelled, stays with the
/// generating helper; the second goes to the peer. The leader encodes a count of one.
pub fn generate_dpf_keys<R: RngCore + CryptoRng>(
    dpf: &Dpf,
    share: &AggregationIdShare,
    payload: &AggregationPayload,
    leader: bool,
    rng: &mut R,
) -> Result<[DpfKeyRecord; 2], AggregationError> {
    if share.report_id != payload.report_id {
        return Err(JoinError::ReportIdMismatch {
            expected: share.report_id,
            got: payload.report_id,
        }
        .into());
    }
    let bucket_id = share.bucket_id(dpf.bit_length())?;
    let value = BucketShare {
        sum: payload.value_share,
        count: if leader { Field64::ONE } else { Field64::ZERO },
    };
    let [own, peer] = dpf.generate_key_pair_with_rng(bucket_id, value, rng)?;

    Ok([
        DpfKeyRecord {
            report_id: share.report_id,
            key: own,
            label: Some(BucketLabel {
                bucket_id,
                aggregation_id: share.value,
                report_id: share.report_id,
                key_share: payload.key_share.clone(),
            }),
        },
        DpfKeyRecord {
            report_id: share.report_id,
            key: peer,
            label: None,
        },
    ])
}

/// Expand every key half in `context` over the buckets selected by `expand`, sum them, and add
/// noise to the sums. The context is advanced to the expanded level.
pub fn aggregate_data_share(
    dpf: &Dpf,
    context: &mut EvaluationContext,
    expand: &ExpandParameters,
    combine: &CombineParams,
    noise: &mut dyn NoiseSource,
) -> Result<PartialHistogram, AggregationError> {
    combine.validate()?;
    if context.caches.len() != context.records.len() {
        return Err(AggregationError::InvalidContext(format!(
            "{} caches for {} key halves",
            context.caches.len(),
            context.records.len()
        )));
    }
    let plan = expand.plan(dpf.parameters(), context.previous())?;
    debug!(
        level = plan.level,
        parent_bits = plan.parent_bits,
        target_bits = plan.target_bits,
        parents = plan.parents.len(),
        buckets = plan.len(),
        "expansion plan"
    );

    let (mut totals, segment_boundaries) = if combine.direct_combine {
        (expand_direct(dpf, context, &plan)?, vec![0])
    } else {
        expand_segmented(dpf, context, &plan, combine.segment_length)?
    };

    let mut sums: Vec<Field64> = totals.iter().map(|share| share.sum).collect();
    noise.add_noise_to_agg_share(&mut sums);
    for (share, sum) in totals.iter_mut().zip(sums) {
        share.sum = sum;
    }

    let shift = dpf.bit_length() - plan.target_bits;
    let mut labels = BTreeMap::new();
    for label in context.records.iter().filter_map(|record| record.label.as_ref()) {
        if plan.buckets.binary_search(&(label.bucket_id >> shift)).is_ok() {
            insert_label(&mut labels, label.bucket_id, label)?;
        }
    }

    info!(
        keys = context.records.len(),
        buckets = plan.len(),
        labels = labels.len(),
        segments = segment_boundaries.len(),
        "aggregated data share"
    );

    context.previous_level = Some(plan.level);
    context.expanded_prefixes = plan.buckets.clone();

    Ok(PartialHistogram {
        prefix_bits: plan.target_bits,
        bit_length: dpf.bit_length(),
        buckets: plan.buckets.iter().copied().zip(totals).collect(),
        labels,
        segment_boundaries,
        privacy: noise.privacy(),
    })
}

fn expand_direct(
    dpf: &Dpf,
    context: &mut EvaluationContext,
    plan: &ExpansionPlan,
) -> Result<Vec<BucketShare>, DpfError> {
    let mut totals = vec![BucketShare::default(); plan.len()];
    for (record, cache) in context.records.iter().zip(context.caches.iter_mut()) {
        let expanded = dpf.expand(&record.key, plan, cache)?;
        for (total, value) in totals.iter_mut().zip(expanded) {
            *total += value;
        }
    }
    Ok(totals)
}

fn expand_segmented(
    dpf: &Dpf,
    context: &mut EvaluationContext,
    plan: &ExpansionPlan,
    segment_length: usize,
) -> Result<(Vec<BucketShare>, Vec<usize>), DpfError> {
    let mut totals = vec![BucketShare::default(); plan.len()];
    let mut boundaries = Vec::new();
    let shift = plan.subtree_bits();

    for start in (0..plan.len()).step_by(segment_length) {
        let segment: Range<usize> = start..plan.len().min(start + segment_length);
        let parents = plan.parents_covering(&segment);
        let offset = parents.start << shift;
        debug!(?segment, ?parents, "combining segment");

        for (record, cache) in context.records.iter().zip(context.caches.iter_mut()) {
            let expanded = dpf.expand_parents(&record.key, plan, parents.clone(), cache)?;
            let window = &expanded[segment.start - offset..segment.end - offset];
            for (total, value) in totals[segment.clone()].iter_mut().zip(window) {
                *total += *value;
            }
        }
        boundaries.push(start);
    }
    Ok((totals, boundaries))
}

/// A released bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteResult {
    /// The reconstructed bucket key.
    #[serde(with = "hex::serde")]
    pub bucket_key: Vec<u8>,
    /// The aggregation identifier of the bucket.
    #[serde(with = "hex::serde")]
    pub aggregation_id: [u8; 32],
    /// Sum of the values, noised if privacy was enabled.
    pub sum: i64,
    /// Number of contributing reports. Each report counts once, since only the leader's key half
    /// encodes a count.
    pub count: u64,
}

/// An intermediate hierarchical result for one prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixResult {
    /// The bucket prefix.
    pub prefix: u64,
    /// Sum of the values under the prefix.
    pub sum: i64,
    /// Number of reports under the prefix.
    pub count: u64,
}

/// Merge the helpers' final-level histograms into one result per labelled bucket. When noise was
/// added, each released sum is clipped to `[0, count * l1_sensitivity]`.
pub fn merge_aggregation(
    helper1: &PartialHistogram,
    helper2: &PartialHistogram,
) -> Result<Vec<CompleteResult>, AggregationError> {
    helper1.check_compatible(helper2)?;
    if helper1.prefix_bits != helper1.bit_length {
        return Err(AggregationError::IncompatibleHistograms(format!(
            "histograms cover {}-bit prefixes of {}-bit buckets",
            helper1.prefix_bits, helper1.bit_length
        )));
    }
    let privacy = helper1.privacy.or(helper2.privacy);

    let buckets: BTreeSet<u64> = helper1
        .labels
        .keys()
        .chain(helper2.labels.keys())
        .copied()
        .collect();
    let mut results = Vec::with_capacity(buckets.len());
    for bucket in buckets {
        let (label1, label2) = match (helper1.labels.get(&bucket), helper2.labels.get(&bucket)) {
            (Some(label1), Some(label2)) => (label1, label2),
            _ => return Err(AggregationError::MissingLabel { bucket }),
        };
        if label1.report_id != label2.report_id || label1.aggregation_id != label2.aggregation_id
        {
            return Err(AggregationError::LabelMismatch { bucket });
        }

        let total = helper1.share(bucket) + helper2.share(bucket);
        let count = total.count.as_u64();
        let mut sum = total.sum.to_signed();
        if let Some(privacy) = privacy {
            let max = i64::try_from(count.saturating_mul(privacy.l1_sensitivity))
                .unwrap_or(i64::MAX);
            sum = sum.clamp(0, max);
        }
        results.push(CompleteResult {
            bucket_key: combine_bytes(&label1.key_share, &label2.key_share)?,
            aggregation_id: label1.aggregation_id,
            sum,
            count,
        });
    }
    info!(results = results.len(), "merged aggregation");
    Ok(results)
}

/// Merge the helpers' histograms of an intermediate hierarchy level.
pub fn merge_prefix_histogram(
    helper1: &PartialHistogram,
    helper2: &PartialHistogram,
) -> Result<Vec<PrefixResult>, AggregationError> {
    helper1.check_compatible(helper2)?;
    let prefixes: BTreeSet<u64> = helper1
        .buckets
        .keys()
        .chain(helper2.buckets.keys())
        .copied()
        .collect();
    Ok(prefixes
        .into_iter()
        .map(|prefix| {
            let total = helper1.share(prefix) + helper2.share(prefix);
            PrefixResult {
                prefix,
                sum: total.sum.to_signed(),
                count: total.count.as_u64(),
            }
        })
        .collect())
}

/// Prefixes whose report count exceeds `threshold`, in increasing order.
pub fn next_level_prefixes(results: &[PrefixResult], threshold: u64) -> Vec<u64> {
    let mut prefixes: Vec<u64> = results
        .iter()
        .filter(|result| result.count > threshold)
        .map(|result| result.prefix)
        .collect();
    prefixes.sort_unstable();
    prefixes
}
