// SPDX-License-Identifier: MPL-2.0

//! Incremental distributed point function (DPF).
//!
//! A key pair secret-shares the function that is `value` on every prefix of the point `id` and
//! zero everywhere else, over a domain of `bit_length`-bit strings. Each key half holds a random
//! root seed, and both halves share one correction word per tree level. Evaluating a half walks
//! the binary tree from the root: at each level the seed is extended into two child seeds and
//! control bits, corrected where the parent's control bit is set, and converted into the next
//! seed and a pseudorandom output. Off the path to `id` the two halves hold identical seeds and
//! control bits, so their outputs cancel; on the path their control bits differ and the
//! correction word makes the outputs sum to `value`.
//!
//! The construction follows the IDPF of [[BBCGGI21]] as used by Poplar1. Seeds are expanded with
//! fixed-key AES-128 ([`crate::xof`]).
//!
//! Correction words are stored in a `Vec` indexed by tree level, and expansion below a node
//! proceeds one level at a time over a flat frontier of node states.
//!
//! [BBCGGI21]: https://eprint.iacr.org/2021/017

use crate::xof::{FixedKeyAes128Key, Seed, SEED_SIZE};
use rand::{CryptoRng, RngCore};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    array,
    fmt::Debug,
    ops::{Add, AddAssign, Range, Sub},
};
use subtle::{Choice, ConditionallyNegatable, ConditionallySelectable};

mod cache;
mod params;

pub use cache::{HashMapCache, NoCache, NodeCache, NodeState};
pub use params::{
    convert_old_params_to_expand_parameters, default_dpf_parameters, DpfParameters,
    ExpandParameters, ExpansionPlan, HierarchicalPrefixes, MAX_BIT_LENGTH, MAX_EXPANSION_BITS,
};

const DST_EXTEND: &[u8] = b"conversion-aggregation dpf extend";
const DST_CONVERT: &[u8] = b"conversion-aggregation dpf convert";

/// DPF errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DpfError {
    /// The point lies outside the domain.
    #[error("point {id} is outside the {bit_length}-bit domain")]
    InvalidDomain {
        /// The offending point or prefix.
        id: u64,
        /// Bit length of the domain.
        bit_length: u32,
    },

    /// Hierarchy or expansion parameters are malformed.
    #[error("invalid DPF parameters: {0}")]
    InvalidParameters(String),

    /// A prefix was requested that the previous level did not expand.
    #[error("prefix {prefix} of length {prefix_bits} was not expanded at the previous level")]
    PrefixNotExpanded {
        /// Bit length of the prefix.
        prefix_bits: u32,
        /// The prefix.
        prefix: u64,
    },

    /// An expansion would produce too many buckets.
    #[error("expanding {parents} prefixes by {subtree_bits} bits exceeds the expansion limit")]
    ExpansionTooLarge {
        /// Number of parent prefixes.
        parents: usize,
        /// Levels below each parent.
        subtree_bits: u32,
    },

    /// The expansion parameters do not continue from the evaluation context's level.
    #[error("expansion continues from level {expected:?} but the context is at {found:?}")]
    ContextMismatch {
        /// Level named by the expansion parameters.
        expected: Option<usize>,
        /// Level recorded in the context.
        found: Option<usize>,
    },

    /// A key half does not match the DPF instance it is evaluated with.
    #[error("key does not match DPF parameters: {0}")]
    KeyMismatch(String),

    /// Segmented expansion needs a positive segment length.
    #[error("segment length must be positive")]
    InvalidSegmentLength,
}

/// Output group of a DPF.
pub trait DpfValue:
    Copy
    + Debug
    + PartialEq
    + Add<Output = Self>
    + AddAssign
    + Sub<Output = Self>
    + ConditionallySelectable
    + ConditionallyNegatable
    + Serialize
    + DeserializeOwned
{
    /// The additive identity.
    fn zero() -> Self;

    /// Sample a pseudorandom value from a seed stream.
    fn generate<S: RngCore>(seed_stream: &mut S) -> Self;
}

impl DpfValue for crate::field::Field64 {
    fn zero() -> Self {
        Self::ZERO
    }

    fn generate<S: RngCore>(seed_stream: &mut S) -> Self {
        crate::field::Field64::generate(seed_stream)
    }
}

/// Which of the two key halves a party holds. Outputs of [`DpfServerId::S1`] are negated, so the
/// two halves' outputs are combined by addition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DpfServerId {
    /// First key half.
    S0,
    /// Second key half.
    S1,
}

impl From<DpfServerId> for Choice {
    fn from(value: DpfServerId) -> Self {
        match value {
            DpfServerId::S0 => Self::from(0),
            DpfServerId::S1 => Self::from(1),
        }
    }
}

/// Correction word for one tree level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrectionWord<V> {
    #[serde(with = "hex::serde")]
    seed: [u8; SEED_SIZE],
    ctrl_left: bool,
    ctrl_right: bool,
    value: V,
}

/// One half of a DPF key pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DpfKey<V> {
    server_id: DpfServerId,
    hierarchy: Vec<u32>,
    seed: Seed<SEED_SIZE>,
    correction_words: Vec<CorrectionWord<V>>,
}

impl<V> DpfKey<V> {
    /// Which half this is.
    pub fn server_id(&self) -> DpfServerId {
        self.server_id
    }

    /// Domain bit length.
    pub fn bit_length(&self) -> usize {
        self.correction_words.len()
    }

    /// Prefix bit lengths at which the key may be evaluated.
    pub fn hierarchy(&self) -> &[u32] {
        &self.hierarchy
    }
}

/// A DPF instance over a fixed hierarchy.
#[derive(Clone)]
pub struct Dpf {
    params: DpfParameters,
    extend_key: FixedKeyAes128Key,
    convert_key: FixedKeyAes128Key,
}

impl Debug for Dpf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dpf").field("params", &self.params).finish()
    }
}

impl Dpf {
    /// Create a DPF instance for the hierarchy `params`.
    pub fn new(params: DpfParameters) -> Result<Self, DpfError> {
        params.validate()?;
        Ok(Self {
            params,
            extend_key: FixedKeyAes128Key::new(DST_EXTEND, b""),
            convert_key: FixedKeyAes128Key::new(DST_CONVERT, b""),
        })
    }

    /// The hierarchy this instance evaluates.
    pub fn parameters(&self) -> &DpfParameters {
        &self.params
    }

    /// Domain bit length.
    pub fn bit_length(&self) -> u32 {
        self.params.bit_length()
    }

    /// Generate a key pair for the point `id` with output `value`, using the thread-local CSPRNG.
    pub fn generate_key_pair<V: DpfValue>(
        &self,
        id: u64,
        value: V,
    ) -> Result<[DpfKey<V>; 2], DpfError> {
        self.generate_key_pair_with_rng(id, value, &mut rand::thread_rng())
    }

    /// Generate a key pair for the point `id` with output `value`.
    pub fn generate_key_pair_with_rng<V: DpfValue, R: RngCore + CryptoRng>(
        &self,
        id: u64,
        value: V,
        rng: &mut R,
    ) -> Result<[DpfKey<V>; 2], DpfError> {
        let bit_length = self.bit_length();
        if bit_length < MAX_BIT_LENGTH && id >> bit_length != 0 {
            return Err(DpfError::InvalidDomain { id, bit_length });
        }

        let root_seeds = [Seed::generate(rng), Seed::generate(rng)];
        let mut seeds = [*root_seeds[0].as_ref(), *root_seeds[1].as_ref()];
        let mut ctrl = [Choice::from(0), Choice::from(1)];
        let mut correction_words = Vec::with_capacity(bit_length as usize);

        for level in 0..bit_length {
            let bit = Choice::from(((id >> (bit_length - 1 - level)) & 1) as u8);
            let (seeds_0, ctrl_0) = self.extend(&seeds[0]);
            let (seeds_1, ctrl_1) = self.extend(&seeds[1]);

            let cw_seed = xor_seeds(&select_seed(&seeds_0, !bit), &select_seed(&seeds_1, !bit));
            let cw_ctrl = [
                ctrl_0[0] ^ ctrl_1[0] ^ bit ^ Choice::from(1),
                ctrl_0[1] ^ ctrl_1[1] ^ bit,
            ];
            let cw_ctrl_keep = Choice::conditional_select(&cw_ctrl[0], &cw_ctrl[1], bit);

            let keep_0 = correct_seed(&select_seed(&seeds_0, bit), &cw_seed, ctrl[0]);
            let keep_1 = correct_seed(&select_seed(&seeds_1, bit), &cw_seed, ctrl[1]);
            let next_ctrl = [
                Choice::conditional_select(&ctrl_0[0], &ctrl_0[1], bit) ^ (ctrl[0] & cw_ctrl_keep),
                Choice::conditional_select(&ctrl_1[0], &ctrl_1[1], bit) ^ (ctrl[1] & cw_ctrl_keep),
            ];

            let (next_0, weight_0) = self.convert::<V>(&keep_0);
            let (next_1, weight_1) = self.convert::<V>(&keep_1);
            let mut cw_value = weight_1 - weight_0 + value;
            cw_value.conditional_negate(next_ctrl[1]);

            seeds = [next_0, next_1];
            ctrl = next_ctrl;
            correction_words.push(CorrectionWord {
                seed: cw_seed,
                ctrl_left: cw_ctrl[0].into(),
                ctrl_right: cw_ctrl[1].into(),
                value: cw_value,
            });
        }

        let [seed_0, seed_1] = root_seeds;
        Ok([
            DpfKey {
                server_id: DpfServerId::S0,
                hierarchy: self.params.log_domain_sizes.clone(),
                seed: seed_0,
                correction_words: correction_words.clone(),
            },
            DpfKey {
                server_id: DpfServerId::S1,
                hierarchy: self.params.log_domain_sizes.clone(),
                seed: seed_1,
                correction_words,
            },
        ])
    }

    /// Evaluate a key half at the node `prefix` of depth `prefix_bits`.
    pub fn evaluate<V: DpfValue>(
        &self,
        key: &DpfKey<V>,
        prefix_bits: u32,
        prefix: u64,
        cache: &mut dyn NodeCache,
    ) -> Result<V, DpfError> {
        self.check_key(key)?;
        if prefix_bits == 0 || prefix_bits > self.bit_length() {
            return Err(DpfError::InvalidParameters(format!(
                "prefix length {prefix_bits} outside 1..={}",
                self.bit_length()
            )));
        }
        if prefix_bits < MAX_BIT_LENGTH && prefix >> prefix_bits != 0 {
            return Err(DpfError::InvalidDomain {
                id: prefix,
                bit_length: prefix_bits,
            });
        }

        let parent = self.node_at(key, prefix_bits - 1, prefix >> 1, cache);
        let extension = self.extend(&parent.seed);
        let cw = &key.correction_words[(prefix_bits - 1) as usize];
        let (_, mut value) = self.child(&parent, &extension, cw, (prefix & 1) as usize);
        value.conditional_negate(key.server_id.into());
        Ok(value)
    }

    /// Evaluate a key half at every bucket of `plan`.
    pub fn expand<V: DpfValue>(
        &self,
        key: &DpfKey<V>,
        plan: &ExpansionPlan,
        cache: &mut dyn NodeCache,
    ) -> Result<Vec<V>, DpfError> {
        self.expand_parents(key, plan, 0..plan.parents.len(), cache)
    }

    /// Evaluate a key half at every bucket below the parents `plan.parents[parents]`, in bucket
    /// order. Parent node states are stored in `cache`.
    pub fn expand_parents<V: DpfValue>(
        &self,
        key: &DpfKey<V>,
        plan: &ExpansionPlan,
        parents: Range<usize>,
        cache: &mut dyn NodeCache,
    ) -> Result<Vec<V>, DpfError> {
        self.check_key(key)?;
        if plan.target_bits > self.bit_length() || plan.parent_bits >= plan.target_bits {
            return Err(DpfError::InvalidParameters(format!(
                "cannot expand from {} to {} bits",
                plan.parent_bits, plan.target_bits
            )));
        }
        let selected = plan.parents.get(parents.clone()).ok_or_else(|| {
            DpfError::InvalidParameters(format!(
                "parent range {parents:?} exceeds {} parents",
                plan.parents.len()
            ))
        })?;

        let mut out = Vec::with_capacity(selected.len() << plan.subtree_bits());
        for &prefix in selected {
            let node = self.node_at(key, plan.parent_bits, prefix, cache);
            if plan.parent_bits > 0 {
                cache.insert(plan.parent_bits, prefix, &node);
            }
            self.expand_subtree(key, node, plan.parent_bits, plan.target_bits, &mut out);
        }

        let negate = Choice::from(key.server_id);
        for value in out.iter_mut() {
            value.conditional_negate(negate);
        }
        Ok(out)
    }

    fn check_key<V>(&self, key: &DpfKey<V>) -> Result<(), DpfError> {
        if key.correction_words.len() != self.bit_length() as usize {
            return Err(DpfError::KeyMismatch(format!(
                "key has {} levels, expected {}",
                key.correction_words.len(),
                self.bit_length()
            )));
        }
        if key.hierarchy != self.params.log_domain_sizes {
            return Err(DpfError::KeyMismatch("hierarchy differs".into()));
        }
        Ok(())
    }

    fn root<V>(&self, key: &DpfKey<V>) -> NodeState {
        NodeState {
            seed: *key.seed.as_ref(),
            ctrl: key.server_id == DpfServerId::S1,
        }
    }

    /// Walk from the deepest cached ancestor (or the root) down to the node `prefix`.
    fn node_at<V: DpfValue>(
        &self,
        key: &DpfKey<V>,
        prefix_bits: u32,
        prefix: u64,
        cache: &dyn NodeCache,
    ) -> NodeState {
        let mut depth = prefix_bits;
        let mut node = loop {
            if depth == 0 {
                break self.root(key);
            }
            if let Some(state) = cache.get(depth, prefix >> (prefix_bits - depth)) {
                break state;
            }
            depth -= 1;
        };

        while depth < prefix_bits {
            let bit = ((prefix >> (prefix_bits - 1 - depth)) & 1) as usize;
            let extension = self.extend(&node.seed);
            node = self
                .child(&node, &extension, &key.correction_words[depth as usize], bit)
                .0;
            depth += 1;
        }
        node
    }

    /// Expand `node` at depth `from_bits` down to depth `to_bits`, appending the outputs at
    /// `to_bits` to `out`.
    fn expand_subtree<V: DpfValue>(
        &self,
        key: &DpfKey<V>,
        node: NodeState,
        from_bits: u32,
        to_bits: u32,
        out: &mut Vec<V>,
    ) {
        let mut frontier = vec![node];
        for depth in from_bits..to_bits {
            let cw = &key.correction_words[depth as usize];
            let last = depth + 1 == to_bits;
            let mut next = Vec::with_capacity(if last { 0 } else { frontier.len() * 2 });
            for node in &frontier {
                let extension = self.extend(&node.seed);
                for bit in 0..2 {
                    let (child, value) = self.child(node, &extension, cw, bit);
                    if last {
                        out.push(value);
                    } else {
                        next.push(child);
                    }
                }
            }
            frontier = next;
        }
    }

    /// Compute the `bit` child of `node`, given the extension of its seed.
    fn child<V: DpfValue>(
        &self,
        node: &NodeState,
        extension: &([[u8; SEED_SIZE]; 2], [Choice; 2]),
        cw: &CorrectionWord<V>,
        bit: usize,
    ) -> (NodeState, V) {
        let (seeds, ctrl) = extension;
        let node_ctrl = Choice::from(u8::from(node.ctrl));
        let cw_ctrl = Choice::from(u8::from(if bit == 0 {
            cw.ctrl_left
        } else {
            cw.ctrl_right
        }));
        let seed = correct_seed(&seeds[bit], &cw.seed, node_ctrl);
        let child_ctrl = ctrl[bit] ^ (node_ctrl & cw_ctrl);
        let (next_seed, weight) = self.convert::<V>(&seed);
        let value = weight + V::conditional_select(&V::zero(), &cw.value, child_ctrl);
        (
            NodeState {
                seed: next_seed,
                ctrl: child_ctrl.into(),
            },
            value,
        )
    }

    fn extend(&self, seed: &[u8; SEED_SIZE]) -> ([[u8; SEED_SIZE]; 2], [Choice; 2]) {
        let mut seed_stream = self.extend_key.with_seed(seed);
        let mut seeds = [[0; SEED_SIZE]; 2];
        seed_stream.fill(&mut seeds[0]);
        seed_stream.fill(&mut seeds[1]);

        let mut byte = [0];
        seed_stream.fill(&mut byte);
        let control_bits = [(byte[0] & 1).into(), ((byte[0] >> 1) & 1).into()];

        (seeds, control_bits)
    }

    fn convert<V: DpfValue>(&self, seed: &[u8; SEED_SIZE]) -> ([u8; SEED_SIZE], V) {
        let mut seed_stream = self.convert_key.with_seed(seed);
        let mut next_seed = [0; SEED_SIZE];
        seed_stream.fill(&mut next_seed);
        (next_seed, V::generate(&mut seed_stream))
    }
}

fn xor_seeds(left: &[u8; SEED_SIZE], right: &[u8; SEED_SIZE]) -> [u8; SEED_SIZE] {
    array::from_fn(|i| left[i] ^ right[i])
}

/// `seeds[1]` if `select` is set, `seeds[0]` otherwise, in constant time.
fn select_seed(seeds: &[[u8; SEED_SIZE]; 2], select: Choice) -> [u8; SEED_SIZE] {
    array::from_fn(|i| u8::conditional_select(&seeds[0][i], &seeds[1][i], select))
}

/// `seed ^ correction` if `apply` is set, `seed` otherwise, in constant time.
fn correct_seed(
    seed: &[u8; SEED_SIZE],
    correction: &[u8; SEED_SIZE],
    apply: Choice,
) -> [u8; SEED_SIZE] {
    array::from_fn(|i| seed[i] ^ u8::conditional_select(&0, &correction[i], apply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Field64;

    #[test]
    fn seed_selection() {
        let seeds = [[0x0f; SEED_SIZE], [0xf5; SEED_SIZE]];
        assert_eq!(select_seed(&seeds, Choice::from(0)), seeds[0]);
        assert_eq!(select_seed(&seeds, Choice::from(1)), seeds[1]);

        let mut correction = [0; SEED_SIZE];
        correction[3] = 0xff;
        assert_eq!(correct_seed(&seeds[0], &correction, Choice::from(0)), seeds[0]);
        let corrected = correct_seed(&seeds[0], &correction, Choice::from(1));
        assert_eq!(corrected[3], 0xf0);
        assert_eq!(corrected[..3], seeds[0][..3]);
        assert_eq!(xor_seeds(&corrected, &seeds[0]), correction);
    }
    use assert_matches::assert_matches;

    fn full_plan(dpf: &Dpf) -> ExpansionPlan {
        ExpandParameters {
            levels: vec![dpf.parameters().levels() - 1],
            prefixes: vec![vec![]],
            previous_level: None,
        }
        .plan(dpf.parameters(), None)
        .unwrap()
    }

    fn check_full_domain(dpf: &Dpf, id: u64, value: Field64) {
        let keys = dpf.generate_key_pair(id, value).unwrap();
        let plan = full_plan(dpf);
        let out_0 = dpf.expand(&keys[0], &plan, &mut NoCache::new()).unwrap();
        let out_1 = dpf.expand(&keys[1], &plan, &mut NoCache::new()).unwrap();
        assert_eq!(out_0.len(), 1 << dpf.bit_length());
        for (bucket, (a, b)) in plan.buckets.iter().zip(out_0.iter().zip(&out_1)) {
            let expected = if *bucket == id { value } else { Field64::ZERO };
            assert_eq!(*a + *b, expected, "bucket {bucket}");
        }
    }

    #[test]
    fn point_function_over_full_domain() {
        let dpf = Dpf::new(default_dpf_parameters(8).unwrap()).unwrap();
        for id in [0, 1, 0x55, 0xaa, 0xff] {
            check_full_domain(&dpf, id, Field64::from(1234));
        }
        check_full_domain(&dpf, 7, Field64::from_signed(-1));

        let flat = Dpf::new(DpfParameters::new(vec![10]).unwrap()).unwrap();
        check_full_domain(&flat, 0x3c5, Field64::from(1));
    }

    #[test]
    fn point_function_at_each_level() {
        let dpf = Dpf::new(DpfParameters::new(vec![2, 5, 9]).unwrap()).unwrap();
        let id = 0b1_0110_1101;
        let value = Field64::from(77);
        let keys = dpf.generate_key_pair(id, value).unwrap();

        for prefix_bits in 1..=9 {
            for prefix in 0..1u64 << prefix_bits {
                let a = dpf
                    .evaluate(&keys[0], prefix_bits, prefix, &mut NoCache::new())
                    .unwrap();
                let b = dpf
                    .evaluate(&keys[1], prefix_bits, prefix, &mut NoCache::new())
                    .unwrap();
                let on_path = prefix == id >> (9 - prefix_bits);
                let expected = if on_path { value } else { Field64::ZERO };
                assert_eq!(a + b, expected, "prefix {prefix} of length {prefix_bits}");
            }
        }
    }

    #[test]
    fn sixty_four_bit_domain() {
        let dpf = Dpf::new(DpfParameters::new(vec![32, 64]).unwrap()).unwrap();
        let value = Field64::from(5);
        let keys = dpf.generate_key_pair(u64::MAX, value).unwrap();
        let eval = |prefix| {
            dpf.evaluate(&keys[0], 64, prefix, &mut NoCache::new())
                .unwrap()
                + dpf
                    .evaluate(&keys[1], 64, prefix, &mut NoCache::new())
                    .unwrap()
        };
        assert_eq!(eval(u64::MAX), value);
        assert_eq!(eval(u64::MAX - 1), Field64::ZERO);
        assert_eq!(eval(0), Field64::ZERO);
    }

    #[test]
    fn invalid_domain() {
        let dpf = Dpf::new(default_dpf_parameters(8).unwrap()).unwrap();
        assert_matches!(
            dpf.generate_key_pair(256, Field64::ONE),
            Err(DpfError::InvalidDomain {
                id: 256,
                bit_length: 8
            })
        );
        let keys = dpf.generate_key_pair(255, Field64::ONE).unwrap();
        assert_matches!(
            dpf.evaluate(&keys[0], 4, 16, &mut NoCache::new()),
            Err(DpfError::InvalidDomain { .. })
        );
        assert_matches!(
            dpf.evaluate(&keys[0], 9, 0, &mut NoCache::new()),
            Err(DpfError::InvalidParameters(_))
        );
    }

    #[test]
    fn key_from_other_hierarchy_is_rejected() {
        let dpf_8 = Dpf::new(default_dpf_parameters(8).unwrap()).unwrap();
        let dpf_4 = Dpf::new(default_dpf_parameters(4).unwrap()).unwrap();
        let dpf_8_flat = Dpf::new(DpfParameters::new(vec![8]).unwrap()).unwrap();
        let keys = dpf_8.generate_key_pair(3, Field64::ONE).unwrap();
        assert_matches!(
            dpf_4.evaluate(&keys[0], 1, 0, &mut NoCache::new()),
            Err(DpfError::KeyMismatch(_))
        );
        assert_matches!(
            dpf_8_flat.evaluate(&keys[0], 1, 0, &mut NoCache::new()),
            Err(DpfError::KeyMismatch(_))
        );
    }

    #[test]
    fn expansion_is_deterministic() {
        let dpf = Dpf::new(default_dpf_parameters(10).unwrap()).unwrap();
        let keys = dpf.generate_key_pair(612, Field64::from(3)).unwrap();
        let plan = full_plan(&dpf);
        let first = dpf.expand(&keys[1], &plan, &mut NoCache::new()).unwrap();
        let second = dpf.expand(&keys[1], &plan, &mut HashMapCache::new()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn hierarchical_expansion_with_cache() {
        let dpf = Dpf::new(DpfParameters::new(vec![3, 6, 9]).unwrap()).unwrap();
        let id = 0b101_011_110;
        let value = Field64::from(9);
        let keys = dpf.generate_key_pair(id, value).unwrap();
        let mut caches = [HashMapCache::new(), HashMapCache::new()];

        let first = ExpandParameters {
            levels: vec![0],
            prefixes: vec![vec![]],
            previous_level: None,
        }
        .plan(dpf.parameters(), None)
        .unwrap();
        let second = ExpandParameters {
            levels: vec![1],
            prefixes: vec![vec![0b101, 0b010]],
            previous_level: Some(0),
        }
        .plan(dpf.parameters(), Some((0, &first.buckets[..])))
        .unwrap();
        let third = ExpandParameters {
            levels: vec![2],
            prefixes: vec![vec![0b101_011]],
            previous_level: Some(1),
        }
        .plan(dpf.parameters(), Some((1, &second.buckets[..])))
        .unwrap();

        for plan in [&first, &second, &third] {
            let out: Vec<Vec<Field64>> = keys
                .iter()
                .zip(caches.iter_mut())
                .map(|(key, cache)| dpf.expand(key, plan, cache).unwrap())
                .collect();
            let uncached = dpf.expand(&keys[0], plan, &mut NoCache::new()).unwrap();
            assert_eq!(out[0], uncached);

            let shift = 9 - plan.target_bits;
            for (i, bucket) in plan.buckets.iter().enumerate() {
                let expected = if *bucket == id >> shift {
                    value
                } else {
                    Field64::ZERO
                };
                assert_eq!(out[0][i] + out[1][i], expected);
            }
        }
        assert!(caches[0].get(6, 0b101_011).is_some());
    }

    #[test]
    fn key_serialization() {
        let dpf = Dpf::new(default_dpf_parameters(6).unwrap()).unwrap();
        let keys = dpf.generate_key_pair(17, Field64::from(2)).unwrap();
        let json = serde_json::to_string(&keys[1]).unwrap();
        let decoded: DpfKey<Field64> = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, keys[1]);
        assert_eq!(decoded.server_id(), DpfServerId::S1);
        assert_eq!(decoded.bit_length(), 6);
    }
}
