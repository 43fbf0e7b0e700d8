// SPDX-License-Identifier: MPL-2.0

//! DPF hierarchy and expansion parameters.
//!
//! A [`DpfParameters`] value lists the prefix bit lengths (hierarchy levels) at which a key half
//! may be evaluated. An [`ExpandParameters`] value says which levels to evaluate in one pipeline
//! run and which prefixes of the previously evaluated level to refine. Both the current and the
//! legacy (sum parameters plus per-level prefixes) shapes normalize to an [`ExpansionPlan`].

use super::DpfError;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Largest supported domain bit length.
pub const MAX_BIT_LENGTH: u32 = 64;

/// A single expansion produces at most `2^MAX_EXPANSION_BITS` buckets.
pub const MAX_EXPANSION_BITS: u32 = 24;

/// Hierarchy of a DPF domain: the strictly increasing prefix bit lengths at which key halves can
/// be evaluated. The last entry is the domain bit length.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpfParameters {
    /// Prefix bit length of each hierarchy level.
    pub log_domain_sizes: Vec<u32>,
}

impl DpfParameters {
    /// Construct and validate a hierarchy.
    pub fn new(log_domain_sizes: Vec<u32>) -> Result<Self, DpfError> {
        let params = Self { log_domain_sizes };
        params.validate()?;
        Ok(params)
    }

    /// Check that the hierarchy is non-empty, strictly increasing and within `1..=64` bits.
    pub fn validate(&self) -> Result<(), DpfError> {
        let (first, last) = match (self.log_domain_sizes.first(), self.log_domain_sizes.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Err(DpfError::InvalidParameters("empty hierarchy".into())),
        };
        if first == 0 || last > MAX_BIT_LENGTH {
            return Err(DpfError::InvalidParameters(format!(
                "hierarchy levels must lie in 1..={MAX_BIT_LENGTH}"
            )));
        }
        if self.log_domain_sizes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(DpfError::InvalidParameters(
                "hierarchy levels must be strictly increasing".into(),
            ));
        }
        Ok(())
    }

    /// Domain bit length.
    pub fn bit_length(&self) -> u32 {
        self.log_domain_sizes.last().copied().unwrap_or(0)
    }

    /// Number of hierarchy levels.
    pub fn levels(&self) -> usize {
        self.log_domain_sizes.len()
    }

    /// Prefix bit length of hierarchy level `level`.
    pub fn level_bits(&self, level: usize) -> Result<u32, DpfError> {
        self.log_domain_sizes.get(level).copied().ok_or_else(|| {
            DpfError::InvalidParameters(format!(
                "hierarchy level {level} out of range (have {})",
                self.levels()
            ))
        })
    }
}

/// The default hierarchy for `key_bit_size`-bit identifiers: one level per prefix length
/// `1, 2, ..., key_bit_size`.
pub fn default_dpf_parameters(key_bit_size: u32) -> Result<DpfParameters, DpfError> {
    DpfParameters::new((1..=key_bit_size).collect())
}

/// Legacy expansion input: the prefixes to refine for each hierarchy level, starting at level 0.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchicalPrefixes {
    /// `prefixes[i]` lists prefixes of level `i - 1` to expand into level `i`. Empty means all.
    pub prefixes: Vec<Vec<u64>>,
}

/// Which hierarchy levels to evaluate in one run, and which prefixes to refine at each.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandParameters {
    /// Hierarchy levels to evaluate, in increasing order. Only the last one is output.
    pub levels: Vec<usize>,
    /// `prefixes[i]` lists prefixes of the level evaluated before `levels[i]` to expand. An empty
    /// list expands everything evaluated at that level.
    pub prefixes: Vec<Vec<u64>>,
    /// The level the evaluation context was left at by the previous run, if any.
    pub previous_level: Option<usize>,
}

/// Normalize legacy sum parameters and per-level prefixes into [`ExpandParameters`].
pub fn convert_old_params_to_expand_parameters(
    sum_params: &DpfParameters,
    prefixes: &HierarchicalPrefixes,
) -> Result<ExpandParameters, DpfError> {
    sum_params.validate()?;
    let count = prefixes.prefixes.len();
    if count == 0 || count > sum_params.levels() {
        return Err(DpfError::InvalidParameters(format!(
            "expected between 1 and {} prefix levels, got {count}",
            sum_params.levels()
        )));
    }
    Ok(ExpandParameters {
        levels: (0..count).collect(),
        prefixes: prefixes.prefixes.clone(),
        previous_level: None,
    })
}

/// A normalized expansion: every bucket under each parent prefix, at the target level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpansionPlan {
    /// Hierarchy level being output.
    pub level: usize,
    /// Bit length of the parent prefixes.
    pub parent_bits: u32,
    /// Sorted parent prefixes to expand.
    pub parents: Vec<u64>,
    /// Bit length of the output buckets.
    pub target_bits: u32,
    /// Sorted output buckets, `2^(target_bits - parent_bits)` per parent.
    pub buckets: Vec<u64>,
}

impl ExpansionPlan {
    /// Number of tree levels between a parent and its buckets.
    pub fn subtree_bits(&self) -> u32 {
        self.target_bits - self.parent_bits
    }

    /// Number of output buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether the plan outputs nothing.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Indices of the parents whose subtrees cover the bucket index range `buckets`.
    pub fn parents_covering(&self, buckets: &Range<usize>) -> Range<usize> {
        if buckets.is_empty() {
            return 0..0;
        }
        let shift = self.subtree_bits();
        (buckets.start >> shift)..(((buckets.end - 1) >> shift) + 1)
    }
}

impl ExpandParameters {
    /// Resolve these parameters against `hierarchy`, given the level and expanded prefixes left
    /// behind by the previous run.
    pub fn plan(
        &self,
        hierarchy: &DpfParameters,
        previous: Option<(usize, &[u64])>,
    ) -> Result<ExpansionPlan, DpfError> {
        if self.levels.is_empty() {
            return Err(DpfError::InvalidParameters("no levels to expand".into()));
        }
        if self.prefixes.len() != self.levels.len() {
            return Err(DpfError::InvalidParameters(format!(
                "{} prefix lists for {} levels",
                self.prefixes.len(),
                self.levels.len()
            )));
        }
        let context_level = previous.map(|(level, _)| level);
        if self.previous_level != context_level {
            return Err(DpfError::ContextMismatch {
                expected: self.previous_level,
                found: context_level,
            });
        }

        let (mut current_level, mut current_bits, mut expanded) = match previous {
            Some((level, prefixes)) => (Some(level), hierarchy.level_bits(level)?, prefixes.to_vec()),
            None => (None, 0, vec![0]),
        };
        let mut parents = Vec::new();
        let mut parent_bits = 0;

        for (&level, prefixes) in self.levels.iter().zip(&self.prefixes) {
            let target_bits = hierarchy.level_bits(level)?;
            if current_level.is_some_and(|current| level <= current) {
                return Err(DpfError::InvalidParameters(format!(
                    "level {level} does not follow level {current_level:?}"
                )));
            }

            parents = if prefixes.is_empty() {
                std::mem::take(&mut expanded)
            } else {
                if current_level.is_none() {
                    return Err(DpfError::InvalidParameters(
                        "prefixes given for the first level of a fresh context".into(),
                    ));
                }
                let mut selected = prefixes.clone();
                selected.sort_unstable();
                selected.dedup();
                if let Some(missing) = selected
                    .iter()
                    .find(|prefix| expanded.binary_search(prefix).is_err())
                {
                    return Err(DpfError::PrefixNotExpanded {
                        prefix_bits: current_bits,
                        prefix: *missing,
                    });
                }
                selected
            };
            parent_bits = current_bits;

            let shift = target_bits - current_bits;
            let total = (parents.len() as u128) << shift.min(MAX_BIT_LENGTH);
            if shift > MAX_EXPANSION_BITS || total > 1 << MAX_EXPANSION_BITS {
                return Err(DpfError::ExpansionTooLarge {
                    parents: parents.len(),
                    subtree_bits: shift,
                });
            }
            expanded = parents
                .iter()
                .flat_map(|parent| {
                    let base = parent << shift;
                    (0..1u64 << shift).map(move |offset| base | offset)
                })
                .collect();
            current_level = Some(level);
            current_bits = target_bits;
        }

        Ok(ExpansionPlan {
            // levels is non-empty, so the loop ran at least once.
            level: current_level.unwrap_or_default(),
            parent_bits,
            parents,
            target_bits: current_bits,
            buckets: expanded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn default_parameters() {
        let params = default_dpf_parameters(32).unwrap();
        assert_eq!(params.levels(), 32);
        assert_eq!(params.log_domain_sizes[0], 1);
        assert_eq!(params.bit_length(), 32);
        assert_matches!(
            default_dpf_parameters(0),
            Err(DpfError::InvalidParameters(_))
        );
        assert_matches!(
            default_dpf_parameters(65),
            Err(DpfError::InvalidParameters(_))
        );
    }

    #[test]
    fn hierarchy_validation() {
        assert!(DpfParameters::new(vec![4, 8, 64]).is_ok());
        assert_matches!(
            DpfParameters::new(vec![4, 4]),
            Err(DpfError::InvalidParameters(_))
        );
        assert_matches!(
            DpfParameters::new(vec![]),
            Err(DpfError::InvalidParameters(_))
        );
    }

    #[test]
    fn plan_first_level_expands_everything() {
        let hierarchy = DpfParameters::new(vec![2, 4, 8]).unwrap();
        let params = ExpandParameters {
            levels: vec![0],
            prefixes: vec![vec![]],
            previous_level: None,
        };
        let plan = params.plan(&hierarchy, None).unwrap();
        assert_eq!(plan.parent_bits, 0);
        assert_eq!(plan.parents, vec![0]);
        assert_eq!(plan.target_bits, 2);
        assert_eq!(plan.buckets, vec![0, 1, 2, 3]);
    }

    #[test]
    fn plan_refines_selected_prefixes() {
        let hierarchy = DpfParameters::new(vec![2, 4, 8]).unwrap();
        let params = ExpandParameters {
            levels: vec![1],
            prefixes: vec![vec![3, 1, 3]],
            previous_level: Some(0),
        };
        let plan = params.plan(&hierarchy, Some((0, &[0, 1, 2, 3][..]))).unwrap();
        assert_eq!(plan.parents, vec![1, 3]);
        assert_eq!(plan.parent_bits, 2);
        assert_eq!(plan.buckets, vec![4, 5, 6, 7, 12, 13, 14, 15]);
        assert_eq!(plan.parents_covering(&(3..5)), 0..2);
        assert_eq!(plan.parents_covering(&(4..8)), 1..2);

        assert_matches!(
            params.plan(&hierarchy, Some((0, &[0, 1][..]))),
            Err(DpfError::PrefixNotExpanded {
                prefix_bits: 2,
                prefix: 3
            })
        );
        assert_matches!(
            params.plan(&hierarchy, None),
            Err(DpfError::ContextMismatch { .. })
        );
    }

    #[test]
    fn plan_multiple_levels() {
        let hierarchy = DpfParameters::new(vec![1, 2, 3]).unwrap();
        let params = ExpandParameters {
            levels: vec![0, 1, 2],
            prefixes: vec![vec![], vec![1], vec![]],
            previous_level: None,
        };
        let plan = params.plan(&hierarchy, None).unwrap();
        assert_eq!(plan.level, 2);
        assert_eq!(plan.parents, vec![2, 3]);
        assert_eq!(plan.parent_bits, 2);
        assert_eq!(plan.buckets, vec![4, 5, 6, 7]);
    }

    #[test]
    fn plan_full_64_bit_level() {
        let hierarchy = DpfParameters::new(vec![60, 64]).unwrap();
        let params = ExpandParameters {
            levels: vec![1],
            prefixes: vec![vec![(1 << 60) - 1]],
            previous_level: Some(0),
        };
        let plan = params
            .plan(&hierarchy, Some((0, &[0, (1 << 60) - 1][..])))
            .unwrap();
        assert_eq!(plan.buckets.len(), 16);
        assert_eq!(plan.buckets[15], u64::MAX);
    }

    #[test]
    fn plan_rejects_large_expansions() {
        let hierarchy = default_dpf_parameters(32).unwrap();
        let params = ExpandParameters {
            levels: vec![31],
            prefixes: vec![vec![]],
            previous_level: None,
        };
        assert_matches!(
            params.plan(&hierarchy, None),
            Err(DpfError::ExpansionTooLarge { .. })
        );
    }

    #[test]
    fn plan_rejects_malformed_parameters() {
        let hierarchy = DpfParameters::new(vec![2, 4]).unwrap();
        let no_levels = ExpandParameters::default();
        assert_matches!(
            no_levels.plan(&hierarchy, None),
            Err(DpfError::InvalidParameters(_))
        );
        let root_prefixes = ExpandParameters {
            levels: vec![0],
            prefixes: vec![vec![1]],
            previous_level: None,
        };
        assert_matches!(
            root_prefixes.plan(&hierarchy, None),
            Err(DpfError::InvalidParameters(_))
        );
        let backwards = ExpandParameters {
            levels: vec![1, 0],
            prefixes: vec![vec![], vec![]],
            previous_level: None,
        };
        assert_matches!(
            backwards.plan(&hierarchy, None),
            Err(DpfError::InvalidParameters(_))
        );
        let out_of_range = ExpandParameters {
            levels: vec![2],
            prefixes: vec![vec![]],
            previous_level: None,
        };
        assert_matches!(
            out_of_range.plan(&hierarchy, None),
            Err(DpfError::InvalidParameters(_))
        );
    }

    #[test]
    fn convert_legacy_parameters() {
        let sum_params = DpfParameters::new(vec![2, 4, 8]).unwrap();
        let prefixes = HierarchicalPrefixes {
            prefixes: vec![vec![], vec![1, 2]],
        };
        let params = convert_old_params_to_expand_parameters(&sum_params, &prefixes).unwrap();
        assert_eq!(params.levels, vec![0, 1]);
        assert_eq!(params.previous_level, None);
        let plan = params.plan(&sum_params, None).unwrap();
        assert_eq!(plan.target_bits, 4);
        assert_eq!(plan.parents, vec![1, 2]);

        assert_matches!(
            convert_old_params_to_expand_parameters(&sum_params, &HierarchicalPrefixes::default()),
            Err(DpfError::InvalidParameters(_))
        );
    }
}
