// SPDX-License-Identifier: MPL-2.0

//! Memoization of DPF tree nodes.

use crate::xof::SEED_SIZE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Evaluation state of one node of the DPF tree: the seed and control bit a key half holds at
/// that node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// Seed at this node.
    #[serde(with = "hex::serde")]
    pub seed: [u8; SEED_SIZE],
    /// Control bit at this node.
    pub ctrl: bool,
}

/// An interface that provides memoization of DPF node states.
///
/// Each instance of a type implementing `NodeCache` should only be used with one DPF key half.
///
/// Hierarchical expansion evaluates the tree below prefixes of increasing length, and each
/// round's parents are nodes that an earlier round already reached. Caching those nodes lets a
/// later round start from them instead of walking down from the root.
pub trait NodeCache {
    /// Fetch the state of the node at depth `prefix_bits` identified by `prefix`.
    fn get(&self, prefix_bits: u32, prefix: u64) -> Option<NodeState>;

    /// Store the state of the node at depth `prefix_bits` identified by `prefix`.
    fn insert(&mut self, prefix_bits: u32, prefix: u64, state: &NodeState);
}

/// A no-op [`NodeCache`] implementation that always reports a cache miss.
#[derive(Debug, Default)]
pub struct NoCache {}

impl NoCache {
    /// Construct a `NoCache` object.
    pub fn new() -> NoCache {
        NoCache::default()
    }
}

impl NodeCache for NoCache {
    fn get(&self, _: u32, _: u64) -> Option<NodeState> {
        None
    }

    fn insert(&mut self, _: u32, _: u64, _: &NodeState) {}
}

/// An in-memory [`NodeCache`] with no eviction. It serializes, so it can be persisted as part of
/// an evaluation context between pipeline runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashMapCache {
    levels: BTreeMap<u32, BTreeMap<u64, NodeState>>,
}

impl HashMapCache {
    /// Create a new unpopulated `HashMapCache`.
    pub fn new() -> HashMapCache {
        HashMapCache::default()
    }

    /// Number of cached nodes.
    pub fn len(&self) -> usize {
        self.levels.values().map(BTreeMap::len).sum()
    }

    /// Whether the cache holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.levels.values().all(BTreeMap::is_empty)
    }
}

impl NodeCache for HashMapCache {
    fn get(&self, prefix_bits: u32, prefix: u64) -> Option<NodeState> {
        self.levels.get(&prefix_bits)?.get(&prefix).copied()
    }

    fn insert(&mut self, prefix_bits: u32, prefix: u64, state: &NodeState) {
        self.levels
            .entry(prefix_bits)
            .or_default()
            .entry(prefix)
            .or_insert(*state);
    }
}
