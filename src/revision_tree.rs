// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Order-preserving Merkle tree over document revisions.
//!
//! The tree partitions the revision space into `8^depth` equally wide leaf
//! buckets. Every node stores the number of revisions below it and the XOR
//! of their 64-bit digests, so inserting or removing a revision touches
//! exactly `depth + 1` nodes and the order of inserts does not matter.
//!
//! ```text
//!                       root (count, hash)
//!            ┌──────────┬─────┴─────┬──────────┐
//!          node0      node1   ...  node6      node7          level 1
//!        ┌──┴──┐
//!      leaf  leaf ...                                         level depth
//!      [min, min+w)  [min+w, min+2w) ...
//! ```
//!
//! # Geometry
//!
//! Bucket width is always a power of two and `range_min` is aligned to the
//! full span (`8^depth * width`). When a revision falls outside the span the
//! tree *grows*: width doubles and `range_min` re-aligns downwards. Because
//! of the alignment every old bucket nests inside exactly one new bucket, so
//! growing only merges pairs of buckets and never needs the original
//! revisions.
//!
//! # Diff
//!
//! [`RevisionTree::diff`] grows both trees to a common geometry, walks them
//! top-down skipping equal subtrees, and returns the disagreeing leaves as
//! ascending, non-overlapping, inclusive [`RevisionRange`]s.

use crate::error::{ReplicationError, Result};
use crate::revision::{RevisionId, RevisionRange};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Children per inner node.
pub const BRANCHING: usize = 8;

/// Depth used when a tree is created locally without a leader template.
pub const DEFAULT_DEPTH: u32 = 3;

/// Deepest tree we accept from a leader (8^6 = 262144 leaves).
pub const MAX_DEPTH: u32 = 6;

const SERIALIZATION_VERSION: u32 = 1;

/// Digest of a single revision.
pub fn revision_hash(rev: RevisionId) -> u64 {
    let digest = Sha256::digest(rev.as_u64().to_be_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

/// Count and combined digest of a subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub count: u64,
    pub hash: u64,
}

impl Bucket {
    fn absorb(&mut self, hash: u64) {
        self.count += 1;
        self.hash ^= hash;
    }

    fn release(&mut self, hash: u64) {
        self.count = self.count.saturating_sub(1);
        self.hash ^= hash;
    }

    fn merge(&mut self, other: &Bucket) {
        self.count += other.count;
        self.hash ^= other.hash;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0 && self.hash == 0
    }
}

fn leaf_count_for(depth: u32) -> usize {
    1usize << (3 * depth)
}

fn align_down(value: u128, span: u128) -> u128 {
    value - (value % span)
}

/// Merkle tree over a collection's revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionTree {
    depth: u32,
    range_min: u64,
    bucket_shift: u32,
    /// `levels[0]` is the root, `levels[depth]` the leaves.
    levels: Vec<Vec<Bucket>>,
}

impl RevisionTree {
    /// Create an empty tree whose range starts at (the aligned floor of)
    /// `initial_min`.
    pub fn new(depth: u32, initial_min: RevisionId) -> Self {
        let depth = depth.clamp(1, MAX_DEPTH);
        let span = leaf_count_for(depth) as u128;
        let range_min = align_down(u128::from(initial_min.as_u64()), span) as u64;
        Self::with_geometry(depth, range_min, 0)
    }

    fn with_geometry(depth: u32, range_min: u64, bucket_shift: u32) -> Self {
        let levels = (0..=depth)
            .map(|level| vec![Bucket::default(); leaf_count_for(level)])
            .collect();
        Self {
            depth,
            range_min,
            bucket_shift,
            levels,
        }
    }

    /// An empty tree with the same depth and range as `template`.
    ///
    /// The follower builds its local tree this way so both sides start from
    /// the same geometry.
    pub fn empty_like(template: &RevisionTree) -> Self {
        Self::with_geometry(template.depth, template.range_min, template.bucket_shift)
    }

    /// Build a tree from a set of revisions.
    pub fn from_revisions<I>(depth: u32, revisions: I) -> Self
    where
        I: IntoIterator<Item = RevisionId>,
    {
        let mut iter = revisions.into_iter().peekable();
        let first = iter.peek().copied().unwrap_or(RevisionId::MIN);
        let mut tree = Self::new(depth, first);
        for rev in iter {
            tree.insert(rev);
        }
        tree
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn leaf_count(&self) -> usize {
        leaf_count_for(self.depth)
    }

    fn width(&self) -> u128 {
        1u128 << self.bucket_shift
    }

    fn span(&self) -> u128 {
        (self.leaf_count() as u128) << self.bucket_shift
    }

    pub fn range_min(&self) -> RevisionId {
        RevisionId::new(self.range_min)
    }

    /// Inclusive upper bound of the covered range.
    pub fn range_max(&self) -> RevisionId {
        let max = u128::from(self.range_min) + self.span() - 1;
        RevisionId::new(max.min(u128::from(u64::MAX)) as u64)
    }

    /// Number of revisions in the tree.
    pub fn count(&self) -> u64 {
        self.levels[0][0].count
    }

    /// Combined digest of all revisions.
    pub fn root_hash(&self) -> u64 {
        self.levels[0][0].hash
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    fn leaves(&self) -> &[Bucket] {
        &self.levels[self.depth as usize]
    }

    fn leaf_index(&self, rev: RevisionId) -> Option<usize> {
        let rev = u128::from(rev.as_u64());
        let min = u128::from(self.range_min);
        if rev < min || rev - min >= self.span() {
            return None;
        }
        Some(((rev - min) >> self.bucket_shift) as usize)
    }

    fn ensure_covers(&mut self, rev: RevisionId) {
        while self.leaf_index(rev).is_none() {
            self.grow();
        }
    }

    /// Double the bucket width and realign `range_min`.
    fn grow(&mut self) {
        let old_width = self.width();
        let new_shift = self.bucket_shift + 1;
        let new_span = (self.leaf_count() as u128) << new_shift;
        let new_min = align_down(u128::from(self.range_min), new_span);

        let mut leaves = vec![Bucket::default(); self.leaf_count()];
        for (i, bucket) in self.leaves().iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let position = u128::from(self.range_min) + (i as u128) * old_width;
            let index = ((position - new_min) >> new_shift) as usize;
            leaves[index].merge(bucket);
        }

        self.range_min = new_min as u64;
        self.bucket_shift = new_shift;
        self.rebuild_from_leaves(leaves);
    }

    fn rebuild_from_leaves(&mut self, leaves: Vec<Bucket>) {
        let depth = self.depth as usize;
        self.levels[depth] = leaves;
        for level in (0..depth).rev() {
            let (upper, lower) = self.levels.split_at_mut(level + 1);
            let parents = &mut upper[level];
            let children = &lower[0];
            for (i, parent) in parents.iter_mut().enumerate() {
                let mut acc = Bucket::default();
                for child in &children[i * BRANCHING..(i + 1) * BRANCHING] {
                    acc.merge(child);
                }
                *parent = acc;
            }
        }
    }

    /// Add a revision. Grows the tree if the revision is out of range.
    pub fn insert(&mut self, rev: RevisionId) {
        self.ensure_covers(rev);
        if let Some(leaf) = self.leaf_index(rev) {
            let hash = revision_hash(rev);
            self.update_path(leaf, |b| b.absorb(hash));
        }
    }

    /// Remove a revision. Returns `false` if it lies outside the range.
    pub fn remove(&mut self, rev: RevisionId) -> bool {
        match self.leaf_index(rev) {
            Some(leaf) => {
                let hash = revision_hash(rev);
                self.update_path(leaf, |b| b.release(hash));
                true
            }
            None => false,
        }
    }

    fn update_path(&mut self, leaf: usize, f: impl Fn(&mut Bucket)) {
        let depth = self.depth as usize;
        for level in (0..=depth).rev() {
            let shift = 3 * (depth - level);
            f(&mut self.levels[level][leaf >> shift]);
        }
    }

    /// Inclusive revision range covered by leaves `first..=last`.
    fn leaf_span(&self, first: usize, last: usize) -> RevisionRange {
        let min = u128::from(self.range_min);
        let low = min + (first as u128) * self.width();
        let high = min + ((last as u128) + 1) * self.width() - 1;
        let cap = u128::from(u64::MAX);
        RevisionRange::new(
            RevisionId::new(low.min(cap) as u64),
            RevisionId::new(high.min(cap) as u64),
        )
    }

    /// Ranges where `self` and `other` disagree.
    ///
    /// Every revision contained in exactly one of the trees falls inside one
    /// of the returned ranges. The result is sorted and adjacent differing
    /// leaves are merged into one range.
    pub fn diff(&self, other: &RevisionTree) -> Vec<RevisionRange> {
        if self.depth != other.depth {
            // Incomparable layouts: fall back to one range over both spans.
            let low = self.range_min().min(other.range_min());
            let high = self.range_max().max(other.range_max());
            return vec![RevisionRange::new(low, high)];
        }

        let mut a = self.clone();
        let mut b = other.clone();
        loop {
            if a.bucket_shift == b.bucket_shift && a.range_min == b.range_min {
                break;
            }
            if a.bucket_shift < b.bucket_shift {
                a.grow();
            } else if b.bucket_shift < a.bucket_shift {
                b.grow();
            } else {
                a.grow();
                b.grow();
            }
        }

        let mut differing = Vec::new();
        a.collect_differences(&b, 0, 0, &mut differing);

        let mut ranges: Vec<RevisionRange> = Vec::new();
        let mut run: Option<(usize, usize)> = None;
        for leaf in differing {
            run = match run {
                Some((first, last)) if leaf == last + 1 => Some((first, leaf)),
                Some((first, last)) => {
                    ranges.push(a.leaf_span(first, last));
                    Some((leaf, leaf))
                }
                None => Some((leaf, leaf)),
            };
        }
        if let Some((first, last)) = run {
            ranges.push(a.leaf_span(first, last));
        }
        ranges
    }

    /// Depth-first, children in order, so leaves come out ascending.
    fn collect_differences(&self, other: &RevisionTree, level: usize, index: usize, out: &mut Vec<usize>) {
        if self.levels[level][index] == other.levels[level][index] {
            return;
        }
        if level == self.depth as usize {
            out.push(index);
            return;
        }
        for child in index * BRANCHING..(index + 1) * BRANCHING {
            self.collect_differences(other, level + 1, child, out);
        }
    }

    /// Serialize, optionally omitting empty leaves.
    pub fn to_serialized(&self, only_populated: bool) -> SerializedRevisionTree {
        let nodes = self
            .leaves()
            .iter()
            .enumerate()
            .filter(|(_, b)| !only_populated || !b.is_empty())
            .map(|(index, b)| SerializedLeaf {
                index,
                count: b.count,
                hash: b.hash,
            })
            .collect();

        SerializedRevisionTree {
            version: SERIALIZATION_VERSION,
            max_depth: self.depth,
            range_min: self.range_min(),
            range_max: self.range_max(),
            count: self.count(),
            hash: self.root_hash(),
            nodes,
        }
    }

    /// Rebuild a tree from its serialized form, validating its shape.
    pub fn from_serialized(s: &SerializedRevisionTree) -> Result<Self> {
        if s.version != SERIALIZATION_VERSION {
            return Err(ReplicationError::protocol(format!(
                "unsupported revision tree version {}",
                s.version
            )));
        }
        if s.max_depth == 0 || s.max_depth > MAX_DEPTH {
            return Err(ReplicationError::protocol(format!(
                "revision tree depth {} out of bounds",
                s.max_depth
            )));
        }
        if s.range_max < s.range_min {
            return Err(ReplicationError::protocol("revision tree range is inverted"));
        }

        let leaf_count = leaf_count_for(s.max_depth);
        let span = u128::from(s.range_max.as_u64() - s.range_min.as_u64()) + 1;
        let width = span / leaf_count as u128;
        if width == 0 || !width.is_power_of_two() || width * leaf_count as u128 != span {
            return Err(ReplicationError::protocol(format!(
                "revision tree span {span} does not fit {leaf_count} buckets"
            )));
        }
        if u128::from(s.range_min.as_u64()) % span != 0 {
            return Err(ReplicationError::protocol("revision tree range is not aligned"));
        }

        let mut leaves = vec![Bucket::default(); leaf_count];
        let mut seen = vec![false; leaf_count];
        for node in &s.nodes {
            if node.index >= leaf_count || seen[node.index] {
                return Err(ReplicationError::protocol(format!(
                    "revision tree node index {} invalid or repeated",
                    node.index
                )));
            }
            seen[node.index] = true;
            leaves[node.index] = Bucket {
                count: node.count,
                hash: node.hash,
            };
        }

        // Inner buckets sum their children, so the total bounds every partial sum.
        if leaves.iter().try_fold(0u64, |acc, b| acc.checked_add(b.count)).is_none() {
            return Err(ReplicationError::protocol("revision tree leaf counts overflow"));
        }

        let mut tree = Self::with_geometry(s.max_depth, s.range_min.as_u64(), width.trailing_zeros());
        tree.rebuild_from_leaves(leaves);

        if tree.count() != s.count || tree.root_hash() != s.hash {
            return Err(ReplicationError::protocol(format!(
                "revision tree root mismatch: declared count {} hash {:#x}, leaves sum to count {} hash {:#x}",
                s.count,
                s.hash,
                tree.count(),
                tree.root_hash()
            )));
        }
        Ok(tree)
    }

    /// Parse a tree from raw JSON bytes.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        let serialized: SerializedRevisionTree = serde_json::from_slice(bytes)?;
        Self::from_serialized(&serialized)
    }
}

/// Wire form of a [`RevisionTree`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedRevisionTree {
    pub version: u32,
    pub max_depth: u32,
    pub range_min: RevisionId,
    pub range_max: RevisionId,
    pub count: u64,
    pub hash: u64,
    #[serde(default)]
    pub nodes: Vec<SerializedLeaf>,
}

/// One leaf bucket in the wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedLeaf {
    pub index: usize,
    pub count: u64,
    pub hash: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revs(values: &[u64]) -> Vec<RevisionId> {
        values.iter().copied().map(RevisionId::new).collect()
    }

    #[test]
    fn test_insert_order_independent() {
        let a = RevisionTree::from_revisions(2, revs(&[5, 900, 17, 42]));
        let mut b = RevisionTree::new(2, RevisionId::new(5));
        for r in revs(&[42, 17, 900, 5]) {
            b.insert(r);
        }
        assert_eq!(a.count(), 4);
        assert_eq!(a.root_hash(), b.root_hash());
        assert!(a.diff(&b).is_empty());
    }

    #[test]
    fn test_remove_restores_previous_state() {
        let mut tree = RevisionTree::from_revisions(2, revs(&[1, 2, 3]));
        let before = tree.root_hash();
        tree.insert(RevisionId::new(10));
        assert_ne!(tree.root_hash(), before);
        assert!(tree.remove(RevisionId::new(10)));
        assert_eq!(tree.root_hash(), before);
        assert_eq!(tree.count(), 3);
    }

    #[test]
    fn test_grow_keeps_contents() {
        let mut tree = RevisionTree::new(1, RevisionId::new(0));
        tree.insert(RevisionId::new(3));
        let hash = tree.root_hash();
        // 8 leaves of width 1 cover [0, 8); this forces several grows
        tree.insert(RevisionId::new(1_000));
        assert!(tree.range_max() >= RevisionId::new(1_000));
        assert_eq!(tree.count(), 2);
        assert_eq!(tree.root_hash(), hash ^ revision_hash(RevisionId::new(1_000)));
        assert!(tree.remove(RevisionId::new(1_000)));
        assert_eq!(tree.root_hash(), hash);
    }

    #[test]
    fn test_grow_to_full_u64_range() {
        let mut tree = RevisionTree::new(1, RevisionId::new(0));
        tree.insert(RevisionId::MAX);
        tree.insert(RevisionId::MIN);
        assert_eq!(tree.range_min(), RevisionId::MIN);
        assert_eq!(tree.range_max(), RevisionId::MAX);
        assert_eq!(tree.count(), 2);
    }

    #[test]
    fn test_diff_finds_missing_and_extra() {
        let leader = RevisionTree::from_revisions(2, revs(&[10, 20, 30, 500]));
        let follower = RevisionTree::from_revisions(2, revs(&[10, 30, 700]));
        let ranges = leader.diff(&follower);
        assert!(!ranges.is_empty());
        for rev in revs(&[20, 500, 700]) {
            assert!(ranges.iter().any(|r| r.contains(rev)), "{rev:?} not covered");
        }
        for pair in ranges.windows(2) {
            assert!(pair[0].precedes(&pair[1]));
        }
    }

    #[test]
    fn test_diff_of_identical_trees_is_empty() {
        let a = RevisionTree::from_revisions(3, (0..1000).map(RevisionId::new));
        let b = RevisionTree::from_revisions(3, (0..1000).rev().map(RevisionId::new));
        assert!(a.diff(&b).is_empty());
    }

    #[test]
    fn test_diff_with_different_geometry() {
        let a = RevisionTree::from_revisions(2, revs(&[1, 2]));
        let b = RevisionTree::from_revisions(2, revs(&[1, 2, 1 << 40]));
        let ranges = a.diff(&b);
        assert!(ranges.iter().any(|r| r.contains(RevisionId::new(1 << 40))));
        assert!(!ranges.iter().any(|r| r.contains(RevisionId::new(1)) && r.high.as_u64() < (1 << 20)));
    }

    #[test]
    fn test_serialization_roundtrip_only_populated() {
        let tree = RevisionTree::from_revisions(2, revs(&[4, 8, 15, 16, 23, 42]));
        let wire = tree.to_serialized(true);
        assert!(wire.nodes.len() <= 6);
        let json = serde_json::to_vec(&wire).unwrap();
        let parsed = RevisionTree::from_json_slice(&json).unwrap();
        assert_eq!(parsed, tree);
    }

    #[test]
    fn test_deserialize_rejects_root_mismatch() {
        let tree = RevisionTree::from_revisions(2, revs(&[1, 2, 3]));
        let mut wire = tree.to_serialized(false);
        wire.count += 1;
        assert!(matches!(
            RevisionTree::from_serialized(&wire),
            Err(ReplicationError::Protocol(_))
        ));
    }

    #[test]
    fn test_deserialize_rejects_bad_geometry() {
        let tree = RevisionTree::from_revisions(2, revs(&[1]));
        let mut wire = tree.to_serialized(true);
        wire.range_max = RevisionId::new(wire.range_max.as_u64() + 1);
        assert!(RevisionTree::from_serialized(&wire).is_err());

        let mut wire = tree.to_serialized(true);
        wire.max_depth = MAX_DEPTH + 1;
        assert!(RevisionTree::from_serialized(&wire).is_err());

        let mut wire = tree.to_serialized(true);
        wire.nodes.push(SerializedLeaf { index: 10_000, count: 0, hash: 0 });
        assert!(RevisionTree::from_serialized(&wire).is_err());
    }

    #[test]
    fn test_deserialize_rejects_overflowing_counts() {
        let tree = RevisionTree::from_revisions(1, revs(&[1]));
        let mut wire = tree.to_serialized(false);
        wire.nodes[0].count = u64::MAX;
        wire.nodes[1].count = 1;
        assert!(matches!(
            RevisionTree::from_serialized(&wire),
            Err(ReplicationError::Protocol(_))
        ));
    }

    #[test]
    fn test_garbage_json_is_protocol_error() {
        assert!(matches!(
            RevisionTree::from_json_slice(b"{not json"),
            Err(ReplicationError::Protocol(_))
        ));
    }
}
