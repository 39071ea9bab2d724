// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Ordered, deduplicated feature-id sets and the combination semantics
//! applied when a new spatial match meets a prior filter state.
//!

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How a new filter result is merged with the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CombineOp {
    /// Intersection of previous and new.
    And,
    /// Union of previous and new.
    Or,
    /// Previous minus new.
    NotAnd,
    /// New replaces previous.
    Replace,
}

impl CombineOp {
    /// TRUE when the operator consumes the previous filter state.
    pub fn reads_previous(&self) -> bool {
        !matches!(self, CombineOp::Replace)
    }
}

/// Number of ids per `IN (...)` group when rendering subset strings; hosts
/// with a hard limit on IN-list length get OR-joined groups instead of one
/// oversized list.
pub const IN_CHUNK: usize = 1000;

/// An ordered, deduplicated set of primary-key values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FidSet(BTreeSet<i64>);

impl FidSet {
    /// The empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// TRUE when no ids are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Membership test.
    pub fn contains(&self, fid: i64) -> bool {
        self.0.contains(&fid)
    }

    /// Add one id; duplicates are absorbed.
    pub fn insert(&mut self, fid: i64) {
        self.0.insert(fid);
    }

    /// Iterate ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.0.iter().copied()
    }

    /// Set intersection.
    pub fn intersection(&self, other: &Self) -> Self {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    /// Set union.
    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).copied().collect())
    }

    /// Set difference: `self` minus `other`.
    pub fn difference(&self, other: &Self) -> Self {
        Self(self.0.difference(&other.0).copied().collect())
    }

    /// Apply a combine operator with `self` as the *previous* set and `new`
    /// as the fresh spatial match.
    pub fn combine(&self, op: CombineOp, new: &Self) -> Self {
        match op {
            CombineOp::And => self.intersection(new),
            CombineOp::Or => self.union(new),
            CombineOp::NotAnd => self.difference(new),
            CombineOp::Replace => new.clone(),
        }
    }

    /// Render as a host subset string over the given primary-key column.
    ///
    /// The empty set renders as `0 = 1` (universally false) because some
    /// drivers reject `fid = -1` style sentinels. Large sets are split into
    /// OR-joined `IN` groups of [`IN_CHUNK`] ids.
    pub fn subset_string(&self, pk: &str) -> String {
        if self.0.is_empty() {
            return "0 = 1".to_owned();
        }
        let ids: Vec<i64> = self.0.iter().copied().collect();
        let groups: Vec<String> = ids
            .chunks(IN_CHUNK)
            .map(|chunk| {
                let list: Vec<String> = chunk.iter().map(|x| x.to_string()).collect();
                format!("\"{pk}\" IN ({})", list.join(", "))
            })
            .collect();
        groups.join(" OR ")
    }
}

impl FromIterator<i64> for FidSet {
    fn from_iter<T: IntoIterator<Item = i64>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<&[i64]> for FidSet {
    fn from(value: &[i64]) -> Self {
        value.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[i64]) -> FidSet {
        FidSet::from(ids)
    }

    #[test]
    fn test_combine_and() {
        let prev = set(&[1, 2, 3]);
        let new = set(&[2, 3, 4]);
        assert_eq!(prev.combine(CombineOp::And, &new), set(&[2, 3]));
        // AND(∅, X) = ∅ and AND(X, X) = X...
        assert_eq!(FidSet::new().combine(CombineOp::And, &new), FidSet::new());
        assert_eq!(new.combine(CombineOp::And, &new), new);
        // commutative...
        assert_eq!(
            prev.combine(CombineOp::And, &new),
            new.combine(CombineOp::And, &prev)
        );
    }

    #[test]
    fn test_combine_or() {
        let prev = set(&[1, 2]);
        let new = set(&[2, 5]);
        assert_eq!(prev.combine(CombineOp::Or, &new), set(&[1, 2, 5]));
        assert_eq!(prev.combine(CombineOp::Or, &FidSet::new()), prev);
        assert_eq!(
            prev.combine(CombineOp::Or, &new),
            new.combine(CombineOp::Or, &prev)
        );
    }

    #[test]
    fn test_combine_not_and() {
        let prev = set(&[1, 2, 3]);
        let new = set(&[2]);
        assert_eq!(prev.combine(CombineOp::NotAnd, &new), set(&[1, 3]));
        assert_eq!(prev.combine(CombineOp::NotAnd, &prev), FidSet::new());
    }

    #[test]
    fn test_combine_replace() {
        let prev = set(&[1, 2, 3]);
        let new = set(&[9]);
        assert_eq!(prev.combine(CombineOp::Replace, &new), new);
    }

    #[test]
    fn test_subset_string_empty_is_universally_false() {
        assert_eq!(FidSet::new().subset_string("fid"), "0 = 1");
    }

    #[test]
    fn test_subset_string_lists_ordered_ids() {
        let s = set(&[5, 1, 3, 1]);
        assert_eq!(s.subset_string("ogc_fid"), "\"ogc_fid\" IN (1, 3, 5)");
    }

    #[test]
    fn test_subset_string_chunks() {
        let s: FidSet = (0..(IN_CHUNK as i64 + 2)).collect();
        let rendered = s.subset_string("fid");
        assert_eq!(rendered.matches(" IN (").count(), 2);
        assert!(rendered.contains(") OR \"fid\" IN ("));
    }
}
