// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sparse set of disjoint, non-adjacent `[low, high]` intervals.
//!
//! Backs received-packet-number tracking, to-ack tracking, and stream
//! byte-hole tracking (§3, §4.1). Grounded on
//! `original_source/src/core/range.h`: subranges are stored as
//! `{low, count}` pairs in a growable array, kept sorted, and searched
//! with the same binary-search contract (`QuicRangeSearch`/
//! `QuicRangeCompare`) — exposed here as a safe `SearchResult` enum
//! instead of the C macro pair of signed insertion indices.

use std::cmp::Ordering;

/// A single closed interval `[low, low + count - 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubRange {
    pub low: u64,
    pub count: u64,
}

impl SubRange {
    pub fn high(&self) -> u64 {
        self.low + self.count - 1
    }
}

/// Outcome of a binary search for a `(low, high)` key against the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// An existing subrange overlaps the key, at this index.
    Found(usize),
    /// No subrange overlaps the key; this is where one would be inserted
    /// to keep the array sorted.
    Insert(usize),
}

/// Sorted, disjoint, non-adjacent interval set over `u64`.
///
/// Invariant (§8 property 2): for adjacent stored intervals
/// `[l_i, l_i+c_i-1]`, `[l_{i+1}, l_{i+1}+c_{i+1}-1]`,
/// `l_{i+1} > l_i + c_i` (no touch, no overlap) and intervals are sorted
/// ascending by `low`.
#[derive(Debug, Clone, Default)]
pub struct RangeSet {
    subs: Vec<SubRange>,
    /// Growth cap, in subrange count. `None` means unbounded.
    max_subs: Option<usize>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self {
            subs: Vec::new(),
            max_subs: None,
        }
    }

    /// Construct a range set that silently evicts its lowest interval
    /// once `max_subs` subranges would be exceeded (§3 invariant: range
    /// growth is bounded and duplicate suppression degrades gracefully).
    pub fn with_capacity_limit(max_subs: usize) -> Self {
        Self {
            subs: Vec::new(),
            max_subs: Some(max_subs),
        }
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &SubRange> {
        self.subs.iter()
    }

    fn compare(key_low: u64, key_high: u64, sub: &SubRange) -> Ordering {
        if key_high < sub.low {
            Ordering::Less
        } else if sub.high() < key_low {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    /// Binary search for any subrange overlapping `[low, high]`.
    pub fn search(&self, low: u64, high: u64) -> SearchResult {
        let mut lo = 0usize;
        let mut hi = self.subs.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match Self::compare(low, high, &self.subs[mid]) {
                Ordering::Equal => return SearchResult::Found(mid),
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
            }
        }
        SearchResult::Insert(lo)
    }

    pub fn contains(&self, value: u64) -> bool {
        matches!(self.search(value, value), SearchResult::Found(_))
    }

    fn evict_if_over_capacity(&mut self) {
        if let Some(max) = self.max_subs {
            while self.subs.len() > max {
                self.subs.remove(0);
            }
        }
    }

    /// Insert the closed interval `[low, low + count - 1]`, merging with
    /// neighbors as needed. `count == 0` is a no-op.
    pub fn add_range(&mut self, low: u64, count: u64) {
        if count == 0 {
            return;
        }
        let high = low + count - 1;
        match self.search(low, high) {
            SearchResult::Found(idx) => {
                // Overlaps/touches subs[idx]; expand to the union, then
                // absorb any further neighbors that now touch/overlap.
                let merged_low = self.subs[idx].low.min(low);
                let merged_high = self.subs[idx].high().max(high);
                self.subs[idx] = SubRange {
                    low: merged_low,
                    count: merged_high - merged_low + 1,
                };
                self.coalesce_around(idx);
            }
            SearchResult::Insert(idx) => {
                // Check adjacency (touching, not overlapping) with
                // neighbors at idx-1 and idx, since `search` only reports
                // overlap, not touch.
                let touches_prev =
                    idx > 0 && self.subs[idx - 1].high().checked_add(1) == Some(low);
                let touches_next = idx < self.subs.len() && high.checked_add(1) == Some(self.subs[idx].low);
                match (touches_prev, touches_next) {
                    (true, true) => {
                        let new_low = self.subs[idx - 1].low;
                        let new_high = self.subs[idx].high();
                        self.subs[idx - 1] = SubRange {
                            low: new_low,
                            count: new_high - new_low + 1,
                        };
                        self.subs.remove(idx);
                    }
                    (true, false) => {
                        self.subs[idx - 1].count = high - self.subs[idx - 1].low + 1;
                    }
                    (false, true) => {
                        let new_high = self.subs[idx].high();
                        self.subs[idx] = SubRange {
                            low,
                            count: new_high - low + 1,
                        };
                    }
                    (false, false) => {
                        self.subs.insert(idx, SubRange { low, count });
                    }
                }
            }
        }
        self.evict_if_over_capacity();
    }

    /// After expanding `subs[idx]`, absorb any now-overlapping/touching
    /// neighbors on either side.
    fn coalesce_around(&mut self, idx: usize) {
        let mut idx = idx;
        while idx + 1 < self.subs.len()
            && self.subs[idx].high().checked_add(1) >= Some(self.subs[idx + 1].low)
        {
            let high = self.subs[idx].high().max(self.subs[idx + 1].high());
            self.subs[idx].count = high - self.subs[idx].low + 1;
            self.subs.remove(idx + 1);
        }
        while idx > 0
            && self.subs[idx - 1].high().checked_add(1) >= Some(self.subs[idx].low)
        {
            let high = self.subs[idx].high().max(self.subs[idx - 1].high());
            let low = self.subs[idx - 1].low;
            self.subs[idx - 1] = SubRange {
                low,
                count: high - low + 1,
            };
            self.subs.remove(idx);
            idx -= 1;
        }
    }

    /// Insert a single value.
    pub fn add_value(&mut self, value: u64) {
        self.add_range(value, 1);
    }

    /// Remove the closed interval `[low, low + count - 1]`, splitting,
    /// shrinking, or dropping intervals as needed.
    pub fn remove_range(&mut self, low: u64, count: u64) {
        if count == 0 {
            return;
        }
        let high = low + count - 1;
        let mut i = 0;
        while i < self.subs.len() {
            let sub = self.subs[i];
            if sub.high() < low {
                i += 1;
                continue;
            }
            if sub.low > high {
                break;
            }
            // sub overlaps [low, high]
            let left_remainder = sub.low < low;
            let right_remainder = sub.high() > high;
            match (left_remainder, right_remainder) {
                (false, false) => {
                    self.subs.remove(i);
                    // don't advance i; next element shifted into place
                }
                (true, false) => {
                    self.subs[i].count = low - sub.low;
                    i += 1;
                }
                (false, true) => {
                    let new_low = high + 1;
                    self.subs[i] = SubRange {
                        low: new_low,
                        count: sub.high() - new_low + 1,
                    };
                    i += 1;
                }
                (true, true) => {
                    self.subs[i].count = low - sub.low;
                    let new_low = high + 1;
                    self.subs.insert(
                        i + 1,
                        SubRange {
                            low: new_low,
                            count: sub.high() - new_low + 1,
                        },
                    );
                    i += 2;
                }
            }
        }
    }

    /// Drop everything below `low`, truncating an interval that straddles
    /// the boundary (§8 boundary behavior).
    pub fn set_min(&mut self, low: u64) {
        while let Some(first) = self.subs.first().copied() {
            if first.high() < low {
                self.subs.remove(0);
            } else if first.low < low {
                self.subs[0] = SubRange {
                    low,
                    count: first.high() - low + 1,
                };
                break;
            } else {
                break;
            }
        }
    }

    pub fn get_min(&self) -> Option<u64> {
        self.subs.first().map(|s| s.low)
    }

    pub fn get_max(&self) -> Option<u64> {
        self.subs.last().map(|s| s.high())
    }

    /// Given `low` known to start an interval, return `(count, is_last)`.
    pub fn get_range(&self, low: u64) -> Option<(u64, bool)> {
        let idx = self.subs.iter().position(|s| s.low == low)?;
        Some((self.subs[idx].count, idx == self.subs.len() - 1))
    }

    /// Clear to the empty set.
    pub fn reset(&mut self) {
        self.subs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_disjoint_stays_sorted_and_disjoint() {
        let mut rs = RangeSet::new();
        rs.add_value(10);
        rs.add_value(5);
        rs.add_value(20);
        assert_eq!(
            rs.iter().map(|s| (s.low, s.count)).collect::<Vec<_>>(),
            vec![(5, 1), (10, 1), (20, 1)]
        );
    }

    #[test]
    fn adjacent_values_merge() {
        let mut rs = RangeSet::new();
        rs.add_value(5);
        rs.add_value(6);
        assert_eq!(rs.len(), 1);
        assert_eq!(rs.get_range(5), Some((2, true)));
    }

    #[test]
    fn add_value_at_boundary_merges_two_adjacent_intervals() {
        let mut rs = RangeSet::new();
        rs.add_range(0, 3); // [0,2]
        rs.add_range(4, 3); // [4,6]
        assert_eq!(rs.len(), 2);
        rs.add_value(3); // bridges both
        assert_eq!(rs.len(), 1);
        assert_eq!(rs.get_range(0), Some((7, true)));
    }

    #[test]
    fn contains_after_inserts() {
        let mut rs = RangeSet::new();
        rs.add_range(10, 5); // [10,14]
        assert!(rs.contains(10));
        assert!(rs.contains(14));
        assert!(!rs.contains(9));
        assert!(!rs.contains(15));
    }

    #[test]
    fn remove_range_splits_interval() {
        let mut rs = RangeSet::new();
        rs.add_range(0, 10); // [0,9]
        rs.remove_range(3, 2); // remove [3,4]
        assert_eq!(
            rs.iter().map(|s| (s.low, s.count)).collect::<Vec<_>>(),
            vec![(0, 3), (5, 5)]
        );
    }

    #[test]
    fn remove_range_shrinks_from_either_edge() {
        let mut rs = RangeSet::new();
        rs.add_range(0, 10);
        rs.remove_range(0, 3); // drop prefix
        assert_eq!(rs.get_min(), Some(3));
        rs.remove_range(8, 2); // drop suffix
        assert_eq!(rs.get_max(), Some(7));
    }

    #[test]
    fn set_min_truncates_straddling_interval() {
        let mut rs = RangeSet::new();
        rs.add_range(0, 10); // [0,9]
        rs.set_min(4);
        assert_eq!(rs.get_min(), Some(4));
        assert_eq!(rs.get_max(), Some(9));
    }

    #[test]
    fn set_min_drops_entire_lower_intervals() {
        let mut rs = RangeSet::new();
        rs.add_range(0, 3);
        rs.add_range(10, 3);
        rs.set_min(5);
        assert_eq!(rs.len(), 1);
        assert_eq!(rs.get_min(), Some(10));
    }

    #[test]
    fn capacity_limit_evicts_oldest() {
        let mut rs = RangeSet::with_capacity_limit(2);
        rs.add_value(1);
        rs.add_value(100);
        rs.add_value(1000);
        assert_eq!(rs.len(), 2);
        assert!(!rs.contains(1));
        assert!(rs.contains(100));
        assert!(rs.contains(1000));
    }

    #[test]
    fn ack_frame_scenario_ranges() {
        // §8 scenario 4: {[2,2], [5,7], [10,12]}
        let mut rs = RangeSet::new();
        rs.add_value(2);
        rs.add_range(5, 3);
        rs.add_range(10, 3);
        let ranges: Vec<_> = rs.iter().map(|s| (s.low, s.high())).collect();
        assert_eq!(ranges, vec![(2, 2), (5, 7), (10, 12)]);
    }

    #[test]
    fn random_insertion_order_merges_into_one_span() {
        // Packet numbers rarely arrive in order; inserting every value in
        // [0, 200) through a shuffled permutation must still converge on
        // a single contiguous interval, same as in-order insertion would.
        let mut values: Vec<u64> = (0..200).collect();
        for i in (1..values.len()).rev() {
            let j = fastrand::usize(..=i);
            values.swap(i, j);
        }
        let mut rs = RangeSet::new();
        for &v in &values {
            rs.add_value(v);
        }
        assert_eq!(rs.len(), 1);
        assert_eq!(rs.get_min(), Some(0));
        assert_eq!(rs.get_max(), Some(199));
        for v in 0..200 {
            assert!(rs.contains(v));
        }
    }
}
