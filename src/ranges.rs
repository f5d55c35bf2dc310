// Copyright (c) 2024 The QuicRecovery Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::collections::Bound::Included;
use std::collections::Bound::Unbounded;
use std::ops::Range;

/// An ordered set of disjoint u64 ranges.
///
/// Ranges are kept sorted and non-overlapping; adjacent or overlapping
/// insertions are coalesced. The set is bounded: when the number of ranges
/// exceeds the capacity, the range with the smallest values is evicted.
///
/// Iteration is ascending; `iter().rev()` yields the largest-first order
/// required by ACK frames.
#[derive(Clone, PartialEq, Eq)]
pub struct RangeSet {
    /// Disjoint ranges keyed by their start, mapped to their exclusive end.
    set: BTreeMap<u64, u64>,

    /// The maximum number of ranges kept in the set.
    capacity: usize,
}

impl RangeSet {
    /// Create a new `RangeSet` holding at most `capacity` ranges.
    pub fn new(capacity: usize) -> Self {
        RangeSet {
            set: BTreeMap::default(),
            capacity,
        }
    }

    /// Insert `range` into the set, merging with any overlapping or
    /// adjacent existing ranges.
    /// Note that the range is [start, end), i.e. contains `start` but not `end`.
    pub fn insert(&mut self, mut range: Range<u64>) {
        if range.is_empty() {
            return;
        }

        // Merge with a preceding range that reaches into the new one.
        if let Some(prev) = self.prev_to(range.start) {
            if prev.end >= range.end {
                return;
            }
            if prev.end >= range.start {
                self.set.remove(&prev.start);
                range.start = prev.start;
            }
        }

        // Absorb any following ranges the new one overlaps or touches.
        while let Some(next) = self.next_to(range.start) {
            if next.start > range.end {
                break;
            }
            self.set.remove(&next.start);
            range.end = std::cmp::max(next.end, range.end);
        }

        if self.len() >= self.capacity {
            self.set.pop_first();
        }
        self.set.insert(range.start, range.end);
    }

    /// Add a single element to the set.
    pub fn add_elem(&mut self, elem: u64) {
        self.insert(elem..elem.saturating_add(1));
    }

    /// Remove all values smaller than or equal to `elem` from the set.
    pub fn remove_until(&mut self, elem: u64) {
        let covered: Vec<Range<u64>> = self
            .set
            .range((Unbounded, Included(&elem)))
            .map(|(&s, &e)| (s..e))
            .collect();

        for r in covered {
            self.set.remove(&r.start);
            if r.end > elem + 1 {
                self.set.insert(elem + 1, r.end);
            }
        }
    }

    /// Check whether `elem` is covered by the set.
    pub fn contains(&self, elem: u64) -> bool {
        match self.prev_to(elem) {
            Some(prev) => prev.contains(&elem),
            None => false,
        }
    }

    /// Return the smallest value in the set.
    pub fn min(&self) -> Option<u64> {
        self.set.iter().next().map(|(&s, _)| s)
    }

    /// Return the largest value in the set.
    pub fn max(&self) -> Option<u64> {
        self.set.iter().next_back().map(|(_, &e)| e - 1)
    }

    /// Return the number of ranges in the set.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Return true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Remove all ranges from the set.
    pub fn clear(&mut self) {
        self.set.clear();
    }

    /// Return an iterator over the ranges in the set, in ascending order.
    pub fn iter(&self) -> Iter {
        Iter {
            set: self.set.iter(),
        }
    }

    /// Return an iterator over every value in the set, in ascending order.
    pub fn flatten(&self) -> impl Iterator<Item = u64> + '_ {
        self.iter().flatten()
    }

    /// Find the range starting at or before `elem`, if any.
    fn prev_to(&self, elem: u64) -> Option<Range<u64>> {
        self.set
            .range((Unbounded, Included(elem)))
            .map(|(&s, &e)| (s..e))
            .next_back()
    }

    /// Find the range starting at or after `elem`, if any.
    fn next_to(&self, elem: u64) -> Option<Range<u64>> {
        self.set
            .range((Included(elem), Unbounded))
            .map(|(&s, &e)| (s..e))
            .next()
    }
}

impl Default for RangeSet {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl std::fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ranges: Vec<Range<u64>> = self
            .iter()
            .map(|mut r| {
                // Display as closed intervals [start, end].
                r.end -= 1;
                r
            })
            .collect();
        write!(f, "{ranges:?}")
    }
}

/// An iterator over the ranges of a `RangeSet`.
pub struct Iter<'a> {
    set: btree_map::Iter<'a, u64, u64>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Range<u64>;

    fn next(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.set.next()?;
        Some(start..end)
    }
}

impl<'a> DoubleEndedIterator for Iter<'a> {
    fn next_back(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.set.next_back()?;
        Some(start..end)
    }
}

impl<'a> ExactSizeIterator for Iter<'a> {
    fn len(&self) -> usize {
        self.set.len()
    }
}
