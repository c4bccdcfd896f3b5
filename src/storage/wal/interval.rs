// Copyright 2025 ColStore Project Authors. Licensed under Apache-2.0.

use serde::{Deserialize, Serialize};

/// A closed lsn interval `[start, end]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedInterval {
    pub start: u64,
    pub end: u64,
}

impl ClosedInterval {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn point(lsn: u64) -> Self {
        Self {
            start: lsn,
            end: lsn,
        }
    }

    pub fn contains(&self, lsn: u64) -> bool {
        self.start <= lsn && lsn <= self.end
    }

    /// Whether the two intervals overlap or touch.
    fn mergeable(&self, other: &ClosedInterval) -> bool {
        self.start <= other.end.saturating_add(1) && other.start <= self.end.saturating_add(1)
    }
}

/// A sorted set of disjoint closed intervals.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedIntervals {
    intervals: Vec<ClosedInterval>,
}

impl ClosedIntervals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_interval(interval: ClosedInterval) -> Self {
        Self {
            intervals: vec![interval],
        }
    }

    pub fn intervals(&self) -> &[ClosedInterval] {
        &self.intervals
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Insert an interval, coalescing with any neighbors it overlaps or
    /// touches.
    pub fn try_merge(&mut self, mut interval: ClosedInterval) {
        let mut out = Vec::with_capacity(self.intervals.len() + 1);
        let mut placed = false;
        for existing in self.intervals.drain(..) {
            if existing.mergeable(&interval) {
                interval.start = interval.start.min(existing.start);
                interval.end = interval.end.max(existing.end);
            } else if existing.end < interval.start {
                out.push(existing);
            } else {
                if !placed {
                    out.push(interval);
                    placed = true;
                }
                out.push(existing);
            }
        }
        if !placed {
            out.push(interval);
        }
        self.intervals = out;
    }

    pub fn merge_all(&mut self, other: &ClosedIntervals) {
        for interval in &other.intervals {
            self.try_merge(*interval);
        }
    }

    pub fn contains_lsn(&self, lsn: u64) -> bool {
        self.intervals.iter().any(|i| i.contains(lsn))
    }

    pub fn contains_interval(&self, interval: &ClosedInterval) -> bool {
        self.intervals
            .iter()
            .any(|i| i.start <= interval.start && interval.end <= i.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_coalesces_adjacent() {
        let mut set = ClosedIntervals::new();
        set.try_merge(ClosedInterval::new(1, 3));
        set.try_merge(ClosedInterval::new(7, 9));
        set.try_merge(ClosedInterval::new(4, 5));
        assert_eq!(
            set.intervals(),
            &[ClosedInterval::new(1, 5), ClosedInterval::new(7, 9)]
        );
        assert!(set.contains_lsn(2));
        assert!(set.contains_lsn(5));
        assert!(!set.contains_lsn(6));
        assert!(set.contains_interval(&ClosedInterval::new(7, 8)));
        assert!(!set.contains_interval(&ClosedInterval::new(5, 7)));
    }

    #[test]
    fn merge_keeps_order() {
        let mut set = ClosedIntervals::new();
        set.try_merge(ClosedInterval::new(10, 12));
        set.try_merge(ClosedInterval::new(1, 2));
        assert_eq!(
            set.intervals(),
            &[ClosedInterval::new(1, 2), ClosedInterval::new(10, 12)]
        );
    }

    #[test]
    fn overlapping_intervals_collapse() {
        let mut set = ClosedIntervals::new();
        set.try_merge(ClosedInterval::new(1, 10));
        set.try_merge(ClosedInterval::new(5, 20));
        set.try_merge(ClosedInterval::new(2, 3));
        assert_eq!(set.intervals(), &[ClosedInterval::new(1, 20)]);
    }
}
