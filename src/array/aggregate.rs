//! Filepath: src/array/aggregate.rs
//!
//! Bulk aggregates and sorted-sequence search.
//!
//! The aggregate routines back both the public accessor methods and the
//! kernel's `will_match` fast path (when a predicate provably matches a
//! whole window, the kernel sums or min/maxes it here instead of
//! scanning element by element).

use crate::alloc::Allocator;
use crate::direct::{get, with_width};
use crate::query::NodeView;
use crate::Array;
use crate::NOT_FOUND;

/// Sum of `[start, end)`, wrapping on 64-bit overflow.
pub(crate) fn sum_view<const W: usize>(view: &NodeView<'_>, start: usize, end: usize) -> i64 {
    debug_assert!(start <= end && end <= view.size);
    if W == 0 || start == end {
        return 0;
    }

    let mut acc = 0i64;
    let mut i = start;

    if W == 1 {
        // Bit sum is population count; do whole words where possible.
        let per_chunk = 64;
        let first_full = round_up(start, per_chunk).min(end);
        while i < first_full {
            acc += unsafe { get::<W>(view.data, i) };
            i += 1;
        }
        let full_end = i + (end - i) / per_chunk * per_chunk;
        while i < full_end {
            let chunk = unsafe { view.data.cast::<u64>().add(i / 64).read_unaligned() };
            acc += i64::from(chunk.count_ones());
            i += per_chunk;
        }
    }

    while i < end {
        acc = acc.wrapping_add(unsafe { get::<W>(view.data, i) });
        i += 1;
    }
    acc
}

/// Largest (`max = true`) or smallest value in `[start, end)` and its
/// index. `None` on an empty range.
pub(crate) fn minmax_view<const W: usize>(
    view: &NodeView<'_>,
    max: bool,
    start: usize,
    end: usize,
) -> Option<(i64, usize)> {
    debug_assert!(start <= end && end <= view.size);
    if start == end {
        return None;
    }

    let mut best = unsafe { get::<W>(view.data, start) };
    let mut best_ndx = start;
    for i in start + 1..end {
        let v = unsafe { get::<W>(view.data, i) };
        let better = if max { v > best } else { v < best };
        if better {
            best = v;
            best_ndx = i;
        }
    }
    Some((best, best_ndx))
}

#[inline(always)]
fn round_up(p: usize, align: usize) -> usize {
    (p + align - 1) & !(align - 1)
}

pub(crate) fn sum_dispatch(view: &NodeView<'_>, start: usize, end: usize) -> i64 {
    with_width!(usize::from(view.width), sum_view(view, start, end))
}

pub(crate) fn minmax_dispatch(
    view: &NodeView<'_>,
    max: bool,
    start: usize,
    end: usize,
) -> Option<(i64, usize)> {
    with_width!(usize::from(view.width), minmax_view(view, max, start, end))
}

impl<'a, A: Allocator> Array<'a, A> {
    fn resolve_end(&self, end: usize) -> usize {
        if end == NOT_FOUND {
            self.size()
        } else {
            end
        }
    }

    /// Sum of `[start, end)`. `end == NOT_FOUND` means the node's size.
    #[must_use]
    pub fn sum(&self, start: usize, end: usize) -> i64 {
        let end = self.resolve_end(end);
        sum_dispatch(&self.view(), start, end)
    }

    /// Largest value in `[start, end)` and its index.
    #[must_use]
    pub fn maximum(&self, start: usize, end: usize) -> Option<(i64, usize)> {
        let end = self.resolve_end(end);
        minmax_dispatch(&self.view(), true, start, end)
    }

    /// Smallest value in `[start, end)` and its index.
    #[must_use]
    pub fn minimum(&self, start: usize, end: usize) -> Option<(i64, usize)> {
        let end = self.resolve_end(end);
        minmax_dispatch(&self.view(), false, start, end)
    }

    /// Mean of `[start, end)`, `None` on an empty range.
    #[must_use]
    pub fn average(&self, start: usize, end: usize) -> Option<f64> {
        let end = self.resolve_end(end);
        if start == end {
            return None;
        }
        let total = self.sum(start, end);
        Some(total as f64 / (end - start) as f64)
    }

    /// Index of the first element `>= value` in an ascending sequence;
    /// the size when every element is smaller.
    ///
    /// ```text
    ///     3 3 3 4 4 4 5 6 7 9 9 9
    ///     ^     ^     ^     ^     ^
    ///     |     |     |     |     |
    ///     |     |     |     |      -- Lower and upper bound of 15
    ///     |     |     |      -- Lower and upper bound of 8
    ///     |     |      -- Upper bound of 4
    ///     |      -- Lower bound of 4
    ///      -- Lower and upper bound of 1
    /// ```
    #[must_use]
    pub fn lower_bound_int(&self, value: i64) -> usize {
        let getter = self.vtable.getter;
        let mut lo = 0usize;
        let mut n = self.size();
        while n > 0 {
            let half = n / 2;
            let mid = lo + half;
            let v = unsafe { getter(self.data, mid) };
            if v < value {
                lo = mid + 1;
                n -= half + 1;
            } else {
                n = half;
            }
        }
        lo
    }

    /// Index of the first element `> value` in an ascending sequence;
    /// the size when every element is `<= value`.
    #[must_use]
    pub fn upper_bound_int(&self, value: i64) -> usize {
        let getter = self.vtable.getter;
        let mut lo = 0usize;
        let mut n = self.size();
        while n > 0 {
            let half = n / 2;
            let mid = lo + half;
            let v = unsafe { getter(self.data, mid) };
            if v <= value {
                lo = mid + 1;
                n -= half + 1;
            } else {
                n = half;
            }
        }
        lo
    }

    /// First index in `[start, end)` whose element is `>= target`, in
    /// an ascending sequence. Galloping then binary search, so probing
    /// near `start` is cheap. `end == NOT_FOUND` means the size.
    #[must_use]
    pub fn find_gte(&self, target: i64, start: usize, end: usize) -> Option<usize> {
        let end = self.resolve_end(end);
        debug_assert!(start <= end && end <= self.size());
        if start >= end {
            return None;
        }

        let getter = self.vtable.getter;
        if unsafe { getter(self.data, start) } >= target {
            return Some(start);
        }

        // Gallop out of [start, ...]: lo always holds a value < target.
        let mut lo = start;
        let mut step = 1usize;
        let mut hi;
        loop {
            let probe = lo + step;
            if probe >= end {
                hi = end;
                break;
            }
            if unsafe { getter(self.data, probe) } < target {
                lo = probe;
                step <<= 1;
            } else {
                hi = probe;
                break;
            }
        }

        let mut left = lo + 1;
        while left < hi {
            let mid = left + (hi - left) / 2;
            if unsafe { getter(self.data, mid) } < target {
                left = mid + 1;
            } else {
                hi = mid;
            }
        }

        if left < end {
            Some(left)
        } else {
            None
        }
    }

    /// Like [`find_gte`](Self::find_gte), iterating in the ascending
    /// order given by `indirection`: logical position `i` reads element
    /// `indirection[i]`. Returns the logical position of the first
    /// element `>= target`.
    ///
    /// `indirection` must hold valid indices into this array and cover
    /// at least `[start, indirection.size())`.
    #[must_use]
    pub fn find_gte_indirect(
        &self,
        target: i64,
        start: usize,
        indirection: &Array<'_, A>,
    ) -> Option<usize> {
        let end = indirection.size();
        if start >= end {
            return None;
        }

        let mut left = start;
        let mut right = end;
        while left < right {
            let mid = left + (right - left) / 2;
            let v = self.get(indirection.get(mid) as usize);
            if v < target {
                left = mid + 1;
            } else {
                right = mid;
            }
        }

        if left < end {
            Some(left)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SlabAlloc;
    use crate::header::NodeType;

    fn array_of<'a>(alloc: &'a SlabAlloc, values: &[i64]) -> Array<'a, SlabAlloc> {
        let mut a = Array::new(alloc);
        a.create(NodeType::Normal).unwrap();
        for &v in values {
            a.add(v).unwrap();
        }
        a
    }

    #[test]
    fn sum_matches_naive_across_widths() {
        let alloc = SlabAlloc::new();
        let probes: &[&[i64]] = &[
            &[0, 1, 1, 0, 1, 1, 1, 0, 1],
            &[3, 0, 2, 1, 3, 3],
            &[15, 1, 7, 0, 9],
            &[-100, 100, 27, -3],
            &[30_000, -30_000, 12_345],
            &[1 << 40, -(1 << 41), 17],
        ];
        for values in probes {
            let a = array_of(&alloc, values);
            let naive: i64 = values.iter().sum();
            assert_eq!(a.sum(0, a.size()), naive, "payload {values:?}");
            // Sub-ranges too.
            if values.len() > 2 {
                let naive: i64 = values[1..values.len() - 1].iter().sum();
                assert_eq!(a.sum(1, values.len() - 1), naive);
            }
        }
    }

    #[test]
    fn wide_bit_sum_uses_whole_words() {
        let alloc = SlabAlloc::new();
        let values: Vec<i64> = (0..200).map(|i| i64::from(i % 3 == 0)).collect();
        let a = array_of(&alloc, &values);
        assert_eq!(a.width(), 1);
        assert_eq!(a.sum(0, a.size()), values.iter().sum::<i64>());
        assert_eq!(a.sum(3, 197), values[3..197].iter().sum::<i64>());
    }

    #[test]
    fn minmax_track_first_extremum() {
        let alloc = SlabAlloc::new();
        let a = array_of(&alloc, &[1, 2, 3, 2, 1, 2, 5, 2]);
        assert_eq!(a.maximum(0, NOT_FOUND), Some((5, 6)));
        assert_eq!(a.minimum(0, NOT_FOUND), Some((1, 0)));
        assert_eq!(a.maximum(0, 6), Some((3, 2)));
        assert_eq!(a.minimum(2, 4), Some((2, 3)));
        assert_eq!(a.maximum(3, 3), None);
    }

    #[test]
    fn average_divides_sum() {
        let alloc = SlabAlloc::new();
        let a = array_of(&alloc, &[2, 4, 6, 8]);
        assert_eq!(a.average(0, NOT_FOUND), Some(5.0));
        assert_eq!(a.average(2, 2), None);
    }

    #[test]
    fn bounds_obey_half_open_laws() {
        let alloc = SlabAlloc::new();
        let a = array_of(&alloc, &[3, 3, 3, 4, 4, 4, 5, 6, 7, 9, 9, 9]);

        assert_eq!(a.lower_bound_int(1), 0);
        assert_eq!(a.upper_bound_int(1), 0);
        assert_eq!(a.lower_bound_int(4), 3);
        assert_eq!(a.upper_bound_int(4), 6);
        assert_eq!(a.lower_bound_int(8), 9);
        assert_eq!(a.upper_bound_int(8), 9);
        assert_eq!(a.lower_bound_int(15), 12);
        assert_eq!(a.upper_bound_int(15), 12);

        // upper - lower counts occurrences.
        assert_eq!(a.upper_bound_int(9) - a.lower_bound_int(9), 3);
        assert_eq!(a.upper_bound_int(5) - a.lower_bound_int(5), 1);
    }

    #[test]
    fn find_gte_gallops_to_the_answer() {
        let alloc = SlabAlloc::new();
        let values: Vec<i64> = (0..500).map(|i| i * 2).collect();
        let a = array_of(&alloc, &values);

        assert_eq!(a.find_gte(0, 0, NOT_FOUND), Some(0));
        assert_eq!(a.find_gte(7, 0, NOT_FOUND), Some(4));
        assert_eq!(a.find_gte(8, 0, NOT_FOUND), Some(4));
        assert_eq!(a.find_gte(998, 0, NOT_FOUND), Some(499));
        assert_eq!(a.find_gte(999, 0, NOT_FOUND), None);
        assert_eq!(a.find_gte(7, 100, NOT_FOUND), Some(100));
        assert_eq!(a.find_gte(7, 4, NOT_FOUND), Some(4));
    }

    #[test]
    fn find_gte_indirect_follows_permutation() {
        let alloc = SlabAlloc::new();
        // Values unsorted; the indirection array supplies sorted order.
        let a = array_of(&alloc, &[40, 10, 30, 20]);
        let order = array_of(&alloc, &[1, 3, 2, 0]);

        assert_eq!(a.find_gte_indirect(10, 0, &order), Some(0));
        assert_eq!(a.find_gte_indirect(25, 0, &order), Some(2));
        assert_eq!(a.find_gte_indirect(40, 0, &order), Some(3));
        assert_eq!(a.find_gte_indirect(41, 0, &order), None);
    }
}
