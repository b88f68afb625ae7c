//! Property-based tests for the query kernel.
//!
//! The single property that matters: for every predicate, action,
//! width, range and base index, the kernel's answer equals a naive
//! O(n) scan. Word-parallel tricks, SSE lanes and alignment handling
//! must all be invisible.

use packarray::{
    ActionKind, Array, Condition, NodeType, QueryState, SlabAlloc, NOT_FOUND,
};
use proptest::prelude::*;

const ALL_CONDITIONS: [Condition; 6] = [
    Condition::Equal,
    Condition::NotEqual,
    Condition::Greater,
    Condition::Less,
    Condition::GreaterEqual,
    Condition::LessEqual,
];

fn holds(cond: Condition, v: i64, target: i64) -> bool {
    match cond {
        Condition::Equal => v == target,
        Condition::NotEqual => v != target,
        Condition::Greater => v > target,
        Condition::Less => v < target,
        Condition::GreaterEqual => v >= target,
        Condition::LessEqual => v <= target,
    }
}

// ============================================================================
//  Strategies
// ============================================================================

/// Per-run payload class, so every packing width gets exercised.
fn payload_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop_oneof![
        prop::collection::vec(Just(0i64), 0..140),
        prop::collection::vec(0i64..2, 0..140),
        prop::collection::vec(0i64..4, 0..140),
        prop::collection::vec(0i64..16, 0..140),
        prop::collection::vec(-128i64..128, 0..140),
        prop::collection::vec(-32_768i64..32_768, 0..140),
        prop::collection::vec(any::<i32>().prop_map(i64::from), 0..140),
        prop::collection::vec(any::<i64>(), 0..140),
    ]
}

/// Target values likely to hit payload ranges, plus arbitrary ones.
fn target_strategy() -> impl Strategy<Value = i64> {
    prop_oneof![
        4 => -5i64..20,
        2 => -200i64..200,
        1 => any::<i64>(),
    ]
}

fn build<'a>(alloc: &'a SlabAlloc, values: &[i64]) -> Array<'a, SlabAlloc> {
    let mut arr = Array::new(alloc);
    arr.create(NodeType::Normal).unwrap();
    for &v in values {
        arr.add(v).unwrap();
    }
    arr
}

// ============================================================================
//  Kernel vs naive scan
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(192))]

    /// FindAll equals the naive match set; Count equals its size;
    /// ReturnFirst equals its head. All predicates, full range.
    #[test]
    fn find_matches_naive_scan(values in payload_strategy(), target in target_strategy()) {
        let alloc = SlabAlloc::new();
        let arr = build(&alloc, &values);

        for cond in ALL_CONDITIONS {
            let naive: Vec<usize> = values
                .iter()
                .enumerate()
                .filter(|(_, &v)| holds(cond, v, target))
                .map(|(i, _)| i)
                .collect();

            let mut found = Vec::new();
            let mut state = QueryState::find_all(&mut found, usize::MAX);
            arr.find(cond, ActionKind::FindAll, target, 0, values.len(), 0, &mut state);
            prop_assert_eq!(&found, &naive, "FindAll {:?} target {}", cond, target);

            let mut state = QueryState::new(ActionKind::Count, usize::MAX);
            arr.find(cond, ActionKind::Count, target, 0, values.len(), 0, &mut state);
            prop_assert_eq!(state.state as usize, naive.len(), "Count {:?}", cond);

            let mut state = QueryState::new(ActionKind::ReturnFirst, 1);
            arr.find(cond, ActionKind::ReturnFirst, target, 0, values.len(), 0, &mut state);
            let first = state.state as usize;
            match naive.first() {
                Some(&i) => prop_assert_eq!(first, i, "ReturnFirst {:?}", cond),
                None => prop_assert_eq!(first, NOT_FOUND, "ReturnFirst {:?}", cond),
            }
        }
    }

    /// Sum/Max/Min aggregate exactly the naive match set.
    #[test]
    fn aggregates_match_naive_scan(values in payload_strategy(), target in target_strategy()) {
        let alloc = SlabAlloc::new();
        let arr = build(&alloc, &values);

        for cond in ALL_CONDITIONS {
            let matched: Vec<(usize, i64)> = values
                .iter()
                .enumerate()
                .filter(|(_, &v)| holds(cond, v, target))
                .map(|(i, &v)| (i, v))
                .collect();

            let mut state = QueryState::new(ActionKind::Sum, usize::MAX);
            arr.find(cond, ActionKind::Sum, target, 0, values.len(), 0, &mut state);
            let naive_sum = matched
                .iter()
                .fold(0i64, |acc, &(_, v)| acc.wrapping_add(v));
            prop_assert_eq!(state.state, naive_sum, "Sum {:?} target {}", cond, target);
            prop_assert_eq!(state.match_count, matched.len());

            let mut state = QueryState::new(ActionKind::Max, usize::MAX);
            arr.find(cond, ActionKind::Max, target, 0, values.len(), 0, &mut state);
            if let Some(&(_, naive_max)) = matched.iter().max_by_key(|&&(_, v)| v) {
                prop_assert_eq!(state.state, naive_max, "Max {:?}", cond);
            } else {
                prop_assert_eq!(state.match_count, 0);
            }

            let mut state = QueryState::new(ActionKind::Min, usize::MAX);
            arr.find(cond, ActionKind::Min, target, 0, values.len(), 0, &mut state);
            if let Some(&(_, naive_min)) = matched.iter().min_by_key(|&&(_, v)| v) {
                prop_assert_eq!(state.state, naive_min, "Min {:?}", cond);
            } else {
                prop_assert_eq!(state.match_count, 0);
            }
        }
    }

    /// Sub-ranges and base indices shift reported rows, nothing else.
    #[test]
    fn ranges_and_baseindex(
        values in payload_strategy(),
        target in target_strategy(),
        bounds in (any::<usize>(), any::<usize>()),
        baseindex in 0usize..10_000,
    ) {
        let alloc = SlabAlloc::new();
        let arr = build(&alloc, &values);

        let n = values.len();
        let (a, b) = bounds;
        let (start, end) = if n == 0 {
            (0, 0)
        } else {
            let a = a % (n + 1);
            let b = b % (n + 1);
            (a.min(b), a.max(b))
        };

        for cond in ALL_CONDITIONS {
            let naive: Vec<usize> = (start..end)
                .filter(|&i| holds(cond, values[i], target))
                .map(|i| i + baseindex)
                .collect();

            let mut found = Vec::new();
            let mut state = QueryState::find_all(&mut found, usize::MAX);
            arr.find(cond, ActionKind::FindAll, target, start, end, baseindex, &mut state);
            prop_assert_eq!(&found, &naive, "{:?} [{}, {}) base {}", cond, start, end, baseindex);
        }
    }

    /// A limit stops the search after exactly `limit` matches.
    #[test]
    fn limit_clips_matches(
        values in prop::collection::vec(0i64..4, 0..140),
        target in 0i64..4,
        limit in 1usize..20,
    ) {
        let alloc = SlabAlloc::new();
        let arr = build(&alloc, &values);

        let naive: Vec<usize> = values
            .iter()
            .enumerate()
            .filter(|(_, &v)| v == target)
            .map(|(i, _)| i)
            .collect();
        let expect: Vec<usize> = naive.iter().copied().take(limit).collect();

        let mut found = Vec::new();
        let mut state = QueryState::find_all(&mut found, limit);
        arr.find(Condition::Equal, ActionKind::FindAll, target, 0, values.len(), 0, &mut state);
        prop_assert_eq!(&found, &expect);

        let mut state = QueryState::new(ActionKind::Count, limit);
        arr.find(Condition::Equal, ActionKind::Count, target, 0, values.len(), 0, &mut state);
        prop_assert_eq!(state.state as usize, naive.len().min(limit));
    }

    /// find_first agrees with the naive first match from any offset.
    #[test]
    fn find_first_from_offsets(
        values in payload_strategy(),
        target in target_strategy(),
        start in 0usize..32,
    ) {
        let alloc = SlabAlloc::new();
        let arr = build(&alloc, &values);
        let start = if values.is_empty() { 0 } else { start % values.len() };

        let naive = (start..values.len()).find(|&i| values[i] == target);
        prop_assert_eq!(arr.find_first(target, start, values.len()), naive);
    }

    /// Callback actions see every match and can stop the search.
    #[test]
    fn callbacks_receive_matches(values in payload_strategy(), target in target_strategy()) {
        let alloc = SlabAlloc::new();
        let arr = build(&alloc, &values);

        let naive: Vec<(usize, i64)> = values
            .iter()
            .enumerate()
            .filter(|(_, &v)| v > target)
            .map(|(i, &v)| (i, v))
            .collect();

        let mut seen = Vec::new();
        let mut cb = |idx: usize, v: i64| {
            seen.push((idx, v));
            true
        };
        let mut state = QueryState::with_callback(&mut cb);
        arr.find(Condition::Greater, ActionKind::CallbackBoth, target, 0, values.len(), 0, &mut state);
        prop_assert_eq!(&seen, &naive);

        // Early stop after the first match.
        let mut count = 0usize;
        let mut cb = |_idx: usize, _v: i64| {
            count += 1;
            false
        };
        let mut state = QueryState::with_callback(&mut cb);
        arr.find(Condition::Greater, ActionKind::CallbackIdx, target, 0, values.len(), 0, &mut state);
        prop_assert_eq!(count, usize::from(!naive.is_empty()));
    }

    /// Cross-leaf comparison equals the naive position-wise scan, for
    /// leaves of independently adapted widths.
    #[test]
    fn compare_leafs_matches_naive(
        own in payload_strategy(),
        foreign in payload_strategy(),
    ) {
        let n = own.len().min(foreign.len());
        let alloc = SlabAlloc::new();
        let a = build(&alloc, &own[..n]);
        let b = build(&alloc, &foreign[..n]);

        let naive: Vec<usize> = (0..n).filter(|&i| own[i] > foreign[i]).collect();

        let mut found = Vec::new();
        let mut state = QueryState::find_all(&mut found, usize::MAX);
        a.compare_leafs::<packarray::Greater, packarray::FindAll>(&b, 0, n, 0, &mut state);
        prop_assert_eq!(&found, &naive);
    }
}

// ============================================================================
//  Sorted-sequence search laws
// ============================================================================

proptest! {
    #[test]
    fn bound_laws_on_sorted_input(
        mut values in prop::collection::vec(-500i64..500, 0..120),
        probe in -600i64..600,
    ) {
        values.sort_unstable();
        let alloc = SlabAlloc::new();
        let arr = build(&alloc, &values);

        let lower = arr.lower_bound_int(probe);
        let upper = arr.upper_bound_int(probe);

        let naive_lower = values.partition_point(|&v| v < probe);
        let naive_upper = values.partition_point(|&v| v <= probe);
        prop_assert_eq!(lower, naive_lower);
        prop_assert_eq!(upper, naive_upper);

        let occurrences = values.iter().filter(|&&v| v == probe).count();
        prop_assert_eq!(upper - lower, occurrences);

        // find_gte is lower_bound with a start offset.
        let gte = arr.find_gte(probe, 0, NOT_FOUND);
        prop_assert_eq!(gte, if naive_lower < values.len() { Some(naive_lower) } else { None });
    }
}
