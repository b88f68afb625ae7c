//! Filepath: src/query/state.rs
//!
//! Aggregate state threaded through the query kernel.
//!
//! The kernel reports results exclusively through [`QueryState`]: there
//! is no error channel. Each action kind is a zero-sized type whose
//! per-match update is monomorphized straight into the search inner
//! loop; `QueryState` carries the accumulator those updates mutate.
//!
//! A `matched` call returning `false` stops the search: either
//! ReturnFirst has its answer or `limit` has been reached. The unwind
//! propagates through every specialization back to the caller.

use crate::NOT_FOUND;

/// What a search should do with its matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    /// Stop at the first match and record its index.
    ReturnFirst,
    /// Sum the matching values.
    Sum,
    /// Track the largest matching value and its index.
    Max,
    /// Track the smallest matching value and its index.
    Min,
    /// Count matches.
    Count,
    /// Record every matching index into a sink.
    FindAll,
    /// Invoke a callback with each matching index.
    CallbackIdx,
    /// Invoke a callback with each matching value.
    CallbackVal,
    /// Invoke a callback per match without computing index or value.
    CallbackNone,
    /// Invoke a callback with both index and value.
    CallbackBoth,
    /// Sum plus match count; the caller divides.
    Average,
}

enum Sink<'a> {
    None,
    FindAll(&'a mut Vec<usize>),
    Callback(&'a mut dyn FnMut(usize, i64) -> bool),
}

/// Accumulator for one integer query.
///
/// `state` holds the running aggregate (sum, current min/max, or the
/// ReturnFirst index), `match_count`/`limit` bound the search, and
/// `minmax_index` remembers where the current extremum lives.
pub struct QueryState<'a> {
    /// Aggregate value; meaning depends on the action.
    pub state: i64,
    pub match_count: usize,
    pub limit: usize,
    /// Index of the current min/max, [`NOT_FOUND`] until a match.
    pub minmax_index: usize,
    sink: Sink<'a>,
}

impl<'a> QueryState<'a> {
    /// State for an action that needs no sink (anything but FindAll and
    /// the callback kinds).
    #[must_use]
    pub fn new(action: ActionKind, limit: usize) -> Self {
        debug_assert!(
            !matches!(
                action,
                ActionKind::FindAll
                    | ActionKind::CallbackIdx
                    | ActionKind::CallbackVal
                    | ActionKind::CallbackNone
                    | ActionKind::CallbackBoth
            ),
            "action needs a sink"
        );
        Self {
            state: Self::initial(action),
            match_count: 0,
            limit,
            minmax_index: NOT_FOUND,
            sink: Sink::None,
        }
    }

    /// State for FindAll, pushing matched indices into `out`.
    #[must_use]
    pub fn find_all(out: &'a mut Vec<usize>, limit: usize) -> Self {
        Self {
            state: 0,
            match_count: 0,
            limit,
            minmax_index: NOT_FOUND,
            sink: Sink::FindAll(out),
        }
    }

    /// State for the callback actions. The callback returns `false` to
    /// stop the search.
    #[must_use]
    pub fn with_callback(callback: &'a mut dyn FnMut(usize, i64) -> bool) -> Self {
        Self {
            state: 0,
            match_count: 0,
            limit: usize::MAX,
            minmax_index: NOT_FOUND,
            sink: Sink::Callback(callback),
        }
    }

    fn initial(action: ActionKind) -> i64 {
        match action {
            ActionKind::Max => i64::MIN,
            ActionKind::Min => i64::MAX,
            ActionKind::ReturnFirst => NOT_FOUND as i64,
            _ => 0,
        }
    }

    #[inline]
    fn push_match(&mut self, index: usize) {
        if let Sink::FindAll(out) = &mut self.sink {
            out.push(index);
        } else {
            debug_assert!(false, "FindAll without a sink");
        }
    }

    #[inline]
    fn call(&mut self, index: usize, value: i64) -> bool {
        if let Sink::Callback(f) = &mut self.sink {
            f(index, value)
        } else {
            debug_assert!(false, "callback action without a callback");
            false
        }
    }
}

/// One action of the kernel's (predicate x action x width) grid.
///
/// `matched` is invoked once per matching element; returning `false`
/// aborts the search. `matched_pattern` is offered a packed bitmap of
/// matches covering a whole 64-bit chunk; returning `true` consumes the
/// chunk, returning `false` asks for per-element calls instead.
pub trait Action {
    const KIND: ActionKind;

    fn matched(state: &mut QueryState<'_>, index: usize, value: i64) -> bool;

    #[inline(always)]
    fn matched_pattern(state: &mut QueryState<'_>, index: usize, pattern: u64) -> bool {
        let _ = (state, index, pattern);
        false
    }
}

pub struct ReturnFirst;
pub struct Sum;
pub struct Max;
pub struct Min;
pub struct Count;
pub struct FindAll;
pub struct CallbackIdx;
pub struct CallbackVal;
pub struct CallbackNone;
pub struct CallbackBoth;
pub struct Average;

impl Action for ReturnFirst {
    const KIND: ActionKind = ActionKind::ReturnFirst;

    #[inline(always)]
    fn matched(state: &mut QueryState<'_>, index: usize, _value: i64) -> bool {
        state.match_count += 1;
        state.state = index as i64;
        false
    }
}

impl Action for Sum {
    const KIND: ActionKind = ActionKind::Sum;

    #[inline(always)]
    fn matched(state: &mut QueryState<'_>, _index: usize, value: i64) -> bool {
        state.match_count += 1;
        state.state = state.state.wrapping_add(value);
        state.limit > state.match_count
    }
}

impl Action for Max {
    const KIND: ActionKind = ActionKind::Max;

    #[inline(always)]
    fn matched(state: &mut QueryState<'_>, index: usize, value: i64) -> bool {
        state.match_count += 1;
        if value > state.state || state.minmax_index == NOT_FOUND {
            state.state = value;
            state.minmax_index = index;
        }
        state.limit > state.match_count
    }
}

impl Action for Min {
    const KIND: ActionKind = ActionKind::Min;

    #[inline(always)]
    fn matched(state: &mut QueryState<'_>, index: usize, value: i64) -> bool {
        state.match_count += 1;
        if value < state.state || state.minmax_index == NOT_FOUND {
            state.state = value;
            state.minmax_index = index;
        }
        state.limit > state.match_count
    }
}

impl Action for Count {
    const KIND: ActionKind = ActionKind::Count;

    #[inline(always)]
    fn matched(state: &mut QueryState<'_>, _index: usize, _value: i64) -> bool {
        state.state += 1;
        state.match_count = state.state as usize;
        state.limit > state.match_count
    }

    #[inline(always)]
    fn matched_pattern(state: &mut QueryState<'_>, _index: usize, pattern: u64) -> bool {
        // Too close to the limit to swallow a whole chunk; fall back to
        // per-element counting.
        if state.match_count + 64 >= state.limit {
            return false;
        }
        state.state += i64::from(pattern.count_ones());
        state.match_count = state.state as usize;
        true
    }
}

impl Action for FindAll {
    const KIND: ActionKind = ActionKind::FindAll;

    #[inline(always)]
    fn matched(state: &mut QueryState<'_>, index: usize, _value: i64) -> bool {
        state.match_count += 1;
        state.push_match(index);
        state.limit > state.match_count
    }
}

impl Action for CallbackIdx {
    const KIND: ActionKind = ActionKind::CallbackIdx;

    #[inline(always)]
    fn matched(state: &mut QueryState<'_>, index: usize, _value: i64) -> bool {
        state.call(index, 0)
    }
}

impl Action for CallbackVal {
    const KIND: ActionKind = ActionKind::CallbackVal;

    #[inline(always)]
    fn matched(state: &mut QueryState<'_>, _index: usize, value: i64) -> bool {
        state.call(0, value)
    }
}

impl Action for CallbackNone {
    const KIND: ActionKind = ActionKind::CallbackNone;

    #[inline(always)]
    fn matched(state: &mut QueryState<'_>, _index: usize, _value: i64) -> bool {
        state.call(0, 0)
    }
}

impl Action for CallbackBoth {
    const KIND: ActionKind = ActionKind::CallbackBoth;

    #[inline(always)]
    fn matched(state: &mut QueryState<'_>, index: usize, value: i64) -> bool {
        state.call(index, value)
    }
}

impl Action for Average {
    const KIND: ActionKind = ActionKind::Average;

    #[inline(always)]
    fn matched(state: &mut QueryState<'_>, _index: usize, value: i64) -> bool {
        state.match_count += 1;
        state.state = state.state.wrapping_add(value);
        state.limit > state.match_count
    }
}

/// Report one match to the action. Returns `false` to stop the search.
#[inline(always)]
pub(crate) fn find_action<A: Action>(
    index: usize,
    value: i64,
    state: &mut QueryState<'_>,
) -> bool {
    A::matched(state, index, value)
}

/// Offer the action a packed chunk of matches. Returns `true` if the
/// chunk was consumed.
#[inline(always)]
pub(crate) fn find_action_pattern<A: Action>(
    index: usize,
    pattern: u64,
    state: &mut QueryState<'_>,
) -> bool {
    A::matched_pattern(state, index, pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_first_stops_immediately() {
        let mut state = QueryState::new(ActionKind::ReturnFirst, 1);
        assert!(!ReturnFirst::matched(&mut state, 17, 99));
        assert_eq!(state.state, 17);
        assert_eq!(state.match_count, 1);
    }

    #[test]
    fn count_pattern_consumes_whole_chunks() {
        let mut state = QueryState::new(ActionKind::Count, usize::MAX);
        assert!(Count::matched_pattern(&mut state, 0, 0b1011));
        assert_eq!(state.state, 3);
        assert_eq!(state.match_count, 3);
    }

    #[test]
    fn count_pattern_defers_near_limit() {
        let mut state = QueryState::new(ActionKind::Count, 10);
        assert!(!Count::matched_pattern(&mut state, 0, u64::MAX));
        assert_eq!(state.state, 0);
    }

    #[test]
    fn min_max_track_indices() {
        let mut state = QueryState::new(ActionKind::Max, usize::MAX);
        assert!(Max::matched(&mut state, 0, 5));
        assert!(Max::matched(&mut state, 1, 3));
        assert!(Max::matched(&mut state, 2, 9));
        assert_eq!(state.state, 9);
        assert_eq!(state.minmax_index, 2);

        let mut state = QueryState::new(ActionKind::Min, usize::MAX);
        assert!(Min::matched(&mut state, 4, 5));
        assert!(Min::matched(&mut state, 5, -2));
        assert!(Min::matched(&mut state, 6, 0));
        assert_eq!(state.state, -2);
        assert_eq!(state.minmax_index, 5);
    }

    #[test]
    fn max_records_extreme_initial_value() {
        let mut state = QueryState::new(ActionKind::Max, usize::MAX);
        assert!(Max::matched(&mut state, 3, i64::MIN));
        assert_eq!(state.state, i64::MIN);
        assert_eq!(state.minmax_index, 3);
    }

    #[test]
    fn limit_stops_the_search() {
        let mut out = Vec::new();
        let mut state = QueryState::find_all(&mut out, 2);
        assert!(FindAll::matched(&mut state, 0, 0));
        assert!(!FindAll::matched(&mut state, 1, 0));
        assert_eq!(out, vec![0, 1]);
    }

    #[test]
    fn callback_return_value_controls_search() {
        let mut seen = Vec::new();
        let mut cb = |idx: usize, _v: i64| {
            seen.push(idx);
            seen.len() < 2
        };
        let mut state = QueryState::with_callback(&mut cb);
        assert!(CallbackIdx::matched(&mut state, 10, 0));
        assert!(!CallbackIdx::matched(&mut state, 11, 0));
        assert_eq!(seen, vec![10, 11]);
    }
}
