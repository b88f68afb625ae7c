//! Filepath: src/query/mod.rs
//!
//! The query kernel: `find` over (predicate x action x width).
//!
//! ```text
//! find() -> find_optimized() --+--> find_action() ---------> state/callback
//!                              |
//!                              +--> find_action_pattern() -> state
//! ```
//!
//! Each predicate is a zero-sized [`Cond`] type, each action a
//! zero-sized [`Action`](state::Action) type, and the element width a
//! const generic; every combination monomorphizes into a specialized
//! routine whose inner loop performs no per-element indirect calls. The
//! accessor caches a per-width table of the ReturnFirst specializations
//! for its `find_first` hot path.
//!
//! [`find_optimized`] is the single driver: it handles a short scalar
//! prefix, prunes with `can_match`/`will_match`, then drops into the
//! word-parallel scans of [`bithack`] or, for byte-wide and wider
//! elements on x86-64, the 128-bit lanes of [`sse`].

pub(crate) mod bithack;
pub(crate) mod leafcmp;
#[cfg(target_arch = "x86_64")]
pub(crate) mod sse;
pub(crate) mod state;

pub use state::{
    Action, ActionKind, Average, CallbackBoth, CallbackIdx, CallbackNone, CallbackVal, Count,
    FindAll, Max, Min, QueryState, ReturnFirst, Sum,
};

use crate::array::aggregate::{minmax_view, sum_view};
use crate::direct::get;
use crate::query::state::find_action;
use crate::NOT_FOUND;
use std::marker::PhantomData;

/// Search predicates, in vtable order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Condition {
    Equal,
    NotEqual,
    Greater,
    Less,
    GreaterEqual,
    LessEqual,
}

/// One predicate of the kernel grid.
///
/// `can_match` prunes a node whose `[lbound, ubound]` range cannot
/// contain a match; `will_match` detects that every element matches, so
/// the kernel can run a bulk aggregate instead of scanning.
pub trait Cond {
    const KIND: Condition;

    fn cmp(v: i64, target: i64) -> bool;
    fn can_match(target: i64, lbound: i64, ubound: i64) -> bool;
    fn will_match(target: i64, lbound: i64, ubound: i64) -> bool;
}

pub struct Equal;
pub struct NotEqual;
pub struct Greater;
pub struct Less;
pub struct GreaterEqual;
pub struct LessEqual;

impl Cond for Equal {
    const KIND: Condition = Condition::Equal;

    #[inline(always)]
    fn cmp(v: i64, target: i64) -> bool {
        v == target
    }

    #[inline(always)]
    fn can_match(target: i64, lbound: i64, ubound: i64) -> bool {
        target >= lbound && target <= ubound
    }

    #[inline(always)]
    fn will_match(target: i64, lbound: i64, ubound: i64) -> bool {
        target == lbound && target == ubound
    }
}

impl Cond for NotEqual {
    const KIND: Condition = Condition::NotEqual;

    #[inline(always)]
    fn cmp(v: i64, target: i64) -> bool {
        v != target
    }

    #[inline(always)]
    fn can_match(target: i64, lbound: i64, ubound: i64) -> bool {
        !(target == lbound && target == ubound)
    }

    #[inline(always)]
    fn will_match(target: i64, lbound: i64, ubound: i64) -> bool {
        target < lbound || target > ubound
    }
}

impl Cond for Greater {
    const KIND: Condition = Condition::Greater;

    #[inline(always)]
    fn cmp(v: i64, target: i64) -> bool {
        v > target
    }

    #[inline(always)]
    fn can_match(target: i64, _lbound: i64, ubound: i64) -> bool {
        target < ubound
    }

    #[inline(always)]
    fn will_match(target: i64, lbound: i64, _ubound: i64) -> bool {
        target < lbound
    }
}

impl Cond for Less {
    const KIND: Condition = Condition::Less;

    #[inline(always)]
    fn cmp(v: i64, target: i64) -> bool {
        v < target
    }

    #[inline(always)]
    fn can_match(target: i64, lbound: i64, _ubound: i64) -> bool {
        target > lbound
    }

    #[inline(always)]
    fn will_match(target: i64, _lbound: i64, ubound: i64) -> bool {
        target > ubound
    }
}

impl Cond for GreaterEqual {
    const KIND: Condition = Condition::GreaterEqual;

    #[inline(always)]
    fn cmp(v: i64, target: i64) -> bool {
        v >= target
    }

    #[inline(always)]
    fn can_match(target: i64, _lbound: i64, ubound: i64) -> bool {
        target <= ubound
    }

    #[inline(always)]
    fn will_match(target: i64, lbound: i64, _ubound: i64) -> bool {
        target <= lbound
    }
}

impl Cond for LessEqual {
    const KIND: Condition = Condition::LessEqual;

    #[inline(always)]
    fn cmp(v: i64, target: i64) -> bool {
        v <= target
    }

    #[inline(always)]
    fn can_match(target: i64, lbound: i64, _ubound: i64) -> bool {
        target >= lbound
    }

    #[inline(always)]
    fn will_match(target: i64, _lbound: i64, ubound: i64) -> bool {
        target >= ubound
    }
}

/// Raw view of one attached node's payload, all the kernel ever needs.
pub(crate) struct NodeView<'a> {
    pub data: *const u8,
    pub size: usize,
    pub width: u8,
    pub lbound: i64,
    pub ubound: i64,
    pub(crate) _marker: PhantomData<&'a [u8]>,
}

impl NodeView<'_> {
    pub(crate) fn new(data: *const u8, size: usize, width: u8, lbound: i64, ubound: i64) -> Self {
        Self {
            data,
            size,
            width,
            lbound,
            ubound,
            _marker: PhantomData,
        }
    }
}

/// ReturnFirst specialization installed into the per-width vtables.
pub(crate) fn finder<C: Cond, const W: usize>(
    view: &NodeView<'_>,
    value: i64,
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> bool {
    find_optimized::<C, ReturnFirst, W>(view, value, start, end, baseindex, state)
}

/// The main finding routine; everything else wraps it.
///
/// Searches `[start, end)` for elements matching `value` under `C`,
/// reporting each match (plus `baseindex`) to the action. Returns
/// `false` as soon as the state asks to stop, `true` when the caller
/// should continue on the next leaf.
pub(crate) fn find_optimized<C: Cond, A: Action, const W: usize>(
    view: &NodeView<'_>,
    value: i64,
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> bool {
    debug_assert!(usize::from(view.width) == W);
    debug_assert!(
        start <= view.size && (end <= view.size || end == NOT_FOUND) && start <= end
    );

    let end = if end == NOT_FOUND { view.size } else { end };
    let mut start2 = start;

    // Test the first few items one by one so short scans from an offset
    // skip the vector setup entirely.
    if start2 > 0 {
        for _ in 0..4 {
            if view.size > start2 && start2 < end {
                let v = unsafe { get::<W>(view.data, start2) };
                if C::cmp(v, value) && !find_action::<A>(start2 + baseindex, v, state) {
                    return false;
                }
            }
            start2 += 1;
        }
    }

    if !(view.size > start2 && start2 < end) {
        return true;
    }

    // No element in this node can match: skip it wholesale.
    if !C::can_match(value, view.lbound, view.ubound) {
        return true;
    }

    // Every element matches: run the bulk form of the action.
    if C::will_match(value, view.lbound, view.ubound) {
        let end2 = match A::KIND {
            ActionKind::CallbackIdx
            | ActionKind::CallbackVal
            | ActionKind::CallbackNone
            | ActionKind::CallbackBoth => end,
            _ => {
                debug_assert!(state.match_count < state.limit);
                let process = state.limit - state.match_count;
                if end - start2 > process {
                    start2 + process
                } else {
                    end
                }
            }
        };

        match A::KIND {
            ActionKind::Sum | ActionKind::Average => {
                let res = sum_view::<W>(view, start2, end2);
                find_action::<A>(baseindex, res, state);
                state.match_count += end2 - start2 - 1;
            }
            ActionKind::Max | ActionKind::Min => {
                let max = A::KIND == ActionKind::Max;
                if let Some((res, res_ndx)) = minmax_view::<W>(view, max, start2, end2) {
                    find_action::<A>(res_ndx + baseindex, res, state);
                    state.match_count += end2 - start2 - 1;
                }
            }
            ActionKind::Count => {
                state.state += (end2 - start2) as i64;
                state.match_count = state.state as usize;
            }
            _ => {
                while start2 < end2 {
                    let v = unsafe { get::<W>(view.data, start2) };
                    if !find_action::<A>(start2 + baseindex, v, state) {
                        return false;
                    }
                    start2 += 1;
                }
            }
        }
        return true;
    }

    // Width 0 always resolves above: its bounds are [0, 0], so every
    // predicate either cannot match or matches everything.
    debug_assert!(W != 0);

    #[cfg(target_arch = "x86_64")]
    {
        // SSE wants at least one full 128-bit lane of byte-wide or wider
        // elements; Less has no 64-bit lane comparison.
        let sse_cond = matches!(
            C::KIND,
            Condition::Equal | Condition::NotEqual | Condition::Greater | Condition::Less
        ) && !(C::KIND == Condition::Less && W == 64);

        if sse_cond && W >= 8 && end - start2 >= 16 && sse::sse42_available() {
            return sse::find_sse_region::<C, A, W>(view, value, start2, end, baseindex, state);
        }
    }

    bithack::compare::<C, A, W>(view, value, start2, end, baseindex, state)
}

/// Width-dispatching entry used by the accessor's typed `find`.
pub(crate) fn find_dispatch<C: Cond, A: Action>(
    view: &NodeView<'_>,
    value: i64,
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> bool {
    crate::direct::with_width!(
        usize::from(view.width),
        find_optimized::<C, A>(view, value, start, end, baseindex, state)
    )
}
