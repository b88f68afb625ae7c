//! Filepath: src/query/leafcmp.rs
//!
//! Position-wise comparison of two leaves.
//!
//! Realizes column-vs-column predicates: for every position in
//! `[start, end)`, report a match when `C::cmp(own[i], foreign[i])`
//! holds. The specialization grid gains a second width axis, since the
//! two leaves adapt their widths independently; both dispatches happen
//! once per call, outside the loop.

use crate::direct::{get, with_width};
use crate::query::state::{find_action, Action, QueryState};
use crate::query::{Cond, NodeView};

/// Compare two leaves position by position, reporting matches from the
/// own leaf's side.
pub(crate) fn compare_leafs<C: Cond, A: Action>(
    view: &NodeView<'_>,
    foreign: &NodeView<'_>,
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> bool {
    debug_assert!(start <= end && end <= view.size && end <= foreign.size);
    with_width!(
        usize::from(view.width),
        compare_leafs_w::<C, A>(view, foreign, start, end, baseindex, state)
    )
}

fn compare_leafs_w<C: Cond, A: Action, const W: usize>(
    view: &NodeView<'_>,
    foreign: &NodeView<'_>,
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> bool {
    with_width!(
        usize::from(foreign.width),
        compare_leafs_ww::<C, A, W>(view, foreign, start, end, baseindex, state)
    )
}

fn compare_leafs_ww<C: Cond, A: Action, const W: usize, const FW: usize>(
    view: &NodeView<'_>,
    foreign: &NodeView<'_>,
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> bool {
    if W == 0 && FW == 0 {
        // Both sides read all zeros; the answer is uniform.
        if !C::cmp(0, 0) {
            return true;
        }
        let mut i = start;
        while i < end {
            if !find_action::<A>(i + baseindex, 0, state) {
                return false;
            }
            i += 1;
        }
        return true;
    }

    let mut i = start;
    while i < end {
        let v = unsafe { get::<W>(view.data, i) };
        let fv = unsafe { get::<FW>(foreign.data, i) };
        if C::cmp(v, fv) && !find_action::<A>(i + baseindex, v, state) {
            return false;
        }
        i += 1;
    }

    true
}
