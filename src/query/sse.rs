//! Filepath: src/query/sse.rs
//!
//! SSE fast path for the query kernel (x86-64 only).
//!
//! Runs the four core predicates over 128-bit lanes at 8/16/32/64-bit
//! granularity. The scalar word-parallel path produces bit-identical
//! results; this is purely a throughput optimization, gated at run time
//! on SSE4.2 (`cmpeq_epi64`/`cmpgt_epi64` need it, and one check keeps
//! the dispatch simple).
//!
//! The region handed to the vector loop is 16-byte aligned on both
//! sides; the unaligned head and tail go through the scalar comparators.
//! `Less` at width 64 has no lane comparison and never reaches here.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use std::arch::x86_64::{
    __m128i, _mm_cmpeq_epi16, _mm_cmpeq_epi32, _mm_cmpeq_epi64, _mm_cmpeq_epi8, _mm_cmpgt_epi16,
    _mm_cmpgt_epi32, _mm_cmpgt_epi64, _mm_cmpgt_epi8, _mm_cmplt_epi16, _mm_cmplt_epi32,
    _mm_cmplt_epi8, _mm_load_si128, _mm_movemask_epi8, _mm_set1_epi16, _mm_set1_epi32,
    _mm_set1_epi64x, _mm_set1_epi8,
};

use crate::direct::get;
use crate::header::no0;
use crate::query::bithack::{compare, lower_bits};
use crate::query::state::{find_action, find_action_pattern, Action, QueryState};
use crate::query::{Cond, Condition, NodeView};

/// One-time runtime gate for the vector path.
#[inline]
pub(crate) fn sse42_available() -> bool {
    is_x86_feature_detected!("sse4.2")
}

/// Split `[start, end)` into an unaligned head, 16-byte-aligned lanes
/// and an unaligned tail, searching each part.
pub(crate) fn find_sse_region<C: Cond, A: Action, const W: usize>(
    view: &NodeView<'_>,
    value: i64,
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> bool {
    debug_assert!(W >= 8 && end - start >= 16);

    let base = view.data as usize;
    let start_byte = base + start * W / 8;
    let end_byte = base + end * W / 8;
    let a_byte = (start_byte + 15) & !15usize; // first aligned lane
    let b_byte = end_byte & !15usize; // one past the last aligned lane

    let a_elem = (a_byte - base) * 8 / no0(W);
    let b_elem = (b_byte - base) * 8 / no0(W);

    if !compare::<C, A, W>(view, value, start, a_elem, baseindex, state) {
        return false;
    }

    if b_byte > a_byte {
        let items = (b_byte - a_byte) / 16;
        let region = unsafe { view.data.add(a_byte - base) };
        let cont = unsafe {
            find_sse::<C, A, W>(value, region, items, baseindex + a_elem, state)
        };
        if !cont {
            return false;
        }
    }

    compare::<C, A, W>(view, value, b_elem, end, baseindex, state)
}

/// Vector loop over `items` 16-byte lanes starting at `region` (which
/// must be 16-byte aligned).
///
/// # Safety
/// SSE4.2 must be available and `region` must cover `items` lanes of
/// valid payload.
#[target_feature(enable = "sse4.2")]
unsafe fn find_sse<C: Cond, A: Action, const W: usize>(
    value: i64,
    region: *const u8,
    items: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> bool {
    let search: __m128i = match W {
        8 => _mm_set1_epi8(value as i8),
        16 => _mm_set1_epi16(value as i16),
        32 => _mm_set1_epi32(value as i32),
        _ => _mm_set1_epi64x(value),
    };

    // Unrolling this loop has been seen not to help; it is memory bound.
    for i in 0..items {
        let chunk = _mm_load_si128(region.add(i * 16).cast::<__m128i>());

        let cmp = match C::KIND {
            Condition::Equal | Condition::NotEqual => match W {
                8 => _mm_cmpeq_epi8(chunk, search),
                16 => _mm_cmpeq_epi16(chunk, search),
                32 => _mm_cmpeq_epi32(chunk, search),
                _ => _mm_cmpeq_epi64(chunk, search),
            },
            Condition::Greater => match W {
                8 => _mm_cmpgt_epi8(chunk, search),
                16 => _mm_cmpgt_epi16(chunk, search),
                32 => _mm_cmpgt_epi32(chunk, search),
                _ => _mm_cmpgt_epi64(chunk, search),
            },
            Condition::Less => match W {
                8 => _mm_cmplt_epi8(chunk, search),
                16 => _mm_cmplt_epi16(chunk, search),
                32 => _mm_cmplt_epi32(chunk, search),
                _ => unreachable!("no 64-bit SSE less-than"),
            },
            Condition::GreaterEqual | Condition::LessEqual => {
                unreachable!("no SSE path for >=/<=")
            }
        };

        let mut resmask = _mm_movemask_epi8(cmp) as u32;
        if C::KIND == Condition::NotEqual {
            resmask = !resmask & 0xFFFF;
        }

        let bytes_per_elem = no0(W / 8);
        let mut s = i * 16 * 8 / no0(W);

        while resmask != 0 {
            // One bit per matching element: keep only the top bit of
            // each element's byte group. Offsets are wrong for anything
            // but counting, and Count is the only consumer.
            let upper = lower_bits(W / 8) << (bytes_per_elem - 1);
            let pattern = u64::from(resmask) & upper;
            if find_action_pattern::<A>(s + baseindex, pattern, state) {
                break;
            }

            let idx = resmask.trailing_zeros() as usize * 8 / no0(W);
            s += idx;
            let v = get::<W>(region, s);
            if !find_action::<A>(s + baseindex, v, state) {
                return false;
            }
            resmask >>= (idx + 1) * bytes_per_elem;
            s += 1;
        }
    }

    true
}
