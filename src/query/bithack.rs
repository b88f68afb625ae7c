//! Filepath: src/query/bithack.rs
//!
//! Word-parallel search primitives.
//!
//! A 64-bit chunk holds `64 / w` packed elements. Equality tests XOR the
//! chunk against the target replicated into every field and then detect
//! zero fields with the classic has-zero-byte trick; ordered comparisons
//! use the has-less-in-word trick with a precomputed magic constant.
//! Both come from the bit-twiddling canon (Stanford bithacks) and both
//! degrade gracefully: whenever a chunk violates a trick's precondition
//! (a field with its sign bit set, a target out of range) the chunk is
//! re-scanned element-wise.
//!
//! Everything here is monomorphized over the element width; the `no0`
//! guards keep the dead width-0 instantiations free of divide-by-zero.

use crate::direct::{get, sign_extend};
use crate::header::no0;
use crate::query::state::{find_action, find_action_pattern, Action, QueryState};
use crate::query::{Cond, Condition, NodeView};

/// Chunk with the low bit of every field set, for the given width.
#[inline(always)]
pub(crate) const fn lower_bits(width: usize) -> u64 {
    match width {
        1 => 0xFFFF_FFFF_FFFF_FFFF,
        2 => 0x5555_5555_5555_5555,
        4 => 0x1111_1111_1111_1111,
        8 => 0x0101_0101_0101_0101,
        16 => 0x0001_0001_0001_0001,
        32 => 0x0000_0001_0000_0001,
        64 => 0x0000_0000_0000_0001,
        _ => 0,
    }
}

/// All-ones mask covering one field of `width` bits.
#[inline(always)]
pub(crate) const fn field_mask(width: usize) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

#[inline(always)]
const fn no0u(v: u64) -> u64 {
    if v == 0 {
        1
    } else {
        v
    }
}

/// Whether any field in `value` is zero.
#[inline(always)]
pub(crate) fn test_zero<const W: usize>(value: u64) -> bool {
    let lower = lower_bits(W);
    let upper = lower << (no0(W) - 1);
    value.wrapping_sub(lower) & !value & upper != 0
}

/// Set the low bit of every zero (`ZERO = true`) or non-zero
/// (`ZERO = false`) field of `a`, clearing everything else.
pub(crate) fn cascade<const W: usize, const ZERO: bool>(a: u64) -> u64 {
    // Example for W = 4, ZERO = true: 0x5fd07a107610f610 -> 0x0001000100010001.
    let mut a = a;
    match W {
        1 => {
            if ZERO {
                !a
            } else {
                a
            }
        }
        2 => {
            let m = lower_bits(2);
            let c1 = !0u64 / 0x3 * 0x1;

            a |= (a >> 1) & c1; // cascade ones in non-zeroed fields
            a &= m; // isolate the low bit of each field
            if ZERO {
                a ^= m; // flip to mark the zeroed fields instead
            }
            a
        }
        4 => {
            let m = !0u64 / 0xF;
            let c1 = !0u64 / 0xF * 0x7;
            let c2 = !0u64 / 0xF * 0x3;

            a |= (a >> 1) & c1;
            a |= (a >> 2) & c2;
            a &= m;
            if ZERO {
                a ^= m;
            }
            a
        }
        8 => {
            let m = !0u64 / 0xFF;
            let c1 = !0u64 / 0xFF * 0x7F;
            let c2 = !0u64 / 0xFF * 0x3F;
            let c3 = !0u64 / 0xFF * 0x0F;

            a |= (a >> 1) & c1;
            a |= (a >> 2) & c2;
            a |= (a >> 4) & c3;
            a &= m;
            if ZERO {
                a ^= m;
            }
            a
        }
        16 => {
            let m = !0u64 / 0xFFFF;
            let c1 = !0u64 / 0xFFFF * 0x7FFF;
            let c2 = !0u64 / 0xFFFF * 0x3FFF;
            let c3 = !0u64 / 0xFFFF * 0x0FFF;
            let c4 = !0u64 / 0xFFFF * 0x00FF;

            a |= (a >> 1) & c1;
            a |= (a >> 2) & c2;
            a |= (a >> 4) & c3;
            a |= (a >> 8) & c4;
            a &= m;
            if ZERO {
                a ^= m;
            }
            a
        }
        32 => {
            let m = !0u64 / 0xFFFF_FFFF;
            let c1 = !0u64 / 0xFFFF_FFFF * 0x7FFF_FFFF;
            let c2 = !0u64 / 0xFFFF_FFFF * 0x3FFF_FFFF;
            let c3 = !0u64 / 0xFFFF_FFFF * 0x0FFF_FFFF;
            let c4 = !0u64 / 0xFFFF_FFFF * 0x00FF_FFFF;
            let c5 = !0u64 / 0xFFFF_FFFF * 0x0000_FFFF;

            a |= (a >> 1) & c1;
            a |= (a >> 2) & c2;
            a |= (a >> 4) & c3;
            a |= (a >> 8) & c4;
            a |= (a >> 16) & c5;
            a &= m;
            if ZERO {
                a ^= m;
            }
            a
        }
        _ => u64::from((a == 0) == ZERO),
    }
}

/// Position of the first zero (`EQ = true`) or non-zero (`EQ = false`)
/// field of `v`. At least one such field must exist (test with
/// [`test_zero`] or a plain zero check first).
pub(crate) fn find_zero<const EQ: bool, const W: usize>(v: u64) -> usize {
    let mask = field_mask(W);
    let mut start = 0usize;

    if EQ == ((v & mask) == 0) {
        return 0;
    }

    // Bisect before the linear scan: pays off for narrow fields with
    // high match frequency. Two probes maximum; more partitions have
    // been seen not to pay for themselves.
    if W <= 8 {
        let low_half_empty = if EQ {
            !test_zero::<W>(v | 0xFFFF_FFFF_0000_0000)
        } else {
            v & 0x0000_0000_FFFF_FFFF == 0
        };
        if low_half_empty {
            // Nothing in the low half; start in the high one.
            start += 64 / no0(W) / 2;
            if W <= 4 {
                let third_quarter_empty = if EQ {
                    !test_zero::<W>(v | 0xFFFF_0000_0000_0000)
                } else {
                    v & 0x0000_FFFF_FFFF_FFFF == 0
                };
                if third_quarter_empty {
                    start += 64 / no0(W) / 4;
                }
            }
        } else if W <= 4 {
            let first_quarter_empty = if EQ {
                !test_zero::<W>(v | 0xFFFF_FFFF_FFFF_0000)
            } else {
                v & 0x0000_0000_0000_FFFF == 0
            };
            if first_quarter_empty {
                start += 64 / no0(W) / 4;
            }
        }
    }

    while EQ == (((v >> (no0(W) * start)) & mask) != 0) {
        debug_assert!(start <= 64 / no0(W), "no matching field in chunk");
        start += 1;
    }

    start
}

/// Magic constant for [`find_gtlt_fast`]: replicates `mask/2 - v` (for
/// greater-than) or `v` (for less-than) into every field.
#[inline]
pub(crate) fn find_gtlt_magic<const GT: bool, const W: usize>(v: i64) -> u64 {
    let mask1 = field_mask(W);
    let mask2 = mask1 >> 1;
    if GT {
        (!0u64 / no0u(mask1)).wrapping_mul(mask2.wrapping_sub(v as u64))
    } else {
        (!0u64 / no0u(mask1)).wrapping_mul(v as u64)
    }
}

/// Scan a chunk whose fields all have their sign bit clear for elements
/// greater (`GT = true`) or less (`GT = false`) than the magic's value.
pub(crate) fn find_gtlt_fast<const GT: bool, A: Action, const W: usize>(
    chunk: u64,
    magic: u64,
    state: &mut QueryState<'_>,
    baseindex: usize,
) -> bool {
    let mask1 = field_mask(W);
    let mask2 = mask1 >> 1;
    let high_bits = (!0u64 / no0u(mask1)).wrapping_mul(mask2 + 1);

    // Every field's high bit answers the comparison for that field.
    let mut m = if GT {
        (chunk.wrapping_add(magic) | chunk) & high_bits
    } else {
        chunk.wrapping_sub(magic) & !chunk & high_bits
    };

    let mut p = 0usize;
    while m != 0 {
        if find_action_pattern::<A>(baseindex, m >> (no0(W) - 1), state) {
            break; // consumed as a pattern
        }

        let t = m.trailing_zeros() as usize / no0(W);
        p += t;
        let value = ((chunk >> (p * no0(W))) & mask1) as i64;
        if !find_action::<A>(p + baseindex, value, state) {
            return false;
        }

        let shift = (t + 1) * W;
        if shift >= 64 {
            m = 0;
        } else {
            m >>= shift;
        }
        p += 1;
    }

    true
}

/// Element-wise chunk scan for greater/less. No preconditions on the
/// chunk contents; fields are sign-extended before comparing.
pub(crate) fn find_gtlt<const GT: bool, A: Action, const W: usize>(
    v: i64,
    chunk: u64,
    state: &mut QueryState<'_>,
    baseindex: usize,
) -> bool {
    let mask = field_mask(W);
    let per_chunk = 64 / no0(W);
    let mut c = chunk;

    for t in 0..per_chunk {
        let elem = sign_extend::<W>(c & mask);
        let hit = if GT { elem > v } else { elem < v };
        if hit && !find_action::<A>(t + baseindex, elem, state) {
            return false;
        }
        if t + 1 < per_chunk {
            c >>= no0(W);
        }
    }

    true
}

#[inline(always)]
fn round_up(p: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (p + align - 1) & !(align - 1)
}

/// Find elements equal (`EQ = true`) or unequal (`EQ = false`) to
/// `value` in `[start, end)`.
pub(crate) fn compare_equality<const EQ: bool, A: Action, const W: usize>(
    view: &NodeView<'_>,
    value: i64,
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> bool {
    debug_assert!(start <= view.size && end <= view.size && start <= end);
    let mut start = start;

    // Scalar until the next 64-bit chunk boundary.
    let per_chunk = 64 / no0(W);
    let mut ee = round_up(start, per_chunk);
    ee = ee.min(end);
    while start < ee {
        let v = unsafe { get::<W>(view.data, start) };
        if EQ == (v == value) && !find_action::<A>(start + baseindex, v, state) {
            return false;
        }
        start += 1;
    }

    if start >= end {
        return true;
    }

    if W != 0 && W != 32 && W != 64 {
        let mask = field_mask(W);
        let valuemask = (!0u64 / no0u(mask)).wrapping_mul(value as u64 & mask);

        let end_bytes = end * W / 8;
        let mut word = start * W / 64;

        // The last chunk before `end` is left to the scalar tail, which
        // also keeps partially covered chunks out of the fast loop.
        while (word + 1) * 8 < end_bytes {
            let chunk =
                unsafe { view.data.cast::<u64>().add(word).read_unaligned() };
            let mut v2 = chunk ^ valuemask;
            let chunk_start = word * per_chunk;
            let mut a = 0usize;

            loop {
                let any = if EQ { test_zero::<W>(v2) } else { v2 != 0 };
                if !any {
                    break;
                }
                if find_action_pattern::<A>(
                    chunk_start + baseindex,
                    cascade::<W, EQ>(v2),
                    state,
                ) {
                    break; // consumed
                }

                let t = find_zero::<EQ, W>(v2);
                a += t;
                if a >= per_chunk {
                    break;
                }

                let v = unsafe { get::<W>(view.data, chunk_start + a) };
                if !find_action::<A>(a + chunk_start + baseindex, v, state) {
                    return false;
                }

                let shift = (t + 1) * W;
                if shift >= 64 {
                    v2 = 0;
                } else {
                    v2 >>= shift;
                }
                a += 1;
            }

            word += 1;
        }

        start = word * per_chunk;
    }

    // Tail (and widths 32/64 entirely).
    while start < end {
        let v = unsafe { get::<W>(view.data, start) };
        if EQ == (v == value) && !find_action::<A>(start + baseindex, v, state) {
            return false;
        }
        start += 1;
    }

    true
}

/// Find elements greater (`GT = true`) or less (`GT = false`) than
/// `value` in `[start, end)`.
pub(crate) fn compare_relation<const GT: bool, A: Action, const W: usize>(
    view: &NodeView<'_>,
    value: i64,
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> bool {
    debug_assert!(start <= view.size && end <= view.size && start <= end);
    let mask = field_mask(W);
    let mut start = start;

    let per_chunk = 64 / no0(W);
    let mut ee = round_up(start, per_chunk);
    ee = ee.min(end);
    while start < ee {
        let v = unsafe { get::<W>(view.data, start) };
        if (if GT { v > value } else { v < value })
            && !find_action::<A>(start + baseindex, v, state)
        {
            return false;
        }
        start += 1;
    }

    if start >= end {
        return true;
    }

    if W == 1 || W == 2 || W == 4 || W == 8 || W == 16 {
        let magic = find_gtlt_magic::<GT, W>(value);
        let end_bytes = end * W / 8;
        let mut word = start * W / 64;

        // The magic-constant trick needs a non-negative target that
        // leaves the field's sign bit free; anything else scans
        // element-wise.
        let ub = ((mask >> 1) - u64::from(GT)) as i64;
        if value != (magic & mask) as i64 && value >= 0 && W >= 2 && value <= ub {
            while (word + 1) * 8 < end_bytes {
                let chunk =
                    unsafe { view.data.cast::<u64>().add(word).read_unaligned() };
                let base = word * per_chunk + baseindex;
                let upper = lower_bits(W) << (no0(W) - 1);

                // The trick also needs every field's sign bit clear.
                let cont = if chunk & upper == 0 {
                    find_gtlt_fast::<GT, A, W>(chunk, magic, state, base)
                } else {
                    find_gtlt::<GT, A, W>(value, chunk, state, base)
                };
                if !cont {
                    return false;
                }
                word += 1;
            }
        } else {
            while (word + 1) * 8 < end_bytes {
                let chunk =
                    unsafe { view.data.cast::<u64>().add(word).read_unaligned() };
                let base = word * per_chunk + baseindex;
                if !find_gtlt::<GT, A, W>(value, chunk, state, base) {
                    return false;
                }
                word += 1;
            }
        }

        start = word * per_chunk;
    }

    // Tail, and widths 32/64 entirely: just 2-4 elements per chunk, the
    // word tricks no longer pay.
    while start < end {
        let v = unsafe { get::<W>(view.data, start) };
        if (if GT { v > value } else { v < value })
            && !find_action::<A>(start + baseindex, v, state)
        {
            return false;
        }
        start += 1;
    }

    true
}

/// Element-wise scan for the predicates without a word-parallel form
/// (GreaterEqual, LessEqual).
pub(crate) fn compare_scalar<C: Cond, A: Action, const W: usize>(
    view: &NodeView<'_>,
    value: i64,
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> bool {
    let mut i = start;
    while i < end {
        let v = unsafe { get::<W>(view.data, i) };
        if C::cmp(v, value) && !find_action::<A>(i + baseindex, v, state) {
            return false;
        }
        i += 1;
    }
    true
}

/// Dispatch a predicate to its specialized scan.
pub(crate) fn compare<C: Cond, A: Action, const W: usize>(
    view: &NodeView<'_>,
    value: i64,
    start: usize,
    end: usize,
    baseindex: usize,
    state: &mut QueryState<'_>,
) -> bool {
    match C::KIND {
        Condition::Equal => {
            compare_equality::<true, A, W>(view, value, start, end, baseindex, state)
        }
        Condition::NotEqual => {
            compare_equality::<false, A, W>(view, value, start, end, baseindex, state)
        }
        Condition::Greater => {
            compare_relation::<true, A, W>(view, value, start, end, baseindex, state)
        }
        Condition::Less => {
            compare_relation::<false, A, W>(view, value, start, end, baseindex, state)
        }
        Condition::GreaterEqual | Condition::LessEqual => {
            compare_scalar::<C, A, W>(view, value, start, end, baseindex, state)
        }
    }
}
