//! Filepath: src/direct.rs
//!
//! Width-parameterized packed element access.
//!
//! Elements are packed at one of eight widths (0, 1, 2, 4, 8, 16, 32 or
//! 64 bits). Sub-byte widths pack little-end-first within each byte and
//! are unsigned; byte widths and up are native-endian two's-complement.
//! Width 0 stores nothing at all: every element reads as 0.
//!
//! All accessors here are monomorphized over the width via const
//! generics. The accessor object caches a per-width [`VTable`] of
//! function pointers so its dynamic entry points pay one indirect call
//! per operation, never one per element.

use crate::header;
use crate::query::{finder, Equal, Greater, GreaterEqual, Less, LessEqual, NodeView, NotEqual,
                   QueryState};
use crate::Ref;

/// Dispatch a runtime width to a const-generic instantiation. The width
/// const parameter must come last in the callee's generic list.
macro_rules! with_width {
    ($w:expr, $f:ident :: < $($t:path),* > ( $($args:expr),* $(,)? )) => {
        match $w {
            0 => $f::<$($t,)* 0>($($args),*),
            1 => $f::<$($t,)* 1>($($args),*),
            2 => $f::<$($t,)* 2>($($args),*),
            4 => $f::<$($t,)* 4>($($args),*),
            8 => $f::<$($t,)* 8>($($args),*),
            16 => $f::<$($t,)* 16>($($args),*),
            32 => $f::<$($t,)* 32>($($args),*),
            _ => $f::<$($t,)* 64>($($args),*),
        }
    };
    ($w:expr, $f:ident ( $($args:expr),* $(,)? )) => {
        match $w {
            0 => $f::<0>($($args),*),
            1 => $f::<1>($($args),*),
            2 => $f::<2>($($args),*),
            4 => $f::<4>($($args),*),
            8 => $f::<8>($($args),*),
            16 => $f::<16>($($args),*),
            32 => $f::<32>($($args),*),
            _ => $f::<64>($($args),*),
        }
    };
}

pub(crate) use with_width;

// ============================================================================
//  Packed get/set
// ============================================================================

/// Read element `ndx` from a payload packed at width `W`.
///
/// # Safety
/// `data` must point to a payload holding at least `ndx + 1` elements of
/// width `W`.
#[inline(always)]
pub(crate) unsafe fn get<const W: usize>(data: *const u8, ndx: usize) -> i64 {
    match W {
        0 => 0,
        1 => {
            let offset = ndx >> 3;
            i64::from((*data.add(offset) >> (ndx & 7)) & 0x01)
        }
        2 => {
            let offset = ndx >> 2;
            i64::from((*data.add(offset) >> ((ndx & 3) << 1)) & 0x03)
        }
        4 => {
            let offset = ndx >> 1;
            i64::from((*data.add(offset) >> ((ndx & 1) << 2)) & 0x0F)
        }
        8 => i64::from(data.add(ndx).cast::<i8>().read()),
        16 => i64::from(data.cast::<i16>().add(ndx).read_unaligned()),
        32 => i64::from(data.cast::<i32>().add(ndx).read_unaligned()),
        64 => data.cast::<i64>().add(ndx).read_unaligned(),
        _ => unreachable!("invalid element width"),
    }
}

/// Write element `ndx` into a payload packed at width `W`. The value
/// must already fit the width.
///
/// # Safety
/// `data` must point to a writable payload holding at least `ndx + 1`
/// elements of width `W`.
#[inline(always)]
pub(crate) unsafe fn set<const W: usize>(data: *mut u8, ndx: usize, value: i64) {
    debug_assert!(
        W == 0 || (value >= header::lbound_for_width(W as u8)
            && value <= header::ubound_for_width(W as u8)),
        "value {} does not fit width {}",
        value,
        W
    );
    match W {
        0 => debug_assert_eq!(value, 0),
        1 => {
            let p = data.add(ndx >> 3);
            let shift = ndx & 7;
            *p = (*p & !(1 << shift)) | (((value as u8) & 0x01) << shift);
        }
        2 => {
            let p = data.add(ndx >> 2);
            let shift = (ndx & 3) << 1;
            *p = (*p & !(0x03 << shift)) | (((value as u8) & 0x03) << shift);
        }
        4 => {
            let p = data.add(ndx >> 1);
            let shift = (ndx & 1) << 2;
            *p = (*p & !(0x0F << shift)) | (((value as u8) & 0x0F) << shift);
        }
        8 => data.add(ndx).cast::<i8>().write(value as i8),
        16 => data.cast::<i16>().add(ndx).write_unaligned(value as i16),
        32 => data.cast::<i32>().add(ndx).write_unaligned(value as i32),
        64 => data.cast::<i64>().add(ndx).write_unaligned(value),
        _ => unreachable!("invalid element width"),
    }
}

/// Bulk-unpack up to eight adjacent elements starting at `ndx`. Slots
/// past `size` are zero-filled.
///
/// # Safety
/// `data`/`size` must describe a valid payload and `ndx < size`.
#[inline]
pub(crate) unsafe fn get_chunk<const W: usize>(
    data: *const u8,
    size: usize,
    ndx: usize,
    res: &mut [i64; 8],
) {
    debug_assert!(ndx < size);
    let mut i = 0;
    while i < 8 && ndx + i < size {
        res[i] = get::<W>(data, ndx + i);
        i += 1;
    }
    while i < 8 {
        res[i] = 0;
        i += 1;
    }
}

/// Sign-extend a raw field of width `W` extracted from a chunk.
#[inline(always)]
pub(crate) fn sign_extend<const W: usize>(raw: u64) -> i64 {
    match W {
        8 => raw as u8 as i8 as i64,
        16 => raw as u16 as i16 as i64,
        32 => raw as u32 as i32 as i64,
        64 => raw as i64,
        // Sub-byte widths are unsigned fields.
        _ => raw as i64,
    }
}

// ============================================================================
//  Header-direct reads
// ============================================================================
//
// Reads that dispatch on the width stored in the header, without the cost
// of constructing an accessor. Used by B+-tree traversal where a node is
// visited once.

/// Get element `ndx` of the node behind `header`.
///
/// # Safety
/// `header` must point to a valid node and `ndx` must be in bounds.
#[must_use]
pub unsafe fn get_from_header(header: *const u8, ndx: usize) -> i64 {
    let width = header::get_width(header);
    let data = header.add(header::HEADER_SIZE);
    with_width!(usize::from(width), get(data, ndx))
}

/// Get elements `ndx` and `ndx + 1` in one dispatch.
///
/// # Safety
/// `header` must point to a valid node and `ndx + 1` must be in bounds.
#[must_use]
pub unsafe fn get_two_from_header(header: *const u8, ndx: usize) -> (i64, i64) {
    let width = header::get_width(header);
    let data = header.add(header::HEADER_SIZE);
    let w = usize::from(width);
    (
        with_width!(w, get(data, ndx)),
        with_width!(w, get(data, ndx + 1)),
    )
}

/// Get three adjacent ref elements in one dispatch. Used by inner
/// B+-tree nodes whose prefix is `(offsets_ref, keys_ref, count)`.
///
/// # Safety
/// `header` must point to a valid node and `ndx + 2` must be in bounds.
#[must_use]
pub unsafe fn get_three_from_header(header: *const u8, ndx: usize) -> (Ref, Ref, Ref) {
    let width = header::get_width(header);
    let data = header.add(header::HEADER_SIZE);
    let w = usize::from(width);
    (
        with_width!(w, get(data, ndx)) as Ref,
        with_width!(w, get(data, ndx + 1)) as Ref,
        with_width!(w, get(data, ndx + 2)) as Ref,
    )
}

// ============================================================================
//  Per-width vtable
// ============================================================================

pub(crate) type Getter = unsafe fn(*const u8, usize) -> i64;
pub(crate) type Setter = unsafe fn(*mut u8, usize, i64);
pub(crate) type ChunkGetter = unsafe fn(*const u8, usize, usize, &mut [i64; 8]);
pub(crate) type FinderFn =
    fn(&NodeView<'_>, i64, usize, usize, usize, &mut QueryState<'_>) -> bool;

/// Function-pointer table for one width, cached on each accessor. One
/// finder per predicate, all specialized to ReturnFirst for the
/// `find_first` hot path.
pub(crate) struct VTable {
    pub getter: Getter,
    pub setter: Setter,
    pub chunk_getter: ChunkGetter,
    pub finders: [FinderFn; 6],
}

macro_rules! vtable_for {
    ($w:literal) => {
        VTable {
            getter: get::<$w>,
            setter: set::<$w>,
            chunk_getter: get_chunk::<$w>,
            finders: [
                finder::<Equal, $w>,
                finder::<NotEqual, $w>,
                finder::<Greater, $w>,
                finder::<Less, $w>,
                finder::<GreaterEqual, $w>,
                finder::<LessEqual, $w>,
            ],
        }
    };
}

static VTABLE_0: VTable = vtable_for!(0);
static VTABLE_1: VTable = vtable_for!(1);
static VTABLE_2: VTable = vtable_for!(2);
static VTABLE_4: VTable = vtable_for!(4);
static VTABLE_8: VTable = vtable_for!(8);
static VTABLE_16: VTable = vtable_for!(16);
static VTABLE_32: VTable = vtable_for!(32);
static VTABLE_64: VTable = vtable_for!(64);

impl VTable {
    #[inline]
    pub(crate) fn for_width(width: u8) -> &'static VTable {
        match width {
            0 => &VTABLE_0,
            1 => &VTABLE_1,
            2 => &VTABLE_2,
            4 => &VTABLE_4,
            8 => &VTABLE_8,
            16 => &VTABLE_16,
            32 => &VTABLE_32,
            _ => &VTABLE_64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{lbound_for_width, ubound_for_width, WIDTHS};

    #[test]
    fn pack_unpack_roundtrip_every_width() {
        for &w in &WIDTHS {
            if w == 0 {
                continue;
            }
            let mut buf = [0u8; 128];
            let data = buf.as_mut_ptr();
            let lb = lbound_for_width(w);
            let ub = ubound_for_width(w);
            let probe = [lb, ub, 0, lb / 2, ub / 2, 1.min(ub)];
            for (i, &v) in probe.iter().enumerate() {
                unsafe {
                    with_width!(usize::from(w), set(data, i, v));
                }
            }
            for (i, &v) in probe.iter().enumerate() {
                let got = unsafe { with_width!(usize::from(w), get(data.cast_const(), i)) };
                assert_eq!(got, v, "width {w} slot {i}");
            }
        }
    }

    #[test]
    fn sub_byte_neighbours_are_preserved() {
        let mut buf = [0u8; 8];
        let data = buf.as_mut_ptr();
        unsafe {
            for i in 0..16 {
                set::<4>(data, i, (i as i64) % 16);
            }
            set::<4>(data, 7, 9);
            for i in 0..16 {
                let expect = if i == 7 { 9 } else { (i as i64) % 16 };
                assert_eq!(get::<4>(data.cast_const(), i), expect);
            }
        }
    }

    #[test]
    fn width_zero_reads_zero() {
        let buf = [0xFFu8; 8];
        unsafe {
            assert_eq!(get::<0>(buf.as_ptr(), 0), 0);
            assert_eq!(get::<0>(buf.as_ptr(), 1000), 0);
        }
    }

    #[test]
    fn chunk_zero_fills_past_size() {
        let mut buf = [0u8; 64];
        let data = buf.as_mut_ptr();
        unsafe {
            for i in 0..5 {
                set::<8>(data, i, i as i64 + 1);
            }
            let mut res = [99i64; 8];
            get_chunk::<8>(data.cast_const(), 5, 2, &mut res);
            assert_eq!(res, [3, 4, 5, 0, 0, 0, 0, 0]);
        }
    }

    #[test]
    fn header_direct_reads() {
        use crate::header;
        let mut node = [0u8; 8 + 32];
        let h = node.as_mut_ptr();
        unsafe {
            header::init_header(h, false, false, false, header::WidthType::Bits, 16, 4, 40);
            let data = h.add(header::HEADER_SIZE);
            for i in 0..4 {
                set::<16>(data, i, -(i as i64) * 100);
            }
            assert_eq!(get_from_header(h.cast_const(), 3), -300);
            assert_eq!(get_two_from_header(h.cast_const(), 1), (-100, -200));
        }
    }
}
