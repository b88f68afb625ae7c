//! Filepath: src/array.rs
//!
//! The array node accessor.
//!
//! [`Array`] is a transient, non-owning handle to one bit-packed array
//! node. It caches the node's header fields (size, width, flags), the
//! signed range of its current width and a per-width vtable, so the hot
//! paths never re-decode the header or branch on the width per element.
//!
//! An accessor is either attached or detached. Most methods have
//! undefined behaviour on a detached accessor (trapped by
//! `debug_assert!` in debug builds); the exceptions are the attachment
//! and parent-link management methods, mirroring the engine's rules.
//!
//! Separately from attachment, an accessor can carry a parent link:
//! `(parent, index in parent)`. The link is not stored in the node
//! hierarchy; it exists so a mutation that relocates this node (copy-on-
//! write, growth) can write the new ref back into the parent's slot.
//! That writeback is itself a `set` on the parent and may relocate the
//! parent in turn, all the way to the root. This recursion is the
//! protocol that keeps a persistent tree consistent under in-place
//! mutation. The parent link survives detach/reattach.
//!
//! Dropping an accessor never frees the node; [`Array::destroy`] and
//! [`Array::destroy_deep`] free explicitly.

pub(crate) mod aggregate;
mod write;

use std::ptr;

use crate::alloc::{AllocError, Allocator, MemRef, Ref};
use crate::direct::VTable;
use crate::header::{
    self, bit_width, calc_aligned_byte_size, calc_byte_size, lbound_for_width, ubound_for_width,
    NodeType, WidthType, HEADER_SIZE, MAX_PAYLOAD,
};
use crate::query::{
    find_dispatch, leafcmp, Action, ActionKind, Average, CallbackBoth, CallbackIdx, CallbackNone,
    CallbackVal, Cond, Condition, Count, Equal, FindAll, Greater, GreaterEqual, Less, LessEqual,
    Max, Min, NodeView, NotEqual, QueryState, ReturnFirst, Sum,
};
use crate::tagged::RefOrTagged;
use crate::tracing_helpers::{debug_log, trace_log, warn_log};
use crate::NOT_FOUND;

/// Total byte size of a freshly created node (header included).
const INITIAL_CAPACITY: usize = 128;

/// Extra bytes allocated when copy-on-write relocates a node, so the
/// private copy has room to grow before the next relocation.
const COW_HEADROOM: usize = 64;

/// A parent slot an array node can report relocations to.
///
/// Array nodes implement this for their own children: the writeback of
/// a relocated child is simply `set(child_ndx, new_ref)` on the parent,
/// which may cascade further up.
pub trait ArrayParent {
    /// Replace the child ref stored at `child_ndx`.
    fn update_child_ref(&mut self, child_ndx: usize, new_ref: Ref) -> Result<(), AllocError>;

    /// Read the child ref stored at `child_ndx`.
    fn get_child_ref(&self, child_ndx: usize) -> Ref;
}

#[derive(Clone, Copy)]
struct ParentSlot<'p> {
    parent: *mut (dyn ArrayParent + 'p),
    ndx_in_parent: usize,
}

/// Accessor for one bit-packed array node.
///
/// # Type Parameters
///
/// * `A` - The allocator supplying the node's backing memory
pub struct Array<'a, A: Allocator> {
    /// Payload start; null while detached.
    data: *mut u8,
    node_ref: Ref,
    size: usize,
    width: u8,
    /// Smallest value storable at the current width.
    lbound: i64,
    /// Largest value storable at the current width.
    ubound: i64,
    vtable: &'static VTable,
    is_inner_bptree_node: bool,
    has_refs: bool,
    context_flag: bool,
    parent: Option<ParentSlot<'a>>,
    alloc: &'a A,
}

// ============================================================================
//  Attachment
// ============================================================================

impl<'a, A: Allocator> Array<'a, A> {
    /// Create an accessor in the detached state.
    #[must_use]
    pub fn new(alloc: &'a A) -> Self {
        Self {
            data: ptr::null_mut(),
            node_ref: 0,
            size: 0,
            width: 0,
            lbound: 0,
            ubound: 0,
            vtable: VTable::for_width(0),
            is_inner_bptree_node: false,
            has_refs: false,
            context_flag: false,
            parent: None,
            alloc,
        }
    }

    /// Create an accessor attached to `node_ref`.
    #[must_use]
    pub fn attach(alloc: &'a A, node_ref: Ref) -> Self {
        let mut array = Self::new(alloc);
        array.init_from_ref(node_ref);
        array
    }

    /// Allocate a new empty node of the given type and attach to it.
    /// The parent link is left untouched.
    ///
    /// The caller owns the new node; dropping the accessor does not
    /// free it.
    pub fn create(&mut self, node_type: NodeType) -> Result<(), AllocError> {
        self.create_with(node_type, false, 0, 0)
    }

    /// Allocate a new node of `size` elements, each set to `value`, and
    /// attach to it.
    pub fn create_with(
        &mut self,
        node_type: NodeType,
        context_flag: bool,
        size: usize,
        value: i64,
    ) -> Result<(), AllocError> {
        let mem = Self::create_node(node_type, context_flag, size, value, self.alloc)?;
        self.init_from_mem(mem);
        Ok(())
    }

    /// Allocate a new node and return just its memory; no accessor is
    /// attached.
    pub fn create_node(
        node_type: NodeType,
        context_flag: bool,
        size: usize,
        value: i64,
        alloc: &A,
    ) -> Result<MemRef, AllocError> {
        let width = bit_width(value);
        let byte_size = calc_aligned_byte_size(size, width);
        let capacity = byte_size.max(INITIAL_CAPACITY);
        if capacity > MAX_PAYLOAD {
            return Err(AllocError::PayloadTooLarge);
        }

        let is_inner = node_type == NodeType::InnerBptreeNode;
        let has_refs = node_type != NodeType::Normal;

        let mem = alloc.alloc(capacity)?;
        unsafe {
            header::init_header(
                mem.addr,
                is_inner,
                has_refs,
                context_flag,
                WidthType::Bits,
                width,
                size,
                capacity,
            );
        }

        if value != 0 && size != 0 {
            let setter = VTable::for_width(width).setter;
            let data = unsafe { mem.addr.add(HEADER_SIZE) };
            for i in 0..size {
                unsafe { setter(data, i, value) };
            }
        }

        trace_log!(
            "create_node: ref {} width {} size {}",
            mem.node_ref,
            width,
            size
        );
        Ok(mem)
    }

    /// Reattach to the node behind `node_ref`. The parent link is left
    /// untouched.
    ///
    /// `node_ref` must belong to this accessor's allocator; attaching a
    /// ref from a different allocator is a programmer error.
    pub fn init_from_ref(&mut self, node_ref: Ref) {
        debug_assert!(node_ref != 0, "attach to the null ref");
        let addr = self.alloc.translate(node_ref);
        self.init_from_mem(MemRef { addr, node_ref });
    }

    /// Same as [`init_from_ref`](Self::init_from_ref) without the
    /// ref-to-address translation.
    pub fn init_from_mem(&mut self, mem: MemRef) {
        let h = mem.addr.cast_const();
        unsafe {
            self.node_ref = mem.node_ref;
            self.data = mem.addr.add(HEADER_SIZE);
            self.size = header::get_size(h);
            self.is_inner_bptree_node = header::get_is_inner_bptree_node(h);
            self.has_refs = header::get_hasrefs(h);
            self.context_flag = header::get_context_flag(h);
            self.set_width_cache(header::get_width(h));
        }
    }

    /// Shorthand for `init_from_ref(get_ref_from_parent())`.
    pub fn init_from_parent(&mut self) {
        let node_ref = self.get_ref_from_parent();
        self.init_from_ref(node_ref);
    }

    /// Detach from the node. Never frees anything; idempotent.
    pub fn detach(&mut self) {
        self.data = ptr::null_mut();
    }

    #[inline]
    #[must_use]
    pub fn is_attached(&self) -> bool {
        !self.data.is_null()
    }

    fn set_width_cache(&mut self, width: u8) {
        self.width = width;
        self.lbound = lbound_for_width(width);
        self.ubound = ubound_for_width(width);
        self.vtable = VTable::for_width(width);
    }

    #[inline]
    fn header_ptr(&self) -> *mut u8 {
        debug_assert!(self.is_attached());
        unsafe { self.data.sub(HEADER_SIZE) }
    }

    pub(crate) fn view(&self) -> NodeView<'_> {
        debug_assert!(self.is_attached());
        NodeView::new(self.data, self.size, self.width, self.lbound, self.ubound)
    }
}

// ============================================================================
//  Cached-state accessors
// ============================================================================

impl<'a, A: Allocator> Array<'a, A> {
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        debug_assert!(self.is_attached());
        self.size
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Bits per element; one of 0, 1, 2, 4, 8, 16, 32, 64.
    #[inline]
    #[must_use]
    pub fn width(&self) -> u8 {
        self.width
    }

    #[inline]
    #[must_use]
    pub fn has_refs(&self) -> bool {
        self.has_refs
    }

    #[inline]
    #[must_use]
    pub fn is_inner_bptree_node(&self) -> bool {
        self.is_inner_bptree_node
    }

    /// Higher layers use the context flag to differentiate leaf types.
    #[inline]
    #[must_use]
    pub fn get_context_flag(&self) -> bool {
        self.context_flag
    }

    pub fn set_context_flag(&mut self, value: bool) -> Result<(), AllocError> {
        if self.context_flag == value {
            return Ok(());
        }
        self.copy_on_write()?;
        self.context_flag = value;
        unsafe { header::set_context_flag(self.header_ptr(), value) };
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn get_type(&self) -> NodeType {
        if self.is_inner_bptree_node {
            debug_assert!(self.has_refs);
            return NodeType::InnerBptreeNode;
        }
        if self.has_refs {
            return NodeType::HasRefs;
        }
        NodeType::Normal
    }

    #[inline]
    #[must_use]
    pub fn get_ref(&self) -> Ref {
        self.node_ref
    }

    #[must_use]
    pub fn get_mem(&self) -> MemRef {
        MemRef {
            addr: self.header_ptr(),
            node_ref: self.node_ref,
        }
    }

    #[inline]
    #[must_use]
    pub fn allocator(&self) -> &'a A {
        self.alloc
    }

    /// Bytes currently in use, header included, excess capacity
    /// excluded. Always a multiple of 8; exactly what a shallow
    /// serialization writes.
    #[must_use]
    pub fn get_byte_size(&self) -> usize {
        let wtype = unsafe { header::get_wtype(self.header_ptr()) };
        calc_byte_size(wtype, self.size, self.width)
    }
}

// ============================================================================
//  Parent link
// ============================================================================

impl<'a, A: Allocator> Array<'a, A> {
    /// Install the parent link. The link is an address plus a slot
    /// index; it is maintained independently of attachment.
    ///
    /// # Safety
    /// `parent` must outlive every use of this accessor that can
    /// relocate the node (any mutation), or until the link is replaced
    /// or cleared.
    pub unsafe fn set_parent(&mut self, parent: &mut (dyn ArrayParent + 'a), ndx_in_parent: usize) {
        self.parent = Some(ParentSlot {
            parent: parent as *mut (dyn ArrayParent + 'a),
            ndx_in_parent,
        });
    }

    pub fn clear_parent(&mut self) {
        self.parent = None;
    }

    #[inline]
    #[must_use]
    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    #[inline]
    #[must_use]
    pub fn get_ndx_in_parent(&self) -> usize {
        self.parent.map_or(0, |p| p.ndx_in_parent)
    }

    pub fn set_ndx_in_parent(&mut self, ndx: usize) {
        if let Some(slot) = &mut self.parent {
            slot.ndx_in_parent = ndx;
        }
    }

    pub fn adjust_ndx_in_parent(&mut self, diff: isize) {
        if let Some(slot) = &mut self.parent {
            slot.ndx_in_parent = slot.ndx_in_parent.wrapping_add_signed(diff);
        }
    }

    /// Read this node's ref out of the parent slot. The parent link
    /// must be consistent with the hierarchy before calling.
    #[must_use]
    pub fn get_ref_from_parent(&self) -> Ref {
        let slot = self.parent.expect("no parent link");
        unsafe { (*slot.parent).get_child_ref(slot.ndx_in_parent) }
    }

    /// Push this node's current ref into the parent slot. No-op
    /// without a parent link.
    pub fn update_parent(&mut self) -> Result<(), AllocError> {
        if let Some(slot) = self.parent {
            unsafe { (*slot.parent).update_child_ref(slot.ndx_in_parent, self.node_ref)? };
        }
        Ok(())
    }
}

impl<'a, A: Allocator> ArrayParent for Array<'a, A> {
    fn update_child_ref(&mut self, child_ndx: usize, new_ref: Ref) -> Result<(), AllocError> {
        self.set(child_ndx, new_ref as i64)
    }

    fn get_child_ref(&self, child_ndx: usize) -> Ref {
        self.get_as_ref(child_ndx)
    }
}

// ============================================================================
//  Element access
// ============================================================================

impl<'a, A: Allocator> Array<'a, A> {
    #[inline]
    #[must_use]
    pub fn get(&self, ndx: usize) -> i64 {
        debug_assert!(self.is_attached());
        debug_assert!(ndx < self.size);
        unsafe { (self.vtable.getter)(self.data, ndx) }
    }

    #[inline]
    #[must_use]
    pub fn front(&self) -> i64 {
        self.get(0)
    }

    #[inline]
    #[must_use]
    pub fn back(&self) -> i64 {
        self.get(self.size - 1)
    }

    /// Bulk-unpack eight adjacent elements; slots past the end read 0.
    pub fn get_chunk(&self, ndx: usize, res: &mut [i64; 8]) {
        debug_assert!(ndx < self.size);
        unsafe { (self.vtable.chunk_getter)(self.data, self.size, ndx, res) };
    }

    #[inline]
    #[must_use]
    pub fn get_as_ref(&self, ndx: usize) -> Ref {
        debug_assert!(self.has_refs);
        self.get(ndx) as Ref
    }

    #[inline]
    #[must_use]
    pub fn get_as_ref_or_tagged(&self, ndx: usize) -> RefOrTagged {
        debug_assert!(self.has_refs);
        RefOrTagged::from_raw(self.get(ndx))
    }

    /// Write `value` at `ndx`, growing the width first when the value
    /// does not fit.
    ///
    /// Guaranteed not to fail when the node is already private to this
    /// writer and the value fits the current width.
    pub fn set(&mut self, ndx: usize, value: i64) -> Result<(), AllocError> {
        debug_assert!(self.is_attached());
        debug_assert!(ndx < self.size);

        if self.get(ndx) == value {
            return Ok(());
        }

        self.copy_on_write()?;
        self.ensure_minimum_width(value)?;
        unsafe { (self.vtable.setter)(self.data, ndx, value) };
        Ok(())
    }

    pub fn set_as_ref(&mut self, ndx: usize, target: Ref) -> Result<(), AllocError> {
        debug_assert!(self.has_refs);
        self.set(ndx, target as i64)
    }

    pub fn set_ref_or_tagged(&mut self, ndx: usize, value: RefOrTagged) -> Result<(), AllocError> {
        debug_assert!(self.has_refs);
        self.set(ndx, value.raw())
    }

    pub fn add_ref_or_tagged(&mut self, value: RefOrTagged) -> Result<(), AllocError> {
        debug_assert!(self.has_refs);
        self.add(value.raw())
    }

    pub fn ensure_minimum_width_tagged(&mut self, value: RefOrTagged) -> Result<(), AllocError> {
        debug_assert!(self.has_refs);
        self.ensure_minimum_width(value.raw())
    }

    /// Grow the element width until `value` is representable. Width
    /// never shrinks automatically.
    pub fn ensure_minimum_width(&mut self, value: i64) -> Result<(), AllocError> {
        if self.lbound <= value && value <= self.ubound {
            return Ok(());
        }
        self.do_ensure_minimum_width(value)
    }

    fn do_ensure_minimum_width(&mut self, value: i64) -> Result<(), AllocError> {
        let new_width = bit_width(value);
        debug_assert!(new_width > self.width);
        debug_log!(
            "width expansion: ref {} {} -> {} bits",
            self.node_ref,
            self.width,
            new_width
        );

        let old_getter = self.vtable.getter;
        self.alloc_node(self.size, new_width)?;

        // Expand in place, back to front: an element's new position
        // never overlaps a not-yet-read old position.
        let setter = self.vtable.setter;
        let mut i = self.size;
        while i != 0 {
            i -= 1;
            let v = unsafe { old_getter(self.data, i) };
            unsafe { setter(self.data, i, v) };
        }
        Ok(())
    }
}

// ============================================================================
//  Mutation & growth
// ============================================================================

impl<'a, A: Allocator> Array<'a, A> {
    /// Insert `value` at `ndx`, shifting higher elements up.
    pub fn insert(&mut self, ndx: usize, value: i64) -> Result<(), AllocError> {
        debug_assert!(self.is_attached());
        debug_assert!(ndx <= self.size);

        let old_width = self.width;
        let old_size = self.size;
        let do_expand = value < self.lbound || value > self.ubound;
        let new_width = if do_expand { bit_width(value) } else { old_width };

        // Ensure capacity (and privacy) first; relocation copies the
        // payload verbatim, so the old-width getter stays valid on the
        // new memory.
        self.alloc_node(old_size + 1, new_width)?;

        let old_getter = VTable::for_width(old_width).getter;
        let setter = self.vtable.setter;

        // Shift higher elements up one slot, re-packing at the new
        // width on the way when expanding.
        let mut i = old_size;
        while i > ndx {
            i -= 1;
            let v = unsafe { old_getter(self.data, i) };
            unsafe { setter(self.data, i + 1, v) };
        }

        unsafe { setter(self.data, ndx, value) };

        // Lower elements only move when the width grew.
        if do_expand {
            let mut i = ndx;
            while i != 0 {
                i -= 1;
                let v = unsafe { old_getter(self.data, i) };
                unsafe { setter(self.data, i, v) };
            }
        }

        self.size += 1;
        unsafe { header::set_size(self.header_ptr(), self.size) };
        Ok(())
    }

    /// Append `value`.
    pub fn add(&mut self, value: i64) -> Result<(), AllocError> {
        self.insert(self.size, value)
    }

    /// Remove the element at `ndx`, shifting higher elements down.
    ///
    /// Does **not** destroy a child node the erased slot may have
    /// referred to; see
    /// [`truncate_and_destroy_children`](Self::truncate_and_destroy_children).
    pub fn erase(&mut self, ndx: usize) -> Result<(), AllocError> {
        debug_assert!(ndx < self.size);
        self.move_range(ndx + 1, self.size, ndx)?;
        self.size -= 1;
        unsafe { header::set_size(self.header_ptr(), self.size) };
        Ok(())
    }

    /// Remove the elements in `[begin, end)`. Child nodes are not
    /// destroyed.
    pub fn erase_range(&mut self, begin: usize, end: usize) -> Result<(), AllocError> {
        debug_assert!(begin <= end && end <= self.size);
        if begin == end {
            return Ok(());
        }
        self.move_range(end, self.size, begin)?;
        self.size -= end - begin;
        unsafe { header::set_size(self.header_ptr(), self.size) };
        Ok(())
    }

    /// Reduce the size to `new_size` elements. Child nodes are not
    /// destroyed. Truncating to zero drops the width back to 0.
    pub fn truncate(&mut self, new_size: usize) -> Result<(), AllocError> {
        debug_assert!(self.is_attached());
        debug_assert!(new_size <= self.size);

        self.copy_on_write()?;

        self.size = new_size;
        unsafe { header::set_size(self.header_ptr(), new_size) };

        if new_size == 0 {
            unsafe { header::set_width(self.header_ptr(), 0) };
            self.set_width_cache(0);
        }
        Ok(())
    }

    /// Like [`truncate`](Self::truncate), but first destroys every
    /// removed child node recursively.
    pub fn truncate_and_destroy_children(&mut self, new_size: usize) -> Result<(), AllocError> {
        debug_assert!(new_size <= self.size);
        if self.has_refs {
            self.destroy_children(new_size);
        }
        self.truncate(new_size)
    }

    /// Shorthand for `truncate(0)`.
    pub fn clear(&mut self) -> Result<(), AllocError> {
        self.truncate(0)
    }

    /// Shorthand for `truncate_and_destroy_children(0)`.
    pub fn clear_and_destroy_children(&mut self) -> Result<(), AllocError> {
        self.truncate_and_destroy_children(0)
    }

    /// Block-copy `[begin, end)` to `dest_begin`. `dest_begin` must not
    /// lie inside `[begin, end)`.
    pub fn move_range(
        &mut self,
        begin: usize,
        end: usize,
        dest_begin: usize,
    ) -> Result<(), AllocError> {
        debug_assert!(begin <= end && end <= self.size);
        debug_assert!(dest_begin <= self.size - (end - begin) || begin == end);
        debug_assert!(!(dest_begin >= begin && dest_begin < end));

        self.copy_on_write()?;
        if begin == end {
            return Ok(());
        }

        if self.width >= 8 {
            let bytes = usize::from(self.width) / 8;
            unsafe {
                ptr::copy(
                    self.data.add(begin * bytes),
                    self.data.add(dest_begin * bytes),
                    (end - begin) * bytes,
                );
            }
        } else {
            // Sub-byte widths shift bit fields; go element by element.
            // Ascending order is safe: the destination never overlaps
            // unread source in that direction.
            let getter = self.vtable.getter;
            let setter = self.vtable.setter;
            for i in 0..end - begin {
                let v = unsafe { getter(self.data, begin + i) };
                unsafe { setter(self.data, dest_begin + i, v) };
            }
        }
        Ok(())
    }

    /// Block-copy `[begin, end)` so that its last element lands at
    /// `dest_end - 1`. `dest_end` must not lie inside `(begin, end]`.
    pub fn move_backward(
        &mut self,
        begin: usize,
        end: usize,
        dest_end: usize,
    ) -> Result<(), AllocError> {
        debug_assert!(begin <= end && end <= self.size);
        debug_assert!(dest_end <= self.size);
        debug_assert!(!(dest_end > begin && dest_end <= end));

        self.copy_on_write()?;
        if begin == end {
            return Ok(());
        }

        let count = end - begin;
        let dest_begin = dest_end - count;
        if self.width >= 8 {
            let bytes = usize::from(self.width) / 8;
            unsafe {
                ptr::copy(
                    self.data.add(begin * bytes),
                    self.data.add(dest_begin * bytes),
                    count * bytes,
                );
            }
        } else {
            let getter = self.vtable.getter;
            let setter = self.vtable.setter;
            let mut i = count;
            while i != 0 {
                i -= 1;
                let v = unsafe { getter(self.data, begin + i) };
                unsafe { setter(self.data, dest_begin + i, v) };
            }
        }
        Ok(())
    }

    /// Move `num_elems` elements starting at `from` to land at `to`,
    /// shifting everything between by one block. O(|from - to|).
    pub fn move_rotate(
        &mut self,
        from: usize,
        to: usize,
        num_elems: usize,
    ) -> Result<(), AllocError> {
        debug_assert!(from + num_elems <= self.size && to + num_elems <= self.size);
        if from == to {
            return Ok(());
        }
        self.copy_on_write()?;

        let mut buf = Vec::with_capacity(num_elems);
        for i in 0..num_elems {
            buf.push(self.get(from + i));
        }

        if from < to {
            self.move_range(from + num_elems, to + num_elems, from)?;
        } else {
            self.move_backward(to, from, from + num_elems)?;
        }

        let setter = self.vtable.setter;
        for (i, v) in buf.into_iter().enumerate() {
            unsafe { setter(self.data, to + i, v) };
        }
        Ok(())
    }

    /// Add `diff` to the element at `ndx`.
    ///
    /// Overflow past the 64-bit range is undefined.
    pub fn adjust(&mut self, ndx: usize, diff: i64) -> Result<(), AllocError> {
        debug_assert!(ndx < self.size);
        let v = self.get(ndx);
        self.set(ndx, v + diff)
    }

    /// Add `diff` to every element in `[begin, end)`.
    pub fn adjust_range(&mut self, begin: usize, end: usize, diff: i64) -> Result<(), AllocError> {
        debug_assert!(begin <= end && end <= self.size);
        for i in begin..end {
            self.adjust(i, diff)?;
        }
        Ok(())
    }

    /// Add `diff` to every element that is `>= limit`.
    pub fn adjust_ge(&mut self, limit: i64, diff: i64) -> Result<(), AllocError> {
        for i in 0..self.size {
            let v = self.get(i);
            if v >= limit {
                self.set(i, v + diff)?;
            }
        }
        Ok(())
    }

    /// Reset every element to zero, dropping the width to 0. The size
    /// is unchanged.
    pub fn set_all_to_zero(&mut self) -> Result<(), AllocError> {
        self.copy_on_write()?;
        unsafe { header::set_width(self.header_ptr(), 0) };
        self.set_width_cache(0);
        Ok(())
    }

    /// Re-initialize to `num_items` zero elements stored at `width`
    /// bits. Existing children are destroyed first.
    pub fn preset_width(&mut self, width: u8, num_items: usize) -> Result<(), AllocError> {
        self.clear_and_destroy_children()?;
        self.alloc_node(num_items, width)?;
        self.size = num_items;
        unsafe {
            header::set_size(self.header_ptr(), num_items);
            // The capacity may be recycled; the payload must read as
            // all-zero again.
            let payload = calc_aligned_byte_size(num_items, width) - HEADER_SIZE;
            ptr::write_bytes(self.data, 0, payload);
        }
        Ok(())
    }

    /// [`preset_width`](Self::preset_width) with the width chosen as
    /// the smallest covering both `min_value` and `max_value`.
    pub fn preset(
        &mut self,
        min_value: i64,
        max_value: i64,
        num_items: usize,
    ) -> Result<(), AllocError> {
        let width = bit_width(min_value).max(bit_width(max_value));
        self.preset_width(width, num_items)
    }
}

// ============================================================================
//  Copy-on-write & capacity
// ============================================================================

impl<'a, A: Allocator> Array<'a, A> {
    /// Make the node private to this writer: if the allocator reports
    /// it read-only (shared with an older snapshot), relocate a copy
    /// and write the new ref into the parent slot. The original bytes
    /// stay intact.
    pub(crate) fn copy_on_write(&mut self) -> Result<(), AllocError> {
        if !self.alloc.is_read_only(self.node_ref) {
            return Ok(());
        }
        self.alloc_node(self.size, self.width)
    }

    /// Ensure capacity for `count` elements at `width` bits, relocating
    /// if the node is shared or too small, and re-cache the width. The
    /// element count in the header is NOT updated; callers do that once
    /// the payload is consistent.
    fn alloc_node(&mut self, count: usize, width: u8) -> Result<(), AllocError> {
        debug_assert!(self.is_attached());

        let needed = calc_aligned_byte_size(count, width);
        if needed > MAX_PAYLOAD {
            warn_log!(
                "node ref {} needs {} bytes, over the {} payload budget",
                self.node_ref,
                needed,
                MAX_PAYLOAD
            );
            return Err(AllocError::PayloadTooLarge);
        }

        let read_only = self.alloc.is_read_only(self.node_ref);
        let capacity = unsafe { header::get_capacity(self.header_ptr().cast_const()) };

        if read_only || needed > capacity {
            let new_capacity = if read_only {
                // Private copy with headroom, so the next growth does
                // not relocate again immediately.
                (needed + COW_HEADROOM).min(MAX_PAYLOAD)
            } else {
                let mut cap = capacity.max(INITIAL_CAPACITY);
                while cap < needed {
                    cap *= 2;
                }
                cap.min(MAX_PAYLOAD)
            };
            debug_assert!(new_capacity >= needed);

            // Only the used prefix needs to travel.
            let used = self.get_byte_size();
            let old_ref = self.node_ref;
            let mem = self.alloc.realloc(old_ref, used, new_capacity)?;
            unsafe { header::set_capacity(mem.addr, new_capacity) };

            self.node_ref = mem.node_ref;
            self.data = unsafe { mem.addr.add(HEADER_SIZE) };

            if mem.node_ref != old_ref {
                debug_log!(
                    "relocated node: ref {} -> {} ({} bytes)",
                    old_ref,
                    mem.node_ref,
                    new_capacity
                );
                self.update_parent()?;
            }
        }

        if width != self.width {
            unsafe { header::set_width(self.header_ptr(), width) };
            self.set_width_cache(width);
        }
        Ok(())
    }
}

// ============================================================================
//  Destruction
// ============================================================================

impl<'a, A: Allocator> Array<'a, A> {
    /// Free the node this accessor is attached to, not its children,
    /// and detach. Idempotent.
    pub fn destroy(&mut self) {
        if !self.is_attached() {
            return;
        }
        unsafe { self.alloc.free(self.node_ref) };
        self.data = ptr::null_mut();
    }

    /// Recursively free children (when `has_refs`), then the node
    /// itself, then detach. Idempotent.
    pub fn destroy_deep(&mut self) {
        if !self.is_attached() {
            return;
        }
        trace_log!("destroy_deep: ref {}", self.node_ref);
        if self.has_refs {
            self.destroy_children(0);
        }
        unsafe { self.alloc.free(self.node_ref) };
        self.data = ptr::null_mut();
    }

    /// Free the node behind `node_ref`, not its children.
    pub fn destroy_ref(node_ref: Ref, alloc: &A) {
        unsafe { alloc.free(node_ref) };
    }

    /// Free the node behind `node_ref` and all of its children,
    /// recursively.
    pub fn destroy_deep_ref(node_ref: Ref, alloc: &A) {
        let header = alloc.translate(node_ref).cast_const();
        if !unsafe { header::get_hasrefs(header) } {
            unsafe { alloc.free(node_ref) };
            return;
        }
        let mut array = Array::new(alloc);
        array.init_from_ref(node_ref);
        array.destroy_deep();
    }

    fn destroy_children(&mut self, offset: usize) {
        for i in offset..self.size {
            let value = self.get(i);
            // Ref slots have the low bit clear; the null ref has no
            // node behind it.
            if value != 0 && value & 1 == 0 {
                Self::destroy_deep_ref(value as Ref, self.alloc);
            }
        }
    }
}

// ============================================================================
//  Queries
// ============================================================================

impl<'a, A: Allocator> Array<'a, A> {
    /// Typed kernel entry: search `[start, end)` under predicate `C`,
    /// feeding action `Act`'s state. `baseindex` is added to every
    /// reported index. `end == NOT_FOUND` means the node's size.
    ///
    /// Returns `false` when the state stopped the search, `true` when
    /// the caller should continue on the next leaf.
    pub fn find_with<C: Cond, Act: Action>(
        &self,
        value: i64,
        start: usize,
        end: usize,
        baseindex: usize,
        state: &mut QueryState<'_>,
    ) -> bool {
        debug_assert!(self.is_attached());
        find_dispatch::<C, Act>(&self.view(), value, start, end, baseindex, state)
    }

    /// Runtime-dispatched kernel entry for callers that carry the
    /// predicate and action as values.
    #[allow(clippy::too_many_arguments)]
    pub fn find(
        &self,
        cond: Condition,
        action: ActionKind,
        value: i64,
        start: usize,
        end: usize,
        baseindex: usize,
        state: &mut QueryState<'_>,
    ) -> bool {
        match cond {
            Condition::Equal => self.find_cond::<Equal>(action, value, start, end, baseindex, state),
            Condition::NotEqual => {
                self.find_cond::<NotEqual>(action, value, start, end, baseindex, state)
            }
            Condition::Greater => {
                self.find_cond::<Greater>(action, value, start, end, baseindex, state)
            }
            Condition::Less => self.find_cond::<Less>(action, value, start, end, baseindex, state),
            Condition::GreaterEqual => {
                self.find_cond::<GreaterEqual>(action, value, start, end, baseindex, state)
            }
            Condition::LessEqual => {
                self.find_cond::<LessEqual>(action, value, start, end, baseindex, state)
            }
        }
    }

    fn find_cond<C: Cond>(
        &self,
        action: ActionKind,
        value: i64,
        start: usize,
        end: usize,
        baseindex: usize,
        state: &mut QueryState<'_>,
    ) -> bool {
        match action {
            ActionKind::ReturnFirst => {
                self.find_with::<C, ReturnFirst>(value, start, end, baseindex, state)
            }
            ActionKind::Sum => self.find_with::<C, Sum>(value, start, end, baseindex, state),
            ActionKind::Max => self.find_with::<C, Max>(value, start, end, baseindex, state),
            ActionKind::Min => self.find_with::<C, Min>(value, start, end, baseindex, state),
            ActionKind::Count => self.find_with::<C, Count>(value, start, end, baseindex, state),
            ActionKind::FindAll => {
                self.find_with::<C, FindAll>(value, start, end, baseindex, state)
            }
            ActionKind::CallbackIdx => {
                self.find_with::<C, CallbackIdx>(value, start, end, baseindex, state)
            }
            ActionKind::CallbackVal => {
                self.find_with::<C, CallbackVal>(value, start, end, baseindex, state)
            }
            ActionKind::CallbackNone => {
                self.find_with::<C, CallbackNone>(value, start, end, baseindex, state)
            }
            ActionKind::CallbackBoth => {
                self.find_with::<C, CallbackBoth>(value, start, end, baseindex, state)
            }
            ActionKind::Average => {
                self.find_with::<C, Average>(value, start, end, baseindex, state)
            }
        }
    }

    /// First index in `[start, end)` matching `value` under `C`, using
    /// the cached per-width finder.
    #[must_use]
    pub fn find_first_with<C: Cond>(&self, value: i64, start: usize, end: usize) -> Option<usize> {
        debug_assert!(self.is_attached());
        let mut state = QueryState::new(ActionKind::ReturnFirst, 1);
        let finder = self.vtable.finders[C::KIND as usize];
        finder(&self.view(), value, start, end, 0, &mut state);

        let ndx = state.state as usize;
        if ndx == NOT_FOUND {
            None
        } else {
            Some(ndx)
        }
    }

    /// First index of `value`, equality predicate.
    #[must_use]
    pub fn find_first(&self, value: i64, start: usize, end: usize) -> Option<usize> {
        self.find_first_with::<Equal>(value, start, end)
    }

    /// Append `col_offset + i` to `result` for every `i` in
    /// `[begin, end)` where the element equals `value`.
    pub fn find_all(
        &self,
        result: &mut Vec<usize>,
        value: i64,
        col_offset: usize,
        begin: usize,
        end: usize,
    ) {
        let end = if end == NOT_FOUND { self.size } else { end };
        let mut state = QueryState::find_all(result, usize::MAX);
        self.find_with::<Equal, FindAll>(value, begin, end, col_offset, &mut state);
    }

    /// Number of elements equal to `value`.
    #[must_use]
    pub fn count(&self, value: i64) -> usize {
        let mut state = QueryState::new(ActionKind::Count, usize::MAX);
        self.find_with::<Equal, Count>(value, 0, self.size, 0, &mut state);
        state.state as usize
    }

    /// Position-wise comparison against another leaf: report every
    /// index in `[start, end)` where `C::cmp(self[i], foreign[i])`
    /// holds. Both leaves must cover `end`.
    pub fn compare_leafs<C: Cond, Act: Action>(
        &self,
        foreign: &Array<'_, A>,
        start: usize,
        end: usize,
        baseindex: usize,
        state: &mut QueryState<'_>,
    ) -> bool {
        debug_assert!(self.is_attached() && foreign.is_attached());
        leafcmp::compare_leafs::<C, Act>(
            &self.view(),
            &foreign.view(),
            start,
            end,
            baseindex,
            state,
        )
    }
}
