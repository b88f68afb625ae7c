//! Filepath: src/array/write.rs
//!
//! Node serialization: streaming (`write`) and allocator-to-allocator
//! deep copies (`clone_deep`).
//!
//! Deep serialization is post-order: children first, then the parent
//! with each child ref replaced by the child's stream position. A node
//! the allocator reports read-only is already part of an earlier
//! committed stream, so `only_if_modified` lets it be shared by
//! returning its existing ref unchanged.
//!
//! Written copies are normalized: the capacity field of a serialized
//! header equals the node's byte size, since a stream has no excess
//! capacity to describe.

use std::ptr;

use crate::alloc::{AllocError, Allocator, MemRef, Ref, SlabAlloc};
use crate::header;
use crate::tracing_helpers::trace_log;
use crate::writer::ArrayWriter;
use crate::Array;

impl<'a, A: Allocator> Array<'a, A> {
    /// Serialize this node into `out` and return its stream ref.
    ///
    /// With `only_if_modified`, an unmodified (read-only) node is not
    /// written at all; its current ref is returned for sharing. With
    /// `deep`, children are recursively written first and the written
    /// copy points at their stream refs.
    pub fn write(
        &self,
        out: &mut dyn ArrayWriter,
        deep: bool,
        only_if_modified: bool,
    ) -> Result<Ref, AllocError> {
        debug_assert!(self.is_attached());

        if only_if_modified && self.allocator().is_read_only(self.get_ref()) {
            return Ok(self.get_ref());
        }

        if !deep || !self.has_refs() {
            return self.do_write_shallow(out);
        }

        self.do_write_deep(out, only_if_modified)
    }

    /// Same as [`write`](Self::write) with `deep = true`, for when no
    /// accessor is at hand.
    pub fn write_ref(
        node_ref: Ref,
        alloc: &A,
        out: &mut dyn ArrayWriter,
        only_if_modified: bool,
    ) -> Result<Ref, AllocError> {
        if only_if_modified && alloc.is_read_only(node_ref) {
            return Ok(node_ref);
        }

        let mut array = Array::new(alloc);
        array.init_from_ref(node_ref);
        if !array.has_refs() {
            return array.do_write_shallow(out);
        }
        array.do_write_deep(out, only_if_modified)
    }

    fn do_write_shallow(&self, out: &mut dyn ArrayWriter) -> Result<Ref, AllocError> {
        // Exactly get_byte_size() bytes, capacity normalized.
        let byte_size = self.get_byte_size();
        let mut buf = vec![0u8; byte_size];
        unsafe {
            ptr::copy_nonoverlapping(self.header_ptr().cast_const(), buf.as_mut_ptr(), byte_size);
            header::set_capacity(buf.as_mut_ptr(), byte_size);
        }
        out.write(&buf)
    }

    fn do_write_deep(
        &self,
        out: &mut dyn ArrayWriter,
        only_if_modified: bool,
    ) -> Result<Ref, AllocError> {
        trace_log!("deep write: ref {}", self.get_ref());

        // Rebuild the node in scratch space with each child ref
        // replaced by its stream ref; stream refs can be wider than the
        // originals, so the scratch node re-adapts its width.
        let scratch = SlabAlloc::new();
        let mut copy = Array::new(&scratch);
        copy.create_with(self.get_type(), self.get_context_flag(), 0, 0)?;

        for i in 0..self.size() {
            let value = self.get(i);
            if value != 0 && value & 1 == 0 {
                let child_ref = Self::write_ref(value as Ref, self.allocator(), out, only_if_modified)?;
                copy.add(child_ref as i64)?;
            } else {
                copy.add(value)?;
            }
        }

        let result = copy.do_write_shallow(out);
        copy.destroy();
        result
    }

    /// Construct a complete copy of this node (children included) in
    /// `target`, returning the copy's memory.
    pub fn clone_deep<B: Allocator>(&self, target: &B) -> Result<MemRef, AllocError> {
        debug_assert!(self.is_attached());
        clone_ref(self.get_ref(), self.allocator(), target)
    }
}

/// Deep-copy the node behind `node_ref` from `alloc` into `target`.
pub(crate) fn clone_ref<A: Allocator, B: Allocator>(
    node_ref: Ref,
    alloc: &A,
    target: &B,
) -> Result<MemRef, AllocError> {
    let src_header = alloc.translate(node_ref).cast_const();

    if !unsafe { header::get_hasrefs(src_header) } {
        // Leaf payloads copy verbatim.
        let byte_size = unsafe { header::get_byte_size_from_header(src_header) };
        let mem = target.alloc(byte_size)?;
        unsafe {
            ptr::copy_nonoverlapping(src_header, mem.addr, byte_size);
            header::set_capacity(mem.addr, byte_size);
        }
        return Ok(mem);
    }

    let mut src = Array::new(alloc);
    src.init_from_ref(node_ref);

    let mut copy = Array::new(target);
    copy.create_with(src.get_type(), src.get_context_flag(), 0, 0)?;
    for i in 0..src.size() {
        let value = src.get(i);
        if value != 0 && value & 1 == 0 {
            let child = clone_ref(value as Ref, alloc, target)?;
            copy.add(child.node_ref as i64)?;
        } else {
            copy.add(value)?;
        }
    }
    Ok(copy.get_mem())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::StreamAlloc;
    use crate::header::NodeType;
    use crate::writer::MemWriter;

    #[test]
    fn shallow_roundtrip_preserves_header_and_payload() {
        let alloc = SlabAlloc::new();
        let mut a = Array::new(&alloc);
        a.create(NodeType::Normal).unwrap();
        for v in [5, -17, 300, 0] {
            a.add(v).unwrap();
        }

        let mut out = MemWriter::new();
        let stream_ref = a.write(&mut out, false, false).unwrap();

        let mapped = StreamAlloc::new(out.into_stream());
        let b = Array::attach(&mapped, stream_ref);
        assert_eq!(b.size(), 4);
        assert_eq!(b.width(), a.width());
        assert!(!b.has_refs());
        for i in 0..4 {
            assert_eq!(b.get(i), a.get(i));
        }
    }

    #[test]
    fn deep_write_rewrites_child_refs() {
        let alloc = SlabAlloc::new();

        let mut leaf_a = Array::new(&alloc);
        leaf_a.create(NodeType::Normal).unwrap();
        leaf_a.add(1).unwrap();
        leaf_a.add(2).unwrap();

        let mut leaf_b = Array::new(&alloc);
        leaf_b.create(NodeType::Normal).unwrap();
        leaf_b.add(-40_000).unwrap();

        let mut root = Array::new(&alloc);
        root.create(NodeType::HasRefs).unwrap();
        root.add(leaf_a.get_ref() as i64).unwrap();
        root.add(leaf_b.get_ref() as i64).unwrap();
        root.add_ref_or_tagged(crate::RefOrTagged::make_tagged(9)).unwrap();

        let mut out = MemWriter::new();
        let root_stream_ref = root.write(&mut out, true, false).unwrap();

        let mapped = StreamAlloc::new(out.into_stream());
        let r = Array::attach(&mapped, root_stream_ref);
        assert_eq!(r.size(), 3);
        assert!(r.has_refs());

        let a = Array::attach(&mapped, r.get_as_ref(0));
        assert_eq!((a.get(0), a.get(1)), (1, 2));

        let b = Array::attach(&mapped, r.get_as_ref(1));
        assert_eq!(b.get(0), -40_000);

        let t = r.get_as_ref_or_tagged(2);
        assert!(t.is_tagged());
        assert_eq!(t.get_as_int(), 9);
    }

    #[test]
    fn only_if_modified_shares_committed_nodes() {
        let alloc = SlabAlloc::new();
        let mut a = Array::new(&alloc);
        a.create(NodeType::Normal).unwrap();
        a.add(11).unwrap();
        alloc.set_read_only(a.get_ref(), true);

        let mut out = MemWriter::new();
        let r = a.write(&mut out, true, true).unwrap();
        assert_eq!(r, a.get_ref());
        assert_eq!(out.len(), 8); // nothing was appended
    }

    #[test]
    fn clone_deep_into_fresh_allocator() {
        let alloc = SlabAlloc::new();

        let mut leaf = Array::new(&alloc);
        leaf.create(NodeType::Normal).unwrap();
        for v in [7, 8, 9] {
            leaf.add(v).unwrap();
        }

        let mut root = Array::new(&alloc);
        root.create(NodeType::HasRefs).unwrap();
        root.add(leaf.get_ref() as i64).unwrap();

        let target = SlabAlloc::new();
        let mem = root.clone_deep(&target).unwrap();

        let r = Array::attach(&target, mem.node_ref);
        assert!(r.has_refs());
        let l = Array::attach(&target, r.get_as_ref(0));
        assert_eq!(
            (0..3).map(|i| l.get(i)).collect::<Vec<_>>(),
            vec![7, 8, 9]
        );

        // Fully disjoint trees: destroying the copy leaves the original.
        let mut r2 = Array::attach(&target, mem.node_ref);
        r2.destroy_deep();
        assert_eq!(root.get_as_ref(0), leaf.get_ref());
        assert_eq!(leaf.get(0), 7);
    }
}
