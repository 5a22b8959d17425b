//! Heap scanning: object and oblet scans, bitmap-driven block scans,
//! conservative scans, and the greying primitive everything funnels into.
//!
//! The deadlock tag is enforced here: a tagged word encountered while
//! scanning a heap object aborts the scan of that object immediately, so the
//! marker can never discover a blocked fiber (or anything reachable only
//! through one) by tracing a wait structure.

use crate::context::CollectorContext;
use crate::heap::{read_word, write_word, Span, PTR_SIZE};
use crate::stackscan::StackScanState;
use crate::tagging::is_tagged;
use crate::workqueue::GcWork;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Maximum bytes of an object scanned as one work unit. Larger objects split
/// into oblets so scan preemption stays bounded.
pub const MAX_OBLET_BYTES: usize = 128 << 10;

/// Pointer mask for an allocation holding a single pointer.
pub static ONE_PTR_MASK: [u8; 1] = [1];

/// Render an object's neighborhood for fatal diagnostics.
pub fn dump_object(ctx: &CollectorContext, label: &str, obj: usize, off: usize) -> String {
    let mut out = format!("{label}={obj:#x}");
    let Some(span) = ctx.heap.span_of(obj) else {
        out.push_str(" span=nil");
        return out;
    };
    out.push_str(&format!(
        " span.base={:#x} span.limit={:#x} span.elemsize={}",
        span.base(),
        span.limit(),
        span.elem_size()
    ));
    let size = span.elem_size().min(32 * PTR_SIZE);
    for i in (0..size).step_by(PTR_SIZE) {
        out.push_str(&format!("\n *({label}+{i}) = {:#x}", read_word(obj + i)));
        if i == off {
            out.push_str(" <==");
        }
    }
    out
}

/// Mark `obj` grey if it is not already marked, queueing it for scanning.
/// Noscan objects are fast-tracked to black instead of being queued.
/// `base` and `off` say where the pointer was found and feed diagnostics.
pub fn grey_object(
    ctx: &CollectorContext,
    gcw: &mut GcWork,
    obj: usize,
    base: usize,
    off: usize,
    span: &Arc<Span>,
    idx: usize,
) {
    if obj % PTR_SIZE != 0 {
        panic!("greyobject: obj {obj:#x} not pointer-aligned");
    }
    let mbits = span.mark_bits_for_index(idx);

    if ctx.config.check_mark && span.is_free(idx) {
        panic!(
            "marking free object {obj:#x} found at *({base:#x}+{off:#x})\n{}\n{}",
            dump_object(ctx, "base", base, off),
            dump_object(ctx, "obj", obj, usize::MAX),
        );
    }

    if mbits.is_marked() {
        return;
    }
    mbits.set_marked();

    // Mark the span's page.
    let (arena, page_byte, page_mask) = ctx.heap.page_index_of(span);
    if arena.page_marks[page_byte].load(Ordering::Acquire) & page_mask == 0 {
        arena.page_marks[page_byte].fetch_or(page_mask, Ordering::AcqRel);
    }

    if span.is_noscan() {
        gcw.bytes_marked += span.elem_size() as u64;
        return;
    }

    if !gcw.put_fast(obj) {
        gcw.put(obj);
    }
}

/// Shade the object containing `b`, if `b` is a heap pointer.
pub fn shade(ctx: &CollectorContext, gcw: &mut GcWork, b: usize) {
    if let Some((obj, span, idx)) = ctx.heap.find_object(b, 0, 0) {
        grey_object(ctx, gcw, obj, 0, 0, &span, idx);
    }
}

/// Store through the write barrier: the destination is shaded whenever the
/// barrier is enabled, per the Dijkstra-style contract.
pub fn barrier_store(ctx: &CollectorContext, gcw: &mut GcWork, slot: usize, val: usize) {
    if ctx.controller.barrier_enabled() && val != 0 {
        gcw.wb_buf.push(val);
    }
    write_word(slot, val);
}

/// Drain the worker's write-barrier buffer into grey marks. May create more
/// work.
pub fn wb_buf_flush(ctx: &CollectorContext, gcw: &mut GcWork) {
    let pending = std::mem::take(&mut gcw.wb_buf);
    for p in pending {
        shade(ctx, gcw, p);
    }
}

/// Scan the object (or oblet) starting at `b`, greying everything it points
/// to. Consults the span's pointer bitmap for which words hold pointers.
pub fn scan_object(b: usize, ctx: &CollectorContext, gcw: &mut GcWork) {
    let span = ctx
        .heap
        .span_of(b)
        .unwrap_or_else(|| panic!("scanobject of non-heap address {b:#x}"));
    let mut n = span.elem_size();
    if n == 0 {
        panic!("scanobject n == 0");
    }
    if span.is_noscan() {
        // Correctness-wise this would be ok, but noscan objects must never be
        // queued in the first place.
        panic!("scanobject of a noscan object");
    }

    if n > MAX_OBLET_BYTES {
        // Large object. Break into oblets for better parallelism.
        if b == span.base() {
            let mut oblet = b + MAX_OBLET_BYTES;
            while oblet < span.base() + span.elem_size() {
                if !gcw.put_fast(oblet) {
                    gcw.put(oblet);
                }
                oblet += MAX_OBLET_BYTES;
            }
        }
        n = (span.base() + span.elem_size() - b).min(MAX_OBLET_BYTES);
    }

    let mut scan_size = 0usize;
    let mut i = 0usize;
    while i < n {
        let word = (b + i - span.base()) / PTR_SIZE;
        if !span.ptr_bit(word) {
            i += PTR_SIZE;
            continue;
        }
        // Track the farthest pointer found so heap scan work reflects the
        // scanned prefix.
        scan_size = i + PTR_SIZE;

        let obj = read_word(b + i);
        // Quickly filter out nil and pointers back into the current object.
        if obj != 0 && obj.wrapping_sub(b) >= n {
            if is_tagged(obj) {
                // A fenced pointer to a blocked fiber: drop the rest of this
                // object without marking anything through it.
                return;
            }
            if let Some((found, fspan, idx)) = ctx.heap.find_object(obj, b, i) {
                grey_object(ctx, gcw, found, b, i, &fspan, idx);
            }
        }
        i += PTR_SIZE;
    }
    gcw.bytes_marked += n as u64;
    gcw.heap_scan_work += scan_size as i64;
}

/// Scan the block `[b0, b0+n0)` with an explicit pointer bitmap. Used for
/// non-heap roots (globals, finalizer slots, stack words), so it does not
/// update heap scan accounting. Possible stack pointers are reported to
/// `stk` when present.
pub fn scan_block(
    b0: usize,
    n0: usize,
    ptrmask: &[u8],
    ctx: &CollectorContext,
    gcw: &mut GcWork,
    mut stk: Option<&mut StackScanState>,
) {
    let mut i = 0usize;
    while i < n0 {
        let mut bits = ptrmask[i / (PTR_SIZE * 8)] as u32;
        if bits == 0 {
            i += PTR_SIZE * 8;
            continue;
        }
        let mut j = 0;
        while j < 8 && i < n0 {
            if bits & 1 != 0 {
                let p = read_word(b0 + i);
                if p != 0 {
                    if let Some((obj, span, idx)) = ctx.heap.find_object(p, b0, i) {
                        grey_object(ctx, gcw, obj, b0, i, &span, idx);
                    } else if let Some(state) = stk.as_deref_mut() {
                        if state.in_stack(p) {
                            state.put_ptr(p, false);
                        }
                    }
                }
            }
            bits >>= 1;
            i += PTR_SIZE;
            j += 1;
        }
    }
}

/// Scan `[b, b+n)` conservatively, treating any value that resolves to an
/// allocated heap object as a pointer. With `state` present, values landing
/// inside the stack extent are queued as conservative stack-object pointers.
pub fn scan_conservative(
    b: usize,
    n: usize,
    ptrmask: Option<&[u8]>,
    ctx: &CollectorContext,
    gcw: &mut GcWork,
    mut state: Option<&mut StackScanState>,
) {
    if ctx.config.debug_scan_conservative {
        tracing::debug!(base = b, len = n, "conservatively scanning block");
    }

    let mut i = 0usize;
    while i < n {
        if let Some(mask) = ptrmask {
            let word = i / PTR_SIZE;
            let bits = mask[word / 8];
            if bits == 0 {
                if i % (PTR_SIZE * 8) != 0 {
                    panic!("misaligned mask");
                }
                i += PTR_SIZE * 8;
                continue;
            }
            if bits >> (word % 8) & 1 == 0 {
                i += PTR_SIZE;
                continue;
            }
        }

        let val = read_word(b + i);

        if let Some(st) = state.as_deref_mut() {
            if st.in_stack(val) {
                // May be a stack object; it could be dead from a prior cycle,
                // so it must be scanned defensively too.
                st.put_ptr(val, true);
                i += PTR_SIZE;
                continue;
            }
        }

        let Some(span) = ctx.heap.span_of_heap(val) else {
            i += PTR_SIZE;
            continue;
        };
        let idx = span.object_index(val);
        if span.is_free(idx) {
            i += PTR_SIZE;
            continue;
        }

        let obj = span.base_of_index(idx);
        grey_object(ctx, gcw, obj, b, i, &span, idx);
        i += PTR_SIZE;
    }
}

/// Mark a newly allocated object black. It must not contain non-nil pointers
/// yet.
pub fn mark_new_object(ctx: &CollectorContext, gcw: &mut GcWork, obj: usize) {
    let (_, span, idx) = ctx
        .heap
        .find_object(obj, 0, 0)
        .unwrap_or_else(|| panic!("gcmarknewobject of non-heap address {obj:#x}"));
    span.mark_bits_for_index(idx).set_marked();
    let (arena, page_byte, page_mask) = ctx.heap.page_index_of(&span);
    if arena.page_marks[page_byte].load(Ordering::Acquire) & page_mask == 0 {
        arena.page_marks[page_byte].fetch_or(page_mask, Ordering::AcqRel);
    }
    gcw.bytes_marked += span.elem_size() as u64;
}

/// Grey the worker's pending tiny allocation block, if any. The world must be
/// stopped.
pub fn gc_mark_tiny_allocs(ctx: &CollectorContext, gcw: &mut GcWork) {
    ctx.fibers.assert_world_stopped();
    let tiny = gcw.tiny;
    if tiny == 0 {
        return;
    }
    if let Some((obj, span, idx)) = ctx.heap.find_object(tiny, 0, 0) {
        grey_object(ctx, gcw, obj, 0, 0, &span, idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CollectorContext;

    fn ctx() -> CollectorContext {
        CollectorContext::new_for_testing()
    }

    #[test]
    fn grey_object_is_idempotent_on_the_queue() {
        let ctx = ctx();
        let mut gcw = ctx.new_worker();
        let obj = ctx.heap.allocate(4, &[0], false);
        let (base, span, idx) = ctx.heap.find_object(obj, 0, 0).unwrap();

        grey_object(&ctx, &mut gcw, base, 0, 0, &span, idx);
        grey_object(&ctx, &mut gcw, base, 0, 0, &span, idx);

        assert_eq!(gcw.try_get(), Some(base));
        assert_eq!(gcw.try_get(), None, "second grey must be a no-op");
        assert!(span.mark_bits_for_index(idx).is_marked());
    }

    #[test]
    fn noscan_objects_fast_track_to_black() {
        let ctx = ctx();
        let mut gcw = ctx.new_worker();
        let obj = ctx.heap.allocate(4, &[0], true);
        let (base, span, idx) = ctx.heap.find_object(obj, 0, 0).unwrap();
        grey_object(&ctx, &mut gcw, base, 0, 0, &span, idx);
        assert!(span.mark_bits_for_index(idx).is_marked());
        assert_eq!(gcw.try_get(), None);
        assert_eq!(gcw.bytes_marked, span.elem_size() as u64);
    }

    #[test]
    fn scan_object_follows_pointer_mask() {
        let ctx = ctx();
        let mut gcw = ctx.new_worker();
        let target = ctx.heap.allocate(2, &[0], true);
        let decoy = ctx.heap.allocate(2, &[0], true);
        // Object with pointer words at offsets 0 and 2; offset 1 is scalar.
        let src = ctx.heap.allocate(4, &[0b0101], false);
        write_word(src, target);
        write_word(src + 8, decoy); // scalar slot: must be ignored
        write_word(src + 16, 0);

        scan_object(src, &ctx, &mut gcw);

        assert!(ctx.heap.is_marked_addr(target));
        assert!(!ctx.heap.is_marked_addr(decoy));
        assert!(gcw.heap_scan_work > 0);
    }

    #[test]
    fn scan_object_aborts_on_tagged_word() {
        let ctx = ctx();
        let mut gcw = ctx.new_worker();
        let before = ctx.heap.allocate(2, &[0], true);
        let after = ctx.heap.allocate(2, &[0], true);
        let src = ctx.heap.allocate(4, &[0b0111], false);
        write_word(src, before);
        write_word(src + 8, crate::tagging::TAG | 0x1000);
        write_word(src + 16, after);

        scan_object(src, &ctx, &mut gcw);

        // Words before the tagged slot are marked; nothing after it is, and
        // the tagged value itself is never dereferenced.
        assert!(ctx.heap.is_marked_addr(before));
        assert!(!ctx.heap.is_marked_addr(after));
    }

    #[test]
    fn oblet_split_covers_large_objects() {
        let ctx = ctx();
        let mut gcw = ctx.new_worker();
        // 512 KiB object with pointers at offsets 0 and 256 KiB.
        let words = (512 << 10) / PTR_SIZE;
        let mut mask = vec![0u8; words.div_ceil(8)];
        mask[0] = 1;
        let mid_word = (256 << 10) / PTR_SIZE;
        mask[mid_word / 8] |= 1 << (mid_word % 8);
        let big = ctx.heap.allocate(words, &mask, false);
        let t1 = ctx.heap.allocate(2, &[0], true);
        let t2 = ctx.heap.allocate(2, &[0], true);
        write_word(big, t1);
        write_word(big + (256 << 10), t2);

        // Scan the base: enqueues three oblets at 128 KiB increments.
        scan_object(big, &ctx, &mut gcw);
        let mut oblets = Vec::new();
        while let Some(o) = gcw.try_get() {
            oblets.push(o);
        }
        oblets.sort_unstable();
        assert_eq!(
            oblets,
            vec![
                big + MAX_OBLET_BYTES,
                big + 2 * MAX_OBLET_BYTES,
                big + 3 * MAX_OBLET_BYTES
            ]
        );

        // Scanning every oblet marks both targets, regardless of order.
        for oblet in oblets {
            scan_object(oblet, &ctx, &mut gcw);
        }
        assert!(ctx.heap.is_marked_addr(t1));
        assert!(ctx.heap.is_marked_addr(t2));
    }

    #[test]
    fn conservative_scan_skips_free_slots_and_non_heap_words() {
        let ctx = ctx();
        let mut gcw = ctx.new_worker();
        let live = ctx.heap.allocate(2, &[0], true);
        let buf = [live, 0xdead_0000usize, 12345usize];
        scan_conservative(
            buf.as_ptr() as usize,
            buf.len() * PTR_SIZE,
            None,
            &ctx,
            &mut gcw,
            None,
        );
        assert!(ctx.heap.is_marked_addr(live));
    }

    #[test]
    fn barrier_store_shades_on_flush() {
        let ctx = ctx();
        let mut gcw = ctx.new_worker();
        let target = ctx.heap.allocate(2, &[0], true);
        let slot_obj = ctx.heap.allocate(2, &[0b01], false);
        ctx.controller.set_barrier_enabled(true);

        barrier_store(&ctx, &mut gcw, slot_obj, target);
        assert!(!ctx.heap.is_marked_addr(target));
        wb_buf_flush(&ctx, &mut gcw);
        assert!(ctx.heap.is_marked_addr(target));
        assert_eq!(read_word(slot_obj), target);
    }

    #[test]
    fn tiny_alloc_block_is_greyed_under_stw() {
        let ctx = ctx();
        let mut gcw = ctx.new_worker();
        let tiny = ctx.heap.allocate(2, &[0], true);
        gcw.tiny = tiny;
        ctx.fibers.stop_the_world().unwrap();
        gc_mark_tiny_allocs(&ctx, &mut gcw);
        ctx.fibers.start_the_world();
        assert!(ctx.heap.is_marked_addr(tiny));
    }

    #[test]
    fn mark_new_object_blackens_without_queueing() {
        let ctx = ctx();
        let mut gcw = ctx.new_worker();
        let obj = ctx.heap.allocate(4, &[0b1111], false);
        mark_new_object(&ctx, &mut gcw, obj);
        assert!(ctx.heap.is_marked_addr(obj));
        assert_eq!(gcw.try_get(), None);
    }
}
