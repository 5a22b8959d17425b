//! Stack scanning: precise and conservative frame scans, defer and panic
//! chain scanning, stack-object discovery, and the optional shrink.
//!
//! The caller must hold the fiber's `SCAN` bit (via `suspend`) and must not be
//! scanning its own stack; `markroot` enforces both.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::context::CollectorContext;
use crate::fiber::{Fiber, FiberState, SCAN};
use crate::report::status_string;
use crate::scan::{scan_block, scan_conservative, ONE_PTR_MASK};
use crate::stack::{materialize_gcprog, FiberStack, FrameDesc, FrameKind, PtrRepr};
use crate::workqueue::GcWork;

/// A stack object discovered during frame scanning. `repr` is taken when the
/// object is scanned so it is never scanned twice.
struct StackObj {
    off: usize,
    size_bytes: usize,
    ptr_words: usize,
    repr: Option<PtrRepr>,
}

/// Scan state threaded through one stack scan: the pointer queues (precise
/// preferred over conservative), the discovered stack objects, and the flag
/// that forces the next frame conservative.
pub struct StackScanState {
    stack_lo: usize,
    stack_hi: usize,
    precise: VecDeque<usize>,
    conserv: VecDeque<usize>,
    objects: Vec<StackObj>,
    index_built: bool,
    /// Scan the next frame conservatively (it holds the registers of an
    /// async-preempted or debug-called parent).
    pub conservative: bool,
}

impl StackScanState {
    pub fn new(stack_lo: usize, stack_hi: usize) -> Self {
        Self {
            stack_lo,
            stack_hi,
            precise: VecDeque::new(),
            conserv: VecDeque::new(),
            objects: Vec::new(),
            index_built: false,
            conservative: false,
        }
    }

    pub fn in_stack(&self, p: usize) -> bool {
        p >= self.stack_lo && p < self.stack_hi
    }

    /// Queue a possible pointer to a stack object.
    pub fn put_ptr(&mut self, p: usize, conservative: bool) {
        if conservative {
            self.conserv.push_back(p);
        } else {
            self.precise.push_back(p);
        }
    }

    /// Next queued pointer, preferring precise pointers so stack objects are
    /// scanned precisely when possible.
    fn get_ptr(&mut self) -> Option<(usize, bool)> {
        if let Some(p) = self.precise.pop_front() {
            return Some((p, false));
        }
        self.conserv.pop_front().map(|p| (p, true))
    }

    fn add_object(&mut self, addr: usize, size_words: usize, ptr_words: usize, repr: PtrRepr) {
        debug_assert!(!self.index_built);
        self.objects.push(StackObj {
            off: addr - self.stack_lo,
            size_bytes: size_words * 8,
            ptr_words,
            repr: Some(repr),
        });
    }

    fn build_index(&mut self) {
        self.objects.sort_by_key(|o| o.off);
        self.index_built = true;
    }

    /// Take the layout of the unscanned object containing `p`, if any.
    fn take_object(&mut self, p: usize) -> Option<(usize, usize, PtrRepr)> {
        debug_assert!(self.index_built);
        let off = p.checked_sub(self.stack_lo)?;
        let pos = self.objects.partition_point(|o| o.off <= off);
        let obj = self.objects.get_mut(pos.checked_sub(1)?)?;
        if off >= obj.off + obj.size_bytes {
            return None;
        }
        let repr = obj.repr.take()?;
        Some((obj.off, obj.ptr_words, repr))
    }
}

/// Whether it is safe to move (shrink) the fiber's stack right now.
pub fn is_shrink_stack_safe(fiber: &Fiber) -> bool {
    !fiber.async_safe_point.load(Ordering::Acquire)
        && !fiber.parking_on_chan.load(Ordering::Acquire)
        && fiber.stack.lock().syscall_sp_off.is_none()
}

/// Scan `fiber`'s stack, greying every pointer found. Returns the scan work
/// performed (bytes between the saved sp and the top of the stack).
///
/// Deliberately does not flush background credit: flushing could wake a
/// fiber that was just scanned, which can self-deadlock. Callers flush.
pub fn scan_stack(fiber: &Arc<Fiber>, ctx: &CollectorContext, gcw: &mut GcWork) -> i64 {
    let raw = fiber.read_status();
    if raw & SCAN == 0 {
        panic!(
            "scanstack: fiber {} status {} lacks scan bit",
            fiber.id(),
            status_string(raw)
        );
    }
    match FiberState::from_raw(raw) {
        FiberState::Dead => return 0,
        FiberState::Running => {
            panic!("scanstack: fiber {} not stopped", fiber.id());
        }
        FiberState::Runnable | FiberState::Syscall | FiberState::Waiting | FiberState::Deadlocked => {}
        other => {
            panic!(
                "scanstack: fiber {} in unexpected state {other:?}",
                fiber.id()
            );
        }
    }
    if let Some(current) = &gcw.current_fiber {
        if Arc::ptr_eq(current, fiber) {
            panic!("can't scan our own stack");
        }
    }

    // Shrink before taking any addresses; otherwise schedule one for the next
    // synchronous safe point.
    if is_shrink_stack_safe(fiber) {
        fiber.stack.lock().shrink();
    } else {
        fiber.preempt_shrink.store(true, Ordering::Release);
    }

    let stack = fiber.stack.lock();
    if stack.released() {
        return 0;
    }
    let lo = stack.lo();
    let hi = stack.hi();
    let sp = stack.scan_sp();
    let scanned = (hi - sp) as i64;

    let mut state = StackScanState::new(lo, hi);

    // The saved context register is effectively a live register spilled
    // without a barrier; scan its slot as a single pointer.
    if stack.ctxt != 0 {
        let slot = &stack.ctxt as *const usize as usize;
        scan_block(slot, 8, &ONE_PTR_MASK, ctx, gcw, Some(&mut state));
    }

    // Unwind the frames, innermost first.
    for frame in &stack.frames {
        scan_frame(frame, &stack, &mut state, ctx, gcw);
    }

    // Defer records weave between the stack and the heap; scan their closure
    // slots and keep heap-allocated records live.
    {
        let defers = fiber.defers.lock();
        for defer in defers.iter() {
            if defer.fn_obj != 0 {
                let slot = &defer.fn_obj as *const usize as usize;
                scan_block(slot, 8, &ONE_PTR_MASK, ctx, gcw, Some(&mut state));
            }
            if defer.heap && defer.record_obj != 0 {
                let slot = &defer.record_obj as *const usize as usize;
                scan_block(slot, 8, &ONE_PTR_MASK, ctx, gcw, Some(&mut state));
            }
        }
    }
    // Panic records are always stack allocated.
    {
        let panics = fiber.panics.lock();
        if let Some(record) = panics.last() {
            if record.obj != 0 {
                state.put_ptr(record.obj, false);
            }
        }
    }

    // Drain the stack-object queue.
    state.build_index();
    while let Some((p, conservative)) = state.get_ptr() {
        let Some((off, ptr_words, repr)) = state.take_object(p) else {
            continue;
        };
        if ctx.config.stack_trace_debug {
            tracing::debug!(
                addr = lo + off,
                conservative,
                "live stack object"
            );
        }
        // Large stack objects carry a compact program; materialize a
        // temporary bitmap, scan, then drop it.
        let bitmap = match repr {
            PtrRepr::Bitmap(bits) => bits,
            PtrRepr::GcProg(prog) => materialize_gcprog(&prog, ptr_words),
        };
        let b = lo + off;
        if conservative {
            scan_conservative(b, ptr_words * 8, Some(&bitmap), ctx, gcw, Some(&mut state));
        } else {
            scan_block(b, ptr_words * 8, &bitmap, ctx, gcw, Some(&mut state));
        }
    }

    scanned
}

/// Scan one frame: locals and arguments, precisely when the frame carries
/// bitmaps, conservatively for async-preempt and debug-call frames (and the
/// one frame above them).
fn scan_frame(
    frame: &FrameDesc,
    stack: &FiberStack,
    state: &mut StackScanState,
    ctx: &CollectorContext,
    gcw: &mut GcWork,
) {
    let is_async_preempt = frame.kind == FrameKind::AsyncPreempt;
    let is_debug_call = frame.kind == FrameKind::DebugCall;

    if state.conservative || is_async_preempt || is_debug_call {
        if ctx.config.debug_scan_conservative {
            tracing::debug!(sp_off = frame.sp_off, "conservatively scanning frame");
        }

        // Unlike the precise case this includes the outgoing argument space,
        // since the frame may have been interrupted mid call setup.
        if frame.varp_off != 0 && frame.sp_off > frame.varp_off {
            let size = (frame.sp_off - frame.varp_off) * 8;
            scan_conservative(
                stack.addr_of(frame.sp_off),
                size,
                None,
                ctx,
                gcw,
                Some(state),
            );
        }
        if frame.args_words > 0 {
            scan_conservative(
                stack.addr_of(frame.argp_off),
                frame.args_words * 8,
                None,
                ctx,
                gcw,
                Some(state),
            );
        }

        // The conservative flag covers exactly one frame above the preempt
        // frame.
        state.conservative = is_async_preempt || is_debug_call;
        return;
    }

    if frame.locals_words > 0 {
        scan_block(
            stack.addr_of(frame.varp_off + frame.locals_words),
            frame.locals_words * 8,
            &frame.locals_bitmap,
            ctx,
            gcw,
            Some(state),
        );
    }
    if frame.args_words > 0 {
        scan_block(
            stack.addr_of(frame.argp_off),
            frame.args_words * 8,
            &frame.args_bitmap,
            ctx,
            gcw,
            Some(state),
        );
    }

    // Record the frame's stack objects; pointers to them found during block
    // scans queue them for scanning.
    if frame.varp_off != 0 {
        let frame_sp = stack.addr_of(frame.sp_off);
        for obj in &frame.objects {
            let ptr = stack.addr_of(obj.base_off);
            if ptr < frame_sp {
                // Not allocated in the frame yet.
                continue;
            }
            if ctx.config.stack_trace_debug {
                tracing::debug!(addr = ptr, size = obj.size_words * 8, "stack object");
            }
            state.add_object(ptr, obj.size_words, obj.ptr_words, obj.repr.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CollectorContext;
    use crate::fiber::{suspend, WaitReason};
    use crate::stack::StackObjectDesc;

    fn parked(ctx: &CollectorContext) -> Arc<Fiber> {
        let fiber = ctx.spawn_fiber(256);
        fiber.cas_state(FiberState::Runnable, FiberState::Waiting);
        fiber.set_wait_reason(WaitReason::ChanReceive);
        fiber
    }

    #[test]
    fn precise_frame_scan_follows_bitmaps() {
        let ctx = CollectorContext::new_for_testing();
        let mut gcw = ctx.new_worker();
        let target = ctx.heap.allocate(2, &[0], true);
        let decoy = ctx.heap.allocate(2, &[0], true);

        let fiber = parked(&ctx);
        {
            let mut stack = fiber.stack.lock();
            // One frame, two locals: word closest below varp is a pointer,
            // the next is scalar garbage that happens to look like one.
            stack.set_word(9, target);
            stack.set_word(10, decoy);
            stack.push_frame(FrameDesc {
                sp_off: 12,
                varp_off: 8,
                argp_off: 0,
                locals_words: 2,
                locals_bitmap: vec![0b10],
                args_words: 0,
                args_bitmap: vec![],
                kind: FrameKind::Normal,
                objects: vec![],
            });
        }

        let suspended = suspend(&fiber, false);
        assert!(!suspended.dead);
        let scanned = scan_stack(&fiber, &ctx, &mut gcw);
        crate::fiber::resume(suspended);

        assert!(scanned > 0);
        assert!(ctx.heap.is_marked_addr(target));
        assert!(!ctx.heap.is_marked_addr(decoy));
    }

    #[test]
    fn conservative_frames_cover_one_parent() {
        let ctx = CollectorContext::new_for_testing();
        let mut gcw = ctx.new_worker();
        let from_preempt = ctx.heap.allocate(2, &[0], true);
        let from_parent = ctx.heap.allocate(2, &[0], true);

        let fiber = parked(&ctx);
        {
            let mut stack = fiber.stack.lock();
            stack.set_word(19, from_preempt);
            stack.push_frame(FrameDesc {
                sp_off: 20,
                varp_off: 16,
                argp_off: 0,
                locals_words: 0,
                locals_bitmap: vec![],
                args_words: 0,
                args_bitmap: vec![],
                kind: FrameKind::AsyncPreempt,
                objects: vec![],
            });
            // Parent frame with no bitmaps at all; only the conservative
            // carry-over finds its pointer.
            stack.set_word(13, from_parent);
            stack.push_frame(FrameDesc {
                sp_off: 16,
                varp_off: 12,
                argp_off: 0,
                locals_words: 0,
                locals_bitmap: vec![],
                args_words: 0,
                args_bitmap: vec![],
                kind: FrameKind::Normal,
                objects: vec![],
            });
        }

        let suspended = suspend(&fiber, false);
        scan_stack(&fiber, &ctx, &mut gcw);
        crate::fiber::resume(suspended);

        assert!(ctx.heap.is_marked_addr(from_preempt));
        assert!(ctx.heap.is_marked_addr(from_parent));
    }

    #[test]
    fn stack_objects_prefer_precise_pointers() {
        let ctx = CollectorContext::new_for_testing();
        let mut gcw = ctx.new_worker();
        let target = ctx.heap.allocate(2, &[0], true);

        let fiber = parked(&ctx);
        let obj_addr;
        {
            let mut stack = fiber.stack.lock();
            // A 2-word stack object at offset 24 whose first word points to
            // the heap.
            stack.set_word(24, target);
            stack.set_word(23, 0);
            obj_addr = stack.addr_of(24);
            // A frame local holds a precise pointer to the stack object.
            stack.set_word(9, obj_addr);
            stack.push_frame(FrameDesc {
                sp_off: 26,
                varp_off: 8,
                argp_off: 0,
                locals_words: 1,
                locals_bitmap: vec![0b1],
                args_words: 0,
                args_bitmap: vec![],
                kind: FrameKind::Normal,
                objects: vec![StackObjectDesc {
                    base_off: 24,
                    size_words: 2,
                    ptr_words: 2,
                    repr: PtrRepr::Bitmap(vec![0b01]),
                }],
            });
        }

        let suspended = suspend(&fiber, false);
        scan_stack(&fiber, &ctx, &mut gcw);
        crate::fiber::resume(suspended);

        assert!(ctx.heap.is_marked_addr(target));
    }

    #[test]
    fn gcprog_objects_materialize_a_bitmap() {
        let ctx = CollectorContext::new_for_testing();
        let mut gcw = ctx.new_worker();
        let target = ctx.heap.allocate(2, &[0], true);

        let fiber = parked(&ctx);
        {
            let mut stack = fiber.stack.lock();
            stack.set_word(40, target);
            let obj_addr = stack.addr_of(40);
            stack.set_word(9, obj_addr);
            stack.push_frame(FrameDesc {
                sp_off: 48,
                varp_off: 8,
                argp_off: 0,
                locals_words: 1,
                locals_bitmap: vec![0b1],
                args_words: 0,
                args_bitmap: vec![],
                kind: FrameKind::Normal,
                objects: vec![StackObjectDesc {
                    base_off: 40,
                    size_words: 16,
                    ptr_words: 16,
                    repr: PtrRepr::GcProg(vec![1, 0b1, 1, 0]),
                }],
            });
        }

        let suspended = suspend(&fiber, false);
        scan_stack(&fiber, &ctx, &mut gcw);
        crate::fiber::resume(suspended);

        assert!(ctx.heap.is_marked_addr(target));
    }

    #[test]
    fn defer_chain_slots_are_roots() {
        let ctx = CollectorContext::new_for_testing();
        let mut gcw = ctx.new_worker();
        let closure = ctx.heap.allocate(2, &[0], true);
        let record = ctx.heap.allocate(4, &[0], true);

        let fiber = parked(&ctx);
        fiber.push_defer(crate::fiber::DeferRecord {
            fn_obj: closure,
            record_obj: record,
            heap: true,
            action: None,
        });

        let suspended = suspend(&fiber, false);
        scan_stack(&fiber, &ctx, &mut gcw);
        crate::fiber::resume(suspended);

        assert!(ctx.heap.is_marked_addr(closure));
        assert!(ctx.heap.is_marked_addr(record));
    }

    #[test]
    fn shrink_happens_when_safe_and_is_deferred_otherwise() {
        let ctx = CollectorContext::new_for_testing();
        let mut gcw = ctx.new_worker();

        let fiber = parked(&ctx);
        {
            let mut stack = fiber.stack.lock();
            stack.sp_off = 4;
        }
        let (hi, lo) = { let s = fiber.stack.lock(); (s.hi(), s.lo()) };
        let words_before = hi - lo;

        let suspended = suspend(&fiber, false);
        scan_stack(&fiber, &ctx, &mut gcw);
        crate::fiber::resume(suspended);
        let (hi, lo) = { let s = fiber.stack.lock(); (s.hi(), s.lo()) };
        let words_after = hi - lo;
        assert!(words_after < words_before, "mostly-idle stack must shrink");

        // A fiber mid chan-park must not have its stack moved.
        let busy = parked(&ctx);
        busy.parking_on_chan.store(true, Ordering::Release);
        {
            let mut stack = busy.stack.lock();
            stack.sp_off = 4;
        }
        let (hi, lo) = { let s = busy.stack.lock(); (s.hi(), s.lo()) };
        let before = hi - lo;
        let suspended = suspend(&busy, false);
        scan_stack(&busy, &ctx, &mut gcw);
        crate::fiber::resume(suspended);
        let (hi, lo) = { let s = busy.stack.lock(); (s.hi(), s.lo()) };
        let after = hi - lo;
        assert_eq!(before, after);
        assert!(busy.preempt_shrink.load(Ordering::Acquire));
    }
}
