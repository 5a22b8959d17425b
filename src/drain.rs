//! The drain loops: root marking, heap marking, self-preemption, credit
//! flushing, and the partial-deadlock drain mode that refuses to yield until
//! blocked-fiber reclamation has swept through.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bitflags::bitflags;

use crate::assist::gc_flush_bg_credit;
use crate::config::DeadlockPolicy;
use crate::context::CollectorContext;
use crate::controller::GC_CREDIT_SLACK;
use crate::fiber::{resume, suspend, FiberState, WaitReason};
use crate::reclaim::gc_fiber_exit;
use crate::report::trace_root_drain;
use crate::roots::{ROOT_BLOCK_BYTES, ROOT_FINALIZERS, ROOT_FREE_STACKS};
use crate::scan::{scan_block, scan_object, wb_buf_flush, ONE_PTR_MASK};
use crate::stackscan::scan_stack;
use crate::tagging::untag;
use crate::workqueue::GcWork;
use crate::heap::{PAGES_PER_ARENA, PAGES_PER_SPAN_ROOT};

/// Units of scan work between self-preemption checks.
pub const DRAIN_CHECK_THRESHOLD: i64 = 100_000;

bitflags! {
    /// Modes of [`gc_drain`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DrainFlags: u32 {
        /// Return when the worker's fiber has a preempt request.
        const UNTIL_PREEMPT = 1 << 0;
        /// Flush scan-work credit to the background pool as it accumulates.
        const FLUSH_BG_CREDIT = 1 << 1;
        /// Self-preempt when the scheduler has other work.
        const IDLE = 1 << 2;
        /// Self-preempt when the fractional worker's quota expires.
        const FRACTIONAL = 1 << 3;
        /// Draining blocked-fiber reclamation: ignore every stop condition
        /// until the sweep completes.
        const PARTIAL_DEADLOCK = 1 << 4;
    }
}

/// Claim the next root job by compare-and-swap. `markroot_next` never exceeds
/// `markroot_jobs` and every index is claimed exactly once.
pub fn update_markroot_next(ctx: &CollectorContext) -> Option<u32> {
    let work = &ctx.root_work;
    let mut next = work.markroot_next.load(Ordering::Acquire);
    while next < work.markroot_jobs.load(Ordering::Acquire) {
        match work.markroot_next.compare_exchange(
            next,
            next + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return Some(next),
            Err(observed) => next = observed,
        }
    }
    None
}

/// Whether any marking work remains that a worker could pick up.
pub fn mark_work_available(ctx: &CollectorContext) -> bool {
    ctx.work_lists.has_full()
        || ctx.root_work.markroot_next.load(Ordering::Acquire)
            < ctx.root_work.markroot_jobs.load(Ordering::Acquire)
}

/// Scan the `shard`'th 256 KiB block of `[b0, b0+n0)` with `ptrmask`.
fn mark_root_block(
    b0: usize,
    n0: usize,
    ptrmask: &[u8],
    ctx: &CollectorContext,
    gcw: &mut GcWork,
    shard: usize,
) -> i64 {
    let off = shard * ROOT_BLOCK_BYTES;
    if off >= n0 {
        return 0;
    }
    let b = b0 + off;
    let mask = &ptrmask[shard * (ROOT_BLOCK_BYTES / (8 * 8))..];
    let n = ROOT_BLOCK_BYTES.min(n0 - off);
    scan_block(b, n, mask, ctx, gcw, None);
    n as i64
}

/// Mark span finalizer specials for one shard of the arena snapshot.
fn mark_root_spans(ctx: &CollectorContext, gcw: &mut GcWork, shard: usize) {
    let sg = ctx.heap.sweepgen.load(Ordering::Acquire);
    let shards_per_arena = PAGES_PER_ARENA / PAGES_PER_SPAN_ROOT;
    let arenas = ctx.root_work.mark_arenas();
    let ai = arenas[shard / shards_per_arena];
    let arena = ctx.heap.arena(ai);
    let arena_page = (shard * PAGES_PER_SPAN_ROOT) % PAGES_PER_ARENA;

    let specials_bits = &arena.page_specials[arena_page / 8..arena_page / 8 + PAGES_PER_SPAN_ROOT / 8];
    for (i, byte) in specials_bits.iter().enumerate() {
        let specials = byte.load(Ordering::Acquire);
        if specials == 0 {
            continue;
        }
        for j in 0..8 {
            if specials & (1 << j) == 0 {
                continue;
            }
            let page = arena_page + i * 8 + j;
            let span = arena
                .span_at_page(page)
                .expect("specials bit set on a page with no span");

            // The span must have been swept before its specials are walked.
            let span_sg = span.sweepgen.load(Ordering::Acquire);
            if !(span_sg == sg || span_sg == sg + 3) {
                panic!("gc: unswept span (sweepgen {span_sg}, want {sg})");
            }

            let specials = span.specials.lock();
            for special in specials.iter() {
                // A finalizer can be set for an inner byte; find the object
                // beginning.
                let p = span.base() + special.offset / span.elem_size() * span.elem_size();

                // Mark everything reachable from the object, but not the
                // object itself: it must stay collectable.
                if !span.is_noscan() {
                    scan_object(p, ctx, gcw);
                }

                // The finalizer closure slot is itself a root.
                let slot = &special.fn_slot as *const _ as usize;
                scan_block(slot, 8, &ONE_PTR_MASK, ctx, gcw, None);
            }
        }
    }
}

/// Scan the `i`'th root job. Returns the scan work produced; with
/// `FLUSH_BG_CREDIT` the credit is also pushed to the background pool.
pub fn mark_root(ctx: &CollectorContext, gcw: &mut GcWork, i: u32, flags: DrainFlags) -> i64 {
    let work = &ctx.root_work;
    let flush_bg_credit = flags.contains(DrainFlags::FLUSH_BG_CREDIT);
    let base_data = work.base_data.load(Ordering::Acquire);
    let base_bss = work.base_bss.load(Ordering::Acquire);
    let base_spans = work.base_spans.load(Ordering::Acquire);
    let base_stacks = work.base_stacks.load(Ordering::Acquire);
    let base_end = work.base_end.load(Ordering::Acquire);

    let mut work_done = 0i64;
    let mut work_counter = None;

    if i >= base_data && i < base_bss {
        work_counter = Some(&ctx.controller.globals_scan_work);
        for module in ctx.modules.read().iter() {
            work_done += mark_root_block(
                module.data.base(),
                module.data.len_bytes(),
                module.data.ptrmask(),
                ctx,
                gcw,
                (i - base_data) as usize,
            );
        }
    } else if i >= base_bss && i < base_spans {
        work_counter = Some(&ctx.controller.globals_scan_work);
        for module in ctx.modules.read().iter() {
            work_done += mark_root_block(
                module.bss.base(),
                module.bss.len_bytes(),
                module.bss.ptrmask(),
                ctx,
                gcw,
                (i - base_bss) as usize,
            );
        }
    } else if i == ROOT_FINALIZERS {
        for block in ctx.finalizers.lock().iter() {
            for slot in block.slots() {
                scan_block(slot, 8, &ONE_PTR_MASK, ctx, gcw, None);
            }
        }
    } else if i == ROOT_FREE_STACKS {
        ctx.fibers.free_pooled_stacks();
    } else if i >= base_spans && i < base_stacks {
        mark_root_spans(ctx, gcw, (i - base_spans) as usize);
    } else {
        // The rest is stack roots.
        work_counter = Some(&ctx.controller.stack_scan_work);
        if i < base_stacks || i >= base_end {
            panic!("markroot: bad index {i} not in stack roots range [{base_stacks}, {base_end})");
        }
        let roots = work.stack_roots();
        let slot = roots.slots[(i - base_stacks) as usize].load(Ordering::Acquire);
        let desc = untag(slot);
        let fiber = ctx
            .fibers
            .by_descriptor(desc)
            .unwrap_or_else(|| panic!("markroot: no fiber for descriptor {desc:#x}"));

        // Remember when the fiber was first observed blocked, for reports.
        let state = fiber.state();
        if (state == FiberState::Waiting || state == FiberState::Syscall)
            && fiber.waitsince.load(Ordering::Acquire) == 0
        {
            fiber
                .waitsince
                .store(work.tstart.load(Ordering::Acquire), Ordering::Release);
        }

        // Draining as part of partial deadlock detection.
        if state == FiberState::Unreachable {
            match ctx.config.deadlock_policy {
                DeadlockPolicy::Reclaim => {
                    gc_fiber_exit(ctx, &fiber);
                }
                DeadlockPolicy::Report => {
                    if fiber.cas_state(FiberState::Unreachable, FiberState::Deadlocked) {
                        ctx.counters.reported.fetch_add(1, Ordering::AcqRel);
                    }
                }
                DeadlockPolicy::Disabled => {
                    panic!(
                        "unreachable fiber {} found during regular GC",
                        fiber.id()
                    );
                }
            }
        }

        // Self-scan guard: if this worker is running on the fiber it wants to
        // scan, park it around the scan to prevent a self-deadlock.
        let self_scan = gcw
            .current_fiber
            .as_ref()
            .map(|current| Arc::ptr_eq(current, &fiber) && current.state() == FiberState::Running)
            .unwrap_or(false);
        if self_scan {
            fiber.cas_to_waiting(FiberState::Running, WaitReason::GcScan);
        }

        let stopped = suspend(&fiber, flags.contains(DrainFlags::PARTIAL_DEADLOCK));
        if stopped.dead {
            fiber.scan_done.store(true, Ordering::Release);
        } else {
            if fiber.scan_done.load(Ordering::Acquire) {
                panic!("fiber {} already scanned", fiber.id());
            }
            work_done += scan_stack(&fiber, ctx, gcw);
            fiber.scan_done.store(true, Ordering::Release);
            resume(stopped);
        }

        if self_scan {
            let backoff = crossbeam_utils::Backoff::new();
            while !fiber.cas_state(FiberState::Waiting, FiberState::Running) {
                backoff.snooze();
            }
        }
    }

    if let Some(counter) = work_counter {
        if work_done != 0 {
            counter.fetch_add(work_done, Ordering::AcqRel);
            if flush_bg_credit {
                gc_flush_bg_credit(ctx, work_done);
            }
        }
    }
    work_done
}

fn stop_requested(ctx: &CollectorContext, gcw: &GcWork, preemptible: bool) -> bool {
    let preempt = gcw
        .current_fiber
        .as_ref()
        .map(|f| f.preempt_requested())
        .unwrap_or(false);
    preempt && (preemptible || ctx.sched.gc_waiting.load(Ordering::Acquire))
}

/// Blacken grey objects until there is no more work, self-preempting per the
/// mode flags. Under `PARTIAL_DEADLOCK`, stop conditions are ignored so the
/// worker completes the reclamation sweep without yielding.
pub fn gc_drain(ctx: &CollectorContext, gcw: &mut GcWork, flags: DrainFlags) {
    if !ctx.controller.barrier_enabled() {
        panic!("gcDrain phase incorrect");
    }

    let preemptible = flags.contains(DrainFlags::UNTIL_PREEMPT);
    let flush_bg_credit = flags.contains(DrainFlags::FLUSH_BG_CREDIT);
    let partial = flags.contains(DrainFlags::PARTIAL_DEADLOCK);
    let idle = flags.contains(DrainFlags::IDLE);
    let fractional = flags.contains(DrainFlags::FRACTIONAL);

    let mut init_scan_work = gcw.heap_scan_work;
    let mut check_work = i64::MAX;
    let poll: Option<fn(&CollectorContext) -> bool> = if idle {
        check_work = init_scan_work + DRAIN_CHECK_THRESHOLD;
        Some(|ctx| ctx.sched.poll_work())
    } else if fractional {
        check_work = init_scan_work + DRAIN_CHECK_THRESHOLD;
        Some(|ctx| ctx.sched.poll_fractional_worker_exit())
    } else {
        None
    };

    let mut bail = false;

    // Drain root marking jobs.
    let work = &ctx.root_work;
    if work.markroot_next.load(Ordering::Acquire) < work.markroot_jobs.load(Ordering::Acquire) {
        trace_root_drain(
            &ctx.config,
            work.markroot_next.load(Ordering::Acquire),
            work.markroot_jobs.load(Ordering::Acquire),
            work.n_valid_stack_roots.load(Ordering::Acquire),
            work.n_stack_roots.load(Ordering::Acquire),
        );
        // Stop for preemption or a pending STW; continue unconditionally when
        // draining partial deadlocks.
        while partial || !stop_requested(ctx, gcw, preemptible) {
            let Some(job) = update_markroot_next(ctx) else {
                break;
            };
            mark_root(ctx, gcw, job, flags);
            if let Some(poll) = poll {
                if poll(ctx) {
                    if partial {
                        break;
                    }
                    bail = true;
                    break;
                }
            }
        }
    }

    // Drain heap marking jobs.
    if !bail {
        while partial || !stop_requested(ctx, gcw, preemptible) {
            // Keep work available on the global queue for other workers.
            if !ctx.work_lists.has_full() {
                gcw.balance();
            }

            let mut b = gcw.try_get_fast();
            if b.is_none() {
                b = gcw.try_get();
                if b.is_none() {
                    // Flushing the write barrier buffer may create more work.
                    wb_buf_flush(ctx, gcw);
                    b = gcw.try_get();
                }
            }
            let Some(b) = b else {
                break;
            };
            scan_object(b, ctx, gcw);

            // Flush accumulated credit so mutator assists can draw on it.
            if gcw.heap_scan_work >= GC_CREDIT_SLACK {
                ctx.controller
                    .heap_scan_work
                    .fetch_add(gcw.heap_scan_work, Ordering::AcqRel);
                if flush_bg_credit {
                    gc_flush_bg_credit(ctx, gcw.heap_scan_work - init_scan_work);
                    init_scan_work = 0;
                }
                check_work -= gcw.heap_scan_work;
                gcw.heap_scan_work = 0;

                if check_work <= 0 {
                    check_work += DRAIN_CHECK_THRESHOLD;
                    if let Some(poll) = poll {
                        if poll(ctx) && !partial {
                            break;
                        }
                    }
                }
            }
        }
    }

    // Flush remaining scan work credit.
    if gcw.heap_scan_work > 0 {
        ctx.controller
            .heap_scan_work
            .fetch_add(gcw.heap_scan_work, Ordering::AcqRel);
        if flush_bg_credit {
            gc_flush_bg_credit(ctx, gcw.heap_scan_work - init_scan_work);
        }
        gcw.heap_scan_work = 0;
    }
}

/// Blacken grey objects until roughly `scan_work` units are performed or the
/// worker's fiber is preempted. Falls back to root jobs when the heap queue
/// is empty. Returns the work performed.
pub fn gc_drain_n(ctx: &CollectorContext, gcw: &mut GcWork, scan_work: i64) -> i64 {
    if !ctx.controller.barrier_enabled() {
        panic!("gcDrainN phase incorrect");
    }

    // Don't claim work that was already on the worker.
    let mut work_flushed = -gcw.heap_scan_work;

    loop {
        let preempted = gcw
            .current_fiber
            .as_ref()
            .map(|f| f.preempt_requested())
            .unwrap_or(false);
        if preempted
            || ctx.controller.limiter.limiting()
            || work_flushed + gcw.heap_scan_work >= scan_work
        {
            break;
        }

        if !ctx.work_lists.has_full() {
            gcw.balance();
        }

        let mut b = gcw.try_get_fast();
        if b.is_none() {
            b = gcw.try_get();
            if b.is_none() {
                wb_buf_flush(ctx, gcw);
                b = gcw.try_get();
            }
        }
        match b {
            None => {
                // Try to do a root job instead.
                match update_markroot_next(ctx) {
                    Some(job) => {
                        work_flushed += mark_root(ctx, gcw, job, DrainFlags::empty());
                        continue;
                    }
                    None => break,
                }
            }
            Some(b) => {
                scan_object(b, ctx, gcw);
                if gcw.heap_scan_work >= GC_CREDIT_SLACK {
                    ctx.controller
                        .heap_scan_work
                        .fetch_add(gcw.heap_scan_work, Ordering::AcqRel);
                    work_flushed += gcw.heap_scan_work;
                    gcw.heap_scan_work = 0;
                }
            }
        }
    }

    work_flushed + gcw.heap_scan_work
}

/// Drain wrapper for idle-priority workers.
pub fn drain_mark_worker_idle(ctx: &CollectorContext, gcw: &mut GcWork) {
    gc_drain(
        ctx,
        gcw,
        DrainFlags::IDLE | DrainFlags::UNTIL_PREEMPT | DrainFlags::FLUSH_BG_CREDIT,
    );
}

/// Drain wrapper for dedicated workers.
pub fn drain_mark_worker_dedicated(ctx: &CollectorContext, gcw: &mut GcWork, until_preempt: bool) {
    let mut flags = DrainFlags::FLUSH_BG_CREDIT;
    if until_preempt {
        flags |= DrainFlags::UNTIL_PREEMPT;
    }
    gc_drain(ctx, gcw, flags);
}

/// Drain wrapper for fractional workers.
pub fn drain_mark_worker_fractional(ctx: &CollectorContext, gcw: &mut GcWork) {
    gc_drain(
        ctx,
        gcw,
        DrainFlags::FRACTIONAL | DrainFlags::UNTIL_PREEMPT | DrainFlags::FLUSH_BG_CREDIT,
    );
}

/// Drain wrapper for the partial-deadlock reclamation sweep.
pub fn drain_mark_worker_partial_deadlocks(ctx: &CollectorContext, gcw: &mut GcWork) {
    gc_drain(
        ctx,
        gcw,
        DrainFlags::FLUSH_BG_CREDIT | DrainFlags::PARTIAL_DEADLOCK,
    );
}
