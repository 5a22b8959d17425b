//! Reclamation of unreachable fibers: run their defers under a synthetic
//! forced-exit record, surgically remove them from every wait structure they
//! are parked on, and transition them to `DEAD` exactly as an explicit exit
//! would.
//!
//! Runs on a mark worker during the partial-deadlock drain, never on the
//! reclaimed fiber's own stack.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::context::CollectorContext;
use crate::fiber::{Fiber, FiberState, PanicRecord, WaitReason};
use crate::report::trace_reclaim;
use crate::tagging::untag;

/// Unwind an unreachable fiber the way an explicit exit would: push a
/// synthetic forced-exit panic record so any recover along the defer chain
/// observes the forced-exit sentinel, pop and run every defer, then tear the
/// fiber down.
pub fn gc_fiber_exit(ctx: &CollectorContext, fiber: &Arc<Fiber>) {
    fiber
        .panics
        .lock()
        .push(PanicRecord { forced_exit: true, obj: 0 });

    loop {
        let record = fiber.defers.lock().pop();
        let Some(record) = record else { break };
        if let Some(action) = record.action {
            let forced_exit_active = fiber
                .panics
                .lock()
                .last()
                .map(|p| p.forced_exit)
                .unwrap_or(false);
            action(forced_exit_active);
        }
    }

    fiber_exit_teardown(ctx, fiber);
}

/// The teardown half: status transition, wait-structure dequeues, field
/// reset, and return to the free-fiber pool.
fn fiber_exit_teardown(ctx: &CollectorContext, fiber: &Arc<Fiber>) {
    if fiber.state() != FiberState::Unreachable {
        panic!(
            "unreachable fiber {} changed status during reclaim",
            fiber.id()
        );
    }
    trace_reclaim(&ctx.config, fiber);

    if !fiber.cas_state(FiberState::Unreachable, FiberState::Dead) {
        panic!("fiber {} status raced during reclaim", fiber.id());
    }

    let stack_size = {
        let stack = fiber.stack.lock();
        stack.size_bytes() as i64
    };
    ctx.controller.add_scannable_stack(-stack_size);
    if fiber.system {
        ctx.fibers.nsys.fetch_sub(1, Ordering::AcqRel);
    }
    if fiber.locked_thread.load(Ordering::Acquire) {
        panic!("unreachable fiber {} has locked a thread", fiber.id());
    }

    // Dequeue from the semaphore treap.
    let sema = fiber.waiting_sema.load(Ordering::Acquire);
    if sema != 0 {
        let addr = untag(sema);
        let root = ctx.sema.root_for(addr);
        // The key is tagged exactly as stored at park time: only a fiber
        // blocked on a tagged wait word can be flagged unreachable.
        let waiter = root.dequeue_fiber(sema, fiber.descriptor());
        if waiter.fiber_descriptor() != fiber.descriptor() {
            panic!("sema dequeue targeted the wrong waiter");
        }
        waiter.clear_fiber();
        ctx.waiter_pool.release(waiter);
    }

    // Dequeue from the notifier list.
    let notifier = fiber.waiting_notifier.load(Ordering::Acquire);
    if notifier != 0 {
        let addr = untag(notifier);
        let list = ctx
            .notifiers
            .get(&addr)
            .map(|e| Arc::clone(e.value()))
            .unwrap_or_else(|| panic!("fiber {} waiting on unknown notifier", fiber.id()));
        let waiter = list
            .dequeue_fiber(fiber.descriptor())
            .unwrap_or_else(|| panic!("fiber {} not found in its notifier list", fiber.id()));
        if waiter.fiber_descriptor() != fiber.descriptor() {
            panic!("notifier dequeue targeted the wrong waiter");
        }
        waiter.clear_fiber();
        ctx.waiter_pool.release(waiter);
    }

    // Release the channel waiters, dropping each from its wait queue.
    {
        let mut waiting = fiber.waiting.lock();
        for waiter in waiting.drain(..) {
            let chan = waiter.chan.load(Ordering::Acquire);
            if chan != 0 {
                if let Some(waitq) = ctx.chans.get(chan) {
                    waitq.remove(&waiter);
                }
            }
            waiter.clear_fiber();
            ctx.waiter_pool.release(waiter);
        }
    }

    // Blank-slate the fiber before pooling it.
    fiber.locked_thread.store(false, Ordering::Release);
    fiber.scan_done.store(false, Ordering::Release);
    fiber.preempt.store(false, Ordering::Release);
    fiber.preempt_shrink.store(false, Ordering::Release);
    fiber.async_safe_point.store(false, Ordering::Release);
    fiber.parking_on_chan.store(false, Ordering::Release);
    fiber.active_stack_chans.store(false, Ordering::Release);
    fiber.set_wait_reason(WaitReason::Zero);
    fiber.waitsince.store(0, Ordering::Release);
    fiber.waiting_sema.store(0, Ordering::Release);
    fiber.waiting_notifier.store(0, Ordering::Release);
    fiber.param.store(0, Ordering::Release);
    fiber.labels.store(0, Ordering::Release);
    fiber.timer.store(0, Ordering::Release);
    fiber.panics.lock().clear();
    fiber.defers.lock().clear();

    // Flush any positive assist credit to the pool; it informs pacing when
    // the application churns through fibers.
    if ctx.controller.blacken_enabled() && fiber.assist_bytes() > 0 {
        let assist_work_per_byte = ctx.controller.assist_work_per_byte();
        let scan_credit = (assist_work_per_byte * fiber.assist_bytes() as f64) as i64;
        ctx.controller
            .bg_scan_credit
            .fetch_add(scan_credit, Ordering::AcqRel);
        fiber.assist_bytes.store(0, Ordering::Release);
    }

    ctx.counters.reclaimed.fetch_add(1, Ordering::AcqRel);
    ctx.fibers.free_put(Arc::clone(fiber));
}
