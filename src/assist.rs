//! Mutator assists: debt and credit accounting, stealing from the background
//! pool, the park/wake queue, and CPU limiter coupling.
//!
//! Allocation charges a fiber's assist budget; once the balance goes
//! negative the fiber must perform (or steal) scan work before allocating
//! more. Fibers that cannot pay park on the assist queue and are satisfied
//! FIFO by background credit flushes, with the head partially credited and
//! rotated to the tail so large assists cannot starve small ones.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{now_nanos, CollectorContext};
use crate::controller::{GC_ASSIST_TIME_SLACK, GC_OVER_ASSIST_WORK};
use crate::drain::{gc_drain_n, mark_work_available};
use crate::fiber::{Fiber, FiberState, WaitReason};

/// FIFO of fibers parked waiting for assist credit.
pub struct AssistQueue {
    q: Mutex<VecDeque<Arc<Fiber>>>,
}

impl AssistQueue {
    pub fn new() -> Self {
        Self {
            q: Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.q.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.q.lock().len()
    }
}

impl Default for AssistQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Perform GC work to make `fiber`'s assist balance positive. The fiber must
/// be the calling mutator, in the running state, with preemption enabled.
pub fn gc_assist_alloc(ctx: &CollectorContext, fiber: &Arc<Fiber>) {
    loop {
        if ctx.controller.limiter.limiting() {
            // Intentionally skip assisting to reduce GC CPU time.
            return;
        }

        // Compute the work needed to go positive, over-assisting so small
        // debts amortize.
        let assist_work_per_byte = ctx.controller.assist_work_per_byte();
        let assist_bytes_per_work = ctx.controller.assist_bytes_per_work();
        let mut debt_bytes = -fiber.assist_bytes();
        let mut scan_work = (assist_work_per_byte * debt_bytes as f64) as i64;
        if scan_work < GC_OVER_ASSIST_WORK {
            scan_work = GC_OVER_ASSIST_WORK;
            debt_bytes = (assist_bytes_per_work * scan_work as f64) as i64;
        }

        // Steal what we can from background credit. This is racy and may
        // drive the pool briefly negative; steals just fail until credit
        // accumulates again.
        let bg_scan_credit = ctx.controller.bg_scan_credit.load(Ordering::Acquire);
        if bg_scan_credit > 0 {
            let stolen;
            if bg_scan_credit < scan_work {
                stolen = bg_scan_credit;
                fiber.assist_bytes.fetch_add(
                    1 + (assist_bytes_per_work * stolen as f64) as i64,
                    Ordering::AcqRel,
                );
            } else {
                stolen = scan_work;
                fiber.assist_bytes.fetch_add(debt_bytes, Ordering::AcqRel);
            }
            ctx.controller
                .bg_scan_credit
                .fetch_sub(stolen, Ordering::AcqRel);
            scan_work -= stolen;
            if scan_work == 0 {
                return;
            }
        }

        gc_assist_alloc1(ctx, fiber, scan_work);
        let completed = fiber.param.swap(0, Ordering::AcqRel) != 0;
        if completed {
            ctx.controller.signal_mark_done();
        }

        if fiber.assist_bytes() < 0 {
            // Could not pay off the debt. If preempted, yield and retry;
            // otherwise park until background credit satisfies us.
            if fiber.preempt_requested() {
                fiber.set_preempt(false);
                std::thread::yield_now();
                continue;
            }
            if !gc_park_assist(ctx, fiber) {
                continue;
            }
            // Either background credit satisfied the debt or the cycle is
            // over with the debt forgiven.
        }
        return;
    }
}

/// The drain half of an assist; kept separate so the caller's frame holds no
/// references across the drain.
fn gc_assist_alloc1(ctx: &CollectorContext, fiber: &Arc<Fiber>, scan_work: i64) {
    fiber.param.store(0, Ordering::Release);

    if !ctx.controller.blacken_enabled() {
        // The cycle ended; forgive the remaining debt.
        fiber.assist_bytes.store(0, Ordering::Release);
        return;
    }

    let start = now_nanos();
    ctx.controller.dec_nwait();

    // The drain requires a preemptible caller.
    fiber.cas_to_waiting(FiberState::Running, WaitReason::GcAssistMarking);

    let mut gcw = ctx.new_worker();
    gcw.current_fiber = Some(Arc::clone(fiber));
    let work_done = gc_drain_n(ctx, &mut gcw, scan_work);
    gcw.dispose(&ctx.controller);

    let backoff = crossbeam_utils::Backoff::new();
    while !fiber.cas_state(FiberState::Waiting, FiberState::Running) {
        backoff.snooze();
    }

    // Credit the fiber for the work done. The "1 +" rounds up so credit
    // lands even when bytes-per-work is tiny.
    let assist_bytes_per_work = ctx.controller.assist_bytes_per_work();
    fiber.assist_bytes.fetch_add(
        1 + (assist_bytes_per_work * work_done as f64) as i64,
        Ordering::AcqRel,
    );

    // If this was the last worker and there is no work left, signal the
    // completion point through the fiber's sentinel slot.
    let incnwait = ctx.controller.inc_nwait();
    if incnwait == ctx.controller.nproc && !mark_work_available(ctx) {
        fiber.param.store(1, Ordering::Release);
    }

    let duration = now_nanos().saturating_sub(start) as i64;
    if duration > GC_ASSIST_TIME_SLACK {
        ctx.controller.limiter.update(duration);
    }
}

/// Park the fiber on the assist queue. Reports whether the assist is now
/// satisfied; false means the caller must retry.
fn gc_park_assist(ctx: &CollectorContext, fiber: &Arc<Fiber>) -> bool {
    let mut q = ctx.assist_queue.q.lock();
    // If the cycle finished while taking the lock, the debt is forgiven.
    if !ctx.controller.blacken_enabled() {
        return true;
    }

    q.push_back(Arc::clone(fiber));

    // Recheck for credit now that we're queued; background marking may have
    // flushed more since the caller checked.
    if ctx.controller.bg_scan_credit.load(Ordering::Acquire) > 0 {
        q.pop_back();
        return false;
    }

    fiber.cas_to_waiting(FiberState::Running, WaitReason::GcAssistWait);
    drop(q);
    fiber.park_wait();
    let backoff = crossbeam_utils::Backoff::new();
    while !fiber.cas_state(FiberState::Runnable, FiberState::Running) {
        backoff.snooze();
    }
    true
}

/// Flush `scan_work` units of background credit: satisfy parked assists
/// FIFO first, then bank the rest in the background pool.
pub fn gc_flush_bg_credit(ctx: &CollectorContext, scan_work: i64) {
    if ctx.assist_queue.is_empty() {
        // Fast path: no blocked assists. A racing park will catch the next
        // flush.
        ctx.controller
            .bg_scan_credit
            .fetch_add(scan_work, Ordering::AcqRel);
        return;
    }

    let assist_bytes_per_work = ctx.controller.assist_bytes_per_work();
    let mut scan_bytes = (scan_work as f64 * assist_bytes_per_work) as i64;

    let mut q = ctx.assist_queue.q.lock();
    while scan_bytes > 0 {
        let Some(fiber) = q.pop_front() else {
            break;
        };
        // The fiber's balance is negative; think carefully about signs.
        let debt = fiber.assist_bytes();
        if scan_bytes + debt >= 0 {
            // Satisfy the entire debt and wake the fiber. It must not jump
            // the scheduler queue on the worker's priority.
            scan_bytes += debt;
            fiber.assist_bytes.store(0, Ordering::Release);
            fiber.ready();
        } else {
            // Partially satisfy the head and rotate it to the back so large
            // assists cannot clog the queue.
            fiber.assist_bytes.fetch_add(scan_bytes, Ordering::AcqRel);
            scan_bytes = 0;
            q.push_back(fiber);
            break;
        }
    }

    if scan_bytes > 0 {
        // Convert the leftover back to work units.
        let assist_work_per_byte = ctx.controller.assist_work_per_byte();
        let leftover = (scan_bytes as f64 * assist_work_per_byte) as i64;
        ctx.controller
            .bg_scan_credit
            .fetch_add(leftover, Ordering::AcqRel);
    }
}

/// Wake every blocked assist. Called at the end of a cycle, after blackening
/// is disabled so no new assists park.
pub fn gc_wake_all_assists(ctx: &CollectorContext) {
    let mut q = ctx.assist_queue.q.lock();
    while let Some(fiber) = q.pop_front() {
        fiber.assist_bytes.store(0, Ordering::Release);
        fiber.ready();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CollectorContext;

    fn running_fiber(ctx: &CollectorContext) -> Arc<Fiber> {
        let fiber = ctx.spawn_fiber(64);
        assert!(fiber.cas_state(FiberState::Runnable, FiberState::Running));
        fiber
    }

    #[test]
    fn steal_from_background_credit_pays_the_debt() {
        let ctx = CollectorContext::new_for_testing();
        ctx.controller.set_blacken_enabled(true);
        ctx.controller.set_barrier_enabled(true);
        ctx.controller.set_assist_ratio(0.5);
        ctx.controller
            .bg_scan_credit
            .store(1 << 30, Ordering::Release);

        let fiber = running_fiber(&ctx);
        fiber.charge_allocation(1 << 20);
        assert!(fiber.assist_bytes() < 0);

        gc_assist_alloc(&ctx, &fiber);
        assert!(fiber.assist_bytes() >= 0);
    }

    #[test]
    fn limiter_skips_assist_entirely() {
        let ctx = CollectorContext::new_for_testing();
        ctx.controller.set_blacken_enabled(true);
        ctx.controller.set_assist_ratio(0.5);
        ctx.controller.limiter.set_limiting(true);

        let fiber = running_fiber(&ctx);
        fiber.charge_allocation(4096);
        let debt = fiber.assist_bytes();
        gc_assist_alloc(&ctx, &fiber);
        // Skipped: no work, no credit, debt untouched.
        assert_eq!(fiber.assist_bytes(), debt);
    }

    #[test]
    fn assist_with_blackening_off_forgives_debt() {
        let ctx = CollectorContext::new_for_testing();
        ctx.controller.set_assist_ratio(0.5);
        let fiber = running_fiber(&ctx);
        fiber.charge_allocation(4096);
        gc_assist_alloc(&ctx, &fiber);
        assert_eq!(fiber.assist_bytes(), 0);
    }

    #[test]
    fn flush_satisfies_assists_fifo_and_rotates_the_head() {
        let ctx = CollectorContext::new_for_testing();
        ctx.controller.set_blacken_enabled(true);
        ctx.controller.set_assist_ratio(1.0);

        let small = ctx.spawn_fiber(64);
        small.assist_bytes.store(-100, Ordering::Release);
        small.cas_state(FiberState::Runnable, FiberState::Waiting);
        small.set_wait_reason(WaitReason::GcAssistWait);

        let large = ctx.spawn_fiber(64);
        large.assist_bytes.store(-1_000_000, Ordering::Release);
        large.cas_state(FiberState::Runnable, FiberState::Waiting);
        large.set_wait_reason(WaitReason::GcAssistWait);

        {
            let mut q = ctx.assist_queue.q.lock();
            q.push_back(Arc::clone(&small));
            q.push_back(Arc::clone(&large));
        }

        // Enough to satisfy the small assist and part of the large one.
        gc_flush_bg_credit(&ctx, 200);

        assert_eq!(small.assist_bytes(), 0);
        assert_eq!(small.state(), FiberState::Runnable);
        assert!(large.assist_bytes() > -1_000_000);
        assert_eq!(large.state(), FiberState::Waiting);
        // The partially satisfied head went back to the queue.
        assert_eq!(ctx.assist_queue.len(), 1);
    }

    #[test]
    fn flush_banks_credit_when_queue_empty() {
        let ctx = CollectorContext::new_for_testing();
        ctx.controller.set_assist_ratio(1.0);
        gc_flush_bg_credit(&ctx, 512);
        assert_eq!(ctx.controller.bg_scan_credit.load(Ordering::Acquire), 512);
    }

    #[test]
    fn wake_all_assists_forgives_and_readies() {
        let ctx = CollectorContext::new_for_testing();
        let fiber = ctx.spawn_fiber(64);
        fiber.assist_bytes.store(-5000, Ordering::Release);
        fiber.cas_state(FiberState::Runnable, FiberState::Waiting);
        fiber.set_wait_reason(WaitReason::GcAssistWait);
        ctx.assist_queue.q.lock().push_back(Arc::clone(&fiber));

        gc_wake_all_assists(&ctx);
        assert_eq!(fiber.state(), FiberState::Runnable);
        assert_eq!(fiber.assist_bytes(), 0);
        assert!(ctx.assist_queue.is_empty());
    }
}
