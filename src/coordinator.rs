//! The cycle driver: stop the world, enumerate roots, run the parallel mark
//! workers, resolve blocked fibers under a detecting policy, and finish the
//! cycle.
//!
//! Detection only classifies fibers that were already parked inside the
//! stop-the-world snapshot window, so a detecting cycle keeps the world
//! stopped through blocked-fiber resolution; a plain cycle restarts the world
//! right after root enumeration and marks concurrently.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::assist::gc_wake_all_assists;
use crate::config::GcConfig;
use crate::context::CollectorContext;
use crate::drain::{
    drain_mark_worker_dedicated, drain_mark_worker_partial_deadlocks, mark_work_available,
};
use crate::error::{GcError, GcResult};
use crate::fiber::FiberState;
use crate::roots::{gc_mark_root_check, gc_mark_root_prepare};
use crate::tagging::{is_tagged, untag};

/// Summary of one collection cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    pub root_jobs: u32,
    pub bytes_marked: u64,
    pub fibers_reclaimed: u64,
    pub fibers_reported: u64,
}

/// The collector: a context plus the worker pool that marks on its behalf.
pub struct Collector {
    ctx: Arc<CollectorContext>,
    pool: rayon::ThreadPool,
    workers: usize,
    cycle_lock: Mutex<()>,
}

impl Collector {
    pub fn new(config: GcConfig, workers: usize) -> Self {
        let workers = workers.max(1);
        let ctx = Arc::new(CollectorContext::new(config, workers as u32));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("gc-mark-{index}"))
            .build()
            .expect("failed to build mark worker pool");
        Self {
            ctx,
            pool,
            workers,
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn context(&self) -> &Arc<CollectorContext> {
        &self.ctx
    }

    /// Run one full mark cycle. Fails if another cycle is in flight or the
    /// world cannot be stopped.
    pub fn collect(&self) -> GcResult<CycleStats> {
        let _cycle = self.cycle_lock.try_lock().ok_or(GcError::CycleInProgress)?;
        let ctx = &self.ctx;
        let detecting = ctx.config.deadlock_policy.detecting();

        ctx.fibers.stop_the_world()?;
        ctx.root_work.cycles.fetch_add(1, Ordering::AcqRel);
        ctx.heap.begin_mark_cycle();
        ctx.controller.reset_for_cycle();
        ctx.counters.reset();

        gc_mark_root_prepare(ctx);
        ctx.controller.set_barrier_enabled(true);
        ctx.controller.set_blacken_enabled(true);

        if !detecting {
            // Plain cycle: mark concurrently with the mutators.
            ctx.fibers.start_the_world();
        }

        self.run_mark_workers();

        if detecting {
            self.resolve_blocked_fibers();
        }

        gc_mark_root_check(ctx);
        ctx.controller.set_blacken_enabled(false);
        gc_wake_all_assists(ctx);
        ctx.controller.set_barrier_enabled(false);

        if detecting {
            ctx.fibers.start_the_world();
        }

        Ok(CycleStats {
            root_jobs: ctx.root_work.markroot_jobs.load(Ordering::Acquire),
            bytes_marked: ctx.controller.bytes_marked.load(Ordering::Acquire),
            fibers_reclaimed: ctx.counters.reclaimed.load(Ordering::Acquire),
            fibers_reported: ctx.counters.reported.load(Ordering::Acquire),
        })
    }

    /// Run dedicated drains on every pool thread until no marking work
    /// remains anywhere.
    fn run_mark_workers(&self) {
        let ctx = &self.ctx;
        loop {
            self.pool.scope(|scope| {
                for _ in 0..self.workers {
                    scope.spawn(|_| {
                        let mut gcw = ctx.new_worker();
                        ctx.controller.dec_nwait();
                        loop {
                            drain_mark_worker_dedicated(ctx, &mut gcw, false);
                            if !mark_work_available(ctx) {
                                break;
                            }
                        }
                        gcw.dispose(&ctx.controller);
                        ctx.controller.inc_nwait();
                    });
                }
            });
            if !mark_work_available(ctx) {
                return;
            }
        }
    }

    /// Fixpoint over the blocked suffix: promote any blocked fiber whose
    /// descriptor the marker reached into the valid root range (untagged, so
    /// its stack is scanned normally), re-drain, and when nothing else
    /// becomes reachable flag the remainder `UNREACHABLE` so `markroot`
    /// applies the policy selector.
    fn resolve_blocked_fibers(&self) {
        let ctx = &self.ctx;
        let work = &ctx.root_work;
        let roots = work.stack_roots();
        let base_stacks = work.base_stacks.load(Ordering::Acquire);
        let n_total = work.n_stack_roots.load(Ordering::Acquire);
        let mut gcw = ctx.new_worker();

        loop {
            let mut promoted_end =
                (work.markroot_jobs.load(Ordering::Acquire) - base_stacks) as usize;

            // Promote blocked fibers the marker reached through live roots.
            let mut promoted = false;
            for i in promoted_end..n_total {
                let raw = roots.slots[i].load(Ordering::Acquire);
                if !is_tagged(raw) {
                    continue;
                }
                let desc = untag(raw);
                if ctx.heap.is_marked_addr(desc) {
                    let displaced = roots.slots[promoted_end].load(Ordering::Acquire);
                    roots.slots[i].store(displaced, Ordering::Release);
                    roots.slots[promoted_end].store(desc, Ordering::Release);
                    work.markroot_jobs.fetch_add(1, Ordering::AcqRel);
                    promoted_end += 1;
                    promoted = true;
                }
            }
            if promoted {
                drain_mark_worker_partial_deadlocks(ctx, &mut gcw);
                continue;
            }

            // Fixpoint: anything still tagged is reachable only from other
            // blocked fibers. That is the definition of a partial deadlock.
            let mut flagged = false;
            for i in promoted_end..n_total {
                let raw = roots.slots[i].load(Ordering::Acquire);
                if !is_tagged(raw) {
                    continue;
                }
                let desc = untag(raw);
                let fiber = ctx
                    .fibers
                    .by_descriptor(desc)
                    .unwrap_or_else(|| panic!("no fiber for blocked root {desc:#x}"));
                if !fiber.cas_state(FiberState::Waiting, FiberState::Unreachable) {
                    panic!(
                        "blocked fiber {} changed state during detection",
                        fiber.id()
                    );
                }
                let displaced = roots.slots[promoted_end].load(Ordering::Acquire);
                roots.slots[i].store(displaced, Ordering::Release);
                roots.slots[promoted_end].store(desc, Ordering::Release);
                work.markroot_jobs.fetch_add(1, Ordering::AcqRel);
                promoted_end += 1;
                flagged = true;
            }
            if !flagged {
                return;
            }
            drain_mark_worker_partial_deadlocks(ctx, &mut gcw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeadlockPolicy;
    use crate::fiber::WaitReason;
    use crate::heap::write_word;

    #[test]
    fn plain_cycle_marks_reachable_graph() {
        let collector = Collector::new(GcConfig::default(), 2);
        let ctx = collector.context();

        // Global slot -> a -> b.
        let b = ctx.heap.allocate(2, &[0], true);
        let a = ctx.heap.allocate(2, &[0b01], false);
        write_word(a, b);
        let unreferenced = ctx.heap.allocate(2, &[0], true);

        let mut data = crate::roots::GlobalRegion::new(8, vec![0b1]);
        data.set_word(0, a);
        ctx.modules.write().push(crate::roots::ModuleGlobals {
            data,
            bss: crate::roots::GlobalRegion::empty(),
        });

        let stats = collector.collect().unwrap();
        assert!(ctx.heap.is_marked_addr(a));
        assert!(ctx.heap.is_marked_addr(b));
        assert!(!ctx.heap.is_marked_addr(unreferenced));
        assert!(stats.root_jobs > 0);
        assert_eq!(stats.fibers_reclaimed, 0);
    }

    #[test]
    fn stack_roots_keep_fiber_referents_alive() {
        let collector = Collector::new(GcConfig::default(), 2);
        let ctx = collector.context();

        let target = ctx.heap.allocate(2, &[0], true);
        let fiber = ctx.spawn_fiber(128);
        {
            let mut stack = fiber.stack.lock();
            stack.set_word(9, target);
            stack.push_frame(crate::stack::FrameDesc {
                sp_off: 12,
                varp_off: 8,
                argp_off: 0,
                locals_words: 1,
                locals_bitmap: vec![0b1],
                args_words: 0,
                args_bitmap: vec![],
                kind: crate::stack::FrameKind::Normal,
                objects: vec![],
            });
        }
        fiber.cas_state(FiberState::Runnable, FiberState::Waiting);
        fiber.set_wait_reason(WaitReason::Sleep);

        collector.collect().unwrap();
        assert!(ctx.heap.is_marked_addr(target));
        assert!(fiber.scan_done.load(Ordering::Acquire));
    }

    #[test]
    fn detecting_cycle_reclaims_isolated_blocked_fiber() {
        let mut config = GcConfig::default();
        config.deadlock_policy = DeadlockPolicy::Reclaim;
        let collector = Collector::new(config, 2);
        let ctx = collector.context();

        let chan = ctx.heap.allocate(4, &[0b110], false);
        let fiber = ctx.spawn_fiber(64);
        crate::sema::park_on_chans(
            &ctx.chans,
            &ctx.waiter_pool,
            ctx.config.deadlock_policy,
            &fiber,
            &[(chan, crate::sema::ChanDir::Recv)],
            WaitReason::ChanReceive,
        );

        let stats = collector.collect().unwrap();
        assert_eq!(stats.fibers_reclaimed, 1);
        assert_eq!(fiber.state(), FiberState::Dead);
        assert_eq!(ctx.chans.get(chan).unwrap().waiters(), 0);
    }

    #[test]
    fn second_collect_runs_after_first() {
        let collector = Collector::new(GcConfig::default(), 1);
        collector.collect().unwrap();
        collector.collect().unwrap();
        assert_eq!(
            collector
                .context()
                .root_work
                .cycles
                .load(Ordering::Acquire),
            2
        );
    }
}
