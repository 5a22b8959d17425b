//! The long-lived collector context: every piece of shared state the
//! components operate on, owned in one place and passed explicitly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::assist::AssistQueue;
use crate::config::GcConfig;
use crate::controller::Controller;
use crate::fiber::{Fiber, FiberRegistry};
use crate::heap::Heap;
use crate::roots::{FinalizerBlock, ModuleGlobals, RootWork};
use crate::sema::{ChanTable, NotifyList, SemaTable, WaiterPool};
use crate::workqueue::{GcWork, WorkLists};

static PROCESS_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic nanoseconds since process start.
pub fn now_nanos() -> u64 {
    PROCESS_EPOCH.elapsed().as_nanos() as u64
}

/// Scheduler poll hooks consulted by the drain's self-preemption checks.
pub struct SchedPoll {
    /// A stop-the-world request is pending.
    pub gc_waiting: AtomicBool,
    idle_work: AtomicBool,
    fractional_exit: AtomicBool,
}

impl SchedPoll {
    fn new() -> Self {
        Self {
            gc_waiting: AtomicBool::new(false),
            idle_work: AtomicBool::new(false),
            fractional_exit: AtomicBool::new(false),
        }
    }

    /// Whether the scheduler has non-GC work for an idle worker.
    pub fn poll_work(&self) -> bool {
        self.idle_work.load(Ordering::Acquire)
    }

    /// Whether the fractional worker's quota has expired.
    pub fn poll_fractional_worker_exit(&self) -> bool {
        self.fractional_exit.load(Ordering::Acquire)
    }

    pub fn set_idle_work(&self, v: bool) {
        self.idle_work.store(v, Ordering::Release);
    }

    pub fn set_fractional_exit(&self, v: bool) {
        self.fractional_exit.store(v, Ordering::Release);
    }
}

/// Per-cycle outcome counters.
pub struct CycleCounters {
    pub reclaimed: AtomicU64,
    pub reported: AtomicU64,
}

impl CycleCounters {
    fn new() -> Self {
        Self {
            reclaimed: AtomicU64::new(0),
            reported: AtomicU64::new(0),
        }
    }

    pub fn reset(&self) {
        self.reclaimed.store(0, Ordering::Release);
        self.reported.store(0, Ordering::Release);
    }
}

/// All collector state, owned by the runtime and passed explicitly to every
/// component function.
pub struct CollectorContext {
    pub config: GcConfig,
    pub heap: Heap,
    pub fibers: FiberRegistry,
    pub controller: Controller,
    pub root_work: RootWork,
    pub work_lists: Arc<WorkLists>,
    pub assist_queue: AssistQueue,
    pub sema: SemaTable,
    pub chans: ChanTable,
    pub notifiers: DashMap<usize, Arc<NotifyList>>,
    pub waiter_pool: WaiterPool,
    pub modules: RwLock<Vec<ModuleGlobals>>,
    pub finalizers: Mutex<Vec<FinalizerBlock>>,
    pub sched: SchedPoll,
    pub counters: CycleCounters,
}

impl CollectorContext {
    pub fn new(config: GcConfig, workers: u32) -> Self {
        Self {
            config,
            heap: Heap::new(),
            fibers: FiberRegistry::new(),
            controller: Controller::new(workers),
            root_work: RootWork::new(),
            work_lists: Arc::new(WorkLists::new()),
            assist_queue: AssistQueue::new(),
            sema: SemaTable::new(),
            chans: ChanTable::new(),
            notifiers: DashMap::new(),
            waiter_pool: WaiterPool::new(),
            modules: RwLock::new(Vec::new()),
            finalizers: Mutex::new(Vec::new()),
            sched: SchedPoll::new(),
            counters: CycleCounters::new(),
        }
    }

    /// An isolated context for tests: one worker, detection disabled.
    pub fn new_for_testing() -> Self {
        Self::new(GcConfig::default(), 1)
    }

    /// Fresh per-worker marking state bound to this context's work lists.
    pub fn new_worker(&self) -> GcWork {
        GcWork::new(Arc::clone(&self.work_lists))
    }

    /// Create a fiber with a heap descriptor object, registered for root
    /// enumeration.
    pub fn spawn_fiber(&self, stack_words: usize) -> Arc<Fiber> {
        self.spawn_fiber_inner(stack_words, false)
    }

    /// Like [`spawn_fiber`](Self::spawn_fiber) but counted as a runtime
    /// system fiber.
    pub fn spawn_system_fiber(&self, stack_words: usize) -> Arc<Fiber> {
        self.spawn_fiber_inner(stack_words, true)
    }

    fn spawn_fiber_inner(&self, stack_words: usize, system: bool) -> Arc<Fiber> {
        let fiber = self.fibers.create(stack_words, system);
        let descriptor = self.heap.allocate(4, &[0], true);
        fiber.set_descriptor(descriptor);
        self.fibers.index_descriptor(&fiber);
        fiber
    }

    /// Create a condition-variable notifier list with a heap identity.
    pub fn new_notifier(&self) -> Arc<NotifyList> {
        let addr = self.heap.allocate(1, &[0], true);
        let list = Arc::new(NotifyList::new(addr));
        self.notifiers.insert(addr, Arc::clone(&list));
        list
    }
}
