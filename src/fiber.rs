//! Fibers, their status machine, and the registry the collector snapshots.
//!
//! A fiber is the schedulable unit of the weft runtime: a cooperatively
//! scheduled task with its own stack. The collector only needs the subset of
//! the scheduler modeled here: atomic status transitions (including the `SCAN`
//! bit held while a stack is being scanned), suspension at safe points,
//! park/ready for assist blocking, and the registry of all fibers that root
//! enumeration snapshots under a stopped world.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::atomic::AtomicCell;
use crossbeam_utils::Backoff;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::report::status_string;
use crate::stack::FiberStack;

/// Bit OR-ed into a fiber's status while exactly one worker scans its stack.
pub const SCAN: u32 = 0x1000;

/// GC-relevant fiber states. The raw status word is one of these, optionally
/// OR-ed with [`SCAN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FiberState {
    Runnable = 1,
    Running = 2,
    Syscall = 3,
    Waiting = 4,
    Dead = 5,
    /// A fiber in a blocking wait that the marker did not reach. Input to the
    /// reclaimer; must never survive a cycle.
    Unreachable = 6,
    /// Terminal report-only state; never transitions back.
    Deadlocked = 7,
}

impl FiberState {
    /// Decode the state portion of a raw status word.
    pub fn from_raw(raw: u32) -> FiberState {
        match raw & !SCAN {
            1 => FiberState::Runnable,
            2 => FiberState::Running,
            3 => FiberState::Syscall,
            4 => FiberState::Waiting,
            5 => FiberState::Dead,
            6 => FiberState::Unreachable,
            7 => FiberState::Deadlocked,
            other => panic!("bad fiber status {other:#x}"),
        }
    }
}

/// Why a `WAITING` fiber is parked.
///
/// The blocking subset (`is_unblocking` returns false) is exactly the set of
/// reasons where only another fiber can perform the wakeup, which makes the
/// waiter a candidate for partial-deadlock collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    Zero,
    ChanReceive,
    ChanSend,
    ChanReceiveNilChan,
    ChanSendNilChan,
    Select,
    SelectNoCases,
    SyncWaitGroupWait,
    SyncMutexLock,
    SyncRwMutexRLock,
    SyncRwMutexLock,
    SyncCondWait,
    Sleep,
    IoWait,
    GcAssistWait,
    GcAssistMarking,
    GcScan,
    Preempted,
}

impl WaitReason {
    /// True if the runtime will eventually reschedule this fiber even though
    /// it is currently parked (timer, poller, or the GC itself will wake it).
    pub fn is_unblocking(self) -> bool {
        !matches!(
            self,
            WaitReason::ChanReceive
                | WaitReason::ChanSend
                | WaitReason::ChanReceiveNilChan
                | WaitReason::ChanSendNilChan
                | WaitReason::Select
                | WaitReason::SelectNoCases
                | WaitReason::SyncWaitGroupWait
                | WaitReason::SyncMutexLock
                | WaitReason::SyncRwMutexRLock
                | WaitReason::SyncRwMutexLock
                | WaitReason::SyncCondWait
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WaitReason::Zero => "",
            WaitReason::ChanReceive => "chan receive",
            WaitReason::ChanSend => "chan send",
            WaitReason::ChanReceiveNilChan => "chan receive (nil chan)",
            WaitReason::ChanSendNilChan => "chan send (nil chan)",
            WaitReason::Select => "select",
            WaitReason::SelectNoCases => "select (no cases)",
            WaitReason::SyncWaitGroupWait => "sync.WaitGroup.Wait",
            WaitReason::SyncMutexLock => "sync.Mutex.Lock",
            WaitReason::SyncRwMutexRLock => "sync.RWMutex.RLock",
            WaitReason::SyncRwMutexLock => "sync.RWMutex.Lock",
            WaitReason::SyncCondWait => "sync.Cond.Wait",
            WaitReason::Sleep => "sleep",
            WaitReason::IoWait => "IO wait",
            WaitReason::GcAssistWait => "GC assist wait",
            WaitReason::GcAssistMarking => "GC assist marking",
            WaitReason::GcScan => "GC scan",
            WaitReason::Preempted => "preempted",
        }
    }
}

/// A deferred call hanging off a fiber. The `record_obj` address keeps
/// heap-allocated records live during stack scans; `fn_obj` is the heap
/// address of the deferred closure object (zero when the closure captured
/// nothing heap-allocated).
pub struct DeferRecord {
    pub fn_obj: usize,
    pub record_obj: usize,
    pub heap: bool,
    /// Runs when the chain is unwound. Receives `true` when a synthetic
    /// forced-exit record is at the head of the panic chain.
    pub action: Option<Box<dyn FnOnce(bool) + Send>>,
}

/// A panic record on a fiber's panic chain. Always stack allocated in the
/// original runtime, so stack scanning treats `obj` as a stack pointer.
#[derive(Debug, Clone, Copy)]
pub struct PanicRecord {
    pub forced_exit: bool,
    pub obj: usize,
}

/// The schedulable unit, as seen by the collector.
pub struct Fiber {
    id: u64,
    status: AtomicU32,
    /// Heap address of this fiber's descriptor object. Root slots and wait
    /// structures refer to the fiber through this address.
    descriptor: AtomicUsize,
    pub stack: Mutex<FiberStack>,
    wait_reason: AtomicCell<WaitReason>,
    pub(crate) waitsince: AtomicU64,
    pub(crate) scan_done: AtomicBool,
    pub(crate) assist_bytes: AtomicI64,
    pub(crate) preempt: AtomicBool,
    pub(crate) preempt_shrink: AtomicBool,
    pub(crate) async_safe_point: AtomicBool,
    pub(crate) parking_on_chan: AtomicBool,
    pub(crate) active_stack_chans: AtomicBool,
    /// Tagged address of the wait word this fiber is parked on, or zero.
    pub(crate) waiting_sema: AtomicUsize,
    /// Tagged address of the notifier list this fiber is parked on, or zero.
    pub(crate) waiting_notifier: AtomicUsize,
    /// Waiters this fiber is parked on (channel operations, select cases).
    pub(crate) waiting: Mutex<Vec<Arc<crate::sema::Waiter>>>,
    pub(crate) defers: Mutex<Vec<DeferRecord>>,
    pub(crate) panics: Mutex<Vec<PanicRecord>>,
    /// Mark-done sentinel slot, set by the assist when it observes the final
    /// completion point.
    pub(crate) param: AtomicUsize,
    pub(crate) timer: AtomicUsize,
    pub(crate) labels: AtomicUsize,
    pub(crate) locked_thread: AtomicBool,
    pub(crate) system: bool,
    park_lock: Mutex<()>,
    park_cv: Condvar,
}

impl Fiber {
    pub(crate) fn new(id: u64, stack_words: usize, system: bool) -> Self {
        Self {
            id,
            status: AtomicU32::new(FiberState::Runnable as u32),
            descriptor: AtomicUsize::new(0),
            stack: Mutex::new(FiberStack::new(stack_words)),
            wait_reason: AtomicCell::new(WaitReason::Zero),
            waitsince: AtomicU64::new(0),
            scan_done: AtomicBool::new(false),
            assist_bytes: AtomicI64::new(0),
            preempt: AtomicBool::new(false),
            preempt_shrink: AtomicBool::new(false),
            async_safe_point: AtomicBool::new(false),
            parking_on_chan: AtomicBool::new(false),
            active_stack_chans: AtomicBool::new(false),
            waiting_sema: AtomicUsize::new(0),
            waiting_notifier: AtomicUsize::new(0),
            waiting: Mutex::new(Vec::new()),
            defers: Mutex::new(Vec::new()),
            panics: Mutex::new(Vec::new()),
            param: AtomicUsize::new(0),
            timer: AtomicUsize::new(0),
            labels: AtomicUsize::new(0),
            locked_thread: AtomicBool::new(false),
            system,
            park_lock: Mutex::new(()),
            park_cv: Condvar::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Heap address of the fiber's descriptor object.
    pub fn descriptor(&self) -> usize {
        self.descriptor.load(Ordering::Acquire)
    }

    pub(crate) fn set_descriptor(&self, addr: usize) {
        self.descriptor.store(addr, Ordering::Release);
    }

    /// Raw status word, including the `SCAN` bit if held.
    pub fn read_status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    /// Status with the `SCAN` bit stripped.
    pub fn state(&self) -> FiberState {
        FiberState::from_raw(self.read_status())
    }

    pub fn wait_reason(&self) -> WaitReason {
        self.wait_reason.load()
    }

    pub fn set_wait_reason(&self, reason: WaitReason) {
        self.wait_reason.store(reason);
    }

    /// Compare-and-swap on the raw status word.
    pub fn cas_status(&self, old: u32, new: u32) -> bool {
        self.status
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Transition between plain states. Fails if the `SCAN` bit is held, so a
    /// state change never commits while a scan is in flight.
    pub fn cas_state(&self, from: FiberState, to: FiberState) -> bool {
        self.cas_status(from as u32, to as u32)
    }

    /// Transition `from` to `WAITING` with the given reason, retrying over
    /// spurious `SCAN` windows the way the scheduler does.
    pub fn cas_to_waiting(&self, from: FiberState, reason: WaitReason) {
        self.set_wait_reason(reason);
        let backoff = Backoff::new();
        while !self.cas_state(from, FiberState::Waiting) {
            if self.read_status() & SCAN == 0 && self.state() != from {
                panic!(
                    "cas_to_waiting: fiber {} is {} not {:?}",
                    self.id,
                    status_string(self.read_status()),
                    from
                );
            }
            backoff.snooze();
        }
    }

    pub fn set_preempt(&self, v: bool) {
        self.preempt.store(v, Ordering::Release);
    }

    pub fn preempt_requested(&self) -> bool {
        self.preempt.load(Ordering::Acquire)
    }

    pub fn assist_bytes(&self) -> i64 {
        self.assist_bytes.load(Ordering::Acquire)
    }

    /// Whether this fiber's stack has been scanned in the current cycle.
    pub fn scan_done(&self) -> bool {
        self.scan_done.load(Ordering::Acquire)
    }

    /// Charge an allocation against this fiber's assist budget.
    pub fn charge_allocation(&self, bytes: i64) {
        self.assist_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Push a deferred call onto this fiber's defer chain.
    pub fn push_defer(&self, record: DeferRecord) {
        self.defers.lock().push(record);
    }

    /// Block the calling thread until the fiber leaves `WAITING`.
    pub(crate) fn park_wait(&self) {
        let mut guard = self.park_lock.lock();
        while self.state() == FiberState::Waiting {
            self.park_cv.wait(&mut guard);
        }
    }

    /// Make a parked fiber runnable again and wake its host thread.
    pub fn ready(&self) {
        let _guard = self.park_lock.lock();
        self.cas_state(FiberState::Waiting, FiberState::Runnable);
        self.park_cv.notify_all();
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("status", &status_string(self.read_status()))
            .field("wait_reason", &self.wait_reason().as_str())
            .finish()
    }
}

/// Result of suspending a fiber for scanning. Holds the `SCAN` bit until
/// passed to [`resume`].
pub struct Suspended {
    pub dead: bool,
    acquired: bool,
    fiber: Arc<Fiber>,
}

/// Spin until `fiber` reaches a safe point, then take the `SCAN` bit.
///
/// Callers must not suspend the fiber they are currently running; the
/// self-scan guard in `markroot` handles that case by parking the caller
/// first.
pub fn suspend(fiber: &Arc<Fiber>, _drain_partial_deadlocks: bool) -> Suspended {
    let backoff = Backoff::new();
    loop {
        let raw = fiber.read_status();
        if raw & SCAN != 0 {
            // Another worker holds the scan bit; by the one-scanner invariant
            // it will clear it.
            backoff.snooze();
            continue;
        }
        match FiberState::from_raw(raw) {
            FiberState::Dead => {
                return Suspended {
                    dead: true,
                    acquired: false,
                    fiber: Arc::clone(fiber),
                }
            }
            FiberState::Running => {
                backoff.snooze();
                continue;
            }
            FiberState::Unreachable => {
                panic!(
                    "suspend: fiber {} still unreachable (policy not applied)",
                    fiber.id()
                );
            }
            FiberState::Runnable
            | FiberState::Syscall
            | FiberState::Waiting
            | FiberState::Deadlocked => {
                if fiber.cas_status(raw, raw | SCAN) {
                    return Suspended {
                        dead: false,
                        acquired: true,
                        fiber: Arc::clone(fiber),
                    };
                }
            }
        }
        backoff.spin();
    }
}

/// Release the `SCAN` bit taken by [`suspend`].
pub fn resume(suspended: Suspended) {
    if !suspended.acquired {
        return;
    }
    let backoff = Backoff::new();
    loop {
        let raw = suspended.fiber.read_status();
        if raw & SCAN == 0 {
            panic!("resume: scan bit already clear on fiber {}", suspended.fiber.id());
        }
        if suspended.fiber.cas_status(raw, raw & !SCAN) {
            return;
        }
        backoff.spin();
    }
}

/// Registry of every fiber the runtime has created. Root enumeration
/// snapshots it under a stopped world; the free pool feeds fiber reuse and the
/// fixed free-stack root.
pub struct FiberRegistry {
    all: RwLock<Vec<Arc<Fiber>>>,
    by_descriptor: DashMap<usize, Arc<Fiber>>,
    free: Mutex<Vec<Arc<Fiber>>>,
    next_id: AtomicU64,
    pub(crate) nsys: AtomicI64,
    stopped: AtomicBool,
    world_lock: Mutex<()>,
    world_cv: Condvar,
}

impl FiberRegistry {
    pub fn new() -> Self {
        Self {
            all: RwLock::new(Vec::new()),
            by_descriptor: DashMap::new(),
            free: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            nsys: AtomicI64::new(0),
            stopped: AtomicBool::new(false),
            world_lock: Mutex::new(()),
            world_cv: Condvar::new(),
        }
    }

    pub(crate) fn create(&self, stack_words: usize, system: bool) -> Arc<Fiber> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let fiber = Arc::new(Fiber::new(id, stack_words, system));
        if system {
            self.nsys.fetch_add(1, Ordering::AcqRel);
        }
        self.all.write().push(Arc::clone(&fiber));
        fiber
    }

    pub(crate) fn index_descriptor(&self, fiber: &Arc<Fiber>) {
        self.by_descriptor
            .insert(fiber.descriptor(), Arc::clone(fiber));
    }

    /// Look a fiber up by the heap address of its descriptor object.
    pub fn by_descriptor(&self, addr: usize) -> Option<Arc<Fiber>> {
        self.by_descriptor.get(&addr).map(|e| Arc::clone(e.value()))
    }

    /// Snapshot of all fibers. Grows monotonically; existing entries never
    /// change, so the snapshot stays valid for the cycle that took it.
    pub fn snapshot(&self) -> Vec<Arc<Fiber>> {
        self.all.read().clone()
    }

    pub fn len(&self) -> usize {
        self.all.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.read().is_empty()
    }

    /// Racy iteration used by debug checks; sees at least every fiber that
    /// existed when the call started.
    pub fn for_each_race<F: FnMut(&Arc<Fiber>)>(&self, mut f: F) {
        for fiber in self.snapshot() {
            f(&fiber);
        }
    }

    /// Return a dead fiber to the free pool, stack intact. The fixed
    /// free-stack root releases pooled stacks.
    pub(crate) fn free_put(&self, fiber: Arc<Fiber>) {
        debug_assert_eq!(fiber.state(), FiberState::Dead);
        self.free.lock().push(fiber);
    }

    pub(crate) fn free_len(&self) -> usize {
        self.free.lock().len()
    }

    /// Release the stacks of pooled dead fibers.
    pub(crate) fn free_pooled_stacks(&self) {
        for fiber in self.free.lock().iter() {
            fiber.stack.lock().release();
        }
    }

    /// Request a stop-the-world window. Returns once no fiber is running.
    pub fn stop_the_world(&self) -> crate::error::GcResult<()> {
        self.stopped.store(true, Ordering::Release);
        let backoff = Backoff::new();
        for _ in 0..1_000_000 {
            let running = self
                .snapshot()
                .into_iter()
                .find(|f| f.state() == FiberState::Running);
            match running {
                None => return Ok(()),
                Some(f) => {
                    if backoff.is_completed() {
                        std::thread::yield_now();
                        let _ = f;
                    } else {
                        backoff.snooze();
                    }
                }
            }
        }
        let culprit = self
            .snapshot()
            .into_iter()
            .find(|f| f.state() == FiberState::Running)
            .map(|f| f.id())
            .unwrap_or(0);
        self.stopped.store(false, Ordering::Release);
        Err(crate::error::GcError::WorldNotStopped(culprit))
    }

    /// End the stop-the-world window and release fibers parked at safe points.
    pub fn start_the_world(&self) {
        let _guard = self.world_lock.lock();
        self.stopped.store(false, Ordering::Release);
        self.world_cv.notify_all();
    }

    pub fn world_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn assert_world_stopped(&self) {
        assert!(self.world_stopped(), "expected a stopped world");
    }

    /// Cooperative safe point. A running fiber parks here for the duration of
    /// a stop-the-world window.
    pub fn safepoint(&self, fiber: &Fiber) {
        if !self.stopped.load(Ordering::Acquire) {
            return;
        }
        if !fiber.cas_state(FiberState::Running, FiberState::Waiting) {
            return;
        }
        fiber.set_wait_reason(WaitReason::Preempted);
        let mut guard = self.world_lock.lock();
        while self.stopped.load(Ordering::Acquire) {
            self.world_cv.wait(&mut guard);
        }
        drop(guard);
        fiber.set_wait_reason(WaitReason::Zero);
        let backoff = Backoff::new();
        while !fiber.cas_state(FiberState::Waiting, FiberState::Running) {
            backoff.snooze();
        }
    }
}

impl Default for FiberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_bit_round_trips_through_suspend() {
        let registry = FiberRegistry::new();
        let fiber = registry.create(64, false);
        assert!(fiber.cas_state(FiberState::Runnable, FiberState::Waiting));
        fiber.set_wait_reason(WaitReason::ChanReceive);

        let suspended = suspend(&fiber, false);
        assert!(!suspended.dead);
        assert_eq!(fiber.read_status() & SCAN, SCAN);
        assert_eq!(fiber.state(), FiberState::Waiting);

        resume(suspended);
        assert_eq!(fiber.read_status() & SCAN, 0);
    }

    #[test]
    fn suspend_reports_dead_fibers() {
        let registry = FiberRegistry::new();
        let fiber = registry.create(64, false);
        assert!(fiber.cas_state(FiberState::Runnable, FiberState::Dead));
        let suspended = suspend(&fiber, false);
        assert!(suspended.dead);
        resume(suspended); // no-op; the bit was never taken
        assert_eq!(fiber.read_status() & SCAN, 0);
    }

    #[test]
    fn blocking_wait_reasons_match_the_table() {
        let blocking = [
            WaitReason::ChanReceive,
            WaitReason::ChanSend,
            WaitReason::ChanReceiveNilChan,
            WaitReason::ChanSendNilChan,
            WaitReason::Select,
            WaitReason::SelectNoCases,
            WaitReason::SyncWaitGroupWait,
            WaitReason::SyncMutexLock,
            WaitReason::SyncRwMutexRLock,
            WaitReason::SyncRwMutexLock,
            WaitReason::SyncCondWait,
        ];
        for reason in blocking {
            assert!(!reason.is_unblocking(), "{reason:?} must be blocking");
        }
        for reason in [
            WaitReason::Sleep,
            WaitReason::IoWait,
            WaitReason::GcAssistWait,
            WaitReason::Preempted,
        ] {
            assert!(reason.is_unblocking(), "{reason:?} must be unblocking");
        }
    }

    #[test]
    fn state_cas_refuses_while_scan_held() {
        let registry = FiberRegistry::new();
        let fiber = registry.create(64, false);
        fiber.cas_state(FiberState::Runnable, FiberState::Waiting);
        let suspended = suspend(&fiber, false);
        // The plain state CAS must fail while the scan bit is held.
        assert!(!fiber.cas_state(FiberState::Waiting, FiberState::Runnable));
        resume(suspended);
        assert!(fiber.cas_state(FiberState::Waiting, FiberState::Runnable));
    }

    #[test]
    fn park_and_ready_round_trip() {
        let registry = Arc::new(FiberRegistry::new());
        let fiber = registry.create(64, false);
        fiber.cas_state(FiberState::Runnable, FiberState::Running);
        fiber.cas_to_waiting(FiberState::Running, WaitReason::GcAssistWait);

        let waiter = {
            let fiber = Arc::clone(&fiber);
            std::thread::spawn(move || {
                fiber.park_wait();
                fiber.state()
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        fiber.ready();
        assert_eq!(waiter.join().unwrap(), FiberState::Runnable);
    }

    #[test]
    fn stop_the_world_waits_for_runners() {
        let registry = Arc::new(FiberRegistry::new());
        let parked = registry.create(64, false);
        parked.cas_state(FiberState::Runnable, FiberState::Waiting);
        parked.set_wait_reason(WaitReason::ChanReceive);

        let runner = registry.create(64, false);
        runner.cas_state(FiberState::Runnable, FiberState::Running);

        let done = Arc::new(AtomicBool::new(false));
        let handle = {
            let registry = Arc::clone(&registry);
            let runner = Arc::clone(&runner);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    registry.safepoint(&runner);
                    std::thread::yield_now();
                }
            })
        };

        registry.stop_the_world().unwrap();
        registry.assert_world_stopped();
        assert_ne!(runner.state(), FiberState::Running);
        registry.start_the_world();
        done.store(true, Ordering::Release);
        handle.join().unwrap();
    }
}
