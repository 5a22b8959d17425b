//! Root enumeration: build the root job array under a stopped world,
//! partitioning fibers into the live prefix and the tagged blocked suffix.
//!
//! The array layout is `[fixed | data | bss | spans | stacks)`. Only the
//! first `n_valid_stack_roots` stack slots are counted into `markroot_jobs`;
//! the blocked suffix is stored with the tag bit set and is invisible to the
//! marker until the detection phase promotes it.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::context::{now_nanos, CollectorContext};
use crate::fiber::{FiberState, SCAN};
use crate::heap::{PAGES_PER_ARENA, PAGES_PER_SPAN_ROOT};
use crate::report::{full_fiber_report, trace_snapshot};
use crate::tagging::tag;

/// Fixed root index: the finalizer blocks.
pub const ROOT_FINALIZERS: u32 = 0;
/// Fixed root index: the sweep of pooled dead-fiber stacks.
pub const ROOT_FREE_STACKS: u32 = 1;
/// Number of fixed root jobs.
pub const FIXED_ROOT_COUNT: u32 = 2;

/// Bytes of global data scanned per data or BSS root job.
pub const ROOT_BLOCK_BYTES: usize = 256 << 10;

/// A module's global region: backing words plus its pointer bitmap.
pub struct GlobalRegion {
    backing: Box<[usize]>,
    ptrmask: Vec<u8>,
}

impl GlobalRegion {
    /// An empty region (a module with no globals of this kind).
    pub fn empty() -> Self {
        Self {
            backing: Vec::new().into_boxed_slice(),
            ptrmask: Vec::new(),
        }
    }

    pub fn new(words: usize, ptrmask: Vec<u8>) -> Self {
        let mut mask = ptrmask;
        mask.resize(words.div_ceil(8).max(1), 0);
        Self {
            backing: vec![0usize; words].into_boxed_slice(),
            ptrmask: mask,
        }
    }

    pub fn base(&self) -> usize {
        if self.backing.is_empty() {
            0
        } else {
            self.backing.as_ptr() as usize
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.backing.len() * 8
    }

    pub fn ptrmask(&self) -> &[u8] {
        &self.ptrmask
    }

    /// Store a word into the region (globals are written by the mutator
    /// before the cycle).
    pub fn set_word(&mut self, index: usize, val: usize) {
        self.backing[index] = val;
    }
}

/// One module's data and BSS regions.
pub struct ModuleGlobals {
    pub data: GlobalRegion,
    pub bss: GlobalRegion,
}

/// A block of registered finalizer function slots; each slot is a root.
pub struct FinalizerBlock {
    fns: Vec<AtomicUsize>,
}

impl FinalizerBlock {
    pub fn new(fns: Vec<usize>) -> Self {
        Self {
            fns: fns.into_iter().map(AtomicUsize::new).collect(),
        }
    }

    /// Addresses of the slots, for single-pointer block scans.
    pub fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.fns.iter().map(|slot| slot as *const _ as usize)
    }
}

/// The published stack-root array. Written during preparation and by the
/// detection phase's promotions; read-only for everyone else.
pub struct RootArray {
    pub slots: Vec<AtomicUsize>,
}

/// Cycle-scoped root bookkeeping (`work` in the original runtime).
pub struct RootWork {
    stack_roots: ArcSwap<RootArray>,
    pub n_stack_roots: AtomicUsize,
    pub n_valid_stack_roots: AtomicUsize,
    pub markroot_next: AtomicU32,
    pub markroot_jobs: AtomicU32,
    pub base_data: AtomicU32,
    pub base_bss: AtomicU32,
    pub base_spans: AtomicU32,
    pub base_stacks: AtomicU32,
    pub base_end: AtomicU32,
    pub n_data_roots: AtomicUsize,
    pub n_bss_roots: AtomicUsize,
    pub n_span_roots: AtomicUsize,
    mark_arenas: ArcSwap<Vec<usize>>,
    pub tstart: AtomicU64,
    pub cycles: AtomicU64,
}

impl RootWork {
    pub fn new() -> Self {
        Self {
            stack_roots: ArcSwap::from_pointee(RootArray { slots: Vec::new() }),
            n_stack_roots: AtomicUsize::new(0),
            n_valid_stack_roots: AtomicUsize::new(0),
            markroot_next: AtomicU32::new(0),
            markroot_jobs: AtomicU32::new(0),
            base_data: AtomicU32::new(0),
            base_bss: AtomicU32::new(0),
            base_spans: AtomicU32::new(0),
            base_stacks: AtomicU32::new(0),
            base_end: AtomicU32::new(0),
            n_data_roots: AtomicUsize::new(0),
            n_bss_roots: AtomicUsize::new(0),
            n_span_roots: AtomicUsize::new(0),
            mark_arenas: ArcSwap::from_pointee(Vec::new()),
            tstart: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn stack_roots(&self) -> Arc<RootArray> {
        self.stack_roots.load_full()
    }

    pub fn mark_arenas(&self) -> Arc<Vec<usize>> {
        self.mark_arenas.load_full()
    }
}

impl Default for RootWork {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot every fiber with no classification: plain tracing, used when
/// detection is disabled.
fn snapshot_plain(ctx: &CollectorContext) -> (Vec<AtomicUsize>, usize) {
    let fibers = ctx.fibers.snapshot();
    let slots: Vec<AtomicUsize> = fibers
        .iter()
        .map(|f| AtomicUsize::new(f.descriptor()))
        .collect();
    let n = slots.len();
    (slots, n)
}

/// Snapshot every fiber sorted for detection: live fibers fill the prefix,
/// blocked fibers fill the suffix with the tag bit set so the marker never
/// follows a pointer to them.
fn snapshot_sorted_for_gc(ctx: &CollectorContext) -> (Vec<AtomicUsize>, usize) {
    let fibers = ctx.fibers.snapshot();
    trace_snapshot(&ctx.config, &fibers);

    let n = fibers.len();
    let slots: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(0)).collect();
    let mut curr: usize = 0;
    let mut blocked: isize = n as isize - 1;
    for fiber in &fibers {
        let raw = fiber.read_status();
        let state = FiberState::from_raw(raw & !SCAN);
        if state == FiberState::Unreachable {
            // Only possible with overlapping detecting cycles, which are
            // forbidden.
            panic!(
                "found unreachable fiber in snapshot:\n{}",
                full_fiber_report(fiber)
            );
        }
        if state != FiberState::Waiting || fiber.wait_reason().is_unblocking() {
            slots[curr].store(fiber.descriptor(), Ordering::Release);
            curr += 1;
        } else {
            slots[blocked as usize].store(
                tag(fiber.descriptor(), ctx.config.deadlock_policy),
                Ordering::Release,
            );
            blocked -= 1;
        }
    }
    if curr as isize != blocked + 1 {
        panic!("live and blocked indices don't match up: {curr} vs {blocked}");
    }
    (slots, curr)
}

/// Queue root scanning jobs and initialize scanning state for the cycle.
/// The world must be stopped.
pub fn gc_mark_root_prepare(ctx: &CollectorContext) {
    ctx.fibers.assert_world_stopped();

    let n_blocks = |bytes: usize| bytes.div_ceil(ROOT_BLOCK_BYTES);

    let mut n_data_roots = 0;
    let mut n_bss_roots = 0;
    for module in ctx.modules.read().iter() {
        n_data_roots = n_data_roots.max(n_blocks(module.data.len_bytes()));
        n_bss_roots = n_bss_roots.max(n_blocks(module.bss.len_bytes()));
    }

    // Snapshot the arena index. The arena list is append-only, so the
    // snapshot stays valid for the cycle.
    let arenas: Vec<usize> = (0..ctx.heap.arena_count()).collect();
    let n_span_roots = arenas.len() * (PAGES_PER_ARENA / PAGES_PER_SPAN_ROOT);

    // Fibers created after this point begin life with nothing to scan; the
    // write barrier catches anything they produce.
    for fiber in ctx.fibers.snapshot() {
        fiber.scan_done.store(false, Ordering::Release);
    }
    let (slots, n_valid) = if ctx.config.deadlock_policy.detecting() {
        snapshot_sorted_for_gc(ctx)
    } else {
        snapshot_plain(ctx)
    };
    let n_stack_roots = slots.len();

    let work = &ctx.root_work;
    work.n_data_roots.store(n_data_roots, Ordering::Release);
    work.n_bss_roots.store(n_bss_roots, Ordering::Release);
    work.n_span_roots.store(n_span_roots, Ordering::Release);
    work.mark_arenas.store(Arc::new(arenas));
    work.stack_roots.store(Arc::new(RootArray { slots }));
    work.n_stack_roots.store(n_stack_roots, Ordering::Release);
    work.n_valid_stack_roots.store(n_valid, Ordering::Release);

    work.markroot_next.store(0, Ordering::Release);
    work.markroot_jobs.store(
        FIXED_ROOT_COUNT + (n_data_roots + n_bss_roots + n_span_roots + n_valid) as u32,
        Ordering::Release,
    );

    let base_data = FIXED_ROOT_COUNT;
    let base_bss = base_data + n_data_roots as u32;
    let base_spans = base_bss + n_bss_roots as u32;
    let base_stacks = base_spans + n_span_roots as u32;
    work.base_data.store(base_data, Ordering::Release);
    work.base_bss.store(base_bss, Ordering::Release);
    work.base_spans.store(base_spans, Ordering::Release);
    work.base_stacks.store(base_stacks, Ordering::Release);
    work.base_end
        .store(base_stacks + n_stack_roots as u32, Ordering::Release);

    work.tstart.store(now_nanos(), Ordering::Release);
}

/// Check that every root job ran and every snapshot fiber's stack was
/// scanned. Purely a debug check; failures are fatal.
pub fn gc_mark_root_check(ctx: &CollectorContext) {
    let work = &ctx.root_work;
    let next = work.markroot_next.load(Ordering::Acquire);
    let jobs = work.markroot_jobs.load(Ordering::Acquire);
    if next < jobs {
        panic!("left over markroot jobs: {next} of {jobs} done");
    }

    let n = work.n_stack_roots.load(Ordering::Acquire);
    for fiber in ctx.fibers.snapshot().into_iter().take(n) {
        if !fiber.scan_done.load(Ordering::Acquire) {
            panic!("scan missed a fiber:\n{}", full_fiber_report(&fiber));
        }
    }
}
