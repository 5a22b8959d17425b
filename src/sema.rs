//! Wait structures fibers park on: the semaphore treap, notifier lists, and
//! channel wait queues, plus the pooled waiter records that link fibers into
//! them.
//!
//! The treap is keyed by the (tagged) address of the wait word; waiters for
//! the same address chain off the head node via `waitlink`, and only the head
//! participates in the tree. Tickets are random; rotations preserve min-heap
//! ticket order. During a detecting cycle every fiber pointer stored into a
//! wait structure carries the deadlock tag, which is what keeps the marker
//! from tracing one blocked fiber through another's wait queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;

use crate::config::DeadlockPolicy;
use crate::fiber::{Fiber, FiberState, WaitReason};
use crate::heap::write_word;
use crate::tagging::{tag, untag};

/// Number of buckets in the semaphore table; each bucket holds one treap of
/// wait-word addresses.
pub const SEMA_TAB_SIZE: usize = 251;

/// Pooled record describing a parked fiber on some wait structure.
pub struct Waiter {
    /// Tagged descriptor address of the parked fiber, or zero when pooled.
    fiber: AtomicUsize,
    /// Tagged wait-word address (sema) or element pointer (channel).
    pub(crate) elem: AtomicUsize,
    ticket: AtomicU32,
    pub(crate) is_select: AtomicBool,
    /// Channel heap address when parked on a channel operation.
    pub(crate) chan: AtomicUsize,
    links: Mutex<Links>,
}

#[derive(Default)]
struct Links {
    parent: Weak<Waiter>,
    prev: Option<Arc<Waiter>>,
    next: Option<Arc<Waiter>>,
    waitlink: Option<Arc<Waiter>>,
    waittail: Option<Arc<Waiter>>,
}

impl Waiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fiber: AtomicUsize::new(0),
            elem: AtomicUsize::new(0),
            ticket: AtomicU32::new(0),
            is_select: AtomicBool::new(false),
            chan: AtomicUsize::new(0),
            links: Mutex::new(Links::default()),
        })
    }

    /// Tagged fiber pointer as stored.
    pub fn fiber_raw(&self) -> usize {
        self.fiber.load(Ordering::Acquire)
    }

    /// Untagged fiber descriptor address.
    pub fn fiber_descriptor(&self) -> usize {
        untag(self.fiber_raw())
    }

    pub(crate) fn set_fiber(&self, tagged: usize) {
        self.fiber.store(tagged, Ordering::Release);
    }

    pub(crate) fn clear_fiber(&self) {
        self.fiber.store(0, Ordering::Release);
    }

    pub fn ticket(&self) -> u32 {
        self.ticket.load(Ordering::Acquire)
    }

    fn clear_tree_links(&self) {
        let mut links = self.links.lock();
        links.parent = Weak::new();
        links.prev = None;
        links.next = None;
        self.ticket.store(0, Ordering::Release);
        self.elem.store(0, Ordering::Release);
    }

    pub(crate) fn clear_all(&self) {
        self.clear_tree_links();
        let mut links = self.links.lock();
        links.waitlink = None;
        links.waittail = None;
        self.is_select.store(false, Ordering::Release);
        self.chan.store(0, Ordering::Release);
    }
}

/// Pool of reusable waiter records.
pub struct WaiterPool {
    free: SegQueue<Arc<Waiter>>,
}

impl WaiterPool {
    pub fn new() -> Self {
        Self {
            free: SegQueue::new(),
        }
    }

    pub fn acquire(&self) -> Arc<Waiter> {
        self.free.pop().unwrap_or_else(Waiter::new)
    }

    /// Return a waiter to the pool. The fiber field must already be cleared;
    /// a waiter that still names a fiber is a reclaim bug.
    pub fn release(&self, waiter: Arc<Waiter>) {
        assert_eq!(
            waiter.fiber_raw(),
            0,
            "waiter returned to pool with live fiber"
        );
        waiter.clear_all();
        self.free.push(waiter);
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

impl Default for WaiterPool {
    fn default() -> Self {
        Self::new()
    }
}

/// One treap of wait-word addresses.
pub struct SemaRoot {
    treap: Mutex<Option<Arc<Waiter>>>,
    pub nwait: AtomicU32,
}

fn same(a: &Arc<Waiter>, b: &Arc<Waiter>) -> bool {
    Arc::ptr_eq(a, b)
}

fn replace_child(
    head: &mut Option<Arc<Waiter>>,
    parent: Option<&Arc<Waiter>>,
    old: &Arc<Waiter>,
    new: Option<Arc<Waiter>>,
) {
    match parent {
        None => *head = new,
        Some(p) => {
            let mut links = p.links.lock();
            if links.prev.as_ref().map(|n| same(n, old)).unwrap_or(false) {
                links.prev = new;
            } else {
                links.next = new;
            }
        }
    }
}

fn rotate_left(head: &mut Option<Arc<Waiter>>, x: &Arc<Waiter>) {
    let parent = x.links.lock().parent.upgrade();
    let y = x
        .links
        .lock()
        .next
        .clone()
        .expect("rotate_left needs a right child");
    let b = y.links.lock().prev.clone();

    x.links.lock().next = b.clone();
    if let Some(b) = &b {
        b.links.lock().parent = Arc::downgrade(x);
    }
    {
        let mut yl = y.links.lock();
        yl.prev = Some(Arc::clone(x));
        yl.parent = parent.as_ref().map(Arc::downgrade).unwrap_or_default();
    }
    x.links.lock().parent = Arc::downgrade(&y);
    replace_child(head, parent.as_ref(), x, Some(Arc::clone(&y)));
}

fn rotate_right(head: &mut Option<Arc<Waiter>>, x: &Arc<Waiter>) {
    let parent = x.links.lock().parent.upgrade();
    let y = x
        .links
        .lock()
        .prev
        .clone()
        .expect("rotate_right needs a left child");
    let b = y.links.lock().next.clone();

    x.links.lock().prev = b.clone();
    if let Some(b) = &b {
        b.links.lock().parent = Arc::downgrade(x);
    }
    {
        let mut yl = y.links.lock();
        yl.next = Some(Arc::clone(x));
        yl.parent = parent.as_ref().map(Arc::downgrade).unwrap_or_default();
    }
    x.links.lock().parent = Arc::downgrade(&y);
    replace_child(head, parent.as_ref(), x, Some(Arc::clone(&y)));
}

impl SemaRoot {
    fn new() -> Self {
        Self {
            treap: Mutex::new(None),
            nwait: AtomicU32::new(0),
        }
    }

    /// Insert `waiter` for the (already tagged) wait-word key.
    fn queue(&self, key: usize, waiter: Arc<Waiter>) {
        waiter.elem.store(key, Ordering::Release);
        waiter
            .ticket
            .store(rand::thread_rng().gen::<u32>() | 1, Ordering::Release);
        self.nwait.fetch_add(1, Ordering::AcqRel);

        let mut head = self.treap.lock();
        let mut cursor = head.clone();
        let mut parent: Option<Arc<Waiter>> = None;
        while let Some(node) = cursor {
            let node_key = node.elem.load(Ordering::Acquire);
            if node_key == key {
                // Same address: chain at the tail; only the head is in the
                // tree.
                let tail = node.links.lock().waittail.clone();
                match tail {
                    Some(tail) => tail.links.lock().waitlink = Some(Arc::clone(&waiter)),
                    None => node.links.lock().waitlink = Some(Arc::clone(&waiter)),
                }
                node.links.lock().waittail = Some(waiter);
                return;
            }
            parent = Some(Arc::clone(&node));
            cursor = if key < node_key {
                node.links.lock().prev.clone()
            } else {
                node.links.lock().next.clone()
            };
        }

        // Attach as a leaf.
        match &parent {
            None => {
                *head = Some(Arc::clone(&waiter));
            }
            Some(p) => {
                let node_key = p.elem.load(Ordering::Acquire);
                waiter.links.lock().parent = Arc::downgrade(p);
                if key < node_key {
                    p.links.lock().prev = Some(Arc::clone(&waiter));
                } else {
                    p.links.lock().next = Some(Arc::clone(&waiter));
                }
            }
        }

        // Bubble up to restore min-heap ticket order.
        loop {
            let parent = waiter.links.lock().parent.upgrade();
            let Some(p) = parent else { break };
            if p.ticket() <= waiter.ticket() {
                break;
            }
            let is_left = p
                .links
                .lock()
                .prev
                .as_ref()
                .map(|n| same(n, &waiter))
                .unwrap_or(false);
            if is_left {
                rotate_right(&mut *head, &p);
            } else {
                rotate_left(&mut *head, &p);
            }
        }
    }

    /// Remove the waiter belonging to `fiber_desc` that is parked on the
    /// treap key `key`. Fatal if the address or fiber is missing: a reclaimed
    /// fiber's bookkeeping said it was here.
    pub(crate) fn dequeue_fiber(&self, key: usize, fiber_desc: usize) -> Arc<Waiter> {
        let mut head = self.treap.lock();

        // Find the head waiter for this address.
        let mut cursor = head.clone();
        let s = loop {
            let Some(node) = cursor else {
                panic!("sema address {key:#x} not found in the sema table");
            };
            let node_key = node.elem.load(Ordering::Acquire);
            if node_key == key {
                break node;
            }
            cursor = if key < node_key {
                node.links.lock().prev.clone()
            } else {
                node.links.lock().next.clone()
            };
        };

        let target;
        let chained = s.links.lock().waitlink.clone();
        if let Some(first_link) = chained {
            // Walk the chain for the right waiter.
            let mut pred: Option<Arc<Waiter>> = None;
            let mut found = Some(Arc::clone(&s));
            while let Some(node) = found.clone() {
                if node.fiber_descriptor() == fiber_desc {
                    break;
                }
                let next = node.links.lock().waitlink.clone();
                pred = Some(node);
                found = next;
            }
            let Some(node) = found else {
                panic!("unreachable fiber {fiber_desc:#x} not found in the sema table");
            };
            target = node;

            if same(&target, &s) {
                // Removing the head: promote the second waiter into the tree.
                let t = first_link;
                let (s_ticket, s_parent, s_prev, s_next, s_waittail) = {
                    let sl = s.links.lock();
                    (
                        s.ticket(),
                        sl.parent.clone(),
                        sl.prev.clone(),
                        sl.next.clone(),
                        sl.waittail.clone(),
                    )
                };
                t.ticket.store(s_ticket, Ordering::Release);
                {
                    let mut tl = t.links.lock();
                    tl.parent = s_parent.clone();
                    tl.prev = s_prev.clone();
                    tl.next = s_next.clone();
                    tl.waittail = if tl.waitlink.is_some() {
                        s_waittail
                    } else {
                        None
                    };
                }
                if let Some(prev) = &t.links.lock().prev {
                    prev.links.lock().parent = Arc::downgrade(&t);
                }
                if let Some(next) = &t.links.lock().next {
                    next.links.lock().parent = Arc::downgrade(&t);
                }
                replace_child(&mut *head, s_parent.upgrade().as_ref(), &s, Some(t));
            } else {
                // Unlink a mid-chain waiter.
                let pred = pred.expect("mid-chain waiter must have a predecessor");
                let after = target.links.lock().waitlink.clone();
                pred.links.lock().waitlink = after.clone();
                if after.is_none() {
                    s.links.lock().waittail = Some(pred);
                }
            }
            let mut tl = target.links.lock();
            tl.waitlink = None;
            tl.waittail = None;
        } else {
            if s.fiber_descriptor() != fiber_desc {
                panic!(
                    "sema dequeue targeted the wrong waiter: wanted {fiber_desc:#x}, got {:#x}",
                    s.fiber_descriptor()
                );
            }
            target = Arc::clone(&s);
            // Rotate down to a leaf, respecting ticket priorities.
            loop {
                let (prev, next) = {
                    let links = target.links.lock();
                    (links.prev.clone(), links.next.clone())
                };
                match (prev, next) {
                    (None, None) => break,
                    (Some(_), None) => rotate_right(&mut *head, &target),
                    (None, Some(_)) => rotate_left(&mut *head, &target),
                    (Some(p), Some(n)) => {
                        if p.ticket() < n.ticket() {
                            rotate_right(&mut *head, &target);
                        } else {
                            rotate_left(&mut *head, &target);
                        }
                    }
                }
            }
            let parent = target.links.lock().parent.upgrade();
            replace_child(&mut *head, parent.as_ref(), &target, None);
        }

        target.clear_tree_links();
        let old = self.nwait.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "sema nwait underflow");
        target
    }

    #[cfg(test)]
    fn validate(&self) {
        fn walk(node: &Arc<Waiter>, lo: usize, hi: usize) {
            let key = node.elem.load(Ordering::Acquire);
            assert!(key > lo && key < hi, "treap key order violated");
            let (prev, next) = {
                let links = node.links.lock();
                (links.prev.clone(), links.next.clone())
            };
            if let Some(prev) = prev {
                assert!(prev.ticket() >= node.ticket(), "ticket heap order violated");
                walk(&prev, lo, key);
            }
            if let Some(next) = next {
                assert!(next.ticket() >= node.ticket(), "ticket heap order violated");
                walk(&next, key, hi);
            }
        }
        if let Some(root) = self.treap.lock().clone() {
            walk(&root, 0, usize::MAX);
        }
    }
}

/// The table of sema roots, bucketed by wait-word address.
pub struct SemaTable {
    roots: Vec<Arc<SemaRoot>>,
}

impl SemaTable {
    pub fn new() -> Self {
        Self {
            roots: (0..SEMA_TAB_SIZE).map(|_| Arc::new(SemaRoot::new())).collect(),
        }
    }

    pub fn root_for(&self, addr: usize) -> &Arc<SemaRoot> {
        &self.roots[(addr >> 3) % SEMA_TAB_SIZE]
    }
}

impl Default for SemaTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A condition-variable notifier list.
pub struct NotifyList {
    /// Heap descriptor address identifying this list.
    addr: usize,
    waiters: Mutex<VecDeque<Arc<Waiter>>>,
}

impl NotifyList {
    pub fn new(addr: usize) -> Self {
        Self {
            addr,
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Remove the waiter parked for `fiber_desc`, if present.
    pub(crate) fn dequeue_fiber(&self, fiber_desc: usize) -> Option<Arc<Waiter>> {
        let mut waiters = self.waiters.lock();
        let pos = waiters
            .iter()
            .position(|w| w.fiber_descriptor() == fiber_desc)?;
        waiters.remove(pos)
    }
}

/// Wait queues of one channel, tracked by the channel's heap address.
pub struct ChanWaitq {
    chan: usize,
    recvq: Mutex<VecDeque<Arc<Waiter>>>,
    sendq: Mutex<VecDeque<Arc<Waiter>>>,
}

/// Direction of a channel park.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanDir {
    Recv,
    Send,
}

impl ChanWaitq {
    fn new(chan: usize) -> Self {
        Self {
            chan,
            recvq: Mutex::new(VecDeque::new()),
            sendq: Mutex::new(VecDeque::new()),
        }
    }

    pub fn waiters(&self) -> usize {
        self.recvq.lock().len() + self.sendq.lock().len()
    }

    /// Rewrite the fiber-pointer slots of the channel object from the current
    /// queues. Slot zero stays the channel's own header word.
    fn republish_slots(&self) {
        let mut slot = 1;
        for queue in [&self.recvq, &self.sendq] {
            for waiter in queue.lock().iter() {
                write_word(self.chan + slot * 8, waiter.fiber_raw());
                slot += 1;
            }
        }
        write_word(self.chan + slot * 8, 0);
    }

    fn push(&self, dir: ChanDir, waiter: Arc<Waiter>) {
        match dir {
            ChanDir::Recv => self.recvq.lock().push_back(waiter),
            ChanDir::Send => self.sendq.lock().push_back(waiter),
        }
        self.republish_slots();
    }

    pub(crate) fn remove(&self, waiter: &Arc<Waiter>) -> bool {
        for queue in [&self.recvq, &self.sendq] {
            let mut q = queue.lock();
            if let Some(pos) = q.iter().position(|w| same(w, waiter)) {
                q.remove(pos);
                drop(q);
                self.republish_slots();
                return true;
            }
        }
        false
    }
}

/// Registry of channel wait queues, keyed by channel heap address.
pub struct ChanTable {
    chans: DashMap<usize, Arc<ChanWaitq>>,
}

impl ChanTable {
    pub fn new() -> Self {
        Self {
            chans: DashMap::new(),
        }
    }

    pub fn waitq(&self, chan: usize) -> Arc<ChanWaitq> {
        Arc::clone(
            self.chans
                .entry(chan)
                .or_insert_with(|| Arc::new(ChanWaitq::new(chan)))
                .value(),
        )
    }

    pub fn get(&self, chan: usize) -> Option<Arc<ChanWaitq>> {
        self.chans.get(&chan).map(|e| Arc::clone(e.value()))
    }
}

impl Default for ChanTable {
    fn default() -> Self {
        Self::new()
    }
}

fn transition_to_waiting(fiber: &Fiber, reason: WaitReason) {
    fiber.set_wait_reason(reason);
    fiber.waitsince.store(0, Ordering::Release);
    if !fiber.cas_state(FiberState::Running, FiberState::Waiting)
        && !fiber.cas_state(FiberState::Runnable, FiberState::Waiting)
    {
        panic!("park: fiber {} not running or runnable", fiber.id());
    }
}

/// Park `fiber` on the semaphore at `addr` (an address inside a heap object).
pub fn park_on_sema(
    table: &SemaTable,
    pool: &WaiterPool,
    policy: DeadlockPolicy,
    fiber: &Arc<Fiber>,
    addr: usize,
    reason: WaitReason,
) {
    let waiter = pool.acquire();
    waiter.set_fiber(tag(fiber.descriptor(), policy));
    table
        .root_for(addr)
        .queue(tag(addr, policy), Arc::clone(&waiter));
    fiber
        .waiting_sema
        .store(tag(addr, policy), Ordering::Release);
    transition_to_waiting(fiber, reason);
}

/// Park `fiber` on a condition-variable notifier list.
pub fn park_on_notifier(
    list: &NotifyList,
    pool: &WaiterPool,
    policy: DeadlockPolicy,
    fiber: &Arc<Fiber>,
) {
    let waiter = pool.acquire();
    waiter.set_fiber(tag(fiber.descriptor(), policy));
    waiter.elem.store(tag(list.addr(), policy), Ordering::Release);
    list.waiters.lock().push_back(waiter);
    fiber
        .waiting_notifier
        .store(tag(list.addr(), policy), Ordering::Release);
    transition_to_waiting(fiber, WaitReason::SyncCondWait);
}

/// Park `fiber` on one or more channel operations. More than one case makes
/// this a select park.
pub fn park_on_chans(
    chans: &ChanTable,
    pool: &WaiterPool,
    policy: DeadlockPolicy,
    fiber: &Arc<Fiber>,
    cases: &[(usize, ChanDir)],
    reason: WaitReason,
) {
    assert!(!cases.is_empty(), "channel park with no cases");
    let is_select = cases.len() > 1;
    let mut waiting = fiber.waiting.lock();
    for &(chan, dir) in cases {
        let waiter = pool.acquire();
        waiter.set_fiber(tag(fiber.descriptor(), policy));
        waiter.chan.store(chan, Ordering::Release);
        waiter.is_select.store(is_select, Ordering::Release);
        chans.waitq(chan).push(dir, Arc::clone(&waiter));
        waiting.push(waiter);
    }
    drop(waiting);
    transition_to_waiting(fiber, reason);
}
