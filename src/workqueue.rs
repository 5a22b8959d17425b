//! Grey-object work buffers: a per-worker pair of bounded buffers backed by
//! global lock-free lists of full and empty buffers.
//!
//! Work items are object base addresses. There are no ordering guarantees
//! across workers; the only contract is that `put` always succeeds and that a
//! buffer pushed to the full list is eventually drained by some worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::controller::Controller;
use crate::fiber::Fiber;

/// Capacity of one work buffer.
pub const WORK_BUF_CAP: usize = 256;

/// One bounded buffer of grey object addresses.
pub struct WorkBuf {
    items: Vec<usize>,
}

impl WorkBuf {
    fn new() -> Self {
        Self {
            items: Vec::with_capacity(WORK_BUF_CAP),
        }
    }

    fn is_full(&self) -> bool {
        self.items.len() >= WORK_BUF_CAP
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Global lists of full and empty work buffers, shared by every worker.
pub struct WorkLists {
    full: SegQueue<WorkBuf>,
    empty: SegQueue<WorkBuf>,
    /// Total grey objects enqueued over the cycle, for reports.
    pub enqueued: AtomicU64,
}

impl WorkLists {
    pub fn new() -> Self {
        Self {
            full: SegQueue::new(),
            empty: SegQueue::new(),
            enqueued: AtomicU64::new(0),
        }
    }

    /// Whether any full buffer is available globally.
    pub fn has_full(&self) -> bool {
        !self.full.is_empty()
    }

    fn get_empty(&self) -> WorkBuf {
        self.empty.pop().unwrap_or_else(WorkBuf::new)
    }

    fn put_full(&self, buf: WorkBuf) {
        debug_assert!(!buf.is_empty());
        self.full.push(buf);
    }

    fn put_empty(&self, buf: WorkBuf) {
        debug_assert!(buf.is_empty());
        self.empty.push(buf);
    }
}

impl Default for WorkLists {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-worker marking state: the local buffer pair, scan-work accounting, the
/// write-barrier buffer, and the worker's fiber identity (used by the
/// self-scan guard).
pub struct GcWork {
    lists: Arc<WorkLists>,
    wbuf1: WorkBuf,
    wbuf2: WorkBuf,
    /// Bytes of heap blackened by this worker since the last flush.
    pub bytes_marked: u64,
    /// Heap scan work performed since the last flush to the controller.
    pub heap_scan_work: i64,
    /// Pending write-barrier shades, drained by `wb_buf_flush`.
    pub(crate) wb_buf: Vec<usize>,
    /// Pending tiny allocation block, greyed at mark start.
    pub(crate) tiny: usize,
    /// The fiber this worker is currently executing on behalf of, if any.
    pub current_fiber: Option<Arc<Fiber>>,
}

impl GcWork {
    pub fn new(lists: Arc<WorkLists>) -> Self {
        Self {
            lists,
            wbuf1: WorkBuf::new(),
            wbuf2: WorkBuf::new(),
            bytes_marked: 0,
            heap_scan_work: 0,
            wb_buf: Vec::new(),
            tiny: 0,
            current_fiber: None,
        }
    }

    pub fn lists(&self) -> &Arc<WorkLists> {
        &self.lists
    }

    /// Fast-path put into the primary buffer. Returns false when full.
    pub fn put_fast(&mut self, obj: usize) -> bool {
        if self.wbuf1.is_full() {
            return false;
        }
        self.wbuf1.items.push(obj);
        self.lists.enqueued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Put that always succeeds, spilling a full buffer to the global list.
    pub fn put(&mut self, obj: usize) {
        if self.put_fast(obj) {
            return;
        }
        std::mem::swap(&mut self.wbuf1, &mut self.wbuf2);
        if self.wbuf1.is_full() {
            let full = std::mem::replace(&mut self.wbuf1, self.lists.get_empty());
            self.lists.put_full(full);
        }
        self.wbuf1.items.push(obj);
        self.lists.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Fast-path get from the primary buffer.
    pub fn try_get_fast(&mut self) -> Option<usize> {
        self.wbuf1.items.pop()
    }

    /// Get that also consults the secondary buffer and the global full list.
    pub fn try_get(&mut self) -> Option<usize> {
        if let Some(obj) = self.try_get_fast() {
            return Some(obj);
        }
        if !self.wbuf2.is_empty() {
            std::mem::swap(&mut self.wbuf1, &mut self.wbuf2);
            return self.try_get_fast();
        }
        let full = self.lists.full.pop()?;
        let old = std::mem::replace(&mut self.wbuf1, full);
        debug_assert!(old.is_empty());
        self.lists.put_empty(old);
        self.try_get_fast()
    }

    /// Push excess local work to the global list so idle workers can help.
    /// Called when no full buffer exists globally.
    pub fn balance(&mut self) {
        if !self.wbuf2.is_empty() {
            let full = std::mem::replace(&mut self.wbuf2, self.lists.get_empty());
            self.lists.put_full(full);
            return;
        }
        if self.wbuf1.len() > 1 {
            let half = self.wbuf1.items.split_off(self.wbuf1.len() / 2);
            let mut buf = self.lists.get_empty();
            buf.items = half;
            self.lists.put_full(buf);
        }
    }

    /// Whether this worker holds any local work.
    pub fn has_local_work(&self) -> bool {
        !self.wbuf1.is_empty() || !self.wbuf2.is_empty()
    }

    /// Flush local buffers to the global lists and scan-work counters to the
    /// controller. Leaves the worker reusable.
    pub fn dispose(&mut self, controller: &Controller) {
        for buf in [&mut self.wbuf1, &mut self.wbuf2] {
            if !buf.is_empty() {
                let full = std::mem::replace(buf, WorkBuf::new());
                self.lists.put_full(full);
            }
        }
        if self.heap_scan_work != 0 {
            controller
                .heap_scan_work
                .fetch_add(self.heap_scan_work, Ordering::AcqRel);
            self.heap_scan_work = 0;
        }
        if self.bytes_marked != 0 {
            controller
                .bytes_marked
                .fetch_add(self.bytes_marked, Ordering::AcqRel);
            self.bytes_marked = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gcw() -> GcWork {
        GcWork::new(Arc::new(WorkLists::new()))
    }

    #[test]
    fn put_fast_fails_only_when_full() {
        let mut w = gcw();
        for i in 0..WORK_BUF_CAP {
            assert!(w.put_fast(0x1000 + i * 8));
        }
        assert!(!w.put_fast(0x9000));
    }

    #[test]
    fn put_always_succeeds_and_spills() {
        let mut w = gcw();
        let total = WORK_BUF_CAP * 3 + 7;
        for i in 0..total {
            w.put(0x1000 + i * 8);
        }
        assert!(w.lists().has_full());

        let mut got = 0;
        while w.try_get().is_some() {
            got += 1;
        }
        assert_eq!(got, total);
    }

    #[test]
    fn balance_publishes_local_work() {
        let mut w = gcw();
        for i in 0..16 {
            w.put(0x2000 + i * 8);
        }
        assert!(!w.lists().has_full());
        w.balance();
        assert!(w.lists().has_full());

        // Another worker can steal the published buffer.
        let mut thief = GcWork::new(Arc::clone(w.lists()));
        assert!(thief.try_get().is_some());
    }

    #[test]
    fn dispose_flushes_buffers_and_counters() {
        let controller = Controller::new(1);
        let mut w = gcw();
        w.put(0x3000);
        w.heap_scan_work = 128;
        w.bytes_marked = 64;
        w.dispose(&controller);
        assert!(w.lists().has_full());
        assert!(!w.has_local_work());
        assert_eq!(controller.heap_scan_work.load(Ordering::Acquire), 128);
        assert_eq!(controller.bytes_marked.load(Ordering::Acquire), 64);
        assert_eq!(w.heap_scan_work, 0);
    }

    #[test]
    fn cross_worker_handoff() {
        let lists = Arc::new(WorkLists::new());
        let mut producer = GcWork::new(Arc::clone(&lists));
        for i in 0..WORK_BUF_CAP * 2 {
            producer.put(0x4000 + i * 8);
        }
        let mut consumer = GcWork::new(lists);
        // Consumer sees only what was spilled globally.
        let mut seen = 0;
        while consumer.try_get().is_some() {
            seen += 1;
        }
        assert!(seen > 0);
        assert!(seen < WORK_BUF_CAP * 2);
    }
}
