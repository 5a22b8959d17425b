//! Structured per-fiber reports and the deadlock-detection trace stream.
//!
//! Reports render through `tracing` and are gated by the `ddtrace` verbosity
//! level; the same strings feed the fatal diagnostics other modules attach to
//! their panics.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::GcConfig;
use crate::fiber::{Fiber, FiberState, SCAN};

/// Human-readable rendering of a raw status word, including the scan bit.
pub fn status_string(raw: u32) -> String {
    let name = match FiberState::from_raw(raw) {
        FiberState::Runnable => "runnable",
        FiberState::Running => "running",
        FiberState::Syscall => "syscall",
        FiberState::Waiting => "waiting",
        FiberState::Dead => "dead",
        FiberState::Unreachable => "unreachable",
        FiberState::Deadlocked => "deadlocked",
    };
    if raw & SCAN != 0 {
        format!("scan|{name}")
    } else {
        name.to_string()
    }
}

/// One-line report used by snapshot dumps and fatal diagnostics.
pub fn fiber_report(fiber: &Arc<Fiber>) -> String {
    let stack = fiber.stack.lock();
    format!(
        "fiber {} [{}] wait: {:?} desc: {:#x} stack: [{:#x}, {:#x}) assist: {} scandone: {}",
        fiber.id(),
        status_string(fiber.read_status()),
        fiber.wait_reason().as_str(),
        fiber.descriptor(),
        stack.lo(),
        stack.hi(),
        fiber.assist_bytes(),
        fiber.scan_done.load(Ordering::Acquire),
    )
}

/// Multi-line report including the wait structures the fiber is parked on.
pub fn full_fiber_report(fiber: &Arc<Fiber>) -> String {
    let mut out = fiber_report(fiber);
    let sema = fiber.waiting_sema.load(Ordering::Acquire);
    if sema != 0 {
        out.push_str(&format!("\n  waiting on sema {sema:#x}"));
    }
    let notifier = fiber.waiting_notifier.load(Ordering::Acquire);
    if notifier != 0 {
        out.push_str(&format!("\n  waiting on notifier {notifier:#x}"));
    }
    for waiter in fiber.waiting.lock().iter() {
        out.push_str(&format!(
            "\n  waiting on chan {:#x} (select: {})",
            waiter.chan.load(Ordering::Acquire),
            waiter.is_select.load(Ordering::Acquire),
        ));
    }
    out
}

/// Emit the all-fibers snapshot dump at the given verbosity.
pub fn trace_snapshot(config: &GcConfig, fibers: &[Arc<Fiber>]) {
    if !(config.ddtrace(1) || config.ddtrace(2)) {
        return;
    }
    tracing::debug!(fibers = fibers.len(), "performing all-fiber snapshot");
    if config.ddtrace(1) {
        for fiber in fibers {
            tracing::debug!(report = %fiber_report(fiber), "snapshot entry");
        }
    }
}

/// Emit the root-drain banner.
pub fn trace_root_drain(config: &GcConfig, next: u32, jobs: u32, valid: usize, total: usize) {
    if !(config.ddtrace(1) || config.ddtrace(2)) {
        return;
    }
    tracing::debug!(
        root_next = next,
        root_jobs = jobs,
        valid_roots = valid,
        stack_roots = total,
        "draining root marking jobs"
    );
}

/// Emit a reclaim event for one fiber.
pub fn trace_reclaim(config: &GcConfig, fiber: &Arc<Fiber>) {
    if config.ddtrace(1) || config.ddtrace(2) {
        tracing::info!(report = %full_fiber_report(fiber), "reclaiming unreachable fiber");
    }
}
