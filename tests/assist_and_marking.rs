//! Assist-credit accounting driven end to end against a live mark phase, and
//! whole-cycle marking properties.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use weftgc::assist::{gc_assist_alloc, gc_flush_bg_credit};
use weftgc::config::GcConfig;
use weftgc::context::CollectorContext;
use weftgc::fiber::FiberState;
use weftgc::heap::write_word;
use weftgc::roots::{GlobalRegion, ModuleGlobals};
use weftgc::scan::shade;
use weftgc::Collector;

/// Seed roughly `units` of heap scan work as grey objects on the global
/// queue.
fn seed_scan_work(ctx: &CollectorContext, units: usize) {
    let obj_words = 8 << 10; // 64 KiB per object
    let mask = vec![0xffu8; obj_words / 8];
    let mut seeder = ctx.new_worker();
    let mut seeded = 0;
    while seeded < units {
        let obj = ctx.heap.allocate(obj_words, &mask, false);
        shade(ctx, &mut seeder, obj);
        seeded += obj_words * 8;
    }
    seeder.dispose(&ctx.controller);
}

#[test]
fn assist_pays_off_a_one_mib_debt() {
    let ctx = CollectorContext::new(GcConfig::default(), 1);
    ctx.controller.set_barrier_enabled(true);
    ctx.controller.set_blacken_enabled(true);
    ctx.controller.set_assist_ratio(0.5);

    // 1 MiB of allocation at 0.5 work/byte means 512 Ki units of debt.
    seed_scan_work(&ctx, 1 << 20);

    let mutator = ctx.spawn_fiber(64);
    assert!(mutator.cas_state(FiberState::Runnable, FiberState::Running));
    mutator.charge_allocation(1 << 20);
    assert_eq!(mutator.assist_bytes(), -(1 << 20));

    gc_assist_alloc(&ctx, &mutator);

    assert!(
        mutator.assist_bytes() >= 0,
        "assist must restore a non-negative balance, got {}",
        mutator.assist_bytes()
    );
    assert!(ctx.controller.heap_scan_work.load(Ordering::Acquire) > 0);
}

#[test]
fn parked_assist_is_satisfied_by_background_flush() {
    let ctx = Arc::new(CollectorContext::new(GcConfig::default(), 1));
    ctx.controller.set_barrier_enabled(true);
    ctx.controller.set_blacken_enabled(true);
    ctx.controller.set_assist_ratio(0.5);

    let mutator = ctx.spawn_fiber(64);
    assert!(mutator.cas_state(FiberState::Runnable, FiberState::Running));
    mutator.charge_allocation(1 << 20);

    // No work anywhere: the assist must park and wait for credit.
    let assist = {
        let ctx = Arc::clone(&ctx);
        let mutator = Arc::clone(&mutator);
        std::thread::spawn(move || gc_assist_alloc(&ctx, &mutator))
    };

    // Produce background credit until the assist is satisfied.
    for _ in 0..100 {
        gc_flush_bg_credit(&ctx, 64 << 10);
        if assist.is_finished() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assist.join().unwrap();
    assert!(mutator.assist_bytes() >= 0);
    assert_eq!(mutator.state(), FiberState::Running);
}

#[test]
fn background_credit_converges_over_a_cycle() {
    let ctx = CollectorContext::new(GcConfig::default(), 1);
    ctx.controller.set_barrier_enabled(true);
    ctx.controller.set_blacken_enabled(true);
    ctx.controller.set_assist_ratio(1.0);

    seed_scan_work(&ctx, 256 << 10);

    // Background draining flushes credit in; a stealing assist draws it out.
    let mut gcw = ctx.new_worker();
    weftgc::gc_drain(
        &ctx,
        &mut gcw,
        weftgc::DrainFlags::FLUSH_BG_CREDIT,
    );
    gcw.dispose(&ctx.controller);
    let produced = ctx.controller.bg_scan_credit.load(Ordering::Acquire);
    assert!(produced > 0);

    let mutator = ctx.spawn_fiber(64);
    assert!(mutator.cas_state(FiberState::Runnable, FiberState::Running));
    mutator.charge_allocation(produced);
    gc_assist_alloc(&ctx, &mutator);

    // Credit in equals credit out, up to the over-assist rounding.
    let remaining = ctx.controller.bg_scan_credit.load(Ordering::Acquire);
    assert!(remaining < produced);
    assert!(mutator.assist_bytes() >= 0);
}

#[test]
fn full_cycle_marks_everything_reachable_from_untagged_roots() {
    let collector = Collector::new(GcConfig::default(), 4);
    let ctx = collector.context();

    // A small object graph rooted in globals: root -> mid -> leaf, plus an
    // unreachable clique.
    let leaf = ctx.heap.allocate(2, &[0], true);
    let mid = ctx.heap.allocate(2, &[0b01], false);
    write_word(mid, leaf);
    let root = ctx.heap.allocate(2, &[0b01], false);
    write_word(root, mid);

    let garbage_a = ctx.heap.allocate(2, &[0b01], false);
    let garbage_b = ctx.heap.allocate(2, &[0b01], false);
    write_word(garbage_a, garbage_b);
    write_word(garbage_b, garbage_a);

    let mut data = GlobalRegion::new(4, vec![0b1]);
    data.set_word(0, root);
    ctx.modules.write().push(ModuleGlobals {
        data,
        bss: GlobalRegion::empty(),
    });

    collector.collect().unwrap();

    for obj in [root, mid, leaf] {
        assert!(ctx.heap.is_marked_addr(obj), "{obj:#x} must be marked");
    }
    for obj in [garbage_a, garbage_b] {
        assert!(!ctx.heap.is_marked_addr(obj), "{obj:#x} must stay white");
    }
}

#[test]
fn finalizer_specials_retain_referents_but_not_the_object() {
    let collector = Collector::new(GcConfig::default(), 2);
    let ctx = collector.context();

    // An otherwise-dead object with a finalizer: what it points to survives,
    // the object itself stays collectable.
    let referent = ctx.heap.allocate(2, &[0], true);
    let finalized = ctx.heap.allocate(2, &[0b01], false);
    write_word(finalized, referent);
    let closure = ctx.heap.allocate(2, &[0], true);
    ctx.heap.add_finalizer_special(finalized, closure);

    collector.collect().unwrap();

    assert!(ctx.heap.is_marked_addr(referent));
    assert!(ctx.heap.is_marked_addr(closure));
    assert!(!ctx.heap.is_marked_addr(finalized));
}

#[test]
fn write_barrier_keeps_concurrent_stores_alive() {
    let ctx = CollectorContext::new(GcConfig::default(), 1);
    ctx.controller.set_barrier_enabled(true);
    ctx.controller.set_blacken_enabled(true);

    let mut gcw = ctx.new_worker();
    let holder = ctx.heap.allocate(2, &[0b01], false);
    let hidden = ctx.heap.allocate(2, &[0], true);

    // The mutator stores a pointer after marking started; the barrier shades
    // the destination even though no root references it.
    weftgc::scan::barrier_store(&ctx, &mut gcw, holder, hidden);
    weftgc::gc_drain(&ctx, &mut gcw, weftgc::DrainFlags::empty());

    assert!(ctx.heap.is_marked_addr(hidden));
}
