//! clone/join: shared address spaces, initial stack frames, and the
//! wait/join reaping split.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use lotos_kernel::{Kernel, KernelConfig, PGSIZE};

// ---------------------------------------------------------------------------
// clone shares the address space; join returns the thread's stack
// ---------------------------------------------------------------------------

struct CloneShared {
    done: AtomicBool,
    checks_done: AtomicBool,
    grown_to: AtomicUsize,
}

fn clone_worker(k: &'static Kernel, a1: usize, _a2: usize) {
    let sh: &CloneShared = common::from_arg(a1);
    // Hold off until the parent has inspected the untouched state.
    while !sh.checks_done.load(Ordering::SeqCst) {
        k.yield_now();
    }
    // Grow through the shared space; the parent must observe the new size.
    let new = k.growproc(PGSIZE as isize).unwrap();
    sh.grown_to.store(new, Ordering::SeqCst);
    k.exit();
}

fn clone_main(k: &'static Kernel, a1: usize, _a2: usize) {
    let sh: &CloneShared = common::from_arg(a1);

    // Carve a stack page for the thread at the top of our space.
    let size = k.growproc(PGSIZE as isize).unwrap();
    let stack = size - PGSIZE;
    let pages = k.free_pages();

    let tid = k.clone_thread(clone_worker, a1, 7, stack).unwrap();
    // A thread costs a kernel stack and nothing else: the space is shared.
    assert_eq!(k.free_pages(), pages - lotos_kernel::KSTACKPAGES);

    // The initial frame sits at the top of the supplied page: a sentinel
    // where a return address would be, then the two argument words.
    let mut frame = [0u8; 24];
    k.copyin(stack + PGSIZE - 24, &mut frame).unwrap();
    assert_eq!(u64::from_le_bytes(frame[0..8].try_into().unwrap()), 0xFFFF_FFFF);
    assert_eq!(u64::from_le_bytes(frame[8..16].try_into().unwrap()), a1 as u64);
    assert_eq!(u64::from_le_bytes(frame[16..24].try_into().unwrap()), 7);
    sh.checks_done.store(true, Ordering::SeqCst);

    let (pid, st) = k.join().unwrap();
    assert_eq!(pid, tid);
    assert_eq!(st, stack);

    // Kernel stack reclaimed; the shared space survives the join and is
    // the one the thread grew.
    assert_eq!(k.free_pages(), pages - 1);
    assert_eq!(k.growproc(0).unwrap(), sh.grown_to.load(Ordering::SeqCst));

    sh.done.store(true, Ordering::SeqCst);
    loop {
        k.yield_now();
    }
}

#[test]
fn clone_aliases_space_and_join_returns_stack() {
    let sh = common::leak(CloneShared {
        done: AtomicBool::new(false),
        checks_done: AtomicBool::new(false),
        grown_to: AtomicUsize::new(0),
    });
    common::boot_and_run(KernelConfig::default(), clone_main, common::arg(sh), &sh.done);
}

// ---------------------------------------------------------------------------
// wait reaps processes only, join reaps threads only
// ---------------------------------------------------------------------------

struct SplitShared {
    done: AtomicBool,
}

fn split_worker(k: &'static Kernel, _a1: usize, _a2: usize) {
    k.exit();
}

fn split_main(k: &'static Kernel, a1: usize, _a2: usize) {
    if k.fork_return() == 0 {
        k.exit();
    }
    let sh: &SplitShared = common::from_arg(a1);

    let size = k.growproc(PGSIZE as isize).unwrap();
    let tid = k.clone_thread(split_worker, 0, 0, size - PGSIZE).unwrap();
    let cid = k.fork().unwrap();

    // join skips the fork child even if it is already a zombie, and wait
    // skips the thread even if it exited first.
    let (jpid, _) = k.join().unwrap();
    assert_eq!(jpid, tid);
    assert_eq!(k.wait().unwrap(), cid);

    assert!(k.join().is_err());
    assert!(k.wait().is_err());

    sh.done.store(true, Ordering::SeqCst);
    loop {
        k.yield_now();
    }
}

#[test]
fn wait_and_join_reap_disjoint_kinds() {
    let sh = common::leak(SplitShared { done: AtomicBool::new(false) });
    common::boot_and_run(KernelConfig::default(), split_main, common::arg(sh), &sh.done);
}

// ---------------------------------------------------------------------------
// invalid thread stacks are rejected without consuming anything
// ---------------------------------------------------------------------------

struct BadStackShared {
    done: AtomicBool,
}

fn never_runs(_k: &'static Kernel, _a1: usize, _a2: usize) {
    unreachable!("entry with a rejected stack must never run");
}

fn bad_stack_main(k: &'static Kernel, a1: usize, _a2: usize) {
    let sh: &BadStackShared = common::from_arg(a1);
    let size = k.growproc(0).unwrap();
    let pages = k.free_pages();
    let slots = k.getpinfo().inuse_count();

    // Unaligned base.
    assert!(k.clone_thread(never_runs, 0, 0, 123).is_err());
    // Page-aligned but past the end of the space.
    assert!(k.clone_thread(never_runs, 0, 0, size).is_err());

    assert_eq!(k.free_pages(), pages);
    assert_eq!(k.getpinfo().inuse_count(), slots);
    assert!(k.join().is_err());

    sh.done.store(true, Ordering::SeqCst);
    loop {
        k.yield_now();
    }
}

#[test]
fn bad_clone_stacks_rejected_cleanly() {
    let sh = common::leak(BadStackShared { done: AtomicBool::new(false) });
    common::boot_and_run(KernelConfig::default(), bad_stack_main, common::arg(sh), &sh.done);
}
