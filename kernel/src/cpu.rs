//! Per-CPU state and the current-CPU binding.
//!
//! Each scheduling CPU is an OS thread running `Kernel::scheduler`. A
//! process-control entry "runs on" whichever CPU last switched into it, so
//! the thread executing that entry temporarily carries the same CPU
//! binding. The binding lives in thread-local storage and is re-established
//! after every context switch.
//!
//! Interrupt delivery is simulated: `int_enabled` is bookkeeping only, but
//! the push_off/pop_off nesting discipline and its invariant checks are
//! enforced exactly, because the scheduling core's correctness arguments
//! depend on them.

use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicIsize, Ordering};

use crate::context::Context;
use crate::proc::Kernel;
use crate::NCPU;

/// Per-CPU state block.
pub struct Cpu {
    /// Slot index of the entry running on this CPU, or none.
    proc_idx: AtomicIsize,
    /// Scheduler-loop context for this CPU; entries switch back into it.
    pub(crate) scheduler: Context,
    /// Depth of push_off nesting.
    ncli: AtomicI32,
    /// Were interrupts enabled before the outermost push_off?
    intena: AtomicBool,
    /// Simulated interrupt-delivery flag for this CPU.
    int_enabled: AtomicBool,
}

impl Cpu {
    pub(crate) fn new() -> Self {
        Self {
            proc_idx: AtomicIsize::new(-1),
            scheduler: Context::new(),
            ncli: AtomicI32::new(0),
            intena: AtomicBool::new(false),
            int_enabled: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_proc(&self, idx: Option<usize>) {
        self.proc_idx.store(idx.map_or(-1, |i| i as isize), Ordering::SeqCst);
    }

    pub(crate) fn proc_idx(&self) -> Option<usize> {
        match self.proc_idx.load(Ordering::SeqCst) {
            n if n < 0 => None,
            n => Some(n as usize),
        }
    }

    /// Enable simulated interrupt delivery on this CPU.
    pub(crate) fn sti(&self) {
        self.int_enabled.store(true, Ordering::SeqCst);
    }

    /// Disable simulated interrupt delivery on this CPU.
    pub(crate) fn cli(&self) {
        self.int_enabled.store(false, Ordering::SeqCst);
    }

    pub(crate) fn int_enabled(&self) -> bool {
        self.int_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn ncli(&self) -> i32 {
        self.ncli.load(Ordering::SeqCst)
    }

    pub(crate) fn intena(&self) -> bool {
        self.intena.load(Ordering::SeqCst)
    }

    pub(crate) fn set_intena(&self, v: bool) {
        self.intena.store(v, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy)]
struct Binding {
    kernel: *const Kernel,
    cpu: usize,
}

thread_local! {
    /// CPU binding of the current thread, if it is executing kernel code.
    static BINDING: Cell<Option<Binding>> = const { Cell::new(None) };
    /// push_off depth for threads with no CPU binding (external callers).
    static EXT_NCLI: Cell<i32> = const { Cell::new(0) };
}

/// Bind the calling thread to a CPU of `kernel`. Called by scheduler loops
/// at startup and by entries after every context switch.
pub(crate) fn bind(kernel: &'static Kernel, cpu: usize) {
    BINDING.with(|b| b.set(Some(Binding { kernel, cpu })));
}

/// The kernel and CPU this thread is currently executing on, if any.
///
/// Kernels are leaked at boot and live forever, so the stored pointer is
/// always valid.
pub(crate) fn binding() -> Option<(&'static Kernel, usize)> {
    BINDING.with(|b| b.get()).map(|b| (unsafe { &*b.kernel }, b.cpu))
}

/// Lock-ownership token for the calling thread: the CPU id when bound, a
/// thread-derived token past NCPU otherwise. Ownership of a spin lock
/// follows the CPU, not the OS thread, which is what lets the table lock
/// transfer across a context switch.
pub(crate) fn owner_token() -> u64 {
    match BINDING.with(|b| b.get()) {
        Some(b) => b.cpu as u64,
        None => {
            let mut h = DefaultHasher::new();
            std::thread::current().id().hash(&mut h);
            // Keep clear of the CPU id range.
            NCPU as u64 + 1 + (h.finish() >> 1)
        }
    }
}

/// Disable interrupt delivery on the current CPU, counting nesting depth.
/// Mirrors the classic pushcli: the pre-disable state is remembered only at
/// the outermost level.
pub(crate) fn push_off() {
    match binding() {
        Some((k, id)) => {
            let c = &k.cpus()[id];
            let was_enabled = c.int_enabled.swap(false, Ordering::SeqCst);
            if c.ncli.fetch_add(1, Ordering::SeqCst) == 0 {
                c.intena.store(was_enabled, Ordering::SeqCst);
            }
        }
        None => EXT_NCLI.with(|n| n.set(n.get() + 1)),
    }
}

/// Undo one level of push_off, restoring delivery at the outermost level.
pub(crate) fn pop_off() {
    match binding() {
        Some((k, id)) => {
            let c = &k.cpus()[id];
            if c.int_enabled.load(Ordering::SeqCst) {
                panic!("pop_off: interruptible");
            }
            let prev = c.ncli.fetch_sub(1, Ordering::SeqCst);
            if prev < 1 {
                panic!("pop_off: unbalanced");
            }
            if prev == 1 && c.intena.load(Ordering::SeqCst) {
                c.int_enabled.store(true, Ordering::SeqCst);
            }
        }
        None => EXT_NCLI.with(|n| {
            if n.get() < 1 {
                panic!("pop_off: unbalanced");
            }
            n.set(n.get() - 1);
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_threads_get_stable_non_cpu_tokens() {
        let t1 = owner_token();
        let t2 = owner_token();
        assert_eq!(t1, t2);
        assert!(t1 > NCPU as u64);

        let other = std::thread::spawn(owner_token).join().unwrap();
        assert_ne!(t1, other);
    }

    #[test]
    fn external_push_pop_balances() {
        push_off();
        push_off();
        pop_off();
        pop_off();
    }

    #[test]
    #[should_panic(expected = "unbalanced")]
    fn unbalanced_pop_is_fatal() {
        pop_off();
    }
}
