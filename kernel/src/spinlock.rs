//! Non-blocking spin primitive guarding the process-control table (and any
//! other condition a sleeper needs a guard for).
//!
//! This is deliberately not a guard-based mutex: the scheduler acquires the
//! table lock, switches into a winner, and the winner releases it; the
//! lock's ownership crosses a context switch, which no RAII guard can
//! express. Ownership is therefore tracked by CPU, and acquire/release are
//! explicit calls with holding() checks.
//!
//! Code that can block must never hold this lock except through the
//! sanctioned sched/switch path. The blocking ticket lock is a separate
//! primitive layered on sleep/wakeup; it cannot be used here because
//! sleep/wakeup itself depends on this lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::cpu;

const OWNER_NONE: u64 = u64::MAX;

/// Busy-wait mutual exclusion with CPU-based ownership.
pub struct SpinLock {
    locked: AtomicBool,
    owner: AtomicU64,
    name: &'static str,
}

impl SpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU64::new(OWNER_NONE),
            name,
        }
    }

    /// Acquire the lock, spinning until it is free. Disables interrupt
    /// delivery on the owning CPU first to avoid self-deadlock from
    /// re-entrant scheduling paths.
    pub fn acquire(&self) {
        cpu::push_off();
        if self.holding() {
            panic!("acquire: already holding {}", self.name);
        }
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.owner.store(cpu::owner_token(), Ordering::Relaxed);
    }

    /// Release the lock. Fatal if the calling CPU does not hold it.
    pub fn release(&self) {
        if !self.holding() {
            panic!("release: not holding {}", self.name);
        }
        self.owner.store(OWNER_NONE, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        cpu::pop_off();
    }

    /// Does the calling CPU (or unbound thread) hold this lock?
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.owner.load(Ordering::Relaxed) == cpu::owner_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn acquire_release_tracks_holding() {
        let lk = SpinLock::new("test");
        assert!(!lk.holding());
        lk.acquire();
        assert!(lk.holding());
        lk.release();
        assert!(!lk.holding());
    }

    #[test]
    #[should_panic(expected = "already holding")]
    fn reacquire_is_fatal() {
        let lk = SpinLock::new("test");
        lk.acquire();
        lk.acquire();
    }

    #[test]
    #[should_panic(expected = "not holding")]
    fn foreign_release_is_fatal() {
        let lk = Arc::new(SpinLock::new("test"));
        lk.acquire();
        let lk2 = lk.clone();
        // A different unbound thread has a different owner token.
        std::thread::spawn(move || lk2.release()).join().unwrap_or_else(|e| std::panic::resume_unwind(e));
    }

    #[test]
    fn excludes_across_threads() {
        let lk = Arc::new(SpinLock::new("test"));
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let (lk, counter) = (lk.clone(), counter.clone());
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    lk.acquire();
                    // Non-atomic read-modify-write under the lock.
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    lk.release();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}
