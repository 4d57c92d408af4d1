//! Blocking FIFO lock built on sleep/wakeup.
//!
//! Bakery-style: acquirers take a ticket from a monotonically increasing
//! counter and the lock serves tickets strictly in order, so acquisition is
//! first-come-first-served regardless of scheduling luck. Waiters sleep
//! instead of spinning, which makes this safe to hold across long critical
//! sections but also means it can only be taken by a running entry, never
//! by a scheduler loop.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::proc::Kernel;

/// Sleeping mutual-exclusion lock with FIFO admission.
pub struct TicketLock {
    next_ticket: AtomicU32,
    /// Ticket currently being served.
    turn: AtomicU32,
    name: &'static str,
}

impl TicketLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            turn: AtomicU32::new(0),
            name,
        }
    }

    /// Wakeup channel: the lock's own address.
    fn chan(&self) -> usize {
        self as *const TicketLock as usize
    }

    /// Take a ticket and block until it is served. Returns the ticket,
    /// which callers can use to observe admission order. Interrupt
    /// delivery on the owning CPU stays off for the whole critical
    /// section.
    pub fn acquire(&self, k: &'static Kernel) -> u32 {
        k.mycpu().cli();
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        // The turn check and the transition to sleep must be atomic with
        // respect to release(), or a wakeup could slip in between and be
        // lost. The table lock is the guard that makes them so.
        let ptl = k.table_lock();
        ptl.acquire();
        while self.turn.load(Ordering::SeqCst) != ticket {
            k.sleep(self.chan(), ptl);
        }
        ptl.release();
        log::trace!("{}: serving ticket {}", self.name, ticket);
        ticket
    }

    /// Serve the next ticket and wake all waiters; each re-checks whether
    /// its turn has come.
    pub fn release(&self, k: &'static Kernel) {
        self.turn.fetch_add(1, Ordering::SeqCst);
        k.wakeup(self.chan());
        k.mycpu().sti();
    }
}
