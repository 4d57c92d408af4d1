//! The context-switch primitive.
//!
//! A `Context` is the saved execution state of one kernel control flow: a
//! CPU's scheduler loop or a process-control entry. Switching is an opaque
//! capability: the caller parks "here" and control reappears "over there",
//! possibly much later and possibly never. On this hosted kernel each
//! control flow is an OS thread and a `Context` is the park/resume token
//! for it; the semantics callers may rely on are exactly the ones the real
//! `swtch` assembly would give them.

use std::sync::{Condvar, Mutex};

/// Park/resume token for one kernel control flow.
pub struct Context {
    resumed: Mutex<bool>,
    cond: Condvar,
}

impl Context {
    pub fn new() -> Self {
        Self { resumed: Mutex::new(false), cond: Condvar::new() }
    }

    /// Park the calling thread until another control flow switches into us.
    /// A pending resume is consumed immediately.
    pub(crate) fn wait(&self) {
        let mut resumed = self.resumed.lock().expect("context state poisoned");
        while !*resumed {
            resumed = self.cond.wait(resumed).expect("context state poisoned");
        }
        *resumed = false;
    }

    /// Mark this context resumable and wake its thread if parked.
    fn post(&self) {
        let mut resumed = self.resumed.lock().expect("context state poisoned");
        *resumed = true;
        self.cond.notify_one();
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Switch out of `save` and into `load`.
///
/// Control transfers to the flow parked on `load`; the caller blocks until
/// some later switch targets `save` again. Whoever is switched into
/// inherits whatever lock state the caller held; in particular the
/// process-table lock is deliberately carried across this call.
pub fn swtch(save: &Context, load: &Context) {
    load.post();
    save.wait();
}
