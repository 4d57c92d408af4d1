//! Shared scaffolding for the integration tests.
//!
//! Every test boots its own kernel, installs a root-process entry that
//! drives the scenario, and polls a completion flag from the host test
//! thread. Scenario state crosses into entries as a leaked `&'static`
//! pointer smuggled through the entry's argument word.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use lotos_kernel::{Kernel, KernelConfig, ProcEntry};

/// Install the test logger once per process.
pub fn init_logging() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Promote scenario state to `'static` so entries can reference it.
pub fn leak<T>(v: T) -> &'static T {
    Box::leak(Box::new(v))
}

/// Pack a `'static` reference into an entry argument word.
pub fn arg<T>(r: &'static T) -> usize {
    r as *const T as usize
}

/// Unpack an entry argument word produced by [`arg`].
pub fn from_arg<T>(a: usize) -> &'static T {
    unsafe { &*(a as *const T) }
}

/// Boot a kernel, run `entry` as the root process, and block the host
/// thread until `done` is raised. Shuts the CPUs down afterwards and
/// panics (with a table dump) if the scenario stalls.
pub fn boot_and_run(
    config: KernelConfig,
    entry: ProcEntry,
    arg1: usize,
    done: &'static AtomicBool,
) -> &'static Kernel {
    init_logging();
    let k = Kernel::boot(config);
    k.userinit("init", entry, arg1, 0).expect("userinit failed");
    let cpus = k.start_cpus();

    let deadline = Instant::now() + Duration::from_secs(60);
    while !done.load(Ordering::SeqCst) {
        if Instant::now() > deadline {
            k.procdump();
            panic!("scenario did not complete in time");
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    k.shutdown();
    for c in cpus {
        c.join().expect("cpu thread panicked");
    }
    k
}
