//! lotos-kernel: the scheduling and process-lifecycle core of a small
//! teaching kernel, run as a hosted simulation.
//!
//! The machine model: a fixed-size process-control table guarded by a
//! single spin lock, per-CPU scheduler loops that hold a lottery over
//! runnable entries each quantum, and a sleep/wakeup protocol that lets
//! entries block on arbitrary channels without losing wakeups. On top of
//! that sit the classic lifecycle operations (fork, clone, exit, wait,
//! join, kill) and a FIFO ticket lock built from sleep/wakeup.
//!
//! Each configured CPU is an OS thread running a scheduler loop, and each
//! process-control entry is an OS thread that parks until dispatched; the
//! "context switch" hands the flow of control (and ownership of the table
//! lock) between them. The surrounding kernel is simulated just far enough
//! for every failure path to be reachable: a finite page pool behind
//! address spaces and kernel stacks, and counted file handles.

mod config;
mod context;
mod cpu;
mod error;
mod file;
mod proc;
mod pstat;
mod rand;
mod spinlock;
mod ticketlock;
mod vm;

pub use config::KernelConfig;
pub use error::{KernelError, Result};
pub use proc::{Kernel, Pid, ProcEntry, ProcState};
pub use pstat::{PStat, PStatSlot};
pub use spinlock::SpinLock;
pub use ticketlock::TicketLock;

/// Maximum number of process-control entries.
pub const NPROC: usize = 64;
/// Maximum number of scheduling CPUs.
pub const NCPU: usize = 8;
/// Open-file slots per entry.
pub const NOFILE: usize = 16;
/// Page size of the simulated physical memory.
pub const PGSIZE: usize = 4096;
/// Pages charged for each entry's kernel stack.
pub const KSTACKPAGES: usize = 4;
