//! Error taxonomy for the scheduling core.
//!
//! Only recoverable conditions are represented here: resource exhaustion,
//! invalid arguments, and no-work results. Logical-invariant violations
//! (table lock not held where required, running-state contradictions,
//! interruptible context where interrupts must be off) are fatal and panic
//! immediately instead of returning an error.

use core::fmt;

/// Recoverable failure reported by lifecycle and scheduling operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// No UNUSED slot is free in the process-control table.
    OutOfSlots,
    /// The physical page pool could not satisfy an allocation.
    OutOfMemory,
    /// A thread stack was not page-aligned or lies outside the caller's
    /// allocated address range.
    BadStack,
    /// An address or size argument falls outside the address space.
    BadAddress,
    /// A ticket weight below 1 was requested.
    BadTickets,
    /// wait()/join() found no qualifying children, or the caller was killed.
    NoChildren,
    /// No in-use entry carries the requested pid.
    NoSuchProc,
    /// The per-process open-file table is full.
    TooManyFiles,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::OutOfSlots => "no free process table slot",
            KernelError::OutOfMemory => "out of physical pages",
            KernelError::BadStack => "invalid thread stack",
            KernelError::BadAddress => "address out of range",
            KernelError::BadTickets => "ticket weight must be >= 1",
            KernelError::NoChildren => "no qualifying children",
            KernelError::NoSuchProc => "no such process",
            KernelError::TooManyFiles => "open file table full",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for KernelError {}

/// Result alias used throughout the kernel.
pub type Result<T> = core::result::Result<T, KernelError>;
