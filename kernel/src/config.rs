//! Kernel construction parameters.

use crate::NCPU;

/// Boot-time configuration of the machine.
///
/// Tests construct one kernel per scenario, so everything that affects
/// scheduling behaviour (CPU count, memory budget, lottery seed) is a plain
/// field here rather than a compile-time constant.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Number of scheduling CPUs to bring online (1..=NCPU).
    pub ncpu: usize,
    /// Physical page budget shared by address spaces and kernel stacks.
    pub mem_pages: usize,
    /// Seed for the lottery draw source. Fixed seed, reproducible runs.
    pub rng_seed: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            ncpu: 2,
            mem_pages: 4096,
            rng_seed: 0x5EED_1075,
        }
    }
}

impl KernelConfig {
    /// Panics if the configuration is not bootable.
    pub(crate) fn validate(&self) {
        assert!(self.ncpu >= 1 && self.ncpu <= NCPU, "ncpu out of range");
        assert!(self.mem_pages >= 1, "no physical memory configured");
    }
}
