//! Scheduling snapshot exposed for introspection tooling.

use crate::NPROC;

/// One slot of the snapshot: identity plus scheduling counters.
///
/// Slots that are unused, or still under construction, report
/// `inuse == false` with zeroed fields so callers never observe a
/// partially-built entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PStatSlot {
    pub pid: u32,
    pub inuse: bool,
    /// Current ticket weight (lottery scheduling shares).
    pub tickets: u32,
    /// Scheduling quanta consumed so far.
    pub ticks: u64,
}

/// Whole-table snapshot, one record per table slot.
#[derive(Debug, Clone, Copy)]
pub struct PStat {
    pub slots: [PStatSlot; NPROC],
}

impl Default for PStat {
    fn default() -> Self {
        Self { slots: [PStatSlot::default(); NPROC] }
    }
}

impl PStat {
    /// Number of slots currently reported in use.
    pub fn inuse_count(&self) -> usize {
        self.slots.iter().filter(|s| s.inuse).count()
    }

    /// Snapshot record for a given pid, if present.
    pub fn find(&self, pid: u32) -> Option<&PStatSlot> {
        self.slots.iter().find(|s| s.inuse && s.pid == pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_snapshot_is_empty() {
        let ps = PStat::default();
        assert_eq!(ps.inuse_count(), 0);
        assert!(ps.find(1).is_none());
    }
}
