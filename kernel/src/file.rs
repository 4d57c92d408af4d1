//! Simulated file-system collaborator.
//!
//! The lifecycle manager duplicates open-file handles and the current
//! directory across fork/clone and releases them on exit. The file system
//! itself is out of scope, so handles here are counters: every duplicate
//! bumps a kernel-wide live-handle count and every close drops it, which is
//! exactly what tests need to prove that exit releases everything.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Kernel-wide accounting of live file and directory handles.
pub struct FsAccounting {
    live: AtomicUsize,
}

impl FsAccounting {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { live: AtomicUsize::new(0) })
    }

    /// Number of handles currently held anywhere in the kernel.
    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn retain(&self) {
        self.live.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        let prev = self.live.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "file handle over-released");
    }
}

/// An open-file handle. Duplicated handles are distinct (not shared
/// descriptors); each must be closed individually.
pub struct File {
    fs: Arc<FsAccounting>,
    pub id: u32,
}

impl File {
    pub(crate) fn open(fs: &Arc<FsAccounting>, id: u32) -> Arc<File> {
        fs.retain();
        Arc::new(File { fs: fs.clone(), id })
    }

    pub(crate) fn dup(f: &Arc<File>) -> Arc<File> {
        f.fs.retain();
        Arc::new(File { fs: f.fs.clone(), id: f.id })
    }

    pub(crate) fn close(f: Arc<File>) {
        f.fs.release();
    }
}

/// A current-directory reference.
pub struct Dir {
    fs: Arc<FsAccounting>,
}

impl Dir {
    pub(crate) fn root(fs: &Arc<FsAccounting>) -> Arc<Dir> {
        fs.retain();
        Arc::new(Dir { fs: fs.clone() })
    }

    pub(crate) fn dup(d: &Arc<Dir>) -> Arc<Dir> {
        d.fs.retain();
        Arc::new(Dir { fs: d.fs.clone() })
    }

    pub(crate) fn put(d: Arc<Dir>) {
        d.fs.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_count_up_and_down() {
        let fs = FsAccounting::new();
        let f = File::open(&fs, 3);
        let g = File::dup(&f);
        let d = Dir::root(&fs);
        assert_eq!(fs.live_handles(), 3);
        File::close(f);
        File::close(g);
        Dir::put(d);
        assert_eq!(fs.live_handles(), 0);
    }
}
