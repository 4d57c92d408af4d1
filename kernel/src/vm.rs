//! Simulated virtual-memory collaborator.
//!
//! The scheduling core does not manage memory; it asks this module to
//! create, duplicate, grow, and release address spaces and kernel stacks.
//! Here an address space is a byte vector charged against a finite physical
//! page pool, which is enough to make every failure path the core must
//! handle (duplication failure, stack exhaustion, out-of-range access)
//! actually reachable in tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::error::{KernelError, Result};
use crate::{KSTACKPAGES, PGSIZE};

/// Finite pool of physical pages backing address spaces and kernel stacks.
pub struct PagePool {
    free: AtomicUsize,
    total: usize,
}

impl PagePool {
    pub fn new(pages: usize) -> Arc<Self> {
        Arc::new(Self { free: AtomicUsize::new(pages), total: pages })
    }

    /// Charge `pages` against the pool.
    fn charge(&self, pages: usize) -> Result<()> {
        let mut cur = self.free.load(Ordering::SeqCst);
        loop {
            if cur < pages {
                return Err(KernelError::OutOfMemory);
            }
            match self.free.compare_exchange(cur, cur - pages, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Ok(()),
                Err(now) => cur = now,
            }
        }
    }

    /// Return `pages` to the pool.
    fn refund(&self, pages: usize) {
        let prev = self.free.fetch_add(pages, Ordering::SeqCst);
        assert!(prev + pages <= self.total, "page pool over-refunded");
    }

    /// Pages currently unallocated.
    pub fn available(&self) -> usize {
        self.free.load(Ordering::SeqCst)
    }
}

/// A simulated address space: page-granular byte storage.
///
/// A process owns its address space exclusively; clone-created threads hold
/// the same `Arc` (aliasing is intentional and permanent for the life of
/// both). The pool is refunded when the last holder drops it, which the
/// wait/join asymmetry in the lifecycle manager arranges to be the process
/// side, never a thread.
pub struct AddressSpace {
    pool: Arc<PagePool>,
    mem: Mutex<Vec<u8>>,
}

impl AddressSpace {
    /// Create a fresh address space of `pages` pages.
    pub fn new(pool: &Arc<PagePool>, pages: usize) -> Result<Arc<Self>> {
        pool.charge(pages)?;
        Ok(Arc::new(Self {
            pool: pool.clone(),
            mem: Mutex::new(vec![0; pages * PGSIZE]),
        }))
    }

    /// Duplicate this address space (copy-on-fork semantics collapsed to an
    /// eager copy). Fails if the pool cannot back the copy.
    pub fn duplicate(&self) -> Result<Arc<Self>> {
        let mem = self.mem.lock();
        let pages = mem.len() / PGSIZE;
        self.pool.charge(pages)?;
        Ok(Arc::new(Self {
            pool: self.pool.clone(),
            mem: Mutex::new(mem.clone()),
        }))
    }

    /// Current size in bytes. Always a multiple of the page size.
    pub fn size(&self) -> usize {
        self.mem.lock().len()
    }

    /// Grow (positive) or shrink (negative) by `delta` bytes, page-rounded
    /// up. Returns the new size; on failure the size is unchanged.
    pub fn grow(&self, delta: isize) -> Result<usize> {
        let mut mem = self.mem.lock();
        let old = mem.len();
        let new = old as isize + delta;
        if new < 0 {
            return Err(KernelError::BadAddress);
        }
        let old_pages = old / PGSIZE;
        let new_pages = (new as usize).div_ceil(PGSIZE);
        if new_pages > old_pages {
            self.pool.charge(new_pages - old_pages)?;
        } else {
            self.pool.refund(old_pages - new_pages);
        }
        mem.resize(new_pages * PGSIZE, 0);
        Ok(mem.len())
    }

    /// Copy `src` into the address space at `dst`.
    pub fn copyout(&self, dst: usize, src: &[u8]) -> Result<()> {
        let mut mem = self.mem.lock();
        let end = dst.checked_add(src.len()).ok_or(KernelError::BadAddress)?;
        if end > mem.len() {
            return Err(KernelError::BadAddress);
        }
        mem[dst..end].copy_from_slice(src);
        Ok(())
    }

    /// Copy bytes out of the address space at `src` into `dst`.
    pub fn copyin(&self, src: usize, dst: &mut [u8]) -> Result<()> {
        let mem = self.mem.lock();
        let end = src.checked_add(dst.len()).ok_or(KernelError::BadAddress)?;
        if end > mem.len() {
            return Err(KernelError::BadAddress);
        }
        dst.copy_from_slice(&mem[src..end]);
        Ok(())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let pages = self.mem.get_mut().len() / PGSIZE;
        self.pool.refund(pages);
    }
}

/// Exclusively-owned kernel stack of a process-control entry. Pure
/// accounting here; the entry's actual control flow runs on an OS thread.
pub struct KStack {
    pool: Arc<PagePool>,
}

impl KStack {
    pub fn new(pool: &Arc<PagePool>) -> Result<Self> {
        pool.charge(KSTACKPAGES)?;
        Ok(Self { pool: pool.clone() })
    }
}

impl Drop for KStack {
    fn drop(&mut self) {
        self.pool.refund(KSTACKPAGES);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_accounting_across_create_and_drop() {
        let pool = PagePool::new(10);
        let a = AddressSpace::new(&pool, 3).unwrap();
        assert_eq!(pool.available(), 7);
        let b = a.duplicate().unwrap();
        assert_eq!(pool.available(), 4);
        drop(a);
        assert_eq!(pool.available(), 7);
        drop(b);
        assert_eq!(pool.available(), 10);
    }

    #[test]
    fn duplicate_fails_when_pool_exhausted() {
        let pool = PagePool::new(4);
        let a = AddressSpace::new(&pool, 3).unwrap();
        assert_eq!(a.duplicate().err(), Some(KernelError::OutOfMemory));
        // Failed duplication charges nothing.
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn grow_and_shrink_round_to_pages() {
        let pool = PagePool::new(8);
        let a = AddressSpace::new(&pool, 1).unwrap();
        assert_eq!(a.grow(1).unwrap(), 2 * PGSIZE);
        assert_eq!(pool.available(), 6);
        assert_eq!(a.grow(-(PGSIZE as isize)).unwrap(), PGSIZE);
        assert_eq!(pool.available(), 7);
        // Shrinking below zero fails and changes nothing.
        assert_eq!(a.grow(-2 * PGSIZE as isize).unwrap_err(), KernelError::BadAddress);
        assert_eq!(a.size(), PGSIZE);
    }

    #[test]
    fn copyout_and_copyin_round_trip_and_bounds() {
        let pool = PagePool::new(2);
        let a = AddressSpace::new(&pool, 1).unwrap();
        a.copyout(100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        a.copyin(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(a.copyout(PGSIZE - 2, b"xxx").unwrap_err(), KernelError::BadAddress);
    }

    #[test]
    fn kstack_charges_and_refunds() {
        let pool = PagePool::new(KSTACKPAGES);
        let ks = KStack::new(&pool).unwrap();
        assert_eq!(pool.available(), 0);
        assert_eq!(KStack::new(&pool).err(), Some(KernelError::OutOfMemory));
        drop(ks);
        assert_eq!(pool.available(), KSTACKPAGES);
    }
}
