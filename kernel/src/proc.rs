//! Process-control table, lifecycle management, lottery scheduling, and the
//! sleep/wakeup protocol.
//!
//! Everything scheduling-relevant lives in one fixed-size table guarded by
//! one spin lock. Every CPU's scheduler loop and every blocking or waking
//! entry contends for that same lock; the correctness contract is that an
//! entry switched into by a scheduler releases the table lock itself and
//! reacquires it before switching back. No entry state transition happens
//! without the lock held.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bitflags::bitflags;

use crate::config::KernelConfig;
use crate::context::{swtch, Context};
use crate::cpu::{self, Cpu};
use crate::error::{KernelError, Result};
use crate::file::{Dir, File, FsAccounting};
use crate::pstat::{PStat, PStatSlot};
use crate::rand::Rng;
use crate::spinlock::SpinLock;
use crate::vm::{AddressSpace, KStack, PagePool};
use crate::{NOFILE, NPROC, PGSIZE};

/// Process identifier. Monotonically assigned, never reused while live.
pub type Pid = u32;

/// Entry point of a process or thread: the kernel it runs on plus two
/// argument words.
pub type ProcEntry = fn(&'static Kernel, usize, usize);

/// Lifecycle states of a process-control entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Embryo,
    Runnable,
    Running,
    Sleeping,
    Zombie,
}

impl ProcState {
    pub fn name(&self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Runnable => "runnable",
            ProcState::Running => "running",
            ProcState::Sleeping => "sleeping",
            ProcState::Zombie => "zombie",
        }
    }
}

bitflags! {
    /// Per-entry flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProcFlags: u32 {
        /// Cooperative termination request; observed at checkpoints, never
        /// delivered asynchronously.
        const KILLED = 1 << 0;
    }
}

/// Saved user-visible execution image: what the entry runs when dispatched.
/// Opaque to the scheduler; produced here, consumed by the runner thread.
#[derive(Clone)]
struct TrapFrame {
    entry: ProcEntry,
    arg1: usize,
    arg2: usize,
    /// Return-value register. Forced to zero in a fork child; a fresh
    /// process gets its own pid here so entries can tell the two apart.
    rax: i64,
}

/// One slot of the process-control table.
///
/// All fields are read and written only while holding the table lock,
/// except during the EMBRYO construction window where the allocating call
/// owns the slot exclusively (writes still happen under short lock
/// sections so concurrent table scans never race).
struct Proc {
    state: ProcState,
    pid: Pid,
    /// Slot index of the creator. A plain index: no ownership implied.
    parent: Option<usize>,
    flags: ProcFlags,
    name: String,
    /// Lottery ticket weight (>= 1 while in use).
    tickets: u32,
    /// Scheduling quanta consumed.
    ticks: u64,
    /// Wakeup matching key; set only while Sleeping.
    chan: Option<usize>,
    tf: Option<TrapFrame>,
    context: Option<Arc<Context>>,
    kstack: Option<KStack>,
    /// Address space: exclusively owned by a process, aliased by its
    /// clone-created threads.
    pgdir: Option<Arc<AddressSpace>>,
    ofile: [Option<Arc<File>>; NOFILE],
    cwd: Option<Arc<Dir>>,
    /// Caller-supplied stack base of a clone-created thread; `None` marks a
    /// full process. Returned to the joiner on reap.
    threadstack: Option<usize>,
}

impl Proc {
    fn unused() -> Self {
        Self {
            state: ProcState::Unused,
            pid: 0,
            parent: None,
            flags: ProcFlags::empty(),
            name: String::new(),
            tickets: 0,
            ticks: 0,
            chan: None,
            tf: None,
            context: None,
            kstack: None,
            pgdir: None,
            ofile: std::array::from_fn(|_| None),
            cwd: None,
            threadstack: None,
        }
    }

    /// Return the slot to UNUSED with every identifying field cleared, so a
    /// later allocation can never observe stale state.
    fn scrub(&mut self) {
        self.state = ProcState::Unused;
        self.pid = 0;
        self.parent = None;
        self.flags = ProcFlags::empty();
        self.name.clear();
        self.tickets = 0;
        self.ticks = 0;
        self.chan = None;
        self.tf = None;
        self.context = None;
        self.kstack = None;
        self.pgdir = None;
        self.threadstack = None;
    }
}

/// The process-control table: fixed capacity, one lock for everything.
struct Ptable {
    lock: SpinLock,
    slots: Box<[UnsafeCell<Proc>]>,
    /// CPU that last dispatched each slot. Written by the scheduler before
    /// the switch, read by the resumed entry to re-establish its binding;
    /// ordered by the switch itself.
    cpu_of: Box<[AtomicUsize]>,
}

// Slots are only touched under `lock` (or during exclusive construction);
// the lock discipline is what makes cross-thread access sound.
unsafe impl Sync for Ptable {}

impl Ptable {
    fn new() -> Self {
        Self {
            lock: SpinLock::new("ptable"),
            slots: (0..NPROC).map(|_| UnsafeCell::new(Proc::unused())).collect(),
            cpu_of: (0..NPROC).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Mutable access to a slot. Caller must hold the table lock.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slot(&self, i: usize) -> &mut Proc {
        debug_assert!(self.lock.holding(), "ptable slot access without lock");
        &mut *self.slots[i].get()
    }

    /// Stable address of a slot, used as a wakeup channel for "a child of
    /// this slot changed state".
    fn chan_of(&self, i: usize) -> usize {
        self.slots[i].get() as usize
    }
}

fn same_space(a: &Option<Arc<AddressSpace>>, b: &Option<Arc<AddressSpace>>) -> bool {
    matches!((a, b), (Some(x), Some(y)) if Arc::ptr_eq(x, y))
}

/// The machine: CPUs, the process-control table, and the simulated
/// collaborators (memory, files, randomness).
pub struct Kernel {
    cpus: Vec<Cpu>,
    ptable: Ptable,
    pool: Arc<PagePool>,
    fs: Arc<FsAccounting>,
    rng: Rng,
    next_pid: AtomicU32,
    /// Slot of the root process; -1 until userinit.
    init_idx: AtomicIsize,
    halted: AtomicBool,
}

impl Kernel {
    /// Build the machine. The kernel is leaked: CPUs, entries, and tests
    /// all hold `&'static` references to it for the rest of the run.
    pub fn boot(config: KernelConfig) -> &'static Kernel {
        config.validate();
        let k = Box::leak(Box::new(Kernel {
            cpus: (0..config.ncpu).map(|_| Cpu::new()).collect(),
            ptable: Ptable::new(),
            pool: PagePool::new(config.mem_pages),
            fs: FsAccounting::new(),
            rng: Rng::new(config.rng_seed),
            next_pid: AtomicU32::new(1),
            init_idx: AtomicIsize::new(-1),
            halted: AtomicBool::new(false),
        }));
        log::info!("lotos: booted, {} cpus, {} pages", k.cpus.len(), config.mem_pages);
        k
    }

    pub(crate) fn cpus(&self) -> &[Cpu] {
        &self.cpus
    }

    pub(crate) fn table_lock(&self) -> &SpinLock {
        &self.ptable.lock
    }

    /// Per-CPU state of the CPU this thread is executing on.
    pub(crate) fn mycpu(&self) -> &Cpu {
        let (k, id) = cpu::binding().expect("mycpu: unbound thread");
        debug_assert!(std::ptr::eq(k, self), "mycpu: bound to a different kernel");
        &self.cpus[id]
    }

    /// Slot index of the entry running on the current CPU, if any.
    fn myproc(&self) -> Option<usize> {
        let (k, id) = cpu::binding()?;
        debug_assert!(std::ptr::eq(k, self), "myproc: bound to a different kernel");
        self.cpus[id].proc_idx()
    }

    fn init_slot(&self) -> usize {
        let idx = self.init_idx.load(Ordering::SeqCst);
        assert!(idx >= 0, "no root process");
        idx as usize
    }

    // ---------------------------------------------------------------------
    // Table allocation
    // ---------------------------------------------------------------------

    /// Find an UNUSED slot, mark it EMBRYO with a fresh pid and default
    /// scheduling weight, and give it a kernel stack and context. On stack
    /// exhaustion the slot is rolled back to UNUSED.
    fn allocproc(&'static self) -> Result<(usize, Pid)> {
        let ptl = &self.ptable.lock;

        ptl.acquire();
        let mut found = None;
        for i in 0..NPROC {
            if unsafe { self.ptable.slot(i) }.state == ProcState::Unused {
                found = Some(i);
                break;
            }
        }
        let idx = match found {
            Some(i) => i,
            None => {
                ptl.release();
                return Err(KernelError::OutOfSlots);
            }
        };
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        {
            let p = unsafe { self.ptable.slot(idx) };
            p.state = ProcState::Embryo;
            p.pid = pid;
            p.tickets = 1;
            p.ticks = 0;
        }
        ptl.release();

        // Kernel stack; roll the slot back if none can be had.
        let kstack = match KStack::new(&self.pool) {
            Ok(ks) => ks,
            Err(e) => {
                ptl.acquire();
                unsafe { self.ptable.slot(idx) }.scrub();
                ptl.release();
                return Err(e);
            }
        };

        let ctx = Arc::new(Context::new());
        ptl.acquire();
        {
            let p = unsafe { self.ptable.slot(idx) };
            p.kstack = Some(kstack);
            p.context = Some(ctx);
        }
        ptl.release();
        Ok((idx, pid))
    }

    /// Undo a partially-built entry: drop its stack, space, and identity.
    fn rollback(&'static self, idx: usize) {
        let ptl = &self.ptable.lock;
        ptl.acquire();
        unsafe { self.ptable.slot(idx) }.scrub();
        ptl.release();
    }

    /// Spawn the runner thread for a constructed entry. The thread parks on
    /// the entry's context until a scheduler first dispatches it.
    fn launch(&'static self, idx: usize) {
        let ptl = &self.ptable.lock;
        ptl.acquire();
        let (ctx, pid) = {
            let p = unsafe { self.ptable.slot(idx) };
            (p.context.clone().expect("launch: no context"), p.pid)
        };
        ptl.release();
        std::thread::Builder::new()
            .name(format!("proc-{}", pid))
            .spawn(move || self.run_entry(idx, ctx))
            .expect("launch: thread spawn failed");
    }

    /// Body of every entry's runner thread: park, then run the image.
    fn run_entry(&'static self, idx: usize, ctx: Arc<Context>) {
        ctx.wait();
        // First dispatch. We are on whichever CPU switched into us, and we
        // inherit the table lock from its scheduler loop; release it before
        // entering the image (the forkret path).
        cpu::bind(self, self.ptable.cpu_of[idx].load(Ordering::SeqCst));
        let tf = {
            let p = unsafe { self.ptable.slot(idx) };
            p.tf.clone().expect("forkret: no trap frame")
        };
        self.ptable.lock.release();

        (tf.entry)(self, tf.arg1, tf.arg2);

        // The image returned; terminate as if it had called exit().
        self.exit();
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Create the root process. Boot-only: called once, before the CPUs
    /// start scheduling.
    pub fn userinit(&'static self, name: &str, entry: ProcEntry, arg1: usize, arg2: usize) -> Result<Pid> {
        assert!(self.init_idx.load(Ordering::SeqCst) < 0, "userinit: root process already exists");
        let (idx, pid) = self.allocproc()?;
        let pgdir = match AddressSpace::new(&self.pool, 1) {
            Ok(a) => a,
            // Nothing to recover at boot time.
            Err(_) => panic!("userinit: out of memory"),
        };

        let ptl = &self.ptable.lock;
        ptl.acquire();
        {
            let p = unsafe { self.ptable.slot(idx) };
            p.pgdir = Some(pgdir);
            p.tf = Some(TrapFrame { entry, arg1, arg2, rax: pid as i64 });
            p.name = name.to_string();
            p.cwd = Some(Dir::root(&self.fs));
        }
        ptl.release();

        self.init_idx.store(idx as isize, Ordering::SeqCst);
        self.launch(idx);

        ptl.acquire();
        unsafe { self.ptable.slot(idx) }.state = ProcState::Runnable;
        ptl.release();
        log::debug!("userinit: root process {} ({})", pid, name);
        Ok(pid)
    }

    /// Duplicate the calling process. The child gets a copy of the address
    /// space, the ticket weight, duplicated file handles and cwd, and a
    /// trap frame whose return-value register is forced to zero. Returns
    /// the child pid to the caller.
    pub fn fork(&'static self) -> Result<Pid> {
        let cur = self.myproc().expect("fork: no current process");
        let ptl = &self.ptable.lock;

        let (idx, pid) = self.allocproc()?;

        ptl.acquire();
        let (parent_as, parent_tf, parent_tickets, parent_name) = {
            let p = unsafe { self.ptable.slot(cur) };
            (
                p.pgdir.clone().expect("fork: caller has no address space"),
                p.tf.clone().expect("fork: caller has no trap frame"),
                p.tickets,
                p.name.clone(),
            )
        };
        ptl.release();

        // Duplicate the address space outside the lock; this is the
        // expensive step and the one that can fail.
        let child_as = match parent_as.duplicate() {
            Ok(a) => a,
            Err(e) => {
                self.rollback(idx);
                return Err(e);
            }
        };

        ptl.acquire();
        {
            let parent = unsafe { self.ptable.slot(cur) };
            let ofile: [Option<Arc<File>>; NOFILE] =
                std::array::from_fn(|i| parent.ofile[i].as_ref().map(File::dup));
            let cwd = parent.cwd.as_ref().map(Dir::dup);
            let p = unsafe { self.ptable.slot(idx) };
            p.pgdir = Some(child_as);
            p.tickets = parent_tickets;
            p.parent = Some(cur);
            p.tf = Some(TrapFrame { rax: 0, ..parent_tf });
            p.ofile = ofile;
            p.cwd = cwd;
            p.name = parent_name;
        }
        ptl.release();

        self.launch(idx);

        ptl.acquire();
        unsafe { self.ptable.slot(idx) }.state = ProcState::Runnable;
        ptl.release();
        Ok(pid)
    }

    /// Create a thread sharing the caller's address space. `stack` must be
    /// page-aligned and lie entirely inside the caller's allocated range;
    /// the new entry starts in `entry(arg1, arg2)` with an initial frame
    /// (sentinel return address plus the two argument words) built inside
    /// the supplied stack page.
    pub fn clone_thread(
        &'static self,
        entry: ProcEntry,
        arg1: usize,
        arg2: usize,
        stack: usize,
    ) -> Result<Pid> {
        let cur = self.myproc().expect("clone: no current process");
        let ptl = &self.ptable.lock;

        ptl.acquire();
        let caller_as = {
            let p = unsafe { self.ptable.slot(cur) };
            p.pgdir.clone().expect("clone: caller has no address space")
        };
        ptl.release();

        // Validate the stack before consuming a table slot.
        if stack % PGSIZE != 0 {
            return Err(KernelError::BadStack);
        }
        match stack.checked_add(PGSIZE) {
            Some(end) if end <= caller_as.size() => {}
            _ => return Err(KernelError::BadStack),
        }

        let (idx, pid) = self.allocproc()?;

        // Initial frame at the top of the supplied page: the word a return
        // would pop is a sentinel, then the two arguments.
        let mut frame = [0u8; 24];
        frame[0..8].copy_from_slice(&0xFFFF_FFFFu64.to_le_bytes());
        frame[8..16].copy_from_slice(&(arg1 as u64).to_le_bytes());
        frame[16..24].copy_from_slice(&(arg2 as u64).to_le_bytes());
        if let Err(e) = caller_as.copyout(stack + PGSIZE - frame.len(), &frame) {
            self.rollback(idx);
            return Err(e);
        }

        ptl.acquire();
        {
            let parent = unsafe { self.ptable.slot(cur) };
            let ofile: [Option<Arc<File>>; NOFILE] =
                std::array::from_fn(|i| parent.ofile[i].as_ref().map(File::dup));
            let cwd = parent.cwd.as_ref().map(Dir::dup);
            let name = parent.name.clone();
            let p = unsafe { self.ptable.slot(idx) };
            // Alias, not a copy: both entries see one address space.
            p.pgdir = Some(caller_as);
            p.parent = Some(cur);
            p.tf = Some(TrapFrame { entry, arg1, arg2, rax: 0 });
            p.ofile = ofile;
            p.cwd = cwd;
            p.name = name;
            p.threadstack = Some(stack);
        }
        ptl.release();

        self.launch(idx);

        ptl.acquire();
        unsafe { self.ptable.slot(idx) }.state = ProcState::Runnable;
        ptl.release();
        Ok(pid)
    }

    /// Terminate the calling entry. Releases file handles and the cwd,
    /// wakes a parent blocked in wait/join, hands live children to the
    /// root process, and yields into the scheduler as a zombie. Never
    /// returns; fatal if the root process attempts it.
    pub fn exit(&'static self) -> ! {
        let cur = self.myproc().expect("exit: no current process");
        if cur == self.init_slot() {
            panic!("init exiting");
        }
        let ptl = &self.ptable.lock;

        // Close all open files and drop the cwd.
        ptl.acquire();
        let (ofile, cwd) = {
            let p = unsafe { self.ptable.slot(cur) };
            (std::mem::take(&mut p.ofile), p.cwd.take())
        };
        ptl.release();
        for f in ofile.into_iter().flatten() {
            File::close(f);
        }
        if let Some(d) = cwd {
            Dir::put(d);
        }

        ptl.acquire();
        // Parent might be sleeping in wait()/join().
        if let Some(parent) = unsafe { self.ptable.slot(cur) }.parent {
            self.wakeup1(self.ptable.chan_of(parent));
        }
        // Pass abandoned children to the root process; if any is already a
        // zombie its exit would otherwise never be observed, so wake the
        // root immediately.
        let init = self.init_slot();
        let mut wake_init = false;
        for i in 0..NPROC {
            let p = unsafe { self.ptable.slot(i) };
            if p.parent == Some(cur) {
                p.parent = Some(init);
                if p.state == ProcState::Zombie {
                    wake_init = true;
                }
            }
        }
        if wake_init {
            self.wakeup1(self.ptable.chan_of(init));
        }
        unsafe { self.ptable.slot(cur) }.state = ProcState::Zombie;
        self.sched();
        panic!("zombie exit");
    }

    /// Reap a terminated child process: release its kernel stack and
    /// address space, record its pid, and scrub the slot. Blocks until a
    /// child terminates; fails immediately with no qualifying children or
    /// when the caller has been killed. Thread entries are join()'s to
    /// reap, never wait()'s.
    pub fn wait(&'static self) -> Result<Pid> {
        let cur = self.myproc().expect("wait: no current process");
        let ptl = &self.ptable.lock;

        ptl.acquire();
        loop {
            let mut havekids = false;
            let mut reaped = None;
            for i in 0..NPROC {
                let p = unsafe { self.ptable.slot(i) };
                if p.parent != Some(cur) || p.threadstack.is_some() {
                    continue;
                }
                havekids = true;
                if p.state == ProcState::Zombie {
                    let pid = p.pid;
                    p.kstack = None; // release its kernel stack
                    p.pgdir = None; // sole owner: release the address space
                    p.scrub();
                    reaped = Some(pid);
                    break;
                }
            }
            if let Some(pid) = reaped {
                ptl.release();
                return Ok(pid);
            }

            let killed = unsafe { self.ptable.slot(cur) }.flags.contains(ProcFlags::KILLED);
            if !havekids || killed {
                ptl.release();
                return Err(KernelError::NoChildren);
            }

            // Block until a child changes state, then rescan.
            self.sleep(self.ptable.chan_of(cur), ptl);
        }
    }

    /// Reap a terminated thread created by clone: release its kernel stack
    /// and return its pid together with the caller-supplied stack base.
    /// The shared address space is left untouched; the caller still owns
    /// and uses it.
    pub fn join(&'static self) -> Result<(Pid, usize)> {
        let cur = self.myproc().expect("join: no current process");
        let ptl = &self.ptable.lock;

        ptl.acquire();
        let my_as = unsafe { self.ptable.slot(cur) }.pgdir.clone();
        loop {
            let mut havethreads = false;
            let mut reaped = None;
            for i in 0..NPROC {
                let p = unsafe { self.ptable.slot(i) };
                if p.parent != Some(cur) {
                    continue;
                }
                let Some(ts) = p.threadstack else { continue };
                if !same_space(&my_as, &p.pgdir) {
                    continue;
                }
                havethreads = true;
                if p.state == ProcState::Zombie {
                    let pid = p.pid;
                    p.kstack = None;
                    // Dropping the slot's alias of the shared address space
                    // never releases it: the caller holds its own reference.
                    p.scrub();
                    reaped = Some((pid, ts));
                    break;
                }
            }
            if let Some(out) = reaped {
                ptl.release();
                return Ok(out);
            }

            let killed = unsafe { self.ptable.slot(cur) }.flags.contains(ProcFlags::KILLED);
            if !havethreads || killed {
                ptl.release();
                return Err(KernelError::NoChildren);
            }

            self.sleep(self.ptable.chan_of(cur), ptl);
        }
    }

    /// Request cooperative termination of `pid`. A sleeping target is made
    /// runnable so it reaches a checkpoint; a running one is not preempted.
    pub fn kill(&self, pid: Pid) -> Result<()> {
        let ptl = &self.ptable.lock;
        ptl.acquire();
        for i in 0..NPROC {
            let p = unsafe { self.ptable.slot(i) };
            if p.state != ProcState::Unused && p.pid == pid {
                p.flags.insert(ProcFlags::KILLED);
                if p.state == ProcState::Sleeping {
                    p.state = ProcState::Runnable;
                }
                ptl.release();
                return Ok(());
            }
        }
        ptl.release();
        Err(KernelError::NoSuchProc)
    }

    /// Has the calling entry been marked killed? Checkpoint polling for
    /// cooperative termination.
    pub fn killed(&'static self) -> bool {
        let cur = self.myproc().expect("killed: no current process");
        let ptl = &self.ptable.lock;
        ptl.acquire();
        let killed = unsafe { self.ptable.slot(cur) }.flags.contains(ProcFlags::KILLED);
        ptl.release();
        killed
    }

    /// Pid of the calling entry.
    pub fn getpid(&'static self) -> Pid {
        let cur = self.myproc().expect("getpid: no current process");
        let ptl = &self.ptable.lock;
        ptl.acquire();
        let pid = unsafe { self.ptable.slot(cur) }.pid;
        ptl.release();
        pid
    }

    /// Return-value register of the calling entry's image: zero when this
    /// execution is a fork child, the entry's own pid when it was started
    /// directly.
    pub fn fork_return(&'static self) -> i64 {
        let cur = self.myproc().expect("fork_return: no current process");
        let ptl = &self.ptable.lock;
        ptl.acquire();
        let rax = unsafe { self.ptable.slot(cur) }.tf.as_ref().expect("no trap frame").rax;
        ptl.release();
        rax
    }

    // ---------------------------------------------------------------------
    // Introspection and resources
    // ---------------------------------------------------------------------

    /// Set the calling entry's ticket weight. Weights below 1 are rejected
    /// and leave the current weight unchanged.
    pub fn settickets(&'static self, tickets: i32) -> Result<()> {
        if tickets < 1 {
            return Err(KernelError::BadTickets);
        }
        let cur = self.myproc().expect("settickets: no current process");
        let ptl = &self.ptable.lock;
        ptl.acquire();
        unsafe { self.ptable.slot(cur) }.tickets = tickets as u32;
        ptl.release();
        Ok(())
    }

    /// Snapshot of {pid, inuse, tickets, ticks} for every slot. Entries
    /// still under construction are reported as unused.
    pub fn getpinfo(&self) -> PStat {
        let mut ps = PStat::default();
        let ptl = &self.ptable.lock;
        ptl.acquire();
        for i in 0..NPROC {
            let p = unsafe { self.ptable.slot(i) };
            if matches!(p.state, ProcState::Unused | ProcState::Embryo) {
                continue;
            }
            ps.slots[i] = PStatSlot {
                pid: p.pid,
                inuse: true,
                tickets: p.tickets,
                ticks: p.ticks,
            };
        }
        ptl.release();
        ps
    }

    /// Grow (positive) or shrink (negative) the calling entry's address
    /// space by `delta` bytes. Returns the new size; on failure the size
    /// is unchanged.
    pub fn growproc(&'static self, delta: isize) -> Result<usize> {
        let cur = self.myproc().expect("growproc: no current process");
        let ptl = &self.ptable.lock;
        ptl.acquire();
        let a = unsafe { self.ptable.slot(cur) }.pgdir.clone().expect("growproc: no address space");
        ptl.release();
        a.grow(delta)
    }

    /// Read bytes from the calling entry's address space.
    pub fn copyin(&'static self, addr: usize, buf: &mut [u8]) -> Result<()> {
        let cur = self.myproc().expect("copyin: no current process");
        let ptl = &self.ptable.lock;
        ptl.acquire();
        let a = unsafe { self.ptable.slot(cur) }.pgdir.clone().expect("copyin: no address space");
        ptl.release();
        a.copyin(addr, buf)
    }

    /// Open a file handle in the calling entry's descriptor table. Stands
    /// in for the external file-descriptor layer so lifecycle tests can
    /// populate descriptor tables.
    pub fn open_file(&'static self, id: u32) -> Result<usize> {
        let cur = self.myproc().expect("open_file: no current process");
        let ptl = &self.ptable.lock;
        ptl.acquire();
        let p = unsafe { self.ptable.slot(cur) };
        let fd = match p.ofile.iter().position(|f| f.is_none()) {
            Some(fd) => fd,
            None => {
                ptl.release();
                return Err(KernelError::TooManyFiles);
            }
        };
        p.ofile[fd] = Some(File::open(&self.fs, id));
        ptl.release();
        Ok(fd)
    }

    /// Pages currently free in the physical pool.
    pub fn free_pages(&self) -> usize {
        self.pool.available()
    }

    /// File/directory handles currently live kernel-wide.
    pub fn fs_live_handles(&self) -> usize {
        self.fs.live_handles()
    }

    /// Human-readable table listing for debugging.
    pub fn procdump(&self) {
        let ptl = &self.ptable.lock;
        ptl.acquire();
        for i in 0..NPROC {
            let p = unsafe { self.ptable.slot(i) };
            if p.state == ProcState::Unused {
                continue;
            }
            log::info!("{:5} {:9} {}", p.pid, p.state.name(), p.name);
        }
        ptl.release();
    }

    // ---------------------------------------------------------------------
    // Blocking and wakeup
    // ---------------------------------------------------------------------

    /// Atomically release `guard` and block on `chan`; reacquire `guard`
    /// before returning. The caller must hold `guard`, which protects the
    /// condition it is waiting on, and must re-check that condition after
    /// waking: wakeup is a broadcast hint, not a guarantee.
    pub fn sleep(&'static self, chan: usize, guard: &SpinLock) {
        let cur = self.myproc().expect("sleep: no current process");
        let ptl = &self.ptable.lock;
        if !guard.holding() {
            panic!("sleep: guard not held");
        }

        // Take the table lock before releasing the guard. Delivering a
        // wakeup requires the table lock, so once we hold it no wakeup on
        // this channel can land between the decision to sleep and the
        // state transition below.
        if !std::ptr::eq(guard, ptl) {
            ptl.acquire();
            guard.release();
        }

        {
            let p = unsafe { self.ptable.slot(cur) };
            p.chan = Some(chan);
            p.state = ProcState::Sleeping;
        }
        self.sched();

        // Tidy up.
        unsafe { self.ptable.slot(cur) }.chan = None;

        if !std::ptr::eq(guard, ptl) {
            ptl.release();
            guard.acquire();
        }
    }

    /// Wake every entry sleeping on `chan`. Broadcast: all matching
    /// sleepers become runnable and re-check their conditions.
    pub fn wakeup(&self, chan: usize) {
        let ptl = &self.ptable.lock;
        ptl.acquire();
        self.wakeup1(chan);
        ptl.release();
    }

    /// Wakeup body; the table lock must be held.
    fn wakeup1(&self, chan: usize) {
        for i in 0..NPROC {
            let p = unsafe { self.ptable.slot(i) };
            if p.state == ProcState::Sleeping && p.chan == Some(chan) {
                p.state = ProcState::Runnable;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------

    /// Give up the CPU for one scheduling round.
    pub fn yield_now(&'static self) {
        let cur = self.myproc().expect("yield: no current process");
        let ptl = &self.ptable.lock;
        ptl.acquire();
        unsafe { self.ptable.slot(cur) }.state = ProcState::Runnable;
        self.sched();
        ptl.release();
    }

    /// Enter the scheduler. Must hold only the table lock and have already
    /// moved the calling entry out of Running; violations are fatal
    /// because they break the switch contract everything else relies on.
    fn sched(&'static self) {
        let c = self.mycpu();
        let cur = c.proc_idx().expect("sched: no current process");
        if !self.ptable.lock.holding() {
            panic!("sched: ptable lock not held");
        }
        if c.ncli() != 1 {
            panic!("sched: locks held");
        }
        if unsafe { self.ptable.slot(cur) }.state == ProcState::Running {
            panic!("sched: still running");
        }
        if c.int_enabled() {
            panic!("sched: interruptible");
        }
        // intena is a property of this kernel flow, not of the CPU; carry
        // it to wherever we resume.
        let intena = c.intena();
        let ctx = unsafe { self.ptable.slot(cur) }.context.clone().expect("sched: no context");

        swtch(&ctx, &c.scheduler);

        // Resumed, possibly on a different CPU: re-establish the binding.
        cpu::bind(self, self.ptable.cpu_of[cur].load(Ordering::SeqCst));
        self.mycpu().set_intena(intena);
    }

    /// Per-CPU scheduler loop. Each iteration draws a lottery over the
    /// ticket weights of all runnable entries, switches into the winner,
    /// and charges it one quantum when it switches back. Runs until the
    /// kernel is shut down.
    fn scheduler(&'static self, cpu_id: usize) {
        cpu::bind(self, cpu_id);
        let c = &self.cpus[cpu_id];
        log::debug!("cpu{}: scheduler online", cpu_id);

        while !self.halted.load(Ordering::SeqCst) {
            // Window for (simulated) interrupt delivery between decisions.
            c.sti();

            self.ptable.lock.acquire();
            let mut total: u64 = 0;
            for i in 0..NPROC {
                let p = unsafe { self.ptable.slot(i) };
                if p.state == ProcState::Runnable {
                    total += p.tickets as u64;
                }
            }
            if total > 0 {
                let draw = self.rng.below(total);
                let mut acc: u64 = 0;
                for i in 0..NPROC {
                    {
                        let p = unsafe { self.ptable.slot(i) };
                        if p.state != ProcState::Runnable {
                            continue;
                        }
                        acc += p.tickets as u64;
                        if acc <= draw {
                            continue;
                        }
                        // Winner. It is the entry's job to release the
                        // table lock and reacquire it before switching
                        // back to us.
                        c.set_proc(Some(i));
                        self.ptable.cpu_of[i].store(cpu_id, Ordering::SeqCst);
                        p.state = ProcState::Running;
                    }
                    let ctx = unsafe { self.ptable.slot(i) }
                        .context
                        .clone()
                        .expect("scheduler: winner has no context");

                    swtch(&c.scheduler, &ctx);

                    // One quantum consumed, however long the entry
                    // actually ran before coming back.
                    unsafe { self.ptable.slot(i) }.ticks += 1;
                    c.set_proc(None);
                    break;
                }
            }
            self.ptable.lock.release();

            if total == 0 {
                // Nothing runnable; let other host threads have the core.
                std::thread::yield_now();
            }
        }
        log::debug!("cpu{}: scheduler offline", cpu_id);
    }

    /// Bring every configured CPU online. Returns the scheduler threads so
    /// a harness can join them after `shutdown`.
    pub fn start_cpus(&'static self) -> Vec<JoinHandle<()>> {
        (0..self.cpus.len())
            .map(|i| {
                std::thread::Builder::new()
                    .name(format!("cpu{}", i))
                    .spawn(move || self.scheduler(i))
                    .expect("start_cpus: thread spawn failed")
            })
            .collect()
    }

    /// Ask all scheduler loops to exit at their next iteration.
    pub fn shutdown(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }
}
