//! Inter-process coordination
//!
//! Cooperating processes on one node share a small accounting region and a
//! set of named semaphores, keyed by the `uniq` value passed to `init`. The
//! region carries the free-page scalar, per-process charged and dirty page
//! counts, process ids, the slot handout cursor, and per-process status
//! bits. The invariant `s_mem + sum(c_mem) == budget` holds whenever no
//! process is inside the inter-process critical section.
//!
//! Admission (`madmit`) runs inside the critical section: while the free
//! scalar is short, an eligible peer is selected, signalled with SIGIPC,
//! and waited on through the `done` semaphore. A signalled peer evicts its
//! resident pages in its handler and credits them back, which is safe
//! without taking the section itself because the signaller holds the mutex
//! for the whole exchange.

use core::cell::UnsafeCell;
use core::num::NonZeroUsize;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::ffi::CString;

use bitflags::bitflags;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use crate::error::{Error, Result};
use crate::lock::Lock;

/// The real-time signal that asks a process to evict its resident pages.
#[inline]
pub fn sigipc() -> libc::c_int {
    libc::SIGRTMIN()
}

bitflags! {
    /// Per-process status bits in the shared region.
    pub struct IpcFlags: u8 {
        /// The process accepts eviction signals even while holding no
        /// charged pages.
        const SIGON = 1 << 0;
    }
}

/// Most processes one coordination group can hold.
pub const MAX_PROCS: usize = 64;

/// Byte length of the shared region for `n_procs` coordinating processes.
fn region_len(n_procs: usize) -> usize {
    core::mem::size_of::<usize>()
        + n_procs * 2 * core::mem::size_of::<usize>()
        + n_procs * core::mem::size_of::<libc::pid_t>()
        + core::mem::size_of::<libc::c_int>()
        + n_procs
}

/// Typed views into the mapped region. Layout, in order: `s_mem` scalar,
/// `c_mem[n]`, `d_mem[n]`, `pid[n]`, `id_next`, `flags[n]`.
struct Region {
    base: *mut u8,
    len: usize,
    s_mem: *mut usize,
    c_mem: *mut usize,
    d_mem: *mut usize,
    pid: *mut libc::pid_t,
    id_next: *mut libc::c_int,
    flags: *mut u8,
}

impl Region {
    /// # Safety
    ///
    /// `base` must point at a mapping of at least `region_len(n_procs)`
    /// bytes.
    unsafe fn carve(base: *mut u8, n_procs: usize) -> Region {
        let s_mem = base as *mut usize;
        let c_mem = s_mem.add(1);
        let d_mem = c_mem.add(n_procs);
        let pid = d_mem.add(n_procs) as *mut libc::pid_t;
        let id_next = pid.add(n_procs) as *mut libc::c_int;
        let flags = id_next.add(1) as *mut u8;
        Region {
            base,
            len: region_len(n_procs),
            s_mem,
            c_mem,
            d_mem,
            pid,
            id_next,
            flags,
        }
    }
}

/// Everything established by `init`.
struct Shared {
    id: usize,
    n_procs: usize,
    uniq: libc::c_int,
    region: Region,
    inter_mtx: *mut libc::sem_t,
    done: *mut libc::sem_t,
    sig: *mut libc::sem_t,
}

/// The inter-process communicator.
pub struct Ipc {
    shared: UnsafeCell<Option<Shared>>,
    /// Intra-process critical section: guards this process's own shared
    /// slots where they are updated outside the inter-process section (the
    /// write-fault path bumping `d_mem`).
    intra: Lock,
    /// Charged pages at `destroy`, kept for post-destroy statistics.
    final_pages: AtomicUsize,
    /// High water mark of this process's charged pages.
    max_pages: AtomicUsize,
}

unsafe impl Send for Ipc {}
unsafe impl Sync for Ipc {}

impl Ipc {
    pub fn new() -> Result<Self> {
        Ok(Ipc {
            shared: UnsafeCell::new(None),
            intra: Lock::new()?,
            final_pages: AtomicUsize::new(0),
            max_pages: AtomicUsize::new(0),
        })
    }

    fn shared(&self) -> Result<&Shared> {
        unsafe { (*self.shared.get()).as_ref().ok_or(Error::Uninitialized) }
    }

    pub fn is_init(&self) -> bool {
        unsafe { (*self.shared.get()).is_some() }
    }

    /// Join (or create) the coordination group `uniq` with a budget of
    /// `max_mem` system pages shared by up to `n_procs` processes.
    pub fn init(&self, uniq: libc::c_int, n_procs: usize, max_mem: usize) -> Result<()> {
        if self.is_init() || n_procs == 0 || n_procs > MAX_PROCS {
            return Err(Error::Invalid);
        }

        let inter_mtx = sem_open_named(&sem_name("inter-mtx", uniq), 1)?;
        let done = sem_open_named(&sem_name("done", uniq), 0)?;
        let sid = sem_open_named(&sem_name("sid", uniq), 1)?;
        let sig = sem_open_named(&sem_name("sig", uniq), 0)?;

        let len = region_len(n_procs);
        let shm_name = format!("/sbma-shm-{}", uniq);
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;

        // The first process creates and sizes the region; latecomers open
        // it. O_EXCL disambiguates the two.
        let (fd, created) = match shm_open(
            shm_name.as_str(),
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            mode,
        ) {
            Ok(fd) => (fd, true),
            Err(Errno::EEXIST) => (shm_open(shm_name.as_str(), OFlag::O_RDWR, mode)?, false),
            Err(err) => return Err(err.into()),
        };
        if created {
            ftruncate(&fd, len as libc::off_t)?;
        }

        let base = unsafe {
            mmap(
                None,
                NonZeroUsize::new(len).ok_or(Error::Invalid)?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )?
        }
        .as_ptr() as *mut u8;
        drop(fd);

        let region = unsafe { Region::carve(base, n_procs) };
        if created {
            unsafe { ptr::write_volatile(region.s_mem, max_mem) };
        }

        // Slot handout: serialized by `sid`, which is then unlinked so the
        // cursor cannot leak across runs.
        let id = unsafe {
            sem_wait_intr(sid)?;
            let id = ptr::read_volatile(region.id_next);
            ptr::write_volatile(region.id_next, id + 1);
            sem_post(sid)?;
            if libc::sem_close(sid) == -1 {
                return Err(Error::last_os());
            }
            sem_unlink_named(&sem_name("sid", uniq))?;
            id as usize
        };
        if id >= n_procs {
            return Err(Error::Invalid);
        }

        unsafe {
            ptr::write_volatile(region.pid.add(id), libc::getpid());
        }

        self.max_pages.store(0, Ordering::Relaxed);
        self.final_pages.store(0, Ordering::Relaxed);
        unsafe {
            *self.shared.get() = Some(Shared {
                id,
                n_procs,
                uniq,
                region,
                inter_mtx,
                done,
                sig,
            });
        }

        Ok(())
    }

    /// Leave the coordination group, unlinking the node-lifetime objects.
    /// Absent names are tolerated so cooperative teardown can race.
    pub fn destroy(&self) -> Result<()> {
        let shared = match unsafe { (*self.shared.get()).take() } {
            Some(shared) => shared,
            None => return Ok(()),
        };

        self.final_pages.store(
            unsafe { ptr::read_volatile(shared.region.c_mem.add(shared.id)) },
            Ordering::Relaxed,
        );

        unsafe {
            if libc::munmap(shared.region.base as *mut libc::c_void, shared.region.len) == -1 {
                return Err(Error::last_os());
            }
        }

        match shm_unlink(format!("/sbma-shm-{}", shared.uniq).as_str()) {
            Ok(()) | Err(Errno::ENOENT) => {}
            Err(err) => return Err(err.into()),
        }

        for (name, sem) in [
            ("inter-mtx", shared.inter_mtx),
            ("done", shared.done),
            ("sig", shared.sig),
        ] {
            unsafe {
                if libc::sem_close(sem) == -1 {
                    return Err(Error::last_os());
                }
            }
            sem_unlink_named(&sem_name(name, shared.uniq))?;
        }

        Ok(())
    }

    /// This process's slot index.
    pub fn id(&self) -> Result<usize> {
        Ok(self.shared()?.id)
    }

    /// Charged pages of this process: the live slot while initialized, the
    /// snapshot taken by `destroy` afterwards.
    pub fn curpages(&self) -> usize {
        match self.shared() {
            Ok(shared) => unsafe { ptr::read_volatile(shared.region.c_mem.add(shared.id)) },
            Err(_) => self.final_pages.load(Ordering::Relaxed),
        }
    }

    /// High water mark of this process's charged pages.
    pub fn maxpages(&self) -> usize {
        self.max_pages.load(Ordering::Relaxed)
    }

    /// Free pages in the node budget.
    pub fn s_mem(&self) -> Result<usize> {
        let shared = self.shared()?;
        Ok(unsafe { ptr::read_volatile(shared.region.s_mem) })
    }

    /// Dirty pages recorded for this process.
    pub fn d_mem_self(&self) -> Result<usize> {
        let shared = self.shared()?;
        Ok(unsafe { ptr::read_volatile(shared.region.d_mem.add(shared.id)) })
    }

    /// Whether process `i` may be asked to evict: it holds charged pages or
    /// has signalling enabled. Meaningful only inside the inter-process
    /// section (or for `i == self` from this process's own signal handler).
    fn is_eligible(shared: &Shared, i: usize) -> bool {
        unsafe {
            ptr::read_volatile(shared.region.c_mem.add(i)) > 0
                || IpcFlags::from_bits_truncate(ptr::read_volatile(shared.region.flags.add(i)))
                    .contains(IpcFlags::SIGON)
        }
    }

    /// Eligibility of this process, for the SIGIPC handler's honor check.
    pub fn eligible_self(&self) -> bool {
        match self.shared() {
            Ok(shared) => Self::is_eligible(shared, shared.id),
            Err(_) => false,
        }
    }

    /// Charge `value` system pages to this process, evicting peers as
    /// needed. Runs the admission loop of the protocol: while the free
    /// scalar falls short, pick a victim, signal it, and wait for its
    /// `done` post. Callers retry nothing; every retry lives here.
    pub fn madmit(&self, value: usize, admitd: bool) -> Result<()> {
        if value == 0 {
            return Ok(());
        }
        let shared = self.shared()?;

        unsafe {
            sem_wait_intr(shared.inter_mtx)?;
        }

        let result = self.admit_locked(shared, value, admitd);

        unsafe {
            sem_post(shared.inter_mtx)?;
        }
        result
    }

    fn admit_locked(&self, shared: &Shared, value: usize, admitd: bool) -> Result<()> {
        let region = &shared.region;

        // Peer evictions can recover at most the free scalar plus every
        // other process's charges; the caller's own charges stay put. A
        // request beyond that bound can never be admitted.
        let mut available = unsafe { ptr::read_volatile(region.s_mem) };
        for i in 0..shared.n_procs {
            if i != shared.id {
                available += unsafe { ptr::read_volatile(region.c_mem.add(i)) };
            }
        }
        if value > available {
            return Err(Error::OutOfMemory);
        }

        loop {
            let s_mem = unsafe { ptr::read_volatile(region.s_mem) };
            if s_mem >= value {
                break;
            }

            let victim = {
                let c = unsafe { volatile_snapshot(region.c_mem, shared.n_procs) };
                let d = unsafe { volatile_snapshot(region.d_mem, shared.n_procs) };
                let eligible: heapless::Vec<bool, 64> = (0..shared.n_procs)
                    .map(|i| Self::is_eligible(shared, i))
                    .collect();
                select_victim(shared.id, value - s_mem, &c, &d, &eligible, admitd)
            };

            // No candidate: a peer may still become eligible (signalling is
            // enabled outside the section), so re-read and try again.
            let victim = match victim {
                Some(victim) => victim,
                None => continue,
            };

            unsafe {
                let pid = ptr::read_volatile(region.pid.add(victim));
                if libc::kill(pid, sigipc()) == -1 {
                    return Err(Error::last_os());
                }
                // The victim evicts in its handler and posts once.
                sem_wait_intr(shared.done)?;
            }
        }

        unsafe { self.charge_locked(shared, value) };
        Ok(())
    }

    /// `s_mem -= value; c_mem[self] += value`, with high-water tracking.
    /// Caller must be inside the inter-process section.
    unsafe fn charge_locked(&self, shared: &Shared, value: usize) {
        let region = &shared.region;
        let s_mem = ptr::read_volatile(region.s_mem);
        debug_assert!(s_mem >= value);
        ptr::write_volatile(region.s_mem, s_mem - value);

        let slot = region.c_mem.add(shared.id);
        let c_mem = ptr::read_volatile(slot) + value;
        ptr::write_volatile(slot, c_mem);

        if c_mem > self.max_pages.load(Ordering::Relaxed) {
            self.max_pages.store(c_mem, Ordering::Relaxed);
        }
    }

    /// Credit `c_pages` back to the free scalar and drop `d_pages` from the
    /// dirty count. Used directly by the SIGIPC handler, whose execution is
    /// covered by the signaller's critical section.
    pub fn discharge(&self, c_pages: usize, d_pages: usize) -> Result<()> {
        let shared = self.shared()?;
        let region = &shared.region;
        unsafe {
            let s_mem = ptr::read_volatile(region.s_mem);
            ptr::write_volatile(region.s_mem, s_mem + c_pages);

            let slot = region.c_mem.add(shared.id);
            let c_mem = ptr::read_volatile(slot);
            debug_assert!(c_mem >= c_pages);
            ptr::write_volatile(slot, c_mem - c_pages);

            let slot = region.d_mem.add(shared.id);
            let d_mem = ptr::read_volatile(slot);
            debug_assert!(d_mem >= d_pages);
            ptr::write_volatile(slot, d_mem - d_pages);
        }
        Ok(())
    }

    /// Account pages evicted outside the signal path.
    pub fn mevict(&self, c_pages: usize, d_pages: usize) -> Result<()> {
        if c_pages == 0 && d_pages == 0 {
            return Ok(());
        }
        let shared = self.shared()?;

        unsafe {
            sem_wait_intr(shared.inter_mtx)?;
        }
        let result = self.discharge(c_pages, d_pages);
        unsafe {
            sem_post(shared.inter_mtx)?;
        }
        result
    }

    /// Adjust this process's dirty-page count. Peers may observe stale
    /// values; `d_mem` only breaks victim-selection ties.
    pub fn mdirty(&self, delta: isize) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let shared = self.shared()?;

        self.intra.acquire()?;
        unsafe {
            let slot = shared.region.d_mem.add(shared.id);
            let d_mem = ptr::read_volatile(slot) as isize + delta;
            debug_assert!(d_mem >= 0);
            ptr::write_volatile(slot, d_mem as usize);
        }
        self.intra.release()
    }

    /// Accept eviction signals even with nothing charged. Main thread only.
    pub fn sigon(&self) -> Result<()> {
        let shared = self.shared()?;
        unsafe {
            let slot = shared.region.flags.add(shared.id);
            let flags = ptr::read_volatile(slot);
            ptr::write_volatile(slot, flags | IpcFlags::SIGON.bits());
            sem_post(shared.sig)?;
        }
        Ok(())
    }

    /// Stop accepting eviction signals while idle. Main thread only.
    pub fn sigoff(&self) -> Result<()> {
        let shared = self.shared()?;
        unsafe {
            let slot = shared.region.flags.add(shared.id);
            let flags = ptr::read_volatile(slot);
            ptr::write_volatile(slot, flags & !IpcFlags::SIGON.bits());
            if libc::sem_trywait(shared.sig) == -1 && Errno::last() != Errno::EAGAIN {
                return Err(Error::last_os());
            }
        }
        Ok(())
    }

    /// Post completion of an eviction to the waiting signaller.
    pub fn done_post(&self) -> Result<()> {
        let shared = self.shared()?;
        unsafe { sem_post(shared.done) }
    }
}

/// Snapshot `n` volatile slots into a fixed-capacity vector.
unsafe fn volatile_snapshot(ptr_: *const usize, n: usize) -> heapless::Vec<usize, 64> {
    (0..n).map(|i| ptr::read_volatile(ptr_.add(i))).collect()
}

/// Pick the peer to evict, per the admission policy:
///
/// * if no eligible peer holds at least `short` charged pages, take the one
///   holding the most;
/// * otherwise, among peers holding at least `short`, take the one with the
///   fewest charged pages (admit-resident) or the fewest dirty pages
///   (admit-dirty; clean pages cost nothing to evict).
fn select_victim(
    id: usize,
    short: usize,
    c_mem: &[usize],
    d_mem: &[usize],
    eligible: &[bool],
    admitd: bool,
) -> Option<usize> {
    let peers = (0..c_mem.len()).filter(|&i| i != id && eligible[i]);

    let mut best: Option<usize> = None;
    let mut any_big = false;
    for i in peers {
        let big = c_mem[i] >= short;
        let better = match best {
            None => true,
            Some(b) => {
                if big && !any_big {
                    true
                } else if !big && any_big {
                    false
                } else if big {
                    if admitd {
                        d_mem[i] < d_mem[b]
                    } else {
                        c_mem[i] < c_mem[b]
                    }
                } else {
                    c_mem[i] > c_mem[b]
                }
            }
        };
        if better {
            best = Some(i);
            any_big = any_big || big;
        }
    }
    best
}

fn sem_name(kind: &str, uniq: libc::c_int) -> String {
    format!("/sbma-{}-{}", kind, uniq)
}

fn sem_open_named(name: &str, initial: libc::c_uint) -> Result<*mut libc::sem_t> {
    let cname = CString::new(name).map_err(|_| Error::Invalid)?;
    let sem = unsafe {
        libc::sem_open(
            cname.as_ptr(),
            libc::O_RDWR | libc::O_CREAT,
            libc::S_IRUSR | libc::S_IWUSR,
            initial,
        )
    };
    if sem == libc::SEM_FAILED {
        return Err(Error::last_os());
    }
    Ok(sem)
}

fn sem_unlink_named(name: &str) -> Result<()> {
    let cname = CString::new(name).map_err(|_| Error::Invalid)?;
    if unsafe { libc::sem_unlink(cname.as_ptr()) } == -1 && Errno::last() != Errno::ENOENT {
        return Err(Error::last_os());
    }
    Ok(())
}

/// `sem_wait` with interrupted waits retried: SIGIPC lands on arbitrary
/// threads and must not surface as an admission failure.
unsafe fn sem_wait_intr(sem: *mut libc::sem_t) -> Result<()> {
    loop {
        if libc::sem_wait(sem) == 0 {
            return Ok(());
        }
        if Errno::last() != Errno::EINTR {
            return Err(Error::last_os());
        }
    }
}

unsafe fn sem_post(sem: *mut libc::sem_t) -> Result<()> {
    if libc::sem_post(sem) == -1 {
        return Err(Error::last_os());
    }
    Ok(())
}
