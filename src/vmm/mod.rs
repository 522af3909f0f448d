//! Process-wide virtual-memory engine
//!
//! One engine instance exists per process. It owns the runtime options, the
//! allocation table, the inter-process communicator, the statistics
//! counters, and the two signal handlers that drive the page-state machine:
//! SIGSEGV resolves access faults against the allocation table, and the
//! real-time admission signal asks this process to evict everything it has
//! resident.

pub mod swap;

use core::cell::UnsafeCell;
use core::fmt::Write as _;
use core::mem;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use lazy_static::lazy_static;
use log::info;
use nix::errno::Errno;
use nix::unistd::{sysconf, SysconfVar};

use crate::error::{fatal, Error, Result};
use crate::ipc::Ipc;
use crate::mmu::{AllocTable, Ate, PageFlags};
use crate::opts::Opts;

/// Default bytes per SBMA page.
pub const DEFAULT_PAGE_SIZE: usize = 1 << 14;

/// Default backing-file stem.
pub const DEFAULT_FSTEM: &str = "/tmp/";

const FSTEM_MAX: usize = 256;
const PATH_MAX: usize = 320;

/// Event counters backing `mallinfo`.
#[derive(Default)]
pub struct Stats {
    /// Admission signals received.
    pub sig_received: AtomicUsize,
    /// Admission signals honored with a full eviction.
    pub sig_honored: AtomicUsize,
    /// Read faults taken.
    pub read_faults: AtomicUsize,
    /// Write faults taken.
    pub write_faults: AtomicUsize,
    /// System pages read from backing files.
    pub pages_read: AtomicUsize,
    /// System pages written to backing files.
    pub pages_written: AtomicUsize,
    /// System pages currently allocated (mapped).
    pub pages_alloc: AtomicUsize,
}

impl Stats {
    fn reset(&self) {
        self.sig_received.store(0, Ordering::Relaxed);
        self.sig_honored.store(0, Ordering::Relaxed);
        self.read_faults.store(0, Ordering::Relaxed);
        self.write_faults.store(0, Ordering::Relaxed);
        self.pages_read.store(0, Ordering::Relaxed);
        self.pages_written.store(0, Ordering::Relaxed);
        self.pages_alloc.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicUsize, value: usize) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(counter: &AtomicUsize, value: usize) {
        counter.fetch_sub(value, Ordering::Relaxed);
    }
}

/// The process-wide engine.
pub struct Vmm {
    init: AtomicBool,
    opts: AtomicU32,
    page_size: AtomicUsize,
    sys_page_size: AtomicUsize,
    fstem: UnsafeCell<heapless::String<FSTEM_MAX>>,
    old_segv: UnsafeCell<libc::sigaction>,
    old_ipc: UnsafeCell<libc::sigaction>,
    pub stats: Stats,
    pub mmu: AllocTable,
    pub ipc: Ipc,
    /// Serializes init and destroy.
    init_lock: crate::lock::Lock,
}

unsafe impl Send for Vmm {}
unsafe impl Sync for Vmm {}

lazy_static! {
    /// The one engine instance of this process.
    pub static ref VMM: Vmm = Vmm::new();
}

impl Vmm {
    fn new() -> Vmm {
        let mmu = AllocTable::new().unwrap_or_else(|err| fatal("vmm construction", err));
        let ipc = Ipc::new().unwrap_or_else(|err| fatal("vmm construction", err));
        let init_lock =
            crate::lock::Lock::new().unwrap_or_else(|err| fatal("vmm construction", err));
        Vmm {
            init: AtomicBool::new(false),
            opts: AtomicU32::new(0),
            page_size: AtomicUsize::new(DEFAULT_PAGE_SIZE),
            sys_page_size: AtomicUsize::new(0),
            fstem: UnsafeCell::new(heapless::String::new()),
            old_segv: UnsafeCell::new(unsafe { mem::zeroed() }),
            old_ipc: UnsafeCell::new(unsafe { mem::zeroed() }),
            stats: Stats::default(),
            mmu,
            ipc,
            init_lock,
        }
    }

    #[inline]
    pub fn is_init(&self) -> bool {
        self.init.load(Ordering::Acquire)
    }

    /// Fail unless the engine is initialized.
    pub fn require_init(&self) -> Result<()> {
        if self.is_init() {
            Ok(())
        } else {
            Err(Error::Uninitialized)
        }
    }

    #[inline]
    pub fn opts(&self) -> Opts {
        Opts::from_bits_truncate(self.opts.load(Ordering::Relaxed))
    }

    /// Replace the option word. Caller holds responsibility for validity.
    pub fn set_opts(&self, opts: Opts) {
        self.opts.store(opts.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size.load(Ordering::Relaxed)
    }

    pub fn fstem(&self) -> &str {
        unsafe { (*self.fstem.get()).as_str() }
    }

    /// Convert SBMA pages to system pages.
    #[inline]
    pub fn to_sys(&self, pages: usize) -> usize {
        pages * self.page_size.load(Ordering::Relaxed) / self.sys_page_size.load(Ordering::Relaxed)
    }

    /// NUL-terminated path of `ate`'s backing file:
    /// `<fstem><pid>-<ate-address-hex>`. Built on the stack; callable from
    /// the fault handler.
    pub fn backing_path(&self, ate: *const Ate) -> Result<heapless::Vec<u8, PATH_MAX>> {
        let mut name: heapless::String<PATH_MAX> = heapless::String::new();
        write!(
            &mut name,
            "{}{}-{:x}",
            self.fstem(),
            unsafe { libc::getpid() },
            ate as usize
        )
        .map_err(|_| Error::Invalid)?;

        let mut path = heapless::Vec::from_slice(name.as_bytes()).map_err(|_| Error::Invalid)?;
        path.push(0).map_err(|_| Error::Invalid)?;
        Ok(path)
    }

    /// Heap-allocated form of [`Vmm::backing_path`], for the allocation
    /// lifecycle paths where `std` file APIs are in play.
    pub fn backing_name(&self, ate: *const Ate) -> String {
        format!("{}{}-{:x}", self.fstem(), unsafe { libc::getpid() }, ate as usize)
    }

    /// Initialize the engine: record the configuration, join the IPC group,
    /// and install the fault and admission handlers. Idempotent while
    /// initialized.
    pub fn init(
        &self,
        fstem: &str,
        uniq: libc::c_int,
        page_size: usize,
        n_procs: usize,
        max_mem: usize,
        opts: Opts,
    ) -> Result<()> {
        self.init_lock.acquire()?;
        let result = self.init_locked(fstem, uniq, page_size, n_procs, max_mem, opts);
        self.init_lock.release()?;
        result
    }

    fn init_locked(
        &self,
        fstem: &str,
        uniq: libc::c_int,
        page_size: usize,
        n_procs: usize,
        max_mem: usize,
        opts: Opts,
    ) -> Result<()> {
        if self.is_init() {
            return Ok(());
        }
        if !opts.is_valid() {
            return Err(Error::Invalid);
        }
        if opts.contains(Opts::OSVMM) {
            // The OS virtual-memory manager stays in charge; nothing to do.
            info!("sbma: disabled, leaving memory management to the OS");
            return Ok(());
        }

        let sys_page_size = match sysconf(SysconfVar::PAGE_SIZE) {
            Ok(Some(sz)) if sz > 0 => sz as usize,
            _ => return Err(Error::Io(Errno::EINVAL)),
        };
        // The SBMA page is the fault granule; protection changes require it
        // to be a whole number of kernel pages.
        if page_size == 0 || page_size % sys_page_size != 0 {
            return Err(Error::Invalid);
        }

        let mut stem: heapless::String<FSTEM_MAX> = heapless::String::new();
        stem.push_str(fstem).map_err(|_| Error::Invalid)?;
        unsafe { *self.fstem.get() = stem };

        self.opts.store(opts.bits(), Ordering::Relaxed);
        self.page_size.store(page_size, Ordering::Relaxed);
        self.sys_page_size.store(sys_page_size, Ordering::Relaxed);
        self.stats.reset();
        self.mmu.init(page_size);

        self.ipc.init(uniq, n_procs, max_mem)?;

        if let Err(err) = unsafe { self.install_handlers() } {
            if let Err(err) = self.ipc.destroy() {
                fatal("init unwind", err);
            }
            return Err(err);
        }

        self.init.store(true, Ordering::Release);

        info!(
            "sbma: initialized (uniq {}, slot {}, page size {}, {} procs, budget {} syspages)",
            uniq,
            self.ipc.id().unwrap_or(usize::MAX),
            page_size,
            n_procs,
            max_mem
        );
        Ok(())
    }

    /// Tear the engine down: restore the previous signal dispositions and
    /// leave the IPC group. Idempotent while uninitialized.
    pub fn destroy(&self) -> Result<()> {
        self.init_lock.acquire()?;
        let result = self.destroy_locked();
        self.init_lock.release()?;
        result
    }

    fn destroy_locked(&self) -> Result<()> {
        if !self.is_init() {
            return Ok(());
        }
        self.init.store(false, Ordering::Release);

        unsafe { self.restore_handlers()? };
        self.ipc.destroy()?;

        info!("sbma: destroyed");
        Ok(())
    }

    unsafe fn install_handlers(&self) -> Result<()> {
        let segv: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            handle_sigsegv;
        let ipc: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            handle_sigipc;

        for (signo, handler, old) in [
            (libc::SIGSEGV, segv as usize, self.old_segv.get()),
            (crate::ipc::sigipc(), ipc as usize, self.old_ipc.get()),
        ] {
            let mut act: libc::sigaction = mem::zeroed();
            act.sa_sigaction = handler;
            act.sa_flags = libc::SA_SIGINFO;
            if libc::sigemptyset(&mut act.sa_mask) == -1 {
                return Err(Error::last_os());
            }
            if libc::sigaction(signo, &act, old) == -1 {
                return Err(Error::last_os());
            }
        }
        Ok(())
    }

    unsafe fn restore_handlers(&self) -> Result<()> {
        if libc::sigaction(libc::SIGSEGV, self.old_segv.get(), core::ptr::null_mut()) == -1 {
            return Err(Error::last_os());
        }
        if libc::sigaction(crate::ipc::sigipc(), self.old_ipc.get(), core::ptr::null_mut()) == -1 {
            return Err(Error::last_os());
        }
        Ok(())
    }
}

/// Abort from a signal handler. Only `write(2)` and `abort(2)` here.
fn die(msg: &str) -> ! {
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            msg.as_ptr() as *const libc::c_void,
            msg.len(),
        );
        libc::abort();
    }
}

/// SIGSEGV handler: the access-fault half of the page-state machine.
///
/// A fault on a not-resident page is a read fault: admit and swap in either
/// the faulting page (lazy) or the whole allocation (eager). A fault on a
/// resident page is a write fault: mark it dirty and grant write access.
extern "C" fn handle_sigsegv(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    unsafe {
        let errno_slot = libc::__errno_location();
        let saved_errno = *errno_slot;

        let vmm: &Vmm = &VMM;
        let addr = (*info).si_addr() as usize;

        let ate = match vmm.mmu.lookup(addr) {
            Ok(Some(ate)) => ate,
            // A fault outside every live allocation is not ours to repair.
            _ => die("sbma: segmentation fault outside any allocation\n"),
        };

        let page_size = vmm.page_size();
        let ip = (addr - (*ate).base) / page_size;

        if (*ate).flag(ip).contains(PageFlags::RSDNT) {
            // Read fault.
            let (taddr, tlen) = if vmm.opts().contains(Opts::LZYRD) {
                ((*ate).base + ip * page_size, page_size)
            } else {
                ((*ate).base, (*ate).n_pages * page_size)
            };

            if crate::api::state::touch_locked(vmm, ate, taddr, tlen).is_err() {
                die("sbma: fault-time admission failed\n");
            }
            if (*ate).lock.release().is_err() {
                die("sbma: fault-time unlock failed\n");
            }

            Stats::add(&vmm.stats.read_faults, 1);
        } else {
            // Write fault on a resident page.
            if (*ate).flag(ip).contains(PageFlags::DIRTY) {
                die("sbma: write fault on a writable page\n");
            }

            (*ate).set_flag(ip, PageFlags::DIRTY | PageFlags::ZFILL);
            if swap::protect(
                (*ate).base + ip * page_size,
                page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
            .is_err()
            {
                die("sbma: fault-time mprotect failed\n");
            }
            (*ate).d_pages += 1;

            if (*ate).lock.release().is_err() {
                die("sbma: fault-time unlock failed\n");
            }

            let dirty_sys = vmm.to_sys(1);
            if vmm.ipc.mdirty(dirty_sys as isize).is_err() {
                die("sbma: dirty accounting failed\n");
            }

            Stats::add(&vmm.stats.write_faults, 1);
        }

        *errno_slot = saved_errno;
    }
}

/// SIGIPC handler: evict everything and post completion.
///
/// The signal's own disposition blocks it during delivery, and the sender
/// holds the inter-process mutex while waiting on `done`, so at most one
/// eviction request is in flight per process.
extern "C" fn handle_sigipc(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    unsafe {
        let errno_slot = libc::__errno_location();
        let saved_errno = *errno_slot;

        let vmm: &Vmm = &VMM;

        if vmm.ipc.eligible_self() {
            match crate::api::state::evictall_locked(vmm) {
                Ok((c_pages, d_pages, numwr)) => {
                    if vmm.ipc.discharge(c_pages, d_pages).is_err() {
                        die("sbma: eviction accounting failed\n");
                    }
                    Stats::add(&vmm.stats.pages_written, numwr);
                    Stats::add(&vmm.stats.sig_honored, 1);
                }
                Err(_) => die("sbma: signalled eviction failed\n"),
            }
        }

        if vmm.ipc.done_post().is_err() {
            die("sbma: completion post failed\n");
        }

        Stats::add(&vmm.stats.sig_received, 1);

        *errno_slot = saved_errno;
    }
}
