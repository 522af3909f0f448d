//! Tuning and introspection
//!
//! `mallopt` swaps the option word at runtime, `mallinfo` reports the
//! engine's counters through the conventional `mallinfo` field names, and
//! `check` verifies the accounting invariants when the `CHECK`/`EXTRA`
//! options are armed.

use core::sync::atomic::Ordering;

use crate::error::{fatal, Error, Result};
use crate::mmu::{flag_pages, header_pages, PageFlags};
use crate::opts::Opts;
use crate::vmm::{Vmm, VMM};

/// Parameters accepted by [`mallopt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalloptParam {
    /// Replace the virtual-memory-manager option word.
    VmmOpts,
}

/// Memory statistics, with the counters carried in the conventional
/// `mallinfo` fields they repurpose.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Mallinfo {
    /// Admission signals received.
    pub smblks: usize,
    /// Admission signals honored.
    pub ordblks: usize,
    /// System pages read from backing files.
    pub usmblks: usize,
    /// System pages written to backing files.
    pub fsmblks: usize,
    /// Read faults.
    pub uordblks: usize,
    /// Write faults.
    pub fordblks: usize,
    /// System pages currently charged (resident).
    pub hblks: usize,
    /// High water mark of charged system pages.
    pub hblkhd: usize,
    /// System pages currently allocated.
    pub keepcost: usize,
}

/// Replace a runtime parameter.
pub fn mallopt(param: MalloptParam, value: Opts) -> Result<()> {
    let vmm: &Vmm = &VMM;
    vmm.require_init()?;

    match param {
        MalloptParam::VmmOpts => {
            if value.contains(Opts::INVLD) {
                return Err(Error::Invalid);
            }
            vmm.set_opts(value);
            Ok(())
        }
    }
}

/// Snapshot the engine's statistics. Works before init and after destroy;
/// absent counters read as zero.
pub fn mallinfo() -> Mallinfo {
    let vmm: &Vmm = &VMM;
    let stats = &vmm.stats;

    Mallinfo {
        smblks: stats.sig_received.load(Ordering::Relaxed),
        ordblks: stats.sig_honored.load(Ordering::Relaxed),
        usmblks: stats.pages_read.load(Ordering::Relaxed),
        fsmblks: stats.pages_written.load(Ordering::Relaxed),
        uordblks: stats.read_faults.load(Ordering::Relaxed),
        fordblks: stats.write_faults.load(Ordering::Relaxed),
        hblks: vmm.ipc.curpages(),
        hblkhd: vmm.ipc.maxpages(),
        keepcost: stats.pages_alloc.load(Ordering::Relaxed),
    }
}

/// Accept admission signals while holding nothing resident. Main thread
/// only; never callable from a signal handler.
pub fn sigon() -> Result<()> {
    let vmm: &Vmm = &VMM;
    vmm.require_init()?;
    vmm.ipc.sigon()
}

/// Stop accepting admission signals while idle.
pub fn sigoff() -> Result<()> {
    let vmm: &Vmm = &VMM;
    vmm.require_init()?;
    vmm.ipc.sigoff()
}

/// Verify the accounting invariants of the running state.
///
/// Sums each entry's charged and dirty counts (plus metadata pages under
/// `METACH`) and compares against this process's slots in the shared
/// region; under `EXTRA` every flag vector is recounted against its entry's
/// cached counters first.
pub fn check() -> Result<()> {
    let vmm: &Vmm = &VMM;
    vmm.require_init()?;

    let opts = vmm.opts();
    let page_size = vmm.page_size();
    let s_pages = header_pages(page_size);

    vmm.mmu.acquire()?;

    let mut c_sum = 0usize;
    let mut d_sum = 0usize;
    let mut consistent = true;

    let mut ate = vmm.mmu.first();
    while !ate.is_null() {
        unsafe {
            if let Err(err) = (*ate).lock.acquire() {
                let _ = vmm.mmu.release();
                return Err(err);
            }

            if opts.contains(Opts::METACH) {
                c_sum += s_pages + flag_pages((*ate).n_pages, page_size);
            }
            c_sum += (*ate).c_pages;
            d_sum += (*ate).d_pages;

            if opts.contains(Opts::EXTRA) {
                let mut l = 0;
                let mut c = 0;
                let mut d = 0;
                for ip in 0..(*ate).n_pages {
                    let flag = (*ate).flag(ip);
                    if !flag.contains(PageFlags::RSDNT) {
                        l += 1;
                    }
                    if !flag.contains(PageFlags::CHRGD) {
                        c += 1;
                    }
                    if flag.contains(PageFlags::DIRTY) {
                        d += 1;
                    }
                }
                if l != (*ate).l_pages || c != (*ate).c_pages || d != (*ate).d_pages {
                    consistent = false;
                }
            }

            if let Err(err) = (*ate).lock.release() {
                let _ = vmm.mmu.release();
                return Err(err);
            }
            ate = vmm.mmu.next(ate);
        }
    }

    vmm.mmu.release()?;

    if vmm.to_sys(c_sum) != vmm.ipc.curpages() {
        consistent = false;
    }
    if vmm.to_sys(d_sum) != vmm.ipc.d_mem_self().unwrap_or(0) {
        consistent = false;
    }

    if consistent {
        Ok(())
    } else {
        Err(Error::Invalid)
    }
}

/// Entry/exit hook of the API surface: under `CHECK`, a failed invariant
/// check means the accounting is already wrong for the whole node, so the
/// process goes down rather than keep running on it.
pub(crate) fn state_check(vmm: &Vmm) {
    if vmm.is_init() && vmm.opts().contains(Opts::CHECK) {
        if let Err(err) = check() {
            fatal("state check", err);
        }
    }
}
