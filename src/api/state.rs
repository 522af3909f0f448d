//! Residency control over live allocations
//!
//! `mtouch` makes ranges resident ahead of access, charging them through
//! the admission protocol first; `mevict` pushes ranges out to the backing
//! store and credits the budget; `mclear` declares current contents
//! authoritative without moving anything. Each follows the same discipline:
//! probe the flag vector for the page delta, settle it with the IPC region,
//! then apply the page transition, all under the ATE lock so the probe and
//! the transition observe the same state.

use crate::error::{fatal, Error, Result};
use crate::mmu::{Ate, PageFlags};
use crate::opts::Opts;
use crate::vmm::swap::{swap_clear, swap_in, swap_out};
use crate::vmm::{Stats, Vmm, VMM};

use super::extra::state_check;

/// Most ranges one `mtouch_atomic` call can admit.
pub const ATOMIC_MAX: usize = 32;

/// A gathered range of one atomic touch.
struct AtomicRange {
    ate: *mut Ate,
    addr: usize,
    len: usize,
    /// A second, non-overlapping range of an ATE already in the table.
    dup: bool,
}

/// Page span covering every byte of `[addr, addr + len)`: floor begin,
/// ceiling end.
unsafe fn span_cover(vmm: &Vmm, ate: *mut Ate, addr: usize, len: usize) -> (usize, usize) {
    let page_size = vmm.page_size();
    let base = (*ate).base;
    let beg = (addr - base) / page_size;
    let end = 1 + (addr + len - base - 1) / page_size;
    (beg, end)
}

/// Page span of pages lying fully inside `[addr, addr + len)`: ceiling
/// begin, floor end. May be empty.
unsafe fn span_within(vmm: &Vmm, ate: *mut Ate, addr: usize, len: usize) -> (usize, usize) {
    let page_size = vmm.page_size();
    let base = (*ate).base;
    let beg = if addr == base {
        0
    } else {
        1 + (addr - base - 1) / page_size
    };
    let end = (addr + len - base) / page_size;
    (beg, end)
}

/// Reject ranges that leave the allocation.
unsafe fn validate_range(vmm: &Vmm, ate: *mut Ate, addr: usize, len: usize) -> Result<()> {
    let base = (*ate).base;
    let limit = base + (*ate).n_pages * vmm.page_size();
    if len == 0 || addr < base || addr.checked_add(len).map_or(true, |end| end > limit) {
        return Err(Error::Invalid);
    }
    Ok(())
}

/// System pages a touch of `[addr, addr + len)` would charge.
///
/// Caller holds the ATE lock. Under aggressive charging, the first touch of
/// an uncharged allocation charges all of it.
unsafe fn touch_probe(vmm: &Vmm, ate: *mut Ate, addr: usize, len: usize) -> usize {
    if vmm.opts().contains(Opts::AGGCH) && (*ate).c_pages == 0 {
        return vmm.to_sys((*ate).n_pages);
    }

    let (beg, end) = span_cover(vmm, ate, addr, len);
    let mut c_pages = 0;
    for ip in beg..end {
        let flag = (*ate).flag(ip);
        if flag.contains(PageFlags::CHRGD) {
            debug_assert!(flag.contains(PageFlags::RSDNT));
            c_pages += 1;
        }
    }
    vmm.to_sys(c_pages)
}

/// Apply a touch: clear charges if aggressive charging claimed the whole
/// allocation, then swap the covering span in. Returns system pages read.
///
/// Caller holds the ATE lock and has already admitted the probe result.
unsafe fn touch_int(vmm: &Vmm, ate: *mut Ate, addr: usize, len: usize) -> Result<usize> {
    if vmm.opts().contains(Opts::AGGCH) && (*ate).c_pages == 0 {
        for ip in 0..(*ate).n_pages {
            (*ate).clear_flag(ip, PageFlags::CHRGD);
        }
        (*ate).c_pages = (*ate).n_pages;
    }

    let (beg, end) = span_cover(vmm, ate, addr, len);
    let numrd = swap_in(vmm, ate, beg, end - beg, vmm.opts().contains(Opts::GHOST))?;
    let numrd = vmm.to_sys(numrd);
    Stats::add(&vmm.stats.pages_read, numrd);
    Ok(numrd)
}

/// Probe, admit, and touch one range of a locked ATE. Returns the charged
/// system pages. Shared by `mtouch` and the read-fault path.
pub(crate) unsafe fn touch_locked(
    vmm: &Vmm,
    ate: *mut Ate,
    addr: usize,
    len: usize,
) -> Result<usize> {
    let c_pages = touch_probe(vmm, ate, addr, len);
    if c_pages > 0 {
        vmm.ipc
            .madmit(c_pages, vmm.opts().contains(Opts::ADMITD))?;
    }

    if let Err(err) = touch_int(vmm, ate, addr, len) {
        // Give back whatever part of the charge is still unconsumed; a
        // failure here would leave the node accounting wrong for everyone.
        let unconsumed = touch_probe(vmm, ate, addr, len).min(c_pages);
        if vmm.ipc.mevict(unconsumed, 0).is_err() {
            fatal("mtouch rollback", err);
        }
        return Err(err);
    }

    Ok(c_pages)
}

/// Bring `[addr, addr + len)` fully resident, charging the admission
/// protocol for the pages that need it. Returns the charged system pages.
///
/// # Safety
///
/// `addr` must come from a live SBMA allocation and the caller must not
/// race other mutators of the same allocation.
pub unsafe fn mtouch(addr: *const u8, len: usize) -> Result<usize> {
    let vmm: &Vmm = &VMM;
    vmm.require_init()?;
    state_check(vmm);

    let ate = vmm
        .mmu
        .lookup(addr as usize)?
        .ok_or(Error::Invalid)?;
    if let Err(err) = validate_range(vmm, ate, addr as usize, len) {
        let _ = (*ate).lock.release();
        return Err(err);
    }

    let result = touch_locked(vmm, ate, addr as usize, len);
    (*ate).lock.release()?;

    state_check(vmm);
    result
}

/// Bring several ranges resident in one admission round, so that either
/// every range is charged and loaded or none is. Overlapping ranges of one
/// allocation are coalesced. Returns the charged system pages.
///
/// # Safety
///
/// As for [`mtouch`], for every range.
pub unsafe fn mtouch_atomic(ranges: &[(*const u8, usize)]) -> Result<usize> {
    let vmm: &Vmm = &VMM;
    vmm.require_init()?;
    if ranges.len() > ATOMIC_MAX {
        return Err(Error::Invalid);
    }
    state_check(vmm);

    let mut gathered: heapless::Vec<AtomicRange, ATOMIC_MAX> = heapless::Vec::new();

    // Releases every lock gathered so far.
    unsafe fn unwind(gathered: &heapless::Vec<AtomicRange, ATOMIC_MAX>) {
        for range in gathered.iter() {
            let _ = (*range.ate).lock.release();
        }
    }

    for &(addr, len) in ranges {
        let addr = addr as usize;
        let ate = match vmm.mmu.lookup(addr) {
            Ok(Some(ate)) => ate,
            // Ranges outside every allocation are skipped, not errors; the
            // interposition layer probes arbitrary buffers through here.
            Ok(None) => continue,
            Err(err) => {
                unwind(&gathered);
                return Err(err);
            }
        };
        if let Err(err) = validate_range(vmm, ate, addr, len) {
            let _ = (*ate).lock.release();
            unwind(&gathered);
            return Err(err);
        }

        let mut merged = false;
        let mut dup = false;
        for prior in gathered.iter_mut() {
            if prior.ate != ate {
                continue;
            }

            // Same ATE twice: coalesce when the page spans meet, else keep
            // both ranges and count the extra recursive lock acquisition.
            let (lo_addr, lo_len, hi_addr, hi_len) = if addr <= prior.addr {
                (addr, len, prior.addr, prior.len)
            } else {
                (prior.addr, prior.len, addr, len)
            };
            let (_, lo_end) = span_cover(vmm, ate, lo_addr, lo_len);
            let (hi_beg, _) = span_cover(vmm, ate, hi_addr, hi_len);

            if lo_end >= hi_beg {
                let end = (lo_addr + lo_len).max(hi_addr + hi_len);
                prior.addr = lo_addr;
                prior.len = end - lo_addr;
                // Drop the second recursive hold from this lookup.
                if let Err(err) = (*ate).lock.release() {
                    unwind(&gathered);
                    return Err(err);
                }
                merged = true;
            } else {
                dup = true;
            }
            break;
        }

        if !merged
            && gathered
                .push(AtomicRange {
                    ate,
                    addr,
                    len,
                    dup,
                })
                .is_err()
        {
            let _ = (*ate).lock.release();
            unwind(&gathered);
            return Err(Error::Invalid);
        }
    }

    // One admission covers the union of the probes. A duplicate sub-range
    // is skipped while aggressive charging would claim the whole
    // allocation: its first sub-range already counted every page.
    let aggch = vmm.opts().contains(Opts::AGGCH);
    let mut c_pages = 0;
    for range in gathered.iter() {
        if aggch && range.dup && (*range.ate).c_pages == 0 {
            continue;
        }
        c_pages += touch_probe(vmm, range.ate, range.addr, range.len);
    }

    if c_pages > 0 {
        if let Err(err) = vmm.ipc.madmit(c_pages, vmm.opts().contains(Opts::ADMITD)) {
            unwind(&gathered);
            return Err(err);
        }
    }

    for (idx, range) in gathered.iter().enumerate() {
        if let Err(err) = touch_int(vmm, range.ate, range.addr, range.len) {
            // Credit the part of the admission that never landed.
            let mut unconsumed = 0;
            for rest in gathered.iter().skip(idx) {
                unconsumed += touch_probe(vmm, rest.ate, rest.addr, rest.len);
            }
            if vmm.ipc.mevict(unconsumed.min(c_pages), 0).is_err() {
                fatal("mtouch_atomic rollback", err);
            }
            for rest in gathered.iter().skip(idx) {
                let _ = (*rest.ate).lock.release();
            }
            return Err(err);
        }
        if let Err(err) = (*range.ate).lock.release() {
            for rest in gathered.iter().skip(idx + 1) {
                let _ = (*rest.ate).lock.release();
            }
            return Err(err);
        }
    }

    state_check(vmm);
    Ok(c_pages)
}

/// Bring every allocation fully resident. Returns the charged system pages.
pub fn mtouchall() -> Result<usize> {
    let vmm: &Vmm = &VMM;
    vmm.require_init()?;
    state_check(vmm);

    vmm.mmu.acquire()?;

    // Lock the whole table first so the probe sum and the touches observe
    // one consistent snapshot.
    let mut ate = vmm.mmu.first();
    while !ate.is_null() {
        if let Err(err) = unsafe { (*ate).lock.acquire() } {
            unwind_table(vmm, ate);
            return Err(err);
        }
        ate = unsafe { vmm.mmu.next(ate) };
    }

    let result = unsafe { touchall_locked(vmm) };

    // Entry locks are released inside on success; on failure everything
    // still held is released here.
    match result {
        Ok(c_pages) => {
            vmm.mmu.release()?;
            state_check(vmm);
            Ok(c_pages)
        }
        Err(err) => {
            let mut ate = vmm.mmu.first();
            while !ate.is_null() {
                let _ = unsafe { (*ate).lock.release() };
                ate = unsafe { vmm.mmu.next(ate) };
            }
            let _ = vmm.mmu.release();
            Err(err)
        }
    }
}

unsafe fn touchall_locked(vmm: &Vmm) -> Result<usize> {
    let page_size = vmm.page_size();

    let mut c_pages = 0;
    let mut ate = vmm.mmu.first();
    while !ate.is_null() {
        c_pages += touch_probe(vmm, ate, (*ate).base, (*ate).n_pages * page_size);
        ate = vmm.mmu.next(ate);
    }

    if c_pages > 0 {
        vmm.ipc
            .madmit(c_pages, vmm.opts().contains(Opts::ADMITD))?;
    }

    let mut ate = vmm.mmu.first();
    while !ate.is_null() {
        if let Err(err) = touch_int(vmm, ate, (*ate).base, (*ate).n_pages * page_size) {
            // Credit the part of the admission that never landed.
            let mut unconsumed = 0;
            let mut rest = ate;
            while !rest.is_null() {
                unconsumed += touch_probe(vmm, rest, (*rest).base, (*rest).n_pages * page_size);
                rest = vmm.mmu.next(rest);
            }
            if vmm.ipc.mevict(unconsumed.min(c_pages), 0).is_err() {
                fatal("mtouchall rollback", err);
            }
            return Err(err);
        }
        debug_assert_eq!((*ate).l_pages, (*ate).n_pages);
        debug_assert_eq!((*ate).c_pages, (*ate).n_pages);
        (*ate).lock.release()?;
        ate = vmm.mmu.next(ate);
    }

    Ok(c_pages)
}

/// Release ATE locks from the head of the table up to (not including)
/// `stop`, after a failed whole-table locking pass.
fn unwind_table(vmm: &Vmm, stop: *mut Ate) {
    let mut ate = vmm.mmu.first();
    while !ate.is_null() && ate != stop {
        let _ = unsafe { (*ate).lock.release() };
        ate = unsafe { vmm.mmu.next(ate) };
    }
    let _ = vmm.mmu.release();
}

/// Drop dirty state from pages lying fully inside `[addr, addr + len)`:
/// their contents become authoritative and the backing copies obsolete.
///
/// # Safety
///
/// As for [`mtouch`].
pub unsafe fn mclear(addr: *const u8, len: usize) -> Result<()> {
    let vmm: &Vmm = &VMM;
    vmm.require_init()?;
    state_check(vmm);

    let ate = vmm
        .mmu
        .lookup(addr as usize)?
        .ok_or(Error::Invalid)?;
    if let Err(err) = validate_range(vmm, ate, addr as usize, len) {
        let _ = (*ate).lock.release();
        return Err(err);
    }

    let result = clear_locked(vmm, ate, addr as usize, len);
    (*ate).lock.release()?;

    state_check(vmm);
    result
}

unsafe fn clear_locked(vmm: &Vmm, ate: *mut Ate, addr: usize, len: usize) -> Result<()> {
    let (beg, end) = span_within(vmm, ate, addr, len);
    if beg >= end {
        return Ok(());
    }

    let mut d_pages = 0;
    for ip in beg..end {
        if (*ate).flag(ip).contains(PageFlags::DIRTY) {
            d_pages += 1;
        }
    }

    swap_clear(vmm, ate, beg, end - beg)?;
    vmm.ipc.mevict(0, vmm.to_sys(d_pages))
}

/// Drop dirty state from every allocation.
pub fn mclearall() -> Result<()> {
    let vmm: &Vmm = &VMM;
    vmm.require_init()?;
    state_check(vmm);

    vmm.mmu.acquire()?;

    let mut ate = vmm.mmu.first();
    while !ate.is_null() {
        unsafe {
            if let Err(err) = (*ate).lock.acquire() {
                let _ = vmm.mmu.release();
                return Err(err);
            }
            let result = clear_locked(vmm, ate, (*ate).base, (*ate).n_pages * vmm.page_size());
            let release = (*ate).lock.release();
            if let Err(err) = result.and(release) {
                let _ = vmm.mmu.release();
                return Err(err);
            }
            debug_assert_eq!((*ate).d_pages, 0);
            ate = vmm.mmu.next(ate);
        }
    }

    vmm.mmu.release()?;
    state_check(vmm);
    Ok(())
}

/// Evict the pages covering `[addr, addr + len)`, writing dirty runs to the
/// backing file. Returns the system pages credited back to the budget.
///
/// # Safety
///
/// As for [`mtouch`].
pub unsafe fn mevict(addr: *const u8, len: usize) -> Result<usize> {
    let vmm: &Vmm = &VMM;
    vmm.require_init()?;
    state_check(vmm);

    let ate = vmm
        .mmu
        .lookup(addr as usize)?
        .ok_or(Error::Invalid)?;
    if let Err(err) = validate_range(vmm, ate, addr as usize, len) {
        let _ = (*ate).lock.release();
        return Err(err);
    }

    let result = evict_locked(vmm, ate, addr as usize, len);
    (*ate).lock.release()?;

    state_check(vmm);
    result
}

unsafe fn evict_locked(vmm: &Vmm, ate: *mut Ate, addr: usize, len: usize) -> Result<usize> {
    let (beg, end) = span_cover(vmm, ate, addr, len);

    let mut c_pages = 0;
    let mut d_pages = 0;
    for ip in beg..end {
        let flag = (*ate).flag(ip);
        if !flag.contains(PageFlags::CHRGD) {
            c_pages += 1;
        }
        if flag.contains(PageFlags::DIRTY) {
            d_pages += 1;
        }
    }
    let c_pages = vmm.to_sys(c_pages);
    let d_pages = vmm.to_sys(d_pages);

    let numwr = swap_out(vmm, ate, beg, end - beg)?;
    Stats::add(&vmm.stats.pages_written, vmm.to_sys(numwr));

    vmm.ipc.mevict(c_pages, d_pages)?;
    Ok(c_pages)
}

/// Evict every allocation. Returns the system pages credited back.
pub fn mevictall() -> Result<usize> {
    let vmm: &Vmm = &VMM;
    vmm.require_init()?;
    state_check(vmm);

    let (c_pages, d_pages, numwr) = unsafe { evictall_locked(vmm)? };
    Stats::add(&vmm.stats.pages_written, numwr);
    vmm.ipc.mevict(c_pages, d_pages)?;

    state_check(vmm);
    Ok(c_pages)
}

/// Evict everything without touching the IPC region; the caller settles the
/// accounting. Returns `(charged, dirty, written)` in system pages. Shared
/// by `mevictall` and the admission-signal handler.
pub(crate) unsafe fn evictall_locked(vmm: &Vmm) -> Result<(usize, usize, usize)> {
    vmm.mmu.acquire()?;

    let mut c_pages = 0;
    let mut d_pages = 0;
    let mut numwr = 0;

    let mut ate = vmm.mmu.first();
    while !ate.is_null() {
        if let Err(err) = (*ate).lock.acquire() {
            let _ = vmm.mmu.release();
            return Err(err);
        }

        c_pages += (*ate).c_pages;
        d_pages += (*ate).d_pages;
        let result = swap_out(vmm, ate, 0, (*ate).n_pages);

        match result {
            Ok(wr) => {
                numwr += wr;
                debug_assert_eq!((*ate).l_pages, 0);
                debug_assert_eq!((*ate).c_pages, 0);
                debug_assert_eq!((*ate).d_pages, 0);
            }
            Err(err) => {
                let _ = (*ate).lock.release();
                let _ = vmm.mmu.release();
                return Err(err);
            }
        }

        if let Err(err) = (*ate).lock.release() {
            let _ = vmm.mmu.release();
            return Err(err);
        }
        ate = vmm.mmu.next(ate);
    }

    vmm.mmu.release()?;
    Ok((vmm.to_sys(c_pages), vmm.to_sys(d_pages), vmm.to_sys(numwr)))
}

/// Whether `addr` lies inside a live SBMA allocation.
pub fn mexist(addr: *const u8) -> Result<bool> {
    let vmm: &Vmm = &VMM;
    if !vmm.is_init() {
        return Ok(false);
    }

    match vmm.mmu.lookup(addr as usize)? {
        Some(ate) => {
            unsafe { (*ate).lock.release()? };
            Ok(true)
        }
        None => Ok(false),
    }
}
