//! Page movement between memory and the backing store
//!
//! The three state transitions of the page engine: `swap_in` makes a page
//! range resident, reading previously written pages back from the backing
//! file in maximal contiguous runs; `swap_out` evicts a range, flushing
//! dirty runs and releasing the physical frames; `swap_clear` declares the
//! current contents authoritative, dropping dirty state and the obligation
//! to reload from disk.
//!
//! Every function here requires the ATE lock and is reachable from the
//! SIGSEGV handler, so the OS is reached through raw `libc` only.

use crate::error::{Error, Result};
use crate::fileio::{read_exact_at, write_exact_at};
use crate::mmu::{Ate, PageFlags};
use crate::opts::Opts;

use super::Vmm;

/// Bring `num` pages starting at `beg` into a resident state, loading
/// `ZFILL` pages from the backing file. Returns the number of pages read
/// from disk.
///
/// With `ghost` set, file contents are staged in a scratch mapping and
/// remapped into place, so the target range never carries transient write
/// protection.
///
/// # Safety
///
/// `ate` must be a live, locked entry and `beg + num <= n_pages`.
pub unsafe fn swap_in(vmm: &Vmm, ate: *mut Ate, beg: usize, num: usize, ghost: bool) -> Result<usize> {
    debug_assert!(num <= (*ate).n_pages);
    debug_assert!(beg <= (*ate).n_pages - num);

    if num == 0 {
        return Ok(0);
    }
    if (*ate).l_pages == (*ate).n_pages {
        debug_assert_eq!((*ate).c_pages, (*ate).n_pages);
        return Ok(0);
    }

    let page_size = vmm.page_size();
    let end = beg + num;
    let target = (*ate).base + beg * page_size;

    // Staging area: a scratch mapping under ghost, the target itself
    // otherwise.
    let stage = if ghost {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        if vmm.opts().contains(Opts::MLOCK) {
            flags |= libc::MAP_LOCKED;
        }
        let addr = libc::mmap(
            core::ptr::null_mut(),
            num * page_size,
            libc::PROT_WRITE,
            flags,
            -1,
            0,
        );
        if addr == libc::MAP_FAILED {
            return Err(Error::last_os());
        }
        addr as usize
    } else {
        protect(target, num * page_size, libc::PROT_WRITE)?;
        target
    };

    let path = vmm.backing_path(ate)?;
    let fd = libc::open(path.as_ptr() as *const libc::c_char, libc::O_RDONLY);
    if fd == -1 {
        return Err(Error::last_os());
    }

    // Read runs of pages that must come from disk: not resident, zero fill
    // forbidden, not dirty. The scan runs one past the end so the final run
    // flushes.
    let mut numrd = 0;
    let mut ipfirst: Option<usize> = None;
    for ip in beg..=end {
        let from_disk = ip != end && {
            let flag = (*ate).flag(ip);
            flag.contains(PageFlags::RSDNT)
                && flag.contains(PageFlags::ZFILL)
                && !flag.contains(PageFlags::DIRTY)
        };

        if from_disk {
            ipfirst.get_or_insert(ip);
        } else if let Some(first) = ipfirst.take() {
            let run = ip - first;
            let run_stage = stage + (first - beg) * page_size;
            read_exact_at(fd, run_stage as *mut u8, run * page_size, first * page_size)?;

            if ghost {
                protect(run_stage, run * page_size, libc::PROT_READ)?;
                let fixed = libc::mremap(
                    run_stage as *mut libc::c_void,
                    run * page_size,
                    run * page_size,
                    libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED,
                    ((*ate).base + first * page_size) as *mut libc::c_void,
                );
                if fixed == libc::MAP_FAILED {
                    return Err(Error::last_os());
                }
            }

            numrd += run;
        }

        if ip != end {
            let flag = (*ate).flag(ip);
            if flag.contains(PageFlags::RSDNT) {
                debug_assert!((*ate).l_pages < (*ate).n_pages);
                (*ate).l_pages += 1;
                if flag.contains(PageFlags::CHRGD) {
                    debug_assert!((*ate).c_pages < (*ate).n_pages);
                    (*ate).c_pages += 1;
                }
                (*ate).clear_flag(ip, PageFlags::CHRGD | PageFlags::RSDNT);
            } else {
                debug_assert!(!flag.contains(PageFlags::CHRGD));
            }
        }
    }

    if libc::close(fd) == -1 {
        return Err(Error::last_os());
    }

    if ghost {
        // Pages that were read have been remapped away; the rest of the
        // scratch range is dropped here.
        if libc::munmap(stage as *mut libc::c_void, num * page_size) == -1 {
            return Err(Error::last_os());
        }
    }

    // Final protections: read-only for clean pages, read-write for pages
    // that were already dirty.
    protect(target, num * page_size, libc::PROT_READ)?;
    let mut ipfirst: Option<usize> = None;
    for ip in beg..=end {
        let dirty = ip != end && (*ate).flag(ip).contains(PageFlags::DIRTY);
        if dirty {
            ipfirst.get_or_insert(ip);
        } else if let Some(first) = ipfirst.take() {
            protect(
                (*ate).base + first * page_size,
                (ip - first) * page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            )?;
        }
    }

    Ok(numrd)
}

/// Evict `num` pages starting at `beg`: flush maximal dirty runs to the
/// backing file, drop residency and charges, and release the physical
/// frames. Returns the number of pages written.
///
/// # Safety
///
/// `ate` must be a live, locked entry and `beg + num <= n_pages`.
pub unsafe fn swap_out(vmm: &Vmm, ate: *mut Ate, beg: usize, num: usize) -> Result<usize> {
    debug_assert!(num <= (*ate).n_pages);
    debug_assert!(beg <= (*ate).n_pages - num);

    if num == 0 {
        return Ok(0);
    }
    if (*ate).l_pages == 0 && (*ate).c_pages == 0 {
        return Ok(0);
    }

    let page_size = vmm.page_size();
    let end = beg + num;

    let path = vmm.backing_path(ate)?;
    let fd = libc::open(path.as_ptr() as *const libc::c_char, libc::O_WRONLY);
    if fd == -1 {
        return Err(Error::last_os());
    }

    let mut numwr = 0;
    let mut ipfirst: Option<usize> = None;
    for ip in beg..=end {
        if ip != end {
            let flag = (*ate).flag(ip);
            if !flag.contains(PageFlags::DIRTY) {
                if !flag.contains(PageFlags::CHRGD) {
                    if !flag.contains(PageFlags::RSDNT) {
                        debug_assert!((*ate).l_pages > 0);
                        (*ate).l_pages -= 1;
                    }
                    debug_assert!((*ate).c_pages > 0);
                    (*ate).c_pages -= 1;
                }
                // Keep ZFILL; the on-disk copy, if any, stays valid.
                let keep = flag & PageFlags::ZFILL;
                (*ate).set_flag(ip, keep | PageFlags::CHRGD | PageFlags::RSDNT);
            }
        }

        let dirty = ip != end && (*ate).flag(ip).contains(PageFlags::DIRTY);
        if dirty {
            let flag = (*ate).flag(ip);
            debug_assert!(!flag.contains(PageFlags::RSDNT));
            debug_assert!(!flag.contains(PageFlags::CHRGD));

            ipfirst.get_or_insert(ip);

            debug_assert!((*ate).l_pages > 0);
            (*ate).l_pages -= 1;
            debug_assert!((*ate).c_pages > 0);
            (*ate).c_pages -= 1;

            (*ate).set_flag(
                ip,
                PageFlags::CHRGD | PageFlags::RSDNT | PageFlags::ZFILL,
            );
        } else if let Some(first) = ipfirst.take() {
            let run = ip - first;
            write_exact_at(
                fd,
                ((*ate).base + first * page_size) as *const u8,
                run * page_size,
                first * page_size,
            )?;
            numwr += run;

            debug_assert!((*ate).d_pages >= run);
            (*ate).d_pages -= run;
        }
    }

    if libc::close(fd) == -1 {
        return Err(Error::last_os());
    }

    let range = (*ate).base + beg * page_size;
    if vmm.opts().contains(Opts::MLOCK) && libc::munlock(range as *const libc::c_void, num * page_size) == -1 {
        return Err(Error::last_os());
    }
    protect(range, num * page_size, libc::PROT_NONE)?;
    if libc::madvise(range as *mut libc::c_void, num * page_size, libc::MADV_DONTNEED) == -1 {
        return Err(Error::last_os());
    }

    Ok(numwr)
}

/// Declare the current contents of `num` pages starting at `beg`
/// authoritative: drop dirty state, forget the on-disk copy, and downgrade
/// previously dirty pages to read-only so their next write faults again.
///
/// # Safety
///
/// `ate` must be a live, locked entry and `beg + num <= n_pages`.
pub unsafe fn swap_clear(vmm: &Vmm, ate: *mut Ate, beg: usize, num: usize) -> Result<()> {
    debug_assert!(num <= (*ate).n_pages);
    debug_assert!(beg <= (*ate).n_pages - num);

    if num == 0 {
        return Ok(());
    }

    let page_size = vmm.page_size();
    for ip in beg..beg + num {
        if (*ate).flag(ip).contains(PageFlags::DIRTY) {
            protect((*ate).base + ip * page_size, page_size, libc::PROT_READ)?;
            debug_assert!((*ate).d_pages > 0);
            (*ate).d_pages -= 1;
        }
        (*ate).clear_flag(ip, PageFlags::DIRTY | PageFlags::ZFILL);
    }

    Ok(())
}

/// `mprotect` through raw libc; callable from the fault handler.
pub(crate) unsafe fn protect(addr: usize, len: usize, prot: libc::c_int) -> Result<()> {
    if libc::mprotect(addr as *mut libc::c_void, len, prot) == -1 {
        return Err(Error::last_os());
    }
    Ok(())
}
